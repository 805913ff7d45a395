use async_trait::async_trait;
use bson::Document;
use futures::{StreamExt, TryStreamExt};
use mongodb::{Client, Collection as MongoCollection, options::ClientOptions};
use tracing::{debug, trace};

use docmodel_core::{
    error::{OdmError, OdmResult},
    executor::{DocumentStream, ExecutorBuilder, FindSpec, QueryExecutor, WriteAck, WriteOp},
};

use crate::query::{find_options, map_error, write_failure};

/// Executes compiled operations against a MongoDB database.
///
/// The underlying client is a connection pool; clones share it.
#[derive(Debug, Clone)]
pub struct MongoExecutor {
    client: Client,
    database: String,
}

impl MongoExecutor {
    pub fn new(client: Client, database: impl Into<String>) -> Self {
        Self {
            client,
            database: database.into(),
        }
    }

    pub fn builder(dsn: &str, database: &str) -> MongoExecutorBuilder {
        MongoExecutorBuilder::new(dsn, database)
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    fn get_collection(&self, collection_name: &str) -> MongoCollection<Document> {
        self.client.database(&self.database).collection(collection_name)
    }

    /// Folds a driver result into an acknowledgement, keeping store-reported
    /// write failures in the ack.
    fn acknowledge<T>(
        collection: &str,
        result: Result<T, mongodb::error::Error>,
        ack: impl FnOnce(T) -> WriteAck,
    ) -> OdmResult<WriteAck> {
        match result {
            Ok(value) => Ok(ack(value)),
            Err(error) => match write_failure(&error) {
                Some(failure) => Ok(WriteAck {
                    error: Some(failure),
                    ..Default::default()
                }),
                None => Err(map_error(collection, error)),
            },
        }
    }
}

#[async_trait]
impl QueryExecutor for MongoExecutor {
    async fn execute_find(&self, collection: &str, spec: FindSpec) -> OdmResult<DocumentStream> {
        debug!(collection, filter = %spec.filter, "Executing find");

        let owned = collection.to_owned();
        let cursor = self
            .get_collection(collection)
            .find(spec.filter.clone())
            .with_options(find_options(&spec))
            .await
            .map_err(|e| map_error(collection, e))?;

        Ok(cursor.map_err(move |e| map_error(&owned, e)).boxed())
    }

    async fn execute_write(&self, collection: &str, op: WriteOp) -> OdmResult<WriteAck> {
        let target = self.get_collection(collection);
        let name = op.name();

        let ack = match op {
            WriteOp::InsertOne { document } => Self::acknowledge(collection, target.insert_one(document).await, |result| {
                WriteAck {
                    inserted_id: Some(result.inserted_id),
                    ..Default::default()
                }
            })?,
            WriteOp::UpdateOne { filter, update, upsert } => Self::acknowledge(
                collection,
                target.update_one(filter, update).upsert(upsert).await,
                |result| WriteAck {
                    matched_count: result.matched_count,
                    modified_count: result.modified_count,
                    upserted_id: result.upserted_id,
                    ..Default::default()
                },
            )?,
            WriteOp::UpdateMany { filter, update } => Self::acknowledge(
                collection,
                target.update_many(filter, update).await,
                |result| WriteAck {
                    matched_count: result.matched_count,
                    modified_count: result.modified_count,
                    ..Default::default()
                },
            )?,
            WriteOp::DeleteOne { filter } => Self::acknowledge(collection, target.delete_one(filter).await, |result| {
                WriteAck {
                    deleted_count: result.deleted_count,
                    ..Default::default()
                }
            })?,
            WriteOp::DeleteMany { filter } => Self::acknowledge(collection, target.delete_many(filter).await, |result| {
                WriteAck {
                    deleted_count: result.deleted_count,
                    ..Default::default()
                }
            })?,
        };

        trace!(collection, op = name, ?ack, "Applied write");
        Ok(ack)
    }

    async fn execute_count(&self, collection: &str, filter: Document) -> OdmResult<u64> {
        self.get_collection(collection)
            .count_documents(filter)
            .await
            .map_err(|e| map_error(collection, e))
    }

    async fn shutdown(&self) -> OdmResult<()> {
        self.client.clone().shutdown().await;

        Ok(())
    }
}

/// Builds a [`MongoExecutor`] from a connection string.
pub struct MongoExecutorBuilder {
    dsn: String,
    database: String,
}

impl MongoExecutorBuilder {
    pub fn new(dsn: &str, database: &str) -> Self {
        Self {
            dsn: dsn.to_string(),
            database: database.to_string(),
        }
    }
}

#[async_trait]
impl ExecutorBuilder for MongoExecutorBuilder {
    type Executor = MongoExecutor;

    async fn build(self) -> OdmResult<Self::Executor> {
        let options = ClientOptions::parse(&self.dsn)
            .await
            .map_err(|e| OdmError::Initialization(e.to_string()))?;

        Ok(MongoExecutor::new(
            Client::with_options(options).map_err(|e| OdmError::Initialization(e.to_string()))?,
            self.database,
        ))
    }
}
