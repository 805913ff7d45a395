//! Query executor abstraction.
//!
//! The mapping layer never talks to a database directly. Every read and write
//! goes through a [`QueryExecutor`], which receives fully compiled wire
//! documents (filters, projections, sorts and updates keyed by wire names) and
//! hands back wire documents.
//!
//! # Traits
//!
//! - [`QueryExecutor`]: The core trait for executors
//! - [`ExecutorBuilder`]: Factory trait for creating executor instances
//!
//! # Examples
//!
//! ```ignore
//! use docmodel::executor::{FindSpec, QueryExecutor};
//! use bson::doc;
//! use futures::TryStreamExt;
//!
//! let spec = FindSpec::new(doc! { "age": { "$gte": 18 } }).with_limit(10);
//! let documents: Vec<_> = executor.execute_find("user", spec).await?.try_collect().await?;
//! ```

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::{TryStreamExt, stream::BoxStream};

use crate::error::{OdmError, OdmResult};

/// A lazy stream of wire documents produced by a find.
pub type DocumentStream = BoxStream<'static, OdmResult<Document>>;

/// Wire-level description of a find.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindSpec {
    /// The filter document.
    pub filter: Document,
    /// Projection keyed by wire names (`1` include, `0` exclude); `None` fetches whole documents.
    pub projection: Option<Document>,
    /// Sort document keyed by wire names (`1` ascending, `-1` descending).
    pub sort: Option<Document>,
    pub skip: Option<u64>,
    pub limit: Option<i64>,
    pub batch_size: Option<u32>,
}

impl FindSpec {
    pub fn new(filter: Document) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A single write against one collection.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    InsertOne {
        document: Document,
    },
    UpdateOne {
        filter: Document,
        update: Document,
        upsert: bool,
    },
    UpdateMany {
        filter: Document,
        update: Document,
    },
    DeleteOne {
        filter: Document,
    },
    DeleteMany {
        filter: Document,
    },
}

impl WriteOp {
    pub fn name(&self) -> &'static str {
        match self {
            WriteOp::InsertOne { .. } => "insert_one",
            WriteOp::UpdateOne { .. } => "update_one",
            WriteOp::UpdateMany { .. } => "update_many",
            WriteOp::DeleteOne { .. } => "delete_one",
            WriteOp::DeleteMany { .. } => "delete_many",
        }
    }
}

/// A write error reported by the store itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFailure {
    pub code: i32,
    pub message: String,
}

impl WriteFailure {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Returns `true` for the store's duplicate-key codes.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self.code, 11000 | 11001 | 12582)
    }
}

/// Acknowledgement of a write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteAck {
    pub matched_count: u64,
    pub modified_count: u64,
    pub deleted_count: u64,
    pub inserted_id: Option<Bson>,
    pub upserted_id: Option<Bson>,
    /// Store-reported failure. Connection-level problems are returned as
    /// errors from [`QueryExecutor::execute_write`] instead.
    pub error: Option<WriteFailure>,
}

impl WriteAck {
    /// Maps a store-reported failure to an error.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::NotUnique`] for duplicate-key failures and
    /// [`OdmError::Operation`] for every other failure.
    pub fn into_result(self, collection: &str) -> OdmResult<WriteAck> {
        match &self.error {
            None => Ok(self),
            Some(failure) if failure.is_duplicate_key() => Err(OdmError::NotUnique {
                collection: collection.to_owned(),
                message: failure.message.clone(),
            }),
            Some(failure) => Err(OdmError::operation(
                collection,
                format!("{} (code {})", failure.message, failure.code),
            )),
        }
    }
}

/// Executes compiled wire operations against a store.
///
/// # Thread Safety
///
/// Implementations must be thread-safe; a single executor is shared by every
/// [`Context`](crate::context::Context) built on it.
///
/// # Error Handling
///
/// Connection problems surface as [`OdmError::Connection`], deadlines as
/// [`OdmError::Timeout`] and other driver failures as
/// [`OdmError::Operation`]. Write errors the store reports for a
/// particular write (such as duplicate keys) belong in [`WriteAck::error`].
#[async_trait]
pub trait QueryExecutor: Send + Sync + Debug {
    /// Runs a find and returns a lazy stream over the matching documents.
    ///
    /// # Arguments
    ///
    /// * `collection` - The collection to query
    /// * `spec` - Filter, projection, sort and paging, all keyed by wire names
    async fn execute_find(&self, collection: &str, spec: FindSpec) -> OdmResult<DocumentStream>;

    /// Applies a single write.
    ///
    /// # Arguments
    ///
    /// * `collection` - The collection to write to
    /// * `op` - The write operation
    async fn execute_write(&self, collection: &str, op: WriteOp) -> OdmResult<WriteAck>;

    /// Counts the documents matching `filter`. The default implementation
    /// drains a find.
    async fn execute_count(&self, collection: &str, filter: Document) -> OdmResult<u64> {
        let stream = self.execute_find(collection, FindSpec::new(filter)).await?;
        let count = stream.try_fold(0u64, |count, _| async move { Ok(count + 1) }).await?;

        Ok(count)
    }

    /// Releases resources held by the executor.
    async fn shutdown(&self) -> OdmResult<()> {
        Ok(())
    }
}

#[async_trait]
impl<B> QueryExecutor for &B
where
    B: QueryExecutor,
{
    async fn execute_find(&self, collection: &str, spec: FindSpec) -> OdmResult<DocumentStream> {
        (*self).execute_find(collection, spec).await
    }

    async fn execute_write(&self, collection: &str, op: WriteOp) -> OdmResult<WriteAck> {
        (*self).execute_write(collection, op).await
    }

    async fn execute_count(&self, collection: &str, filter: Document) -> OdmResult<u64> {
        (*self).execute_count(collection, filter).await
    }

    async fn shutdown(&self) -> OdmResult<()> {
        (*self).shutdown().await
    }
}

#[async_trait]
impl<B> QueryExecutor for Arc<B>
where
    B: QueryExecutor + ?Sized,
{
    async fn execute_find(&self, collection: &str, spec: FindSpec) -> OdmResult<DocumentStream> {
        (**self).execute_find(collection, spec).await
    }

    async fn execute_write(&self, collection: &str, op: WriteOp) -> OdmResult<WriteAck> {
        (**self).execute_write(collection, op).await
    }

    async fn execute_count(&self, collection: &str, filter: Document) -> OdmResult<u64> {
        (**self).execute_count(collection, filter).await
    }

    async fn shutdown(&self) -> OdmResult<()> {
        (**self).shutdown().await
    }
}

/// Factory trait for creating executors.
#[async_trait]
pub trait ExecutorBuilder {
    type Executor: QueryExecutor;

    async fn build(self) -> OdmResult<Self::Executor>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_maps_duplicate_keys_to_not_unique() {
        let ack = WriteAck {
            error: Some(WriteFailure::new(11000, "E11000 duplicate key")),
            ..Default::default()
        };
        assert!(matches!(ack.into_result("user"), Err(OdmError::NotUnique { .. })));

        let ack = WriteAck {
            error: Some(WriteFailure::new(121, "document failed validation")),
            ..Default::default()
        };
        assert!(matches!(ack.into_result("user"), Err(OdmError::Operation { .. })));

        let ack = WriteAck {
            matched_count: 1,
            ..Default::default()
        };
        assert_eq!(ack.clone().into_result("user").expect("no failure"), ack);
    }
}
