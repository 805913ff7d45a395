//! In-memory query executor.
//!
//! Documents are kept per collection as wire documents behind an async-aware
//! read-write lock. Every find scans its collection; there are no indexes
//! besides the unique constraints registered on the builder.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bson::{Bson, Document, doc, oid::ObjectId};
use futures::{StreamExt, stream};
use mea::rwlock::RwLock;
use tracing::{debug, trace};

use docmodel_core::{
    error::OdmResult,
    executor::{DocumentStream, ExecutorBuilder, FindSpec, QueryExecutor, WriteAck, WriteFailure, WriteOp},
    schema::SchemaRegistry,
};

use crate::{
    evaluator::{Comparable, FilterEvaluator, project, sort_documents},
    update::{apply_update, seed_from_filter},
};

type CollectionMap = HashMap<String, Vec<Document>>;

const DUPLICATE_KEY: i32 = 11000;
const BAD_VALUE: i32 = 2;

/// A find the executor has served.
#[derive(Debug, Clone, PartialEq)]
pub struct FindRecord {
    pub collection: String,
    pub filter: Document,
}

/// Thread-safe in-memory executor.
///
/// Clones share the same underlying data, so one instance can back any
/// number of contexts and tasks.
///
/// # Example
///
/// ```ignore
/// use docmodel_memory::InMemoryExecutor;
/// use docmodel::context::Context;
///
/// let executor = InMemoryExecutor::builder()
///     .unique_from_registry(&registry)
///     .build()
///     .await?;
/// let ctx = Context::new(executor, registry);
/// ```
#[derive(Default, Clone, Debug)]
pub struct InMemoryExecutor {
    collections: Arc<RwLock<CollectionMap>>,
    /// Unique constraints per collection, each a set of wire paths.
    unique: Arc<HashMap<String, Vec<Vec<String>>>>,
    find_log: Arc<RwLock<Vec<FindRecord>>>,
}

impl InMemoryExecutor {
    /// Creates an empty executor with no unique constraints besides `_id`.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> InMemoryExecutorBuilder {
        InMemoryExecutorBuilder::default()
    }

    /// Snapshot of the stored documents of a collection, in insertion order.
    pub async fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Every find served so far, oldest first. Counts are not recorded.
    pub async fn find_log(&self) -> Vec<FindRecord> {
        self.find_log.read().await.clone()
    }

    /// Number of finds served so far.
    pub async fn find_count(&self) -> usize {
        self.find_log.read().await.len()
    }

    /// Forgets the recorded finds.
    pub async fn clear_find_log(&self) {
        self.find_log.write().await.clear();
    }

    /// Returns the failure `candidate` would cause against `others`, if any.
    fn unique_violation<'d>(
        &self,
        collection: &str,
        candidate: &Document,
        mut others: impl Iterator<Item = &'d Document>,
    ) -> Option<WriteFailure> {
        let constraints = self.unique.get(collection).map(Vec::as_slice).unwrap_or_default();
        let id_constraint = vec!["_id".to_owned()];

        others.find_map(|other| {
            std::iter::once(&id_constraint)
                .chain(constraints.iter())
                .find(|fields| {
                    fields.iter().all(|field| {
                        match (lookup(candidate, field), lookup(other, field)) {
                            (Some(a), Some(b)) => Comparable::from(a) == Comparable::from(b),
                            _ => false,
                        }
                    })
                })
                .map(|fields| {
                    WriteFailure::new(
                        DUPLICATE_KEY,
                        format!("E11000 duplicate key error collection: {collection} index: {}", fields.join("_")),
                    )
                })
        })
    }

    fn insert(&self, collection: &str, documents: &mut Vec<Document>, mut document: Document) -> WriteAck {
        if !document.contains_key("_id") {
            document.insert("_id", ObjectId::new());
        }

        if let Some(failure) = self.unique_violation(collection, &document, documents.iter()) {
            return WriteAck {
                error: Some(failure),
                ..Default::default()
            };
        }

        let inserted_id = document.get("_id").cloned();
        documents.push(document);

        WriteAck {
            inserted_id,
            ..Default::default()
        }
    }

    fn update(
        &self,
        collection: &str,
        documents: &mut Vec<Document>,
        filter: &Document,
        update: &Document,
        upsert: bool,
        multi: bool,
    ) -> OdmResult<WriteAck> {
        let evaluator = FilterEvaluator::new(collection);
        let mut ack = WriteAck::default();

        for index in 0..documents.len() {
            if !evaluator.matches(&documents[index], filter)? {
                continue;
            }

            ack.matched_count += 1;

            let mut updated = documents[index].clone();
            match apply_update(&mut updated, update, collection) {
                Ok(true) => {
                    let others = documents
                        .iter()
                        .enumerate()
                        .filter(|(other, _)| *other != index)
                        .map(|(_, document)| document);

                    if let Some(failure) = self.unique_violation(collection, &updated, others) {
                        ack.error = Some(failure);
                        return Ok(ack);
                    }

                    documents[index] = updated;
                    ack.modified_count += 1;
                }
                Ok(false) => {}
                Err(message) => {
                    ack.error = Some(WriteFailure::new(BAD_VALUE, message));
                    return Ok(ack);
                }
            }

            if !multi {
                break;
            }
        }

        if ack.matched_count == 0 && upsert {
            let seeded = seed_from_filter(filter).and_then(|mut seed| {
                if let Some(Bson::Document(on_insert)) = update.get("$setOnInsert") {
                    for (key, value) in on_insert {
                        seed.insert(key.clone(), value.clone());
                    }
                }
                apply_update(&mut seed, update, collection).map(|_| seed)
            });

            match seeded {
                Ok(seed) => {
                    let inserted = self.insert(collection, documents, seed);
                    ack.upserted_id = inserted.inserted_id;
                    ack.error = inserted.error;
                }
                Err(message) => ack.error = Some(WriteFailure::new(BAD_VALUE, message)),
            }
        }

        Ok(ack)
    }

    fn delete(
        &self,
        collection: &str,
        documents: &mut Vec<Document>,
        filter: &Document,
        multi: bool,
    ) -> OdmResult<WriteAck> {
        let evaluator = FilterEvaluator::new(collection);
        let mut kept = Vec::with_capacity(documents.len());
        let mut deleted = 0;

        for document in documents.drain(..) {
            if (multi || deleted == 0) && evaluator.matches(&document, filter)? {
                deleted += 1;
            } else {
                kept.push(document);
            }
        }

        *documents = kept;

        Ok(WriteAck {
            deleted_count: deleted,
            ..Default::default()
        })
    }
}

/// The first value at a dotted path, without array fan-out.
fn lookup<'d>(document: &'d Document, path: &str) -> Option<&'d Bson> {
    match path.split_once('.') {
        None => document.get(path),
        Some((head, rest)) => match document.get(head)? {
            Bson::Document(child) => lookup(child, rest),
            _ => None,
        },
    }
}

#[async_trait]
impl QueryExecutor for InMemoryExecutor {
    async fn execute_find(&self, collection: &str, spec: FindSpec) -> OdmResult<DocumentStream> {
        self.find_log.write().await.push(FindRecord {
            collection: collection.to_owned(),
            filter: spec.filter.clone(),
        });

        let collections = self.collections.read().await;
        let evaluator = FilterEvaluator::new(collection);

        let mut matched = Vec::new();
        for document in collections.get(collection).into_iter().flatten() {
            if evaluator.matches(document, &spec.filter)? {
                matched.push(document.clone());
            }
        }
        drop(collections);

        if let Some(sort) = &spec.sort {
            sort_documents(&mut matched, sort);
        }

        let skip = usize::try_from(spec.skip.unwrap_or(0)).unwrap_or(usize::MAX);
        let limit = match spec.limit {
            None | Some(0) => usize::MAX,
            Some(limit) => usize::try_from(limit.unsigned_abs()).unwrap_or(usize::MAX),
        };

        let results: Vec<Document> = matched
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|document| match &spec.projection {
                Some(projection) => project(&document, projection),
                None => document,
            })
            .collect();

        debug!(collection, filter = %spec.filter, count = results.len(), "Served find");

        Ok(stream::iter(results.into_iter().map(Ok)).boxed())
    }

    async fn execute_write(&self, collection: &str, op: WriteOp) -> OdmResult<WriteAck> {
        let name = op.name();
        let mut collections = self.collections.write().await;
        let documents = collections.entry(collection.to_owned()).or_default();

        let ack = match op {
            WriteOp::InsertOne { document } => self.insert(collection, documents, document),
            WriteOp::UpdateOne { filter, update, upsert } => {
                self.update(collection, documents, &filter, &update, upsert, false)?
            }
            WriteOp::UpdateMany { filter, update } => {
                self.update(collection, documents, &filter, &update, false, true)?
            }
            WriteOp::DeleteOne { filter } => self.delete(collection, documents, &filter, false)?,
            WriteOp::DeleteMany { filter } => self.delete(collection, documents, &filter, true)?,
        };

        trace!(collection, op = name, ?ack, "Applied write");
        Ok(ack)
    }

    async fn execute_count(&self, collection: &str, filter: Document) -> OdmResult<u64> {
        let collections = self.collections.read().await;
        let evaluator = FilterEvaluator::new(collection);

        let mut count = 0;
        for document in collections.get(collection).into_iter().flatten() {
            if evaluator.matches(document, &filter)? {
                count += 1;
            }
        }

        Ok(count)
    }

    async fn shutdown(&self) -> OdmResult<()> {
        self.collections.write().await.clear();
        Ok(())
    }
}

/// Builder for [`InMemoryExecutor`] instances.
///
/// # Example
///
/// ```ignore
/// use docmodel_memory::InMemoryExecutor;
/// use docmodel::executor::ExecutorBuilder;
///
/// let executor = InMemoryExecutor::builder()
///     .unique_index("user", ["email"])
///     .build()
///     .await?;
/// ```
#[derive(Debug, Default)]
pub struct InMemoryExecutorBuilder {
    unique: HashMap<String, Vec<Vec<String>>>,
}

impl InMemoryExecutorBuilder {
    /// Declares a (compound) unique constraint on wire paths of a collection.
    /// Documents missing any of the paths are exempt.
    pub fn unique_index<I, S>(mut self, collection: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique
            .entry(collection.into())
            .or_default()
            .push(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Declares the unique constraints of every collection-backed schema in
    /// the registry.
    pub fn unique_from_registry(mut self, registry: &SchemaRegistry) -> Self {
        for name in registry.names() {
            let Ok(schema) = registry.get(name) else { continue };
            let Some(collection) = schema.collection() else { continue };

            for fields in schema.unique_constraints() {
                self = self.unique_index(collection, fields);
            }
        }
        self
    }
}

#[async_trait]
impl ExecutorBuilder for InMemoryExecutorBuilder {
    type Executor = InMemoryExecutor;

    async fn build(self) -> OdmResult<Self::Executor> {
        Ok(InMemoryExecutor {
            unique: Arc::new(self.unique),
            ..Default::default()
        })
    }
}
