//! Batched reference resolution.
//!
//! Dereferencing proceeds level by level. The documents handed in form level
//! 0; the references they hold directly are resolved at level 1, references
//! held by those targets at level 2, and so on up to `max_depth`. Each level
//! runs in three phases:
//!
//! 1. **collect** every unresolved handle at the level, grouped by target
//!    schema, with identifiers deduplicated across documents and fields;
//! 2. **fetch** each target collection with a single `$in` query on the
//!    primary key, all collections concurrently. Schemas sharing a collection
//!    share the query;
//! 3. **bind** every handle to a copy of its fetched document, or mark it
//!    dangling when nothing was found.
//!
//! A level with nothing left to resolve is skipped while deeper levels are
//! still reachable through resolved documents, so a batch dereferenced once
//! can be taken deeper by a later call. Lazy references are never touched.
//! Nothing is cached beyond one call.

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    pin::pin,
};

use bson::{Bson, Document};
use futures::{
    FutureExt, TryStreamExt,
    future::{self, BoxFuture, Either, Shared, try_join_all},
};
use tracing::debug;

use crate::{
    context::Context,
    document::Model,
    error::{OdmError, OdmResult},
    query::Q,
    value::{Fields, ReferenceHandle, Value},
};

/// Why a dereference was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DereferenceOptions {
    pub max_depth: usize,
}

impl Default for DereferenceOptions {
    fn default() -> Self {
        Self { max_depth: 1 }
    }
}

/// What a dereference did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DereferenceReport {
    /// Levels that had unresolved references.
    pub levels: usize,
    /// Find queries issued.
    pub queries: usize,
    /// Handles bound to a fetched document.
    pub resolved: usize,
    /// Handles marked dangling.
    pub dangling: usize,
}

/// Identifiers to fetch, per target schema, keyed by [`id_key`].
type Pending = BTreeMap<String, BTreeMap<String, Bson>>;
/// Pending identifiers of the schemas stored in one collection.
type CollectionTargets = Vec<(String, BTreeMap<String, Bson>)>;
/// Fetched documents, per target schema, keyed by [`id_key`].
type Fetched = HashMap<String, HashMap<String, Model>>;

/// Resolves references over batches of loaded documents.
#[derive(Debug, Clone, Copy)]
pub struct DereferenceEngine<'a> {
    ctx: &'a Context,
    max_depth: usize,
}

impl<'a> DereferenceEngine<'a> {
    pub fn new(ctx: &'a Context, max_depth: usize) -> Self {
        Self { ctx, max_depth }
    }

    pub fn with_options(ctx: &'a Context, options: DereferenceOptions) -> Self {
        Self::new(ctx, options.max_depth)
    }

    /// Resolves references in `documents` down to the configured depth.
    pub async fn dereference(&self, documents: &mut [Model]) -> OdmResult<DereferenceReport> {
        self.dereference_until(documents, future::pending()).await
    }

    /// Like [`dereference`](Self::dereference), but every fetch races against
    /// `signal`. When the signal fires first, levels bound so far stay bound
    /// and the call fails with [`OdmError::Timeout`] or
    /// [`OdmError::Cancelled`].
    pub async fn dereference_until<S>(&self, documents: &mut [Model], signal: S) -> OdmResult<DereferenceReport>
    where
        S: Future<Output = Interrupt> + Send + 'static,
    {
        let signal: Shared<BoxFuture<'static, Interrupt>> = signal.boxed().shared();
        let mut report = DereferenceReport::default();

        for level in 1..=self.max_depth {
            let mut pending = Pending::new();
            for document in documents.iter() {
                collect_fields(document.state().current(), 0, level, &mut pending);
            }

            if pending.is_empty() {
                if documents
                    .iter()
                    .any(|document| reaches_level(document.state().current(), 0, level))
                {
                    debug!(level, "Level already resolved, descending");
                    continue;
                }

                debug!(level, "No unresolved references, stopping");
                break;
            }

            let ids: usize = pending.values().map(BTreeMap::len).sum();
            let schemas = pending.len();

            let mut by_collection: BTreeMap<String, CollectionTargets> = BTreeMap::new();
            for (schema, schema_ids) in pending {
                let collection = self.ctx.schema(&schema)?.collection_name()?.to_owned();
                by_collection.entry(collection).or_default().push((schema, schema_ids));
            }
            debug!(level, schemas, collections = by_collection.len(), ids, "Collected references");

            let fetches = by_collection
                .into_iter()
                .map(|(collection, targets)| self.fetch(collection, targets));
            let fetch_all = pin!(try_join_all(fetches));
            let fetched = match future::select(fetch_all, signal.clone()).await {
                Either::Left((result, _)) => result?,
                Either::Right((interrupt, _)) => {
                    debug!(level, ?interrupt, "Dereference interrupted");
                    let message = format!("dereference interrupted at level {level}");
                    return Err(match interrupt {
                        Interrupt::Timeout => OdmError::Timeout(message),
                        Interrupt::Cancelled => OdmError::Cancelled(message),
                    });
                }
            };

            report.levels += 1;
            report.queries += fetched.len();

            let fetched: Fetched = fetched.into_iter().flatten().collect();
            let (resolved, dangling) = (report.resolved, report.dangling);

            for document in documents.iter_mut() {
                bind_fields(
                    document.state_mut().current_mut_untracked(),
                    0,
                    level,
                    &fetched,
                    &mut report,
                );
            }

            debug!(
                level,
                resolved = report.resolved - resolved,
                dangling = report.dangling - dangling,
                "Bound references"
            );
        }

        Ok(report)
    }

    /// One query for every schema stored in `collection`; the results are
    /// loaded once per schema that asked for them.
    async fn fetch(
        &self,
        collection: String,
        targets: CollectionTargets,
    ) -> OdmResult<Vec<(String, HashMap<String, Model>)>> {
        let all_ids: BTreeMap<&String, &Bson> = targets.iter().flat_map(|(_, ids)| ids.iter()).collect();
        let ids: Vec<Value> = all_ids.into_values().cloned().map(Value::Dynamic).collect();

        let Some((first, _)) = targets.first() else {
            return Ok(Vec::new());
        };
        let spec = self
            .ctx
            .objects(first)?
            .filter(Q::new("pk__in", Value::List(ids)))
            .compile()?;

        let stored: Vec<Document> = self
            .ctx
            .executor()
            .execute_find(&collection, spec)
            .await?
            .try_collect()
            .await?;

        let mut fetched = Vec::with_capacity(targets.len());
        for (schema, ids) in targets {
            let pk_key = match self.ctx.schema(&schema)?.primary_key() {
                Some(pk) => pk.wire_key().to_owned(),
                None => continue,
            };
            let mut by_id = HashMap::new();

            for document in &stored {
                let Some(key) = document.get(&pk_key).map(id_key).filter(|key| ids.contains_key(key)) else {
                    continue;
                };
                by_id.insert(key, Model::from_wire(self.ctx.registry(), &schema, document.clone())?);
            }

            fetched.push((schema, by_id));
        }

        Ok(fetched)
    }
}

/// Identity of an identifier across integer widths.
fn id_key(id: &Bson) -> String {
    match id {
        Bson::Int32(i) => i.to_string(),
        Bson::Int64(i) => i.to_string(),
        other => other.to_string(),
    }
}

fn collect_fields(fields: &Fields, holder_depth: usize, level: usize, pending: &mut Pending) {
    for value in fields.values() {
        collect_value(value, holder_depth, level, pending);
    }
}

fn collect_value(value: &Value, holder_depth: usize, level: usize, pending: &mut Pending) {
    match value {
        Value::Reference(ReferenceHandle::Unresolved { schema, id }) if holder_depth + 1 == level => {
            pending
                .entry(schema.clone())
                .or_default()
                .entry(id_key(id))
                .or_insert_with(|| id.clone());
        }
        Value::Reference(ReferenceHandle::Resolved(model)) if holder_depth + 1 < level => {
            collect_fields(model.state().current(), holder_depth + 1, level, pending);
        }
        Value::List(items) => {
            for item in items {
                collect_value(item, holder_depth, level, pending);
            }
        }
        Value::Map(entries) | Value::Embedded(entries) => collect_fields(entries, holder_depth, level, pending),
        _ => {}
    }
}

/// Returns `true` if a resolved document sits exactly at `level`, so that
/// the level below it can still hold references.
fn reaches_level(fields: &Fields, holder_depth: usize, level: usize) -> bool {
    fields.values().any(|value| reaches_value(value, holder_depth, level))
}

fn reaches_value(value: &Value, holder_depth: usize, level: usize) -> bool {
    match value {
        Value::Reference(ReferenceHandle::Resolved(model)) => {
            holder_depth + 1 == level
                || (holder_depth + 1 < level && reaches_level(model.state().current(), holder_depth + 1, level))
        }
        Value::List(items) => items.iter().any(|item| reaches_value(item, holder_depth, level)),
        Value::Map(entries) | Value::Embedded(entries) => reaches_level(entries, holder_depth, level),
        _ => false,
    }
}

fn bind_fields(fields: &mut Fields, holder_depth: usize, level: usize, fetched: &Fetched, report: &mut DereferenceReport) {
    for value in fields.values_mut() {
        bind_value(value, holder_depth, level, fetched, report);
    }
}

fn bind_value(value: &mut Value, holder_depth: usize, level: usize, fetched: &Fetched, report: &mut DereferenceReport) {
    match value {
        Value::Reference(handle) => {
            let replacement = match handle {
                ReferenceHandle::Unresolved { schema, id } if holder_depth + 1 == level => {
                    match fetched.get(schema.as_str()).and_then(|models| models.get(&id_key(id))) {
                        Some(model) => {
                            report.resolved += 1;
                            Some(ReferenceHandle::Resolved(Box::new(model.clone())))
                        }
                        None => {
                            report.dangling += 1;
                            Some(ReferenceHandle::Dangling {
                                schema: schema.clone(),
                                id: id.clone(),
                            })
                        }
                    }
                }
                ReferenceHandle::Resolved(model) if holder_depth + 1 < level => {
                    bind_fields(
                        model.state_mut().current_mut_untracked(),
                        holder_depth + 1,
                        level,
                        fetched,
                        report,
                    );
                    None
                }
                _ => None,
            };

            if let Some(replacement) = replacement {
                *handle = replacement;
            }
        }
        Value::List(items) => {
            for item in items {
                bind_value(item, holder_depth, level, fetched, report);
            }
        }
        Value::Map(entries) | Value::Embedded(entries) => bind_fields(entries, holder_depth, level, fetched, report),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::oid::ObjectId;

    #[test]
    fn test_id_key_ignores_integer_width() {
        assert_eq!(id_key(&Bson::Int32(7)), id_key(&Bson::Int64(7)));

        let oid = ObjectId::new();
        assert_eq!(id_key(&Bson::ObjectId(oid)), id_key(&Bson::ObjectId(oid)));
    }

    #[test]
    fn test_collect_dedups_ids_and_respects_depth() {
        let oid = ObjectId::new();
        let mut fields = Fields::new();
        fields.insert(
            "author".into(),
            Value::Reference(ReferenceHandle::unresolved("User", oid)),
        );
        fields.insert(
            "editors".into(),
            Value::List(vec![
                Value::Reference(ReferenceHandle::unresolved("User", oid)),
                Value::Reference(ReferenceHandle::Lazy(crate::value::LazyReference::new("User", 5))),
            ]),
        );

        let mut pending = Pending::new();
        collect_fields(&fields, 0, 1, &mut pending);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending["User"].len(), 1);

        let mut deeper = Pending::new();
        collect_fields(&fields, 0, 2, &mut deeper);
        assert!(deeper.is_empty());
    }
}
