//! Fluent query sets.
//!
//! A [`QuerySet`] accumulates constraints, projections, ordering and paging
//! for one schema and runs them through the context's executor. Builder
//! methods consume and return the query set; terminal methods compile it,
//! execute it and load the results as [`Model`]s.
//!
//! ```ignore
//! let recent = ctx
//!     .objects("Post")?
//!     .filter(Q::new("published__gte", cutoff))
//!     .exclude(Q::new("tags", "draft"))
//!     .only(["title", "author"])
//!     .order_by(["-published"])
//!     .limit(20)
//!     .select_related(1)
//!     .all()
//!     .await?;
//! ```

use std::{collections::BTreeSet, sync::Arc};

use bson::{Bson, Document, doc};
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use tracing::debug;

use crate::{
    context::Context,
    document::Model,
    error::{OdmError, OdmResult},
    executor::{FindSpec, WriteAck, WriteOp},
    query::{FilterCompiler, Q, QueryNode, Sort, UpdateSpec, compile_sort},
    convert::join_path,
    field::FieldKind,
    schema::{Schema, SchemaRegistry},
};

/// A lazy stream of loaded documents.
pub type ModelStream = BoxStream<'static, OdmResult<Model>>;

/// A query over the documents of one schema.
#[derive(Debug, Clone)]
pub struct QuerySet<'c> {
    ctx: &'c Context,
    schema: Arc<Schema>,
    query: Option<QueryNode>,
    only: Vec<String>,
    excluded: Vec<String>,
    sort: Vec<Sort>,
    skip: Option<u64>,
    limit: Option<u64>,
    batch_size: Option<u32>,
    select_related: Option<usize>,
}

impl<'c> QuerySet<'c> {
    pub(crate) fn new(ctx: &'c Context, schema: Arc<Schema>) -> Self {
        Self {
            ctx,
            schema,
            query: None,
            only: Vec::new(),
            excluded: Vec::new(),
            sort: Vec::new(),
            skip: None,
            limit: None,
            batch_size: None,
            select_related: None,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn query(&self) -> Option<&QueryNode> {
        self.query.as_ref()
    }

    /// Adds a constraint. Repeated calls are combined with AND.
    pub fn filter(mut self, q: impl Into<QueryNode>) -> Self {
        let node = q.into();
        self.query = Some(match self.query.take() {
            Some(existing) => existing.and(node),
            None => node,
        });
        self
    }

    /// Adds a negated constraint.
    pub fn exclude(self, q: impl Into<QueryNode>) -> Self {
        let node = q.into().negate();
        self.filter(node)
    }

    /// Adds a full-text search constraint.
    pub fn search_text(self, text: impl Into<String>) -> Self {
        self.filter(Q::text(text))
    }

    /// Fetches only the given attributes (plus the primary key).
    pub fn only<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only
            .extend(fields.into_iter().map(|field| field.into().replace("__", ".")));
        self
    }

    /// Fetches everything except the given attributes.
    pub fn exclude_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded
            .extend(fields.into_iter().map(|field| field.into().replace("__", ".")));
        self
    }

    /// Orders by `"field"` (ascending) or `"-field"` (descending) keys.
    pub fn order_by<'k>(mut self, keys: impl IntoIterator<Item = &'k str>) -> Self {
        self.sort = keys.into_iter().map(Sort::parse).collect();
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Dereferences up to `max_depth` levels of references when results are
    /// collected with [`all`](Self::all), [`first`](Self::first) or
    /// [`get`](Self::get).
    pub fn select_related(mut self, max_depth: usize) -> Self {
        self.select_related = Some(max_depth);
        self
    }

    /// Compiles the constraints into a wire filter.
    pub fn compile_filter(&self) -> OdmResult<Document> {
        match &self.query {
            Some(node) => FilterCompiler::new(self.ctx.registry(), &self.schema).compile(node),
            None => Ok(Document::new()),
        }
    }

    /// Compiles the query set into a find.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::InvalidQuery`] if a constraint, projection or sort
    /// key does not resolve against the schema.
    pub fn compile(&self) -> OdmResult<FindSpec> {
        let registry = self.ctx.registry();

        let projection = if !self.only.is_empty() {
            let mut projection = Document::new();
            for path in self.only.iter().filter(|path| !self.excluded.contains(path)) {
                let resolved = self.schema.resolve_path(registry, path)?;
                projection.insert(resolved.wire_path, 1);
            }
            Some(projection)
        } else if !self.excluded.is_empty() {
            let mut projection = Document::new();
            for path in &self.excluded {
                let resolved = self.schema.resolve_path(registry, path)?;
                projection.insert(resolved.wire_path, 0);
            }
            Some(projection)
        } else {
            None
        };

        let sort = if self.sort.is_empty() {
            None
        } else {
            Some(compile_sort(&self.sort, registry, &self.schema)?)
        };

        Ok(FindSpec {
            filter: self.compile_filter()?,
            projection,
            sort,
            skip: self.skip,
            limit: self.limit.map(|limit| i64::try_from(limit).unwrap_or(i64::MAX)),
            batch_size: self.batch_size,
        })
    }

    /// Attribute paths a projected load fetches; `None` when the whole
    /// document is fetched. A dotted path marks its top-level attribute as
    /// partially loaded.
    fn loaded_fields(&self) -> Option<BTreeSet<String>> {
        let mut loaded: BTreeSet<String> = if !self.only.is_empty() {
            self.only
                .iter()
                .filter(|path| !self.excluded.contains(path))
                .cloned()
                .collect()
        } else if !self.excluded.is_empty() {
            let excluded: Vec<&str> = self.excluded.iter().map(String::as_str).collect();
            let mut loaded = BTreeSet::new();
            remaining_paths(&self.schema, self.ctx.registry(), &excluded, "", &mut loaded);
            loaded
        } else {
            return None;
        };

        if let Some(pk) = self.schema.primary_key() {
            loaded.insert(pk.name().to_owned());
        }

        Some(loaded)
    }

    /// Executes the query and streams the results. References are not
    /// dereferenced.
    pub async fn iter(self) -> OdmResult<ModelStream> {
        let spec = self.compile()?;
        let collection = self.schema.collection_name()?;
        let loaded = self.loaded_fields();

        debug!(
            collection,
            filter = %spec.filter,
            limit = ?spec.limit,
            skip = ?spec.skip,
            "Executing find"
        );

        let stream = self.ctx.executor().execute_find(collection, spec).await?;
        let registry = Arc::clone(self.ctx.registry());
        let schema = Arc::clone(&self.schema);

        Ok(stream
            .map(move |result| {
                result.and_then(|document| {
                    Model::load(Arc::clone(&registry), Arc::clone(&schema), document, loaded.clone())
                })
            })
            .boxed())
    }

    /// Collects every result, dereferencing if
    /// [`select_related`](Self::select_related) was requested.
    pub async fn all(self) -> OdmResult<Vec<Model>> {
        let ctx = self.ctx;
        let depth = self.select_related;
        let mut models: Vec<Model> = self.iter().await?.try_collect().await?;

        if let Some(depth) = depth.filter(|depth| *depth > 0) {
            ctx.dereference(&mut models, depth).await?;
        }

        Ok(models)
    }

    /// The first result, if any.
    pub async fn first(self) -> OdmResult<Option<Model>> {
        Ok(self.limit(1).all().await?.into_iter().next())
    }

    /// Exactly one result.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::DoesNotExist`] if nothing matches and
    /// [`OdmError::MultipleObjectsReturned`] if more than one document does.
    pub async fn get(self) -> OdmResult<Model> {
        let schema = self.schema.name().to_owned();
        let mut models = self.limit(2).all().await?;

        match models.len() {
            0 => Err(OdmError::DoesNotExist { schema }),
            1 => models.pop().ok_or(OdmError::DoesNotExist { schema }),
            _ => Err(OdmError::MultipleObjectsReturned { schema }),
        }
    }

    /// Counts the matching documents, ignoring paging.
    pub async fn count(&self) -> OdmResult<u64> {
        let filter = self.compile_filter()?;
        let collection = self.schema.collection_name()?;

        self.ctx.executor().execute_count(collection, filter).await
    }

    /// Applies `update` to every matching document and returns the number of
    /// documents matched.
    pub async fn update(&self, update: UpdateSpec) -> OdmResult<u64> {
        let op = WriteOp::UpdateMany {
            filter: self.compile_filter()?,
            update: update.compile(self.ctx.registry(), &self.schema)?,
        };

        Ok(self.write(op).await?.matched_count)
    }

    /// Applies `update` to the first matching document and returns the number
    /// of documents matched (0 or 1).
    pub async fn update_one(&self, update: UpdateSpec) -> OdmResult<u64> {
        let op = WriteOp::UpdateOne {
            filter: self.compile_filter()?,
            update: update.compile(self.ctx.registry(), &self.schema)?,
            upsert: false,
        };

        Ok(self.write(op).await?.matched_count)
    }

    /// Applies `update` to the first matching document, inserting one built
    /// from the equality constraints if none matches. Returns the id of an
    /// inserted document.
    pub async fn upsert_one(&self, update: UpdateSpec) -> OdmResult<Option<Bson>> {
        let op = WriteOp::UpdateOne {
            filter: self.compile_filter()?,
            update: update.compile(self.ctx.registry(), &self.schema)?,
            upsert: true,
        };

        Ok(self.write(op).await?.upserted_id)
    }

    /// Deletes every matching document and returns how many were deleted.
    pub async fn delete(&self) -> OdmResult<u64> {
        let op = WriteOp::DeleteMany {
            filter: self.compile_filter()?,
        };

        Ok(self.write(op).await?.deleted_count)
    }

    async fn write(&self, op: WriteOp) -> OdmResult<WriteAck> {
        let collection = self.schema.collection_name()?;
        debug!(collection, op = op.name(), "Executing write");

        self.ctx
            .executor()
            .execute_write(collection, op)
            .await?
            .into_result(collection)
    }
}

/// Paths of `schema` left over once `excluded` is projected away. Embedded
/// attributes with excluded members are listed member by member.
fn remaining_paths(
    schema: &Schema,
    registry: &SchemaRegistry,
    excluded: &[&str],
    prefix: &str,
    loaded: &mut BTreeSet<String>,
) {
    for spec in schema.fields() {
        let name = spec.name();
        if excluded.contains(&name) {
            continue;
        }

        let path = join_path(prefix, name);
        let nested: Vec<&str> = excluded
            .iter()
            .filter_map(|excluded| excluded.strip_prefix(name)?.strip_prefix('.'))
            .collect();

        if nested.is_empty() {
            loaded.insert(path);
        } else if let FieldKind::Embedded { schema: target } = spec.kind() {
            if let Ok(target) = registry.get(target) {
                remaining_paths(target, registry, &nested, &path, loaded);
            }
        }
    }
}

/// Filter matching one document by primary key.
pub(crate) fn pk_filter(schema: &Schema, id: Bson) -> OdmResult<Document> {
    let pk = schema.primary_key().ok_or_else(|| OdmError::SchemaDefinition {
        schema: schema.name().to_owned(),
        reason: "no primary key".to_owned(),
    })?;

    Ok(doc! { pk.wire_key(): id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        executor::{DocumentStream, QueryExecutor},
        field::FieldSpec,
    };
    use async_trait::async_trait;

    #[derive(Debug)]
    struct NoopExecutor;

    #[async_trait]
    impl QueryExecutor for NoopExecutor {
        async fn execute_find(&self, _collection: &str, _spec: FindSpec) -> OdmResult<DocumentStream> {
            Ok(futures::stream::empty().boxed())
        }

        async fn execute_write(&self, _collection: &str, _op: WriteOp) -> OdmResult<WriteAck> {
            Ok(WriteAck::default())
        }
    }

    fn context() -> Context {
        let address = Schema::embedded("Address")
            .field(FieldSpec::string("city").wire_name("c"))
            .field(FieldSpec::string("zip"))
            .build()
            .expect("address");
        let user = Schema::builder("User")
            .field(FieldSpec::string("name").wire_name("n"))
            .field(FieldSpec::int("age"))
            .field(FieldSpec::embedded("address", "Address"))
            .build()
            .expect("user");
        let registry = SchemaRegistry::builder()
            .register(address)
            .register(user)
            .build()
            .expect("registry");

        Context::new(NoopExecutor, registry)
    }

    #[test]
    fn test_compile_find() {
        let ctx = context();
        let spec = ctx
            .objects("User")
            .expect("user")
            .filter(Q::new("age__gte", 18))
            .filter(Q::new("age__lt", 65))
            .exclude(Q::new("name", "bob"))
            .only(["name", "address__city"])
            .order_by(["-age", "name"])
            .skip(5)
            .limit(10)
            .compile()
            .expect("compiles");

        assert_eq!(spec.filter, doc! { "age": { "$gte": 18, "$lt": 65 }, "n": { "$ne": "bob" } });
        assert_eq!(spec.projection, Some(doc! { "n": 1, "address.c": 1 }));
        assert_eq!(spec.sort, Some(doc! { "age": -1, "n": 1 }));
        assert_eq!(spec.skip, Some(5));
        assert_eq!(spec.limit, Some(10));
    }

    #[test]
    fn test_loaded_fields_include_primary_key() {
        let ctx = context();
        let only = ctx.objects("User").expect("user").only(["address__city"]);
        assert_eq!(
            only.loaded_fields(),
            Some(BTreeSet::from(["address.city".to_owned(), "id".to_owned()]))
        );

        let excluded = ctx.objects("User").expect("user").exclude_fields(["age"]);
        assert_eq!(
            excluded.loaded_fields(),
            Some(BTreeSet::from(["address".to_owned(), "id".to_owned(), "name".to_owned()]))
        );

        let nested = ctx.objects("User").expect("user").exclude_fields(["age", "address__city"]);
        assert_eq!(
            nested.loaded_fields(),
            Some(BTreeSet::from(["address.zip".to_owned(), "id".to_owned(), "name".to_owned()]))
        );
        assert_eq!(ctx.objects("User").expect("user").loaded_fields(), None);
    }

    #[test]
    fn test_invalid_keys_fail_before_execution() {
        let ctx = context();
        assert!(ctx.objects("User").expect("user").only(["nope"]).compile().is_err());
        assert!(ctx.objects("User").expect("user").order_by(["-nope"]).compile().is_err());
        assert!(ctx.objects("Address").is_err());
        assert!(ctx.objects("Nope").is_err());
    }
}
