//! Execution contexts.
//!
//! A [`Context`] bundles the executor, the schema registry and an alias name.
//! Every operation that reaches the store takes a context explicitly:
//!
//! ```ignore
//! use docmodel::context::Context;
//!
//! let ctx = Context::builder()
//!     .executor(InMemoryExecutor::new())
//!     .registry(registry)
//!     .build()?;
//!
//! let mut user = ctx.create("User")?;
//! user.set("name", "Alice")?;
//! user.save(&ctx).await?;
//!
//! let adults = ctx.objects("User")?.filter(Q::new("age__gte", 18)).all().await?;
//! ```
//!
//! Contexts can also be registered under an alias in a process-wide table
//! with [`register_context`] and looked up again with [`get_context`].

use std::{
    collections::HashMap,
    sync::{Arc, LazyLock, PoisonError, RwLock},
};

use tracing::debug;

use crate::{
    dereference::{DereferenceEngine, DereferenceReport},
    document::Model,
    error::{OdmError, OdmResult},
    executor::QueryExecutor,
    queryset::QuerySet,
    schema::{Schema, SchemaRegistry},
};

/// Alias used when none is given.
pub const DEFAULT_ALIAS: &str = "default";

/// Executor, registry and alias used by store operations.
#[derive(Debug, Clone)]
pub struct Context {
    alias: String,
    executor: Arc<dyn QueryExecutor>,
    registry: Arc<SchemaRegistry>,
}

impl Context {
    pub fn new(executor: impl QueryExecutor + 'static, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            alias: DEFAULT_ALIAS.to_owned(),
            executor: Arc::new(executor),
            registry,
        }
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn executor(&self) -> &dyn QueryExecutor {
        &*self.executor
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn schema(&self, name: &str) -> OdmResult<&Arc<Schema>> {
        self.registry.get(name)
    }

    /// A new, unsaved document of `schema` with defaults applied.
    pub fn create(&self, schema: &str) -> OdmResult<Model> {
        Model::new(&self.registry, schema)
    }

    /// A query set over every document of `schema`.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::UnknownSchema`] if the schema is not registered and
    /// [`OdmError::SchemaDefinition`] for embedded schemas, which have no
    /// collection.
    pub fn objects(&self, schema: &str) -> OdmResult<QuerySet<'_>> {
        let schema = self.registry.get(schema)?;
        schema.collection_name()?;

        Ok(QuerySet::new(self, Arc::clone(schema)))
    }

    /// Resolves references held by `documents` down to `max_depth` levels.
    pub async fn dereference(&self, documents: &mut [Model], max_depth: usize) -> OdmResult<DereferenceReport> {
        DereferenceEngine::new(self, max_depth).dereference(documents).await
    }

    /// Shuts down the underlying executor.
    pub async fn shutdown(&self) -> OdmResult<()> {
        debug!(alias = %self.alias, "Shutting down context");
        self.executor.shutdown().await
    }
}

/// Builder for [`Context`].
#[derive(Debug, Default)]
pub struct ContextBuilder {
    alias: Option<String>,
    executor: Option<Arc<dyn QueryExecutor>>,
    registry: Option<Arc<SchemaRegistry>>,
}

impl ContextBuilder {
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn executor(mut self, executor: impl QueryExecutor + 'static) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    pub fn shared_executor(mut self, executor: Arc<dyn QueryExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn registry(mut self, registry: Arc<SchemaRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// # Errors
    ///
    /// Returns [`OdmError::Initialization`] if the executor or the registry
    /// is missing.
    pub fn build(self) -> OdmResult<Context> {
        let executor = self
            .executor
            .ok_or_else(|| OdmError::Initialization("context requires an executor".to_owned()))?;
        let registry = self
            .registry
            .ok_or_else(|| OdmError::Initialization("context requires a schema registry".to_owned()))?;

        Ok(Context {
            alias: self.alias.unwrap_or_else(|| DEFAULT_ALIAS.to_owned()),
            executor,
            registry,
        })
    }
}

static CONTEXTS: LazyLock<RwLock<HashMap<String, Context>>> = LazyLock::new(Default::default);

/// Registers `context` under its alias, replacing any previous registration.
pub fn register_context(context: Context) {
    debug!(alias = %context.alias, "Registering context");

    CONTEXTS
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(context.alias.clone(), context);
}

/// Looks up a registered context.
///
/// # Errors
///
/// Returns [`OdmError::Initialization`] if nothing is registered under `alias`.
pub fn get_context(alias: &str) -> OdmResult<Context> {
    CONTEXTS
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(alias)
        .cloned()
        .ok_or_else(|| OdmError::Initialization(format!("no context registered under alias '{alias}'")))
}

/// The context registered under [`DEFAULT_ALIAS`].
pub fn default_context() -> OdmResult<Context> {
    get_context(DEFAULT_ALIAS)
}

/// Removes a registered context and returns it.
pub fn unregister_context(alias: &str) -> Option<Context> {
    CONTEXTS
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(alias)
}
