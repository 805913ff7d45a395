//! Main docmodel crate providing a typed object-document mapping layer.
//!
//! This crate is the primary entry point for users of docmodel. It re-exports
//! the core types from the sub-crates and provides access to the available
//! executors.
//!
//! # Features
//!
//! - **Declarative schemas** - Typed fields with defaults, constraints and wire names
//! - **Change tracking** - Saves send the minimal `$set`/`$unset` update
//! - **Composable queries** - `Q` expressions compiled into wire filters
//! - **Batched dereferencing** - One query per target schema per depth level
//! - **Multiple executors** - In-memory and MongoDB executors behind one trait
//!
//! # Quick Start
//!
//! ```ignore
//! use docmodel::{prelude::*, memory::InMemoryExecutor};
//!
//! #[tokio::main]
//! async fn main() -> OdmResult<()> {
//!     let user = Schema::builder("User")
//!         .field(FieldSpec::object_id("id").primary_key().wire_name("_id"))
//!         .field(FieldSpec::string("name").required())
//!         .field(FieldSpec::int("age").min_value(0))
//!         .build()?;
//!     let registry = SchemaRegistry::builder().register(user).build()?;
//!
//!     let executor = InMemoryExecutor::builder().unique_from_registry(&registry).build().await?;
//!     let ctx = Context::new(executor, registry);
//!
//!     let mut alice = ctx.create("User")?;
//!     alice.set("name", "Alice")?;
//!     alice.set("age", 30)?;
//!     alice.save(&ctx).await?;
//!
//!     let adults = ctx
//!         .objects("User")?
//!         .filter(Q::new("age__gte", 18))
//!         .order_by(["-age"])
//!         .all()
//!         .await?;
//!
//!     println!("Found {} adults", adults.len());
//!     ctx.shutdown().await
//! }
//! ```
//!
//! # Typed Accessors
//!
//! ```ignore
//! #[derive(Accessors)]
//! struct User {
//!     name: String,
//!     age: Option<i64>,
//! }
//!
//! User::NAME.set(&mut alice, &"Alice".to_owned())?;
//! let age: Option<i64> = User::AGE.get(&alice)?;
//! ```
//!
//! # Executors
//!
//! - [`memory`] - In-memory executor for development and testing
//! - `mongodb` - MongoDB executor (requires the `mongodb` feature)

#[allow(unused_extern_crates)]
extern crate self as docmodel;

pub mod prelude;

pub use docmodel_core::{
    context, delta, dereference, document, error, executor, field, persist, query, queryset, schema, state, value,
};
pub use docmodel_macros::Accessors;

// Re-export BSON types for convenience
pub use bson;

/// In-memory executor implementations.
pub mod memory {
    pub use docmodel_memory::{FindRecord, InMemoryExecutor, InMemoryExecutorBuilder};
}

/// MongoDB executor implementations.
///
/// This module is only available when the `mongodb` feature is enabled.
#[cfg(feature = "mongodb")]
pub mod mongodb {
    pub use docmodel_mongodb::{MongoExecutor, MongoExecutorBuilder};
}
