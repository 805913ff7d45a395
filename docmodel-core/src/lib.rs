//! A typed object-document mapping layer for JSON/BSON document stores.
//!
//! This crate is the core of the docmodel project and provides:
//!
//! - **Field specifications** ([`field`]) - Attribute types, constraints and wire names
//! - **Schemas** ([`schema`]) - Ordered field lists, inheritance and the schema registry
//! - **Documents** ([`document`]) - Schema-bound instances with change tracking
//! - **Deltas** ([`delta`]) - Minimal `$set`/`$unset` updates for changed documents
//! - **Queries** ([`query`]) - Expression trees compiled into wire filters and updates
//! - **Query sets** ([`queryset`]) - Fluent querying bound to a context
//! - **Dereferencing** ([`dereference`]) - Batched, depth-bounded reference resolution
//! - **Executors** ([`executor`]) - The trait store drivers implement
//! - **Contexts** ([`context`]) - Executor, registry and alias threaded through I/O
//! - **Error handling** ([`error`]) - Error and result types
//!
//! # Example
//!
//! ```ignore
//! use docmodel::{field::FieldSpec, schema::{Schema, SchemaRegistry}};
//!
//! let user = Schema::builder("User")
//!     .field(FieldSpec::string("name").required().max_length(64))
//!     .field(FieldSpec::int("age").min_value(0))
//!     .build()?;
//! let registry = SchemaRegistry::builder().register(user).build()?;
//!
//! let mut alice = Model::new(&registry, "User")?;
//! alice.set("name", "Alice")?;
//! alice.set("age", 30)?;
//! alice.save(&ctx).await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmodel_core;

pub mod context;
mod convert;
pub mod delta;
pub mod dereference;
pub mod document;
pub mod error;
pub mod executor;
pub mod field;
pub mod persist;
pub mod query;
pub mod queryset;
pub mod schema;
pub mod state;
mod validate;
pub mod value;
