//! In-memory query executor for docmodel.
//!
//! This crate provides a thread-safe, in-memory implementation of the
//! [`QueryExecutor`](docmodel_core::executor::QueryExecutor) trait. It
//! interprets the wire filters, projections, sorts and updates the mapping
//! layer compiles, which makes it suitable for tests, development and small
//! embedded deployments.
//!
//! # Features
//!
//! - **Thread-safe access** - Concurrent reads and writes using an async-aware RwLock
//! - **Wire-level semantics** - Filters, projections, sorts and update operators
//! - **Unique constraints** - Declared per collection or taken from a schema registry
//! - **Find log** - Every served find is recorded for inspection in tests
//!
//! # Quick Start
//!
//! ```ignore
//! use docmodel::{context::Context, executor::ExecutorBuilder};
//! use docmodel_memory::InMemoryExecutor;
//!
//! let executor = InMemoryExecutor::builder()
//!     .unique_from_registry(&registry)
//!     .build()
//!     .await?;
//! let ctx = Context::new(executor, registry);
//!
//! let adults = ctx.objects("User")?.filter(Q::new("age__gte", 18)).all().await?;
//! ```
//!
//! Geospatial operators are not supported and fail with an operation error.

#[allow(unused_extern_crates)]
extern crate self as docmodel_memory;

mod evaluator;
pub mod executor;
mod update;

pub use executor::{FindRecord, InMemoryExecutor, InMemoryExecutorBuilder};
