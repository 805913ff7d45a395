//! MongoDB query executor for docmodel.
//!
//! This crate provides a MongoDB-based implementation of the
//! [`QueryExecutor`](docmodel_core::executor::QueryExecutor) trait. Compiled
//! filters, projections, sorts and updates are already in MongoDB syntax, so
//! the executor hands them to the driver as they are.
//!
//! To use this executor, include the `mongodb` feature in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! docmodel = { version = "x.y.z", features = ["mongodb"] }
//! ```
//!
//! # Errors
//!
//! - Write errors reported by the server (duplicate keys included) are
//!   returned in the write acknowledgement
//! - Network, server selection and authentication failures map to
//!   [`OdmError::Connection`](docmodel_core::error::OdmError::Connection)
//! - Everything else maps to an operation error naming the collection
//!
//! # Example
//!
//! ```ignore
//! use docmodel::{context::Context, executor::ExecutorBuilder, mongodb::MongoExecutor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let executor = MongoExecutor::builder("mongodb://localhost:27017", "my_database")
//!         .build()
//!         .await?;
//!     let ctx = Context::new(executor, registry);
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmodel_mongodb;

pub mod executor;
mod query;

pub use executor::{MongoExecutor, MongoExecutorBuilder};
