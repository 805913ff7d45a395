//! Convenient re-exports of commonly used types from docmodel.
//!
//! ```ignore
//! use docmodel::prelude::*;
//! ```

pub use docmodel_core::{
    context::{Context, ContextBuilder, default_context, get_context, register_context, unregister_context},
    delta::Delta,
    dereference::{DereferenceEngine, DereferenceOptions, DereferenceReport, Interrupt},
    document::{Model, TypedField},
    error::{OdmError, OdmResult, ValidationError},
    executor::{ExecutorBuilder, FindSpec, QueryExecutor, WriteAck, WriteOp},
    field::{FieldKind, FieldSpec, ReferenceMode, ScalarType},
    persist::{SaveOptions, SaveOutcome},
    query::{Q, QueryNode, Sort, SortDirection, UpdateSpec},
    queryset::QuerySet,
    schema::{Schema, SchemaRegistry, Strictness},
    value::{LazyReference, ReferenceHandle, Value},
};
pub use docmodel_macros::Accessors;
