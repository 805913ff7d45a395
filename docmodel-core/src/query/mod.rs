//! Query construction and compilation.
//!
//! Queries are built as [`QueryNode`] trees, usually through the [`Q`] helper,
//! and compiled against a schema into wire filter documents:
//!
//! ```ignore
//! use docmodel::query::{FilterCompiler, Q};
//!
//! let q = Q::new("age__gte", 18) & Q::new("address__city__istartswith", "par");
//! let filter = FilterCompiler::new(&registry, &schema).compile(q.node())?;
//! ```
//!
//! # Operators
//!
//! - Comparison: `eq`, `ne`, `gt`, `gte`, `lt`, `lte`
//! - Membership: `in`, `nin`, `all`, `size`, `match`
//! - String: `contains`, `startswith`, `endswith`, `exact` and their
//!   case-insensitive `i` variants, plus `regex`
//! - Existence: `exists`
//! - Geo: `near`, `max_distance`
//! - Arithmetic: `mod`
//! - Text search: [`Q::text`]

mod compile;
mod node;
mod operator;
mod update;

use bson::Document;

pub use compile::{FilterCompiler, QueryVisitor};
pub use node::{Q, QueryNode};
pub use operator::Operator;
pub use update::{UpdateOperator, UpdateSpec};

use crate::{
    error::{OdmError, OdmResult},
    schema::{Schema, SchemaRegistry},
};

/// Sort direction for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Ascending order (A to Z, 0 to 9, earliest to latest).
    Asc,
    /// Descending order (Z to A, 9 to 0, latest to earliest).
    Desc,
}

impl SortDirection {
    fn as_wire(&self) -> i32 {
        match self {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        }
    }
}

/// Sort specification for one attribute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    /// The dotted attribute path to sort by.
    pub field: String,
    /// The sort direction.
    pub direction: SortDirection,
}

impl Sort {
    /// Parses `"name"`, `"+name"` or `"-name"`; `__` separates path segments.
    pub fn parse(key: &str) -> Self {
        let (direction, path) = match key.strip_prefix('-') {
            Some(path) => (SortDirection::Desc, path),
            None => (SortDirection::Asc, key.strip_prefix('+').unwrap_or(key)),
        };

        Sort {
            field: path.replace("__", "."),
            direction,
        }
    }
}

/// Compiles sort keys into a wire sort document.
pub(crate) fn compile_sort(sorts: &[Sort], registry: &SchemaRegistry, schema: &Schema) -> OdmResult<Document> {
    let mut document = Document::new();

    for sort in sorts {
        let resolved = schema.resolve_path(registry, &sort.field).map_err(|err| match err {
            OdmError::InvalidQuery { reason, .. } => OdmError::invalid_query(sort.field.as_str(), "order_by", reason),
            other => other,
        })?;
        document.insert(resolved.wire_path, sort.direction.as_wire());
    }

    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldSpec;
    use bson::doc;

    #[test]
    fn test_sort_keys() {
        assert_eq!(
            Sort::parse("-address__city"),
            Sort {
                field: "address.city".to_owned(),
                direction: SortDirection::Desc,
            }
        );
        assert_eq!(Sort::parse("+age").direction, SortDirection::Asc);

        let address = Schema::embedded("Address")
            .field(FieldSpec::string("city").wire_name("c"))
            .build()
            .expect("address");
        let user = Schema::builder("User")
            .field(FieldSpec::int("age"))
            .field(FieldSpec::embedded("address", "Address"))
            .build()
            .expect("user");
        let registry = SchemaRegistry::builder()
            .register(address)
            .register(user)
            .build()
            .expect("registry");
        let schema = registry.get("User").expect("user");

        let sort = compile_sort(&[Sort::parse("-address__city"), Sort::parse("age")], &registry, schema)
            .expect("compiles");
        assert_eq!(sort, doc! { "address.c": -1, "age": 1 });
        assert!(compile_sort(&[Sort::parse("nope")], &registry, schema).is_err());
    }
}
