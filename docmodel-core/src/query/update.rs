//! Atomic update specifications for query sets.

use bson::{Bson, Document};
use tracing::debug;

use crate::{
    error::{OdmError, OdmResult},
    field::{FieldKind, FieldSpec},
    schema::{Schema, SchemaRegistry},
    value::Value,
};

/// A single update operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateOperator {
    Set,
    Unset,
    Inc,
    Push,
    PushAll,
    Pull,
    AddToSet,
    PopFirst,
    PopLast,
}

impl UpdateOperator {
    /// Parses the operator prefix of an update expression (`inc`, `push_all`, ...).
    pub fn from_token(token: &str) -> Option<Self> {
        let operator = match token {
            "set" => UpdateOperator::Set,
            "unset" => UpdateOperator::Unset,
            "inc" => UpdateOperator::Inc,
            "push" => UpdateOperator::Push,
            "push_all" => UpdateOperator::PushAll,
            "pull" => UpdateOperator::Pull,
            "add_to_set" => UpdateOperator::AddToSet,
            "pop" => UpdateOperator::PopLast,
            _ => return None,
        };

        Some(operator)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateOperator::Set => "set",
            UpdateOperator::Unset => "unset",
            UpdateOperator::Inc => "inc",
            UpdateOperator::Push => "push",
            UpdateOperator::PushAll => "push_all",
            UpdateOperator::Pull => "pull",
            UpdateOperator::AddToSet => "add_to_set",
            UpdateOperator::PopFirst | UpdateOperator::PopLast => "pop",
        }
    }

    fn wire_operator(&self) -> &'static str {
        match self {
            UpdateOperator::Set => "$set",
            UpdateOperator::Unset => "$unset",
            UpdateOperator::Inc => "$inc",
            UpdateOperator::Push | UpdateOperator::PushAll => "$push",
            UpdateOperator::Pull => "$pull",
            UpdateOperator::AddToSet => "$addToSet",
            UpdateOperator::PopFirst | UpdateOperator::PopLast => "$pop",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct UpdateClause {
    operator: UpdateOperator,
    path: String,
    value: Value,
}

/// An ordered list of update clauses, compiled against a schema into a wire
/// update document.
///
/// ```ignore
/// let update = UpdateSpec::new()
///     .inc("views", 1)
///     .push("tags", "rust")
///     .set("title", "Hello");
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateSpec {
    clauses: Vec<UpdateClause>,
}

impl UpdateSpec {
    pub fn new() -> Self {
        Self::default()
    }

    fn clause(mut self, operator: UpdateOperator, path: &str, value: Value) -> Self {
        self.clauses.push(UpdateClause {
            operator,
            path: path.replace("__", "."),
            value,
        });
        self
    }

    pub fn set(self, path: &str, value: impl Into<Value>) -> Self {
        self.clause(UpdateOperator::Set, path, value.into())
    }

    pub fn unset(self, path: &str) -> Self {
        self.clause(UpdateOperator::Unset, path, Value::Null)
    }

    pub fn inc(self, path: &str, amount: impl Into<Value>) -> Self {
        self.clause(UpdateOperator::Inc, path, amount.into())
    }

    pub fn push(self, path: &str, item: impl Into<Value>) -> Self {
        self.clause(UpdateOperator::Push, path, item.into())
    }

    pub fn push_all<I, V>(self, path: &str, items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let items = items.into_iter().map(Into::into).collect();
        self.clause(UpdateOperator::PushAll, path, Value::List(items))
    }

    pub fn pull(self, path: &str, item: impl Into<Value>) -> Self {
        self.clause(UpdateOperator::Pull, path, item.into())
    }

    pub fn add_to_set(self, path: &str, item: impl Into<Value>) -> Self {
        self.clause(UpdateOperator::AddToSet, path, item.into())
    }

    /// Removes the first element of a list.
    pub fn pop_first(self, path: &str) -> Self {
        self.clause(UpdateOperator::PopFirst, path, Value::Null)
    }

    /// Removes the last element of a list.
    pub fn pop_last(self, path: &str) -> Self {
        self.clause(UpdateOperator::PopLast, path, Value::Null)
    }

    /// Appends a clause written as `operator__path`, e.g. `inc__stats__views`.
    /// For `pop`, a value of `-1` removes the first element and anything else
    /// the last.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::InvalidQuery`] if the expression has no path or an
    /// unknown operator.
    pub fn parse(self, expression: &str, value: impl Into<Value>) -> OdmResult<Self> {
        let (token, path) = expression
            .split_once("__")
            .ok_or_else(|| OdmError::invalid_query(expression, "update", "expected operator__path"))?;

        let mut operator = UpdateOperator::from_token(token)
            .ok_or_else(|| OdmError::invalid_query(path, token, "unknown update operator"))?;
        let value = value.into();

        if operator == UpdateOperator::PopLast && value.as_i64() == Some(-1) {
            operator = UpdateOperator::PopFirst;
        }

        Ok(self.clause(operator, path, value))
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Compiles the clauses into `{"$op": {wire_path: operand}}` groups.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::InvalidQuery`] for an empty specification, unknown
    /// paths, paths beyond a reference, operands that do not convert through
    /// the field, and list operators on non-list fields.
    pub fn compile(&self, registry: &SchemaRegistry, schema: &Schema) -> OdmResult<Document> {
        if self.clauses.is_empty() {
            return Err(OdmError::invalid_query("", "update", "no update clauses"));
        }

        let mut update = Document::new();

        for clause in &self.clauses {
            let operator = clause.operator;
            let invalid = |reason: String| OdmError::invalid_query(clause.path.as_str(), operator.as_str(), reason);

            let resolved = schema.resolve_path(registry, &clause.path).map_err(|err| match err {
                OdmError::InvalidQuery { reason, .. } => invalid(reason),
                other => invalid(other.to_string()),
            })?;

            if resolved.crosses_reference {
                return Err(invalid("cannot update across a reference".to_owned()));
            }

            let spec = resolved.spec;
            let operand = match operator {
                UpdateOperator::Set => spec.coerce(&clause.value, registry).map_err(|err| invalid(err.to_string()))?,
                UpdateOperator::Unset => Bson::String(String::new()),
                UpdateOperator::Inc => {
                    let numeric = match spec.kind() {
                        FieldKind::Scalar(scalar) => scalar.is_numeric(),
                        FieldKind::Dynamic => true,
                        _ => false,
                    };
                    if !numeric || clause.value.as_f64().is_none() {
                        return Err(invalid("inc takes a number on a numeric field".to_owned()));
                    }
                    spec.coerce(&clause.value, registry).map_err(|err| invalid(err.to_string()))?
                }
                UpdateOperator::Push | UpdateOperator::Pull | UpdateOperator::AddToSet => {
                    element_operand(spec, &clause.value, registry).map_err(invalid)?
                }
                UpdateOperator::PushAll => {
                    let items = clause
                        .value
                        .as_list()
                        .ok_or_else(|| invalid("push_all takes a list".to_owned()))?;
                    let each = items
                        .iter()
                        .map(|item| element_operand(spec, item, registry))
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(invalid)?;
                    Bson::Document(bson::doc! { "$each": each })
                }
                UpdateOperator::PopFirst => Bson::Int32(-1),
                UpdateOperator::PopLast => Bson::Int32(1),
            };

            if !matches!(update.get(operator.wire_operator()), Some(Bson::Document(_))) {
                update.insert(operator.wire_operator(), Document::new());
            }
            let group = update
                .get_document_mut(operator.wire_operator())
                .map_err(|err| invalid(err.to_string()))?;

            let operand = match group.remove(&resolved.wire_path) {
                None => operand,
                Some(existing) => merge_operands(operator, existing, operand)
                    .ok_or_else(|| invalid("operator repeated on the same path".to_owned()))?,
            };
            group.insert(resolved.wire_path, operand);
        }

        debug!(schema = schema.name(), update = %update, "Compiled update");
        Ok(update)
    }
}

/// Combines two operands of the same operator on one path. Pushes and set
/// additions concatenate into `$each`, pulls into `$in`. Other operators
/// cannot repeat.
fn merge_operands(operator: UpdateOperator, existing: Bson, operand: Bson) -> Option<Bson> {
    let key = match operator {
        UpdateOperator::Push | UpdateOperator::PushAll | UpdateOperator::AddToSet => "$each",
        UpdateOperator::Pull => "$in",
        _ => return None,
    };

    let mut items = operand_items(existing, key);
    items.extend(operand_items(operand, key));

    Some(Bson::Document(bson::doc! { key: items }))
}

fn operand_items(operand: Bson, key: &str) -> Vec<Bson> {
    match operand {
        Bson::Document(mut document) if document.len() == 1 && document.contains_key(key) => {
            match document.remove(key) {
                Some(Bson::Array(items)) => items,
                Some(other) => vec![other],
                None => Vec::new(),
            }
        }
        other => vec![other],
    }
}

/// Converts one list item through the element spec.
fn element_operand(spec: &FieldSpec, item: &Value, registry: &SchemaRegistry) -> Result<Bson, String> {
    match spec.kind() {
        FieldKind::List { element } => element.coerce(item, registry).map_err(|err| err.to_string()),
        FieldKind::Dynamic => Ok(item.to_untyped_bson()),
        other => Err(format!("list operator on {} field", other.describe())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use std::sync::Arc;

    fn registry() -> Arc<SchemaRegistry> {
        let post = Schema::builder("Post")
            .field(FieldSpec::string("title").wire_name("t"))
            .field(FieldSpec::int("views").min_value(0))
            .field(FieldSpec::list("tags", FieldSpec::string("tag")))
            .field(FieldSpec::list("scores", FieldSpec::int("score")))
            .build()
            .expect("post");

        SchemaRegistry::builder().register(post).build().expect("registry")
    }

    fn compile(update: UpdateSpec) -> OdmResult<Document> {
        let registry = registry();
        let schema = registry.get("Post").expect("schema");
        update.compile(&registry, schema)
    }

    #[test]
    fn test_clauses_group_by_operator() {
        let update = UpdateSpec::new()
            .set("title", "Hello")
            .inc("views", -5)
            .push("tags", "rust")
            .pop_first("scores");

        assert_eq!(
            compile(update).expect("compiles"),
            doc! {
                "$set": { "t": "Hello" },
                "$inc": { "views": -5 },
                "$push": { "tags": "rust" },
                "$pop": { "scores": -1 },
            }
        );
    }

    #[test]
    fn test_push_all_uses_each() {
        let update = UpdateSpec::new().push_all("scores", [1, 2]);
        assert_eq!(compile(update).expect("compiles"), doc! { "$push": { "scores": { "$each": [1, 2] } } });
    }

    #[test]
    fn test_repeated_list_clauses_merge() {
        let update = UpdateSpec::new()
            .push("tags", "a")
            .push_all("tags", ["b", "c"])
            .add_to_set("scores", 1)
            .add_to_set("scores", 2)
            .pull("tags", "x");

        assert_eq!(
            compile(update).expect("compiles"),
            doc! {
                "$push": { "tags": { "$each": ["a", "b", "c"] } },
                "$addToSet": { "scores": { "$each": [1, 2] } },
                "$pull": { "tags": "x" },
            }
        );

        let update = UpdateSpec::new().pull("tags", "x").pull("tags", "y");
        assert_eq!(
            compile(update).expect("compiles"),
            doc! { "$pull": { "tags": { "$in": ["x", "y"] } } }
        );
    }

    #[test]
    fn test_repeated_scalar_clauses_fail() {
        let err = compile(UpdateSpec::new().inc("views", 1).inc("views", -5)).expect_err("repeated inc");
        assert!(matches!(err, OdmError::InvalidQuery { .. }));
        assert!(compile(UpdateSpec::new().set("title", "a").set("title", "b")).is_err());
    }

    #[test]
    fn test_parse_expressions() {
        let update = UpdateSpec::new()
            .parse("inc__views", 2)
            .and_then(|update| update.parse("pop__tags", -1))
            .and_then(|update| update.parse("unset__title", Value::Null))
            .expect("parses");

        assert_eq!(
            compile(update).expect("compiles"),
            doc! { "$inc": { "views": 2 }, "$pop": { "tags": -1 }, "$unset": { "t": "" } }
        );

        assert!(UpdateSpec::new().parse("views", 1).is_err());
        assert!(UpdateSpec::new().parse("bump__views", 1).is_err());
    }

    #[test]
    fn test_invalid_updates() {
        assert!(compile(UpdateSpec::new()).is_err());
        assert!(compile(UpdateSpec::new().set("missing", 1)).is_err());
        assert!(compile(UpdateSpec::new().push("title", "x")).is_err());
        assert!(compile(UpdateSpec::new().inc("title", 1)).is_err());
        assert!(compile(UpdateSpec::new().push("scores", "x")).is_err());
    }

    #[test]
    fn test_set_skips_constraint_checks() {
        let update = UpdateSpec::new().set("views", -3);
        assert_eq!(compile(update).expect("compiles"), doc! { "$set": { "views": -3 } });
    }
}
