//! Compilation of query trees into wire filter documents.
//!
//! Every leaf is resolved against the schema, its operand is converted through
//! the terminal field spec, and the result is keyed by wire path. Sibling
//! leaves on the same path merge into one operator document as long as no
//! operator repeats; otherwise they fall back to `$and`.

use bson::{Bson, Document, doc};
use tracing::debug;

use crate::{
    error::{OdmError, OdmResult},
    field::{FieldKind, FieldSpec, ScalarType},
    query::{Operator, QueryNode},
    schema::{Schema, SchemaRegistry},
    value::Value,
};

/// Walks a query tree. Implemented by compilers that turn trees into other
/// representations.
pub trait QueryVisitor {
    type Output;
    type Error: Into<OdmError>;

    fn visit_and(&mut self, children: &[QueryNode]) -> Result<Self::Output, Self::Error>;
    fn visit_or(&mut self, children: &[QueryNode]) -> Result<Self::Output, Self::Error>;
    fn visit_not(&mut self, child: &QueryNode) -> Result<Self::Output, Self::Error>;
    fn visit_leaf(
        &mut self,
        field_path: &str,
        operator: Operator,
        value: &Value,
    ) -> Result<Self::Output, Self::Error>;

    fn visit_node(&mut self, node: &QueryNode) -> Result<Self::Output, Self::Error> {
        match node {
            QueryNode::And(children) => self.visit_and(children),
            QueryNode::Or(children) => self.visit_or(children),
            QueryNode::Not(child) => self.visit_not(child),
            QueryNode::Leaf {
                field_path,
                operator,
                value,
            } => self.visit_leaf(field_path, *operator, value),
        }
    }
}

/// The wire form of one leaf, before it is keyed by path.
#[derive(Debug, Clone, PartialEq)]
enum Condition {
    /// Plain equality: `{path: value}`.
    Value(Bson),
    /// Operator document: `{path: {$op: value, ...}}`.
    Operators(Document),
}

impl Condition {
    fn into_bson(self) -> Bson {
        match self {
            Condition::Value(value) => value,
            Condition::Operators(operators) => Bson::Document(operators),
        }
    }

    /// Merges two conditions on the same path if no operator key repeats.
    fn merge(&self, other: &Condition) -> Option<Condition> {
        let (left, right) = (self.as_operators(), other.as_operators());

        if left.keys().any(|key| right.contains_key(key)) {
            return None;
        }

        let mut merged = left;
        for (key, value) in right {
            merged.insert(key, value);
        }
        Some(Condition::Operators(merged))
    }

    fn as_operators(&self) -> Document {
        match self {
            Condition::Value(value) => doc! { "$eq": value.clone() },
            Condition::Operators(operators) => operators.clone(),
        }
    }
}

/// Compiles query trees of one schema into wire filters.
#[derive(Debug, Clone, Copy)]
pub struct FilterCompiler<'a> {
    registry: &'a SchemaRegistry,
    schema: &'a Schema,
}

impl<'a> FilterCompiler<'a> {
    pub fn new(registry: &'a SchemaRegistry, schema: &'a Schema) -> Self {
        Self { registry, schema }
    }

    /// Normalizes `node` and compiles it.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::InvalidQuery`] for unknown paths, paths beyond a
    /// reference, operands that do not convert through the field, invalid
    /// regular expressions, and operators that do not apply to the field.
    pub fn compile(&mut self, node: &QueryNode) -> OdmResult<Document> {
        let normalized = node.clone().normalize();
        let filter = self.visit_node(&normalized)?;

        debug!(schema = self.schema.name(), filter = %filter, "Compiled query filter");
        Ok(filter)
    }

    fn leaf(&self, field_path: &str, operator: Operator, value: &Value) -> OdmResult<(String, Condition)> {
        let invalid = |reason: String| OdmError::invalid_query(field_path, operator.as_str(), reason);

        if operator == Operator::Text {
            let search = value
                .as_str()
                .ok_or_else(|| invalid("text search takes a string".to_owned()))?;
            return Ok(("$text".to_owned(), Condition::Value(Bson::Document(doc! { "$search": search }))));
        }

        let resolved = self
            .schema
            .resolve_path(self.registry, field_path)
            .map_err(|err| match err {
                OdmError::InvalidQuery { reason, .. } => invalid(reason),
                other => invalid(other.to_string()),
            })?;
        let spec = resolved.spec;
        let op = |name: &str, value: Bson| Condition::Operators(doc! { name: value });

        let condition = match operator {
            Operator::Eq => Condition::Value(self.operand(spec, value, operator, field_path)?),
            Operator::Ne => op("$ne", self.operand(spec, value, operator, field_path)?),
            Operator::Gt => op("$gt", self.operand(spec, value, operator, field_path)?),
            Operator::Gte => op("$gte", self.operand(spec, value, operator, field_path)?),
            Operator::Lt => op("$lt", self.operand(spec, value, operator, field_path)?),
            Operator::Lte => op("$lte", self.operand(spec, value, operator, field_path)?),
            Operator::In | Operator::Nin | Operator::All => {
                let items = value
                    .as_list()
                    .ok_or_else(|| invalid(format!("expected a list, got {}", value.kind_name())))?;
                let operands = items
                    .iter()
                    .map(|item| self.operand(spec, item, operator, field_path))
                    .collect::<OdmResult<Vec<_>>>()?;
                let name = match operator {
                    Operator::In => "$in",
                    Operator::Nin => "$nin",
                    _ => "$all",
                };
                op(name, Bson::Array(operands))
            }
            Operator::Exists => {
                let exists = value
                    .as_bool()
                    .ok_or_else(|| invalid("exists takes a boolean".to_owned()))?;
                op("$exists", Bson::Boolean(exists))
            }
            Operator::Regex => {
                let pattern = value
                    .as_str()
                    .ok_or_else(|| invalid("regex takes a string pattern".to_owned()))?;
                // Store regex dialects differ; the pattern is checked where it runs.
                op("$regex", Bson::String(pattern.to_owned()))
            }
            Operator::Size => {
                let size = value
                    .as_i64()
                    .filter(|size| *size >= 0)
                    .ok_or_else(|| invalid("size takes a non-negative integer".to_owned()))?;
                if !matches!(spec.kind(), FieldKind::List { .. } | FieldKind::Dynamic) {
                    return Err(invalid("size only applies to list fields".to_owned()));
                }
                op("$size", Bson::Int64(size))
            }
            Operator::Mod => match value.as_list() {
                Some([Value::Int(divisor), Value::Int(remainder)]) if *divisor != 0 => {
                    op("$mod", Bson::Array(vec![Bson::Int64(*divisor), Bson::Int64(*remainder)]))
                }
                _ => return Err(invalid("mod takes [divisor, remainder] with a non-zero divisor".to_owned())),
            },
            Operator::ElemMatch => op("$elemMatch", Bson::Document(self.elem_match(spec, value, field_path)?)),
            Operator::Near => {
                let geometry = match spec.kind() {
                    FieldKind::Scalar(ScalarType::Point) => spec
                        .coerce(value, self.registry)
                        .map_err(|err| invalid(err.to_string()))?,
                    _ => value.to_untyped_bson(),
                };
                match geometry {
                    Bson::Document(geometry) => op("$near", Bson::Document(doc! { "$geometry": geometry })),
                    legacy => op("$near", legacy),
                }
            }
            Operator::MaxDistance => {
                let distance = value
                    .as_f64()
                    .ok_or_else(|| invalid("max_distance takes a number".to_owned()))?;
                op("$maxDistance", Bson::Double(distance))
            }
            string_op => {
                let text = value
                    .as_str()
                    .ok_or_else(|| invalid(format!("{string_op} takes a string")))?;
                if !is_textual(spec) {
                    return Err(invalid(format!("{string_op} only applies to string fields")));
                }
                let (pattern, case_insensitive) = string_pattern(string_op, text);
                let mut operators = doc! { "$regex": pattern };
                if case_insensitive {
                    operators.insert("$options", "i");
                }
                Condition::Operators(operators)
            }
        };

        Ok((resolved.wire_path, condition))
    }

    /// Converts one operand through the field. Comparing a list field with a
    /// scalar operand converts through the element spec.
    fn operand(&self, spec: &FieldSpec, value: &Value, operator: Operator, field_path: &str) -> OdmResult<Bson> {
        let target: &FieldSpec = match (spec.kind(), value) {
            (FieldKind::List { element }, operand) if !matches!(operand, Value::List(_)) => element,
            _ => spec,
        };

        target
            .coerce(value, self.registry)
            .map_err(|err| OdmError::invalid_query(field_path, operator.as_str(), err.to_string()))
    }

    fn elem_match(&self, spec: &FieldSpec, value: &Value, field_path: &str) -> OdmResult<Document> {
        let invalid = |reason: String| OdmError::invalid_query(field_path, "match", reason);

        if let Value::Dynamic(Bson::Document(raw)) = value {
            return Ok(raw.clone());
        }

        let criteria = match value {
            Value::Embedded(fields) | Value::Map(fields) => fields,
            other => return Err(invalid(format!("expected embedded criteria, got {}", other.kind_name()))),
        };

        let element_schema = match spec.element().map(FieldSpec::kind) {
            Some(FieldKind::Embedded { schema }) => self.registry.get(schema)?,
            _ => return Err(invalid("match only applies to lists of embedded objects".to_owned())),
        };

        let mut nested = FilterCompiler::new(self.registry, element_schema);
        let children = criteria
            .iter()
            .map(|(expression, operand)| crate::query::Q::new(expression, operand.clone()).into_node())
            .collect();

        nested.visit_node(&QueryNode::And(children).normalize())
    }

    fn merge_conjunction(&mut self, children: &[QueryNode]) -> OdmResult<Document> {
        let mut merged: Vec<(String, Condition)> = Vec::new();
        let mut clauses: Vec<Document> = Vec::new();

        for child in children {
            let QueryNode::Leaf {
                field_path,
                operator,
                value,
            } = child
            else {
                clauses.push(self.visit_node(child)?);
                continue;
            };

            let (key, condition) = self.leaf(field_path, *operator, value)?;

            match merged.iter_mut().find(|(existing, _)| *existing == key) {
                Some((_, existing)) => match existing.merge(&condition) {
                    Some(combined) => *existing = combined,
                    None => clauses.push(doc! { key: condition.into_bson() }),
                },
                None => merged.push((key, condition)),
            }
        }

        let mut filter: Document = merged
            .into_iter()
            .map(|(key, condition)| (key, condition.into_bson()))
            .collect();
        let mut conjuncts = Vec::new();

        for clause in clauses {
            if clause.keys().all(|key| !filter.contains_key(key)) {
                for (key, value) in clause {
                    filter.insert(key, value);
                }
            } else {
                conjuncts.push(Bson::Document(clause));
            }
        }

        if !conjuncts.is_empty() {
            match filter.get_mut("$and") {
                Some(Bson::Array(existing)) => existing.extend(conjuncts),
                _ => {
                    filter.insert("$and", conjuncts);
                }
            }
        }

        Ok(filter)
    }
}

impl QueryVisitor for FilterCompiler<'_> {
    type Output = Document;
    type Error = OdmError;

    fn visit_and(&mut self, children: &[QueryNode]) -> OdmResult<Document> {
        self.merge_conjunction(children)
    }

    fn visit_or(&mut self, children: &[QueryNode]) -> OdmResult<Document> {
        if children.is_empty() {
            return Err(OdmError::invalid_query("", "or", "empty disjunction"));
        }

        let clauses = children
            .iter()
            .map(|child| self.visit_node(child).map(Bson::Document))
            .collect::<OdmResult<Vec<_>>>()?;

        Ok(doc! { "$or": clauses })
    }

    fn visit_not(&mut self, child: &QueryNode) -> OdmResult<Document> {
        let QueryNode::Leaf {
            field_path,
            operator,
            value,
        } = child
        else {
            let clause = self.visit_node(child)?;
            return Ok(doc! { "$nor": [clause] });
        };

        if matches!(operator, Operator::Text | Operator::Near) {
            return Err(OdmError::invalid_query(
                field_path.as_str(),
                operator.as_str(),
                "cannot be negated",
            ));
        }

        let (key, condition) = self.leaf(field_path, *operator, value)?;
        let negated = match condition {
            Condition::Value(value) => doc! { "$ne": value },
            Condition::Operators(operators) => doc! { "$not": operators },
        };

        Ok(doc! { key: negated })
    }

    fn visit_leaf(&mut self, field_path: &str, operator: Operator, value: &Value) -> OdmResult<Document> {
        let (key, condition) = self.leaf(field_path, operator, value)?;
        Ok(doc! { key: condition.into_bson() })
    }
}

fn is_textual(spec: &FieldSpec) -> bool {
    match spec.kind() {
        FieldKind::Scalar(scalar) => scalar.is_textual(),
        FieldKind::List { element } => is_textual(element),
        FieldKind::Dynamic => true,
        _ => false,
    }
}

fn string_pattern(operator: Operator, text: &str) -> (String, bool) {
    let escaped = regex::escape(text);

    match operator {
        Operator::Contains => (escaped, false),
        Operator::IContains => (escaped, true),
        Operator::StartsWith => (format!("^{escaped}"), false),
        Operator::IStartsWith => (format!("^{escaped}"), true),
        Operator::EndsWith => (format!("{escaped}$"), false),
        Operator::IEndsWith => (format!("{escaped}$"), true),
        Operator::Exact => (format!("^{escaped}$"), false),
        _ => (format!("^{escaped}$"), true),
    }
}
