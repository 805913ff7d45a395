//! Query expression trees.
//!
//! Constraints are written as `path__operator` expressions and combined with
//! `&`, `|` and `!`:
//!
//! ```ignore
//! use docmodel::query::Q;
//!
//! let adults = Q::new("age__gte", 18) & Q::new("age__lt", 65);
//! let parisian = Q::new("address__city__istartswith", "par");
//! let filter = adults | !parisian;
//! ```

use std::ops::{BitAnd, BitOr, Not};

use crate::{query::Operator, value::Value};

/// A boolean tree of field constraints.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryNode {
    Leaf {
        /// Dotted attribute path, using attribute names.
        field_path: String,
        operator: Operator,
        value: Value,
    },
    And(Vec<QueryNode>),
    Or(Vec<QueryNode>),
    Not(Box<QueryNode>),
}

impl QueryNode {
    pub fn leaf(field_path: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        QueryNode::Leaf {
            field_path: field_path.into(),
            operator,
            value: value.into(),
        }
    }

    /// Combines with another node using logical AND, appending to an existing AND.
    pub fn and(self, other: QueryNode) -> Self {
        match self {
            QueryNode::And(mut children) => {
                children.push(other);
                QueryNode::And(children)
            }
            _ => QueryNode::And(vec![self, other]),
        }
    }

    /// Combines with another node using logical OR, appending to an existing OR.
    pub fn or(self, other: QueryNode) -> Self {
        match self {
            QueryNode::Or(mut children) => {
                children.push(other);
                QueryNode::Or(children)
            }
            _ => QueryNode::Or(vec![self, other]),
        }
    }

    pub fn negate(self) -> Self {
        QueryNode::Not(Box::new(self))
    }

    /// Rewrites the tree into canonical form.
    ///
    /// Nested nodes of the same kind are flattened and single-child groups
    /// collapse. Negation is pushed down to the leaves: double negation cancels,
    /// And/Or swap under negation, and `eq`/`ne`, `in`/`nin` and `exists`
    /// leaves are inverted. Other negated leaves stay wrapped in `Not`.
    pub fn normalize(self) -> Self {
        match self {
            QueryNode::Leaf { .. } => self,
            QueryNode::And(children) => Self::flatten(children, true),
            QueryNode::Or(children) => Self::flatten(children, false),
            QueryNode::Not(child) => child.normalize().complement(),
        }
    }

    fn flatten(children: Vec<QueryNode>, conjunction: bool) -> Self {
        let mut flat = Vec::with_capacity(children.len());

        for child in children {
            match (child.normalize(), conjunction) {
                (QueryNode::And(nested), true) | (QueryNode::Or(nested), false) => flat.extend(nested),
                (other, _) => flat.push(other),
            }
        }

        if flat.len() == 1 {
            if let Some(only) = flat.pop() {
                return only;
            }
        }

        if conjunction { QueryNode::And(flat) } else { QueryNode::Or(flat) }
    }

    /// Negation of an already normalized node.
    fn complement(self) -> Self {
        match self {
            QueryNode::Not(child) => *child,
            QueryNode::Leaf {
                field_path,
                operator: Operator::Exists,
                value: Value::Bool(exists),
            } => QueryNode::Leaf {
                field_path,
                operator: Operator::Exists,
                value: Value::Bool(!exists),
            },
            QueryNode::Leaf {
                field_path,
                operator,
                value,
            } => match operator.inverse() {
                Some(inverse) => QueryNode::Leaf {
                    field_path,
                    operator: inverse,
                    value,
                },
                None => QueryNode::Not(Box::new(QueryNode::Leaf {
                    field_path,
                    operator,
                    value,
                })),
            },
            QueryNode::And(children) => QueryNode::Or(children.into_iter().map(Self::complement).collect()),
            QueryNode::Or(children) => QueryNode::And(children.into_iter().map(Self::complement).collect()),
        }
    }
}

/// A query expression under construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Q(QueryNode);

impl Q {
    /// Parses a `path__operator` expression. `__` separates path segments; a
    /// missing operator means equality, and a `not` segment before the operator
    /// negates the constraint.
    pub fn new(expression: &str, value: impl Into<Value>) -> Self {
        let mut parts: Vec<&str> = expression.split("__").collect();
        let mut operator = Operator::Eq;

        if parts.len() > 1 {
            if let Some(parsed) = parts.last().and_then(|token| Operator::from_token(token)) {
                operator = parsed;
                parts.pop();
            }
        }

        let negated = parts.len() > 1 && parts.last() == Some(&"not");
        if negated {
            parts.pop();
        }

        let leaf = QueryNode::leaf(parts.join("."), operator, value);
        Q(if negated { leaf.negate() } else { leaf })
    }

    /// A full-text search constraint.
    pub fn text(search: impl Into<String>) -> Self {
        Q(QueryNode::leaf("", Operator::Text, Value::String(search.into())))
    }

    pub fn into_node(self) -> QueryNode {
        self.0
    }

    pub fn node(&self) -> &QueryNode {
        &self.0
    }
}

impl From<Q> for QueryNode {
    fn from(q: Q) -> Self {
        q.0
    }
}

impl From<QueryNode> for Q {
    fn from(node: QueryNode) -> Self {
        Q(node)
    }
}

impl BitAnd for Q {
    type Output = Q;

    fn bitand(self, rhs: Q) -> Q {
        Q(self.0.and(rhs.0))
    }
}

impl BitOr for Q {
    type Output = Q;

    fn bitor(self, rhs: Q) -> Q {
        Q(self.0.or(rhs.0))
    }
}

impl Not for Q {
    type Output = Q;

    fn not(self) -> Q {
        Q(self.0.negate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expression_parsing() {
        assert_eq!(
            Q::new("address__city__startswith", "Par").into_node(),
            QueryNode::leaf("address.city", Operator::StartsWith, "Par")
        );
        assert_eq!(Q::new("age", 3).into_node(), QueryNode::leaf("age", Operator::Eq, 3));
        assert_eq!(
            Q::new("age__not__gt", 3).into_node(),
            QueryNode::leaf("age", Operator::Gt, 3).negate()
        );
        // A lone segment is always a path, even if it names an operator.
        assert_eq!(Q::new("size", 3).into_node(), QueryNode::leaf("size", Operator::Eq, 3));
    }

    #[test]
    fn test_negated_equality_becomes_ne() {
        assert_eq!((!Q::new("a", 1)).into_node().normalize(), Q::new("a__ne", 1).into_node());
        assert_eq!(
            (!Q::new("a__in", vec![1, 2])).into_node().normalize(),
            QueryNode::leaf("a", Operator::Nin, vec![1, 2])
        );
        assert_eq!(
            (!Q::new("a__exists", true)).into_node().normalize(),
            QueryNode::leaf("a", Operator::Exists, false)
        );
    }

    #[test]
    fn test_double_negation_cancels() {
        let node = (!!Q::new("a__gt", 1)).into_node().normalize();
        assert_eq!(node, QueryNode::leaf("a", Operator::Gt, 1));
    }

    #[test]
    fn test_de_morgan() {
        let node = (!(Q::new("a", 1) & Q::new("b__gt", 2))).into_node().normalize();

        assert_eq!(
            node,
            QueryNode::Or(vec![
                QueryNode::leaf("a", Operator::Ne, 1),
                QueryNode::leaf("b", Operator::Gt, 2).negate(),
            ])
        );
    }

    #[test]
    fn test_flattening() {
        let node = ((Q::new("a", 1) & Q::new("b", 2)) & (Q::new("c", 3) & Q::new("d", 4)))
            .into_node()
            .normalize();

        let QueryNode::And(children) = node else {
            panic!("expected a conjunction");
        };
        assert_eq!(children.len(), 4);

        let single = QueryNode::Or(vec![QueryNode::leaf("a", Operator::Eq, 1)]).normalize();
        assert_eq!(single, QueryNode::leaf("a", Operator::Eq, 1));
    }
}
