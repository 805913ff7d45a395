//! Query operators.

use std::fmt;

/// Comparison operators available in query expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    /// Takes a boolean: whether the attribute is present.
    Exists,
    Regex,
    /// Length of a list attribute.
    Size,
    /// List contains every given value.
    All,
    /// Some list element matches the given embedded constraints.
    ElemMatch,
    /// Full-text search over the collection's text index. Pathless.
    Text,
    /// Geospatial proximity to a point.
    Near,
    /// Distance bound for a `Near` constraint on the same path.
    MaxDistance,
    /// Takes `[divisor, remainder]`.
    Mod,
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    EndsWith,
    IEndsWith,
    Exact,
    IExact,
}

impl Operator {
    /// Parses the operator suffix of a `path__operator` expression.
    pub fn from_token(token: &str) -> Option<Self> {
        let operator = match token {
            "eq" => Operator::Eq,
            "ne" => Operator::Ne,
            "gt" => Operator::Gt,
            "gte" => Operator::Gte,
            "lt" => Operator::Lt,
            "lte" => Operator::Lte,
            "in" => Operator::In,
            "nin" => Operator::Nin,
            "exists" => Operator::Exists,
            "regex" => Operator::Regex,
            "size" => Operator::Size,
            "all" => Operator::All,
            "match" | "elem_match" => Operator::ElemMatch,
            "near" => Operator::Near,
            "max_distance" => Operator::MaxDistance,
            "mod" => Operator::Mod,
            "contains" => Operator::Contains,
            "icontains" => Operator::IContains,
            "startswith" => Operator::StartsWith,
            "istartswith" => Operator::IStartsWith,
            "endswith" => Operator::EndsWith,
            "iendswith" => Operator::IEndsWith,
            "exact" => Operator::Exact,
            "iexact" => Operator::IExact,
            _ => return None,
        };

        Some(operator)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::In => "in",
            Operator::Nin => "nin",
            Operator::Exists => "exists",
            Operator::Regex => "regex",
            Operator::Size => "size",
            Operator::All => "all",
            Operator::ElemMatch => "match",
            Operator::Text => "text",
            Operator::Near => "near",
            Operator::MaxDistance => "max_distance",
            Operator::Mod => "mod",
            Operator::Contains => "contains",
            Operator::IContains => "icontains",
            Operator::StartsWith => "startswith",
            Operator::IStartsWith => "istartswith",
            Operator::EndsWith => "endswith",
            Operator::IEndsWith => "iendswith",
            Operator::Exact => "exact",
            Operator::IExact => "iexact",
        }
    }

    /// The operator matching exactly the complement, where one exists.
    pub fn inverse(&self) -> Option<Self> {
        match self {
            Operator::Eq => Some(Operator::Ne),
            Operator::Ne => Some(Operator::Eq),
            Operator::In => Some(Operator::Nin),
            Operator::Nin => Some(Operator::In),
            _ => None,
        }
    }

    /// Operators that compile to a regular expression over a string attribute.
    pub fn is_string_match(&self) -> bool {
        matches!(
            self,
            Operator::Contains
                | Operator::IContains
                | Operator::StartsWith
                | Operator::IStartsWith
                | Operator::EndsWith
                | Operator::IEndsWith
                | Operator::Exact
                | Operator::IExact
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
