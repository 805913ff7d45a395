//! Field specifications.
//!
//! A [`FieldSpec`] describes one attribute of a schema: its native kind, the
//! name it carries on the wire, and the constraints enforced by validation.
//! Specs are built with chainable constructors and become immutable once they
//! are part of a [`Schema`](crate::schema::Schema).
//!
//! # Examples
//!
//! ```ignore
//! use docmodel::field::FieldSpec;
//!
//! let age = FieldSpec::int("age").min_value(0).max_value(150);
//! let tags = FieldSpec::list("tags", FieldSpec::string("tag").max_length(32));
//! let author = FieldSpec::reference("author", "User").required();
//! ```

use bson::oid::ObjectId;
use regex::Regex;
use std::{fmt, sync::Arc};

use crate::value::Value;

/// Scalar wire types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    String,
    Int,
    Float,
    Bool,
    DateTime,
    ObjectId,
    Uuid,
    Binary,
    /// A string holding an e-mail address.
    Email,
    /// A string holding an absolute URL.
    Url,
    /// A `[longitude, latitude]` pair stored as a GeoJSON point.
    Point,
}

impl ScalarType {
    pub fn name(&self) -> &'static str {
        match self {
            ScalarType::String => "string",
            ScalarType::Int => "int",
            ScalarType::Float => "float",
            ScalarType::Bool => "bool",
            ScalarType::DateTime => "datetime",
            ScalarType::ObjectId => "objectid",
            ScalarType::Uuid => "uuid",
            ScalarType::Binary => "binary",
            ScalarType::Email => "email",
            ScalarType::Url => "url",
            ScalarType::Point => "point",
        }
    }

    /// Types stored as wire strings.
    pub fn is_textual(&self) -> bool {
        matches!(self, ScalarType::String | ScalarType::Email | ScalarType::Url)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ScalarType::Int | ScalarType::Float)
    }
}

/// How a reference field is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferenceMode {
    /// Resolved by the dereference engine in batches.
    #[default]
    Batched,
    /// Resolved one at a time through [`LazyReference::fetch`](crate::value::LazyReference::fetch).
    Lazy,
}

/// The native kind of a field.
#[derive(Debug, Clone)]
pub enum FieldKind {
    Scalar(ScalarType),
    /// An embedded object whose schema is looked up by name.
    Embedded { schema: String },
    List { element: Box<FieldSpec> },
    /// String-keyed map of homogeneous values.
    Map { element: Box<FieldSpec> },
    Reference { target: String, mode: ReferenceMode },
    /// Any wire value, converted by identity.
    Dynamic,
}

impl FieldKind {
    pub fn describe(&self) -> String {
        match self {
            FieldKind::Scalar(scalar) => scalar.name().to_owned(),
            FieldKind::Embedded { schema } => format!("embedded {schema}"),
            FieldKind::List { element } => format!("list of {}", element.kind().describe()),
            FieldKind::Map { element } => format!("map of {}", element.kind().describe()),
            FieldKind::Reference { target, .. } => format!("reference to {target}"),
            FieldKind::Dynamic => "dynamic".to_owned(),
        }
    }

    /// Name of the schema an embedded or reference field points to.
    pub fn target_schema(&self) -> Option<&str> {
        match self {
            FieldKind::Embedded { schema } => Some(schema),
            FieldKind::Reference { target, .. } => Some(target),
            _ => None,
        }
    }
}

/// A default value: either a constant or a zero-argument producer.
#[derive(Clone)]
pub enum DefaultValue {
    Value(Value),
    Producer(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl DefaultValue {
    /// Produces a fresh default.
    pub fn produce(&self) -> Value {
        match self {
            DefaultValue::Value(value) => value.clone(),
            DefaultValue::Producer(producer) => producer(),
        }
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Value(value) => f.debug_tuple("Value").field(value).finish(),
            DefaultValue::Producer(_) => f.write_str("Producer(..)"),
        }
    }
}

/// A custom validation rule. Returning `Err(reason)` records a failure at the
/// field's path.
#[derive(Clone)]
pub struct Validator(Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>);

impl Validator {
    pub fn new<F>(rule: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        Self(Arc::new(rule))
    }

    pub fn check(&self, value: &Value) -> Result<(), String> {
        (self.0)(value)
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Validator(..)")
    }
}

/// Range, length and pattern constraints.
#[derive(Debug, Clone, Default)]
pub struct Constraints {
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub pattern: Option<Regex>,
}

/// Specification of a single attribute.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    name: String,
    wire_name: String,
    kind: FieldKind,
    required: bool,
    nullable: bool,
    primary_key: bool,
    unique: bool,
    unique_with: Vec<String>,
    choices: Option<Vec<Value>>,
    default: Option<DefaultValue>,
    constraints: Constraints,
    validators: Vec<Validator>,
    definition_error: Option<String>,
}

impl FieldSpec {
    /// Creates a spec of the given kind. The wire name defaults to `name`.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        let name = name.into();

        Self {
            wire_name: name.clone(),
            name,
            kind,
            required: false,
            nullable: false,
            primary_key: false,
            unique: false,
            unique_with: Vec::new(),
            choices: None,
            default: None,
            constraints: Constraints::default(),
            validators: Vec::new(),
            definition_error: None,
        }
    }

    pub fn scalar(name: impl Into<String>, scalar: ScalarType) -> Self {
        Self::new(name, FieldKind::Scalar(scalar))
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::String)
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::Int)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::Float)
    }

    pub fn bool(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::Bool)
    }

    pub fn datetime(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::DateTime)
    }

    pub fn object_id(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::ObjectId)
    }

    pub fn uuid(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::Uuid)
    }

    pub fn binary(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::Binary)
    }

    pub fn email(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::Email)
    }

    pub fn url(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::Url)
    }

    pub fn point(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::Point)
    }

    /// An embedded object of the named schema.
    pub fn embedded(name: impl Into<String>, schema: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::Embedded {
                schema: schema.into(),
            },
        )
    }

    /// A list whose elements follow `element`. The element's name is ignored.
    pub fn list(name: impl Into<String>, element: FieldSpec) -> Self {
        Self::new(
            name,
            FieldKind::List {
                element: Box::new(element),
            },
        )
    }

    pub fn map(name: impl Into<String>, element: FieldSpec) -> Self {
        Self::new(
            name,
            FieldKind::Map {
                element: Box::new(element),
            },
        )
    }

    /// A batch-dereferenced reference to a document of `target`.
    pub fn reference(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::Reference {
                target: target.into(),
                mode: ReferenceMode::Batched,
            },
        )
    }

    pub fn lazy_reference(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::Reference {
                target: target.into(),
                mode: ReferenceMode::Lazy,
            },
        )
    }

    pub fn dynamic(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Dynamic)
    }

    /// Sets the attribute name used on the wire.
    pub fn wire_name(mut self, wire_name: impl Into<String>) -> Self {
        self.wire_name = wire_name.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Allows an explicit null to be stored instead of removing the attribute.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Marks the field as the document's primary key (wire name `_id`).
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.required = true;
        self.wire_name = "_id".to_owned();
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Declares a compound unique constraint with the given sibling fields.
    pub fn unique_with<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique = true;
        self.unique_with = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Restricts the field to a closed set of values.
    pub fn choices<I, V>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.choices = Some(choices.into_iter().map(Into::into).collect());
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(DefaultValue::Value(value.into()));
        self
    }

    /// Computes the default with `producer` each time a document is created.
    pub fn default_with<F>(mut self, producer: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.default = Some(DefaultValue::Producer(Arc::new(producer)));
        self
    }

    pub fn min_value(mut self, min: impl Into<f64>) -> Self {
        self.constraints.min_value = Some(min.into());
        self
    }

    pub fn max_value(mut self, max: impl Into<f64>) -> Self {
        self.constraints.max_value = Some(max.into());
        self
    }

    pub fn min_length(mut self, min: usize) -> Self {
        self.constraints.min_length = Some(min);
        self
    }

    pub fn max_length(mut self, max: usize) -> Self {
        self.constraints.max_length = Some(max);
        self
    }

    /// Requires string values to match `pattern`. An invalid pattern is reported
    /// when the owning schema is built.
    pub fn pattern(mut self, pattern: &str) -> Self {
        match Regex::new(pattern) {
            Ok(regex) => self.constraints.pattern = Some(regex),
            Err(err) => {
                self.definition_error = Some(format!("invalid pattern for '{}': {err}", self.name))
            }
        }
        self
    }

    /// Adds a custom validation rule.
    pub fn validator<F>(mut self, rule: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validators.push(Validator::new(rule));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn wire_key(&self) -> &str {
        &self.wire_name
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn is_primary_key(&self) -> bool {
        self.primary_key
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn unique_with_fields(&self) -> &[String] {
        &self.unique_with
    }

    pub fn choice_values(&self) -> Option<&[Value]> {
        self.choices.as_deref()
    }

    pub fn default_value(&self) -> Option<&DefaultValue> {
        self.default.as_ref()
    }

    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    /// Element spec of a list or map field.
    pub fn element(&self) -> Option<&FieldSpec> {
        match &self.kind {
            FieldKind::List { element } | FieldKind::Map { element } => Some(&**element),
            _ => None,
        }
    }

    /// The first definition problem of this spec or any nested element spec.
    pub(crate) fn definition_error(&self) -> Option<&str> {
        self.definition_error
            .as_deref()
            .or_else(|| self.element().and_then(FieldSpec::definition_error))
    }

    /// An empty container for list, map and embedded kinds, `Null` otherwise.
    pub(crate) fn empty_value(&self) -> Value {
        match &self.kind {
            FieldKind::List { .. } => Value::List(Vec::new()),
            FieldKind::Map { .. } => Value::Map(Default::default()),
            FieldKind::Embedded { .. } => Value::Embedded(Default::default()),
            _ => Value::Null,
        }
    }

    /// Null on a non-nullable field stands for absence.
    pub(crate) fn is_effectively_absent(&self, value: &Value) -> bool {
        value.is_null() && !self.nullable
    }

    /// The implicit primary key added to document schemas that declare none.
    pub(crate) fn implicit_id() -> Self {
        FieldSpec::object_id("id")
            .primary_key()
            .default_with(|| Value::ObjectId(ObjectId::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_name_defaults_to_name() {
        let spec = FieldSpec::string("title");
        assert_eq!(spec.wire_key(), "title");

        let renamed = FieldSpec::string("title").wire_name("t");
        assert_eq!(renamed.wire_key(), "t");
    }

    #[test]
    fn test_primary_key_uses_id_wire_name() {
        let spec = FieldSpec::string("slug").primary_key();
        assert!(spec.is_primary_key());
        assert!(spec.is_required());
        assert_eq!(spec.wire_key(), "_id");
    }

    #[test]
    fn test_invalid_pattern_is_recorded() {
        let spec = FieldSpec::string("code").pattern("([a-z");
        assert!(spec.definition_error().is_some());

        let nested = FieldSpec::list("codes", FieldSpec::string("code").pattern("(["));
        assert!(nested.definition_error().is_some());
    }

    #[test]
    fn test_default_producer_runs_each_time() {
        let spec = FieldSpec::object_id("ref").default_with(|| Value::ObjectId(ObjectId::new()));
        let default = spec.default_value().cloned();
        let first = default.as_ref().map(DefaultValue::produce);
        let second = default.as_ref().map(DefaultValue::produce);

        assert!(first.is_some());
        assert_ne!(first, second);
    }
}
