//! Native attribute values and reference handles.
//!
//! A [`Value`] is what application code reads from and writes to a document.
//! Field specifications convert values to and from the BSON wire form; the
//! value itself carries no schema knowledge.

use bson::{Bson, Document, Uuid, oid::ObjectId};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::{
    context::Context,
    document::Model,
    error::OdmResult,
    query::Q,
};

/// Ordered attribute map used for documents and embedded objects.
pub type Fields = BTreeMap<String, Value>;

/// A native attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(DateTime<Utc>),
    ObjectId(ObjectId),
    Uuid(Uuid),
    Binary(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// An embedded object, keyed by attribute name (not wire name).
    Embedded(Fields),
    Reference(ReferenceHandle),
    /// A raw wire value. Passed through conversion untouched when the target
    /// field is dynamic, and decoded through the field otherwise.
    Dynamic(Bson),
}

impl Value {
    /// Short name of the value's kind, used in validation messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::DateTime(_) => "datetime",
            Value::ObjectId(_) => "objectid",
            Value::Uuid(_) => "uuid",
            Value::Binary(_) => "binary",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Embedded(_) => "embedded",
            Value::Reference(_) => "reference",
            Value::Dynamic(_) => "dynamic",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view of `Int` and `Float` values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_embedded(&self) -> Option<&Fields> {
        match self {
            Value::Embedded(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&ReferenceHandle> {
        match self {
            Value::Reference(handle) => Some(handle),
            _ => None,
        }
    }

    /// Builds an embedded object from `(name, value)` pairs.
    pub fn embedded<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Value::Embedded(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Builds a map value from `(key, value)` pairs.
    pub fn map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Schema-less wire form, used for attributes without a field spec.
    pub fn to_untyped_bson(&self) -> Bson {
        match self {
            Value::Null => Bson::Null,
            Value::Bool(b) => Bson::Boolean(*b),
            Value::Int(i) => match i32::try_from(*i) {
                Ok(small) => Bson::Int32(small),
                Err(_) => Bson::Int64(*i),
            },
            Value::Float(f) => Bson::Double(*f),
            Value::String(s) => Bson::String(s.clone()),
            Value::DateTime(dt) => Bson::DateTime(bson::DateTime::from_chrono(*dt)),
            Value::ObjectId(oid) => Bson::ObjectId(*oid),
            Value::Uuid(uuid) => Bson::from(*uuid),
            Value::Binary(bytes) => Bson::Binary(bson::Binary {
                subtype: bson::spec::BinarySubtype::Generic,
                bytes: bytes.clone(),
            }),
            Value::List(items) => Bson::Array(items.iter().map(Value::to_untyped_bson).collect()),
            Value::Map(entries) | Value::Embedded(entries) => Bson::Document(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_untyped_bson()))
                    .collect(),
            ),
            Value::Reference(handle) => handle.id().unwrap_or(Bson::Null),
            Value::Dynamic(raw) => raw.clone(),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident $(as $cast:ty)?),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::$variant(value $(as $cast)?)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i32 => Int as i64,
    i64 => Int,
    u32 => Int as i64,
    f32 => Float as f64,
    f64 => Float,
    String => String,
    DateTime<Utc> => DateTime,
    ObjectId => ObjectId,
    Uuid => Uuid,
    ReferenceHandle => Reference,
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<Bson> for Value {
    fn from(value: Bson) -> Self {
        Value::Dynamic(value)
    }
}

impl From<Document> for Value {
    fn from(value: Document) -> Self {
        Value::Dynamic(Bson::Document(value))
    }
}

impl From<&Model> for Value {
    fn from(model: &Model) -> Self {
        Value::Reference(ReferenceHandle::to(model))
    }
}

impl From<Model> for Value {
    fn from(model: Model) -> Self {
        Value::Reference(ReferenceHandle::Resolved(Box::new(model)))
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// A reference to a document in another (or the same) collection.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceHandle {
    /// The referenced document, owned by the referrer.
    Resolved(Box<Model>),
    /// Only the identifier is known; the dereference engine may resolve it.
    Unresolved { schema: String, id: Bson },
    /// Dereferencing found no document with this identifier.
    Dangling { schema: String, id: Bson },
    /// Resolved on demand, never by batch dereferencing.
    Lazy(LazyReference),
}

impl ReferenceHandle {
    /// A resolved handle holding a copy of `model`.
    pub fn to(model: &Model) -> Self {
        ReferenceHandle::Resolved(Box::new(model.clone()))
    }

    pub fn unresolved(schema: impl Into<String>, id: impl Into<Bson>) -> Self {
        ReferenceHandle::Unresolved {
            schema: schema.into(),
            id: id.into(),
        }
    }

    /// Name of the schema the handle points into.
    pub fn schema_name(&self) -> &str {
        match self {
            ReferenceHandle::Resolved(model) => model.schema().name(),
            ReferenceHandle::Unresolved { schema, .. } | ReferenceHandle::Dangling { schema, .. } => {
                schema
            }
            ReferenceHandle::Lazy(lazy) => lazy.schema(),
        }
    }

    /// Wire identifier of the referenced document.
    pub fn id(&self) -> Option<Bson> {
        match self {
            ReferenceHandle::Resolved(model) => model.id(),
            ReferenceHandle::Unresolved { id, .. } | ReferenceHandle::Dangling { id, .. } => {
                Some(id.clone())
            }
            ReferenceHandle::Lazy(lazy) => Some(lazy.id().clone()),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, ReferenceHandle::Resolved(_))
    }

    pub fn is_dangling(&self) -> bool {
        matches!(self, ReferenceHandle::Dangling { .. })
    }

    pub fn as_model(&self) -> Option<&Model> {
        match self {
            ReferenceHandle::Resolved(model) => Some(model),
            _ => None,
        }
    }
}

/// A reference that is fetched explicitly instead of batch-dereferenced.
#[derive(Debug, Clone, PartialEq)]
pub struct LazyReference {
    schema: String,
    id: Bson,
}

impl LazyReference {
    pub fn new(schema: impl Into<String>, id: impl Into<Bson>) -> Self {
        Self {
            schema: schema.into(),
            id: id.into(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn id(&self) -> &Bson {
        &self.id
    }

    /// Loads the referenced document.
    ///
    /// # Returns
    ///
    /// `Ok(None)` if no document carries this identifier.
    pub async fn fetch(&self, ctx: &Context) -> OdmResult<Option<Model>> {
        ctx.objects(&self.schema)?
            .filter(Q::new("pk", Value::Dynamic(self.id.clone())))
            .first()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_conversions() {
        assert_eq!(Value::from(5), Value::Int(5));
        assert_eq!(Value::from("a"), Value::String("a".into()));
        assert_eq!(Value::from(Some(1.5)), Value::Float(1.5));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(
            Value::from(vec!["a", "b"]),
            Value::List(vec![Value::from("a"), Value::from("b")])
        );
    }

    #[test]
    fn test_untyped_bson_narrows_small_ints() {
        assert_eq!(Value::Int(7).to_untyped_bson(), Bson::Int32(7));
        assert_eq!(
            Value::Int(i64::MAX).to_untyped_bson(),
            Bson::Int64(i64::MAX)
        );
        assert_eq!(
            Value::embedded([("a", 1)]).to_untyped_bson(),
            Bson::Document(bson::doc! { "a": 1 })
        );
    }

    #[test]
    fn test_unresolved_handle_exposes_id() {
        let oid = ObjectId::new();
        let handle = ReferenceHandle::unresolved("User", oid);

        assert_eq!(handle.schema_name(), "User");
        assert_eq!(handle.id(), Some(Bson::ObjectId(oid)));
        assert!(!handle.is_resolved());
    }
}
