//! Document instances.
//!
//! A [`Model`] is one document of a registered schema: its attribute values,
//! the values it was loaded with, and the paths changed since. Mutation is
//! eager and never validates; validation runs on [`Model::validate`],
//! [`Model::to_wire`] and before every save.
//!
//! # Example
//!
//! ```ignore
//! use docmodel::document::Model;
//!
//! let mut post = Model::new(&registry, "Post")?;
//! post.set("title", "Hello")?;
//! post.append("tags", "rust")?;
//! post.set_path("meta.views", 1)?;
//!
//! let wire = post.to_wire()?;
//! ```

use bson::{Bson, Document, de::deserialize_from_bson, ser::serialize_to_bson};
use serde::{Serialize, de::DeserializeOwned};
use std::{collections::BTreeSet, fmt, marker::PhantomData, sync::Arc};
use tracing::warn;

use crate::{
    convert::{decode_fields, encode_fields},
    delta::{self, Delta},
    error::{OdmError, OdmResult, ValidationError},
    field::{FieldKind, FieldSpec},
    schema::{Schema, SchemaRegistry, Strictness},
    state::DocumentState,
    validate::validate_fields,
    value::{Fields, Value},
};

/// One document of a registered schema.
#[derive(Clone)]
pub struct Model {
    registry: Arc<SchemaRegistry>,
    schema: Arc<Schema>,
    state: DocumentState,
    extras: Document,
}

impl Model {
    /// Creates a new, unsaved document with every declared default applied.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::UnknownSchema`] if `schema` is not registered, and
    /// [`OdmError::SchemaDefinition`] for embedded schemas.
    pub fn new(registry: &Arc<SchemaRegistry>, schema: &str) -> OdmResult<Self> {
        let schema = Arc::clone(registry.get(schema)?);

        if schema.is_embedded() {
            return Err(OdmError::SchemaDefinition {
                schema: schema.name().to_owned(),
                reason: "embedded schemas cannot be instantiated as documents".to_owned(),
            });
        }

        let mut state = DocumentState::new();
        let values = state.current_mut_untracked();

        for spec in schema.fields() {
            if let Some(default) = spec.default_value() {
                values.insert(spec.name().to_owned(), default.produce());
            }
        }

        Ok(Self {
            registry: Arc::clone(registry),
            schema,
            state,
            extras: Document::new(),
        })
    }

    /// Loads a stored document.
    ///
    /// Malformed data in a non-required field is dropped with a warning, unless
    /// the schema is strict. Missing attributes get their defaults without
    /// being recorded as changed.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Validation`] for malformed required attributes, and
    /// for any malformed or unknown attribute in a strict schema.
    pub fn from_wire(registry: &Arc<SchemaRegistry>, schema: &str, document: Document) -> OdmResult<Self> {
        Self::load(Arc::clone(registry), Arc::clone(registry.get(schema)?), document, None)
    }

    /// Builds a new document from any serializable value shaped like the
    /// stored document (wire names as keys).
    pub fn from_struct<T: Serialize>(registry: &Arc<SchemaRegistry>, schema: &str, value: &T) -> OdmResult<Self> {
        let mut model = Self::new(registry, schema)?;

        let Bson::Document(document) = serialize_to_bson(value)? else {
            return Err(OdmError::Serialization(format!(
                "a {schema} must serialize to a document"
            )));
        };

        for (name, value) in decode_fields(&model.schema, &document, "", &model.registry)? {
            model.state.set(&name, value);
        }

        Ok(model)
    }

    pub(crate) fn load(
        registry: Arc<SchemaRegistry>,
        schema: Arc<Schema>,
        document: Document,
        loaded: Option<BTreeSet<String>>,
    ) -> OdmResult<Self> {
        let strict = schema.strictness() == Strictness::Strict;
        let mut values = Fields::new();
        let mut extras = Document::new();
        let mut errors = ValidationError::new();

        for (wire_name, wire) in document {
            let Some(spec) = schema.field_by_wire(&wire_name) else {
                match schema.strictness() {
                    Strictness::Strict => errors.add(wire_name, "Unknown field"),
                    Strictness::Retain => {
                        extras.insert(wire_name, wire);
                    }
                    Strictness::Dynamic => {
                        values.insert(wire_name, Value::Dynamic(wire));
                    }
                }
                continue;
            };

            match spec.from_wire(&wire, &registry) {
                Ok(value) => {
                    values.insert(spec.name().to_owned(), value);
                }
                Err(err) if strict || spec.is_required() => errors.merge(err),
                Err(err) => {
                    warn!(
                        schema = schema.name(),
                        field = spec.name(),
                        error = %err,
                        "Dropping malformed stored value"
                    );
                }
            }
        }

        errors.into_result()?;

        for spec in schema.fields() {
            let fetched = loaded.as_ref().is_none_or(|loaded| loaded.contains(spec.name()));

            if !fetched || spec.is_primary_key() || values.contains_key(spec.name()) {
                continue;
            }

            if let Some(default) = spec.default_value() {
                values.insert(spec.name().to_owned(), default.produce());
            }
        }

        Ok(Self {
            registry,
            schema,
            state: DocumentState::loaded(values, loaded),
            extras,
        })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn state(&self) -> &DocumentState {
        &self.state
    }

    /// Stored attributes the schema does not declare (retaining schemas only).
    pub fn extras(&self) -> &Document {
        &self.extras
    }

    pub fn is_new(&self) -> bool {
        self.state.is_new()
    }

    /// Native primary-key value.
    pub fn pk(&self) -> Option<&Value> {
        let pk = self.schema.primary_key()?;
        self.state.get(pk.name()).filter(|value| !value.is_null())
    }

    /// Wire form of the primary key.
    pub fn id(&self) -> Option<Bson> {
        let spec = self.schema.primary_key()?;
        let value = self.pk()?;
        spec.coerce(value, &self.registry).ok()
    }

    /// Current value of a top-level attribute. `pk` addresses the primary key.
    pub fn get(&self, name: &str) -> Option<&Value> {
        let name = self.schema.lookup(name).map_or(name, FieldSpec::name);
        self.state.get(name)
    }

    /// Current value at a dotted path through embedded objects, lists and maps.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        lookup_path(self.state.current(), path)
    }

    /// Replaces a top-level attribute.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::UnknownField`] if the schema does not declare `name`
    /// and is not dynamic. The value itself is not checked until validation.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> OdmResult<()> {
        let name = self.canonical_name(name)?.to_owned();
        self.state.set(&name, value.into());
        Ok(())
    }

    /// Removes a top-level attribute.
    pub fn unset(&mut self, name: &str) -> OdmResult<()> {
        let name = self.canonical_name(name)?.to_owned();
        self.state.remove(&name);
        Ok(())
    }

    /// Assigns a value below a top-level attribute.
    ///
    /// Missing embedded objects along the way are created. The full path is
    /// recorded as changed while the walk stays within embedded objects; once
    /// it enters a list or map, the path of that container is recorded instead.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::UnknownField`] for undeclared embedded attributes and
    /// [`OdmError::InvalidPath`] for out-of-range indexes or traversal into
    /// scalar values.
    pub fn set_path(&mut self, path: &str, value: impl Into<Value>) -> OdmResult<()> {
        let value = value.into();
        let segments: Vec<&str> = path.split('.').collect();

        if segments.len() == 1 {
            return self.set(path, value);
        }

        let top = self.canonical_name(segments[0])?.to_owned();
        let registry = Arc::clone(&self.registry);
        let schema = Arc::clone(&self.schema);
        let mut spec: Option<&FieldSpec> = schema.field(&top);
        let mut tracked = vec![top.clone()];
        let mut inside_container = false;

        // Walk a copy so a rejected segment leaves the document untouched.
        let mut working = self.state.get(&top).cloned().unwrap_or(Value::Null);
        let mut cursor: &mut Value = &mut working;

        for (depth, segment) in segments.iter().enumerate().skip(1) {
            let is_last = depth == segments.len() - 1;

            if cursor.is_null() {
                *cursor = spec.map_or(Value::Null, FieldSpec::empty_value);
            }

            cursor = match cursor {
                Value::Embedded(fields) => {
                    let nested = match spec.map(FieldSpec::kind) {
                        Some(FieldKind::Embedded { schema }) => registry.get(schema)?,
                        _ => return Err(OdmError::invalid_path(path, "embedded value without a schema")),
                    };
                    let field = nested.field(segment).ok_or_else(|| OdmError::UnknownField {
                        schema: nested.name().to_owned(),
                        field: (*segment).to_owned(),
                    })?;

                    spec = Some(field);

                    if !inside_container {
                        tracked.push((*segment).to_owned());
                    }

                    if is_last {
                        fields.insert((*segment).to_owned(), value);
                        break;
                    }

                    fields.entry((*segment).to_owned()).or_insert(Value::Null)
                }
                Value::List(items) => {
                    inside_container = true;
                    spec = spec.and_then(FieldSpec::element);

                    let length = items.len();
                    let index: usize = segment
                        .parse()
                        .map_err(|_| OdmError::invalid_path(path, format!("'{segment}' is not a list index")))?;
                    let slot = items.get_mut(index).ok_or_else(|| {
                        OdmError::invalid_path(path, format!("index {index} is out of range for {length} items"))
                    })?;

                    if is_last {
                        *slot = value;
                        break;
                    }

                    slot
                }
                Value::Map(entries) => {
                    inside_container = true;
                    spec = spec.and_then(FieldSpec::element);

                    if is_last {
                        entries.insert((*segment).to_owned(), value);
                        break;
                    }

                    entries.entry((*segment).to_owned()).or_insert(Value::Null)
                }
                other => {
                    return Err(OdmError::invalid_path(
                        path,
                        format!("cannot traverse into a {} value", other.kind_name()),
                    ));
                }
            };
        }

        self.state.current_mut_untracked().insert(top, working);
        self.state.mark_changed(tracked.join("."));
        Ok(())
    }

    /// Mutates a top-level attribute in place and records the whole attribute
    /// as changed. Absent containers start out empty.
    pub fn modify<R>(&mut self, name: &str, mutate: impl FnOnce(&mut Value) -> R) -> OdmResult<R> {
        let name = self.canonical_name(name)?.to_owned();

        if self.state.get(&name).is_none_or(Value::is_null) {
            let empty = self.schema.field(&name).map_or(Value::Null, FieldSpec::empty_value);
            self.state.current_mut_untracked().insert(name.clone(), empty);
        }

        let value = self
            .state
            .get_mut(&name)
            .ok_or_else(|| OdmError::invalid_path(&name, "attribute is missing"))?;

        Ok(mutate(value))
    }

    /// Appends to a list attribute.
    pub fn append(&mut self, name: &str, item: impl Into<Value>) -> OdmResult<()> {
        let item = item.into();

        self.modify(name, |value| match value {
            Value::List(items) => {
                items.push(item);
                Ok(())
            }
            other => Err(other.kind_name()),
        })?
        .map_err(|kind| OdmError::invalid_path(name, format!("cannot append to a {kind} value")))
    }

    /// Removes every element equal to `item` from a list attribute and returns
    /// how many were removed.
    pub fn remove_item(&mut self, name: &str, item: &Value) -> OdmResult<usize> {
        self.modify(name, |value| match value {
            Value::List(items) => {
                let before = items.len();
                items.retain(|existing| existing != item);
                Ok(before - items.len())
            }
            other => Err(other.kind_name()),
        })?
        .map_err(|kind| OdmError::invalid_path(name, format!("cannot remove from a {kind} value")))
    }

    /// Reads an attribute through serde.
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> OdmResult<Option<T>> {
        let name = self.canonical_name(name)?;
        let Some(value) = self.state.get(name).filter(|value| !value.is_null()) else {
            return Ok(None);
        };

        let wire = match self.schema.field(name) {
            Some(spec) => spec.coerce(value, &self.registry)?,
            None => value.to_untyped_bson(),
        };

        Ok(Some(deserialize_from_bson(wire)?))
    }

    /// Assigns an attribute through serde.
    pub fn set_as<T: Serialize>(&mut self, name: &str, value: &T) -> OdmResult<()> {
        let name = self.canonical_name(name)?.to_owned();
        let wire = serialize_to_bson(value)?;

        let value = match self.schema.field(&name) {
            Some(spec) => spec.from_wire(&wire, &self.registry)?,
            None => Value::Dynamic(wire),
        };

        self.state.set(&name, value);
        Ok(())
    }

    /// Validates every loaded attribute.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut errors = ValidationError::new();

        validate_fields(
            &self.schema,
            self.state.current(),
            self.state.loaded_fields(),
            "",
            &self.registry,
            &mut errors,
        );

        errors.into_result()
    }

    /// Validates and serializes the whole document, keyed by wire names.
    pub fn to_wire(&self) -> OdmResult<Document> {
        self.validate()?;
        self.encode()
    }

    /// Relaxed extended JSON form of [`Model::to_wire`].
    pub fn to_json(&self) -> OdmResult<serde_json::Value> {
        Ok(Bson::Document(self.to_wire()?).into_relaxed_extjson())
    }

    /// Deserializes the wire form into any serde type.
    pub fn to_struct<T: DeserializeOwned>(&self) -> OdmResult<T> {
        Ok(deserialize_from_bson(Bson::Document(self.to_wire()?))?)
    }

    /// The minimal update that brings the stored document up to date.
    pub fn delta(&self) -> OdmResult<Delta> {
        delta::compute(self)
    }

    /// Serialization without validation.
    pub(crate) fn encode(&self) -> OdmResult<Document> {
        let mut document = encode_fields(&self.schema, self.state.current(), "", &self.registry)?;

        for (key, value) in &self.extras {
            if !document.contains_key(key) {
                document.insert(key.clone(), value.clone());
            }
        }

        Ok(document)
    }

    pub(crate) fn state_mut(&mut self) -> &mut DocumentState {
        &mut self.state
    }

    pub(crate) fn replace_with(&mut self, other: Model) {
        self.state = other.state;
        self.extras = other.extras;
    }

    fn canonical_name<'a>(&'a self, name: &'a str) -> OdmResult<&'a str> {
        match self.schema.lookup(name) {
            Some(spec) => Ok(spec.name()),
            None if self.schema.strictness() == Strictness::Dynamic => Ok(name),
            None => Err(OdmError::UnknownField {
                schema: self.schema.name().to_owned(),
                field: name.to_owned(),
            }),
        }
    }
}

impl PartialEq for Model {
    fn eq(&self, other: &Self) -> bool {
        self.schema.name() == other.schema.name()
            && self.state.current() == other.state.current()
            && self.extras == other.extras
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("schema", &self.schema.name())
            .field("state", &self.state)
            .field("extras", &self.extras)
            .finish()
    }
}

/// Walks a dotted path through embedded objects, lists and maps.
pub(crate) fn lookup_path<'a>(fields: &'a Fields, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = fields.get(segments.next()?)?;

    for segment in segments {
        current = match current {
            Value::Embedded(fields) | Value::Map(fields) => fields.get(segment)?,
            Value::List(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

/// A typed, serde-backed accessor for one attribute.
///
/// Usually generated by `#[derive(Accessors)]`:
///
/// ```ignore
/// #[derive(Accessors)]
/// struct Post {
///     title: String,
///     views: i64,
/// }
///
/// Post::TITLE.set(&mut model, &"Hello".to_owned())?;
/// let views: Option<i64> = Post::VIEWS.get(&model)?;
/// ```
pub struct TypedField<T> {
    name: &'static str,
    marker: PhantomData<fn() -> T>,
}

impl<T> TypedField<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            marker: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub fn unset(&self, model: &mut Model) -> OdmResult<()> {
        model.unset(self.name)
    }
}

impl<T: DeserializeOwned> TypedField<T> {
    pub fn get(&self, model: &Model) -> OdmResult<Option<T>> {
        model.get_as(self.name)
    }
}

impl<T: Serialize> TypedField<T> {
    pub fn set(&self, model: &mut Model, value: &T) -> OdmResult<()> {
        model.set_as(self.name, value)
    }
}

impl<T> Clone for TypedField<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TypedField<T> {}

impl<T> fmt::Debug for TypedField<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TypedField").field(&self.name).finish()
    }
}
