//! Conversion between native [`Value`]s and BSON wire values.
//!
//! Conversion is driven entirely by the [`FieldSpec`]: the same native value may
//! encode differently depending on the field it is assigned to (an integral
//! float stored in an int field, a hex string stored in an ObjectId field).

use bson::{Bson, Document, Uuid, doc, oid::ObjectId, spec::BinarySubtype};

use crate::{
    error::ValidationError,
    field::{FieldKind, FieldSpec, ReferenceMode, ScalarType},
    schema::{Schema, SchemaRegistry, Strictness},
    value::{Fields, LazyReference, ReferenceHandle, Value},
};

impl FieldSpec {
    /// Validates `value` completely and converts it to its wire form.
    ///
    /// # Errors
    ///
    /// Returns every validation failure found in `value`, keyed by path.
    pub fn to_wire(&self, value: &Value, registry: &SchemaRegistry) -> Result<Bson, ValidationError> {
        self.validate(value, registry)?;
        self.encode(value, self.name(), registry)
    }

    /// Converts a wire value to its native form.
    ///
    /// Conversion is strict: malformed data is an error. Tolerance for
    /// malformed stored data is applied by the document loader.
    pub fn from_wire(&self, wire: &Bson, registry: &SchemaRegistry) -> Result<Value, ValidationError> {
        self.decode(wire, self.name(), registry)
    }

    /// Converts `value` by type only, skipping constraint checks.
    ///
    /// Used for query and update operands, which may legitimately fall outside
    /// a field's allowed range.
    pub fn coerce(&self, value: &Value, registry: &SchemaRegistry) -> Result<Bson, ValidationError> {
        self.encode(value, self.name(), registry)
    }

    pub(crate) fn encode(
        &self,
        value: &Value,
        path: &str,
        registry: &SchemaRegistry,
    ) -> Result<Bson, ValidationError> {
        match (self.kind(), value) {
            (_, Value::Null) => Ok(Bson::Null),
            (FieldKind::Dynamic, value) => Ok(value.to_untyped_bson()),
            (_, Value::Dynamic(raw)) => Ok(raw.clone()),
            (FieldKind::Scalar(scalar), value) => {
                encode_scalar(*scalar, value).map_err(|reason| ValidationError::single(path, reason))
            }
            (FieldKind::Embedded { schema }, Value::Embedded(fields)) => {
                let schema = registry
                    .get(schema)
                    .map_err(|err| ValidationError::single(path, err.to_string()))?;

                encode_fields(schema, fields, path, registry).map(Bson::Document)
            }
            (FieldKind::List { element }, Value::List(items)) => {
                let mut errors = ValidationError::new();
                let mut encoded = Vec::with_capacity(items.len());

                for (index, item) in items.iter().enumerate() {
                    match element.encode(item, &join_path(path, &index.to_string()), registry) {
                        Ok(wire) => encoded.push(wire),
                        Err(err) => errors.merge(err),
                    }
                }

                errors.into_result().map(|_| Bson::Array(encoded))
            }
            (FieldKind::Map { element }, Value::Map(entries)) => {
                let mut errors = ValidationError::new();
                let mut encoded = Document::new();

                for (key, item) in entries {
                    match element.encode(item, &join_path(path, key), registry) {
                        Ok(wire) => {
                            encoded.insert(key.clone(), wire);
                        }
                        Err(err) => errors.merge(err),
                    }
                }

                errors.into_result().map(|_| Bson::Document(encoded))
            }
            (FieldKind::Reference { target, .. }, value) => encode_reference(target, value, registry)
                .map_err(|reason| ValidationError::single(path, reason)),
            (kind, value) => Err(ValidationError::single(
                path,
                mismatch(&kind.describe(), value.kind_name()),
            )),
        }
    }

    pub(crate) fn decode(
        &self,
        wire: &Bson,
        path: &str,
        registry: &SchemaRegistry,
    ) -> Result<Value, ValidationError> {
        match (self.kind(), wire) {
            (_, Bson::Null) => Ok(Value::Null),
            (FieldKind::Dynamic, wire) => Ok(Value::Dynamic(wire.clone())),
            (FieldKind::Scalar(scalar), wire) => {
                decode_scalar(*scalar, wire).map_err(|reason| ValidationError::single(path, reason))
            }
            (FieldKind::Embedded { schema }, Bson::Document(document)) => {
                let schema = registry
                    .get(schema)
                    .map_err(|err| ValidationError::single(path, err.to_string()))?;

                decode_fields(schema, document, path, registry).map(Value::Embedded)
            }
            (FieldKind::List { element }, Bson::Array(items)) => {
                let mut errors = ValidationError::new();
                let mut decoded = Vec::with_capacity(items.len());

                for (index, item) in items.iter().enumerate() {
                    match element.decode(item, &join_path(path, &index.to_string()), registry) {
                        Ok(value) => decoded.push(value),
                        Err(err) => errors.merge(err),
                    }
                }

                errors.into_result().map(|_| Value::List(decoded))
            }
            (FieldKind::Map { element }, Bson::Document(document)) => {
                let mut errors = ValidationError::new();
                let mut decoded = Fields::new();

                for (key, item) in document {
                    match element.decode(item, &join_path(path, key), registry) {
                        Ok(value) => {
                            decoded.insert(key.clone(), value);
                        }
                        Err(err) => errors.merge(err),
                    }
                }

                errors.into_result().map(|_| Value::Map(decoded))
            }
            (FieldKind::Reference { target, mode }, wire) => decode_reference(target, *mode, wire)
                .map_err(|reason| ValidationError::single(path, reason)),
            (kind, wire) => Err(ValidationError::single(
                path,
                mismatch(&kind.describe(), &wire_kind(wire)),
            )),
        }
    }
}

/// Encodes the attributes of an embedded object or document, keyed by wire name.
///
/// Attributes the schema does not declare are kept in untyped form unless the
/// schema is strict.
pub(crate) fn encode_fields(
    schema: &Schema,
    fields: &Fields,
    path: &str,
    registry: &SchemaRegistry,
) -> Result<Document, ValidationError> {
    let mut errors = ValidationError::new();
    let mut document = Document::new();

    for spec in schema.fields() {
        let Some(value) = fields.get(spec.name()) else {
            continue;
        };

        if spec.is_effectively_absent(value) {
            continue;
        }

        match spec.encode(value, &join_path(path, spec.name()), registry) {
            Ok(wire) => {
                document.insert(spec.wire_key(), wire);
            }
            Err(err) => errors.merge(err),
        }
    }

    for (name, value) in fields {
        if schema.field(name).is_some() {
            continue;
        }

        if schema.strictness() == Strictness::Strict {
            errors.add(join_path(path, name), "Unknown field");
        } else {
            document.insert(name.clone(), value.to_untyped_bson());
        }
    }

    errors.into_result().map(|_| document)
}

pub(crate) fn decode_fields(
    schema: &Schema,
    document: &Document,
    path: &str,
    registry: &SchemaRegistry,
) -> Result<Fields, ValidationError> {
    let mut errors = ValidationError::new();
    let mut fields = Fields::new();

    for (wire_name, wire) in document {
        match schema.field_by_wire(wire_name) {
            Some(spec) => match spec.decode(wire, &join_path(path, spec.name()), registry) {
                Ok(value) => {
                    fields.insert(spec.name().to_owned(), value);
                }
                Err(err) => errors.merge(err),
            },
            None if schema.strictness() == Strictness::Strict => {
                errors.add(join_path(path, wire_name), "Unknown field");
            }
            None => {
                fields.insert(wire_name.clone(), Value::Dynamic(wire.clone()));
            }
        }
    }

    errors.into_result().map(|_| fields)
}

fn encode_scalar(scalar: ScalarType, value: &Value) -> Result<Bson, String> {
    match (scalar, value) {
        (ScalarType::String | ScalarType::Email | ScalarType::Url, Value::String(s)) => {
            Ok(Bson::String(s.clone()))
        }
        (ScalarType::Int, Value::Int(i)) => Ok(int_bson(*i)),
        (ScalarType::Int, Value::Float(f))
            if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 =>
        {
            Ok(int_bson(*f as i64))
        }
        (ScalarType::Float, Value::Float(f)) => Ok(Bson::Double(*f)),
        (ScalarType::Float, Value::Int(i)) => Ok(Bson::Double(*i as f64)),
        (ScalarType::Bool, Value::Bool(b)) => Ok(Bson::Boolean(*b)),
        (ScalarType::DateTime, Value::DateTime(dt)) => {
            Ok(Bson::DateTime(bson::DateTime::from_chrono(*dt)))
        }
        (ScalarType::ObjectId, Value::ObjectId(oid)) => Ok(Bson::ObjectId(*oid)),
        (ScalarType::ObjectId, Value::String(s)) => ObjectId::parse_str(s)
            .map(Bson::ObjectId)
            .map_err(|_| format!("'{s}' is not a valid ObjectId")),
        (ScalarType::Uuid, Value::Uuid(uuid)) => Ok(Bson::from(*uuid)),
        (ScalarType::Uuid, Value::String(s)) => Uuid::parse_str(s)
            .map(Bson::from)
            .map_err(|_| format!("'{s}' is not a valid UUID")),
        (ScalarType::Binary, Value::Binary(bytes)) => Ok(Bson::Binary(bson::Binary {
            subtype: BinarySubtype::Generic,
            bytes: bytes.clone(),
        })),
        (ScalarType::Point, Value::List(items)) => {
            let (x, y) = point_coordinates(items)?;
            Ok(Bson::Document(doc! { "type": "Point", "coordinates": [x, y] }))
        }
        (scalar, value) => Err(mismatch(scalar.name(), value.kind_name())),
    }
}

fn decode_scalar(scalar: ScalarType, wire: &Bson) -> Result<Value, String> {
    match (scalar, wire) {
        (ScalarType::String | ScalarType::Email | ScalarType::Url, Bson::String(s)) => {
            Ok(Value::String(s.clone()))
        }
        (ScalarType::Int, Bson::Int32(i)) => Ok(Value::Int(i64::from(*i))),
        (ScalarType::Int, Bson::Int64(i)) => Ok(Value::Int(*i)),
        (ScalarType::Int, Bson::Double(f)) if f.fract() == 0.0 => Ok(Value::Int(*f as i64)),
        (ScalarType::Float, Bson::Double(f)) => Ok(Value::Float(*f)),
        (ScalarType::Float, Bson::Int32(i)) => Ok(Value::Float(f64::from(*i))),
        (ScalarType::Float, Bson::Int64(i)) => Ok(Value::Float(*i as f64)),
        (ScalarType::Bool, Bson::Boolean(b)) => Ok(Value::Bool(*b)),
        (ScalarType::DateTime, Bson::DateTime(dt)) => Ok(Value::DateTime(dt.to_chrono())),
        (ScalarType::ObjectId, Bson::ObjectId(oid)) => Ok(Value::ObjectId(*oid)),
        (ScalarType::Uuid, Bson::Binary(binary)) => binary
            .to_uuid()
            .map(Value::Uuid)
            .map_err(|err| format!("Invalid UUID: {err}")),
        (ScalarType::Binary, Bson::Binary(binary)) => Ok(Value::Binary(binary.bytes.clone())),
        (ScalarType::Point, Bson::Document(geo)) => {
            let coordinates = geo
                .get_array("coordinates")
                .map_err(|_| "GeoJSON point without coordinates".to_owned())?;

            decode_coordinates(coordinates)
        }
        (ScalarType::Point, Bson::Array(coordinates)) => decode_coordinates(coordinates),
        (scalar, wire) => Err(mismatch(scalar.name(), &wire_kind(wire))),
    }
}

fn encode_reference(target: &str, value: &Value, registry: &SchemaRegistry) -> Result<Bson, String> {
    let schema = registry.get(target).map_err(|err| err.to_string())?;
    let collection = schema.collection().unwrap_or(target);

    let id = match value {
        Value::Reference(handle) => handle
            .id()
            .ok_or_else(|| "Referenced document has no primary key".to_owned())?,
        Value::ObjectId(_) | Value::String(_) | Value::Int(_) | Value::Uuid(_) => match schema.primary_key() {
            Some(pk) => pk
                .encode(value, pk.name(), registry)
                .map_err(|err| err.to_string())?,
            None => value.to_untyped_bson(),
        },
        other => return Err(mismatch(&format!("reference to {target}"), other.kind_name())),
    };

    Ok(Bson::Document(doc! { "$ref": collection, "$id": id }))
}

fn decode_reference(target: &str, mode: ReferenceMode, wire: &Bson) -> Result<Value, String> {
    let id = match wire {
        Bson::Document(dbref) => dbref
            .get("$id")
            .cloned()
            .ok_or_else(|| "Expected a reference, found a document without $id".to_owned())?,
        Bson::Array(_) => return Err(mismatch(&format!("reference to {target}"), "array")),
        bare => bare.clone(),
    };

    let handle = match mode {
        ReferenceMode::Batched => ReferenceHandle::unresolved(target, id),
        ReferenceMode::Lazy => ReferenceHandle::Lazy(LazyReference::new(target, id)),
    };

    Ok(Value::Reference(handle))
}

pub(crate) fn point_coordinates(items: &[Value]) -> Result<(f64, f64), String> {
    match items {
        [x, y] => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => Ok((x, y)),
            _ => Err("Point coordinates must be numbers".to_owned()),
        },
        _ => Err("Point must have exactly two coordinates".to_owned()),
    }
}

fn decode_coordinates(coordinates: &[Bson]) -> Result<Value, String> {
    let numbers = coordinates
        .iter()
        .map(|c| match c {
            Bson::Double(f) => Ok(*f),
            Bson::Int32(i) => Ok(f64::from(*i)),
            Bson::Int64(i) => Ok(*i as f64),
            _ => Err("Point coordinates must be numbers".to_owned()),
        })
        .collect::<Result<Vec<_>, _>>()?;

    match numbers.as_slice() {
        [x, y] => Ok(Value::List(vec![Value::Float(*x), Value::Float(*y)])),
        _ => Err("Point must have exactly two coordinates".to_owned()),
    }
}

fn int_bson(value: i64) -> Bson {
    match i32::try_from(value) {
        Ok(small) => Bson::Int32(small),
        Err(_) => Bson::Int64(value),
    }
}

fn wire_kind(wire: &Bson) -> String {
    format!("{:?}", wire.element_type())
}

pub(crate) fn mismatch(expected: &str, found: &str) -> String {
    format!("Expected {expected}, got {found}")
}

/// Joins a parent path and a segment with a dot.
pub(crate) fn join_path(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_owned()
    } else {
        format!("{prefix}.{segment}")
    }
}
