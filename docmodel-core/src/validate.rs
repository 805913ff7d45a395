//! Total validation of native values against field specifications.
//!
//! Validation never short-circuits: every violation below the validated value
//! is collected into one [`ValidationError`], keyed by dotted path.

use regex::Regex;
use std::{collections::BTreeSet, sync::LazyLock};

use crate::{
    convert::{join_path, mismatch, point_coordinates},
    error::ValidationError,
    field::{FieldKind, FieldSpec, ScalarType},
    schema::{Schema, SchemaRegistry, Strictness},
    value::{Fields, ReferenceHandle, Value},
};

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid regex")
});

static URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(https?|ftp)://[^\s/$.?#][^\s]*$").expect("valid regex")
});

impl FieldSpec {
    /// Validates `value` against this spec.
    ///
    /// Null stands for an absent value: it only fails when the field is
    /// required.
    ///
    /// # Errors
    ///
    /// Returns all violations, keyed by path (the field name, extended with
    /// list indexes, map keys and embedded attribute names).
    pub fn validate(&self, value: &Value, registry: &SchemaRegistry) -> Result<(), ValidationError> {
        let mut errors = ValidationError::new();
        self.validate_into(value, self.name(), registry, &mut errors);
        errors.into_result()
    }

    pub(crate) fn validate_into(
        &self,
        value: &Value,
        path: &str,
        registry: &SchemaRegistry,
        errors: &mut ValidationError,
    ) {
        if value.is_null() {
            if self.is_required() {
                errors.add(path, "Field is required");
            }
            return;
        }

        if let (Value::Dynamic(raw), false) = (value, matches!(self.kind(), FieldKind::Dynamic)) {
            match self.decode(raw, path, registry) {
                Ok(decoded) => self.validate_into(&decoded, path, registry, errors),
                Err(err) => errors.merge(err),
            }
            return;
        }

        if let Some(choices) = self.choice_values() {
            if !choices.contains(value) {
                errors.add(path, format!("Value must be one of {}", describe_choices(choices)));
                return;
            }
        }

        let before = errors.len();

        match self.kind() {
            FieldKind::Scalar(scalar) => self.validate_scalar(*scalar, value, path, errors),
            FieldKind::Embedded { schema } => match (registry.get(schema), value) {
                (Ok(schema), Value::Embedded(fields)) => {
                    validate_fields(schema, fields, None, path, registry, errors)
                }
                (Err(err), _) => errors.add(path, err.to_string()),
                (_, other) => errors.add(path, mismatch(&format!("embedded {schema}"), other.kind_name())),
            },
            FieldKind::List { element } => match value {
                Value::List(items) => {
                    self.check_length(items.len(), path, errors);

                    for (index, item) in items.iter().enumerate() {
                        element.validate_into(item, &join_path(path, &index.to_string()), registry, errors);
                    }
                }
                other => errors.add(path, mismatch("list", other.kind_name())),
            },
            FieldKind::Map { element } => match value {
                Value::Map(entries) => {
                    for (key, item) in entries {
                        element.validate_into(item, &join_path(path, key), registry, errors);
                    }
                }
                other => errors.add(path, mismatch("map", other.kind_name())),
            },
            FieldKind::Reference { target, .. } => validate_reference(target, value, path, registry, errors),
            FieldKind::Dynamic => {}
        }

        if errors.len() > before {
            return;
        }

        for validator in self.validators() {
            if let Err(reason) = validator.check(value) {
                errors.add(path, reason);
            }
        }
    }

    fn validate_scalar(&self, scalar: ScalarType, value: &Value, path: &str, errors: &mut ValidationError) {
        let constraints = self.constraints();

        match (scalar, value) {
            (ScalarType::String | ScalarType::Email | ScalarType::Url, Value::String(s)) => {
                self.check_length(s.chars().count(), path, errors);

                if let Some(pattern) = &constraints.pattern {
                    if !pattern.is_match(s) {
                        errors.add(path, format!("Value does not match pattern {}", pattern.as_str()));
                    }
                }

                if scalar == ScalarType::Email && !EMAIL.is_match(s) {
                    errors.add(path, format!("Invalid email address: {s}"));
                }

                if scalar == ScalarType::Url && !URL.is_match(s) {
                    errors.add(path, format!("Invalid URL: {s}"));
                }
            }
            (ScalarType::Int, Value::Int(_))
            | (ScalarType::Float, Value::Float(_) | Value::Int(_)) => {
                self.check_range(value.as_f64().unwrap_or_default(), path, errors);
            }
            (ScalarType::Int, Value::Float(f)) if f.fract() == 0.0 => self.check_range(*f, path, errors),
            (ScalarType::Bool, Value::Bool(_))
            | (ScalarType::DateTime, Value::DateTime(_))
            | (ScalarType::ObjectId, Value::ObjectId(_))
            | (ScalarType::Uuid, Value::Uuid(_)) => {}
            (ScalarType::ObjectId, Value::String(s)) => {
                if bson::oid::ObjectId::parse_str(s).is_err() {
                    errors.add(path, format!("'{s}' is not a valid ObjectId"));
                }
            }
            (ScalarType::Uuid, Value::String(s)) => {
                if bson::Uuid::parse_str(s).is_err() {
                    errors.add(path, format!("'{s}' is not a valid UUID"));
                }
            }
            (ScalarType::Binary, Value::Binary(bytes)) => self.check_length(bytes.len(), path, errors),
            (ScalarType::Point, Value::List(items)) => match point_coordinates(items) {
                Ok((lng, lat)) => {
                    if !(-180.0..=180.0).contains(&lng) || !(-90.0..=90.0).contains(&lat) {
                        errors.add(path, "Point coordinates are out of range");
                    }
                }
                Err(reason) => errors.add(path, reason),
            },
            (scalar, value) => errors.add(path, mismatch(scalar.name(), value.kind_name())),
        }
    }

    fn check_range(&self, number: f64, path: &str, errors: &mut ValidationError) {
        let constraints = self.constraints();

        if let Some(min) = constraints.min_value {
            if number < min {
                errors.add(path, format!("Value {number} is less than minimum {min}"));
            }
        }

        if let Some(max) = constraints.max_value {
            if number > max {
                errors.add(path, format!("Value {number} is greater than maximum {max}"));
            }
        }
    }

    fn check_length(&self, length: usize, path: &str, errors: &mut ValidationError) {
        let constraints = self.constraints();

        if let Some(min) = constraints.min_length {
            if length < min {
                errors.add(path, format!("Length {length} is shorter than minimum {min}"));
            }
        }

        if let Some(max) = constraints.max_length {
            if length > max {
                errors.add(path, format!("Length {length} is longer than maximum {max}"));
            }
        }
    }
}

/// Validates a set of attributes against `schema`.
///
/// When `loaded` is given, only the listed attribute paths are checked, so a
/// partially loaded document is never rejected for attributes it did not load.
/// A dotted path such as `address.zip` restricts the embedded object to the
/// listed members.
pub(crate) fn validate_fields(
    schema: &Schema,
    fields: &Fields,
    loaded: Option<&BTreeSet<String>>,
    path: &str,
    registry: &SchemaRegistry,
    errors: &mut ValidationError,
) {
    for spec in schema.fields() {
        let name = spec.name();
        let value = fields.get(name).unwrap_or(&Value::Null);
        let field_path = join_path(path, name);

        let Some(loaded) = loaded.filter(|loaded| !loaded.contains(name)) else {
            spec.validate_into(value, &field_path, registry, errors);
            continue;
        };

        let nested: BTreeSet<String> = loaded
            .iter()
            .filter_map(|loaded| loaded.strip_prefix(name)?.strip_prefix('.'))
            .map(str::to_owned)
            .collect();

        if nested.is_empty() {
            continue;
        }

        if let (FieldKind::Embedded { schema: target }, Value::Embedded(inner)) = (spec.kind(), value) {
            if let Ok(target) = registry.get(target) {
                validate_fields(target, inner, Some(&nested), &field_path, registry, errors);
            }
        }
    }

    if schema.strictness() == Strictness::Strict {
        for name in fields.keys().filter(|name| schema.field(name).is_none()) {
            errors.add(join_path(path, name), "Unknown field");
        }
    }
}

fn validate_reference(
    target: &str,
    value: &Value,
    path: &str,
    registry: &SchemaRegistry,
    errors: &mut ValidationError,
) {
    match value {
        Value::Reference(handle) => {
            if !registry.is_same_or_subtype(handle.schema_name(), target) {
                errors.add(
                    path,
                    format!("Expected a reference to {target}, got {}", handle.schema_name()),
                );
            }

            if let ReferenceHandle::Resolved(model) = handle {
                if model.id().is_none() {
                    errors.add(path, "Referenced document has no primary key");
                }
            }
        }
        Value::ObjectId(_) | Value::String(_) | Value::Int(_) | Value::Uuid(_) => {}
        other => errors.add(path, mismatch(&format!("reference to {target}"), other.kind_name())),
    }
}

fn describe_choices(choices: &[Value]) -> String {
    let rendered: Vec<String> = choices
        .iter()
        .map(|choice| choice.to_untyped_bson().to_string())
        .collect();

    format!("[{}]", rendered.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn registry() -> Arc<SchemaRegistry> {
        let address = Schema::embedded("Address")
            .field(FieldSpec::string("city").required())
            .field(FieldSpec::string("zip").pattern(r"^\d{5}$"))
            .build()
            .expect("address schema");

        SchemaRegistry::builder()
            .register(address)
            .build()
            .expect("registry")
    }

    #[test]
    fn test_required_null_fails() {
        let registry = registry();
        let spec = FieldSpec::string("name").required();

        let err = spec.validate(&Value::Null, &registry).expect_err("required");
        assert_eq!(err.get("name"), Some("Field is required"));
        assert!(FieldSpec::string("name").validate(&Value::Null, &registry).is_ok());
    }

    #[test]
    fn test_errors_accumulate_across_elements() {
        let registry = registry();
        let spec = FieldSpec::list("tags", FieldSpec::string("tag").max_length(3));
        let value = Value::from(vec!["ok", "too long", "fine?"]);

        let err = spec.validate(&value, &registry).expect_err("two long tags");
        assert_eq!(err.len(), 2);
        assert!(err.get("tags.1").is_some());
        assert!(err.get("tags.2").is_some());
    }

    #[test]
    fn test_embedded_errors_are_prefixed() {
        let registry = registry();
        let spec = FieldSpec::embedded("address", "Address");
        let value = Value::embedded([("zip", "abc")]);

        let err = spec.validate(&value, &registry).expect_err("invalid address");
        assert_eq!(err.get("address.city"), Some("Field is required"));
        assert!(err.get("address.zip").is_some());
    }

    #[test]
    fn test_choices_and_ranges() {
        let registry = registry();
        let status = FieldSpec::string("status").choices(["draft", "published"]);
        assert!(status.validate(&Value::from("draft"), &registry).is_ok());
        assert!(status.validate(&Value::from("deleted"), &registry).is_err());

        let age = FieldSpec::int("age").min_value(0).max_value(150);
        assert!(age.validate(&Value::Int(30), &registry).is_ok());
        assert!(age.validate(&Value::Int(-1), &registry).is_err());
        assert!(age.validate(&Value::Int(151), &registry).is_err());

        assert!(age.validate(&Value::Float(42.0), &registry).is_ok());
        assert!(age.validate(&Value::Float(500.0), &registry).is_err());
        assert!(age.validate(&Value::Float(-3.0), &registry).is_err());
        assert!(age.to_wire(&Value::Float(500.0), &registry).is_err());
    }

    #[test]
    fn test_partially_loaded_embedded_checks_loaded_members() {
        let address = Schema::embedded("Address")
            .field(FieldSpec::string("city").required())
            .field(FieldSpec::string("zip").pattern(r"^\d{5}$"))
            .build()
            .expect("address schema");
        let user = Schema::builder("User")
            .field(FieldSpec::string("name").required())
            .field(FieldSpec::embedded("address", "Address"))
            .build()
            .expect("user schema");
        let registry = SchemaRegistry::builder()
            .register(address)
            .register(user)
            .build()
            .expect("registry");
        let user = registry.get("User").expect("user");

        let mut fields = Fields::new();
        fields.insert("address".into(), Value::embedded([("zip", "75001")]));

        let loaded = BTreeSet::from(["address.zip".to_owned()]);
        let mut errors = ValidationError::new();
        validate_fields(user, &fields, Some(&loaded), "", &registry, &mut errors);
        assert!(errors.is_empty());

        fields.insert("address".into(), Value::embedded([("zip", "750")]));
        let mut errors = ValidationError::new();
        validate_fields(user, &fields, Some(&loaded), "", &registry, &mut errors);
        assert!(errors.get("address.zip").is_some());
        assert!(errors.get("address.city").is_none());

        let mut errors = ValidationError::new();
        validate_fields(user, &fields, None, "", &registry, &mut errors);
        assert_eq!(errors.get("address.city"), Some("Field is required"));
        assert_eq!(errors.get("name"), Some("Field is required"));
    }

    #[test]
    fn test_email_and_url() {
        let registry = registry();
        assert!(FieldSpec::email("e").validate(&Value::from("a@b.io"), &registry).is_ok());
        assert!(FieldSpec::email("e").validate(&Value::from("nope"), &registry).is_err());
        assert!(FieldSpec::url("u").validate(&Value::from("https://x.org/a"), &registry).is_ok());
        assert!(FieldSpec::url("u").validate(&Value::from("x.org"), &registry).is_err());
    }

    #[test]
    fn test_custom_validator_runs_after_type_checks() {
        let registry = registry();
        let spec = FieldSpec::int("even").validator(|value| match value.as_i64() {
            Some(n) if n % 2 == 0 => Ok(()),
            _ => Err("must be even".to_owned()),
        });

        assert!(spec.validate(&Value::Int(4), &registry).is_ok());
        assert_eq!(
            spec.validate(&Value::Int(3), &registry)
                .expect_err("odd")
                .get("even"),
            Some("must be even")
        );
        assert_eq!(
            spec.validate(&Value::from("x"), &registry)
                .expect_err("wrong type")
                .get("even"),
            Some("Expected int, got string")
        );
    }
}
