//! Schemas and the schema registry.
//!
//! A [`Schema`] is the ordered list of [`FieldSpec`]s of one document or
//! embedded type, plus its collection and strictness. Schemas are assembled
//! with [`SchemaBuilder`], registered into a [`SchemaRegistry`], and never
//! change afterwards. Embedded and reference targets are named, not owned, so
//! mutually recursive schemas are declared without cycles in memory.
//!
//! # Examples
//!
//! ```ignore
//! use docmodel::{field::FieldSpec, schema::{Schema, SchemaRegistry}};
//!
//! let user = Schema::builder("User")
//!     .field(FieldSpec::string("name").required())
//!     .build()?;
//! let post = Schema::builder("Post")
//!     .collection("posts")
//!     .field(FieldSpec::reference("author", "User"))
//!     .build()?;
//!
//! let registry = SchemaRegistry::builder().register(user).register(post).build()?;
//! ```

use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, LazyLock},
};

use crate::{
    error::{OdmError, OdmResult},
    field::{FieldKind, FieldSpec},
};

static DYNAMIC_FIELD: LazyLock<FieldSpec> = LazyLock::new(|| FieldSpec::dynamic(""));

/// How attributes that the schema does not declare are treated on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Strictness {
    /// Unknown attributes are rejected.
    #[default]
    Strict,
    /// Unknown attributes are kept untouched and written back on full
    /// serialization.
    Retain,
    /// Unknown attributes become dynamic attributes, tracked like fields.
    Dynamic,
}

/// The declared shape of a document or embedded type.
#[derive(Debug, Clone)]
pub struct Schema {
    name: String,
    collection: Option<String>,
    strictness: Strictness,
    parent: Option<String>,
    fields: Vec<FieldSpec>,
    by_name: HashMap<String, usize>,
    by_wire: HashMap<String, usize>,
    primary_key: Option<usize>,
}

impl Schema {
    /// Starts a document schema. The collection defaults to the snake-cased name.
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder::new(name.into(), false)
    }

    /// Starts an embedded schema: no collection and no primary key.
    pub fn embedded(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder::new(name.into(), true)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Collection of a document schema; `None` for embedded schemas.
    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    /// Collection of a document schema.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::SchemaDefinition`] for embedded schemas.
    pub fn collection_name(&self) -> OdmResult<&str> {
        self.collection().ok_or_else(|| OdmError::SchemaDefinition {
            schema: self.name.clone(),
            reason: "embedded schemas have no collection".to_owned(),
        })
    }

    pub fn strictness(&self) -> Strictness {
        self.strictness
    }

    /// Name of the schema this one extends.
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn is_embedded(&self) -> bool {
        self.collection.is_none()
    }

    /// Field specs in declaration order, inherited fields first.
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.by_name.get(name).map(|index| &self.fields[*index])
    }

    pub fn field_by_wire(&self, wire_name: &str) -> Option<&FieldSpec> {
        self.by_wire.get(wire_name).map(|index| &self.fields[*index])
    }

    pub fn primary_key(&self) -> Option<&FieldSpec> {
        self.primary_key.map(|index| &self.fields[index])
    }

    /// Looks up a top-level field, accepting `pk` as an alias for the primary key.
    pub fn lookup(&self, name: &str) -> Option<&FieldSpec> {
        match name {
            "pk" => self.primary_key().or_else(|| self.field(name)),
            _ => self.field(name),
        }
    }

    /// The compound unique constraints declared by the fields: each entry lists
    /// the wire names that must be unique together.
    pub fn unique_constraints(&self) -> Vec<Vec<String>> {
        self.fields
            .iter()
            .filter(|spec| spec.is_unique())
            .map(|spec| {
                std::iter::once(spec.wire_key().to_owned())
                    .chain(spec.unique_with_fields().iter().map(|name| {
                        self.field(name)
                            .map_or_else(|| name.clone(), |f| f.wire_key().to_owned())
                    }))
                    .collect()
            })
            .collect()
    }

    /// Resolves a dotted attribute path to its wire path and terminal spec.
    ///
    /// The walk descends into embedded objects, list elements (numeric segments
    /// address positions) and map values. A reference may only be crossed
    /// towards the target's primary key, which resolves to `<field>.$id`.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::InvalidQuery`] for unknown segments, traversal into
    /// scalars, and any other path beyond a reference.
    pub fn resolve_path<'r>(&'r self, registry: &'r SchemaRegistry, path: &str) -> OdmResult<ResolvedPath<'r>> {
        let segments: Vec<&str> = path.split('.').collect();
        let invalid = |reason: String| OdmError::invalid_query(path, "resolve", reason);

        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(invalid("empty path segment".to_owned()));
        }

        let mut wire_path: Vec<String> = Vec::with_capacity(segments.len());
        let mut schema = self;
        let mut current: Option<&'r FieldSpec> = None;
        let mut crosses_reference = false;
        let mut index = 0;

        while index < segments.len() {
            let segment = segments[index];

            let Some(spec) = current else {
                let spec = match schema.lookup(segment) {
                    Some(spec) => spec,
                    None if schema.strictness == Strictness::Dynamic => &*DYNAMIC_FIELD,
                    None => {
                        return Err(invalid(format!(
                            "'{segment}' is not a field of {}",
                            schema.name
                        )));
                    }
                };

                wire_path.push(match spec.kind() {
                    FieldKind::Dynamic if spec.name().is_empty() => segment.to_owned(),
                    _ => spec.wire_key().to_owned(),
                });
                current = Some(spec);
                index += 1;
                continue;
            };

            match spec.kind() {
                FieldKind::Embedded { schema: target } => {
                    schema = registry.get(target)?.as_ref();
                    current = None;
                }
                FieldKind::List { element } => {
                    if segment.parse::<usize>().is_ok() {
                        wire_path.push(segment.to_owned());
                        index += 1;
                    }
                    current = Some(&**element);
                }
                FieldKind::Map { element } => {
                    wire_path.push(segment.to_owned());
                    current = Some(&**element);
                    index += 1;
                }
                FieldKind::Reference { target, .. } => {
                    let target_schema = registry.get(target)?;
                    let pk = target_schema
                        .primary_key()
                        .filter(|pk| segment == "pk" || segment == pk.name() || segment == pk.wire_key())
                        .ok_or_else(|| {
                            invalid(format!(
                                "cannot query '{segment}' across reference to {target}; only its primary key is addressable"
                            ))
                        })?;

                    wire_path.push("$id".to_owned());
                    current = Some(pk);
                    crosses_reference = true;
                    index += 1;
                }
                FieldKind::Dynamic => {
                    wire_path.push(segment.to_owned());
                    index += 1;
                }
                FieldKind::Scalar(scalar) => {
                    return Err(invalid(format!(
                        "cannot traverse into {} field '{}'",
                        scalar.name(),
                        spec.name()
                    )));
                }
            }
        }

        let spec = current.ok_or_else(|| invalid("path ends inside an embedded object".to_owned()))?;

        Ok(ResolvedPath {
            wire_path: wire_path.join("."),
            spec,
            crosses_reference,
        })
    }
}

/// Result of resolving an attribute path.
#[derive(Debug, Clone)]
pub struct ResolvedPath<'r> {
    /// Dotted path using wire names.
    pub wire_path: String,
    /// Spec of the last segment; drives operand conversion.
    pub spec: &'r FieldSpec,
    /// `true` when the path addresses a referenced document's primary key.
    pub crosses_reference: bool,
}

/// Builder for [`Schema`].
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    name: String,
    embedded: bool,
    collection: Option<String>,
    strictness: Option<Strictness>,
    parent: Option<Schema>,
    fields: Vec<FieldSpec>,
}

impl SchemaBuilder {
    fn new(name: String, embedded: bool) -> Self {
        Self {
            name,
            embedded,
            collection: None,
            strictness: None,
            parent: None,
            fields: Vec::new(),
        }
    }

    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    pub fn strictness(mut self, strictness: Strictness) -> Self {
        self.strictness = Some(strictness);
        self
    }

    /// Inherits every field of `parent`, along with its collection and
    /// strictness unless this builder overrides them.
    pub fn extends(mut self, parent: &Schema) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    /// Builds the schema.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::SchemaDefinition`] when names or wire names repeat,
    /// a name is malformed, a field carries an invalid definition, an
    /// embedded schema declares a primary key, or more than one primary key
    /// is declared.
    pub fn build(self) -> OdmResult<Schema> {
        let definition_error = |reason: String| OdmError::SchemaDefinition {
            schema: self.name.clone(),
            reason,
        };

        if self.name.is_empty() {
            return Err(definition_error("schema name must not be empty".to_owned()));
        }

        let (mut fields, inherited_collection, inherited_strictness, parent) = match &self.parent {
            Some(parent) => (
                parent.fields.clone(),
                parent.collection.clone(),
                Some(parent.strictness),
                Some(parent.name.clone()),
            ),
            None => (Vec::new(), None, None, None),
        };

        let inherited = fields.len();
        fields.extend(self.fields.iter().cloned());

        for spec in &fields[inherited..] {
            if fields[..inherited].iter().any(|f| f.name() == spec.name()) {
                return Err(definition_error(format!(
                    "field '{}' redefines an inherited field",
                    spec.name()
                )));
            }
        }

        let declares_pk = fields.iter().any(FieldSpec::is_primary_key);

        if self.embedded && declares_pk {
            return Err(definition_error("embedded schemas cannot declare a primary key".to_owned()));
        }

        if !self.embedded && !declares_pk {
            fields.insert(0, FieldSpec::implicit_id());
        }

        let mut by_name = HashMap::with_capacity(fields.len());
        let mut by_wire = HashMap::with_capacity(fields.len());
        let mut primary_key = None;

        for (index, spec) in fields.iter().enumerate() {
            if spec.name().is_empty() || spec.name().contains('.') {
                return Err(definition_error(format!("invalid field name '{}'", spec.name())));
            }

            if spec.wire_key().is_empty() || spec.wire_key().contains('.') || spec.wire_key().starts_with('$') {
                return Err(definition_error(format!("invalid wire name '{}'", spec.wire_key())));
            }

            if let Some(reason) = spec.definition_error() {
                return Err(definition_error(reason.to_owned()));
            }

            if by_name.insert(spec.name().to_owned(), index).is_some() {
                return Err(definition_error(format!("duplicate field name '{}'", spec.name())));
            }

            if by_wire.insert(spec.wire_key().to_owned(), index).is_some() {
                return Err(definition_error(format!("duplicate wire name '{}'", spec.wire_key())));
            }

            if spec.is_primary_key() && primary_key.replace(index).is_some() {
                return Err(definition_error("more than one primary key declared".to_owned()));
            }
        }

        let collection = if self.embedded {
            None
        } else {
            Some(
                self.collection
                    .or(inherited_collection)
                    .unwrap_or_else(|| default_collection_name(&self.name)),
            )
        };

        Ok(Schema {
            strictness: self.strictness.or(inherited_strictness).unwrap_or_default(),
            name: self.name,
            collection,
            parent,
            fields,
            by_name,
            by_wire,
            primary_key,
        })
    }
}

/// `BlogPost` → `blog_post`.
fn default_collection_name(name: &str) -> String {
    let mut collection = String::with_capacity(name.len() + 4);

    for (index, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if index > 0 {
                collection.push('_');
            }
            collection.extend(ch.to_lowercase());
        } else {
            collection.push(ch);
        }
    }

    collection
}

/// All schemas known to a context, keyed by name.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Arc<Schema>>,
}

impl SchemaRegistry {
    pub fn builder() -> SchemaRegistryBuilder {
        SchemaRegistryBuilder::default()
    }

    /// Looks up a schema by name.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::UnknownSchema`] if no schema has this name.
    pub fn get(&self, name: &str) -> OdmResult<&Arc<Schema>> {
        self.schemas
            .get(name)
            .ok_or_else(|| OdmError::UnknownSchema(name.to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    /// Returns `true` if `schema` is `ancestor` or extends it, directly or not.
    pub fn is_same_or_subtype(&self, schema: &str, ancestor: &str) -> bool {
        let mut current = Some(schema);

        while let Some(name) = current {
            if name == ancestor {
                return true;
            }
            current = self.schemas.get(name).and_then(|s| s.parent());
        }

        false
    }
}

/// Builder for [`SchemaRegistry`].
#[derive(Debug, Default)]
pub struct SchemaRegistryBuilder {
    schemas: Vec<Schema>,
}

impl SchemaRegistryBuilder {
    pub fn register(mut self, schema: Schema) -> Self {
        self.schemas.push(schema);
        self
    }

    /// Builds the registry and checks cross-schema links.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::SchemaDefinition`] if a name is registered twice, an
    /// embedded field names a schema that is missing or not embedded, or a
    /// reference names a schema that is missing or embedded.
    pub fn build(self) -> OdmResult<Arc<SchemaRegistry>> {
        let mut schemas = HashMap::with_capacity(self.schemas.len());

        for schema in self.schemas {
            let name = schema.name.clone();

            if schemas.insert(name.clone(), Arc::new(schema)).is_some() {
                return Err(OdmError::SchemaDefinition {
                    schema: name,
                    reason: "registered more than once".to_owned(),
                });
            }
        }

        let registry = SchemaRegistry { schemas };

        for schema in registry.schemas.values() {
            for spec in &schema.fields {
                check_links(&registry, schema, spec)?;
            }
        }

        Ok(Arc::new(registry))
    }
}

fn check_links(registry: &SchemaRegistry, schema: &Schema, spec: &FieldSpec) -> OdmResult<()> {
    let broken = |reason: String| OdmError::SchemaDefinition {
        schema: schema.name.clone(),
        reason: format!("field '{}': {reason}", spec.name()),
    };

    match spec.kind() {
        FieldKind::Embedded { schema: target } => match registry.schemas.get(target) {
            Some(target) if target.is_embedded() => Ok(()),
            Some(_) => Err(broken(format!("{target} is not an embedded schema"))),
            None => Err(broken(format!("embedded schema {target} is not registered"))),
        },
        FieldKind::Reference { target, .. } => match registry.schemas.get(target) {
            Some(target) if !target.is_embedded() => Ok(()),
            Some(_) => Err(broken(format!("cannot reference embedded schema {target}"))),
            None => Err(broken(format!("referenced schema {target} is not registered"))),
        },
        FieldKind::List { element } | FieldKind::Map { element } => check_links(registry, schema, element),
        FieldKind::Scalar(_) | FieldKind::Dynamic => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<SchemaRegistry> {
        let address = Schema::embedded("Address")
            .field(FieldSpec::string("city").wire_name("c"))
            .build()
            .expect("address");
        let user = Schema::builder("User")
            .field(FieldSpec::string("name"))
            .field(FieldSpec::embedded("address", "Address"))
            .build()
            .expect("user");
        let post = Schema::builder("BlogPost")
            .field(FieldSpec::reference("author", "User"))
            .field(FieldSpec::list("tags", FieldSpec::string("tag")))
            .field(FieldSpec::list("addresses", FieldSpec::embedded("address", "Address")))
            .field(FieldSpec::map("scores", FieldSpec::int("score")))
            .build()
            .expect("post");

        SchemaRegistry::builder()
            .register(address)
            .register(user)
            .register(post)
            .build()
            .expect("registry")
    }

    #[test]
    fn test_implicit_primary_key() {
        let registry = registry();
        let user = registry.get("User").expect("user");

        let pk = user.primary_key().expect("implicit pk");
        assert_eq!(pk.name(), "id");
        assert_eq!(pk.wire_key(), "_id");
        assert_eq!(user.fields()[0].name(), "id");
        assert_eq!(user.collection(), Some("user"));
    }

    #[test]
    fn test_default_collection_name_is_snake_case() {
        let registry = registry();
        assert_eq!(registry.get("BlogPost").expect("post").collection(), Some("blog_post"));
    }

    #[test]
    fn test_duplicate_wire_names_rejected() {
        let result = Schema::builder("Bad")
            .field(FieldSpec::string("a").wire_name("x"))
            .field(FieldSpec::string("b").wire_name("x"))
            .build();

        assert!(matches!(result, Err(OdmError::SchemaDefinition { .. })));
    }

    #[test]
    fn test_unregistered_reference_rejected() {
        let post = Schema::builder("Post")
            .field(FieldSpec::reference("author", "Ghost"))
            .build()
            .expect("post");

        assert!(SchemaRegistry::builder().register(post).build().is_err());
    }

    #[test]
    fn test_inheritance_concatenates_fields() {
        let base = Schema::builder("Animal")
            .collection("animals")
            .field(FieldSpec::string("name"))
            .build()
            .expect("base");
        let dog = Schema::builder("Dog")
            .extends(&base)
            .field(FieldSpec::bool("good"))
            .build()
            .expect("dog");

        let names: Vec<&str> = dog.fields().iter().map(FieldSpec::name).collect();
        assert_eq!(names, vec!["id", "name", "good"]);
        assert_eq!(dog.collection(), Some("animals"));
        assert_eq!(dog.parent(), Some("Animal"));

        let clash = Schema::builder("Cat")
            .extends(&base)
            .field(FieldSpec::int("name"))
            .build();
        assert!(clash.is_err());
    }

    #[test]
    fn test_resolve_paths() {
        let registry = registry();
        let user = registry.get("User").expect("user");
        let post = registry.get("BlogPost").expect("post");

        assert_eq!(user.resolve_path(&registry, "address.city").expect("city").wire_path, "address.c");
        assert_eq!(user.resolve_path(&registry, "pk").expect("pk").wire_path, "_id");
        assert_eq!(post.resolve_path(&registry, "addresses.city").expect("element").wire_path, "addresses.c");
        assert_eq!(post.resolve_path(&registry, "addresses.0.city").expect("positional").wire_path, "addresses.0.c");
        assert_eq!(post.resolve_path(&registry, "scores.math").expect("map").wire_path, "scores.math");

        let by_id = post.resolve_path(&registry, "author.id").expect("reference pk");
        assert_eq!(by_id.wire_path, "author.$id");
        assert!(by_id.crosses_reference);

        assert!(post.resolve_path(&registry, "author.name").is_err());
        assert!(post.resolve_path(&registry, "missing").is_err());
        assert!(post.resolve_path(&registry, "tags.length.x").is_err());
    }
}
