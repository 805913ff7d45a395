//! Minimal update computation.
//!
//! For every changed path (minus paths covered by a changed ancestor) the
//! current and original values are compared in wire form:
//!
//! | current            | original | result                    |
//! |--------------------|----------|---------------------------|
//! | present            | absent   | `$set`                    |
//! | absent             | present  | `$unset: {path: ""}`      |
//! | present            | present  | `$set` unless wire-equal  |
//!
//! Null on a non-nullable field counts as absent.

use bson::{Bson, Document, doc};
use tracing::trace;

use crate::{
    document::{Model, lookup_path},
    error::OdmResult,
};

/// A `$set`/`$unset` pair keyed by dotted wire paths.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    set: Document,
    unset: Document,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    pub fn set(&self) -> &Document {
        &self.set
    }

    pub fn unset(&self) -> &Document {
        &self.unset
    }

    /// The update document: `{"$set": ..., "$unset": ...}`, omitting empty parts.
    pub fn to_update_document(&self) -> Document {
        let mut update = Document::new();

        if !self.set.is_empty() {
            update.insert("$set", self.set.clone());
        }

        if !self.unset.is_empty() {
            update.insert("$unset", self.unset.clone());
        }

        update
    }
}

pub(crate) fn compute(model: &Model) -> OdmResult<Delta> {
    let schema = model.schema();
    let registry = model.registry();
    let state = model.state();
    let mut delta = Delta::default();

    for path in state.effective_changes() {
        let resolved = schema.resolve_path(registry, path)?;
        let spec = resolved.spec;

        let current = lookup_path(state.current(), path).filter(|v| !spec.is_effectively_absent(v));
        let original = lookup_path(state.original(), path).filter(|v| !spec.is_effectively_absent(v));

        match (current, original) {
            (None, None) => {
                trace!(path, "Absent before and after, skipping");
            }
            (None, Some(_)) => {
                trace!(path, "Removed");
                delta.unset.insert(resolved.wire_path, "");
            }
            (Some(current), original) => {
                let wire = spec.encode(current, path, registry)?;

                if !state.is_new() {
                    if let Some(original) = original {
                        if spec.encode(original, path, registry).ok().as_ref() == Some(&wire) {
                            trace!(path, "Unchanged in wire form, skipping");
                            continue;
                        }
                    }
                }

                trace!(path, "Changed");
                delta.set.insert(resolved.wire_path, wire);
            }
        }
    }

    Ok(delta)
}

/// Combines an identity filter with an optional condition filter.
pub(crate) fn and_filters(base: Document, extra: Document) -> Document {
    if extra.is_empty() {
        return base;
    }

    if extra.keys().all(|key| !base.contains_key(key)) {
        let mut merged = base;
        for (key, value) in extra {
            merged.insert(key, value);
        }
        return merged;
    }

    doc! { "$and": [Bson::Document(base), Bson::Document(extra)] }
}
