//! Per-document change tracking.

use std::collections::BTreeSet;

use crate::value::{Fields, Value};

/// Current and original attribute values of one document, plus the dotted
/// paths changed since it was loaded or last saved.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentState {
    current: Fields,
    original: Fields,
    changed: BTreeSet<String>,
    is_new: bool,
    loaded: Option<BTreeSet<String>>,
}

impl Default for DocumentState {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentState {
    /// State of a document that has never been stored.
    pub fn new() -> Self {
        Self {
            current: Fields::new(),
            original: Fields::new(),
            changed: BTreeSet::new(),
            is_new: true,
            loaded: None,
        }
    }

    /// State of a document loaded from the store. `loaded` lists the attributes
    /// a projection fetched; `None` means the document is complete.
    pub fn loaded(values: Fields, loaded: Option<BTreeSet<String>>) -> Self {
        Self {
            original: values.clone(),
            current: values,
            changed: BTreeSet::new(),
            is_new: false,
            loaded,
        }
    }

    pub fn current(&self) -> &Fields {
        &self.current
    }

    pub fn original(&self) -> &Fields {
        &self.original
    }

    pub fn changed_paths(&self) -> &BTreeSet<String> {
        &self.changed
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn loaded_fields(&self) -> Option<&BTreeSet<String>> {
        self.loaded.as_ref()
    }

    /// Returns `true` if the attribute was fetched, in whole or in part.
    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.as_ref().is_none_or(|loaded| {
            loaded.contains(name)
                || loaded
                    .iter()
                    .any(|path| path.strip_prefix(name).is_some_and(|rest| rest.starts_with('.')))
        })
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.current.get(name)
    }

    /// Replaces an attribute and records it as changed.
    pub fn set(&mut self, name: &str, value: Value) {
        self.current.insert(name.to_owned(), value);
        self.mark_changed(name);
    }

    /// Removes an attribute and records it as changed.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let previous = self.current.remove(name);
        self.mark_changed(name);
        previous
    }

    /// Mutable access to an attribute. The attribute is recorded as changed
    /// whether or not the caller modifies it.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        if self.current.contains_key(name) {
            self.mark_changed(name);
        }
        self.current.get_mut(name)
    }

    /// Records `path` as changed. A path touched on a partially loaded
    /// document counts as loaded from then on.
    pub fn mark_changed(&mut self, path: impl Into<String>) {
        let path = path.into();

        if let Some(loaded) = &mut self.loaded {
            loaded.insert(path.clone());
        }

        self.changed.insert(path);
    }

    /// Returns `true` if `path` or one of its ancestors was changed.
    pub fn is_changed(&self, path: &str) -> bool {
        self.changed.contains(path) || ancestors(path).any(|ancestor| self.changed.contains(ancestor))
    }

    /// Changed paths, minus those already covered by a changed ancestor.
    pub fn effective_changes(&self) -> Vec<&str> {
        self.changed
            .iter()
            .filter(|path| !ancestors(path).any(|ancestor| self.changed.contains(ancestor)))
            .map(String::as_str)
            .collect()
    }

    /// Marks the current values as stored.
    pub fn commit(&mut self) {
        self.original = self.current.clone();
        self.changed.clear();
        self.is_new = false;
    }

    /// Values are mutated without being recorded as changed. Only for changes
    /// that leave the wire form untouched, such as binding references.
    pub(crate) fn current_mut_untracked(&mut self) -> &mut Fields {
        &mut self.current
    }
}

/// Proper ancestors of a dotted path, nearest last: `a.b.c` → `a`, `a.b`.
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('.').map(move |(index, _)| &path[..index])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loaded_state_is_clean() {
        let mut values = Fields::new();
        values.insert("a".into(), Value::Int(1));
        let state = DocumentState::loaded(values, None);

        assert!(!state.is_new());
        assert!(state.changed_paths().is_empty());
        assert_eq!(state.current(), state.original());
    }

    #[test]
    fn test_effective_changes_drop_covered_paths() {
        let mut state = DocumentState::new();
        state.mark_changed("address.city");
        state.mark_changed("address");
        state.mark_changed("tags");
        state.mark_changed("titles.en");

        assert_eq!(state.effective_changes(), vec!["address", "tags", "titles.en"]);
        assert!(state.is_changed("address.zip"));
        assert!(!state.is_changed("name"));
    }

    #[test]
    fn test_commit_resets_tracking() {
        let mut state = DocumentState::new();
        state.set("a", Value::Int(2));
        state.commit();

        assert!(!state.is_new());
        assert!(state.changed_paths().is_empty());
        assert_eq!(state.original().get("a"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_touching_attribute_extends_partial_load() {
        let mut state = DocumentState::loaded(Fields::new(), Some(BTreeSet::from(["a".to_owned()])));
        assert!(!state.is_loaded("b"));

        state.set("b", Value::Bool(true));
        assert!(state.is_loaded("b"));

        state.mark_changed("c.d");
        assert!(state.is_loaded("c"));
        assert!(!state.is_loaded("cd"));
        assert!(state.loaded_fields().is_some_and(|loaded| loaded.contains("c.d") && !loaded.contains("c")));
    }
}
