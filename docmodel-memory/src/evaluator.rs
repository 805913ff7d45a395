//! Wire filter evaluation for in-memory documents.
//!
//! Filters, projections and sorts arrive in the same wire form a document
//! database would receive. This module interprets the subset the mapping layer
//! produces: comparison, membership, string and array operators, `$and`,
//! `$or`, `$nor`, `$not` and a simple `$text` emulation. Dotted paths traverse
//! embedded documents and arrays.

use std::{cmp::Ordering, collections::HashMap};

use bson::{Bson, Document, datetime::DateTime, oid::ObjectId};
use regex::RegexBuilder;

use docmodel_core::error::{OdmError, OdmResult};

/// Type-erased, comparable representation of BSON values.
///
/// Numeric types are normalized to f64, so `Int32(1)`, `Int64(1)` and
/// `Double(1.0)` compare equal.
#[derive(Debug)]
pub(crate) enum Comparable<'a> {
    Null,
    Bool(bool),
    Number(f64),
    DateTime(DateTime),
    String(&'a str),
    ObjectId(ObjectId),
    Binary(&'a [u8]),
    Array(Vec<Comparable<'a>>),
    Map(HashMap<&'a str, Comparable<'a>>),
}

impl<'a> From<&'a Bson> for Comparable<'a> {
    fn from(bson: &'a Bson) -> Self {
        match bson {
            Bson::Null => Comparable::Null,
            Bson::Boolean(value) => Comparable::Bool(*value),
            Bson::Int32(value) => Comparable::Number(*value as f64),
            Bson::Int64(value) => Comparable::Number(*value as f64),
            Bson::Double(value) => Comparable::Number(*value),
            Bson::DateTime(value) => Comparable::DateTime(*value),
            Bson::String(value) => Comparable::String(value),
            Bson::ObjectId(value) => Comparable::ObjectId(*value),
            Bson::Binary(binary) => Comparable::Binary(&binary.bytes),
            Bson::Array(arr) => Comparable::Array(arr.iter().map(Comparable::from).collect()),
            Bson::Document(doc) => Comparable::Map(
                doc.iter()
                    .map(|(k, v)| (k.as_str(), Comparable::from(v)))
                    .collect(),
            ),
            _ => Comparable::Null,
        }
    }
}

impl Comparable<'_> {
    /// Rank of the value's type in the store's cross-type sort order.
    fn type_rank(&self) -> u8 {
        match self {
            Comparable::Null => 0,
            Comparable::Number(_) => 1,
            Comparable::String(_) => 2,
            Comparable::Map(_) => 3,
            Comparable::Array(_) => 4,
            Comparable::Binary(_) => 5,
            Comparable::ObjectId(_) => 6,
            Comparable::Bool(_) => 7,
            Comparable::DateTime(_) => 8,
        }
    }

    /// Total order used for sorting.
    fn sort_cmp(&self, other: &Self) -> Ordering {
        self.partial_cmp(other)
            .unwrap_or_else(|| self.type_rank().cmp(&other.type_rank()))
    }
}

impl PartialEq for Comparable<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Comparable::Null, Comparable::Null) => true,
            (Comparable::Bool(a), Comparable::Bool(b)) => a == b,
            (Comparable::Number(a), Comparable::Number(b)) => a == b,
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a == b,
            (Comparable::String(a), Comparable::String(b)) => a == b,
            (Comparable::ObjectId(a), Comparable::ObjectId(b)) => a == b,
            (Comparable::Binary(a), Comparable::Binary(b)) => a == b,
            (Comparable::Array(a), Comparable::Array(b)) => a == b,
            (Comparable::Map(a), Comparable::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialOrd for Comparable<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Comparable::Null, Comparable::Null) => Some(Ordering::Equal),
            (Comparable::Bool(a), Comparable::Bool(b)) => a.partial_cmp(b),
            (Comparable::Number(a), Comparable::Number(b)) => a.partial_cmp(b),
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a.partial_cmp(b),
            (Comparable::String(a), Comparable::String(b)) => a.partial_cmp(b),
            (Comparable::ObjectId(a), Comparable::ObjectId(b)) => a.partial_cmp(b),
            (Comparable::Binary(a), Comparable::Binary(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

/// Returns `true` if `value` is an operator document (`{"$gt": 1}`) rather
/// than a literal embedded document. DBRef-style `$ref`/`$id` documents are
/// literals.
pub(crate) fn is_operator_doc(value: &Bson) -> bool {
    match value {
        Bson::Document(doc) => doc
            .keys()
            .next()
            .is_some_and(|key| key.starts_with('$') && !matches!(key.as_str(), "$ref" | "$id" | "$db")),
        _ => false,
    }
}

/// Values found at a dotted path. Arrays along the way are traversed: a
/// numeric segment addresses a position, any other segment applies to every
/// embedded element.
fn values_at<'d>(value: &'d Bson, segments: &[&str], out: &mut Vec<&'d Bson>) {
    let Some((segment, rest)) = segments.split_first() else {
        out.push(value);
        return;
    };

    match value {
        Bson::Document(doc) => {
            if let Some(child) = doc.get(*segment) {
                values_at(child, rest, out);
            }
        }
        Bson::Array(items) => {
            if let Ok(index) = segment.parse::<usize>() {
                if let Some(item) = items.get(index) {
                    values_at(item, rest, out);
                }
            }
            for item in items.iter().filter(|item| matches!(item, Bson::Document(_))) {
                values_at(item, segments, out);
            }
        }
        _ => {}
    }
}

/// Values found at a dotted path of `document`.
pub(crate) fn lookup_values<'d>(document: &'d Document, path: &str) -> Vec<&'d Bson> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();

    if let Some((first, rest)) = segments.split_first() {
        if let Some(value) = document.get(*first) {
            values_at(value, rest, &mut out);
        }
    }

    out
}

/// Evaluates wire filters against documents of one collection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FilterEvaluator<'a> {
    collection: &'a str,
}

impl<'a> FilterEvaluator<'a> {
    pub fn new(collection: &'a str) -> Self {
        Self { collection }
    }

    fn error(&self, message: impl Into<String>) -> OdmError {
        OdmError::operation(self.collection, message)
    }

    /// Returns `true` if `document` matches `filter`.
    pub fn matches(&self, document: &Document, filter: &Document) -> OdmResult<bool> {
        for (key, condition) in filter {
            let matched = match key.as_str() {
                "$and" => {
                    let mut all = true;
                    for clause in self.clauses(key, condition)? {
                        if !self.matches(document, clause)? {
                            all = false;
                            break;
                        }
                    }
                    all
                }
                "$or" => {
                    let mut any = false;
                    for clause in self.clauses(key, condition)? {
                        if self.matches(document, clause)? {
                            any = true;
                            break;
                        }
                    }
                    any
                }
                "$nor" => {
                    let mut none = true;
                    for clause in self.clauses(key, condition)? {
                        if self.matches(document, clause)? {
                            none = false;
                            break;
                        }
                    }
                    none
                }
                "$text" => self.text_search(document, condition)?,
                operator if operator.starts_with('$') => {
                    return Err(self.error(format!("unsupported top-level operator {operator}")));
                }
                path => self.matches_condition(&lookup_values(document, path), condition)?,
            };

            if !matched {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn clauses<'f>(&self, operator: &str, condition: &'f Bson) -> OdmResult<Vec<&'f Document>> {
        match condition {
            Bson::Array(items) if !items.is_empty() => items
                .iter()
                .map(|item| {
                    item.as_document()
                        .ok_or_else(|| self.error(format!("{operator} takes an array of documents")))
                })
                .collect(),
            _ => Err(self.error(format!("{operator} takes a non-empty array"))),
        }
    }

    /// Evaluates a path condition: a literal (equality) or an operator document.
    pub(crate) fn matches_condition(&self, values: &[&Bson], condition: &Bson) -> OdmResult<bool> {
        let Some(operators) = condition.as_document().filter(|_| is_operator_doc(condition)) else {
            return Ok(equals_any(values, condition));
        };

        for (operator, operand) in operators {
            let matched = match operator.as_str() {
                "$eq" => equals_any(values, operand),
                "$ne" => !equals_any(values, operand),
                "$gt" => compare_any(values, operand, |ordering| ordering == Ordering::Greater),
                "$gte" => compare_any(values, operand, |ordering| ordering != Ordering::Less),
                "$lt" => compare_any(values, operand, |ordering| ordering == Ordering::Less),
                "$lte" => compare_any(values, operand, |ordering| ordering != Ordering::Greater),
                "$in" => self
                    .operand_array(operator, operand)?
                    .iter()
                    .any(|item| equals_any(values, item)),
                "$nin" => !self
                    .operand_array(operator, operand)?
                    .iter()
                    .any(|item| equals_any(values, item)),
                "$all" => {
                    let items = self.operand_array(operator, operand)?;
                    !items.is_empty() && items.iter().all(|item| equals_any(values, item))
                }
                "$exists" => !values.is_empty() == operand.as_bool().unwrap_or(true),
                "$size" => {
                    let size = as_i64(operand).ok_or_else(|| self.error("$size takes a number"))?;
                    values
                        .iter()
                        .any(|value| matches!(value, Bson::Array(items) if items.len() as i64 == size))
                }
                "$mod" => {
                    let (divisor, remainder) = match self.operand_array(operator, operand)? {
                        [divisor, remainder] => (as_i64(divisor), as_i64(remainder)),
                        _ => (None, None),
                    };
                    let (Some(divisor), Some(remainder)) = (divisor.filter(|d| *d != 0), remainder) else {
                        return Err(self.error("$mod takes [divisor, remainder]"));
                    };
                    expand(values)
                        .filter_map(|value| as_i64(value))
                        .any(|number| number % divisor == remainder)
                }
                "$regex" => {
                    let pattern = operand
                        .as_str()
                        .ok_or_else(|| self.error("$regex takes a string"))?;
                    let options = operators.get_str("$options").unwrap_or_default();
                    let regex = RegexBuilder::new(pattern)
                        .case_insensitive(options.contains('i'))
                        .multi_line(options.contains('m'))
                        .build()
                        .map_err(|err| self.error(format!("invalid regular expression: {err}")))?;

                    expand(values)
                        .filter_map(|value| value.as_str())
                        .any(|text| regex.is_match(text))
                }
                "$options" => true,
                "$elemMatch" => {
                    let criteria = operand
                        .as_document()
                        .ok_or_else(|| self.error("$elemMatch takes a document"))?;
                    let mut any = false;

                    'outer: for value in values {
                        let Bson::Array(items) = value else { continue };
                        for item in items {
                            let matched = match item {
                                Bson::Document(element) if !is_operator_doc(operand) => {
                                    self.matches(element, criteria)?
                                }
                                element => self.matches_condition(&[element], operand)?,
                            };
                            if matched {
                                any = true;
                                break 'outer;
                            }
                        }
                    }

                    any
                }
                "$not" => !self.matches_condition(values, operand)?,
                "$near" | "$nearSphere" | "$geoWithin" | "$maxDistance" => {
                    return Err(self.error(format!("{operator} is not supported in memory")));
                }
                other => return Err(self.error(format!("unsupported operator {other}"))),
            };

            if !matched {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn operand_array<'o>(&self, operator: &str, operand: &'o Bson) -> OdmResult<&'o [Bson]> {
        match operand {
            Bson::Array(items) => Ok(items),
            _ => Err(self.error(format!("{operator} takes an array"))),
        }
    }

    /// Matches when any string value of the document contains one of the
    /// whitespace-separated search terms, ignoring case.
    fn text_search(&self, document: &Document, condition: &Bson) -> OdmResult<bool> {
        let search = condition
            .as_document()
            .and_then(|condition| condition.get_str("$search").ok())
            .ok_or_else(|| self.error("$text takes {$search: <string>}"))?;
        let terms: Vec<String> = search.split_whitespace().map(str::to_lowercase).collect();

        fn strings<'d>(value: &'d Bson, out: &mut Vec<&'d str>) {
            match value {
                Bson::String(text) => out.push(text),
                Bson::Array(items) => items.iter().for_each(|item| strings(item, out)),
                Bson::Document(doc) => doc.values().for_each(|item| strings(item, out)),
                _ => {}
            }
        }

        let mut texts = Vec::new();
        document.values().for_each(|value| strings(value, &mut texts));

        Ok(texts.iter().any(|text| {
            let text = text.to_lowercase();
            terms.iter().any(|term| text.contains(term.as_str()))
        }))
    }
}

/// Values plus the elements of array values.
fn expand<'v>(values: &'v [&'v Bson]) -> impl Iterator<Item = &'v Bson> {
    values.iter().flat_map(|value| {
        let elements: &[Bson] = match value {
            Bson::Array(items) => items.as_slice(),
            _ => &[],
        };
        std::iter::once(*value).chain(elements.iter())
    })
}

/// Equality with array semantics. Null also matches a missing path.
fn equals_any(values: &[&Bson], operand: &Bson) -> bool {
    if values.is_empty() {
        return matches!(operand, Bson::Null);
    }

    let operand = Comparable::from(operand);
    expand(values).any(|value| Comparable::from(value) == operand)
}

fn compare_any(values: &[&Bson], operand: &Bson, accept: impl Fn(Ordering) -> bool) -> bool {
    let operand = Comparable::from(operand);
    expand(values)
        .filter_map(|value| Comparable::from(value).partial_cmp(&operand))
        .any(accept)
}

fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(i) => Some(i64::from(*i)),
        Bson::Int64(i) => Some(*i),
        Bson::Double(f) if f.fract() == 0.0 => Some(*f as i64),
        _ => None,
    }
}

/// Sorts documents by a wire sort document (`1` ascending, `-1` descending).
/// Missing values sort as null.
pub(crate) fn sort_documents(documents: &mut [Document], sort: &Document) {
    let keys: Vec<(&str, bool)> = sort
        .iter()
        .map(|(path, direction)| {
            let descending = as_i64(direction).is_some_and(|direction| direction < 0);
            (path.as_str(), descending)
        })
        .collect();

    documents.sort_by(|a, b| {
        for (path, descending) in &keys {
            let (left, right) = (lookup_values(a, path), lookup_values(b, path));

            let left = left.first().map_or(Comparable::Null, |value| Comparable::from(*value));
            let right = right.first().map_or(Comparable::Null, |value| Comparable::from(*value));

            let ordering = left.sort_cmp(&right);
            let ordering = if *descending { ordering.reverse() } else { ordering };

            if ordering != Ordering::Equal {
                return ordering;
            }
        }

        Ordering::Equal
    });
}

/// Applies an inclusion or exclusion projection. `_id` is kept unless
/// explicitly excluded.
pub(crate) fn project(document: &Document, projection: &Document) -> Document {
    let included = |value: &Bson| match value {
        Bson::Boolean(flag) => *flag,
        other => as_i64(other).is_none_or(|flag| flag != 0),
    };

    let inclusion = projection
        .iter()
        .any(|(key, value)| key != "_id" && included(value));

    if !inclusion {
        let mut projected = document.clone();
        for (path, _) in projection.iter().filter(|(_, value)| !included(*value)) {
            remove_path(&mut projected, path);
        }
        return projected;
    }

    let mut projected = Document::new();

    if projection.get("_id").is_none_or(included) {
        if let Some(id) = document.get("_id") {
            projected.insert("_id", id.clone());
        }
    }

    for (path, _) in projection.iter().filter(|(key, value)| *key != "_id" && included(*value)) {
        copy_path(document, &mut projected, &path.split('.').collect::<Vec<_>>());
    }

    projected
}

fn copy_path(source: &Document, target: &mut Document, segments: &[&str]) {
    let Some((segment, rest)) = segments.split_first() else {
        return;
    };
    let Some(value) = source.get(*segment) else {
        return;
    };

    match (value, rest.is_empty()) {
        (_, true) => {
            target.insert(*segment, value.clone());
        }
        (Bson::Document(child), false) => {
            if !matches!(target.get(*segment), Some(Bson::Document(_))) {
                target.insert(*segment, Document::new());
            }
            if let Some(Bson::Document(child_target)) = target.get_mut(*segment) {
                copy_path(child, child_target, rest);
            }
        }
        _ => {}
    }
}

/// Removes a dotted path. Returns `true` if something was removed.
pub(crate) fn remove_path(document: &mut Document, path: &str) -> bool {
    match path.split_once('.') {
        None => document.remove(path).is_some(),
        Some((head, rest)) => match document.get_mut(head) {
            Some(Bson::Document(child)) => remove_path(child, rest),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn matches(document: &Document, filter: Document) -> bool {
        FilterEvaluator::new("test")
            .matches(document, &filter)
            .expect("evaluates")
    }

    fn user() -> Document {
        doc! {
            "_id": 1,
            "name": "Alice",
            "age": 30,
            "tags": ["rust", "async"],
            "address": { "c": "Paris", "zip": "75001" },
            "comments": [{ "by": "bob", "votes": 3 }, { "by": "eve", "votes": 1 }],
            "author": { "$ref": "user", "$id": 7 },
        }
    }

    #[test]
    fn test_comparisons_and_ranges() {
        let user = user();
        assert!(matches(&user, doc! { "age": { "$gte": 18, "$lt": 65 } }));
        assert!(matches(&user, doc! { "age": 30.0 }));
        assert!(!matches(&user, doc! { "age": { "$gt": 30 } }));
        assert!(matches(&user, doc! { "age": { "$ne": 31 }, "name": "Alice" }));
        assert!(matches(&user, doc! { "missing": Bson::Null }));
        assert!(!matches(&user, doc! { "missing": { "$exists": true } }));
    }

    #[test]
    fn test_arrays_and_paths() {
        let user = user();
        assert!(matches(&user, doc! { "tags": "rust" }));
        assert!(matches(&user, doc! { "tags": { "$all": ["rust", "async"] } }));
        assert!(matches(&user, doc! { "tags": { "$size": 2 } }));
        assert!(matches(&user, doc! { "address.c": "Paris" }));
        assert!(matches(&user, doc! { "comments.by": "eve" }));
        assert!(matches(&user, doc! { "comments.0.votes": 3 }));
        assert!(matches(&user, doc! { "author.$id": { "$in": [5, 7] } }));
        assert!(matches(&user, doc! { "comments": { "$elemMatch": { "by": "bob", "votes": { "$gte": 2 } } } }));
        assert!(!matches(&user, doc! { "comments": { "$elemMatch": { "by": "eve", "votes": { "$gte": 2 } } } }));
    }

    #[test]
    fn test_logical_operators() {
        let user = user();
        assert!(matches(&user, doc! { "$or": [{ "age": 1 }, { "name": "Alice" }] }));
        assert!(!matches(&user, doc! { "$nor": [{ "age": 30 }] }));
        assert!(matches(&user, doc! { "age": { "$not": { "$gt": 40 } } }));
        assert!(matches(&user, doc! { "$and": [{ "age": 30 }, { "tags": { "$nin": ["go"] } }] }));
    }

    #[test]
    fn test_strings_and_text() {
        let user = user();
        assert!(matches(&user, doc! { "name": { "$regex": "^ali", "$options": "i" } }));
        assert!(!matches(&user, doc! { "name": { "$regex": "^ali" } }));
        assert!(matches(&user, doc! { "$text": { "$search": "paris berlin" } }));
        assert!(matches(&user, doc! { "age": { "$mod": [4, 2] } }));

        let err = FilterEvaluator::new("test").matches(&user, &doc! { "name": { "$regex": "([" } });
        assert!(err.is_err());
    }

    #[test]
    fn test_sort_and_projection() {
        let mut documents = vec![doc! { "a": 2 }, doc! { "b": 1 }, doc! { "a": 1, "n": "x" }, doc! { "a": 1, "n": "a" }];
        sort_documents(&mut documents, &doc! { "a": 1, "n": -1 });
        assert_eq!(
            documents,
            vec![doc! { "b": 1 }, doc! { "a": 1, "n": "x" }, doc! { "a": 1, "n": "a" }, doc! { "a": 2 }]
        );

        let user = user();
        assert_eq!(
            project(&user, &doc! { "name": 1, "address.c": 1 }),
            doc! { "_id": 1, "name": "Alice", "address": { "c": "Paris" } }
        );

        let trimmed = project(&user, &doc! { "comments": 0, "address": 0 });
        assert!(!trimmed.contains_key("comments"));
        assert!(trimmed.contains_key("tags"));
    }
}
