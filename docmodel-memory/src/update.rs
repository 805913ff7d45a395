//! Applies wire update documents to stored documents.

use bson::{Bson, Document};

use crate::evaluator::{Comparable, FilterEvaluator, is_operator_doc, remove_path};

/// Applies `update` to `document` in place.
///
/// Returns `Ok(true)` if the document changed. Errors carry a message
/// suitable for a store-reported write failure.
pub(crate) fn apply_update(document: &mut Document, update: &Document, collection: &str) -> Result<bool, String> {
    let before = document.clone();

    for (operator, fields) in update {
        let fields = fields
            .as_document()
            .ok_or_else(|| format!("{operator} takes a document"))?;

        for (path, operand) in fields {
            if path == "_id" && operator != "$setOnInsert" {
                return Err("the _id field cannot be updated".to_owned());
            }

            match operator.as_str() {
                "$set" => set_path(document, path, operand.clone())?,
                "$unset" => {
                    remove_path(document, path);
                }
                "$inc" => {
                    let current = get_path(document, path).cloned().unwrap_or(Bson::Int32(0));
                    set_path(document, path, add(&current, operand, path)?)?;
                }
                "$push" => {
                    let items = match operand {
                        Bson::Document(each) if each.contains_key("$each") => match each.get("$each") {
                            Some(Bson::Array(items)) => items.clone(),
                            _ => return Err(format!("$each on {path} takes an array")),
                        },
                        item => vec![item.clone()],
                    };
                    array_at(document, path)?.extend(items);
                }
                "$addToSet" => {
                    let items = match operand {
                        Bson::Document(each) if each.contains_key("$each") => match each.get("$each") {
                            Some(Bson::Array(items)) => items.clone(),
                            _ => return Err(format!("$each on {path} takes an array")),
                        },
                        item => vec![item.clone()],
                    };
                    let array = array_at(document, path)?;
                    for item in items {
                        if !array.iter().any(|existing| Comparable::from(existing) == Comparable::from(&item)) {
                            array.push(item);
                        }
                    }
                }
                "$pull" => {
                    let evaluator = FilterEvaluator::new(collection);
                    let Some(Bson::Array(array)) = get_path_mut(document, path) else {
                        continue;
                    };

                    let mut kept = Vec::with_capacity(array.len());
                    for item in array.drain(..) {
                        let remove = match (&item, operand) {
                            (Bson::Document(element), Bson::Document(criteria)) if !is_operator_doc(operand) => {
                                evaluator.matches(element, criteria).map_err(|err| err.to_string())?
                            }
                            (_, Bson::Document(_)) if is_operator_doc(operand) => evaluator
                                .matches_condition(&[&item], operand)
                                .map_err(|err| err.to_string())?,
                            _ => Comparable::from(&item) == Comparable::from(operand),
                        };
                        if !remove {
                            kept.push(item);
                        }
                    }
                    *array = kept;
                }
                "$pop" => {
                    let Some(Bson::Array(array)) = get_path_mut(document, path) else {
                        continue;
                    };
                    let first = matches!(operand, Bson::Int32(-1) | Bson::Int64(-1))
                        || matches!(operand, Bson::Double(d) if *d < 0.0);
                    if first {
                        if !array.is_empty() {
                            array.remove(0);
                        }
                    } else {
                        array.pop();
                    }
                }
                "$setOnInsert" => {}
                other => return Err(format!("unsupported update operator {other}")),
            }
        }
    }

    Ok(*document != before)
}

/// Seeds a document for an upsert from the equality conditions of `filter`.
pub(crate) fn seed_from_filter(filter: &Document) -> Result<Document, String> {
    let mut seed = Document::new();
    collect_equalities(filter, &mut seed)?;
    Ok(seed)
}

fn collect_equalities(filter: &Document, seed: &mut Document) -> Result<(), String> {
    for (key, condition) in filter {
        match key.as_str() {
            "$and" => {
                if let Bson::Array(clauses) = condition {
                    for clause in clauses.iter().filter_map(Bson::as_document) {
                        collect_equalities(clause, seed)?;
                    }
                }
            }
            other if other.starts_with('$') => {}
            path => {
                let value = match condition {
                    Bson::Document(operators) if is_operator_doc(condition) => match operators.get("$eq") {
                        Some(value) => value.clone(),
                        None => continue,
                    },
                    literal => literal.clone(),
                };
                set_path(seed, path, value)?;
            }
        }
    }

    Ok(())
}

fn add(current: &Bson, operand: &Bson, path: &str) -> Result<Bson, String> {
    Ok(match (current, operand) {
        (Bson::Int32(a), Bson::Int32(b)) => match a.checked_add(*b) {
            Some(sum) => Bson::Int32(sum),
            None => Bson::Int64(i64::from(*a) + i64::from(*b)),
        },
        (Bson::Int32(a), Bson::Int64(b)) => Bson::Int64(i64::from(*a) + b),
        (Bson::Int64(a), Bson::Int32(b)) => Bson::Int64(a + i64::from(*b)),
        (Bson::Int64(a), Bson::Int64(b)) => Bson::Int64(a + b),
        (a, b) => match (as_f64(a), as_f64(b)) {
            (Some(a), Some(b)) => Bson::Double(a + b),
            _ => return Err(format!("cannot apply $inc to non-numeric field {path}")),
        },
    })
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(i) => Some(f64::from(*i)),
        Bson::Int64(i) => Some(*i as f64),
        Bson::Double(f) => Some(*f),
        _ => None,
    }
}

fn get_path<'d>(document: &'d Document, path: &str) -> Option<&'d Bson> {
    match path.split_once('.') {
        None => document.get(path),
        Some((head, rest)) => match document.get(head)? {
            Bson::Document(child) => get_path(child, rest),
            Bson::Array(items) => {
                let (index, tail) = rest.split_once('.').map_or((rest, None), |(i, t)| (i, Some(t)));
                match (tail, items.get(index.parse::<usize>().ok()?)?) {
                    (None, item) => Some(item),
                    (Some(tail), Bson::Document(child)) => get_path(child, tail),
                    _ => None,
                }
            }
            _ => None,
        },
    }
}

fn get_path_mut<'d>(document: &'d mut Document, path: &str) -> Option<&'d mut Bson> {
    match path.split_once('.') {
        None => document.get_mut(path),
        Some((head, rest)) => match document.get_mut(head)? {
            Bson::Document(child) => get_path_mut(child, rest),
            _ => None,
        },
    }
}

/// Sets a dotted path, creating intermediate documents.
fn set_path(document: &mut Document, path: &str, value: Bson) -> Result<(), String> {
    match path.split_once('.') {
        None => {
            document.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            if !document.contains_key(head) {
                document.insert(head, Document::new());
            }
            match document.get_mut(head) {
                Some(Bson::Document(child)) => set_path(child, rest, value),
                Some(Bson::Array(items)) => {
                    let (index, tail) = rest.split_once('.').map_or((rest, None), |(i, t)| (i, Some(t)));
                    let index: usize = index
                        .parse()
                        .map_err(|_| format!("cannot address array {head} with {index}"))?;
                    let slot = items
                        .get_mut(index)
                        .ok_or_else(|| format!("index {index} out of range for {head}"))?;
                    match (tail, slot) {
                        (None, slot) => {
                            *slot = value;
                            Ok(())
                        }
                        (Some(tail), Bson::Document(child)) => set_path(child, tail, value),
                        (Some(_), _) => Err(format!("cannot create field inside scalar at {path}")),
                    }
                }
                _ => Err(format!("cannot create field inside scalar at {path}")),
            }
        }
    }
}

/// The array at `path`, created if missing.
fn array_at<'d>(document: &'d mut Document, path: &str) -> Result<&'d mut Vec<Bson>, String> {
    if get_path(document, path).is_none() {
        set_path(document, path, Bson::Array(Vec::new()))?;
    }

    match get_path_mut(document, path) {
        Some(Bson::Array(items)) => Ok(items),
        _ => Err(format!("field {path} is not an array")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn apply(mut document: Document, update: Document) -> Document {
        apply_update(&mut document, &update, "test").expect("update applies");
        document
    }

    #[test]
    fn test_set_unset_and_inc() {
        let document = apply(
            doc! { "_id": 1, "n": "a", "views": 1, "old": true },
            doc! { "$set": { "n": "b", "address.c": "Paris" }, "$unset": { "old": "" }, "$inc": { "views": 2 } },
        );
        assert_eq!(document, doc! { "_id": 1, "n": "b", "views": 3, "address": { "c": "Paris" } });

        let document = apply(doc! { "score": 1.5 }, doc! { "$inc": { "score": 1 } });
        assert_eq!(document, doc! { "score": 2.5 });
    }

    #[test]
    fn test_array_operators() {
        let document = apply(
            doc! { "tags": ["a", "b"], "ids": [1, 2, 3] },
            doc! {
                "$push": { "tags": { "$each": ["c", "d"] } },
                "$addToSet": { "ids": 2 },
                "$pop": { "ids": -1 },
            },
        );
        assert_eq!(document, doc! { "tags": ["a", "b", "c", "d"], "ids": [2, 3] });

        let document = apply(
            doc! { "comments": [{ "by": "bob" }, { "by": "eve" }] },
            doc! { "$pull": { "comments": { "by": "bob" } } },
        );
        assert_eq!(document, doc! { "comments": [{ "by": "eve" }] });

        let document = apply(
            doc! { "tags": ["a", "b", "c"], "ids": [1] },
            doc! {
                "$pull": { "tags": { "$in": ["a", "c"] } },
                "$addToSet": { "ids": { "$each": [1, 2] } },
            },
        );
        assert_eq!(document, doc! { "tags": ["b"], "ids": [1, 2] });
    }

    #[test]
    fn test_unchanged_and_rejected_updates() {
        let mut document = doc! { "n": "a" };
        assert!(!apply_update(&mut document, &doc! { "$set": { "n": "a" } }, "test").expect("applies"));
        assert!(apply_update(&mut document, &doc! { "$inc": { "n": 1 } }, "test").is_err());
        assert!(apply_update(&mut document, &doc! { "$set": { "_id": 2 } }, "test").is_err());
    }

    #[test]
    fn test_seed_from_filter() {
        let seed = seed_from_filter(&doc! {
            "$and": [{ "n": "a" }, { "age": { "$gte": 3 } }],
            "address.c": { "$eq": "Paris" },
        })
        .expect("seeds");
        assert_eq!(seed, doc! { "n": "a", "address": { "c": "Paris" } });
    }
}
