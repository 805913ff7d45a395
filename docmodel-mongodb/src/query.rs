//! Translation between wire specs and MongoDB driver types.
//!
//! Filters and updates are already in MongoDB syntax when they reach the
//! executor, so only find options and driver errors need mapping.

use mongodb::{
    error::{Error as MongoError, ErrorKind, WriteFailure as MongoWriteFailure},
    options::FindOptions,
};

use docmodel_core::{
    error::OdmError,
    executor::{FindSpec, WriteFailure},
};

/// Builds driver options from a find spec. The filter is passed separately.
pub(crate) fn find_options(spec: &FindSpec) -> FindOptions {
    let mut options = FindOptions::default();

    options.projection = spec.projection.clone();
    options.sort = spec.sort.clone();
    options.skip = spec.skip;
    options.limit = spec.limit.filter(|limit| *limit != 0);
    options.batch_size = spec.batch_size;

    options
}

/// The write failure a driver error carries, if the server rejected the
/// write itself.
pub(crate) fn write_failure(error: &MongoError) -> Option<WriteFailure> {
    match error.kind.as_ref() {
        ErrorKind::Write(MongoWriteFailure::WriteError(failure)) => {
            Some(WriteFailure::new(failure.code, failure.message.clone()))
        }
        ErrorKind::Write(MongoWriteFailure::WriteConcernError(failure)) => {
            Some(WriteFailure::new(failure.code, failure.message.clone()))
        }
        _ => None,
    }
}

/// Maps a driver error that is not a store-reported write failure.
pub(crate) fn map_error(collection: &str, error: MongoError) -> OdmError {
    match error.kind.as_ref() {
        ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } | ErrorKind::DnsResolve { .. } => {
            OdmError::Connection(error.to_string())
        }
        ErrorKind::Authentication { .. } => OdmError::Connection(error.to_string()),
        _ => OdmError::operation(collection, error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_find_options_copy_paging_and_projection() {
        let spec = FindSpec {
            filter: doc! { "age": { "$gte": 18 } },
            projection: Some(doc! { "n": 1 }),
            sort: Some(doc! { "age": -1 }),
            skip: Some(5),
            limit: Some(10),
            batch_size: Some(100),
        };

        let options = find_options(&spec);
        assert_eq!(options.projection, Some(doc! { "n": 1 }));
        assert_eq!(options.sort, Some(doc! { "age": -1 }));
        assert_eq!(options.skip, Some(5));
        assert_eq!(options.limit, Some(10));
        assert_eq!(options.batch_size, Some(100));

        let options = find_options(&FindSpec::new(doc! {}).with_limit(0));
        assert_eq!(options.limit, None);
    }
}
