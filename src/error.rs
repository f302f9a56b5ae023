//! Error kinds surfaced to callers of the coordinator and the node agent.

use thiserror::Error;

use crate::detector::DetectorError;
use crate::store::StoreError;

/// Caller-visible failure of a coordinator or agent operation.
///
/// Input validation fails fast before any write; a detector failure inside a
/// green computation aborts that call but leaves prior metric writes in
/// place. Retrying is always the caller's decision.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// `update_traffic` named a node that is on neither end of the edge.
    #[error("node {node_id} is not connected to edge {edge_id}")]
    NotConnected { node_id: String, edge_id: String },

    /// The responder has no routing rows for the requested destination.
    #[error("no route to {0}")]
    NoRoute(String),

    #[error("detector failure: {0}")]
    Detector(#[from] DetectorError),

    /// Transient backing-store error; the caller may retry.
    #[error("store failure: {0}")]
    Store(StoreError),

    /// Unique-key violation on create.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateKey(key) => Error::Conflict(key),
            StoreError::Missing(what) => Error::NotFound(what),
            StoreError::Unavailable(_) => Error::Store(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_kinds_map_to_api_kinds() {
        let conflict: Error = StoreError::DuplicateKey("edge E1".into()).into();
        assert!(matches!(conflict, Error::Conflict(_)));

        let missing: Error = StoreError::Missing("node N9".into()).into();
        assert!(matches!(missing, Error::NotFound(_)));

        let transient: Error = StoreError::Unavailable("connection reset".into()).into();
        assert!(matches!(transient, Error::Store(_)));
    }
}
