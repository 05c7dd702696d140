//! Error types of the CouchDB room backend.

use reqwest::StatusCode;
use thiserror::Error;

/// Result alias for CouchDB calls.
pub type CouchResult<T> = Result<T, CouchDaoError>;

/// Failures of the CouchDB room backend, tagged with the endpoint involved.
#[derive(Debug, Error)]
pub enum CouchDaoError {
    #[error("room database not configured: `{var}` is unset")]
    MissingEnvVar { var: &'static str },
    #[error("could not build the CouchDB HTTP client")]
    ClientBuilder {
        #[source]
        source: reqwest::Error,
    },
    /// Reaching the database itself failed while checking or creating it.
    #[error("could not {action} room database `{database}`")]
    Database {
        database: String,
        action: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("room database `{database}` answered {status}")]
    DatabaseStatus {
        database: String,
        status: StatusCode,
    },
    #[error("CouchDB unreachable at `{path}`")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("CouchDB answered {status} for `{path}`")]
    UnexpectedStatus { path: String, status: StatusCode },
    /// The document revision moved underneath a write.
    #[error("revision conflict on `{path}`")]
    Conflict { path: String },
    #[error("gave up on `{path}` after {attempts} conflicting writes")]
    ConflictRetriesExhausted { path: String, attempts: usize },
    #[error("malformed CouchDB response body for `{path}`")]
    MalformedBody {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    /// A stored document does not match the room model.
    #[error("`{path}` is not a valid room document")]
    InvalidDocument {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
