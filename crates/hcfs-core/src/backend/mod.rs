//! Object storage backend collaborator.
//!
//! The core never speaks HTTP itself. It drives a [`BackendConnection`] that
//! reports HTTP-like [`StatusCode`]s and decides on retries from those codes
//! alone. Connections are produced by an [`ObjectBackend`] and pooled by
//! [`crate::pool::TransferPool`].

mod dir;
mod memory;

pub use dir::DirectoryBackend;
pub use memory::{MemoryBackend, MemoryStats};

use std::fmt;
use std::io;

use bytes::Bytes;
use thiserror::Error;

use crate::{BlockIndex, InodeId};

/// HTTP-like status reported by a backend request.
///
/// `StatusCode(0)` means the request got no response at all (connection
/// reset, DNS failure, timeout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u16);

impl StatusCode {
    /// No response was received.
    pub const TRANSPORT_FAILURE: StatusCode = StatusCode(0);
    /// 200 OK.
    pub const OK: StatusCode = StatusCode(200);
    /// 201 Created.
    pub const CREATED: StatusCode = StatusCode(201);
    /// 204 No Content.
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    /// 401 Unauthorized.
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    /// 404 Not Found.
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    /// 500 Internal Server Error.
    pub const INTERNAL_ERROR: StatusCode = StatusCode(500);
    /// 503 Service Unavailable.
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);

    /// Whether this is a 2xx code.
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.0)
    }

    /// Classify the outcome of `op`.
    ///
    /// | code                     | outcome                                   |
    /// |--------------------------|-------------------------------------------|
    /// | 2xx                      | success                                   |
    /// | 401, 403                 | session expired                           |
    /// | 404                      | success for DELETE, permanent otherwise   |
    /// | 0, 408, 425, 429, 5xx    | transient                                 |
    /// | anything else            | permanent                                 |
    pub fn classify(self, op: Operation) -> StatusClass {
        match self.0 {
            200..=299 => StatusClass::Success,
            401 | 403 => StatusClass::AuthExpired,
            404 if op == Operation::Delete => StatusClass::Success,
            0 | 408 | 425 | 429 | 500..=599 => StatusClass::Transient,
            _ => StatusClass::Permanent,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            f.write_str("no response")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Kind of backend request, for status classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Upload an object.
    Put,
    /// Download an object.
    Get,
    /// Remove an object.
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Put => "PUT",
            Operation::Get => "GET",
            Operation::Delete => "DELETE",
        })
    }
}

/// Result of classifying a [`StatusCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// The request did what was asked.
    Success,
    /// The session must be renewed before retrying.
    AuthExpired,
    /// Worth retrying after a backoff.
    Transient,
    /// Retrying will not help.
    Permanent,
}

/// Name of a remote object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectId {
    /// A data block, `data_<inode>_<block>`.
    Block {
        /// Owning inode.
        inode: InodeId,
        /// Block index.
        block: BlockIndex,
    },
    /// An inode's meta file snapshot, `meta_<inode>`.
    Meta {
        /// Owning inode.
        inode: InodeId,
    },
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectId::Block { inode, block } => write!(f, "data_{inode}_{block}"),
            ObjectId::Meta { inode } => write!(f, "meta_{inode}"),
        }
    }
}

/// Failure to obtain or renew a backend session.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Credentials were rejected.
    #[error("backend authentication failed: {0}")]
    Auth(String),

    /// The backend could not be reached.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// Local I/O failure inside the backend client.
    #[error("backend I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Factory for backend sessions.
pub trait ObjectBackend: Send + Sync {
    /// Open a new authenticated connection.
    fn connect(&self) -> Result<Box<dyn BackendConnection>, BackendError>;
}

/// One backend session, used by a single transfer at a time.
pub trait BackendConnection: Send {
    /// Store `data` under `id`, replacing any existing object.
    fn put_object(&mut self, id: &ObjectId, data: &[u8]) -> StatusCode;

    /// Fetch the object stored under `id`.
    fn get_object(&mut self, id: &ObjectId) -> Result<Bytes, StatusCode>;

    /// Remove the object stored under `id`.
    fn delete_object(&mut self, id: &ObjectId) -> StatusCode;

    /// Renew the session after an expired-auth response.
    fn reauthenticate(&mut self) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_table() {
        use Operation::{Delete, Get, Put};
        assert_eq!(StatusCode(200).classify(Put), StatusClass::Success);
        assert_eq!(StatusCode(204).classify(Delete), StatusClass::Success);
        assert_eq!(StatusCode(401).classify(Get), StatusClass::AuthExpired);
        assert_eq!(StatusCode(403).classify(Put), StatusClass::AuthExpired);
        assert_eq!(StatusCode(404).classify(Delete), StatusClass::Success);
        assert_eq!(StatusCode(404).classify(Get), StatusClass::Permanent);
        assert_eq!(StatusCode(0).classify(Get), StatusClass::Transient);
        assert_eq!(StatusCode(429).classify(Put), StatusClass::Transient);
        assert_eq!(StatusCode(503).classify(Put), StatusClass::Transient);
        assert_eq!(StatusCode(400).classify(Put), StatusClass::Permanent);
        assert_eq!(StatusCode(302).classify(Get), StatusClass::Permanent);
    }

    #[test]
    fn test_object_names() {
        assert_eq!(ObjectId::Block { inode: 12, block: 3 }.to_string(), "data_12_3");
        assert_eq!(ObjectId::Meta { inode: 12 }.to_string(), "meta_12");
    }

    #[test]
    fn test_status_display() {
        assert_eq!(StatusCode(0).to_string(), "no response");
        assert_eq!(StatusCode(503).to_string(), "503");
    }
}
