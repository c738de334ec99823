//! Error taxonomy for block lifecycle operations.
//!
//! Every failure the core can surface is a [`BlockError`]. The variants follow
//! the retry classes the transfer engine needs: transient backend failures are
//! retried with backoff, expired sessions trigger one reauthentication, and
//! everything else aborts. [`BlockError::to_errno`] is what the FUSE layer
//! hands back to the kernel.

use std::io;

use thiserror::Error;

use crate::backend::StatusCode;
use crate::{BlockIndex, InodeId};

/// How a failed transfer attempt should be handled by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Back off and try again with a fresh connection.
    Retry,
    /// Reauthenticate the connection, then try again.
    Reauthenticate,
    /// Give up and surface the error.
    Abort,
}

/// Errors produced by the block cache core.
#[derive(Debug, Error)]
pub enum BlockError {
    /// Network failure, timeout, or 5xx response. Retried with backoff.
    #[error("transient backend failure on {object} (status {status})")]
    TransientBackend {
        /// Remote object name.
        object: String,
        /// Last status observed.
        status: StatusCode,
    },

    /// The backend session expired; reauthentication is required.
    #[error("backend session expired while accessing {object}")]
    AuthExpired {
        /// Remote object name.
        object: String,
    },

    /// A 4xx (other than auth) or otherwise unexpected status. Never retried.
    #[error("permanent backend failure on {object} (status {status})")]
    PermanentBackend {
        /// Remote object name.
        object: String,
        /// Status returned by the backend.
        status: StatusCode,
    },

    /// The backend could not even be connected to.
    #[error("backend connection failed: {0}")]
    Connect(#[from] crate::backend::BackendError),

    /// Local disk failure (full disk, permissions, missing directory).
    #[error("local I/O error while {context}: {source}")]
    LocalIo {
        /// What the core was doing when the error happened.
        context: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The reclaimer cannot free enough clean data to get under the hard limit.
    #[error("cache capacity exhausted: {cache_size} bytes cached, hard limit {hard_limit}")]
    CapacityExhausted {
        /// Current cache size in bytes.
        cache_size: u64,
        /// Configured hard limit in bytes.
        hard_limit: u64,
    },

    /// The ledger was observed in a state that should be impossible.
    #[error("ledger consistency error on inode {inode} block {block}: {detail}")]
    Consistency {
        /// Owning inode.
        inode: InodeId,
        /// Block index.
        block: BlockIndex,
        /// Description of the impossible state.
        detail: String,
    },

    /// A meta file could not be parsed at all.
    #[error("corrupt ledger for inode {inode}: {detail}")]
    CorruptLedger {
        /// Owning inode.
        inode: InodeId,
        /// What was wrong.
        detail: String,
    },

    /// A write exceeded the configured block size.
    #[error("block of {size} bytes exceeds maximum block size {max}")]
    BlockTooLarge {
        /// Size of the rejected payload.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The configuration cannot be run with.
    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// The engine has been shut down; no new work is accepted.
    #[error("block cache has been shut down")]
    ShutDown,
}

impl BlockError {
    /// Wrap an I/O error with a short description of the failed step.
    pub fn local_io(context: impl Into<String>, source: io::Error) -> Self {
        BlockError::LocalIo {
            context: context.into(),
            source,
        }
    }

    /// Build a consistency error.
    pub fn consistency(inode: InodeId, block: BlockIndex, detail: impl Into<String>) -> Self {
        BlockError::Consistency {
            inode,
            block,
            detail: detail.into(),
        }
    }

    /// Copy of this error for a second caller.
    ///
    /// I/O sources are rebuilt from their kind and message, and connection
    /// errors are flattened into `Unreachable`.
    pub fn clone_lossy(&self) -> Self {
        match self {
            BlockError::TransientBackend { object, status } => BlockError::TransientBackend {
                object: object.clone(),
                status: *status,
            },
            BlockError::AuthExpired { object } => BlockError::AuthExpired {
                object: object.clone(),
            },
            BlockError::PermanentBackend { object, status } => BlockError::PermanentBackend {
                object: object.clone(),
                status: *status,
            },
            BlockError::Connect(e) => {
                BlockError::Connect(crate::backend::BackendError::Unreachable(e.to_string()))
            }
            BlockError::LocalIo { context, source } => BlockError::LocalIo {
                context: context.clone(),
                source: source
                    .raw_os_error()
                    .map_or_else(|| io::Error::new(source.kind(), source.to_string()), io::Error::from_raw_os_error),
            },
            BlockError::CapacityExhausted {
                cache_size,
                hard_limit,
            } => BlockError::CapacityExhausted {
                cache_size: *cache_size,
                hard_limit: *hard_limit,
            },
            BlockError::Consistency {
                inode,
                block,
                detail,
            } => BlockError::consistency(*inode, *block, detail.clone()),
            BlockError::CorruptLedger { inode, detail } => BlockError::CorruptLedger {
                inode: *inode,
                detail: detail.clone(),
            },
            BlockError::BlockTooLarge { size, max } => BlockError::BlockTooLarge {
                size: *size,
                max: *max,
            },
            BlockError::Config(e) => BlockError::Config(e.clone()),
            BlockError::ShutDown => BlockError::ShutDown,
        }
    }

    /// Retry class consumed by the transfer engine's retry state machine.
    pub fn class(&self) -> RetryClass {
        match self {
            BlockError::TransientBackend { .. } | BlockError::Connect(_) => RetryClass::Retry,
            BlockError::AuthExpired { .. } => RetryClass::Reauthenticate,
            _ => RetryClass::Abort,
        }
    }

    /// Converts this error to a libc error code for FUSE.
    pub fn to_errno(&self) -> i32 {
        match self {
            BlockError::TransientBackend { .. }
            | BlockError::AuthExpired { .. }
            | BlockError::PermanentBackend { .. }
            | BlockError::Connect(_)
            | BlockError::Consistency { .. }
            | BlockError::CorruptLedger { .. } => libc::EIO,
            BlockError::LocalIo { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            BlockError::CapacityExhausted { .. } => libc::ENOSPC,
            BlockError::BlockTooLarge { .. } => libc::EFBIG,
            BlockError::Config(_) => libc::EINVAL,
            BlockError::ShutDown => libc::ESHUTDOWN,
        }
    }
}

/// Result type for block cache operations.
pub type BlockResult<T> = Result<T, BlockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classes() {
        let transient = BlockError::TransientBackend {
            object: "data_1_0".into(),
            status: StatusCode(503),
        };
        assert_eq!(transient.class(), RetryClass::Retry);

        let auth = BlockError::AuthExpired {
            object: "data_1_0".into(),
        };
        assert_eq!(auth.class(), RetryClass::Reauthenticate);

        let permanent = BlockError::PermanentBackend {
            object: "data_1_0".into(),
            status: StatusCode(400),
        };
        assert_eq!(permanent.class(), RetryClass::Abort);
    }

    #[test]
    fn test_errno_mapping() {
        let e = BlockError::CapacityExhausted {
            cache_size: 10,
            hard_limit: 5,
        };
        assert_eq!(e.to_errno(), libc::ENOSPC);

        let e = BlockError::BlockTooLarge { size: 2, max: 1 };
        assert_eq!(e.to_errno(), libc::EFBIG);

        let e = BlockError::PermanentBackend {
            object: "data_1_0".into(),
            status: StatusCode(404),
        };
        assert_eq!(e.to_errno(), libc::EIO);

        assert_eq!(BlockError::ShutDown.to_errno(), libc::ESHUTDOWN);
    }

    #[test]
    fn test_local_io_passthrough() {
        let e = BlockError::local_io("writing block", io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(e.to_errno(), libc::ENOSPC);

        let e = BlockError::local_io("writing block", io::Error::other("custom"));
        assert_eq!(e.to_errno(), libc::EIO);
    }

    #[test]
    fn test_clone_lossy_keeps_errno() {
        let e = BlockError::local_io("reading block", io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(e.clone_lossy().to_errno(), libc::EACCES);
        let e = BlockError::CapacityExhausted {
            cache_size: 1,
            hard_limit: 1,
        };
        assert_eq!(e.clone_lossy().to_errno(), libc::ENOSPC);
    }

    #[test]
    fn test_display_mentions_location() {
        let e = BlockError::consistency(7, 3, "transient state after recovery");
        let msg = e.to_string();
        assert!(msg.contains("inode 7"));
        assert!(msg.contains("block 3"));
    }
}
