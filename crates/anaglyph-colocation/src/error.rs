//! Error taxonomy for the colocation core.
//!
//! Anchor-flow errors are retried by the anchor's own loop; radio errors are
//! only logged; [`Interrupted`] ends work silently.

use anaglyph_xr::AnchorId;
use thiserror::Error;

/// Failure reported by the discovery radio, with its platform status code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("radio error {code}: {message}")]
pub struct RadioError {
    pub code: i32,
    pub message: String,
}

impl RadioError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

pub type RadioResult = Result<(), RadioError>;

/// Retryable failures of the share and reconcile flows.
#[derive(Debug, Error)]
pub enum AnchorError {
    #[error("failed to localize anchor {0}")]
    LocalizationFailed(AnchorId),
    #[error("failed to share anchor {id}: {reason}")]
    ShareFailed { id: AnchorId, reason: String },
    #[error("failed to download anchor {id}: {reason}")]
    DownloadFailed { id: AnchorId, reason: String },
    #[error("failed to bind anchor {id}: {reason}")]
    BindFailed { id: AnchorId, reason: String },
    #[error("replication rejected write: {0}")]
    Replication(#[from] ReplicationError),
}

/// Work abandoned on purpose; never retried and never logged as an error.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum Interrupted {
    #[error("operation canceled")]
    Canceled,
    #[error("ownership moved to another peer")]
    OwnershipLost,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplicationError {
    #[error("peer {peer} does not own entity {entity}")]
    NotOwner { entity: u64, peer: u64 },
    #[error("entity {entity} already carries anchor {existing}")]
    IdentifierAlreadyAssigned { entity: u64, existing: AnchorId },
    #[error("entity {0} is shared; its original pose is fixed")]
    PoseAlreadyPublished(u64),
    #[error("a nil anchor identifier cannot be published")]
    NilIdentifier,
    #[error("unknown entity {0}")]
    UnknownEntity(u64),
}
