#![forbid(unsafe_code)]

pub mod adapter;
pub mod align;
pub mod sim;
pub mod types;

pub use adapter::{AnchorStore, TrackingRig, UnboundAnchor};
pub use align::{align_tracking_space, flatten_yaw, seed_pose};
pub use types::{AnchorId, LocalAnchorHandle, Pose};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum XrError {
    #[error("anchor platform unavailable: {0}")]
    Unavailable(String),
    #[error("localization failed: {0}")]
    Localization(String),
    #[error("share failed: {0}")]
    Share(String),
    #[error("download failed: {0}")]
    Download(String),
    #[error("bind failed: {0}")]
    Bind(String),
}

pub type XrResult<T> = Result<T, XrError>;
