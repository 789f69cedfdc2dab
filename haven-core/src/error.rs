use thiserror::Error;

use crate::ipc::events::{Channel, ErrorKind};

/// All errors produced by haven-core.
#[derive(Debug, Error)]
pub enum HavenError {
    #[error("capability unsupported: {0}")]
    Unsupported(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("location unavailable: {0}")]
    LocationUnavailable(String),

    #[error("{channel} delivery failed after {attempts} attempt(s): {reason}")]
    ChannelDeliveryFailed {
        channel: Channel,
        attempts: u32,
        reason: String,
    },

    #[error("notification gateway error: {0}")]
    Gateway(String),

    #[error("points-of-interest query failed: {0}")]
    PoiQuery(String),

    #[error("invalid contact: {0}")]
    InvalidContact(String),

    #[error("engine is not running")]
    EngineStopped,

    #[error("operation timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HavenError {
    /// Classification surfaced to event subscribers, when one applies.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Unsupported(_) => Some(ErrorKind::Unsupported),
            Self::PermissionDenied(_) => Some(ErrorKind::PermissionDenied),
            Self::LocationUnavailable(_) => Some(ErrorKind::LocationUnavailable),
            Self::ChannelDeliveryFailed { .. } | Self::Gateway(_) => {
                Some(ErrorKind::ChannelDeliveryFailed)
            }
            Self::PoiQuery(_) => Some(ErrorKind::PoiQueryFailed),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, HavenError>;
