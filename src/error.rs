use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy shared by every pipeline stage.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("failed to load asset {source_key}: {reason}")]
    AssetLoad { source_key: String, reason: String },

    #[error("failed to parse vector pattern {source_key}: {reason}")]
    Parse { source_key: String, reason: String },

    #[error("drawing surface unavailable: {0}")]
    SurfaceUnavailable(String),

    #[error("pixel readback failed: {0}")]
    PixelReadback(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("dimension mismatch: expected {expected_width}x{expected_height}, got {actual_width}x{actual_height}")]
    DimensionMismatch {
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("rotation of {0} degrees does not preserve tileability")]
    NonTileableRotation(f32),

    #[error("rebuild superseded by a newer request")]
    Cancelled,

    #[error("failed to encode image: {0}")]
    Encode(String),
}

/// Serializable tag for [`PipelineError`], used in notices and events.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    AssetLoad,
    Parse,
    UnsupportedSurface,
    PixelReadback,
    InvalidParameter,
    Cancelled,
    Encode,
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::AssetLoad { .. } => FailureKind::AssetLoad,
            Self::Parse { .. } => FailureKind::Parse,
            Self::SurfaceUnavailable(_) => FailureKind::UnsupportedSurface,
            Self::PixelReadback(_) => FailureKind::PixelReadback,
            Self::InvalidParameter(_)
            | Self::DimensionMismatch { .. }
            | Self::NonTileableRotation(_) => FailureKind::InvalidParameter,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Encode(_) => FailureKind::Encode,
        }
    }

    pub(crate) fn asset_load(source_key: &str, reason: impl ToString) -> Self {
        Self::AssetLoad {
            source_key: source_key.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A recovered failure attached to a result instead of aborting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub kind: FailureKind,
    pub message: String,
}

impl Notice {
    pub fn from_error(err: &PipelineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
