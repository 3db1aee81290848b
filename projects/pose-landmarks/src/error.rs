use std::path::PathBuf;
use thiserror::Error;

/// Failures that end an extraction run.
///
/// Per-sample problems (no frame near a timestamp, no pose in a frame) are not
/// errors: they become all-`NaN` rows and are counted in the report.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("video source unreadable at {path:?}: {reason}")]
    SourceUnreadable { path: PathBuf, reason: String },

    #[error("landmark detector unavailable: {0}")]
    DetectorUnavailable(String),

    #[error("landmark detection failed at frame {frame_index}: {source}")]
    Detection {
        frame_index: u64,
        #[source]
        source: anyhow::Error,
    },

    /// The detector runs in video mode and must never see time go backwards.
    #[error("detector timestamp went backwards: {current_ms} ms after {previous_ms} ms")]
    NonMonotonicTimestamp { previous_ms: u64, current_ms: u64 },

    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),

    #[error("failed to write csv row: {0}")]
    Csv(#[from] csv::Error),

    #[error("extraction worker failed: {0}")]
    Worker(String),
}

impl ExtractError {
    pub fn source_unreadable(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::SourceUnreadable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
