use crate::error::ExtractError;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Microseconds since the start of the video.
pub type TimestampUs = u64;

/// Default `+N` slack added to the expected sample count before the loop is cut.
pub const DEFAULT_SAFETY_TOLERANCE: u64 = 10;

/// Caller input for one extraction: which video, how often, which landmarks.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionRequest {
    pub video_path: PathBuf,
    pub fps: f64,
    pub keep_ids: Vec<u32>,
}

impl ExtractionRequest {
    pub fn new(video_path: impl Into<PathBuf>, fps: f64, keep_ids: Vec<u32>) -> Self {
        Self {
            video_path: video_path.into(),
            fps,
            keep_ids,
        }
    }

    pub fn validate(&self) -> Result<(), ExtractError> {
        if self.video_path.as_os_str().is_empty() {
            return Err(ExtractError::InvalidRequest("video path is empty".to_string()));
        }
        if !self.fps.is_finite() || self.fps <= 0.0 {
            return Err(ExtractError::InvalidRequest(format!(
                "fps must be a positive number, got {}",
                self.fps
            )));
        }
        Ok(())
    }
}

/// Immutable description of what to sample, built once per run.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleSpec {
    pub duration_ms: u64,
    pub fps: f64,
    /// Landmark ids to keep, in output order. Duplicates are kept as-is.
    pub keep_ids: Vec<u32>,
}

impl SampleSpec {
    pub fn new(duration_ms: u64, fps: f64, keep_ids: Vec<u32>) -> Self {
        Self {
            duration_ms,
            fps,
            keep_ids,
        }
    }

    /// `floor(D * fps / 1000)`, the sample count the duration metadata implies.
    pub fn expected_samples(&self) -> u64 {
        (self.duration_ms as f64 * self.fps / 1000.0).floor() as u64
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub safety_tolerance: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            safety_tolerance: DEFAULT_SAFETY_TOLERANCE,
        }
    }
}

/// Cooperative stop flag checked at the top of every sample iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// What happened to a single scheduled sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleOutcome {
    Detected,
    /// The detector saw the frame but found no pose.
    NoPose,
    /// The source had no frame near the timestamp.
    NoFrame,
}

#[derive(Debug, Clone, Copy)]
pub struct SampleEvent {
    pub frame_index: u64,
    pub timestamp_us: TimestampUs,
    pub outcome: SampleOutcome,
}

/// Why the sample loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Completed,
    SafetyBound,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionReport {
    pub output_path: PathBuf,
    pub rows_written: u64,
    pub frames_missing: u64,
    pub poses_missing: u64,
    pub expected_samples: u64,
    pub sample_limit: u64,
    pub termination: Termination,
}
