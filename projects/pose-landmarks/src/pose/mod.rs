// Pose landmark types and the detector seam

pub mod blazepose;

use anyhow::Result;
use std::collections::BTreeMap;

/// One body keypoint as reported by the detector.
///
/// `x`/`y` are normalized to the frame, `z` is depth on roughly the same
/// scale as `x`, and `visibility` is a confidence in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub visibility: f32,
}

impl Landmark {
    pub fn new(x: f32, y: f32, z: f32, visibility: f32) -> Self {
        Self { x, y, z, visibility }
    }
}

/// Landmarks of the primary detected pose, keyed by landmark id.
pub type PoseLandmarks = BTreeMap<u32, Landmark>;

/// Per-frame pose estimation in video mode.
///
/// Implementations may keep tracking state between calls, so `timestamp_ms`
/// must be non-decreasing across calls on the same instance. Callers that
/// break this get a contract error, not degraded output.
pub trait LandmarkDetector {
    type Frame;

    /// Returns the primary pose's landmarks, or `None` if no pose was found.
    fn detect(&mut self, frame: &Self::Frame, timestamp_ms: u64) -> Result<Option<PoseLandmarks>>;
}

impl<D: LandmarkDetector + ?Sized> LandmarkDetector for Box<D> {
    type Frame = D::Frame;

    fn detect(&mut self, frame: &Self::Frame, timestamp_ms: u64) -> Result<Option<PoseLandmarks>> {
        (**self).detect(frame, timestamp_ms)
    }
}
