use super::FrameSource;
use anyhow::{anyhow, Result};
use opencv::{
    prelude::*,
    videoio::{
        VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_COUNT, CAP_PROP_HW_ACCELERATION,
        CAP_PROP_POS_MSEC, VIDEO_ACCELERATION_ANY,
    },
};
use std::path::Path;

/// Frame source backed by OpenCV's `VideoCapture`, seeking by milliseconds.
pub struct OpencvFrameSource {
    capture: VideoCapture,
    source_fps: f64,
    frame_count: f64,
}

impl OpencvFrameSource {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow!("Video file not found: {}", path.display()));
        }
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("Video path is not valid UTF-8: {}", path.display()))?;

        let mut capture = VideoCapture::from_file(path_str, CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(anyhow!("Failed to open video file: {}", path.display()));
        }

        if let Ok(enabled) = capture.set(CAP_PROP_HW_ACCELERATION, VIDEO_ACCELERATION_ANY as f64) {
            tracing::debug!("OpencvFrameSource: hardware acceleration enabled={}", enabled);
        }

        let source_fps = capture.get(CAP_PROP_FPS)?;
        let frame_count = capture.get(CAP_PROP_FRAME_COUNT)?;

        tracing::info!(
            "OpencvFrameSource: opened {}, fps={:.2}, stream_frames={}",
            path.display(),
            source_fps,
            frame_count
        );

        Ok(Self {
            capture,
            source_fps,
            frame_count,
        })
    }

    fn read_at(&mut self, timestamp_us: u64) -> Result<Option<Mat>> {
        self.capture
            .set(CAP_PROP_POS_MSEC, timestamp_us as f64 / 1000.0)?;
        let mut frame = Mat::default();
        if !self.capture.read(&mut frame)? || frame.empty() {
            return Ok(None);
        }
        Ok(Some(frame))
    }
}

impl FrameSource for OpencvFrameSource {
    type Frame = Mat;

    fn duration_millis(&mut self) -> Result<u64> {
        if self.source_fps <= 0.0 || self.frame_count <= 0.0 {
            return Err(anyhow!(
                "No duration metadata (fps={}, frames={})",
                self.source_fps,
                self.frame_count
            ));
        }
        Ok((self.frame_count / self.source_fps * 1000.0).round() as u64)
    }

    fn frame_near(&mut self, timestamp_us: u64) -> Option<Mat> {
        match self.read_at(timestamp_us) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("OpencvFrameSource: no frame at {}us: {}", timestamp_us, e);
                None
            }
        }
    }
}
