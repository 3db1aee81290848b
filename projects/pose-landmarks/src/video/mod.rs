pub mod ffmpeg_source;
pub mod opencv_source;

use anyhow::Result;
use clap::ValueEnum;
use opencv::core::Mat;
use std::path::Path;

use ffmpeg_source::FfmpegFrameSource;
use opencv_source::OpencvFrameSource;

/// Random access to decoded frames by timestamp.
pub trait FrameSource {
    type Frame;

    /// Total duration in milliseconds. Fails if the container carries no usable
    /// duration metadata.
    fn duration_millis(&mut self) -> Result<u64>;

    /// The decoded frame whose presentation time is closest to `timestamp_us`,
    /// or `None` if there is no frame there. Lookup failures are reported as
    /// `None`, never as errors.
    fn frame_near(&mut self, timestamp_us: u64) -> Option<Self::Frame>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    type Frame = S::Frame;

    fn duration_millis(&mut self) -> Result<u64> {
        (**self).duration_millis()
    }

    fn frame_near(&mut self, timestamp_us: u64) -> Option<Self::Frame> {
        (**self).frame_near(timestamp_us)
    }
}

/// Decoder backend used to open a video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    Ffmpeg,
    Opencv,
}

pub fn open_frame_source(
    backend: Backend,
    path: &Path,
) -> Result<Box<dyn FrameSource<Frame = Mat>>> {
    let source: Box<dyn FrameSource<Frame = Mat>> = match backend {
        Backend::Ffmpeg => Box::new(FfmpegFrameSource::open(path)?),
        Backend::Opencv => Box::new(OpencvFrameSource::open(path)?),
    };
    Ok(source)
}
