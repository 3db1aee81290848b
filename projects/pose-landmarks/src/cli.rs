use crate::pipeline::types::DEFAULT_SAFETY_TOLERANCE;
use crate::video::Backend;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Video file to sample
    pub video: PathBuf,

    /// Sampling rate in frames per second
    #[arg(long, default_value_t = 30.0)]
    pub fps: f64,

    /// Landmark ids to keep, in output order (e.g. 11,12,23,24)
    #[arg(long, value_delimiter = ',')]
    pub keep_ids: Vec<u32>,

    /// Directory the CSV is written to
    #[arg(long, env = "POSE_LANDMARKS_OUTPUT_ROOT", default_value = ".")]
    pub output_root: PathBuf,

    /// BlazePose landmark model (ONNX)
    #[arg(long, env = "POSE_LANDMARKS_MODEL", default_value = "pose_landmark_full.onnx")]
    pub model: PathBuf,

    /// Video decoding backend
    #[arg(long, value_enum, env = "POSE_LANDMARKS_BACKEND", default_value = "ffmpeg")]
    pub backend: Backend,

    /// Poses scored below this are treated as "no pose"
    #[arg(long, default_value_t = 0.5)]
    pub min_pose_score: f32,

    /// Extra samples allowed beyond the duration-implied count before the loop is cut
    #[arg(
        long,
        env = "POSE_LANDMARKS_SAFETY_TOLERANCE",
        default_value_t = DEFAULT_SAFETY_TOLERANCE
    )]
    pub safety_tolerance: u64,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,

    /// Disable the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
