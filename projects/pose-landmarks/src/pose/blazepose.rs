use super::{Landmark, LandmarkDetector, PoseLandmarks};
use anyhow::{anyhow, Context, Result};
use ndarray::Array4;
use opencv::core::{Mat, Scalar, Size, CV_32FC3};
use opencv::imgproc;
use opencv::prelude::*;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;

/// Square input edge of the BlazePose landmark model.
const INPUT_SIZE: i32 = 256;
/// The model emits 39 points; the last 6 are auxiliary ROI points.
const RAW_POINTS: usize = 39;
const VALUES_PER_POINT: usize = 5;
pub const POSE_LANDMARK_COUNT: usize = 33;

const LANDMARKS_OUTPUT: &str = "Identity";
const POSE_FLAG_OUTPUT: &str = "Identity_1";

/// BlazePose (full) landmark model run through ONNX Runtime.
///
/// Runs on the whole frame, letterboxed to 256x256, and reports the 33 body
/// landmarks with coordinates mapped back to the original frame.
pub struct BlazePoseDetector {
    session: Session,
    input_name: String,
    landmarks_output: String,
    pose_flag_output: String,
    min_pose_score: f32,
}

impl BlazePoseDetector {
    pub fn new(model_path: &Path, min_pose_score: f32) -> Result<Self> {
        if !model_path.exists() {
            return Err(anyhow!("Pose model not found: {}", model_path.display()));
        }

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(model_path)
            .context("Failed to load ONNX pose model")?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| anyhow!("Pose model has no inputs"))?;
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        let landmarks_output = pick_output(&output_names, LANDMARKS_OUTPUT, 0)?;
        let pose_flag_output = pick_output(&output_names, POSE_FLAG_OUTPUT, 1)?;

        tracing::info!(
            "BlazePoseDetector: loaded {}, input={}, landmarks={}, pose_flag={}",
            model_path.display(),
            input_name,
            landmarks_output,
            pose_flag_output
        );

        Ok(Self {
            session,
            input_name,
            landmarks_output,
            pose_flag_output,
            min_pose_score,
        })
    }
}

/// Prefer the conventional output name, fall back to position.
fn pick_output(names: &[String], preferred: &str, index: usize) -> Result<String> {
    if names.iter().any(|n| n == preferred) {
        return Ok(preferred.to_string());
    }
    names
        .get(index)
        .cloned()
        .ok_or_else(|| anyhow!("Pose model is missing output #{} ({})", index, preferred))
}

impl LandmarkDetector for BlazePoseDetector {
    type Frame = Mat;

    fn detect(&mut self, frame: &Mat, timestamp_ms: u64) -> Result<Option<PoseLandmarks>> {
        let (input, letterbox) = preprocess(frame)?;
        let input_tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input_tensor])
            .context("Inference failed")?;

        let raw: Vec<f32> = outputs[self.landmarks_output.as_str()]
            .try_extract_array::<f32>()
            .context("Failed to extract landmarks")?
            .iter()
            .copied()
            .collect();
        let pose_score = outputs[self.pose_flag_output.as_str()]
            .try_extract_array::<f32>()
            .context("Failed to extract pose flag")?
            .iter()
            .copied()
            .next()
            .unwrap_or(0.0);

        tracing::trace!(
            "BlazePoseDetector: t={}ms pose_score={:.3}",
            timestamp_ms,
            pose_score
        );

        Ok(decode_landmarks(&raw, pose_score, self.min_pose_score, &letterbox))
    }
}

/// Where the frame content sits inside the square model input, as fractions
/// of the input edge.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    pad_left: f32,
    pad_top: f32,
    content_width: f32,
    content_height: f32,
}

impl Letterbox {
    fn for_frame(frame_w: i32, frame_h: i32) -> (Self, Size) {
        let target = INPUT_SIZE as f32;
        let scale = (target / frame_w as f32).min(target / frame_h as f32);
        let new_w = ((frame_w as f32 * scale).round() as i32).clamp(1, INPUT_SIZE);
        let new_h = ((frame_h as f32 * scale).round() as i32).clamp(1, INPUT_SIZE);
        let pad_left = (INPUT_SIZE - new_w) / 2;
        let pad_top = (INPUT_SIZE - new_h) / 2;

        let letterbox = Self {
            pad_left: pad_left as f32 / target,
            pad_top: pad_top as f32 / target,
            content_width: new_w as f32 / target,
            content_height: new_h as f32 / target,
        };
        (letterbox, Size::new(new_w, new_h))
    }

    /// Maps a point in input-normalized space back to frame-normalized space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_left) / self.content_width,
            (y - self.pad_top) / self.content_height,
        )
    }
}

/// BGR frame -> letterboxed RGB NHWC tensor in `[0, 1]`.
fn preprocess(frame: &Mat) -> Result<(Array4<f32>, Letterbox)> {
    if frame.empty() {
        return Err(anyhow!("Cannot run pose model on an empty frame"));
    }

    let (letterbox, content) = Letterbox::for_frame(frame.cols(), frame.rows());

    let mut rgb = Mat::default();
    imgproc::cvt_color_def(frame, &mut rgb, imgproc::COLOR_BGR2RGB)?;
    let mut resized = Mat::default();
    imgproc::resize(&rgb, &mut resized, content, 0.0, 0.0, imgproc::INTER_LINEAR)?;

    let pad_left = (INPUT_SIZE - content.width) / 2;
    let pad_top = (INPUT_SIZE - content.height) / 2;
    let mut padded = Mat::default();
    opencv::core::copy_make_border(
        &resized,
        &mut padded,
        pad_top,
        INPUT_SIZE - content.height - pad_top,
        pad_left,
        INPUT_SIZE - content.width - pad_left,
        opencv::core::BORDER_CONSTANT,
        Scalar::all(0.0),
    )?;

    let mut float_mat = Mat::default();
    padded.convert_to(&mut float_mat, CV_32FC3, 1.0 / 255.0, 0.0)?;

    let side = INPUT_SIZE as usize;
    let row_floats = side * 3;
    let mut tensor = Array4::<f32>::zeros((1, side, side, 3));
    let dst = tensor
        .as_slice_mut()
        .ok_or_else(|| anyhow!("Input tensor is not contiguous"))?;
    let data = float_mat.data_bytes()?;
    let step = float_mat.mat_step().get(0);
    for y in 0..side {
        let start = y * step;
        let row = &data[start..start + row_floats * std::mem::size_of::<f32>()];
        for (x, chunk) in row.chunks_exact(4).enumerate() {
            dst[y * row_floats + x] = f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
    }

    Ok((tensor, letterbox))
}

fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

/// Turns the raw `39 x (x, y, z, visibility, presence)` output into landmarks.
/// Returns `None` when the pose flag is below `min_pose_score`.
fn decode_landmarks(
    raw: &[f32],
    pose_score: f32,
    min_pose_score: f32,
    letterbox: &Letterbox,
) -> Option<PoseLandmarks> {
    if pose_score < min_pose_score || raw.len() < RAW_POINTS * VALUES_PER_POINT {
        return None;
    }

    let side = INPUT_SIZE as f32;
    let landmarks = raw
        .chunks_exact(VALUES_PER_POINT)
        .take(POSE_LANDMARK_COUNT)
        .enumerate()
        .map(|(id, v)| {
            let (x, y) = letterbox.unmap(v[0] / side, v[1] / side);
            let z = v[2] / side / letterbox.content_width;
            (id as u32, Landmark::new(x, y, z, sigmoid(v[3])))
        })
        .collect();

    Some(landmarks)
}
