// Extraction job: the entry point callers use.
//
// Opens the decoder and pose model, allocates the timestamped output file and
// runs the pipeline on a blocking worker so the caller's runtime stays free.

use crate::error::ExtractError;
use crate::output::allocate_output_path;
use crate::pipeline::extractor::ExtractionPipeline;
use crate::pipeline::observer::ExtractionObserver;
use crate::pipeline::types::{CancelToken, ExtractionReport, ExtractionRequest, PipelineConfig};
use crate::pose::blazepose::BlazePoseDetector;
use crate::video::{open_frame_source, Backend};
use std::path::PathBuf;
use std::sync::Arc;

/// Everything about a run that does not come from the request itself.
#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    pub backend: Backend,
    pub model_path: PathBuf,
    pub min_pose_score: f32,
    pub output_root: PathBuf,
    pub pipeline: PipelineConfig,
}

/// Samples `request.video_path` and writes the landmark CSV.
///
/// Resolves exactly once, after the output has been finalized, with the report
/// (which carries the output path) or the error that ended the run.
pub async fn extract_landmarks_to_csv(
    request: ExtractionRequest,
    settings: ExtractionSettings,
    observer: Arc<dyn ExtractionObserver>,
    cancel: CancelToken,
) -> Result<ExtractionReport, ExtractError> {
    request.validate()?;

    tokio::task::spawn_blocking(move || {
        run_extraction(&request, &settings, observer.as_ref(), cancel)
    })
    .await
    .map_err(|e| ExtractError::Worker(e.to_string()))?
}

/// Blocking body of [`extract_landmarks_to_csv`].
pub fn run_extraction(
    request: &ExtractionRequest,
    settings: &ExtractionSettings,
    observer: &dyn ExtractionObserver,
    cancel: CancelToken,
) -> Result<ExtractionReport, ExtractError> {
    let source = open_frame_source(settings.backend, &request.video_path)
        .map_err(|e| ExtractError::source_unreadable(&request.video_path, format!("{:#}", e)))?;

    let detector = BlazePoseDetector::new(&settings.model_path, settings.min_pose_score)
        .map_err(|e| ExtractError::DetectorUnavailable(format!("{:#}", e)))?;

    let output_path = allocate_output_path(&settings.output_root)?;
    tracing::info!(
        "Extracting landmarks from {} with {:?} backend into {}",
        request.video_path.display(),
        settings.backend,
        output_path.display()
    );

    ExtractionPipeline::new(source, detector, observer)
        .with_config(settings.pipeline.clone())
        .with_cancel(cancel)
        .run(request, &output_path)
}
