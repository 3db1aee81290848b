mod cli;
mod error;
mod output;
mod pipeline;
mod pose;
mod video;

use anyhow::Result;
use cli::Args;
use pipeline::job::{extract_landmarks_to_csv, ExtractionSettings};
use pipeline::observer::{ExtractionObserver, ProgressObserver, TracingObserver};
use pipeline::types::{CancelToken, ExtractionRequest, PipelineConfig};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse_args();

    let request = ExtractionRequest::new(args.video.clone(), args.fps, args.keep_ids.clone());
    let settings = ExtractionSettings {
        backend: args.backend,
        model_path: args.model.clone(),
        min_pose_score: args.min_pose_score,
        output_root: args.output_root.clone(),
        pipeline: PipelineConfig {
            safety_tolerance: args.safety_tolerance,
        },
    };
    let observer: Arc<dyn ExtractionObserver> = if args.no_progress {
        Arc::new(TracingObserver::default())
    } else {
        Arc::new(ProgressObserver::new())
    };

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current frame");
            on_interrupt.cancel();
        }
    });

    let report = extract_landmarks_to_csv(request, settings, observer, cancel).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.output_path.display());
    }

    Ok(())
}
