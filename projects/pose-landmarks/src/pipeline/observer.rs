// Observability hooks for the extraction loop

use crate::pipeline::types::{ExtractionReport, SampleEvent, SampleOutcome, SampleSpec};
use indicatif::{ProgressBar, ProgressStyle};

/// Receives structured progress from an extraction run.
///
/// Every method has a no-op default so observers only implement what they need.
pub trait ExtractionObserver: Send + Sync {
    fn on_start(&self, _spec: &SampleSpec, _scheduled: u64) {}
    fn on_sample(&self, _event: &SampleEvent) {}
    /// The loop produced more samples than the duration implies and was cut.
    fn on_safety_bound(&self, _frame_index: u64, _limit: u64) {}
    fn on_cancelled(&self, _frame_index: u64) {}
    fn on_finish(&self, _report: &ExtractionReport) {}
}

/// Discards every event.
#[cfg(test)]
pub struct NoopObserver;

#[cfg(test)]
impl ExtractionObserver for NoopObserver {}

/// Logs through `tracing`: a debug line every `every` samples, warnings for
/// truncated runs.
pub struct TracingObserver {
    every: u64,
}

impl TracingObserver {
    pub fn new(every: u64) -> Self {
        Self { every: every.max(1) }
    }
}

impl Default for TracingObserver {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ExtractionObserver for TracingObserver {
    fn on_start(&self, spec: &SampleSpec, scheduled: u64) {
        tracing::info!(
            "Extraction started: duration={}ms fps={} ids={:?} scheduled_samples={}",
            spec.duration_ms,
            spec.fps,
            spec.keep_ids,
            scheduled
        );
    }

    fn on_sample(&self, event: &SampleEvent) {
        if event.frame_index % self.every == 0 {
            tracing::debug!(
                "Processing frame={} time_us={} outcome={:?}",
                event.frame_index,
                event.timestamp_us,
                event.outcome
            );
        }
        if event.outcome == SampleOutcome::NoFrame {
            tracing::debug!(
                "No frame near {}us, writing missing row {}",
                event.timestamp_us,
                event.frame_index
            );
        }
    }

    fn on_safety_bound(&self, frame_index: u64, limit: u64) {
        tracing::warn!(
            "Breaking sample loop: frame index {} exceeded expected limit {}",
            frame_index,
            limit
        );
    }

    fn on_cancelled(&self, frame_index: u64) {
        tracing::warn!("Extraction cancelled before frame {}", frame_index);
    }

    fn on_finish(&self, report: &ExtractionReport) {
        tracing::info!(
            "Extraction finished ({:?}): rows={} missing_frames={} missing_poses={} -> {}",
            report.termination,
            report.rows_written,
            report.frames_missing,
            report.poses_missing,
            report.output_path.display()
        );
    }
}

/// Terminal progress bar on top of [`TracingObserver`].
pub struct ProgressObserver {
    pb: ProgressBar,
    inner: TracingObserver,
}

impl ProgressObserver {
    pub fn new() -> Self {
        let pb = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec:.1.yellow} fps, {eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        Self {
            pb,
            inner: TracingObserver::default(),
        }
    }
}

impl Default for ProgressObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractionObserver for ProgressObserver {
    fn on_start(&self, spec: &SampleSpec, scheduled: u64) {
        self.pb.set_length(scheduled);
        self.inner.on_start(spec, scheduled);
    }

    fn on_sample(&self, event: &SampleEvent) {
        self.pb.inc(1);
        self.inner.on_sample(event);
    }

    fn on_safety_bound(&self, frame_index: u64, limit: u64) {
        self.inner.on_safety_bound(frame_index, limit);
    }

    fn on_cancelled(&self, frame_index: u64) {
        self.pb.abandon_with_message("Cancelled");
        self.inner.on_cancelled(frame_index);
    }

    fn on_finish(&self, report: &ExtractionReport) {
        if !self.pb.is_finished() {
            self.pb.finish_with_message("Done");
        }
        self.inner.on_finish(report);
    }
}
