// Extraction pipeline: samples a video, runs pose detection on each sampled
// frame and writes one CSV row per sample.

use crate::error::ExtractError;
use crate::pipeline::csv_writer::LandmarkCsvWriter;
use crate::pipeline::observer::ExtractionObserver;
use crate::pipeline::schedule::SampleSchedule;
use crate::pipeline::types::{
    CancelToken, ExtractionReport, ExtractionRequest, PipelineConfig, SampleEvent, SampleOutcome,
    SampleSpec, Termination, TimestampUs,
};
use crate::pose::LandmarkDetector;
use crate::video::FrameSource;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Rejects detector timestamps that go backwards.
#[derive(Debug, Default)]
struct TimestampGuard {
    last_ms: Option<u64>,
}

impl TimestampGuard {
    fn check(&mut self, current_ms: u64) -> Result<(), ExtractError> {
        if let Some(previous_ms) = self.last_ms {
            if current_ms < previous_ms {
                return Err(ExtractError::NonMonotonicTimestamp {
                    previous_ms,
                    current_ms,
                });
            }
        }
        self.last_ms = Some(current_ms);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LoopSummary {
    rows_written: u64,
    frames_missing: u64,
    poses_missing: u64,
    termination: Option<Termination>,
}

/// One sequential extraction run.
///
/// Owns the frame source and detector for its whole lifetime; both are
/// dropped when `run` returns, whatever the outcome.
pub struct ExtractionPipeline<'a, S, D> {
    source: S,
    detector: D,
    observer: &'a dyn ExtractionObserver,
    config: PipelineConfig,
    cancel: CancelToken,
    guard: TimestampGuard,
}

impl<'a, S, D> ExtractionPipeline<'a, S, D>
where
    S: FrameSource,
    D: LandmarkDetector<Frame = S::Frame>,
{
    pub fn new(source: S, detector: D, observer: &'a dyn ExtractionObserver) -> Self {
        Self {
            source,
            detector,
            observer,
            config: PipelineConfig::default(),
            cancel: CancelToken::new(),
            guard: TimestampGuard::default(),
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs the whole extraction and writes the CSV to `output_path`.
    ///
    /// The output file is only created once the source duration is known, so
    /// an unreadable source leaves nothing behind. A fatal error after that
    /// removes the partial file.
    pub fn run(
        mut self,
        request: &ExtractionRequest,
        output_path: &Path,
    ) -> Result<ExtractionReport, ExtractError> {
        request.validate()?;

        let duration_ms = self
            .source
            .duration_millis()
            .map_err(|e| ExtractError::source_unreadable(&request.video_path, format!("{:#}", e)))?;
        let spec = SampleSpec::new(duration_ms, request.fps, request.keep_ids.clone());
        let schedule = SampleSchedule::new(spec.duration_ms, spec.fps);
        let limit = self.sample_limit(&spec);

        self.observer
            .on_start(&spec, schedule.len().min(limit.saturating_add(1)));

        let file = File::create(output_path)?;
        let mut writer = LandmarkCsvWriter::new(file, &spec.keep_ids);

        let summary = writer
            .write_header()
            .map_err(ExtractError::from)
            .and_then(|_| self.sample_loop(&spec, schedule, &mut writer))
            .and_then(|summary| {
                writer.finish()?;
                Ok(summary)
            });

        let summary = match summary {
            Ok(summary) => summary,
            Err(e) => {
                if let Err(rm) = fs::remove_file(output_path) {
                    tracing::warn!(
                        "Failed to remove partial output {}: {}",
                        output_path.display(),
                        rm
                    );
                }
                return Err(e);
            }
        };

        let report = ExtractionReport {
            output_path: output_path.to_path_buf(),
            rows_written: summary.rows_written,
            frames_missing: summary.frames_missing,
            poses_missing: summary.poses_missing,
            expected_samples: spec.expected_samples(),
            sample_limit: limit,
            termination: summary.termination.unwrap_or(Termination::Completed),
        };
        self.observer.on_finish(&report);

        Ok(report)
    }

    /// Highest frame index the loop may write: `floor(D * fps / 1000) + tolerance`.
    fn sample_limit(&self, spec: &SampleSpec) -> u64 {
        spec.expected_samples()
            .saturating_add(self.config.safety_tolerance)
    }

    fn sample_loop<W, I>(
        &mut self,
        spec: &SampleSpec,
        timestamps: I,
        writer: &mut LandmarkCsvWriter<W>,
    ) -> Result<LoopSummary, ExtractError>
    where
        W: Write,
        I: IntoIterator<Item = TimestampUs>,
    {
        let limit = self.sample_limit(spec);
        let mut summary = LoopSummary::default();
        let mut frame_index: u64 = 0;

        for timestamp_us in timestamps {
            if self.cancel.is_cancelled() {
                self.observer.on_cancelled(frame_index);
                summary.termination = Some(Termination::Cancelled);
                break;
            }
            if frame_index > limit {
                self.observer.on_safety_bound(frame_index, limit);
                summary.termination = Some(Termination::SafetyBound);
                break;
            }

            let (landmarks, outcome) = match self.source.frame_near(timestamp_us) {
                Some(frame) => {
                    // The detector works in whole milliseconds.
                    let timestamp_ms = timestamp_us / 1000;
                    self.guard.check(timestamp_ms)?;
                    let detected = self
                        .detector
                        .detect(&frame, timestamp_ms)
                        .map_err(|source| ExtractError::Detection {
                            frame_index,
                            source,
                        })?;
                    drop(frame);
                    match detected {
                        Some(landmarks) => (Some(landmarks), SampleOutcome::Detected),
                        None => (None, SampleOutcome::NoPose),
                    }
                }
                None => (None, SampleOutcome::NoFrame),
            };

            writer.write_row(frame_index, landmarks.as_ref())?;

            match outcome {
                SampleOutcome::NoFrame => summary.frames_missing += 1,
                SampleOutcome::NoPose => summary.poses_missing += 1,
                SampleOutcome::Detected => {}
            }
            self.observer.on_sample(&SampleEvent {
                frame_index,
                timestamp_us,
                outcome,
            });

            frame_index += 1;
        }

        summary.rows_written = writer.rows_written();
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::observer::NoopObserver;
    use crate::pose::{Landmark, PoseLandmarks};
    use anyhow::{anyhow, Result};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Frames are just their own timestamps.
    struct StubSource {
        duration_ms: Option<u64>,
        missing: HashSet<u64>,
        drops: Arc<AtomicUsize>,
    }

    impl StubSource {
        fn new(duration_ms: u64) -> Self {
            Self {
                duration_ms: Some(duration_ms),
                missing: HashSet::new(),
                drops: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl FrameSource for StubSource {
        type Frame = u64;

        fn duration_millis(&mut self) -> Result<u64> {
            self.duration_ms.ok_or_else(|| anyhow!("no duration metadata"))
        }

        fn frame_near(&mut self, timestamp_us: u64) -> Option<u64> {
            (!self.missing.contains(&timestamp_us)).then_some(timestamp_us)
        }
    }

    impl Drop for StubSource {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Returns a fixed pose and records every timestamp it is called with.
    struct StubDetector {
        pose: PoseLandmarks,
        no_pose_frames: HashSet<u64>,
        fail_on_frame: Option<u64>,
        calls: Arc<Mutex<Vec<(u64, u64)>>>,
        drops: Arc<AtomicUsize>,
    }

    impl StubDetector {
        fn new(pose: PoseLandmarks) -> Self {
            Self {
                pose,
                no_pose_frames: HashSet::new(),
                fail_on_frame: None,
                calls: Arc::new(Mutex::new(Vec::new())),
                drops: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl LandmarkDetector for StubDetector {
        type Frame = u64;

        fn detect(&mut self, frame: &u64, timestamp_ms: u64) -> Result<Option<PoseLandmarks>> {
            self.calls.lock().unwrap().push((*frame, timestamp_ms));
            if self.fail_on_frame == Some(*frame) {
                return Err(anyhow!("model exploded"));
            }
            if self.no_pose_frames.contains(frame) {
                return Ok(None);
            }
            Ok(Some(self.pose.clone()))
        }
    }

    impl Drop for StubDetector {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        samples: Mutex<Vec<SampleEvent>>,
        safety_bound: Mutex<Option<(u64, u64)>>,
        cancelled: Mutex<Option<u64>>,
        finished: AtomicUsize,
    }

    impl ExtractionObserver for RecordingObserver {
        fn on_sample(&self, event: &SampleEvent) {
            self.samples.lock().unwrap().push(*event);
        }

        fn on_safety_bound(&self, frame_index: u64, limit: u64) {
            *self.safety_bound.lock().unwrap() = Some((frame_index, limit));
        }

        fn on_cancelled(&self, frame_index: u64) {
            *self.cancelled.lock().unwrap() = Some(frame_index);
        }

        fn on_finish(&self, _report: &ExtractionReport) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn stub_pose() -> PoseLandmarks {
        let mut pose = PoseLandmarks::new();
        pose.insert(0, Landmark::new(0.5, 0.25, -0.125, 0.75));
        pose.insert(11, Landmark::new(0.375, 0.5, 0.0, 1.0));
        pose
    }

    fn data_rows(csv: &str) -> Vec<&str> {
        csv.lines().skip(1).collect()
    }

    #[test]
    fn test_two_seconds_at_ten_fps_writes_21_rows() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("landmarks.csv");
        let observer = RecordingObserver::default();

        let request = ExtractionRequest::new("clip.mp4", 10.0, vec![0, 11]);
        let source = StubSource::new(2000);
        let detector = StubDetector::new(stub_pose());
        let report = ExtractionPipeline::new(source, detector, &observer)
            .run(&request, &out)
            .unwrap();

        assert_eq!(report.rows_written, 21);
        assert_eq!(report.termination, Termination::Completed);
        assert_eq!(report.expected_samples, 20);
        assert_eq!(report.sample_limit, 30);
        assert_eq!(observer.finished.load(Ordering::SeqCst), 1);

        let csv = fs::read_to_string(&out).unwrap();
        let rows = data_rows(&csv);
        assert_eq!(rows.len(), 21);
        for (i, row) in rows.iter().enumerate() {
            let fields: Vec<&str> = row.split(',').collect();
            assert_eq!(fields.len(), 1 + 4 * 2);
            assert_eq!(fields[0], i.to_string());
        }
        assert_eq!(rows[0], "0,0.5,0.25,-0.125,0.75,0.375,0.5,0.0,1.0");
    }

    #[test]
    fn test_missing_frame_writes_sentinel_row_without_detecting() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("landmarks.csv");

        let mut source = StubSource::new(500);
        source.missing.insert(200_000);
        let detector = StubDetector::new(stub_pose());
        let calls = detector.calls.clone();

        let request = ExtractionRequest::new("clip.mp4", 10.0, vec![0, 11]);
        let report = ExtractionPipeline::new(source, detector, &NoopObserver)
            .run(&request, &out)
            .unwrap();

        assert_eq!(report.rows_written, 6);
        assert_eq!(report.frames_missing, 1);

        let csv = fs::read_to_string(&out).unwrap();
        assert_eq!(data_rows(&csv)[2], "2,NaN,NaN,NaN,NaN,NaN,NaN,NaN,NaN");

        let frames: Vec<u64> = calls.lock().unwrap().iter().map(|(f, _)| *f).collect();
        assert_eq!(frames.len(), 5);
        assert!(!frames.contains(&200_000));
    }

    #[test]
    fn test_no_pose_and_partial_pose_rows() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("landmarks.csv");

        let mut detector = StubDetector::new(stub_pose());
        detector.no_pose_frames.insert(100_000);

        // id 5 is never detected, 0 always is
        let request = ExtractionRequest::new("clip.mp4", 10.0, vec![5, 0]);
        let report = ExtractionPipeline::new(StubSource::new(200), detector, &NoopObserver)
            .run(&request, &out)
            .unwrap();

        assert_eq!(report.poses_missing, 1);
        let csv = fs::read_to_string(&out).unwrap();
        let rows = data_rows(&csv);
        assert_eq!(rows[0], "0,NaN,NaN,NaN,NaN,0.5,0.25,-0.125,0.75");
        assert_eq!(rows[1], "1,NaN,NaN,NaN,NaN,NaN,NaN,NaN,NaN");
        assert_eq!(rows[2], "2,NaN,NaN,NaN,NaN,0.5,0.25,-0.125,0.75");
    }

    #[test]
    fn test_empty_ids_writes_frame_column_only() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("landmarks.csv");

        let request = ExtractionRequest::new("clip.mp4", 10.0, vec![]);
        ExtractionPipeline::new(StubSource::new(200), StubDetector::new(stub_pose()), &NoopObserver)
            .run(&request, &out)
            .unwrap();

        assert_eq!(fs::read_to_string(&out).unwrap(), "frame\n0\n1\n2\n");
    }

    #[test]
    fn test_reruns_are_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let request = ExtractionRequest::new("clip.mp4", 7.0, vec![11, 0, 11, 3]);

        let mut outputs = Vec::new();
        for name in ["first.csv", "second.csv"] {
            let out = dir.path().join(name);
            let mut source = StubSource::new(1500);
            source.missing.insert(428_571);
            ExtractionPipeline::new(source, StubDetector::new(stub_pose()), &NoopObserver)
                .run(&request, &out)
                .unwrap();
            outputs.push(fs::read(&out).unwrap());
        }

        assert_eq!(outputs[0], outputs[1]);
    }

    #[test]
    fn test_detector_timestamps_are_truncated_and_non_decreasing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("landmarks.csv");
        let detector = StubDetector::new(stub_pose());
        let calls = detector.calls.clone();

        // interval = round(1e6 / 3) = 333333us
        let request = ExtractionRequest::new("clip.mp4", 3.0, vec![0]);
        ExtractionPipeline::new(StubSource::new(1000), detector, &NoopObserver)
            .run(&request, &out)
            .unwrap();

        let calls = calls.lock().unwrap();
        let ms: Vec<u64> = calls.iter().map(|(_, ms)| *ms).collect();
        assert_eq!(ms, vec![0, 333, 666, 999]);
        assert!(ms.windows(2).all(|w| w[0] <= w[1]));
        for (frame_us, ms) in calls.iter() {
            assert_eq!(*ms, frame_us / 1000);
        }
    }

    #[test]
    fn test_unreadable_source_creates_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("landmarks.csv");

        let mut source = StubSource::new(0);
        source.duration_ms = None;
        let source_drops = source.drops.clone();
        let detector = StubDetector::new(stub_pose());
        let detector_drops = detector.drops.clone();

        let request = ExtractionRequest::new("broken.mp4", 30.0, vec![0]);
        let err = ExtractionPipeline::new(source, detector, &NoopObserver)
            .run(&request, &out)
            .unwrap_err();

        assert!(matches!(err, ExtractError::SourceUnreadable { .. }));
        assert!(!out.exists());
        assert_eq!(source_drops.load(Ordering::SeqCst), 1);
        assert_eq!(detector_drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_detector_failure_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("landmarks.csv");

        let mut detector = StubDetector::new(stub_pose());
        detector.fail_on_frame = Some(300_000);
        let detector_drops = detector.drops.clone();

        let request = ExtractionRequest::new("clip.mp4", 10.0, vec![0]);
        let err = ExtractionPipeline::new(StubSource::new(1000), detector, &NoopObserver)
            .run(&request, &out)
            .unwrap_err();

        assert!(matches!(err, ExtractError::Detection { frame_index: 3, .. }));
        assert!(!out.exists());
        assert_eq!(detector_drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_safety_bound_truncates_runaway_schedule() {
        let observer = RecordingObserver::default();
        let source = StubSource::new(1000);
        let source_drops = source.drops.clone();
        let mut pipeline =
            ExtractionPipeline::new(source, StubDetector::new(stub_pose()), &observer);

        // Duration implies 10 samples; feed a schedule ten times longer.
        let spec = SampleSpec::new(1000, 10.0, vec![0]);
        let runaway = (0..100u64).map(|i| i * 100_000);
        let mut writer = LandmarkCsvWriter::new(Vec::new(), &spec.keep_ids);
        writer.write_header().unwrap();

        let summary = pipeline.sample_loop(&spec, runaway, &mut writer).unwrap();

        // limit = 10 + 10, indices 0..=20 are written
        assert_eq!(summary.rows_written, 21);
        assert_eq!(summary.termination, Some(Termination::SafetyBound));
        assert_eq!(*observer.safety_bound.lock().unwrap(), Some((21, 20)));

        let csv = String::from_utf8(writer.finish().unwrap()).unwrap();
        let rows = data_rows(&csv);
        assert_eq!(rows.len(), 21);
        assert!(rows[20].starts_with("20,"));

        drop(pipeline);
        assert_eq!(source_drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_safety_tolerance_is_configurable() {
        let spec = SampleSpec::new(1000, 10.0, vec![]);
        let mut pipeline = ExtractionPipeline::new(
            StubSource::new(1000),
            StubDetector::new(stub_pose()),
            &NoopObserver,
        )
        .with_config(PipelineConfig { safety_tolerance: 0 });
        let mut writer = LandmarkCsvWriter::new(Vec::new(), &spec.keep_ids);

        let summary = pipeline
            .sample_loop(&spec, (0..100u64).map(|i| i * 100_000), &mut writer)
            .unwrap();

        assert_eq!(summary.rows_written, 11);
        assert_eq!(summary.termination, Some(Termination::SafetyBound));
    }

    #[test]
    fn test_cancelled_run_finalizes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("landmarks.csv");
        let observer = RecordingObserver::default();
        let cancel = CancelToken::new();
        cancel.cancel();

        let request = ExtractionRequest::new("clip.mp4", 10.0, vec![0]);
        let source = StubSource::new(2000);
        let detector = StubDetector::new(stub_pose());
        let report = ExtractionPipeline::new(source, detector, &observer)
            .with_cancel(cancel)
            .run(&request, &out)
            .unwrap();

        assert_eq!(report.termination, Termination::Cancelled);
        assert_eq!(report.rows_written, 0);
        assert_eq!(*observer.cancelled.lock().unwrap(), Some(0));
        assert_eq!(
            fs::read_to_string(&out).unwrap(),
            "frame,landmark_0_x,landmark_0_y,landmark_0_z,landmark_0_vis\n"
        );
    }

    #[test]
    fn test_frame_indices_are_contiguous_in_events() {
        let observer = RecordingObserver::default();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("landmarks.csv");

        let mut source = StubSource::new(1000);
        source.missing.insert(0);
        source.missing.insert(500_000);
        let request = ExtractionRequest::new("clip.mp4", 4.0, vec![0]);
        ExtractionPipeline::new(source, StubDetector::new(stub_pose()), &observer)
            .run(&request, &out)
            .unwrap();

        let samples = observer.samples.lock().unwrap();
        let indices: Vec<u64> = samples.iter().map(|e| e.frame_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(samples[0].outcome, SampleOutcome::NoFrame);
        assert_eq!(samples[1].outcome, SampleOutcome::Detected);
        assert_eq!(samples[2].outcome, SampleOutcome::NoFrame);
    }

    #[test]
    fn test_guard_rejects_backwards_timestamps() {
        let mut guard = TimestampGuard::default();
        assert!(guard.check(0).is_ok());
        assert!(guard.check(33).is_ok());
        assert!(guard.check(33).is_ok());
        let err = guard.check(32).unwrap_err();
        assert!(matches!(
            err,
            ExtractError::NonMonotonicTimestamp {
                previous_ms: 33,
                current_ms: 32
            }
        ));
    }

    #[test]
    fn test_invalid_fps_is_rejected_before_touching_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("landmarks.csv");
        let request = ExtractionRequest::new("clip.mp4", 0.0, vec![0]);
        let err = ExtractionPipeline::new(
            StubSource::new(1000),
            StubDetector::new(stub_pose()),
            &NoopObserver,
        )
        .run(&request, &out)
        .unwrap_err();
        assert!(matches!(err, ExtractError::InvalidRequest(_)));
        assert!(!out.exists());
    }
}
