// Sample scheduler: turns a duration and target rate into sampling timestamps

use crate::pipeline::types::TimestampUs;

/// Lazy, restartable sequence of timestamps `0, step, 2*step, ...` up to and
/// including the end of the video.
///
/// It does not bound its own length; the extractor enforces the safety bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSchedule {
    end_us: TimestampUs,
    interval_us: TimestampUs,
}

impl SampleSchedule {
    /// `fps` must be positive and finite; callers validate it first.
    pub fn new(duration_ms: u64, fps: f64) -> Self {
        Self {
            end_us: duration_ms.saturating_mul(1000),
            interval_us: interval_for(fps),
        }
    }

    #[cfg(test)]
    pub fn interval_us(&self) -> TimestampUs {
        self.interval_us
    }

    pub fn timestamps(&self) -> Timestamps {
        Timestamps {
            next: Some(0),
            end_us: self.end_us,
            interval_us: self.interval_us,
        }
    }

    /// Number of timestamps the schedule yields.
    pub fn len(&self) -> u64 {
        (self.end_us / self.interval_us).saturating_add(1)
    }
}

impl IntoIterator for SampleSchedule {
    type Item = TimestampUs;
    type IntoIter = Timestamps;

    fn into_iter(self) -> Timestamps {
        self.timestamps()
    }
}

/// `round(1_000_000 / fps)` microseconds, never less than 1.
pub fn interval_for(fps: f64) -> TimestampUs {
    let interval = (1_000_000.0 / fps).round();
    if interval.is_finite() && interval >= 1.0 {
        interval as TimestampUs
    } else {
        1
    }
}

#[derive(Debug, Clone)]
pub struct Timestamps {
    next: Option<TimestampUs>,
    end_us: TimestampUs,
    interval_us: TimestampUs,
}

impl Iterator for Timestamps {
    type Item = TimestampUs;

    fn next(&mut self) -> Option<TimestampUs> {
        let current = self.next.filter(|t| *t <= self.end_us)?;
        self.next = current.checked_add(self.interval_us);
        Some(current)
    }
}
