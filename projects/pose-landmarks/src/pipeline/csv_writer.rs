// CSV writer: fixes the column schema from the requested landmark ids and
// serializes one row per sample.

use crate::pose::{Landmark, PoseLandmarks};
use std::io::Write;

/// Written in place of all four values when a landmark is unavailable.
pub const MISSING: &str = "NaN";

/// Column names for `ids`: `frame`, then `landmark_<id>_{x,y,z,vis}` per id,
/// in the order given and including duplicates.
pub fn header_columns(ids: &[u32]) -> Vec<String> {
    let mut columns = Vec::with_capacity(1 + ids.len() * 4);
    columns.push("frame".to_string());
    for id in ids {
        for suffix in ["x", "y", "z", "vis"] {
            columns.push(format!("landmark_{}_{}", id, suffix));
        }
    }
    columns
}

/// Row-at-a-time landmark CSV with a fixed field count.
///
/// The csv writer is non-flexible, so a row whose width differs from the
/// header is rejected instead of being written.
pub struct LandmarkCsvWriter<W: Write> {
    writer: csv::Writer<W>,
    ids: Vec<u32>,
    rows_written: u64,
}

impl<W: Write> LandmarkCsvWriter<W> {
    pub fn new(inner: W, ids: &[u32]) -> Self {
        let writer = csv::WriterBuilder::new()
            .delimiter(b',')
            .terminator(csv::Terminator::Any(b'\n'))
            .flexible(false)
            .from_writer(inner);
        Self {
            writer,
            ids: ids.to_vec(),
            rows_written: 0,
        }
    }

    pub fn write_header(&mut self) -> csv::Result<()> {
        self.writer.write_record(header_columns(&self.ids))
    }

    /// Writes `frame_index` followed by four values per requested id. Ids absent
    /// from `landmarks`, or every id when `landmarks` is `None`, get `NaN`s.
    pub fn write_row(
        &mut self,
        frame_index: u64,
        landmarks: Option<&PoseLandmarks>,
    ) -> csv::Result<()> {
        self.writer.write_field(frame_index.to_string())?;
        for id in &self.ids {
            match landmarks.and_then(|lm| lm.get(id)) {
                Some(Landmark { x, y, z, visibility }) => {
                    // `{:?}` keeps the decimal point on integral values (`1.0`, not `1`).
                    for value in [x, y, z, visibility] {
                        self.writer.write_field(format!("{:?}", value))?;
                    }
                }
                None => {
                    for _ in 0..4 {
                        self.writer.write_field(MISSING)?;
                    }
                }
            }
        }
        self.writer.write_record(None::<&[u8]>)?;
        self.rows_written += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Flushes buffered rows and hands back the underlying writer.
    pub fn finish(self) -> std::io::Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| std::io::Error::new(e.error().kind(), e.to_string()))
    }
}
