use super::FrameSource;
use anyhow::{anyhow, Context, Result};
use ffmpeg_next::ffi;
use ffmpeg_next::software::scaling;
use ffmpeg_next::util::frame::Video as VideoFrame;
use opencv::{core, prelude::*};
use std::path::Path;

/// Forward requests further ahead than this seek instead of decoding through.
const SEEK_AHEAD_US: u64 = 2_000_000;

/// A decoded frame tagged with its presentation time in microseconds.
type Decoded = (u64, VideoFrame);

/// Frame source backed by FFmpeg via ffmpeg-next.
///
/// Keeps a two-frame window of consecutive decoded frames so that increasing
/// timestamps are served by decoding forward, and only seeks for large jumps
/// or backward requests.
pub struct FfmpegFrameSource {
    input_ctx: ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::codec::decoder::Video,
    video_stream_index: usize,
    time_base: (i64, i64),
    start_pts: i64,
    duration_ms: Option<u64>,
    /// Largest gap past the last frame that still counts as "near" it.
    frame_gap_us: u64,
    /// Lazily created on first frame (source format is only known then).
    scaler: Option<scaling::Context>,
    previous: Option<Decoded>,
    pending: Option<Decoded>,
    packet: ffmpeg_next::codec::packet::Packet,
    eof_sent: bool,
}

impl FfmpegFrameSource {
    pub fn open(path: &Path) -> Result<Self> {
        ffmpeg_next::init().context("Failed to initialize FFmpeg")?;

        if !path.exists() {
            return Err(anyhow!("Video file not found: {}", path.display()));
        }

        let input_ctx = ffmpeg_next::format::input(&path).context("Failed to open video file")?;

        let video_stream = input_ctx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| anyhow!("No video stream found in {}", path.display()))?;

        let video_stream_index = video_stream.index();
        let tb = video_stream.time_base();
        let time_base = (tb.numerator() as i64, tb.denominator().max(1) as i64);
        let start_pts = video_stream.start_time();
        let start_pts = if start_pts == ffi::AV_NOPTS_VALUE { 0 } else { start_pts };

        let rational_fps = video_stream.avg_frame_rate();
        let source_fps = if rational_fps.denominator() > 0 && rational_fps.numerator() > 0 {
            rational_fps.numerator() as f64 / rational_fps.denominator() as f64
        } else {
            tracing::warn!("FfmpegFrameSource: could not determine FPS, defaulting to 30.0");
            30.0
        };
        let frame_gap_us = (2_000_000.0 / source_fps).round() as u64;

        let container_us = input_ctx.duration();
        let stream_us = rescale(video_stream.duration(), time_base);
        let duration_ms = if container_us > 0 {
            Some(container_us as u64 / 1000)
        } else if stream_us > 0 {
            Some(stream_us as u64 / 1000)
        } else {
            None
        };

        let decoder_ctx =
            ffmpeg_next::codec::context::Context::from_parameters(video_stream.parameters())
                .context("Failed to create decoder context")?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .context("Failed to open video decoder")?;

        tracing::info!(
            "FfmpegFrameSource: opened {}, duration_ms={:?}, fps={:.2}, {}x{}",
            path.display(),
            duration_ms,
            source_fps,
            decoder.width(),
            decoder.height()
        );

        Ok(Self {
            input_ctx,
            decoder,
            video_stream_index,
            time_base,
            start_pts,
            duration_ms,
            frame_gap_us,
            scaler: None,
            previous: None,
            pending: None,
            packet: ffmpeg_next::codec::packet::Packet::empty(),
            eof_sent: false,
        })
    }

    fn seek_to(&mut self, timestamp_us: u64) -> Result<()> {
        // The container seek unit is AV_TIME_BASE, i.e. microseconds.
        let ts = timestamp_us as i64;
        self.input_ctx.seek(ts, ..ts).context("Failed to seek")?;
        self.decoder.flush();
        self.eof_sent = false;
        self.previous = None;
        self.pending = None;
        Ok(())
    }

    fn needs_seek(&self, target_us: u64) -> bool {
        if let Some((pts, _)) = &self.previous {
            if target_us < *pts {
                return true;
            }
        }
        match &self.pending {
            Some((pts, _)) => target_us > pts + SEEK_AHEAD_US,
            None => !self.eof_sent && self.previous.is_none() && target_us > SEEK_AHEAD_US,
        }
    }

    /// Decodes the next video frame. `Ok(None)` means end of stream.
    fn decode_next(&mut self) -> Result<Option<Decoded>> {
        let mut frame = VideoFrame::empty();
        loop {
            match self.decoder.receive_frame(&mut frame) {
                Ok(()) => {
                    let pts = frame.timestamp().or(frame.pts()).unwrap_or(self.start_pts);
                    let pts_us = rescale(pts - self.start_pts, self.time_base).max(0) as u64;
                    return Ok(Some((pts_us, frame)));
                }
                Err(ffmpeg_next::Error::Other { errno: ffi::EAGAIN }) => {
                    if self.eof_sent {
                        return Ok(None);
                    }
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(None),
                Err(e) => return Err(anyhow!("Decoder error: {}", e)),
            }

            // Feed packets until we find a video packet or reach EOF
            let mut found_packet = false;
            while self.packet.read(&mut self.input_ctx).is_ok() {
                if self.packet.stream() == self.video_stream_index {
                    self.decoder
                        .send_packet(&self.packet)
                        .context("Failed to send packet to decoder")?;
                    found_packet = true;
                    break;
                }
            }

            if !found_packet {
                self.decoder
                    .send_eof()
                    .context("Failed to send EOF to decoder")?;
                self.eof_sent = true;
            }
        }
    }

    fn lookup(&mut self, target_us: u64) -> Result<Option<core::Mat>> {
        if self.needs_seek(target_us) {
            self.seek_to(target_us)?;
        }

        loop {
            if matches!(&self.pending, Some((pts, _)) if *pts >= target_us) {
                break;
            }
            match self.decode_next()? {
                Some(next) => self.previous = self.pending.replace(next),
                None => break,
            }
        }

        let pts_of = |slot: &Option<Decoded>| slot.as_ref().map(|(pts, _)| *pts);
        let pick = nearest_slot(
            pts_of(&self.previous),
            pts_of(&self.pending),
            target_us,
            self.frame_gap_us,
        );
        let chosen = match pick {
            Some(Slot::Previous) => &self.previous,
            Some(Slot::Pending) => &self.pending,
            None => return Ok(None),
        };

        match chosen {
            Some((_, frame)) => to_bgr_mat(&mut self.scaler, frame).map(Some),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Previous,
    Pending,
}

/// Which side of the decode window serves `target_us`.
///
/// The closer frame wins and ties go to `pending`. When the stream ended before
/// reaching the target, the last frame only counts if it lies within
/// `frame_gap_us` of it.
fn nearest_slot(
    previous: Option<u64>,
    pending: Option<u64>,
    target_us: u64,
    frame_gap_us: u64,
) -> Option<Slot> {
    let next = pending?;
    let next_dist = next.abs_diff(target_us);
    if let Some(prev) = previous {
        if prev.abs_diff(target_us) < next_dist {
            return Some(Slot::Previous);
        }
    }
    if next < target_us && next_dist > frame_gap_us {
        return None;
    }
    Some(Slot::Pending)
}

/// `value` in stream time-base units to microseconds.
fn rescale(value: i64, (num, den): (i64, i64)) -> i64 {
    ((value as i128 * num as i128 * 1_000_000) / den as i128) as i64
}

/// Convert a decoded frame of any pixel format to an owned BGR Mat.
fn to_bgr_mat(scaler: &mut Option<scaling::Context>, frame: &VideoFrame) -> Result<core::Mat> {
    let stale = scaler.as_ref().map_or(true, |s| {
        s.input().format != frame.format()
            || s.input().width != frame.width()
            || s.input().height != frame.height()
    });
    if stale {
        *scaler = Some(
            scaling::Context::get(
                frame.format(),
                frame.width(),
                frame.height(),
                ffmpeg_next::format::Pixel::BGR24,
                frame.width(),
                frame.height(),
                scaling::Flags::BILINEAR,
            )
            .context("Failed to create scaler")?,
        );
    }
    let scaler = scaler
        .as_mut()
        .ok_or_else(|| anyhow!("Scaler unavailable"))?;

    let mut bgr = VideoFrame::empty();
    scaler.run(frame, &mut bgr).context("Scaler failed")?;
    bgr_frame_to_mat(&bgr)
}

/// Deep-copies a BGR24 ffmpeg frame into an OpenCV Mat so the Mat owns its data.
fn bgr_frame_to_mat(frame: &VideoFrame) -> Result<core::Mat> {
    let width = frame.width() as i32;
    let height = frame.height() as i32;
    let data = frame.data(0);
    let stride = frame.stride(0);
    let row_bytes = width as usize * 3;

    let mut mat = core::Mat::new_rows_cols_with_default(
        height,
        width,
        core::CV_8UC3,
        core::Scalar::all(0.0),
    )?;

    for y in 0..height as usize {
        let src_row = &data[y * stride..y * stride + row_bytes];
        let dst_ptr = mat.ptr_mut(y as i32)?;
        unsafe {
            std::ptr::copy_nonoverlapping(src_row.as_ptr(), dst_ptr, row_bytes);
        }
    }

    Ok(mat)
}

impl FrameSource for FfmpegFrameSource {
    type Frame = core::Mat;

    fn duration_millis(&mut self) -> Result<u64> {
        self.duration_ms
            .ok_or_else(|| anyhow!("Container reports no duration"))
    }

    fn frame_near(&mut self, timestamp_us: u64) -> Option<core::Mat> {
        match self.lookup(timestamp_us) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("FfmpegFrameSource: no frame at {}us: {:#}", timestamp_us, e);
                None
            }
        }
    }
}
