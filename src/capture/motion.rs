//! Frame-difference motion filter

use std::sync::Arc;

use futures_util::future;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::capture::frame::FrameEvent;
use crate::error::{CameraError, DecodeError};

/// Lazy sequence of frame events
pub type FrameStream = BoxStream<'static, Result<FrameEvent, CameraError>>;

/// Re-emits only the frames judged to contain motion, preserving event shape
pub trait MotionFilter: Send + Sync {
    fn filter(&self, frames: FrameStream) -> FrameStream;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Per-sample difference that counts as a change
    pub pixel_threshold: u8,
    /// Share of changed samples needed to report motion
    pub min_changed_ratio: f32,
    /// Compare every n-th decoded byte
    pub sample_step: usize,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            pixel_threshold: 24,
            min_changed_ratio: 0.02,
            sample_step: 16,
        }
    }
}

/// Compares each decoded frame with the previous one
#[derive(Debug, Clone, Default)]
pub struct PixelDiffMotion {
    config: MotionConfig,
}

impl PixelDiffMotion {
    pub fn new(config: MotionConfig) -> Self {
        Self { config }
    }
}

impl MotionFilter for PixelDiffMotion {
    /// JPEG decoding runs on the blocking pool, one frame at a time
    fn filter(&self, frames: FrameStream) -> FrameStream {
        let detector = Arc::new(Mutex::new(Detector::new(self.config.clone())));
        frames
            .and_then(move |frame| {
                let detector = Arc::clone(&detector);
                async move {
                    let data = frame.data.clone();
                    let moved = tokio::task::spawn_blocking(move || detector.lock().observe(&data))
                        .await
                        .map_err(|e| DecodeError::Jpeg(format!("motion task failed: {e}")))??;
                    Ok::<_, CameraError>(moved.then_some(frame))
                }
            })
            .try_filter_map(future::ok)
            .boxed()
    }
}

struct Detector {
    config: MotionConfig,
    reference: Option<Vec<u8>>,
}

impl Detector {
    fn new(config: MotionConfig) -> Self {
        Self {
            config,
            reference: None,
        }
    }

    /// Decode the frame, compare with the reference and make it the new reference
    fn observe(&mut self, jpeg: &[u8]) -> Result<bool, CameraError> {
        let mut decoder = zune_jpeg::JpegDecoder::new(jpeg);
        let pixels = decoder
            .decode()
            .map_err(|e| DecodeError::Jpeg(format!("{e:?}")))?;

        let moved = match &self.reference {
            Some(previous) => self.differs(previous, &pixels),
            None => false,
        };
        self.reference = Some(pixels);
        Ok(moved)
    }

    fn differs(&self, previous: &[u8], current: &[u8]) -> bool {
        if previous.len() != current.len() {
            return true;
        }
        let ratio = changed_ratio(previous, current, &self.config);
        trace!(ratio, "Motion sample");
        ratio >= self.config.min_changed_ratio
    }
}

/// Share of sampled bytes whose difference exceeds the threshold
fn changed_ratio(previous: &[u8], current: &[u8], config: &MotionConfig) -> f32 {
    let step = config.sample_step.max(1);
    let mut sampled = 0usize;
    let mut changed = 0usize;

    for (a, b) in previous.iter().zip(current).step_by(step) {
        sampled += 1;
        if a.abs_diff(*b) > config.pixel_threshold {
            changed += 1;
        }
    }

    if sampled == 0 {
        return 0.0;
    }
    changed as f32 / sampled as f32
}
