//! Video decode pipeline: connection -> multipart decoder -> optional motion filter

use std::sync::Arc;

use futures_util::{StreamExt, TryStreamExt};

use crate::capture::{Connection, FrameDecoder, FrameEvent, FrameStream, MotionFilter};

/// Builds one lazy frame sequence per connection
#[derive(Clone)]
pub struct VideoPipeline {
    decoder: Arc<dyn FrameDecoder>,
    motion: Arc<dyn MotionFilter>,
}

impl VideoPipeline {
    pub fn new(decoder: Arc<dyn FrameDecoder>, motion: Arc<dyn MotionFilter>) -> Self {
        Self { decoder, motion }
    }

    /// Compose a fresh pipeline over `connection`.
    ///
    /// Every decoded buffer becomes a [`FrameEvent`] timestamped at decode
    /// time. With `motion_enabled` only the frames the motion filter forwards
    /// come out. The sequence ends when the connection does and cannot be
    /// restarted; dropping it tears the connection down.
    pub fn build(&self, connection: Connection, motion_enabled: bool) -> FrameStream {
        let frames = self
            .decoder
            .decode(connection)
            .map_ok(FrameEvent::new)
            .boxed();

        if motion_enabled {
            self.motion.filter(frames)
        } else {
            frames
        }
    }
}
