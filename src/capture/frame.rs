use bytes::Bytes;
use std::sync::Arc;
use std::time::SystemTime;

/// One decoded image with zero-copy semantics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameEvent {
    /// Capture timestamp (wall clock, assigned at decode time)
    pub timestamp: SystemTime,

    /// Immutable encoded image - can be shared across consumers without copying
    pub data: Bytes,

    /// Camera that produced the frame, stamped by the topology controller
    pub source_name: Option<Arc<str>>,
}

impl FrameEvent {
    /// Promote a raw image buffer to a frame event stamped with the current time
    pub fn new(data: Bytes) -> Self {
        Self::with_timestamp(SystemTime::now(), data)
    }

    pub fn with_timestamp(timestamp: SystemTime, data: Bytes) -> Self {
        Self {
            timestamp,
            data,
            source_name: None,
        }
    }

    /// Stamp the source name unless one is already set
    pub fn stamped(mut self, source_name: &Arc<str>) -> Self {
        if self.source_name.is_none() {
            self.source_name = Some(Arc::clone(source_name));
        }
        self
    }

    pub fn source_name(&self) -> Option<&str> {
        self.source_name.as_deref()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamping_keeps_existing_source() {
        let first: Arc<str> = Arc::from("front-door");
        let second: Arc<str> = Arc::from("garage");

        let frame = FrameEvent::new(Bytes::from_static(b"\xff\xd8\xff\xd9"))
            .stamped(&first)
            .stamped(&second);

        assert_eq!(frame.source_name(), Some("front-door"));
        assert_eq!(frame.len(), 4);
    }

    #[test]
    fn stamping_does_not_touch_payload() {
        let name: Arc<str> = Arc::from("camX");
        let data = Bytes::from_static(b"jpeg-bytes");
        let ts = SystemTime::UNIX_EPOCH;

        let frame = FrameEvent::with_timestamp(ts, data.clone()).stamped(&name);

        assert_eq!(frame.timestamp, ts);
        assert_eq!(frame.data, data);
    }
}
