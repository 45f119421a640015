//! One-shot frame capture

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument};

use super::{Camera, Inner};
use crate::capture::FrameEvent;
use crate::error::{CameraError, ConnectionError, Result};
use crate::pipeline::{ConnectionManager, SessionId, SessionKind};

impl Camera {
    /// Capture one frame.
    ///
    /// While a streaming session is open this returns the cached latest frame
    /// without any I/O, or [`CameraError::NoFrameYet`] if none has arrived.
    /// Otherwise a transient connection is opened for exactly one frame and
    /// closed again. Only one transient attempt runs at a time; concurrent
    /// callers queue behind it. `stop()` cancels a pending attempt, and so
    /// does dropping the returned future.
    #[instrument(skip(self), fields(camera = %self.inner.name))]
    pub async fn screenshot(&self) -> Result<FrameEvent> {
        let _gate = self.inner.screenshot_gate.lock().await;

        let (reply, result) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let claimed = self
            .inner
            .connections
            .claim(SessionKind::Transient, move |session| {
                tokio::spawn(capture_once(inner, session, reply)).abort_handle()
            });

        let session = match claimed {
            Ok(session) => session,
            Err(CameraError::AlreadyConnected) => {
                if self.inner.connections.active_kind() == Some(SessionKind::Transient) {
                    return Err(CameraError::AlreadyConnected);
                }
                debug!("Serving screenshot from live session");
                let frame = self.latest_frame()?;
                self.inner.metrics.screenshot();
                return Ok(frame);
            }
            Err(e) => return Err(e),
        };
        let transient = AbortOnDrop {
            connections: &self.inner.connections,
            session: Some(session),
        };

        let timeout = self.inner.config.screenshot_timeout();
        let frame = match tokio::time::timeout(timeout, result).await {
            Ok(Ok(frame)) => {
                transient.disarm();
                frame?
            }
            Ok(Err(_)) => return Err(CameraError::Cancelled),
            Err(_) => return Err(CameraError::Timeout(timeout)),
        };

        self.inner.metrics.screenshot();
        info!(session, bytes = frame.len(), "Screenshot captured");
        Ok(frame)
    }
}

/// Aborts a transient session whose caller stopped waiting for it
struct AbortOnDrop<'a> {
    connections: &'a ConnectionManager,
    session: Option<SessionId>,
}

impl AbortOnDrop<'_> {
    fn disarm(mut self) {
        self.session = None;
    }
}

impl Drop for AbortOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if self.connections.abort(session) {
                debug!(session, "Transient session abandoned");
            }
        }
    }
}

/// Transient session body: one connection, one frame
async fn capture_once(
    inner: Arc<Inner>,
    session: SessionId,
    reply: oneshot::Sender<Result<FrameEvent>>,
) {
    let result = first_frame(&inner).await;

    // Cache under the slot; anything claimed afterwards publishes newer frames
    let Some(result) = inner.connections.release_with(session, || {
        result.map(|frame| inner.topology.record(frame))
    }) else {
        debug!(session, "Transient session superseded, dropping its result");
        return;
    };
    let _ = reply.send(result);
}

async fn first_frame(inner: &Inner) -> Result<FrameEvent> {
    let connection = inner.connections.open().await?;
    let mut frames = inner.pipeline.build(connection, false);
    match frames.next().await {
        Some(frame) => frame,
        None => Err(ConnectionError::Closed.into()),
    }
}
