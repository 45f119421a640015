//! Camera: one upstream MJPEG source republished to any number of consumers

mod screenshot;

use std::sync::Arc;

use futures_util::StreamExt;
use tracing::{debug, error, info, warn};

use crate::capture::{
    Connector, FrameDecoder, FrameEvent, HttpConnector, MotionFilter, MultipartDecoder,
    PixelDiffMotion,
};
use crate::error::{CameraError, Result};
use crate::pipeline::{
    ConnectionManager, Delivery, SessionId, SessionKind, Subscription, Topology, TopologyState,
    VideoPipeline,
};
use crate::utils::{generated_name, redact_url};
use crate::{CameraConfig, Metrics, MetricsSnapshot};

/// A single networked camera
///
/// Keeps at most one upstream connection open, drains it through the discard
/// sink while nobody is attached and fans frames out to every [`Subscription`].
/// Dropping the camera stops it.
pub struct Camera {
    inner: Arc<Inner>,
}

struct Inner {
    name: Arc<str>,
    config: CameraConfig,
    connections: ConnectionManager,
    pipeline: VideoPipeline,
    topology: Arc<Topology>,
    metrics: Arc<Metrics>,
    screenshot_gate: tokio::sync::Mutex<()>,
}

/// Assembles a [`Camera`], optionally swapping out the HTTP client, decoder or motion filter
pub struct CameraBuilder {
    config: CameraConfig,
    connector: Option<Arc<dyn Connector>>,
    decoder: Option<Arc<dyn FrameDecoder>>,
    motion: Option<Arc<dyn MotionFilter>>,
}

impl CameraBuilder {
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn decoder(mut self, decoder: Arc<dyn FrameDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn motion_filter(mut self, motion: Arc<dyn MotionFilter>) -> Self {
        self.motion = Some(motion);
        self
    }

    pub fn build(self) -> Result<Camera> {
        let config = self.config;
        if config.url.trim().is_empty() {
            return Err(CameraError::InvalidUrl {
                url: config.url.clone(),
                reason: "url is required".into(),
            });
        }

        let name: Arc<str> = Arc::from(config.name.clone().unwrap_or_else(generated_name));
        let metrics = Arc::new(Metrics::new(&name));

        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(HttpConnector::new(
                &config.url,
                config.credentials(),
                config.connect_timeout(),
            )?),
        };
        let decoder: Arc<dyn FrameDecoder> = match self.decoder {
            Some(decoder) => decoder,
            None => Arc::new(MultipartDecoder::new(config.max_frame_bytes)),
        };
        let motion: Arc<dyn MotionFilter> = match self.motion {
            Some(motion) => motion,
            None => Arc::new(PixelDiffMotion::new(config.motion_detection.clone())),
        };

        info!(
            camera = %name,
            url = %redact_url(&config.url),
            motion = config.motion,
            "Camera created"
        );

        let inner = Inner {
            connections: ConnectionManager::new(
                connector,
                config.reconnect.clone(),
                Arc::clone(&metrics),
            ),
            pipeline: VideoPipeline::new(decoder, motion),
            topology: Arc::new(Topology::new(
                Arc::clone(&name),
                config.consumer_buffer,
                Arc::clone(&metrics),
            )),
            metrics,
            name,
            config,
            screenshot_gate: tokio::sync::Mutex::new(()),
        };

        Ok(Camera {
            inner: Arc::new(inner),
        })
    }
}

impl Camera {
    /// Camera talking to `config.url` over HTTP
    pub fn new(config: CameraConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: CameraConfig) -> CameraBuilder {
        CameraBuilder {
            config,
            connector: None,
            decoder: None,
            motion: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &CameraConfig {
        &self.inner.config
    }

    pub fn state(&self) -> TopologyState {
        self.inner.topology.state()
    }

    /// Whether any session (streaming or screenshot) holds an upstream connection
    pub fn is_connected(&self) -> bool {
        self.inner.connections.is_connected()
    }

    pub fn using_discard_sink(&self) -> bool {
        self.inner.topology.using_discard_sink()
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.topology.consumer_count()
    }

    /// Frames the discard sink has swallowed so far
    pub fn discarded_frames(&self) -> u64 {
        self.inner.topology.discard_sink().absorbed()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Most recent frame seen by this camera instance
    pub fn latest_frame(&self) -> Result<FrameEvent> {
        self.inner
            .topology
            .latest()
            .map(|frame| FrameEvent::clone(&frame))
            .ok_or(CameraError::NoFrameYet)
    }

    /// Attach a consumer to the output stream
    pub fn attach(&self) -> Subscription {
        self.inner.topology.attach()
    }

    /// Start continuous streaming: IDLE -> DRAINING (or STREAMING if consumers are waiting).
    ///
    /// Must be called from within a tokio runtime. An in-flight transient
    /// screenshot is superseded and resolves as [`CameraError::Cancelled`].
    pub fn start(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let session = self
            .inner
            .connections
            .claim(SessionKind::Streaming, move |session| {
                inner.topology.activate(session);
                tokio::spawn(stream_session(inner, session)).abort_handle()
            })?;

        info!(camera = %self.inner.name, session, "Camera started");
        Ok(())
    }

    /// Close the connection and detach every consumer. Safe to call in any state.
    pub fn stop(&self) {
        match self.inner.connections.close() {
            Ok((session, kind)) => {
                match kind {
                    SessionKind::Streaming => self.inner.topology.deactivate_session(session),
                    SessionKind::Transient => self.inner.topology.clear_idle(),
                };
                info!(camera = %self.inner.name, session, ?kind, "Camera stopped");
            }
            Err(_) => {
                self.inner.topology.clear_idle();
                debug!(camera = %self.inner.name, "Stop requested while idle");
            }
        }
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Continuous streaming with reconnects; owns the connection for its lifetime
async fn stream_session(inner: Arc<Inner>, session: SessionId) {
    let mut backoff = inner.connections.backoff();

    'session: loop {
        match inner.connections.open().await {
            Ok(connection) => {
                let mut frames = inner.pipeline.build(connection, inner.config.motion);
                let mut received = 0u64;

                while let Some(frame) = frames.next().await {
                    match frame {
                        Ok(frame) => {
                            if received == 0 {
                                info!(camera = %inner.name, session, "Receiving frames");
                                backoff.reset();
                            }
                            received += 1;
                            if inner.topology.publish(session, frame) == Delivery::Stale {
                                break 'session;
                            }
                        }
                        Err(e) => {
                            warn!(camera = %inner.name, session, error = %e, "Stream interrupted");
                            break;
                        }
                    }
                }
                debug!(camera = %inner.name, session, received, "Connection ended");
            }
            Err(e) => {
                warn!(
                    camera = %inner.name,
                    session,
                    attempt = backoff.attempt(),
                    error = %e,
                    "Failed to connect"
                );
            }
        }

        let Some(delay) = backoff.next_delay() else {
            error!(
                camera = %inner.name,
                session,
                attempts = backoff.attempt(),
                "Reconnect attempts exhausted, giving up"
            );
            break;
        };
        inner.metrics.reconnect();
        debug!(camera = %inner.name, session, ?delay, attempt = backoff.attempt(), "Reconnecting");
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }
    }

    inner.connections.release(session);
    inner.topology.deactivate_session(session);
}
