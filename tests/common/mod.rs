//! Fakes shared by the integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use netcam::capture::{Connection, Connector, FrameDecoder, ImageStream};
use netcam::{Camera, CameraConfig, CameraError, ConnectionError, ReconnectConfig};
use reqwest::StatusCode;

/// Test side of one upstream connection: push body chunks (here, whole frames) into it
pub type Feed = flume::Sender<Result<Bytes, ConnectionError>>;

/// Connector whose connections are fed by the test
pub struct FakeConnector {
    attempts: AtomicUsize,
    failures: AtomicUsize,
    feeds: flume::Sender<Feed>,
}

impl FakeConnector {
    pub fn new() -> (Arc<Self>, flume::Receiver<Feed>) {
        let (feeds, rx) = flume::unbounded();
        let connector = Arc::new(Self {
            attempts: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            feeds,
        });
        (connector, rx)
    }

    /// Refuse the next `n` connection attempts with a 503
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Every call to `connect`, successful or not
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<Connection, ConnectionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ConnectionError::Status(StatusCode::SERVICE_UNAVAILABLE));
        }

        let (tx, rx) = flume::unbounded();
        let _ = self.feeds.send(tx);
        Ok(Connection::new(
            Some("multipart/x-mixed-replace; boundary=frame".into()),
            rx.into_stream().boxed(),
        ))
    }
}

/// Treats every body chunk as one complete image
pub struct Passthrough;

impl FrameDecoder for Passthrough {
    fn decode(&self, connection: Connection) -> ImageStream {
        connection.body.map_err(CameraError::from).boxed()
    }
}

pub fn config() -> CameraConfig {
    let mut config = CameraConfig::new("http://camera.invalid/stream");
    config.name = Some("camX".into());
    config.reconnect = ReconnectConfig::immediate();
    config.screenshot_timeout_ms = 2_000;
    config
}

pub fn camera(connector: Arc<FakeConnector>, config: CameraConfig) -> Camera {
    Camera::builder(config)
        .connector(connector)
        .decoder(Arc::new(Passthrough))
        .build()
        .unwrap()
}

pub fn frame(n: u8) -> Bytes {
    Bytes::from(vec![0xFF, 0xD8, n, 0xFF, 0xD9])
}

/// Next connection the camera opens
pub async fn next_feed(feeds: &flume::Receiver<Feed>) -> Feed {
    tokio::time::timeout(Duration::from_secs(2), feeds.recv_async())
        .await
        .expect("camera never connected")
        .unwrap()
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
