//! netcam: pull an MJPEG camera stream and republish it

use std::path::PathBuf;
use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use netcam::{Camera, Config};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let mut path = None;
    let mut screenshot = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--screenshot" => screenshot = true,
            flag if flag.starts_with("--") => return Err(eyre!("unknown flag {flag}")),
            _ => path = Some(PathBuf::from(arg)),
        }
    }

    let config = Config::load(path.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("netcam launching...");
    let camera = Camera::new(config.camera)?;

    if screenshot {
        let frame = camera.screenshot().await?;
        info!(
            camera = camera.name(),
            bytes = frame.len(),
            timestamp = ?frame.timestamp,
            "Screenshot"
        );
        return Ok(());
    }

    camera.start()?;
    let subscription = camera.attach();

    let mut window_start = Instant::now();
    let mut window_frames = 0u64;
    let mut window_bytes = 0usize;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            frame = subscription.recv() => {
                let Some(frame) = frame else {
                    warn!(camera = camera.name(), "Stream ended");
                    break;
                };
                debug!(bytes = frame.len(), "Frame");
                window_frames += 1;
                window_bytes += frame.len();

                let elapsed = window_start.elapsed();
                if elapsed >= Duration::from_secs(1) {
                    info!(
                        camera = camera.name(),
                        fps = %format!("{:.1}", window_frames as f64 / elapsed.as_secs_f64()),
                        kib_per_frame = window_bytes / window_frames as usize / 1024,
                        "Streaming"
                    );
                    window_start = Instant::now();
                    window_frames = 0;
                    window_bytes = 0;
                }
            }
        }
    }

    drop(subscription);
    camera.stop();
    let metrics = camera.metrics();
    info!(
        published = metrics.frames_published,
        dropped = metrics.frames_dropped,
        reconnects = metrics.reconnects,
        "Stopped"
    );
    Ok(())
}
