use anyhow::{Context, Result};
use facelock_core::{templates, EmbeddingEngine, ScrfdDetector};
use facelock_hw::{CameraBackend, ReplayBackend, V4l2Backend};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod relay;

use config::{CameraSource, Config};
use dbus_interface::{FaceLockService, BUS_NAME, OBJECT_PATH};
use engine::AuthEngine;
use relay::{Relay, RelayRegistry};

fn open_camera(config: &Config) -> Result<Box<dyn CameraBackend>> {
    Ok(match config.camera_source() {
        CameraSource::V4l2 { front_devices } => {
            tracing::info!(?front_devices, "using V4L2 camera backend");
            Box::new(V4l2Backend::new(front_devices, config.warmup_frames))
        }
        CameraSource::Replay(path) => Box::new(
            ReplayBackend::from_file(&path)
                .with_context(|| format!("replay camera {}", path.display()))?,
        ),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facelockd starting");

    let config = Arc::new(Config::load().context("loading configuration")?);
    let camera = open_camera(&config)?;

    let detector_path = config.detector_model_path();
    let detector = ScrfdDetector::load(&detector_path, config.inference_threads)
        .with_context(|| format!("loading face detector {detector_path}"))?;
    tracing::info!(path = %detector_path, "SCRFD detector loaded");

    // Loaded once for the life of the process; failure leaves it disabled
    // until ReloadEngine.
    let embedder = Arc::new(EmbeddingEngine::load_onnx(
        &config.embedding_model_path(),
        config.inference_threads,
    ));

    let gallery = match templates::load(&config.templates_path) {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(
                path = %config.templates_path.display(),
                error = %e,
                "no enrolled templates loaded; authentication will fail until ReloadEngine"
            );
            Vec::new()
        }
    };

    let engine = Arc::new(AuthEngine::new(
        camera,
        Box::new(detector),
        Arc::clone(&embedder),
        gallery,
        config.policy(),
        config.capture_timeout(),
    ));

    let relays = RelayRegistry::global();
    relays.register(Relay::Boot);
    relays.register(Relay::ScreenOn);

    let service = FaceLockService::new(Arc::clone(&engine), Arc::clone(&config), relays);
    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = BUS_NAME, session_bus = config.session_bus, "facelockd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("facelockd shutting down");

    engine.cancel();
    relays.unregister(Relay::ScreenOn);
    relays.unregister(Relay::Boot);
    relays.teardown();
    embedder.shutdown();

    Ok(())
}
