use crate::config::Config;
use crate::engine::{AuthEngine, AuthError};
use crate::relay::{RelayRegistry, SystemEvent};
use std::sync::Arc;
use zbus::fdo;
use zbus::interface;

pub const BUS_NAME: &str = "org.facelock.FaceLock1";
pub const OBJECT_PATH: &str = "/org/facelock/FaceLock1";

/// D-Bus interface for the FaceLock daemon.
///
/// Bus name: org.facelock.FaceLock1
/// Object path: /org/facelock/FaceLock1
pub struct FaceLockService {
    engine: Arc<AuthEngine>,
    config: Arc<Config>,
    relays: &'static RelayRegistry,
}

impl FaceLockService {
    pub fn new(
        engine: Arc<AuthEngine>,
        config: Arc<Config>,
        relays: &'static RelayRegistry,
    ) -> Self {
        Self {
            engine,
            config,
            relays,
        }
    }
}

fn to_fdo(e: AuthError) -> fdo::Error {
    match e {
        AuthError::PermissionDenied => fdo::Error::AccessDenied(e.to_string()),
        AuthError::Timeout(_) => fdo::Error::Timeout(e.to_string()),
        AuthError::Busy => fdo::Error::LimitsExceeded(e.to_string()),
        other => fdo::Error::Failed(other.to_string()),
    }
}

#[interface(name = "org.facelock.FaceLock1")]
impl FaceLockService {
    /// Capture one frame and check it against the enrolled templates.
    /// Returns (matched, distance).
    async fn authenticate(&self) -> fdo::Result<(bool, f64)> {
        tracing::info!("authenticate requested");
        let engine = Arc::clone(&self.engine);
        let result = tokio::task::spawn_blocking(move || engine.authenticate())
            .await
            .map_err(|e| fdo::Error::Failed(format!("attempt task failed: {e}")))?
            .map_err(to_fdo)?;
        Ok((result.matched, f64::from(result.score)))
    }

    /// Cancel the running attempt, if any.
    async fn cancel(&self) -> bool {
        self.engine.cancel()
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "engine": self.engine.status(),
            "metric": self.config.metric,
            "threshold": self.config.threshold,
            "relays": self.relays.registered(),
        })
        .to_string())
    }

    /// Reload the embedding model and the enrolled templates from disk.
    /// Whichever loads is installed; the error names whichever failed.
    async fn reload_engine(&self) -> fdo::Result<()> {
        tracing::info!("reload requested");
        let engine = Arc::clone(&self.engine);
        let config = Arc::clone(&self.config);
        tokio::task::spawn_blocking(move || {
            engine.reload_from(
                &config.embedding_model_path(),
                config.inference_threads,
                &config.templates_path,
            )
        })
        .await
        .map_err(|e| fdo::Error::Failed(format!("reload task failed: {e}")))?
        .map_err(|e| {
            tracing::error!(error = %e, "reload failed");
            fdo::Error::Failed(e)
        })
    }

    /// Relay a boot-completed notification.
    async fn notify_boot(&self) -> bool {
        self.relays.dispatch(SystemEvent::BootCompleted)
    }

    /// Relay a screen-on notification.
    async fn notify_screen_on(&self) -> bool {
        self.relays.dispatch(SystemEvent::ScreenOn)
    }
}
