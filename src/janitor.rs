//! Periodic removal of abandoned upload sessions
//!
//! Chunks of a session that never gets merged would otherwise stay in
//! staging forever. The janitor sweeps staging on a fixed interval and drops
//! every session whose newest chunk is older than the configured age.

use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::JanitorConfig;
use crate::error::Error;
use crate::storage::Storage;

/// Background sweeper for staged chunks
pub struct Janitor {
    storage: Arc<dyn Storage>,
    config: JanitorConfig,
    cancel: CancellationToken,
}

impl Janitor {
    /// Create a janitor that stops when `cancel` fires
    pub fn new(storage: Arc<dyn Storage>, config: JanitorConfig, cancel: CancellationToken) -> Self {
        Self {
            storage,
            config,
            cancel,
        }
    }

    /// Run one sweep, returning the number of sessions removed
    ///
    /// Backends that cannot enumerate staging report zero.
    pub async fn sweep_once(&self) -> usize {
        match self.storage.sweep_staging(self.config.max_age).await {
            Ok(0) => {
                debug!(backend = self.storage.backend_name(), "no abandoned upload sessions");
                0
            }
            Ok(removed) => {
                info!(
                    backend = self.storage.backend_name(),
                    removed, "removed abandoned upload sessions"
                );
                removed
            }
            Err(Error::NotSupported(reason)) => {
                debug!(backend = self.storage.backend_name(), %reason, "staging sweep not supported");
                0
            }
            Err(e) => {
                warn!(backend = self.storage.backend_name(), error = %e, "staging sweep failed");
                0
            }
        }
    }

    /// Sweep until cancelled
    ///
    /// Returns immediately when the sweep interval is zero.
    pub async fn run(self) {
        if self.config.sweep_interval.is_zero() {
            info!("janitor disabled");
            return;
        }

        info!(
            interval_secs = self.config.sweep_interval.as_secs(),
            max_age_secs = self.config.max_age.as_secs(),
            "janitor started"
        );

        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("janitor stopped");
                    break;
                }
                _ = interval.tick() => {
                    self.sweep_once().await;
                }
            }
        }
    }
}
