// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Config watcher.
//!
//! Polls the persisted [`AlgorithmConfig`] document and publishes changes on a
//! `tokio::sync::watch` channel. Subscribers hold a [`ConfigHandle`].
//!
//! A missing document means defaults. A failing read keeps the last published
//! value and logs a warning.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

use crate::model::AlgorithmConfig;
use crate::persistence::ConfigStore;

/// Read side of the config channel.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    rx: watch::Receiver<AlgorithmConfig>,
}

impl ConfigHandle {
    /// A handle whose value never changes.
    pub fn fixed(config: AlgorithmConfig) -> Self {
        let (_tx, rx) = watch::channel(config.normalized());
        Self { rx }
    }

    /// The currently published baseline.
    pub fn current(&self) -> AlgorithmConfig {
        *self.rx.borrow()
    }

    /// Wait for the next published change. Returns `None` once the watcher is
    /// gone and no further change can arrive.
    pub async fn changed(&mut self) -> Option<AlgorithmConfig> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}

/// Background poller of the persisted config document.
pub struct ConfigWatcher {
    store: Arc<dyn ConfigStore>,
    poll_interval: Duration,
    tx: watch::Sender<AlgorithmConfig>,
    shutdown: Arc<Notify>,
}

impl ConfigWatcher {
    /// Load the initial config and create the watcher.
    pub async fn initialize(store: Arc<dyn ConfigStore>, poll_interval: Duration) -> Self {
        let initial = match store.load_algorithm_config().await {
            Ok(Some(config)) => config.normalized(),
            Ok(None) => {
                info!("No persisted algorithm config, using defaults");
                AlgorithmConfig::default()
            }
            Err(e) => {
                warn!(error = %e, "Failed to load algorithm config, using defaults");
                AlgorithmConfig::default()
            }
        };

        info!(
            min_users = initial.min_users,
            max_wait_time_ms = initial.max_wait_time.as_millis() as u64,
            user_timeout_ms = initial.user_timeout.as_millis() as u64,
            "Algorithm config loaded"
        );

        let (tx, _rx) = watch::channel(initial);
        Self {
            store,
            poll_interval,
            tx,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// A new subscriber.
    pub fn subscribe(&self) -> ConfigHandle {
        ConfigHandle {
            rx: self.tx.subscribe(),
        }
    }

    /// The currently published config.
    pub fn current(&self) -> AlgorithmConfig {
        *self.tx.borrow()
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Re-read the store once. Returns `true` if a new value was published.
    pub async fn refresh(&self) -> bool {
        let loaded = match self.store.load_algorithm_config().await {
            Ok(Some(config)) => config.normalized(),
            Ok(None) => AlgorithmConfig::default(),
            Err(e) => {
                warn!(error = %e, "Failed to reload algorithm config, keeping last known");
                return false;
            }
        };

        let changed = self.tx.send_if_modified(|current| {
            if *current == loaded {
                return false;
            }
            *current = loaded;
            true
        });

        if changed {
            info!(
                min_users = loaded.min_users,
                max_wait_time_ms = loaded.max_wait_time.as_millis() as u64,
                user_timeout_ms = loaded.user_timeout.as_millis() as u64,
                "Algorithm config changed"
            );
        }
        changed
    }

    /// Run the polling loop until shutdown.
    pub async fn run(self) {
        debug!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Config watcher started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Config watcher shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    self.refresh().await;
                }
            }
        }
    }
}
