//! Background maintenance
//!
//! - expiry audit: drops expired nodes from loaded holders
//! - storage sync: re-reads groups, tracks and online users
//!
//! Both run on fixed intervals from the config (0 disables) until shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Handles to the running tasks
#[derive(Debug)]
pub struct BackgroundTasks {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Spawn the tasks enabled in the engine's config
    pub fn start(engine: &Arc<Engine>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();
        let config = engine.config();

        if config.expiry_check_interval_secs > 0 {
            handles.push(every(
                "expiry audit",
                Duration::from_secs(config.expiry_check_interval_secs),
                engine.clone(),
                shutdown_rx.clone(),
                |engine| async move {
                    let changed = engine.audit_expired().await;
                    if changed > 0 {
                        debug!("Expiry audit changed {} holders", changed);
                    }
                },
            ));
        }

        if config.sync_interval_secs > 0 {
            handles.push(every(
                "storage sync",
                Duration::from_secs(config.sync_interval_secs),
                engine.clone(),
                shutdown_rx,
                |engine| async move {
                    if let Err(e) = engine.sync().await {
                        warn!("Storage sync failed: {}", e);
                    }
                },
            ));
        }

        Self {
            shutdown_tx,
            handles,
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal every task to stop and wait for them
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
    }
}

fn every<F, Fut>(
    name: &'static str,
    period: Duration,
    engine: Arc<Engine>,
    mut shutdown: watch::Receiver<bool>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<Engine>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        info!("Starting {} every {:?}", name, period);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => job(engine.clone()).await,
                _ = shutdown.changed() => break,
            }
        }
        debug!("Stopped {}", name);
    })
}
