use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::event_store::EventStore;
use crate::scheduler::EventScheduler;

pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Periodic due-event sweep. Each cycle claims every due event via the
/// store's compare-and-swap and processes the claimed ones concurrently;
/// events another cycle claimed first are skipped.
pub struct DueSweep {
    store: Arc<Mutex<EventStore>>,
    scheduler: Arc<EventScheduler>,
    interval: Duration,
}

impl DueSweep {
    pub fn new(store: Arc<Mutex<EventStore>>, scheduler: Arc<EventScheduler>) -> Self {
        let secs = std::env::var("SWEEP_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);

        Self {
            store,
            scheduler,
            interval: Duration::from_secs(secs),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sweep loop - runs until the task is dropped.
    pub async fn run(self) {
        info!("Due-event sweep started (every {:?})", self.interval);
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            ticker.tick().await;
            if let Err(e) = self.run_once().await {
                error!("Sweep cycle failed: {}", e);
                // Next tick gets a fresh chance
            }
        }
    }

    /// One sweep cycle: claim and process everything currently due.
    pub async fn run_once(&self) -> Result<usize> {
        let now = Utc::now().to_rfc3339();

        let claimed = {
            let store = self.store.lock().await;
            let due = store.due_events(&now)?;
            let mut claimed = Vec::with_capacity(due.len());
            for event in due {
                if store.claim(&event.id)? {
                    claimed.push(event);
                } else {
                    debug!("Event {} claimed elsewhere, skipping", event.id);
                }
            }
            claimed
        };

        if claimed.is_empty() {
            return Ok(0);
        }
        info!("Sweep claimed {} due events", claimed.len());

        let mut handles = Vec::with_capacity(claimed.len());
        for event in claimed {
            let scheduler = self.scheduler.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = scheduler.process_event(&event).await {
                    error!("Processing event {} failed: {}", event.id, e);
                }
            }));
        }

        let processed = handles.len();
        for handle in handles {
            // Panics in a processing task are logged and absorbed.
            if let Err(e) = handle.await {
                error!("Event processing task panicked: {}", e);
            }
        }

        Ok(processed)
    }
}
