//! Periodic retention sweep.
//!
//! Deletes messages past the retention horizon on a fixed interval.
//! Failures are logged and the loop keeps going; losing one sweep is
//! harmless because the next one covers the same ground.

use crate::sqlite::ConversationStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Default sweep interval.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Default retention horizon.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Owns the background purge loop.
pub struct Sweeper {
    store: Arc<ConversationStore>,
    interval: Duration,
    retention: Duration,
}

impl Sweeper {
    pub fn new(store: Arc<ConversationStore>) -> Self {
        Self {
            store,
            interval: DEFAULT_SWEEP_INTERVAL,
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Start the sweep loop. The first sweep happens one interval from now.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The immediate first tick would purge at startup; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = Utc::now();
                let cutoff = now
                    - chrono::Duration::from_std(self.retention)
                        .unwrap_or_else(|_| chrono::Duration::hours(24));
                match self.store.purge_older_than(cutoff, now).await {
                    Ok(deleted) => {
                        if deleted > 0 {
                            info!(deleted, "retention sweep complete");
                        }
                    }
                    Err(e) => warn!(error = %e, "retention sweep failed"),
                }
            }
        })
    }
}
