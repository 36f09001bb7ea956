//! Periodic sweep and retention purge.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use relay_dispatcher::Housekeeper;

pub struct Maintenance {
    housekeeper: Arc<Housekeeper>,
    sweep_interval: Duration,
    purge_interval: Duration,
}

impl Maintenance {
    pub fn new(housekeeper: Arc<Housekeeper>, sweep_interval_secs: u64, purge_interval_secs: u64) -> Self {
        Self {
            housekeeper,
            sweep_interval: Duration::from_secs(sweep_interval_secs.max(1)),
            purge_interval: Duration::from_secs(purge_interval_secs.max(1)),
        }
    }

    /// Run both schedules until the task is cancelled. Both fire once at startup.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        let mut purge = tokio::time::interval(self.purge_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        purge.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            sweep_interval_secs = self.sweep_interval.as_secs(),
            purge_interval_secs = self.purge_interval.as_secs(),
            "Maintenance schedules started"
        );

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    self.sweep_once().await;
                }
                _ = purge.tick() => {
                    self.purge_once().await;
                }
            }
        }
    }

    /// Returns the number of jobs enqueued, 0 on failure.
    pub async fn sweep_once(&self) -> usize {
        match self.housekeeper.sweep().await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "Sweep failed");
                0
            }
        }
    }

    /// Returns the number of jobs deleted, 0 on failure.
    pub async fn purge_once(&self) -> u64 {
        match self.housekeeper.purge().await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "Purge failed");
                0
            }
        }
    }
}
