use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::sweep::{NotificationSweep, SweepError, SweepSummary};

/// Background worker that runs the reminder sweep and then the expiry sweep
/// on a fixed cadence. Runs never overlap within the process.
#[derive(Clone)]
pub struct SweepWorker {
    sweep: NotificationSweep,
    interval: Duration,
}

impl SweepWorker {
    pub fn new(sweep: NotificationSweep, interval: Duration) -> Self {
        Self { sweep, interval }
    }

    /// Runs the worker loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        info!(
            stage = "worker",
            interval_secs = self.interval.as_secs(),
            "sweep worker started"
        );
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(stage = "worker", error = %err, "sweep run failed");
            }
        }
    }

    /// Executes one cycle. The expiry sweep runs even if the reminder sweep
    /// failed; the first error is returned.
    pub async fn run_once(&self) -> Result<[SweepSummary; 2], SweepError> {
        let reminder = self.sweep.run_reminder_sweep().await;
        let expiry = self.sweep.run_expiry_sweep().await;
        Ok([reminder?, expiry?])
    }
}
