use std::{sync::Arc, time::Instant};
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{metrics::Metrics, registry::LimiterRegistry};

/// Background task evicting idle caller limiters
pub struct Sweeper;

impl Sweeper {
    /// Start sweeping every `registry.sweep_interval()`. Must be called inside a tokio runtime.
    pub fn spawn(registry: Arc<LimiterRegistry>, metrics: Arc<Metrics>) -> SweeperHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run(registry, metrics, stop_rx));

        SweeperHandle {
            stop: Some(stop_tx),
            task: Some(task),
        }
    }
}

async fn run(registry: Arc<LimiterRegistry>, metrics: Arc<Metrics>, mut stop: oneshot::Receiver<()>) {
    let mut ticker = interval(registry.sweep_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = registry.sweep_idle(Instant::now());
                let remaining = registry.caller_count();

                metrics.record_evicted_callers(evicted);
                metrics.set_caller_limiters(remaining);

                if evicted > 0 {
                    debug!(evicted, remaining, "evicted idle caller limiters");
                }
            }
            // Fires on an explicit stop and when the handle is dropped
            _ = &mut stop => break,
        }
    }

    debug!("caller limiter sweeper stopped");
}

/// Owner of the sweeper task; dropping it stops the sweeper
pub struct SweeperHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for the task to finish
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "caller limiter sweeper ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}
