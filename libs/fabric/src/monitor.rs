use std::sync::Weak;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::instance::Instance;

/// Periodically lets every connection send heartbeats and close when idle
pub struct ConnectionMonitor {
    task: JoinHandle<()>,
}

impl ConnectionMonitor {
    pub(crate) fn start(instance: Weak<Instance>, handle: &tokio::runtime::Handle, interval: Duration) -> Self {
        let interval = interval.max(Duration::from_millis(10));
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(instance) = instance.upgrade() else {
                    return;
                };
                if instance.is_destroyed() {
                    return;
                }
                let now = Instant::now();
                instance.outgoing_connection_factory().monitor(now);
                instance.adapter_factory().monitor(now);
            }
        });
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
