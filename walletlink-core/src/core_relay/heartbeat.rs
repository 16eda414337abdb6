//! Heartbeat pulse
//!
//! A single interval shared by the relay transport (keepalive, publish
//! redelivery) and the expirer sweep.

use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::trace;

pub struct Heartbeat {
    interval: Duration,
    pulses: broadcast::Sender<u64>,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        let (pulses, _) = broadcast::channel(16);
        Self { interval, pulses }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.pulses.subscribe()
    }

    /// Emit pulses forever; the first one fires one interval after start
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut count: u64 = 0;
        loop {
            ticker.tick().await;
            count += 1;
            trace!(count, "heartbeat pulse");
            let _ = self.pulses.send(count);
        }
    }
}
