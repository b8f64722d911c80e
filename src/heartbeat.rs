//! Server-side liveness frames for quiet clients.

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::HeartbeatConfig;
use crate::protocol::ServerFrame;

/// Background task emitting `heartbeat` frames whenever the client has not
/// pinged for longer than the threshold.
pub struct HeartbeatMonitor {
    handle: JoinHandle<()>,
}

impl HeartbeatMonitor {
    /// `last_ping` is updated by the session each time the client pings.
    pub fn spawn(
        out: mpsc::Sender<ServerFrame>,
        last_ping: watch::Receiver<Instant>,
        config: &HeartbeatConfig,
    ) -> Self {
        let handle = tokio::spawn(run(out, last_ping, config.threshold(), config.check_interval()));
        Self { handle }
    }

    /// Abort the task and wait for it to wind down.
    pub async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

async fn run(
    out: mpsc::Sender<ServerFrame>,
    last_ping: watch::Receiver<Instant>,
    threshold: Duration,
    check_interval: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + check_interval, check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let quiet_for = Instant::now().duration_since(*last_ping.borrow());

        // Keeps firing on every tick until the client pings again.
        if quiet_for > threshold && out.send(ServerFrame::heartbeat()).await.is_err() {
            tracing::debug!("Heartbeat channel closed, stopping monitor");
            break;
        }
    }
}
