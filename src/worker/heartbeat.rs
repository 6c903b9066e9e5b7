use std::time::Duration;
use tokio::sync::mpsc;

/// Ticks heartbeat signals into a channel while a build is running. The
/// worker loop owns the receiver and forwards each tick to the
/// orchestrator; dropping the receiver stops the ticker.
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub async fn run(&self, tx: mpsc::Sender<()>) {
        let mut interval = tokio::time::interval(self.interval);
        // The first tick fires immediately; skip it so the initial
        // heartbeat lands one interval after the claim.
        interval.tick().await;

        loop {
            interval.tick().await;
            if tx.send(()).await.is_err() {
                break;
            }
        }
    }
}
