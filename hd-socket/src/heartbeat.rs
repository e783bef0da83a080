//! Outbound heart-beats and inbound activity tracking.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::frame::Frame;
use crate::transport::SocketHandle;

/// Sends a heart-beat frame every interval while a socket is open, and records
/// when the last inbound byte arrived.
pub struct HeartbeatMonitor {
    interval: Duration,
    task: Option<JoinHandle<()>>,
    last_activity: Instant,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            task: None,
            last_activity: Instant::now(),
        }
    }

    /// Start sending on `socket`, replacing any previous sender.
    ///
    /// The first heart-beat goes out one interval after the call.
    pub fn start(&mut self, socket: SocketHandle) {
        self.stop();
        let interval = self.interval;
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !socket.is_open() {
                    debug!("socket {} no longer open, heart-beat stopping", socket.id());
                    break;
                }
                if let Err(e) = socket.send_frame(&Frame::heartbeat()) {
                    warn!("heart-beat send failed on socket {}: {e}", socket.id());
                    break;
                }
                trace!("heart-beat sent on socket {}", socket.id());
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Note that something arrived from the server.
    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Time since the last inbound activity.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use crate::transport::{Outgoing, SocketId};

    fn socket() -> (SocketHandle, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SocketHandle::new(SocketId(1), tx, Arc::new(AtomicBool::new(true)));
        (handle, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_heartbeat_each_interval() {
        let (handle, mut rx) = socket();
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(10));
        monitor.start(handle);

        tokio::time::sleep(Duration::from_millis(9_900)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rx.try_recv().unwrap(), Outgoing::Data(vec![b'\n']));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rx.try_recv().unwrap(), Outgoing::Data(vec![b'\n']));
        assert!(monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_heartbeats() {
        let (handle, mut rx) = socket();
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(1));
        monitor.start(handle);
        monitor.stop();
        assert!(!monitor.is_running());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_socket_ends_task() {
        let (handle, mut rx) = socket();
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(1));
        monitor.start(handle.clone());
        handle.close(1000, "done");
        assert_eq!(rx.try_recv().unwrap(), Outgoing::Close { code: 1000, reason: "done".into() });

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_tracking() {
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(monitor.idle_for(), Duration::from_secs(7));

        monitor.record_activity();
        assert_eq!(monitor.idle_for(), Duration::ZERO);
    }
}
