//! One-shot timers owned by the connection actor.
//!
//! Each [`TimerKind`] has at most one live timer. Arming a kind replaces the
//! previous one, and every timer carries a generation so a fire that raced a
//! cancel is recognised as stale and dropped.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// The timers the link uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// No CONNECTED within the connect timeout.
    ConnectTimeout,
    /// Backoff delay before the next attempt.
    Reconnect,
    /// Periodic inbound-silence check.
    HealthCheck,
}

impl std::fmt::Display for TimerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectTimeout => write!(f, "connect-timeout"),
            Self::Reconnect => write!(f, "reconnect"),
            Self::HealthCheck => write!(f, "health-check"),
        }
    }
}

/// Delivered to the owner's event channel when a timer elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
}

struct ArmedTimer {
    generation: u64,
    task: JoinHandle<()>,
}

/// Timer table keyed by kind.
pub struct TimerSet<E> {
    tx: mpsc::UnboundedSender<E>,
    armed: HashMap<TimerKind, ArmedTimer>,
    next_generation: u64,
}

impl<E> TimerSet<E>
where
    E: From<TimerFired> + Send + 'static,
{
    pub fn new(tx: mpsc::UnboundedSender<E>) -> Self {
        Self {
            tx,
            armed: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Arm `kind` to fire after `delay`, replacing any pending timer of that kind.
    pub fn arm(&mut self, kind: TimerKind, delay: Duration) -> u64 {
        self.cancel(kind);
        self.next_generation += 1;
        let generation = self.next_generation;
        let deadline = Instant::now() + delay;
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(E::from(TimerFired { kind, generation }));
        });
        self.armed.insert(
            kind,
            ArmedTimer { generation, task },
        );
        generation
    }

    /// Cancel `kind`. Returns whether a timer was pending.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.armed.remove(&kind) {
            Some(timer) => {
                timer.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.armed.drain() {
            timer.task.abort();
        }
    }

    /// Accept a fire if it belongs to the current timer of its kind.
    ///
    /// Returns `false` for fires of cancelled or replaced timers.
    pub fn take_fired(&mut self, fired: TimerFired) -> bool {
        match self.armed.get(&fired.kind) {
            Some(timer) if timer.generation == fired.generation => {
                self.armed.remove(&fired.kind);
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Number of pending timers.
    pub fn pending(&self) -> usize {
        self.armed.len()
    }
}

impl<E> Drop for TimerSet<E> {
    fn drop(&mut self) {
        for (_, timer) in self.armed.drain() {
            timer.task.abort();
        }
    }
}
