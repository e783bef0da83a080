//! Shared test utilities for integration tests.

#![allow(dead_code)]

use std::time::Duration;

use tokio::sync::watch;

use hd_services::{LifecycleTriggers, Service, TriggerInputs};
use hd_socket::testing::{settle, test_settings, TestLink};
use hd_socket::{ConnectionState, SessionState};

/// A test link driven by lifecycle triggers, plus the senders that play the
/// host application's observers.
pub struct Harness {
    pub link: TestLink,
    pub triggers: LifecycleTriggers,
    pub session: watch::Sender<SessionState>,
    pub online: watch::Sender<bool>,
    pub foreground: watch::Sender<bool>,
}

impl Harness {
    /// Start with the given session, online and in the foreground.
    pub fn start(session: SessionState) -> Self {
        let link = TestLink::spawn(test_settings());
        let (session_tx, session_rx) = watch::channel(session);
        let (online_tx, online_rx) = watch::channel(true);
        let (foreground_tx, foreground_rx) = watch::channel(true);

        let mut triggers = LifecycleTriggers::new(
            link.manager.clone(),
            TriggerInputs {
                session: session_rx,
                online: online_rx,
                foreground: foreground_rx,
            },
        );
        triggers.init().expect("failed to start lifecycle triggers");

        Self {
            link,
            triggers,
            session: session_tx,
            online: online_tx,
            foreground: foreground_tx,
        }
    }

    /// Signed in to `ws-1` with the first socket accepted.
    pub async fn connected() -> Self {
        let harness = Self::start(SessionState::signed_in("ws-1"));
        settle().await;
        harness.link.transport.last().accept();
        settle().await;
        assert_eq!(harness.link.manager.state(), ConnectionState::Connected);
        harness
    }

    pub fn opened(&self) -> usize {
        self.link.transport.opened()
    }

    /// Flip a boolean observer and let the trigger loop see the new value.
    pub async fn set(signal: &watch::Sender<bool>, value: bool) {
        signal.send_replace(value);
        settle().await;
    }
}

/// Advance the paused clock.
pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
