//! Connection manager handle.
//!
//! [`ConnectionManager`] is the public face of the link. It spawns the
//! connection actor and forwards commands to it; state is observed through
//! watch channels, so reading it never waits on the actor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, warn};

use hd_core::config::AppConfig;
use hd_core::constants;
use hd_core::error::{HdError, HdResult};

use crate::credentials::CredentialProvider;
use crate::dispatcher::TopicDispatcher;
use crate::events::{
    ConnectionState, ContextSnapshot, InboundMessage, ReconnectReason, SessionState,
    TopicSubscription,
};
use crate::machine::{ConnectionMachine, Event, MachineOutputs, Step};
use crate::payloads::{ActivityPayload, CallSignalPayload, TypingPayload};
use crate::policy::{Backoff, FailurePolicy};
use crate::publish::{PublishDestinations, Publisher};
use crate::transport::Transport;

/// Everything the link needs to know besides credentials.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// WebSocket endpoint.
    pub url: String,
    /// Extra headers on the upgrade request.
    pub upgrade_headers: Vec<(String, String)>,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub health_check_interval: Duration,
    pub stale_threshold: Duration,
    /// Consecutive failures before the link stops retrying.
    pub max_reconnect_attempts: u32,
    pub backoff: Backoff,
    pub failure_policy: FailurePolicy,
    /// Subscribed after every CONNECTED.
    pub topics: Vec<TopicSubscription>,
    pub publish: PublishDestinations,
}

impl LinkSettings {
    /// Settings with default tuning for `url` and no topics.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            upgrade_headers: Vec::new(),
            heartbeat_interval: Duration::from_millis(constants::DEFAULT_HEARTBEAT_MS),
            connect_timeout: Duration::from_secs(15),
            health_check_interval: Duration::from_secs(5),
            stale_threshold: Duration::from_secs(20),
            max_reconnect_attempts: constants::DEFAULT_MAX_RECONNECT_ATTEMPTS,
            backoff: Backoff::default(),
            failure_policy: FailurePolicy::default(),
            topics: Vec::new(),
            publish: PublishDestinations::default(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let connection = &config.connection;
        let mut upgrade_headers: Vec<(String, String)> = config
            .server
            .custom_headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        upgrade_headers.sort();

        Self {
            url: config.server.ws_url.clone(),
            upgrade_headers,
            heartbeat_interval: connection.heartbeat_interval(),
            connect_timeout: connection.connect_timeout(),
            health_check_interval: connection.health_check_interval(),
            stale_threshold: connection.stale_threshold(),
            max_reconnect_attempts: connection.max_reconnect_attempts,
            backoff: Backoff::from_config(connection),
            failure_policy: FailurePolicy::from_config(&connection.failure_policy),
            topics: config.topics.iter().map(TopicSubscription::from).collect(),
            publish: PublishDestinations::from_config(&config.publish),
        }
    }

    pub fn with_topic(
        mut self,
        destination: impl Into<String>,
        subscription_id: impl Into<String>,
    ) -> Self {
        self.topics
            .push(TopicSubscription::new(destination, subscription_id));
        self
    }
}

/// Handle to the connection actor. Cloning is cheap; all clones drive the same link.
#[derive(Clone)]
pub struct ConnectionManager {
    events: mpsc::UnboundedSender<Event>,
    state: watch::Receiver<ConnectionState>,
    snapshot: watch::Receiver<ContextSnapshot>,
    tap: broadcast::Sender<InboundMessage>,
    publisher: Publisher,
}

impl ConnectionManager {
    /// Spawn the connection actor on the current tokio runtime.
    ///
    /// The link stays idle until a valid session arrives via [`update_session`](Self::update_session).
    pub fn spawn(
        settings: LinkSettings,
        dispatcher: TopicDispatcher,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (snapshot_tx, snapshot_rx) = watch::channel(ContextSnapshot::default());
        let (live_tx, live_rx) = watch::channel(None);

        let publisher = Publisher::new(
            state_rx.clone(),
            live_rx,
            events_tx.clone(),
            settings.publish.clone(),
        );
        let tap = dispatcher.tap();

        let mut machine = ConnectionMachine::new(
            settings,
            transport,
            credentials,
            dispatcher,
            events_tx.clone(),
            MachineOutputs {
                state: state_tx,
                snapshot: snapshot_tx,
                live: live_tx,
            },
        );

        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if machine.step(event) == Step::Stop {
                    break;
                }
            }
            debug!("connection actor stopped");
        });

        Self {
            events: events_tx,
            state: state_rx,
            snapshot: snapshot_rx,
            tap,
            publisher,
        }
    }

    /// Start connecting if the session allows it. No-op while connected.
    pub fn connect(&self) {
        self.send(Event::Connect);
    }

    /// Drop the current socket and connect again right away.
    ///
    /// Ignored while an attempt is already in flight.
    pub fn force_reconnect(&self, reason: ReconnectReason) {
        self.send(Event::ForceReconnect(reason));
    }

    /// Close the socket and cancel all pending work. The link stays idle until
    /// the next `connect` or session change.
    pub fn disconnect(&self) {
        self.send(Event::Disconnect);
    }

    /// Report the current session. A session turning valid connects with a
    /// fresh retry budget; one turning invalid tears the link down.
    pub fn update_session(&self, session: SessionState) {
        self.send(Event::Session(session));
    }

    /// Tear down and stop the actor. Returns once teardown has completed.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.events.send(Event::Shutdown(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn snapshot_receiver(&self) -> watch::Receiver<ContextSnapshot> {
        self.snapshot.clone()
    }

    /// Every inbound MESSAGE, routed or not.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.tap.subscribe()
    }

    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    pub fn publish_activity(&self, payload: &ActivityPayload) -> bool {
        self.publisher.publish_activity(payload)
    }

    pub fn publish_typing(&self, payload: &TypingPayload) -> bool {
        self.publisher.publish_typing(payload)
    }

    pub fn publish_call_signal(&self, payload: &CallSignalPayload) -> bool {
        self.publisher.publish_call_signal(payload)
    }

    /// Wait until the link reaches `target`, or fail after `timeout`.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> HdResult<()> {
        let mut rx = self.state.clone();
        let wait = rx.wait_for(|state| *state == target);
        let result = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(HdError::Internal("connection actor stopped".into())),
            Err(_) => Err(HdError::Timeout(format!(
                "link did not reach {target} within {}ms",
                timeout.as_millis()
            ))),
        };
        result
    }

    fn send(&self, event: Event) {
        if self.events.send(event).is_err() {
            warn!("connection actor is not running");
        }
    }
}
