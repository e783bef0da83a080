//! Connection state machine.
//!
//! All link state lives in [`ConnectionMachine`], which is owned by a single
//! actor task. Commands from the handle, socket events, timer fires and the
//! results of spawned credential work all arrive as [`Event`]s on one channel
//! and are applied one at a time by [`ConnectionMachine::step`], so no two
//! transitions ever interleave. Anything slow (credential fetch, token
//! refresh, the socket itself) runs in its own task and reports back with an
//! event tagged by attempt or socket id, and results for superseded attempts
//! are discarded.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

use hd_core::constants::{close_codes, headers};
use hd_core::error::HdResult;

use crate::credentials::{validate_token, CredentialProvider, Credentials};
use crate::dispatcher::TopicDispatcher;
use crate::events::{
    ConnectionState, ContextSnapshot, FailureKind, ReconnectReason, SessionState,
};
use crate::frame::{Command, Frame};
use crate::heartbeat::HeartbeatMonitor;
use crate::manager::LinkSettings;
use crate::policy::FailureClass;
use crate::publish::LiveSocket;
use crate::timers::{TimerFired, TimerKind, TimerSet};
use crate::transport::{OpenRequest, SocketEvent, SocketEvents, SocketHandle, SocketId, Transport};

/// Input to the connection actor.
pub(crate) enum Event {
    Connect,
    ForceReconnect(ReconnectReason),
    Disconnect,
    Session(SessionState),
    CredentialsFetched {
        attempt: u64,
        result: HdResult<Credentials>,
    },
    TokenRefreshed(HdResult<()>),
    Socket {
        socket: SocketId,
        event: SocketEvent,
    },
    Timer(TimerFired),
    /// A publish was refused because the link was not usable.
    PublishRejected(String),
    Shutdown(oneshot::Sender<()>),
}

impl From<TimerFired> for Event {
    fn from(fired: TimerFired) -> Self {
        Event::Timer(fired)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    Stop,
}

/// Mutable flags shared by every transition.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConnectionContext {
    pub reconnect_attempts: u32,
    pub should_stop_retrying: bool,
    pub is_intentional_close: bool,
    pub is_cleaning_up: bool,
    pub is_connecting: bool,
    pub is_authenticated: bool,
    pub current_workspace: Option<String>,
    pub last_failure: Option<FailureKind>,
}

/// Watch channels the machine publishes after every step.
pub(crate) struct MachineOutputs {
    pub state: watch::Sender<ConnectionState>,
    pub snapshot: watch::Sender<ContextSnapshot>,
    pub live: watch::Sender<Option<LiveSocket>>,
}

pub(crate) struct ConnectionMachine {
    settings: LinkSettings,
    ctx: ConnectionContext,
    state: ConnectionState,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    dispatcher: TopicDispatcher,
    heartbeat: HeartbeatMonitor,
    timers: TimerSet<Event>,
    events: mpsc::UnboundedSender<Event>,
    outputs: MachineOutputs,
    socket: Option<SocketHandle>,
    /// Credentials of the current socket, used for CONNECT and SUBSCRIBE.
    session_credentials: Option<Credentials>,
    next_socket_id: u64,
    /// Bumped per connect attempt and on teardown; tags credential fetches.
    attempt: u64,
    refresh_in_flight: bool,
}

impl ConnectionMachine {
    pub(crate) fn new(
        settings: LinkSettings,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
        dispatcher: TopicDispatcher,
        events: mpsc::UnboundedSender<Event>,
        outputs: MachineOutputs,
    ) -> Self {
        let heartbeat = HeartbeatMonitor::new(settings.heartbeat_interval);
        Self {
            settings,
            ctx: ConnectionContext::default(),
            state: ConnectionState::Disconnected,
            transport,
            credentials,
            dispatcher,
            heartbeat,
            timers: TimerSet::new(events.clone()),
            events,
            outputs,
            socket: None,
            session_credentials: None,
            next_socket_id: 0,
            attempt: 0,
            refresh_in_flight: false,
        }
    }

    /// Apply one event.
    pub(crate) fn step(&mut self, event: Event) -> Step {
        match event {
            Event::Connect => self.connect(),
            Event::ForceReconnect(reason) => self.force_reconnect(reason),
            Event::Disconnect => self.teardown("disconnect requested"),
            Event::Session(session) => self.on_session(session),
            Event::CredentialsFetched { attempt, result } => self.on_credentials(attempt, result),
            Event::TokenRefreshed(result) => self.on_token_refreshed(result),
            Event::Socket { socket, event } => self.on_socket_event(socket, event),
            Event::Timer(fired) => self.on_timer(fired),
            Event::PublishRejected(destination) => {
                debug!("recording rejected publish to {destination}");
                self.ctx.last_failure = Some(FailureKind::PublishRejected);
            }
            Event::Shutdown(done) => {
                self.teardown("shutdown");
                self.publish_outputs();
                let _ = done.send(());
                return Step::Stop;
            }
        }
        self.publish_outputs();
        Step::Continue
    }

    // Commands

    fn connect(&mut self) {
        if self.state == ConnectionState::Connected
            && self.socket.as_ref().is_some_and(SocketHandle::is_open)
        {
            debug!("connect ignored: already connected");
            return;
        }
        self.begin_attempt();
    }

    fn force_reconnect(&mut self, reason: ReconnectReason) {
        if self.ctx.is_connecting {
            debug!("reconnect ({reason}) ignored: connect already in flight");
            return;
        }
        if let Err(why) = self.can_attempt_connection() {
            debug!("reconnect ({reason}) ignored: {why}");
            return;
        }
        info!("forcing reconnect: {reason}");
        self.timers.cancel(TimerKind::Reconnect);
        self.begin_attempt();
    }

    fn on_session(&mut self, session: SessionState) {
        let was_valid = self.ctx.is_authenticated && self.ctx.current_workspace.is_some();
        if self.ctx.current_workspace != session.workspace_id {
            debug!(
                "workspace {:?} -> {:?}",
                self.ctx.current_workspace, session.workspace_id
            );
        }
        self.ctx.is_authenticated = session.authenticated;
        self.ctx.current_workspace = session.workspace_id.clone();

        if !session.is_valid() {
            if was_valid || self.socket.is_some() || self.timers.pending() > 0 {
                self.teardown("session no longer valid");
            }
            return;
        }

        if !was_valid {
            info!("session valid, resetting retry state");
            self.ctx.reconnect_attempts = 0;
            self.ctx.should_stop_retrying = false;
            self.ctx.last_failure = None;
            self.begin_attempt();
        }
    }

    /// Tear everything down. Safe to call in any state.
    fn teardown(&mut self, reason: &str) {
        info!("tearing down link: {reason}");
        self.ctx.is_cleaning_up = true;
        self.timers.cancel_all();
        self.heartbeat.stop();
        self.close_socket(close_codes::NORMAL, reason);
        self.attempt += 1;
        self.ctx.is_connecting = false;
        self.session_credentials = None;
        self.set_state(ConnectionState::Disconnected);
        self.ctx.is_cleaning_up = false;
    }

    // Attempts

    fn can_attempt_connection(&self) -> Result<(), &'static str> {
        if self.ctx.is_cleaning_up {
            return Err("cleanup in progress");
        }
        if self.ctx.should_stop_retrying {
            return Err("retrying stopped after a fatal failure");
        }
        if !self.ctx.is_authenticated {
            return Err("not authenticated");
        }
        if self.ctx.current_workspace.is_none() {
            return Err("no workspace selected");
        }
        if self.ctx.is_connecting {
            return Err("connect already in flight");
        }
        Ok(())
    }

    fn begin_attempt(&mut self) {
        if let Err(why) = self.can_attempt_connection() {
            debug!("connect skipped: {why}");
            return;
        }

        self.ctx.is_connecting = true;
        self.timers.cancel(TimerKind::Reconnect);
        self.timers.cancel(TimerKind::HealthCheck);
        self.heartbeat.stop();
        self.close_socket(close_codes::NORMAL, "superseded by a new attempt");
        self.set_state(ConnectionState::Connecting);
        self.timers.arm(TimerKind::ConnectTimeout, self.settings.connect_timeout);

        self.attempt += 1;
        let attempt = self.attempt;
        let provider = self.credentials.clone();
        let events = self.events.clone();
        debug!("attempt {attempt}: fetching credentials");
        tokio::spawn(async move {
            let result = provider.get_credentials().await;
            let _ = events.send(Event::CredentialsFetched { attempt, result });
        });
    }

    fn on_credentials(&mut self, attempt: u64, result: HdResult<Credentials>) {
        if attempt != self.attempt || !self.ctx.is_connecting {
            debug!("discarding credentials for superseded attempt {attempt}");
            return;
        }

        let credentials = match result {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!("credential fetch failed: {e}");
                if e.is_auth() {
                    self.request_token_refresh();
                }
                self.fail_attempt(FailureKind::TransientNetworkFailure);
                return;
            }
        };

        let status = validate_token(&credentials.auth_token, Utc::now());
        if !status.is_valid() {
            warn!("token is {status}; refreshing before the next attempt");
            self.request_token_refresh();
            self.timers.cancel(TimerKind::ConnectTimeout);
            self.ctx.is_connecting = false;
            self.set_state(ConnectionState::Disconnected);
            self.schedule_reconnect();
            return;
        }

        self.open_socket(credentials);
    }

    fn open_socket(&mut self, credentials: Credentials) {
        self.next_socket_id += 1;
        let id = SocketId(self.next_socket_id);
        let request = OpenRequest {
            socket: id,
            url: self.settings.url.clone(),
            headers: self.settings.upgrade_headers.clone(),
        };
        info!(
            "opening socket {id} to {} for workspace {}",
            request.url, credentials.workspace_id
        );
        let handle = self
            .transport
            .open(request, SocketEvents::new(id, self.events.clone()));
        self.ctx.is_intentional_close = false;
        self.socket = Some(handle);
        self.session_credentials = Some(credentials);
    }

    fn request_token_refresh(&mut self) {
        if self.refresh_in_flight {
            return;
        }
        self.refresh_in_flight = true;
        let provider = self.credentials.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = provider.refresh_token().await;
            let _ = events.send(Event::TokenRefreshed(result));
        });
    }

    fn on_token_refreshed(&mut self, result: HdResult<()>) {
        self.refresh_in_flight = false;
        match result {
            Ok(()) => info!("token refreshed"),
            Err(e) => warn!("token refresh failed: {e}"),
        }
    }

    /// Give up on the current attempt and retry with backoff.
    fn fail_attempt(&mut self, failure: FailureKind) {
        self.timers.cancel(TimerKind::ConnectTimeout);
        self.heartbeat.stop();
        self.close_socket(close_codes::NORMAL, "attempt failed");
        self.ctx.is_connecting = false;
        self.ctx.last_failure = Some(failure);
        self.set_state(ConnectionState::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.ctx.is_cleaning_up || self.ctx.should_stop_retrying {
            return;
        }

        self.ctx.reconnect_attempts += 1;
        let attempts = self.ctx.reconnect_attempts;
        let max = self.settings.max_reconnect_attempts;
        if attempts >= max {
            error!("giving up after {attempts} consecutive failures");
            self.ctx.should_stop_retrying = true;
            self.timers.cancel(TimerKind::Reconnect);
            self.set_state(ConnectionState::Error);
            return;
        }

        let delay = self.settings.backoff.delay(attempts - 1);
        info!(
            "reconnecting in {}ms (failure {attempts}/{max})",
            delay.as_millis()
        );
        self.timers.arm(TimerKind::Reconnect, delay);
    }

    // Socket events

    fn on_socket_event(&mut self, socket: SocketId, event: SocketEvent) {
        if self.socket.as_ref().map(SocketHandle::id) != Some(socket) {
            trace!("ignoring event from abandoned socket {socket}");
            return;
        }

        match event {
            SocketEvent::Opened => self.on_open(),
            SocketEvent::Data(bytes) => self.on_data(&bytes),
            SocketEvent::Activity => self.heartbeat.record_activity(),
            SocketEvent::Error(message) => warn!("socket {socket} error: {message}"),
            SocketEvent::Closed { code, reason } => self.on_close(code, &reason),
        }
    }

    fn on_open(&mut self) {
        let (Some(socket), Some(credentials)) = (&self.socket, &self.session_credentials) else {
            return;
        };
        debug!("socket {} open, sending CONNECT", socket.id());
        self.heartbeat.record_activity();
        let frame = Frame::connect(credentials, self.settings.heartbeat_interval.as_millis() as u64);
        if let Err(e) = socket.send_frame(&frame) {
            warn!("failed to send CONNECT on socket {}: {e}", socket.id());
        }
    }

    fn on_data(&mut self, bytes: &[u8]) {
        self.heartbeat.record_activity();
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping undecodable frame: {e}");
                self.ctx.last_failure = Some(FailureKind::ProtocolDecodeError);
                return;
            }
        };

        match &frame.command {
            Command::Heartbeat => trace!("heart-beat received"),
            Command::Connected => self.on_connected(),
            Command::Message => self.on_message(&frame),
            Command::Error => self.on_error_frame(&frame),
            other => debug!("ignoring {other} frame"),
        }
    }

    fn on_connected(&mut self) {
        if self.state == ConnectionState::Connected {
            debug!("duplicate CONNECTED ignored");
            return;
        }
        let (Some(socket), Some(credentials)) =
            (self.socket.clone(), self.session_credentials.clone())
        else {
            return;
        };

        self.timers.cancel(TimerKind::ConnectTimeout);
        self.ctx.is_connecting = false;
        self.ctx.reconnect_attempts = 0;
        self.ctx.last_failure = None;
        self.set_state(ConnectionState::Connected);

        for topic in &self.settings.topics {
            let frame = Frame::subscribe(
                &topic.destination,
                &topic.subscription_id,
                &credentials.device_type,
            );
            if let Err(e) = socket.send_frame(&frame) {
                warn!("failed to subscribe to {}: {e}", topic.destination);
            }
        }
        info!(
            "connected on socket {}, subscribed to {} topic(s)",
            socket.id(),
            self.settings.topics.len()
        );

        self.heartbeat.start(socket.clone());
        self.timers
            .arm(TimerKind::HealthCheck, self.next_health_check());
        self.outputs.live.send_replace(Some(LiveSocket {
            socket,
            device_type: credentials.device_type,
        }));
    }

    fn on_message(&mut self, frame: &Frame) {
        let Some(destination) = frame.header(headers::DESTINATION) else {
            warn!("dropping MESSAGE without destination");
            self.ctx.last_failure = Some(FailureKind::ProtocolDecodeError);
            return;
        };
        let body = frame.body.as_deref().unwrap_or_default();
        self.dispatcher.dispatch(destination, body);
    }

    fn on_error_frame(&mut self, frame: &Frame) {
        let text = frame.error_text();
        warn!("server sent ERROR: {text}");

        self.heartbeat.stop();
        self.timers.cancel(TimerKind::HealthCheck);
        self.timers.cancel(TimerKind::ConnectTimeout);
        self.ctx.is_connecting = false;
        self.set_state(ConnectionState::Error);
        self.close_socket(close_codes::NORMAL, "server reported an error");

        match self.settings.failure_policy.classify_error_text(&text) {
            FailureClass::Fatal => {
                error!("server rejected credentials, not retrying: {text}");
                self.ctx.last_failure = Some(FailureKind::AuthenticationFailure);
                self.ctx.should_stop_retrying = true;
                self.timers.cancel(TimerKind::Reconnect);
            }
            FailureClass::Retryable => {
                self.ctx.last_failure = Some(FailureKind::TransientNetworkFailure);
                self.schedule_reconnect();
            }
        }
    }

    fn on_close(&mut self, code: Option<u16>, reason: &str) {
        info!("socket closed (code {code:?}): {reason}");
        self.heartbeat.stop();
        self.timers.cancel(TimerKind::HealthCheck);
        self.timers.cancel(TimerKind::ConnectTimeout);
        self.socket = None;
        self.session_credentials = None;
        self.outputs.live.send_replace(None);
        self.ctx.is_connecting = false;

        if self.ctx.is_intentional_close || self.ctx.is_cleaning_up {
            debug!("close was requested locally");
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        match self.settings.failure_policy.classify_close(code) {
            FailureClass::Fatal => {
                error!("socket closed with fatal code {code:?}, not retrying");
                self.ctx.last_failure = Some(FailureKind::AuthenticationFailure);
                self.ctx.should_stop_retrying = true;
                self.timers.cancel(TimerKind::Reconnect);
                self.set_state(ConnectionState::Error);
            }
            FailureClass::Retryable => {
                self.ctx.last_failure = Some(FailureKind::TransientNetworkFailure);
                self.set_state(ConnectionState::Disconnected);
                self.schedule_reconnect();
            }
        }
    }

    // Timers

    fn on_timer(&mut self, fired: TimerFired) {
        if !self.timers.take_fired(fired) {
            trace!("stale {} timer", fired.kind);
            return;
        }

        match fired.kind {
            TimerKind::ConnectTimeout => {
                if !self.ctx.is_connecting {
                    return;
                }
                warn!(
                    "no CONNECTED within {}ms",
                    self.settings.connect_timeout.as_millis()
                );
                // Invalidate a credential fetch that may still be running.
                self.attempt += 1;
                self.fail_attempt(FailureKind::TransientNetworkFailure);
            }
            TimerKind::Reconnect => {
                debug!(
                    "reconnect timer fired after {} failure(s)",
                    self.ctx.reconnect_attempts
                );
                self.begin_attempt();
            }
            TimerKind::HealthCheck => self.check_health(),
        }
    }

    fn check_health(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let idle = self.heartbeat.idle_for();
        if idle > self.settings.stale_threshold {
            warn!(
                "no inbound traffic for {}ms, reconnecting",
                idle.as_millis()
            );
            self.ctx.last_failure = Some(FailureKind::StaleConnection);
            self.heartbeat.stop();
            self.close_socket(close_codes::NORMAL, "stale connection");
            self.set_state(ConnectionState::Disconnected);
            self.begin_attempt();
        } else {
            self.timers
                .arm(TimerKind::HealthCheck, self.next_health_check());
        }
    }

    /// Delay until the next health check: the regular interval, or just past
    /// the stale deadline when that comes first.
    fn next_health_check(&self) -> Duration {
        let until_stale = self
            .settings
            .stale_threshold
            .saturating_sub(self.heartbeat.idle_for())
            + Duration::from_millis(1);
        self.settings.health_check_interval.min(until_stale)
    }

    // Helpers

    fn close_socket(&mut self, code: u16, reason: &str) {
        if let Some(socket) = self.socket.take() {
            debug!("closing socket {}: {reason}", socket.id());
            self.ctx.is_intentional_close = true;
            socket.close(code, reason);
        }
        self.outputs.live.send_replace(None);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            info!("link state: {} -> {}", self.state, state);
            self.state = state;
        }
    }

    pub(crate) fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            state: self.state,
            reconnect_attempts: self.ctx.reconnect_attempts,
            should_stop_retrying: self.ctx.should_stop_retrying,
            is_connecting: self.ctx.is_connecting,
            is_authenticated: self.ctx.is_authenticated,
            current_workspace: self.ctx.current_workspace.clone(),
            last_failure: self.ctx.last_failure,
            reconnect_pending: self.timers.is_armed(TimerKind::Reconnect),
            idle: self.socket.as_ref().map(|_| self.heartbeat.idle_for()),
        }
    }

    fn publish_outputs(&mut self) {
        let state = self.state;
        self.outputs.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });

        // `idle` changes on every step; leave it out of the change check.
        let snapshot = self.snapshot();
        self.outputs.snapshot.send_if_modified(|current| {
            let changed = ContextSnapshot { idle: None, ..current.clone() }
                != ContextSnapshot { idle: None, ..snapshot.clone() };
            *current = snapshot;
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use serde::Deserialize;
    use tokio::time::sleep;

    use hd_core::constants::headers;

    use crate::dispatcher::TopicDispatcher;
    use crate::events::{ConnectionState, FailureKind, ReconnectReason, SessionState};
    use crate::frame::{Command, Frame};
    use crate::payloads::TypingPayload;
    use crate::testing::{settle, test_settings, TestLink};

    async fn connected_link() -> TestLink {
        let link = TestLink::spawn(test_settings());
        link.manager.update_session(SessionState::signed_in("ws-1"));
        settle().await;
        link.transport.last().accept();
        settle().await;
        assert_eq!(link.manager.state(), ConnectionState::Connected);
        link
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_sends_connect_then_subscribes() {
        let link = TestLink::spawn(test_settings());
        link.manager.update_session(SessionState::signed_in("ws-1"));
        settle().await;

        assert_eq!(link.transport.opened(), 1);
        assert_eq!(link.manager.state(), ConnectionState::Connecting);
        let socket = link.transport.last();
        assert_eq!(socket.request().url, "wss://chat.test/ws");

        socket.open();
        settle().await;
        let connect = &socket.sent_frames()[0];
        assert_eq!(connect.command, Command::Connect);
        assert_eq!(connect.header(headers::AUTHORIZATION), Some("Bearer test-token"));
        assert_eq!(connect.header(headers::WORKSPACE_ID), Some("ws-1"));
        assert_eq!(connect.header(headers::DEVICE_ID), Some("device-1"));
        assert_eq!(connect.header(headers::ACCEPT_VERSION), Some("1.2"));
        assert_eq!(connect.header(headers::HEART_BEAT), Some("10000,10000"));

        socket.receive(&Frame::new(Command::Connected));
        settle().await;
        assert_eq!(link.manager.state(), ConnectionState::Connected);

        let subscribes = socket.sent_commands(Command::Subscribe);
        let ids: Vec<_> = subscribes
            .iter()
            .map(|f| f.header(headers::SUBSCRIPTION_ID).unwrap())
            .collect();
        assert_eq!(ids, ["sub-messages", "sub-presence"]);
        assert_eq!(subscribes[0].header(headers::DESTINATION), Some("/user/queue/messages"));
        assert_eq!(subscribes[0].header(headers::DEVICE_TYPE), Some("desktop"));

        let snapshot = link.manager.snapshot();
        assert_eq!(snapshot.reconnect_attempts, 0);
        assert!(!snapshot.is_connecting);
        assert_eq!(snapshot.current_workspace.as_deref(), Some("ws-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_connect_without_valid_session() {
        let link = TestLink::spawn(test_settings());
        link.manager.connect();
        settle().await;
        assert_eq!(link.transport.opened(), 0);

        link.manager.update_session(SessionState {
            authenticated: true,
            workspace_id: None,
        });
        link.manager.connect();
        settle().await;
        assert_eq!(link.transport.opened(), 0);
        assert_eq!(link.credentials.fetch_count(), 0);
        assert_eq!(link.manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_connected_is_noop() {
        let link = connected_link().await;
        link.manager.connect();
        settle().await;
        assert_eq!(link.transport.opened(), 1);
        assert_eq!(link.manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_follow_interval() {
        let link = connected_link().await;
        let socket = link.transport.last();

        sleep(Duration::from_millis(9_000)).await;
        assert!(socket.sent_commands(Command::Heartbeat).is_empty());

        // Keep the server side chatty so the health check stays quiet.
        socket.receive(&Frame::heartbeat());
        sleep(Duration::from_millis(1_500)).await;
        assert_eq!(socket.sent_commands(Command::Heartbeat).len(), 1);

        socket.receive(&Frame::heartbeat());
        sleep(Duration::from_secs(10)).await;
        assert_eq!(socket.sent_commands(Command::Heartbeat).len(), 2);
        assert_eq!(link.transport.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_connection_reconnects_without_backoff() {
        let link = connected_link().await;
        let first = link.transport.last();

        // Silence past the 20s threshold; the check runs every 5s.
        sleep(Duration::from_secs(26)).await;
        settle().await;

        assert!(first.closed_by_client());
        assert_eq!(link.transport.opened(), 2);
        let snapshot = link.manager.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Connecting);
        assert_eq!(snapshot.reconnect_attempts, 0);
        assert_eq!(snapshot.last_failure, Some(FailureKind::StaleConnection));

        let heartbeats = first.sent_commands(Command::Heartbeat).len();
        link.transport.last().accept();
        sleep(Duration::from_secs(12)).await;
        assert_eq!(first.sent_commands(Command::Heartbeat).len(), heartbeats);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_detected_just_past_threshold() {
        let link = connected_link().await;
        let first = link.transport.last();

        sleep(Duration::from_millis(19_990)).await;
        assert!(!first.closed_by_client());

        sleep(Duration::from_millis(11)).await;
        settle().await;
        assert!(first.closed_by_client());
        assert_eq!(link.transport.opened(), 2);
        assert_eq!(link.manager.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_traffic_keeps_link_alive() {
        let link = connected_link().await;
        let socket = link.transport.last();
        for _ in 0..10 {
            sleep(Duration::from_secs(5)).await;
            socket.receive(&Frame::heartbeat());
        }
        settle().await;
        assert_eq!(link.transport.opened(), 1);
        assert_eq!(link.manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_close_reconnects_with_backoff() {
        let link = connected_link().await;
        link.transport.last().close(None, "connection reset");
        settle().await;

        let snapshot = link.manager.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
        assert_eq!(snapshot.reconnect_attempts, 1);
        assert!(snapshot.reconnect_pending);
        assert_eq!(snapshot.last_failure, Some(FailureKind::TransientNetworkFailure));

        sleep(Duration::from_millis(990)).await;
        assert_eq!(link.transport.opened(), 1);
        sleep(Duration::from_millis(20)).await;
        assert_eq!(link.transport.opened(), 2);

        link.transport.last().accept();
        settle().await;
        assert_eq!(link.manager.snapshot().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_error_close_is_retried() {
        let link = connected_link().await;
        link.transport.last().close(Some(1002), "missed heart-beats");
        sleep(Duration::from_millis(1_010)).await;
        assert_eq!(link.transport.opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_between_failures() {
        let link = TestLink::spawn(test_settings());
        link.manager.update_session(SessionState::signed_in("ws-1"));
        settle().await;
        link.transport.last().fail("refused");
        settle().await;

        sleep(Duration::from_millis(1_005)).await;
        assert_eq!(link.transport.opened(), 2);
        link.transport.last().fail("refused");
        settle().await;

        sleep(Duration::from_millis(1_990)).await;
        assert_eq!(link.transport.opened(), 2);
        sleep(Duration::from_millis(20)).await;
        assert_eq!(link.transport.opened(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let link = TestLink::spawn(test_settings());
        link.manager.update_session(SessionState::signed_in("ws-1"));
        settle().await;

        for _ in 0..3 {
            link.transport.last().fail("network unreachable");
            sleep(Duration::from_secs(5)).await;
        }

        assert_eq!(link.transport.opened(), 3);
        let snapshot = link.manager.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Error);
        assert!(snapshot.should_stop_retrying);
        assert!(!snapshot.reconnect_pending);

        link.manager.force_reconnect(ReconnectReason::Foreground);
        sleep(Duration::from_secs(120)).await;
        assert_eq!(link.transport.opened(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_close_code_stops_retrying() {
        let link = connected_link().await;
        link.transport.last().close(Some(3401), "unauthorized");
        settle().await;

        let snapshot = link.manager.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Error);
        assert!(snapshot.should_stop_retrying);
        assert_eq!(snapshot.last_failure, Some(FailureKind::AuthenticationFailure));

        sleep(Duration::from_secs(120)).await;
        assert_eq!(link.transport.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_frame_stops_retrying() {
        let link = connected_link().await;
        let socket = link.transport.last();
        socket.receive(&Frame::new(Command::Error).with_header("message", "Unauthorized"));
        settle().await;

        assert_eq!(link.manager.state(), ConnectionState::Error);
        assert!(socket.closed_by_client());
        assert!(link.manager.snapshot().should_stop_retrying);

        sleep(Duration::from_secs(120)).await;
        assert_eq!(link.transport.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_error_frame_retries() {
        let link = connected_link().await;
        let socket = link.transport.last();
        socket.receive(&Frame::new(Command::Error).with_body("broker restarting"));
        settle().await;

        let snapshot = link.manager.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Error);
        assert!(!snapshot.should_stop_retrying);
        assert!(snapshot.reconnect_pending);
        assert!(socket.closed_by_client());

        sleep(Duration::from_millis(1_010)).await;
        assert_eq!(link.transport.opened(), 2);
        assert_eq!(link.manager.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_retries() {
        let link = TestLink::spawn(test_settings());
        link.manager.update_session(SessionState::signed_in("ws-1"));
        settle().await;
        let socket = link.transport.last();
        socket.open();

        sleep(Duration::from_millis(14_990)).await;
        assert!(!socket.closed_by_client());

        sleep(Duration::from_millis(20)).await;
        assert!(socket.closed_by_client());
        let snapshot = link.manager.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
        assert!(snapshot.reconnect_pending);

        sleep(Duration::from_millis(1_010)).await;
        assert_eq!(link.transport.opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_token_is_refreshed_before_connecting() {
        let link = TestLink::spawn(test_settings());
        let claims = URL_SAFE_NO_PAD.encode(br#"{"exp":1000}"#);
        link.credentials.set_token(&format!("h.{claims}.s"));
        link.credentials.set_refreshed_token("fresh-token");

        link.manager.update_session(SessionState::signed_in("ws-1"));
        settle().await;
        assert_eq!(link.transport.opened(), 0);
        assert_eq!(link.credentials.refresh_count(), 1);
        assert!(link.manager.snapshot().reconnect_pending);

        sleep(Duration::from_millis(1_010)).await;
        assert_eq!(link.transport.opened(), 1);
        let socket = link.transport.last();
        socket.open();
        settle().await;
        assert_eq!(
            socket.sent_frames()[0].header(headers::AUTHORIZATION),
            Some("Bearer fresh-token")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_fetch_failure_is_retried() {
        let link = TestLink::spawn(test_settings());
        link.credentials.fail_fetches(true);
        link.manager.update_session(SessionState::signed_in("ws-1"));
        settle().await;
        assert_eq!(link.transport.opened(), 0);
        assert_eq!(link.manager.snapshot().reconnect_attempts, 1);

        link.credentials.fail_fetches(false);
        sleep(Duration::from_millis(1_010)).await;
        assert_eq!(link.transport.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_all_timers() {
        let link = connected_link().await;
        let socket = link.transport.last();
        link.manager.disconnect();
        settle().await;

        assert_eq!(link.manager.state(), ConnectionState::Disconnected);
        assert_eq!(socket.client_close().map(|(code, _)| code), Some(1000));

        sleep(Duration::from_secs(120)).await;
        assert_eq!(link.transport.opened(), 1);
        assert!(socket.sent_commands(Command::Heartbeat).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_backoff() {
        let link = connected_link().await;
        link.transport.last().close(None, "reset");
        settle().await;
        assert!(link.manager.snapshot().reconnect_pending);

        link.manager.disconnect();
        sleep(Duration::from_secs(120)).await;
        assert_eq!(link.transport.opened(), 1);
        assert!(!link.manager.snapshot().reconnect_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_from_replaced_socket_are_ignored() {
        let link = connected_link().await;
        let old = link.transport.last();

        link.manager.force_reconnect(ReconnectReason::Manual);
        settle().await;
        assert!(old.closed_by_client());
        assert_eq!(link.transport.opened(), 2);

        old.receive(&Frame::new(Command::Connected));
        old.close(None, "late close");
        settle().await;
        let snapshot = link.manager.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Connecting);
        assert_eq!(snapshot.reconnect_attempts, 0);
        assert!(!snapshot.reconnect_pending);

        link.transport.last().accept();
        settle().await;
        assert_eq!(link.manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_reconnect_ignored_while_connecting() {
        let link = TestLink::spawn(test_settings());
        link.manager.update_session(SessionState::signed_in("ws-1"));
        settle().await;
        link.manager.force_reconnect(ReconnectReason::NetworkRestored);
        settle().await;
        assert_eq!(link.transport.opened(), 1);
        assert!(!link.transport.last().closed_by_client());
    }

    #[tokio::test(start_paused = true)]
    async fn test_signing_out_tears_down() {
        let link = connected_link().await;
        let socket = link.transport.last();
        link.manager.update_session(SessionState::signed_out());
        settle().await;

        assert!(socket.closed_by_client());
        assert_eq!(link.manager.state(), ConnectionState::Disconnected);

        link.manager.connect();
        sleep(Duration::from_secs(60)).await;
        assert_eq!(link.transport.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reauthentication_clears_terminal_state() {
        let link = connected_link().await;
        link.transport.last().close(Some(1008), "policy violation");
        settle().await;
        assert!(link.manager.snapshot().should_stop_retrying);

        link.manager.update_session(SessionState::signed_out());
        link.manager.update_session(SessionState::signed_in("ws-1"));
        settle().await;

        assert_eq!(link.transport.opened(), 2);
        let snapshot = link.manager.snapshot();
        assert!(!snapshot.should_stop_retrying);
        assert_eq!(snapshot.reconnect_attempts, 0);
        assert_eq!(snapshot.state, ConnectionState::Connecting);
    }

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct TypingEvent {
        conversation_id: String,
        is_typing: bool,
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_reach_handlers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut dispatcher = TopicDispatcher::new(16);
        dispatcher.register_json("typing", move |event: TypingEvent| {
            sink.lock().unwrap().push(event);
        });

        let link = TestLink::spawn_with(test_settings(), dispatcher);
        let mut tap = link.manager.subscribe();
        link.manager.update_session(SessionState::signed_in("ws-1"));
        settle().await;
        let socket = link.transport.last();
        socket.accept();

        socket.receive_message("/user/queue/typing", r#"{"conversationId":"c-9","isTyping":false}"#);
        socket.receive_message("/user/queue/typing", "not json");
        socket.receive(&Frame::new(Command::Message).with_body("{}"));
        settle().await;

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[TypingEvent { conversation_id: "c-9".into(), is_typing: false }]
        );
        assert_eq!(tap.recv().await.unwrap().topic_id.as_deref(), Some("typing"));
        assert_eq!(link.manager.state(), ConnectionState::Connected);
        assert_eq!(link.manager.snapshot().last_failure, Some(FailureKind::ProtocolDecodeError));
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_frame_is_dropped() {
        let link = connected_link().await;
        link.transport.last().receive_raw(b"MESSAGE\nbroken-header\n\n\0");
        settle().await;
        assert_eq!(link.manager.state(), ConnectionState::Connected);
        assert_eq!(link.manager.snapshot().last_failure, Some(FailureKind::ProtocolDecodeError));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_requires_connection() {
        let typing = TypingPayload {
            conversation_id: "c-1".into(),
            is_typing: true,
        };
        let link = TestLink::spawn(test_settings());
        assert!(!link.manager.publish_typing(&typing));
        settle().await;
        assert_eq!(link.manager.snapshot().last_failure, Some(FailureKind::PublishRejected));

        link.manager.update_session(SessionState::signed_in("ws-1"));
        settle().await;
        let socket = link.transport.last();
        socket.accept();
        settle().await;
        assert!(link.manager.publish_typing(&typing));
        let sends = socket.sent_commands(Command::Send);
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].header(headers::DESTINATION), Some("/app/chat.typing"));

        socket.close(None, "reset");
        settle().await;
        assert!(!link.manager.publish_typing(&typing));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_and_stops() {
        let link = connected_link().await;
        let socket = link.transport.last();
        link.manager.shutdown().await;

        assert!(socket.closed_by_client());
        assert_eq!(link.manager.state(), ConnectionState::Disconnected);

        link.manager.connect();
        link.manager.shutdown().await;
        sleep(Duration::from_secs(30)).await;
        assert_eq!(link.transport.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_receiver_sees_transitions() {
        let link = TestLink::spawn(test_settings());
        let mut rx = link.manager.state_receiver();
        link.manager.update_session(SessionState::signed_in("ws-1"));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connecting);

        settle().await;
        link.transport.last().accept();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connected);

        link.manager
            .wait_for_state(ConnectionState::Connected, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(link
            .manager
            .wait_for_state(ConnectionState::Error, Duration::from_secs(1))
            .await
            .is_err());
    }
}
