//! Lifecycle triggers.
//!
//! Bridges the host application's observers to the connection manager:
//! - Session changes are forwarded immediately, so signing out tears the
//!   link down and signing in connects with a fresh retry budget.
//! - Network restored, app foregrounded and workspace switched schedule a
//!   reconnect. Signals arriving inside the debounce window restart it, and
//!   only the last one fires.

use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use hd_core::error::{HdError, HdResult};
use hd_socket::{ConnectionManager, ReconnectReason, SessionState};

use crate::service::{Service, ServiceState};

/// Default window in which lifecycle signals coalesce.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

/// Observers the triggers listen to.
///
/// `online` and `foreground` only act on false-to-true edges.
pub struct TriggerInputs {
    pub session: watch::Receiver<SessionState>,
    pub online: watch::Receiver<bool>,
    pub foreground: watch::Receiver<bool>,
}

/// Service that watches [`TriggerInputs`] and drives a [`ConnectionManager`].
pub struct LifecycleTriggers {
    manager: ConnectionManager,
    inputs: Option<TriggerInputs>,
    debounce: Duration,
    state: ServiceState,
    task: Option<JoinHandle<()>>,
    stop: Option<oneshot::Sender<()>>,
}

impl LifecycleTriggers {
    pub fn new(manager: ConnectionManager, inputs: TriggerInputs) -> Self {
        Self {
            manager,
            inputs: Some(inputs),
            debounce: DEFAULT_DEBOUNCE,
            state: ServiceState::Created,
            task: None,
            stop: None,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }
}

impl Service for LifecycleTriggers {
    fn name(&self) -> &str {
        "lifecycle"
    }

    fn state(&self) -> ServiceState {
        self.state
    }

    fn init(&mut self) -> HdResult<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| HdError::ServiceInit(format!("lifecycle triggers need a tokio runtime: {e}")))?;
        let inputs = self
            .inputs
            .take()
            .ok_or_else(|| HdError::ServiceInit("lifecycle triggers already started".into()))?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let worker = TriggerLoop::new(self.manager.clone(), self.debounce, &inputs);
        self.task = Some(runtime.spawn(worker.run(inputs, stop_rx)));
        self.stop = Some(stop_tx);
        self.state = ServiceState::Running;
        info!("lifecycle triggers started (debounce {}ms)", self.debounce.as_millis());
        Ok(())
    }

    fn shutdown(&mut self) -> HdResult<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task = None;
        if self.state == ServiceState::Running {
            info!("lifecycle triggers stopped");
        }
        self.state = ServiceState::Stopped;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.state == ServiceState::Running
            && self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for LifecycleTriggers {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct TriggerLoop {
    manager: ConnectionManager,
    debounce: Duration,
    session: SessionState,
    online: bool,
    foreground: bool,
    pending: Option<(ReconnectReason, Instant)>,
}

impl TriggerLoop {
    fn new(manager: ConnectionManager, debounce: Duration, inputs: &TriggerInputs) -> Self {
        Self {
            manager,
            debounce,
            session: SessionState::default(),
            online: *inputs.online.borrow(),
            foreground: *inputs.foreground.borrow(),
            pending: None,
        }
    }

    async fn run(mut self, inputs: TriggerInputs, mut stop: oneshot::Receiver<()>) {
        let TriggerInputs {
            mut session,
            mut online,
            mut foreground,
        } = inputs;

        let initial = session.borrow_and_update().clone();
        self.on_session(initial);

        let (mut watch_session, mut watch_online, mut watch_foreground) = (true, true, true);

        loop {
            let wake = self.pending.map_or_else(Instant::now, |(_, at)| at);

            tokio::select! {
                _ = &mut stop => break,
                changed = session.changed(), if watch_session => match changed {
                    Ok(()) => {
                        let next = session.borrow_and_update().clone();
                        self.on_session(next);
                    }
                    Err(_) => {
                        debug!("session observer closed");
                        watch_session = false;
                    }
                },
                changed = online.changed(), if watch_online => match changed {
                    Ok(()) => {
                        let now = *online.borrow_and_update();
                        self.on_online(now);
                    }
                    Err(_) => {
                        debug!("connectivity observer closed");
                        watch_online = false;
                    }
                },
                changed = foreground.changed(), if watch_foreground => match changed {
                    Ok(()) => {
                        let now = *foreground.borrow_and_update();
                        self.on_foreground(now);
                    }
                    Err(_) => {
                        debug!("foreground observer closed");
                        watch_foreground = false;
                    }
                },
                _ = tokio::time::sleep_until(wake), if self.pending.is_some() => self.fire(),
            }
        }
        debug!("lifecycle trigger loop stopped");
    }

    fn on_session(&mut self, next: SessionState) {
        if next == self.session {
            return;
        }
        let previous = std::mem::replace(&mut self.session, next.clone());
        let workspace_switched =
            previous.is_valid() && next.is_valid() && previous.workspace_id != next.workspace_id;

        self.manager.update_session(next);

        if workspace_switched {
            self.schedule(ReconnectReason::WorkspaceChanged);
        } else if !self.session.is_valid() && self.pending.take().is_some() {
            debug!("pending reconnect dropped: session no longer valid");
        }
    }

    fn on_online(&mut self, now: bool) {
        let was = std::mem::replace(&mut self.online, now);
        if now && !was {
            self.schedule(ReconnectReason::NetworkRestored);
        } else if was && !now {
            debug!("network lost");
        }
    }

    fn on_foreground(&mut self, now: bool) {
        let was = std::mem::replace(&mut self.foreground, now);
        if now && !was {
            self.schedule(ReconnectReason::Foreground);
        } else if was && !now {
            debug!("app moved to background");
        }
    }

    fn schedule(&mut self, reason: ReconnectReason) {
        if !self.session.is_valid() {
            debug!("{reason} ignored: no valid session");
            return;
        }
        if let Some((superseded, _)) = self.pending {
            debug!("{superseded} superseded by {reason}");
        }
        self.pending = Some((reason, Instant::now() + self.debounce));
    }

    fn fire(&mut self) {
        if let Some((reason, _)) = self.pending.take() {
            info!("lifecycle trigger fired: {reason}");
            self.manager.force_reconnect(reason);
        }
    }
}
