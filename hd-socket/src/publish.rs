//! Fire-and-forget publishing over the live link.
//!
//! Publishing never queues: if the link is not connected the message is
//! dropped and the caller gets `false`. Features that need delivery guarantees
//! go through the REST API instead. Refusals are reported to the connection
//! actor so they show up as the snapshot's last failure.

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use hd_core::config::PublishConfig;

use crate::events::ConnectionState;
use crate::frame::Frame;
use crate::machine::Event;
use crate::payloads::{ActivityPayload, CallSignalPayload, TypingPayload};
use crate::transport::SocketHandle;

/// Destinations of the built-in publish helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishDestinations {
    pub activity: String,
    pub typing: String,
    pub call_signal: String,
}

impl Default for PublishDestinations {
    fn default() -> Self {
        Self::from_config(&PublishConfig::default())
    }
}

impl PublishDestinations {
    pub fn from_config(config: &PublishConfig) -> Self {
        Self {
            activity: config.activity_destination.clone(),
            typing: config.typing_destination.clone(),
            call_signal: config.call_signal_destination.clone(),
        }
    }
}

/// The socket publishers may write to, set only while connected.
#[derive(Debug, Clone)]
pub(crate) struct LiveSocket {
    pub socket: SocketHandle,
    pub device_type: String,
}

/// Cheap, cloneable publish handle.
#[derive(Debug, Clone)]
pub struct Publisher {
    state: watch::Receiver<ConnectionState>,
    live: watch::Receiver<Option<LiveSocket>>,
    rejections: mpsc::UnboundedSender<Event>,
    destinations: PublishDestinations,
}

impl Publisher {
    pub(crate) fn new(
        state: watch::Receiver<ConnectionState>,
        live: watch::Receiver<Option<LiveSocket>>,
        rejections: mpsc::UnboundedSender<Event>,
        destinations: PublishDestinations,
    ) -> Self {
        Self {
            state,
            live,
            rejections,
            destinations,
        }
    }

    pub fn destinations(&self) -> &PublishDestinations {
        &self.destinations
    }

    pub fn publish_activity(&self, payload: &ActivityPayload) -> bool {
        self.publish_json(&self.destinations.activity, payload)
    }

    pub fn publish_typing(&self, payload: &TypingPayload) -> bool {
        self.publish_json(&self.destinations.typing, payload)
    }

    pub fn publish_call_signal(&self, payload: &CallSignalPayload) -> bool {
        self.publish_json(&self.destinations.call_signal, payload)
    }

    /// Send `payload` as a JSON SEND frame to `destination`.
    ///
    /// Returns `true` only if the frame was handed to an open socket.
    pub fn publish_json<T: Serialize>(&self, destination: &str, payload: &T) -> bool {
        let state = *self.state.borrow();
        if state != ConnectionState::Connected {
            debug!("publish to {destination} rejected: link is {state}");
            return self.reject(destination);
        }

        let Some(live) = self.live.borrow().clone() else {
            debug!("publish to {destination} rejected: no live socket");
            return self.reject(destination);
        };
        if !live.socket.is_open() {
            debug!("publish to {destination} rejected: socket {} is closed", live.socket.id());
            return self.reject(destination);
        }

        let json = match serde_json::to_vec(payload) {
            Ok(json) => json,
            Err(e) => {
                warn!("publish to {destination} failed to serialize: {e}");
                return false;
            }
        };

        let frame = Frame::send_json(destination, &live.device_type, json);
        match live.socket.send_frame(&frame) {
            Ok(()) => true,
            Err(e) => {
                debug!("publish to {destination} failed: {e}");
                self.reject(destination)
            }
        }
    }

    fn reject(&self, destination: &str) -> bool {
        // The actor may already be gone during shutdown.
        let _ = self
            .rejections
            .send(Event::PublishRejected(destination.to_string()));
        false
    }
}
