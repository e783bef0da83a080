//! Topic dispatcher: routes MESSAGE bodies to feature handlers.
//!
//! Routes are registered up front and matched by substring against the
//! frame's destination, first registration wins. Every delivered message is
//! also fanned out on a broadcast channel so tooling can watch traffic without
//! owning a route. A handler that cannot parse its payload only costs that one
//! message; nothing propagates back into the connection.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use hd_core::error::HdResult;

use crate::events::InboundMessage;

/// Receives the raw body of messages routed to one topic.
pub trait TopicHandler: Send + Sync {
    fn handle(&self, body: &str) -> HdResult<()>;
}

/// Deserializes the body as `T` before calling the closure.
struct JsonHandler<T, F> {
    f: F,
    _payload: PhantomData<fn() -> T>,
}

impl<T, F> TopicHandler for JsonHandler<T, F>
where
    T: DeserializeOwned,
    F: Fn(T) + Send + Sync,
{
    fn handle(&self, body: &str) -> HdResult<()> {
        let payload: T = serde_json::from_str(body)?;
        (self.f)(payload);
        Ok(())
    }
}

/// Passes the body string through untouched.
struct RawHandler<F> {
    f: F,
}

impl<F> TopicHandler for RawHandler<F>
where
    F: Fn(&str) + Send + Sync,
{
    fn handle(&self, body: &str) -> HdResult<()> {
        (self.f)(body);
        Ok(())
    }
}

#[derive(Clone)]
struct Route {
    topic_id: String,
    handler: Arc<dyn TopicHandler>,
}

/// What happened to one dispatched message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler accepted the body.
    Delivered { topic_id: String },
    /// No route matched the destination.
    Unrouted,
    /// The body was not UTF-8 or the handler rejected it.
    Rejected { reason: String },
}

/// Topic id to handler table plus a broadcast tap.
#[derive(Clone)]
pub struct TopicDispatcher {
    routes: Vec<Route>,
    tap: broadcast::Sender<InboundMessage>,
}

impl TopicDispatcher {
    /// Create a dispatcher whose broadcast tap buffers `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        let (tap, _) = broadcast::channel(capacity.max(1));
        Self {
            routes: Vec::new(),
            tap,
        }
    }

    /// Register a handler for destinations containing `topic_id`.
    pub fn register(
        &mut self,
        topic_id: impl Into<String>,
        handler: impl TopicHandler + 'static,
    ) -> &mut Self {
        self.routes.push(Route {
            topic_id: topic_id.into(),
            handler: Arc::new(handler),
        });
        self
    }

    /// Register a closure that receives the body parsed as JSON `T`.
    pub fn register_json<T, F>(&mut self, topic_id: impl Into<String>, f: F) -> &mut Self
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.register(
            topic_id,
            JsonHandler {
                f,
                _payload: PhantomData,
            },
        )
    }

    /// Register a closure that receives the raw body string.
    pub fn register_raw<F>(&mut self, topic_id: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.register(topic_id, RawHandler { f })
    }

    /// Number of registered routes.
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Receive a copy of every message that reaches the dispatcher.
    ///
    /// Slow receivers that fall behind get `RecvError::Lagged` and miss messages.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.tap.subscribe()
    }

    pub(crate) fn tap(&self) -> broadcast::Sender<InboundMessage> {
        self.tap.clone()
    }

    /// Route one MESSAGE body.
    pub fn dispatch(&self, destination: &str, body: &[u8]) -> DispatchOutcome {
        let body = match std::str::from_utf8(body) {
            Ok(text) => text,
            Err(e) => {
                warn!("dropping message for {destination}: body is not UTF-8 ({e})");
                return DispatchOutcome::Rejected {
                    reason: e.to_string(),
                };
            }
        };

        let route = self
            .routes
            .iter()
            .find(|route| destination.contains(route.topic_id.as_str()));

        let outcome = match route {
            Some(route) => match route.handler.handle(body) {
                Ok(()) => {
                    debug!("dispatched message for {destination} to {}", route.topic_id);
                    DispatchOutcome::Delivered {
                        topic_id: route.topic_id.clone(),
                    }
                }
                Err(e) => {
                    warn!("handler for {} rejected message: {e}", route.topic_id);
                    DispatchOutcome::Rejected {
                        reason: e.to_string(),
                    }
                }
            },
            None => {
                debug!("no handler registered for {destination}");
                DispatchOutcome::Unrouted
            }
        };

        // No receivers is fine; the tap is optional.
        let _ = self.tap.send(InboundMessage {
            destination: destination.to_string(),
            topic_id: route.map(|r| r.topic_id.clone()),
            body: body.to_string(),
        });

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct TypingEvent {
        conversation_id: String,
        is_typing: bool,
    }

    #[test]
    fn test_json_route_delivers_typed_payload() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut dispatcher = TopicDispatcher::new(8);
        dispatcher.register_json("typing", move |event: TypingEvent| {
            sink.lock().unwrap().push(event);
        });

        let outcome = dispatcher.dispatch(
            "/user/queue/typing",
            br#"{"conversationId":"c-1","isTyping":true}"#,
        );
        assert_eq!(outcome, DispatchOutcome::Delivered { topic_id: "typing".into() });
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[TypingEvent { conversation_id: "c-1".into(), is_typing: true }]
        );
    }

    #[test]
    fn test_parse_failure_is_swallowed() {
        let mut dispatcher = TopicDispatcher::new(8);
        dispatcher.register_json("typing", |_event: TypingEvent| {
            panic!("handler must not run for a bad payload");
        });

        let outcome = dispatcher.dispatch("/user/queue/typing", b"{not json");
        assert!(matches!(outcome, DispatchOutcome::Rejected { .. }));
    }

    #[test]
    fn test_first_matching_route_wins() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = TopicDispatcher::new(8);
        let a = hits.clone();
        dispatcher.register_raw("queue", move |_| a.lock().unwrap().push("queue"));
        let b = hits.clone();
        dispatcher.register_raw("messages", move |_| b.lock().unwrap().push("messages"));

        dispatcher.dispatch("/user/queue/messages", b"{}");
        assert_eq!(hits.lock().unwrap().as_slice(), &["queue"]);
        assert_eq!(dispatcher.route_count(), 2);
    }

    #[test]
    fn test_unrouted_and_non_utf8() {
        let dispatcher = TopicDispatcher::new(8);
        assert_eq!(dispatcher.dispatch("/topic/other", b"{}"), DispatchOutcome::Unrouted);
        assert!(matches!(
            dispatcher.dispatch("/topic/other", &[0xff, 0xfe]),
            DispatchOutcome::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_tap_sees_every_message() {
        let mut dispatcher = TopicDispatcher::new(8);
        dispatcher.register_raw("presence", |_| {});
        let mut rx = dispatcher.subscribe();

        dispatcher.dispatch("/topic/presence", br#"{"userId":"u1"}"#);
        dispatcher.dispatch("/topic/unknown", b"hello");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.topic_id.as_deref(), Some("presence"));
        assert_eq!(first.body, r#"{"userId":"u1"}"#);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.destination, "/topic/unknown");
        assert!(second.topic_id.is_none());
    }
}
