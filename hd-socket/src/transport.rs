//! Socket abstraction between the connection actor and the wire.
//!
//! A [`Transport`] opens sockets without blocking: it returns a
//! [`SocketHandle`] for outbound traffic at once and reports everything that
//! happens afterwards (open, data, errors, close) through [`SocketEvents`].
//! Every event carries the socket id, so the actor can ignore sockets it has
//! already abandoned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use hd_core::constants::close_codes;
use hd_core::error::{HdError, HdResult};

use crate::frame::Frame;
use crate::machine::Event;

/// Identifies one physical socket for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Something the transport observed on a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// The WebSocket handshake completed.
    Opened,
    /// One inbound text or binary message.
    Data(Vec<u8>),
    /// Inbound traffic that carries no STOMP data (ping/pong).
    Activity,
    /// A transport error. A `Closed` event always follows.
    Error(String),
    /// The socket is gone. `code` is `None` for abnormal closure.
    Closed { code: Option<u16>, reason: String },
}

/// Outbound instruction for a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Data(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Where and how to open a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub socket: SocketId,
    pub url: String,
    /// Extra headers for the upgrade request.
    pub headers: Vec<(String, String)>,
}

/// Reports socket activity back to the connection actor.
#[derive(Debug, Clone)]
pub struct SocketEvents {
    socket: SocketId,
    tx: mpsc::UnboundedSender<Event>,
}

impl SocketEvents {
    pub(crate) fn new(socket: SocketId, tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { socket, tx }
    }

    pub fn socket(&self) -> SocketId {
        self.socket
    }

    pub fn opened(&self) {
        self.emit(SocketEvent::Opened);
    }

    pub fn data(&self, bytes: Vec<u8>) {
        self.emit(SocketEvent::Data(bytes));
    }

    pub fn activity(&self) {
        self.emit(SocketEvent::Activity);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(SocketEvent::Error(message.into()));
    }

    pub fn closed(&self, code: Option<u16>, reason: impl Into<String>) {
        self.emit(SocketEvent::Closed {
            code,
            reason: reason.into(),
        });
    }

    fn emit(&self, event: SocketEvent) {
        // The actor may already be gone during shutdown.
        let _ = self.tx.send(Event::Socket {
            socket: self.socket,
            event,
        });
    }
}

/// Write side of a socket, shared by the actor, the heart-beat task and publishers.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    id: SocketId,
    outbound: mpsc::UnboundedSender<Outgoing>,
    open: Arc<AtomicBool>,
}

impl SocketHandle {
    /// `open` is owned by the transport: set once the handshake completes and
    /// cleared when the socket goes away.
    pub fn new(id: SocketId, outbound: mpsc::UnboundedSender<Outgoing>, open: Arc<AtomicBool>) -> Self {
        Self { id, outbound, open }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.outbound.is_closed()
    }

    /// Encode and queue a frame.
    pub fn send_frame(&self, frame: &Frame) -> HdResult<()> {
        if !self.is_open() {
            return Err(HdError::SocketClosed);
        }
        self.outbound
            .send(Outgoing::Data(frame.encode()))
            .map_err(|_| HdError::SocketClosed)
    }

    /// Ask the transport to close. Marks the handle closed immediately.
    pub fn close(&self, code: u16, reason: &str) {
        self.open.store(false, Ordering::Release);
        let _ = self.outbound.send(Outgoing::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// Opens sockets.
pub trait Transport: Send + Sync + 'static {
    /// Start opening a socket. Must not block; progress is reported through `events`.
    fn open(&self, request: OpenRequest, events: SocketEvents) -> SocketHandle;
}

/// WebSocket transport on tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for WsTransport {
    fn open(&self, request: OpenRequest, events: SocketEvents) -> SocketHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        let handle = SocketHandle::new(request.socket, tx, open.clone());
        tokio::spawn(run_socket(request, rx, open, events));
        handle
    }
}

async fn run_socket(
    request: OpenRequest,
    mut outbound: mpsc::UnboundedReceiver<Outgoing>,
    open: Arc<AtomicBool>,
    events: SocketEvents,
) {
    let id = request.socket;
    debug!("socket {id}: connecting to {}", request.url);

    let connected = tokio::select! {
        result = handshake(&request) => result,
        () = wait_for_close(&mut outbound) => {
            debug!("socket {id}: closed before handshake finished");
            events.closed(Some(close_codes::NORMAL), "closed before open");
            return;
        }
    };

    let stream = match connected {
        Ok(stream) => stream,
        Err(e) => {
            warn!("socket {id}: handshake failed: {e}");
            events.error(e.to_string());
            events.closed(None, e.to_string());
            return;
        }
    };

    info!("socket {id}: open");
    open.store(true, Ordering::Release);
    events.opened();

    let (mut write, mut read) = stream.split();
    let (code, reason) = loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(Outgoing::Data(bytes)) => {
                    let message = match String::from_utf8(bytes) {
                        Ok(text) => Message::Text(text),
                        Err(e) => Message::Binary(e.into_bytes()),
                    };
                    if let Err(e) = write.send(message).await {
                        events.error(e.to_string());
                        break (None, e.to_string());
                    }
                }
                Some(Outgoing::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.clone().into(),
                    };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    break (Some(code), reason);
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    break (Some(close_codes::NORMAL), "handle dropped".to_string());
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => events.data(text.into_bytes()),
                Some(Ok(Message::Binary(bytes))) => events.data(bytes),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => events.activity(),
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                        None => (None, String::new()),
                    };
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    events.error(e.to_string());
                    break (None, e.to_string());
                }
                None => break (None, "stream ended".to_string()),
            },
        }
    };

    open.store(false, Ordering::Release);
    debug!("socket {id}: closed (code {code:?}) {reason}");
    events.closed(code, reason);
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn handshake(request: &OpenRequest) -> HdResult<WsStream> {
    let mut upgrade = request
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| HdError::Socket(format!("invalid socket url {}: {e}", request.url)))?;

    for (name, value) in &request.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| HdError::Socket(format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| HdError::Socket(format!("invalid value for header {name}: {e}")))?;
        upgrade.headers_mut().insert(name, value);
    }

    let (stream, _response) = tokio_tungstenite::connect_async(upgrade)
        .await
        .map_err(|e| HdError::Socket(e.to_string()))?;
    Ok(stream)
}

/// Resolve once the owner asks for a close or drops every handle.
async fn wait_for_close(outbound: &mut mpsc::UnboundedReceiver<Outgoing>) {
    loop {
        match outbound.recv().await {
            Some(Outgoing::Close { .. }) | None => return,
            Some(Outgoing::Data(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Command;

    fn handle(open: bool) -> (SocketHandle, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SocketHandle::new(SocketId(7), tx, Arc::new(AtomicBool::new(open))), rx)
    }

    #[test]
    fn test_send_frame_encodes() {
        let (socket, mut rx) = handle(true);
        socket.send_frame(&Frame::new(Command::Send).with_body("hi")).unwrap();
        match rx.try_recv().unwrap() {
            Outgoing::Data(bytes) => {
                let frame = Frame::decode(&bytes).unwrap();
                assert_eq!(frame.command, Command::Send);
                assert_eq!(frame.body.as_deref(), Some(&b"hi"[..]));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_send_on_unopened_socket_fails() {
        let (socket, mut rx) = handle(false);
        assert!(matches!(socket.send_frame(&Frame::heartbeat()), Err(HdError::SocketClosed)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_close_marks_handle_closed() {
        let (socket, mut rx) = handle(true);
        socket.close(1000, "bye");
        assert!(!socket.is_open());
        assert_eq!(rx.try_recv().unwrap(), Outgoing::Close { code: 1000, reason: "bye".into() });
        assert!(socket.send_frame(&Frame::heartbeat()).is_err());
    }

    #[test]
    fn test_dropped_receiver_means_closed() {
        let (socket, rx) = handle(true);
        drop(rx);
        assert!(!socket.is_open());
    }

    #[test]
    fn test_socket_events_carry_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = SocketEvents::new(SocketId(3), tx);
        events.closed(Some(1002), "protocol");
        match rx.try_recv().unwrap() {
            Event::Socket { socket, event } => {
                assert_eq!(socket, SocketId(3));
                assert_eq!(event, SocketEvent::Closed { code: Some(1002), reason: "protocol".into() });
            }
            _ => panic!("expected socket event"),
        }
    }

    #[tokio::test]
    async fn test_ws_transport_reports_handshake_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = OpenRequest {
            socket: SocketId(1),
            url: "not a url".into(),
            headers: Vec::new(),
        };
        let socket = WsTransport::new().open(request, SocketEvents::new(SocketId(1), tx));
        assert!(!socket.is_open());

        let mut saw_error = false;
        while let Some(Event::Socket { event, .. }) = rx.recv().await {
            match event {
                SocketEvent::Error(_) => saw_error = true,
                SocketEvent::Closed { code, .. } => {
                    assert_eq!(code, None);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(saw_error);
    }
}
