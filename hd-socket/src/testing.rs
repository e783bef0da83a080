//! In-memory transport and credentials for driving the link in tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use hd_core::error::{HdError, HdResult};

use crate::credentials::{CredentialProvider, Credentials};
use crate::dispatcher::TopicDispatcher;
use crate::frame::{Command, Frame};
use crate::manager::{ConnectionManager, LinkSettings};
use crate::policy::Backoff;
use crate::transport::{OpenRequest, Outgoing, SocketEvents, SocketHandle, SocketId, Transport};

/// Records every socket the link opens and lets the test play the server.
#[derive(Clone, Default)]
pub struct FakeTransport {
    sockets: Arc<Mutex<Vec<FakeSocket>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sockets opened so far.
    pub fn opened(&self) -> usize {
        self.sockets.lock().unwrap().len()
    }

    /// The `index`th socket opened (zero-based). Panics if there is none.
    pub fn socket(&self, index: usize) -> FakeSocket {
        self.sockets.lock().unwrap()[index].clone()
    }

    /// The most recently opened socket. Panics if none was opened.
    pub fn last(&self) -> FakeSocket {
        self.sockets
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no socket opened")
    }
}

impl Transport for FakeTransport {
    fn open(&self, request: OpenRequest, events: SocketEvents) -> SocketHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        let handle = SocketHandle::new(request.socket, tx, open.clone());
        self.sockets.lock().unwrap().push(FakeSocket {
            inner: Arc::new(FakeSocketInner {
                request,
                events,
                open,
                outbound: Mutex::new(rx),
                sent: Mutex::new(Vec::new()),
            }),
        });
        handle
    }
}

struct FakeSocketInner {
    request: OpenRequest,
    events: SocketEvents,
    open: Arc<AtomicBool>,
    outbound: Mutex<mpsc::UnboundedReceiver<Outgoing>>,
    sent: Mutex<Vec<Outgoing>>,
}

/// Server side of one fake socket.
#[derive(Clone)]
pub struct FakeSocket {
    inner: Arc<FakeSocketInner>,
}

impl FakeSocket {
    pub fn id(&self) -> SocketId {
        self.inner.request.socket
    }

    pub fn request(&self) -> &OpenRequest {
        &self.inner.request
    }

    /// Complete the WebSocket handshake.
    pub fn open(&self) {
        self.inner.open.store(true, Ordering::Release);
        self.inner.events.opened();
    }

    /// Open and answer CONNECT with CONNECTED.
    pub fn accept(&self) {
        self.open();
        self.receive(&Frame::new(Command::Connected).with_header("version", "1.2"));
    }

    /// Deliver a frame from the server.
    pub fn receive(&self, frame: &Frame) {
        self.inner.events.data(frame.encode());
    }

    pub fn receive_raw(&self, bytes: &[u8]) {
        self.inner.events.data(bytes.to_vec());
    }

    /// Deliver a MESSAGE with a JSON body.
    pub fn receive_message(&self, destination: &str, body: &str) {
        self.receive(
            &Frame::new(Command::Message)
                .with_header("destination", destination)
                .with_header("subscription", "sub-0")
                .with_body(body),
        );
    }

    /// Close from the server side.
    pub fn close(&self, code: Option<u16>, reason: &str) {
        self.inner.open.store(false, Ordering::Release);
        self.inner.events.closed(code, reason);
    }

    /// Fail like a dropped network connection.
    pub fn fail(&self, message: &str) {
        self.inner.open.store(false, Ordering::Release);
        self.inner.events.error(message);
        self.inner.events.closed(None, message);
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Everything the client wrote so far, in order.
    pub fn sent(&self) -> Vec<Outgoing> {
        let mut sent = self.inner.sent.lock().unwrap();
        let mut outbound = self.inner.outbound.lock().unwrap();
        while let Ok(item) = outbound.try_recv() {
            sent.push(item);
        }
        sent.clone()
    }

    /// Decoded frames the client wrote, heart-beats included.
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.sent()
            .into_iter()
            .filter_map(|item| match item {
                Outgoing::Data(bytes) => Some(Frame::decode(&bytes).expect("client sent a bad frame")),
                Outgoing::Close { .. } => None,
            })
            .collect()
    }

    /// Frames with the given command.
    pub fn sent_commands(&self, command: Command) -> Vec<Frame> {
        self.sent_frames()
            .into_iter()
            .filter(|frame| frame.command == command)
            .collect()
    }

    /// The close the client requested, if any.
    pub fn client_close(&self) -> Option<(u16, String)> {
        self.sent().into_iter().find_map(|item| match item {
            Outgoing::Close { code, reason } => Some((code, reason)),
            Outgoing::Data(_) => None,
        })
    }

    pub fn closed_by_client(&self) -> bool {
        self.client_close().is_some()
    }
}

/// Credential provider backed by a mutable value.
pub struct StaticCredentials {
    credentials: Mutex<Credentials>,
    refreshed_token: Mutex<Option<String>>,
    fail_fetches: AtomicBool,
    fetches: AtomicUsize,
    refreshes: AtomicUsize,
}

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials: Mutex::new(credentials),
            refreshed_token: Mutex::new(None),
            fail_fetches: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
        }
    }

    /// Opaque, never-expiring token for workspace `ws-1`.
    pub fn valid() -> Self {
        Self::new(Credentials {
            auth_token: "test-token".into(),
            workspace_id: "ws-1".into(),
            device_id: "device-1".into(),
            device_type: "desktop".into(),
        })
    }

    pub fn set_token(&self, token: &str) {
        self.credentials.lock().unwrap().auth_token = token.to_string();
    }

    /// Token installed by the next `refresh_token` call.
    pub fn set_refreshed_token(&self, token: &str) {
        *self.refreshed_token.lock().unwrap() = Some(token.to_string());
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get_credentials(&self) -> HdResult<Credentials> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(HdError::Http("credential service unavailable".into()));
        }
        Ok(self.credentials.lock().unwrap().clone())
    }

    async fn refresh_token(&self) -> HdResult<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = self.refreshed_token.lock().unwrap().take() {
            self.set_token(&token);
        }
        Ok(())
    }
}

/// Settings with two topics, three attempts and no jitter.
pub fn test_settings() -> LinkSettings {
    LinkSettings {
        max_reconnect_attempts: 3,
        backoff: Backoff {
            jitter: 0.0,
            ..Backoff::default()
        },
        ..LinkSettings::new("wss://chat.test/ws")
    }
    .with_topic("/user/queue/messages", "sub-messages")
    .with_topic("/topic/presence", "sub-presence")
}

/// A manager wired to a fake transport.
pub struct TestLink {
    pub manager: ConnectionManager,
    pub transport: FakeTransport,
    pub credentials: Arc<StaticCredentials>,
}

impl TestLink {
    pub fn spawn(settings: LinkSettings) -> Self {
        Self::spawn_with(settings, TopicDispatcher::new(64))
    }

    pub fn spawn_with(settings: LinkSettings, dispatcher: TopicDispatcher) -> Self {
        let transport = FakeTransport::new();
        let credentials = Arc::new(StaticCredentials::valid());
        let manager = ConnectionManager::spawn(
            settings,
            dispatcher,
            Arc::new(transport.clone()),
            credentials.clone(),
        );
        Self {
            manager,
            transport,
            credentials,
        }
    }
}

/// Let spawned tasks run. Under a paused clock this only advances time by 1ms.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
