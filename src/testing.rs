//! 测试辅助工具模块
//! Test utilities module
//!
//! An in-memory transport whose sessions are driven by the test: accept,
//! reject, fail or drop a session, and deliver messages to its subscriptions.

#![cfg(test)]

use crate::config::Config;
use crate::credentials::{CredentialSource, CredentialStore};
use crate::error::{Error, Result};
use crate::manager::ConnectionManager;
use crate::transport::{
    ErrorFrame, FrameHandler, Headers, InboundFrame, OutboundMessage, Session, SessionEvent,
    SessionOptions, Transport, TransportSubscription,
};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Lets spawned tasks (event pumps, retry tasks) run to their next await.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// A manager wired to a fresh mock transport.
pub fn manager_with(
    config: Config,
    credentials: Arc<dyn CredentialSource>,
) -> (ConnectionManager, MockTransport) {
    let transport = MockTransport::new();
    let manager = ConnectionManager::new(config, Arc::new(transport.clone()), credentials);
    (manager, transport)
}

/// Connects and has the broker accept the new session.
pub async fn connected(
    manager: &ConnectionManager,
    transport: &MockTransport,
    credential: Option<&str>,
) -> Arc<MockSession> {
    let task = tokio::spawn({
        let manager = manager.clone();
        let credential = credential.map(str::to_string);
        async move { manager.connect(credential).await }
    });
    settle().await;
    let session = transport.last_session();
    session.accept();
    task.await.unwrap().unwrap();
    session
}

#[derive(Debug, Default)]
struct MockTransportState {
    sessions: Mutex<Vec<Arc<MockSession>>>,
    refuse: AtomicBool,
}

/// A transport that records every session it opens.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<MockTransportState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent `open` calls fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.state.sessions.lock().unwrap().len()
    }

    pub fn session(&self, index: usize) -> Arc<MockSession> {
        self.state.sessions.lock().unwrap()[index].clone()
    }

    pub fn last_session(&self) -> Arc<MockSession> {
        self.state
            .sessions
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no session was opened")
    }
}

impl Transport for MockTransport {
    fn open(&self, endpoint: &str, options: SessionOptions) -> Result<Arc<dyn Session>> {
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection refused".into()));
        }
        let session = Arc::new(MockSession::new(endpoint, options));
        self.state.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

struct MockSubscriptionEntry {
    destination: String,
    handler: FrameHandler,
    active: Arc<AtomicBool>,
}

pub struct MockSession {
    pub endpoint: String,
    pub headers: Headers,
    pub heartbeat_incoming: Duration,
    pub heartbeat_outgoing: Duration,
    pub opened_at: Instant,
    events: Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
    connected: AtomicBool,
    refuse_subscribes: AtomicBool,
    subscriptions: Mutex<Vec<MockSubscriptionEntry>>,
    unsubscribes: Arc<AtomicUsize>,
    published: Mutex<Vec<OutboundMessage>>,
    deactivations: AtomicUsize,
}

impl fmt::Debug for MockSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockSession")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish()
    }
}

impl MockSession {
    fn new(endpoint: &str, options: SessionOptions) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            headers: options.headers,
            heartbeat_incoming: options.heartbeat_incoming,
            heartbeat_outgoing: options.heartbeat_outgoing,
            opened_at: Instant::now(),
            events: Mutex::new(Some(options.events)),
            connected: AtomicBool::new(false),
            refuse_subscribes: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
            unsubscribes: Arc::new(AtomicUsize::new(0)),
            published: Mutex::new(Vec::new()),
            deactivations: AtomicUsize::new(0),
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(event);
        }
    }

    pub fn authorization(&self) -> Option<&str> {
        self.headers.get("Authorization").map(String::as_str)
    }

    /// The broker accepts the session.
    pub fn accept(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.emit(SessionEvent::Connected);
    }

    /// The broker answers with an ERROR frame carrying `message`.
    pub fn reject(&self, message: &str) {
        self.emit(SessionEvent::Error(ErrorFrame {
            message: Some(message.to_string()),
            body: String::new(),
        }));
    }

    pub fn fail(&self, message: &str) {
        self.emit(SessionEvent::TransportError(message.to_string()));
    }

    /// The socket closes without being asked to.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.emit(SessionEvent::TransportClosed);
    }

    /// The session's driver dies without reporting anything: its event
    /// channel closes while the session still claims to be connected.
    pub fn vanish(&self) {
        self.events.lock().unwrap().take();
    }

    /// Makes subsequent `subscribe` calls fail.
    pub fn refuse_subscribes(&self, refuse: bool) {
        self.refuse_subscribes.store(refuse, Ordering::SeqCst);
    }

    /// Delivers `body` to every active subscription on `destination` and
    /// returns how many handlers ran.
    pub fn deliver(&self, destination: &str, body: &str) -> usize {
        let handlers: Vec<FrameHandler> = self
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.destination == destination && entry.active.load(Ordering::SeqCst))
            .map(|entry| entry.handler.clone())
            .collect();
        for handler in &handlers {
            handler(InboundFrame {
                destination: destination.to_string(),
                headers: Headers::new(),
                body: body.to_string(),
            });
        }
        handlers.len()
    }

    pub fn active_subscriptions(&self, destination: &str) -> usize {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.destination == destination && entry.active.load(Ordering::SeqCst))
            .count()
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.published.lock().unwrap().clone()
    }

    pub fn deactivations(&self) -> usize {
        self.deactivations.load(Ordering::SeqCst)
    }
}

impl Session for MockSession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(
        &self,
        destination: &str,
        handler: FrameHandler,
    ) -> Result<Box<dyn TransportSubscription>> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        if self.refuse_subscribes.load(Ordering::SeqCst) {
            return Err(Error::ChannelClosed);
        }
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let id = format!("sub-{}", subscriptions.len());
        let active = Arc::new(AtomicBool::new(true));
        subscriptions.push(MockSubscriptionEntry {
            destination: destination.to_string(),
            handler,
            active: active.clone(),
        });
        Ok(Box::new(MockSubscription {
            id,
            active,
            unsubscribes: self.unsubscribes.clone(),
        }))
    }

    fn publish(&self, message: OutboundMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.published.lock().unwrap().push(message);
        Ok(())
    }

    fn deactivate(&self) {
        self.deactivations.fetch_add(1, Ordering::SeqCst);
        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(SessionEvent::TransportClosed);
        }
    }
}

#[derive(Debug)]
struct MockSubscription {
    id: String,
    active: Arc<AtomicBool>,
    unsubscribes: Arc<AtomicUsize>,
}

impl TransportSubscription for MockSubscription {
    fn id(&self) -> &str {
        &self.id
    }

    fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// A replaceable token that counts how often it was asked for.
#[derive(Debug, Default)]
pub struct CountingCredentials {
    pub store: CredentialStore,
    calls: AtomicUsize,
}

impl CountingCredentials {
    pub fn new(token: &str) -> Self {
        Self {
            store: CredentialStore::new(Some(token.to_string())),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialSource for CountingCredentials {
    async fn credential(&self) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.store.credential().await
    }
}
