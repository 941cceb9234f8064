//! 连接管理器 - 负责唯一的代理会话、连接状态、订阅注册表和重连策略
//! Connection Manager - owns the single broker session, the connection state,
//! the subscription registry and the reconnection policy.
//!
//! Every session is tagged with a generation number. Events from a session
//! that is no longer current are ignored, so the close of a session we tore
//! down ourselves never looks like an unexpected drop.
//!
//! 每个会话都带有一个代数编号。来自非当前会话的事件会被忽略，因此我们主动关闭的会话
//! 不会被误认为是意外断开。

use crate::{
    config::Config,
    credentials::CredentialSource,
    error::{Error, Result},
    payload::Payload,
    registry::{Subscription, SubscriptionRegistry},
    retry::RetryTimer,
    state::{ConnectionState, ListenerHandle, StateListeners},
    transport::{
        ErrorFrame, FrameHandler, Headers, InboundFrame, OutboundMessage, Session, SessionEvent,
        SessionOptions, Transport, WebSocketTransport,
    },
};
use serde::Serialize;
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, ThreadId},
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};


/// Callback invoked for every message on a subscribed destination.
pub type MessageCallback = Arc<dyn Fn(Payload) + Send + Sync>;

/// Who asked for a session to be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectOrigin {
    /// The application called `connect` or `reconnect`.
    Application,
    /// The reconnection policy, armed while `generation` was current.
    Retry { generation: u64 },
}

struct ActiveSession {
    generation: u64,
    session: Arc<dyn Session>,
    origin: ConnectOrigin,
    /// The broker accepted this session at some point.
    established: bool,
    /// The broker rejected this session with an ERROR frame.
    rejected: bool,
}

/// Mutable state guarded by the manager's lock.
struct ManagerState {
    state: ConnectionState,
    session: Option<ActiveSession>,
    generation: u64,
    reconnect_attempts: u32,
    pending_connect: Option<oneshot::Sender<Result<()>>>,
    retry: RetryTimer,
    /// Transitions not yet delivered to listeners, in the order they happened.
    announcements: VecDeque<ConnectionState>,
    /// Transitions queued and delivered so far.
    queued: u64,
    delivered: u64,
    /// The thread currently delivering `announcements`.
    announcer: Option<ThreadId>,
}

impl ManagerState {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            session: None,
            generation: 0,
            reconnect_attempts: 0,
            pending_connect: None,
            retry: RetryTimer::default(),
            announcements: VecDeque::new(),
            queued: 0,
            delivered: 0,
            announcer: None,
        }
    }

    /// Moves to `next` and queues it for the listeners if it differs from
    /// the current state.
    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        trace!(from = %self.state, to = %next, "State transition");
        self.state = next;
        self.announcements.push_back(next);
        self.queued += 1;
    }

    fn current_session(&mut self, generation: u64) -> Option<&mut ActiveSession> {
        if self.generation != generation {
            return None;
        }
        self.session
            .as_mut()
            .filter(|active| active.generation == generation)
    }
}

struct Inner {
    config: Config,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    state: Mutex<ManagerState>,
    /// Signalled whenever a queued transition has been delivered.
    announced: Condvar,
    registry: SubscriptionRegistry,
    listeners: Arc<StateListeners>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.retry.cancel();
        if let Some(active) = state.session.take() {
            active.session.deactivate();
        }
    }
}

/// The client's single logical connection to the broker.
///
/// Cheap to clone; all clones share one session, one state and one
/// subscription registry.
///
/// 客户端与代理之间唯一的逻辑连接。克隆代价低廉；所有克隆共享同一个会话、状态和订阅注册表。
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

/// A non-owning reference to a [`ConnectionManager`].
#[derive(Clone, Debug)]
pub struct WeakConnectionManager {
    inner: Weak<Inner>,
}

impl WeakConnectionManager {
    pub fn upgrade(&self) -> Option<ConnectionManager> {
        self.inner.upgrade().map(|inner| ConnectionManager { inner })
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.inner.config.endpoint)
            .field("state", &state.state)
            .field("generation", &state.generation)
            .field("reconnect_attempts", &state.reconnect_attempts)
            .field("reconnect_scheduled", &state.retry.is_pending())
            .field("subscriptions", &self.inner.registry.len())
            .finish()
    }
}

impl ConnectionManager {
    /// Creates a manager in the DISCONNECTED state. Nothing is opened until
    /// [`connect`](Self::connect) or [`reconnect`](Self::reconnect) is called.
    ///
    /// 创建一个处于 DISCONNECTED 状态的管理器。
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                credentials,
                state: Mutex::new(ManagerState::new()),
                announced: Condvar::new(),
                registry: SubscriptionRegistry::default(),
                listeners: Arc::new(StateListeners::default()),
            }),
        }
    }

    /// Creates a manager speaking STOMP over WebSocket.
    pub fn with_websocket(config: Config, credentials: Arc<dyn CredentialSource>) -> Self {
        Self::new(config, Arc::new(WebSocketTransport::new()), credentials)
    }

    pub fn downgrade(&self) -> WeakConnectionManager {
        WeakConnectionManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers queued transitions to the listeners, outside the lock, and
    /// returns once every transition queued so far has been delivered.
    ///
    /// One thread delivers at a time, in queue order, so the last transition
    /// a listener sees is the current state. A caller on another thread waits
    /// for the announcer to deliver its transition. A listener re-entering the
    /// manager returns at once; its transition follows once the current round
    /// of listeners is done.
    fn announce(&self) {
        let current = thread::current().id();
        let mut state = self.lock();
        let target = state.queued;
        while let Some(announcer) = state.announcer {
            if announcer == current || state.delivered >= target {
                return;
            }
            state = self
                .inner
                .announced
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.delivered >= target && state.announcements.is_empty() {
            return;
        }

        state.announcer = Some(current);
        let _reset = AnnouncerGuard(self);
        while let Some(next) = state.announcements.pop_front() {
            drop(state);
            self.inner.listeners.notify(next);
            state = self.lock();
            state.delivered += 1;
            self.inner.announced.notify_all();
        }
        state.announcer = None;
        self.inner.announced.notify_all();
    }

    /// 获取当前状态
    /// Gets the current state
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Whether a session exists and reports itself connected. Subscribe and
    /// publish are only allowed while this holds.
    pub fn is_connected(&self) -> bool {
        self.lock()
            .session
            .as_ref()
            .is_some_and(|active| active.session.is_connected())
    }

    /// Number of consecutive automatic reconnect attempts since the last
    /// successful connect or explicit disconnect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().reconnect_attempts
    }

    /// Registers a listener for state changes. Listeners run in
    /// registration order and see every transition in the order it happened,
    /// before the operation that caused it returns. A transition made from
    /// inside a listener is delivered once the current round of listeners
    /// has returned. Listeners must not block.
    ///
    /// 注册状态变化监听器。监听器按注册顺序、按转换发生的顺序收到每次转换。
    pub fn on_state_change<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.inner.listeners.add(Arc::new(listener))
    }

    /// Opens a session, attaching `credential` as a bearer `Authorization`
    /// header when present. Resolves once the broker accepts the session.
    ///
    /// Returns immediately if already connected or if another connect is in
    /// flight; no second session is opened in either case.
    ///
    /// 打开一个会话。如果已连接或已有连接在进行中，则立即返回。
    pub async fn connect(&self, credential: Option<String>) -> Result<()> {
        self.connect_with_origin(credential, ConnectOrigin::Application)
            .await
    }

    /// Connects with a credential freshly read from the credential source.
    /// This is how an application resumes after automatic reconnection gave up.
    pub async fn reconnect(&self) -> Result<()> {
        let credential = self.inner.credentials.credential().await;
        self.connect(credential).await
    }

    async fn connect_with_origin(
        &self,
        credential: Option<String>,
        origin: ConnectOrigin,
    ) -> Result<()> {
        let (generation, stale, done_rx) = {
            let mut state = self.lock();
            if state
                .session
                .as_ref()
                .is_some_and(|active| active.session.is_connected())
            {
                debug!("Already connected");
                return Ok(());
            }
            if state.pending_connect.is_some() {
                debug!("Connect already in flight");
                return Ok(());
            }
            match origin {
                ConnectOrigin::Retry { generation } if generation != state.generation => {
                    debug!(generation, "Scheduled reconnect superseded");
                    return Ok(());
                }
                ConnectOrigin::Retry { .. } => {}
                ConnectOrigin::Application => state.retry.cancel(),
            }
            state.generation += 1;
            let (done_tx, done_rx) = oneshot::channel();
            state.pending_connect = Some(done_tx);
            state.set_state(ConnectionState::Connecting);
            (state.generation, state.session.take(), done_rx)
        };

        self.release_session(stale);
        self.announce();

        let mut headers = Headers::new();
        let authenticated = credential.is_some();
        if let Some(token) = credential {
            headers.insert("Authorization".to_string(), format!("Bearer {token}"));
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let options = SessionOptions {
            headers,
            heartbeat_incoming: self.inner.config.heartbeat.incoming,
            heartbeat_outgoing: self.inner.config.heartbeat.outgoing,
            events: events_tx,
        };

        info!(
            endpoint = %self.inner.config.endpoint,
            generation,
            authenticated,
            "Connecting"
        );

        match self.inner.transport.open(&self.inner.config.endpoint, options) {
            Ok(session) => {
                let superseded = {
                    let mut state = self.lock();
                    if state.generation == generation {
                        state.session = Some(ActiveSession {
                            generation,
                            session: session.clone(),
                            origin,
                            established: false,
                            rejected: false,
                        });
                        false
                    } else {
                        true
                    }
                };
                if superseded {
                    debug!(generation, "Session superseded while opening");
                    session.deactivate();
                }
                tokio::spawn(Self::pump_events(self.downgrade(), generation, events_rx));
            }
            Err(error) => {
                warn!(%error, generation, "Failed to open session");
                {
                    let mut state = self.lock();
                    if state.generation == generation {
                        state.pending_connect = None;
                        state.set_state(ConnectionState::Error);
                    }
                }
                self.announce();
                return Err(error);
            }
        }

        done_rx.await.unwrap_or(Err(Error::ConnectionClosed))
    }

    /// Closes the session and forgets every subscription. Never fails, and
    /// never leads to an automatic reconnect; a scheduled retry is cancelled.
    ///
    /// 关闭会话并清除所有订阅。不会失败，也不会触发自动重连；已计划的重试会被取消。
    pub fn disconnect(&self) {
        let (stale, pending) = {
            let mut state = self.lock();
            state.retry.cancel();
            state.generation += 1;
            state.reconnect_attempts = 0;
            state.set_state(ConnectionState::Disconnected);
            (state.session.take(), state.pending_connect.take())
        };

        let released = self.release_session(stale);
        info!(subscriptions = released, "Disconnected");
        self.announce();

        if let Some(done_tx) = pending {
            let _ = done_tx.send(Err(Error::ConnectionClosed));
        }
    }

    /// Cancels every subscription and closes `stale`, in that order.
    fn release_session(&self, stale: Option<ActiveSession>) -> usize {
        let released = self.inner.registry.clear();
        if let Some(active) = stale {
            if active.session.is_connected() {
                debug!(generation = active.generation, "Closing session");
            } else {
                debug!(generation = active.generation, "Abandoning session that is not connected");
            }
            active.session.deactivate();
        }
        released
    }

    /// Subscribes `callback` to `destination`, replacing any existing
    /// subscription to it. The returned handle cancels the subscription.
    ///
    /// Fails with [`Error::NotConnected`] unless [`is_connected`](Self::is_connected).
    ///
    /// 将 `callback` 订阅到 `destination`，替换已有的订阅。
    pub fn subscribe<F>(&self, destination: &str, callback: F) -> Result<Unsubscribe>
    where
        F: Fn(Payload) + Send + Sync + 'static,
    {
        self.subscribe_callback(destination, Arc::new(callback))
    }

    pub(crate) fn subscribe_callback(
        &self,
        destination: &str,
        callback: MessageCallback,
    ) -> Result<Unsubscribe> {
        let session = self.connected_session()?;

        // The old transport registration is gone before the new one exists.
        self.inner.registry.retire(destination);

        let handler: FrameHandler =
            Arc::new(move |frame: InboundFrame| callback(Payload::from_body(&frame.body)));
        let handle = session.subscribe(destination, handler)?;
        let id = self.inner.registry.next_id();
        debug!(destination, id, transport_id = handle.id(), "Subscribed");
        self.inner
            .registry
            .insert(destination, Subscription { id, handle });

        Ok(Unsubscribe {
            manager: self.downgrade(),
            destination: destination.to_string(),
            id,
            done: AtomicBool::new(false),
        })
    }

    /// Builds the per-user form of `destination`, e.g. `/user/alice/queue/replies`.
    pub fn user_destination(&self, username: &str, destination: &str) -> String {
        format!(
            "{}/{}/{}",
            self.inner.config.user_destination_prefix.trim_end_matches('/'),
            username,
            destination.trim_start_matches('/')
        )
    }

    /// Subscribes to the per-user form of `destination`.
    pub fn subscribe_to_user<F>(
        &self,
        username: &str,
        destination: &str,
        callback: F,
    ) -> Result<Unsubscribe>
    where
        F: Fn(Payload) + Send + Sync + 'static,
    {
        self.subscribe(&self.user_destination(username, destination), callback)
    }

    /// Serializes `body` as JSON and sends it to `destination`, merging in
    /// `headers`.
    ///
    /// Fails with [`Error::NotConnected`] unless [`is_connected`](Self::is_connected).
    pub fn publish<T>(&self, destination: &str, body: &T, headers: Option<Headers>) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let session = self.connected_session()?;
        let body = serde_json::to_string(body)?;
        session.publish(OutboundMessage {
            destination: destination.to_string(),
            body,
            headers: headers.unwrap_or_default(),
        })?;
        trace!(destination, "Published");
        Ok(())
    }

    /// Same as [`publish`](Self::publish).
    pub fn send<T>(&self, destination: &str, body: &T, headers: Option<Headers>) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.publish(destination, body, headers)
    }

    /// Number of destinations currently subscribed.
    pub fn subscription_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_subscribed(&self, destination: &str) -> bool {
        self.inner.registry.contains(destination)
    }

    pub fn subscribed_destinations(&self) -> Vec<String> {
        self.inner.registry.destinations()
    }

    fn connected_session(&self) -> Result<Arc<dyn Session>> {
        let state = self.lock();
        match &state.session {
            Some(active) if active.session.is_connected() => Ok(active.session.clone()),
            _ => Err(Error::NotConnected),
        }
    }

    /// Feeds one session's events into the manager until the session closes,
    /// is superseded, or the manager is dropped.
    async fn pump_events(
        manager: WeakConnectionManager,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        loop {
            let Some(event) = events.recv().await else {
                // The session went away without reporting a close.
                if let Some(manager) = manager.upgrade() {
                    debug!(generation, "Session event channel closed");
                    manager.on_closed(generation);
                }
                break;
            };
            let Some(manager) = manager.upgrade() else {
                break;
            };
            if !manager.handle_session_event(generation, event) {
                break;
            }
        }
        trace!(generation, "Session event pump finished");
    }

    /// Returns whether further events of this session are of interest.
    fn handle_session_event(&self, generation: u64, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Connected => self.on_connected(generation),
            SessionEvent::Error(frame) => self.on_rejected(generation, frame),
            SessionEvent::TransportError(message) => self.on_transport_error(generation, message),
            SessionEvent::TransportClosed => {
                self.on_closed(generation);
                false
            }
        }
    }

    fn on_connected(&self, generation: u64) -> bool {
        let pending = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let Some(active) = state.current_session(generation) else {
                return false;
            };
            active.established = true;
            state.reconnect_attempts = 0;
            state.set_state(ConnectionState::Connected);
            state.pending_connect.take()
        };
        info!(generation, "Connected");
        self.announce();
        if let Some(done_tx) = pending {
            let _ = done_tx.send(Ok(()));
        }
        true
    }

    fn on_rejected(&self, generation: u64, frame: ErrorFrame) -> bool {
        let reason = frame.reason();
        let pending = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let Some(active) = state.current_session(generation) else {
                return false;
            };
            active.rejected = true;
            state.set_state(ConnectionState::Error);
            state.pending_connect.take()
        };
        warn!(generation, %reason, "Broker rejected the session");
        self.announce();
        if let Some(done_tx) = pending {
            let _ = done_tx.send(Err(Error::Negotiation { reason }));
        }
        true
    }

    fn on_transport_error(&self, generation: u64, message: String) -> bool {
        let pending = {
            let mut state = self.lock();
            if state.current_session(generation).is_none() {
                return false;
            }
            state.set_state(ConnectionState::Error);
            state.pending_connect.take()
        };
        warn!(generation, error = %message, "Transport error");
        self.announce();
        if let Some(done_tx) = pending {
            let _ = done_tx.send(Err(Error::Transport(message)));
        }
        true
    }

    fn on_closed(&self, generation: u64) {
        let (pending, retry) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.current_session(generation).is_none() {
                trace!(generation, "Ignoring close of a superseded session");
                return;
            }
            let Some(active) = state.session.take() else {
                return;
            };
            // Only a drop of an established session, or of a session opened
            // by the retry policy itself, is retried. A rejected session is not.
            let retry = !active.rejected
                && (active.established || matches!(active.origin, ConnectOrigin::Retry { .. }));
            let next = if active.rejected {
                ConnectionState::Error
            } else {
                ConnectionState::Disconnected
            };
            state.set_state(next);
            (state.pending_connect.take(), retry)
        };

        let dropped = self.inner.registry.clear();
        warn!(generation, subscriptions = dropped, "Session closed unexpectedly");
        self.announce();
        if let Some(done_tx) = pending {
            let _ = done_tx.send(Err(Error::ConnectionClosed));
        }

        if retry {
            self.schedule_reconnect();
        } else {
            debug!(generation, "Not reconnecting automatically");
        }
    }

    /// Arms the next automatic reconnect, unless the attempt budget is spent.
    fn schedule_reconnect(&self) {
        let mut state = self.lock();
        let max_attempts = self.inner.config.reconnect.max_attempts;
        if state.reconnect_attempts >= max_attempts {
            warn!(
                attempts = state.reconnect_attempts,
                "Giving up on automatic reconnection"
            );
            return;
        }

        state.reconnect_attempts += 1;
        let attempt = state.reconnect_attempts;
        let generation = state.generation;
        let delay = self.inner.config.reconnect.delay_for_attempt(attempt);
        info!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );

        let manager = self.downgrade();
        state.retry.arm(delay, move || {
            tokio::spawn(async move {
                if let Some(manager) = manager.upgrade() {
                    manager.run_scheduled_reconnect(attempt, generation).await;
                }
            });
        });
    }

    async fn run_scheduled_reconnect(&self, attempt: u32, generation: u64) {
        let credential = self.inner.credentials.credential().await;
        debug!(attempt, authenticated = credential.is_some(), "Reconnecting");
        if let Err(error) = self
            .connect_with_origin(credential, ConnectOrigin::Retry { generation })
            .await
        {
            warn!(attempt, %error, "Reconnect attempt failed");
        }
    }
}

/// Steps down as announcer if a listener panics, so waiting callers and
/// later transitions are not stuck behind it.
struct AnnouncerGuard<'a>(&'a ConnectionManager);

impl Drop for AnnouncerGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.lock().announcer = None;
            self.0.inner.announced.notify_all();
        }
    }
}

/// Cancels one subscription. Calling [`unsubscribe`](Self::unsubscribe) more
/// than once is a no-op, and so is calling it after the destination was
/// subscribed again or the connection was torn down.
///
/// 取消一个订阅。多次调用是无操作的。
#[derive(Debug)]
pub struct Unsubscribe {
    manager: WeakConnectionManager,
    destination: String,
    id: u64,
    done: AtomicBool,
}

impl Unsubscribe {
    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.inner.registry.remove(&self.destination, self.id);
        }
    }
}
