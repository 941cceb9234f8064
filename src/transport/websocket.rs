//! STOMP over WebSocket transport.
//!
//! Each session is driven by one background task that owns the socket. The
//! public [`Session`] handle talks to that task through a command channel, and
//! the task reports lifecycle changes on the session's event channel.
//!
//! 基于 WebSocket 的 STOMP 传输。每个会话由一个拥有套接字的后台任务驱动。
//! 公共的 [`Session`] 句柄通过命令通道与该任务通信，任务通过会话的事件通道报告生命周期变化。

use super::{
    FrameHandler, Headers, InboundFrame, OutboundMessage, Session, SessionEvent, SessionOptions,
    Transport, TransportSubscription,
    frame::{StompFrame, command},
};
use crate::error::{Error, Result};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{net::TcpStream, sync::mpsc, time::Instant};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message},
};
use tracing::{debug, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound silence is tolerated for this many negotiated intervals.
const INCOMING_GRACE_FACTOR: u32 = 2;

/// Opens STOMP 1.2 sessions over WebSocket.
///
/// 通过 WebSocket 打开 STOMP 1.2 会话。
#[derive(Debug, Default, Clone)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, endpoint: &str, options: SessionOptions) -> Result<Arc<dyn Session>> {
        let request = endpoint
            .into_client_request()
            .map_err(|e| Error::InvalidEndpoint(format!("{endpoint}: {e}")))?;
        let host = request.uri().host().unwrap_or("localhost").to_string();
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Transport(format!("no async runtime: {e}")))?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared::default());

        let task = SessionTask {
            endpoint: endpoint.to_string(),
            host,
            options,
            shared: shared.clone(),
            command_rx,
        };
        debug!(endpoint, "Opening WebSocket session");
        runtime.spawn(task.run());

        Ok(Arc::new(WebSocketSession { shared, command_tx }))
    }
}

/// State shared between a session handle and its background task.
#[derive(Default)]
struct SessionShared {
    connected: AtomicBool,
    handlers: DashMap<String, FrameHandler>,
    next_subscription: AtomicU64,
}

impl fmt::Debug for SessionShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionShared")
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .field("subscriptions", &self.handlers.len())
            .finish()
    }
}

/// Commands sent from the session handle to the background task.
#[derive(Debug)]
enum SessionCommand {
    Subscribe { id: String, destination: String },
    Unsubscribe { id: String },
    Send(OutboundMessage),
    Disconnect,
}

#[derive(Debug)]
struct WebSocketSession {
    shared: Arc<SessionShared>,
    command_tx: mpsc::UnboundedSender<SessionCommand>,
}

impl Session for WebSocketSession {
    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn subscribe(
        &self,
        destination: &str,
        handler: FrameHandler,
    ) -> Result<Box<dyn TransportSubscription>> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let id = format!(
            "sub-{}",
            self.shared.next_subscription.fetch_add(1, Ordering::Relaxed)
        );
        self.shared.handlers.insert(id.clone(), handler);
        let command = SessionCommand::Subscribe {
            id: id.clone(),
            destination: destination.to_string(),
        };
        if self.command_tx.send(command).is_err() {
            self.shared.handlers.remove(&id);
            return Err(Error::ChannelClosed);
        }

        Ok(Box::new(WebSocketSubscription {
            id,
            shared: Arc::downgrade(&self.shared),
            command_tx: self.command_tx.clone(),
            active: AtomicBool::new(true),
        }))
    }

    fn publish(&self, message: OutboundMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.command_tx
            .send(SessionCommand::Send(message))
            .map_err(|_| Error::ChannelClosed)
    }

    fn deactivate(&self) {
        let _ = self.command_tx.send(SessionCommand::Disconnect);
    }
}

#[derive(Debug)]
struct WebSocketSubscription {
    id: String,
    shared: Weak<SessionShared>,
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    active: AtomicBool,
}

impl TransportSubscription for WebSocketSubscription {
    fn id(&self) -> &str {
        &self.id
    }

    fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.handlers.remove(&self.id);
        }
        // The task may already be gone together with the socket.
        let _ = self.command_tx.send(SessionCommand::Unsubscribe {
            id: self.id.clone(),
        });
    }
}

/// Negotiated heart-beat intervals of a live session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Heartbeats {
    outgoing: Option<Duration>,
    incoming: Option<Duration>,
}

/// Parses a `heart-beat` header (`"<cx>,<cy>"` in milliseconds).
/// Missing or malformed values count as zero.
fn parse_heartbeat_header(value: Option<&str>) -> (u64, u64) {
    let Some((first, second)) = value.and_then(|v| v.split_once(',')) else {
        return (0, 0);
    };
    (
        first.trim().parse().unwrap_or(0),
        second.trim().parse().unwrap_or(0),
    )
}

/// One direction of STOMP heart-beat negotiation: disabled if either side
/// declines, otherwise the larger of the two intervals.
fn negotiate_heartbeat(ours: Duration, theirs_ms: u64) -> Option<Duration> {
    if ours.is_zero() || theirs_ms == 0 {
        return None;
    }
    Some(ours.max(Duration::from_millis(theirs_ms)))
}

fn negotiate(options: &SessionOptions, server_header: Option<&str>) -> Heartbeats {
    let (server_sends, server_wants) = parse_heartbeat_header(server_header);
    Heartbeats {
        outgoing: negotiate_heartbeat(options.heartbeat_outgoing, server_wants),
        incoming: negotiate_heartbeat(options.heartbeat_incoming, server_sends),
    }
}

fn to_message(frame: &StompFrame) -> Message {
    Message::Text(String::from_utf8_lossy(&frame.encode()).into_owned().into())
}

/// 会话后台任务，拥有 WebSocket 流
/// The session's background task, owning the WebSocket stream
struct SessionTask {
    endpoint: String,
    host: String,
    options: SessionOptions,
    shared: Arc<SessionShared>,
    command_rx: mpsc::UnboundedReceiver<SessionCommand>,
}

impl Drop for SessionTask {
    fn drop(&mut self) {
        self.shared.connected.store(false, Ordering::Release);
        self.shared.handlers.clear();
        debug!("WebSocket session closed");
        let _ = self.options.events.send(SessionEvent::TransportClosed);
    }
}

/// Timing bookkeeping of the main loop.
struct Liveness {
    heartbeats: Heartbeats,
    last_sent: Instant,
    last_received: Instant,
}

impl Liveness {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            heartbeats: Heartbeats::default(),
            last_sent: now,
            last_received: now,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let send_at = self.heartbeats.outgoing.map(|d| self.last_sent + d);
        let silent_at = self
            .heartbeats
            .incoming
            .map(|d| self.last_received + d * INCOMING_GRACE_FACTOR);
        match (send_at, silent_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

impl SessionTask {
    /// Runs the session to completion. The close is reported when the task
    /// is dropped, which also covers a panic inside the loop.
    async fn run(mut self) {
        if let Err(error) = self.drive().await {
            warn!(%error, "WebSocket session failed");
            let _ = self
                .options
                .events
                .send(SessionEvent::TransportError(error.to_string()));
        }
    }

    async fn drive(&mut self) -> Result<()> {
        let Some(mut ws) = self.open_socket().await? else {
            debug!("Session deactivated before the socket opened");
            return Ok(());
        };

        let mut connect = StompFrame::new(command::CONNECT)
            .header("accept-version", "1.2")
            .header("host", self.host.clone())
            .header(
                "heart-beat",
                format!(
                    "{},{}",
                    self.options.heartbeat_outgoing.as_millis(),
                    self.options.heartbeat_incoming.as_millis()
                ),
            );
        for (name, value) in &self.options.headers {
            connect = connect.header(name.clone(), value.clone());
        }
        ws.send(to_message(&connect)).await?;

        let mut liveness = Liveness::new();
        loop {
            let deadline = liveness.next_deadline();
            let timer = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(SessionCommand::Disconnect) | None => {
                            self.close_gracefully(&mut ws).await;
                            return Ok(());
                        }
                        Some(command) => {
                            let frame = Self::frame_for(command);
                            trace!(command = %frame.command, "Sending frame");
                            ws.send(to_message(&frame)).await?;
                            liveness.last_sent = Instant::now();
                        }
                    }
                }
                message = ws.next() => {
                    liveness.last_received = Instant::now();
                    match message {
                        Some(Ok(Message::Text(text))) => self.handle_data(text.as_bytes(), &mut liveness),
                        Some(Ok(Message::Binary(data))) => self.handle_data(&data, &mut liveness),
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "Broker closed the socket");
                            return Ok(());
                        }
                        Some(Err(error)) => return Err(error.into()),
                        None => return Ok(()),
                    }
                }
                _ = timer => {
                    let now = Instant::now();
                    if let Some(incoming) = liveness.heartbeats.incoming {
                        if now.duration_since(liveness.last_received) >= incoming * INCOMING_GRACE_FACTOR {
                            let _ = ws.close(None).await;
                            return Err(Error::Transport(format!(
                                "no data from broker for {} ms",
                                now.duration_since(liveness.last_received).as_millis()
                            )));
                        }
                    }
                    if let Some(outgoing) = liveness.heartbeats.outgoing {
                        if now.duration_since(liveness.last_sent) >= outgoing {
                            trace!("Sending heart-beat");
                            ws.send(Message::Text("\n".into())).await?;
                            liveness.last_sent = now;
                        }
                    }
                }
            }
        }
    }

    /// Opens the socket, unless the session is deactivated first.
    async fn open_socket(&mut self) -> Result<Option<WsStream>> {
        let request = self.endpoint.as_str().into_client_request()?;
        let connect = connect_async(request);
        tokio::pin!(connect);
        loop {
            tokio::select! {
                result = &mut connect => {
                    let (ws, _response) = result?;
                    return Ok(Some(ws));
                }
                command = self.command_rx.recv() => match command {
                    Some(SessionCommand::Disconnect) | None => return Ok(None),
                    Some(other) => debug!(?other, "Ignoring command before the socket opened"),
                }
            }
        }
    }

    async fn close_gracefully(&self, ws: &mut WsStream) {
        if self.shared.connected.swap(false, Ordering::AcqRel) {
            let _ = ws.send(to_message(&StompFrame::new(command::DISCONNECT))).await;
        }
        let _ = ws.close(None).await;
        info!("WebSocket session deactivated");
    }

    fn frame_for(command: SessionCommand) -> StompFrame {
        match command {
            SessionCommand::Subscribe { id, destination } => StompFrame::new(command::SUBSCRIBE)
                .header("id", id)
                .header("destination", destination)
                .header("ack", "auto"),
            SessionCommand::Unsubscribe { id } => {
                StompFrame::new(command::UNSUBSCRIBE).header("id", id)
            }
            SessionCommand::Send(message) => {
                let mut frame =
                    StompFrame::new(command::SEND).header("destination", message.destination);
                for (name, value) in message.headers {
                    if name != "destination" {
                        frame = frame.header(name, value);
                    }
                }
                frame.with_body(message.body)
            }
            SessionCommand::Disconnect => StompFrame::new(command::DISCONNECT),
        }
    }

    fn handle_data(&self, data: &[u8], liveness: &mut Liveness) {
        let frames = match StompFrame::decode_all(data) {
            Ok(frames) => frames,
            Err(error) => {
                warn!(%error, "Dropping undecodable data from broker");
                return;
            }
        };
        if frames.is_empty() {
            trace!("Received heart-beat");
        }
        for frame in frames {
            self.handle_frame(frame, liveness);
        }
    }

    fn handle_frame(&self, frame: StompFrame, liveness: &mut Liveness) {
        match frame.command.as_str() {
            command::CONNECTED => {
                liveness.heartbeats = negotiate(&self.options, frame.get_header("heart-beat"));
                self.shared.connected.store(true, Ordering::Release);
                info!(
                    version = frame.get_header("version").unwrap_or("1.2"),
                    outgoing_ms = liveness.heartbeats.outgoing.map(|d| d.as_millis() as u64),
                    incoming_ms = liveness.heartbeats.incoming.map(|d| d.as_millis() as u64),
                    "Broker accepted session"
                );
                let _ = self.options.events.send(SessionEvent::Connected);
            }
            command::MESSAGE => {
                let Some(id) = frame.get_header("subscription") else {
                    warn!("MESSAGE frame without subscription header");
                    return;
                };
                // Clone the handler out so no map guard is held while it runs.
                let handler = self.shared.handlers.get(id).map(|entry| entry.value().clone());
                let Some(handler) = handler else {
                    debug!(subscription = id, "Message for unknown subscription");
                    return;
                };
                let mut headers = Headers::new();
                for (name, value) in &frame.headers {
                    headers.entry(name.clone()).or_insert_with(|| value.clone());
                }
                handler(InboundFrame {
                    destination: frame.get_header("destination").unwrap_or_default().to_string(),
                    headers,
                    body: frame.body_text(),
                });
            }
            command::ERROR => {
                let error = super::ErrorFrame {
                    message: frame.get_header("message").map(str::to_string),
                    body: frame.body_text(),
                };
                warn!(reason = %error.reason(), "Broker sent ERROR frame");
                let _ = self.options.events.send(SessionEvent::Error(error));
            }
            command::RECEIPT => {
                trace!(receipt = ?frame.get_header("receipt-id"), "Receipt");
            }
            other => debug!(command = other, "Ignoring unexpected frame"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(incoming_ms: u64, outgoing_ms: u64) -> SessionOptions {
        let (events, _rx) = mpsc::unbounded_channel();
        SessionOptions {
            headers: Headers::new(),
            heartbeat_incoming: Duration::from_millis(incoming_ms),
            heartbeat_outgoing: Duration::from_millis(outgoing_ms),
            events,
        }
    }

    #[test]
    fn heartbeat_header_parsing() {
        assert_eq!(parse_heartbeat_header(Some("10000,5000")), (10000, 5000));
        assert_eq!(parse_heartbeat_header(Some(" 0 , 20 ")), (0, 20));
        assert_eq!(parse_heartbeat_header(Some("garbage")), (0, 0));
        assert_eq!(parse_heartbeat_header(None), (0, 0));
    }

    #[test]
    fn heartbeats_take_the_larger_interval_per_direction() {
        let negotiated = negotiate(&options(4000, 4000), Some("10000,2000"));
        assert_eq!(negotiated.outgoing, Some(Duration::from_millis(4000)));
        assert_eq!(negotiated.incoming, Some(Duration::from_millis(10000)));
    }

    #[test]
    fn heartbeats_are_disabled_when_either_side_declines() {
        let negotiated = negotiate(&options(4000, 4000), Some("0,0"));
        assert_eq!(negotiated, Heartbeats::default());

        let negotiated = negotiate(&options(0, 4000), Some("5000,5000"));
        assert_eq!(negotiated.incoming, None);
        assert_eq!(negotiated.outgoing, Some(Duration::from_millis(5000)));
    }

    #[test]
    fn send_frame_carries_caller_headers_but_not_a_second_destination() {
        let mut headers = Headers::new();
        headers.insert("priority".into(), "9".into());
        headers.insert("destination".into(), "/elsewhere".into());
        let frame = SessionTask::frame_for(SessionCommand::Send(OutboundMessage {
            destination: "/app/orders".into(),
            body: "{}".into(),
            headers,
        }));
        assert_eq!(frame.command, "SEND");
        assert_eq!(frame.get_header("destination"), Some("/app/orders"));
        assert_eq!(frame.get_header("priority"), Some("9"));
        assert_eq!(
            frame.headers.iter().filter(|(k, _)| k == "destination").count(),
            1
        );
    }

    #[tokio::test]
    async fn subscribe_and_publish_require_a_negotiated_session() {
        let (events, _rx) = mpsc::unbounded_channel();
        let session = WebSocketTransport::new()
            .open(
                "ws://127.0.0.1:9/ws",
                SessionOptions {
                    headers: Headers::new(),
                    heartbeat_incoming: Duration::ZERO,
                    heartbeat_outgoing: Duration::ZERO,
                    events,
                },
            )
            .unwrap();

        assert!(!session.is_connected());
        assert!(matches!(
            session.subscribe("/topic/a", Arc::new(|_: InboundFrame| {})),
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            session.publish(OutboundMessage {
                destination: "/topic/a".into(),
                body: String::new(),
                headers: Headers::new(),
            }),
            Err(Error::NotConnected)
        ));
        session.deactivate();
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        let (events, _rx) = mpsc::unbounded_channel();
        let result = WebSocketTransport::new().open(
            "not a url",
            SessionOptions {
                headers: Headers::new(),
                heartbeat_incoming: Duration::ZERO,
                heartbeat_outgoing: Duration::ZERO,
                events,
            },
        );
        assert!(matches!(result, Err(Error::InvalidEndpoint(_))));
    }
}
