//! Transport layer abstraction for broker sessions.
//!
//! A [`Transport`] opens one duplex, message-oriented [`Session`] against an
//! endpoint. Opening returns immediately; whether the broker accepted the
//! session is reported later on the [`SessionOptions::events`] channel.
//!
//! 代理会话的传输层抽象。[`Transport`] 针对一个端点打开一个双工的、面向消息的
//! [`Session`]。打开操作立即返回；代理是否接受会话稍后通过
//! [`SessionOptions::events`] 通道报告。

pub mod frame;
pub mod websocket;

use crate::error::Result;
use std::{collections::BTreeMap, fmt::Debug, sync::Arc, time::Duration};
use tokio::sync::mpsc;

pub use frame::StompFrame;
pub use websocket::WebSocketTransport;

/// Frame headers, kept sorted so encoded frames are deterministic.
pub type Headers = BTreeMap<String, String>;

/// A message delivered by the broker to one of our subscriptions.
///
/// 代理投递到某个订阅的消息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// The destination the message was published to.
    /// 消息发布到的目的地。
    pub destination: String,
    /// All headers of the frame.
    /// 帧的全部头部。
    pub headers: Headers,
    /// The undecoded body.
    /// 未解码的消息体。
    pub body: String,
}

/// A message to be published to a destination.
///
/// 要发布到某个目的地的消息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub destination: String,
    pub body: String,
    pub headers: Headers,
}

/// The broker's rejection of a session, as carried by an ERROR frame.
///
/// 代理通过 ERROR 帧对会话的拒绝。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorFrame {
    /// The `message` header, if the broker sent one.
    pub message: Option<String>,
    pub body: String,
}

impl ErrorFrame {
    /// The most specific reason available: the `message` header, else the
    /// body, else a generic description.
    pub fn reason(&self) -> String {
        match &self.message {
            Some(message) if !message.is_empty() => message.clone(),
            _ if !self.body.trim().is_empty() => self.body.trim().to_string(),
            _ => "connection error".to_string(),
        }
    }
}

/// Lifecycle notifications emitted by a session.
///
/// 会话发出的生命周期通知。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The broker accepted the session.
    /// 代理接受了会话。
    Connected,
    /// The broker rejected the session or reported a protocol error.
    /// 代理拒绝了会话或报告了协议错误。
    Error(ErrorFrame),
    /// The underlying socket reported a fault.
    /// 底层套接字报告了故障。
    TransportError(String),
    /// The underlying socket closed. Always the last event of a session.
    /// 底层套接字已关闭。总是会话的最后一个事件。
    TransportClosed,
}

/// Called by the session for every message routed to a subscription.
pub type FrameHandler = Arc<dyn Fn(InboundFrame) + Send + Sync>;

/// Parameters for opening a session.
///
/// 打开会话的参数。
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Headers attached to the connect handshake (e.g. `Authorization`).
    /// 附加到连接握手的头部（例如 `Authorization`）。
    pub headers: Headers,
    /// Proposed interval at which the broker should send heart-beats.
    /// 建议代理发送心跳的间隔。
    pub heartbeat_incoming: Duration,
    /// Proposed interval at which we send heart-beats.
    /// 建议我们发送心跳的间隔。
    pub heartbeat_outgoing: Duration,
    /// Where the session reports its lifecycle events.
    /// 会话报告其生命周期事件的通道。
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

/// Opens broker sessions.
///
/// 打开代理会话。
pub trait Transport: Send + Sync + Debug + 'static {
    /// Starts opening a session. Must not block on the network.
    ///
    /// 开始打开会话。不得阻塞在网络上。
    fn open(&self, endpoint: &str, options: SessionOptions) -> Result<Arc<dyn Session>>;
}

/// One live duplex connection to the broker.
///
/// 与代理的一个活动双工连接。
pub trait Session: Send + Sync + Debug {
    /// Whether the broker has accepted the session and it is still open.
    fn is_connected(&self) -> bool;

    /// Registers `handler` for messages on `destination`.
    fn subscribe(
        &self,
        destination: &str,
        handler: FrameHandler,
    ) -> Result<Box<dyn TransportSubscription>>;

    /// Sends a message to a destination.
    fn publish(&self, message: OutboundMessage) -> Result<()>;

    /// Gracefully closes the session. Idempotent.
    fn deactivate(&self);
}

/// A transport-level subscription.
///
/// 传输层订阅。
pub trait TransportSubscription: Send + Sync + Debug {
    fn id(&self) -> &str;

    /// Cancels the subscription. Idempotent.
    fn unsubscribe(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_reason_prefers_message_header() {
        let frame = ErrorFrame {
            message: Some("Invalid token".into()),
            body: "details".into(),
        };
        assert_eq!(frame.reason(), "Invalid token");

        let frame = ErrorFrame {
            message: None,
            body: " access denied \n".into(),
        };
        assert_eq!(frame.reason(), "access denied");

        assert_eq!(ErrorFrame::default().reason(), "connection error");
    }
}
