//! 定义了库中所有可能的错误类型。
//! Defines all possible error types in the library.

use thiserror::Error;

/// The primary error type for the messaging client.
/// 消息客户端的主要错误类型。
#[derive(Debug, Error)]
pub enum Error {
    /// The operation requires a live session, but none is connected.
    /// 操作需要一个活动会话，但当前没有已连接的会话。
    #[error("Not connected")]
    NotConnected,

    /// The broker rejected the connection handshake.
    /// 代理拒绝了连接握手。
    #[error("Connection negotiation failed: {reason}")]
    Negotiation { reason: String },

    /// A lower-level socket fault.
    /// 底层套接字故障。
    #[error("Transport error: {0}")]
    Transport(String),

    /// The session closed before the pending operation could complete.
    /// 会话在挂起操作完成之前关闭。
    #[error("Connection closed")]
    ConnectionClosed,

    /// An internal channel for communication between tasks was closed unexpectedly.
    /// 用于任务间通信的内部通道意外关闭。
    #[error("Internal channel is broken")]
    ChannelClosed,

    /// The configured endpoint could not be turned into a WebSocket request.
    /// 配置的端点无法转换为 WebSocket 请求。
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// A received frame was malformed and could not be decoded.
    /// 接收到的帧格式错误，无法解码。
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// A configuration value was present but malformed.
    /// 配置值存在但格式错误。
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// An outbound body could not be serialized.
    /// 出站消息体无法序列化。
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A specialized `Result` type for this library.
/// 本库专用的 `Result` 类型。
pub type Result<T> = std::result::Result<T, Error>;

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind;
        match err {
            Error::NotConnected => ErrorKind::NotConnected.into(),
            Error::Negotiation { reason } => {
                std::io::Error::new(ErrorKind::PermissionDenied, reason)
            }
            Error::Transport(msg) => std::io::Error::other(msg),
            Error::ConnectionClosed => ErrorKind::ConnectionReset.into(),
            Error::ChannelClosed => ErrorKind::BrokenPipe.into(),
            Error::InvalidEndpoint(msg) | Error::Config(msg) => {
                std::io::Error::new(ErrorKind::InvalidInput, msg)
            }
            Error::InvalidFrame(msg) => std::io::Error::new(ErrorKind::InvalidData, msg),
            Error::Serialization(e) => std::io::Error::new(ErrorKind::InvalidData, e),
        }
    }
}
