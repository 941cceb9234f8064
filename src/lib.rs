#![deny(clippy::expect_used, clippy::unwrap_used)]

//! A resilient publish/subscribe client for a STOMP message broker.
//! 面向 STOMP 消息代理的弹性发布/订阅客户端。
//!
//! One [`ConnectionManager`] owns the single broker session, tracks the
//! [`ConnectionState`], keeps at most one subscription per destination and
//! reconnects with linear backoff after an unexpected drop. A [`Binding`]
//! exposes the manager to independent consumers and cleans up after them.
//!
//! 一个 [`ConnectionManager`] 拥有唯一的代理会话，跟踪 [`ConnectionState`]，每个目的地最多
//! 保留一个订阅，并在意外断开后以线性退避重连。[`Binding`] 将管理器暴露给各个独立的使用者，
//! 并在其停止使用时完成清理。

pub mod binding;
pub mod config;
pub mod credentials;
pub mod error;
pub mod manager;
pub mod payload;
pub mod state;
pub mod transport;

mod registry;
mod retry;
mod testing;

pub use binding::{Binding, BindingOptions, DestinationSubscriptions};
pub use config::Config;
pub use credentials::{CredentialSource, CredentialStore, NoCredentials, StaticCredentials};
pub use error::{Error, Result};
pub use manager::{ConnectionManager, Unsubscribe, WeakConnectionManager};
pub use payload::Payload;
pub use state::{ConnectionState, ListenerHandle};
pub use transport::{Headers, WebSocketTransport};
