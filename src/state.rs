//! Defines the client's connection state and the listeners notified when it changes.
//!
//! 定义客户端的连接状态以及状态变化时被通知的监听器。

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::trace;

/// The state of the client's single logical connection.
/// 客户端唯一逻辑连接的状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No session exists, or the last one was closed.
    /// 不存在会话，或上一个会话已关闭。
    #[default]
    Disconnected,

    /// A session has been opened and is negotiating with the broker.
    /// 会话已打开，正在与代理协商。
    Connecting,

    /// The broker accepted the session; subscribe and publish are allowed.
    /// 代理已接受会话；允许订阅和发布。
    Connected,

    /// Negotiation failed or the socket reported a fault.
    /// 协商失败或套接字报告了故障。
    Error,
}

impl ConnectionState {
    /// Returns `true` only for [`ConnectionState::Connected`].
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    /// 获取状态的字符串表示
    /// Gets the string representation of the state
    pub fn name(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Error => "ERROR",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 状态监听器类型定义
/// State listener type definition
pub type StateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// An ordered registry of state listeners.
///
/// [`notify`](Self::notify) invokes listeners synchronously, in registration
/// order. The registry lock is not held while a listener runs, so a listener
/// may call back into the client.
///
/// 有序的状态监听器注册表。`notify` 按注册顺序同步调用监听器。
#[derive(Default)]
pub struct StateListeners {
    entries: Mutex<Vec<(u64, StateListener)>>,
    next_id: AtomicU64,
}

impl fmt::Debug for StateListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateListeners")
            .field("count", &self.len())
            .finish()
    }
}

impl StateListeners {
    /// 注册监听器
    /// Registers a listener and returns the handle that removes it.
    pub fn add(self: &Arc<Self>, listener: StateListener) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        ListenerHandle {
            listeners: Arc::downgrade(self),
            id,
            removed: AtomicBool::new(false),
        }
    }

    fn remove(&self, id: u64) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(entry_id, _)| *entry_id != id);
    }

    /// Delivers `state` to every registered listener.
    pub fn notify(&self, state: ConnectionState) {
        let snapshot: Vec<StateListener> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        trace!(%state, listeners = snapshot.len(), "Broadcasting state change");
        for listener in snapshot {
            listener(state);
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes a state listener. Removing twice is a no-op.
///
/// 移除状态监听器。重复移除不产生任何效果。
#[derive(Debug)]
pub struct ListenerHandle {
    listeners: Weak<StateListeners>,
    id: u64,
    removed: AtomicBool,
}

impl ListenerHandle {
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listeners_run_in_registration_order() {
        let listeners = Arc::new(StateListeners::default());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = seen.clone();
        let _a = listeners.add(Arc::new(move |s: ConnectionState| first.lock().unwrap().push(("a", s))));
        let second = seen.clone();
        let _b = listeners.add(Arc::new(move |s: ConnectionState| second.lock().unwrap().push(("b", s))));

        listeners.notify(ConnectionState::Connecting);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("a", ConnectionState::Connecting),
                ("b", ConnectionState::Connecting)
            ]
        );
    }

    #[test]
    fn removed_listener_is_not_called_and_remove_is_idempotent() {
        let listeners = Arc::new(StateListeners::default());
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let handle = listeners.add(Arc::new(move |_: ConnectionState| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        listeners.notify(ConnectionState::Connected);
        handle.remove();
        handle.remove();
        listeners.notify(ConnectionState::Disconnected);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(listeners.is_empty());
    }

    #[test]
    fn listener_may_register_another_listener_while_notified() {
        let listeners = Arc::new(StateListeners::default());
        let registry = listeners.clone();
        let handles = Arc::new(Mutex::new(Vec::new()));
        let sink = handles.clone();
        let _outer = listeners.add(Arc::new(move |_: ConnectionState| {
            let handle = registry.add(Arc::new(|_: ConnectionState| {}));
            sink.lock().unwrap().push(handle);
        }));

        listeners.notify(ConnectionState::Connected);
        assert_eq!(listeners.len(), 2);
    }

    #[test]
    fn state_names() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::Connected.to_string(), "CONNECTED");
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Error.is_connected());
    }
}
