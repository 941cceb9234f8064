//! 绑定层 - 将连接管理器暴露给多个独立的使用者
//! Binding layer - exposes one connection manager to many independent consumers.
//!
//! A [`Binding`] mirrors the connection state into a `watch` channel and
//! guards the manager's operations behind that mirrored state. A
//! [`DestinationSubscriptions`] keeps one consumer's destinations subscribed
//! while the connection is up and releases them when the consumer is done.
//!
//! Any number of bindings may share one manager; they all observe the same
//! state and there is never a per-consumer connection.

mod destinations;

pub use destinations::DestinationSubscriptions;

use crate::{
    error::{Error, Result},
    manager::{ConnectionManager, Unsubscribe},
    payload::Payload,
    state::{ConnectionState, ListenerHandle},
    transport::Headers,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// How a [`Binding`] drives the shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingOptions {
    /// Connect, with a fresh credential, when the binding is activated.
    /// 激活绑定时使用最新凭证自动连接。
    pub auto_connect: bool,
    /// Disconnect when the binding is dropped.
    /// 绑定被释放时自动断开连接。
    pub auto_disconnect: bool,
}

impl Default for BindingOptions {
    fn default() -> Self {
        Self {
            auto_connect: true,
            auto_disconnect: false,
        }
    }
}

/// One consumer's view of the shared connection.
///
/// Dropping the binding is its permanent deactivation: the state listener is
/// removed and, with [`BindingOptions::auto_disconnect`], the connection is
/// closed.
///
/// 一个使用者对共享连接的视图。释放绑定即永久停用。
#[derive(Debug)]
pub struct Binding {
    manager: ConnectionManager,
    options: BindingOptions,
    state: watch::Receiver<ConnectionState>,
    listener: ListenerHandle,
}

impl Binding {
    /// Starts observing `manager`, connecting first if
    /// [`BindingOptions::auto_connect`] is set.
    pub fn activate(manager: &ConnectionManager, options: BindingOptions) -> Self {
        let (sender, state) = watch::channel(manager.state());
        let sender = Arc::new(sender);
        let mirror = sender.clone();
        let listener = manager.on_state_change(move |next| {
            mirror.send_replace(next);
        });
        // A transition between creating the channel and registering the
        // listener would otherwise be lost.
        sender.send_replace(manager.state());

        if options.auto_connect {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let manager = manager.clone();
                    handle.spawn(async move {
                        if let Err(error) = manager.reconnect().await {
                            warn!(%error, "Automatic connect failed");
                        }
                    });
                }
                Err(_) => warn!("No runtime available, skipping automatic connect"),
            }
        }

        debug!(?options, "Binding activated");
        Self {
            manager: manager.clone(),
            options,
            state,
            listener,
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// The mirrored connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// A receiver that observes every state change.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Waits until the connection is up.
    pub async fn wait_until_connected(&self) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|state| state.is_connected())
            .await
            .map(|_| ())
            .map_err(|_| Error::ChannelClosed)
    }

    pub async fn connect(&self, credential: Option<String>) -> Result<()> {
        self.manager.connect(credential).await
    }

    /// Connects with a credential read from the manager's credential source.
    pub async fn reconnect(&self) -> Result<()> {
        self.manager.reconnect().await
    }

    pub fn disconnect(&self) {
        self.manager.disconnect();
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    pub fn subscribe<F>(&self, destination: &str, callback: F) -> Result<Unsubscribe>
    where
        F: Fn(Payload) + Send + Sync + 'static,
    {
        self.ensure_connected()?;
        self.manager.subscribe(destination, callback)
    }

    pub fn subscribe_to_user<F>(
        &self,
        username: &str,
        destination: &str,
        callback: F,
    ) -> Result<Unsubscribe>
    where
        F: Fn(Payload) + Send + Sync + 'static,
    {
        self.ensure_connected()?;
        self.manager.subscribe_to_user(username, destination, callback)
    }

    pub fn send<T>(&self, destination: &str, body: &T, headers: Option<Headers>) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.ensure_connected()?;
        self.manager.send(destination, body, headers)
    }

    /// Keeps `destinations` subscribed with `callback` for as long as the
    /// returned value lives.
    pub fn subscriptions<I, S, F>(&self, destinations: I, callback: F) -> DestinationSubscriptions
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(Payload) + Send + Sync + 'static,
    {
        DestinationSubscriptions::new(&self.manager, destinations, callback)
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.listener.remove();
        if self.options.auto_disconnect {
            debug!("Binding deactivated, disconnecting");
            self.manager.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::credentials::NoCredentials;
    use crate::testing::{CountingCredentials, connected, manager_with, settle};

    const MANUAL: BindingOptions = BindingOptions {
        auto_connect: false,
        auto_disconnect: false,
    };

    #[tokio::test(start_paused = true)]
    async fn mirrors_manager_state() {
        let (manager, transport) = manager_with(Config::default(), Arc::new(NoCredentials));
        let binding = Binding::activate(&manager, MANUAL);
        let mut watch = binding.watch();
        assert_eq!(binding.state(), ConnectionState::Disconnected);

        let session = connected(&manager, &transport, None).await;
        assert!(binding.is_connected());
        assert!(watch.has_changed().unwrap());
        assert_eq!(*watch.borrow_and_update(), ConnectionState::Connected);

        session.drop_connection();
        settle().await;
        assert_eq!(binding.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_connect_uses_credential_source() {
        let credentials = Arc::new(CountingCredentials::new("token"));
        let (manager, transport) = manager_with(Config::default(), credentials.clone());

        let binding = Binding::activate(&manager, BindingOptions::default());
        settle().await;
        assert_eq!(transport.open_count(), 1);
        assert_eq!(credentials.calls(), 1);
        assert_eq!(transport.last_session().authorization(), Some("Bearer token"));

        transport.last_session().accept();
        binding.wait_until_connected().await.unwrap();
        assert!(binding.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn guards_reject_while_disconnected() {
        let (manager, transport) = manager_with(Config::default(), Arc::new(NoCredentials));
        let binding = Binding::activate(&manager, MANUAL);

        assert!(matches!(
            binding.subscribe("/topic/a", |_| {}),
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            binding.subscribe_to_user("alice", "/queue/a", |_| {}),
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            binding.send("/app/a", "hi", None),
            Err(Error::NotConnected)
        ));
        assert_eq!(transport.open_count(), 0);

        let session = connected(&manager, &transport, None).await;
        binding.send("/app/a", "hi", None).unwrap();
        let _subscription = binding.subscribe_to_user("alice", "/queue/a", |_| {}).unwrap();
        assert_eq!(session.published().len(), 1);
        assert!(manager.is_subscribed("/user/alice/queue/a"));
    }

    #[tokio::test(start_paused = true)]
    async fn drop_with_auto_disconnect_closes_connection() {
        let (manager, transport) = manager_with(Config::default(), Arc::new(NoCredentials));
        let binding = Binding::activate(
            &manager,
            BindingOptions {
                auto_connect: false,
                auto_disconnect: true,
            },
        );
        let mut watch = binding.watch();
        let session = connected(&manager, &transport, None).await;

        drop(binding);

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(session.deactivations(), 1);
        // The listener is gone along with the binding.
        watch.borrow_and_update();
        assert!(watch.changed().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn drop_without_auto_disconnect_keeps_connection() {
        let (manager, transport) = manager_with(Config::default(), Arc::new(NoCredentials));
        connected(&manager, &transport, None).await;

        let first = Binding::activate(&manager, MANUAL);
        let second = Binding::activate(&manager, MANUAL);
        assert!(first.is_connected());
        drop(first);

        assert!(manager.is_connected());
        assert!(second.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn watch_ends_on_a_disconnect_made_by_an_earlier_listener() {
        let (manager, transport) = manager_with(Config::default(), Arc::new(NoCredentials));
        let weak = manager.downgrade();
        let _closer = manager.on_state_change(move |state: ConnectionState| {
            if state != ConnectionState::Connected {
                return;
            }
            if let Some(manager) = weak.upgrade() {
                manager.disconnect();
            }
        });
        let binding = Binding::activate(&manager, MANUAL);

        let task = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect(None).await }
        });
        settle().await;
        transport.last_session().accept();
        let _ = task.await.unwrap();
        settle().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(*binding.watch().borrow(), ConnectionState::Disconnected);
        assert!(!binding.is_connected());
    }
}
