//! Where the bearer token for a new session comes from.
//!
//! The client asks its [`CredentialSource`] on every connection attempt,
//! including automatic retries, so a token replaced in the meantime is used
//! by the next attempt.
//!
//! 新会话的 bearer 令牌来源。客户端在每次连接尝试（包括自动重试）时都会查询
//! [`CredentialSource`]，因此期间被替换的令牌会在下一次尝试中生效。

use async_trait::async_trait;
use std::sync::{PoisonError, RwLock};

/// A source of the current bearer token.
#[async_trait]
pub trait CredentialSource: Send + Sync + 'static {
    /// Returns the token to present, or `None` to connect unauthenticated.
    async fn credential(&self) -> Option<String>;
}

/// Always connects without credentials.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

#[async_trait]
impl CredentialSource for NoCredentials {
    async fn credential(&self) -> Option<String> {
        None
    }
}

/// A fixed token.
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub String);

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn credential(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// An in-memory, replaceable token, e.g. updated by a login flow or a token
/// refresh while the client keeps running.
///
/// 内存中可替换的令牌，例如在客户端运行期间由登录流程或令牌刷新更新。
#[derive(Debug, Default)]
pub struct CredentialStore {
    token: RwLock<Option<String>>,
}

impl CredentialStore {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    pub fn set(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    pub fn clear(&self) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn get(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl CredentialSource for CredentialStore {
    async fn credential(&self) -> Option<String> {
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_reflects_latest_token() {
        let store = CredentialStore::default();
        assert_eq!(store.credential().await, None);

        store.set("first");
        assert_eq!(store.credential().await.as_deref(), Some("first"));

        store.set("refreshed");
        assert_eq!(store.credential().await.as_deref(), Some("refreshed"));

        store.clear();
        assert_eq!(store.credential().await, None);
    }

    #[tokio::test]
    async fn fixed_sources() {
        assert_eq!(NoCredentials.credential().await, None);
        assert_eq!(
            StaticCredentials("abc".into()).credential().await.as_deref(),
            Some("abc")
        );
    }
}
