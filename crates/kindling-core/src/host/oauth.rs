//! OAuth token capability.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::{ExtensionError, Result};

/// Access tokens for third-party providers, obtained by the host.
#[async_trait::async_trait]
pub trait OAuthTokens: Send + Sync {
    /// Current access token for `provider`.
    async fn access_token(&self, provider: &str) -> Result<String>;

    /// Providers the host holds tokens for.
    fn providers(&self) -> Vec<String>;
}

/// Fixed token table, useful for tests and single-user hosts.
#[derive(Debug, Default)]
pub struct StaticTokens {
    tokens: RwLock<HashMap<String, String>>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(self, provider: impl Into<String>, token: impl Into<String>) -> Self {
        self.tokens.write().insert(provider.into(), token.into());
        self
    }

    /// Replace the token for a provider, e.g. after a refresh.
    pub fn set_token(&self, provider: impl Into<String>, token: impl Into<String>) {
        self.tokens.write().insert(provider.into(), token.into());
    }
}

#[async_trait::async_trait]
impl OAuthTokens for StaticTokens {
    async fn access_token(&self, provider: &str) -> Result<String> {
        self.tokens
            .read()
            .get(provider)
            .cloned()
            .ok_or_else(|| ExtensionError::Other(format!("no access token for provider '{}'", provider)))
    }

    fn providers(&self) -> Vec<String> {
        let mut providers: Vec<_> = self.tokens.read().keys().cloned().collect();
        providers.sort();
        providers
    }
}
