//! Access token sources.
//!
//! The client reads the current token when it builds a join frame. A provider
//! that also exposes a change stream gets every new token pushed to subscribed
//! channels as an `access_token` frame.

use std::fmt;
use tokio::sync::watch;

/// Source of the access token sent on join.
pub trait AccessTokenProvider: Send + Sync {
    /// The token to use right now.
    fn current_access_token(&self) -> Option<String>;

    /// Stream of token changes, if the provider has one.
    fn token_changes(&self) -> Option<watch::Receiver<Option<String>>> {
        None
    }
}

/// A fixed token.
#[derive(Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    /// Create a provider that always returns `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StaticToken")
            .field(&self.0.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl AccessTokenProvider for StaticToken {
    fn current_access_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// A token that can be rotated at runtime.
#[derive(Debug)]
pub struct TokenWatch {
    tx: watch::Sender<Option<String>>,
}

impl TokenWatch {
    /// Create a provider holding `initial`.
    #[must_use]
    pub fn new(initial: Option<String>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Replace the token and notify followers.
    pub fn set(&self, token: Option<String>) {
        self.tx.send_replace(token);
    }
}

impl AccessTokenProvider for TokenWatch {
    fn current_access_token(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    fn token_changes(&self) -> Option<watch::Receiver<Option<String>>> {
        Some(self.tx.subscribe())
    }
}
