//! Injectable holder for the client's single concurrency token.

use std::sync::{Arc, RwLock};

use kaji_core::ConcurrencyToken;

/// Shared, cloneable handle to the last-observed team-state version.
///
/// Clones share one slot; a fresh [`TokenStore::new`] is fully independent.
#[derive(Debug, Clone, Default)]
pub struct TokenStore {
    inner: Arc<RwLock<Option<ConcurrencyToken>>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<ConcurrencyToken>) -> Self {
        let store = Self::new();
        store.set(token.into());
        store
    }

    pub fn get(&self) -> Option<ConcurrencyToken> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set(&self, token: ConcurrencyToken) {
        let mut slot = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(token);
    }

    pub fn clear(&self) {
        let mut slot = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = None;
    }

    pub fn is_empty(&self) -> bool {
        self.get().is_none()
    }
}
