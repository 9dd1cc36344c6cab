use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Held while the host process must stay alive. Released explicitly or on drop.
pub struct KeepAliveGuard {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl KeepAliveGuard {
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Guard that holds nothing.
    pub fn noop() -> Self {
        Self { release: None }
    }

    pub fn release(mut self) {
        if let Some(f) = self.release.take() {
            f();
        }
    }
}

impl Drop for KeepAliveGuard {
    fn drop(&mut self) {
        if let Some(f) = self.release.take() {
            f();
        }
    }
}

impl std::fmt::Debug for KeepAliveGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAliveGuard")
            .field("held", &self.release.is_some())
            .finish()
    }
}

pub trait KeepAlive: Send + Sync {
    fn register_keep_alive_reason(&self, key: &str) -> KeepAliveGuard;
}

/// Reference-counted reasons keyed by string. The process may exit once
/// [`KeepAliveRegistry::is_held`] is false.
#[derive(Clone, Default)]
pub struct KeepAliveRegistry {
    reasons: Arc<Mutex<HashMap<String, usize>>>,
}

impl KeepAliveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.reasons.lock().map(|r| !r.is_empty()).unwrap_or(false)
    }

    pub fn count(&self, key: &str) -> usize {
        self.reasons
            .lock()
            .ok()
            .and_then(|r| r.get(key).copied())
            .unwrap_or(0)
    }

    /// Active reason keys, sorted.
    pub fn reasons(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .reasons
            .lock()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

impl KeepAlive for KeepAliveRegistry {
    fn register_keep_alive_reason(&self, key: &str) -> KeepAliveGuard {
        if let Ok(mut reasons) = self.reasons.lock() {
            *reasons.entry(key.to_string()).or_insert(0) += 1;
        }
        debug!("Keep-alive reason acquired: {}", key);
        let reasons = self.reasons.clone();
        let key = key.to_string();
        KeepAliveGuard::new(move || {
            if let Ok(mut reasons) = reasons.lock()
                && let Some(count) = reasons.get_mut(&key)
            {
                *count -= 1;
                if *count == 0 {
                    reasons.remove(&key);
                }
            }
            debug!("Keep-alive reason released: {}", key);
        })
    }
}
