use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::ConnectionError;

/// Seam between the client core and the host's authentication layer.
///
/// The host supplies a bearer token and a user identity; the core reads the
/// token for every request and dial, and reports expiry back exactly once so
/// the host can force a re-login. The core never refreshes tokens itself.
pub struct AuthContext {
    token: Mutex<Option<String>>,
    user_id: Mutex<Option<String>>,
    on_expired: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    expired_fired: AtomicBool,
}

impl std::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext")
            .field("has_token", &self.token.lock().unwrap().is_some())
            .field("user_id", &*self.user_id.lock().unwrap())
            .finish()
    }
}

impl Default for AuthContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthContext {
    pub fn new() -> Self {
        Self {
            token: Mutex::new(None),
            user_id: Mutex::new(None),
            on_expired: Mutex::new(None),
            expired_fired: AtomicBool::new(false),
        }
    }

    /// Install or replace the bearer token. Clears the expiry latch so a
    /// later expiry on the fresh token is reported again.
    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.lock().unwrap() = Some(token.into());
        self.expired_fired.store(false, Ordering::SeqCst);
    }

    pub fn set_user_id(&self, user_id: impl Into<String>) {
        *self.user_id.lock().unwrap() = Some(user_id.into());
    }

    pub fn user_id(&self) -> Option<String> {
        self.user_id.lock().unwrap().clone()
    }

    /// Current token, or `AuthMissing` when none is installed.
    pub fn token(&self) -> Result<String, ConnectionError> {
        self.token
            .lock()
            .unwrap()
            .clone()
            .filter(|token| !token.is_empty())
            .ok_or(ConnectionError::AuthMissing)
    }

    /// Register the callback invoked when the backend rejects the token.
    pub fn on_expired<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_expired.lock().unwrap() = Some(Box::new(callback));
    }

    /// Report token expiry to the host. Latched: repeated rejections for the
    /// same token fire the callback only once.
    pub fn notify_expired(&self) {
        if self.expired_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!("auth token rejected by server; notifying host");
        if let Some(callback) = self.on_expired.lock().unwrap().as_ref() {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_token_missing_by_default() {
        let auth = AuthContext::new();
        assert!(matches!(auth.token(), Err(ConnectionError::AuthMissing)));
    }

    #[test]
    fn test_empty_token_counts_as_missing() {
        let auth = AuthContext::new();
        auth.set_token("");
        assert!(matches!(auth.token(), Err(ConnectionError::AuthMissing)));
    }

    #[test]
    fn test_token_roundtrip() {
        let auth = AuthContext::new();
        auth.set_token("jwt-123");
        assert_eq!(auth.token().unwrap(), "jwt-123");
    }

    #[test]
    fn test_expiry_fires_once() {
        let auth = AuthContext::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        auth.on_expired(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        auth.notify_expired();
        auth.notify_expired();
        auth.notify_expired();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_new_token_rearms_expiry() {
        let auth = AuthContext::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        auth.on_expired(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        auth.notify_expired();
        auth.set_token("fresh-jwt");
        auth.notify_expired();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
