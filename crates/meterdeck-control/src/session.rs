use meterdeck_core::ControlError;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    SignedIn,
    Anonymous,
    /// The credential was rejected; the login surface must take over.
    LoginRequired,
}

struct SessionInner {
    credential: Option<String>,
    state: SessionState,
}

pub struct Session {
    inner: Mutex<SessionInner>,
    state_tx: watch::Sender<SessionState>,
    teardowns: AtomicU64,
}

impl Session {
    pub fn new(credential: Option<String>) -> Self {
        let credential = credential.filter(|value| !value.trim().is_empty());
        let state = if credential.is_some() {
            SessionState::SignedIn
        } else {
            SessionState::Anonymous
        };
        let (state_tx, _) = watch::channel(state);
        Self {
            inner: Mutex::new(SessionInner { credential, state }),
            state_tx,
            teardowns: AtomicU64::new(0),
        }
    }

    pub fn anonymous() -> Self {
        Self::new(None)
    }

    pub fn credential(&self) -> Option<String> {
        self.lock().credential.clone()
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn teardown_count(&self) -> u64 {
        self.teardowns.load(Ordering::SeqCst)
    }

    pub fn sign_in(&self, credential: impl Into<String>) {
        let credential = credential.into();
        {
            let mut inner = self.lock();
            inner.credential = Some(credential);
            inner.state = SessionState::SignedIn;
        }
        self.state_tx.send_replace(SessionState::SignedIn);
        info!(event = "session_signed_in");
    }

    /// Drops the credential and raises the login-required signal. Only the first call of a
    /// signed-in period tears down; later callers get `false`.
    pub fn invalidate(&self) -> bool {
        {
            let mut inner = self.lock();
            if inner.state == SessionState::LoginRequired {
                return false;
            }
            inner.credential = None;
            inner.state = SessionState::LoginRequired;
        }
        let count = self.teardowns.fetch_add(1, Ordering::SeqCst) + 1;
        self.state_tx.send_replace(SessionState::LoginRequired);
        warn!(event = "session_invalidated", teardowns = count);
        true
    }

    /// Routes a `401` outcome into the teardown; other outcomes pass through untouched.
    pub fn screen<T>(&self, result: Result<T, ControlError>) -> Result<T, ControlError> {
        if matches!(result, Err(ControlError::Unauthorized)) {
            self.invalidate();
        }
        result
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
