//! Single-flight cancellation.
//!
//! A [`CancellationCoordinator`] holds at most one current
//! [`CancellationToken`]. Starting a new operation cancels whatever token was
//! current before handing out a fresh one, so a long-lived stream started
//! earlier can notice that it has been superseded.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, MutexGuard,
};

use tokio::sync::Notify;
use tracing::debug;

type Listener = Box<dyn FnOnce() + Send>;

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

struct Inner {
    id: u64,
    cancelled: AtomicBool,
    listeners: Mutex<Vec<Listener>>,
    notify: Notify,
}

/// Handle for one in-flight operation's right to be cancelled.
///
/// Clones share state. The flag only ever goes from `false` to `true`.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
                cancelled: AtomicBool::new(false),
                listeners: Mutex::new(Vec::new()),
                notify: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Cancels the token and runs its listeners on the calling thread.
    /// Cancelling an already cancelled token does nothing.
    pub fn cancel(&self) {
        if let Some(listeners) = self.trip() {
            Self::fire(listeners);
        }
    }

    /// Registers a listener that runs once when the token is cancelled. If the
    /// token is already cancelled the listener runs immediately.
    pub fn on_cancel<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut listeners = lock(&self.inner.listeners);
        if self.is_cancelled() {
            drop(listeners);
            listener();
            return;
        }
        listeners.push(Box::new(listener));
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    // Flips the flag and detaches the listeners without running them, so a
    // caller holding another lock can fire them after releasing it.
    fn trip(&self) -> Option<Vec<Listener>> {
        let mut listeners = lock(&self.inner.listeners);
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return None;
        }
        let taken = std::mem::take(&mut *listeners);
        drop(listeners);
        self.inner.notify.notify_waiters();
        debug!(target: "chatstream::cancel", "token {} cancelled", self.inner.id);
        Some(taken)
    }

    fn fire(listeners: Vec<Listener>) {
        for l in listeners {
            l();
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for CancellationToken {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for CancellationToken {}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("id", &self.inner.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Owns the single current token. Share it behind an `Arc` when several
/// callers need to coordinate.
#[derive(Default)]
pub struct CancellationCoordinator {
    current: Mutex<Option<CancellationToken>>,
}

impl CancellationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no operation is current.
    pub fn should_abort(&self) -> bool {
        lock(&self.current).is_none()
    }

    /// Cancels the current token, if any, and installs a fresh one.
    ///
    /// The previous token is marked cancelled before the new one is stored;
    /// its listeners run after the slot lock is released and before this
    /// returns.
    pub fn start_new_operation(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let fired = {
            let mut slot = lock(&self.current);
            let fired = slot.as_ref().and_then(|prev| prev.trip());
            *slot = Some(token.clone());
            fired
        };
        if let Some(listeners) = fired {
            CancellationToken::fire(listeners);
        }
        debug!(target: "chatstream::cancel", "started operation {}", token.id());
        token
    }

    /// Cancels and clears the current token. No-op when nothing is current.
    pub fn abort_current_operation(&self) {
        let prev = lock(&self.current).take();
        if let Some(prev) = prev {
            prev.cancel();
        }
    }

    pub fn current(&self) -> Option<CancellationToken> {
        lock(&self.current).clone()
    }
}
