//! Cancellable per-scrape context.
//!
//! One [`ScrapeContext`] is handed to every probe of a scrape. Cancelling it
//! (explicitly, or when its deadline passes) fires every registered cancel
//! hook. Sessions register a hook around each round trip that asks the server
//! to cancel the running statement, so a blocked query returns promptly
//! instead of waiting to be polled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{ProbeError, ProbeResult};

/// Callback invoked once when the context is cancelled.
pub type CancelHook = Box<dyn Fn() + Send + Sync>;

const REASON_NONE: u8 = 0;
const REASON_CANCELLED: u8 = 1;
const REASON_DEADLINE: u8 = 2;

struct ContextInner {
    cancelled: AtomicBool,
    reason: AtomicU8,
    deadline: Option<Instant>,
    next_hook_id: AtomicU64,
    hooks: Mutex<HashMap<u64, Arc<CancelHook>>>,
}

impl ContextInner {
    fn cancel_with(&self, reason: u8) {
        if self
            .reason
            .compare_exchange(REASON_NONE, reason, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.cancelled.store(true, Ordering::SeqCst);

        // Run hooks outside the lock; a hook may block on the network.
        let hooks: Vec<Arc<CancelHook>> = match self.hooks.lock() {
            Ok(hooks) => hooks.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        };
        debug!(hooks = hooks.len(), reason, "scrape context cancelled");
        for hook in hooks {
            hook();
        }
    }
}

/// Stops the deadline watchdog when the last context handle is dropped.
struct DeadlineTimer {
    _stop: mpsc::Sender<()>,
}

/// Shared, cloneable cancellation handle for one scrape.
#[derive(Clone)]
pub struct ScrapeContext {
    inner: Arc<ContextInner>,
    _timer: Option<Arc<DeadlineTimer>>,
}

impl ScrapeContext {
    /// A context that is only cancelled explicitly.
    pub fn background() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                cancelled: AtomicBool::new(false),
                reason: AtomicU8::new(REASON_NONE),
                deadline: None,
                next_hook_id: AtomicU64::new(0),
                hooks: Mutex::new(HashMap::new()),
            }),
            _timer: None,
        }
    }

    /// A context that cancels itself once `timeout` has elapsed.
    ///
    /// A zero timeout yields a context without deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        if timeout.is_zero() {
            return Self::background();
        }

        let inner = Arc::new(ContextInner {
            cancelled: AtomicBool::new(false),
            reason: AtomicU8::new(REASON_NONE),
            deadline: Some(Instant::now() + timeout),
            next_hook_id: AtomicU64::new(0),
            hooks: Mutex::new(HashMap::new()),
        });

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let watched = inner.clone();
        let spawned = thread::Builder::new()
            .name("scrape-deadline".to_string())
            .spawn(move || {
                // Disconnected means every handle was dropped: scrape finished in time.
                if let Err(RecvTimeoutError::Timeout) = stop_rx.recv_timeout(timeout) {
                    watched.cancel_with(REASON_DEADLINE);
                }
            });
        if let Err(e) = spawned {
            debug!(error = %e, "failed to spawn deadline watchdog, relying on polling");
        }

        Self {
            inner,
            _timer: Some(Arc::new(DeadlineTimer { _stop: stop_tx })),
        }
    }

    /// Cancels the scrape and interrupts every registered in-flight call.
    pub fn cancel(&self) {
        self.inner.cancel_with(REASON_CANCELLED);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        // Covers the window before the watchdog thread wakes up.
        if let Some(deadline) = self.inner.deadline
            && Instant::now() >= deadline
        {
            self.inner.cancel_with(REASON_DEADLINE);
            return true;
        }
        false
    }

    /// Returns the cancellation error, if any.
    pub fn check(&self) -> ProbeResult<()> {
        if !self.is_cancelled() {
            return Ok(());
        }
        Err(self.cancellation_error())
    }

    /// Error describing why the context was cancelled.
    pub fn cancellation_error(&self) -> ProbeError {
        match self.inner.reason.load(Ordering::SeqCst) {
            REASON_DEADLINE => ProbeError::DeadlineExceeded,
            _ => ProbeError::Cancelled,
        }
    }

    /// Time left before the deadline, `None` without one.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Registers `hook` to run on cancellation for as long as the returned
    /// guard lives. Runs it right away if the context is already cancelled.
    pub fn register(&self, hook: CancelHook) -> CancelRegistration {
        let id = self.inner.next_hook_id.fetch_add(1, Ordering::Relaxed);
        let hook = Arc::new(hook);

        if let Ok(mut hooks) = self.inner.hooks.lock() {
            hooks.insert(id, hook.clone());
        }
        if self.inner.cancelled.load(Ordering::SeqCst) {
            hook();
        }

        CancelRegistration {
            inner: self.inner.clone(),
            id,
        }
    }
}

impl Default for ScrapeContext {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for ScrapeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScrapeContext")
            .field("cancelled", &self.inner.cancelled.load(Ordering::SeqCst))
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

/// Unregisters a cancel hook on drop.
pub struct CancelRegistration {
    inner: Arc<ContextInner>,
    id: u64,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        if let Ok(mut hooks) = self.inner.hooks.lock() {
            hooks.remove(&self.id);
        }
    }
}
