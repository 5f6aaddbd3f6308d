//! Cooperative cancellation for the bridge worker.
//!
//! A [`CancelHandle`] is kept by whoever started the worker; the worker gets
//! a [`CancelToken`] and checks it at its suspension points: the top of each
//! relay iteration, the idle sleep, and the pause between attempts.
//!
//! Sleeping is a `recv_timeout` on a zero-capacity channel that nobody ever
//! sends on. Cancelling drops the only sender, so every sleeping token wakes
//! up immediately with `Disconnected`.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Returned from a suspension point once a stop was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Owner side of a cancellation pair. Dropping it cancels.
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    wake: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

/// Worker side of a cancellation pair.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    rx: Receiver<()>,
}

/// Create a linked handle/token pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let handle = CancelHandle::new();
    let token = handle.token();
    (handle, token)
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            wake: Mutex::new(Some(tx)),
            rx,
        }
    }

    /// Another token observing this handle.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            flag: self.flag.clone(),
            rx: self.rx.clone(),
        }
    }

    /// Request cancellation. Idempotent, never blocks.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let mut wake = match self.wake.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        wake.take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once a stop was requested.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early if cancelled.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        self.check()?;
        match self.rx.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => Ok(()),
            // Nothing is ever sent, so anything else means the sender is gone.
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Err(Cancelled),
        }
    }
}
