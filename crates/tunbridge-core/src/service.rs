//! Bridge service: owns the single worker thread.
//!
//! ```text
//!   start(config) ──▶ cancel previous worker (no join)
//!                 └─▶ spawn "tunbridge-<session>" ──▶ Supervisor::run
//!   stop()        ──▶ cancel current worker
//! ```
//!
//! At most one worker is tracked. A replaced worker winds down on its own
//! after seeing its cancellation; it still emits `Disconnected`.

use crate::cancel::CancelHandle;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::status::StatusEvent;
use crate::supervisor::{Capabilities, Supervisor, SupervisorEnd};
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

struct Worker {
    cancel: CancelHandle,
    handle: JoinHandle<SupervisorEnd>,
}

/// Starts and stops the bridge worker.
pub struct BridgeService {
    caps: Capabilities,
    current: Option<Worker>,
}

impl BridgeService {
    pub fn new(caps: Capabilities) -> Self {
        Self {
            caps,
            current: None,
        }
    }

    /// Start a bridge session. A running worker is cancelled first, but not
    /// waited for.
    pub fn start(&mut self, config: BridgeConfig) -> Result<(), BridgeError> {
        config.validate()?;

        if let Some(previous) = self.current.take() {
            info!("Replacing running bridge worker");
            previous.cancel.cancel();
        }

        let cancel = CancelHandle::new();
        let token = cancel.token();
        let caps = self.caps.clone();
        let name = format!("tunbridge-{}", config.session_name);

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let observer = caps.observer.clone();
                let mut supervisor = Supervisor::new(config, caps, token);
                match panic::catch_unwind(AssertUnwindSafe(|| supervisor.run())) {
                    Ok(end) => end,
                    Err(_) => {
                        error!("Bridge worker panicked");
                        observer.on_status(StatusEvent::Disconnected);
                        SupervisorEnd::GaveUp
                    }
                }
            })
            .map_err(BridgeError::Spawn)?;

        info!("Spawned worker {}", name);
        self.current = Some(Worker { cancel, handle });
        Ok(())
    }

    /// Request the current worker to stop. Returns immediately.
    pub fn stop(&mut self) {
        if let Some(worker) = &self.current {
            worker.cancel.cancel();
        }
    }

    /// Whether the tracked worker is still running.
    pub fn is_running(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    /// Wait for the tracked worker to finish.
    pub fn join(&mut self) -> Option<SupervisorEnd> {
        let worker = self.current.take()?;
        match worker.handle.join() {
            Ok(end) => Some(end),
            Err(_) => {
                warn!("Bridge worker could not be joined");
                None
            }
        }
    }
}

impl Drop for BridgeService {
    fn drop(&mut self) {
        self.stop();
    }
}
