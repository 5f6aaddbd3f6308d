//! Status events reported to whoever is watching the bridge.

use crossbeam_channel::Sender;
use std::fmt;
use tracing::info;

/// Bridge status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusEvent {
    /// A connection attempt is starting
    Connecting,
    /// Transport is up and the interface is provisioned
    Connected,
    /// The worker has exited
    Disconnected,
    /// Attempt bound reached; no more attempts
    GivingUp,
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::GivingUp => write!(f, "giving up"),
        }
    }
}

/// Receives status events. Informational only, nothing is acknowledged.
pub trait StatusObserver: Send + Sync {
    fn on_status(&self, event: StatusEvent);
}

impl StatusObserver for Sender<StatusEvent> {
    fn on_status(&self, event: StatusEvent) {
        // Nobody listening is fine.
        let _ = self.send(event);
    }
}

/// Writes every event to the log.
#[derive(Debug, Clone, Default)]
pub struct LogObserver {
    session: String,
}

impl LogObserver {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
        }
    }
}

impl StatusObserver for LogObserver {
    fn on_status(&self, event: StatusEvent) {
        info!("[{}] {}", self.session, event);
    }
}
