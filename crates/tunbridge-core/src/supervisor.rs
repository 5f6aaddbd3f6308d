//! Connection Supervisor
//!
//! Runs connection attempts until the bridge is stopped or gives up.
//!
//! ```text
//!   Idle -> Connecting -> Connected -> Relaying -> (next attempt)
//!                \__________________________________/
//!                              |
//!                Ended(GaveUp) | Ended(Cancelled)
//! ```
//!
//! A counter bounds the retries. Every attempt bumps it; an attempt that
//! reaches `Connected` restarts the count at itself, no matter how its
//! session ends afterwards. Once the count hits three the supervisor gives
//! up: three straight failures from the start, or a connected session
//! followed by two failures.

use crate::cancel::CancelToken;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::relay::{PacketRelay, RelayEnd, Session};
use crate::status::{StatusEvent, StatusObserver};
use crate::transport::{SocketProtector, TransportFactory};
use crate::tun::TunProvisioner;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Attempt count at which the supervisor gives up.
pub const MAX_ATTEMPTS: u32 = 3;

/// How the supervisor finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEnd {
    /// Attempt bound reached
    GaveUp,
    /// Stop requested
    Cancelled,
}

/// Supervisor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Not started
    Idle,
    /// Opening the transport and provisioning the interface
    Connecting,
    /// Transport up, interface provisioned
    Connected,
    /// Packet relay running
    Relaying,
    /// Finished
    Ended(SupervisorEnd),
}

/// External capabilities the supervisor works with.
#[derive(Clone)]
pub struct Capabilities {
    pub transports: Arc<dyn TransportFactory>,
    pub provisioner: Arc<dyn TunProvisioner>,
    pub protector: Arc<dyn SocketProtector>,
    pub observer: Arc<dyn StatusObserver>,
}

/// Retry loop around connection attempts
pub struct Supervisor {
    config: BridgeConfig,
    caps: Capabilities,
    cancel: CancelToken,
    state: SupervisorState,
    /// Attempts since the last one that reached `Connected`, that one included
    counted: u32,
    attempts: u32,
    retry_pauses: u32,
}

impl Supervisor {
    pub fn new(config: BridgeConfig, caps: Capabilities, cancel: CancelToken) -> Self {
        Self {
            config,
            caps,
            cancel,
            state: SupervisorState::Idle,
            counted: 0,
            attempts: 0,
            retry_pauses: 0,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Attempts started so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Pauses taken between attempts
    pub fn retry_pauses(&self) -> u32 {
        self.retry_pauses
    }

    /// Run until cancelled or until the failure bound is hit. Always reports
    /// `Disconnected` on the way out.
    pub fn run(&mut self) -> SupervisorEnd {
        info!("Starting bridge session '{}' to {}", self.config.session_name, self.config.remote);
        let end = self.run_attempts();
        self.state = SupervisorState::Ended(end);
        self.emit(StatusEvent::Disconnected);
        info!("Bridge session '{}' exiting ({:?})", self.config.session_name, end);
        end
    }

    fn run_attempts(&mut self) -> SupervisorEnd {
        self.counted = 0;
        loop {
            if self.cancel.is_cancelled() {
                return SupervisorEnd::Cancelled;
            }

            self.attempts += 1;
            self.state = SupervisorState::Connecting;
            self.emit(StatusEvent::Connecting);

            let reached_connected = match self.run_one_attempt() {
                Ok(reached) => reached,
                Err(BridgeError::Cancelled) => return SupervisorEnd::Cancelled,
                Err(e) => {
                    error!("Attempt {} failed: {}", self.attempts, e);
                    false
                }
            };

            if reached_connected {
                self.counted = 0;
            }
            self.counted += 1;

            if self.counted >= MAX_ATTEMPTS {
                warn!("Giving up after {} attempts without a working session", self.counted);
                self.emit(StatusEvent::GivingUp);
                return SupervisorEnd::GaveUp;
            }

            debug!(
                "Retrying in {:?} ({} of {} attempts)",
                self.config.relay.retry_delay(),
                self.counted,
                MAX_ATTEMPTS
            );
            self.retry_pauses += 1;
            if self.cancel.sleep(self.config.relay.retry_delay()).is_err() {
                return SupervisorEnd::Cancelled;
            }
        }
    }

    /// One connection attempt. `Ok(true)` once the session reached the
    /// connected state, however it ended afterwards.
    fn run_one_attempt(&mut self) -> Result<bool, BridgeError> {
        let transport = self.caps.transports.create(&self.config.remote)?;
        let mut session = Session::new(transport);

        {
            let Some(transport) = session.transport_mut() else {
                return Ok(false);
            };
            transport.connect()?;
            self.cancel.check()?;

            if !transport.protect(self.caps.protector.as_ref()) {
                return Err(BridgeError::ProtectionDenied);
            }

            // The relay reads both sides from one thread.
            transport.set_nonblocking(true)?;
        }

        let tun = self.caps.provisioner.establish(&self.config)?;
        session.attach_tun(tun);
        info!("New interface for '{}'", self.config.session_name);

        self.state = SupervisorState::Connected;
        self.emit(StatusEvent::Connected);

        self.state = SupervisorState::Relaying;
        let relay = PacketRelay::new(self.cancel.clone(), self.config.relay.idle_interval());
        let outcome = relay.run(session);
        info!("Session stats: {}", outcome.stats.format());

        match outcome.end {
            RelayEnd::Cancelled => Err(BridgeError::Cancelled),
            _ => Ok(outcome.reached_steady_state),
        }
    }

    fn emit(&self, event: StatusEvent) {
        debug!("Status: {}", event);
        self.caps.observer.on_status(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{cancel_pair, CancelHandle};
    use crate::relay::tests::{FakeTransport, FakeTun, Step};
    use crate::transport::{NoopProtector, RawSocket, Transport};
    use crate::tun::TunDevice;
    use crossbeam_channel::{unbounded, Receiver};
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex;

    /// How a scripted attempt behaves
    #[derive(Debug, Clone, Copy)]
    enum Attempt {
        /// `connect()` is refused
        ConnectFails,
        /// Connects, then the relay hits an I/O error right away
        ConnectedThenFails,
        /// Connects, then relays idle until cancelled
        ConnectedUntilCancelled,
        /// Connects but the socket cannot be protected
        ProtectDenied,
    }

    struct ScriptedFactory {
        attempts: Mutex<VecDeque<Attempt>>,
        created: Mutex<u32>,
        cancel_on_idle: Mutex<Option<Arc<CancelHandle>>>,
    }

    impl ScriptedFactory {
        fn new(script: &[Attempt]) -> Self {
            Self {
                attempts: Mutex::new(script.iter().copied().collect()),
                created: Mutex::new(0),
                cancel_on_idle: Mutex::new(None),
            }
        }

        fn created(&self) -> u32 {
            *self.created.lock().unwrap()
        }
    }

    impl TransportFactory for ScriptedFactory {
        fn create(
            &self,
            _remote: &crate::config::RemoteEndpoint,
        ) -> Result<Box<dyn Transport>, BridgeError> {
            *self.created.lock().unwrap() += 1;
            let attempt = self
                .attempts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Attempt::ConnectFails);

            let mut transport = match attempt {
                Attempt::ConnectFails => {
                    let mut t = FakeTransport::new(Vec::new());
                    t.connect_ok = false;
                    t
                }
                Attempt::ConnectedThenFails => {
                    FakeTransport::new(vec![Step::Fail(io::ErrorKind::ConnectionReset)])
                }
                Attempt::ConnectedUntilCancelled => FakeTransport::new(Vec::new()),
                Attempt::ProtectDenied => {
                    let mut t = FakeTransport::new(Vec::new());
                    t.socket = Some(0 as RawSocket);
                    t
                }
            };
            if let Attempt::ConnectedUntilCancelled = attempt {
                if let Some(handle) = self.cancel_on_idle.lock().unwrap().clone() {
                    transport.cancel_after = Some((3, handle));
                }
            }
            Ok(Box::new(transport))
        }
    }

    struct FakeProvisioner {
        established: Mutex<u32>,
    }

    impl TunProvisioner for FakeProvisioner {
        fn establish(&self, config: &BridgeConfig) -> Result<Box<dyn TunDevice>, BridgeError> {
            *self.established.lock().unwrap() += 1;
            Ok(Box::new(FakeTun::new(Vec::new(), config.packet_info)))
        }
    }

    /// Protector that only accepts sockets other than 0.
    struct DenyZero;

    impl SocketProtector for DenyZero {
        fn protect(&self, socket: RawSocket) -> bool {
            socket != 0 as RawSocket
        }
    }

    struct Harness {
        factory: Arc<ScriptedFactory>,
        provisioner: Arc<FakeProvisioner>,
        events: Receiver<StatusEvent>,
        caps: Capabilities,
    }

    fn harness(script: &[Attempt], protector: Arc<dyn SocketProtector>) -> Harness {
        let factory = Arc::new(ScriptedFactory::new(script));
        let provisioner = Arc::new(FakeProvisioner {
            established: Mutex::new(0),
        });
        let (tx, events) = unbounded();
        let caps = Capabilities {
            transports: factory.clone(),
            provisioner: provisioner.clone(),
            protector,
            observer: Arc::new(tx),
        };
        Harness {
            factory,
            provisioner,
            events,
            caps,
        }
    }

    fn fast_config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.relay.idle_interval_ms = 1;
        config.relay.retry_delay_ms = 1;
        config
    }

    fn drain(events: &Receiver<StatusEvent>) -> Vec<StatusEvent> {
        events.try_iter().collect()
    }

    #[test]
    fn test_gives_up_after_three_failures() {
        let h = harness(&[], Arc::new(NoopProtector));
        let (_handle, token) = cancel_pair();
        let mut supervisor = Supervisor::new(fast_config(), h.caps.clone(), token);

        let end = supervisor.run();

        assert_eq!(end, SupervisorEnd::GaveUp);
        assert_eq!(supervisor.attempts(), 3);
        assert_eq!(h.factory.created(), 3);
        // No pause after the last failure.
        assert_eq!(supervisor.retry_pauses(), 2);
        assert_eq!(supervisor.state(), SupervisorState::Ended(SupervisorEnd::GaveUp));
        assert_eq!(*h.provisioner.established.lock().unwrap(), 0);
        assert_eq!(
            drain(&h.events),
            vec![
                StatusEvent::Connecting,
                StatusEvent::Connecting,
                StatusEvent::Connecting,
                StatusEvent::GivingUp,
                StatusEvent::Disconnected,
            ]
        );
    }

    #[test]
    fn test_connected_session_restarts_count() {
        let h = harness(
            &[
                Attempt::ConnectFails,
                Attempt::ConnectedThenFails,
                Attempt::ConnectFails,
                Attempt::ConnectFails,
                Attempt::ConnectedThenFails,
            ],
            Arc::new(NoopProtector),
        );
        let (_handle, token) = cancel_pair();
        let mut supervisor = Supervisor::new(fast_config(), h.caps.clone(), token);

        let end = supervisor.run();

        // The connected second attempt restarts the count, so giving up
        // takes four attempts instead of three; the fifth never runs.
        assert_eq!(end, SupervisorEnd::GaveUp);
        assert_eq!(supervisor.attempts(), 4);
        assert_eq!(h.factory.created(), 4);
        assert_eq!(supervisor.retry_pauses(), 3);
        assert_eq!(*h.provisioner.established.lock().unwrap(), 1);
        assert_eq!(
            drain(&h.events),
            vec![
                StatusEvent::Connecting,
                StatusEvent::Connecting,
                StatusEvent::Connected,
                StatusEvent::Connecting,
                StatusEvent::Connecting,
                StatusEvent::GivingUp,
                StatusEvent::Disconnected,
            ]
        );
    }

    #[test]
    fn test_keeps_going_while_sessions_connect() {
        let h = harness(
            &[
                Attempt::ConnectedThenFails,
                Attempt::ConnectedThenFails,
                Attempt::ConnectedThenFails,
                Attempt::ConnectedThenFails,
            ],
            Arc::new(NoopProtector),
        );
        let (_handle, token) = cancel_pair();
        let mut supervisor = Supervisor::new(fast_config(), h.caps.clone(), token);

        assert_eq!(supervisor.run(), SupervisorEnd::GaveUp);
        // Four working sessions, then the default script fails twice more.
        assert_eq!(supervisor.attempts(), 6);
        assert_eq!(*h.provisioner.established.lock().unwrap(), 4);
    }

    #[test]
    fn test_protection_denial_counts_as_failure() {
        let h = harness(
            &[
                Attempt::ProtectDenied,
                Attempt::ProtectDenied,
                Attempt::ProtectDenied,
            ],
            Arc::new(DenyZero),
        );
        let (_handle, token) = cancel_pair();
        let mut supervisor = Supervisor::new(fast_config(), h.caps.clone(), token);

        assert_eq!(supervisor.run(), SupervisorEnd::GaveUp);
        assert_eq!(supervisor.attempts(), 3);
        assert_eq!(*h.provisioner.established.lock().unwrap(), 0);
    }

    #[test]
    fn test_cancel_during_relay_stops_supervisor() {
        let h = harness(&[Attempt::ConnectedUntilCancelled], Arc::new(NoopProtector));
        let (handle, token) = cancel_pair();
        *h.factory.cancel_on_idle.lock().unwrap() = Some(Arc::new(handle));
        let mut supervisor = Supervisor::new(fast_config(), h.caps.clone(), token);

        let end = supervisor.run();

        assert_eq!(end, SupervisorEnd::Cancelled);
        assert_eq!(supervisor.attempts(), 1);
        assert_eq!(supervisor.retry_pauses(), 0);
        assert_eq!(
            drain(&h.events),
            vec![
                StatusEvent::Connecting,
                StatusEvent::Connected,
                StatusEvent::Disconnected,
            ]
        );
    }

    #[test]
    fn test_cancel_during_retry_pause() {
        let h = harness(&[], Arc::new(NoopProtector));
        let (handle, token) = cancel_pair();
        let mut config = fast_config();
        config.relay.retry_delay_ms = 60_000;
        let mut supervisor = Supervisor::new(config, h.caps.clone(), token);

        let canceller = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            handle.cancel();
        });
        let started = std::time::Instant::now();
        let end = supervisor.run();
        canceller.join().unwrap();

        assert_eq!(end, SupervisorEnd::Cancelled);
        assert_eq!(supervisor.attempts(), 1);
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        assert_eq!(drain(&h.events).last(), Some(&StatusEvent::Disconnected));
    }

    #[test]
    fn test_cancelled_before_first_attempt() {
        let h = harness(&[], Arc::new(NoopProtector));
        let (handle, token) = cancel_pair();
        handle.cancel();
        let mut supervisor = Supervisor::new(fast_config(), h.caps.clone(), token);

        assert_eq!(supervisor.run(), SupervisorEnd::Cancelled);
        assert_eq!(supervisor.attempts(), 0);
        assert_eq!(drain(&h.events), vec![StatusEvent::Disconnected]);
    }
}
