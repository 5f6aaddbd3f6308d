//! tunbridge: TUN-to-Transport Packet Bridge
//!
//! Main entry point. Initializes the global allocator, sets up logging,
//! loads the session configuration and runs the bridge until Ctrl-C.
//!
//! Usage: `tunbridge [CONFIG.toml]`

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use tunbridge_core::{
    BridgeConfig, BridgeService, Capabilities, LogObserver, NetTransportFactory, NoopProtector,
    TunProvisioner,
};

#[cfg(target_os = "linux")]
mod linux_tun;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => BridgeConfig::load(&path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        None => {
            info!("No configuration given, using defaults");
            BridgeConfig::default()
        }
    };

    info!("tunbridge starting...");
    info!("Session '{}' to {}", config.session_name, config.remote);

    let caps = Capabilities {
        transports: Arc::new(NetTransportFactory::default()),
        provisioner: provisioner(),
        protector: Arc::new(NoopProtector),
        observer: Arc::new(LogObserver::new(config.session_name.clone())),
    };

    let mut service = BridgeService::new(caps);
    service.start(config).context("Failed to start bridge")?;

    // Stop on Ctrl-C, or exit once the worker gives up by itself.
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, stopping bridge");
                service.stop();
                break;
            }
            _ = ticker.tick() => {
                if !service.is_running() {
                    break;
                }
            }
        }
    }

    // A worker blocked in connect only notices the stop afterwards.
    let end = tokio::task::spawn_blocking(move || service.join())
        .await
        .context("Bridge worker join failed")?;
    if let Some(end) = end {
        info!("Bridge finished: {:?}", end);
    }

    info!("tunbridge shutting down");
    Ok(())
}

#[cfg(target_os = "linux")]
fn provisioner() -> Arc<dyn TunProvisioner> {
    Arc::new(linux_tun::LinuxTunProvisioner)
}

#[cfg(not(target_os = "linux"))]
fn provisioner() -> Arc<dyn TunProvisioner> {
    use tunbridge_core::{BridgeError, TunDevice};

    struct Unsupported;

    impl TunProvisioner for Unsupported {
        fn establish(&self, _config: &BridgeConfig) -> Result<Box<dyn TunDevice>, BridgeError> {
            Err(BridgeError::Provision(
                "TUN interfaces are only supported on Linux".to_string(),
            ))
        }
    }

    Arc::new(Unsupported)
}
