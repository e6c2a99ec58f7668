use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Initialize logging. `RUST_LOG` overrides the default INFO level.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Caller-owned stop request for the agent's run loop.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    aborted: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Trip the abort signal on Ctrl-C.
pub fn abort_on_ctrl_c(signal: AbortSignal) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Termination requested, stopping the agent loop...");
                signal.abort();
            }
            Err(e) => error!("Failed to handle termination signal: {:?}", e),
        }
    });
}

/// Unconditional device restart.
pub trait Rebooter: Send + Sync {
    fn reboot(&self);
}

/// Restarts by exiting with a code the hosting supervisor treats as "start me again".
#[derive(Debug, Clone)]
pub struct ProcessRebooter {
    pub exit_code: i32,
}

impl Rebooter for ProcessRebooter {
    fn reboot(&self) {
        warn!("Rebooting the device (exit code {}).", self.exit_code);
        std::process::exit(self.exit_code);
    }
}
