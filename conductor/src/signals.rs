//! Shutdown flag raised by Ctrl+C or SIGTERM.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};

/// Cloneable handle on the process-wide shutdown flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Start a watcher thread that raises the flag on the first interrupt or
    /// terminate signal.
    pub fn install() -> Result<Self> {
        let shutdown = Self::default();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("build signal runtime")?;
        let handle = shutdown.clone();
        thread::Builder::new()
            .name("signal-watch".to_string())
            .spawn(move || {
                let received = runtime.block_on(wait_for_signal());
                info!(signal = received, "shutdown signal received");
                handle.request();
            })
            .context("spawn signal watcher thread")?;
        Ok(shutdown)
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// The raw flag, for loops that poll it.
    pub fn flag(&self) -> &AtomicBool {
        &self.flag
    }
}

async fn wait_for_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => "interrupt",
        () = terminate => "terminate",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_visible_through_clones() {
        let shutdown = ShutdownSignal::default();
        let observer = shutdown.clone();
        assert!(!observer.requested());
        shutdown.request();
        assert!(observer.requested());
        assert!(observer.flag().load(Ordering::SeqCst));
    }
}
