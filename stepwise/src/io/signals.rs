//! SIGINT/SIGTERM turn into a cancellation flag checked between steps.
//!
//! The executor is synchronous, so signals are received on a helper thread
//! that drives a current-thread tokio runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;

use anyhow::{Context, Result};
use tokio::runtime::Builder;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

use crate::exit_codes;

/// Shared cancellation flag. Holds the exit code of the signal received.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicI32>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The first request wins.
    pub fn cancel(&self, exit_code: i32) {
        let _ = self
            .0
            .compare_exchange(0, exit_code, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.exit_code().is_some()
    }

    /// Exit code to use, if cancellation was requested.
    pub fn exit_code(&self) -> Option<i32> {
        match self.0.load(Ordering::SeqCst) {
            0 => None,
            code => Some(code),
        }
    }
}

/// Listen for SIGINT and SIGTERM for the rest of the process lifetime.
pub fn install(token: CancelToken) -> Result<()> {
    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    let (mut sigint, mut sigterm) = runtime
        .block_on(async {
            let sigint = signal(SignalKind::interrupt())?;
            let sigterm = signal(SignalKind::terminate())?;
            Ok::<_, std::io::Error>((sigint, sigterm))
        })
        .context("register signal handlers")?;

    thread::Builder::new()
        .name("stepwise-signals".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                loop {
                    tokio::select! {
                        received = sigint.recv() => {
                            if received.is_none() { break; }
                            info!("received SIGINT, stopping after current step");
                            token.cancel(exit_codes::INTERRUPTED);
                        }
                        received = sigterm.recv() => {
                            if received.is_none() { break; }
                            info!("received SIGTERM, stopping after current step");
                            token.cancel(exit_codes::TERMINATED);
                        }
                    }
                }
                warn!("signal streams closed");
            });
        })
        .context("spawn signal thread")?;
    Ok(())
}
