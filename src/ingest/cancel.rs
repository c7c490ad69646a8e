//! Cooperative cancellation: SIGTERM/SIGINT request a clean stop.
//!
//! The pipeline polls the token after each record and each batch, so a signal
//! never interrupts a write in progress.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared stop flag between signal handlers, callers, and a running pipeline.
///
/// `Ordering::Relaxed` suffices: the pipeline polls the flag and no other
/// memory is published through it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that also trips on SIGTERM and SIGINT.
    ///
    /// Registration is best-effort; failures are reported on stderr.
    #[cfg(feature = "signals")]
    #[must_use]
    pub fn with_signal_handlers() -> Self {
        use signal_hook::consts::{SIGINT, SIGTERM};

        let token = Self::new();
        if let Err(e) = signal_hook::flag::register(SIGTERM, Arc::clone(&token.flag)) {
            eprintln!("[AIN-SIGNAL] failed to register SIGTERM: {e}");
        }
        if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&token.flag)) {
            eprintln!("[AIN-SIGNAL] failed to register SIGINT: {e}");
        }
        token
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}
