//! Ctrl+C handling
//!
//! The first Ctrl+C raises a shared flag: bots stop at their next page and
//! sessions skip to the data export. A second Ctrl+C exits immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{error, warn};

/// Exit status used when the user insists on stopping
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Shared stop request
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Raise this flag on Ctrl+C
    ///
    /// The signal is awaited on a single-threaded tokio runtime owned by a
    /// background thread. Only the first call installs a handler.
    pub fn install_ctrlc_handler(&self) {
        if HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
            return;
        }

        let flag = self.clone();
        let spawned = thread::Builder::new()
            .name("ctrlc".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to start signal runtime: {}", e);
                        return;
                    }
                };

                runtime.block_on(async {
                    loop {
                        if tokio::signal::ctrl_c().await.is_err() {
                            return;
                        }
                        if flag.is_raised() {
                            eprintln!("\nInterrupted twice, exiting");
                            std::process::exit(INTERRUPTED_EXIT_CODE);
                        }
                        warn!("Interrupt received, stopping bots and exporting current data (Ctrl+C again to exit)");
                        flag.raise();
                    }
                });
            });

        if let Err(e) = spawned {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    }
}
