//! Process-wide shutdown flag.
//!
//! The interrupt handler flips a single atomic; the engine loops poll it
//! once per iteration alongside their per-run flag. A second interrupt
//! forces an immediate exit.

use std::sync::atomic::{AtomicBool, Ordering};

static SHOULD_SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// True once an interrupt has been received.
pub fn should_shutdown() -> bool {
    SHOULD_SHUTDOWN.load(Ordering::Relaxed)
}

/// Install the SIGINT/SIGTERM handler.
///
/// The handler runs on ctrlc's own thread, not in signal context, so
/// logging from it is fine.
pub fn install() {
    ctrlc::set_handler(|| {
        if SHOULD_SHUTDOWN.swap(true, Ordering::SeqCst) {
            tracing::error!("second shutdown signal, forcing exit");
            std::process::exit(1);
        }
        tracing::info!("shutdown signal received");
    })
    .expect("failed to install signal handler");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_starts_clear() {
        assert!(!should_shutdown());
    }
}
