//! Integration test infrastructure for the transceiver firmware lifecycle
//!
//! Provides:
//! - A simulated switch implementing every platform collaborator
//! - EEPROM and static-config fixtures for common module types
//! - Outcome and command-log verification helpers

pub mod fixtures;
pub mod sim;
mod verification;

use std::sync::Once;

use tracing_subscriber::EnvFilter;

pub use fixtures::*;
pub use sim::{Faults, ImageBehavior, SimModule, SimPlatform};
pub use verification::*;

static LOGGING: Once = Once::new();

/// Initialize tracing for tests; `RUST_LOG` overrides the default level.
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sonic_xcvrfw=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_test_writer()
            .try_init();
    });
}
