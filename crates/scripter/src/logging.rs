//! Logging
//!
//! Installs the `tracing` subscriber. Host, script and module output go to
//! separate targets so they can be filtered independently, e.g.
//! `RUST_LOG=scripter=warn,scripter::js=info`.

use tracing::Dispatch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogConfig;

/// Host-side diagnostics
pub const SCRIPTER: &str = "scripter";
/// Output produced by scripts through the `console` module
pub const JS: &str = "scripter::js";
/// Module discovery and loading
pub const MODULE: &str = "scripter::module";

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured filter. Returns `false`
/// when a subscriber was already installed (by an earlier platform or by the
/// embedding application), which is not an error.
pub fn init(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let installed = if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };

    match installed {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(target: SCRIPTER, "Subscriber already installed: {}", e);
            false
        }
    }
}

/// Send events from this copy of `tracing` to `dispatch`.
///
/// A native module library links its own `tracing`, whose global dispatcher
/// starts out empty, so its `CreateModule` entry point hands it the host's
/// dispatcher through here. Does nothing once a global dispatcher exists.
pub fn forward_to(dispatch: &Dispatch) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    if tracing::dispatcher::set_global_default(dispatch.clone()).is_ok() {
        tracing::debug!(target: MODULE, "Forwarding native module events to the host subscriber");
    }
}
