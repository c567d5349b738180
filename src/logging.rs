//! `tracing` subscriber setup.
//!
//! Every `DPRINT`/`DPRINTF` call site in the original implementation becomes
//! a `tracing::debug!`/`trace!` call at the matching site (spec §B); this
//! sets up where those go. Verbosity is controlled the usual `tracing`
//! way via `RUST_LOG`, defaulting to `info` when unset.

use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
