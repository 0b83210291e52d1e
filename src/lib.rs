//! OxideTerm transfer engine
//!
//! Recursive SFTP upload and download built on russh-sftp.

pub mod config;
pub mod sftp;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging. Does nothing if a global subscriber is already set.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
