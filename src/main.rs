//! ringproxy: a single-threaded, ring-buffered TCP relay
//!
//! Modes:
//! - `proxy`: relay every accepted client to a fixed upstream
//! - `sink`: accept clients and discard their bytes, reporting rates
//! - `load`: push bytes at a target for a fixed duration
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod harness;
mod net;
mod runtime;
mod stats;
mod tcp_info;

use config::{Config, Mode};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match config.mode {
        Mode::Proxy(proxy) => {
            info!(
                listen = %proxy.listen,
                upstream = %proxy.upstream,
                buffer_size = proxy.buffer_size,
                "Starting ringproxy relay"
            );
            runtime::run(&proxy)?;
        }
        Mode::Sink(sink) => {
            info!(listen = %sink.listen, "Starting traffic sink");
            harness::sink::run(&sink)?;
        }
        Mode::Load(load) => {
            info!(
                target_addr = %load.target,
                duration_s = load.duration.as_secs(),
                chunk_size = load.chunk_size,
                "Starting load generator"
            );
            harness::load::run(&load)?;
        }
    }

    Ok(())
}
