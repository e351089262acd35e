//! src/main.rs
//!
//! Binary entry point. Responsible for initializing tracing, loading
//! configuration, instantiating the main `App`, and running it.
//!
//! Runs on a current-thread runtime: the engine's invariants (one in-flight
//! query per peer, a single signer request outstanding) are enforced by
//! having exactly one task touch the engine's state machine at a time, not by
//! locking discipline across real parallelism.

use anyhow::Context;
use channel_gossip::app::ExitOutcome;
use channel_gossip::{App, Config};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::load().context("failed to load configuration")?;

    match App::new(config)?.run().await {
        Ok(ExitOutcome::Normal) => Ok(()),
        Ok(ExitOutcome::ControlGone) => {
            tracing::error!("control connection closed unexpectedly, exiting");
            std::process::exit(2);
        }
        Err(e) => {
            tracing::error!(error = %e, "gossip daemon failed");
            std::process::exit(1);
        }
    }
}
