// src/infra/logger.rs — Tracing setup for embedded use

use tracing_subscriber::{fmt, EnvFilter};

/// Install the agent's tracing subscriber.
///
/// The agent lives inside someone else's process, so a global subscriber
/// the host already installed always wins; in that case this returns
/// `false` and the agent's spans flow into the host's setup. The
/// `PERCEPTR_LOG` env var overrides `level`, which otherwise applies to
/// this crate only.
pub fn init_logging(level: &str) -> bool {
    let filter = EnvFilter::try_from_env("PERCEPTR_LOG")
        .unwrap_or_else(|_| EnvFilter::new(format!("perceptr_agent={level}")));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .is_ok()
}
