// src/core/facade.rs — Process-wide singleton entry point
//
// Thin delegation layer over one shared `Orchestrator`. Hosts that need
// several instances (or test isolation) construct `Orchestrator` directly;
// this module is the default shared instance.

use serde_json::Value;
use std::sync::{Arc, OnceLock};

use crate::core::orchestrator::{HostBindings, Orchestrator, Visibility};
use crate::infra::config::AgentConfig;
use crate::infra::errors::PerceptrError;
use crate::infra::logger;

static AGENT: OnceLock<Arc<Orchestrator>> = OnceLock::new();

/// Initialize the shared agent. Re-initialization is rejected with a
/// warning; the first configuration wins.
pub fn init(config: AgentConfig, host: HostBindings) {
    let mut fresh = false;
    AGENT.get_or_init(|| {
        fresh = true;
        logger::init_logging(config.log_level.as_deref().unwrap_or("info"));
        Orchestrator::new(config, host)
    });
    if !fresh {
        tracing::warn!("Perceptr agent already initialized, ignoring re-init");
    }
}

fn instance() -> Result<Arc<Orchestrator>, PerceptrError> {
    AGENT.get().cloned().ok_or(PerceptrError::Initialization {
        message: "init() has not been called".into(),
    })
}

pub async fn start() -> Result<(), PerceptrError> {
    instance()?.start().await
}

pub async fn stop() -> Result<(), PerceptrError> {
    instance()?.stop().await
}

pub fn pause() {
    if let Ok(agent) = instance() {
        agent.pause();
    }
}

pub fn resume() {
    if let Ok(agent) = instance() {
        agent.resume();
    }
}

pub async fn identify(distinct_id: &str, traits: Value) -> Result<(), PerceptrError> {
    instance()?.identify(distinct_id, traits).await
}

pub fn on_visibility_change(visibility: Visibility) {
    if let Ok(agent) = instance() {
        agent.on_visibility_change(visibility);
    }
}

pub fn on_before_unload() {
    if let Ok(agent) = instance() {
        agent.on_before_unload();
    }
}
