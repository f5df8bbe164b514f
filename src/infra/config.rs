// src/infra/config.rs — Agent configuration (TOML)

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Project credential validated against the control plane before
    /// recording starts.
    pub project_id: String,

    #[serde(default)]
    pub environment: Environment,

    /// Gzip batches before upload. Plain JSON is the fallback when the
    /// compression path fails.
    #[serde(default)]
    pub compression: bool,

    /// Level for the agent's own tracing output ("info" when unset).
    /// Ignored when the host already installed a global subscriber.
    #[serde(default)]
    pub log_level: Option<String>,

    /// Directory for the per-tab durable store. Defaults to a
    /// project-scoped directory under the system temp dir.
    #[serde(default)]
    pub state_dir: Option<String>,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub recorder: RecorderConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub memory: MemoryConfig,
}

/// Which control-plane deployment to talk to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Local,
    Dev,
    Stg,
    #[default]
    Prod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// A session ends after this much inactivity (strict `<` on
    /// continuation). 30 minutes when unset.
    #[serde(default)]
    pub inactivity_timeout_ms: Option<i64>,
    /// Legacy name for `inactivity_timeout_ms`; honored only when the
    /// modern field is absent.
    #[serde(default)]
    pub stale_threshold_ms: Option<i64>,
    /// Hard cap on session length regardless of activity.
    pub max_session_duration_ms: i64,
}

pub const DEFAULT_INACTIVITY_TIMEOUT_MS: i64 = 30 * 60 * 1000;

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_ms: None,
            stale_threshold_ms: None,
            max_session_duration_ms: 24 * 60 * 60 * 1000,
        }
    }
}

impl SessionConfig {
    /// Effective inactivity timeout with the legacy fallback applied.
    pub fn effective_inactivity_timeout_ms(&self) -> i64 {
        self.inactivity_timeout_ms
            .or(self.stale_threshold_ms)
            .unwrap_or(DEFAULT_INACTIVITY_TIMEOUT_MS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Recording pauses after this long without an interactive event.
    pub idle_timeout_ms: i64,
    /// Ring bound on events held inside the recorder wrapper.
    pub max_events: usize,
    /// Pages whose URL matches any pattern are not recorded.
    #[serde(default)]
    pub url_blocklist: Vec<BlocklistEntry>,
    /// Token bucket capacity per DOM node for mutation flood defense.
    pub mutation_bucket_capacity: u32,
    /// Tokens refilled per node per second.
    pub mutation_refill_per_sec: u32,
    /// Interval between checks for location changes that produced no meta
    /// event.
    pub url_poll_interval_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 10_000,
            max_events: 10_000,
            url_blocklist: Vec::new(),
            mutation_bucket_capacity: 100,
            mutation_refill_per_sec: 10,
            url_poll_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocklistEntry {
    pub url: String,
    #[serde(default = "default_matching")]
    pub matching: String,
}

fn default_matching() -> String {
    "regex".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Requests to URLs matching any of these regexes are not recorded.
    #[serde(default)]
    pub exclude_urls: Vec<String>,
    /// Query parameter names (substring match) redacted from recorded URLs.
    pub sanitize_params: Vec<String>,
    /// Header names (case-insensitive) whose values are redacted.
    pub sanitize_headers: Vec<String>,
    /// Body field names (substring match) whose values are redacted.
    pub sanitize_body_fields: Vec<String>,
    /// Bodies larger than this are truncated with a marker.
    pub max_body_size: usize,
    /// FIFO bound on records retained inside the tap.
    pub max_requests: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            exclude_urls: Vec::new(),
            sanitize_params: vec![
                "password".into(),
                "token".into(),
                "secret".into(),
                "key".into(),
                "apikey".into(),
                "api_key".into(),
                "access_token".into(),
            ],
            sanitize_headers: vec![
                "authorization".into(),
                "cookie".into(),
                "x-auth-token".into(),
            ],
            sanitize_body_fields: vec![
                "password".into(),
                "token".into(),
                "secret".into(),
                "key".into(),
                "apikey".into(),
                "api_key".into(),
                "access_token".into(),
            ],
            max_body_size: 100 * 1024,
            max_requests: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Heap usage above this pauses the pipeline.
    pub memory_limit_bytes: u64,
    /// Sampling interval for the heap probe.
    pub poll_interval_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 50 * 1024 * 1024,
            poll_interval_ms: 5_000,
        }
    }
}

impl AgentConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Default::default()
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AgentConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_reasonable() {
        let c = AgentConfig::default();
        assert_eq!(c.environment, Environment::Prod);
        assert!(!c.compression);
        assert!(c.log_level.is_none());
        assert_eq!(c.session.effective_inactivity_timeout_ms(), 30 * 60 * 1000);
        assert_eq!(c.session.max_session_duration_ms, 24 * 60 * 60 * 1000);
        assert_eq!(c.recorder.idle_timeout_ms, 10_000);
        assert_eq!(c.recorder.max_events, 10_000);
        assert_eq!(c.network.max_body_size, 100 * 1024);
        assert_eq!(c.network.max_requests, 1_000);
        assert_eq!(c.memory.memory_limit_bytes, 50 * 1024 * 1024);
        assert_eq!(c.memory.poll_interval_ms, 5_000);
    }

    #[test]
    fn test_sanitize_defaults() {
        let n = NetworkConfig::default();
        assert!(n.sanitize_params.iter().any(|p| p == "access_token"));
        assert!(n.sanitize_headers.iter().any(|h| h == "authorization"));
        assert!(n.sanitize_body_fields.iter().any(|f| f == "password"));
    }

    #[test]
    fn test_stale_threshold_maps_to_inactivity_timeout() {
        let s = SessionConfig {
            stale_threshold_ms: Some(5 * 60 * 1000),
            ..Default::default()
        };
        assert_eq!(s.effective_inactivity_timeout_ms(), 5 * 60 * 1000);
    }

    #[test]
    fn test_explicit_inactivity_timeout_wins_over_legacy() {
        let s = SessionConfig {
            inactivity_timeout_ms: Some(10 * 60 * 1000),
            stale_threshold_ms: Some(5 * 60 * 1000),
            ..Default::default()
        };
        assert_eq!(s.effective_inactivity_timeout_ms(), 10 * 60 * 1000);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config: AgentConfig = toml::from_str("project_id = \"p-123\"").unwrap();
        assert_eq!(config.project_id, "p-123");
        assert_eq!(config.environment, Environment::Prod);
        assert_eq!(config.recorder.max_events, 10_000);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
project_id = "p-456"
environment = "dev"
compression = true

[session]
inactivity_timeout_ms = 600000
max_session_duration_ms = 3600000

[recorder]
idle_timeout_ms = 5000
max_events = 2000
mutation_bucket_capacity = 50
mutation_refill_per_sec = 5
url_poll_interval_ms = 2000

[[recorder.url_blocklist]]
url = "^.*/admin"

[network]
exclude_urls = ["^https://internal\\."]
sanitize_params = ["password"]
sanitize_headers = ["authorization"]
sanitize_body_fields = ["ssn"]
max_body_size = 1024
max_requests = 10

[memory]
memory_limit_bytes = 1048576
poll_interval_ms = 1000
"#;
        let config: AgentConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.environment, Environment::Dev);
        assert!(config.compression);
        assert_eq!(config.session.inactivity_timeout_ms, Some(600_000));
        assert_eq!(config.recorder.url_blocklist.len(), 1);
        assert_eq!(config.recorder.url_blocklist[0].matching, "regex");
        assert_eq!(config.network.sanitize_body_fields, vec!["ssn"]);
        assert_eq!(config.memory.memory_limit_bytes, 1_048_576);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = AgentConfig::new("p-789");
        let serialized = toml::to_string(&config).unwrap();
        let deserialized: AgentConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(deserialized.project_id, "p-789");
        assert_eq!(
            deserialized.network.sanitize_params,
            config.network.sanitize_params
        );
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = AgentConfig::load_from(Path::new("/nonexistent/perceptr.toml"));
        assert!(result.is_err());
    }
}
