use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::DEFAULT_CACHE_CAPACITY;
use crate::error::{AgentlessError, Result};
use crate::inbound::DecryptionMode;

pub const RELAY_URL_ENV: &str = "AGENTLESS_RELAY_URL";
pub const POD_URL_ENV: &str = "AGENTLESS_POD_URL";

/// Where outgoing messages are submitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitRoute {
    /// Form POST of both ciphertext fields to the relay.
    #[default]
    Relay,
    /// Form POST of a `messagepayload` document to the pod's ingestor,
    /// authenticated by the session cookie.
    Ingestor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentlessConfig {
    pub relay_base_url: String,
    pub pod_base_url: String,
    pub submit_route: SubmitRoute,
    /// Failure policy for list and datafeed reads. Single-message reads are
    /// always strict.
    pub batch_decryption: DecryptionMode,
    pub request_timeout_secs: u64,
    pub user_agent: String,
    /// Distinct token pairs whose crypto sessions are kept at once.
    pub session_cache_capacity: usize,
}

impl Default for AgentlessConfig {
    fn default() -> Self {
        Self {
            relay_base_url: "http://localhost:9090".into(),
            pod_base_url: "http://localhost:8080/pod".into(),
            submit_route: SubmitRoute::Relay,
            batch_decryption: DecryptionMode::ReportAll,
            request_timeout_secs: 30,
            user_agent: concat!("agentless/", env!("CARGO_PKG_VERSION")).into(),
            session_cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl AgentlessConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        Ok(config)
    }

    /// Override base URLs from the environment, where set.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(RELAY_URL_ENV) {
            self.relay_base_url = url;
        }
        if let Ok(url) = std::env::var(POD_URL_ENV) {
            self.pod_base_url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.relay_base_url.trim().is_empty() {
            return Err(AgentlessError::Config("relay_base_url is empty".into()));
        }
        if self.pod_base_url.trim().is_empty() {
            return Err(AgentlessError::Config("pod_base_url is empty".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(AgentlessError::Config(
                "request_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.session_cache_capacity == 0 {
            return Err(AgentlessError::Config(
                "session_cache_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
