use std::env;
use std::time::Duration;

/// Connection configuration for the etcd-backed coordination store.
///
/// Reads `WORKFLOW_ETCD_ENDPOINTS` (comma-separated) and `WORKFLOW_KEY_PREFIX`
/// from the environment, falling back to a single localhost endpoint and the
/// `/workflow` root prefix.
#[derive(Debug, Clone)]
pub struct CoordConfig {
    pub endpoints: Vec<String>,
    pub key_prefix: String,
    pub stm_retry_limit: u32,
    pub stm_retry_backoff: Duration,
}

impl CoordConfig {
    pub const DEFAULT_ENDPOINT: &str = "http://localhost:2379";
    pub const DEFAULT_PREFIX: &str = "/workflow";

    pub fn from_env() -> Self {
        let endpoints = env::var("WORKFLOW_ETCD_ENDPOINTS")
            .unwrap_or_else(|_| Self::DEFAULT_ENDPOINT.to_owned())
            .split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect();
        let key_prefix =
            env::var("WORKFLOW_KEY_PREFIX").unwrap_or_else(|_| Self::DEFAULT_PREFIX.to_owned());
        Self {
            endpoints,
            key_prefix,
            stm_retry_limit: 5,
            stm_retry_backoff: Duration::from_millis(20),
        }
    }

    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            key_prefix: Self::DEFAULT_PREFIX.to_owned(),
            stm_retry_limit: 5,
            stm_retry_backoff: Duration::from_millis(20),
        }
    }
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_uses_default_prefix() {
        let cfg = CoordConfig::new(vec!["http://127.0.0.1:2379".to_owned()]);
        assert_eq!(cfg.key_prefix, "/workflow");
        assert_eq!(cfg.endpoints.len(), 1);
    }
}
