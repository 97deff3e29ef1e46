//! Engine configuration

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{EngineError, Result};

/// Global options shared by every executor in a run.
///
/// Individual template requests may override some of these (threads,
/// max-size, stop-at-first-match); the request-level value wins.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Retries on transport failure before giving up.
    pub retries: u32,
    /// Requests per second across the whole run. 0 disables limiting.
    pub rate_limit: u32,
    /// Default worker count for parallel template execution.
    pub template_threads: usize,
    /// Stop a template against a target after its first match.
    pub stop_at_first_match: bool,
    /// Emit explicit failure events for non-matching operators.
    pub matcher_status: bool,
    /// Maximum response body bytes read per hop. 0 uses the 4 MiB default.
    pub response_read_size: usize,
    /// Consecutive network failures against one host before probes to it
    /// are suppressed. 0 disables the host-errors cache.
    pub max_host_errors: usize,
    /// Disable the request clustering optimizer.
    pub disable_clustering: bool,
    /// Log dumped requests and responses at debug level.
    pub debug_requests: bool,
    /// User agent sent on structured requests.
    pub user_agent: String,
    /// Headers applied to every generated request.
    pub custom_headers: HashMap<String, String>,
    /// Run-wide template variables, merged under payloads and extractions.
    pub vars: HashMap<String, String>,
    /// Callback authority for out-of-band correlation URLs, e.g.
    /// `oob.example.com`. Empty disables OOB registration.
    pub oob_domain: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            retries: 1,
            rate_limit: 150,
            template_threads: 25,
            stop_at_first_match: false,
            matcher_status: false,
            response_read_size: 0,
            max_host_errors: 30,
            disable_clustering: false,
            debug_requests: false,
            user_agent: format!("talos/{}", env!("CARGO_PKG_VERSION")),
            custom_headers: HashMap::new(),
            vars: HashMap::new(),
            oob_domain: String::new(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a TOML file, filling unset fields with
    /// defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert!(config.timeout_secs > 0);
        assert!(!config.stop_at_first_match);
        assert_eq!(config.response_read_size, 0);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: EngineConfig =
            toml::from_str("timeout_secs = 3\nstop_at_first_match = true").expect("parse");
        assert_eq!(config.timeout_secs, 3);
        assert!(config.stop_at_first_match);
        assert_eq!(config.retries, 1);
    }
}
