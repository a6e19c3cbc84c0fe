use serde::{Deserialize, Serialize};

/// Global runtime configuration shared by dataset and RPC layers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Parallelism for local compute (default: available CPU count).
    #[serde(default = "default_compute_pool_size")]
    pub compute_pool_size: usize,
    /// Whether local dataset operations hop onto the compute pool instead of
    /// delivering on the caller's task.
    #[serde(default = "default_separate_thread")]
    pub separate_thread: bool,
    /// Per-remote-call deadline in milliseconds; `0` means unbounded.
    #[serde(default)]
    pub rpc_deadline_ms: u64,
}

fn default_compute_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_separate_thread() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            compute_pool_size: default_compute_pool_size(),
            separate_thread: default_separate_thread(),
            rpc_deadline_ms: 0,
        }
    }
}

impl RuntimeConfig {
    /// Reads configuration from `PDQ_*` environment variables, falling back
    /// to defaults for unset or unparsable values.
    pub fn from_env() -> Self {
        Self {
            compute_pool_size: env_usize_or("PDQ_COMPUTE_POOL_SIZE", default_compute_pool_size()),
            separate_thread: env_bool_or("PDQ_SEPARATE_THREAD", true),
            rpc_deadline_ms: env_u64_or("PDQ_RPC_DEADLINE_MS", 0),
        }
    }

    /// Optional per-call deadline derived from `rpc_deadline_ms`.
    pub fn rpc_deadline(&self) -> Option<std::time::Duration> {
        if self.rpc_deadline_ms == 0 {
            None
        } else {
            Some(std::time::Duration::from_millis(self.rpc_deadline_ms))
        }
    }
}

/// Returns the environment value for `key`, or `default` when unset.
pub fn env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_usize_or(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_u64_or(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_bool_or(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.compute_pool_size >= 1);
        assert!(cfg.separate_thread);
        assert_eq!(cfg.rpc_deadline(), None);
    }

    #[test]
    fn deadline_zero_means_unbounded() {
        let cfg = RuntimeConfig {
            rpc_deadline_ms: 1500,
            ..RuntimeConfig::default()
        };
        assert_eq!(
            cfg.rpc_deadline(),
            Some(std::time::Duration::from_millis(1500))
        );
    }

    #[test]
    fn config_deserializes_with_missing_fields() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").expect("empty config");
        assert!(cfg.separate_thread);
        assert_eq!(cfg.rpc_deadline_ms, 0);
    }
}
