//! Common types used across RAP components.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// How an action should be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Execute remotely only.
    Remote,
    /// Execute locally only.
    Local,
    /// Execute remotely; rerun locally if the remote attempt fails.
    RemoteLocalFallback,
    /// Race a remote attempt against a gated local attempt.
    Racing,
}

impl Default for ExecutionStrategy {
    fn default() -> Self {
        Self::RemoteLocalFallback
    }
}

impl std::fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote => write!(f, "remote"),
            Self::Local => write!(f, "local"),
            Self::RemoteLocalFallback => write!(f, "remote_local_fallback"),
            Self::Racing => write!(f, "racing"),
        }
    }
}

/// Options controlling the remote attempt of an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteExecutionOptions {
    /// Whether a previously cached result may be adopted.
    #[serde(default = "default_true")]
    pub accept_cached: bool,
    /// Do not upload the result of this action to the remote cache.
    #[serde(default)]
    pub do_not_cache: bool,
    /// Download outputs into the execution root after a remote result.
    #[serde(default = "default_true")]
    pub download_outputs: bool,
    /// Keep the modification time of outputs whose content did not change.
    #[serde(default)]
    pub preserve_unchanged_output_mtime: bool,
    /// Executable prepended to argv for the remote attempt.
    #[serde(default)]
    pub wrapper: Option<String>,
}

impl Default for RemoteExecutionOptions {
    fn default() -> Self {
        Self {
            accept_cached: true,
            do_not_cache: false,
            download_outputs: true,
            preserve_unchanged_output_mtime: false,
            wrapper: None,
        }
    }
}

/// Options controlling the local attempt of an action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalExecutionOptions {
    /// Do not publish a successful local result to the remote cache.
    #[serde(default)]
    pub do_not_cache: bool,
    /// Executable prepended to argv for the local attempt.
    #[serde(default)]
    pub wrapper: Option<String>,
}

/// Free-form tags attached to an action, used for metrics grouping and for
/// matching forecast history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLabels(pub BTreeMap<String, String>);

impl ActionLabels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable fingerprint over the sorted label pairs. Actions with equal
    /// labels share forecast history.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for (k, v) in &self.0 {
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
            hasher.update(b"\n");
        }
        hasher.finalize().to_hex().to_string()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ActionLabels {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl std::fmt::Display for ActionLabels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        Ok(())
    }
}

/// Proxy-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Root directory for per-action racing scratch directories.
    #[serde(default = "default_racing_tmp")]
    pub racing_tmp: PathBuf,
    /// Upper bound on the local-start holdoff during a race, in milliseconds.
    #[serde(default = "default_max_holdoff_ms")]
    pub max_holdoff_ms: u64,
    /// Speed/bandwidth bias in [0, 1]. 0.5 is neutral; higher favors waiting
    /// for the remote download, lower starts local sooner.
    #[serde(default = "default_racing_bias")]
    pub racing_bias: f64,
    /// Rerun each action in compare mode and diff the results.
    #[serde(default)]
    pub compare: bool,
    /// Extra local reruns per action in compare mode.
    #[serde(default)]
    pub num_local_reruns: u32,
    /// Extra remote reruns per action in compare mode.
    #[serde(default)]
    pub num_remote_reruns: u32,
    /// Wall-clock bound for a single action, in seconds. 0 disables it.
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            racing_tmp: default_racing_tmp(),
            max_holdoff_ms: default_max_holdoff_ms(),
            racing_bias: default_racing_bias(),
            compare: false,
            num_local_reruns: 0,
            num_remote_reruns: 0,
            action_timeout_secs: default_action_timeout_secs(),
        }
    }
}

impl ProxyConfig {
    pub fn max_holdoff(&self) -> Duration {
        Duration::from_millis(self.max_holdoff_ms)
    }

    /// Racing bias clamped into its valid range.
    pub fn clamped_bias(&self) -> f64 {
        self.racing_bias.clamp(0.0, 1.0)
    }

    pub fn action_timeout(&self) -> Option<Duration> {
        (self.action_timeout_secs > 0).then(|| Duration::from_secs(self.action_timeout_secs))
    }
}

fn default_true() -> bool {
    true
}

fn default_racing_tmp() -> PathBuf {
    std::env::temp_dir().join("rap-racing")
}

fn default_max_holdoff_ms() -> u64 {
    1000
}

fn default_racing_bias() -> f64 {
    0.5
}

fn default_action_timeout_secs() -> u64 {
    3600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_display() {
        assert_eq!(ExecutionStrategy::Remote.to_string(), "remote");
        assert_eq!(ExecutionStrategy::Local.to_string(), "local");
        assert_eq!(
            ExecutionStrategy::RemoteLocalFallback.to_string(),
            "remote_local_fallback"
        );
        assert_eq!(ExecutionStrategy::Racing.to_string(), "racing");
    }

    #[test]
    fn test_remote_options_defaults() {
        let opts = RemoteExecutionOptions::default();
        assert!(opts.accept_cached);
        assert!(opts.download_outputs);
        assert!(!opts.do_not_cache);
        assert!(!opts.preserve_unchanged_output_mtime);
        assert!(opts.wrapper.is_none());
    }

    #[test]
    fn test_remote_options_serde_defaults() {
        let opts: RemoteExecutionOptions = serde_json::from_str("{}").unwrap();
        assert!(opts.accept_cached);
        assert!(opts.download_outputs);
    }

    #[test]
    fn test_labels_fingerprint_is_order_independent() {
        let a: ActionLabels = [("type", "compile"), ("lang", "cpp")].into_iter().collect();
        let b: ActionLabels = [("lang", "cpp"), ("type", "compile")].into_iter().collect();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_labels_fingerprint_distinguishes_values() {
        let a: ActionLabels = [("type", "compile")].into_iter().collect();
        let b: ActionLabels = [("type", "link")].into_iter().collect();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_labels_display() {
        let labels: ActionLabels = [("lang", "cpp"), ("type", "compile")].into_iter().collect();
        assert_eq!(labels.to_string(), "lang=cpp,type=compile");
    }

    #[test]
    fn test_proxy_config_defaults() {
        let cfg = ProxyConfig::default();
        assert_eq!(cfg.max_holdoff(), Duration::from_millis(1000));
        assert!((cfg.racing_bias - 0.5).abs() < f64::EPSILON);
        assert!(!cfg.compare);
        assert_eq!(cfg.action_timeout(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_proxy_config_bias_clamped() {
        let cfg = ProxyConfig {
            racing_bias: 1.7,
            ..Default::default()
        };
        assert!((cfg.clamped_bias() - 1.0).abs() < f64::EPSILON);
        let cfg = ProxyConfig {
            racing_bias: -0.3,
            ..Default::default()
        };
        assert_eq!(cfg.clamped_bias(), 0.0);
    }

    #[test]
    fn test_zero_timeout_disables_bound() {
        let cfg = ProxyConfig {
            action_timeout_secs: 0,
            ..Default::default()
        };
        assert_eq!(cfg.action_timeout(), None);
    }
}
