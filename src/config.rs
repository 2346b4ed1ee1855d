//! YAML Settings
//!
//! File-based configuration for the cache subsystem. Every section is
//! optional; missing values take the library defaults.
//!
//! ```yaml
//! l1:
//!   max_entries: 20000
//!   max_bytes: 268435456
//! l2:
//!   endpoints: ["redis://redis-0:6379", "redis://redis-1:6379"]
//!   discovery: replication_role
//!   pool_size: 32
//! l3:
//!   endpoints: ["https://edge.example.com"]
//! policies:
//!   quote: { ttl_seconds: 2, tiers: [L1, L2] }
//!   tax_lots: { class: warm, ttl_seconds: 600 }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{
    CacheConfig, CacheTier, DataClass, DiscoveryMode, L1Config, L2Config, L3Config, PolicyTable,
    RecommendationThresholds, TierPolicy,
};
use crate::error::{Error, Result};

/// Top-level cache settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    pub l1: L1Settings,
    pub l2: L2Settings,
    pub l3: L3Settings,
    /// Expired-entry sweep period (0 disables the sweeper)
    pub sweep_interval_seconds: Option<u64>,
    /// Per-data-type overrides and additions to the standard table
    pub policies: BTreeMap<String, PolicySettings>,
    /// Replacement for the fallback policy
    pub default_policy: Option<PolicySettings>,
    pub recommendations: RecommendationSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct L1Settings {
    pub max_entries: usize,
    pub max_bytes: u64,
}

impl Default for L1Settings {
    fn default() -> Self {
        let defaults = L1Config::default();
        Self {
            max_entries: defaults.max_entries,
            max_bytes: defaults.max_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct L2Settings {
    pub endpoints: Vec<String>,
    pub discovery: DiscoveryMode,
    pub pool_size: usize,
    pub compression_threshold: usize,
    pub default_ttl_seconds: u64,
    pub op_timeout_ms: u64,
    pub scan_timeout_ms: u64,
    pub scan_batch_size: usize,
}

impl Default for L2Settings {
    fn default() -> Self {
        let defaults = L2Config::default();
        Self {
            endpoints: defaults.endpoints,
            discovery: DiscoveryMode::default(),
            pool_size: defaults.pool_size,
            compression_threshold: defaults.compression_threshold,
            default_ttl_seconds: defaults.default_ttl.as_secs(),
            op_timeout_ms: defaults.op_timeout.as_millis() as u64,
            scan_timeout_ms: defaults.scan_timeout.as_millis() as u64,
            scan_batch_size: defaults.scan_batch_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct L3Settings {
    /// Empty disables the edge tier
    pub endpoints: Vec<String>,
    pub timeout_ms: u64,
}

impl Default for L3Settings {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            timeout_ms: L3Config::default().timeout.as_millis() as u64,
        }
    }
}

/// Policy for one data type: explicit `tiers`, or the tiers of a `class`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySettings {
    pub ttl_seconds: u64,
    #[serde(default)]
    pub tiers: Option<Vec<CacheTier>>,
    #[serde(default)]
    pub class: Option<DataClass>,
}

impl PolicySettings {
    fn to_policy(&self, data_type: &str) -> Result<TierPolicy> {
        let ttl = Duration::from_secs(self.ttl_seconds);
        match (&self.tiers, self.class) {
            (Some(tiers), _) if tiers.is_empty() => Err(Error::Config(format!(
                "policy '{}' lists no tiers",
                data_type
            ))),
            (Some(tiers), _) => Ok(TierPolicy::new(ttl, tiers.clone())),
            (None, Some(class)) => Ok(TierPolicy::for_class(class, ttl)),
            (None, None) => Err(Error::Config(format!(
                "policy '{}' needs either tiers or class",
                data_type
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecommendationSettings {
    pub min_requests: u64,
    pub min_hit_rate: f64,
    pub max_l1_evictions: u64,
    pub l2_over_l1_ratio: f64,
    pub min_l2_hits: u64,
}

impl Default for RecommendationSettings {
    fn default() -> Self {
        let defaults = RecommendationThresholds::default();
        Self {
            min_requests: defaults.min_requests,
            min_hit_rate: defaults.min_hit_rate,
            max_l1_evictions: defaults.max_l1_evictions,
            l2_over_l1_ratio: defaults.l2_over_l1_ratio,
            min_l2_hits: defaults.min_l2_hits,
        }
    }
}

impl CacheSettings {
    /// Load settings from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Parse settings from YAML text
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Validate and convert into a runtime configuration
    pub fn into_config(self) -> Result<CacheConfig> {
        if self.l2.endpoints.is_empty() {
            return Err(Error::Config("l2.endpoints must not be empty".into()));
        }
        if self.l2.pool_size == 0 {
            return Err(Error::Config("l2.pool_size must be at least 1".into()));
        }
        if self.l2.scan_batch_size == 0 {
            return Err(Error::Config("l2.scan_batch_size must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.recommendations.min_hit_rate) {
            return Err(Error::Config(
                "recommendations.min_hit_rate must be between 0 and 1".into(),
            ));
        }

        let mut policies = PolicyTable::standard();
        if let Some(default) = &self.default_policy {
            policies.set_default(default.to_policy("default")?);
        }
        for (data_type, settings) in &self.policies {
            policies.insert(data_type.clone(), settings.to_policy(data_type)?);
        }

        let sweep_interval = match self.sweep_interval_seconds {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => CacheConfig::default().sweep_interval,
        };

        Ok(CacheConfig {
            l1: L1Config {
                max_entries: self.l1.max_entries,
                max_bytes: self.l1.max_bytes,
            },
            l2: L2Config {
                endpoints: self.l2.endpoints,
                pool_size: self.l2.pool_size,
                compression_threshold: self.l2.compression_threshold,
                default_ttl: Duration::from_secs(self.l2.default_ttl_seconds),
                op_timeout: Duration::from_millis(self.l2.op_timeout_ms),
                scan_timeout: Duration::from_millis(self.l2.scan_timeout_ms),
                scan_batch_size: self.l2.scan_batch_size,
            },
            l3: L3Config {
                endpoints: self.l3.endpoints,
                timeout: Duration::from_millis(self.l3.timeout_ms),
            },
            policies,
            discovery: self.l2.discovery,
            sweep_interval,
            thresholds: RecommendationThresholds {
                min_requests: self.recommendations.min_requests,
                min_hit_rate: self.recommendations.min_hit_rate,
                max_l1_evictions: self.recommendations.max_l1_evictions,
                l2_over_l1_ratio: self.recommendations.l2_over_l1_ratio,
                min_l2_hits: self.recommendations.min_l2_hits,
            },
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_empty_document_uses_defaults() {
        let settings = CacheSettings::from_yaml_str("{}").unwrap();
        assert_eq!(settings, CacheSettings::default());

        let config = settings.into_config().unwrap();
        assert_eq!(config.l2.op_timeout, Duration::from_millis(250));
        assert_eq!(config.l2.compression_threshold, 1024);
        assert_eq!(config.sweep_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.policies.len(), 11);
    }

    #[test]
    fn test_full_document() {
        let yaml = r#"
l1:
  max_entries: 500
  max_bytes: 1048576
l2:
  endpoints: ["redis://redis-0:6379", "redis://redis-1:6379"]
  discovery: replication_role
  pool_size: 4
  op_timeout_ms: 100
l3:
  endpoints: ["https://edge.example.com"]
  timeout_ms: 300
sweep_interval_seconds: 0
policies:
  quote: { ttl_seconds: 2, tiers: [L1, L2] }
  tax_lots: { class: warm, ttl_seconds: 600 }
default_policy: { ttl_seconds: 60, tiers: [L2] }
recommendations:
  min_requests: 50
"#;
        let config = CacheSettings::from_yaml_str(yaml)
            .unwrap()
            .into_config()
            .unwrap();

        assert_eq!(config.l1.max_entries, 500);
        assert_eq!(config.l2.endpoints.len(), 2);
        assert_eq!(config.discovery, DiscoveryMode::ReplicationRole);
        assert_eq!(config.l2.pool_size, 4);
        assert_eq!(config.l2.op_timeout, Duration::from_millis(100));
        assert_eq!(config.l3.timeout, Duration::from_millis(300));
        assert_eq!(config.sweep_interval, None);
        assert_eq!(config.thresholds.min_requests, 50);

        let quote = config.policies.resolve("quote");
        assert_eq!(quote.ttl, Duration::from_secs(2));
        let lots = config.policies.resolve("tax_lots");
        assert_eq!(lots.tiers, vec![CacheTier::L2]);
        assert_eq!(config.policies.resolve("unknown").ttl, Duration::from_secs(60));
        // untouched standard entries survive
        assert_eq!(
            config.policies.resolve("security_info").ttl,
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_policy_without_tiers_or_class() {
        let yaml = "policies:\n  quote: { ttl_seconds: 2 }\n";
        let settings = CacheSettings::from_yaml_str(yaml).unwrap();
        assert_matches!(settings.into_config(), Err(Error::Config(_)));
    }

    #[test]
    fn test_unknown_tier_rejected() {
        let yaml = "policies:\n  quote: { ttl_seconds: 2, tiers: [L4] }\n";
        assert_matches!(
            CacheSettings::from_yaml_str(yaml),
            Err(Error::SettingsParse(_))
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let zero_pool = "l2: { pool_size: 0 }";
        let settings = CacheSettings::from_yaml_str(zero_pool).unwrap();
        assert_matches!(settings.into_config(), Err(Error::Config(_)));

        let no_endpoints = "l2: { endpoints: [] }";
        let settings = CacheSettings::from_yaml_str(no_endpoints).unwrap();
        assert_matches!(settings.into_config(), Err(Error::Config(_)));
    }

    #[test]
    fn test_missing_file() {
        assert_matches!(
            CacheSettings::from_yaml_file("/nonexistent/fincache.yaml"),
            Err(Error::Io(_))
        );
    }
}
