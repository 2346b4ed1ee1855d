//! Routing Policies
//!
//! Per-data-type placement and TTL, plus the key matcher used by invalidation.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// =============================================================================
// Tiers
// =============================================================================

/// Cache tier, ordered fastest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheTier {
    /// L1 - in-process memory
    L1,
    /// L2 - distributed (Redis)
    L2,
    /// L3 - edge network
    L3,
}

impl CacheTier {
    /// All tiers, fastest first
    pub const ALL: [CacheTier; 3] = [CacheTier::L1, CacheTier::L2, CacheTier::L3];

    /// Short label used in logs and metric labels
    pub fn label(&self) -> &'static str {
        match self {
            CacheTier::L1 => "l1",
            CacheTier::L2 => "l2",
            CacheTier::L3 => "l3",
        }
    }
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheTier::L1 => write!(f, "L1 (Local)"),
            CacheTier::L2 => write!(f, "L2 (Distributed)"),
            CacheTier::L3 => write!(f, "L3 (Edge)"),
        }
    }
}

// =============================================================================
// Key Matching
// =============================================================================

/// How an invalidation pattern is compared against keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Key starts with the pattern
    #[default]
    Prefix,
    /// Key contains the pattern anywhere
    Contains,
}

/// Explicit key matcher for invalidation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMatcher {
    pub pattern: String,
    pub mode: MatchMode,
}

impl KeyMatcher {
    pub fn new(pattern: impl Into<String>, mode: MatchMode) -> Self {
        Self {
            pattern: pattern.into(),
            mode,
        }
    }

    pub fn prefix(pattern: impl Into<String>) -> Self {
        Self::new(pattern, MatchMode::Prefix)
    }

    pub fn contains(pattern: impl Into<String>) -> Self {
        Self::new(pattern, MatchMode::Contains)
    }

    /// Check whether `key` satisfies this matcher
    #[inline]
    pub fn matches(&self, key: &str) -> bool {
        match self.mode {
            MatchMode::Prefix => key.starts_with(&self.pattern),
            MatchMode::Contains => key.contains(&self.pattern),
        }
    }

    /// Redis `SCAN MATCH` glob equivalent to this matcher
    pub fn to_glob(&self) -> String {
        let escaped = glob_escape(&self.pattern);
        match self.mode {
            MatchMode::Prefix => format!("{}*", escaped),
            MatchMode::Contains => format!("*{}*", escaped),
        }
    }
}

impl std::fmt::Display for KeyMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.mode {
            MatchMode::Prefix => write!(f, "prefix({})", self.pattern),
            MatchMode::Contains => write!(f, "contains({})", self.pattern),
        }
    }
}

/// Escape Redis glob metacharacters so the pattern is matched literally
fn glob_escape(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// =============================================================================
// Tier Policy
// =============================================================================

/// Broad access-pattern class of a data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataClass {
    /// Real-time values, seconds-level freshness
    Hot,
    /// Per-user records, minutes-level freshness
    Warm,
    /// Reference data, rarely changes
    Cold,
    /// Expensive derived results
    Computed,
    /// Anything unclassified
    Default,
}

impl DataClass {
    /// Tier set used for this class
    pub fn tiers(&self) -> Vec<CacheTier> {
        match self {
            DataClass::Hot | DataClass::Computed => vec![CacheTier::L1, CacheTier::L2],
            DataClass::Warm | DataClass::Default => vec![CacheTier::L2],
            DataClass::Cold => vec![CacheTier::L2, CacheTier::L3],
        }
    }
}

/// Placement and TTL for one data type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierPolicy {
    /// TTL applied on set and promotion (zero = never expires)
    pub ttl: Duration,
    /// Tiers to consult, fastest first
    pub tiers: Vec<CacheTier>,
}

impl TierPolicy {
    pub fn new(ttl: Duration, tiers: Vec<CacheTier>) -> Self {
        let mut policy = Self { ttl, tiers };
        policy.normalize();
        policy
    }

    /// Build a policy from a data class
    pub fn for_class(class: DataClass, ttl: Duration) -> Self {
        Self::new(ttl, class.tiers())
    }

    /// Sort tiers fastest-first and drop duplicates
    fn normalize(&mut self) {
        self.tiers.sort();
        self.tiers.dedup();
    }
}

/// Data-type → policy table
#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: HashMap<String, TierPolicy>,
    default: TierPolicy,
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl PolicyTable {
    /// Empty table that routes everything through `default`
    pub fn new(default: TierPolicy) -> Self {
        Self {
            policies: HashMap::new(),
            default,
        }
    }

    /// Standard financial-planning classification
    pub fn standard() -> Self {
        let secs = Duration::from_secs;
        let mut table = Self::new(TierPolicy::for_class(DataClass::Default, secs(300)));

        // Hot: real-time market data
        table.insert("quote", TierPolicy::for_class(DataClass::Hot, secs(1)));
        table.insert("market_data", TierPolicy::for_class(DataClass::Hot, secs(5)));
        table.insert("portfolio_value", TierPolicy::for_class(DataClass::Hot, secs(10)));

        // Warm: user records
        table.insert("user_profile", TierPolicy::for_class(DataClass::Warm, secs(300)));
        table.insert("holdings", TierPolicy::for_class(DataClass::Warm, secs(60)));
        table.insert("transactions", TierPolicy::for_class(DataClass::Warm, secs(120)));

        // Cold: reference data
        table.insert("security_info", TierPolicy::for_class(DataClass::Cold, secs(3600)));
        table.insert("historical_data", TierPolicy::for_class(DataClass::Cold, secs(1800)));

        // Computed: expensive analytics
        table.insert("monte_carlo", TierPolicy::for_class(DataClass::Computed, secs(1800)));
        table.insert("optimization", TierPolicy::for_class(DataClass::Computed, secs(600)));
        table.insert("recommendations", TierPolicy::for_class(DataClass::Computed, secs(900)));

        table
    }

    /// Add or replace the policy for a data type
    pub fn insert(&mut self, data_type: impl Into<String>, policy: TierPolicy) {
        self.policies.insert(data_type.into(), policy);
    }

    /// Replace the fallback policy
    pub fn set_default(&mut self, policy: TierPolicy) {
        self.default = policy;
    }

    /// Resolve the policy for a data type, falling back to the default
    pub fn resolve(&self, data_type: &str) -> &TierPolicy {
        self.policies.get(data_type).unwrap_or(&self.default)
    }

    pub fn default_policy(&self) -> &TierPolicy {
        &self.default
    }

    /// Number of explicitly configured data types
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Iterate configured data types
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TierPolicy)> {
        self.policies.iter().map(|(k, v)| (k.as_str(), v))
    }
}

// =============================================================================
// Tests
// =============================================================================
