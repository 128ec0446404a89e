//! Named rate limit policies loaded from YAML.
//!
//! A policy file declares optional tier multipliers and a list of policies:
//!
//! ```yaml
//! tiers:
//!   free: 1.0
//!   pro: 5.0
//! policies:
//!   - name: api
//!     type: user
//!     max_requests: 100
//!     unit: minute
//!     burst:
//!       max_burst_multiplier: 1.5
//!       burst_credit_ttl_seconds: 300
//!     tier: pro
//! ```
//!
//! The window is given either as `window_ms` or as a whole `unit`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::policy::{BurstConfig, LimitType, RateLimitConfig, DEFAULT_COST};
use crate::error::{Result, SluiceError};

/// Time unit for policy windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Length of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3_600),
            TimeUnit::Day => Duration::from_secs(86_400),
        }
    }
}

/// One policy as written in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDefinition {
    /// Policy name, used for lookup and in logs
    pub name: String,
    /// Which identity the policy buckets by
    #[serde(rename = "type")]
    pub limit_type: LimitType,
    /// Base budget per window
    pub max_requests: u64,
    /// Window length in milliseconds
    #[serde(default)]
    pub window_ms: Option<u64>,
    /// Window length as a whole unit
    #[serde(default)]
    pub unit: Option<TimeUnit>,
    /// Budget consumed per admitted request (defaults to one)
    #[serde(default = "default_cost")]
    pub cost: u64,
    /// Burst credit settings; absent means no burst credit
    #[serde(default)]
    pub burst: Option<BurstConfig>,
    /// Name of a tier declared under `tiers`
    #[serde(default)]
    pub tier: Option<String>,
}

fn default_cost() -> u64 {
    DEFAULT_COST
}

#[derive(Debug, Default, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    tiers: HashMap<String, f64>,
    #[serde(default)]
    policies: Vec<PolicyDefinition>,
}

/// A validated set of named policies.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    policies: HashMap<String, RateLimitConfig>,
}

impl PolicySet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load policies from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load policies from a YAML string.
    ///
    /// Every policy is validated; the first invalid one fails the whole load.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(yaml)
            .map_err(|e| SluiceError::Config(format!("Failed to parse policy file: {}", e)))?;

        let mut set = PolicySet::new();
        for definition in file.policies {
            let config = definition.to_config(&file.tiers)?;
            set.insert(config)?;
        }

        info!(policies = set.len(), tiers = file.tiers.len(), "Rate limit policies loaded");
        Ok(set)
    }

    /// Add a policy; names must be unique.
    pub fn insert(&mut self, config: RateLimitConfig) -> Result<()> {
        let name = config.identifier().to_string();
        if self.policies.contains_key(&name) {
            return Err(SluiceError::Config(format!("duplicate policy name '{}'", name)));
        }
        self.policies.insert(name, config);
        Ok(())
    }

    /// Look a policy up by name.
    pub fn get(&self, name: &str) -> Option<&RateLimitConfig> {
        self.policies.get(name)
    }

    /// Policy names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

impl PolicyDefinition {
    fn to_config(&self, tiers: &HashMap<String, f64>) -> Result<RateLimitConfig> {
        let window_ms = match (self.window_ms, self.unit) {
            (Some(ms), None) => ms,
            (None, Some(unit)) => unit.duration().as_millis() as u64,
            (Some(_), Some(_)) => {
                return Err(SluiceError::invalid_policy(
                    &self.name,
                    "set either window_ms or unit, not both",
                ))
            }
            (None, None) => {
                return Err(SluiceError::invalid_policy(&self.name, "window_ms or unit is required"))
            }
        };

        let mut builder = RateLimitConfig::builder(self.limit_type, self.name.clone())
            .max_requests(self.max_requests)
            .window_ms(window_ms)
            .cost(self.cost);

        if let Some(burst) = &self.burst {
            builder = builder.burst(burst.max_burst_multiplier, burst.burst_credit_ttl_seconds);
        }

        if let Some(tier) = &self.tier {
            let multiplier = tiers.get(tier).copied().ok_or_else(|| {
                SluiceError::invalid_policy(&self.name, format!("unknown tier '{}'", tier))
            })?;
            builder = builder.tier(tier.clone(), multiplier);
        }

        builder.build()
    }
}
