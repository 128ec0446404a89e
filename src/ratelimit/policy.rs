//! Rate limit policy definitions and validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SluiceError};

/// Default cost charged per admitted request.
pub const DEFAULT_COST: u64 = 1;

/// Longest accepted window (one year).
pub const MAX_WINDOW_MS: u64 = 365 * 24 * 60 * 60 * 1000;

/// Longest accepted burst credit lifetime (one year).
pub const MAX_BURST_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// The kind of caller identity a bucket is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitType {
    /// Per client address
    Ip,
    /// Per authenticated user
    User,
    /// Per API endpoint
    Endpoint,
    /// Caller-defined identity
    Custom,
}

impl LimitType {
    /// Every limit type, in a stable order.
    pub const ALL: [LimitType; 4] = [
        LimitType::Ip,
        LimitType::User,
        LimitType::Endpoint,
        LimitType::Custom,
    ];

    /// The lowercase name used in store keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::Ip => "ip",
            LimitType::User => "user",
            LimitType::Endpoint => "endpoint",
            LimitType::Custom => "custom",
        }
    }
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LimitType {
    type Err = SluiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ip" => Ok(LimitType::Ip),
            "user" => Ok(LimitType::User),
            "endpoint" => Ok(LimitType::Endpoint),
            "custom" => Ok(LimitType::Custom),
            other => Err(SluiceError::Config(format!("unknown limit type '{}'", other))),
        }
    }
}

/// Burst allowance earned while a caller stays under its nominal budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BurstConfig {
    /// Upper bound on the effective limit, as a multiple of `max_requests`
    pub max_burst_multiplier: f64,
    /// Lifetime of accumulated credit, refreshed on every accrual
    pub burst_credit_ttl_seconds: u64,
}

/// A pricing tier that scales the nominal limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Tier name
    pub name: String,
    /// Multiplier applied to `max_requests`
    pub multiplier: f64,
}

/// A validated rate limit policy.
///
/// A policy identifies one family of buckets: every caller identity checked
/// against it gets its own window and burst state. Construction goes through
/// [`RateLimitConfig::builder`], which rejects policies that could never admit
/// a request.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    limit_type: LimitType,
    identifier: String,
    max_requests: u64,
    window_ms: u64,
    cost: u64,
    burst: Option<BurstConfig>,
    tier: Option<TierConfig>,
}

impl RateLimitConfig {
    /// Start building a policy for the given limit type and policy identifier.
    pub fn builder(limit_type: LimitType, identifier: impl Into<String>) -> RateLimitConfigBuilder {
        RateLimitConfigBuilder {
            limit_type,
            identifier: identifier.into(),
            max_requests: 0,
            window_ms: 0,
            cost: DEFAULT_COST,
            burst: None,
            tier: None,
        }
    }

    /// The limit type buckets of this policy are keyed on.
    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    /// The policy identifier (used for logging and error reporting).
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Nominal limit before any tier multiplier.
    pub fn base_max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Nominal limit after the tier multiplier, never below one.
    pub fn max_requests(&self) -> u64 {
        match &self.tier {
            Some(tier) => ((self.max_requests as f64 * tier.multiplier).floor() as u64).max(1),
            None => self.max_requests,
        }
    }

    /// Window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Cost charged per admitted request.
    pub fn cost(&self) -> u64 {
        self.cost
    }

    /// Burst settings, if burst credit is enabled.
    pub fn burst(&self) -> Option<&BurstConfig> {
        self.burst.as_ref()
    }

    /// Tier settings, if any.
    pub fn tier(&self) -> Option<&TierConfig> {
        self.tier.as_ref()
    }

    /// The largest effective limit burst credit can ever produce.
    pub fn burst_ceiling(&self) -> u64 {
        let max = self.max_requests();
        match &self.burst {
            Some(burst) => ((max as f64 * burst.max_burst_multiplier).floor() as u64).max(max),
            None => max,
        }
    }

    /// Most burst credits a bucket may hold at once.
    ///
    /// Credits beyond `burst_ceiling - max_requests` could never be spent
    /// inside a single window, so accrual stops there.
    pub fn burst_credit_cap(&self) -> u64 {
        self.burst_ceiling() - self.max_requests()
    }

    /// Burst credit lifetime in seconds (zero when burst is disabled).
    pub fn burst_ttl_secs(&self) -> u64 {
        self.burst
            .as_ref()
            .map(|b| b.burst_credit_ttl_seconds)
            .unwrap_or(0)
    }

    /// Window key lifetime in whole seconds, rounded up.
    pub fn window_ttl_secs(&self) -> u64 {
        self.window_ms.div_ceil(1000)
    }
}

/// Builder for [`RateLimitConfig`].
#[derive(Debug, Clone)]
pub struct RateLimitConfigBuilder {
    limit_type: LimitType,
    identifier: String,
    max_requests: u64,
    window_ms: u64,
    cost: u64,
    burst: Option<BurstConfig>,
    tier: Option<TierConfig>,
}

impl RateLimitConfigBuilder {
    /// Maximum admissions (times cost) per window.
    pub fn max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = max_requests;
        self
    }

    /// Window length in milliseconds.
    pub fn window_ms(mut self, window_ms: u64) -> Self {
        self.window_ms = window_ms;
        self
    }

    /// Window length.
    pub fn window(self, window: Duration) -> Self {
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        self.window_ms(window_ms)
    }

    /// Cost charged per admitted request.
    pub fn cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    /// Enable burst credit.
    pub fn burst(mut self, max_burst_multiplier: f64, burst_credit_ttl_seconds: u64) -> Self {
        self.burst = Some(BurstConfig {
            max_burst_multiplier,
            burst_credit_ttl_seconds,
        });
        self
    }

    /// Apply a tier multiplier.
    pub fn tier(mut self, name: impl Into<String>, multiplier: f64) -> Self {
        self.tier = Some(TierConfig {
            name: name.into(),
            multiplier,
        });
        self
    }

    /// Validate and build the policy.
    pub fn build(self) -> Result<RateLimitConfig> {
        let id = self.identifier.as_str();

        if id.is_empty() {
            return Err(SluiceError::invalid_policy(id, "identifier must not be empty"));
        }
        if self.max_requests == 0 {
            return Err(SluiceError::invalid_policy(id, "max_requests must be at least 1"));
        }
        if self.window_ms == 0 {
            return Err(SluiceError::invalid_policy(id, "window_ms must be at least 1"));
        }
        if self.window_ms > MAX_WINDOW_MS {
            return Err(SluiceError::invalid_policy(
                id,
                format!("window_ms must be at most {}, got {}", MAX_WINDOW_MS, self.window_ms),
            ));
        }
        if self.cost == 0 {
            return Err(SluiceError::invalid_policy(id, "cost must be at least 1"));
        }
        if let Some(ref burst) = self.burst {
            if !burst.max_burst_multiplier.is_finite() || burst.max_burst_multiplier < 1.0 {
                return Err(SluiceError::invalid_policy(
                    id,
                    format!(
                        "max_burst_multiplier must be a finite value >= 1.0, got {}",
                        burst.max_burst_multiplier
                    ),
                ));
            }
            if burst.burst_credit_ttl_seconds == 0 {
                return Err(SluiceError::invalid_policy(
                    id,
                    "burst_credit_ttl_seconds must be at least 1",
                ));
            }
            if burst.burst_credit_ttl_seconds > MAX_BURST_TTL_SECS {
                return Err(SluiceError::invalid_policy(
                    id,
                    format!(
                        "burst_credit_ttl_seconds must be at most {}, got {}",
                        MAX_BURST_TTL_SECS, burst.burst_credit_ttl_seconds
                    ),
                ));
            }
        }
        if let Some(ref tier) = self.tier {
            if !tier.multiplier.is_finite() || tier.multiplier <= 0.0 {
                return Err(SluiceError::invalid_policy(
                    id,
                    format!("tier '{}' multiplier must be positive, got {}", tier.name, tier.multiplier),
                ));
            }
        }

        let config = RateLimitConfig {
            limit_type: self.limit_type,
            identifier: self.identifier,
            max_requests: self.max_requests,
            window_ms: self.window_ms,
            cost: self.cost,
            burst: self.burst,
            tier: self.tier,
        };

        // A request costing more than the whole budget would be denied forever.
        if config.cost > config.max_requests() {
            return Err(SluiceError::invalid_policy(
                &config.identifier,
                format!(
                    "cost {} exceeds max_requests {}",
                    config.cost,
                    config.max_requests()
                ),
            ));
        }

        Ok(config)
    }
}
