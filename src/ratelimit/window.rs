//! Sliding-window-with-burst-credit admission algorithm.
//!
//! The algorithm keeps a log of admission markers per bucket (scored by the
//! admission timestamp) plus a side counter of burst credit. Callers that stay
//! under their nominal budget earn credit, which temporarily lifts the
//! effective limit up to `max_requests * max_burst_multiplier`.
//!
//! Evaluation must happen as one indivisible step against the shared store;
//! the Redis backend runs it as a server-side script and the in-memory
//! backend runs [`evaluate`] under its keyspace lock.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::key::RateLimitKey;
use super::policy::RateLimitConfig;
use crate::store::StoreError;

/// Everything the store needs to evaluate one admission atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRequest {
    /// Ordered set of admission markers
    pub window_key: String,
    /// Burst credit counter
    pub burst_key: String,
    /// Evaluation time in milliseconds since the epoch
    pub now_ms: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Nominal limit (tier already applied)
    pub max_requests: u64,
    /// Cost per admission
    pub cost: u64,
    /// `floor(max_requests * max_burst_multiplier)`
    pub burst_ceiling: u64,
    /// Most credit a bucket may hold
    pub burst_credit_cap: u64,
    /// Burst counter lifetime in seconds
    pub burst_ttl_secs: u64,
    /// Window set lifetime in seconds
    pub window_ttl_secs: u64,
    /// Unique marker inserted on admission
    pub member: String,
}

impl WindowRequest {
    /// Build the request for a bucket under a policy.
    pub fn new(key: &RateLimitKey, config: &RateLimitConfig, now_ms: u64, member: String) -> Self {
        Self {
            window_key: key.window_key(),
            burst_key: key.burst_key(),
            now_ms,
            window_ms: config.window_ms(),
            max_requests: config.max_requests(),
            cost: config.cost(),
            burst_ceiling: config.burst_ceiling(),
            burst_credit_cap: config.burst_credit_cap(),
            burst_ttl_secs: config.burst_ttl_secs(),
            window_ttl_secs: config.window_ttl_secs(),
            member,
        }
    }
}

/// Raw result of one window evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Whether the request was admitted
    pub allowed: bool,
    /// When the caller may expect capacity again (ms epoch)
    pub reset_time_ms: u64,
    /// Budget left after this request
    pub remaining: u64,
    /// Limit in force for this evaluation (burst included)
    pub effective_limit: u64,
}

impl WindowOutcome {
    /// Decode the four-integer reply produced by the store script.
    pub fn from_reply(reply: (i64, i64, i64, i64)) -> Result<Self, StoreError> {
        let (allowed, reset_time, remaining, effective_limit) = reply;

        let non_negative = |name: &str, value: i64| {
            u64::try_from(value).map_err(|_| {
                StoreError::UnexpectedReply(format!("negative {} in window reply: {}", name, value))
            })
        };

        let allowed = match allowed {
            0 => false,
            1 => true,
            other => {
                return Err(StoreError::UnexpectedReply(format!(
                    "allowed flag must be 0 or 1, got {}",
                    other
                )))
            }
        };

        Ok(Self {
            allowed,
            reset_time_ms: non_negative("reset time", reset_time)?,
            remaining: non_negative("remaining", remaining)?,
            effective_limit: non_negative("limit", effective_limit)?,
        })
    }
}

/// The admission decision handed back to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Budget left in the current window
    pub remaining: u64,
    /// When the window frees up (ms epoch)
    pub reset_time: u64,
    /// Limit in force
    pub limit: u64,
}

impl RateLimitInfo {
    /// Build a decision, clamping it to the `remaining <= limit` and
    /// "denied means nothing remaining" invariants.
    pub fn new(allowed: bool, remaining: u64, reset_time: u64, limit: u64) -> Self {
        let remaining = if allowed { remaining.min(limit) } else { 0 };
        Self {
            allowed,
            remaining,
            reset_time,
            limit,
        }
    }

    /// The permissive decision used when the store cannot be consulted.
    pub fn fail_open(config: &RateLimitConfig, now_ms: u64) -> Self {
        let limit = config.max_requests();
        Self::new(true, 1, now_ms.saturating_add(config.window_ms()), limit)
    }
}

impl From<WindowOutcome> for RateLimitInfo {
    fn from(outcome: WindowOutcome) -> Self {
        RateLimitInfo::new(
            outcome.allowed,
            outcome.remaining,
            outcome.reset_time_ms,
            outcome.effective_limit,
        )
    }
}

/// Side effects of an evaluation on the burst counter and window set, so a
/// store can maintain key lifetimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    /// The decision
    pub outcome: WindowOutcome,
    /// A marker was inserted into the window set
    pub admitted: bool,
    /// The burst counter was incremented (its TTL must be refreshed)
    pub accrued_credit: bool,
}

/// Evaluate one admission against a bucket's window log and burst credit.
///
/// `entries` holds `(score, member)` pairs; `burst_credits` is the current
/// counter value (zero when the key is absent). Both are mutated in place.
pub fn evaluate(
    entries: &mut BTreeSet<(u64, String)>,
    burst_credits: &mut u64,
    request: &WindowRequest,
) -> Evaluation {
    let now = request.now_ms;
    let cutoff = now.saturating_sub(request.window_ms);

    // Drop admissions that slid out of the window.
    entries.retain(|(score, _)| *score >= cutoff);

    let count = entries.len() as u64;

    let mut effective_limit = request.max_requests;
    if *burst_credits > 0 {
        effective_limit = request
            .burst_ceiling
            .min(request.max_requests.saturating_add(*burst_credits));
        *burst_credits -= 1;
    }

    let used = count.saturating_mul(request.cost);
    if used >= effective_limit {
        let reset_time_ms = entries
            .iter()
            .next()
            .map(|(oldest, _)| oldest.saturating_add(request.window_ms))
            .unwrap_or(now.saturating_add(request.window_ms));

        return Evaluation {
            outcome: WindowOutcome {
                allowed: false,
                reset_time_ms,
                remaining: 0,
                effective_limit,
            },
            admitted: false,
            accrued_credit: false,
        };
    }

    entries.insert((now, request.member.clone()));

    let mut accrued_credit = false;
    if used < request.max_requests && *burst_credits < request.burst_credit_cap {
        *burst_credits += 1;
        accrued_credit = true;
    }

    let remaining = effective_limit.saturating_sub((count + 1).saturating_mul(request.cost));

    Evaluation {
        outcome: WindowOutcome {
            allowed: true,
            reset_time_ms: now.saturating_add(request.window_ms),
            remaining,
            effective_limit,
        },
        admitted: true,
        accrued_credit,
    }
}
