//! Request admission for HTTP-style front ends.
//!
//! [`AdmissionGuard`] maps an inbound request to a bucket identity, asks the
//! rate limiter for a decision and turns it into standard rate limit headers,
//! or into a `429 Too Many Requests` rejection with a `Retry-After` hint.

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument};

use crate::clock::SharedClock;
use crate::ratelimit::{LimitType, RateLimitConfig, RateLimitInfo, RateLimiterService};

/// Status code of a rejected request.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Identity used when a request carries none for the policy's limit type.
pub const ANONYMOUS: &str = "anonymous";

/// The parts of an inbound request that can identify a caller.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Peer address, used by [`LimitType::Ip`] policies
    pub client_ip: Option<IpAddr>,
    /// Authenticated user, used by [`LimitType::User`] policies
    pub user_id: Option<String>,
    /// Route or path, used by [`LimitType::Endpoint`] policies
    pub endpoint: Option<String>,
    /// Caller-supplied identity for [`LimitType::Custom`] policies
    pub custom: Option<String>,
}

impl RequestContext {
    /// The bucket identity for the given limit type.
    ///
    /// Requests without a matching identity share the [`ANONYMOUS`] bucket.
    pub fn identifier(&self, limit_type: LimitType) -> String {
        let identity = match limit_type {
            LimitType::Ip => self.client_ip.map(|ip| ip.to_string()),
            LimitType::User => self.user_id.clone(),
            LimitType::Endpoint => self.endpoint.clone(),
            LimitType::Custom => self.custom.clone(),
        };
        identity
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| ANONYMOUS.to_string())
    }
}

/// Headers describing the caller's budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitHeaders {
    /// `X-RateLimit-Limit`
    pub limit: u64,
    /// `X-RateLimit-Remaining`
    pub remaining: u64,
    /// `X-RateLimit-Reset`, in epoch seconds
    pub reset: u64,
}

impl RateLimitHeaders {
    pub fn from_info(info: &RateLimitInfo) -> Self {
        Self {
            limit: info.limit,
            remaining: info.remaining,
            reset: info.reset_time.div_ceil(1000),
        }
    }

    /// Header name and value pairs.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset.to_string()),
        ]
    }
}

/// A denied request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub status: u16,
    pub headers: RateLimitHeaders,
    /// Whole seconds until the window frees up (at least one)
    pub retry_after_secs: u64,
    pub message: String,
}

impl Rejection {
    fn new(info: &RateLimitInfo, now_ms: u64) -> Self {
        let retry_after_secs = info.reset_time.saturating_sub(now_ms).div_ceil(1000).max(1);
        Self {
            status: TOO_MANY_REQUESTS,
            headers: RateLimitHeaders::from_info(info),
            retry_after_secs,
            message: format!("Rate limit exceeded, retry in {} seconds", retry_after_secs),
        }
    }

    /// Rate limit headers plus `Retry-After`.
    pub fn header_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = self.headers.pairs();
        pairs.push(("Retry-After", self.retry_after_secs.to_string()));
        pairs
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.status, self.message)
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Proceed, attaching these headers to the response
    Allow(RateLimitHeaders),
    /// Respond with the rejection instead of running the handler
    Reject(Rejection),
}

/// What happens to a request's budget when its handler fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefundPolicy {
    /// Every admitted request counts
    #[default]
    Never,
    /// Failed requests are given back by clearing the caller's bucket
    OnFailure,
}

/// A handler's result together with the headers to send.
#[derive(Debug)]
pub struct Admitted<T> {
    /// What the handler returned
    pub outcome: T,
    /// Budget headers from the admission check
    pub headers: RateLimitHeaders,
}

/// Rate limit guard for request handlers.
pub struct AdmissionGuard {
    limiter: Arc<RateLimiterService>,
    clock: SharedClock,
    refund: RefundPolicy,
}

impl AdmissionGuard {
    pub fn new(limiter: Arc<RateLimiterService>, clock: SharedClock) -> Self {
        Self {
            limiter,
            clock,
            refund: RefundPolicy::default(),
        }
    }

    /// Set the refund policy.
    pub fn with_refund(mut self, refund: RefundPolicy) -> Self {
        self.refund = refund;
        self
    }

    /// Check a request against a policy.
    #[instrument(skip(self, request, config), fields(policy = %config.identifier()))]
    pub async fn admit(&self, request: &RequestContext, config: &RateLimitConfig) -> AdmissionDecision {
        let identifier = request.identifier(config.limit_type());
        self.admit_identifier(&identifier, config).await
    }

    async fn admit_identifier(&self, identifier: &str, config: &RateLimitConfig) -> AdmissionDecision {
        let info = self.limiter.check_rate_limit(identifier, config).await;
        if info.allowed {
            AdmissionDecision::Allow(RateLimitHeaders::from_info(&info))
        } else {
            let rejection = Rejection::new(&info, self.clock.now_ms());
            debug!(
                identifier = %identifier,
                retry_after = rejection.retry_after_secs,
                "Request rejected"
            );
            AdmissionDecision::Reject(rejection)
        }
    }

    /// Run `handler` if the request is admitted.
    ///
    /// Under [`RefundPolicy::OnFailure`] a handler error clears the caller's
    /// bucket, returning all of its consumed budget.
    pub async fn run<T, E, Fut>(
        &self,
        request: &RequestContext,
        config: &RateLimitConfig,
        handler: Fut,
    ) -> Result<Admitted<Result<T, E>>, Rejection>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let identifier = request.identifier(config.limit_type());
        let headers = match self.admit_identifier(&identifier, config).await {
            AdmissionDecision::Allow(headers) => headers,
            AdmissionDecision::Reject(rejection) => return Err(rejection),
        };

        let outcome = handler.await;
        if outcome.is_err() && self.refund == RefundPolicy::OnFailure {
            debug!(identifier = %identifier, "Handler failed, refunding budget");
            self.limiter.clear_rate_limit(&identifier, config).await;
        }

        Ok(Admitted { outcome, headers })
    }
}
