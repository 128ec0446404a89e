//! Rate limiting policies, keys and the sliding-window algorithm.

pub mod key;
pub mod policy;
pub mod rules;
mod service;
pub mod window;

pub use key::RateLimitKey;
pub use policy::{BurstConfig, LimitType, RateLimitConfig, RateLimitConfigBuilder, TierConfig};
pub use rules::{PolicyDefinition, PolicySet, TimeUnit};
pub use service::RateLimiterService;
pub use window::{RateLimitInfo, WindowOutcome, WindowRequest};
