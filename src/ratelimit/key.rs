//! Bucket key derivation.

use super::policy::LimitType;

/// Default prefix for rate limit keys in the shared store.
pub const DEFAULT_KEY_PREFIX: &str = "rate_limit";

const WINDOW_TAG: &str = "w";
const BURST_TAG: &str = "b";

/// A key that uniquely identifies a rate limit bucket.
///
/// Each bucket owns two store keys: the window key (ordered set of admission
/// markers) and the burst key (scalar credit counter). Both are derived
/// deterministically from the limit type and the caller identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Store namespace
    pub prefix: String,
    /// The kind of identity
    pub limit_type: LimitType,
    /// The caller identity
    pub identifier: String,
}

impl RateLimitKey {
    /// Create a key for the given identity.
    pub fn new(prefix: &str, limit_type: LimitType, identifier: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            limit_type,
            identifier: identifier.to_string(),
        }
    }

    /// The ordered-set key holding admission markers.
    pub fn window_key(&self) -> String {
        self.sub_key(WINDOW_TAG)
    }

    /// The counter key holding accumulated burst credit.
    pub fn burst_key(&self) -> String {
        self.sub_key(BURST_TAG)
    }

    // The tag precedes the identity, so identities containing ':' cannot
    // reach another bucket's keys.
    fn sub_key(&self, tag: &str) -> String {
        format!("{}:{}:{}:{}", self.prefix, self.limit_type, tag, self.identifier)
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.limit_type, self.identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_derivation() {
        let key = RateLimitKey::new(DEFAULT_KEY_PREFIX, LimitType::Ip, "10.0.0.1");

        assert_eq!(key.window_key(), "rate_limit:ip:w:10.0.0.1");
        assert_eq!(key.burst_key(), "rate_limit:ip:b:10.0.0.1");
        assert_eq!(key.to_string(), "ip:10.0.0.1");
    }

    #[test]
    fn test_types_do_not_collide() {
        let ip = RateLimitKey::new("rl", LimitType::Ip, "alice");
        let user = RateLimitKey::new("rl", LimitType::User, "alice");

        assert_ne!(ip, user);
        assert_ne!(ip.window_key(), user.window_key());
        assert_ne!(ip.burst_key(), user.burst_key());
    }

    #[test]
    fn test_identities_with_separators_do_not_collide() {
        let plain = RateLimitKey::new("rl", LimitType::Endpoint, "/v1/x");
        let suffixed = RateLimitKey::new("rl", LimitType::Endpoint, "/v1/x:burst");
        let tagged = RateLimitKey::new("rl", LimitType::Endpoint, "b:/v1/x");

        let keys = [
            plain.window_key(),
            plain.burst_key(),
            suffixed.window_key(),
            suffixed.burst_key(),
            tagged.window_key(),
            tagged.burst_key(),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in &keys[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
