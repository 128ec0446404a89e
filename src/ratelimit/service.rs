//! The rate limiter service.
//!
//! Admission checks go through the circuit breaker to the shared store. Any
//! failure on that path resolves to a permissive decision, so callers never see
//! an error from a check. Usage is forwarded to monitoring on a detached task
//! once the decision is known; telemetry can neither delay nor change it.

use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::key::RateLimitKey;
use super::policy::{LimitType, RateLimitConfig};
use super::window::{RateLimitInfo, WindowRequest};
use crate::breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
use crate::clock::SharedClock;
use crate::config::SluiceConfig;
use crate::error::Result;
use crate::monitoring::{Alert, Monitoring, UsageMetrics};
use crate::store::{StoreError, WindowStore};

/// Sliding-window rate limiter backed by a shared store.
///
/// Many service instances may share one store; each keeps its own breaker.
pub struct RateLimiterService {
    store: Arc<dyn WindowStore>,
    breaker: CircuitBreaker,
    monitoring: Arc<Monitoring>,
    clock: SharedClock,
    key_prefix: String,
    instance_id: Uuid,
    usage_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RateLimiterService {
    /// Assemble a service from its parts.
    pub fn new(
        store: Arc<dyn WindowStore>,
        breaker: CircuitBreaker,
        monitoring: Arc<Monitoring>,
        clock: SharedClock,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            breaker,
            monitoring,
            clock,
            key_prefix: key_prefix.into(),
            instance_id: Uuid::new_v4(),
            usage_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build a service, its breaker and its monitor from configuration.
    pub fn from_config(config: &SluiceConfig, store: Arc<dyn WindowStore>, clock: SharedClock) -> Self {
        let breaker = CircuitBreaker::new("window-store", &config.breaker, clock.clone());
        let monitoring = Arc::new(Monitoring::new(
            store.clone(),
            clock.clone(),
            config.monitoring.clone(),
        ));
        Self::new(store, breaker, monitoring, clock, config.store.key_prefix.clone())
    }

    /// The monitor usage is forwarded to.
    pub fn monitoring(&self) -> &Arc<Monitoring> {
        &self.monitoring
    }

    fn key(&self, identifier: &str, config: &RateLimitConfig) -> RateLimitKey {
        RateLimitKey::new(&self.key_prefix, config.limit_type(), identifier)
    }

    /// A window member unique across instances and within one millisecond.
    fn member(&self, now_ms: u64) -> String {
        format!("{}-{}-{:016x}", now_ms, self.instance_id.simple(), rand::random::<u64>())
    }

    fn request(&self, identifier: &str, config: &RateLimitConfig, now_ms: u64) -> WindowRequest {
        WindowRequest::new(&self.key(identifier, config), config, now_ms, self.member(now_ms))
    }

    /// Decide whether one request from `identifier` may proceed.
    ///
    /// Never fails: store errors, timeouts and an open circuit all produce the
    /// fail-open decision.
    pub async fn check_rate_limit(&self, identifier: &str, config: &RateLimitConfig) -> RateLimitInfo {
        let now = self.clock.now_ms();
        let request = self.request(identifier, config, now);

        trace!(
            policy = %config.identifier(),
            key = %request.window_key,
            "Checking rate limit"
        );

        let info = self
            .breaker
            .execute(
                || async { self.store.evaluate(&request).await.map(RateLimitInfo::from) },
                || RateLimitInfo::fail_open(config, now),
            )
            .await;

        if !info.allowed {
            debug!(
                policy = %config.identifier(),
                identifier = %identifier,
                limit = info.limit,
                reset_time = info.reset_time,
                "Rate limit exceeded"
            );
        }

        self.forward(vec![(identifier.to_string(), info)], config.limit_type());
        info
    }

    /// Decide for many identities at once, sharing one store round trip.
    ///
    /// Results keep the input order, so repeated identifiers each get their
    /// own decision. If the batch fails as a whole, every identity gets the
    /// fail-open decision.
    pub async fn batch_check_rate_limit(
        &self,
        identifiers: &[String],
        config: &RateLimitConfig,
    ) -> Vec<(String, RateLimitInfo)> {
        if identifiers.is_empty() {
            return Vec::new();
        }

        let now = self.clock.now_ms();
        let requests: Vec<WindowRequest> = identifiers
            .iter()
            .map(|identifier| self.request(identifier, config, now))
            .collect();

        trace!(policy = %config.identifier(), batch = requests.len(), "Checking rate limits");

        let infos = self
            .breaker
            .execute(
                || async {
                    let outcomes = self.store.evaluate_batch(&requests).await?;
                    if outcomes.len() != requests.len() {
                        return Err(StoreError::UnexpectedReply(format!(
                            "expected {} outcomes, got {}",
                            requests.len(),
                            outcomes.len()
                        )));
                    }
                    Ok(outcomes.into_iter().map(RateLimitInfo::from).collect::<Vec<_>>())
                },
                || vec![RateLimitInfo::fail_open(config, now); identifiers.len()],
            )
            .await;

        let results: Vec<(String, RateLimitInfo)> = identifiers.iter().cloned().zip(infos).collect();
        self.forward(results.clone(), config.limit_type());
        results
    }

    /// Forget all window and burst state for one identity.
    ///
    /// Failures are logged and swallowed.
    pub async fn clear_rate_limit(&self, identifier: &str, config: &RateLimitConfig) {
        let key = self.key(identifier, config);
        match self.store.delete(&[key.window_key(), key.burst_key()]).await {
            Ok(()) => debug!(key = %key, "Rate limit cleared"),
            Err(e) => warn!(key = %key, error = %e, "Failed to clear rate limit"),
        }
    }

    /// Usage for a limit type over the last `minutes` minutes.
    pub async fn get_rate_limit_metrics(&self, limit_type: LimitType, minutes: u64) -> Result<UsageMetrics> {
        Ok(self.monitoring.get_metrics(limit_type, minutes).await?)
    }

    /// The most recent alerts for a limit type, newest first.
    pub async fn get_alerts(&self, limit_type: LimitType, limit: usize) -> Result<Vec<Alert>> {
        Ok(self.monitoring.get_alerts(limit_type, limit).await?)
    }

    /// Current breaker state.
    pub fn circuit_breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Current breaker state with counters.
    pub fn circuit_breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    /// Force the breaker closed.
    pub fn reset_circuit_breaker(&self) {
        self.breaker.reset();
    }

    /// Wait for every usage write issued so far to land.
    ///
    /// Checks never wait for monitoring; short-lived callers use this before
    /// exiting so their usage is not lost.
    pub async fn flush_usage(&self) {
        let pending = std::mem::take(&mut *self.usage_tasks.lock());
        for result in join_all(pending).await {
            if let Err(e) = result {
                warn!(error = %e, "Usage recording task failed");
            }
        }
    }

    /// Record decisions on a detached task.
    fn forward(&self, decisions: Vec<(String, RateLimitInfo)>, limit_type: LimitType) {
        let monitoring = self.monitoring.clone();
        let task = tokio::spawn(async move {
            let writes = decisions
                .iter()
                .map(|(identifier, info)| monitoring.record_request(identifier, limit_type, info));
            for result in join_all(writes).await {
                if let Err(e) = result {
                    warn!(limit_type = %limit_type, error = %e, "Failed to record usage");
                }
            }
        });

        let mut tasks = self.usage_tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{BreakerConfig, MonitoringConfig};
    use crate::store::testing::FailingStore;
    use crate::store::MemoryStore;
    use std::time::Duration;

    const START: u64 = 1_700_000_000_000;

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        service: RateLimiterService,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(START));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let service = RateLimiterService::from_config(&SluiceConfig::default(), store.clone(), clock.clone());
        Harness {
            clock,
            store,
            service,
        }
    }

    fn failing(threshold: u32) -> (Arc<ManualClock>, Arc<FailingStore>, RateLimiterService) {
        let clock = Arc::new(ManualClock::new(START));
        let store = Arc::new(FailingStore::new());
        let config = SluiceConfig {
            breaker: BreakerConfig {
                threshold,
                cooldown_ms: 30_000,
                call_timeout_ms: Some(1_000),
            },
            ..SluiceConfig::default()
        };
        let service = RateLimiterService::from_config(&config, store.clone(), clock.clone());
        (clock, store, service)
    }

    fn policy(limit_type: LimitType, max: u64, window_ms: u64) -> RateLimitConfig {
        RateLimitConfig::builder(limit_type, "test")
            .max_requests(max)
            .window_ms(window_ms)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_admits_up_to_limit_then_denies() {
        let h = harness();
        let config = policy(LimitType::Ip, 3, 1_000);

        let mut decisions = Vec::new();
        for _ in 0..4 {
            decisions.push(h.service.check_rate_limit("1.2.3.4", &config).await);
        }

        let allowed: Vec<bool> = decisions.iter().map(|d| d.allowed).collect();
        assert_eq!(allowed, vec![true, true, true, false]);
        assert_eq!(decisions[0].remaining, 2);
        assert_eq!(decisions[2].remaining, 0);
        assert_eq!(decisions[3].remaining, 0);
        assert_eq!(decisions[3].reset_time, START + 1_000);
        assert!(decisions.iter().all(|d| d.limit == 3));
    }

    #[tokio::test]
    async fn test_window_slides() {
        let h = harness();
        let config = policy(LimitType::User, 2, 1_000);

        assert!(h.service.check_rate_limit("u", &config).await.allowed);
        h.clock.advance(Duration::from_millis(600));
        assert!(h.service.check_rate_limit("u", &config).await.allowed);
        assert!(!h.service.check_rate_limit("u", &config).await.allowed);

        // The first entry ages out, the second does not.
        h.clock.advance(Duration::from_millis(401));
        let decision = h.service.check_rate_limit("u", &config).await;
        assert!(decision.allowed);
        assert!(!h.service.check_rate_limit("u", &config).await.allowed);
    }

    #[tokio::test]
    async fn test_identities_and_types_are_isolated() {
        let h = harness();
        let ip = policy(LimitType::Ip, 1, 1_000);
        let user = policy(LimitType::User, 1, 1_000);

        assert!(h.service.check_rate_limit("a", &ip).await.allowed);
        assert!(!h.service.check_rate_limit("a", &ip).await.allowed);
        assert!(h.service.check_rate_limit("b", &ip).await.allowed);
        assert!(h.service.check_rate_limit("a", &user).await.allowed);
    }

    #[tokio::test]
    async fn test_identity_with_separator_stays_limited() {
        let h = harness();
        let config = RateLimitConfig::builder(LimitType::Endpoint, "test")
            .max_requests(2)
            .window_ms(60_000)
            .burst(2.0, 60)
            .build()
            .unwrap();

        // Give "/v1/x" a live window and burst counter first.
        assert!(h.service.check_rate_limit("/v1/x", &config).await.allowed);
        assert!(h.service.check_rate_limit("/v1/x", &config).await.allowed);

        // An identity spelled like another bucket's sub-key behaves exactly
        // like an unrelated fresh identity.
        let mut suffixed = Vec::new();
        let mut fresh = Vec::new();
        for _ in 0..8 {
            suffixed.push(h.service.check_rate_limit("/v1/x:burst", &config).await);
            fresh.push(h.service.check_rate_limit("/v1/y", &config).await);
        }
        assert_eq!(suffixed, fresh);
        assert!(suffixed.iter().any(|d| !d.allowed));
        assert!(suffixed.iter().filter(|d| d.allowed).count() as u64 <= config.burst_ceiling());
        assert_eq!(h.service.circuit_breaker_state(), CircuitState::Closed);

        // The original bucket is still enforced on its own budget.
        let mut denied = false;
        for _ in 0..4 {
            denied |= !h.service.check_rate_limit("/v1/x", &config).await.allowed;
        }
        assert!(denied);
    }

    #[tokio::test]
    async fn test_decision_invariants_hold() {
        let h = harness();
        let config = RateLimitConfig::builder(LimitType::Endpoint, "test")
            .max_requests(5)
            .window_ms(1_000)
            .burst(2.0, 60)
            .build()
            .unwrap();

        for i in 0..60u64 {
            let decision = h.service.check_rate_limit("/search", &config).await;
            assert!(decision.remaining <= decision.limit);
            assert!(decision.limit <= config.burst_ceiling());
            if !decision.allowed {
                assert_eq!(decision.remaining, 0);
            }
            h.clock.advance(Duration::from_millis(37 * (i % 5)));
        }
    }

    #[tokio::test]
    async fn test_clear_resets_bucket() {
        let h = harness();
        let config = RateLimitConfig::builder(LimitType::Ip, "test")
            .max_requests(2)
            .window_ms(60_000)
            .burst(2.0, 60)
            .build()
            .unwrap();

        h.service.check_rate_limit("ip", &config).await;
        h.service.check_rate_limit("ip", &config).await;
        let key = RateLimitKey::new(DEFAULT_PREFIX, LimitType::Ip, "ip");
        assert!(h.store.contains_key(&key.window_key()));
        assert!(h.store.contains_key(&key.burst_key()));

        h.service.clear_rate_limit("ip", &config).await;
        assert!(!h.store.contains_key(&key.window_key()));
        assert!(!h.store.contains_key(&key.burst_key()));

        let decision = h.service.check_rate_limit("ip", &config).await;
        assert!(decision.allowed);
        assert_eq!(decision.limit, 2);
        assert_eq!(decision.remaining, 1);
    }

    const DEFAULT_PREFIX: &str = crate::ratelimit::key::DEFAULT_KEY_PREFIX;

    #[tokio::test]
    async fn test_clear_swallows_store_errors() {
        let (_clock, store, service) = failing(5);
        service.clear_rate_limit("ip", &policy(LimitType::Ip, 1, 1_000)).await;
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let (_clock, _store, service) = failing(5);
        let config = policy(LimitType::Ip, 10, 5_000);

        let decision = service.check_rate_limit("ip", &config).await;
        assert_eq!(decision, RateLimitInfo::new(true, 1, START + 5_000, 10));
    }

    #[tokio::test]
    async fn test_breaker_opens_and_short_circuits() {
        let (clock, store, service) = failing(3);
        let config = policy(LimitType::Ip, 10, 1_000);

        for _ in 0..3 {
            assert!(service.check_rate_limit("ip", &config).await.allowed);
        }
        assert_eq!(service.circuit_breaker_state(), CircuitState::Open);

        service.flush_usage().await;
        let before = store.calls();
        assert!(service.check_rate_limit("ip", &config).await.allowed);
        service.flush_usage().await;
        // Only the monitoring write reached the store.
        assert_eq!(store.calls(), before + 1);

        clock.advance(Duration::from_secs(30));
        assert_eq!(service.circuit_breaker_state(), CircuitState::HalfOpen);

        service.reset_circuit_breaker();
        let snapshot = service.circuit_breaker_snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
    }

    #[tokio::test]
    async fn test_batch_preserves_order_and_duplicates() {
        let h = harness();
        let config = policy(LimitType::User, 2, 1_000);
        let ids: Vec<String> = ["a", "b", "a", "a"].iter().map(|s| s.to_string()).collect();

        let results = h.service.batch_check_rate_limit(&ids, &config).await;
        let summary: Vec<(&str, bool)> = results.iter().map(|(id, info)| (id.as_str(), info.allowed)).collect();
        assert_eq!(summary, vec![("a", true), ("b", true), ("a", true), ("a", false)]);

        assert!(h.service.batch_check_rate_limit(&[], &config).await.is_empty());
    }

    #[tokio::test]
    async fn test_batch_fails_open_as_a_whole() {
        let (_clock, _store, service) = failing(5);
        let config = policy(LimitType::Ip, 4, 1_000);
        let ids: Vec<String> = vec!["x".into(), "y".into(), "z".into()];

        let results = service.batch_check_rate_limit(&ids, &config).await;
        assert_eq!(results.len(), 3);
        for ((id, info), expected) in results.iter().zip(&ids) {
            assert_eq!(id, expected);
            assert_eq!(*info, RateLimitInfo::fail_open(&config, START));
        }
    }

    #[tokio::test]
    async fn test_usage_is_forwarded_to_monitoring() {
        let h = harness();
        let config = policy(LimitType::Endpoint, 1, 1_000);

        h.service.check_rate_limit("/a", &config).await;
        h.service.check_rate_limit("/a", &config).await;

        h.service.flush_usage().await;
        let metrics = h.service.get_rate_limit_metrics(LimitType::Endpoint, 1).await.unwrap();
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.blocked_requests, 1);
        assert_eq!(metrics.unique_identifiers, 1);

        let alerts = h.service.get_alerts(LimitType::Endpoint, 10).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].identifier, "/a");
    }

    #[tokio::test]
    async fn test_monitoring_failure_does_not_change_decision() {
        let clock = Arc::new(ManualClock::new(START));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let monitoring = Arc::new(Monitoring::new(
            Arc::new(FailingStore::new()),
            clock.clone(),
            MonitoringConfig::default(),
        ));
        let breaker = CircuitBreaker::new("test", &BreakerConfig::default(), clock.clone());
        let service = RateLimiterService::new(store, breaker, monitoring, clock, DEFAULT_PREFIX);
        let config = policy(LimitType::Ip, 1, 1_000);

        assert!(service.check_rate_limit("ip", &config).await.allowed);
        assert!(!service.check_rate_limit("ip", &config).await.allowed);
        assert_eq!(service.circuit_breaker_state(), CircuitState::Closed);
        assert!(service.get_rate_limit_metrics(LimitType::Ip, 1).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_never_overshoot() {
        let h = harness();
        let service = Arc::new(h.service);
        let config = Arc::new(policy(LimitType::User, 10, 60_000));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let service = service.clone();
                let config = config.clone();
                tokio::spawn(async move { service.check_rate_limit("shared", &config).await })
            })
            .collect();

        let mut allowed = 0;
        for task in join_all(tasks).await {
            if task.unwrap().allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }
}
