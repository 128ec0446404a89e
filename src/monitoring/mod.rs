//! Usage monitoring and alerting.
//!
//! Every admission decision is folded into a per-minute bucket for its limit
//! type: a total counter, a blocked counter, and a set of the identities seen
//! that minute. Denials close to the limit also append an alert to a bounded
//! per-type list. Counters are approximate telemetry; writes for one decision
//! are pipelined together but nothing is atomic across decisions.

mod alert;

pub use alert::{Alert, AlertKind};

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, trace, warn};

use crate::clock::SharedClock;
use crate::config::MonitoringConfig;
use crate::ratelimit::{LimitType, RateLimitInfo};
use crate::store::{StoreError, StoreOp, WindowStore};

const MINUTE_MS: u64 = 60_000;

/// Aggregated usage over a span of minutes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetrics {
    /// Decisions recorded
    pub total_requests: u64,
    /// Denials recorded
    pub blocked_requests: u64,
    /// Sum of per-minute distinct identities (an upper bound on the true
    /// number of distinct identities across the span)
    pub unique_identifiers: u64,
    /// `total_requests / minutes`
    pub avg_requests_per_minute: f64,
}

/// Store keys of one per-minute bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MinuteKeys {
    total: String,
    blocked: String,
    identifiers: String,
}

/// Records usage and raises alerts.
pub struct Monitoring {
    store: Arc<dyn WindowStore>,
    clock: SharedClock,
    config: MonitoringConfig,
}

impl Monitoring {
    /// Create a monitor writing to `store`.
    pub fn new(store: Arc<dyn WindowStore>, clock: SharedClock, config: MonitoringConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Monitoring configuration.
    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    fn current_minute(&self) -> u64 {
        self.clock.now_ms() / MINUTE_MS
    }

    fn minute_keys(&self, limit_type: LimitType, minute: u64) -> MinuteKeys {
        let base = format!("{}:{}:{}", self.config.key_prefix, limit_type, minute);
        MinuteKeys {
            total: format!("{}:total", base),
            blocked: format!("{}:blocked", base),
            identifiers: format!("{}:identifiers", base),
        }
    }

    fn alerts_key(&self, limit_type: LimitType) -> String {
        format!("{}:alerts:{}", self.config.key_prefix, limit_type)
    }

    /// Record one admission decision.
    pub async fn record_request(
        &self,
        identifier: &str,
        limit_type: LimitType,
        info: &RateLimitInfo,
    ) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let keys = self.minute_keys(limit_type, now / MINUTE_MS);

        let mut ops = vec![StoreOp::Incr {
            key: keys.total,
            by: 1,
        }];

        if !info.allowed {
            ops.push(StoreOp::Incr {
                key: keys.blocked,
                by: 1,
            });

            if (info.remaining as f64) < info.limit as f64 * self.config.high_usage_ratio {
                let alert = Alert {
                    timestamp: now,
                    identifier: identifier.to_string(),
                    limit_type,
                    kind: AlertKind::HighUsage {
                        remaining: info.remaining,
                        limit: info.limit,
                    },
                };
                let alerts_key = self.alerts_key(limit_type);
                let payload = serde_json::to_string(&alert)
                    .map_err(|e| StoreError::Command(format!("failed to encode alert: {}", e)))?;

                debug!(identifier = %identifier, limit_type = %limit_type, "High usage alert");
                ops.push(StoreOp::ListPush {
                    key: alerts_key.clone(),
                    value: payload,
                });
                ops.push(StoreOp::ListTrim {
                    key: alerts_key,
                    keep: self.config.alert_history,
                });
            }
        }

        ops.push(StoreOp::SetAdd {
            key: keys.identifiers,
            member: identifier.to_string(),
        });

        trace!(identifier = %identifier, ops = ops.len(), "Recording usage");
        self.store.pipeline(&ops).await
    }

    /// Aggregate the last `minutes` per-minute buckets (current minute
    /// included). A span of zero is treated as one minute.
    pub async fn get_metrics(
        &self,
        limit_type: LimitType,
        minutes: u64,
    ) -> Result<UsageMetrics, StoreError> {
        let minutes = minutes.max(1);
        let current = self.current_minute();

        let buckets: Vec<MinuteKeys> = (0..minutes)
            .map_while(|offset| current.checked_sub(offset))
            .map(|minute| self.minute_keys(limit_type, minute))
            .collect();

        let mut counter_keys: Vec<String> = buckets.iter().map(|k| k.total.clone()).collect();
        counter_keys.extend(buckets.iter().map(|k| k.blocked.clone()));
        let set_keys: Vec<String> = buckets.iter().map(|k| k.identifiers.clone()).collect();

        let counters = self.store.counters(&counter_keys).await?;
        let cardinalities = self.store.set_cardinalities(&set_keys).await?;

        let (totals, blocked) = counters.split_at(buckets.len().min(counters.len()));
        let total_requests: u64 = totals.iter().sum();
        let blocked_requests: u64 = blocked.iter().sum();
        let unique_identifiers: u64 = cardinalities.iter().sum();

        Ok(UsageMetrics {
            total_requests,
            blocked_requests,
            unique_identifiers,
            avg_requests_per_minute: total_requests as f64 / minutes as f64,
        })
    }

    /// Most recent alerts for a limit type, newest first.
    pub async fn get_alerts(&self, limit_type: LimitType, limit: usize) -> Result<Vec<Alert>, StoreError> {
        let raw = self.store.list_range(&self.alerts_key(limit_type), limit).await?;

        Ok(raw
            .iter()
            .filter_map(|payload| match serde_json::from_str::<Alert>(payload) {
                Ok(alert) => Some(alert),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed alert record");
                    None
                }
            })
            .collect())
    }

    /// Delete per-minute buckets that fell out of the retention window.
    ///
    /// Keys are enumerated explicitly: for every limit type, the
    /// `cleanup_sweep_minutes` minutes ending at `now - retention_minutes`.
    /// Returns the number of keys targeted.
    pub async fn cleanup(&self, retention_minutes: u64) -> Result<usize, StoreError> {
        let current = self.current_minute();
        let Some(newest_expired) = current.checked_sub(retention_minutes) else {
            return Ok(0);
        };

        let keys: Vec<String> = (0..self.config.cleanup_sweep_minutes.max(1))
            .map_while(|offset| newest_expired.checked_sub(offset))
            .flat_map(|minute| {
                LimitType::ALL.into_iter().flat_map(move |limit_type| {
                    let keys = self.minute_keys(limit_type, minute);
                    [keys.total, keys.blocked, keys.identifiers]
                })
            })
            .collect();

        if keys.is_empty() {
            return Ok(0);
        }

        self.store.delete(&keys).await?;
        debug!(keys = keys.len(), newest_expired, "Expired metric buckets cleaned up");
        Ok(keys.len())
    }

    /// Run [`Monitoring::cleanup`] every `cleanup_interval_ms` until
    /// `shutdown` resolves.
    pub fn spawn_cleanup<S>(self: Arc<Self>, shutdown: S) -> JoinHandle<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let interval = self.config.cleanup_interval();
            let retention = self.config.retention_minutes;
            let mut ticks = IntervalStream::new(tokio::time::interval(interval));
            tokio::pin!(shutdown);

            info!(interval = ?interval, retention_minutes = retention, "Metric cleanup started");

            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    tick = ticks.next() => {
                        if tick.is_none() {
                            break;
                        }
                        if let Err(e) = self.cleanup(retention).await {
                            warn!(error = %e, "Metric cleanup failed");
                        }
                    }
                }
            }

            info!("Metric cleanup stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::store::testing::FailingStore;
    use crate::store::MemoryStore;
    use std::time::Duration;

    const START: u64 = 1_700_000_000_000;

    fn monitoring() -> (Arc<ManualClock>, Arc<MemoryStore>, Monitoring) {
        let clock = Arc::new(ManualClock::new(START));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let monitoring = Monitoring::new(store.clone(), clock.clone(), MonitoringConfig::default());
        (clock, store, monitoring)
    }

    fn allowed() -> RateLimitInfo {
        RateLimitInfo::new(true, 9, START + 1_000, 10)
    }

    fn denied() -> RateLimitInfo {
        RateLimitInfo::new(false, 0, START + 1_000, 10)
    }

    #[tokio::test]
    async fn test_one_denied_one_allowed() {
        let (_clock, _store, monitoring) = monitoring();

        monitoring.record_request("a", LimitType::Ip, &denied()).await.unwrap();
        monitoring.record_request("b", LimitType::Ip, &allowed()).await.unwrap();

        let metrics = monitoring.get_metrics(LimitType::Ip, 1).await.unwrap();
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.blocked_requests, 1);
        assert_eq!(metrics.unique_identifiers, 2);
        assert_eq!(metrics.avg_requests_per_minute, 2.0);
    }

    #[tokio::test]
    async fn test_types_are_separate() {
        let (_clock, _store, monitoring) = monitoring();

        monitoring.record_request("a", LimitType::Ip, &allowed()).await.unwrap();
        monitoring.record_request("a", LimitType::User, &allowed()).await.unwrap();

        assert_eq!(monitoring.get_metrics(LimitType::Ip, 5).await.unwrap().total_requests, 1);
        assert_eq!(monitoring.get_metrics(LimitType::Endpoint, 5).await.unwrap().total_requests, 0);
    }

    #[tokio::test]
    async fn test_unique_identifiers_sum_across_minutes() {
        let (clock, _store, monitoring) = monitoring();

        monitoring.record_request("a", LimitType::User, &allowed()).await.unwrap();
        monitoring.record_request("a", LimitType::User, &allowed()).await.unwrap();
        clock.advance(Duration::from_secs(60));
        monitoring.record_request("a", LimitType::User, &allowed()).await.unwrap();

        let metrics = monitoring.get_metrics(LimitType::User, 2).await.unwrap();
        assert_eq!(metrics.total_requests, 3);
        // Same identity in two minutes counts twice.
        assert_eq!(metrics.unique_identifiers, 2);
        assert_eq!(metrics.avg_requests_per_minute, 1.5);

        let last_minute = monitoring.get_metrics(LimitType::User, 1).await.unwrap();
        assert_eq!(last_minute.total_requests, 1);
    }

    #[tokio::test]
    async fn test_denial_raises_alert() {
        let (clock, _store, monitoring) = monitoring();

        monitoring.record_request("first", LimitType::Ip, &denied()).await.unwrap();
        clock.advance(Duration::from_millis(5));
        monitoring.record_request("second", LimitType::Ip, &denied()).await.unwrap();
        monitoring.record_request("ok", LimitType::Ip, &allowed()).await.unwrap();

        let alerts = monitoring.get_alerts(LimitType::Ip, 10).await.unwrap();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].identifier, "second");
        assert_eq!(alerts[0].timestamp, START + 5);
        assert_eq!(alerts[1].identifier, "first");
        assert_eq!(
            alerts[1].kind,
            AlertKind::HighUsage {
                remaining: 0,
                limit: 10
            }
        );

        assert_eq!(monitoring.get_alerts(LimitType::Ip, 1).await.unwrap().len(), 1);
        assert!(monitoring.get_alerts(LimitType::User, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_alert_history_is_bounded() {
        let clock = Arc::new(ManualClock::new(START));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let config = MonitoringConfig {
            alert_history: 3,
            ..MonitoringConfig::default()
        };
        let monitoring = Monitoring::new(store, clock, config);

        for i in 0..5 {
            monitoring
                .record_request(&format!("id-{}", i), LimitType::Endpoint, &denied())
                .await
                .unwrap();
        }

        let alerts = monitoring.get_alerts(LimitType::Endpoint, 100).await.unwrap();
        let ids: Vec<&str> = alerts.iter().map(|a| a.identifier.as_str()).collect();
        assert_eq!(ids, vec!["id-4", "id-3", "id-2"]);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired_buckets() {
        let (clock, store, monitoring) = monitoring();

        monitoring.record_request("old", LimitType::Ip, &denied()).await.unwrap();
        let old_keys = monitoring.minute_keys(LimitType::Ip, START / MINUTE_MS);

        clock.advance(Duration::from_secs(60 * 10));
        monitoring.record_request("new", LimitType::Ip, &allowed()).await.unwrap();
        let new_keys = monitoring.minute_keys(LimitType::Ip, clock.now_ms() / MINUTE_MS);

        // With eleven minutes of retention the old bucket is still current enough.
        let targeted = monitoring.cleanup(11).await.unwrap();
        assert!(targeted > 0);
        assert!(store.contains_key(&old_keys.total));

        monitoring.cleanup(10).await.unwrap();
        assert!(!store.contains_key(&old_keys.total));
        assert!(!store.contains_key(&old_keys.blocked));
        assert!(!store.contains_key(&old_keys.identifiers));
        assert!(store.contains_key(&new_keys.total));
        assert!(store.contains_key(&new_keys.identifiers));

        // Alerts are not per-minute buckets and survive cleanup.
        assert_eq!(monitoring.get_alerts(LimitType::Ip, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_before_retention_is_noop() {
        let clock = Arc::new(ManualClock::new(30 * MINUTE_MS));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let monitoring = Monitoring::new(store, clock, MonitoringConfig::default());

        assert_eq!(monitoring.cleanup(60).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_errors_surface_to_caller() {
        let clock = Arc::new(ManualClock::new(START));
        let monitoring = Monitoring::new(Arc::new(FailingStore::new()), clock, MonitoringConfig::default());

        assert!(monitoring.record_request("a", LimitType::Ip, &allowed()).await.is_err());
        assert!(monitoring.get_metrics(LimitType::Ip, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_spawned_cleanup_stops_on_shutdown() {
        let (clock, store, monitoring) = monitoring();
        monitoring.record_request("old", LimitType::Ip, &allowed()).await.unwrap();
        let old_keys = monitoring.minute_keys(LimitType::Ip, START / MINUTE_MS);
        clock.advance(Duration::from_secs(60 * 100));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = Arc::new(monitoring).spawn_cleanup(async move {
            let _ = rx.await;
        });

        // The first interval tick fires immediately.
        for _ in 0..50 {
            if !store.contains_key(&old_keys.total) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!store.contains_key(&old_keys.total));

        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
