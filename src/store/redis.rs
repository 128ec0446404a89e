//! Redis-backed window store.
//!
//! Window evaluation runs as a server-side Lua script so that purge, count,
//! burst accounting and insertion happen as one indivisible operation. Batch
//! evaluation and telemetry writes go through pipelines. Every command is
//! bounded by the configured client-side timeout.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, RedisResult, Script};
use tracing::{debug, info, trace};

use super::{StoreError, StoreOp, WindowStore};
use crate::config::StoreConfig;
use crate::ratelimit::{WindowOutcome, WindowRequest};

/// Sliding window with burst credit.
///
/// KEYS: window set, burst counter.
/// ARGV: now, window_ms, max_requests, cost, burst_ceiling, burst_credit_cap,
/// burst_ttl_secs, window_ttl_secs, member.
/// Returns {allowed, reset_time, remaining, effective_limit}.
const WINDOW_SCRIPT: &str = r#"
local window_key = KEYS[1]
local burst_key = KEYS[2]
local now = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local max_requests = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local burst_ceiling = tonumber(ARGV[5])
local burst_cap = tonumber(ARGV[6])
local burst_ttl = tonumber(ARGV[7])
local window_ttl = tonumber(ARGV[8])
local member = ARGV[9]

redis.call('ZREMRANGEBYSCORE', window_key, '-inf', '(' .. (now - window_ms))

local count = redis.call('ZCARD', window_key)
local credits = tonumber(redis.call('GET', burst_key) or '0')

local effective_limit = max_requests
if credits > 0 then
  effective_limit = math.min(burst_ceiling, max_requests + credits)
  redis.call('DECR', burst_key)
  credits = credits - 1
end

local used = count * cost
if used >= effective_limit then
  local reset_time = now + window_ms
  local oldest = redis.call('ZRANGE', window_key, 0, 0, 'WITHSCORES')
  if oldest[2] then
    reset_time = tonumber(oldest[2]) + window_ms
  end
  return {0, reset_time, 0, effective_limit}
end

redis.call('ZADD', window_key, now, member)
redis.call('EXPIRE', window_key, window_ttl)

if used < max_requests and credits < burst_cap then
  redis.call('INCR', burst_key)
  redis.call('EXPIRE', burst_key, burst_ttl)
end

local remaining = effective_limit - (count + 1) * cost
if remaining < 0 then
  remaining = 0
end
return {1, now + window_ms, remaining, effective_limit}
"#;

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
            StoreError::Connection(e.to_string())
        } else if e.is_timeout() {
            StoreError::Timeout(Duration::ZERO)
        } else {
            StoreError::Command(e.to_string())
        }
    }
}

/// Window store backed by a shared Redis instance.
pub struct RedisStore {
    connection: ConnectionManager,
    script: Script,
    command_timeout: Duration,
}

impl RedisStore {
    /// Connect to Redis using the store configuration.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let command_timeout = config.command_timeout();
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| StoreError::Connection(format!("invalid Redis URL: {}", e)))?;

        let connection = tokio::time::timeout(command_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(command_timeout))?
            .map_err(|e| StoreError::Connection(format!("failed to connect to Redis: {}", e)))?;

        info!(url = %config.url, timeout = ?command_timeout, "Connected to Redis window store");

        Ok(Self {
            connection,
            script: Script::new(WINDOW_SCRIPT),
            command_timeout,
        })
    }

    /// Run a Redis future under the command timeout.
    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => {
                debug!(operation, timeout = ?self.command_timeout, "Redis command timed out");
                Err(StoreError::Timeout(self.command_timeout))
            }
        }
    }
}

fn push_window_eval(pipe: &mut redis::Pipeline, request: &WindowRequest) {
    pipe.cmd("EVAL")
        .arg(WINDOW_SCRIPT)
        .arg(2)
        .arg(&request.window_key)
        .arg(&request.burst_key)
        .arg(request.now_ms)
        .arg(request.window_ms)
        .arg(request.max_requests)
        .arg(request.cost)
        .arg(request.burst_ceiling)
        .arg(request.burst_credit_cap)
        .arg(request.burst_ttl_secs)
        .arg(request.window_ttl_secs)
        .arg(&request.member);
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn evaluate(&self, request: &WindowRequest) -> Result<WindowOutcome, StoreError> {
        trace!(key = %request.window_key, now = request.now_ms, "Evaluating window in Redis");

        let mut conn = self.connection.clone();
        let mut invocation = self.script.key(&request.window_key);
        invocation
            .key(&request.burst_key)
            .arg(request.now_ms)
            .arg(request.window_ms)
            .arg(request.max_requests)
            .arg(request.cost)
            .arg(request.burst_ceiling)
            .arg(request.burst_credit_cap)
            .arg(request.burst_ttl_secs)
            .arg(request.window_ttl_secs)
            .arg(&request.member);

        let reply: (i64, i64, i64, i64) = self
            .bounded("evaluate", invocation.invoke_async(&mut conn))
            .await?;
        WindowOutcome::from_reply(reply)
    }

    async fn evaluate_batch(
        &self,
        requests: &[WindowRequest],
    ) -> Result<Vec<WindowOutcome>, StoreError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for request in requests {
            push_window_eval(&mut pipe, request);
        }

        let mut conn = self.connection.clone();
        let replies: Vec<(i64, i64, i64, i64)> = self
            .bounded("evaluate_batch", pipe.query_async(&mut conn))
            .await?;

        if replies.len() != requests.len() {
            return Err(StoreError::UnexpectedReply(format!(
                "expected {} window replies, got {}",
                requests.len(),
                replies.len()
            )));
        }

        replies.into_iter().map(WindowOutcome::from_reply).collect()
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let _: () = self.bounded("delete", conn.del(keys)).await?;
        Ok(())
    }

    async fn pipeline(&self, ops: &[StoreOp]) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for op in ops {
            match op {
                StoreOp::Incr { key, by } => {
                    pipe.incr(key, *by).ignore();
                }
                StoreOp::SetAdd { key, member } => {
                    pipe.sadd(key, member).ignore();
                }
                StoreOp::ListPush { key, value } => {
                    pipe.lpush(key, value).ignore();
                }
                StoreOp::ListTrim { key, keep } => {
                    let stop = *keep as isize - 1;
                    pipe.ltrim(key, 0, stop).ignore();
                }
            }
        }

        let mut conn = self.connection.clone();
        let _: () = self.bounded("pipeline", pipe.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn counters(&self, keys: &[String]) -> Result<Vec<u64>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for key in keys {
            pipe.get(key);
        }

        let mut conn = self.connection.clone();
        let values: Vec<Option<u64>> = self.bounded("counters", pipe.query_async(&mut conn)).await?;
        Ok(values.into_iter().map(|v| v.unwrap_or(0)).collect())
    }

    async fn set_cardinalities(&self, keys: &[String]) -> Result<Vec<u64>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for key in keys {
            pipe.scard(key);
        }

        let mut conn = self.connection.clone();
        self.bounded("set_cardinalities", pipe.query_async(&mut conn))
            .await
    }

    async fn list_range(&self, key: &str, count: usize) -> Result<Vec<String>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let stop = count as isize - 1;
        let mut conn = self.connection.clone();
        self.bounded("list_range", conn.lrange(key, 0, stop)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::policy::{LimitType, RateLimitConfig};
    use crate::ratelimit::{window, RateLimitKey};
    use std::collections::BTreeSet;
    use uuid::Uuid;

    /// Redis URL for the tests that need a live server.
    const REDIS_URL_VAR: &str = "SLUICE_TEST_REDIS_URL";
    const T0: u64 = 1_700_000_000_000;
    const WINDOW_MS: u64 = 10_000;

    #[test]
    fn test_script_hash_is_stable() {
        let a = Script::new(WINDOW_SCRIPT);
        let b = Script::new(WINDOW_SCRIPT);
        assert_eq!(a.get_hash(), b.get_hash());
    }

    #[test]
    fn test_timeout_error_classification() {
        let err = RedisError::from((redis::ErrorKind::ResponseError, "ERR", "bad".to_string()));
        assert!(matches!(StoreError::from(err), StoreError::Command(_)));

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(StoreError::from(RedisError::from(io)), StoreError::Connection(_)));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let config = StoreConfig {
            url: "redis://127.0.0.1:1".to_string(),
            command_timeout_ms: 200,
            ..StoreConfig::default()
        };

        match RedisStore::connect(&config).await {
            Err(StoreError::Connection(_)) | Err(StoreError::Timeout(_)) => {}
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("connecting to a closed port should fail"),
        }
    }

    /// Runs the script and the in-process algorithm side by side on one
    /// bucket and asserts they agree on every step.
    struct Replay {
        store: RedisStore,
        config: RateLimitConfig,
        key: RateLimitKey,
        entries: BTreeSet<(u64, String)>,
        credits: u64,
        seq: u32,
    }

    impl Replay {
        async fn new(config: RateLimitConfig) -> Option<Self> {
            let url = std::env::var(REDIS_URL_VAR).ok()?;
            let store = RedisStore::connect(&StoreConfig {
                url,
                ..StoreConfig::default()
            })
            .await
            .unwrap();
            let prefix = format!("sluice-test-{}", Uuid::new_v4());
            Some(Self {
                store,
                key: RateLimitKey::new(&prefix, config.limit_type(), "client"),
                config,
                entries: BTreeSet::new(),
                credits: 0,
                seq: 0,
            })
        }

        async fn check(&mut self, now_ms: u64) -> WindowOutcome {
            self.seq += 1;
            let request = WindowRequest::new(&self.key, &self.config, now_ms, format!("{}-{}", now_ms, self.seq));

            let expected = window::evaluate(&mut self.entries, &mut self.credits, &request).outcome;
            let actual = self.store.evaluate(&request).await.unwrap();
            assert_eq!(actual, expected, "script and algorithm disagree at {}", now_ms);
            assert_eq!(self.stored_credits().await, self.credits);
            actual
        }

        async fn stored_credits(&self) -> u64 {
            self.store.counters(&[self.key.burst_key()]).await.unwrap()[0]
        }

        async fn grant_credit(&mut self) {
            let op = StoreOp::Incr {
                key: self.key.burst_key(),
                by: 1,
            };
            self.store.pipeline(&[op]).await.unwrap();
            self.credits += 1;
        }

        async fn cleanup(self) {
            let keys = [self.key.window_key(), self.key.burst_key()];
            self.store.delete(&keys).await.unwrap();
        }
    }

    fn limits(max: u64, burst: Option<f64>) -> RateLimitConfig {
        let mut builder = RateLimitConfig::builder(LimitType::Ip, "replay")
            .max_requests(max)
            .window_ms(WINDOW_MS);
        if let Some(multiplier) = burst {
            builder = builder.burst(multiplier, 60);
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    #[ignore = "needs a Redis server at SLUICE_TEST_REDIS_URL"]
    async fn test_script_matches_algorithm_on_fresh_bucket() {
        let Some(mut replay) = Replay::new(limits(3, None)).await else {
            return;
        };

        for expected_remaining in [2, 1, 0] {
            let outcome = replay.check(T0).await;
            assert!(outcome.allowed);
            assert_eq!(outcome.remaining, expected_remaining);
        }
        let denied = replay.check(T0).await;
        assert!(!denied.allowed);
        assert_eq!(denied.reset_time_ms, T0 + WINDOW_MS);

        replay.cleanup().await;
    }

    #[tokio::test]
    #[ignore = "needs a Redis server at SLUICE_TEST_REDIS_URL"]
    async fn test_script_matches_algorithm_at_window_cutoff() {
        let Some(mut replay) = Replay::new(limits(1, None)).await else {
            return;
        };

        assert!(replay.check(T0).await.allowed);
        // An entry exactly one window old still counts.
        assert!(!replay.check(T0 + WINDOW_MS).await.allowed);
        assert!(replay.check(T0 + WINDOW_MS + 1).await.allowed);

        replay.cleanup().await;
    }

    #[tokio::test]
    #[ignore = "needs a Redis server at SLUICE_TEST_REDIS_URL"]
    async fn test_script_matches_algorithm_up_to_burst_ceiling() {
        // max 4, multiplier 1.5 -> ceiling 6
        let Some(mut replay) = Replay::new(limits(4, Some(1.5))).await else {
            return;
        };

        let mut allowed = 0;
        for _ in 0..10 {
            let outcome = replay.check(T0).await;
            assert!(outcome.effective_limit <= replay.config.burst_ceiling());
            if outcome.allowed {
                allowed += 1;
            }
        }
        assert!(allowed > 4);
        assert!(allowed <= 6);

        replay.cleanup().await;
    }

    #[tokio::test]
    #[ignore = "needs a Redis server at SLUICE_TEST_REDIS_URL"]
    async fn test_script_spends_credit_on_denial() {
        // max 1, multiplier 2.0 -> ceiling 2, credit cap 1
        let Some(mut replay) = Replay::new(limits(1, Some(2.0))).await else {
            return;
        };

        assert!(replay.check(T0).await.allowed);
        assert!(replay.check(T0).await.allowed);
        assert_eq!(replay.stored_credits().await, 0);

        replay.grant_credit().await;
        let denied = replay.check(T0).await;
        assert!(!denied.allowed);
        assert_eq!(denied.effective_limit, 2);
        assert_eq!(replay.stored_credits().await, 0);

        replay.cleanup().await;
    }
}
