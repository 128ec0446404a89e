//! In-process window store.
//!
//! Holds the whole keyspace behind one lock, which makes every evaluation
//! trivially atomic. Expiry is applied lazily on access against the injected
//! clock. Suitable for tests and single-node deployments.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{StoreError, StoreOp, WindowStore};
use crate::clock::SharedClock;
use crate::ratelimit::window::{self, WindowOutcome, WindowRequest};

#[derive(Debug)]
enum Value {
    Window(BTreeSet<(u64, String)>),
    Counter(u64),
    Set(HashSet<String>),
    List(VecDeque<String>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Window(_) => "zset",
            Value::Counter(_) => "string",
            Value::Set(_) => "set",
            Value::List(_) => "list",
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    fn get_mut(&mut self, key: &str, now_ms: u64) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at_ms)
            .is_some_and(|at| at <= now_ms);
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn counter(&mut self, key: &str, now_ms: u64) -> Result<Option<(u64, Option<u64>)>, StoreError> {
        match self.get_mut(key, now_ms) {
            None => Ok(None),
            Some(Entry {
                value: Value::Counter(n),
                expires_at_ms,
            }) => Ok(Some((*n, *expires_at_ms))),
            Some(other) => Err(wrong_type(key, other.value.type_name())),
        }
    }

    fn evaluate(&mut self, request: &WindowRequest) -> Result<WindowOutcome, StoreError> {
        let now = request.now_ms;

        let (mut credits, burst_expiry) = self.counter(&request.burst_key, now)?.unwrap_or((0, None));

        let (mut entries, window_expiry) = match self.get_mut(&request.window_key, now) {
            None => (BTreeSet::new(), None),
            Some(Entry {
                value: Value::Window(set),
                expires_at_ms,
            }) => (std::mem::take(set), *expires_at_ms),
            Some(other) => return Err(wrong_type(&request.window_key, other.value.type_name())),
        };

        let credits_before = credits;
        let evaluation = window::evaluate(&mut entries, &mut credits, request);

        if entries.is_empty() {
            self.entries.remove(&request.window_key);
        } else {
            let expires_at_ms = if evaluation.admitted {
                Some(now.saturating_add(request.window_ttl_secs.saturating_mul(1000)))
            } else {
                window_expiry
            };
            self.entries.insert(
                request.window_key.clone(),
                Entry {
                    value: Value::Window(entries),
                    expires_at_ms,
                },
            );
        }

        if credits != credits_before || evaluation.accrued_credit {
            let expires_at_ms = if evaluation.accrued_credit {
                Some(now.saturating_add(request.burst_ttl_secs.saturating_mul(1000)))
            } else {
                burst_expiry
            };
            self.entries.insert(
                request.burst_key.clone(),
                Entry {
                    value: Value::Counter(credits),
                    expires_at_ms,
                },
            );
        }

        Ok(evaluation.outcome)
    }

    fn apply(&mut self, op: &StoreOp, now_ms: u64) -> Result<(), StoreError> {
        match op {
            StoreOp::Incr { key, by } => {
                let (current, expiry) = self.counter(key, now_ms)?.unwrap_or((0, None));
                self.entries.insert(
                    key.clone(),
                    Entry {
                        value: Value::Counter(current.saturating_add(*by)),
                        expires_at_ms: expiry,
                    },
                );
            }
            StoreOp::SetAdd { key, member } => match self.get_mut(key, now_ms) {
                Some(Entry {
                    value: Value::Set(set),
                    ..
                }) => {
                    set.insert(member.clone());
                }
                Some(other) => return Err(wrong_type(key, other.value.type_name())),
                None => {
                    self.entries.insert(
                        key.clone(),
                        Entry {
                            value: Value::Set(HashSet::from([member.clone()])),
                            expires_at_ms: None,
                        },
                    );
                }
            },
            StoreOp::ListPush { key, value } => match self.get_mut(key, now_ms) {
                Some(Entry {
                    value: Value::List(list),
                    ..
                }) => list.push_front(value.clone()),
                Some(other) => return Err(wrong_type(key, other.value.type_name())),
                None => {
                    self.entries.insert(
                        key.clone(),
                        Entry {
                            value: Value::List(VecDeque::from([value.clone()])),
                            expires_at_ms: None,
                        },
                    );
                }
            },
            StoreOp::ListTrim { key, keep } => match self.get_mut(key, now_ms) {
                Some(Entry {
                    value: Value::List(list),
                    ..
                }) => {
                    list.truncate(*keep);
                    if list.is_empty() {
                        self.entries.remove(key);
                    }
                }
                Some(other) => return Err(wrong_type(key, other.value.type_name())),
                None => {}
            },
        }
        Ok(())
    }
}

fn wrong_type(key: &str, actual: &str) -> StoreError {
    StoreError::Command(format!(
        "WRONGTYPE key '{}' holds a {} value",
        key, actual
    ))
}

/// A window store living entirely in this process.
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    clock: SharedClock,
}

impl MemoryStore {
    /// Create an empty store reading time from `clock`.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            clock,
        }
    }

    /// Whether a key currently exists (expired keys do not).
    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        self.keyspace.lock().get_mut(key, now).is_some()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        let mut keyspace = self.keyspace.lock();
        keyspace
            .entries
            .retain(|_, e| e.expires_at_ms.map_or(true, |at| at > now));
        keyspace.entries.len()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn evaluate(&self, request: &WindowRequest) -> Result<WindowOutcome, StoreError> {
        trace!(key = %request.window_key, now = request.now_ms, "Evaluating window in memory");
        self.keyspace.lock().evaluate(request)
    }

    async fn evaluate_batch(
        &self,
        requests: &[WindowRequest],
    ) -> Result<Vec<WindowOutcome>, StoreError> {
        let mut keyspace = self.keyspace.lock();
        requests.iter().map(|r| keyspace.evaluate(r)).collect()
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut keyspace = self.keyspace.lock();
        for key in keys {
            keyspace.entries.remove(key);
        }
        Ok(())
    }

    async fn pipeline(&self, ops: &[StoreOp]) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let mut keyspace = self.keyspace.lock();
        for op in ops {
            keyspace.apply(op, now)?;
        }
        Ok(())
    }

    async fn counters(&self, keys: &[String]) -> Result<Vec<u64>, StoreError> {
        let now = self.clock.now_ms();
        let mut keyspace = self.keyspace.lock();
        keys.iter()
            .map(|k| -> Result<u64, StoreError> {
                Ok(keyspace.counter(k, now)?.map(|(n, _)| n).unwrap_or(0))
            })
            .collect()
    }

    async fn set_cardinalities(&self, keys: &[String]) -> Result<Vec<u64>, StoreError> {
        let now = self.clock.now_ms();
        let mut keyspace = self.keyspace.lock();
        keys.iter()
            .map(|k| match keyspace.get_mut(k, now) {
                None => Ok(0),
                Some(Entry {
                    value: Value::Set(set),
                    ..
                }) => Ok(set.len() as u64),
                Some(other) => Err(wrong_type(k, other.value.type_name())),
            })
            .collect()
    }

    async fn list_range(&self, key: &str, count: usize) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now_ms();
        let mut keyspace = self.keyspace.lock();
        match keyspace.get_mut(key, now) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(list.iter().take(count).cloned().collect()),
            Some(other) => Err(wrong_type(key, other.value.type_name())),
        }
    }
}
