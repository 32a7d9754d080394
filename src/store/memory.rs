//! Process-local counter store.
//!
//! Keys live in a mutex-guarded map. Expiry deadlines are kept in a min-heap
//! owned by the store and drained at the start of every operation, so an
//! expired key is never observed. An optional background sweeper reclaims
//! memory for keys nobody touches again.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{AtomicStore, CounterStore, KeyTtl, SortedEntry, SortedSetStore};
use crate::clock::{Clock, SystemClock};
use crate::error::{StoreError, StoreResult};

/// Heap entries beyond this slack over the live key count trigger a rebuild.
const HEAP_SLACK: usize = 64;

#[derive(Debug)]
enum Value {
    Text(String),
    Sorted(HashMap<String, f64>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<u64>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    /// Min-heap of (deadline, key). Stale deadlines are skipped when popped.
    deadlines: BinaryHeap<Reverse<(u64, String)>>,
}

impl State {
    /// Drop every key whose deadline is at or before `now`.
    fn purge(&mut self, now: u64) -> usize {
        let mut removed = 0;
        while let Some(Reverse((deadline, _))) = self.deadlines.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((deadline, key))) = self.deadlines.pop() else {
                break;
            };
            let current = self.entries.get(&key).and_then(|e| e.expires_at);
            if current == Some(deadline) {
                self.entries.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    fn schedule(&mut self, key: &str, deadline: u64) {
        self.deadlines.push(Reverse((deadline, key.to_string())));

        if self.deadlines.len() > self.entries.len() * 2 + HEAP_SLACK {
            self.deadlines = self
                .entries
                .iter()
                .filter_map(|(k, e)| e.expires_at.map(|d| Reverse((d, k.clone()))))
                .collect();
        }
    }

    fn insert(&mut self, key: &str, value: Value, expires_at: Option<u64>) {
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
        if let Some(deadline) = expires_at {
            self.schedule(key, deadline);
        }
    }

    fn text(&self, key: &str) -> StoreResult<Option<&str>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Ok(Some(text)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn sorted(&self, key: &str) -> StoreResult<Option<&HashMap<String, f64>>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Sorted(set),
                ..
            }) => Ok(Some(set)),
            Some(_) => Err(wrong_type(key)),
        }
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
    }
}

fn secs_to_ms(secs: u64) -> u64 {
    secs.saturating_mul(1000)
}

/// In-memory [`CounterStore`] with Redis-like semantics.
///
/// Cloning is cheap and clones share state. Sorted sets and compare-and-swap
/// are on by default and can be switched off to model a minimal backend.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
    sorted_sets: bool,
    atomic: bool,
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that reads time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
            sorted_sets: true,
            atomic: true,
        }
    }

    /// Hide the ordered-set tier.
    pub fn without_sorted_sets(mut self) -> Self {
        self.sorted_sets = false;
        self
    }

    /// Hide the compare-and-swap tier.
    pub fn without_atomic(mut self) -> Self {
        self.atomic = false;
        self
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.locked().entries.len()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every key and pending deadline.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.deadlines.clear();
    }

    /// Spawn a task that purges expired keys every `interval`.
    ///
    /// The task stops when the returned handle is shut down or dropped.
    pub fn spawn_sweeper(&self, interval: Duration) -> SweeperHandle {
        let interval = interval.max(Duration::from_millis(1));
        let state = Arc::clone(&self.state);
        let clock = Arc::clone(&self.clock);
        let (shutdown, mut stop) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = state.lock().purge(clock.now_millis());
                        if removed > 0 {
                            debug!(removed = removed, "Swept expired keys");
                        }
                    }
                    _ = &mut stop => break,
                }
            }
        });

        info!(interval_ms = interval.as_millis() as u64, "Started expiry sweeper");
        SweeperHandle { shutdown, task }
    }

    /// Lock the state with every due deadline already applied.
    fn locked(&self) -> parking_lot::MutexGuard<'_, State> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        state.purge(now);
        state
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running expiry sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "Expiry sweeper exited abnormally");
        }
        info!("Stopped expiry sweeper");
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let state = self.locked();
        Ok(state.text(key)?.map(str::to_string))
    }

    async fn set(&self, key: &str, value: String) -> StoreResult<()> {
        let mut state = self.locked();
        state.insert(key, Value::Text(value), None);
        Ok(())
    }

    async fn setex(&self, key: &str, ttl_secs: u64, value: String) -> StoreResult<()> {
        let now = self.clock.now_millis();
        let mut state = self.locked();
        state.insert(
            key,
            Value::Text(value),
            Some(now.saturating_add(secs_to_ms(ttl_secs))),
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let mut state = self.locked();
        Ok(state.entries.remove(key).is_some())
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut state = self.locked();
        let next = match state.text(key)? {
            None => 1,
            Some(text) => text
                .parse::<i64>()
                .ok()
                .and_then(|n| n.checked_add(1))
                .ok_or_else(|| StoreError::NotAnInteger {
                    key: key.to_string(),
                })?,
        };

        // The deadline, if any, is already scheduled.
        let expires_at = state.entries.get(key).and_then(|e| e.expires_at);
        state.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<bool> {
        self.pexpire(key, secs_to_ms(ttl_secs)).await
    }

    async fn pexpire(&self, key: &str, ttl_ms: u64) -> StoreResult<bool> {
        let deadline = self.clock.now_millis().saturating_add(ttl_ms);
        let mut state = self.locked();
        let Some(entry) = state.entries.get_mut(key) else {
            return Ok(false);
        };
        entry.expires_at = Some(deadline);
        state.schedule(key, deadline);
        Ok(true)
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        let now = self.clock.now_millis();
        let state = self.locked();
        Ok(match state.entries.get(key) {
            None => KeyTtl::Missing,
            Some(Entry {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(Entry {
                expires_at: Some(deadline),
                ..
            }) => KeyTtl::Expires(deadline.saturating_sub(now).div_ceil(1000)),
        })
    }

    fn sorted_sets(&self) -> Option<&dyn SortedSetStore> {
        self.sorted_sets.then_some(self as &dyn SortedSetStore)
    }

    fn atomic(&self) -> Option<&dyn AtomicStore> {
        self.atomic.then_some(self as &dyn AtomicStore)
    }
}

#[async_trait]
impl SortedSetStore for MemoryStore {
    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<bool> {
        let mut state = self.locked();
        if state.sorted(key)?.is_none() {
            state.insert(key, Value::Sorted(HashMap::new()), None);
        }
        match state.entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Sorted(set)) => Ok(set.insert(member.to_string(), score).is_none()),
            _ => Err(wrong_type(key)),
        }
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        let mut state = self.locked();
        if state.sorted(key)?.is_none() {
            return Ok(0);
        }

        let (removed, now_empty) = match state.entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Sorted(set)) => {
                let before = set.len();
                set.retain(|_, score| *score < min || *score > max);
                ((before - set.len()) as u64, set.is_empty())
            }
            _ => return Err(wrong_type(key)),
        };

        if now_empty {
            state.entries.remove(key);
        }
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let state = self.locked();
        Ok(state.sorted(key)?.map_or(0, |set| set.len() as u64))
    }

    async fn zrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
        with_scores: bool,
    ) -> StoreResult<Vec<SortedEntry>> {
        let state = self.locked();
        let Some(set) = state.sorted(key)? else {
            return Ok(Vec::new());
        };

        let mut ranked: Vec<(&String, f64)> = set.iter().map(|(m, s)| (m, *s)).collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));

        let len = ranked.len() as i64;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if len == 0 || start > stop || start >= len {
            return Ok(Vec::new());
        }

        Ok(ranked[start as usize..=stop as usize]
            .iter()
            .map(|(member, score)| SortedEntry {
                member: (*member).clone(),
                score: with_scores.then_some(*score),
            })
            .collect())
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: String,
        ttl_secs: u64,
    ) -> StoreResult<bool> {
        let now = self.clock.now_millis();
        let mut state = self.locked();
        if state.text(key)? != expected {
            return Ok(false);
        }
        state.insert(
            key,
            Value::Text(new),
            Some(now.saturating_add(secs_to_ms(ttl_secs))),
        );
        Ok(true)
    }
}
