use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::store::{resolve_range, JobStore, StoreOp, StoreResult};

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    values: HashMap<String, Entry>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, BTreeSet<String>>,
}

impl Inner {
    fn apply(&mut self, op: StoreOp, now: Instant) {
        match op {
            StoreOp::Set { key, value, ttl } => {
                let expires_at = ttl.map(|ttl| now + ttl);
                self.values.insert(key, Entry { value, expires_at });
            }
            StoreOp::Delete { key } => {
                self.values.remove(&key);
                self.lists.remove(&key);
                self.sets.remove(&key);
            }
            StoreOp::PushBack { list, value } => {
                self.lists.entry(list).or_default().push_back(value);
            }
            StoreOp::PushFront { list, value } => {
                self.lists.entry(list).or_default().push_front(value);
            }
            StoreOp::Trim { list, start, stop } => {
                let Some(items) = self.lists.get_mut(&list) else {
                    return;
                };
                match resolve_range(items.len(), start, stop) {
                    Some((from, to)) => {
                        items.truncate(to + 1);
                        items.drain(..from);
                    }
                    None => items.clear(),
                }
                if items.is_empty() {
                    self.lists.remove(&list);
                }
            }
            StoreOp::SetAdd { set, member } => {
                self.sets.entry(set).or_default().insert(member);
            }
            StoreOp::SetRemove { set, member } => {
                if let Some(members) = self.sets.get_mut(&set) {
                    members.remove(&member);
                    if members.is_empty() {
                        self.sets.remove(&set);
                    }
                }
            }
        }
    }

    fn pop_front(&mut self, list: &str) -> Option<String> {
        let items = self.lists.get_mut(list)?;
        let value = items.pop_front();
        if items.is_empty() {
            self.lists.remove(list);
        }
        value
    }
}

/// Process-local [`JobStore`].
///
/// Expired values are dropped when read and swept on every batch write, so
/// records nobody reads again still leave once their TTL passes. Blocking pops
/// park on a [`Notify`] that every push wakes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    pushed: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut inner = self.lock()?;
        let now = Instant::now();
        if inner.values.get(key).is_some_and(|e| e.is_expired(now)) {
            inner.values.remove(key);
            return Ok(None);
        }
        Ok(inner.values.get(key).map(|e| e.value.clone()))
    }

    async fn pop_front(&self, list: &str, timeout: Duration) -> StoreResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            // Register interest before checking so a push in between is not missed.
            notified.as_mut().enable();

            if let Some(value) = self.lock()?.pop_front(list) {
                return Ok(Some(value));
            }
            if timeout.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn list_len(&self, list: &str) -> StoreResult<usize> {
        Ok(self.lock()?.lists.get(list).map_or(0, VecDeque::len))
    }

    async fn list_range(&self, list: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        let inner = self.lock()?;
        let Some(items) = inner.lists.get(list) else {
            return Ok(Vec::new());
        };
        Ok(match resolve_range(items.len(), start, stop) {
            Some((from, to)) => items.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn set_card(&self, set: &str) -> StoreResult<usize> {
        Ok(self.lock()?.sets.get(set).map_or(0, BTreeSet::len))
    }

    async fn set_members(&self, set: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .lock()?
            .sets
            .get(set)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.lock().map(|_| ())
    }

    async fn execute(&self, ops: Vec<StoreOp>) -> StoreResult<()> {
        let pushes = ops
            .iter()
            .any(|op| matches!(op, StoreOp::PushBack { .. } | StoreOp::PushFront { .. }));
        {
            let mut inner = self.lock()?;
            let now = Instant::now();
            inner.values.retain(|_, entry| !entry.is_expired(now));
            for op in ops {
                inner.apply(op, now);
            }
        }
        if pushes {
            self.pushed.notify_waiters();
        }
        Ok(())
    }
}
