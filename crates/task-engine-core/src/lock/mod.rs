//! `AdapterLock` -- the transactional resource lock manager.
//!
//! Serializes [`Transaction`]s over the persistence adapter subject to a
//! soft concurrency counter, and grants re-entrant table/record-level
//! locks within a transaction. Grounded on the teacher's
//! `WorktreeManager`, which serializes git operations through a single
//! `Arc<Mutex<()>>`; here that single lock is generalized into a
//! `DashMap`-keyed table of per-resource lock entries (an enrichment
//! pulled from the corpus's `dashmap`-based concurrent state, since the
//! teacher has no keyed-lock primitive of its own).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{oneshot, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::EngineError;

/// A unit of adapter work submitted to [`AdapterLock`].
///
/// `fire` performs the actual adapter work once the lock grants this
/// transaction exclusive access (directly, immediately, or after
/// queueing). `id` must be stable for the lifetime of one submission so
/// re-entrant calls from within `fire` are recognized.
#[async_trait]
pub trait Transaction: Send + Sync {
    fn id(&self) -> Uuid;
    async fn fire(&self) -> Result<Value>;
}

/// Hooks invoked around a transaction's execution, outside the lock's
/// internal bookkeeping mutex.
#[async_trait]
pub trait LockHooks: Send + Sync {
    async fn on_begin(&self, _tx_id: Uuid) {}
    async fn on_end(&self, _tx_id: Uuid, _err: Option<&anyhow::Error>) {}
}

/// Hooks that do nothing; the default when the caller supplies none.
pub struct NoopHooks;

#[async_trait]
impl LockHooks for NoopHooks {}

struct PendingEntry {
    tx: Arc<dyn Transaction>,
    resolver: oneshot::Sender<Result<Value>>,
}

struct Inner {
    /// Transactions currently executing `fire` (size > 1 only when
    /// `counter` was configured above 1, i.e. concurrent mode).
    active: std::collections::HashSet<Uuid>,
    counter: i64,
    pending: VecDeque<PendingEntry>,
}

/// `{mutex, owner, refCount}` for one named resource (a table or a
/// `table::record` pair).
struct ResourceState {
    mutex: Arc<tokio::sync::Mutex<()>>,
    owner: StdMutex<Option<Uuid>>,
    ref_count: AtomicUsize,
    held_guard: StdMutex<Option<OwnedMutexGuard<()>>>,
}

impl ResourceState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            mutex: Arc::new(tokio::sync::Mutex::new(())),
            owner: StdMutex::new(None),
            ref_count: AtomicUsize::new(0),
            held_guard: StdMutex::new(None),
        })
    }
}

struct Shared {
    inner: StdMutex<Inner>,
    resources: DashMap<String, Arc<ResourceState>>,
    acquired_counts: DashMap<(Uuid, String), usize>,
    hooks: Arc<dyn LockHooks>,
}

/// The transactional resource lock manager.
///
/// Cheaply cloneable: all state lives behind `Arc`, matching
/// `WorktreeManager`'s clone-by-sharing-the-mutex pattern.
#[derive(Clone)]
pub struct AdapterLock {
    shared: Arc<Shared>,
}

impl AdapterLock {
    /// `counter` is the initial concurrency budget: 1 means strict serial
    /// execution, higher values allow that many transactions to fire
    /// concurrently before additional submissions queue.
    pub fn new(counter: i64) -> Self {
        Self::with_hooks(counter, Arc::new(NoopHooks))
    }

    pub fn with_hooks(counter: i64, hooks: Arc<dyn LockHooks>) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: StdMutex::new(Inner {
                    active: std::collections::HashSet::new(),
                    counter,
                    pending: VecDeque::new(),
                }),
                resources: DashMap::new(),
                acquired_counts: DashMap::new(),
                hooks,
            }),
        }
    }

    /// Submit a transaction. Resolves once this transaction's `fire`
    /// (or queued wait) completes.
    pub async fn submit(&self, tx: Arc<dyn Transaction>) -> Result<Value> {
        let tx_id = tx.id();

        enum Action {
            Reentrant,
            Fire,
            Queue,
        }

        let action = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.active.contains(&tx_id) {
                Action::Reentrant
            } else if inner.counter > 0 {
                inner.counter -= 1;
                Action::Fire
            } else {
                Action::Queue
            }
        };

        match action {
            Action::Reentrant => tx.fire().await,
            Action::Fire => self.fire_transaction(tx).await,
            Action::Queue => {
                let (resolver, waiter) = oneshot::channel();
                {
                    let mut inner = self.shared.inner.lock().unwrap();
                    inner.pending.push_back(PendingEntry { tx, resolver });
                }
                waiter
                    .await
                    .unwrap_or_else(|_| Err(anyhow!("transaction dropped from pending queue")))
            }
        }
    }

    async fn fire_transaction(&self, tx: Arc<dyn Transaction>) -> Result<Value> {
        let tx_id = tx.id();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.active.insert(tx_id);
        }

        self.shared.hooks.on_begin(tx_id).await;
        let result = tx.fire().await;
        self.release(tx_id, result.as_ref().err()).await;
        result
    }

    /// Release all locks held by `tx_id`, run `onEnd`, and either wake the
    /// next pending transaction or return the concurrency slot.
    async fn release(&self, tx_id: Uuid, err: Option<&anyhow::Error>) {
        self.release_resources_for(tx_id);

        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.active.remove(&tx_id);
        }

        self.shared.hooks.on_end(tx_id, err).await;

        let next = {
            let mut inner = self.shared.inner.lock().unwrap();
            match inner.pending.pop_front() {
                Some(entry) => Some(entry),
                None => {
                    inner.counter += 1;
                    None
                }
            }
        };

        if let Some(entry) = next {
            let this = self.clone();
            tokio::spawn(async move {
                let result = this.fire_transaction(entry.tx).await;
                let _ = entry.resolver.send(result);
            });
        }
    }

    fn release_resources_for(&self, tx_id: Uuid) {
        let owned_keys: Vec<(Uuid, String)> = self
            .shared
            .acquired_counts
            .iter()
            .filter(|entry| entry.key().0 == tx_id)
            .map(|entry| entry.key().clone())
            .collect();

        for composite_key in owned_keys {
            if self.shared.acquired_counts.remove(&composite_key).is_none() {
                continue;
            }
            let (_, key) = composite_key;
            if let Some(state) = self.shared.resources.get(&key) {
                // Only the current owner's reentrant count lives in
                // ref_count at any time, so releasing the owner's full
                // recorded count always drains it to exactly zero.
                state.ref_count.store(0, Ordering::SeqCst);
                *state.owner.lock().unwrap() = None;
                state.held_guard.lock().unwrap().take();
            }
        }
    }

    /// Acquire table-level locks. Inputs are deduplicated, emptied of
    /// blanks, and sorted before acquisition so concurrent transactions
    /// competing for the same resources always request them in the same
    /// global order -- this is the deadlock-prevention guarantee.
    pub async fn lock_tables(&self, tx_id: Uuid, tables: &[String]) -> Result<()> {
        self.lock_resources(tx_id, tables.iter().cloned(), None)
            .await
    }

    /// Acquire record-level locks, encoded as `"<table>::<record>"`.
    pub async fn lock_records(&self, tx_id: Uuid, records: &[(String, String)]) -> Result<()> {
        self.lock_resources(
            tx_id,
            records.iter().map(|(table, record)| format!("{table}::{record}")),
            None,
        )
        .await
    }

    /// Same as [`Self::lock_tables`] but fails with
    /// [`EngineError::LockTimeout`] if any single acquisition does not
    /// complete within `deadline`.
    pub async fn lock_tables_with_deadline(
        &self,
        tx_id: Uuid,
        tables: &[String],
        deadline: Duration,
    ) -> Result<()> {
        self.lock_resources(tx_id, tables.iter().cloned(), Some(deadline))
            .await
    }

    async fn lock_resources(
        &self,
        tx_id: Uuid,
        keys: impl Iterator<Item = String>,
        deadline: Option<Duration>,
    ) -> Result<()> {
        let mut normalized: Vec<String> = keys.filter(|k| !k.is_empty()).collect();
        normalized.sort();
        normalized.dedup();

        for key in normalized {
            self.acquire_one(tx_id, key, deadline).await?;
        }
        Ok(())
    }

    async fn acquire_one(&self, tx_id: Uuid, key: String, deadline: Option<Duration>) -> Result<()> {
        let state = self
            .shared
            .resources
            .entry(key.clone())
            .or_insert_with(ResourceState::new)
            .clone();

        let reentrant = *state.owner.lock().unwrap() == Some(tx_id);

        if reentrant {
            state.ref_count.fetch_add(1, Ordering::SeqCst);
        } else {
            let lock_fut = state.mutex.clone().lock_owned();
            let guard = match deadline {
                Some(d) => tokio::time::timeout(d, lock_fut)
                    .await
                    .map_err(|_| EngineError::LockTimeout { resource: key.clone() })?,
                None => lock_fut.await,
            };

            *state.owner.lock().unwrap() = Some(tx_id);
            state.ref_count.store(1, Ordering::SeqCst);
            *state.held_guard.lock().unwrap() = Some(guard);
        }

        *self
            .shared
            .acquired_counts
            .entry((tx_id, key))
            .or_insert(0) += 1;
        Ok(())
    }

    /// Number of distinct resources currently owned by any transaction.
    /// Exposed for tests asserting invariant 4 (`refCount(r) = 0 <=>
    /// owner(r) = None`).
    #[cfg(test)]
    fn resource_count(&self) -> usize {
        self.shared.resources.len()
    }
}
