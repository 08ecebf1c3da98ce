//! Keyed table of single-shot completions.
//!
//! The registry turns a callback-only platform into request/response calls:
//! a request registers its key and receives a [`PendingCompletion`] future,
//! and the platform event for that key later resolves it. The registry knows
//! nothing about connection state; it is pure bookkeeping.
//!
//! Invariants:
//!
//! - At most one entry per key. Registering a key that is already pending
//!   fails with [`Error::DuplicateRequest`] and leaves the original waiter
//!   untouched.
//! - Every entry is consumed exactly once: by [`resolve`], by cancellation,
//!   or by the waiter dropping its future (caller cancellation or timeout).
//!   A late event for a consumed key is ignored.
//! - A waiter whose request already reached the platform can
//!   [`abandon`] its entry instead. The entry stays registered with no
//!   waiter, absorbs the platform's late completion, and keeps the key
//!   unavailable until then.
//!
//! [`resolve`]: OperationCompletionRegistry::resolve
//! [`abandon`]: PendingCompletion::abandon

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};

enum Waiter<T> {
    Waiting(oneshot::Sender<Result<T>>),
    /// Nobody is waiting; `hold` is released when the entry is consumed.
    Abandoned { hold: Option<Box<dyn Any + Send>> },
}

struct Entry<T> {
    id: u64,
    waiter: Waiter<T>,
}

impl<T> Entry<T> {
    /// Deliver `outcome` to the waiter. Returns whether anybody received it.
    fn settle(self, outcome: Result<T>) -> bool {
        match self.waiter {
            Waiter::Waiting(sender) => sender.send(outcome).is_ok(),
            Waiter::Abandoned { hold } => {
                drop(hold);
                false
            }
        }
    }

    fn is_abandoned(&self) -> bool {
        matches!(self.waiter, Waiter::Abandoned { .. })
    }
}

struct Table<K, T> {
    entries: HashMap<K, Entry<T>>,
    next_id: u64,
}

type Shared<K, T> = Arc<Mutex<Table<K, T>>>;

fn lock<K, T>(table: &Mutex<Table<K, T>>) -> MutexGuard<'_, Table<K, T>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pending single-shot completions keyed by operation identity.
pub struct OperationCompletionRegistry<K, T> {
    table: Shared<K, T>,
}

impl<K, T> Clone for OperationCompletionRegistry<K, T> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
        }
    }
}

impl<K, T> Default for OperationCompletionRegistry<K, T> {
    fn default() -> Self {
        Self {
            table: Arc::new(Mutex::new(Table {
                entries: HashMap::new(),
                next_id: 0,
            })),
        }
    }
}

impl<K, T> fmt::Debug for OperationCompletionRegistry<K, T>
where
    K: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = lock(&self.table);
        f.debug_struct("OperationCompletionRegistry")
            .field("pending", &table.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<K, T> OperationCompletionRegistry<K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending operation under `key`.
    ///
    /// Fails with [`Error::DuplicateRequest`] if `key` is already pending.
    pub fn register(&self, key: K) -> Result<PendingCompletion<K, T>> {
        let mut table = lock(&self.table);
        if table.entries.contains_key(&key) {
            return Err(Error::DuplicateRequest {
                key: key.to_string(),
            });
        }

        let id = table.next_id;
        table.next_id = table.next_id.wrapping_add(1);

        let (sender, receiver) = oneshot::channel();
        table.entries.insert(
            key.clone(),
            Entry {
                id,
                waiter: Waiter::Waiting(sender),
            },
        );

        Ok(PendingCompletion {
            key,
            id,
            receiver,
            table: Arc::downgrade(&self.table),
            finished: false,
        })
    }

    /// Resolve the entry for `key` with `outcome`.
    ///
    /// Returns whether a waiter received the outcome. Late or spurious
    /// events for keys with no pending entry are ignored, and the
    /// completion of an abandoned entry only clears the entry.
    pub fn resolve(&self, key: &K, outcome: Result<T>) -> bool {
        let entry = lock(&self.table).entries.remove(key);
        match entry {
            Some(entry) if entry.is_abandoned() => {
                debug!(key = %key, "Dropping completion of abandoned operation");
                entry.settle(outcome)
            }
            Some(entry) => {
                let delivered = entry.settle(outcome);
                if !delivered {
                    debug!(key = %key, "Waiter went away before completion was delivered");
                }
                delivered
            }
            None => {
                debug!(key = %key, "Ignoring completion with no pending operation");
                false
            }
        }
    }

    /// Fail the entry for `key` with [`Error::Cancelled`].
    ///
    /// Returns whether an entry existed.
    pub fn cancel(&self, key: &K) -> bool {
        let entry = lock(&self.table).entries.remove(key);
        match entry {
            Some(entry) => {
                entry.settle(Err(Error::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Fail every entry whose key matches `predicate` with the error built by `error`.
    ///
    /// Abandoned entries are cleared as well. Returns the number of waiters failed.
    pub fn cancel_all<P, E>(&self, mut predicate: P, error: E) -> usize
    where
        P: FnMut(&K) -> bool,
        E: Fn() -> Error,
    {
        let drained: Vec<(K, Entry<T>)> = {
            let mut table = lock(&self.table);
            let keys: Vec<K> = table
                .entries
                .keys()
                .filter(|k| predicate(k))
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| table.entries.remove(&k).map(|e| (k, e)))
                .collect()
        };

        let mut count = 0;
        for (key, entry) in drained {
            if entry.is_abandoned() {
                debug!(key = %key, "Clearing abandoned operation");
                entry.settle(Err(error()));
                continue;
            }
            debug!(key = %key, "Failing pending operation");
            entry.settle(Err(error()));
            count += 1;
        }
        count
    }

    /// Whether `key` has an entry, abandoned or not.
    pub fn is_pending(&self, key: &K) -> bool {
        lock(&self.table).entries.contains_key(key)
    }

    /// Number of abandoned entries still waiting for their platform completion.
    pub fn abandoned(&self) -> usize {
        lock(&self.table)
            .entries
            .values()
            .filter(|e| e.is_abandoned())
            .count()
    }

    pub fn len(&self) -> usize {
        lock(&self.table).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the pending keys.
    pub fn pending_keys(&self) -> Vec<K> {
        lock(&self.table).entries.keys().cloned().collect()
    }
}

/// Future resolved when the registry completes the matching key.
///
/// Dropping it before completion deregisters the key, so a platform event
/// arriving afterwards is a no-op.
#[must_use = "dropping a PendingCompletion cancels the operation"]
pub struct PendingCompletion<K, T>
where
    K: Eq + Hash,
{
    key: K,
    id: u64,
    receiver: oneshot::Receiver<Result<T>>,
    table: Weak<Mutex<Table<K, T>>>,
    finished: bool,
}

impl<K, T> PendingCompletion<K, T>
where
    K: Eq + Hash,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Whether the outcome has been taken by polling this future.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Stop waiting but keep the entry registered until it is consumed.
    ///
    /// Use this when the request already reached the platform: the entry
    /// swallows the late completion, and `hold` is dropped only once the
    /// entry is resolved or cancelled. If the entry is already gone, `hold`
    /// is dropped immediately.
    pub fn abandon<H>(&mut self, hold: Option<H>)
    where
        H: Send + 'static,
    {
        if self.finished {
            return;
        }
        self.finished = true;
        self.receiver.close();

        let hold = hold.map(|h| Box::new(h) as Box<dyn Any + Send>);
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut table = lock(&table);
        match table.entries.get_mut(&self.key) {
            Some(entry) if entry.id == self.id => {
                entry.waiter = Waiter::Abandoned { hold };
            }
            // Already resolved or cancelled.
            _ => {
                drop(table);
                drop(hold);
            }
        }
    }
}

impl<K, T> fmt::Debug for PendingCompletion<K, T>
where
    K: Eq + Hash + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCompletion")
            .field("key", &self.key)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<K, T> Future for PendingCompletion<K, T>
where
    K: Eq + Hash + Unpin,
{
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(outcome) => {
                this.finished = true;
                // A dropped sender means the entry was removed without an outcome.
                Poll::Ready(outcome.unwrap_or(Err(Error::Cancelled)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<K, T> Drop for PendingCompletion<K, T>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut table = lock(&table);
        // Only remove our own entry; the key may have been re-registered.
        if table.entries.get(&self.key).is_some_and(|e| e.id == self.id) {
            table.entries.remove(&self.key);
        }
    }
}
