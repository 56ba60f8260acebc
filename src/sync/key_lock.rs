use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

/// A queued caller waiting for a key.
struct Waiter {
    ticket: u64,
    grant: oneshot::Sender<()>,
}

/// Per key: present while the key is held, with the callers queued behind
/// the current holder in arrival order.
type LockTable<K> = HashMap<K, VecDeque<Waiter>>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Timed out after {waited:?} waiting for lock")]
pub struct LockTimeout {
    pub waited: Duration,
}

/// Asynchronous mutual exclusion keyed by an arbitrary value.
///
/// At most one [`KeyLockGuard`] exists per key at any time. Callers that
/// find the key held are queued and resumed strictly in arrival order, and
/// distinct keys never wait on each other. A key's bookkeeping only lives as
/// long as someone holds it.
pub struct KeyLock<K> {
    table: Mutex<LockTable<K>>,
    next_ticket: AtomicU64,
}

impl<K> KeyLock<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(0),
        }
    }

    /// Wait until `key` is free and take it.
    ///
    /// Dropping the returned future before it completes withdraws the caller
    /// from the queue without disturbing the other waiters.
    pub async fn acquire(&self, key: K) -> KeyLockGuard<'_, K> {
        let (ticket, grant) = {
            let mut table = self.table();
            match table.entry(key.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(VecDeque::new());
                    return KeyLockGuard { lock: self, key };
                }
                Entry::Occupied(mut slot) => {
                    let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = oneshot::channel();
                    slot.get_mut().push_back(Waiter { ticket, grant: tx });
                    (ticket, rx)
                }
            }
        };

        tracing::trace!(ticket, "waiting for contended key");

        let mut pending = PendingAcquire {
            lock: self,
            key,
            ticket,
            grant,
            granted: false,
        };
        // The sender is only consumed by a hand-off, and a hand-off only
        // happens while this receiver is alive.
        let _ = (&mut pending.grant).await;
        pending.granted = true;

        KeyLockGuard {
            lock: self,
            key: pending.key.clone(),
        }
    }

    /// Like [`KeyLock::acquire`], but give up after `timeout`. On timeout the
    /// caller is no longer queued.
    pub async fn acquire_timeout(
        &self,
        key: K,
        timeout: Duration,
    ) -> Result<KeyLockGuard<'_, K>, LockTimeout> {
        tokio::time::timeout(timeout, self.acquire(key))
            .await
            .map_err(|_| LockTimeout { waited: timeout })
    }

    pub fn is_held(&self, key: &K) -> bool {
        self.table().contains_key(key)
    }

    /// Number of callers queued behind the current holder of `key`.
    pub fn queued(&self, key: &K) -> usize {
        self.table().get(key).map_or(0, VecDeque::len)
    }

    /// Number of keys currently held.
    pub fn held_keys(&self) -> usize {
        self.table().len()
    }

    /// Give up ownership of `key`, handing it to the next waiter if there is
    /// one. Releasing a key nobody holds does nothing.
    fn release(&self, key: &K) {
        hand_off(&mut self.table(), key);
    }

    fn table(&self) -> MutexGuard<'_, LockTable<K>> {
        // The table is consistent between statements, so a panic elsewhere
        // cannot leave it half-updated.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K> Default for KeyLock<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> fmt::Debug for KeyLock<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let held = self
            .table
            .lock()
            .map_or_else(|poisoned| poisoned.into_inner().len(), |table| table.len());
        f.debug_struct("KeyLock").field("held_keys", &held).finish()
    }
}

fn hand_off<K: Eq + Hash>(table: &mut LockTable<K>, key: &K) {
    let Some(queue) = table.get_mut(key) else {
        return;
    };
    while let Some(waiter) = queue.pop_front() {
        if waiter.grant.send(()).is_ok() {
            tracing::trace!(ticket = waiter.ticket, "lock handed off");
            return;
        }
    }
    table.remove(key);
}

/// An `acquire` call that is still queued.
struct PendingAcquire<'a, K: Eq + Hash + Clone> {
    lock: &'a KeyLock<K>,
    key: K,
    ticket: u64,
    grant: oneshot::Receiver<()>,
    granted: bool,
}

impl<K: Eq + Hash + Clone> Drop for PendingAcquire<'_, K> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }

        let mut table = self.lock.table();
        if let Some(queue) = table.get_mut(&self.key) {
            if let Some(pos) = queue.iter().position(|w| w.ticket == self.ticket) {
                queue.remove(pos);
                tracing::trace!(ticket = self.ticket, "abandoned lock wait");
                return;
            }
        }

        // Not queued any more: the key was handed to us after the caller
        // stopped waiting. Pass it on.
        hand_off(&mut table, &self.key);
    }
}

/// Exclusive ownership of one key. The key is released when the guard is
/// dropped, on every exit path of the critical section.
#[must_use = "the key is released as soon as the guard is dropped"]
pub struct KeyLockGuard<'a, K: Eq + Hash + Clone> {
    lock: &'a KeyLock<K>,
    key: K,
}

impl<K: Eq + Hash + Clone> KeyLockGuard<'_, K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash + Clone> Drop for KeyLockGuard<'_, K> {
    fn drop(&mut self) {
        self.lock.release(&self.key);
    }
}

impl<K: Eq + Hash + Clone + fmt::Debug> fmt::Debug for KeyLockGuard<'_, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLockGuard").field("key", &self.key).finish()
    }
}
