//! Tuple-level lock manager: two-phase locking with wait-die deadlock
//! prevention.
//!
//! Each record id gets a FIFO queue of lock requests. A request that
//! cannot be granted immediately compares transaction ids with the
//! queue's tail: an older (smaller-id) requester blocks on its own
//! condition variable, a younger one aborts itself. Only
//! older-waits-for-younger edges can exist, so no wait cycle ever forms.

use crate::access::RecordId;
use crate::concurrency::transaction::{Transaction, TransactionState};
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
    /// A shared holder waiting to become exclusive. Promoted to
    /// `Exclusive` when granted.
    Upgrading,
}

struct RequestState {
    mode: LockMode,
    granted: bool,
}

/// One transaction's position in a record's queue. Waiting blocks on
/// the request's own condition variable; the predicate re-check makes
/// spurious wakeups harmless.
struct LockRequest {
    txn_id: u64,
    state: Mutex<RequestState>,
    granted_cv: Condvar,
}

impl LockRequest {
    fn new(txn_id: u64, mode: LockMode, granted: bool) -> Arc<Self> {
        Arc::new(Self {
            txn_id,
            state: Mutex::new(RequestState { mode, granted }),
            granted_cv: Condvar::new(),
        })
    }

    fn wait(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.granted {
            state = self.granted_cv.wait(state).unwrap();
        }
    }

    fn grant(&self) {
        let mut state = self.state.lock().unwrap();
        state.granted = true;
        self.granted_cv.notify_one();
    }

    /// Upgrader's grant: it leaves the queue as a plain exclusive holder.
    fn promote_and_grant(&self) {
        let mut state = self.state.lock().unwrap();
        state.mode = LockMode::Exclusive;
        state.granted = true;
        self.granted_cv.notify_one();
    }

    fn mode(&self) -> LockMode {
        self.state.lock().unwrap().mode
    }

    fn is_granted(&self) -> bool {
        self.state.lock().unwrap().granted
    }
}

#[derive(Default)]
struct RecordQueue {
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    requests: VecDeque<Arc<LockRequest>>,
    /// At most one shared holder may be upgrading at a time.
    has_upgraded: bool,
}

/// Lock manager over record ids.
///
/// Under strict 2PL, unlocking is legal only after commit or abort;
/// under ordinary 2PL the first unlock moves the transaction from its
/// growing to its shrinking phase. Every failure path sets the
/// transaction's state to `Aborted` and returns false; there is no
/// error channel.
pub struct LockManager {
    strict_2pl: bool,
    table: Mutex<HashMap<RecordId, Arc<RecordQueue>>>,
}

impl LockManager {
    pub fn new(strict_2pl: bool) -> Self {
        Self {
            strict_2pl,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Acquires a shared lock on `rid`, blocking behind incompatible
    /// holders. Grants immediately when the queue is empty or its tail
    /// is a granted shared request.
    pub fn lock_shared(&self, txn: &mut Transaction, rid: RecordId) -> bool {
        if txn.state() != TransactionState::Growing {
            txn.set_state(TransactionState::Aborted);
            return false;
        }

        let request = {
            let mut table = self.table.lock().unwrap();
            let queue = Arc::clone(table.entry(rid).or_default());
            let mut state = queue.state.lock().unwrap();
            drop(table);

            let can_grant = match state.requests.back() {
                None => true,
                Some(tail) => tail.is_granted() && tail.mode() == LockMode::Shared,
            };

            if !can_grant && !Self::may_wait(txn, state.requests.back().unwrap()) {
                return false;
            }

            let request = LockRequest::new(txn.id(), LockMode::Shared, can_grant);
            state.requests.push_back(Arc::clone(&request));
            if can_grant {
                None
            } else {
                Some(request)
            }
        };

        if let Some(request) = request {
            request.wait();
        }
        txn.shared_lock_set.insert(rid);
        true
    }

    /// Acquires an exclusive lock on `rid`. Grants immediately only when
    /// the queue is empty.
    pub fn lock_exclusive(&self, txn: &mut Transaction, rid: RecordId) -> bool {
        if txn.state() != TransactionState::Growing {
            txn.set_state(TransactionState::Aborted);
            return false;
        }

        let request = {
            let mut table = self.table.lock().unwrap();
            let queue = Arc::clone(table.entry(rid).or_default());
            let mut state = queue.state.lock().unwrap();
            drop(table);

            let can_grant = state.requests.is_empty();

            if !can_grant && !Self::may_wait(txn, state.requests.back().unwrap()) {
                return false;
            }

            let request = LockRequest::new(txn.id(), LockMode::Exclusive, can_grant);
            state.requests.push_back(Arc::clone(&request));
            if can_grant {
                None
            } else {
                Some(request)
            }
        };

        if let Some(request) = request {
            request.wait();
        }
        txn.exclusive_lock_set.insert(rid);
        true
    }

    /// Upgrades the transaction's granted shared lock on `rid` to
    /// exclusive. Only one upgrade may be pending per record; a second
    /// upgrader aborts.
    pub fn lock_upgrade(&self, txn: &mut Transaction, rid: RecordId) -> bool {
        if txn.state() != TransactionState::Growing {
            txn.set_state(TransactionState::Aborted);
            return false;
        }

        let request = {
            let mut table = self.table.lock().unwrap();
            let queue = Arc::clone(table.entry(rid).or_default());
            let mut state = queue.state.lock().unwrap();
            drop(table);

            if state.has_upgraded {
                txn.set_state(TransactionState::Aborted);
                return false;
            }

            let position = state.requests.iter().position(|r| {
                r.txn_id == txn.id() && r.is_granted() && r.mode() == LockMode::Shared
            });
            let Some(position) = position else {
                txn.set_state(TransactionState::Aborted);
                return false;
            };
            state.requests.remove(position);
            txn.shared_lock_set.remove(&rid);

            let can_grant = state.requests.is_empty();

            if !can_grant && !Self::may_wait(txn, state.requests.back().unwrap()) {
                return false;
            }

            if can_grant {
                let request = LockRequest::new(txn.id(), LockMode::Exclusive, true);
                state.requests.push_back(request);
                None
            } else {
                let request = LockRequest::new(txn.id(), LockMode::Upgrading, false);
                state.requests.push_back(Arc::clone(&request));
                state.has_upgraded = true;
                Some(request)
            }
        };

        if let Some(request) = request {
            request.wait();
        }
        txn.exclusive_lock_set.insert(rid);
        true
    }

    /// Releases the transaction's lock on `rid` and grants the longest
    /// eligible prefix of waiters.
    pub fn unlock(&self, txn: &mut Transaction, rid: RecordId) -> bool {
        if self.strict_2pl {
            if txn.state() != TransactionState::Committed
                && txn.state() != TransactionState::Aborted
            {
                txn.set_state(TransactionState::Aborted);
                return false;
            }
        } else if txn.state() == TransactionState::Growing {
            txn.set_state(TransactionState::Shrinking);
        }

        let mut table = self.table.lock().unwrap();
        let Some(queue) = table.get(&rid).map(Arc::clone) else {
            return false;
        };
        let mut state = queue.state.lock().unwrap();

        let Some(position) = state.requests.iter().position(|r| r.txn_id == txn.id()) else {
            return false;
        };
        let request = state.requests.remove(position).unwrap();
        match request.mode() {
            LockMode::Shared => {
                txn.shared_lock_set.remove(&rid);
            }
            _ => {
                txn.exclusive_lock_set.remove(&rid);
            }
        }

        if state.requests.is_empty() {
            drop(state);
            table.remove(&rid);
            return true;
        }
        drop(table);

        // Grant from the front, skipping already-granted holders. The
        // first waiter always gets the lock; a shared grant extends over
        // the following run of shared waiters, while an upgrader or an
        // exclusive waiter ends the walk.
        let mut granted_any = false;
        let mut clear_upgraded = false;
        for waiter in state.requests.iter() {
            if waiter.is_granted() {
                continue;
            }
            match waiter.mode() {
                LockMode::Shared => {
                    waiter.grant();
                    granted_any = true;
                }
                LockMode::Upgrading if !granted_any => {
                    waiter.promote_and_grant();
                    clear_upgraded = true;
                    break;
                }
                LockMode::Exclusive if !granted_any => {
                    waiter.grant();
                    break;
                }
                _ => break,
            }
        }
        if clear_upgraded {
            state.has_upgraded = false;
        }
        true
    }

    /// Wait-die: an older requester (smaller id) may wait behind the
    /// tail; a younger one dies.
    fn may_wait(txn: &mut Transaction, tail: &Arc<LockRequest>) -> bool {
        if txn.id() > tail.txn_id {
            debug!(
                "wait-die: txn {} aborted behind txn {}",
                txn.id(),
                tail.txn_id
            );
            txn.set_state(TransactionState::Aborted);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_shared_locks_are_compatible() {
        let manager = LockManager::new(false);
        let rid = RecordId(1);

        let mut t1 = Transaction::new(1);
        let mut t2 = Transaction::new(2);

        assert!(manager.lock_shared(&mut t1, rid));
        assert!(manager.lock_shared(&mut t2, rid));
        assert!(t1.shared_lock_set.contains(&rid));
        assert!(t2.shared_lock_set.contains(&rid));

        assert!(manager.unlock(&mut t1, rid));
        assert!(manager.unlock(&mut t2, rid));
        assert!(t1.shared_lock_set.is_empty());
    }

    #[test]
    fn test_non_growing_txn_aborts() {
        let manager = LockManager::new(false);
        let rid = RecordId(1);

        let mut txn = Transaction::new(1);
        txn.set_state(TransactionState::Shrinking);

        assert!(!manager.lock_shared(&mut txn, rid));
        assert_eq!(txn.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_2pl_shrinks_on_first_unlock() {
        let manager = LockManager::new(false);
        let rid = RecordId(1);

        let mut txn = Transaction::new(1);
        assert!(manager.lock_shared(&mut txn, rid));
        assert!(manager.unlock(&mut txn, rid));
        assert_eq!(txn.state(), TransactionState::Shrinking);

        // Locking after shrinking violates 2PL.
        assert!(!manager.lock_exclusive(&mut txn, rid));
        assert_eq!(txn.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_strict_2pl_rejects_early_unlock() {
        let manager = LockManager::new(true);
        let rid = RecordId(1);

        let mut txn = Transaction::new(1);
        assert!(manager.lock_exclusive(&mut txn, rid));

        // Still growing: under strict 2PL this is a protocol violation.
        assert!(!manager.unlock(&mut txn, rid));
        assert_eq!(txn.state(), TransactionState::Aborted);

        // Aborted transactions may release.
        assert!(manager.unlock(&mut txn, rid));
    }

    #[test]
    fn test_wait_die_older_waits_younger_dies() {
        let manager = Arc::new(LockManager::new(false));
        let rid = RecordId(42);
        let barrier = Arc::new(Barrier::new(2));

        // T10 takes the exclusive lock.
        let mut t10 = Transaction::new(10);
        assert!(manager.lock_exclusive(&mut t10, rid));

        // T5 (older) must wait behind T10.
        let t5_handle = {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut t5 = Transaction::new(5);
                barrier.wait();
                assert!(manager.lock_exclusive(&mut t5, rid));
                t5.state()
            })
        };

        barrier.wait();
        // Give T5 time to enqueue behind T10.
        thread::sleep(Duration::from_millis(100));

        // T20 is younger than the tail (T5): it dies immediately.
        let mut t20 = Transaction::new(20);
        assert!(!manager.lock_exclusive(&mut t20, rid));
        assert_eq!(t20.state(), TransactionState::Aborted);

        // T10 releases; T5 gets the lock and is still growing.
        assert!(manager.unlock(&mut t10, rid));
        let t5_state = t5_handle.join().unwrap();
        assert_eq!(t5_state, TransactionState::Growing);
    }

    #[test]
    fn test_unlock_grants_run_of_shared_waiters() {
        let manager = Arc::new(LockManager::new(false));
        let rid = RecordId(7);

        let mut t10 = Transaction::new(10);
        assert!(manager.lock_exclusive(&mut t10, rid));

        // Enqueue in descending id order: each requester is older than
        // the current tail, so all three wait rather than die.
        let mut handles = Vec::new();
        for id in [5u64, 4, 3] {
            let manager = Arc::clone(&manager);
            handles.push(thread::spawn(move || {
                let mut txn = Transaction::new(id);
                assert!(manager.lock_shared(&mut txn, rid));
                assert!(txn.shared_lock_set.contains(&rid));
            }));
            thread::sleep(Duration::from_millis(50));
        }

        thread::sleep(Duration::from_millis(50));
        assert!(manager.unlock(&mut t10, rid));

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_upgrade_when_sole_holder() {
        let manager = LockManager::new(false);
        let rid = RecordId(1);

        let mut txn = Transaction::new(1);
        assert!(manager.lock_shared(&mut txn, rid));
        assert!(manager.lock_upgrade(&mut txn, rid));

        assert!(!txn.shared_lock_set.contains(&rid));
        assert!(txn.exclusive_lock_set.contains(&rid));
    }

    #[test]
    fn test_upgrade_without_shared_lock_aborts() {
        let manager = LockManager::new(false);
        let rid = RecordId(1);

        let mut txn = Transaction::new(1);
        assert!(!manager.lock_upgrade(&mut txn, rid));
        assert_eq!(txn.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_upgrade_waits_for_other_readers() {
        let manager = Arc::new(LockManager::new(false));
        let rid = RecordId(9);

        // T2 and T5 both hold shared locks.
        let mut t5 = Transaction::new(5);
        assert!(manager.lock_shared(&mut t5, rid));

        let t2_handle = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                let mut t2 = Transaction::new(2);
                assert!(manager.lock_shared(&mut t2, rid));
                // T2 (older than the tail) upgrades: must wait for T5.
                assert!(manager.lock_upgrade(&mut t2, rid));
                assert!(t2.exclusive_lock_set.contains(&rid));
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(manager.unlock(&mut t5, rid));
        t2_handle.join().unwrap();
    }

    #[test]
    fn test_exclusive_blocks_until_release() {
        let manager = Arc::new(LockManager::new(false));
        let rid = RecordId(3);
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let mut t9 = Transaction::new(9);
        assert!(manager.lock_exclusive(&mut t9, rid));

        let handle = {
            let manager = Arc::clone(&manager);
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                let mut t1 = Transaction::new(1);
                assert!(manager.lock_exclusive(&mut t1, rid));
                assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
            })
        };

        thread::sleep(Duration::from_millis(100));
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(manager.unlock(&mut t9, rid));
        handle.join().unwrap();
    }
}
