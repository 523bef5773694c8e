use keeldb::access::{BPlusTree, IndexKey, RecordId};
use keeldb::concurrency::lock::LockManager;
use keeldb::concurrency::transaction::{Transaction, TransactionState};
use keeldb::storage::{BufferPoolManager, DiskManager};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

fn create_pool(pool_size: usize) -> BufferPoolManager {
    let dir = tempdir().unwrap();
    let disk = DiskManager::create(&dir.path().join("test.db")).unwrap();
    BufferPoolManager::new(pool_size, disk)
}

fn create_tree(pool_size: usize) -> BPlusTree {
    let pool = create_pool(pool_size);
    BPlusTree::initialize_header(&pool).unwrap();
    BPlusTree::with_max_sizes("integration", pool, 4, 4)
}

#[test]
fn test_indexed_rows_under_strict_2pl() {
    let tree = create_tree(64);
    let lock_manager = LockManager::new(true);

    // Writer transaction: lock each row exclusively, then index it.
    let mut writer = Transaction::new(1);
    for k in 1u64..=20 {
        let rid = RecordId(k);
        assert!(lock_manager.lock_exclusive(&mut writer, rid));
        assert!(tree.insert(IndexKey::from(k), rid, &mut writer).unwrap());
    }
    assert_eq!(writer.exclusive_lock_set.len(), 20);

    // Strict 2PL: locks release only after commit.
    writer.set_state(TransactionState::Committed);
    for k in 1u64..=20 {
        assert!(lock_manager.unlock(&mut writer, RecordId(k)));
    }
    assert!(writer.exclusive_lock_set.is_empty());

    // A later reader takes shared locks on whatever the index yields.
    let mut reader = Transaction::new(2);
    let mut iter = tree.begin().unwrap();
    let mut seen = Vec::new();
    while let Some((key, rid)) = iter.next().unwrap() {
        assert!(lock_manager.lock_shared(&mut reader, rid));
        seen.push(key.as_u64());
    }
    drop(iter);
    assert_eq!(seen, (1..=20).collect::<Vec<u64>>());

    reader.set_state(TransactionState::Committed);
    for k in 1u64..=20 {
        assert!(lock_manager.unlock(&mut reader, RecordId(k)));
    }
}

#[test]
fn test_wait_die_schedule_with_index_visibility() {
    // T10 writes a row and holds its lock; T5 (older) blocks for it and
    // observes the committed value once granted; T20 (younger) dies.
    let tree = Arc::new(create_tree(64));
    let lock_manager = Arc::new(LockManager::new(false));
    let rid = RecordId(77);

    let mut t10 = Transaction::new(10);
    assert!(lock_manager.lock_exclusive(&mut t10, rid));
    assert!(tree.insert(IndexKey::from(77), rid, &mut t10).unwrap());

    let t5_handle = {
        let tree = Arc::clone(&tree);
        let lock_manager = Arc::clone(&lock_manager);
        thread::spawn(move || {
            let mut t5 = Transaction::new(5);
            assert!(lock_manager.lock_exclusive(&mut t5, rid));
            // Granted after T10's release; the row is in the index.
            assert_eq!(tree.get(IndexKey::from(77)).unwrap(), Some(rid));
            assert_eq!(t5.state(), TransactionState::Growing);
            assert!(lock_manager.unlock(&mut t5, rid));
        })
    };

    thread::sleep(Duration::from_millis(100));

    let mut t20 = Transaction::new(20);
    assert!(!lock_manager.lock_exclusive(&mut t20, rid));
    assert_eq!(t20.state(), TransactionState::Aborted);

    assert!(lock_manager.unlock(&mut t10, rid));
    t5_handle.join().unwrap();
}

#[test]
fn test_concurrent_indexing_with_row_locks() {
    let tree = Arc::new(create_tree(256));
    let lock_manager = Arc::new(LockManager::new(false));

    let mut handles = Vec::new();
    for t in 0..4u64 {
        let tree = Arc::clone(&tree);
        let lock_manager = Arc::clone(&lock_manager);
        handles.push(thread::spawn(move || {
            for i in 0..50u64 {
                let key = t * 100 + i;
                let rid = RecordId(key);
                let mut txn = Transaction::new(key);
                assert!(lock_manager.lock_exclusive(&mut txn, rid));
                assert!(tree.insert(IndexKey::from(key), rid, &mut txn).unwrap());
                assert!(lock_manager.unlock(&mut txn, rid));
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for t in 0..4u64 {
        for i in 0..50u64 {
            let key = t * 100 + i;
            assert_eq!(
                tree.get(IndexKey::from(key)).unwrap(),
                Some(RecordId(key))
            );
        }
    }
}

#[test]
fn test_eviction_churn_under_indexed_load() {
    // A pool far smaller than the working set forces steady eviction
    // while the index stays correct.
    let pool = create_pool(16);
    BPlusTree::initialize_header(&pool).unwrap();
    let tree = BPlusTree::with_max_sizes("churn", pool.clone(), 4, 4);

    for k in 0u64..500 {
        let mut txn = Transaction::new(k);
        assert!(tree.insert(IndexKey::from(k), RecordId(k), &mut txn).unwrap());
        assert!(pool.resident_page_count() <= 16);
    }

    for k in 0u64..500 {
        assert_eq!(tree.get(IndexKey::from(k)).unwrap(), Some(RecordId(k)));
    }

    pool.flush_all_pages().unwrap();
    for k in (0u64..500).step_by(3) {
        let mut txn = Transaction::new(1000 + k);
        tree.remove(IndexKey::from(k), &mut txn).unwrap();
    }
    let mut iter = tree.begin().unwrap();
    let mut count = 0;
    while let Some((key, _)) = iter.next().unwrap() {
        assert_ne!(key.as_u64() % 3, 0);
        count += 1;
    }
    assert_eq!(count, 500 - (500 + 2) / 3);
}
