use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// In-memory extendible hash table.
///
/// A directory of `2^global_depth` entries indexes into a set of buckets,
/// each holding up to `bucket_size` entries at its own `local_depth`.
/// Inserting into a full bucket splits it (doubling the directory first
/// when the bucket is already at global depth); buckets are never merged
/// and the directory never shrinks.
///
/// A single mutex guards the whole structure. The buffer pool, its only
/// in-tree consumer, serializes at its own latch anyway, so finer-grained
/// locking buys nothing here.
pub struct ExtendibleHashTable<K, V> {
    state: Mutex<TableState<K, V>>,
    bucket_size: usize,
}

struct TableState<K, V> {
    global_depth: u32,
    /// Directory entries index into `buckets`. Multiple entries may alias
    /// one bucket while its local depth is below the global depth.
    directory: Vec<usize>,
    buckets: Vec<Bucket<K, V>>,
    num_entries: usize,
}

struct Bucket<K, V> {
    local_depth: u32,
    entries: Vec<Option<(K, V)>>,
    size: usize,
}

impl<K, V> Bucket<K, V> {
    fn new(local_depth: u32, capacity: usize) -> Self {
        Self {
            local_depth,
            entries: (0..capacity).map(|_| None).collect(),
            size: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.size == self.entries.len()
    }
}

impl<K, V> ExtendibleHashTable<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// `bucket_size` is the fixed entry capacity of each bucket.
    pub fn new(bucket_size: usize) -> Self {
        assert!(bucket_size > 0, "bucket size must be positive");
        Self {
            state: Mutex::new(TableState {
                global_depth: 0,
                directory: vec![0],
                buckets: vec![Bucket::new(0, bucket_size)],
                num_entries: 0,
            }),
            bucket_size,
        }
    }

    fn hash(key: &K) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let state = self.state.lock();
        let bucket = &state.buckets[state.bucket_index_of(key)];
        bucket.entries.iter().flatten().find_map(|(k, v)| {
            if k == key {
                Some(v.clone())
            } else {
                None
            }
        })
    }

    /// Inserts `key -> value`, overwriting any existing entry for `key`.
    pub fn insert(&self, key: K, value: V) {
        let mut state = self.state.lock();

        let bucket_idx = state.bucket_index_of(&key);
        if let Some(entry) = state.buckets[bucket_idx]
            .entries
            .iter_mut()
            .flatten()
            .find(|entry| entry.0 == key)
        {
            entry.1 = value;
            return;
        }

        // Split until the target bucket has room for the new entry.
        while state.buckets[state.bucket_index_of(&key)].is_full() {
            state.split_bucket(Self::hash(&key));
        }

        let bucket_idx = state.bucket_index_of(&key);
        let bucket = &mut state.buckets[bucket_idx];
        let slot = bucket
            .entries
            .iter_mut()
            .find(|s| s.is_none())
            .expect("bucket just split still has no free slot");
        *slot = Some((key, value));
        bucket.size += 1;
        state.num_entries += 1;
    }

    pub fn remove(&self, key: &K) -> bool {
        let mut state = self.state.lock();
        let bucket_idx = state.bucket_index_of(key);
        let bucket = &mut state.buckets[bucket_idx];
        let position = bucket
            .entries
            .iter()
            .position(|slot| matches!(slot, Some((k, _)) if k == key));
        match position {
            Some(position) => {
                bucket.entries[position] = None;
                bucket.size -= 1;
                state.num_entries -= 1;
                true
            }
            None => false,
        }
    }

    pub fn global_depth(&self) -> u32 {
        self.state.lock().global_depth
    }

    pub fn local_depth(&self, dir_index: usize) -> Option<u32> {
        let state = self.state.lock();
        state
            .directory
            .get(dir_index)
            .map(|&b| state.buckets[b].local_depth)
    }

    pub fn num_buckets(&self) -> usize {
        self.state.lock().buckets.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().num_entries
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }
}

impl<K, V> TableState<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn dir_index_of(&self, key: &K) -> usize {
        ExtendibleHashTable::<K, V>::hash(key) as usize & (self.directory.len() - 1)
    }

    fn bucket_index_of(&self, key: &K) -> usize {
        self.directory[self.dir_index_of(key)]
    }

    /// Splits the bucket addressed by `hash`, doubling the directory first
    /// if the bucket is already at global depth.
    fn split_bucket(&mut self, hash: u64) {
        let dir_index = (hash as usize) & (self.directory.len() - 1);
        let old_idx = self.directory[dir_index];
        let local_depth = self.buckets[old_idx].local_depth;

        if local_depth == self.global_depth {
            // Append a copy of the directory to itself so indices with the
            // same low-bit suffix keep aliasing the same bucket.
            let len = self.directory.len();
            for i in 0..len {
                let b = self.directory[i];
                self.directory.push(b);
            }
            self.global_depth += 1;
        }

        let capacity = self.buckets[old_idx].entries.len();
        let new_idx = self.buckets.len();
        self.buckets.push(Bucket::new(local_depth + 1, capacity));
        self.buckets[old_idx].local_depth = local_depth + 1;

        // Every directory entry aliasing the old bucket whose discriminating
        // bit is set moves to the sibling.
        let discriminant = 1usize << local_depth;
        let dir_len = self.directory.len();
        for i in 0..dir_len {
            if self.directory[i] == old_idx && (i & discriminant) != 0 {
                self.directory[i] = new_idx;
            }
        }

        // Redistribute the old bucket's entries by the new bit.
        let mut moved = Vec::new();
        {
            let old_bucket = &mut self.buckets[old_idx];
            for slot in old_bucket.entries.iter_mut() {
                if let Some((k, _)) = slot {
                    let h = ExtendibleHashTable::<K, V>::hash(k);
                    if (h as usize & discriminant) != 0 {
                        moved.push(slot.take().unwrap());
                        old_bucket.size -= 1;
                    }
                }
            }
        }
        let new_bucket = &mut self.buckets[new_idx];
        for (i, entry) in moved.into_iter().enumerate() {
            new_bucket.entries[i] = Some(entry);
            new_bucket.size += 1;
        }
    }
}
