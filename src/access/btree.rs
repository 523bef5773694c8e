pub mod iterator;
pub mod key;

use self::iterator::BTreeIterator;
use self::key::IndexKey;
use crate::access::RecordId;
use crate::concurrency::transaction::Transaction;
use crate::storage::buffer::{BufferPoolManager, PageReadGuard, PageWriteGuard};
use crate::storage::page::btree_internal_page::{internal_max_size, BTreeInternalPage};
use crate::storage::page::btree_leaf_page::{leaf_max_size, BTreeLeafPage};
use crate::storage::page::btree_page::{BTreePage, PageKind};
use crate::storage::page::{HeaderPage, PageId, HEADER_PAGE_ID};
use anyhow::Result;
use log::debug;
use parking_lot::{RwLock, RwLockWriteGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOp {
    Insert,
    Delete,
}

/// Concurrent B+ tree with unique keys over buffer-pool-hosted pages.
///
/// Internal nodes route, leaves hold `(IndexKey, RecordId)` pairs and
/// chain together in ascending key order. Traversal follows the latch
/// crabbing protocol: writers latch down the tree through the
/// transaction's page set and release every ancestor the moment a child
/// proves safe; readers couple latches pairwise. `root_page_id` is
/// guarded by its own reader-writer lock, held exclusively by any
/// operation that may still change it.
pub struct BPlusTree {
    index_name: String,
    buffer_pool: BufferPoolManager,
    root_page_id: RwLock<PageId>,
    leaf_max_size: usize,
    internal_max_size: usize,
}

impl BPlusTree {
    pub fn new(index_name: impl Into<String>, buffer_pool: BufferPoolManager) -> Self {
        Self::with_max_sizes(index_name, buffer_pool, leaf_max_size(), internal_max_size())
    }

    /// Tree with explicit node capacities, used by tests to force small
    /// orders. A node splits when its size exceeds its capacity.
    pub fn with_max_sizes(
        index_name: impl Into<String>,
        buffer_pool: BufferPoolManager,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Self {
        assert!(leaf_max_size >= 2, "leaf max size too small to split");
        assert!(internal_max_size >= 3, "internal max size too small to split");
        Self {
            index_name: index_name.into(),
            buffer_pool,
            root_page_id: RwLock::new(PageId::INVALID),
            leaf_max_size,
            internal_max_size,
        }
    }

    /// Reopens an index by looking its root up in the header page.
    pub fn open(index_name: impl Into<String>, buffer_pool: BufferPoolManager) -> Result<Self> {
        let index_name = index_name.into();
        let root = {
            let guard = buffer_pool.fetch_page(HEADER_PAGE_ID)?.read();
            HeaderPage::new(&*guard)
                .get_root_id(&index_name)
                .unwrap_or(PageId::INVALID)
        };
        let tree = Self::new(index_name, buffer_pool);
        *tree.root_page_id.write() = root;
        Ok(tree)
    }

    /// Creates and zeroes the reserved header page. Must run once per
    /// fresh database file, before any index allocates pages.
    pub fn initialize_header(buffer_pool: &BufferPoolManager) -> Result<()> {
        let (page_id, page) = buffer_pool.new_page()?;
        anyhow::ensure!(
            page_id == HEADER_PAGE_ID,
            "header page must be the first allocation, got {}",
            page_id
        );
        let mut guard = page.write();
        HeaderPage::new(&mut *guard).init();
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        !self.root_page_id.read().is_valid()
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.read()
    }

    /// Point lookup. Read latches couple pairwise down the tree: the
    /// child's latch is taken before the parent's is released.
    pub fn get(&self, key: IndexKey) -> Result<Option<RecordId>> {
        let root_guard = self.root_page_id.read();
        let root_id = *root_guard;
        if !root_id.is_valid() {
            return Ok(None);
        }
        let mut current = self.buffer_pool.fetch_page(root_id)?.read();
        drop(root_guard);

        loop {
            if BTreePage::new(&*current).is_leaf() {
                return Ok(BTreeLeafPage::new(&*current).lookup(key));
            }
            let child_id = BTreeInternalPage::new(&*current).lookup(key);
            let child = self.buffer_pool.fetch_page(child_id)?.read();
            current = child;
        }
    }

    /// Inserts a key-value pair. Returns false (with no side effects)
    /// when the key already exists.
    pub fn insert(&self, key: IndexKey, value: RecordId, txn: &mut Transaction) -> Result<bool> {
        let mut root_guard = Some(self.root_page_id.write());

        if !root_guard.as_deref().unwrap().is_valid() {
            self.start_new_tree(key, value, root_guard.as_deref_mut().unwrap())?;
            return Ok(true);
        }

        self.find_leaf_for_write(key, WriteOp::Insert, txn, &mut root_guard)?;

        let (duplicate, overfull) = {
            let guard = txn.page_set.last_mut().expect("descent latched no leaf");
            let mut leaf = BTreeLeafPage::new(&mut **guard);
            if leaf.lookup(key).is_some() {
                (true, false)
            } else {
                let size = leaf.insert(key, value);
                (false, size > self.leaf_max_size)
            }
        };

        if duplicate {
            self.release_write_set(txn)?;
            return Ok(false);
        }
        if overfull {
            self.split_leaf(txn, &mut root_guard)?;
        }
        self.release_write_set(txn)?;
        Ok(true)
    }

    /// Removes a key; absent keys are a no-op.
    pub fn remove(&self, key: IndexKey, txn: &mut Transaction) -> Result<()> {
        let mut root_guard = Some(self.root_page_id.write());
        if !root_guard.as_deref().unwrap().is_valid() {
            return Ok(());
        }

        self.find_leaf_for_write(key, WriteOp::Delete, txn, &mut root_guard)?;

        let size_after = {
            let guard = txn.page_set.last_mut().expect("descent latched no leaf");
            BTreeLeafPage::new(&mut **guard).remove(key)
        };

        if size_after < self.min_size_for(PageKind::Leaf) {
            self.coalesce_or_redistribute(txn, &mut root_guard)?;
        }
        self.release_write_set(txn)
    }

    /// Forward iterator from the leftmost leaf.
    pub fn begin(&self) -> Result<BTreeIterator> {
        let Some(leaf) = self.descend_for_read(None)? else {
            return Ok(BTreeIterator::end(self.buffer_pool.clone()));
        };
        Ok(BTreeIterator::new(leaf, 0, self.buffer_pool.clone()))
    }

    /// Forward iterator from the first entry with key `>= key`.
    pub fn begin_at(&self, key: IndexKey) -> Result<BTreeIterator> {
        let Some(leaf) = self.descend_for_read(Some(key))? else {
            return Ok(BTreeIterator::end(self.buffer_pool.clone()));
        };
        let index = BTreeLeafPage::new(&*leaf).key_index(key);
        Ok(BTreeIterator::new(leaf, index, self.buffer_pool.clone()))
    }

    fn descend_for_read(&self, key: Option<IndexKey>) -> Result<Option<PageReadGuard>> {
        let root_guard = self.root_page_id.read();
        let root_id = *root_guard;
        if !root_id.is_valid() {
            return Ok(None);
        }
        let mut current = self.buffer_pool.fetch_page(root_id)?.read();
        drop(root_guard);

        loop {
            if BTreePage::new(&*current).is_leaf() {
                return Ok(Some(current));
            }
            let internal = BTreeInternalPage::new(&*current);
            let child_id = match key {
                Some(key) => internal.lookup(key),
                None => internal.value_at(0),
            };
            let child = self.buffer_pool.fetch_page(child_id)?.read();
            current = child;
        }
    }

    /// Write-latching descent. Each visited node's guard is pushed onto
    /// the transaction's page set; when the freshly latched node is safe
    /// for `op`, every ancestor latch (and the root latch) is released
    /// first.
    fn find_leaf_for_write<'a>(
        &'a self,
        key: IndexKey,
        op: WriteOp,
        txn: &mut Transaction,
        root_guard: &mut Option<RwLockWriteGuard<'a, PageId>>,
    ) -> Result<()> {
        let mut next_id = **root_guard.as_ref().expect("descent without the root latch");

        loop {
            let guard = self.buffer_pool.fetch_page(next_id)?.write();

            let (is_leaf, safe) = {
                let page = BTreePage::new(&*guard);
                (page.is_leaf(), self.is_safe(&page, op))
            };
            if safe {
                txn.page_set.clear();
                *root_guard = None;
            }

            let child_id = if is_leaf {
                None
            } else {
                Some(BTreeInternalPage::new(&*guard).lookup(key))
            };
            txn.page_set.push(guard);

            match child_id {
                None => return Ok(()),
                Some(id) => next_id = id,
            }
        }
    }

    /// A safe node absorbs the operation without structural propagation.
    fn is_safe<B: AsRef<[u8]>>(&self, page: &BTreePage<B>, op: WriteOp) -> bool {
        let size = page.size();
        match op {
            WriteOp::Insert => size < self.max_size_for(page.kind()),
            WriteOp::Delete => {
                if page.is_root() {
                    // The root has no occupancy bound; it only shrinks
                    // when a leaf root empties or an internal root is
                    // left with a single child.
                    if page.is_leaf() {
                        size > 1
                    } else {
                        size > 2
                    }
                } else {
                    size > self.min_size_for(page.kind())
                }
            }
        }
    }

    fn max_size_for(&self, kind: PageKind) -> usize {
        match kind {
            PageKind::Leaf => self.leaf_max_size,
            PageKind::Internal => self.internal_max_size,
        }
    }

    fn min_size_for(&self, kind: PageKind) -> usize {
        match kind {
            PageKind::Leaf => self.leaf_max_size / 2,
            PageKind::Internal => (self.internal_max_size + 1) / 2,
        }
    }

    fn start_new_tree(&self, key: IndexKey, value: RecordId, root_id: &mut PageId) -> Result<()> {
        let (page_id, page) = self.buffer_pool.new_page()?;
        let mut guard = page.write();
        let mut leaf = BTreeLeafPage::new(&mut *guard);
        leaf.init(page_id, PageId::INVALID);
        leaf.insert(key, value);
        drop(guard);

        *root_id = page_id;
        self.sync_root_record(page_id)?;
        debug!("index '{}': new tree rooted at {}", self.index_name, page_id);
        Ok(())
    }

    /// Splits the overfull leaf at the top of the latched path and pushes
    /// the separator into its ancestors.
    fn split_leaf<'a>(
        &'a self,
        txn: &mut Transaction,
        root_guard: &mut Option<RwLockWriteGuard<'a, PageId>>,
    ) -> Result<()> {
        let mut node = txn.page_set.pop().expect("overfull leaf must be latched");

        let (new_page_id, new_page) = self.buffer_pool.new_page()?;
        let mut right = new_page.write();
        let split_key = {
            let mut leaf = BTreeLeafPage::new(&mut *node);
            let mut new_leaf = BTreeLeafPage::new(&mut *right);
            new_leaf.init(new_page_id, leaf.parent_page_id());
            let split_at = (self.leaf_max_size + 1) / 2;
            leaf.move_half_to(&mut new_leaf, split_at);
            new_leaf.key_at(0)
        };

        self.insert_into_parent(node, split_key, right, txn, root_guard)
    }

    /// Walks the retained latched path upward, inserting `(split_key,
    /// right)` after `left` at each level and splitting further while the
    /// parent overflows. A root split grows the tree by one level under
    /// the still-held root latch.
    fn insert_into_parent<'a>(
        &'a self,
        mut left: PageWriteGuard,
        mut split_key: IndexKey,
        mut right: PageWriteGuard,
        txn: &mut Transaction,
        root_guard: &mut Option<RwLockWriteGuard<'a, PageId>>,
    ) -> Result<()> {
        loop {
            let left_id = BTreePage::new(&*left).page_id();
            let right_id = BTreePage::new(&*right).page_id();

            if BTreePage::new(&*left).is_root() {
                let (root_id, page) = self.buffer_pool.new_page()?;
                let mut root = page.write();
                {
                    let mut view = BTreeInternalPage::new(&mut *root);
                    view.init(root_id, PageId::INVALID);
                    view.populate_new_root(left_id, split_key, right_id);
                }
                BTreePage::new(&mut *left).set_parent_page_id(root_id);
                BTreePage::new(&mut *right).set_parent_page_id(root_id);
                drop(root);
                drop(left);
                drop(right);

                **root_guard
                    .as_mut()
                    .expect("root split without the root latch") = root_id;
                self.sync_root_record(root_id)?;
                debug!("index '{}': root split, new root {}", self.index_name, root_id);
                return Ok(());
            }

            let mut parent = txn
                .page_set
                .pop()
                .expect("unsafe child left its parent unlatched");
            let overfull = {
                let mut view = BTreeInternalPage::new(&mut *parent);
                let parent_id = view.page_id();
                BTreePage::new(&mut *right).set_parent_page_id(parent_id);
                view.insert_node_after(left_id, split_key, right_id) > self.internal_max_size
            };
            drop(left);
            drop(right);

            if !overfull {
                txn.page_set.push(parent);
                return Ok(());
            }

            let (new_page_id, new_page) = self.buffer_pool.new_page()?;
            let mut new_right = new_page.write();
            split_key = {
                let mut old = BTreeInternalPage::new(&mut *parent);
                let mut fresh = BTreeInternalPage::new(&mut *new_right);
                fresh.init(new_page_id, old.parent_page_id());
                let split_at = (self.internal_max_size + 1) / 2;
                old.move_half_to(&mut fresh, split_at);
                fresh.key_at(0)
            };
            self.reparent_children(&new_right, new_page_id, 0)?;

            left = parent;
            right = new_right;
        }
    }

    /// Rewrites the parent pointer of `node`'s children from slot `from`
    /// onward. Used after slots move between internal nodes.
    fn reparent_children(
        &self,
        node: &PageWriteGuard,
        parent_id: PageId,
        from: usize,
    ) -> Result<()> {
        let ids: Vec<PageId> = {
            let view = BTreeInternalPage::new(&**node);
            (from..view.size()).map(|i| view.value_at(i)).collect()
        };
        for child_id in ids {
            let page = self.buffer_pool.fetch_page(child_id)?;
            let mut child = page.write();
            BTreePage::new(&mut *child).set_parent_page_id(parent_id);
        }
        Ok(())
    }

    /// Restores occupancy after an underflow at the top of the latched
    /// path, merging with or borrowing from a sibling and walking upward
    /// while the parent underflows in turn.
    fn coalesce_or_redistribute<'a>(
        &'a self,
        txn: &mut Transaction,
        root_guard: &mut Option<RwLockWriteGuard<'a, PageId>>,
    ) -> Result<()> {
        loop {
            let node = txn.page_set.pop().expect("underfull node must be latched");

            if BTreePage::new(&*node).is_root() {
                return self.adjust_root(node, txn, root_guard);
            }

            let (node_id, node_size, node_kind) = {
                let page = BTreePage::new(&*node);
                (page.page_id(), page.size(), page.kind())
            };

            // Prefer the left sibling; the leftmost child borrows from or
            // merges with its right neighbor instead.
            let (node_index, sibling_id) = {
                let parent_guard = txn
                    .page_set
                    .last()
                    .expect("non-root node left its parent unlatched");
                let parent = BTreeInternalPage::new(&**parent_guard);
                let index = parent
                    .value_index(node_id)
                    .expect("node missing from its parent");
                let sibling_index = if index > 0 { index - 1 } else { index + 1 };
                (index, parent.value_at(sibling_index))
            };

            let sibling = self.buffer_pool.fetch_page(sibling_id)?.write();
            let sibling_size = BTreePage::new(&*sibling).size();

            if node_size + sibling_size > self.max_size_for(node_kind) {
                return self.redistribute(node, sibling, node_index, txn);
            }

            let parent_size_after = self.coalesce(node, sibling, node_index, node_kind, txn)?;

            let parent_is_root = {
                let parent_guard = txn.page_set.last().unwrap();
                BTreePage::new(&**parent_guard).is_root()
            };
            let continue_up = if parent_is_root {
                parent_size_after == 1
            } else {
                parent_size_after < self.min_size_for(PageKind::Internal)
            };
            if !continue_up {
                return Ok(());
            }
        }
    }

    /// Moves one entry from the sibling into the underfull node and
    /// refreshes the parent separator. `node_index == 0` means the
    /// sibling sits to the right; otherwise it is the left neighbor.
    fn redistribute(
        &self,
        mut node: PageWriteGuard,
        mut sibling: PageWriteGuard,
        node_index: usize,
        txn: &mut Transaction,
    ) -> Result<()> {
        let node_id = BTreePage::new(&*node).page_id();
        let is_leaf = BTreePage::new(&*node).is_leaf();
        let parent_guard = txn.page_set.last_mut().unwrap();

        if is_leaf {
            let mut node_view = BTreeLeafPage::new(&mut *node);
            let mut sibling_view = BTreeLeafPage::new(&mut *sibling);
            let mut parent = BTreeInternalPage::new(&mut **parent_guard);
            if node_index == 0 {
                sibling_view.move_first_to_end_of(&mut node_view);
                parent.set_key_at(1, sibling_view.key_at(0));
            } else {
                sibling_view.move_last_to_front_of(&mut node_view);
                parent.set_key_at(node_index, node_view.key_at(0));
            }
            return Ok(());
        }

        let moved_child = {
            let mut node_view = BTreeInternalPage::new(&mut *node);
            let mut sibling_view = BTreeInternalPage::new(&mut *sibling);
            let mut parent = BTreeInternalPage::new(&mut **parent_guard);
            if node_index == 0 {
                // Rotate the right sibling's first child over; the old
                // separator travels down and the sibling's next key
                // becomes the new separator.
                let separator = parent.key_at(1);
                let (new_separator, moved) =
                    sibling_view.move_first_to_end_of(&mut node_view, separator);
                parent.set_key_at(1, new_separator);
                moved
            } else {
                let separator = parent.key_at(node_index);
                let (new_separator, moved) =
                    sibling_view.move_last_to_front_of(&mut node_view, separator);
                parent.set_key_at(node_index, new_separator);
                moved
            }
        };
        drop(sibling);
        drop(node);

        let page = self.buffer_pool.fetch_page(moved_child)?;
        let mut child = page.write();
        BTreePage::new(&mut *child).set_parent_page_id(node_id);
        Ok(())
    }

    /// Merges the right node of the pair into the left, records the right
    /// page for deallocation, and removes its separator from the parent.
    /// Returns the parent's size afterwards.
    fn coalesce(
        &self,
        node: PageWriteGuard,
        sibling: PageWriteGuard,
        node_index: usize,
        kind: PageKind,
        txn: &mut Transaction,
    ) -> Result<usize> {
        let (mut left, mut right, right_index) = if node_index == 0 {
            (node, sibling, 1)
        } else {
            (sibling, node, node_index)
        };
        let left_id = BTreePage::new(&*left).page_id();
        let right_id = BTreePage::new(&*right).page_id();

        match kind {
            PageKind::Leaf => {
                let mut left_view = BTreeLeafPage::new(&mut *left);
                let mut right_view = BTreeLeafPage::new(&mut *right);
                right_view.move_all_to(&mut left_view);
            }
            PageKind::Internal => {
                let (separator, prev_left_size) = {
                    let parent_guard = txn.page_set.last().unwrap();
                    let parent = BTreeInternalPage::new(&**parent_guard);
                    (
                        parent.key_at(right_index),
                        BTreeInternalPage::new(&*left).size(),
                    )
                };
                {
                    let mut left_view = BTreeInternalPage::new(&mut *left);
                    let mut right_view = BTreeInternalPage::new(&mut *right);
                    right_view.move_all_to(&mut left_view, separator);
                }
                self.reparent_children(&left, left_id, prev_left_size)?;
            }
        }

        txn.deleted_page_set.insert(right_id);
        drop(left);
        drop(right);

        let parent_guard = txn.page_set.last_mut().unwrap();
        let mut parent = BTreeInternalPage::new(&mut **parent_guard);
        parent.remove(right_index);
        Ok(parent.size())
    }

    /// Root-level shrink: an emptied leaf root empties the tree; an
    /// internal root with a single child hands the root role down.
    fn adjust_root<'a>(
        &'a self,
        mut node: PageWriteGuard,
        txn: &mut Transaction,
        root_guard: &mut Option<RwLockWriteGuard<'a, PageId>>,
    ) -> Result<()> {
        let (node_id, is_leaf, size) = {
            let page = BTreePage::new(&*node);
            (page.page_id(), page.is_leaf(), page.size())
        };

        if is_leaf {
            if size == 0 {
                **root_guard
                    .as_mut()
                    .expect("root adjustment without the root latch") = PageId::INVALID;
                txn.deleted_page_set.insert(node_id);
                drop(node);
                self.sync_root_record(PageId::INVALID)?;
                debug!("index '{}': emptied", self.index_name);
            }
            return Ok(());
        }

        if size == 1 {
            let child_id = BTreeInternalPage::new(&mut *node).remove_and_return_only_child();
            txn.deleted_page_set.insert(node_id);
            drop(node);

            {
                let page = self.buffer_pool.fetch_page(child_id)?;
                let mut child = page.write();
                BTreePage::new(&mut *child).set_parent_page_id(PageId::INVALID);
            }

            **root_guard
                .as_mut()
                .expect("root adjustment without the root latch") = child_id;
            self.sync_root_record(child_id)?;
            debug!("index '{}': root replaced by {}", self.index_name, child_id);
        }
        Ok(())
    }

    /// Rewrites this index's record in the header page. Inserts it on
    /// first creation, updates it on every later root change.
    fn sync_root_record(&self, root_id: PageId) -> Result<()> {
        let page = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        let mut guard = page.write();
        let mut header = HeaderPage::new(&mut *guard);
        if !header.update_record(&self.index_name, root_id) {
            anyhow::ensure!(
                header.insert_record(&self.index_name, root_id),
                "header page full while registering index '{}'",
                self.index_name
            );
        }
        Ok(())
    }

    /// Drops every latch and pin collected during the descent, then
    /// deallocates the pages emptied by merges.
    fn release_write_set(&self, txn: &mut Transaction) -> Result<()> {
        txn.page_set.clear();
        for page_id in txn.deleted_page_set.drain().collect::<Vec<_>>() {
            self.buffer_pool.delete_page(page_id)?;
        }
        Ok(())
    }
}
