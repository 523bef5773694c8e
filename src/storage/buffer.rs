pub mod lru;
pub mod replacer;

use crate::storage::disk::{DiskManager, PAGE_SIZE};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::hash::ExtendibleHashTable;
use crate::storage::page::PageId;
use log::debug;
use lru::LruReplacer;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use replacer::{FrameId, Replacer};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Bucket capacity of the page-id-to-frame hash table.
const PAGE_TABLE_BUCKET_SIZE: usize = 64;

type PageDataReadGuard = ArcRwLockReadGuard<RawRwLock, [u8; PAGE_SIZE]>;
type PageDataWriteGuard = ArcRwLockWriteGuard<RawRwLock, [u8; PAGE_SIZE]>;

/// One slot of the pool's fixed frame array.
///
/// The `RwLock` around the page bytes is the per-page latch; the pin
/// count and dirty flag are frame metadata and never reach disk.
struct Frame {
    data: Arc<RwLock<[u8; PAGE_SIZE]>>,
    page_id: AtomicU32,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
}

impl Frame {
    fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new([0u8; PAGE_SIZE])),
            page_id: AtomicU32::new(PageId::INVALID.0),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }

    fn page_id(&self) -> PageId {
        PageId(self.page_id.load(Ordering::SeqCst))
    }

    fn set_page_id(&self, page_id: PageId) {
        self.page_id.store(page_id.0, Ordering::SeqCst);
    }

    fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::SeqCst)
    }

    fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.set_page_id(PageId::INVALID);
        self.pin_count.store(0, Ordering::SeqCst);
        self.is_dirty.store(false, Ordering::SeqCst);
        self.data.write().fill(0);
    }
}

/// Fixed-size pool of page frames backed by a disk manager.
///
/// Frames are found through an extendible hash page table and evicted by
/// LRU among unpinned frames. A single mutex serializes every pool
/// transition (page table, replacer, free list, frame metadata); page
/// latches and pin lifetimes are managed by the returned guards.
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<BufferPoolInner>,
}

struct BufferPoolInner {
    frames: Vec<Frame>,
    page_table: ExtendibleHashTable<PageId, FrameId>,
    state: Mutex<PoolState>,
    disk: Mutex<DiskManager>,
}

struct PoolState {
    free_list: VecDeque<FrameId>,
    replacer: Box<dyn Replacer>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, disk: DiskManager) -> Self {
        Self::with_replacer(pool_size, disk, Box::new(LruReplacer::new()))
    }

    pub fn with_replacer(pool_size: usize, disk: DiskManager, replacer: Box<dyn Replacer>) -> Self {
        let frames = (0..pool_size).map(|_| Frame::new()).collect();
        let free_list = (0..pool_size).collect();

        Self {
            inner: Arc::new(BufferPoolInner {
                frames,
                page_table: ExtendibleHashTable::new(PAGE_TABLE_BUCKET_SIZE),
                state: Mutex::new(PoolState {
                    free_list,
                    replacer,
                }),
                disk: Mutex::new(disk),
            }),
        }
    }

    /// Pins and returns the frame holding `page_id`, reading it from disk
    /// if it is not resident. Fails with `BufferPoolFull` when every frame
    /// is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> StorageResult<PinnedPage> {
        let mut state = self.inner.state.lock();

        if let Some(frame_id) = self.inner.page_table.find(&page_id) {
            let frame = &self.inner.frames[frame_id];
            frame.pin_count.fetch_add(1, Ordering::SeqCst);
            state.replacer.erase(frame_id);
            return Ok(self.pinned(frame_id, page_id));
        }

        let frame_id = self.take_free_frame(&mut state)?;
        let frame = &self.inner.frames[frame_id];
        {
            let mut disk = self.inner.disk.lock();
            let mut data = frame.data.write();
            disk.read_page(page_id, &mut data[..])?;
        }
        frame.set_page_id(page_id);
        frame.pin_count.store(1, Ordering::SeqCst);
        frame.is_dirty.store(false, Ordering::SeqCst);
        self.inner.page_table.insert(page_id, frame_id);

        Ok(self.pinned(frame_id, page_id))
    }

    /// Allocates a fresh page id from the disk manager and pins a zeroed
    /// frame for it.
    pub fn new_page(&self) -> StorageResult<(PageId, PinnedPage)> {
        let mut state = self.inner.state.lock();

        let frame_id = self.take_free_frame(&mut state)?;
        let page_id = self.inner.disk.lock().allocate_page()?;

        let frame = &self.inner.frames[frame_id];
        frame.data.write().fill(0);
        frame.set_page_id(page_id);
        frame.pin_count.store(1, Ordering::SeqCst);
        frame.is_dirty.store(false, Ordering::SeqCst);
        self.inner.page_table.insert(page_id, frame_id);

        Ok((page_id, self.pinned(frame_id, page_id)))
    }

    /// Writes the page to disk and clears its dirty flag. Returns false
    /// if the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> StorageResult<bool> {
        let _state = self.inner.state.lock();

        let Some(frame_id) = self.inner.page_table.find(&page_id) else {
            return Ok(false);
        };
        let frame = &self.inner.frames[frame_id];
        let data = frame.data.read();
        self.inner.disk.lock().write_page(page_id, &data[..])?;
        frame.is_dirty.store(false, Ordering::SeqCst);
        Ok(true)
    }

    /// Writes every resident dirty page whose pin count is zero.
    pub fn flush_all_pages(&self) -> StorageResult<()> {
        let _state = self.inner.state.lock();

        for frame in &self.inner.frames {
            let page_id = frame.page_id();
            if page_id.is_valid() && frame.pin_count() == 0 && frame.is_dirty() {
                let data = frame.data.read();
                self.inner.disk.lock().write_page(page_id, &data[..])?;
                frame.is_dirty.store(false, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    /// Unmaps the page, returns its frame to the free list, and tells the
    /// disk manager to deallocate the id. Returns false while the page is
    /// pinned.
    pub fn delete_page(&self, page_id: PageId) -> StorageResult<bool> {
        let mut state = self.inner.state.lock();

        if let Some(frame_id) = self.inner.page_table.find(&page_id) {
            let frame = &self.inner.frames[frame_id];
            if frame.pin_count() > 0 {
                return Ok(false);
            }
            self.inner.page_table.remove(&page_id);
            state.replacer.erase(frame_id);
            frame.reset();
            state.free_list.push_back(frame_id);
        }
        self.inner.disk.lock().deallocate_page(page_id);
        Ok(true)
    }

    pub fn pool_size(&self) -> usize {
        self.inner.frames.len()
    }

    pub fn resident_page_count(&self) -> usize {
        self.inner.page_table.len()
    }

    pub fn free_frame_count(&self) -> usize {
        self.inner.state.lock().free_list.len()
    }

    /// Pin count of a resident page, if any. Test-facing.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        self.inner
            .page_table
            .find(&page_id)
            .map(|frame_id| self.inner.frames[frame_id].pin_count())
    }

    fn pinned(&self, frame_id: FrameId, page_id: PageId) -> PinnedPage {
        PinnedPage {
            inner: self.inner.clone(),
            frame_id,
            page_id,
        }
    }

    /// Takes a frame from the free list, falling back to evicting the LRU
    /// victim (flushing it first if dirty).
    fn take_free_frame(&self, state: &mut PoolState) -> StorageResult<FrameId> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = state.replacer.victim().ok_or(StorageError::BufferPoolFull)?;
        let frame = &self.inner.frames[frame_id];
        let old_page_id = frame.page_id();
        if old_page_id.is_valid() {
            if frame.is_dirty() {
                debug!("evicting dirty page {}", old_page_id);
                let data = frame.data.read();
                self.inner.disk.lock().write_page(old_page_id, &data[..])?;
                frame.is_dirty.store(false, Ordering::SeqCst);
            }
            self.inner.page_table.remove(&old_page_id);
        }
        Ok(frame_id)
    }
}

impl BufferPoolInner {
    fn unpin_frame(&self, frame_id: FrameId) {
        let mut state = self.state.lock();
        let frame = &self.frames[frame_id];
        let prev = frame.pin_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "unpin of an unpinned frame");
        if prev == 1 {
            state.replacer.insert(frame_id);
        }
    }
}

/// Pin token for one frame. Dropping it releases the pin; at pin count
/// zero the frame becomes an eviction candidate.
///
/// Page bytes are reached by converting the token into a latched guard;
/// latch and pin are then released together, exactly once each.
pub struct PinnedPage {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
    page_id: PageId,
}

impl PinnedPage {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Takes the page's read latch. Blocks while a writer holds it.
    pub fn read(self) -> PageReadGuard {
        let guard = self.inner.frames[self.frame_id].data.read_arc();
        PageReadGuard { guard, page: self }
    }

    /// Takes the page's write latch and marks the frame dirty.
    pub fn write(self) -> PageWriteGuard {
        let frame = &self.inner.frames[self.frame_id];
        let guard = frame.data.write_arc();
        frame.is_dirty.store(true, Ordering::SeqCst);
        PageWriteGuard { guard, page: self }
    }
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        self.inner.unpin_frame(self.frame_id);
    }
}

/// Read latch plus pin on one page. Field order releases the latch
/// before the pin.
pub struct PageReadGuard {
    guard: PageDataReadGuard,
    page: PinnedPage,
}

impl PageReadGuard {
    pub fn page_id(&self) -> PageId {
        self.page.page_id()
    }
}

impl Deref for PageReadGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

/// Write latch plus pin on one page.
pub struct PageWriteGuard {
    guard: PageDataWriteGuard,
    page: PinnedPage,
}

impl PageWriteGuard {
    pub fn page_id(&self) -> PageId {
        self.page.page_id()
    }
}

impl Deref for PageWriteGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}
