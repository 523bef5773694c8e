/// Index of a frame in the buffer pool's frame array.
pub type FrameId = usize;

/// Victim-selection policy consumed by the buffer pool.
///
/// The pool calls `insert` when a frame's pin count drops to zero,
/// `erase` when a candidate gets pinned again or deleted, and `victim`
/// when it needs to evict.
pub trait Replacer: Send {
    /// Registers `frame_id` as an eviction candidate, moving it to the
    /// most-recently-used position if already present.
    fn insert(&mut self, frame_id: FrameId);

    /// Drops `frame_id` from the candidate set. Returns false if it was
    /// not present.
    fn erase(&mut self, frame_id: FrameId) -> bool;

    /// Removes and returns the next eviction victim, if any.
    fn victim(&mut self) -> Option<FrameId>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
