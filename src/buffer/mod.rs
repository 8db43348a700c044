//! Pooled packet buffers
//!
//! Fixed-size, cache-line aligned buffers drawn from a per-worker pool that
//! grows and shrinks between watermarks. A buffer starts life as a unique
//! [`PoolBufMut`] (filled by the receive path), then freezes into a shared,
//! refcounted [`BufRef`] that the reorder ring, FEC window and send queue can
//! hold simultaneously. Storage returns to the pool's free list when the last
//! holder drops.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Instant;

/// Size of every pool buffer. Large enough for an MTU-sized RTP packet with
/// headroom, small enough to keep hundreds of thousands resident.
pub const BUFFER_SIZE: usize = 2048;

/// Buffer storage block, aligned so payloads never straddle cache lines
/// unnecessarily.
#[repr(C, align(64))]
struct Block {
    bytes: [u8; BUFFER_SIZE],
}

impl Block {
    fn boxed() -> Box<Block> {
        // Zeroing keeps freshly expanded segments out of the page-fault path
        // during bursts.
        Box::new(Block { bytes: [0u8; BUFFER_SIZE] })
    }
}

/// Pool sizing parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Buffers allocated up front.
    pub initial_buffers: usize,
    /// Hard cap on total buffers.
    pub max_buffers: usize,
    /// Growth unit when the free list runs low.
    pub expand_step: usize,
    /// Expand when the free count drops to this level.
    pub low_watermark: usize,
    /// Shrink back while the free count exceeds this level.
    pub high_watermark: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            initial_buffers: 1024,
            max_buffers: 65536,
            expand_step: 1024,
            low_watermark: 64,
            high_watermark: 4096,
        }
    }
}

/// Counters surfaced on the status page.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub total: usize,
    pub free: usize,
    pub used: usize,
    pub max: usize,
    pub expansions: u64,
    pub exhaustions: u64,
    pub shrinks: u64,
    pub acquired: u64,
    pub released: u64,
}

struct Segment {
    id: u32,
    created: Instant,
    total: usize,
    /// How many of this segment's buffers currently sit on the free list.
    free: usize,
}

struct RawBuf {
    seg: u32,
    data: Box<Block>,
}

struct PoolInner {
    cfg: PoolConfig,
    free: Vec<RawBuf>,
    segments: Vec<Segment>,
    next_seg_id: u32,
    num_buffers: usize,
    expansions: u64,
    exhaustions: u64,
    shrinks: u64,
    acquired: u64,
    released: u64,
}

impl PoolInner {
    fn add_segment(&mut self, count: usize) {
        let id = self.next_seg_id;
        self.next_seg_id += 1;
        self.free.reserve(count);
        for _ in 0..count {
            self.free.push(RawBuf { seg: id, data: Block::boxed() });
        }
        self.segments.push(Segment { id, created: Instant::now(), total: count, free: count });
        self.num_buffers += count;
    }

    fn expand(&mut self) {
        let room = self.cfg.max_buffers.saturating_sub(self.num_buffers);
        let step = self.cfg.expand_step.min(room);
        if step == 0 {
            return;
        }
        self.add_segment(step);
        self.expansions += 1;
    }

    fn pop_free(&mut self) -> Option<RawBuf> {
        let raw = self.free.pop()?;
        if let Some(seg) = self.segments.iter_mut().find(|s| s.id == raw.seg) {
            seg.free -= 1;
        }
        self.acquired += 1;
        Some(raw)
    }

    fn push_free(&mut self, raw: RawBuf) {
        if let Some(seg) = self.segments.iter_mut().find(|s| s.id == raw.seg) {
            seg.free += 1;
        }
        self.released += 1;
        self.free.push(raw);
    }
}

/// Per-worker buffer pool. Cheap to clone; clones share the same storage.
#[derive(Clone)]
pub struct BufferPool {
    inner: Rc<RefCell<PoolInner>>,
}

impl BufferPool {
    pub fn new(cfg: PoolConfig) -> Self {
        let mut inner = PoolInner {
            cfg: cfg.clone(),
            free: Vec::new(),
            segments: Vec::new(),
            next_seg_id: 0,
            num_buffers: 0,
            expansions: 0,
            exhaustions: 0,
            shrinks: 0,
            acquired: 0,
            released: 0,
        };
        inner.add_segment(cfg.initial_buffers.min(cfg.max_buffers));
        BufferPool { inner: Rc::new(RefCell::new(inner)) }
    }

    /// Take one buffer, expanding the pool if the free list is at or under
    /// the low watermark. Returns `None` only when the pool is capped out.
    pub fn alloc(&self) -> Option<PoolBufMut> {
        let mut inner = self.inner.borrow_mut();
        if inner.free.len() <= inner.cfg.low_watermark {
            inner.expand();
        }
        match inner.pop_free() {
            Some(raw) => Some(PoolBufMut {
                data: Some(raw.data),
                seg: raw.seg,
                len: 0,
                pool: Rc::downgrade(&self.inner),
            }),
            None => {
                inner.exhaustions += 1;
                None
            }
        }
    }

    /// Take up to `n` buffers. Partial results are normal under pressure;
    /// callers drop what they cannot cover.
    pub fn alloc_batch(&self, n: usize) -> Vec<PoolBufMut> {
        let mut out = Vec::with_capacity(n);
        let mut inner = self.inner.borrow_mut();
        while inner.free.len() < n && inner.num_buffers < inner.cfg.max_buffers {
            inner.expand();
        }
        for _ in 0..n {
            match inner.pop_free() {
                Some(raw) => out.push(PoolBufMut {
                    data: Some(raw.data),
                    seg: raw.seg,
                    len: 0,
                    pool: Rc::downgrade(&self.inner),
                }),
                None => {
                    inner.exhaustions += 1;
                    break;
                }
            }
        }
        out
    }

    /// Release fully idle segments while the free count stays above the high
    /// watermark and the pool remains larger than its initial size. Oldest
    /// segments go first.
    pub fn try_shrink(&self) {
        let mut inner = self.inner.borrow_mut();
        loop {
            if inner.free.len() <= inner.cfg.high_watermark
                || inner.num_buffers <= inner.cfg.initial_buffers
            {
                return;
            }
            let victim = inner
                .segments
                .iter()
                .filter(|s| s.free == s.total)
                .min_by_key(|s| s.created)
                .map(|s| (s.id, s.total));
            let (id, total) = match victim {
                Some(v) => v,
                None => return,
            };
            inner.free.retain(|rb| rb.seg != id);
            inner.segments.retain(|s| s.id != id);
            inner.num_buffers -= total;
            inner.shrinks += 1;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.borrow();
        PoolStats {
            total: inner.num_buffers,
            free: inner.free.len(),
            used: inner.num_buffers - inner.free.len(),
            max: inner.cfg.max_buffers,
            expansions: inner.expansions,
            exhaustions: inner.exhaustions,
            shrinks: inner.shrinks,
            acquired: inner.acquired,
            released: inner.released,
        }
    }

    pub fn free_count(&self) -> usize {
        self.inner.borrow().free.len()
    }

    pub fn total_count(&self) -> usize {
        self.inner.borrow().num_buffers
    }
}

/// Uniquely owned, writable pool buffer. The receive path fills it, sets the
/// length, then freezes it for downstream sharing.
pub struct PoolBufMut {
    data: Option<Box<Block>>,
    seg: u32,
    len: usize,
    pool: Weak<RefCell<PoolInner>>,
}

impl PoolBufMut {
    pub fn capacity(&self) -> usize {
        BUFFER_SIZE
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Full writable storage; `set_len` records how much was filled.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        match self.data.as_mut() {
            Some(block) => &mut block.bytes,
            None => &mut [],
        }
    }

    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= BUFFER_SIZE);
        self.len = len.min(BUFFER_SIZE);
    }

    pub fn copy_from_slice(&mut self, src: &[u8]) {
        let n = src.len().min(BUFFER_SIZE);
        if let Some(block) = self.data.as_mut() {
            block.bytes[..n].copy_from_slice(&src[..n]);
        }
        self.len = n;
    }

    pub fn as_slice(&self) -> &[u8] {
        match self.data.as_ref() {
            Some(block) => &block.bytes[..self.len],
            None => &[],
        }
    }

    /// Convert into a shared, immutable reference covering the filled bytes.
    pub fn freeze(mut self) -> BufRef {
        let data = self.data.take();
        let len = self.len;
        let shared = Rc::new(SharedBuf {
            data,
            seg: self.seg,
            pool: self.pool.clone(),
        });
        BufRef { shared, offset: 0, len }
    }
}

impl Drop for PoolBufMut {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            if let Some(pool) = self.pool.upgrade() {
                pool.borrow_mut().push_free(RawBuf { seg: self.seg, data });
            }
        }
    }
}

struct SharedBuf {
    data: Option<Box<Block>>,
    seg: u32,
    pool: Weak<RefCell<PoolInner>>,
}

impl Drop for SharedBuf {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            if let Some(pool) = self.pool.upgrade() {
                pool.borrow_mut().push_free(RawBuf { seg: self.seg, data });
            }
        }
    }
}

/// Shared view into a pooled buffer. Cloning bumps the refcount; `slice`
/// narrows the view without copying. The storage returns to the pool when
/// the last view drops.
#[derive(Clone)]
pub struct BufRef {
    shared: Rc<SharedBuf>,
    offset: usize,
    len: usize,
}

impl BufRef {
    pub fn as_slice(&self) -> &[u8] {
        match self.shared.data.as_ref() {
            Some(block) => &block.bytes[self.offset..self.offset + self.len],
            None => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Narrow the view to `len` bytes starting `offset` into this view.
    pub fn slice(&self, offset: usize, len: usize) -> BufRef {
        debug_assert!(offset + len <= self.len);
        let offset = offset.min(self.len);
        let len = len.min(self.len - offset);
        BufRef {
            shared: Rc::clone(&self.shared),
            offset: self.offset + offset,
            len,
        }
    }

    /// Number of live views over the same storage.
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.shared)
    }
}

impl std::fmt::Debug for BufRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufRef")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("refs", &Rc::strong_count(&self.shared))
            .finish()
    }
}

/// Copy arbitrary bytes into a freshly allocated buffer. Used by the paths
/// that synthesize packets (FEC recovery, HTTP response preamble).
pub fn buf_from_slice(pool: &BufferPool, src: &[u8]) -> Option<BufRef> {
    let mut buf = pool.alloc()?;
    buf.copy_from_slice(src);
    Some(buf.freeze())
}
