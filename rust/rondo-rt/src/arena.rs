//! Bump-pointer arena for iteration-scoped allocations.
//!
//! Each worker owns one [`IterationArena`] behind its façade. Allocations
//! live until the arena is reset, which happens at iteration boundaries (or
//! at commit when local state carries data from the neighborhood pass to the
//! work pass). Resetting keeps the backing chunks, so steady-state rounds
//! allocate without touching the global allocator.

use std::alloc::Layout;
use std::fmt;

/// Default chunk size: 16 KiB.
const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

struct Chunk {
    buf: Box<[u8]>,
    used: usize,
}

impl Chunk {
    fn with_capacity(size: usize) -> Self {
        Self {
            buf: vec![0u8; size].into_boxed_slice(),
            used: 0,
        }
    }

    /// Bump-allocate `size` bytes at `align` within this chunk, or `None`
    /// if it does not fit.
    fn bump(&mut self, size: usize, align: usize) -> Option<*mut u8> {
        let base = self.buf.as_mut_ptr() as usize + self.used;
        let aligned = (base + align - 1) & !(align - 1);
        let end = aligned + size;
        if end > self.buf.as_ptr() as usize + self.buf.len() {
            return None;
        }
        self.used = end - self.buf.as_ptr() as usize;
        Some(aligned as *mut u8)
    }
}

/// A bump-pointer arena whose contents all share one lifetime.
///
/// `reset()` invalidates every pointer previously handed out and rewinds the
/// arena to empty while keeping its chunks for reuse. Values allocated with
/// [`alloc_value`](IterationArena::alloc_value) do **not** have their `Drop`
/// implementations run; the arena is for plain scratch data.
pub struct IterationArena {
    chunks: Vec<Chunk>,
    /// Index of the chunk currently being bumped.
    active: usize,
    chunk_size: usize,
    total_allocated: usize,
}

impl IterationArena {
    /// Create an arena with the default chunk size.
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    /// Create an arena with a custom chunk size.
    ///
    /// # Panics
    /// Panics if `chunk_size` is 0.
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be > 0");
        Self {
            chunks: Vec::new(),
            active: 0,
            chunk_size,
            total_allocated: 0,
        }
    }

    /// Allocate raw bytes for `layout`.
    ///
    /// # Panics
    /// Panics on zero-sized layouts.
    pub fn alloc(&mut self, layout: Layout) -> *mut u8 {
        let (size, align) = (layout.size(), layout.align());
        assert!(size > 0, "zero-size allocations are not supported");

        // Walk forward through existing chunks before growing.
        while self.active < self.chunks.len() {
            if let Some(ptr) = self.chunks[self.active].bump(size, align) {
                self.total_allocated += size;
                return ptr;
            }
            self.active += 1;
        }

        // Oversize requests get a chunk of their own.
        let cap = self.chunk_size.max(size + align - 1);
        self.chunks.push(Chunk::with_capacity(cap));
        self.active = self.chunks.len() - 1;
        let ptr = self.chunks[self.active]
            .bump(size, align)
            .expect("fresh chunk must satisfy its own allocation");
        self.total_allocated += size;
        ptr
    }

    /// Allocate and initialize a value, returning a reference into the arena.
    ///
    /// The value's `Drop` implementation will not run.
    pub fn alloc_value<T>(&mut self, value: T) -> &mut T {
        let layout = Layout::new::<T>();
        if layout.size() == 0 {
            // ZSTs need no storage.
            return unsafe { &mut *std::ptr::NonNull::dangling().as_ptr() };
        }
        let ptr = self.alloc(layout) as *mut T;
        // SAFETY: `ptr` is freshly bump-allocated with T's layout and is not
        // aliased until the next reset.
        unsafe {
            ptr.write(value);
            &mut *ptr
        }
    }

    /// Rewind the arena to empty, keeping the chunks for reuse.
    ///
    /// Every pointer previously returned becomes invalid.
    pub fn reset(&mut self) {
        for chunk in &mut self.chunks {
            chunk.used = 0;
        }
        self.active = 0;
        self.total_allocated = 0;
    }

    /// Bytes handed out since the last reset (excluding alignment padding).
    pub fn bytes_allocated(&self) -> usize {
        self.total_allocated
    }

    /// Bytes reserved across all chunks.
    pub fn bytes_reserved(&self) -> usize {
        self.chunks.iter().map(|c| c.buf.len()).sum()
    }
}

impl Default for IterationArena {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IterationArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IterationArena")
            .field("chunks", &self.chunks.len())
            .field("bytes_allocated", &self.bytes_allocated())
            .field("bytes_reserved", &self.bytes_reserved())
            .finish()
    }
}
