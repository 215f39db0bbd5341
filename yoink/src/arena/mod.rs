//! Lock-free arena: a Treiber stack of typed allocation blocks.
//!
//! Maps directly onto `add_link`/`arena_free`/`arena_move` in the original
//! C arena — a single atomic pointer to the head of a singly linked chain,
//! CAS-pushed on allocation, CAS-stolen on free or join.

mod chain;

pub use chain::{Header, YFlags};

use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};

use rust_alloc::alloc::{alloc_zeroed, dealloc, handle_alloc_error};

use crate::diagnostics::yoink_trace;
use crate::growbuf::GrowBuffer;
use crate::layout::Shape;
use chain::ChainLink;

/// A pointer the traversal engine may follow: null, a tagged raw value
/// (low bit set), or the payload address of a live block in some arena.
pub type ManagedPtr = Option<NonNull<u8>>;

#[inline]
pub fn is_tagged(ptr: NonNull<u8>) -> bool {
    (ptr.as_ptr() as usize) & 1 == 1
}

fn layout_for(payload_bytes: usize) -> Layout {
    Layout::from_size_align(ChainLink::total_len(payload_bytes), align_of::<usize>())
        .expect("block layout overflow")
}

/// A region-scoped allocator owning a linked set of memory blocks, freed
/// wholesale. Zero-initialized at construction; no other state.
pub struct Arena {
    head: AtomicPtr<ChainLink>,
}

// SAFETY: every mutation of `head` goes through atomic CAS; `ChainLink`
// payloads are only mutated by their single logical owner at a time per
// the shared-resource policy in the spec (§5).
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    pub const fn new() -> Self {
        Arena {
            head: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Round `word_count` pointer-sized words up, allocate `{header,
    /// payload}`, zero-fill the payload, record `shape`, and prepend the
    /// block to the chain via a CAS loop. Returns the payload address.
    pub fn alloc(&self, word_count: usize, shape: Shape) -> NonNull<u8> {
        assert!(
            shape.fits_within(word_count as u32),
            "shape {shape:?} does not fit within {word_count} words"
        );
        let payload_bytes = word_count * size_of::<usize>();
        let layout = layout_for(payload_bytes);
        let raw = unsafe { alloc_zeroed(layout) }.cast::<ChainLink>();
        let Some(link) = NonNull::new(raw) else {
            handle_alloc_error(layout);
        };
        unsafe {
            (*link.as_ptr()).header = Header::new(
                payload_bytes as u32,
                shape.bptrs as u16,
                shape.nptrs as u16,
                YFlags::empty(),
            );
        }
        self.push(link);
        yoink_trace!(payload_bytes, nptrs = shape.nptrs, "arena alloc");
        unsafe { ChainLink::payload(link) }
    }

    /// Allocate `size` opaque bytes with no managed pointers, rounded up to
    /// a pointer-size multiple.
    pub fn alloc_bytes(&self, size: usize) -> NonNull<u8> {
        let words = size.div_ceil(size_of::<usize>());
        self.alloc(words, Shape::OPAQUE)
    }

    /// Adopt a [`GrowBuffer`] a caller has been incrementally appending one
    /// object's payload into as a new block in this arena: round the
    /// payload up to pointer alignment (zero-padding), allocate a block of
    /// matching shape, and copy the payload in. When `is_pointer_array` is
    /// true every word of the payload is treated as a managed-pointer slot
    /// (`Shape::pointer_array`); otherwise the block is opaque. The buffer
    /// is empty after this call. Returns the new block's payload address.
    ///
    /// Grounded on `arena_initialize_buffer`/`arena_finalize_buffer`
    /// (`examples/original_source/src/yoink.c`), which instead adopt the
    /// buffer's own allocation in place as the chain link. This crate
    /// copies the payload into a block allocated the normal way instead,
    /// since the arena's `dealloc` path assumes every chain link came from
    /// the pointer-aligned layout `alloc` uses — reusing an arbitrary
    /// `GrowBuffer` allocation directly would risk a layout mismatch on
    /// free.
    pub fn finalize_buffer<B: GrowBuffer>(&self, buf: &mut B, is_pointer_array: bool) -> NonNull<u8> {
        let payload_len = buf.len();
        let word_count = payload_len.div_ceil(size_of::<usize>());
        let aligned_len = word_count * size_of::<usize>();
        if aligned_len > payload_len {
            buf.grow_zeroed(aligned_len - payload_len);
        }

        let shape = if is_pointer_array {
            Shape::pointer_array(word_count as u32)
        } else {
            Shape::OPAQUE
        };
        let payload = self.alloc(word_count, shape);
        let bytes = buf.take();
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), payload.as_ptr(), aligned_len);
        }
        yoink_trace!(aligned_len, is_pointer_array, "arena finalize_buffer");
        payload
    }

    fn push(&self, link: NonNull<ChainLink>) {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            unsafe {
                (*link.as_ptr()).next = head;
            }
            match self.head.compare_exchange_weak(
                head,
                link.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    /// Atomically steal the whole chain, replacing it with an empty one.
    fn steal(&self) -> *mut ChainLink {
        self.head.swap(core::ptr::null_mut(), Ordering::AcqRel)
    }

    /// Free every block reachable from this arena. Concurrent callers race
    /// harmlessly: only one observes the non-empty chain.
    pub fn free(&self) {
        let mut cursor = self.steal();
        while !cursor.is_null() {
            let next = unsafe { (*cursor).next };
            let payload_bytes = unsafe { (*cursor).header.tsz as usize };
            unsafe { dealloc(cursor.cast::<u8>(), layout_for(payload_bytes)) };
            cursor = next;
        }
    }

    /// Splice `from`'s chain onto the front of `self`'s chain; `from` is
    /// left empty. Wait-free per operation, though CAS may retry under
    /// contention on `self`.
    pub fn join(&self, from: &Arena) {
        let stolen = from.steal();
        if stolen.is_null() {
            return;
        }
        let mut tail = stolen;
        unsafe {
            while !(*tail).next.is_null() {
                tail = (*tail).next;
            }
        }
        let mut to_head = self.head.load(Ordering::Acquire);
        loop {
            unsafe {
                (*tail).next = to_head;
            }
            match self.head.compare_exchange_weak(
                to_head,
                stolen,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => to_head = observed,
            }
        }
    }

    /// Total payload bytes reachable from this arena's chain.
    pub fn nbytes(&self) -> usize {
        self.walk().map(|(h, _)| h.tsz as usize).sum()
    }

    /// Number of blocks reachable from this arena's chain.
    pub fn block_count(&self) -> usize {
        self.walk().count()
    }

    /// Read-only snapshot walk over `(header, payload)` for every live
    /// block. Not safe to call concurrently with a mutator of this arena.
    pub(crate) fn walk(&self) -> WalkIter {
        WalkIter {
            cursor: self.head.load(Ordering::Acquire),
        }
    }

    /// Remove every block in this arena's chain whose payload address is
    /// not present in `keep`, freeing it. Returns bytes freed. Not
    /// thread-safe: mutates the arena in place.
    pub(crate) fn retain_payloads(&self, mut keep: impl FnMut(NonNull<u8>) -> bool) -> usize {
        let mut freed = 0usize;
        let mut survivors: *mut ChainLink = core::ptr::null_mut();
        let mut cursor = self.steal();
        while !cursor.is_null() {
            let next = unsafe { (*cursor).next };
            let payload = unsafe { ChainLink::payload(NonNull::new_unchecked(cursor)) };
            if keep(payload) {
                unsafe {
                    (*cursor).next = survivors;
                }
                survivors = cursor;
            } else {
                let payload_bytes = unsafe { (*cursor).header.tsz as usize };
                freed += payload_bytes;
                unsafe { dealloc(cursor.cast::<u8>(), layout_for(payload_bytes)) };
            }
            cursor = next;
        }
        if !survivors.is_null() {
            let mut to_head = self.head.load(Ordering::Acquire);
            loop {
                let mut tail = survivors;
                unsafe {
                    while !(*tail).next.is_null() {
                        tail = (*tail).next;
                    }
                    (*tail).next = to_head;
                }
                match self.head.compare_exchange_weak(
                    to_head,
                    survivors,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(observed) => to_head = observed,
                }
            }
        }
        freed
    }

    /// Whether `payload` addresses a block currently reachable from this
    /// arena's chain. O(n); intended for strict-mode validation, not hot
    /// paths.
    pub(crate) fn contains(&self, payload: NonNull<u8>) -> bool {
        self.walk().any(|(_, p)| p == payload)
    }

    /// Header for the block addressed by `payload`.
    ///
    /// # Safety
    /// `payload` must be a payload address returned by `alloc`/`alloc_bytes`
    /// on a still-live block.
    pub unsafe fn header_of(payload: NonNull<u8>) -> Header {
        unsafe { ChainLink::from_payload(payload).as_ref().header }
    }

    /// Add `flags` to the header of the block addressed by `payload`, the
    /// caller-settable hooks `NULL_CHILDREN`/`NULL_SELF`/`ALIAS_SELF`
    /// documented in [`YFlags`].
    ///
    /// # Safety
    /// Same requirement as [`Arena::header_of`].
    pub unsafe fn add_flags(payload: NonNull<u8>, flags: YFlags) {
        unsafe {
            (*ChainLink::from_payload(payload).as_ptr()).header.flags |= flags;
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.free();
    }
}

pub(crate) struct WalkIter {
    cursor: *mut ChainLink,
}

impl Iterator for WalkIter {
    type Item = (Header, NonNull<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.is_null() {
            return None;
        }
        let link = unsafe { NonNull::new_unchecked(self.cursor) };
        let header = unsafe { link.as_ref().header };
        let payload = unsafe { ChainLink::payload(link) };
        self.cursor = unsafe { link.as_ref().next };
        Some((header, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_aligned_and_zeroed() {
        let arena = Arena::new();
        let ptr = arena.alloc_bytes(24);
        assert_eq!(ptr.as_ptr() as usize % align_of::<usize>(), 0);
        let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), 24) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn free_then_alloc_reports_empty() {
        let arena = Arena::new();
        arena.alloc_bytes(16);
        arena.alloc_bytes(16);
        assert_eq!(arena.block_count(), 2);
        arena.free();
        assert_eq!(arena.block_count(), 0);
        arena.alloc_bytes(8);
        assert_eq!(arena.block_count(), 1);
    }

    #[test]
    fn join_moves_every_block_and_empties_source() {
        let to = Arena::new();
        let from = Arena::new();
        to.alloc_bytes(8);
        from.alloc_bytes(8);
        from.alloc_bytes(16);
        let before: rust_alloc::vec::Vec<usize> =
            from.walk().map(|(_, p)| p.as_ptr() as usize).collect();

        to.join(&from);

        assert_eq!(from.block_count(), 0);
        assert_eq!(to.block_count(), 3);
        let after: rust_alloc::vec::Vec<usize> =
            to.walk().map(|(_, p)| p.as_ptr() as usize).collect();
        for addr in before {
            assert!(after.contains(&addr));
        }
    }

    #[test]
    fn nbytes_sums_payloads() {
        let arena = Arena::new();
        arena.alloc_bytes(16);
        arena.alloc_bytes(32);
        assert_eq!(arena.nbytes(), 48);
    }

    #[test]
    fn finalize_buffer_adopts_opaque_payload() {
        use crate::growbuf::GrowBuffer;
        use rust_alloc::vec::Vec;

        let arena = Arena::new();
        let mut buf = Vec::<u8>::init();
        buf.append(b"hi");

        let payload = arena.finalize_buffer(&mut buf, false);
        assert!(buf.is_empty());
        assert_eq!(arena.block_count(), 1);
        let header = unsafe { Arena::header_of(payload) };
        assert_eq!(header.nptrs, 0);
        assert_eq!(header.word_count(), 1, "2-byte payload rounds up to one word");
        let bytes = unsafe { core::slice::from_raw_parts(payload.as_ptr(), 2) };
        assert_eq!(bytes, b"hi");
    }

    #[test]
    fn finalize_buffer_as_pointer_array_records_every_word() {
        use crate::growbuf::GrowBuffer;
        use rust_alloc::vec::Vec;

        let arena = Arena::new();
        let mut buf = Vec::<u8>::init();
        let a = arena.alloc_bytes(8);
        let b = arena.alloc_bytes(8);
        buf.push(a.as_ptr() as usize);
        buf.push(b.as_ptr() as usize);

        let payload = arena.finalize_buffer(&mut buf, true);
        let header = unsafe { Arena::header_of(payload) };
        assert_eq!(header.bptrs, 0);
        assert_eq!(header.nptrs, 2);
        assert_eq!(unsafe { *payload.as_ptr().cast::<usize>() }, a.as_ptr() as usize);
        assert_eq!(
            unsafe { *payload.as_ptr().cast::<usize>().add(1) },
            b.as_ptr() as usize
        );
    }

    #[test]
    fn shape_records_pointer_slice() {
        let arena = Arena::new();
        let shape = Shape::new(1, 2);
        let ptr = arena.alloc(4, shape);
        let header = unsafe { Arena::header_of(ptr) };
        assert_eq!(header.bptrs, 1);
        assert_eq!(header.nptrs, 2);
        assert_eq!(header.word_count(), 4);
    }
}
