//! The chain link layout: `{ next, header, payload[] }`.
//!
//! `payload` is not a real Rust field — stable Rust has no flexible array
//! members — but since [`ChainLink`] has no trailing padding after `header`
//! (both fields are at most pointer-aligned), a payload allocated directly
//! after a `ChainLink` in the same allocation sits exactly
//! `size_of::<ChainLink>()` bytes past the link's address, mirroring the
//! original `struct chain { struct chain *next; struct header head; void
//! *data[]; }`.

use core::ptr::NonNull;

bitflags::bitflags! {
    /// Flags on a block header. `NULL_CHILDREN`/`NULL_SELF`/`ALIAS_SELF` are
    /// caller-settable traversal hooks; the rest are used internally by the
    /// engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct YFlags: u8 {
        /// Do not copy children; set all outgoing managed pointers to null.
        const NULL_CHILDREN = 1 << 0;
        /// Do not copy self; replace references to this block with null.
        const NULL_SELF = 1 << 1;
        /// Do not copy self; share the same address in the copy instead.
        const ALIAS_SELF = 1 << 2;
        /// Set while the block lives inside a frozen blob.
        const IS_FROZEN = 1 << 3;
        /// Scratch bit used by `vacuum`'s mark phase.
        const IS_USED = 1 << 4;
    }
}

/// Immutable per-block metadata, populated once at allocation time.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Header {
    /// Payload size in bytes; always a multiple of the pointer size.
    pub tsz: u32,
    /// Number of managed-pointer slots in the payload.
    pub nptrs: u16,
    /// Offset, in pointer-sized words, to the first managed-pointer slot.
    pub bptrs: u16,
    pub flags: YFlags,
    _pad: [u8; 3],
}

impl Header {
    pub fn new(tsz: u32, bptrs: u16, nptrs: u16, flags: YFlags) -> Self {
        Header {
            tsz,
            nptrs,
            bptrs,
            flags,
            _pad: [0; 3],
        }
    }

    /// Payload size in pointer-sized words.
    #[inline]
    pub fn word_count(&self) -> u32 {
        self.tsz / size_of::<usize>() as u32
    }

    /// The managed-pointer slice bounds, in pointer-sized word offsets.
    #[inline]
    pub fn ptr_range(&self) -> core::ops::Range<usize> {
        self.bptrs as usize..(self.bptrs as usize + self.nptrs as usize)
    }
}

#[repr(C)]
pub(crate) struct ChainLink {
    pub next: *mut ChainLink,
    pub header: Header,
}

impl ChainLink {
    /// Byte offset from the start of a `ChainLink` allocation to its
    /// payload.
    pub const PAYLOAD_OFFSET: usize = size_of::<ChainLink>();

    #[inline]
    pub unsafe fn payload(link: NonNull<ChainLink>) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(link.as_ptr().cast::<u8>().add(Self::PAYLOAD_OFFSET)) }
    }

    /// Recover the owning link from a payload address. Callers must ensure
    /// `payload` really was returned by [`ChainLink::payload`] on a live
    /// link — this is the same trust boundary the original places on every
    /// managed pointer (§3, invariant 1).
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> NonNull<ChainLink> {
        unsafe {
            NonNull::new_unchecked(payload.as_ptr().sub(Self::PAYLOAD_OFFSET).cast::<ChainLink>())
        }
    }

    #[inline]
    pub fn total_len(payload_bytes: usize) -> usize {
        Self::PAYLOAD_OFFSET + payload_bytes
    }
}
