//! Relocatable serialization: `freeze` a reachable graph into a self-
//! describing byte blob, `thaw` it back into live pointers after it has
//! potentially moved to a new address.
//!
//! Grounded on `examples/original_source/src/yoink.c`/`yoink.h`'s `struct
//! frozen`, `yoink_freeze`, and the (truncated in the retrieved source)
//! `yoink_thaw`. The pointer-encoding ambiguity the original leaves open is
//! resolved here as documented in `SPEC_FULL.md` §4.D and §9: every managed
//! pointer in a frozen blob stores the absolute address it will have once
//! thawed at its current location, not a tagged offset.

use core::fmt;

use rust_alloc::vec::Vec;

use crate::arena::{Header, ManagedPtr};
use crate::diagnostics::{yoink_debug, yoink_info};
use crate::error::{Result, YoinkError};
use crate::traverse::{self, Classified, classify, from_raw};

const WORD: usize = size_of::<usize>();
const HEADER_LEN: usize = 4 * size_of::<u64>();

#[inline]
fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_ne_bytes(buf[offset..offset + 8].try_into().unwrap())
}

#[inline]
fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
}

/// Read the block header stored at `offset` in a `keep_metadata` byte
/// stream.
///
/// # Safety
/// `offset` must address a valid, still-4-byte-aligned `Header` previously
/// written there by [`traverse::emit`] — true of every record boundary a
/// correctly driven walk of the stream lands on.
unsafe fn header_at(buf: &[u8], offset: usize) -> Header {
    debug_assert!(offset + size_of::<Header>() <= buf.len());
    unsafe { *(buf.as_ptr().add(offset) as *const Header) }
}

/// A per-process constant derived from host pointer width and byte order,
/// so `thaw` can reject a blob produced by an incompatible build. Computed
/// once and cached behind the `std` feature; recomputed (cheaply) on every
/// call otherwise.
fn magic() -> u64 {
    #[cfg(feature = "std")]
    {
        static MAGIC: std::sync::OnceLock<u64> = std::sync::OnceLock::new();
        *MAGIC.get_or_init(compute_magic)
    }
    #[cfg(not(feature = "std"))]
    {
        compute_magic()
    }
}

fn compute_magic() -> u64 {
    let probe: u32 = 0x0102_0304;
    let endian_tag = probe.to_ne_bytes()[0] as u64;
    let width_tag = ((size_of::<usize>() as u64) << 8) | (WORD as u64);
    0x594f_494e_4b00_0000u64 ^ (width_tag << 16) ^ endian_tag
}

/// Where a frozen blob's bytes live: an owned allocation, or a caller-
/// supplied region that `freeze` wrote into directly.
enum FrozenData<'a> {
    Owned(Vec<u8>),
    Borrowed(&'a mut [u8]),
}

/// A relocatable, self-describing serialization of a reachable object
/// graph. See the module docs and `SPEC_FULL.md` §4.D for the state
/// machine (*Fresh* → *Moved* → *Thawed*) this type's bytes move through.
pub struct FrozenBlob<'a> {
    data: FrozenData<'a>,
}

impl<'a> FrozenBlob<'a> {
    pub fn bytes(&self) -> &[u8] {
        match &self.data {
            FrozenData::Owned(v) => v,
            FrozenData::Borrowed(s) => s,
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.data {
            FrozenData::Owned(v) => v,
            FrozenData::Borrowed(s) => s,
        }
    }

    /// The relocated root address this blob currently carries.
    pub fn root(&self) -> ManagedPtr {
        from_raw(read_u64(self.bytes(), 24) as usize)
    }
}

impl fmt::Debug for FrozenBlob<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrozenBlob")
            .field("length", &self.bytes().len())
            .finish()
    }
}

/// Freeze the graph reachable from `root` into a blob: `{magic, length,
/// base, root}` followed by a `keep_metadata=true` payload stream laid out
/// exactly like [`traverse::yoink_to_malloc`]'s.
///
/// When `ice` is `Some`, the blob is written directly into that region;
/// if it is too small the call fails with
/// [`YoinkError::FreezeBufferTooSmall`] and the region's contents are left
/// unspecified. When `ice` is `None`, a fresh buffer is allocated.
pub fn freeze<'a>(root: ManagedPtr, ice: Option<&'a mut [u8]>) -> Result<FrozenBlob<'a>> {
    match ice {
        None => {
            let (mut buf, root_value) = traverse::emit(root, true, HEADER_LEN, None);
            let length = buf.len() as u64;
            let base = buf.as_ptr() as u64;
            write_u64(&mut buf, 0, magic());
            write_u64(&mut buf, 8, length);
            write_u64(&mut buf, 16, base);
            write_u64(&mut buf, 24, root_value as u64);
            yoink_info!(length, "freeze: complete");
            Ok(FrozenBlob {
                data: FrozenData::Owned(buf),
            })
        }
        Some(dest) => {
            let base_override = dest.as_ptr() as usize;
            let (buf, root_value) = traverse::emit(root, true, HEADER_LEN, Some(base_override));
            if buf.len() > dest.len() {
                return Err(YoinkError::FreezeBufferTooSmall {
                    needed: buf.len(),
                    available: dest.len(),
                });
            }
            dest[..buf.len()].copy_from_slice(&buf);
            write_u64(dest, 0, magic());
            write_u64(dest, 8, buf.len() as u64);
            write_u64(dest, 16, base_override as u64);
            write_u64(dest, 24, root_value as u64);
            yoink_info!(length = buf.len(), "freeze: complete");
            Ok(FrozenBlob {
                data: FrozenData::Borrowed(&mut dest[..buf.len()]),
            })
        }
    }
}

/// Rehydrate a frozen blob in place. If the blob has not moved since it was
/// last frozen or thawed (`base == ice`'s address), this is a no-op that
/// just returns the stored root. Otherwise every managed pointer in the
/// blob is shifted by `delta = ice - base` and `base` is updated, making
/// re-thawing at the same address idempotent.
pub fn thaw(ice: &mut [u8]) -> Result<ManagedPtr> {
    let found = read_u64(ice, 0);
    let expected = magic();
    if found != expected {
        return Err(YoinkError::MagicMismatch { expected, found });
    }
    let length = read_u64(ice, 8) as usize;
    let base = read_u64(ice, 16) as usize;
    let stored_root = read_u64(ice, 24) as usize;
    let here = ice.as_ptr() as usize;

    if base == here {
        yoink_info!("thaw: idempotent, blob has not moved");
        return Ok(from_raw(stored_root));
    }

    let delta = here.wrapping_sub(base);
    yoink_info!(length, delta, "thaw: begin");
    let mut offset = HEADER_LEN;
    while offset < length {
        let header = unsafe { header_at(ice, offset) };
        let payload_off = offset + size_of::<Header>();
        for i in header.ptr_range() {
            let slot_off = payload_off + i * WORD;
            let v = traverse::read_usize_at(ice, slot_off);
            if matches!(classify(v), Classified::Arena(_)) {
                traverse::write_usize_at(ice, slot_off, v.wrapping_add(delta));
            }
        }
        yoink_debug!(offset, "thaw: patched block");
        offset = payload_off + header.word_count() as usize * WORD;
    }

    let new_root_raw = if matches!(classify(stored_root), Classified::Arena(_)) {
        stored_root.wrapping_add(delta)
    } else {
        stored_root
    };
    write_u64(ice, 16, here as u64);
    write_u64(ice, 24, new_root_raw as u64);
    yoink_info!("thaw: complete");
    Ok(from_raw(new_root_raw))
}
