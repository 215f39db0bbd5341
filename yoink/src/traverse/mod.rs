//! The worklist-based graph walk shared by every extraction mode:
//! yoink-to-arena (single and multi-root), yoink-to-malloc, and vacuum.
//!
//! Every mode pushes *locations* onto the worklist, not values: a root-array
//! slot for roots, or the address/offset of a managed-pointer field inside a
//! block already copied into the destination. Popping a location, reading
//! its current value, relocating it through the visited table, and writing
//! the relocated value back into that same location is what keeps cyclic
//! graphs correct without recursion: a cycle's second edge finds the first
//! visit already recorded and patches against it instead of re-copying.
//!
//! Grounded on `examples/original_source/src/yoink.c`'s `yoink_to_arena`,
//! `yoinks_to_arena`, `yoink_to_malloc` and `arena_vacuums`.

use core::ptr::NonNull;

use rust_alloc::vec::Vec;

use crate::arena::{Arena, Header, ManagedPtr, YFlags};
use crate::diagnostics::{yoink_debug, yoink_info};
use crate::error::{Result, YoinkError};
use crate::layout::Shape;
use crate::table::Table;

/// What kind of value a raw managed-pointer word holds.
pub(crate) enum Classified {
    Null,
    /// Low bit set: caller data the engine must never dereference.
    Tagged(usize),
    Arena(NonNull<u8>),
}

#[inline]
pub(crate) fn classify(v: usize) -> Classified {
    if v == 0 {
        Classified::Null
    } else if v & 1 == 1 {
        Classified::Tagged(v)
    } else {
        Classified::Arena(unsafe { NonNull::new_unchecked(v as *mut u8) })
    }
}

/// Convert a [`ManagedPtr`] to its raw word representation for worklist use.
#[inline]
pub(crate) fn to_raw(p: ManagedPtr) -> usize {
    p.map_or(0, |p| p.as_ptr() as usize)
}

#[inline]
pub(crate) fn from_raw(v: usize) -> ManagedPtr {
    match classify(v) {
        Classified::Null => None,
        Classified::Tagged(t) => NonNull::new(t as *mut u8),
        Classified::Arena(p) => Some(p),
    }
}

const WORD: usize = size_of::<usize>();

#[inline]
unsafe fn slot_at(base: *mut u8, word_index: usize) -> *mut usize {
    unsafe { base.cast::<usize>().add(word_index) }
}

/// Copy a single root into `to`, returning the relocated root.
pub fn yoink(to: &Arena, root: ManagedPtr) -> ManagedPtr {
    let mut roots = [to_raw(root)];
    yoinks_raw(to, &mut roots);
    from_raw(roots[0])
}

/// Copy every block reachable from `roots` into `to`, patching every root
/// in place to its relocated address. Returns payload bytes copied.
pub fn yoinks(to: &Arena, roots: &mut [ManagedPtr]) -> usize {
    let mut raw: Vec<usize> = roots.iter().map(|p| to_raw(*p)).collect();
    let copied = yoinks_raw(to, &mut raw);
    for (slot, v) in roots.iter_mut().zip(raw) {
        *slot = from_raw(v);
    }
    copied
}

fn yoinks_raw(to: &Arena, roots: &mut [usize]) -> usize {
    yoink_info!(root_count = roots.len(), "yoink to arena: begin");
    let mut visited = Table::new_map();
    // Blocks already living in `to` relocate to themselves, so joining a
    // fresh yoink against a non-empty arena doesn't re-copy its contents.
    for (_, payload) in to.walk() {
        let addr = payload.as_ptr() as usize;
        visited.ins(addr)[0] = addr;
    }

    let mut bytes_copied = 0usize;
    let mut worklist: Vec<*mut usize> = roots.iter_mut().map(|r| r as *mut usize).collect();

    while let Some(slot) = worklist.pop() {
        let v = unsafe { *slot };
        let addr = match classify(v) {
            Classified::Null | Classified::Tagged(_) => continue,
            Classified::Arena(addr) => addr,
        };
        let key = addr.as_ptr() as usize;
        let (relocated, added) = visited.ins(key);
        if added {
            let header = unsafe { Arena::header_of(addr) };
            let new_value = if header.flags.contains(YFlags::NULL_SELF) {
                0
            } else if header.flags.contains(YFlags::ALIAS_SELF) {
                key
            } else {
                let word_count = header.word_count() as usize;
                let shape = Shape::new(header.bptrs as u32, header.nptrs as u32);
                let new_payload = to.alloc(word_count, shape);
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        addr.as_ptr(),
                        new_payload.as_ptr(),
                        word_count * WORD,
                    );
                }
                bytes_copied += word_count * WORD;
                let new_addr = new_payload.as_ptr() as usize;
                yoink_debug!(from = key, to = new_addr, word_count, "yoink: copied block");
                if header.flags.contains(YFlags::NULL_CHILDREN) {
                    for i in header.ptr_range() {
                        unsafe { *slot_at(new_payload.as_ptr(), i) = 0 };
                    }
                } else {
                    for i in header.ptr_range() {
                        worklist.push(unsafe { slot_at(new_payload.as_ptr(), i) });
                    }
                }
                new_addr
            };
            relocated[0] = new_value;
            unsafe { *slot = new_value };
        } else {
            unsafe { *slot = relocated[0] };
        }
    }
    yoink_info!(bytes_copied, "yoink to arena: complete");
    bytes_copied
}

#[inline]
pub(crate) fn write_usize_at(buf: &mut [u8], offset: usize, value: usize) {
    buf[offset..offset + WORD].copy_from_slice(&value.to_ne_bytes());
}

#[inline]
pub(crate) fn read_usize_at(buf: &[u8], offset: usize) -> usize {
    usize::from_ne_bytes(buf[offset..offset + WORD].try_into().unwrap())
}

#[inline]
fn header_bytes(h: &Header) -> &[u8] {
    unsafe { core::slice::from_raw_parts((h as *const Header).cast::<u8>(), size_of::<Header>()) }
}

/// Copy the graph reachable from `root` into a freestanding byte buffer,
/// prefixed by `prefix_len` bytes the caller fills in afterwards (used by
/// `freeze` to reserve room for its blob header).
///
/// When `keep_metadata` is false, block headers are not emitted and the
/// returned buffer cannot be walked or thawed later; it is raw payload data
/// only. When true, each block is preceded by its `Header`, making the
/// buffer self-describing enough for `freeze`/`thaw` to walk it.
///
/// Every emitted managed-pointer slot is rewritten, in a second pass once
/// the buffer's final address is known, from a provisional within-buffer
/// offset to `base + offset` — the address the pointee will have once this
/// buffer (or the blob built from it) is in its final resting place.
pub(crate) fn emit(
    root: ManagedPtr,
    keep_metadata: bool,
    prefix_len: usize,
    base_override: Option<usize>,
) -> (Vec<u8>, usize) {
    yoink_info!(keep_metadata, "emit: begin");
    let root_raw = to_raw(root);
    let root_is_arena = matches!(classify(root_raw), Classified::Arena(_));

    let mut buf = rust_alloc::vec![0u8; prefix_len];
    let mut visited = Table::new_map();
    let mut trace: Vec<usize> = Vec::new();
    let mut roots = [root_raw];

    enum Loc {
        Root,
        Offset(usize),
    }

    let mut worklist: Vec<Loc> = rust_alloc::vec![Loc::Root];

    while let Some(loc) = worklist.pop() {
        let v = match loc {
            Loc::Root => roots[0],
            Loc::Offset(off) => read_usize_at(&buf, off),
        };
        let addr = match classify(v) {
            Classified::Null | Classified::Tagged(_) => continue,
            Classified::Arena(addr) => addr,
        };
        let key = addr.as_ptr() as usize;
        let (relocated, added) = visited.ins(key);
        let new_value = if added {
            let header = unsafe { Arena::header_of(addr) };
            if header.flags.contains(YFlags::NULL_SELF) {
                0
            } else {
                if keep_metadata {
                    buf.extend_from_slice(header_bytes(&header));
                }
                let offset = buf.len();
                let word_count = header.word_count() as usize;
                let src = unsafe { core::slice::from_raw_parts(addr.as_ptr(), word_count * WORD) };
                buf.extend_from_slice(src);
                yoink_debug!(from = key, offset, word_count, "emit: copied block");

                if header.flags.contains(YFlags::NULL_CHILDREN) {
                    for i in header.ptr_range() {
                        write_usize_at(&mut buf, offset + i * WORD, 0);
                    }
                } else {
                    for i in header.ptr_range() {
                        let slot_off = offset + i * WORD;
                        worklist.push(Loc::Offset(slot_off));
                    }
                }
                offset
            }
        } else {
            relocated[0]
        };
        if added {
            relocated[0] = new_value;
        }
        match loc {
            Loc::Root => roots[0] = new_value,
            Loc::Offset(off) => {
                write_usize_at(&mut buf, off, new_value);
                // `new_value == 0` only happens via `NULL_SELF`, a deliberate
                // null — not a within-buffer offset — so it must not be
                // rebased. Every other value reaching this point is a real
                // offset: the early `continue` above already filtered out
                // slots whose raw value classified as null or tagged, which
                // are left untouched with their originally copied bytes.
                if new_value != 0 {
                    trace.push(off);
                }
            }
        }
    }

    let base = base_override.unwrap_or(buf.as_ptr() as usize);
    for off in trace {
        let v = read_usize_at(&buf, off);
        write_usize_at(&mut buf, off, base + v);
    }
    let root_value = if root_is_arena && roots[0] != 0 {
        base + roots[0]
    } else {
        roots[0]
    };
    yoink_info!(bytes_emitted = buf.len(), "emit: complete");
    (buf, root_value)
}

/// Copy the graph reachable from `root` into a plain malloc'd buffer.
///
/// When `keep_metadata` is `false` the buffer holds raw payload data with no
/// recoverable structure; when `true` it is laid out exactly like a frozen
/// blob's body (see [`crate::freeze`]), minus the blob header.
pub fn yoink_to_malloc(root: ManagedPtr, keep_metadata: bool) -> (Vec<u8>, ManagedPtr) {
    let (buf, root_value) = emit(root, keep_metadata, 0, None);
    (buf, from_raw(root_value))
}

/// Mark-and-sweep compaction in place: frees every block in `arena` not
/// reachable from `roots`, patching nothing (payload addresses never move).
///
/// When `strict` is true, a managed pointer whose target does not belong to
/// `arena` is reported as [`YoinkError::DanglingPointer`] instead of being
/// silently treated as foreign/tagged data.
pub fn vacuum(arena: &Arena, roots: &mut [ManagedPtr], strict: bool) -> Result<usize> {
    yoink_info!(root_count = roots.len(), strict, "vacuum: begin");
    let mut marked = Table::new_set();
    let mut worklist: Vec<usize> = roots.iter().map(|p| to_raw(*p)).collect();

    while let Some(v) = worklist.pop() {
        let addr = match classify(v) {
            Classified::Null | Classified::Tagged(_) => continue,
            Classified::Arena(addr) => addr,
        };
        if strict && !arena.contains(addr) {
            return Err(YoinkError::DanglingPointer {
                address: addr.as_ptr() as usize,
            });
        }
        let key = addr.as_ptr() as usize;
        if marked.add(key) {
            yoink_debug!(addr = key, "vacuum: marked block");
            let header = unsafe { Arena::header_of(addr) };
            if header.flags.contains(YFlags::NULL_CHILDREN) {
                continue;
            }
            for i in header.ptr_range() {
                let child = unsafe { *slot_at(addr.as_ptr(), i) };
                worklist.push(child);
            }
        }
    }

    let freed = arena.retain_payloads(|payload| marked.contains(payload.as_ptr() as usize));
    yoink_info!(freed, "vacuum: complete");
    Ok(freed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Shape;

    /// A 3-word tree node: `left`/`right` (words 0-1, the only genuine
    /// managed-pointer slots — `Shape::new(0, 2)`) and a scalar `value`
    /// (word 2) that sits outside the pointer range and is never
    /// dereferenced. Mirrors the original's `struct node { left; right; int
    /// v; }`, where `v` lives past `END_PTRS`.
    fn node(arena: &Arena, left: usize, right: usize, value: usize) -> NonNull<u8> {
        let ptr = arena.alloc(3, Shape::new(0, 2));
        unsafe {
            *slot_at(ptr.as_ptr(), 0) = left;
            *slot_at(ptr.as_ptr(), 1) = right;
            *slot_at(ptr.as_ptr(), 2) = value;
        }
        ptr
    }

    #[test]
    fn yoink_copies_a_tree() {
        let from = Arena::new();
        let leaf = node(&from, 0, 0, 1);
        let root = node(&from, leaf.as_ptr() as usize, 0, 2);

        let to = Arena::new();
        let new_root = yoink(&to, Some(root)).expect("root survives");

        assert_eq!(to.block_count(), 2);
        let left = unsafe { *slot_at(new_root.as_ptr(), 0) };
        assert_ne!(left, leaf.as_ptr() as usize);
        assert_eq!(unsafe { *slot_at(left as *mut u8, 2) }, 1);
    }

    #[test]
    fn yoink_to_malloc_preserves_terminating_null() {
        let from = Arena::new();
        let root = node(&from, 0, 0, 0);

        let (buf, new_root) = yoink_to_malloc(Some(root), true);
        let new_root = new_root.unwrap();
        let base = buf.as_ptr() as usize;
        let left_off = new_root.as_ptr() as usize - base;
        assert_eq!(
            read_usize_at(&buf, left_off),
            0,
            "a null child must stay null after rebasing, not become the buffer base"
        );
    }

    #[test]
    fn yoink_preserves_cycles() {
        let from = Arena::new();
        let a = from.alloc(1, Shape::new(0, 1));
        unsafe { *slot_at(a.as_ptr(), 0) = a.as_ptr() as usize };

        let to = Arena::new();
        let new_a = yoink(&to, Some(a)).unwrap();
        assert_eq!(to.block_count(), 1);
        let self_ptr = unsafe { *slot_at(new_a.as_ptr(), 0) };
        assert_eq!(self_ptr, new_a.as_ptr() as usize);
    }

    #[test]
    fn yoinks_relocates_every_root() {
        let from = Arena::new();
        let shared = from.alloc(1, Shape::new(0, 0));
        let a = node(&from, shared.as_ptr() as usize, 0, 0);
        let b = node(&from, shared.as_ptr() as usize, 0, 0);

        let to = Arena::new();
        let mut roots = [Some(a), Some(b)];
        yoinks(&to, &mut roots);

        let new_a_left = unsafe { *slot_at(roots[0].unwrap().as_ptr(), 0) };
        let new_b_left = unsafe { *slot_at(roots[1].unwrap().as_ptr(), 0) };
        assert_eq!(new_a_left, new_b_left, "shared child relocates once");
        assert_eq!(to.block_count(), 3);
    }

    #[test]
    fn null_children_prunes_outgoing_pointers() {
        let from = Arena::new();
        let leaf = from.alloc(1, Shape::new(0, 0));
        let root = node(&from, leaf.as_ptr() as usize, 0, 0);
        unsafe { Arena::add_flags(root, YFlags::NULL_CHILDREN) };

        let to = Arena::new();
        let new_root = yoink(&to, Some(root)).unwrap();
        assert_eq!(unsafe { *slot_at(new_root.as_ptr(), 0) }, 0);
        assert_eq!(to.block_count(), 1, "child is pruned, not copied");
    }

    #[test]
    fn vacuum_frees_unreachable_blocks() {
        let arena = Arena::new();
        let kept = arena.alloc_bytes(8);
        arena.alloc_bytes(8);
        assert_eq!(arena.block_count(), 2);

        let mut roots = [Some(kept)];
        let freed = vacuum(&arena, &mut roots, false).unwrap();
        assert_eq!(freed, 8);
        assert_eq!(arena.block_count(), 1);
    }

    #[test]
    fn vacuum_strict_reports_dangling_pointer() {
        let arena = Arena::new();
        let other = Arena::new();
        let foreign = other.alloc_bytes(8);

        let mut roots = [Some(foreign)];
        let err = vacuum(&arena, &mut roots, true).unwrap_err();
        assert!(matches!(err, YoinkError::DanglingPointer { .. }));
    }

    #[test]
    fn yoink_to_malloc_without_metadata_round_trips_payload() {
        let from = Arena::new();
        let leaf = from.alloc(1, Shape::new(0, 0));
        unsafe { *slot_at(leaf.as_ptr(), 0) = 0x2a };
        let root = node(&from, leaf.as_ptr() as usize, 0, 0);

        let (buf, new_root) = yoink_to_malloc(Some(root), false);
        let new_root = new_root.unwrap();
        let base = buf.as_ptr() as usize;
        assert!((new_root.as_ptr() as usize) >= base);
        let car_off = new_root.as_ptr() as usize - base;
        let child_addr = read_usize_at(&buf, car_off);
        let child_off = child_addr - base;
        assert_eq!(read_usize_at(&buf, child_off), 0x2a);
    }

    #[test]
    fn yoink_to_malloc_with_metadata_prefixes_headers() {
        let from = Arena::new();
        let root = from.alloc(1, Shape::new(0, 0));
        unsafe { *slot_at(root.as_ptr(), 0) = 7 };

        let (buf, new_root) = yoink_to_malloc(Some(root), true);
        let new_root = new_root.unwrap();
        let base = buf.as_ptr() as usize;
        let payload_off = new_root.as_ptr() as usize - base;
        assert_eq!(payload_off, size_of::<Header>());
        assert_eq!(read_usize_at(&buf, payload_off), 7);
    }
}
