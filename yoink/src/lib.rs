//! An arena-based heap for object graphs with reachability-based
//! extraction, compaction, and serialization.
//!
//! Build a pointer-linked object graph inside an [`Arena`], then yoink the
//! transitively reachable part of it into a fresh arena ([`yoink`]/
//! [`yoinks`]), a plain byte buffer ([`yoink_to_malloc`]), or a relocatable
//! frozen blob ([`freeze`]/[`thaw`]). [`vacuum`] compacts an arena in place
//! instead of copying it.

#![no_std]

extern crate alloc as rust_alloc;

#[cfg(feature = "std")]
extern crate std;

mod arena;
mod diagnostics;
mod error;
mod freeze;
mod growbuf;
mod hash;
mod layout;
mod strings;
mod table;
mod traverse;

pub use arena::{Arena, Header, ManagedPtr, YFlags};
pub use error::{Result, YoinkError};
pub use freeze::{FrozenBlob, freeze, thaw};
pub use growbuf::GrowBuffer;
pub use hash::{IntHash, hash_mix16, hash_mix32, hash_mix64, ihash_mix16, ihash_mix32, ihash_mix64};
pub use layout::{HasShape, Shape};
pub use traverse::{vacuum, yoink, yoink_to_malloc, yoinks};

pub use yoink_derive::Shape;
