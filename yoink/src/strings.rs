//! Arena-scoped string and buffer helpers.
//!
//! Straight passthroughs that allocate an opaque block via [`Arena::alloc_bytes`]
//! and copy into it: `strdup`, `strndup`, formatted writes, and `memcpy`.
//! The original double-passes `vsnprintf` (once with a null destination to
//! measure, once to write); here formatting is done once into a scratch
//! buffer and the final length copied into the arena, since `core::fmt`
//! has no null-destination sizing pass to mirror.

use core::fmt;
use core::ptr::NonNull;

use rust_alloc::string::String;

use crate::arena::Arena;

impl Arena {
    /// Copy `len` bytes from `data` into a fresh opaque allocation.
    pub fn memcpy(&self, data: &[u8]) -> NonNull<u8> {
        let dst = self.alloc_bytes(data.len());
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), dst.as_ptr(), data.len());
        }
        dst
    }

    /// Duplicate a UTF-8 string into the arena, including a trailing NUL
    /// byte (mirroring `strdup`'s C-string convention).
    pub fn strdup(&self, s: &str) -> NonNull<u8> {
        let dst = self.alloc_bytes(s.len() + 1);
        unsafe {
            core::ptr::copy_nonoverlapping(s.as_ptr(), dst.as_ptr(), s.len());
            *dst.as_ptr().add(s.len()) = 0;
        }
        dst
    }

    /// Like [`Arena::strdup`] but bounds the copy to at most `n` bytes and
    /// NUL-terminates at the actual copied length.
    pub fn strndup(&self, s: &str, n: usize) -> NonNull<u8> {
        let len = s.len().min(n);
        let dst = self.alloc_bytes(len + 1);
        unsafe {
            core::ptr::copy_nonoverlapping(s.as_ptr(), dst.as_ptr(), len);
            *dst.as_ptr().add(len) = 0;
        }
        dst
    }

    /// Render `args` (as built by `format_args!`) into a fresh arena
    /// allocation, NUL-terminated, playing the role of `arena_printf`.
    pub fn printf(&self, args: fmt::Arguments<'_>) -> NonNull<u8> {
        let mut scratch = String::new();
        fmt::write(&mut scratch, args).expect("formatting into a String cannot fail");
        self.strdup(&scratch)
    }
}

/// Convenience macro mirroring `arena_printf(arena, fmt, ...)`.
#[macro_export]
macro_rules! arena_printf {
    ($arena:expr, $($arg:tt)*) => {
        $arena.printf(core::format_args!($($arg)*))
    };
}
