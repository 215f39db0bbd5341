//! Structured diagnostics for allocation and traversal events.
//!
//! Behind the `tracing` feature these emit real spans/events; with the
//! feature off they compile down to nothing so call sites never need a
//! `cfg` guard.

#[cfg(feature = "tracing")]
macro_rules! yoink_trace {
    ($($arg:tt)*) => { tracing::trace!($($arg)*) };
}
#[cfg(not(feature = "tracing"))]
macro_rules! yoink_trace {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "tracing")]
macro_rules! yoink_debug {
    ($($arg:tt)*) => { tracing::debug!($($arg)*) };
}
#[cfg(not(feature = "tracing"))]
macro_rules! yoink_debug {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "tracing")]
macro_rules! yoink_info {
    ($($arg:tt)*) => { tracing::info!($($arg)*) };
}
#[cfg(not(feature = "tracing"))]
macro_rules! yoink_info {
    ($($arg:tt)*) => {};
}

pub(crate) use yoink_debug;
pub(crate) use yoink_info;
pub(crate) use yoink_trace;
