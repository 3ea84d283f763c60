//! Concurrent, reference-counted caches for debugger data.
//!
//! Every cache keeps its entries in striped tables ([`stripe`]), hands out data only through
//! [`Access`](access::Access) tokens, and reclaims unreferenced entries in a periodic tick. The
//! [`CacheContext`](context::CacheContext) ties the caches together:
//!
//! - [`artifact`]: a generic cache of values produced lazily during ticks,
//! - [`content`]: a content-addressed store of byte blobs,
//! - [`file_stream`]: cached reads of file ranges that follow changes on disk,
//! - [`debug_info`]: converted and memory mapped debug info files.

#![warn(missing_debug_implementations)]

#[macro_use]
pub mod metrics;

pub mod access;
pub mod artifact;
pub mod config;
pub mod content;
pub mod context;
pub mod debug_info;
pub mod file_stream;
pub mod lanes;
pub mod logging;
pub mod stripe;
