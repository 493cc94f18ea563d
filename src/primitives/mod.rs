//! Low-level primitives underneath the schema layer.
//!
//! Includes byte utilities, positioned file I/O, the chunk store and the
//! reader/writer lock protocol.

/// Byte-level encoding helpers.
pub mod bytes;

/// Reader/writer lock protocol and cancellation tokens.
pub mod concurrency;

/// Positioned file I/O.
pub mod io;

/// Chunk store: allocation and typed access at arbitrary offsets.
pub mod store;
