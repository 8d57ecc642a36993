//! Two-tier content cache fronting every upstream API call.
//!
//! A hot in-memory map answers all reads after startup; a pluggable
//! persistence backend absorbs periodic bulk flushes and primes the map
//! on boot.

pub mod blobs;
mod memory;
mod persist;

pub use blobs::{Blob, Payload};
pub use persist::{from_env, Cache, DiskBackend, MemoryBackend, Persister, SqliteBackend};
