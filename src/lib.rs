//! Transactional, memory-mapped, copy-on-write page storage engine.
//!
//! A vesper environment is a directory holding a data file of fixed-size
//! pages, an ordered set of append-only journal files, and a pool of scratch
//! buffers for page versions that are not yet checkpointed. A single write
//! transaction at a time stages copy-on-write page images in scratch and
//! publishes them atomically by appending a transaction record to the
//! journal; any number of concurrent read transactions observe immutable
//! snapshots.

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;
