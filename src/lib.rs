#![cfg_attr(feature = "nightly", feature(core_intrinsics))]

//! A concurrent hash map based on bucketized cuckoo hashing.
//!
//! Every key has exactly two candidate buckets, each holding a small fixed
//! number of slots tagged with an 8-bit partial key. Lookups touch at most
//! two buckets; inserts displace existing entries along a breadth-first
//! "cuckoo path" when both candidates are full. Buckets are guarded by an
//! array of striped spinlocks, so operations on disjoint stripes proceed in
//! parallel, and the table resizes online while readers and writers keep
//! running.

/// Compile-time tuning knobs and their defaults
pub mod config;
/// Crate error types
mod error;
/// Set of compiler hints
mod hint;
/// The hash map and its supporting machinery
mod map;

pub use crate::error::{CuckooError, Result};
pub use crate::map::locked::{Iter, IterMut, LockedTable};
pub use crate::map::{CuckooMap, DefaultHashBuilder};
