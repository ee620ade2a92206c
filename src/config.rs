//! Compile-time parameters of the table, with the defaults the rest of the
//! crate is tuned for. Changing a value here changes every table built by
//! this crate; per-table knobs (minimum load factor, maximum hashpower)
//! live on [`CuckooMap`](crate::CuckooMap) instead.

/// Number of key-value slots per bucket. Lookups scan at most
/// `2 * SLOT_PER_BUCKET` slots, so this should stay small; 4 gives good
/// space utilization before displacement kicks in, 8 trades a little scan
/// cost for fewer cuckoo moves.
pub const SLOT_PER_BUCKET: usize = 4;

/// Number of slots an argument-less constructed table reserves.
pub const DEFAULT_SIZE: usize = (1 << 16) * SLOT_PER_BUCKET;

/// Default minimum load factor an automatic expansion tolerates. When an
/// insert fails to find a cuckoo path while the table is emptier than this,
/// the expansion is rejected with
/// [`CuckooError::LoadFactorTooLow`](crate::CuckooError::LoadFactorTooLow)
/// instead of doubling a table that a pathological hash function would
/// never fill.
pub const DEFAULT_MINIMUM_LOAD_FACTOR: f64 = 0.05;

/// Sentinel meaning "no limit" for the maximum hashpower.
pub const NO_MAXIMUM_HASHPOWER: usize = usize::MAX;

/// log2 of the stripe count. Bucket `b` is guarded by stripe
/// `b % 2^LOCK_ARRAY_POWER`; the modulus is fixed for the lifetime of a
/// table so that stripe identities survive resizing.
pub const LOCK_ARRAY_POWER: usize = 16;

/// log2 of the number of spinlocks in one lazily-allocated lock segment.
pub const LOCK_SEGMENT_POWER: usize = 8;
