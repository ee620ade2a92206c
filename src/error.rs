use thiserror::Error;

/// Errors surfaced by table operations.
///
/// Expected outcomes (a key that is absent, a duplicate on insert) are not
/// errors; they are reported through `bool` and `Option` return values.
/// Only conditions that need operator attention end up here.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CuckooError {
    /// An automatic expansion was triggered while the load factor was below
    /// the configured minimum, which usually means the hash function is
    /// collapsing keys onto a handful of buckets. Carries the load factor
    /// observed when the expansion was rejected.
    #[error("automatic expansion triggered at load factor {0}, below the configured minimum")]
    LoadFactorTooLow(f64),
    /// An expansion would have grown the table past the configured maximum
    /// hashpower. Carries the hashpower the expansion asked for.
    #[error("expansion to hashpower {0} exceeds the configured maximum")]
    MaximumHashpowerExceeded(usize),
    /// A configuration setter was handed an out-of-range value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, CuckooError>;
