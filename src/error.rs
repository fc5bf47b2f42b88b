//! Error type shared by every fallible operation.

use std::io;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the index.
///
/// Lookups never fail: an absent key is `None`. Structural corruption is not
/// represented here either, it is an invariant violation and panics.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O failure while opening or growing a file-backed pool.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The key decomposes into more units than a node header can address.
    #[error("key spans {units} key units, at most {max} are supported")]
    KeyTooLong { units: usize, max: usize },

    /// A byte key is a proper prefix of a stored key, or the other way around.
    /// The trie stores values only at leaves, so such keys cannot coexist.
    #[error("key is a proper prefix of a stored key, or a stored key is a proper prefix of it")]
    PrefixConflict,

    /// The pool image does not describe a tree this handle can open.
    #[error("invalid pool: {0}")]
    InvalidPool(String),

    /// Rejected configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
