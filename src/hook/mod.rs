//! # Hook
//!
//! This module covers hooks, which redirect execution from one location to another.
//!
//! A redirection is permanent: the entry of the source is overwritten and nothing is kept to undo
//! it. Applying a newer patch later simply overwrites the entry again.

use thiserror::Error;

use crate::code::CodeError;

pub mod jmphook;

/// Errors that could happen while installing a hook
#[derive(Debug, Error)]
pub enum HookError<E> {
    /// Source and destination are the same function; the jump would loop forever
    #[error("source and destination are both {0:#x}")]
    SameAddress(usize),
    /// The jump to the destination could not be generated; nothing was written
    #[error(transparent)]
    Code(#[from] CodeError),
    /// The underlying patcher failed
    #[error("{0}")]
    Patch(E),
}

/// Trait for hooks
///
/// # Safety
///
/// Hooks are inherently unsafe; it is up to the hook to leave `source` either untouched or fully
/// redirected.
pub unsafe trait Hook {
    /// Errors that could happen during a hook
    type Error;

    /// Redirects every future call of `source` to `destination`.
    ///
    /// # Safety
    ///
    /// - Both `source` and `destination` must be valid pointers
    /// - `destination` must be valid executable code with the same calling convention as `source`
    /// - no thread may be executing the entry of `source` while it is overwritten
    unsafe fn hook(&self, source: *const u8, destination: *const u8) -> Result<(), Self::Error>;
}
