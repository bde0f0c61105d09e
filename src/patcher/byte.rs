//! This module contains a byte patcher

use std::convert::Infallible;
use std::ptr;

use super::Patcher;

/// Patcher for patching memory locations with byte arrays.
/// This patcher never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytePatcher;
impl BytePatcher {
    /// Creates a new [`BytePatcher`]
    pub fn new() -> Self {
        Self
    }
}
unsafe impl Patcher for BytePatcher {
    type Error = Infallible;

    unsafe fn patch(&self, location: *mut u8, patch: &[u8]) -> Result<(), Self::Error> {
        // Safety: caller must ensure that `location` is valid and writable for the full length of the patch
        ptr::copy_nonoverlapping(patch.as_ptr(), location, patch.len());
        Ok(())
    }
}
