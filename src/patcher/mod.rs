//! # Patcher
//!
//! This module covers patchers, which are used to overwrite locations in memory.
//!
//! Redirects are permanent, so patchers do not keep the bytes they replace. [`install`] is the
//! composition the rest of the crate uses for live code: a [`byte::BytePatcher`] inside a
//! [`mem::PermissionWrapper`].

use std::convert::Infallible;

pub mod byte;
pub mod mem;

use self::byte::BytePatcher;
use self::mem::{PermissionError, PermissionWrapper};

/// Writes a byte sequence to a location in memory
///
/// # Safety
///
/// Patchers are inherently unsafe. The implementor must ensure that the implementation of `patch` works correctly and is properly documented for avoiding undefined behavior
pub unsafe trait Patcher {
    /// Error type that can occur when patching. If patching always succeeds, use [`Infallible`].
    type Error;

    /// Patches a given location.
    ///
    /// # Safety
    ///
    /// This function is intended to be used on arbitrary memory addresses, but must be valid for the supplied patcher
    unsafe fn patch(&self, target: *mut u8, patch: &[u8]) -> Result<(), Self::Error>;
}

/// Overwrites live code at `address` with `bytes`.
///
/// The pages covering the range are made writable, written, restored to the protection they had
/// before, and the instruction cache is synchronised. If any page cannot be made writable,
/// nothing is written.
///
/// # Safety
///
/// - `address` must point to `bytes.len()` bytes of mapped memory
/// - no thread may be executing the overwritten instructions while they are written
pub unsafe fn install(address: usize, bytes: &[u8]) -> Result<(), PermissionError<Infallible>> {
    PermissionWrapper::new(BytePatcher::new()).patch(address as *mut u8, bytes)
}

#[cfg(test)]
mod tests {
    use std::slice;

    use region::Protection;

    use super::install;

    #[test]
    /// Read-only code pages are written and keep their protection
    fn test_install() {
        let mut alloc = region::alloc(region::page::size(), Protection::READ_EXECUTE).unwrap();
        let address = alloc.as_mut_ptr::<u8>() as usize + 16;

        unsafe { install(address, &[0xc3; 13]).unwrap() };

        assert_eq!(unsafe { slice::from_raw_parts(address as *const u8, 14) }, [
            0xc3, 0xc3, 0xc3, 0xc3, 0xc3, 0xc3, 0xc3, 0xc3, 0xc3, 0xc3, 0xc3, 0xc3, 0xc3, 0
        ]);
        assert_eq!(
            region::query(address as *const u8).unwrap().protection(),
            Protection::READ_EXECUTE
        );
    }
}
