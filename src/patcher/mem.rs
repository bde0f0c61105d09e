//! This module contains a patcher which adjusts memory permissions to patch read-only data

use std::convert::Infallible;

use parking_lot::{Mutex, MutexGuard};
use region::Protection;
use thiserror::Error;

use super::Patcher;
use crate::code::cache::flush_icache;

/// Serialises protection windows across the process.
///
/// Unrelated functions share pages, and a window records the protection it finds on entry.
/// Two overlapping windows would otherwise record each other's temporary protection.
static WINDOW_LOCK: Mutex<()> = Mutex::new(());

/// Errors when using permission patching
#[derive(Debug, Error)]
pub enum PermissionError<E> {
    /// A page could not be queried or made writable; nothing was written
    #[error("error setting memory protections on page {page:#x}")]
    ProtectionFailed {
        /// Start of the page that failed
        page: usize,
        /// Underlying error
        #[source]
        source: region::Error,
    },
    /// The patch was written but a page could not be returned to its previous protection
    #[error("error restoring memory protections on page {page:#x}")]
    RestoreFailed {
        /// Start of the page that failed
        page: usize,
        /// Underlying error
        #[source]
        source: region::Error,
    },
    /// Custom error type from the underlying patcher
    #[error("{0}")]
    CustomError(E),
}

/// The pages covering a range, temporarily made read-write-execute.
///
/// Every page keeps the protection it had when the window was opened and gets it back when the
/// window is closed or dropped. Opening either switches every page or none of them.
pub struct ProtectionWindow {
    /// Start of each covered page and the protection it had before the window opened
    pages: Vec<(usize, Protection)>,
    /// Page size of the system
    page_size: usize,
    /// Held for as long as any page is writable
    _lock: MutexGuard<'static, ()>,
}

impl ProtectionWindow {
    /// Makes every page covering `[location, location + len)` readable, writable and executable
    pub fn open<E>(location: *const u8, len: usize) -> Result<Self, PermissionError<E>> {
        let lock = WINDOW_LOCK.lock();
        let page_size = region::page::size();
        let start = region::page::floor(location) as usize;
        let end = if len == 0 {
            start
        } else {
            region::page::ceil(location.wrapping_add(len)) as usize
        };

        // Record everything before touching anything
        let mut pages = Vec::with_capacity((end - start) / page_size);
        for page in (start..end).step_by(page_size) {
            let protection = region::query(page as *const u8)
                .map_err(|source| PermissionError::ProtectionFailed { page, source })?
                .protection();
            pages.push((page, protection));
        }

        for (i, &(page, _)) in pages.iter().enumerate() {
            // Safety: the page is mapped (queried above) and only gains permissions
            let result =
                unsafe { region::protect(page as *const u8, page_size, Protection::READ_WRITE_EXECUTE) };
            if let Err(source) = result {
                for &(page, protection) in &pages[..i] {
                    // Safety: returning the page to the protection it was found with
                    if let Err(e) = unsafe { region::protect(page as *const u8, page_size, protection) } {
                        log::error!("failed to roll back protection of page {page:#x}: {e}");
                    }
                }
                return Err(PermissionError::ProtectionFailed { page, source });
            }
        }

        log::trace!("opened protection window over {} page(s) at {start:#x}", pages.len());
        Ok(Self {
            pages,
            page_size,
            _lock: lock,
        })
    }

    /// Number of pages covered by the window
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Whether the window covers no pages
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Returns every page to the protection it had before the window opened.
    ///
    /// All pages are attempted; the first failure is reported.
    pub fn close<E>(mut self) -> Result<(), PermissionError<E>> {
        self.restore()
    }

    /// Restores and forgets the recorded pages
    fn restore<E>(&mut self) -> Result<(), PermissionError<E>> {
        let mut result = Ok(());
        for (page, protection) in self.pages.drain(..) {
            // Safety: the page was mapped when the window opened and is only being returned to its recorded state
            if let Err(source) = unsafe { region::protect(page as *const u8, self.page_size, protection) } {
                if result.is_ok() {
                    result = Err(PermissionError::RestoreFailed { page, source });
                }
            }
        }
        result
    }
}

impl Drop for ProtectionWindow {
    fn drop(&mut self) {
        if let Err(e) = self.restore::<Infallible>() {
            log::error!("{e}");
        }
    }
}

/// This struct wraps patchers to allow them to write to memory that's normally unwritable.
/// It achieves this result by changing the memory permissions of the target memory, triggering the patch, and then reverting the permissions.
///
/// # Safety
///
/// `PermissionWrapper` relies on the size of the patch value to determine how many pages to change write permissions,
/// pairing `PermissionWrapper` with a patcher that writes more memory than the size of the patch is undefined behavior.
///
/// As always, casting a `&T` or `&mut T` to a `*mut u8` for use with `PermissionWrapper` can result in  undefined behavior because rust assumes `&T` will never change and `&mut T` will only be changed via that reference.
/// The `*mut u8` **MUST** be memory not tracked by Rust, or ensured that reading from and writing to data tracked by Rust will not trigger undefined behavior.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissionWrapper<P: Patcher> {
    /// Underlying patcher.
    patcher: P,
}
impl<P: Patcher> PermissionWrapper<P> {
    /// Creates a new PermissionWrapper
    pub fn new(patcher: P) -> Self {
        Self { patcher }
    }
}

/// Converts a const pointer to a mutable pointer to be passed into our [`Patcher::patch`] implementation.
///
/// # Safety
///
/// **THIS FUNCTION DOES NOT CHANGE MEMORY PERMISSIONS.**
///
/// It is **NOT** safe to treat the returned value as mutable, as this function does not change memory permissions.
///
/// This function should **ONLY** be called in conjunction with our [`Patcher::patch`] implementation, which properly changes the memory permissions.
pub unsafe fn to_mut<T>(ptr: *const T) -> *mut T {
    ptr as _
}

unsafe impl<P: Patcher> Patcher for PermissionWrapper<P> {
    type Error = PermissionError<P::Error>;

    unsafe fn patch(&self, location: *mut u8, patch: &[u8]) -> Result<(), Self::Error> {
        let window = ProtectionWindow::open(location, patch.len())?;
        let written = self
            .patcher
            .patch(location, patch)
            .map_err(PermissionError::CustomError);
        window.close()?;
        flush_icache(location, patch.len());
        written
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::slice;

    use region::Protection;

    use crate::patcher::byte::BytePatcher;
    use crate::patcher::mem::{to_mut, PermissionError, PermissionWrapper, ProtectionWindow, WINDOW_LOCK};
    use crate::patcher::Patcher;

    /// Protection of every page in the range
    fn protections(ptr: *const u8, size: usize) -> Vec<Protection> {
        region::query_range(ptr, size)
            .unwrap()
            .map(|region| region.unwrap().protection())
            .collect()
    }

    #[test]
    /// An open window holds the process-wide lock, and windows over the same page run back to back
    fn test_window_lock() {
        let map = region::alloc(region::page::size(), Protection::READ_EXECUTE).unwrap();
        let ptr = map.as_ptr::<u8>();

        let window = ProtectionWindow::open::<Infallible>(ptr, 1).unwrap();
        assert!(WINDOW_LOCK.try_lock().is_none());
        window.close::<Infallible>().unwrap();

        let window = ProtectionWindow::open::<Infallible>(ptr, 1).unwrap();
        assert_eq!(protections(ptr, 1), [Protection::READ_WRITE_EXECUTE]);
        window.close::<Infallible>().unwrap();
        assert_eq!(protections(ptr, 1), [Protection::READ_EXECUTE]);
    }

    #[test]
    /// Test patch functionality on already writable memory
    fn test_patch() {
        let mut data = vec![1u8, 2, 3, 4];
        let ptr = data.as_mut_ptr();
        let before = protections(ptr, data.len());

        let wrapper = PermissionWrapper::new(BytePatcher::new());
        unsafe { wrapper.patch(ptr, &[4, 3, 2, 1]).unwrap() };

        assert_eq!(protections(ptr, data.len()), before);
        assert_eq!(data, [4, 3, 2, 1]);
    }

    #[test]
    /// Tests to ensure permissions are actually set, and then restored
    fn test_perms() {
        let page_size = region::page::size();
        let mut alloc = region::alloc(page_size, Protection::READ_EXECUTE).unwrap();
        let ptr = alloc.as_mut_ptr::<u8>() as *const u8;

        // sanity check
        assert_eq!(protections(ptr, 4), [Protection::READ_EXECUTE]);

        let wrapper = PermissionWrapper::new(BytePatcher::new());
        unsafe { wrapper.patch(to_mut(ptr), &[4, 3, 2, 1]).unwrap() };

        // make sure the data was actually changed
        assert_eq!(unsafe { slice::from_raw_parts(ptr, 4) }, [4, 3, 2, 1]);

        // make sure permissions reverted correctly after the patch
        assert_eq!(protections(ptr, 4), [Protection::READ_EXECUTE]);
    }

    #[test]
    /// A patch straddling two pages restores each page to its own protection
    fn test_spanning_pages() {
        let page_size = region::page::size();
        let mut alloc = region::alloc(page_size * 2, Protection::READ_EXECUTE).unwrap();
        let base = alloc.as_mut_ptr::<u8>();
        unsafe { region::protect(base.add(page_size), page_size, Protection::READ).unwrap() };

        let ptr = unsafe { base.add(page_size - 3) };
        let wrapper = PermissionWrapper::new(BytePatcher::new());
        unsafe { wrapper.patch(ptr, &[9, 8, 7, 6, 5, 4]).unwrap() };

        assert_eq!(unsafe { slice::from_raw_parts(ptr, 6) }, [9, 8, 7, 6, 5, 4]);
        assert_eq!(
            protections(base, page_size * 2),
            [Protection::READ_EXECUTE, Protection::READ]
        );
    }

    #[test]
    #[cfg(unix)]
    /// If any covered page cannot be made writable, no byte of the range changes
    fn test_unmapped_page() {
        unsafe {
            let page_size = region::page::size();
            let base = libc::mmap(
                std::ptr::null_mut(),
                page_size * 2,
                libc::PROT_READ | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(base, libc::MAP_FAILED);
            let base = base as *mut u8;
            assert_eq!(libc::munmap(base.add(page_size) as *mut _, page_size), 0);

            let ptr = base.add(page_size - 4);
            let wrapper = PermissionWrapper::new(BytePatcher::new());
            let result = wrapper.patch(ptr, &[0xcc; 8]);
            assert!(matches!(result, Err(PermissionError::ProtectionFailed { .. })));

            assert_eq!(slice::from_raw_parts(ptr, 4), [0, 0, 0, 0]);
            assert_eq!(protections(base, page_size), [Protection::READ_EXECUTE]);

            libc::munmap(base as *mut _, page_size);
        }
    }

    #[test]
    /// Dropping a window without closing it still restores protections
    fn test_window_drop() {
        let page_size = region::page::size();
        let alloc = region::alloc(page_size, Protection::READ).unwrap();
        let ptr = alloc.as_ptr::<u8>();

        {
            let window = ProtectionWindow::open::<Infallible>(ptr, 1).unwrap();
            assert_eq!(window.len(), 1);
            assert_eq!(protections(ptr, 1), [Protection::READ_WRITE_EXECUTE]);
        }

        assert_eq!(protections(ptr, 1), [Protection::READ]);
    }
}
