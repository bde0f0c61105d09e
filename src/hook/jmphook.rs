//! # Jump Hook
//!
//! This hook type uses an absolute `jmp` through a scratch register to redirect execution

use std::marker::PhantomData;

use crate::{
    code::{Architecture, Host},
    patcher::Patcher,
};

use super::{Hook, HookError};

/// Simple jmp hook for the architecture `A`
pub struct JmpHook<P, A = Host> {
    /// Underlying patcher to be used to hook
    patcher: P,
    /// Instruction set the trampoline is generated for
    _arch: PhantomData<A>,
}
impl<P: Patcher, A: Architecture> JmpHook<P, A> {
    /// Creates a new jmp hook
    pub fn new(patcher: P) -> Self {
        Self {
            patcher,
            _arch: PhantomData,
        }
    }

    /// The underlying patcher
    pub fn patcher(&self) -> &P {
        &self.patcher
    }
}
unsafe impl<P: Patcher, A: Architecture> Hook for JmpHook<P, A> {
    type Error = HookError<P::Error>;

    unsafe fn hook(&self, source: *const u8, destination: *const u8) -> Result<(), Self::Error> {
        if source == destination {
            return Err(HookError::SameAddress(source as usize));
        }

        // generate before touching the source, so a bad target leaves it intact
        let patch = A::jmp_abs(destination as u64)?;
        self.patcher
            .patch(source as *mut u8, &patch)
            .map_err(HookError::Patch)
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use parking_lot::Mutex;

    use super::JmpHook;
    use crate::code::{Architecture, CodeError, X64, X86};
    use crate::hook::{Hook, HookError};
    use crate::patcher::Patcher;

    /// Records writes instead of performing them
    #[derive(Default)]
    struct Recorder {
        /// Every write, in order
        writes: Mutex<Vec<(usize, Vec<u8>)>>,
    }

    unsafe impl Patcher for Recorder {
        type Error = Infallible;

        unsafe fn patch(&self, target: *mut u8, patch: &[u8]) -> Result<(), Self::Error> {
            self.writes.lock().push((target as usize, patch.to_vec()));
            Ok(())
        }
    }

    #[test]
    /// The trampoline written over the source jumps to the destination
    fn test_hook_writes_trampoline() {
        let hook = JmpHook::<_, X64>::new(Recorder::default());
        unsafe { hook.hook(0x1000 as *const u8, 0xdead_beef_0000 as *const u8).unwrap() };

        let writes = hook.patcher().writes.lock();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, 0x1000);
        assert_eq!(X64::decode_jmp_abs(&writes[0].1).unwrap(), 0xdead_beef_0000);
    }

    #[test]
    fn test_same_address() {
        let hook = JmpHook::<_, X64>::new(Recorder::default());
        let result = unsafe { hook.hook(0x1000 as *const u8, 0x1000 as *const u8) };
        assert!(matches!(result, Err(HookError::SameAddress(0x1000))));
        assert!(hook.patcher().writes.lock().is_empty());
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    /// A target that x86 cannot reach is rejected before anything is written
    fn test_out_of_range() {
        let hook = JmpHook::<_, X86>::new(Recorder::default());
        let result = unsafe { hook.hook(0x1000 as *const u8, 0x1_0000_0000usize as *const u8) };
        assert!(matches!(
            result,
            Err(HookError::Code(CodeError::AddressOutOfRange { bits: 32, .. }))
        ));
        assert!(hook.patcher().writes.lock().is_empty());
    }
}
