//! # Code
//!
//! This module generates the machine code written over a redirected function.
//!
//! Every supported instruction set gets its own [`Architecture`] implementation. The generated
//! jump loads the absolute target into a scratch register and branches through it, so it needs
//! no memory that the caller has to keep alive and no knowledge of the length of the function it
//! overwrites beyond [`Architecture::TRAMPOLINE_LEN`].

use thiserror::Error;

pub mod arm64;
pub mod cache;
pub mod x64;
pub mod x86;

pub use arm64::Arm64;
pub use x64::X64;
pub use x86::X86;

/// Errors while generating or inspecting trampolines
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodeError {
    /// The target does not fit into the address space of the architecture
    #[error("target {target:#x} does not fit into a {bits}-bit address space")]
    AddressOutOfRange {
        /// Requested jump target
        target: u64,
        /// Address width of the architecture
        bits: u32,
    },
    /// The bytes are not a trampoline generated for this architecture
    #[error("malformed {arch} trampoline: {reason}")]
    Malformed {
        /// Name of the architecture that was decoding
        arch: &'static str,
        /// What did not match
        reason: String,
    },
}

/// An instruction set that redirected functions can be written for
pub trait Architecture {
    /// Human readable name, used in diagnostics
    const NAME: &'static str;
    /// Address width in bits
    const BITS: u32;
    /// Number of bytes [`Architecture::jmp_abs`] produces.
    ///
    /// Every redirected function must be at least this long.
    const TRAMPOLINE_LEN: usize;

    /// Generates an absolute jump to `target`
    fn jmp_abs(target: u64) -> Result<Vec<u8>, CodeError>;

    /// Recovers the target of a jump generated by [`Architecture::jmp_abs`]
    fn decode_jmp_abs(code: &[u8]) -> Result<u64, CodeError>;
}

#[cfg(target_arch = "x86_64")]
/// Architecture the crate was compiled for
pub type Host = X64;
#[cfg(target_arch = "x86")]
/// Architecture the crate was compiled for
pub type Host = X86;
#[cfg(target_arch = "aarch64")]
/// Architecture the crate was compiled for
pub type Host = Arm64;

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
compile_error!("livepatch only supports x86, x86_64 and aarch64 targets");

/// Builds a [`CodeError::Malformed`] for `A`
pub(crate) fn malformed<A: Architecture>(reason: impl Into<String>) -> CodeError {
    CodeError::Malformed {
        arch: A::NAME,
        reason: reason.into(),
    }
}

/// Fails with [`CodeError::Malformed`] unless `code` is exactly one trampoline long
pub(crate) fn check_len<A: Architecture>(code: &[u8]) -> Result<(), CodeError> {
    if code.len() != A::TRAMPOLINE_LEN {
        return Err(malformed::<A>(format!(
            "expected {} bytes, got {}",
            A::TRAMPOLINE_LEN,
            code.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Architecture, Arm64, Host, X64, X86};

    /// Deterministic spread of addresses: edges, every single bit, and an LCG walk
    pub(crate) fn sample_addresses(bits: u32) -> Vec<u64> {
        let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
        let mut out = vec![0, 1, mask, mask - 1, 0x1000, 0x7fff_ffff & mask];
        out.extend((0..bits).map(|b| 1u64 << b));
        let mut x = 0x2545_f491_4f6c_dd1du64;
        for _ in 0..256 {
            x = x
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            out.push(x & mask);
        }
        out
    }

    /// `decode(jmp_abs(x)) == x` for every architecture
    fn round_trip<A: Architecture>() {
        for target in sample_addresses(A::BITS) {
            let code = A::jmp_abs(target).unwrap();
            assert_eq!(code.len(), A::TRAMPOLINE_LEN);
            assert_eq!(A::decode_jmp_abs(&code).unwrap(), target, "{} {target:#x}", A::NAME);
        }
    }

    #[test]
    fn test_round_trip_x64() {
        round_trip::<X64>();
    }

    #[test]
    fn test_round_trip_x86() {
        round_trip::<X86>();
    }

    #[test]
    fn test_round_trip_arm64() {
        round_trip::<Arm64>();
    }

    #[test]
    /// The host trampoline must fit the size the rest of the crate budgets for
    fn test_host_len() {
        assert!((7..=16).contains(&Host::TRAMPOLINE_LEN));
    }

    #[test]
    /// Truncated or foreign code is rejected rather than misread
    fn test_decode_rejects_wrong_length() {
        let code = X64::jmp_abs(0x1234).unwrap();
        assert!(X64::decode_jmp_abs(&code[..code.len() - 1]).is_err());
        assert!(X86::decode_jmp_abs(&code).is_err());
        assert!(Arm64::decode_jmp_abs(&[0u8; 16]).is_err());
    }
}
