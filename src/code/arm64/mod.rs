//! AArch64 trampolines
//!
//! ```text
//!   58000050    ldr x16, #8
//!   d61f0200    br  x16
//!   <target>    .quad target
//! ```
//!
//! `x16` is IP0, the intra-procedure-call scratch register the AAPCS64 reserves for veneers like
//! this one.

use super::{check_len, malformed, Architecture, CodeError};

/// `ldr x16, #8`
const LDR_X16_LITERAL: u32 = 0x5800_0050;
/// `br x16`
const BR_X16: u32 = 0xd61f_0200;

/// 64-bit ARM
pub struct Arm64;

/// Generates an absolute jump to a specified address and returns bytecode
pub fn jmp_abs(target: u64) -> [u8; Arm64::TRAMPOLINE_LEN] {
    let mut code = [0u8; Arm64::TRAMPOLINE_LEN];
    code[..4].copy_from_slice(&LDR_X16_LITERAL.to_le_bytes());
    code[4..8].copy_from_slice(&BR_X16.to_le_bytes());
    code[8..].copy_from_slice(&target.to_le_bytes());
    code
}

/// Reads the little-endian instruction word at `offset`
fn word(code: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&code[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

impl Architecture for Arm64 {
    const NAME: &'static str = "aarch64";
    const BITS: u32 = 64;
    const TRAMPOLINE_LEN: usize = 16;

    fn jmp_abs(target: u64) -> Result<Vec<u8>, CodeError> {
        Ok(jmp_abs(target).to_vec())
    }

    fn decode_jmp_abs(code: &[u8]) -> Result<u64, CodeError> {
        check_len::<Self>(code)?;
        let ldr = word(code, 0);
        if ldr != LDR_X16_LITERAL {
            return Err(malformed::<Self>(format!(
                "expected `ldr x16, #8`, got {ldr:#010x}"
            )));
        }
        let br = word(code, 4);
        if br != BR_X16 {
            return Err(malformed::<Self>(format!("expected `br x16`, got {br:#010x}")));
        }

        let mut target = [0u8; 8];
        target.copy_from_slice(&code[8..]);
        Ok(u64::from_le_bytes(target))
    }
}

#[cfg(test)]
mod tests {
    use super::jmp_abs;

    #[test]
    fn test_encoding() {
        assert_eq!(
            jmp_abs(0x0000_ffff_8000_1234),
            [
                0x50, 0x00, 0x00, 0x58, 0x00, 0x02, 0x1f, 0xd6, 0x34, 0x12, 0x00, 0x80, 0xff,
                0xff, 0x00, 0x00
            ]
        );
    }
}
