//! x86_64 trampolines

use iced_x86::{Code, Decoder, DecoderOptions, OpKind, Register};

use super::{check_len, malformed, Architecture, CodeError};

/// `movabs r11, imm64`
const MOV_R11: [u8; 2] = [0x49, 0xbb];
/// `jmp r11`
const JMP_R11: [u8; 3] = [0x41, 0xff, 0xe3];

/// 64-bit x86.
///
/// `r11` is volatile and never carries arguments under either the System V or the Microsoft
/// calling convention, so overwriting it on entry leaves the call intact.
pub struct X64;

/// Generates an absolute jump to a specified address and returns bytecode
pub fn jmp_abs(target: u64) -> [u8; X64::TRAMPOLINE_LEN] {
    let mut code = [0u8; X64::TRAMPOLINE_LEN];
    code[..2].copy_from_slice(&MOV_R11);
    code[2..10].copy_from_slice(&target.to_le_bytes());
    code[10..].copy_from_slice(&JMP_R11);
    code
}

impl Architecture for X64 {
    const NAME: &'static str = "x86_64";
    const BITS: u32 = 64;
    const TRAMPOLINE_LEN: usize = MOV_R11.len() + 8 + JMP_R11.len();

    fn jmp_abs(target: u64) -> Result<Vec<u8>, CodeError> {
        Ok(jmp_abs(target).to_vec())
    }

    fn decode_jmp_abs(code: &[u8]) -> Result<u64, CodeError> {
        check_len::<Self>(code)?;
        let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);

        let mov = decoder.decode();
        if mov.code() != Code::Mov_r64_imm64 || mov.op0_register() != Register::R11 {
            return Err(malformed::<Self>(format!("expected `mov r11, imm64`, got `{mov}`")));
        }
        let jmp = decoder.decode();
        if jmp.code() != Code::Jmp_rm64
            || jmp.op0_kind() != OpKind::Register
            || jmp.op0_register() != Register::R11
        {
            return Err(malformed::<Self>(format!("expected `jmp r11`, got `{jmp}`")));
        }
        if decoder.position() != code.len() {
            return Err(malformed::<Self>("trailing bytes after `jmp r11`"));
        }

        Ok(mov.immediate64())
    }
}
