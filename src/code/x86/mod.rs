//! 32-bit x86 trampolines

use iced_x86::{Code, Decoder, DecoderOptions, OpKind, Register};

use super::{check_len, malformed, Architecture, CodeError};

/// `mov eax, imm32`
const MOV_EAX: u8 = 0xb8;
/// `jmp eax`
const JMP_EAX: [u8; 2] = [0xff, 0xe0];

/// 32-bit x86. `eax` is a scratch register that none of the common conventions pass arguments in.
pub struct X86;

/// Generates an absolute jump to a specified address and returns bytecode
pub fn jmp_abs(target: u32) -> [u8; X86::TRAMPOLINE_LEN] {
    let mut code = [0u8; X86::TRAMPOLINE_LEN];
    code[0] = MOV_EAX;
    code[1..5].copy_from_slice(&target.to_le_bytes());
    code[5..].copy_from_slice(&JMP_EAX);
    code
}

impl Architecture for X86 {
    const NAME: &'static str = "x86";
    const BITS: u32 = 32;
    const TRAMPOLINE_LEN: usize = 1 + 4 + JMP_EAX.len();

    fn jmp_abs(target: u64) -> Result<Vec<u8>, CodeError> {
        let target = u32::try_from(target).map_err(|_| CodeError::AddressOutOfRange {
            target,
            bits: Self::BITS,
        })?;
        Ok(jmp_abs(target).to_vec())
    }

    fn decode_jmp_abs(code: &[u8]) -> Result<u64, CodeError> {
        check_len::<Self>(code)?;
        let mut decoder = Decoder::with_ip(32, code, 0, DecoderOptions::NONE);

        let mov = decoder.decode();
        if mov.code() != Code::Mov_r32_imm32 || mov.op0_register() != Register::EAX {
            return Err(malformed::<Self>(format!("expected `mov eax, imm32`, got `{mov}`")));
        }
        let jmp = decoder.decode();
        if jmp.code() != Code::Jmp_rm32
            || jmp.op0_kind() != OpKind::Register
            || jmp.op0_register() != Register::EAX
        {
            return Err(malformed::<Self>(format!("expected `jmp eax`, got `{jmp}`")));
        }
        if decoder.position() != code.len() {
            return Err(malformed::<Self>("trailing bytes after `jmp eax`"));
        }

        Ok(u64::from(mov.immediate32()))
    }
}
