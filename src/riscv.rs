//! The [Cpu] backend for RISC-V soft cores that implement the swap as an R-type instruction in the
//! `custom-0` opcode space.

use crate::bench::Cpu;
use core::arch::asm;

/// The `custom-0` major opcode the swap instruction is decoded from.
pub const CUSTOM_0_OPCODE: u32 = 0x0B;

/// A soft core with the swap instruction at `custom-0`, `funct3 = 0`, `funct7 = 0`, taking its input
/// in `rs1` and ignoring `rs2`.
#[derive(Debug, Default)]
pub struct SoftCore;

impl Cpu for SoftCore {
    #[inline(always)]
    fn custom_swap(&self, word: u32) -> u32 {
        let result: u32;
        // SAFETY: the instruction only reads `rs1` and writes `rd`.
        unsafe {
            asm!(
                ".insn r {opcode}, 0, 0, {rd}, {rs1}, zero",
                opcode = const CUSTOM_0_OPCODE,
                rd = lateout(reg) result,
                rs1 = in(reg) word,
                options(pure, nomem, nostack),
            );
        }
        result
    }

    fn flush_data_cache(&self) {
        // The core has no data cache that's incoherent with the bus, but its loads and stores must
        // still be ordered against the accelerator's writes.
        // SAFETY: a fence has no effect other than ordering memory accesses.
        unsafe { asm!("fence rw, rw", options(nostack)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_0_is_a_32_bit_major_opcode() {
        // Bits 1:0 are 0b11 for 32-bit instructions, bits 6:2 are 0b00010 for custom-0.
        assert_eq!(CUSTOM_0_OPCODE, 0b000_1011);
    }

    #[test]
    fn custom_instruction_matches_permute() {
        let core = SoftCore;
        for word in [0u32, u32::MAX, 0x11F0_A0FF, 0x8000_0001] {
            assert_eq!(core.custom_swap(word), crate::permute(word), "0x{word:08X}");
        }
    }
}
