//! The software reference implementation of the swap operation. The custom instruction and the
//! accelerator peripheral must produce exactly the same output for every input.

/// A 32-bit word, the input and output of every implementation of the swap operation.
pub type PermutationWord = u32;

/// Swaps the two outer bytes of `word`, and reverses the order of the 16 bits making up its two
/// middle bytes.
///
/// Bit `i + 16` of the input ends up at bit `15 - i` of the output, and bit `i + 8` of the input
/// ends up at bit `23 - i`, for `i` in `0..8`. Only fixed shifts and masks are used, so this takes
/// the same number of instructions for every input.
#[inline]
pub fn permute(word: PermutationWord) -> PermutationWord {
    let mut result = (word & 0x0000_00FF) << 24;
    result |= (word & 0xFF00_0000) >> 24;
    for i in 0..8 {
        result |= (word & (1 << (i + 16))) >> (2 * i + 1);
        result |= (word & (1 << (i + 8))) << (15 - 2 * i);
    }
    result
}
