//! Contains debug utilities for logging word buffers and batch summaries.

use bitvec::prelude::*;

/// A wrapper struct whose [core::fmt::Display] implementation prints the provided words in rows,
/// with each row containing 8 words in up to two groups of up to 4 words each, with each word
/// formatted by the provided formatting function.
struct FormatWordsInRowsAndGroups<'a, F> {
    words: &'a [u32],
    elem_formatter: F,
}
impl<'a, F, R> core::fmt::Display for FormatWordsInRowsAndGroups<'a, F>
where
    F: Fn(&'a u32) -> R,
    R: core::fmt::Display,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for (row_idx, row_values) in self.words.chunks(8).enumerate() {
            if row_idx > 0 {
                writeln!(f)?;
            }
            // The offset is printed as an element index, not a byte offset.
            let offset = row_idx * 8;
            write!(f, "{offset:05}: ")?;

            for (group_idx, group_values) in row_values.chunks(4).enumerate() {
                if group_idx > 0 {
                    write!(f, "  ")?;
                }
                for (elem_idx, elem) in group_values.iter().enumerate() {
                    if elem_idx > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", (self.elem_formatter)(elem))?;
                }
            }
        }
        Ok(())
    }
}

/// A word formatter that prints the value in hexadecimal format.
struct HexFormatter<'a>(&'a u32);
impl<'a> core::fmt::Display for HexFormatter<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Logs the given words in a human-readable format, 8 words per row, each word printed in its
/// hexadecimal representation.
pub fn log_words_hex(log_level: log::Level, words: &[u32]) {
    log::log!(
        log_level,
        "Length: {} words\n{}",
        words.len(),
        FormatWordsInRowsAndGroups {
            words,
            elem_formatter: HexFormatter
        }
    );
}

/// Prints a word's bits from most to least significant, in four space-separated groups of 8 bits
/// (byte 3 first). Handy for eyeballing where the swap moved each bit.
pub struct FormatWordBits(pub u32);
impl core::fmt::Display for FormatWordBits {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let bits = self.0.view_bits::<Lsb0>();
        for byte_idx in (0..4).rev() {
            if byte_idx < 3 {
                write!(f, " ")?;
            }
            let byte_bits = &bits[byte_idx * 8..][..8];
            for bit_idx in (0..8).rev() {
                write!(f, "{}", if byte_bits[bit_idx] { '1' } else { '0' })?;
            }
        }
        Ok(())
    }
}

/// Prints a one-line summary of a batch of words: its length, its first and last word, and a
/// CRC-32 over its little-endian byte representation. Two buffers with the same summary almost
/// certainly hold the same data, which makes the summary useful for comparing runs from logs.
pub struct FormatBatch<'a>(pub &'a [u32]);
impl<'a> core::fmt::Display for FormatBatch<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let words = self.0;
        let mut hasher = crc32fast::Hasher::new();
        for word in words {
            hasher.update(&word.to_le_bytes());
        }
        match (words.first(), words.last()) {
            (Some(first), Some(last)) => write!(
                f,
                "Batch(len: {}, first 0x{first:08X}, last 0x{last:08X}, crc 0x{:08X})",
                words.len(),
                hasher.finalize()
            ),
            _ => write!(f, "Batch(len: 0)"),
        }
    }
}
