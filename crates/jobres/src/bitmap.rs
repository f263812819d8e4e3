use std::fmt::{Debug, Formatter};
use std::ops::Range;

use bitvec::prelude::*;

use crate::error::invalid_input;

/// Fixed-length set of bits packed into machine words.
///
/// Range based operations clamp the range to the bitmap length, single bit writes panic when the
/// index is out of bounds (same as slice indexing).
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Bitmap(BitVec<u64, Lsb0>);

impl Bitmap {
    pub fn new(len: usize) -> Self {
        Bitmap(bitvec![u64, Lsb0; 0; len])
    }

    pub fn from_indices(len: usize, indices: impl IntoIterator<Item = usize>) -> Self {
        let mut bitmap = Self::new(len);
        for index in indices {
            bitmap.set(index);
        }
        bitmap
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `false` for indices beyond the end.
    #[inline]
    pub fn test(&self, index: usize) -> bool {
        self.0.get(index).map(|bit| *bit).unwrap_or(false)
    }

    #[inline]
    pub fn set(&mut self, index: usize) {
        self.0.set(index, true);
    }

    #[inline]
    pub fn clear(&mut self, index: usize) {
        self.0.set(index, false);
    }

    fn clamp(&self, range: Range<usize>) -> Range<usize> {
        let end = range.end.min(self.len());
        range.start.min(end)..end
    }

    pub fn set_range(&mut self, range: Range<usize>) {
        let range = self.clamp(range);
        self.0[range].fill(true);
    }

    pub fn clear_range(&mut self, range: Range<usize>) {
        let range = self.clamp(range);
        self.0[range].fill(false);
    }

    pub fn clear_all(&mut self) {
        self.0.fill(false);
    }

    /// Number of set bits.
    #[inline]
    pub fn count(&self) -> usize {
        self.0.count_ones()
    }

    pub fn count_range(&self, range: Range<usize>) -> usize {
        let range = self.clamp(range);
        self.0[range].count_ones()
    }

    pub fn any_in_range(&self, range: Range<usize>) -> bool {
        let range = self.clamp(range);
        self.0[range].any()
    }

    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter_ones()
    }

    pub fn first_set(&self) -> Option<usize> {
        self.0.first_one()
    }

    pub fn last_set(&self) -> Option<usize> {
        self.0.last_one()
    }

    /// Fresh bitmap holding a copy of the given range.
    pub fn copy_range(&self, range: Range<usize>) -> Bitmap {
        let range = self.clamp(range);
        Bitmap(self.0[range].to_bitvec())
    }

    /// Removes the given range and shifts the tail down, shrinking the bitmap.
    pub fn remove_range(&mut self, range: Range<usize>) {
        let range = self.clamp(range);
        let tail = self.0[range.end..].to_bitvec();
        self.0.truncate(range.start);
        self.0.extend_from_bitslice(&tail);
    }

    pub fn resize(&mut self, len: usize) {
        self.0.resize(len, false);
    }

    /// Sets every bit that is set in `other`, ignoring bits of `other` beyond our length.
    pub fn or_with(&mut self, other: &Bitmap) {
        let len = self.len();
        for index in other.ones().take_while(|index| *index < len) {
            self.set(index);
        }
    }

    /// Clears every bit that is not set in `other`.
    pub fn and_with(&mut self, other: &Bitmap) {
        let to_clear: Vec<usize> = self.ones().filter(|index| !other.test(*index)).collect();
        for index in to_clear {
            self.clear(index);
        }
    }

    pub fn is_subset_of(&self, other: &Bitmap) -> bool {
        self.ones().all(|index| other.test(index))
    }

    /// Hex mask, most significant nibble first (`0x` prefix, one digit per four bits).
    pub fn fmt_hex(&self) -> String {
        let digits = self.len().div_ceil(4);
        let mut output = String::with_capacity(digits + 2);
        output.push_str("0x");
        for digit in (0..digits).rev() {
            let mut value = 0u32;
            for bit in 0..4 {
                if self.test(digit * 4 + bit) {
                    value |= 1 << bit;
                }
            }
            output.push(char::from_digit(value, 16).unwrap_or('0').to_ascii_uppercase());
        }
        output
    }

    pub fn parse_hex(len: usize, mask: &str) -> crate::Result<Bitmap> {
        let digits = mask
            .strip_prefix("0x")
            .or_else(|| mask.strip_prefix("0X"))
            .unwrap_or(mask);
        let mut bitmap = Bitmap::new(len);
        for (position, c) in digits.chars().rev().enumerate() {
            let Some(value) = c.to_digit(16) else {
                return invalid_input(format!("invalid hex digit `{c}` in bitmap mask"));
            };
            for bit in 0..4 {
                if value & (1 << bit) == 0 {
                    continue;
                }
                let index = position * 4 + bit;
                if index >= len {
                    return invalid_input(format!(
                        "bit {index} of mask `{mask}` exceeds bitmap size {len}"
                    ));
                }
                bitmap.set(index);
            }
        }
        Ok(bitmap)
    }

    /// Comma delimited list of set bits with runs collapsed, e.g. `0-3,7`.
    pub fn fmt_ranges(&self) -> String {
        let mut output = String::new();
        let mut ones = self.ones().peekable();
        while let Some(start) = ones.next() {
            let mut end = start;
            while ones.peek() == Some(&(end + 1)) {
                end += 1;
                ones.next();
            }
            if !output.is_empty() {
                output.push(',');
            }
            if start == end {
                output.push_str(&start.to_string());
            } else {
                output.push_str(&format!("{start}-{end}"));
            }
        }
        output
    }
}

impl Debug for Bitmap {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Bitmap[{}]{{{}}}", self.len(), self.fmt_ranges())
    }
}
