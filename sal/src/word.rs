// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fmt;

/// Largest number of bits a single `LineWord` can carry.
pub const MAX_LINE_BITS: usize = 192;

const LIMBS: usize = MAX_LINE_BITS / 64;

/// A group of line bits in wire order: bit 0 is the first bit on the wire.
/// This is the unit exchanged with the transceiver in both directions.  Its
/// width is whatever the transceiver's parallel interface delivers and need
/// not line up with symbol boundaries.
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct LineWord {
    limbs: [u64; LIMBS],
    len: u8,
}

impl LineWord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a word from the low `len` bits of `value`, with bit `len - 1`
    /// transmitted first.  This matches the way 8b/10b code groups are
    /// written, `abcdeifghj` from the most significant end.
    pub fn from_msb_first(value: u64, len: usize) -> Self {
        let mut word = LineWord::new();
        for i in (0..len.min(64)).rev() {
            word.push((value >> i) & 1 == 1);
        }
        word
    }

    /// Build a word from the low `len` bits of `value`, with bit 0
    /// transmitted first.
    pub fn from_lsb_first(value: u64, len: usize) -> Self {
        let mut word = LineWord::new();
        for i in 0..len.min(64) {
            word.push((value >> i) & 1 == 1);
        }
        word
    }

    pub fn from_bits(bits: impl IntoIterator<Item = bool>) -> Self {
        let mut word = LineWord::new();
        for bit in bits {
            word.push(bit);
        }
        word
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == MAX_LINE_BITS
    }

    /// Append a bit.  Bits pushed onto a full word are dropped.
    pub fn push(&mut self, bit: bool) {
        debug_assert!(!self.is_full(), "line word overflow");
        if self.is_full() {
            return;
        }
        let idx = self.len();
        if bit {
            self.limbs[idx / 64] |= 1 << (idx % 64);
        }
        self.len += 1;
    }

    pub fn bit(&self, idx: usize) -> bool {
        idx < self.len() && (self.limbs[idx / 64] >> (idx % 64)) & 1 == 1
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len()).map(move |i| self.bit(i))
    }

    /// Read `len` bits starting at `start`, first-transmitted bit in the
    /// most significant position.
    pub fn msb_first(&self, start: usize, len: usize) -> u64 {
        (start..start + len.min(64))
            .fold(0, |acc, i| (acc << 1) | self.bit(i) as u64)
    }

    /// Read `len` bits starting at `start`, first-transmitted bit in the
    /// least significant position.
    pub fn lsb_first(&self, start: usize, len: usize) -> u64 {
        (start..start + len.min(64))
            .enumerate()
            .fold(0, |acc, (n, i)| acc | (self.bit(i) as u64) << n)
    }

    /// The word with every bit inverted, as seen through a swapped
    /// differential pair.
    pub fn inverted(&self) -> Self {
        LineWord::from_bits(self.iter().map(|b| !b))
    }

    /// True if the word carries no transitions at all.
    pub fn is_constant(&self) -> bool {
        let first = self.bit(0);
        self.iter().all(|b| b == first)
    }
}

impl fmt::Debug for LineWord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bits: String =
            self.iter().map(|b| if b { '1' } else { '0' }).collect();
        write!(f, "LineWord({bits})")
    }
}
