// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! 128b/130b block code: a two-bit sync header followed by sixteen bytes,
//! each byte transmitted least significant bit first.

use arrayvec::ArrayVec;

use sal::LineWord;

use crate::symbol::Symbol;
use crate::symbol::SymbolError;
use crate::symbol::SyncHeader;

pub const BLOCK_SYMBOLS: usize = 16;
pub const BLOCK_BITS: usize = 2 + 8 * BLOCK_SYMBOLS;

/// Read the sync header at `start` in `word`.
pub fn sync_header(word: &LineWord, start: usize) -> Option<SyncHeader> {
    SyncHeader::from_bits([word.bit(start), word.bit(start + 1)])
}

/// The first payload byte of the block at `start` in `word`.
pub fn first_byte(word: &LineWord, start: usize) -> u8 {
    word.lsb_first(start + 2, 8) as u8
}

/// Collects sixteen symbols at a time into a block.  The header of a block
/// is taken from its first symbol; a symbol that starts a new block while
/// one is partially collected abandons the partial block.
#[derive(Debug, Default)]
pub struct Encoder {
    header: Option<SyncHeader>,
    payload: ArrayVec<u8, BLOCK_SYMBOLS>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a block is partially collected.
    pub fn in_block(&self) -> bool {
        !self.payload.is_empty()
    }

    pub fn encode(&mut self, sym: &Symbol) -> Option<LineWord> {
        if sym.block.is_some() && self.in_block() {
            self.payload.clear();
        }
        if self.payload.is_empty() {
            self.header = Some(sym.block.unwrap_or(SyncHeader::Data));
        }
        self.payload.push(sym.value);
        if !self.payload.is_full() {
            return None;
        }

        let header = self.header.take().unwrap_or(SyncHeader::Data);
        let mut word = LineWord::new();
        for bit in header.bits() {
            word.push(bit);
        }
        for byte in self.payload.drain(..) {
            for i in 0..8 {
                word.push((byte >> i) & 1 == 1);
            }
        }
        Some(word)
    }
}

/// Split one aligned block into symbols.  Ordered-set payload is tagged as
/// control and data-block payload as data; every symbol of a block with an
/// invalid header is tagged as an error.
pub fn decode(word: &LineWord) -> ArrayVec<Symbol, BLOCK_SYMBOLS> {
    let header = sync_header(word, 0);
    (0..BLOCK_SYMBOLS)
        .map(|i| {
            let value = word.lsb_first(2 + 8 * i, 8) as u8;
            let sym = match header {
                Some(SyncHeader::Data) => Symbol::data(value),
                Some(SyncHeader::OrderedSet) => Symbol::control(value),
                None => Symbol::error(SymbolError::SyncHeader),
            };
            match (i, header) {
                (0, Some(h)) => sym.starting(h),
                _ => sym,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::os;

    fn block(header: SyncHeader, bytes: &[u8]) -> Vec<Symbol> {
        bytes
            .iter()
            .enumerate()
            .map(|(i, b)| {
                let sym = match header {
                    SyncHeader::Data => Symbol::data(*b),
                    SyncHeader::OrderedSet => Symbol::control(*b),
                };
                if i == 0 {
                    sym.starting(header)
                } else {
                    sym
                }
            })
            .collect()
    }

    #[test]
    fn test_block_layout() {
        let mut enc = Encoder::new();
        let mut bytes = vec![0u8; 16];
        bytes[0] = os::TS1;
        let syms = block(SyncHeader::OrderedSet, &bytes);
        let words: Vec<LineWord> =
            syms.iter().filter_map(|s| enc.encode(s)).collect();
        assert_eq!(words.len(), 1);
        let w = words[0];
        assert_eq!(w.len(), BLOCK_BITS);
        assert_eq!(sync_header(&w, 0), Some(SyncHeader::OrderedSet));
        assert_eq!(first_byte(&w, 0), os::TS1);
        // 0x1e, least significant bit first
        assert_eq!(w.msb_first(2, 8), 0b0111_1000);
        assert_eq!(decode(&w).to_vec(), syms);
    }

    #[test]
    fn test_bad_header() {
        let mut w = LineWord::new();
        for _ in 0..BLOCK_BITS {
            w.push(false);
        }
        let syms = decode(&w);
        assert_eq!(syms.len(), BLOCK_SYMBOLS);
        assert!(syms
            .iter()
            .all(|s| s.error_kind() == Some(SymbolError::SyncHeader)));
    }

    #[test]
    fn test_partial_block_abandoned() {
        let mut enc = Encoder::new();
        let data: Vec<u8> = (0..16).collect();
        for s in block(SyncHeader::Data, &data[..5]) {
            assert!(enc.encode(&s).is_none());
        }
        assert!(enc.in_block());
        let syms = block(SyncHeader::Data, &data);
        let words: Vec<LineWord> =
            syms.iter().filter_map(|s| enc.encode(s)).collect();
        assert_eq!(words.len(), 1);
        assert_eq!(decode(&words[0]).to_vec(), syms);
    }
}
