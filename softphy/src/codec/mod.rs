// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Symbol codec.  The variant in use is fixed when the codec is reset; there
//! is no way to change encodings in the middle of a stream.

use arrayvec::ArrayVec;

use common::link::Encoding;
use sal::LineWord;

use crate::symbol::Symbol;

pub mod enc128b130b;
pub mod enc8b10b;

/// Most symbols a single line word can decode into.
pub const MAX_WORD_SYMBOLS: usize = enc128b130b::BLOCK_SYMBOLS;

pub type DecodedWord = ArrayVec<Symbol, MAX_WORD_SYMBOLS>;

#[derive(Debug)]
pub enum Encoder {
    Enc8b10b(enc8b10b::Encoder),
    Enc128b130b(enc128b130b::Encoder),
}

impl Encoder {
    pub fn new(encoding: Encoding) -> Self {
        match encoding {
            Encoding::Enc8b10b => Encoder::Enc8b10b(enc8b10b::Encoder::new()),
            Encoding::Enc128b130b => {
                Encoder::Enc128b130b(enc128b130b::Encoder::new())
            }
        }
    }

    pub fn encoding(&self) -> Encoding {
        match self {
            Encoder::Enc8b10b(_) => Encoding::Enc8b10b,
            Encoder::Enc128b130b(_) => Encoding::Enc128b130b,
        }
    }

    /// Discard all state and start over with `encoding`.
    pub fn reset(&mut self, encoding: Encoding) {
        *self = Encoder::new(encoding);
    }

    /// Encode one symbol.  The 8b/10b variant produces a word for every
    /// symbol, the block variant one word per sixteen symbols.
    pub fn encode(
        &mut self,
        sym: &Symbol,
        force_negative: bool,
    ) -> Option<LineWord> {
        match self {
            Encoder::Enc8b10b(e) => Some(LineWord::from_msb_first(
                e.encode(sym, force_negative) as u64,
                10,
            )),
            Encoder::Enc128b130b(e) => e.encode(sym),
        }
    }
}

#[derive(Debug)]
pub enum Decoder {
    Dec8b10b(enc8b10b::Decoder),
    Dec128b130b,
}

impl Decoder {
    pub fn new(encoding: Encoding) -> Self {
        match encoding {
            Encoding::Enc8b10b => Decoder::Dec8b10b(enc8b10b::Decoder::new()),
            Encoding::Enc128b130b => Decoder::Dec128b130b,
        }
    }

    pub fn encoding(&self) -> Encoding {
        match self {
            Decoder::Dec8b10b(_) => Encoding::Enc8b10b,
            Decoder::Dec128b130b => Encoding::Enc128b130b,
        }
    }

    pub fn reset(&mut self, encoding: Encoding) {
        *self = Decoder::new(encoding);
    }

    /// Decode one aligned line word.
    pub fn decode(&mut self, word: &LineWord) -> DecodedWord {
        match self {
            Decoder::Dec8b10b(d) => {
                let mut out = DecodedWord::new();
                out.push(d.decode(word.msb_first(0, 10) as u16));
                out
            }
            Decoder::Dec128b130b => enc128b130b::decode(word),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::k;
    use crate::symbol::SyncHeader;

    #[test]
    fn test_codec_variants() {
        for encoding in [Encoding::Enc8b10b, Encoding::Enc128b130b] {
            let mut enc = Encoder::new(encoding);
            let mut dec = Decoder::new(encoding);
            assert_eq!(enc.encoding(), encoding);
            assert_eq!(dec.encoding(), encoding);

            let syms: Vec<Symbol> = (0..32u8)
                .map(|i| match (encoding, i) {
                    (Encoding::Enc8b10b, 0) => Symbol::control(k::COM),
                    (Encoding::Enc128b130b, 0 | 16) => {
                        Symbol::data(i).starting(SyncHeader::Data)
                    }
                    _ => Symbol::data(i),
                })
                .collect();
            let mut out = Vec::new();
            for s in &syms {
                if let Some(w) = enc.encode(s, false) {
                    assert_eq!(w.len(), encoding.line_bits());
                    out.extend(dec.decode(&w));
                }
            }
            assert_eq!(out, syms);
        }
    }

    #[test]
    fn test_reset_switches_encoding() {
        let mut enc = Encoder::new(Encoding::Enc8b10b);
        let mut dec = Decoder::new(Encoding::Enc8b10b);
        enc.reset(Encoding::Enc128b130b);
        dec.reset(Encoding::Enc128b130b);
        assert_eq!(enc.encoding(), Encoding::Enc128b130b);
        assert_eq!(dec.encoding(), Encoding::Enc128b130b);
        assert!(enc.encode(&Symbol::data(0), false).is_none());
    }
}
