// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! 8b/10b line code.  A code group is held in a `u16` as `abcdeifghj`, with
//! `a` in bit 9 and transmitted first.

use lazy_static::lazy_static;

use crate::symbol::k;
use crate::symbol::Symbol;
use crate::symbol::SymbolError;
use crate::symbol::SymbolKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disparity {
    Negative,
    Positive,
}

// 5b/6b sub-blocks, (RD-, RD+)
const D6: [(u8, u8); 32] = [
    (0b100111, 0b011000),
    (0b011101, 0b100010),
    (0b101101, 0b010010),
    (0b110001, 0b110001),
    (0b110101, 0b001010),
    (0b101001, 0b101001),
    (0b011001, 0b011001),
    (0b111000, 0b000111),
    (0b111001, 0b000110),
    (0b100101, 0b100101),
    (0b010101, 0b010101),
    (0b110100, 0b110100),
    (0b001101, 0b001101),
    (0b101100, 0b101100),
    (0b011100, 0b011100),
    (0b010111, 0b101000),
    (0b011011, 0b100100),
    (0b100011, 0b100011),
    (0b010011, 0b010011),
    (0b110010, 0b110010),
    (0b001011, 0b001011),
    (0b101010, 0b101010),
    (0b011010, 0b011010),
    (0b111010, 0b000101),
    (0b110011, 0b001100),
    (0b100110, 0b100110),
    (0b010110, 0b010110),
    (0b110110, 0b001001),
    (0b001110, 0b001110),
    (0b101110, 0b010001),
    (0b011110, 0b100001),
    (0b101011, 0b010100),
];

const K28_6: (u8, u8) = (0b001111, 0b110000);

// 3b/4b data sub-blocks, indexed by the disparity after the 6b sub-block
const D4: [(u8, u8); 8] = [
    (0b1011, 0b0100),
    (0b1001, 0b1001),
    (0b0101, 0b0101),
    (0b1100, 0b0011),
    (0b1101, 0b0010),
    (0b1010, 0b1010),
    (0b0110, 0b0110),
    (0b1110, 0b0001),
];

// D.x.A7, used where D.x.P7 would produce a run of five
const A7: (u8, u8) = (0b0111, 0b1000);

const K4: [(u8, u8); 8] = [
    (0b1011, 0b0100),
    (0b0110, 0b1001),
    (0b1010, 0b0101),
    (0b1100, 0b0011),
    (0b1101, 0b0010),
    (0b0101, 0b1010),
    (0b1001, 0b0110),
    (0b0111, 0b1000),
];

fn pick(pair: (u8, u8), rd: Disparity) -> u8 {
    match rd {
        Disparity::Negative => pair.0,
        Disparity::Positive => pair.1,
    }
}

// Running disparity after a sub-block of `width` bits.  A balanced
// sub-block leaves it unchanged.
fn after(bits: u8, width: u32, rd: Option<Disparity>) -> Option<Disparity> {
    match (bits.count_ones() * 2).cmp(&width) {
        std::cmp::Ordering::Greater => Some(Disparity::Positive),
        std::cmp::Ordering::Less => Some(Disparity::Negative),
        std::cmp::Ordering::Equal => rd,
    }
}

fn use_alternate(x: usize, rd: Disparity) -> bool {
    match rd {
        Disparity::Negative => matches!(x, 17 | 18 | 20),
        Disparity::Positive => matches!(x, 11 | 13 | 14),
    }
}

pub fn is_valid_k(value: u8) -> bool {
    k::ALL.contains(&value)
}

/// Encode a single byte.  Returns the code group and the running disparity
/// that follows it, or `None` if `value` is not a legal K-code.
pub fn encode_symbol(
    value: u8,
    control: bool,
    rd: Disparity,
) -> Option<(u16, Disparity)> {
    if control && !is_valid_k(value) {
        return None;
    }
    let x = (value & 0x1f) as usize;
    let y = (value >> 5) as usize;

    let six = if control && x == 28 {
        pick(K28_6, rd)
    } else {
        pick(D6[x], rd)
    };
    let rd6 = after(six, 6, Some(rd)).unwrap_or(rd);

    let four = if control {
        pick(K4[y], rd6)
    } else if y == 7 && use_alternate(x, rd6) {
        pick(A7, rd6)
    } else {
        pick(D4[y], rd6)
    };
    let rd4 = after(four, 4, Some(rd6)).unwrap_or(rd6);

    Some((((six as u16) << 4) | four as u16, rd4))
}

/// Running disparity following `code`, given what preceded it.
pub fn running_disparity(
    code: u16,
    rd: Option<Disparity>,
) -> Option<Disparity> {
    let six = (code >> 4) as u8 & 0x3f;
    let four = code as u8 & 0xf;
    after(four, 4, after(six, 6, rd))
}

/// True if these seven bits, first-transmitted in bit 6, are a comma.
pub fn is_comma(bits: u16) -> bool {
    bits == 0b0011111 || bits == 0b1100000
}

#[derive(Clone, Copy, Debug)]
struct DecodeEntry {
    value: u8,
    control: bool,
    from_negative: bool,
    from_positive: bool,
}

impl DecodeEntry {
    fn allows(&self, rd: Disparity) -> bool {
        match rd {
            Disparity::Negative => self.from_negative,
            Disparity::Positive => self.from_positive,
        }
    }
}

fn build_decode_table() -> Vec<Option<DecodeEntry>> {
    let mut table = vec![None; 1024];
    for rd in [Disparity::Negative, Disparity::Positive] {
        for value in 0..=255u8 {
            for control in [false, true] {
                let Some((code, _)) = encode_symbol(value, control, rd) else {
                    continue;
                };
                let entry: &mut DecodeEntry =
                    table[code as usize].get_or_insert(DecodeEntry {
                        value,
                        control,
                        from_negative: false,
                        from_positive: false,
                    });
                match rd {
                    Disparity::Negative => entry.from_negative = true,
                    Disparity::Positive => entry.from_positive = true,
                }
            }
        }
    }
    table
}

lazy_static! {
    static ref DECODE: Vec<Option<DecodeEntry>> = build_decode_table();
}

/// How the aligner sees a candidate code group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeClass {
    /// K28.1, K28.5, or K28.7
    Comma,
    Valid,
    Invalid,
}

pub fn classify(code: u16) -> CodeClass {
    match DECODE.get(code as usize).copied().flatten() {
        None => CodeClass::Invalid,
        Some(e) if e.control && is_comma(code >> 3) => CodeClass::Comma,
        Some(_) => CodeClass::Valid,
    }
}

#[derive(Debug)]
pub struct Encoder {
    rd: Disparity,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Encoder {
            rd: Disparity::Negative,
        }
    }

    pub fn disparity(&self) -> Disparity {
        self.rd
    }

    /// Encode one symbol.  `force_negative` restarts the running disparity
    /// at RD-, as PIPE `TxCompliance` requires.  Anything that is not a
    /// legal data byte or K-code goes out as K30.7.
    pub fn encode(&mut self, sym: &Symbol, force_negative: bool) -> u16 {
        if force_negative {
            self.rd = Disparity::Negative;
        }
        let (value, control) = match sym.kind {
            SymbolKind::Data => (sym.value, false),
            SymbolKind::Control => (sym.value, true),
            SymbolKind::Error(_) => (k::EDB, true),
        };
        let (code, rd) = encode_symbol(value, control, self.rd)
            .or_else(|| encode_symbol(k::EDB, true, self.rd))
            .unwrap_or((0, self.rd));
        self.rd = rd;
        code
    }
}

/// Tracks running disparity across received code groups.  The disparity is
/// unknown after a reset or a code violation, and is re-learned from the
/// next legal code group.
#[derive(Debug, Default)]
pub struct Decoder {
    rd: Option<Disparity>,
}

impl Decoder {
    pub fn new() -> Self {
        Decoder { rd: None }
    }

    pub fn decode(&mut self, code: u16) -> Symbol {
        let Some(entry) = DECODE.get(code as usize).copied().flatten() else {
            self.rd = None;
            return Symbol::error(SymbolError::CodeViolation);
        };

        let disparity_ok = self.rd.map(|rd| entry.allows(rd)).unwrap_or(true);
        let prior = match (self.rd, entry.from_negative, entry.from_positive) {
            (Some(rd), _, _) => Some(rd),
            (None, true, false) => Some(Disparity::Negative),
            (None, false, true) => Some(Disparity::Positive),
            (None, _, _) => None,
        };
        self.rd = running_disparity(code, prior);

        if !disparity_ok {
            Symbol::error(SymbolError::Disparity)
        } else if entry.control {
            Symbol::control(entry.value)
        } else {
            Symbol::data(entry.value)
        }
    }
}
