// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Decoded link symbols and the protocol control codes the engine cares
//! about.

use std::fmt;

use common::link::{Encoding, PipeVersion};

/// 8b/10b control characters, by their decoded K-code value.
pub mod k {
    /// K28.5, comma.  Starts every 8b/10b ordered set.
    pub const COM: u8 = 0xbc;
    /// K28.0, PCIe skip
    pub const SKP: u8 = 0x1c;
    /// K28.1, USB3 skip.  Shares a value with the PCIe FTS symbol.
    pub const SKP_USB: u8 = 0x3c;
    pub const FTS: u8 = 0x3c;
    /// K28.3
    pub const IDL: u8 = 0x7c;
    /// K28.2
    pub const SDP: u8 = 0x5c;
    /// K27.7
    pub const STP: u8 = 0xfb;
    /// K29.7
    pub const END: u8 = 0xfd;
    /// K30.7, PCIe end-bad and decode-error substitution
    pub const EDB: u8 = 0xfe;
    /// K23.7
    pub const PAD: u8 = 0xf7;
    /// K28.7
    pub const EIE: u8 = 0xfc;
    /// K28.4, USB3 decode-error substitution
    pub const SUB: u8 = 0x9c;

    /// Every K-code the 8b/10b codec accepts.
    pub const ALL: [u8; 12] = [
        0x1c, 0x3c, 0x5c, 0x7c, 0x9c, 0xbc, 0xdc, 0xfc, 0xf7, 0xfb, 0xfd, 0xfe,
    ];
}

/// First-symbol identifiers of 128b/130b ordered-set blocks.
pub mod os {
    pub const SKP: u8 = 0xaa;
    pub const SKP_END: u8 = 0xe1;
    pub const SDS: u8 = 0xe1;
    pub const EIEOS: u8 = 0x00;
    pub const EIOS: u8 = 0x66;
    pub const TS1: u8 = 0x1e;
    pub const TS2: u8 = 0x2d;

    /// Identifiers the aligner trusts as block-boundary markers.
    pub const MARKERS: [u8; 6] = [SKP, SDS, EIEOS, EIOS, TS1, TS2];
}

/// The two legal 128b/130b sync headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncHeader {
    Data,
    OrderedSet,
}

impl SyncHeader {
    /// The header bits in transmission order.
    pub fn bits(&self) -> [bool; 2] {
        match self {
            SyncHeader::Data => [false, true],
            SyncHeader::OrderedSet => [true, false],
        }
    }

    pub fn from_bits(bits: [bool; 2]) -> Option<Self> {
        match bits {
            [false, true] => Some(SyncHeader::Data),
            [true, false] => Some(SyncHeader::OrderedSet),
            _ => None,
        }
    }

    /// Encoding on the PIPE `RxSyncHeader`/`TxSyncHeader` signals: the first
    /// transmitted bit in bit 0.
    pub fn to_pipe(&self) -> u8 {
        let [h0, h1] = self.bits();
        (h0 as u8) | (h1 as u8) << 1
    }

    pub fn from_pipe(bits: u8) -> Option<Self> {
        SyncHeader::from_bits([bits & 1 == 1, bits & 2 == 2])
    }
}

/// Per-symbol decode failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SymbolError {
    /// Not a legal 8b/10b code group
    CodeViolation,
    /// A legal code group arriving with the wrong running disparity
    Disparity,
    /// Part of a 128b/130b block whose sync header was invalid
    SyncHeader,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    Data,
    Control,
    Error(SymbolError),
}

/// One decoded byte-sized symbol.  Every symbol carries a definite tag;
/// anything the decoder could not make sense of is tagged as an error and
/// never as data.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Symbol {
    pub kind: SymbolKind,
    pub value: u8,
    /// Set on the first symbol of a 128b/130b block.
    pub block: Option<SyncHeader>,
}

impl Symbol {
    pub const fn data(value: u8) -> Self {
        Symbol {
            kind: SymbolKind::Data,
            value,
            block: None,
        }
    }

    pub const fn control(value: u8) -> Self {
        Symbol {
            kind: SymbolKind::Control,
            value,
            block: None,
        }
    }

    pub const fn error(err: SymbolError) -> Self {
        Symbol {
            kind: SymbolKind::Error(err),
            value: 0,
            block: None,
        }
    }

    /// Mark this symbol as the start of a block.
    pub const fn starting(self, header: SyncHeader) -> Self {
        Symbol {
            block: Some(header),
            ..self
        }
    }

    pub fn is_data(&self) -> bool {
        self.kind == SymbolKind::Data
    }

    pub fn is_control(&self, value: u8) -> bool {
        self.kind == SymbolKind::Control && self.value == value
    }

    pub fn error_kind(&self) -> Option<SymbolError> {
        match self.kind {
            SymbolKind::Error(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let block = match self.block {
            Some(SyncHeader::Data) => "|D",
            Some(SyncHeader::OrderedSet) => "|O",
            None => "",
        };
        match self.kind {
            SymbolKind::Data => write!(f, "D{:02x}{block}", self.value),
            SymbolKind::Control => write!(f, "K{:02x}{block}", self.value),
            SymbolKind::Error(e) => write!(f, "E({e:?}){block}"),
        }
    }
}

/// The symbol the elastic buffer may insert or remove.
pub fn filler(version: PipeVersion, encoding: Encoding) -> Symbol {
    match (encoding, version) {
        (Encoding::Enc128b130b, _) => Symbol::control(os::SKP),
        (Encoding::Enc8b10b, PipeVersion::Pcie) => Symbol::control(k::SKP),
        (Encoding::Enc8b10b, PipeVersion::Usb3) => Symbol::control(k::SKP_USB),
    }
}

/// The K-code presented to the MAC in place of a symbol that failed to
/// decode.
pub fn substitute(version: PipeVersion) -> u8 {
    match version {
        PipeVersion::Pcie => k::EDB,
        PipeVersion::Usb3 => k::SUB,
    }
}

/// Number of symbols following the comma(s) of an 8b/10b training set.
pub fn training_set_len(version: PipeVersion) -> usize {
    match version {
        PipeVersion::Pcie => 15,
        PipeVersion::Usb3 => 12,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_header_pipe() {
        for h in [SyncHeader::Data, SyncHeader::OrderedSet] {
            assert_eq!(SyncHeader::from_pipe(h.to_pipe()), Some(h));
            assert_eq!(SyncHeader::from_bits(h.bits()), Some(h));
        }
        assert_eq!(SyncHeader::Data.to_pipe(), 0b10);
        assert_eq!(SyncHeader::from_pipe(0b11), None);
        assert_eq!(SyncHeader::from_bits([false, false]), None);
    }

    #[test]
    fn test_filler() {
        let f = filler(PipeVersion::Usb3, Encoding::Enc8b10b);
        assert!(f.is_control(k::SKP_USB));
        assert!(!Symbol::data(k::SKP_USB).is_control(k::SKP_USB));
        assert_eq!(format!("{:?}", Symbol::control(k::COM)), "Kbc");
        assert_eq!(
            format!("{:?}", Symbol::data(1).starting(SyncHeader::Data)),
            "D01|D"
        );
    }
}
