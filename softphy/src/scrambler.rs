// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Data scrambling.  Scrambling and descrambling are the same operation, so
//! one type serves both directions; the two ends stay in step because they
//! apply identical rules to the same symbol stream.
//!
//! 8b/10b links (PCIe 2.5/5 GT/s, USB3 Gen1) use x^16 + x^5 + x^4 + x^3 + 1
//! seeded with all ones.  COM resets the register without advancing it, SKP
//! neither advances nor is scrambled, and the data symbols of a training set
//! are passed through untouched while the register keeps advancing.
//!
//! 128b/130b links use x^23 + x^21 + x^16 + x^8 + x^5 + x^2 + 1.  Data
//! blocks are scrambled, ordered-set blocks are not, the register is frozen
//! for the length of a SKP ordered set, and an EIEOS reseeds it at the start
//! of the following block.

use common::link::{Encoding, PipeVersion};

use crate::symbol;
use crate::symbol::k;
use crate::symbol::os;
use crate::symbol::{Symbol, SymbolKind, SyncHeader};

/// A Galois-form linear-feedback shift register producing one keystream
/// byte at a time, least significant bit first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lfsr {
    state: u32,
    seed: u32,
    taps: u32,
    top: u32,
}

impl Lfsr {
    /// x^16 + x^5 + x^4 + x^3 + 1
    pub fn gen1() -> Self {
        Lfsr {
            state: 0xffff,
            seed: 0xffff,
            taps: 0x0039,
            top: 15,
        }
    }

    /// x^23 + x^21 + x^16 + x^8 + x^5 + x^2 + 1
    pub fn gen3() -> Self {
        Lfsr {
            state: 0x1d_bfbc,
            seed: 0x1d_bfbc,
            taps: 0x21_0125,
            top: 22,
        }
    }

    pub fn value(&self) -> u32 {
        self.state
    }

    pub fn reseed(&mut self) {
        self.state = self.seed;
    }

    pub fn next_byte(&mut self) -> u8 {
        let mask = (1u32 << (self.top + 1)) - 1;
        let mut out = 0u8;
        for i in 0..8 {
            let bit = (self.state >> self.top) & 1;
            out |= (bit as u8) << i;
            self.state = (self.state << 1) & mask;
            if bit == 1 {
                self.state ^= self.taps;
            }
        }
        out
    }
}

// Handling of the remaining symbols of the current 128b/130b block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockMode {
    Scramble,
    Bypass,
    Frozen,
}

#[derive(Debug)]
pub struct Scrambler {
    version: PipeVersion,
    encoding: Encoding,
    lfsr: Lfsr,
    running: bool,
    after_com: bool,
    bypass: usize,
    block: BlockMode,
    reseed_at_block: bool,
}

impl Scrambler {
    pub fn new(version: PipeVersion, encoding: Encoding) -> Self {
        let lfsr = match encoding {
            Encoding::Enc8b10b => Lfsr::gen1(),
            Encoding::Enc128b130b => Lfsr::gen3(),
        };
        Scrambler {
            version,
            encoding,
            lfsr,
            running: false,
            after_com: false,
            bypass: 0,
            block: BlockMode::Bypass,
            reseed_at_block: false,
        }
    }

    /// Select the polynomial for `encoding` and stop.
    pub fn reset(&mut self, encoding: Encoding) {
        *self = Scrambler::new(self.version, encoding);
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Return the register to its initial value and begin scrambling.
    pub fn reseed(&mut self) {
        self.lfsr.reseed();
        self.after_com = false;
        self.bypass = 0;
        self.block = BlockMode::Bypass;
        self.reseed_at_block = false;
        self.running = true;
    }

    /// Pass everything through untouched, and hold the register, until the
    /// next reseed.
    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn lfsr(&self) -> &Lfsr {
        &self.lfsr
    }

    pub fn process(&mut self, sym: Symbol) -> Symbol {
        if !self.running {
            return sym;
        }
        match self.encoding {
            Encoding::Enc8b10b => self.process_8b10b(sym),
            Encoding::Enc128b130b => self.process_block(sym),
        }
    }

    fn process_8b10b(&mut self, sym: Symbol) -> Symbol {
        if sym.is_control(k::COM) {
            self.lfsr.reseed();
            self.after_com = true;
            self.bypass = 0;
            return sym;
        }
        if sym == symbol::filler(self.version, self.encoding) {
            self.after_com = false;
            return sym;
        }

        // A COM followed by data or PAD opens a training set
        if std::mem::take(&mut self.after_com)
            && (sym.is_data() || sym.is_control(k::PAD))
        {
            self.bypass = symbol::training_set_len(self.version);
        }

        let key = self.lfsr.next_byte();
        if self.bypass > 0 {
            self.bypass -= 1;
            return sym;
        }
        match sym.kind {
            SymbolKind::Data => Symbol {
                value: sym.value ^ key,
                ..sym
            },
            _ => sym,
        }
    }

    fn process_block(&mut self, sym: Symbol) -> Symbol {
        if let Some(header) = sym.block {
            if std::mem::take(&mut self.reseed_at_block) {
                self.lfsr.reseed();
            }
            self.block = match (header, sym.value) {
                (SyncHeader::Data, _) => BlockMode::Scramble,
                (SyncHeader::OrderedSet, os::SKP) => BlockMode::Frozen,
                (SyncHeader::OrderedSet, os::EIEOS) => {
                    self.reseed_at_block = true;
                    BlockMode::Bypass
                }
                (SyncHeader::OrderedSet, _) => BlockMode::Bypass,
            };
        }

        match self.block {
            BlockMode::Frozen => sym,
            BlockMode::Bypass => {
                self.lfsr.next_byte();
                sym
            }
            BlockMode::Scramble => {
                let key = self.lfsr.next_byte();
                match sym.kind {
                    SymbolKind::Data => Symbol {
                        value: sym.value ^ key,
                        ..sym
                    },
                    _ => sym,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use rand::SeedableRng;

    #[test]
    fn test_gen1_sequence() {
        let mut l = Lfsr::gen1();
        let bytes: Vec<u8> = (0..8).map(|_| l.next_byte()).collect();
        assert_eq!(bytes, vec![0xff, 0x17, 0xc0, 0x14, 0xb2, 0xe7, 0x02, 0x82]);
    }

    #[test]
    fn test_gen3_sequence() {
        let mut l = Lfsr::gen3();
        let bytes: Vec<u8> = (0..4).map(|_| l.next_byte()).collect();
        assert_eq!(bytes, vec![0x6c, 0xbd, 0x94, 0x98]);
        l.reseed();
        assert_eq!(l.value(), 0x1d_bfbc);
    }

    #[test]
    fn test_com_and_skp_rules() {
        let mut s = Scrambler::new(PipeVersion::Pcie, Encoding::Enc8b10b);
        s.reseed();
        // Advance away from the seed, then COM puts it back without
        // consuming keystream
        s.process(Symbol::data(0));
        s.process(Symbol::control(k::COM));
        assert_eq!(s.lfsr().value(), 0xffff);
        s.process(Symbol::control(k::SKP));
        assert_eq!(s.lfsr().value(), 0xffff);
        // COM SKP: not a training set, so this is scrambled with 0xff
        assert_eq!(s.process(Symbol::data(0)), Symbol::data(0xff));
        assert_eq!(s.process(Symbol::control(k::IDL)), Symbol::control(k::IDL));
        assert_eq!(s.process(Symbol::data(0)), Symbol::data(0xc0));
    }

    #[test]
    fn test_training_set_bypass() {
        let mut s = Scrambler::new(PipeVersion::Pcie, Encoding::Enc8b10b);
        s.reseed();
        s.process(Symbol::control(k::COM));
        for _ in 0..15 {
            assert_eq!(s.process(Symbol::data(0x4a)), Symbol::data(0x4a));
        }
        assert_ne!(s.lfsr().value(), 0xffff);
        assert_ne!(s.process(Symbol::data(0x4a)), Symbol::data(0x4a));
    }

    #[test]
    fn test_stopped_passes_through() {
        let mut s = Scrambler::new(PipeVersion::Usb3, Encoding::Enc8b10b);
        assert!(!s.is_running());
        assert_eq!(s.process(Symbol::data(7)), Symbol::data(7));
        s.reseed();
        s.stop();
        assert_eq!(s.process(Symbol::data(7)), Symbol::data(7));
        assert_eq!(s.lfsr().value(), 0xffff);
    }

    // A mixed stream: training sets, skip sets, and random data.
    fn stream_8b10b(rng: &mut impl Rng, n: usize) -> Vec<Symbol> {
        let mut out = Vec::new();
        while out.len() < n {
            match rng.gen_range(0..10) {
                0 => {
                    out.push(Symbol::control(k::COM));
                    out.extend((0..15).map(|_| Symbol::data(0x4a)));
                }
                1 => {
                    out.push(Symbol::control(k::COM));
                    out.extend([Symbol::control(k::SKP); 3]);
                }
                2 => out.push(Symbol::control(k::IDL)),
                _ => out.extend((0..32).map(|_| Symbol::data(rng.gen()))),
            }
        }
        out
    }

    fn stream_blocks(rng: &mut impl Rng, n: usize) -> Vec<Symbol> {
        let mut out = Vec::new();
        while out.len() < n {
            let (header, first) = match rng.gen_range(0..8) {
                0 => (SyncHeader::OrderedSet, os::SKP),
                1 => (SyncHeader::OrderedSet, os::EIEOS),
                2 => (SyncHeader::OrderedSet, os::TS1),
                _ => (SyncHeader::Data, rng.gen()),
            };
            for i in 0..16 {
                let value = if i == 0 { first } else { rng.gen() };
                let sym = match header {
                    SyncHeader::Data => Symbol::data(value),
                    SyncHeader::OrderedSet => Symbol::control(value),
                };
                out.push(if i == 0 { sym.starting(header) } else { sym });
            }
        }
        out
    }

    #[test]
    fn test_descramble_inverts_scramble() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5c7a);
        for (encoding, input) in [
            (Encoding::Enc8b10b, stream_8b10b(&mut rng, 10_000)),
            (Encoding::Enc128b130b, stream_blocks(&mut rng, 10_000)),
        ] {
            let mut tx = Scrambler::new(PipeVersion::Pcie, encoding);
            let mut rx = Scrambler::new(PipeVersion::Pcie, encoding);
            tx.reseed();
            rx.reseed();
            let wire: Vec<Symbol> =
                input.iter().map(|s| tx.process(*s)).collect();
            assert_ne!(wire, input);
            let output: Vec<Symbol> =
                wire.iter().map(|s| rx.process(*s)).collect();
            assert_eq!(output, input);
            assert_eq!(tx.lfsr(), rx.lfsr());
        }
    }
}
