// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! A simulated transceiver with a well-behaved link partner on the far end
//! of the wire.
//!
//! The partner retrains whenever the local transceiver is reset: it sends
//! training sets for a while, then scrambled counter data with periodic SKP
//! ordered sets.  Everything the engine transmits is captured for
//! inspection.

use std::collections::VecDeque;

use slog::{debug, o};

use common::link::{Encoding, PipeVersion, Rate};
use sal::{LineWord, RxSample, SalResult, SerdesOps, TxDrive, TxSample};

use crate::codec::Encoder;
use crate::scrambler::Scrambler;
use crate::symbol;
use crate::symbol::{k, os, Symbol, SyncHeader};

pub mod chaos;
pub mod harness;

use chaos::{BitChaos, Chaos};

// Data symbol used to fill training sets
const TS_FILL: u8 = 0x4a;
// Most transmitted samples kept for inspection
const CAPTURE_LIMIT: usize = 1 << 16;

#[derive(Clone, Debug)]
pub struct PartnerConfig {
    pub version: PipeVersion,
    /// Training sets sent after each reset before switching to data
    pub training_sets: usize,
    /// Symbols between SKP ordered sets in the 8b/10b data phase
    pub skip_interval: usize,
    /// Symbols between SKP ordered sets in the 128b/130b data phase
    pub block_skip_interval: usize,
    /// Junk bits preceding the first symbol, so the aligner has work to do
    pub bit_offset: usize,
    /// Receive cycles between a reset and the transceiver reporting ready
    pub init_cycles: u32,
    /// Core cycles a receiver detection takes
    pub detect_latency: u32,
    /// Whether there is a receiver at the far end
    pub present: bool,
    /// The pair is wired with its legs swapped
    pub inverted: bool,
    /// Probability of flipping a bit in any received word
    pub chaos: Chaos,
    pub seed: u64,
}

impl PartnerConfig {
    pub fn new(version: PipeVersion) -> Self {
        PartnerConfig {
            version,
            training_sets: 256,
            skip_interval: match version {
                PipeVersion::Pcie => 1180,
                PipeVersion::Usb3 => 354,
            },
            block_skip_interval: 370 * 16,
            bit_offset: 3,
            init_cycles: 32,
            detect_latency: 16,
            present: true,
            inverted: false,
            chaos: Chaos::default(),
            seed: 0x0c0f_fee0,
        }
    }
}

/// What the partner is putting on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartnerMode {
    /// Training, then data
    Link,
    /// Electrical idle
    Idle,
    /// LFPS: `on` cycles of activity separated by `off` cycles of idle
    Lfps { on: u32, off: u32 },
}

/// Produces the partner's line bits.
struct Generator {
    version: PipeVersion,
    encoding: Encoding,
    encoder: Encoder,
    scrambler: Scrambler,
    symbols: VecDeque<Symbol>,
    bits: VecDeque<bool>,
    training_left: usize,
    training_sent: usize,
    skip_interval: usize,
    since_skip: usize,
    counter: u8,
    corrupt: usize,
}

impl Generator {
    fn new(cfg: &PartnerConfig, encoding: Encoding) -> Self {
        let mut scrambler = Scrambler::new(cfg.version, encoding);
        scrambler.reseed();
        Generator {
            version: cfg.version,
            encoding,
            encoder: Encoder::new(encoding),
            scrambler,
            symbols: VecDeque::new(),
            bits: (0..cfg.bit_offset).map(|i| i % 3 == 0).collect(),
            training_left: cfg.training_sets,
            training_sent: 0,
            skip_interval: match encoding {
                Encoding::Enc8b10b => cfg.skip_interval,
                Encoding::Enc128b130b => cfg.block_skip_interval,
            },
            since_skip: 0,
            counter: 0,
            corrupt: 0,
        }
    }

    fn block(&mut self, header: SyncHeader, values: impl Iterator<Item = u8>) {
        for (i, v) in values.take(16).enumerate() {
            let sym = match header {
                SyncHeader::Data => Symbol::data(v),
                SyncHeader::OrderedSet => Symbol::control(v),
            };
            self.symbols.push_back(match i {
                0 => sym.starting(header),
                _ => sym,
            });
        }
    }

    fn eieos(&mut self) {
        self.block(
            SyncHeader::OrderedSet,
            (0..16).map(|i| if i % 2 == 0 { os::EIEOS } else { 0xff }),
        );
    }

    fn skip_set(&mut self) {
        match (self.encoding, self.version) {
            (Encoding::Enc128b130b, _) => {
                self.eieos();
                let skp = std::iter::repeat(os::SKP).take(12);
                let tail = [os::SKP_END, 0, 0, 0];
                self.block(SyncHeader::OrderedSet, skp.chain(tail));
            }
            (Encoding::Enc8b10b, PipeVersion::Pcie) => {
                self.symbols.push_back(Symbol::control(k::COM));
                self.symbols.extend([Symbol::control(k::SKP); 3]);
            }
            (Encoding::Enc8b10b, PipeVersion::Usb3) => {
                self.symbols.extend([Symbol::control(k::SKP_USB); 2]);
            }
        }
    }

    fn training_set(&mut self) {
        let ts_len = symbol::training_set_len(self.version);
        match (self.encoding, self.version) {
            (Encoding::Enc128b130b, _) => {
                if self.training_sent % 32 == 0 {
                    self.eieos();
                }
                let fill = std::iter::repeat(TS_FILL).take(15);
                self.block(
                    SyncHeader::OrderedSet,
                    std::iter::once(os::TS1).chain(fill),
                );
            }
            (Encoding::Enc8b10b, version) => {
                let commas = match version {
                    PipeVersion::Pcie => 1,
                    PipeVersion::Usb3 => 4,
                };
                for _ in 0..commas {
                    self.symbols.push_back(Symbol::control(k::COM));
                }
                for _ in 0..ts_len {
                    self.symbols.push_back(Symbol::data(TS_FILL));
                }
            }
        }
        self.training_sent += 1;
    }

    fn data(&mut self) {
        let n = match self.encoding {
            Encoding::Enc8b10b => 1,
            Encoding::Enc128b130b => 16,
        };
        let start = self.counter;
        self.counter = self.counter.wrapping_add(n as u8);
        self.since_skip += n;
        match self.encoding {
            Encoding::Enc8b10b => self.symbols.push_back(Symbol::data(start)),
            Encoding::Enc128b130b => self.block(
                SyncHeader::Data,
                (0..16u8).map(|i| start.wrapping_add(i)),
            ),
        }
    }

    fn refill(&mut self) {
        if self.training_left > 0 {
            self.training_left -= 1;
            self.training_set();
            if self.training_left == 0 {
                self.skip_set();
            }
        } else if self.since_skip >= self.skip_interval {
            self.since_skip = 0;
            self.skip_set();
        } else {
            self.data();
        }
    }

    fn next_word(&mut self, len: usize) -> LineWord {
        while self.bits.len() < len {
            let Some(sym) = self.symbols.pop_front() else {
                self.refill();
                continue;
            };
            let scrambled = self.scrambler.process(sym);
            let Some(mut word) = self.encoder.encode(&scrambled, false) else {
                continue;
            };
            if self.corrupt > 0 && sym.is_control(k::COM) {
                self.corrupt -= 1;
                word = LineWord::from_msb_first(0b11_1111_1111, 10);
            }
            self.bits.extend(word.iter());
        }
        LineWord::from_bits(self.bits.drain(..len))
    }
}

pub struct LinkPartner {
    log: slog::Logger,
    cfg: PartnerConfig,
    mode: PartnerMode,
    rate: Rate,
    encoding: Encoding,
    configured: bool,
    init_left: u32,
    detect_left: Option<u32>,
    rx_invert: bool,
    drive: TxDrive,
    generator: Option<Generator>,
    chaos: BitChaos,
    cycle: u64,
    resets: u32,
    transmitted: VecDeque<TxSample>,
}

impl LinkPartner {
    pub fn new(log: &slog::Logger, cfg: PartnerConfig) -> Self {
        let log = log.new(o!("unit" => "partner"));
        LinkPartner {
            chaos: BitChaos::new(&log, cfg.chaos, cfg.seed),
            log,
            mode: PartnerMode::Link,
            rate: Rate::Gen1,
            encoding: Encoding::Enc8b10b,
            configured: false,
            init_left: cfg.init_cycles,
            detect_left: None,
            rx_invert: false,
            drive: TxDrive::default(),
            generator: None,
            cycle: 0,
            resets: 0,
            transmitted: VecDeque::new(),
            cfg,
        }
    }

    pub fn rate(&self) -> Rate {
        self.rate
    }

    pub fn set_mode(&mut self, mode: PartnerMode) {
        debug!(self.log, "partner mode"; "mode" => ?mode);
        self.mode = mode;
    }

    pub fn set_present(&mut self, present: bool) {
        self.cfg.present = present;
    }

    pub fn set_chaos(&mut self, chaos: Chaos) {
        self.chaos.set(chaos);
    }

    /// Bits flipped so far by chaos.
    pub fn bit_flips(&self) -> u64 {
        self.chaos.flips()
    }

    /// Replace the next `n` commas on the wire with an invalid code group.
    pub fn corrupt_commas(&mut self, n: usize) {
        if let Some(g) = self.generator.as_mut() {
            g.corrupt += n;
        }
    }

    /// Send training sets again, as a partner recovering the link would.
    pub fn retrain(&mut self) {
        if self.generator.is_some() {
            self.generator = Some(Generator::new(&self.cfg, self.encoding));
        }
    }

    /// Number of times the transceiver has been reset.
    pub fn resets(&self) -> u32 {
        self.resets
    }

    pub fn tx_drive(&self) -> TxDrive {
        self.drive
    }

    pub fn rx_inverted(&self) -> bool {
        self.rx_invert
    }

    /// Everything transmitted since the last call, oldest first.
    pub fn take_transmitted(&mut self) -> Vec<TxSample> {
        self.transmitted.drain(..).collect()
    }

    fn line_sample(&mut self) -> RxSample {
        let len = self.encoding.line_bits();
        let level = |b| LineWord::from_bits(std::iter::repeat(b).take(len));
        let idle = RxSample {
            bits: level(false),
            signal_detect: false,
        };
        match self.mode {
            PartnerMode::Idle => idle,
            PartnerMode::Lfps { on, off } => {
                let period = u64::from(on + off).max(1);
                match self.cycle % period < u64::from(on) {
                    true => RxSample {
                        bits: level(true),
                        signal_detect: true,
                    },
                    false => idle,
                }
            }
            PartnerMode::Link => match self.generator.as_mut() {
                Some(g) => RxSample {
                    bits: g.next_word(len),
                    signal_detect: true,
                },
                None => idle,
            },
        }
    }
}

impl SerdesOps for LinkPartner {
    fn configure(&mut self, rate: Rate, encoding: Encoding) -> SalResult<()> {
        debug!(self.log, "configure";
            "rate" => %rate, "encoding" => %encoding);
        self.rate = rate;
        self.encoding = encoding;
        self.configured = true;
        Ok(())
    }

    fn reset(&mut self) -> SalResult<()> {
        self.resets += 1;
        self.init_left = self.cfg.init_cycles;
        self.detect_left = None;
        self.generator = match self.configured {
            true => Some(Generator::new(&self.cfg, self.encoding)),
            false => None,
        };
        Ok(())
    }

    fn ready(&self) -> bool {
        self.configured && self.init_left == 0
    }

    fn receive(&mut self) -> RxSample {
        self.cycle += 1;
        if self.init_left > 0 {
            self.init_left -= 1;
            return RxSample::default();
        }
        let mut sample = self.line_sample();
        sample.bits = self.chaos.apply(sample.bits);
        if self.cfg.inverted != self.rx_invert {
            sample.bits = sample.bits.inverted();
        }
        sample
    }

    fn transmit(&mut self, sample: TxSample) -> SalResult<()> {
        if self.transmitted.len() >= CAPTURE_LIMIT {
            self.transmitted.pop_front();
        }
        self.transmitted.push_back(sample);
        Ok(())
    }

    fn detect_receiver(&mut self) -> SalResult<()> {
        self.detect_left = Some(self.cfg.detect_latency);
        Ok(())
    }

    fn receiver_detect_result(&mut self) -> Option<bool> {
        match self.detect_left {
            Some(0) => {
                self.detect_left = None;
                Some(self.cfg.present)
            }
            Some(n) => {
                self.detect_left = Some(n - 1);
                None
            }
            None => None,
        }
    }

    fn set_rx_polarity(&mut self, invert: bool) -> SalResult<()> {
        self.rx_invert = invert;
        Ok(())
    }

    fn set_tx_drive(&mut self, drive: TxDrive) -> SalResult<()> {
        self.drive = drive;
        Ok(())
    }
}
