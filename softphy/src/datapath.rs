// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The receive path up to the elastic buffer, which runs on the recovered
//! clock, and the transmit path, which runs on the core clock.

use slog::{o, trace};

use common::link::{Encoding, PipeVersion, PowerState};
use sal::{LineWord, RxSample, TxSample, MAX_LINE_BITS};

use crate::aligner::{Aligner, AlignmentState};
use crate::codec::{Decoder, Encoder};
use crate::config::PhyConfig;
use crate::controller::{LinkConfig, PhyState};
use crate::elastic::{ElasticBuffer, LineStatus};
use crate::pipe::MacRequest;
use crate::scrambler::Scrambler;
use crate::signaling::{IdleDetector, TxSignaling, WakeDetector};

/// Recovered-clock side: squelch and wake detection, alignment, and
/// decoding.  Its only outputs are writes into the elastic buffer and the
/// line status published alongside them.
pub struct RxPath {
    log: slog::Logger,
    generation: u64,
    encoding: Encoding,
    idle: IdleDetector,
    wake: WakeDetector,
    aligner: Aligner,
    decoder: Decoder,
    was_idle: bool,
}

impl RxPath {
    pub fn new(log: &slog::Logger, cfg: &PhyConfig, link: &LinkConfig) -> Self {
        let log = log.new(o!("path" => "rx"));
        RxPath {
            generation: link.generation,
            encoding: link.encoding,
            idle: IdleDetector::new(cfg.idle.debounce),
            wake: WakeDetector::new(&log, cfg.lfps.clone()),
            aligner: Aligner::new(&log, cfg.aligner.clone(), link.encoding),
            decoder: Decoder::new(link.encoding),
            was_idle: true,
            log,
        }
    }

    pub fn alignment(&self) -> AlignmentState {
        self.aligner.state()
    }

    pub fn lock_counts(&self) -> (u64, u64) {
        self.aligner.lock_counts()
    }

    pub fn wakes(&self) -> u32 {
        self.wake.wakes()
    }

    /// One recovered-clock cycle.  `link` is the controller's published
    /// configuration, which this side only reads.
    pub fn tick(
        &mut self,
        mut sample: RxSample,
        link: &LinkConfig,
        buffer: &mut ElasticBuffer,
    ) {
        if link.generation != self.generation {
            self.generation = link.generation;
            self.encoding = link.encoding;
            self.aligner.reset(link.encoding);
            self.decoder.reset(link.encoding);
            self.wake.reset();
        }
        // An unterminated receiver sees nothing
        if !link.rx_termination {
            sample.signal_detect = false;
        }

        let idle = self.idle.sample(&sample);
        self.wake.sample(sample.signal_detect);
        if idle && !self.was_idle {
            self.aligner.reset(self.encoding);
        }
        self.was_idle = idle;

        if link.align_enabled && !idle {
            self.aligner.push(&sample.bits);
            while let Some(word) = self.aligner.next_word() {
                let symbols = self.decoder.decode(&word);
                if !(link.rx_enabled && self.aligner.is_locked()) {
                    continue;
                }
                for sym in symbols {
                    if let Some(err) = sym.error_kind() {
                        trace!(self.log, "decode error";
                            "error" => ?err, "word" => ?word);
                    }
                    if buffer.write(sym).is_err() {
                        break;
                    }
                }
            }
        }

        buffer.publish(LineStatus {
            locked: self.aligner.is_locked(),
            electrical_idle: idle,
            wakes: self.wake.wakes(),
        });
    }
}

/// Core-clock transmit side: scrambling, encoding, and out-of-band
/// signaling.
pub struct TxPath {
    version: PipeVersion,
    scrambler: Scrambler,
    encoder: Encoder,
    signaling: TxSignaling,
}

impl TxPath {
    pub fn new(cfg: &PhyConfig, link: &LinkConfig) -> Self {
        TxPath {
            version: cfg.pipe_version,
            scrambler: Scrambler::new(cfg.pipe_version, link.encoding),
            encoder: Encoder::new(link.encoding),
            signaling: TxSignaling::new(cfg.lfps.tx_half_period),
        }
    }

    pub fn reset_codec(&mut self, encoding: Encoding) {
        self.encoder.reset(encoding);
    }

    pub fn reseed(&mut self, encoding: Encoding) {
        self.scrambler.reset(encoding);
        self.scrambler.reseed();
    }

    pub fn stop(&mut self) {
        self.scrambler.stop();
    }

    /// One core cycle.  Returns what to hand to the serializer, if
    /// anything.
    pub fn tick(
        &mut self,
        state: PhyState,
        link: &LinkConfig,
        req: &MacRequest,
    ) -> Option<TxSample> {
        let carrying = matches!(
            state,
            PhyState::Align | PhyState::Configure(_) | PhyState::Active(_)
        );
        if carrying && !req.tx_elecidle {
            self.signaling.set_idle();
            return self.transmit(link.encoding, req);
        }

        // USB3 wakes its partner from U1-U3 with LFPS
        let low_power = matches!(
            state,
            PhyState::Idle(PowerState::P1 | PowerState::P2 | PowerState::P3)
        );
        if self.version == PipeVersion::Usb3 && low_power && !req.tx_elecidle
        {
            self.signaling.start_lfps();
        } else {
            self.signaling.set_idle();
        }
        Some(self.signaling.next_sample())
    }

    fn transmit(
        &mut self,
        encoding: Encoding,
        req: &MacRequest,
    ) -> Option<TxSample> {
        if req.tx_ones_zeroes {
            let len = match encoding {
                Encoding::Enc8b10b => 10 * req.tx.len(),
                Encoding::Enc128b130b => encoding.line_bits(),
            };
            let len = len.min(MAX_LINE_BITS);
            return Some(TxSample::Word(LineWord::from_bits(
                (0..len).map(|i| i % 2 == 0),
            )));
        }
        if !req.tx_valid {
            return None;
        }

        let mut out = LineWord::new();
        for (i, sym) in req.tx.iter().enumerate() {
            let scrambled = self.scrambler.process(*sym);
            let force_negative = req.tx_compliance && i == 0;
            if let Some(word) = self.encoder.encode(&scrambled, force_negative)
            {
                for bit in word.iter() {
                    out.push(bit);
                }
            }
        }
        match out.is_empty() {
            true => None,
            false => Some(TxSample::Word(out)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::enc8b10b;
    use crate::controller::Controller;
    use crate::pipe::PipeCommand;
    use crate::symbol::k;
    use crate::symbol::Symbol;
    use crate::test_log;

    fn setup(version: PipeVersion) -> (PhyConfig, LinkConfig, MacRequest) {
        let cfg = PhyConfig {
            pipe_version: version,
            ..Default::default()
        };
        let link = *Controller::new(&test_log(), &cfg).link_config();
        let mut cmd = PipeCommand::new(version);
        cmd.tx_elecidle = false;
        let req = cmd.decode(&cfg, Encoding::Enc8b10b).unwrap();
        (cfg, link, req)
    }

    #[test]
    fn test_tx_states() {
        let (cfg, link, mut req) = setup(PipeVersion::Usb3);
        let mut tx = TxPath::new(&cfg, &link);
        let active = PhyState::Active(link.rate);
        req.tx = [Symbol::control(k::COM), Symbol::data(0x4a)]
            .into_iter()
            .collect();

        match tx.tick(active, &link, &req) {
            Some(TxSample::Word(w)) => {
                assert_eq!(w.len(), 20);
                assert!(enc8b10b::is_comma(w.msb_first(0, 7) as u16));
            }
            other => panic!("unexpected {other:?}"),
        }

        let detect = tx.tick(PhyState::Detect, &link, &req);
        assert_eq!(detect, Some(TxSample::Idle));
        let p2 = PhyState::Idle(PowerState::P2);
        assert_eq!(tx.tick(p2, &link, &req), Some(TxSample::Level(true)));
        req.tx_elecidle = true;
        assert_eq!(tx.tick(p2, &link, &req), Some(TxSample::Idle));
        assert_eq!(tx.tick(active, &link, &req), Some(TxSample::Idle));
    }

    #[test]
    fn test_tx_ones_zeroes() {
        let (cfg, link, mut req) = setup(PipeVersion::Pcie);
        let mut tx = TxPath::new(&cfg, &link);
        req.tx_ones_zeroes = true;
        let expected =
            LineWord::from_msb_first(0b1010_1010_1010_1010_1010, 20);
        assert_eq!(
            tx.tick(PhyState::Active(link.rate), &link, &req),
            Some(TxSample::Word(expected))
        );
        // PCIe has no LFPS
        req.tx_ones_zeroes = false;
        let p1 = PhyState::Idle(PowerState::P1);
        assert_eq!(tx.tick(p1, &link, &req), Some(TxSample::Idle));
    }

    #[test]
    fn test_rx_gated_by_link_config() {
        let (cfg, mut link, _) = setup(PipeVersion::Pcie);
        let log = test_log();
        let mut rx = RxPath::new(&log, &cfg, &link);
        let mut buffer = ElasticBuffer::new(
            &log,
            256,
            cfg.max_burst(),
            cfg.pipe_version,
            link.encoding,
        );

        let mut enc = Encoder::new(Encoding::Enc8b10b);
        let mut words = Vec::new();
        for i in 0..400 {
            let sym = match i % 8 {
                0 => Symbol::control(k::COM),
                _ => Symbol::data(0x4a),
            };
            words.extend(enc.encode(&sym, false));
        }
        let mut feed = |rx: &mut RxPath, link: &LinkConfig, n: usize| {
            for w in words.drain(..n) {
                let sample = RxSample {
                    bits: w,
                    signal_detect: true,
                };
                rx.tick(sample, link, &mut buffer);
            }
        };

        // Not aligning yet
        feed(&mut rx, &link, 100);
        assert!(!rx.alignment().aligned);

        link.align_enabled = true;
        feed(&mut rx, &link, 100);
        assert!(rx.alignment().locked);

        link.rx_enabled = true;
        feed(&mut rx, &link, 100);
        link.generation += 1;
        feed(&mut rx, &link, 1);
        assert!(!rx.alignment().aligned);
        assert_eq!(rx.lock_counts(), (1, 0));
        assert_eq!(buffer.stats().written, 100);
        assert!(!buffer.line_status().electrical_idle);
    }
}
