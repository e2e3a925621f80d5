// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Drives a `Phy` and its simulated partner from two clocks whose
//! frequencies differ by a configurable number of parts per million.

use crate::config::PhyConfig;
use crate::pipe::{PipeCommand, PipeStatus, MAX_BUS_SYMBOLS};
use crate::symbol::Symbol;
use crate::types::PhyResult;
use crate::Phy;

use super::{LinkPartner, PartnerConfig};

pub struct Harness {
    pub phy: Phy<LinkPartner>,
    /// What the MAC drives on the PIPE interface every core cycle
    pub cmd: PipeCommand,
    ppm: f64,
    // Symbols the receive clock owes the core clock
    credit: f64,
    core_cycles: u64,
    rx_cycles: u64,
}

impl Harness {
    pub fn new(
        log: &slog::Logger,
        cfg: PhyConfig,
        partner: PartnerConfig,
    ) -> PhyResult<Self> {
        let mut cmd = PipeCommand::new(cfg.pipe_version);
        cmd.tx_elecidle = false;
        let partner = LinkPartner::new(log, partner);
        Ok(Harness {
            phy: Phy::new(log, cfg, partner)?,
            cmd,
            ppm: 0.0,
            credit: 0.0,
            core_cycles: 0,
            rx_cycles: 0,
        })
    }

    /// Run the recovered clock `ppm` parts per million faster than the
    /// core clock.  Negative values run it slower.
    pub fn set_ppm(&mut self, ppm: f64) {
        self.ppm = ppm;
    }

    pub fn partner(&mut self) -> &mut LinkPartner {
        self.phy.serdes_mut()
    }

    pub fn core_cycles(&self) -> u64 {
        self.core_cycles
    }

    pub fn rx_cycles(&self) -> u64 {
        self.rx_cycles
    }

    /// One core cycle, preceded by however many receive cycles the
    /// recovered clock has run in the meantime.
    pub fn tick(&mut self) -> PhyResult<PipeStatus> {
        let width = self.phy.config().interface_width.symbols() as f64;
        self.credit += width * (1.0 + self.ppm * 1e-6);
        loop {
            let per_word =
                self.phy.link_config().encoding.symbols_per_word() as f64;
            if self.credit < per_word {
                break;
            }
            self.credit -= per_word;
            self.phy.tick_rx();
            self.rx_cycles += 1;
        }
        self.core_cycles += 1;
        self.phy.tick_core(&self.cmd)
    }

    /// Run up to `limit` core cycles, stopping early once `done` returns
    /// true.  Returns whether it did.
    pub fn run_until<F>(&mut self, limit: u64, mut done: F) -> PhyResult<bool>
    where
        F: FnMut(&Phy<LinkPartner>, &PipeStatus) -> bool,
    {
        for _ in 0..limit {
            let status = self.tick()?;
            if done(&self.phy, &status) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn run(&mut self, cycles: u64) -> PhyResult<()> {
        self.run_until(cycles, |_, _| false).map(|_| ())
    }
}

/// The symbols carried on the receive bus this cycle.
pub fn bus_symbols(status: &PipeStatus, width: usize) -> Vec<Symbol> {
    if !status.rx_valid {
        return Vec::new();
    }
    (0..width.min(MAX_BUS_SYMBOLS))
        .map(|i| {
            let value = (status.rx_data >> (8 * i)) as u8;
            match status.rx_datak & (1 << i) != 0 {
                true => Symbol::control(value),
                false => Symbol::data(value),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Decoder;
    use crate::controller::{PhyState, PhyStateKind};
    use crate::sim::chaos::Chaos;
    use crate::sim::PartnerMode;
    use crate::symbol::k;
    use crate::test_log;
    use common::link::{Encoding, PipeVersion, PowerState, Rate};
    use sal::{LineWord, TxSample};

    const BRING_UP: u64 = 20_000;

    fn harness(cfg: PhyConfig) -> Harness {
        let partner = PartnerConfig::new(cfg.pipe_version);
        Harness::new(&test_log(), cfg, partner).unwrap()
    }

    fn bring_up(h: &mut Harness) {
        assert!(h.run_until(BRING_UP, |phy, _| phy.is_ready()).unwrap());
    }

    #[test]
    fn test_bring_up_at_lowest_rate() {
        let mut h = harness(PhyConfig::default());
        bring_up(&mut h);
        assert_eq!(h.phy.state(), PhyState::Active(Rate::Gen1));

        let stats = h.phy.fsm_stats();
        assert_eq!(stats.get(PhyStateKind::Reset), 1);
        assert_eq!(stats.get(PhyStateKind::Transition), 0);
        assert_eq!(h.partner().resets(), 1);

        // Asking for the rate already in use changes nothing
        h.cmd.rate = Rate::Gen1.to_pipe();
        h.run(1000).unwrap();
        assert_eq!(h.phy.fsm_stats().get(PhyStateKind::Transition), 0);
        assert!(h.phy.is_ready());
        assert!(h.phy.link_fault().is_none());
    }

    #[test]
    fn test_corrupt_comma_keeps_lock() {
        let cfg = PhyConfig::default();
        let mut partner = PartnerConfig::new(cfg.pipe_version);
        partner.training_sets = 4096;
        let mut h = Harness::new(&test_log(), cfg, partner).unwrap();
        bring_up(&mut h);

        // One bad comma in the next hundred
        h.partner().corrupt_commas(1);
        h.run(800).unwrap();
        assert!(h.phy.is_ready());
        assert_eq!(h.phy.lock_counts(), (1, 0));
        assert_eq!(h.phy.fsm_stats().get(PhyStateKind::Reset), 1);
        assert_eq!(h.phy.decode_error_counts().1, 1);
    }

    #[test]
    fn test_rate_change_is_never_ready_in_between() {
        let cfg = PhyConfig {
            supported_rates: vec![Rate::Gen1, Rate::Gen2, Rate::Gen3],
            buffer_depth: 128,
            ..Default::default()
        };
        let mut h = harness(cfg);
        bring_up(&mut h);

        for rate in [Rate::Gen3, Rate::Gen2] {
            h.cmd.rate = rate.to_pipe();
            let mut early = false;
            let done = h
                .run_until(BRING_UP, |phy, status| {
                    if phy.state() == PhyState::Active(rate) {
                        return true;
                    }
                    early |= phy.is_ready() || !status.phy_status;
                    false
                })
                .unwrap();
            assert!(done, "never reached {rate}");
            assert!(!early, "ready before reaching {rate}");
            assert_eq!(h.partner().rate(), rate);
            assert_eq!(
                h.phy.link_config().encoding,
                rate.default_encoding()
            );
        }
        assert_eq!(h.phy.fsm_stats().get(PhyStateKind::Transition), 2);
        assert!(h.phy.link_fault().is_none());
    }

    // Over a million symbols the receive clock gains or loses 300; all of
    // it must be absorbed at SKP ordered sets.
    fn drift(ppm: f64) -> Harness {
        let mut h = harness(PhyConfig::default());
        h.set_ppm(ppm);
        bring_up(&mut h);

        let width = h.phy.config().interface_width.symbols();
        let mut seen_skip = false;
        let mut last: Option<u8> = None;
        let mut gaps = 0;
        h.run_until(500_000, |_, status| {
            for sym in bus_symbols(status, width) {
                if sym.is_control(k::SKP) {
                    seen_skip = true;
                }
                if !seen_skip || !sym.is_data() {
                    continue;
                }
                if let Some(prev) = last {
                    if sym.value != prev.wrapping_add(1) {
                        gaps += 1;
                    }
                }
                last = Some(sym.value);
            }
            false
        })
        .unwrap();

        assert!(seen_skip);
        assert_eq!(gaps, 0);
        assert!(h.phy.is_ready());
        assert!(h.phy.link_fault().is_none());
        assert_eq!(h.phy.fsm_stats().get(PhyStateKind::Reset), 1);
        let stats = h.phy.buffer_stats();
        assert_eq!((stats.overflows, stats.underflows), (0, 0));
        h
    }

    #[test]
    fn test_fast_receive_clock() {
        let h = drift(300.0);
        let stats = h.phy.buffer_stats();
        assert!(stats.removed > 0);
        assert_eq!(stats.inserted, 0);
    }

    #[test]
    fn test_slow_receive_clock() {
        let h = drift(-300.0);
        let stats = h.phy.buffer_stats();
        assert!(stats.inserted > 0);
        assert_eq!(stats.removed, 0);
    }

    #[test]
    fn test_transmit_reaches_partner() {
        let mut h = harness(PhyConfig::default());
        bring_up(&mut h);
        h.partner().take_transmitted();

        h.cmd.tx_data = 0x4abc;
        h.cmd.tx_datak = 0b01;
        h.run(16).unwrap();
        let sent = h.partner().take_transmitted();
        assert_eq!(sent.len(), 16);
        assert_eq!(h.partner().tx_drive().deemph, 1);

        let mut dec = Decoder::new(Encoding::Enc8b10b);
        for sample in sent {
            let TxSample::Word(word) = sample else {
                panic!("unexpected {sample:?}");
            };
            assert_eq!(word.len(), 20);
            let first = LineWord::from_msb_first(word.msb_first(0, 10), 10);
            let second = LineWord::from_msb_first(word.msb_first(10, 10), 10);
            assert_eq!(dec.decode(&first)[0], Symbol::control(k::COM));
            assert_eq!(dec.decode(&second)[0], Symbol::data(0x4a));
        }
    }

    #[test]
    fn test_inverted_pair() {
        let cfg = PhyConfig::default();
        let mut partner = PartnerConfig::new(cfg.pipe_version);
        partner.inverted = true;
        let mut h = Harness::new(&test_log(), cfg, partner).unwrap();
        h.cmd.rx_polarity = true;
        bring_up(&mut h);
        h.run(5000).unwrap();
        assert!(h.partner().rx_inverted());
        assert_eq!(h.phy.decode_error_counts(), (0, 0));
    }

    #[test]
    fn test_bit_errors_force_retraining() {
        let mut h = harness(PhyConfig::default());
        bring_up(&mut h);

        h.partner().set_chaos(Chaos::new(0.05).unwrap());
        h.run(20_000).unwrap();
        assert!(h.partner().bit_flips() > 0);
        assert!(h.phy.decode_error_counts().1 > 0);
        assert!(h.phy.fsm_stats().get(PhyStateKind::Reset) > 1);
        let fatal: u32 = h
            .phy
            .fault_counters()
            .iter()
            .filter(|c| c.fault != "codec_decode_error")
            .map(|c| c.total)
            .sum();
        assert!(fatal > 0);

        // A clean line trains again
        h.partner().set_chaos(Chaos::default());
        h.run(BRING_UP).unwrap();
        assert!(h.phy.is_ready());
    }

    #[test]
    fn test_usb3_low_power_and_wake() {
        let cfg = PhyConfig {
            pipe_version: PipeVersion::Usb3,
            ..Default::default()
        };
        let mut h = harness(cfg);
        assert_eq!(h.cmd.phy_mode, PipeVersion::Usb3.phy_mode());
        bring_up(&mut h);

        h.cmd.power_down = PowerState::P2
            .to_pipe(PipeVersion::Usb3)
            .unwrap();
        let entered = h
            .run_until(100, |phy, status| {
                phy.state() == PhyState::Idle(PowerState::P2)
                    && status.phy_status
            })
            .unwrap();
        assert!(entered);

        // The partner wakes us with LFPS, and we answer in kind
        h.partner().take_transmitted();
        h.partner().set_mode(PartnerMode::Lfps { on: 32, off: 96 });
        h.run(2000).unwrap();
        assert!(h.phy.wake_detected() > 0);
        assert_eq!(h.phy.state(), PhyState::Idle(PowerState::P2));
        assert!(h
            .partner()
            .take_transmitted()
            .contains(&TxSample::Level(true)));

        // Back to P0 retrains without a reset
        h.partner().set_mode(PartnerMode::Link);
        h.partner().retrain();
        h.cmd.power_down = 0;
        bring_up(&mut h);
        assert_eq!(h.phy.fsm_stats().get(PhyStateKind::Reset), 1);
    }

    #[test]
    fn test_missing_receiver() {
        let cfg = PhyConfig::default();
        let mut partner = PartnerConfig::new(cfg.pipe_version);
        partner.present = false;
        let mut h = Harness::new(&test_log(), cfg, partner).unwrap();
        h.run(2000).unwrap();
        assert_eq!(h.phy.state(), PhyState::Detect);

        h.partner().set_present(true);
        bring_up(&mut h);
        assert_eq!(h.phy.fsm_stats().get(PhyStateKind::Detect), 1);
    }
}
