// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Electrical idle and out-of-band signaling.

use std::collections::VecDeque;

use slog::{debug, o};

use sal::{RxSample, TxSample};

use crate::config::LfpsConfig;

/// A boolean that only changes after the raw input has held its new value
/// for `threshold` consecutive samples.
#[derive(Debug)]
pub struct Debounce {
    threshold: u32,
    state: bool,
    pending: u32,
}

impl Debounce {
    pub fn new(threshold: u32, initial: bool) -> Self {
        Debounce {
            threshold: threshold.max(1),
            state: initial,
            pending: 0,
        }
    }

    pub fn force(&mut self, state: bool) {
        self.state = state;
        self.pending = 0;
    }

    pub fn state(&self) -> bool {
        self.state
    }

    pub fn sample(&mut self, raw: bool) -> bool {
        if raw == self.state {
            self.pending = 0;
        } else {
            self.pending += 1;
            if self.pending >= self.threshold {
                self.state = raw;
                self.pending = 0;
            }
        }
        self.state
    }
}

/// Receive-side electrical idle.  The line is idle when the squelch
/// detector sees nothing or the recovered bits carry no transitions.
#[derive(Debug)]
pub struct IdleDetector {
    idle: Debounce,
}

impl IdleDetector {
    pub fn new(debounce: u32) -> Self {
        IdleDetector {
            idle: Debounce::new(debounce, true),
        }
    }

    pub fn reset(&mut self) {
        self.idle.force(true);
    }

    pub fn is_idle(&self) -> bool {
        self.idle.state()
    }

    /// Returns the debounced idle state after this sample.
    pub fn sample(&mut self, rx: &RxSample) -> bool {
        self.idle.sample(!rx.signal_detect || rx.bits.is_constant())
    }
}

/// Recognizes an LFPS wake: a number of bursts of squelch activity, each
/// of bounded length, arriving within a window.
pub struct WakeDetector {
    log: slog::Logger,
    cfg: LfpsConfig,
    now: u64,
    run: u32,
    bursts: VecDeque<u64>,
    wakes: u32,
}

impl WakeDetector {
    pub fn new(log: &slog::Logger, cfg: LfpsConfig) -> Self {
        WakeDetector {
            log: log.new(o!("unit" => "lfps")),
            cfg,
            now: 0,
            run: 0,
            bursts: VecDeque::new(),
            wakes: 0,
        }
    }

    pub fn reset(&mut self) {
        self.run = 0;
        self.bursts.clear();
    }

    /// Number of wakes recognized since the detector was created.
    pub fn wakes(&self) -> u32 {
        self.wakes
    }

    /// Feed one receive-cycle's squelch output.  Returns true on the cycle
    /// that completes a wake.
    pub fn sample(&mut self, active: bool) -> bool {
        self.now += 1;
        if active {
            self.run = self.run.saturating_add(1);
            return false;
        }
        let run = std::mem::take(&mut self.run);
        if run < self.cfg.burst_min || run > self.cfg.burst_max {
            return false;
        }

        let window = u64::from(self.cfg.window);
        while self
            .bursts
            .front()
            .is_some_and(|t| self.now - *t > window)
        {
            self.bursts.pop_front();
        }
        self.bursts.push_back(self.now);
        if self.bursts.len() < self.cfg.bursts as usize {
            return false;
        }
        self.bursts.clear();
        self.wakes += 1;
        debug!(self.log, "LFPS wake detected"; "wakes" => self.wakes);
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TxMode {
    Idle,
    Lfps { level: bool, count: u32 },
}

/// Transmit-side out-of-band signaling: electrical idle, or LFPS produced
/// by toggling the line level at the LFPS half period.
#[derive(Debug)]
pub struct TxSignaling {
    half_period: u32,
    mode: TxMode,
}

impl TxSignaling {
    pub fn new(half_period: u32) -> Self {
        TxSignaling {
            half_period: half_period.max(1),
            mode: TxMode::Idle,
        }
    }

    pub fn set_idle(&mut self) {
        self.mode = TxMode::Idle;
    }

    /// Begin LFPS.  Has no effect if LFPS is already running.
    pub fn start_lfps(&mut self) {
        if self.mode == TxMode::Idle {
            self.mode = TxMode::Lfps {
                level: true,
                count: 0,
            };
        }
    }

    pub fn is_lfps(&self) -> bool {
        matches!(self.mode, TxMode::Lfps { .. })
    }

    /// The sample to drive this core cycle.
    pub fn next_sample(&mut self) -> TxSample {
        match &mut self.mode {
            TxMode::Idle => TxSample::Idle,
            TxMode::Lfps { level, count } => {
                let out = TxSample::Level(*level);
                *count += 1;
                if *count >= self.half_period {
                    *count = 0;
                    *level = !*level;
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_log;
    use sal::LineWord;

    fn rx(signal_detect: bool, bits: u64) -> RxSample {
        RxSample {
            bits: LineWord::from_msb_first(bits, 10),
            signal_detect,
        }
    }

    #[test]
    fn test_idle_debounce() {
        let mut d = IdleDetector::new(4);
        assert!(d.is_idle());
        let active = rx(true, 0b0101010101);
        // A short glitch of activity is ignored
        for _ in 0..3 {
            assert!(d.sample(&active));
        }
        assert!(d.sample(&rx(false, 0)));
        for _ in 0..3 {
            d.sample(&active);
        }
        assert!(!d.sample(&active));

        // Constant bits with squelch open still count as idle
        for _ in 0..4 {
            d.sample(&rx(true, 0b1111111111));
        }
        assert!(d.is_idle());
    }

    fn burst(w: &mut WakeDetector, on: u32, off: u32) -> bool {
        let mut woke = false;
        for _ in 0..on {
            woke |= w.sample(true);
        }
        for _ in 0..off {
            woke |= w.sample(false);
        }
        woke
    }

    #[test]
    fn test_wake_detection() {
        let cfg = LfpsConfig::default();
        let mut w = WakeDetector::new(&test_log(), cfg);
        assert!(!burst(&mut w, 32, 100));
        assert!(burst(&mut w, 32, 100));
        assert_eq!(w.wakes(), 1);

        // Too short, too long
        assert!(!burst(&mut w, 2, 100));
        assert!(!burst(&mut w, 2000, 100));
        assert!(!burst(&mut w, 2, 100));
        assert_eq!(w.wakes(), 1);

        // Bursts spread out beyond the window don't combine
        w.reset();
        assert!(!burst(&mut w, 32, 5000));
        assert!(!burst(&mut w, 32, 5000));
        assert_eq!(w.wakes(), 1);
    }

    #[test]
    fn test_lfps_transmit() {
        let mut t = TxSignaling::new(2);
        assert_eq!(t.next_sample(), TxSample::Idle);
        t.start_lfps();
        let samples: Vec<TxSample> = (0..6).map(|_| t.next_sample()).collect();
        assert_eq!(
            samples,
            vec![
                TxSample::Level(true),
                TxSample::Level(true),
                TxSample::Level(false),
                TxSample::Level(false),
                TxSample::Level(true),
                TxSample::Level(true),
            ]
        );
        t.set_idle();
        assert!(!t.is_lfps());
        assert_eq!(t.next_sample(), TxSample::Idle);
    }
}
