// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Word and block alignment of the raw recovered bit stream.
//!
//! The aligner searches for a boundary marker (a comma for 8b/10b, a
//! recognizable ordered-set block for 128b/130b), then carves aligned line
//! words out of the stream at that offset.  Markers seen at the boundary
//! raise a confidence counter; words that cannot be legal at the boundary
//! lower it by one.  Lock is declared when confidence reaches the threshold
//! and lost when it decays to zero or no marker is seen for too long.

use std::collections::VecDeque;

use slog::{debug, o, trace};

use common::link::Encoding;
use sal::LineWord;

use crate::codec::enc128b130b;
use crate::codec::enc8b10b;
use crate::config::AlignerConfig;
use crate::symbol::os;
use crate::symbol::SyncHeader;

const COMMA_BITS: usize = 7;

/// What a word at the current boundary says about the boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Evidence {
    Marker,
    Neutral,
    Miss,
}

/// Snapshot of the aligner's state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AlignmentState {
    pub aligned: bool,
    pub locked: bool,
    pub confidence: u32,
}

pub struct Aligner {
    log: slog::Logger,
    cfg: AlignerConfig,
    encoding: Encoding,
    bits: VecDeque<bool>,
    aligned: bool,
    locked: bool,
    confidence: u32,
    since_marker: u32,
    locks: u64,
    losses: u64,
}

impl Aligner {
    pub fn new(
        log: &slog::Logger,
        cfg: AlignerConfig,
        encoding: Encoding,
    ) -> Self {
        Aligner {
            log: log.new(o!("unit" => "aligner")),
            cfg,
            encoding,
            bits: VecDeque::with_capacity(4 * enc128b130b::BLOCK_BITS),
            aligned: false,
            locked: false,
            confidence: 0,
            since_marker: 0,
            locks: 0,
            losses: 0,
        }
    }

    /// Drop all alignment state and search again, using `encoding`.
    pub fn reset(&mut self, encoding: Encoding) {
        self.encoding = encoding;
        self.bits.clear();
        self.unalign();
    }

    fn unalign(&mut self) {
        self.aligned = false;
        self.locked = false;
        self.confidence = 0;
        self.since_marker = 0;
    }

    fn lose_alignment(&mut self, reason: &str) {
        if self.locked {
            self.losses += 1;
            debug!(self.log, "alignment lost"; "reason" => reason);
        }
        self.unalign();
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn state(&self) -> AlignmentState {
        AlignmentState {
            aligned: self.aligned,
            locked: self.locked,
            confidence: self.confidence,
        }
    }

    /// Number of times lock has been acquired and lost.
    pub fn lock_counts(&self) -> (u64, u64) {
        (self.locks, self.losses)
    }

    /// Add freshly received bits to the search window.
    pub fn push(&mut self, word: &LineWord) {
        self.bits.extend(word.iter());
    }

    fn window(&self, start: usize, len: usize) -> LineWord {
        LineWord::from_bits(self.bits.range(start..start + len).copied())
    }

    fn evidence(&self, word: &LineWord) -> Evidence {
        match self.encoding {
            Encoding::Enc8b10b => {
                match enc8b10b::classify(word.msb_first(0, 10) as u16) {
                    enc8b10b::CodeClass::Comma => Evidence::Marker,
                    enc8b10b::CodeClass::Valid => Evidence::Neutral,
                    enc8b10b::CodeClass::Invalid => Evidence::Miss,
                }
            }
            Encoding::Enc128b130b => match enc128b130b::sync_header(word, 0) {
                None => Evidence::Miss,
                Some(SyncHeader::OrderedSet)
                    if os::MARKERS
                        .contains(&enc128b130b::first_byte(word, 0)) =>
                {
                    Evidence::Marker
                }
                Some(_) => Evidence::Neutral,
            },
        }
    }

    // Discard bits until a marker sits at the front of the window.  Returns
    // false if more bits are needed.
    fn search(&mut self) -> bool {
        match self.encoding {
            Encoding::Enc8b10b => {
                let n = self.bits.len();
                let found = (0..=n.saturating_sub(COMMA_BITS)).find(|&p| {
                    n >= p + COMMA_BITS
                        && enc8b10b::is_comma(
                            self.window(p, COMMA_BITS).msb_first(0, COMMA_BITS)
                                as u16,
                        )
                });
                match found {
                    Some(p) => {
                        self.bits.drain(..p);
                        true
                    }
                    None => {
                        let keep = (COMMA_BITS - 1).min(n);
                        self.bits.drain(..n - keep);
                        false
                    }
                }
            }
            Encoding::Enc128b130b => {
                let len = enc128b130b::BLOCK_BITS;
                while self.bits.len() >= len {
                    let candidate = self.window(0, len);
                    if self.evidence(&candidate) == Evidence::Marker {
                        return true;
                    }
                    self.bits.pop_front();
                }
                false
            }
        }
    }

    /// Extract the next aligned word, if enough bits have arrived.  Words
    /// are only produced while a boundary hypothesis is held.
    pub fn next_word(&mut self) -> Option<LineWord> {
        let len = self.encoding.line_bits();
        if !self.aligned {
            if !self.search() {
                return None;
            }
            self.aligned = true;
            self.confidence = 0;
            self.since_marker = 0;
            trace!(self.log, "boundary candidate found");
        }
        if self.bits.len() < len {
            return None;
        }

        let word = LineWord::from_bits(self.bits.drain(..len));
        match self.evidence(&word) {
            Evidence::Marker => {
                self.since_marker = 0;
                self.confidence =
                    (self.confidence + 1).min(self.cfg.max_confidence);
                if !self.locked && self.confidence >= self.cfg.lock_threshold
                {
                    self.locked = true;
                    self.locks += 1;
                    debug!(self.log, "alignment locked";
                        "encoding" => %self.encoding);
                }
            }
            Evidence::Miss => {
                self.since_marker += 1;
                self.confidence = self.confidence.saturating_sub(1);
                trace!(self.log, "alignment miss";
                    "confidence" => self.confidence);
                if self.confidence == 0 {
                    self.lose_alignment("confidence exhausted");
                }
            }
            Evidence::Neutral => {
                self.since_marker += 1;
            }
        }
        if self.aligned && self.since_marker > self.cfg.comma_timeout {
            self.lose_alignment("no marker seen");
        }
        Some(word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Encoder;
    use crate::symbol::k;
    use crate::symbol::Symbol;
    use crate::test_log;

    fn aligner(encoding: Encoding) -> Aligner {
        Aligner::new(&test_log(), AlignerConfig::default(), encoding)
    }

    // A stream of training sets: a comma followed by fifteen data symbols.
    fn training_bits(sets: usize, corrupt: &[usize]) -> Vec<bool> {
        let mut enc = Encoder::new(Encoding::Enc8b10b);
        let mut bits = Vec::new();
        for set in 0..sets {
            for i in 0..16 {
                let sym = match i {
                    0 => Symbol::control(k::COM),
                    _ => Symbol::data(0x4a),
                };
                let word = match enc.encode(&sym, false) {
                    Some(_) if i == 0 && corrupt.contains(&set) => {
                        LineWord::from_msb_first(0b1111111111, 10)
                    }
                    Some(w) => w,
                    None => continue,
                };
                bits.extend(word.iter());
            }
        }
        bits
    }

    fn feed(aligner: &mut Aligner, bits: &[bool], chunk: usize) -> Vec<u32> {
        let mut confidence = Vec::new();
        for c in bits.chunks(chunk) {
            aligner.push(&LineWord::from_bits(c.iter().copied()));
            while aligner.next_word().is_some() {
                confidence.push(aligner.state().confidence);
            }
        }
        confidence
    }

    #[test]
    fn test_lock_from_offset() {
        let mut a = aligner(Encoding::Enc8b10b);
        let mut bits = vec![true, false, true];
        bits.extend(training_bits(8, &[]));
        feed(&mut a, &bits, 10);
        assert!(a.is_locked());
        assert_eq!(a.state().confidence, 8);
        assert_eq!(a.lock_counts(), (1, 0));
    }

    #[test]
    fn test_single_corrupt_comma_keeps_lock() {
        let mut a = aligner(Encoding::Enc8b10b);
        let confidence = feed(&mut a, &training_bits(100, &[50]), 10);
        assert!(a.is_locked());
        let min_after_lock = confidence[16 * 10..].iter().min().copied();
        assert_eq!(min_after_lock, Some(7));
        assert_eq!(a.lock_counts(), (1, 0));
    }

    #[test]
    fn test_lock_lost_on_sustained_errors() {
        let mut a = aligner(Encoding::Enc8b10b);
        feed(&mut a, &training_bits(10, &[]), 10);
        assert!(a.is_locked());
        let garbage = LineWord::from_msb_first(0b1111111111, 10);
        for _ in 0..8 {
            a.push(&garbage);
            a.next_word();
        }
        assert!(!a.is_locked());
        assert_eq!(a.lock_counts(), (1, 1));
    }

    #[test]
    fn test_comma_timeout() {
        let cfg = AlignerConfig {
            comma_timeout: 32,
            ..Default::default()
        };
        let mut a = Aligner::new(&test_log(), cfg, Encoding::Enc8b10b);
        feed(&mut a, &training_bits(6, &[]), 10);
        assert!(a.is_locked());
        // D10.2 on its own never forms a comma
        let filler = LineWord::from_msb_first(0b0101010101, 10);
        for _ in 0..33 {
            a.push(&filler);
            a.next_word();
        }
        assert!(!a.is_locked());
    }

    #[test]
    fn test_block_lock() {
        let mut enc = Encoder::new(Encoding::Enc128b130b);
        let mut bits = vec![false; 37];
        for _ in 0..6 {
            for i in 0..16 {
                let sym = match i {
                    0 => Symbol::control(os::TS1)
                        .starting(SyncHeader::OrderedSet),
                    _ => Symbol::control(0x4a),
                };
                if let Some(w) = enc.encode(&sym, false) {
                    bits.extend(w.iter());
                }
            }
        }
        let mut a = Aligner::new(
            &test_log(),
            AlignerConfig::default(),
            Encoding::Enc128b130b,
        );
        feed(&mut a, &bits, 130);
        assert!(a.is_locked());

        a.reset(Encoding::Enc8b10b);
        assert_eq!(a.state(), AlignmentState::default());
    }
}
