// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The elastic buffer: the only path by which anything moves from the
//! recovered receive clock domain to the core clock domain.
//!
//! Symbols are written by the receive side and read by the core side through
//! free-running pointers into a power-of-two ring.  Drift between the two
//! clocks is absorbed on the read side by dropping or repeating filler
//! symbols, and only filler symbols, as they reach the head of the ring.
//! A write into a full ring and a read from an empty one are both reported
//! and latched until the buffer is flushed.
//!
//! The receive side also publishes a small snapshot of line status through
//! the buffer, so the core side never looks at receive-domain state
//! directly.

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use slog::{debug, o, trace};

use common::link::{Encoding, PipeVersion};

use crate::fault::LinkFault;
use crate::symbol;
use crate::symbol::Symbol;

/// PIPE `ElasticBufferMode`: where the buffer tries to keep its fill level.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    JsonSchema,
)]
pub enum BufferMode {
    #[default]
    HalfFull,
    NominalEmpty,
}

/// Line status published by the receive side.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LineStatus {
    pub locked: bool,
    pub electrical_idle: bool,
    /// Count of out-of-band wake sequences recognized
    pub wakes: u32,
}

/// What happened on the read side to produce a symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compensation {
    None,
    Added,
    Removed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferedSymbol {
    pub symbol: Symbol,
    pub compensation: Compensation,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    JsonSchema,
)]
pub struct ElasticStats {
    pub written: u64,
    pub read: u64,
    pub inserted: u64,
    pub removed: u64,
    pub overflows: u64,
    pub underflows: u64,
}

pub struct ElasticBuffer {
    log: slog::Logger,
    version: PipeVersion,
    encoding: Encoding,
    slots: Vec<Symbol>,
    mask: usize,
    wr: usize,
    rd: usize,
    mode: BufferMode,
    slack: usize,
    primed: bool,
    // Copies of the head filler still to be emitted
    repeat: usize,
    // The current head filler has already been repeated
    repeated: bool,
    fault: Option<LinkFault>,
    line: LineStatus,
    stats: ElasticStats,
}

impl ElasticBuffer {
    /// Create a buffer of `depth` slots.  `burst` is the most symbols the
    /// writer can add in one receive cycle.
    pub fn new(
        log: &slog::Logger,
        depth: usize,
        burst: usize,
        version: PipeVersion,
        encoding: Encoding,
    ) -> Self {
        let depth = depth.next_power_of_two();
        ElasticBuffer {
            log: log.new(o!("unit" => "elastic")),
            version,
            encoding,
            slots: vec![Symbol::control(0); depth],
            mask: depth - 1,
            wr: 0,
            rd: 0,
            mode: BufferMode::HalfFull,
            slack: (depth / 8).max(burst),
            primed: false,
            repeat: 0,
            repeated: false,
            fault: None,
            line: LineStatus::default(),
            stats: ElasticStats::default(),
        }
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn occupancy(&self) -> usize {
        self.wr.wrapping_sub(self.rd)
    }

    /// Fill level the read side steers toward.
    pub fn target(&self) -> usize {
        match self.mode {
            BufferMode::HalfFull => self.depth() / 2,
            BufferMode::NominalEmpty => 2 * self.slack,
        }
    }

    fn low_water(&self) -> usize {
        self.target().saturating_sub(self.slack)
    }

    fn high_water(&self) -> usize {
        self.target() + self.slack
    }

    // Fillers are added and removed in units that keep 128b/130b payload
    // aligned to the widest PIPE bus.
    fn unit(&self) -> usize {
        match self.encoding {
            Encoding::Enc8b10b => 1,
            Encoding::Enc128b130b => 4,
        }
    }

    fn is_filler(&self, sym: &Symbol) -> bool {
        sym.block.is_none()
            && *sym == symbol::filler(self.version, self.encoding)
    }

    /// Empty the buffer and start over, with `encoding` and `mode` for
    /// filler handling.  Any latched fault is cleared.
    pub fn flush(&mut self, encoding: Encoding, mode: BufferMode) {
        debug!(self.log, "flush";
            "occupancy" => self.occupancy(),
            "encoding" => %encoding);
        self.encoding = encoding;
        self.mode = mode;
        self.wr = 0;
        self.rd = 0;
        self.primed = false;
        self.repeat = 0;
        self.repeated = false;
        self.fault = None;
    }

    /// Receive side: add one symbol.  A write into a full buffer is dropped
    /// and latched as an overflow.
    pub fn write(&mut self, sym: Symbol) -> Result<(), LinkFault> {
        if self.occupancy() >= self.depth() {
            self.stats.overflows += 1;
            if self.fault.is_none() {
                debug!(self.log, "overflow"; "wr" => self.wr, "rd" => self.rd);
                self.fault = Some(LinkFault::BufferOverflow);
            }
            return Err(LinkFault::BufferOverflow);
        }
        self.slots[self.wr & self.mask] = sym;
        self.wr = self.wr.wrapping_add(1);
        self.stats.written += 1;
        Ok(())
    }

    /// Receive side: publish the current line status.
    pub fn publish(&mut self, line: LineStatus) {
        self.line = line;
    }

    /// Core side: the most recently published line status.
    pub fn line_status(&self) -> LineStatus {
        self.line
    }

    /// True once the buffer has filled to its target level since the last
    /// flush.  Reads return nothing until then.
    pub fn is_primed(&mut self) -> bool {
        if !self.primed && self.occupancy() >= self.target() {
            self.primed = true;
        }
        self.primed
    }

    /// Core side: the latched overflow or underflow, if any.
    pub fn fault(&self) -> Option<LinkFault> {
        self.fault
    }

    fn fillers_at_head(&self, count: usize) -> bool {
        count <= self.occupancy()
            && (0..count).all(|i| {
                self.is_filler(&self.slots[self.rd.wrapping_add(i) & self.mask])
            })
    }

    /// Core side: take one symbol.  Returns `None` while the buffer is
    /// priming, and on underflow.
    pub fn read(&mut self) -> Option<BufferedSymbol> {
        if !self.is_primed() {
            return None;
        }

        if self.repeat > 0 {
            self.repeat -= 1;
            self.stats.read += 1;
            return Some(BufferedSymbol {
                symbol: symbol::filler(self.version, self.encoding),
                compensation: Compensation::Added,
            });
        }

        let unit = self.unit();
        let mut compensation = Compensation::None;
        if self.occupancy() > self.high_water()
            && self.fillers_at_head(unit + 1)
        {
            self.rd = self.rd.wrapping_add(unit);
            self.stats.removed += unit as u64;
            self.repeated = false;
            compensation = Compensation::Removed;
            trace!(self.log, "filler removed"; "occupancy" => self.occupancy());
        }

        if self.occupancy() == 0 {
            self.stats.underflows += 1;
            if self.fault.is_none() {
                debug!(self.log, "underflow"; "wr" => self.wr, "rd" => self.rd);
                self.fault = Some(LinkFault::BufferUnderflow);
            }
            return None;
        }

        let head = self.slots[self.rd & self.mask];
        if compensation == Compensation::None
            && !self.repeated
            && self.occupancy() < self.low_water()
            && self.is_filler(&head)
        {
            // Emit the head filler now and `unit - 1` more copies before
            // moving on; the original is still consumed afterwards.
            self.repeated = true;
            self.repeat = unit - 1;
            self.stats.inserted += unit as u64;
            self.stats.read += 1;
            trace!(self.log, "filler inserted";
                "occupancy" => self.occupancy());
            return Some(BufferedSymbol {
                symbol: head,
                compensation: Compensation::Added,
            });
        }

        self.rd = self.rd.wrapping_add(1);
        self.repeated = false;
        self.stats.read += 1;
        Some(BufferedSymbol {
            symbol: head,
            compensation,
        })
    }

    pub fn stats(&self) -> ElasticStats {
        self.stats
    }
}
