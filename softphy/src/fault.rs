// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::config::LimitConfig;
use crate::symbol::SymbolError;

/// Structural failures of the link.  Every one of these is resolved by the
/// controller with a full TRANSITION -> RESET cycle, never by a local fix.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    JsonSchema,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LinkFault {
    AlignmentLost,
    CodecDecodeError,
    BufferOverflow,
    BufferUnderflow,
    ScramblerDesync,
    CommandTimeout,
}

impl LinkFault {
    /// Isolated decode errors are reported per symbol and do not bring the
    /// link down.  Everything else does.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LinkFault::CodecDecodeError)
    }
}

impl fmt::Display for LinkFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s: &'static str = self.into();
        write!(f, "{s}")
    }
}

/// A Limiter is used to detect when an event's frequency exceeds some limit.
/// The limit is the number of times an event may occur within a span of
/// cycles.
struct Limiter {
    event_name: String,           // the event being tracked
    event_limit: usize,           // maximum number of events allowed
    window: u64,                  // cycles over which the count is limited
    timestamps: Vec<Option<u64>>, // ring buffer of event timestamps
    cursor: usize,                // index into the ring buffer
}

impl Limiter {
    pub fn new(event_name: impl ToString, cfg: &LimitConfig) -> Self {
        let event_limit = cfg.limit.max(1);
        Limiter {
            event_name: event_name.to_string(),
            event_limit,
            window: cfg.window,
            timestamps: vec![None; event_limit],
            cursor: 0,
        }
    }

    /// Clear the ring buffer
    pub fn reset(&mut self) {
        self.timestamps = vec![None; self.event_limit];
        self.cursor = 0;
    }

    /// Record an event at cycle `now`.  Returns an error if this event
    /// exceeds the number of allowed events within the defined window.
    pub fn record_event(&mut self, now: u64) -> Result<(), String> {
        let oldest = self.timestamps[self.cursor];
        self.timestamps[self.cursor] = Some(now);
        self.cursor = (self.cursor + 1) % self.event_limit;

        match oldest {
            Some(oldest) => match now.saturating_sub(oldest) {
                elapsed if elapsed < self.window => Err(format!(
                    "{} {} in {} cycles",
                    self.event_limit + 1,
                    self.event_name,
                    elapsed
                )),
                _ => Ok(()),
            },
            None => Ok(()),
        }
    }
}

/// A Fault is the verdict of a tracker that some class of event is
/// arriving too quickly to be noise.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Fault {
    /// The link keeps failing and re-training
    Flapping(String),
    /// Decode errors are sustained, so the descrambler is out of step with
    /// the peer's scrambler
    Desync(String),
}

/// The Faultable trait is implemented by structures that watch a stream of
/// events and decide when that stream indicates a failure.
///
/// "Current" counts cover the events since the link last trained; "total"
/// counts cover the life of the engine.
pub trait Faultable<E> {
    /// An event has occurred at cycle `now`
    fn process_event(&mut self, event: &E, now: u64) -> Option<Fault>;
    /// Reset the counters for the current incarnation of the link.
    fn reset(&mut self);
    /// Reset the current and historical counters.
    fn reset_all(&mut self);
}

/// Watches the per-symbol decode errors leaving the descrambler.  A burst
/// of them means the two scramblers have lost step.
pub struct DesyncMonitor {
    current: u64,
    total: u64,
    limiter: Limiter,
}

// The limiter's ring buffer is noise in Debug output.
impl fmt::Debug for DesyncMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DesyncMonitor(current: {} total: {})",
            self.current, self.total
        )
    }
}

impl DesyncMonitor {
    pub fn new(cfg: &LimitConfig) -> Self {
        DesyncMonitor {
            current: 0,
            total: 0,
            limiter: Limiter::new("decode errors", cfg),
        }
    }

    pub fn get_counters(&self) -> (u64, u64) {
        (self.current, self.total)
    }
}

impl Faultable<SymbolError> for DesyncMonitor {
    fn process_event(
        &mut self,
        _event: &SymbolError,
        now: u64,
    ) -> Option<Fault> {
        self.current += 1;
        self.total += 1;
        self.limiter.record_event(now).err().map(Fault::Desync)
    }

    fn reset(&mut self) {
        self.current = 0;
        self.limiter.reset();
    }

    fn reset_all(&mut self) {
        self.current = 0;
        self.total = 0;
        self.limiter.reset();
    }
}

/// Per-fault counters, suitable for exporting as JSON.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct FaultCounter {
    pub fault: String,
    pub current: u32,
    pub total: u32,
}

/// Counts each class of link fault.  Fatal faults also feed a limiter
/// which flags a link that cannot stay up.
pub struct FaultTracker {
    current: BTreeMap<LinkFault, u32>,
    total: BTreeMap<LinkFault, u32>,
    limiter: Limiter,
}

impl fmt::Debug for FaultTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FaultTracker(current: {:?} total: {:?})",
            self.current, self.total
        )
    }
}

impl FaultTracker {
    pub fn new(cfg: &LimitConfig) -> Self {
        FaultTracker {
            current: BTreeMap::new(),
            total: BTreeMap::new(),
            limiter: Limiter::new("link faults", cfg),
        }
    }

    pub fn get(&self, fault: LinkFault) -> (u32, u32) {
        (
            self.current.get(&fault).copied().unwrap_or(0),
            self.total.get(&fault).copied().unwrap_or(0),
        )
    }

    /// Only faults that have been seen at least once are listed.
    pub fn get_counters(&self) -> Vec<FaultCounter> {
        self.total
            .keys()
            .map(|fault| {
                let (current, total) = self.get(*fault);
                FaultCounter {
                    fault: fault.to_string(),
                    current,
                    total,
                }
            })
            .collect()
    }
}

impl Faultable<LinkFault> for FaultTracker {
    fn process_event(&mut self, event: &LinkFault, now: u64) -> Option<Fault> {
        for map in [&mut self.current, &mut self.total] {
            map.entry(*event)
                .and_modify(|count| *count += 1)
                .or_insert(1);
        }
        match event.is_fatal() {
            true => self.limiter.record_event(now).err().map(Fault::Flapping),
            false => None,
        }
    }

    fn reset(&mut self) {
        self.current.clear();
        self.limiter.reset();
    }

    fn reset_all(&mut self) {
        self.current.clear();
        self.total.clear();
        self.limiter.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    fn limit(limit: usize, window: u64) -> LimitConfig {
        LimitConfig { limit, window }
    }

    #[test]
    fn test_limiter() {
        let mut l = Limiter::new("events", &limit(3, 100));
        assert!(l.record_event(0).is_ok());
        assert!(l.record_event(10).is_ok());
        assert!(l.record_event(20).is_ok());
        // Fourth event within 100 cycles of the first
        assert_eq!(
            l.record_event(30),
            Err("4 events in 30 cycles".to_string())
        );
        // Oldest tracked event is now at 10
        assert!(l.record_event(200).is_ok());
        l.reset();
        assert!(l.record_event(201).is_ok());
    }

    #[test]
    fn test_desync_monitor() {
        let mut m = DesyncMonitor::new(&limit(4, 16));
        // Sparse errors are tolerated indefinitely
        for i in 0..100 {
            assert_eq!(
                m.process_event(&SymbolError::CodeViolation, i * 16),
                None
            );
        }
        let fault = (0..5)
            .filter_map(|i| {
                m.process_event(&SymbolError::Disparity, 10_000 + i)
            })
            .next();
        assert!(matches!(fault, Some(Fault::Desync(_))));
        m.reset();
        assert_eq!(m.get_counters(), (0, 105));
        m.reset_all();
        assert_eq!(m.get_counters(), (0, 0));
    }

    #[test]
    fn test_fault_tracker() {
        let mut t = FaultTracker::new(&limit(2, 1000));
        assert_eq!(t.process_event(&LinkFault::CodecDecodeError, 0), None);
        assert_eq!(t.process_event(&LinkFault::BufferOverflow, 1), None);
        assert_eq!(t.process_event(&LinkFault::BufferOverflow, 2), None);
        assert!(matches!(
            t.process_event(&LinkFault::AlignmentLost, 3),
            Some(Fault::Flapping(_))
        ));
        assert_eq!(t.get(LinkFault::BufferOverflow), (2, 2));

        t.reset();
        assert_eq!(t.get(LinkFault::BufferOverflow), (0, 2));
        let counters = t.get_counters();
        assert_eq!(counters.len(), 3);
        assert_eq!(
            counters[0],
            FaultCounter {
                fault: "alignment_lost".to_string(),
                current: 0,
                total: 1,
            }
        );
    }

    #[test]
    fn test_fault_names() {
        let names: Vec<String> =
            LinkFault::iter().map(|f| f.to_string()).collect();
        assert_eq!(
            names,
            vec![
                "alignment_lost",
                "codec_decode_error",
                "buffer_overflow",
                "buffer_underflow",
                "scrambler_desync",
                "command_timeout",
            ]
        );
        assert!(LinkFault::iter()
            .filter(|f| !f.is_fatal())
            .eq([LinkFault::CodecDecodeError]));
    }
}
