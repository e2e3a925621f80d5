// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The rate and power-state controller.
//!
//! The controller is the only owner of the `LinkConfig`.  Each core cycle it
//! looks at what the MAC is asking for and what the datapath reports, picks
//! at most one event, and runs it through `transition()`.  Entering a state
//! produces a list of `Directive`s, which the engine applies to the
//! components and the transceiver before anything else happens that cycle.

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::Serialize;
use slog::{debug, error, info, o, warn};
use strum::EnumDiscriminants;

use common::link::{Encoding, PowerState, Rate};

use crate::config::PhyConfig;
use crate::elastic::BufferMode;
use crate::fault::{
    DesyncMonitor, Fault, FaultCounter, FaultTracker, Faultable, LinkFault,
};
use crate::pipe::MacRequest;
use crate::symbol::SymbolError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumDiscriminants)]
#[strum_discriminants(
    name(PhyStateKind),
    derive(Hash, PartialOrd, Ord, strum::EnumIter, strum::IntoStaticStr),
    strum(serialize_all = "snake_case")
)]
pub enum PhyState {
    Reset,
    Detect,
    Align,
    Configure(Rate),
    Active(Rate),
    Idle(PowerState),
    Transition,
}

impl PhyState {
    pub fn kind(&self) -> PhyStateKind {
        self.into()
    }

    /// True in the states that wait on an external condition, and so carry
    /// a timeout.
    fn is_waiting(&self) -> bool {
        matches!(
            self,
            PhyState::Reset
                | PhyState::Detect
                | PhyState::Align
                | PhyState::Configure(_)
        )
    }
}

impl fmt::Display for PhyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name: &'static str = self.kind().into();
        match self {
            PhyState::Configure(r) | PhyState::Active(r) => {
                write!(f, "{name}({r})")
            }
            PhyState::Idle(p) => write!(f, "{name}({p})"),
            _ => write!(f, "{name}"),
        }
    }
}

impl fmt::Display for PhyStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name: &'static str = self.into();
        write!(f, "{name}")
    }
}

/// Everything that can move the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhyEvent {
    ResetAsserted,
    SerdesReady,
    ReceiverPresent,
    Locked,
    ComponentsReady,
    PowerCommand(PowerState),
    RateCommand(Rate),
    Fatal(LinkFault),
    Timeout,
    Settled,
}

/// The transition table.  `rate` is the rate currently configured, which
/// is the rate the link trains at when leaving ALIGN or IDLE.  Returns
/// `None` when the event does not move the machine.
pub fn transition(
    state: PhyState,
    event: &PhyEvent,
    rate: Rate,
) -> Option<PhyState> {
    use PhyEvent as E;
    use PhyState as S;

    match (state, *event) {
        (S::Reset, E::ResetAsserted) => None,
        (_, E::ResetAsserted) => Some(S::Reset),

        (S::Reset, E::SerdesReady) => Some(S::Detect),
        (S::Detect, E::ReceiverPresent) => Some(S::Align),
        (S::Align, E::Locked) => Some(S::Configure(rate)),
        (S::Configure(r), E::ComponentsReady) => Some(S::Active(r)),

        (S::Active(_), E::PowerCommand(PowerState::P0)) => None,
        (S::Active(_), E::PowerCommand(p)) => Some(S::Idle(p)),
        (S::Idle(_), E::PowerCommand(PowerState::P0)) => {
            Some(S::Configure(rate))
        }
        (S::Idle(a), E::PowerCommand(b)) if a != b => Some(S::Idle(b)),

        // A rate change always goes through a full reset.  Asking for the
        // rate already in use is a no-op.
        (S::Reset | S::Transition, E::RateCommand(_)) => None,
        (_, E::RateCommand(r)) if r == rate => None,
        (_, E::RateCommand(_)) => Some(S::Transition),

        (S::Reset | S::Transition, E::Fatal(_)) => None,
        (_, E::Fatal(_)) => Some(S::Transition),
        (s, E::Timeout) if s.is_waiting() => Some(S::Transition),

        (S::Transition, E::Settled) => Some(S::Reset),

        _ => None,
    }
}

/// The view of the link shared with the rest of the engine.  Only the
/// controller writes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, JsonSchema)]
pub struct LinkConfig {
    pub rate: Rate,
    pub power: PowerState,
    pub encoding: Encoding,
    /// Bumped whenever the receive path must discard everything it holds
    /// and start over.
    pub generation: u64,
    /// The receive path may write into the elastic buffer
    pub rx_enabled: bool,
    /// The aligner may search for lock
    pub align_enabled: bool,
    pub buffer_mode: BufferMode,
    pub rx_polarity: bool,
    pub rx_termination: bool,
}

/// Actions the controller needs carried out on its behalf.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Directive {
    /// Program the transceiver for the configured rate and encoding
    ConfigureSerdes,
    ResetSerdes,
    DetectReceiver,
    FlushBuffer,
    ReseedScramblers,
    StopScramblers,
    ResetTxCodec,
    SetRxPolarity(bool),
}

/// What the controller sees of the rest of the engine in one core cycle.
#[derive(Debug)]
pub struct Observations<'a> {
    pub request: &'a MacRequest,
    pub serdes_ready: bool,
    /// Outcome of a receiver detection sequence that finished this cycle
    pub receiver: Option<bool>,
    pub locked: bool,
    pub line_idle: bool,
    pub buffer_primed: bool,
    pub buffer_fault: Option<LinkFault>,
    /// Decode errors leaving the descrambler this cycle
    pub decode_errors: &'a [SymbolError],
}

/// Signals the controller drives toward the MAC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControllerStatus {
    pub phy_status: bool,
    /// A MAC-requested receiver detection just found a receiver
    pub receiver_detected: bool,
}

/// Counts entries into each state.
#[derive(Clone, Debug, Default)]
pub struct FsmStats(BTreeMap<PhyStateKind, u32>);

impl FsmStats {
    /// Return an empty set of counters
    pub fn new() -> Self {
        FsmStats(BTreeMap::new())
    }

    /// Returns the counter for a single state.
    pub fn get(&self, state: PhyStateKind) -> u32 {
        *self.0.get(&state).unwrap_or(&0)
    }

    /// Increases the counter for a single state by 1.
    pub fn bump(&mut self, state: PhyStateKind) {
        self.0
            .entry(state)
            .and_modify(|count| *count += 1)
            .or_insert(1);
    }

    /// Returns the states that have been entered at least once.
    pub fn states(&self) -> Vec<PhyStateKind> {
        self.0.keys().cloned().collect()
    }
}

pub struct Controller {
    log: slog::Logger,
    cfg: PhyConfig,
    state: PhyState,
    link: LinkConfig,
    // Rate requested by the MAC, applied at the next RESET
    latched_rate: Rate,
    now: u64,
    cycles_in_state: u32,
    since_serdes_reset: u32,
    unlocked_cycles: u32,
    detect_pending: bool,
    phy_status_pulse: bool,
    receiver_detected: bool,
    directives: Vec<Directive>,
    fsm: FsmStats,
    tracker: FaultTracker,
    desync: DesyncMonitor,
    fault: Option<Fault>,
}

impl Controller {
    /// Create a controller in RESET.  The directives that enter RESET are
    /// returned by the first call to `take_directives()`.
    pub fn new(log: &slog::Logger, cfg: &PhyConfig) -> Self {
        let rate = cfg.lowest_rate();
        let mut c = Controller {
            log: log.new(o!("unit" => "controller")),
            cfg: cfg.clone(),
            state: PhyState::Reset,
            link: LinkConfig {
                rate,
                power: PowerState::P0,
                encoding: cfg.codec_for(rate),
                generation: 0,
                rx_enabled: false,
                align_enabled: false,
                buffer_mode: BufferMode::default(),
                rx_polarity: false,
                rx_termination: true,
            },
            latched_rate: rate,
            now: 0,
            cycles_in_state: 0,
            since_serdes_reset: 0,
            unlocked_cycles: 0,
            detect_pending: false,
            phy_status_pulse: false,
            receiver_detected: false,
            directives: Vec::new(),
            fsm: FsmStats::new(),
            tracker: FaultTracker::new(&cfg.flap),
            desync: DesyncMonitor::new(&cfg.desync),
            fault: None,
        };
        c.enter(PhyState::Reset, None);
        c
    }

    pub fn state(&self) -> PhyState {
        self.state
    }

    pub fn link_config(&self) -> &LinkConfig {
        &self.link
    }

    pub fn fsm_stats(&self) -> &FsmStats {
        &self.fsm
    }

    pub fn fault_counters(&self) -> Vec<FaultCounter> {
        self.tracker.get_counters()
    }

    /// Decode errors seen since the link last trained, and in total.
    pub fn decode_error_counts(&self) -> (u64, u64) {
        self.desync.get_counters()
    }

    /// The most recent verdict that the link is unhealthy, if any.
    pub fn link_fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }

    pub fn clear_faults(&mut self) {
        self.tracker.reset();
        self.desync.reset();
        self.fault = None;
    }

    pub fn take_directives(&mut self) -> Vec<Directive> {
        std::mem::take(&mut self.directives)
    }

    /// True when the MAC may use the receive data bus.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, PhyState::Active(_))
    }

    /// The controller's contribution to the PIPE status signals.  PhyStatus
    /// is held high while the link is not usable, and pulsed for one cycle
    /// to complete a power-state change or a receiver detection.
    pub fn status(&self) -> ControllerStatus {
        let busy = matches!(
            self.state,
            PhyState::Reset
                | PhyState::Detect
                | PhyState::Align
                | PhyState::Configure(_)
                | PhyState::Transition
        );
        ControllerStatus {
            phy_status: busy || self.phy_status_pulse,
            receiver_detected: self.receiver_detected,
        }
    }

    /// Advance one core cycle.  Returns the directives to apply before the
    /// rest of the cycle proceeds.
    pub fn step(&mut self, obs: &Observations) -> Vec<Directive> {
        self.now += 1;
        self.cycles_in_state = self.cycles_in_state.saturating_add(1);
        self.phy_status_pulse = false;
        self.receiver_detected = false;

        self.track_inputs(obs);
        if let Some(event) = self.select_event(obs) {
            if let Some(next) = transition(self.state, &event, self.link.rate)
            {
                self.enter(next, Some(event));
            }
        }
        self.take_directives()
    }

    // Bookkeeping that happens every cycle regardless of state.
    fn track_inputs(&mut self, obs: &Observations) {
        let req = obs.request;

        if req.rx_polarity != self.link.rx_polarity {
            self.link.rx_polarity = req.rx_polarity;
            self.directives.push(Directive::SetRxPolarity(req.rx_polarity));
        }
        self.link.rx_termination = req.rx_termination;

        if matches!(self.state, PhyState::Reset | PhyState::Transition) {
            self.latched_rate = req.rate;
            if req.reset {
                self.link.buffer_mode = req.buffer_mode;
            }
        }

        // Receiver detection on request from the MAC, in a low-power state
        if let PhyState::Idle(p) = self.state {
            if req.detect_receiver
                && p != PowerState::P0s
                && !self.detect_pending
            {
                self.detect_pending = true;
                self.directives.push(Directive::DetectReceiver);
            }
            if let (true, Some(present)) = (self.detect_pending, obs.receiver)
            {
                self.detect_pending = false;
                self.phy_status_pulse = true;
                self.receiver_detected = present;
                debug!(self.log, "receiver detection complete";
                    "present" => present);
            }
        }

        if matches!(self.state, PhyState::Configure(_) | PhyState::Active(_))
            && !obs.locked
            && !obs.line_idle
        {
            self.unlocked_cycles = self.unlocked_cycles.saturating_add(1);
        } else {
            self.unlocked_cycles = 0;
        }
    }

    fn record(&mut self, fault: LinkFault) {
        if let Some(f) = self.tracker.process_event(&fault, self.now) {
            error!(self.log, "link is unstable"; "fault" => ?f);
            self.fault = Some(f);
        }
    }

    // Pick the single event this cycle, in priority order: reset, fatal
    // faults, rate change, power change, progress, timeout.
    fn select_event(&mut self, obs: &Observations) -> Option<PhyEvent> {
        let req = obs.request;
        if req.reset {
            if self.state == PhyState::Reset {
                self.cycles_in_state = 0;
            }
            return Some(PhyEvent::ResetAsserted);
        }

        if let Some(fault) = self.fatal_fault(obs) {
            self.record(fault);
            return Some(PhyEvent::Fatal(fault));
        }

        match self.state {
            PhyState::Reset | PhyState::Transition => {}
            _ if req.rate != self.link.rate => {
                self.latched_rate = req.rate;
                return Some(PhyEvent::RateCommand(req.rate));
            }
            _ => {}
        }

        if matches!(self.state, PhyState::Active(_) | PhyState::Idle(_))
            && req.power != self.link.power
        {
            return Some(PhyEvent::PowerCommand(req.power));
        }

        let progress = match self.state {
            PhyState::Reset => self.serdes_progress(obs),
            PhyState::Detect => match obs.receiver {
                Some(true) => Some(PhyEvent::ReceiverPresent),
                Some(false) => {
                    self.directives.push(Directive::DetectReceiver);
                    None
                }
                None => None,
            },
            PhyState::Align if obs.locked => Some(PhyEvent::Locked),
            PhyState::Configure(_) if obs.locked && obs.buffer_primed => {
                Some(PhyEvent::ComponentsReady)
            }
            PhyState::Transition
                if self.cycles_in_state >= self.cfg.timeouts.transition =>
            {
                Some(PhyEvent::Settled)
            }
            _ => None,
        };
        if progress.is_some() {
            return progress;
        }

        if self.state.is_waiting() && self.cycles_in_state > self.timeout() {
            warn!(self.log, "timed out waiting";
                "state" => %self.state, "cycles" => self.cycles_in_state);
            self.record(LinkFault::CommandTimeout);
            return Some(PhyEvent::Timeout);
        }
        None
    }

    // Faults only matter while the link is carrying, or about to carry,
    // data.  Decode errors are counted in every state.
    fn fatal_fault(&mut self, obs: &Observations) -> Option<LinkFault> {
        let mut desync = false;
        for err in obs.decode_errors {
            self.tracker
                .process_event(&LinkFault::CodecDecodeError, self.now);
            if let Some(f) = self.desync.process_event(err, self.now) {
                debug!(self.log, "descrambler out of step"; "fault" => ?f);
                desync = true;
            }
        }

        if !matches!(self.state, PhyState::Configure(_) | PhyState::Active(_))
        {
            return None;
        }
        if let Some(fault) = obs.buffer_fault {
            return Some(fault);
        }
        if desync {
            return Some(LinkFault::ScramblerDesync);
        }
        if self.unlocked_cycles > self.cfg.lock_loss_cycles {
            return Some(LinkFault::AlignmentLost);
        }
        None
    }

    fn serdes_progress(&mut self, obs: &Observations) -> Option<PhyEvent> {
        if obs.serdes_ready && self.cycles_in_state > 1 {
            return Some(PhyEvent::SerdesReady);
        }
        self.since_serdes_reset += 1;
        if self.since_serdes_reset > self.cfg.serdes_watchdog {
            warn!(self.log, "transceiver not ready, resetting again");
            self.since_serdes_reset = 0;
            self.directives.push(Directive::ResetSerdes);
        }
        None
    }

    fn timeout(&self) -> u32 {
        let t = &self.cfg.timeouts;
        match self.state {
            PhyState::Reset => t.reset,
            PhyState::Detect => t.detect,
            PhyState::Align => t.align,
            PhyState::Configure(_) => t.configure,
            _ => u32::MAX,
        }
    }

    fn enter(&mut self, next: PhyState, event: Option<PhyEvent>) {
        let prev = self.state;
        self.state = next;
        self.cycles_in_state = 0;
        self.fsm.bump(next.kind());
        match event {
            Some(PhyEvent::Fatal(fault)) => {
                error!(self.log, "link fault";
                    "fault" => %fault, "from" => %prev, "to" => %next)
            }
            Some(ev) => {
                info!(self.log, "state transition";
                    "from" => %prev, "to" => %next, "event" => ?ev)
            }
            None => info!(self.log, "initial state"; "state" => %next),
        }

        let link = &mut self.link;
        match next {
            PhyState::Reset => {
                link.rate = self.latched_rate;
                link.encoding = self.cfg.codec_for(link.rate);
                link.power = PowerState::P0;
                link.generation += 1;
                link.rx_enabled = false;
                link.align_enabled = false;
                self.since_serdes_reset = 0;
                self.detect_pending = false;
                self.directives.extend([
                    Directive::ConfigureSerdes,
                    Directive::ResetSerdes,
                    Directive::FlushBuffer,
                    Directive::StopScramblers,
                    Directive::ResetTxCodec,
                ]);
            }
            PhyState::Detect => {
                self.directives.push(Directive::DetectReceiver);
            }
            PhyState::Align => {
                link.align_enabled = true;
            }
            PhyState::Configure(_) => {
                link.rx_enabled = true;
                self.unlocked_cycles = 0;
                self.desync.reset();
                self.directives.extend([
                    Directive::FlushBuffer,
                    Directive::ReseedScramblers,
                ]);
            }
            PhyState::Active(_) => {
                link.power = PowerState::P0;
            }
            PhyState::Idle(p) => {
                link.power = p;
                link.rx_enabled = false;
                link.generation += 1;
                self.phy_status_pulse = true;
                self.detect_pending = false;
                self.directives.extend([
                    Directive::FlushBuffer,
                    Directive::StopScramblers,
                ]);
            }
            PhyState::Transition => {
                link.rx_enabled = false;
                link.align_enabled = false;
                self.directives.extend([
                    Directive::StopScramblers,
                    Directive::FlushBuffer,
                ]);
            }
        }
    }
}
