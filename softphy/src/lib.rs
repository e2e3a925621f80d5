// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! A PIPE PHY built on a generic transceiver.
//!
//! `Phy` bridges a `SerdesOps` implementation to the PIPE interface of a
//! PCIe or USB3 MAC.  It is driven from two clocks: `tick_rx()` runs one
//! cycle of the recovered receive clock, `tick_core()` one cycle of PCLK.
//! The elastic buffer is the only state the two sides share.

use slog::o;

use sal::{SerdesOps, TxDrive};

pub mod aligner;
pub mod codec;
pub mod config;
pub mod controller;
pub mod datapath;
pub mod elastic;
pub mod fault;
pub mod pipe;
pub mod scrambler;
pub mod signaling;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod symbol;
pub mod types;

use aligner::AlignmentState;
use config::PhyConfig;
use controller::{
    Controller, Directive, FsmStats, LinkConfig, Observations, PhyState,
};
use datapath::{RxPath, TxPath};
use elastic::{BufferedSymbol, ElasticBuffer, ElasticStats};
use fault::{Fault, FaultCounter};
use pipe::{PipeCommand, PipeStatus, RxStatus};
use scrambler::Scrambler;
use symbol::SymbolError;
use types::PhyResult;

pub struct Phy<S: SerdesOps> {
    log: slog::Logger,
    cfg: PhyConfig,
    serdes: S,
    controller: Controller,
    rx: RxPath,
    buffer: ElasticBuffer,
    descrambler: Scrambler,
    tx: TxPath,
    tx_drive: Option<TxDrive>,
    // Decode errors read out on the previous core cycle, reported to the
    // controller on this one
    decode_errors: Vec<SymbolError>,
}

impl<S: SerdesOps> Phy<S> {
    /// Validate `cfg` and build an engine around `serdes`.  The engine
    /// starts in RESET with the transceiver being configured for the lowest
    /// supported rate.
    pub fn new(
        log: &slog::Logger,
        cfg: PhyConfig,
        serdes: S,
    ) -> PhyResult<Self> {
        cfg.validate()?;
        let log = log.new(o!("pipe" => cfg.pipe_version.to_string()));
        let controller = Controller::new(&log, &cfg);
        let link = *controller.link_config();
        let mut phy = Phy {
            rx: RxPath::new(&log, &cfg, &link),
            buffer: ElasticBuffer::new(
                &log,
                cfg.buffer_depth,
                cfg.max_burst(),
                cfg.pipe_version,
                link.encoding,
            ),
            descrambler: Scrambler::new(cfg.pipe_version, link.encoding),
            tx: TxPath::new(&cfg, &link),
            tx_drive: None,
            decode_errors: Vec::new(),
            controller,
            serdes,
            cfg,
            log,
        };
        let directives = phy.controller.take_directives();
        phy.apply(&directives)?;
        slog::info!(phy.log, "PHY created";
            "rates" => ?phy.cfg.supported_rates,
            "width" => %phy.cfg.interface_width);
        Ok(phy)
    }

    fn apply(&mut self, directives: &[Directive]) -> PhyResult<()> {
        let link = *self.controller.link_config();
        for d in directives {
            match d {
                Directive::ConfigureSerdes => {
                    self.serdes.configure(link.rate, link.encoding)?
                }
                Directive::ResetSerdes => self.serdes.reset()?,
                Directive::DetectReceiver => self.serdes.detect_receiver()?,
                Directive::FlushBuffer => {
                    self.buffer.flush(link.encoding, link.buffer_mode)
                }
                Directive::ReseedScramblers => {
                    self.tx.reseed(link.encoding);
                    self.descrambler.reset(link.encoding);
                    self.descrambler.reseed();
                }
                Directive::StopScramblers => {
                    self.tx.stop();
                    self.descrambler.stop();
                }
                Directive::ResetTxCodec => self.tx.reset_codec(link.encoding),
                Directive::SetRxPolarity(invert) => {
                    self.serdes.set_rx_polarity(*invert)?
                }
            }
        }
        Ok(())
    }

    /// One cycle of the recovered receive clock.
    pub fn tick_rx(&mut self) {
        let link = *self.controller.link_config();
        let sample = self.serdes.receive();
        self.rx.tick(sample, &link, &mut self.buffer);
    }

    /// One PCLK cycle.  The controller runs first, so the status returned
    /// always reflects the state the data on the bus was produced in.
    pub fn tick_core(&mut self, cmd: &PipeCommand) -> PhyResult<PipeStatus> {
        let encoding = self.controller.link_config().encoding;
        let req = cmd.decode(&self.cfg, encoding)?;
        if self.tx_drive != Some(req.tx_drive) {
            self.serdes.set_tx_drive(req.tx_drive)?;
            self.tx_drive = Some(req.tx_drive);
        }

        let line = self.buffer.line_status();
        let obs = Observations {
            request: &req,
            serdes_ready: self.serdes.ready(),
            receiver: self.serdes.receiver_detect_result(),
            locked: line.locked,
            line_idle: line.electrical_idle,
            buffer_primed: self.buffer.is_primed(),
            buffer_fault: self.buffer.fault(),
            decode_errors: &self.decode_errors,
        };
        let directives = self.controller.step(&obs);
        self.apply(&directives)?;

        let state = self.controller.state();
        let link = *self.controller.link_config();
        let cs = self.controller.status();
        let mut status = PipeStatus::new(&self.cfg);
        status.phy_status = cs.phy_status;
        status.rx_elecidle = line.electrical_idle;

        let mut rx_status = match cs.receiver_detected {
            true => RxStatus::ReceiverDetected,
            false => RxStatus::Ok,
        };
        self.decode_errors.clear();
        if matches!(state, PhyState::Active(_))
            && line.locked
            && !line.electrical_idle
        {
            let fault_before = self.buffer.fault();
            let mut symbols = Vec::with_capacity(pipe::MAX_BUS_SYMBOLS);
            for _ in 0..self.cfg.interface_width.symbols() {
                let Some(b) = self.buffer.read() else {
                    break;
                };
                let symbol = self.descrambler.process(b.symbol);
                if let Some(err) = symbol.error_kind() {
                    self.decode_errors.push(err);
                }
                symbols.push(BufferedSymbol { symbol, ..b });
            }
            rx_status = rx_status
                .merge(status.load_rx(self.cfg.pipe_version, &symbols));
            if let (None, Some(fault)) = (fault_before, self.buffer.fault()) {
                rx_status = rx_status.merge(pipe::fault_status(fault));
            }
        }
        status.set_rx_status(rx_status);

        if let Some(sample) = self.tx.tick(state, &link, &req) {
            self.serdes.transmit(sample)?;
        }
        Ok(status)
    }

    pub fn config(&self) -> &PhyConfig {
        &self.cfg
    }

    pub fn state(&self) -> PhyState {
        self.controller.state()
    }

    pub fn link_config(&self) -> &LinkConfig {
        self.controller.link_config()
    }

    /// True when the MAC may use the receive data bus.
    pub fn is_ready(&self) -> bool {
        self.controller.is_ready()
    }

    pub fn fault_counters(&self) -> Vec<FaultCounter> {
        self.controller.fault_counters()
    }

    /// The most recent verdict that the link is unhealthy, if any.
    pub fn link_fault(&self) -> Option<&Fault> {
        self.controller.link_fault()
    }

    pub fn clear_fault_counters(&mut self) {
        self.controller.clear_faults();
    }

    pub fn decode_error_counts(&self) -> (u64, u64) {
        self.controller.decode_error_counts()
    }

    pub fn buffer_stats(&self) -> ElasticStats {
        self.buffer.stats()
    }

    pub fn buffer_occupancy(&self) -> usize {
        self.buffer.occupancy()
    }

    pub fn fsm_stats(&self) -> &FsmStats {
        self.controller.fsm_stats()
    }

    pub fn alignment(&self) -> AlignmentState {
        self.rx.alignment()
    }

    /// Number of times receive alignment has been acquired and lost.
    pub fn lock_counts(&self) -> (u64, u64) {
        self.rx.lock_counts()
    }

    /// Number of LFPS wakes received.
    pub fn wake_detected(&self) -> u32 {
        self.buffer.line_status().wakes
    }

    pub fn serdes(&self) -> &S {
        &self.serdes
    }

    pub fn serdes_mut(&mut self) -> &mut S {
        &mut self.serdes
    }
}

#[cfg(test)]
pub(crate) fn test_log() -> slog::Logger {
    use slog::Drain;

    let dec = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(dec).build().fuse();
    slog::Logger::root(drain, o!())
}
