// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The PIPE signal set seen by the MAC, and its translation to and from the
//! engine's internal types.  Nothing in here makes a decision: commands are
//! checked and reshaped, and status is packed bit for bit.

use arrayvec::ArrayVec;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use common::link::{Encoding, PipeVersion, PowerState, Rate};
use sal::TxDrive;

use crate::config::PhyConfig;
use crate::elastic::{BufferMode, BufferedSymbol, Compensation};
use crate::fault::LinkFault;
use crate::symbol;
use crate::symbol::{Symbol, SymbolError, SymbolKind, SyncHeader};
use crate::types::{PhyError, PhyResult};

/// Most symbols carried on the PIPE data bus in one cycle.
pub const MAX_BUS_SYMBOLS: usize = 4;

pub type BusSymbols = ArrayVec<Symbol, MAX_BUS_SYMBOLS>;

/// MAC-driven PIPE signals, sampled once per PCLK.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct PipeCommand {
    pub reset: bool,
    pub phy_mode: u8,
    pub rate: u8,
    pub power_down: u8,
    /// 0: half-full, 1: nominal-empty.  Sampled while the PHY is in reset.
    pub elas_buf_mode: u8,
    pub tx_data: u32,
    pub tx_datak: u8,
    /// Only meaningful at 128b/130b, where the MAC pauses one cycle in 65
    /// to absorb the sync header overhead.
    pub tx_data_valid: bool,
    pub tx_start_block: bool,
    pub tx_sync_header: u8,
    pub tx_compliance: bool,
    pub tx_oneszeroes: bool,
    pub tx_deemph: u8,
    pub tx_margin: u8,
    pub tx_swing: bool,
    pub tx_detrx_lpbk: bool,
    pub tx_elecidle: bool,
    pub rx_polarity: bool,
    pub rx_termination: bool,
}

impl PipeCommand {
    /// The signal values of a MAC that has just come out of reset and is
    /// not yet transmitting.
    pub fn new(version: PipeVersion) -> Self {
        PipeCommand {
            reset: false,
            phy_mode: version.phy_mode(),
            rate: 0,
            power_down: 0,
            elas_buf_mode: 0,
            tx_data: 0,
            tx_datak: 0,
            tx_data_valid: true,
            tx_start_block: false,
            tx_sync_header: 0,
            tx_compliance: false,
            tx_oneszeroes: false,
            tx_deemph: 1,
            tx_margin: 0,
            tx_swing: false,
            tx_detrx_lpbk: false,
            tx_elecidle: true,
            rx_polarity: false,
            rx_termination: true,
        }
    }

    /// Check the command against the configuration and reshape it into a
    /// request for the controller and the transmit path.  `encoding` is the
    /// encoding currently in use, which decides how the transmit bus is
    /// carved into symbols.
    pub fn decode(
        &self,
        cfg: &PhyConfig,
        encoding: Encoding,
    ) -> PhyResult<MacRequest> {
        let version = cfg.pipe_version;
        let bad = |msg: String| Err(PhyError::InvalidCommand(msg));

        if PipeVersion::from_phy_mode(self.phy_mode) != Some(version) {
            return bad(format!(
                "phy_mode {} does not select {version}",
                self.phy_mode
            ));
        }
        let rate = match Rate::from_pipe(self.rate) {
            Some(r) if cfg.supports(r) => r,
            _ => return bad(format!("unsupported rate {}", self.rate)),
        };
        let power = match PowerState::from_pipe(version, self.power_down) {
            Some(p) => p,
            None => {
                return bad(format!("invalid power_down {}", self.power_down))
            }
        };
        let buffer_mode = match self.elas_buf_mode {
            0 => BufferMode::HalfFull,
            1 => BufferMode::NominalEmpty,
            x => return bad(format!("invalid elas_buf_mode {x}")),
        };
        if self.tx_deemph > 0b11 || self.tx_margin > 0b111 {
            return bad(format!(
                "tx_deemph {} / tx_margin {} out of range",
                self.tx_deemph, self.tx_margin
            ));
        }

        let width = cfg.interface_width.symbols();
        let mut tx = BusSymbols::new();
        for i in 0..width {
            let value = (self.tx_data >> (8 * i)) as u8;
            tx.push(match self.tx_datak & (1 << i) {
                0 => Symbol::data(value),
                _ => Symbol::control(value),
            });
        }
        let mut tx_valid = true;
        if encoding == Encoding::Enc128b130b {
            tx_valid = self.tx_data_valid;
            if self.tx_start_block {
                let header = SyncHeader::from_pipe(self.tx_sync_header)
                    .ok_or_else(|| {
                        PhyError::InvalidCommand(format!(
                            "invalid tx_sync_header {:#b}",
                            self.tx_sync_header
                        ))
                    })?;
                // At 128b/130b the sync header alone decides whether a
                // byte is data or part of an ordered set.
                for sym in tx.iter_mut() {
                    *sym = match header {
                        SyncHeader::Data => Symbol::data(sym.value),
                        SyncHeader::OrderedSet => Symbol::control(sym.value),
                    };
                }
                tx[0] = tx[0].starting(header);
            }
        }

        Ok(MacRequest {
            reset: self.reset,
            rate,
            power,
            buffer_mode,
            rx_polarity: self.rx_polarity,
            rx_termination: version == PipeVersion::Pcie
                || self.rx_termination,
            detect_receiver: self.tx_detrx_lpbk && self.tx_elecidle,
            tx_elecidle: self.tx_elecidle,
            tx_compliance: self.tx_compliance,
            tx_ones_zeroes: self.tx_oneszeroes,
            tx_drive: TxDrive {
                deemph: self.tx_deemph,
                margin: self.tx_margin,
                swing: self.tx_swing,
            },
            tx_valid,
            tx,
        })
    }
}

/// A checked PIPE command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MacRequest {
    pub reset: bool,
    pub rate: Rate,
    pub power: PowerState,
    pub buffer_mode: BufferMode,
    pub rx_polarity: bool,
    pub rx_termination: bool,
    /// Receiver detection requested: `tx_detrx_lpbk` with the transmitter
    /// in electrical idle.
    pub detect_receiver: bool,
    pub tx_elecidle: bool,
    pub tx_compliance: bool,
    pub tx_ones_zeroes: bool,
    pub tx_drive: TxDrive,
    /// False when the MAC is pausing the transmit bus this cycle
    pub tx_valid: bool,
    pub tx: BusSymbols,
}

/// PIPE `RxStatus` codes.
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
pub enum RxStatus {
    #[default]
    Ok = 0b000,
    SkpAdded = 0b001,
    SkpRemoved = 0b010,
    ReceiverDetected = 0b011,
    DecodeError = 0b100,
    BufferOverflow = 0b101,
    BufferUnderflow = 0b110,
    DisparityError = 0b111,
}

impl RxStatus {
    // When several conditions coincide in one cycle, the one listed first
    // is reported.
    fn priority(&self) -> u8 {
        match self {
            RxStatus::DecodeError => 0,
            RxStatus::BufferOverflow => 1,
            RxStatus::BufferUnderflow => 2,
            RxStatus::DisparityError => 3,
            RxStatus::SkpAdded => 4,
            RxStatus::SkpRemoved => 5,
            RxStatus::ReceiverDetected => 6,
            RxStatus::Ok => 7,
        }
    }

    /// The more urgent of two conditions.
    pub fn merge(self, other: RxStatus) -> RxStatus {
        if other.priority() < self.priority() {
            other
        } else {
            self
        }
    }
}

/// PHY-driven PIPE signals.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
pub struct PipeStatus {
    pub phy_status: bool,
    pub pwrpresent: bool,
    pub data_bus_width: u8,
    pub rx_data: u32,
    pub rx_datak: u8,
    pub rx_valid: bool,
    pub rx_status: u8,
    pub rx_elecidle: bool,
    pub rx_start_block: bool,
    pub rx_sync_header: u8,
    pub rx_data_valid: bool,
}

impl PipeStatus {
    /// Status with the receive bus quiet.
    pub fn new(cfg: &PhyConfig) -> Self {
        PipeStatus {
            pwrpresent: cfg.pipe_version == PipeVersion::Usb3,
            data_bus_width: cfg.interface_width.to_pipe(),
            rx_elecidle: true,
            ..Default::default()
        }
    }

    pub fn set_rx_status(&mut self, status: RxStatus) {
        self.rx_status = status as u8;
    }

    /// Place received symbols on the bus.  Symbol `i` occupies bits
    /// `8i..8i+8` of `rx_data` and bit `i` of `rx_datak`.  Symbols that
    /// failed to decode are replaced by the protocol's error K-code.
    /// Returns the status the symbols themselves imply.
    pub fn load_rx(
        &mut self,
        version: PipeVersion,
        symbols: &[BufferedSymbol],
    ) -> RxStatus {
        let mut status = RxStatus::Ok;
        self.rx_data = 0;
        self.rx_datak = 0;
        for (i, b) in symbols.iter().take(MAX_BUS_SYMBOLS).enumerate() {
            let sym = b.symbol;
            let (value, k) = match sym.kind {
                SymbolKind::Data => (sym.value, false),
                SymbolKind::Control => (sym.value, true),
                SymbolKind::Error(err) => {
                    status = status.merge(match err {
                        SymbolError::Disparity => RxStatus::DisparityError,
                        _ => RxStatus::DecodeError,
                    });
                    (symbol::substitute(version), true)
                }
            };
            self.rx_data |= u32::from(value) << (8 * i);
            self.rx_datak |= u8::from(k) << i;
            status = status.merge(match b.compensation {
                Compensation::Added => RxStatus::SkpAdded,
                Compensation::Removed => RxStatus::SkpRemoved,
                Compensation::None => RxStatus::Ok,
            });
        }
        match symbols.first().and_then(|b| b.symbol.block) {
            Some(header) => {
                self.rx_start_block = true;
                self.rx_sync_header = header.to_pipe();
            }
            None => {
                self.rx_start_block = false;
                self.rx_sync_header = 0;
            }
        }
        self.rx_valid = !symbols.is_empty();
        self.rx_data_valid = self.rx_valid;
        status
    }
}

/// Receive status for a buffer fault seen this cycle.
pub fn fault_status(fault: LinkFault) -> RxStatus {
    match fault {
        LinkFault::BufferOverflow => RxStatus::BufferOverflow,
        LinkFault::BufferUnderflow => RxStatus::BufferUnderflow,
        _ => RxStatus::Ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::k;
    use common::link::BusWidth;

    fn cfg(version: PipeVersion) -> PhyConfig {
        PhyConfig {
            pipe_version: version,
            supported_rates: vec![Rate::Gen1, Rate::Gen2, Rate::Gen3],
            buffer_depth: 128,
            interface_width: BusWidth::W32,
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_command() {
        let cfg = cfg(PipeVersion::Pcie);
        let mut cmd = PipeCommand::new(PipeVersion::Pcie);
        cmd.rate = 1;
        cmd.power_down = 2;
        cmd.tx_data = 0x4a4a_4abc;
        cmd.tx_datak = 0b0001;
        cmd.tx_detrx_lpbk = true;
        let req = cmd.decode(&cfg, Encoding::Enc8b10b).unwrap();
        assert_eq!(req.rate, Rate::Gen2);
        assert_eq!(req.power, PowerState::P1);
        assert!(req.detect_receiver);
        assert!(req.tx_valid);
        assert_eq!(
            req.tx.as_slice(),
            &[
                Symbol::control(k::COM),
                Symbol::data(0x4a),
                Symbol::data(0x4a),
                Symbol::data(0x4a),
            ]
        );
    }

    #[test]
    fn test_decode_rejects() {
        let config = PhyConfig::default();
        let base = PipeCommand::new(PipeVersion::Pcie);
        let bad = [
            PipeCommand {
                phy_mode: 1,
                ..base.clone()
            },
            PipeCommand {
                rate: 2,
                ..base.clone()
            },
            PipeCommand {
                elas_buf_mode: 2,
                ..base.clone()
            },
            PipeCommand {
                tx_margin: 8,
                ..base.clone()
            },
        ];
        for cmd in bad {
            assert!(matches!(
                cmd.decode(&config, Encoding::Enc8b10b),
                Err(PhyError::InvalidCommand(_))
            ));
        }

        // P3 does not exist for PCIe, but does for USB3
        let pcie = PipeCommand {
            power_down: 3,
            ..base
        };
        assert_eq!(
            pcie.decode(&config, Encoding::Enc8b10b).unwrap().power,
            PowerState::P2
        );
        let usb_cfg = cfg(PipeVersion::Usb3);
        let usb = PipeCommand {
            power_down: 3,
            ..PipeCommand::new(PipeVersion::Usb3)
        };
        assert_eq!(
            usb.decode(&usb_cfg, Encoding::Enc8b10b).unwrap().power,
            PowerState::P3
        );
    }

    #[test]
    fn test_decode_block_start() {
        let cfg = cfg(PipeVersion::Pcie);
        let mut cmd = PipeCommand::new(PipeVersion::Pcie);
        cmd.rate = 2;
        cmd.tx_start_block = true;
        cmd.tx_sync_header = SyncHeader::OrderedSet.to_pipe();
        cmd.tx_data = 0xaaaa_aaaa;
        let req = cmd.decode(&cfg, Encoding::Enc128b130b).unwrap();
        assert_eq!(
            req.tx[0],
            Symbol::control(0xaa).starting(SyncHeader::OrderedSet)
        );
        assert_eq!(req.tx[3], Symbol::control(0xaa));

        cmd.tx_sync_header = 0b11;
        assert!(cmd.decode(&cfg, Encoding::Enc128b130b).is_err());
        cmd.tx_start_block = false;
        cmd.tx_data_valid = false;
        assert!(!cmd.decode(&cfg, Encoding::Enc128b130b).unwrap().tx_valid);
        // tx_data_valid is ignored at 8b/10b
        assert!(cmd.decode(&cfg, Encoding::Enc8b10b).unwrap().tx_valid);
    }

    fn buffered(symbol: Symbol, compensation: Compensation) -> BufferedSymbol {
        BufferedSymbol {
            symbol,
            compensation,
        }
    }

    #[test]
    fn test_load_rx() {
        let cfg = cfg(PipeVersion::Usb3);
        let mut status = PipeStatus::new(&cfg);
        assert!(status.pwrpresent);
        assert_eq!(status.data_bus_width, 0b00);

        let rx = status.load_rx(
            PipeVersion::Usb3,
            &[
                buffered(Symbol::data(0x12), Compensation::None),
                buffered(Symbol::control(k::SKP_USB), Compensation::Added),
                buffered(
                    Symbol::error(SymbolError::CodeViolation),
                    Compensation::None,
                ),
                buffered(Symbol::data(0x34), Compensation::None),
            ],
        );
        assert_eq!(rx, RxStatus::DecodeError);
        assert_eq!(status.rx_data, 0x349c_3c12);
        assert_eq!(status.rx_datak, 0b0110);
        assert!(status.rx_valid);
        assert!(!status.rx_start_block);

        let rx = status.load_rx(
            PipeVersion::Usb3,
            &[buffered(Symbol::control(k::SKP_USB), Compensation::Removed)],
        );
        assert_eq!(rx, RxStatus::SkpRemoved);
        assert_eq!(
            rx.merge(fault_status(LinkFault::BufferUnderflow)),
            RxStatus::BufferUnderflow
        );
        assert_eq!(
            RxStatus::DisparityError.merge(RxStatus::BufferOverflow),
            RxStatus::BufferOverflow
        );
    }

    #[test]
    fn test_load_rx_block() {
        let mut status = PipeStatus::new(&cfg(PipeVersion::Pcie));
        status.load_rx(
            PipeVersion::Pcie,
            &[
                buffered(
                    Symbol::data(1).starting(SyncHeader::Data),
                    Compensation::None,
                ),
                buffered(Symbol::data(2), Compensation::None),
            ],
        );
        assert!(status.rx_start_block);
        assert_eq!(status.rx_sync_header, 0b10);
        assert!(status.rx_data_valid);
        assert_eq!(status.rx_data, 0x0201);
    }
}
