// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use common::link::{Encoding, Rate};

mod word;
pub use word::*;

/// A specialized Result type for transceiver operations
pub type SalResult<T> = Result<T, SalError>;

/// Error type conveying additional information about transceiver errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SalError {
    /// An argument passed to the transceiver layer is invalid or
    /// inappropriate.  This indicates misbehavior from the caller.
    #[error("Invalid argument: {}", .0)]
    InvalidArg(String),
    /// The transceiver was asked to move data before completing its reset
    /// sequence.
    #[error("Transceiver not ready")]
    NotReady,
    /// This operation is unsupported by the transceiver being used
    #[error("Operation unsupported by the transceiver: {}", .0)]
    Unsupported(String),
    /// The transceiver reported a failure of its own.
    #[error("Transceiver error: {}", .0)]
    Serdes(String),
}

/// One recovered-clock sample from the receiver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RxSample {
    /// Raw, unaligned line bits in wire order.
    pub bits: LineWord,
    /// Analog squelch output: true when the receiver sees a signal above the
    /// electrical-idle threshold.
    pub signal_detect: bool,
}

/// What the transmitter drives for one core-clock cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxSample {
    /// Electrical idle: both legs of the pair at the common-mode level.
    Idle,
    /// Serialize these line bits.
    Word(LineWord),
    /// Hold the line at a constant differential level.  Toggling this at a
    /// low rate produces out-of-band signaling such as LFPS.
    Level(bool),
}

/// Analog transmit settings forwarded unchanged from the MAC.
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
pub struct TxDrive {
    /// De-emphasis selection, two bits
    pub deemph: u8,
    /// Voltage margin selection, three bits
    pub margin: u8,
    /// Full (false) or low (true) swing
    pub swing: bool,
}

/// The `SerdesOps` trait is the complete contract between the PIPE engine
/// and a transceiver.  Receive-side calls are made from the recovered-clock
/// domain; all others are made from the core clock domain.
pub trait SerdesOps {
    /// Select the line rate and the parallel word width that matches the
    /// given encoding.  The new settings take effect at the next `reset()`.
    fn configure(&mut self, rate: Rate, encoding: Encoding) -> SalResult<()>;

    /// Restart the transceiver's initialization sequence.
    fn reset(&mut self) -> SalResult<()>;

    /// Reports whether both the transmit and receive halves have finished
    /// initializing.
    fn ready(&self) -> bool;

    /// Return the next parallel word from the deserializer.  Called once per
    /// recovered-clock cycle.
    fn receive(&mut self) -> RxSample;

    /// Hand one sample to the serializer.  Called from the core domain.
    fn transmit(&mut self, sample: TxSample) -> SalResult<()>;

    /// Begin a receiver-detection sequence on the transmit pair.
    fn detect_receiver(&mut self) -> SalResult<()>;

    /// Returns the outcome of the last receiver-detection sequence once it
    /// is complete.  Each outcome is returned exactly once.
    fn receiver_detect_result(&mut self) -> Option<bool>;

    /// Invert the polarity of the receive pair.
    fn set_rx_polarity(&mut self, invert: bool) -> SalResult<()>;

    /// Apply the analog transmit settings.
    fn set_tx_drive(&mut self, drive: TxDrive) -> SalResult<()>;
}
