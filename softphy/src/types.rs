// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::convert;

use sal::SalError;

/// A specialized Result type for PHY engine operations
pub type PhyResult<T> = Result<T, PhyError>;

/// Errors returned to the owner of the engine.  These describe misuse:
/// faults on the link itself are reported through `LinkFault` and the PIPE
/// status signals instead.
#[derive(Debug, thiserror::Error)]
pub enum PhyError {
    #[error("Invalid configuration: {}", .0)]
    Config(String),
    #[error("Invalid argument: {}", .0)]
    InvalidArg(String),
    /// The MAC drove a PIPE input combination this PHY cannot honor.
    #[error("Invalid PIPE command: {}", .0)]
    InvalidCommand(String),
    #[error("Transceiver error: {0:?}")]
    Sal(SalError),
    #[error("Failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

impl convert::From<SalError> for PhyError {
    fn from(err: SalError) -> Self {
        PhyError::Sal(err)
    }
}
