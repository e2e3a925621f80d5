// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Link-level vocabulary shared by the PHY engine and its collaborators: the
//! protocol flavor, line rates, line encodings, power states, and PIPE bus
//! widths, along with their PIPE signal encodings.

use std::convert::TryFrom;
use std::fmt;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use strum::EnumIter;
use strum::IntoStaticStr;

/// Which PIPE variant the PHY presents to the MAC.  This selects the signal
/// layout as well as the protocol's control-symbol set.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PipeVersion {
    #[default]
    Pcie,
    Usb3,
}

impl PipeVersion {
    /// The value of the two-bit `PhyMode` PIPE input selecting this protocol.
    pub fn phy_mode(&self) -> u8 {
        match self {
            PipeVersion::Pcie => 0b00,
            PipeVersion::Usb3 => 0b01,
        }
    }

    pub fn from_phy_mode(bits: u8) -> Option<Self> {
        match bits {
            0b00 => Some(PipeVersion::Pcie),
            0b01 => Some(PipeVersion::Usb3),
            _ => None,
        }
    }
}

impl fmt::Display for PipeVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name: &'static str = self.into();
        write!(f, "{name}")
    }
}

/// Line encoding used on the wire.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
    EnumIter,
)]
pub enum Encoding {
    #[serde(rename = "8b10b")]
    Enc8b10b,
    #[serde(rename = "128b130b")]
    Enc128b130b,
}

impl Encoding {
    /// Number of bits in one line word: a single 8b/10b symbol, or a full
    /// 128b/130b block including its sync header.
    pub fn line_bits(&self) -> usize {
        match self {
            Encoding::Enc8b10b => 10,
            Encoding::Enc128b130b => 130,
        }
    }

    /// Number of byte symbols carried by one line word.
    pub fn symbols_per_word(&self) -> usize {
        match self {
            Encoding::Enc8b10b => 1,
            Encoding::Enc128b130b => 16,
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Encoding::Enc8b10b => write!(f, "8b10b"),
            Encoding::Enc128b130b => write!(f, "128b130b"),
        }
    }
}

/// The link speeds selectable through the PIPE `Rate` signal.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Hash,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    JsonSchema,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Rate {
    Gen1,
    Gen2,
    Gen3,
}

impl Rate {
    /// Encoding of this rate on the PIPE `Rate` signal.
    pub fn to_pipe(&self) -> u8 {
        match self {
            Rate::Gen1 => 0,
            Rate::Gen2 => 1,
            Rate::Gen3 => 2,
        }
    }

    pub fn from_pipe(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Rate::Gen1),
            1 => Some(Rate::Gen2),
            2 => Some(Rate::Gen3),
            _ => None,
        }
    }

    /// The line encoding normally paired with this rate.
    pub fn default_encoding(&self) -> Encoding {
        match self {
            Rate::Gen1 | Rate::Gen2 => Encoding::Enc8b10b,
            Rate::Gen3 => Encoding::Enc128b130b,
        }
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name: &'static str = self.into();
        write!(f, "{name}")
    }
}

/// PHY power states.  PCIe defines P0, P0s, P1, and P2; USB3 defines P0
/// through P3.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    Hash,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    JsonSchema,
    EnumIter,
    IntoStaticStr,
)]
pub enum PowerState {
    #[default]
    P0,
    P0s,
    P1,
    P2,
    P3,
}

impl PowerState {
    /// Decode the PIPE `PowerDown` signal for the given protocol.
    pub fn from_pipe(version: PipeVersion, bits: u8) -> Option<Self> {
        match (version, bits) {
            (_, 0) => Some(PowerState::P0),
            (PipeVersion::Pcie, 1) => Some(PowerState::P0s),
            (PipeVersion::Pcie, 2) => Some(PowerState::P1),
            (PipeVersion::Pcie, 3) => Some(PowerState::P2),
            (PipeVersion::Usb3, 1) => Some(PowerState::P1),
            (PipeVersion::Usb3, 2) => Some(PowerState::P2),
            (PipeVersion::Usb3, 3) => Some(PowerState::P3),
            _ => None,
        }
    }

    /// Encode this state on the PIPE `PowerDown` signal, if the protocol
    /// defines it.
    pub fn to_pipe(&self, version: PipeVersion) -> Option<u8> {
        match (version, self) {
            (_, PowerState::P0) => Some(0),
            (PipeVersion::Pcie, PowerState::P0s) => Some(1),
            (PipeVersion::Pcie, PowerState::P1) => Some(2),
            (PipeVersion::Pcie, PowerState::P2) => Some(3),
            (PipeVersion::Usb3, PowerState::P1) => Some(1),
            (PipeVersion::Usb3, PowerState::P2) => Some(2),
            (PipeVersion::Usb3, PowerState::P3) => Some(3),
            _ => None,
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Width of the PIPE data bus.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    Hash,
    Deserialize,
    Serialize,
)]
#[serde(try_from = "u32", into = "u32")]
pub enum BusWidth {
    W8,
    #[default]
    W16,
    W32,
}

impl BusWidth {
    pub fn bits(&self) -> u32 {
        match self {
            BusWidth::W8 => 8,
            BusWidth::W16 => 16,
            BusWidth::W32 => 32,
        }
    }

    /// Number of byte symbols moved per PIPE clock.
    pub fn symbols(&self) -> usize {
        (self.bits() / 8) as usize
    }

    /// Encoding on the PIPE `DataBusWidth` signal.
    pub fn to_pipe(&self) -> u8 {
        match self {
            BusWidth::W32 => 0b00,
            BusWidth::W16 => 0b01,
            BusWidth::W8 => 0b10,
        }
    }
}

impl TryFrom<u32> for BusWidth {
    type Error = String;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        match bits {
            8 => Ok(BusWidth::W8),
            16 => Ok(BusWidth::W16),
            32 => Ok(BusWidth::W32),
            x => Err(format!("unsupported PIPE data bus width: {x}")),
        }
    }
}

impl From<BusWidth> for u32 {
    fn from(w: BusWidth) -> u32 {
        w.bits()
    }
}

// The wire form is the plain bit count.
impl JsonSchema for BusWidth {
    fn schema_name() -> String {
        "BusWidth".to_string()
    }

    fn json_schema(
        gen: &mut schemars::gen::SchemaGenerator,
    ) -> schemars::schema::Schema {
        <u32 as JsonSchema>::json_schema(gen)
    }
}

impl fmt::Display for BusWidth {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_power_state_encoding() {
        for version in PipeVersion::iter() {
            for bits in 0..4 {
                let state = PowerState::from_pipe(version, bits).unwrap();
                assert_eq!(state.to_pipe(version), Some(bits));
            }
            assert!(PowerState::from_pipe(version, 4).is_none());
        }
        assert_eq!(PowerState::P3.to_pipe(PipeVersion::Pcie), None);
        assert_eq!(PowerState::P0s.to_pipe(PipeVersion::Usb3), None);
    }

    #[test]
    fn test_bus_width() {
        assert_eq!(BusWidth::try_from(16).unwrap().to_pipe(), 0b01);
        assert_eq!(BusWidth::W32.to_pipe(), 0b00);
        assert_eq!(BusWidth::W8.to_pipe(), 0b10);
        assert!(BusWidth::try_from(24).is_err());
    }

    #[derive(Deserialize)]
    struct Widths {
        width: BusWidth,
        rate: Rate,
        encoding: Encoding,
    }

    #[test]
    fn test_deserialize() {
        let w: Widths = toml::from_str(
            "width = 32\nrate = \"gen3\"\nencoding = \"128b130b\"\n",
        )
        .unwrap();
        assert_eq!(w.width, BusWidth::W32);
        assert_eq!(w.rate, Rate::Gen3);
        assert_eq!(w.encoding, Encoding::Enc128b130b);
        assert_eq!(w.rate.default_encoding(), w.encoding);
    }

    #[test]
    fn test_rate_pipe_encoding() {
        for rate in Rate::iter() {
            assert_eq!(Rate::from_pipe(rate.to_pipe()), Some(rate));
        }
        assert_eq!(Rate::from_pipe(3), None);
        assert_eq!(Rate::Gen2.to_string(), "gen2");
    }
}
