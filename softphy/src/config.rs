// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Static configuration for a PHY instance.  All timing values are counted
//! in cycles of the clock domain that consumes them.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use common::link::{BusWidth, Encoding, PipeVersion, Rate};

use crate::types::{PhyError, PhyResult};

/// Limits on how long each wait-for-condition state may last, in core
/// cycles.  Exceeding any of them forces the link back through reset.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct Timeouts {
    pub reset: u32,
    pub detect: u32,
    pub align: u32,
    pub configure: u32,
    /// Time spent in TRANSITION before restarting.  This is a settling
    /// delay rather than a failure deadline.
    pub transition: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            reset: 8192,
            detect: 8192,
            align: 32768,
            configure: 16384,
            transition: 64,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct AlignerConfig {
    /// Confidence at which the aligner declares lock.
    pub lock_threshold: u32,
    /// Confidence saturates here.  The gap between this and zero is how
    /// many isolated misses a locked aligner can absorb.
    pub max_confidence: u32,
    /// Aligned words without a comma before alignment is abandoned.
    pub comma_timeout: u32,
}

impl Default for AlignerConfig {
    fn default() -> Self {
        AlignerConfig {
            lock_threshold: 4,
            max_confidence: 8,
            comma_timeout: 4096,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct IdleConfig {
    /// Receive cycles a change in line activity must persist before it is
    /// believed.
    pub debounce: u32,
}

impl Default for IdleConfig {
    fn default() -> Self {
        IdleConfig { debounce: 16 }
    }
}

/// Low-frequency periodic signaling, used by USB3 to wake a link.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct LfpsConfig {
    /// Shortest run of activity, in receive cycles, accepted as a burst
    pub burst_min: u32,
    /// Longest run of activity accepted as a burst
    pub burst_max: u32,
    /// Bursts required to recognize a wake
    pub bursts: u32,
    /// Window, in receive cycles, in which those bursts must arrive
    pub window: u32,
    /// Transmit half period, in core cycles
    pub tx_half_period: u32,
}

impl Default for LfpsConfig {
    fn default() -> Self {
        LfpsConfig {
            burst_min: 8,
            burst_max: 512,
            bursts: 2,
            window: 4096,
            tx_half_period: 4,
        }
    }
}

/// An event-rate limit: more than `limit` events inside `window` cycles is
/// treated as a fault.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct LimitConfig {
    pub limit: usize,
    pub window: u64,
}

fn default_desync() -> LimitConfig {
    LimitConfig {
        limit: 16,
        window: 256,
    }
}

fn default_flap() -> LimitConfig {
    LimitConfig {
        limit: 5,
        window: 1_000_000,
    }
}

fn default_codecs() -> BTreeMap<Rate, Encoding> {
    [Rate::Gen1, Rate::Gen2, Rate::Gen3]
        .into_iter()
        .map(|r| (r, r.default_encoding()))
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct PhyConfig {
    /// Which PIPE variant to present to the MAC
    pub pipe_version: PipeVersion,

    /// Rates the MAC may select.  The lowest is used after reset.
    pub supported_rates: Vec<Rate>,

    /// Number of symbol slots in the elastic buffer.  Must be a power of
    /// two.
    pub buffer_depth: usize,

    /// Line encoding used at each rate
    pub codec: BTreeMap<Rate, Encoding>,

    /// Width of the PIPE data bus
    pub interface_width: BusWidth,

    pub timeouts: Timeouts,

    pub aligner: AlignerConfig,

    pub idle: IdleConfig,

    pub lfps: LfpsConfig,

    /// Decode errors arriving faster than this are taken as a loss of
    /// scrambler synchronization.
    #[serde(default = "default_desync")]
    pub desync: LimitConfig,

    /// Fatal link faults arriving faster than this mark the link as
    /// flapping.
    #[serde(default = "default_flap")]
    pub flap: LimitConfig,

    /// Core cycles the aligner may stay unlocked, with the line active,
    /// before the link is torn down.
    pub lock_loss_cycles: u32,

    /// Core cycles to wait for the transceiver to come out of reset before
    /// resetting it again.
    pub serdes_watchdog: u32,
}

impl Default for PhyConfig {
    fn default() -> Self {
        PhyConfig {
            pipe_version: PipeVersion::Pcie,
            supported_rates: vec![Rate::Gen1, Rate::Gen2],
            buffer_depth: 64,
            codec: default_codecs(),
            interface_width: BusWidth::W16,
            timeouts: Timeouts::default(),
            aligner: AlignerConfig::default(),
            idle: IdleConfig::default(),
            lfps: LfpsConfig::default(),
            desync: default_desync(),
            flap: default_flap(),
            lock_loss_cycles: 256,
            serdes_watchdog: 2048,
        }
    }
}

impl PhyConfig {
    /// Parse and validate a TOML configuration.  Options not named in the
    /// input keep their defaults.
    pub fn from_toml(input: &str) -> PhyResult<Self> {
        let config: PhyConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// The encoding used at `rate`.
    pub fn codec_for(&self, rate: Rate) -> Encoding {
        self.codec
            .get(&rate)
            .copied()
            .unwrap_or_else(|| rate.default_encoding())
    }

    pub fn lowest_rate(&self) -> Rate {
        self.supported_rates.iter().min().copied().unwrap_or(Rate::Gen1)
    }

    pub fn supports(&self, rate: Rate) -> bool {
        self.supported_rates.contains(&rate)
    }

    /// The largest number of symbols the receive side can write in one
    /// cycle, over all supported rates.
    pub fn max_burst(&self) -> usize {
        self.supported_rates
            .iter()
            .map(|r| self.codec_for(*r).symbols_per_word())
            .max()
            .unwrap_or(1)
    }

    pub fn validate(&self) -> PhyResult<()> {
        let err = |msg: String| Err(PhyError::Config(msg));

        if self.supported_rates.is_empty() {
            return err("no supported rates".into());
        }
        let mut rates = self.supported_rates.clone();
        rates.sort();
        rates.dedup();
        if rates.len() != self.supported_rates.len() {
            return err("duplicate entries in supported_rates".into());
        }

        let depth = self.buffer_depth;
        if !depth.is_power_of_two() || depth < 4 * self.max_burst() {
            return err(format!(
                "buffer_depth {depth} must be a power of two and at least {}",
                4 * self.max_burst()
            ));
        }

        let a = &self.aligner;
        if a.lock_threshold == 0 || a.lock_threshold > a.max_confidence {
            return err(format!(
                "lock_threshold {} must be between 1 and max_confidence {}",
                a.lock_threshold, a.max_confidence
            ));
        }
        if a.comma_timeout == 0 {
            return err("comma_timeout must be non-zero".into());
        }

        let t = &self.timeouts;
        if [t.reset, t.detect, t.align, t.configure, t.transition]
            .iter()
            .any(|t| *t == 0)
        {
            return err("timeouts must be non-zero".into());
        }

        let l = &self.lfps;
        if l.burst_min == 0 || l.burst_min > l.burst_max || l.bursts == 0 {
            return err("invalid LFPS burst limits".into());
        }
        if l.tx_half_period == 0 {
            return err("LFPS half period must be non-zero".into());
        }
        if self.desync.limit == 0 || self.flap.limit == 0 {
            return err("fault limits must be non-zero".into());
        }
        if self.serdes_watchdog == 0 || self.lock_loss_cycles == 0 {
            return err("watchdog intervals must be non-zero".into());
        }
        Ok(())
    }
}
