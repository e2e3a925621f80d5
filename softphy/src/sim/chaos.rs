// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use slog::Logger;

use sal::{LineWord, SalError, SalResult};

/// Chaos that happens according to a probability.
#[derive(Default, Debug, Serialize, Deserialize, Copy, Clone)]
pub struct Chaos {
    /// A probability between 0.0 and 1.0
    pub value: f64,
}

impl Chaos {
    /// Create a new chaos value.
    pub fn new(value: f64) -> SalResult<Self> {
        let mut c = Self::default();
        c.set(value)?;
        Ok(c)
    }

    /// Set the chaos value.
    pub fn set(&mut self, value: f64) -> SalResult<()> {
        if !(0.0..=1.0).contains(&value) {
            return Err(SalError::InvalidArg(format!(
                "probability {value} out of range"
            )));
        }
        self.value = value;
        Ok(())
    }

    /// Get the underlying chaos value.
    pub fn get(&self) -> f64 {
        self.value
    }

    /// Roll the dice.
    pub fn unfurled(&self, rng: &mut impl Rng) -> bool {
        self.value > 0.0 && self.value >= rng.gen::<f64>()
    }
}

/// Flips single bits in received words.  The generator is seeded so a
/// failing run can be replayed exactly.
pub struct BitChaos {
    log: Logger,
    chaos: Chaos,
    rng: StdRng,
    flips: u64,
}

impl BitChaos {
    pub fn new(log: &Logger, chaos: Chaos, seed: u64) -> Self {
        BitChaos {
            log: log.new(slog::o!("unit" => "chaos")),
            chaos,
            rng: StdRng::seed_from_u64(seed),
            flips: 0,
        }
    }

    pub fn set(&mut self, chaos: Chaos) {
        self.chaos = chaos;
    }

    pub fn flips(&self) -> u64 {
        self.flips
    }

    /// With the configured probability, invert one bit of `word`.
    pub fn apply(&mut self, word: LineWord) -> LineWord {
        if word.is_empty() || !self.chaos.unfurled(&mut self.rng) {
            return word;
        }
        let victim = self.rng.gen_range(0..word.len());
        self.flips += 1;
        slog::debug!(self.log, "chaos: flipped bit {}", victim);
        LineWord::from_bits(
            word.iter().enumerate().map(|(i, b)| b ^ (i == victim)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_log;

    #[test]
    fn test_chaos_range() {
        assert!(Chaos::new(1.5).is_err());
        assert_eq!(Chaos::new(0.25).unwrap().get(), 0.25);
    }

    #[test]
    fn test_bit_flips() {
        let word = LineWord::from_msb_first(0b0011111010, 10);
        let mut never = BitChaos::new(&test_log(), Chaos::default(), 1);
        assert_eq!(never.apply(word), word);

        let certain = Chaos::new(1.0).unwrap();
        let mut always = BitChaos::new(&test_log(), certain, 1);
        let flipped = always.apply(word);
        let diff = word.iter().zip(flipped.iter()).filter(|(a, b)| a != b);
        assert_eq!(diff.count(), 1);
        assert_eq!(always.flips(), 1);

        // Same seed, same damage
        let mut again = BitChaos::new(&test_log(), certain, 1);
        assert_eq!(again.apply(word), flipped);
    }
}
