// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory targets as written by test authors, and their size in guest pages.

use std::{fmt, str::FromStr};

use thiserror::Error;

/// Guest pages per megabyte (4 KiB pages).
pub const PAGES_PER_MB: u64 = 256;

/// Guest pages per gigabyte.
pub const PAGES_PER_GB: u64 = 262_144;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid memory target '{0}'")]
pub struct MemoryTargetError(String);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryUnit {
    Megabytes,
    Gigabytes,
}

/// A memory target such as `512`, `512MB`, or `2gb`. Unsuffixed values are
/// megabytes. Zero and negative targets mean "no target".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryTarget {
    text: String,
    amount: i64,
    unit: MemoryUnit,
}

impl MemoryTarget {
    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn unit(&self) -> MemoryUnit {
        self.unit
    }

    /// Returns the number of guest pages this target corresponds to, which is
    /// what the control plane reports as `memory.target`.
    pub fn pages(&self) -> u64 {
        let Ok(amount) = u64::try_from(self.amount) else {
            return 0;
        };

        let per_unit = match self.unit {
            MemoryUnit::Megabytes => PAGES_PER_MB,
            MemoryUnit::Gigabytes => PAGES_PER_GB,
        };
        amount.saturating_mul(per_unit)
    }
}

impl FromStr for MemoryTarget {
    type Err = MemoryTargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let lower = trimmed.to_ascii_lowercase();
        let (number, unit) = if let Some(n) = lower.strip_suffix("gb") {
            (n, MemoryUnit::Gigabytes)
        } else if let Some(n) = lower.strip_suffix("mb") {
            (n, MemoryUnit::Megabytes)
        } else {
            (lower.as_str(), MemoryUnit::Megabytes)
        };

        let amount = number
            .parse::<i64>()
            .map_err(|_| MemoryTargetError(s.to_owned()))?;

        Ok(Self { text: trimmed.to_owned(), amount, unit })
    }
}

impl fmt::Display for MemoryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
