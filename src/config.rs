// Copyright 2025 Cornell University
// released under MIT License

use serde::{Deserialize, Deserializer};
use std::fmt;
use std::str::FromStr;

/// Time units accepted in durations, from finest to coarsest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeUnit {
    Ns,
    Us,
    Ms,
    S,
}

impl TimeUnit {
    pub const ALL: [TimeUnit; 4] = [TimeUnit::S, TimeUnit::Ms, TimeUnit::Us, TimeUnit::Ns];

    pub fn nanos(self) -> u64 {
        match self {
            TimeUnit::Ns => 1,
            TimeUnit::Us => 1_000,
            TimeUnit::Ms => 1_000_000,
            TimeUnit::S => 1_000_000_000,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            TimeUnit::Ns => "ns",
            TimeUnit::Us => "us",
            TimeUnit::Ms => "ms",
            TimeUnit::S => "s",
        }
    }
}

/// A non-negative duration with nanosecond resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration {
    nanos: u64,
}

impl Duration {
    pub fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    pub fn new(value: u64, unit: TimeUnit) -> Self {
        Self {
            nanos: value.saturating_mul(unit.nanos()),
        }
    }

    pub fn as_nanos(&self) -> u64 {
        self.nanos
    }
}

impl FromStr for Duration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("duration `{}` has no unit", s))?;
        let (value, unit) = s.split_at(split);
        let value: u64 = value
            .parse()
            .map_err(|_| format!("duration `{}` does not start with an integer", s))?;
        let unit = match unit.trim() {
            "s" => TimeUnit::S,
            "ms" => TimeUnit::Ms,
            "us" => TimeUnit::Us,
            "ns" => TimeUnit::Ns,
            other => return Err(format!("unknown time unit `{}`", other)),
        };
        Ok(Duration::new(value, unit))
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = TimeUnit::ALL
            .into_iter()
            .find(|u| self.nanos % u.nanos() == 0)
            .unwrap_or(TimeUnit::Ns);
        write!(f, "{}{}", self.nanos / unit.nanos(), unit.suffix())
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Options threaded through every compilation step
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// The clock stops advancing once this time is reached
    pub max_time: Duration,
    /// Bound used for arrays declared without one
    pub max_array_size: u32,
    /// Behavior tree tick frequency in Hz
    pub bt_tick_rate: f64,
    /// Keep ticking the tree after it returned SUCCESS or FAILURE
    pub bt_tick_if_not_running: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_time: Duration::new(100, TimeUnit::S),
            max_array_size: 100,
            bt_tick_rate: 1.0,
            bt_tick_if_not_running: false,
        }
    }
}

impl Config {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_array_size == 0 {
            anyhow::bail!("max_array_size must be positive");
        }
        if period_from_rate(self.bt_tick_rate).is_none() {
            anyhow::bail!("bt_tick_rate must be a positive frequency of at most 10 MHz");
        }
        Ok(())
    }
}

/// Period of a timer, in nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub nanos: u64,
    /// `false` when the period was rounded down to fit the unit
    pub exact: bool,
}

/// Converts a frequency in Hz into a whole period in the coarsest unit
/// that holds it exactly. Once a period exceeds 100 in some unit without
/// being exact there, it is floored to that unit, so 30 Hz becomes
/// 33333us.
pub fn period_from_rate(rate_hz: f64) -> Option<Period> {
    if !(rate_hz.is_finite() && rate_hz > 0.0) {
        return None;
    }
    let seconds = 1.0 / rate_hz;
    for unit in TimeUnit::ALL {
        let in_unit = seconds * (TimeUnit::S.nanos() / unit.nanos()) as f64;
        let rounded = in_unit.round();
        if rounded >= 1.0 && (in_unit - rounded).abs() <= 1e-9 * in_unit {
            return Some(Period {
                nanos: rounded as u64 * unit.nanos(),
                exact: true,
            });
        }
        let floored = in_unit.floor();
        if floored > 100.0 {
            return Some(Period {
                nanos: floored as u64 * unit.nanos(),
                exact: false,
            });
        }
    }
    None
}
