//! Time-unit conversion for period and edge literals.
//!
//! Accepts `'100ns'`-style numeric literals (quotes already stripped by the
//! grammar) with a unit drawn from ps/ns/us/ms/s, case-insensitive, default
//! `ns` when absent. Scientific notation and division expressions such as
//! `15ns/3` are supported. Values pivot through picoseconds internally.
//!
//! Rounding: `round_ties_even`, so a trailing `.5` rounds to the even
//! neighbour and everything else rounds to nearest.

use crate::TimingError;
use regex::Regex;
use std::sync::OnceLock;

/// Recognised time units, with their picosecond factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Ps,
    Ns,
    Us,
    Ms,
    S,
}

impl TimeUnit {
    pub fn factor_ps(self) -> f64 {
        match self {
            TimeUnit::Ps => 1.0,
            TimeUnit::Ns => 1e3,
            TimeUnit::Us => 1e6,
            TimeUnit::Ms => 1e9,
            TimeUnit::S => 1e12,
        }
    }

    fn parse(s: &str) -> Option<TimeUnit> {
        match s.to_ascii_lowercase().as_str() {
            "ps" => Some(TimeUnit::Ps),
            "ns" => Some(TimeUnit::Ns),
            "us" => Some(TimeUnit::Us),
            "ms" => Some(TimeUnit::Ms),
            "s" => Some(TimeUnit::S),
            _ => None,
        }
    }
}

fn literal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^([+-]?\d*\.?\d+(?:[eE][+-]?\d+)?)\s*(ps|ns|us|ms|s)?\s*(?:/\s*([+-]?\d*\.?\d+(?:[eE][+-]?\d+)?))?$",
        )
        .unwrap()
    })
}

/// Converter with a configurable output unit (the VCT side wants `ns`).
#[derive(Debug, Clone, Copy)]
pub struct TimeUnitConverter {
    default_output: TimeUnit,
}

impl Default for TimeUnitConverter {
    fn default() -> Self {
        Self {
            default_output: TimeUnit::Ns,
        }
    }
}

impl TimeUnitConverter {
    pub fn new(default_output: TimeUnit) -> Self {
        Self { default_output }
    }

    /// Parse a literal into `(value, unit, divisor)`. The empty string reads
    /// as zero nanoseconds, matching the tolerant behaviour expected for
    /// absent edge times.
    fn parse_literal(&self, literal: &str) -> Result<(f64, TimeUnit, f64), TimingError> {
        let trimmed = literal.trim();
        if trimmed.is_empty() {
            return Ok((0.0, TimeUnit::Ns, 1.0));
        }
        let caps = literal_re()
            .captures(trimmed)
            .ok_or_else(|| TimingError::BadTimeLiteral(literal.to_string()))?;
        let value: f64 = caps[1]
            .parse()
            .map_err(|_| TimingError::BadTimeLiteral(literal.to_string()))?;
        let unit = caps
            .get(2)
            .and_then(|m| TimeUnit::parse(m.as_str()))
            .unwrap_or(TimeUnit::Ns);
        let divisor = match caps.get(3) {
            Some(m) => {
                let d: f64 = m
                    .as_str()
                    .parse()
                    .map_err(|_| TimingError::BadTimeLiteral(literal.to_string()))?;
                if d == 0.0 {
                    return Err(TimingError::BadTimeLiteral(literal.to_string()));
                }
                d
            }
            None => 1.0,
        };
        Ok((value, unit, divisor))
    }

    pub fn convert(&self, value: f64, from: TimeUnit, to: TimeUnit) -> f64 {
        value * from.factor_ps() / to.factor_ps()
    }

    /// Parse a literal and convert it to `to` (or the default output unit).
    pub fn convert_literal(&self, literal: &str, to: Option<TimeUnit>) -> Result<f64, TimingError> {
        let (value, unit, divisor) = self.parse_literal(literal)?;
        let to = to.unwrap_or(self.default_output);
        Ok(self.convert(value / divisor, unit, to))
    }

    /// Parse, convert, and round to an integer in the target unit.
    pub fn convert_literal_to_int(
        &self,
        literal: &str,
        to: Option<TimeUnit>,
    ) -> Result<i64, TimingError> {
        Ok(self.convert_literal(literal, to)?.round_ties_even() as i64)
    }
}
