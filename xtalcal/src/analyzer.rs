//! What the calibration loop needs from a spectrum analyzer.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Result;

/// Peak marker of one sweep.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Measurement {
    pub frequency_hz: u64,
    pub signal_dbm: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Sweep {
    pub start_hz: u64,
    pub stop_hz: u64,
    pub points: u32,
}

impl Sweep {
    pub fn centered(center_hz: u64, half_width_hz: u64, points: u32) -> Self {
        Self {
            start_hz: center_hz.saturating_sub(half_width_hz),
            stop_hz: center_hz.saturating_add(half_width_hz),
            points,
        }
    }

    /// A peak here may belong to a carrier outside the window.
    pub fn at_edge(&self, hz: u64) -> bool {
        hz <= self.start_hz || hz >= self.stop_hz
    }
}

/// Resolution bandwidth. Stored in config files as kHz with 0 meaning auto.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum Rbw {
    #[default]
    Auto,
    Khz(u32),
}

impl From<u32> for Rbw {
    fn from(khz: u32) -> Self {
        match khz {
            0 => Rbw::Auto,
            khz => Rbw::Khz(khz),
        }
    }
}

impl From<Rbw> for u32 {
    fn from(rbw: Rbw) -> u32 {
        match rbw {
            Rbw::Auto => 0,
            Rbw::Khz(khz) => khz,
        }
    }
}

impl fmt::Display for Rbw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rbw::Auto => write!(f, "auto"),
            Rbw::Khz(khz) => write!(f, "{khz}"),
        }
    }
}

/// A swept-tuned analyzer driven one triggered scan at a time.
///
/// Every call blocks until the instrument has finished; `trigger_scan` in
/// particular returns only once the whole sweep is complete.
pub trait SpectrumAnalyzer {
    fn set_rbw(&mut self, rbw: Rbw) -> Result<()>;
    /// Turns off spur suppression, which otherwise slows every sweep.
    fn disable_spur(&mut self) -> Result<()>;
    fn configure_sweep(&mut self, sweep: &Sweep) -> Result<()>;
    /// Stops free-running sweeps so that scans only happen when triggered.
    fn pause(&mut self) -> Result<()>;
    fn resume(&mut self) -> Result<()>;
    fn trigger_scan(&mut self, sweep: &Sweep) -> Result<()>;
    /// Strongest point of the last sweep, if the instrument resolved one.
    fn fetch_peak_marker(&mut self) -> Result<Option<Measurement>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn centered_sweep() {
        let sweep = Sweep::centered(908_420_000, 30_000, 145);
        assert_eq!(sweep.start_hz, 908_390_000);
        assert_eq!(sweep.stop_hz, 908_450_000);
        assert!(sweep.at_edge(908_390_000));
        assert!(sweep.at_edge(908_450_000));
        assert!(!sweep.at_edge(908_449_999));
        assert!(!sweep.at_edge(908_420_000));
    }

    #[test]
    fn rbw_zero_is_auto() {
        assert_eq!(Rbw::from(0), Rbw::Auto);
        assert_eq!(Rbw::from(3), Rbw::Khz(3));
        assert_eq!(u32::from(Rbw::Auto), 0);
        assert_eq!(Rbw::Khz(1).to_string(), "1");
    }
}
