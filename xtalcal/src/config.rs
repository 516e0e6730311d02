//! Station configuration, normally read from a TOML file.
//!
//! ```toml
//! [dut]
//! port = "/dev/ttyACM0"
//! expected_version = "2.15"
//!
//! [analyzer]
//! vid = 0x0483
//! pid = 0x5740
//!
//! [calibration]
//! target_hz = 908_420_000
//! tolerance_hz = 1_000
//! min_signal_dbm = -20.0
//!
//! [calibration.tone]
//! zwave_mode = [1, 3]
//! region = 1
//! channel = 2
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{
    analyzer::{Rbw, Sweep},
    channel::{ChannelOptions, LineEnding, SerialConnector},
    Error, Result,
};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StationConfig {
    pub dut: DutConfig,
    pub analyzer: AnalyzerConfig,
    pub calibration: CalibrationConfig,
}

impl StationConfig {
    pub fn from_toml(contents: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dut.echo_scan_limit == 0 {
            return Err(Error::Invalid("dut.echo_scan_limit must be at least 1".into()));
        }
        self.calibration.validate()
    }
}

/// Serial console of the module under test.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DutConfig {
    /// Fixed port path. When absent the port is found by `vid`/`pid`.
    pub port: Option<String>,
    pub vid: u16,
    pub pid: u16,
    pub baud: u32,
    pub read_timeout_ms: u64,
    pub settle_ms: u64,
    /// Unrelated lines skipped while looking for the command echo.
    pub echo_scan_limit: usize,
    /// Substring the `getversion` reply must contain.
    pub expected_version: Option<String>,
}

impl Default for DutConfig {
    fn default() -> Self {
        Self {
            port: None,
            // Silicon Labs WSTK
            vid: 0x1366,
            pid: 0x0105,
            baud: 115_200,
            read_timeout_ms: 3_000,
            settle_ms: 500,
            echo_scan_limit: 10,
            expected_version: None,
        }
    }
}

impl DutConfig {
    pub fn connector(&self) -> Result<SerialConnector> {
        let timeout = Duration::from_millis(self.read_timeout_ms);
        match &self.port {
            Some(path) => Ok(SerialConnector::new(path.clone(), self.baud, timeout)),
            None => SerialConnector::locate(self.vid, self.pid, self.baud, timeout),
        }
    }

    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            settle: Duration::from_millis(self.settle_ms),
            ending: LineEnding::Lf,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalyzerConfig {
    pub port: Option<String>,
    pub vid: u16,
    pub pid: u16,
    pub baud: u32,
    /// Must cover the longest sweep.
    pub read_timeout_ms: u64,
    pub settle_ms: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            port: None,
            // tinySA (STM32 virtual COM port)
            vid: 0x0483,
            pid: 0x5740,
            baud: 115_200,
            read_timeout_ms: 5_000,
            settle_ms: 100,
        }
    }
}

impl AnalyzerConfig {
    pub fn connector(&self) -> Result<SerialConnector> {
        let timeout = Duration::from_millis(self.read_timeout_ms);
        let located = match &self.port {
            Some(path) => Ok(SerialConnector::new(path.clone(), self.baud, timeout)),
            None => SerialConnector::locate(self.vid, self.pid, self.baud, timeout),
        };
        located.map_err(|err| Error::InstrumentUnavailable(err.to_string()))
    }

    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            settle: Duration::from_millis(self.settle_ms),
            ending: LineEnding::Cr,
        }
    }
}

/// RailTest settings that put the radio on the calibration channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToneSetup {
    pub zwave_mode: [u8; 2],
    pub region: u8,
    pub channel: u8,
}

impl Default for ToneSetup {
    fn default() -> Self {
        // US region, channel 2 = 908.42 MHz
        Self {
            zwave_mode: [1, 3],
            region: 1,
            channel: 2,
        }
    }
}

/// Everything one calibration session needs, fixed for its whole run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CalibrationConfig {
    pub target_hz: u64,
    /// Converged when the carrier is within `target_hz ± tolerance_hz`.
    pub tolerance_hz: u64,
    /// Weaker markers are ignored; they are noise or a neighbouring station.
    pub min_signal_dbm: f64,
    pub max_trials: u32,
    pub step_min: u16,
    pub step_max: u16,
    /// Frequency error that maps to one trim step.
    pub hz_per_step: u64,
    pub sweep_half_width_hz: u64,
    pub sweep_points: u32,
    pub rbw: Rbw,
    /// Read the trim back after every write.
    pub verify_writes: bool,
    pub tone: ToneSetup,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            target_hz: 908_420_000,
            tolerance_hz: 1_000,
            min_signal_dbm: -20.0,
            max_trials: 12,
            step_min: 1,
            step_max: 30,
            hz_per_step: 1_500,
            sweep_half_width_hz: 30_000,
            sweep_points: 145,
            rbw: Rbw::Khz(1),
            verify_writes: true,
            tone: ToneSetup::default(),
        }
    }
}

impl CalibrationConfig {
    pub fn sweep(&self) -> Sweep {
        Sweep::centered(self.target_hz, self.sweep_half_width_hz, self.sweep_points)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_trials == 0 {
            return Err(Error::Invalid("max_trials must be at least 1".into()));
        }
        if self.hz_per_step == 0 {
            return Err(Error::Invalid("hz_per_step must be non-zero".into()));
        }
        if self.step_min == 0 || self.step_min > self.step_max {
            return Err(Error::Invalid(format!(
                "step range [{}, {}] is empty or allows zero steps",
                self.step_min, self.step_max
            )));
        }
        if self.tolerance_hz > self.sweep_half_width_hz {
            return Err(Error::Invalid("tolerance is wider than the sweep".into()));
        }
        if self.sweep_points < 2 {
            return Err(Error::Invalid("sweep needs at least two points".into()));
        }
        Ok(())
    }
}
