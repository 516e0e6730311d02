//! tinySA spectrum analyzer over its USB serial shell.
//!
//! Commands are `\r` terminated. The shell echoes the command, prints any
//! output lines and finishes with the `ch> ` prompt.

use tracing::debug;

use crate::{
    analyzer::{Measurement, Rbw, SpectrumAnalyzer, Sweep},
    channel::{Channel, ChannelOptions, Connector},
    Error, Result,
};

const PROMPT: &[u8] = b"ch> ";

pub struct TinySa<C: Connector> {
    channel: Channel<C>,
}

fn unavailable(err: Error) -> Error {
    match err {
        Error::TransportNotFound(msg) | Error::PortBusy(msg) => Error::InstrumentUnavailable(msg),
        err => Error::InstrumentUnavailable(err.to_string()),
    }
}

impl<C: Connector> TinySa<C> {
    pub fn open(connector: C, options: ChannelOptions) -> Result<Self> {
        let channel = Channel::open(connector, options).map_err(unavailable)?;
        Ok(Self { channel })
    }

    pub fn close(&mut self) {
        self.channel.close();
    }

    /// Runs a shell command and returns its output lines.
    pub fn command(&mut self, command: &str) -> Result<Vec<String>> {
        let failed = |err: Error| Error::Instrument(format!("{command}: {err}"));
        self.channel.write_line(command).map_err(failed)?;
        let text = self.channel.read_until(PROMPT).map_err(failed)?;

        let text = text.strip_suffix("ch> ").unwrap_or(&text);
        let mut lines = text.lines().map(str::trim).filter(|line| !line.is_empty());
        // Output starts after the echo; without one the shell is out of step
        if !lines.any(|line| line.contains(command)) {
            return Err(Error::Instrument(format!("{command}: no echo")));
        }
        let lines: Vec<String> = lines.map(str::to_string).collect();

        // Unknown commands come back as "name?"
        let name = command.split_whitespace().next().unwrap_or(command);
        if lines.first().is_some_and(|line| *line == format!("{name}?")) {
            return Err(Error::Instrument(format!("{command}: not understood")));
        }
        debug!(command, output = ?lines, "tinySA");
        Ok(lines)
    }
}

/// Parses `marker` output: `<id> <index> <frequency> <level>`.
fn parse_marker(line: &str) -> Option<Measurement> {
    let mut fields = line.split_whitespace().skip(2);
    let frequency: f64 = fields.next()?.parse().ok()?;
    let level: f64 = fields.next()?.parse().ok()?;
    (frequency.is_finite() && frequency > 0.0).then_some(Measurement {
        frequency_hz: frequency.round() as u64,
        signal_dbm: level,
    })
}

impl<C: Connector> SpectrumAnalyzer for TinySa<C> {
    fn set_rbw(&mut self, rbw: Rbw) -> Result<()> {
        self.command(&format!("rbw {rbw}")).map(drop)
    }

    fn disable_spur(&mut self) -> Result<()> {
        self.command("spur off").map(drop)
    }

    fn configure_sweep(&mut self, sweep: &Sweep) -> Result<()> {
        self.command(&format!("sweep start {}", sweep.start_hz))?;
        self.command(&format!("sweep stop {}", sweep.stop_hz))?;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.command("pause").map(drop)
    }

    fn resume(&mut self) -> Result<()> {
        self.command("resume").map(drop)
    }

    fn trigger_scan(&mut self, sweep: &Sweep) -> Result<()> {
        self.command(&format!(
            "scan {} {} {}",
            sweep.start_hz, sweep.stop_hz, sweep.points
        ))
        .map(drop)
    }

    fn fetch_peak_marker(&mut self) -> Result<Option<Measurement>> {
        self.command("marker 1 peak")?;
        let output = self.command("marker 1")?;
        Ok(output.iter().find_map(|line| parse_marker(line)))
    }
}
