//! Simulated station hardware.
//!
//! [`SimDut`] answers the RailTest console commands the calibration uses and
//! models a crystal whose carrier drops by `hz_per_unit` for every trim step.
//! [`SimAnalyzer`] sweeps that same model. [`ScriptedConnector`] replays
//! canned console output, one chunk per command line written.

use std::{
    cell::{Ref, RefCell, RefMut},
    collections::VecDeque,
    io::{self, ErrorKind, Read, Write},
    rc::Rc,
};

use crate::{
    analyzer::{Measurement, Rbw, SpectrumAnalyzer, Sweep},
    channel::{Connector, Link},
    Error, Result, TrimValue,
};

/// Produces the console output for one line written by the host.
pub trait Responder {
    fn respond(&mut self, line: &str) -> String;
}

#[derive(Default, Debug)]
struct LinkLog {
    connects: usize,
    written: String,
}

pub struct SimLink<R> {
    input: VecDeque<u8>,
    line: Vec<u8>,
    responder: R,
    log: Rc<RefCell<LinkLog>>,
}

impl<R> Read for SimLink<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.input.is_empty() {
            return Err(io::Error::new(ErrorKind::TimedOut, "no data from simulated console"));
        }
        let n = buf.len().min(self.input.len());
        for (slot, byte) in buf.iter_mut().zip(self.input.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl<R: Responder> Write for SimLink<R> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            self.log.borrow_mut().written.push(char::from(byte));
            if byte == b'\n' || byte == b'\r' {
                if self.line.is_empty() {
                    continue;
                }
                let line = String::from_utf8_lossy(&self.line).into_owned();
                self.line.clear();
                let reply = self.responder.respond(&line);
                self.input.extend(reply.bytes());
            } else {
                self.line.push(byte);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<R: Responder> Link for SimLink<R> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.input.clear();
        Ok(())
    }
}

pub struct SimConnector<R> {
    responder: R,
    boot: String,
    unplugged: bool,
    log: Rc<RefCell<LinkLog>>,
}

impl<R> SimConnector<R> {
    pub fn new(responder: R) -> Self {
        Self {
            responder,
            boot: String::new(),
            unplugged: false,
            log: Rc::default(),
        }
    }

    /// Output already waiting on the line when the port is opened.
    pub fn with_boot(mut self, boot: &str) -> Self {
        self.boot = boot.to_string();
        self
    }

    pub fn unplugged(mut self) -> Self {
        self.unplugged = true;
        self
    }

    pub fn connects(&self) -> usize {
        self.log.borrow().connects
    }

    /// Every byte written on any link this connector handed out.
    pub fn written(&self) -> String {
        self.log.borrow().written.clone()
    }
}

impl<R: Responder + Clone> Connector for SimConnector<R> {
    type Link = SimLink<R>;

    fn connect(&mut self) -> Result<Self::Link> {
        if self.unplugged {
            return Err(Error::TransportNotFound("simulated port unplugged".into()));
        }
        self.log.borrow_mut().connects += 1;
        Ok(SimLink {
            input: self.boot.bytes().collect(),
            line: Vec::new(),
            responder: self.responder.clone(),
            log: self.log.clone(),
        })
    }

    fn describe(&self) -> String {
        "simulated".into()
    }
}

/// Canned replies handed out in order, one per non-empty line written.
#[derive(Clone, Debug, Default)]
pub struct Script(VecDeque<String>);

impl Responder for Script {
    fn respond(&mut self, _line: &str) -> String {
        self.0.pop_front().unwrap_or_default()
    }
}

pub type ScriptedConnector = SimConnector<Script>;

impl ScriptedConnector {
    pub fn scripted(replies: &[&str]) -> Self {
        SimConnector::new(Script(replies.iter().map(|r| r.to_string()).collect()))
    }
}

#[derive(Debug, Clone)]
pub struct DutState {
    pub trim: TrimValue,
    /// Trim at which the carrier sits exactly on `nominal_hz`.
    pub zero_trim: TrimValue,
    pub hz_per_unit: i64,
    pub nominal_hz: u64,
    pub signal_dbm: f64,
    pub tone: bool,
    /// Accept `setctune` but keep the old value.
    pub stuck: bool,
    pub version: String,
    /// Go silent once this many commands have been received.
    pub answer_limit: Option<usize>,
    /// Lines printed ahead of the next command echo.
    pub noise: VecDeque<String>,
    pub commands: Vec<String>,
    pub trim_writes: Vec<TrimValue>,
}

impl DutState {
    pub fn carrier_hz(&self) -> u64 {
        let offset = (i64::from(self.zero_trim) - i64::from(self.trim)) * self.hz_per_unit;
        self.nominal_hz.saturating_add_signed(offset)
    }
}

fn reply(command: &str, fields: &[(&str, String)]) -> String {
    let mut out = format!("{{{{({command})}}");
    for (key, value) in fields {
        out += &format!("{{{key}:{value}}}");
    }
    out.push('}');
    out
}

fn ctune_reply(command: &str, trim: TrimValue) -> String {
    reply(
        command,
        &[
            ("CTUNEXIANA", format!("0x{trim:03x}")),
            ("CTUNEXOANA", format!("0x{:03x}", trim.saturating_add(40))),
        ],
    )
}

/// A RailTest console on a simulated radio module.
#[derive(Clone, Debug)]
pub struct SimDut(Rc<RefCell<DutState>>);

impl SimDut {
    pub fn new(nominal_hz: u64, trim: TrimValue, zero_trim: TrimValue) -> Self {
        Self(Rc::new(RefCell::new(DutState {
            trim,
            zero_trim,
            hz_per_unit: 1500,
            nominal_hz,
            signal_dbm: -8.0,
            tone: false,
            stuck: false,
            version: "2.15.0".into(),
            answer_limit: None,
            noise: VecDeque::new(),
            commands: Vec::new(),
            trim_writes: Vec::new(),
        })))
    }

    pub fn state(&self) -> Ref<'_, DutState> {
        self.0.borrow()
    }

    pub fn state_mut(&self) -> RefMut<'_, DutState> {
        self.0.borrow_mut()
    }

    pub fn connector(&self) -> SimConnector<SimDut> {
        SimConnector::new(self.clone()).with_boot("\u{0}\u{fffd}RAIL Test App\r\n> ")
    }

    pub fn analyzer(&self) -> SimAnalyzer {
        SimAnalyzer::new(self.clone())
    }
}

impl Responder for SimDut {
    fn respond(&mut self, line: &str) -> String {
        let mut dut = self.0.borrow_mut();
        dut.commands.push(line.to_string());
        if dut.answer_limit.is_some_and(|limit| dut.commands.len() > limit) {
            return String::new();
        }

        let mut words = line.split_whitespace();
        let name = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();
        let arg = args.first().copied().unwrap_or_default();
        let response = match name {
            "getversion" => reply(
                name,
                &[
                    ("App", "RAIL Test App".into()),
                    ("RAIL", dut.version.clone()),
                ],
            ),
            "getctune" => ctune_reply(name, dut.trim),
            "setctune" => match arg.parse() {
                Ok(trim) => {
                    dut.trim_writes.push(trim);
                    if !dut.stuck {
                        dut.trim = trim;
                    }
                    ctune_reply(name, dut.trim)
                }
                Err(_) => reply("error", &[("Message", "Invalid argument".into())]),
            },
            "rx" => reply(
                name,
                &[("Rx", "Disabled".into()), ("Idle", "Enabled".into())],
            ),
            "setzwavemode" => reply(name, &[("ZWaveMode", "Enabled".into())]),
            "setzwaveregion" => reply(name, &[("ZWaveRegion", arg.into())]),
            "setchannel" => reply(name, &[("channel", arg.into())]),
            "SetTxTone" => {
                dut.tone = arg == "1";
                let mode = if dut.tone { "ToneOn" } else { "ToneOff" };
                reply(name, &[("Mode", mode.into())])
            }
            _ => reply("error", &[("Message", "Unknown command".into())]),
        };

        let mut out: String = dut.noise.drain(..).map(|l| l + "\r\n").collect();
        out += &format!("{line}\r\n{response}\r\n");
        out
    }
}

/// Strongest point of a sweep over a lone carrier. A carrier just outside
/// the window still peaks at the nearest edge, 1 dB weaker per kHz away.
fn peak(sweep: &Sweep, carrier_hz: u64, signal_dbm: f64) -> Option<Measurement> {
    let edge_hz = carrier_hz.clamp(sweep.start_hz, sweep.stop_hz);
    let signal_dbm = signal_dbm - carrier_hz.abs_diff(edge_hz) as f64 / 1_000.0;
    (signal_dbm > -90.0).then_some(Measurement {
        frequency_hz: edge_hz,
        signal_dbm,
    })
}

/// An analyzer that sees the carrier of a [`SimDut`] while its tone is on.
pub struct SimAnalyzer {
    dut: SimDut,
    /// Served instead of the modelled carrier for the next tone-on scans.
    pub readings: VecDeque<Option<Measurement>>,
    /// Fail the n-th scan (1-based, the baseline scan included).
    pub fail_on_scan: Option<usize>,
    pub rbw: Option<Rbw>,
    pub spur_disabled: bool,
    pub sweep: Option<Sweep>,
    pub paused: bool,
    pub resumes: usize,
    pub scans: usize,
    pub tone_scans: usize,
    last: Option<Measurement>,
}

impl SimAnalyzer {
    pub fn new(dut: SimDut) -> Self {
        Self {
            dut,
            readings: VecDeque::new(),
            fail_on_scan: None,
            rbw: None,
            spur_disabled: false,
            sweep: None,
            paused: false,
            resumes: 0,
            scans: 0,
            tone_scans: 0,
            last: None,
        }
    }

    pub fn with_readings(mut self, readings: impl IntoIterator<Item = Option<Measurement>>) -> Self {
        self.readings.extend(readings);
        self
    }
}

impl SpectrumAnalyzer for SimAnalyzer {
    fn set_rbw(&mut self, rbw: Rbw) -> Result<()> {
        self.rbw = Some(rbw);
        Ok(())
    }

    fn disable_spur(&mut self) -> Result<()> {
        self.spur_disabled = true;
        Ok(())
    }

    fn configure_sweep(&mut self, sweep: &Sweep) -> Result<()> {
        self.sweep = Some(*sweep);
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.paused = true;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.paused = false;
        self.resumes += 1;
        Ok(())
    }

    fn trigger_scan(&mut self, sweep: &Sweep) -> Result<()> {
        self.scans += 1;
        if self.fail_on_scan == Some(self.scans) {
            self.last = None;
            return Err(Error::Instrument("sweep aborted".into()));
        }
        let (tone, carrier_hz, signal_dbm) = {
            let dut = self.dut.state();
            (dut.tone, dut.carrier_hz(), dut.signal_dbm)
        };
        self.last = if tone {
            self.tone_scans += 1;
            self.readings
                .pop_front()
                .unwrap_or_else(|| peak(sweep, carrier_hz, signal_dbm))
        } else {
            None
        };
        Ok(())
    }

    fn fetch_peak_marker(&mut self) -> Result<Option<Measurement>> {
        Ok(self.last)
    }
}
