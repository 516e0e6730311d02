//! Line-oriented duplex transport to a serial console.
//!
//! A [`Channel`] owns at most one open [`Link`] and knows how to (re)open it
//! through its [`Connector`]. Reads are bounded by the link's own timeout.

use serialport::{ClearBuffer, SerialPort, SerialPortType};
use std::{
    io::{self, BufRead, BufReader, ErrorKind, Read, Write},
    thread,
    time::Duration,
};
use tracing::{debug, trace};

use crate::{Error, Result};

/// A byte stream whose reads give up after a fixed timeout.
pub trait Link: Read + Write {
    /// Drops everything the other side has sent but we have not read yet.
    fn discard_input(&mut self) -> io::Result<()>;
}

impl Link for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

pub trait Connector {
    type Link: Link;
    fn connect(&mut self) -> Result<Self::Link>;
    fn describe(&self) -> String;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerialConnector {
    pub path: String,
    pub baud: u32,
    pub timeout: Duration,
}

impl SerialConnector {
    pub fn new(path: impl Into<String>, baud: u32, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            baud,
            timeout,
        }
    }

    /// Finds the first USB serial port with the given VID:PID.
    pub fn locate(vid: u16, pid: u16, baud: u32, timeout: Duration) -> Result<Self> {
        Ok(Self::new(find_port(vid, pid)?, baud, timeout))
    }
}

impl Connector for SerialConnector {
    type Link = Box<dyn SerialPort>;

    fn connect(&mut self) -> Result<Self::Link> {
        serialport::new(&self.path, self.baud)
            .timeout(self.timeout)
            .open()
            .map_err(|err| open_error(&self.path, err))
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.path, self.baud)
    }
}

fn open_error(path: &str, err: serialport::Error) -> Error {
    match err.kind() {
        serialport::ErrorKind::NoDevice | serialport::ErrorKind::Io(ErrorKind::NotFound) => {
            Error::TransportNotFound(format!("{path}: {err}"))
        }
        _ => Error::PortBusy(format!("{path}: {err}")),
    }
}

pub fn find_port(vid: u16, pid: u16) -> Result<String> {
    let ports = serialport::available_ports()
        .map_err(|err| Error::TransportNotFound(format!("enumerating ports: {err}")))?;
    ports
        .into_iter()
        .find_map(|port| match port.port_type {
            SerialPortType::UsbPort(info) if info.vid == vid && info.pid == pid => {
                Some(port.port_name)
            }
            _ => None,
        })
        .ok_or_else(|| Error::TransportNotFound(format!("no USB device {vid:04x}:{pid:04x}")))
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LineEnding {
    #[default]
    Lf,
    Cr,
}

impl LineEnding {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            LineEnding::Lf => b"\n",
            LineEnding::Cr => b"\r",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Wait after waking the console before purging its boot output.
    pub settle: Duration,
    pub ending: LineEnding,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(500),
            ending: LineEnding::Lf,
        }
    }
}

pub struct Channel<C: Connector> {
    connector: C,
    options: ChannelOptions,
    link: Option<BufReader<C::Link>>,
}

impl<C: Connector> Channel<C> {
    /// Creates a closed channel; see [`Channel::ensure_open`].
    pub fn new(connector: C, options: ChannelOptions) -> Self {
        Self {
            connector,
            options,
            link: None,
        }
    }

    pub fn open(connector: C, options: ChannelOptions) -> Result<Self> {
        let mut channel = Self::new(connector, options);
        channel.ensure_open()?;
        Ok(channel)
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    #[cfg(test)]
    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn ensure_open(&mut self) -> Result<()> {
        if self.link.is_some() {
            return Ok(());
        }
        let mut link = self.connector.connect()?;
        // Nudge the console, let it finish booting, then throw away the banner
        link.write_all(self.options.ending.as_bytes())?;
        link.flush()?;
        thread::sleep(self.options.settle);
        link.discard_input()?;
        debug!(port = %self.connector.describe(), "channel open");
        self.link = Some(BufReader::new(link));
        Ok(())
    }

    /// Releases the link. Closing a closed channel does nothing.
    pub fn close(&mut self) {
        if self.link.take().is_some() {
            debug!(port = %self.connector.describe(), "channel closed");
        }
    }

    fn link(&mut self) -> Result<&mut BufReader<C::Link>> {
        self.link.as_mut().ok_or(Error::ChannelClosed)
    }

    pub fn write_line(&mut self, text: &str) -> Result<()> {
        let ending = self.options.ending;
        let port = self.link()?.get_mut();
        port.write_all(text.as_bytes())?;
        port.write_all(ending.as_bytes())?;
        port.flush()?;
        trace!(">> {text}");
        Ok(())
    }

    /// Reads one `\n` terminated line, without its line ending.
    pub fn read_line(&mut self) -> Result<String> {
        let line = self.read_until(b"\n")?;
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        trace!("<< {line}");
        Ok(line)
    }

    /// Reads until the input ends with `delim` and returns everything read,
    /// `delim` included. Invalid UTF-8 is replaced rather than rejected since
    /// consoles emit garbage while booting.
    pub fn read_until(&mut self, delim: &[u8]) -> Result<String> {
        let Some(&last) = delim.last() else {
            return Ok(String::new());
        };
        let reader = self.link()?;
        let mut buf = Vec::new();
        loop {
            match reader.read_until(last, &mut buf) {
                // Nothing more is coming on a drained link
                Ok(0) => return Err(Error::Timeout),
                Ok(_) if buf.ends_with(delim) => break,
                Ok(_) => {}
                Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    return Err(Error::Timeout)
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
