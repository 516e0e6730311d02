//! RailTest console protocol.
//!
//! The firmware echoes every command line, then prints one reply line of
//! the form `{{(command)}{Key:Value}{Key:Value}}`. Boot banners and line
//! noise can show up ahead of the echo, so a transaction skips unrelated
//! lines until it sees the echo, up to a fixed number of them.

use tracing::{debug, info};

use crate::{
    channel::{Channel, Connector},
    config::{DutConfig, ToneSetup},
    Error, Result, TrimValue,
};

/// Unrelated lines tolerated ahead of a command echo.
pub const ECHO_SCAN_LIMIT: usize = 10;

/// Where a transaction is between writing the command and returning.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    ScanningEcho { lines: usize },
    AwaitingResponse,
}

/// A parsed reply line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub command: String,
    pub fields: Vec<(String, String)>,
}

impl Reply {
    pub fn parse(line: &str) -> Result<Reply> {
        let malformed = || Error::Parse {
            field: "reply",
            response: line.to_string(),
        };
        let start = line.find("{{").ok_or_else(malformed)?;
        let body = line[start + 1..]
            .trim_end()
            .strip_suffix('}')
            .ok_or_else(malformed)?;

        let mut groups = Vec::new();
        let mut rest = body;
        while let Some(open) = rest.find('{') {
            let close = rest[open..].find('}').ok_or_else(malformed)? + open;
            groups.push(&rest[open + 1..close]);
            rest = &rest[close + 1..];
        }

        let (head, tail) = groups.split_first().ok_or_else(malformed)?;
        let command = head
            .strip_prefix('(')
            .and_then(|h| h.strip_suffix(')'))
            .ok_or_else(malformed)?;
        let fields = tail
            .iter()
            .map(|group| {
                group
                    .split_once(':')
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .ok_or_else(malformed)
            })
            .collect::<Result<_>>()?;

        Ok(Reply {
            command: command.to_string(),
            fields,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

fn parse_trim(value: &str) -> Option<TrimValue> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => TrimValue::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// A RailTest module reached through a borrowed [`Channel`].
pub struct Dut<'c, C: Connector> {
    channel: &'c mut Channel<C>,
    echo_scan_limit: usize,
    expected_version: Option<String>,
}

impl<'c, C: Connector> Dut<'c, C> {
    pub fn new(channel: &'c mut Channel<C>) -> Self {
        Self {
            channel,
            echo_scan_limit: ECHO_SCAN_LIMIT,
            expected_version: None,
        }
    }

    pub fn from_config(channel: &'c mut Channel<C>, config: &DutConfig) -> Self {
        Self {
            channel,
            echo_scan_limit: config.echo_scan_limit,
            expected_version: config.expected_version.clone(),
        }
    }

    pub fn expect_version(mut self, version: impl Into<String>) -> Self {
        self.expected_version = Some(version.into());
        self
    }

    pub fn channel_mut(&mut self) -> &mut Channel<C> {
        self.channel
    }

    /// Runs one command and returns its reply line.
    ///
    /// Fails with [`Error::NoEcho`] when more than `echo_scan_limit` unrelated
    /// lines arrive ahead of the echo, and with [`Error::Mismatch`] when the
    /// line after the echo does not mention the command's first word.
    pub fn send(&mut self, command: &str) -> Result<String> {
        let token = command.split_whitespace().next().unwrap_or(command);
        self.channel.write_line(command)?;

        let mut phase = Phase::ScanningEcho { lines: 0 };
        loop {
            match phase {
                Phase::ScanningEcho { lines } if lines > self.echo_scan_limit => {
                    return Err(Error::NoEcho {
                        command: command.to_string(),
                        attempts: lines,
                    });
                }
                Phase::ScanningEcho { lines } => {
                    let line = self.channel.read_line()?;
                    phase = if line.contains(command) {
                        Phase::AwaitingResponse
                    } else {
                        debug!(command, skipped = %line, "waiting for echo");
                        Phase::ScanningEcho { lines: lines + 1 }
                    };
                }
                Phase::AwaitingResponse => {
                    let response = self.channel.read_line()?;
                    if !response.contains(token) {
                        return Err(Error::Mismatch {
                            command: command.to_string(),
                            response,
                        });
                    }
                    debug!(command, %response);
                    return Ok(response);
                }
            }
        }
    }

    pub fn version(&mut self) -> Result<String> {
        self.send("getversion")
    }

    /// Confirms the module is running a RailTest build we can talk to.
    pub fn handshake(&mut self) -> Result<String> {
        let found = self.version()?;
        if let Some(expected) = &self.expected_version {
            if !found.contains(expected.as_str()) {
                return Err(Error::Version {
                    expected: expected.clone(),
                    found,
                });
            }
        }
        info!(version = %found, "RailTest ready");
        Ok(found)
    }

    pub fn get_trim(&mut self) -> Result<TrimValue> {
        let response = self.send("getctune")?;
        let reply = Reply::parse(&response)?;
        reply
            .get("CTUNEXIANA")
            .and_then(parse_trim)
            .ok_or(Error::Parse {
                field: "CTUNEXIANA",
                response,
            })
    }

    /// Writes the trim. The reply is not checked against the new value.
    pub fn set_trim(&mut self, trim: TrimValue) -> Result<()> {
        self.send("rx 0")?;
        self.send(&format!("setctune {trim}"))?;
        Ok(())
    }

    /// Puts the radio on the carrier channel with the receiver idle.
    pub fn setup_tone(&mut self, tone: &ToneSetup) -> Result<()> {
        let [mode, option] = tone.zwave_mode;
        self.send("rx 0")?;
        self.send(&format!("setzwavemode {mode} {option}"))?;
        self.send(&format!("setzwaveregion {}", tone.region))?;
        self.send(&format!("setchannel {}", tone.channel))?;
        Ok(())
    }

    pub fn start_tone(&mut self) -> Result<()> {
        self.send("SetTxTone 1").map(drop)
    }

    pub fn stop_tone(&mut self) -> Result<()> {
        self.send("SetTxTone 0").map(drop)
    }
}
