//! CmdMessenger wire format.
//!
//! The measurement boards run the Arduino CmdMessenger library. Every message
//! is a numeric command id followed by optional arguments:
//!
//! ```text
//! <id>[,<arg>]*;
//! ```
//!
//! Arguments may carry binary data (little-endian floats and int16s), so any
//! separator, escape or NUL byte inside an argument is prefixed with `/`.
//! Command ids are positions in a command table that must match the enum
//! compiled into the firmware, which is why each board profile has its own
//! table.

use std::fmt;
use std::io::{ErrorKind, Read};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};

pub const FIELD_SEPARATOR: u8 = b',';
pub const COMMAND_SEPARATOR: u8 = b';';
pub const ESCAPE_CHARACTER: u8 = b'/';

/// Upper bound on a single framed message; anything longer is line noise.
const MAX_FRAME_LEN: usize = 256;

// ============================================================================
// Command table
// ============================================================================

/// Argument format of a command, mirroring the PyCmdMessenger format letters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgFormat {
    /// No arguments (`""`).
    None,
    /// Text argument (`"s"`).
    Str,
    /// Binary 32-bit float (`"f"`).
    Float,
    /// Binary 16-bit signed integer (`"i"`).
    Int16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    pub format: ArgFormat,
}

const fn cmd(name: &'static str, format: ArgFormat) -> CommandSpec {
    CommandSpec { name, format }
}

/// Board firmware variants. Each one compiles a different command enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BoardProfile {
    /// LiPo cell charging evaluation: cell voltage and charge current.
    #[default]
    ChargingEvaluation,
    /// Four voltage channels, each with a 1:1 / 1:10 divider switch.
    FourChannelVoltage,
    /// Single DS18B20 temperature sensor.
    Temperature,
}

impl BoardProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            BoardProfile::ChargingEvaluation => "charging-evaluation",
            BoardProfile::FourChannelVoltage => "four-channel-voltage",
            BoardProfile::Temperature => "temperature",
        }
    }
}

impl fmt::Display for BoardProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BoardProfile {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "charging-evaluation" | "charging" => Ok(BoardProfile::ChargingEvaluation),
            "four-channel-voltage" | "four-channel" => Ok(BoardProfile::FourChannelVoltage),
            "temperature" => Ok(BoardProfile::Temperature),
            other => Err(DriverError::Config(format!(
                "unknown board profile '{other}' (expected charging-evaluation, four-channel-voltage or temperature)"
            ))),
        }
    }
}

/// Ordered command vocabulary; a command's id is its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTable {
    commands: Vec<CommandSpec>,
}

impl CommandTable {
    pub fn new(commands: Vec<CommandSpec>) -> Self {
        Self { commands }
    }

    /// Table matching the firmware of the given board.
    pub fn for_profile(profile: BoardProfile) -> Self {
        let mut commands = vec![
            cmd("commError", ArgFormat::None),
            cmd("comment", ArgFormat::None),
            cmd("sendAcknowledge", ArgFormat::Str),
            cmd("areYouReady", ArgFormat::None),
            cmd("error", ArgFormat::Str),
            cmd("askUsIfReady", ArgFormat::None),
            cmd("youAreReady", ArgFormat::None),
        ];
        match profile {
            BoardProfile::ChargingEvaluation => {
                commands.push(cmd("sendMeasuredVoltage", ArgFormat::None));
                commands.push(cmd("sendMeasuredCurrent", ArgFormat::None));
            }
            BoardProfile::FourChannelVoltage => {
                commands.push(cmd("sendMeasuredVoltage1", ArgFormat::None));
                commands.push(cmd("sendMeasuredVoltage2", ArgFormat::None));
                commands.push(cmd("sendMeasuredVoltage3", ArgFormat::None));
                commands.push(cmd("sendMeasuredVoltage4", ArgFormat::None));
                commands.push(cmd("sendSwitchStatus1", ArgFormat::None));
                commands.push(cmd("sendSwitchStatus2", ArgFormat::None));
                commands.push(cmd("sendSwitchStatus3", ArgFormat::None));
                commands.push(cmd("sendSwitchStatus4", ArgFormat::None));
            }
            BoardProfile::Temperature => {
                commands.push(cmd("sendMeasuredTemperature", ArgFormat::None));
            }
        }
        commands.extend([
            cmd("turnOnMeasurements", ArgFormat::None),
            cmd("turnOffMeasurements", ArgFormat::None),
            cmd("resetMeasurements", ArgFormat::None),
            cmd("floatValue", ArgFormat::Float),
            cmd("int16Value", ArgFormat::Int16),
        ]);
        Self::new(commands)
    }

    pub fn id_of(&self, name: &str) -> Option<u8> {
        self.commands
            .iter()
            .position(|c| c.name == name)
            .and_then(|pos| u8::try_from(pos).ok())
    }

    pub fn spec(&self, id: u8) -> Option<&CommandSpec> {
        self.commands.get(id as usize)
    }

    pub fn name_of(&self, id: u8) -> Option<&'static str> {
        self.spec(id).map(|c| c.name)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Measurement requests that expect a value back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    MeasuredVoltage,
    /// Voltage of channel 1-4 on the four-channel board.
    MeasuredVoltageChannel(u8),
    MeasuredCurrent,
    MeasuredTemperature,
    /// Divider switch position of channel 1-4 (1 = 1:1, otherwise 1:10).
    SwitchStatus(u8),
}

impl Request {
    pub fn command_name(&self) -> String {
        match self {
            Request::MeasuredVoltage => "sendMeasuredVoltage".to_string(),
            Request::MeasuredVoltageChannel(ch) => format!("sendMeasuredVoltage{ch}"),
            Request::MeasuredCurrent => "sendMeasuredCurrent".to_string(),
            Request::MeasuredTemperature => "sendMeasuredTemperature".to_string(),
            Request::SwitchStatus(ch) => format!("sendSwitchStatus{ch}"),
        }
    }

    /// Command the board answers with.
    pub fn reply_name(&self) -> &'static str {
        match self {
            Request::SwitchStatus(_) => "int16Value",
            _ => "floatValue",
        }
    }
}

/// Commands that only expect an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    TurnOn,
    TurnOff,
    Reset,
}

impl Control {
    pub fn command_name(&self) -> &'static str {
        match self {
            Control::TurnOn => "turnOnMeasurements",
            Control::TurnOff => "turnOffMeasurements",
            Control::Reset => "resetMeasurements",
        }
    }
}

// ============================================================================
// Frames
// ============================================================================

/// A typed argument to encode into a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Str(String),
    Float(f32),
    Int16(i16),
}

impl Arg {
    fn raw_bytes(&self) -> Vec<u8> {
        match self {
            Arg::Str(s) => s.as_bytes().to_vec(),
            Arg::Float(v) => v.to_le_bytes().to_vec(),
            Arg::Int16(v) => v.to_le_bytes().to_vec(),
        }
    }
}

/// A decoded message: command id plus unescaped raw argument fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command_id: u8,
    pub args: Vec<Vec<u8>>,
}

impl Frame {
    pub fn new(command_id: u8, args: Vec<Vec<u8>>) -> Self {
        Self { command_id, args }
    }

    pub fn float_arg(&self, index: usize) -> Result<f32> {
        let raw = self.arg(index)?;
        let bytes: [u8; 4] = raw.try_into().map_err(|_| {
            DriverError::Protocol(format!(
                "float argument {index} has {} bytes, expected 4",
                raw.len()
            ))
        })?;
        Ok(f32::from_le_bytes(bytes))
    }

    pub fn int16_arg(&self, index: usize) -> Result<i16> {
        let raw = self.arg(index)?;
        let bytes: [u8; 2] = raw.try_into().map_err(|_| {
            DriverError::Protocol(format!(
                "int16 argument {index} has {} bytes, expected 2",
                raw.len()
            ))
        })?;
        Ok(i16::from_le_bytes(bytes))
    }

    pub fn str_arg(&self, index: usize) -> Result<String> {
        Ok(String::from_utf8_lossy(self.arg(index)?).into_owned())
    }

    fn arg(&self, index: usize) -> Result<&[u8]> {
        self.args.get(index).map(Vec::as_slice).ok_or_else(|| {
            DriverError::Protocol(format!(
                "command {} carries {} argument(s), wanted index {index}",
                self.command_id,
                self.args.len()
            ))
        })
    }
}

fn needs_escape(byte: u8) -> bool {
    matches!(
        byte,
        FIELD_SEPARATOR | COMMAND_SEPARATOR | ESCAPE_CHARACTER | 0
    )
}

/// Encode a complete message, terminator included.
pub fn encode_frame(command_id: u8, args: &[Arg]) -> Vec<u8> {
    let mut out = command_id.to_string().into_bytes();
    for arg in args {
        out.push(FIELD_SEPARATOR);
        for byte in arg.raw_bytes() {
            if needs_escape(byte) {
                out.push(ESCAPE_CHARACTER);
            }
            out.push(byte);
        }
    }
    out.push(COMMAND_SEPARATOR);
    out
}

/// Decode a message body (terminator already stripped).
pub fn decode_frame(body: &[u8]) -> Result<Frame> {
    let mut fields: Vec<Vec<u8>> = vec![Vec::new()];
    let mut escaped = false;
    for &byte in body {
        if escaped {
            if let Some(field) = fields.last_mut() {
                field.push(byte);
            }
            escaped = false;
        } else if byte == ESCAPE_CHARACTER {
            escaped = true;
        } else if byte == FIELD_SEPARATOR {
            fields.push(Vec::new());
        } else if let Some(field) = fields.last_mut() {
            field.push(byte);
        }
    }
    if escaped {
        return Err(DriverError::Protocol("dangling escape character".into()));
    }

    let mut fields = fields.into_iter();
    let id_field = fields.next().unwrap_or_default();
    let id_text = String::from_utf8_lossy(&id_field);
    let id_text = id_text.trim_matches(|c: char| c.is_ascii_whitespace());
    let command_id = id_text
        .parse::<u8>()
        .map_err(|_| DriverError::Protocol(format!("invalid command id '{id_text}'")))?;

    Ok(Frame::new(command_id, fields.collect()))
}

/// Read bytes until an unescaped command separator, giving up at `deadline`.
///
/// Returns the message body without the terminator. Line breaks the firmware
/// emits between messages are dropped before the body starts.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R, deadline: Instant) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(32);
    let mut escaped = false;

    loop {
        let mut byte = [0u8; 1];
        match reader.read(&mut byte) {
            Ok(1) => {
                let b = byte[0];
                if body.is_empty() && !escaped && (b == b'\r' || b == b'\n') {
                    continue;
                }
                if escaped {
                    escaped = false;
                } else if b == ESCAPE_CHARACTER {
                    escaped = true;
                } else if b == COMMAND_SEPARATOR {
                    return Ok(body);
                }
                body.push(b);
                if body.len() > MAX_FRAME_LEN {
                    return Err(DriverError::Protocol(format!(
                        "no command separator within {MAX_FRAME_LEN} bytes"
                    )));
                }
                continue;
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }

        if Instant::now() > deadline {
            return Err(DriverError::Timeout(if body.is_empty() {
                "no response from device".to_string()
            } else {
                format!("incomplete response ({} bytes)", body.len())
            }));
        }
        // Avoid spinning when the transport returns immediately.
        std::thread::sleep(Duration::from_millis(1));
    }
}
