//! In-process stand-in for a measurement board.
//!
//! `SimulatedBoard` implements `Read + Write` and answers CmdMessenger
//! requests the way the Arduino firmware does, so the acquisition client can
//! run without hardware. Clones share state, which lets a caller keep a handle
//! for adjusting readings or injecting faults after the board has been moved
//! into a `DeviceSession`.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace};

use crate::messenger::{
    decode_frame, encode_frame, Arg, BoardProfile, CommandTable, COMMAND_SEPARATOR,
    ESCAPE_CHARACTER,
};

/// Reply corruption used to exercise failure paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Answer with a value argument of the wrong width.
    Garbled,
    /// Do not answer at all.
    Silent,
}

#[derive(Debug)]
struct BoardState {
    table: CommandTable,
    voltage: f32,
    current: f32,
    temperature: f32,
    channel_voltages: [f32; 4],
    switches: [i16; 4],
    measuring: bool,
    faults: VecDeque<Fault>,
    received: Vec<String>,
    input: Vec<u8>,
    input_escaped: bool,
    output: VecDeque<u8>,
}

/// Simulated Arduino board speaking the CmdMessenger protocol.
#[derive(Debug, Clone)]
pub struct SimulatedBoard {
    state: Arc<Mutex<BoardState>>,
}

impl SimulatedBoard {
    /// Board with the readings the bench setup reports at rest.
    pub fn new(profile: BoardProfile) -> Self {
        Self {
            state: Arc::new(Mutex::new(BoardState {
                table: CommandTable::for_profile(profile),
                voltage: 4.0,
                current: 1.0,
                temperature: 21.5,
                channel_voltages: [1.0, 2.0, 3.0, 4.0],
                switches: [1; 4],
                measuring: true,
                faults: VecDeque::new(),
                received: Vec::new(),
                input: Vec::new(),
                input_escaped: false,
                output: VecDeque::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        // A panic while holding the lock only happens in a failing test; keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_voltage(&self, volts: f32) {
        self.lock().voltage = volts;
    }

    pub fn set_current(&self, amps: f32) {
        self.lock().current = amps;
    }

    pub fn set_temperature(&self, celsius: f32) {
        self.lock().temperature = celsius;
    }

    /// Set the raw reading of channel 1-4.
    pub fn set_channel_voltage(&self, channel: u8, volts: f32) {
        if let Some(slot) = channel_slot(channel) {
            self.lock().channel_voltages[slot] = volts;
        }
    }

    /// Set the divider switch of channel 1-4 (1 = 1:1, 0 = 1:10).
    pub fn set_switch(&self, channel: u8, status: i16) {
        if let Some(slot) = channel_slot(channel) {
            self.lock().switches[slot] = status;
        }
    }

    /// Apply `fault` to the next measurement reply.
    pub fn inject_fault(&self, fault: Fault) {
        self.lock().faults.push_back(fault);
    }

    /// Whether the firmware considers measurements switched on.
    pub fn is_measuring(&self) -> bool {
        self.lock().measuring
    }

    /// Names of all commands received so far, in order.
    pub fn received_commands(&self) -> Vec<String> {
        self.lock().received.clone()
    }
}

fn channel_slot(channel: u8) -> Option<usize> {
    (1..=4).contains(&channel).then(|| channel as usize - 1)
}

impl BoardState {
    fn reply(&mut self, name: &str, args: &[Arg]) {
        if let Some(id) = self.table.id_of(name) {
            self.output.extend(encode_frame(id, args));
            self.output.extend(b"\r\n");
        }
    }

    fn acknowledge(&mut self, text: &str) {
        self.reply("sendAcknowledge", &[Arg::Str(text.to_string())]);
    }

    fn reply_value(&mut self, arg: Arg) {
        let reply_name = match arg {
            Arg::Int16(_) => "int16Value",
            _ => "floatValue",
        };
        match self.faults.pop_front() {
            Some(Fault::Silent) => debug!("simulated board: dropping reply"),
            Some(Fault::Garbled) => {
                debug!("simulated board: garbling reply");
                self.reply(reply_name, &[Arg::Str("?".into())]);
            }
            None => self.reply(reply_name, &[arg]),
        }
    }

    fn handle(&mut self, body: &[u8]) {
        let frame = match decode_frame(body) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("simulated board: undecodable request: {e}");
                self.reply("error", &[Arg::Str("to PC: Unknown command".into())]);
                return;
            }
        };
        let Some(name) = self.table.name_of(frame.command_id) else {
            self.reply("error", &[Arg::Str("to PC: Unknown command".into())]);
            return;
        };
        trace!("simulated board received {name}");
        self.received.push(name.to_string());

        match name {
            "areYouReady" => self.acknowledge("to PC: Arduino ready"),
            "sendMeasuredVoltage" => self.reply_value(Arg::Float(self.voltage)),
            "sendMeasuredCurrent" => self.reply_value(Arg::Float(self.current)),
            "sendMeasuredTemperature" => self.reply_value(Arg::Float(self.temperature)),
            "turnOnMeasurements" => {
                self.measuring = true;
                self.acknowledge("to PC: turn on measurements");
            }
            "turnOffMeasurements" => {
                self.measuring = false;
                self.acknowledge("to PC: turn off measurements");
            }
            "resetMeasurements" => self.acknowledge("to PC: reset measurements"),
            other => {
                if let Some(ch) = other.strip_prefix("sendMeasuredVoltage") {
                    if let Some(slot) = ch.parse::<u8>().ok().and_then(channel_slot) {
                        let value = self.channel_voltages[slot];
                        self.reply_value(Arg::Float(value));
                        return;
                    }
                }
                if let Some(ch) = other.strip_prefix("sendSwitchStatus") {
                    if let Some(slot) = ch.parse::<u8>().ok().and_then(channel_slot) {
                        let value = self.switches[slot];
                        self.reply_value(Arg::Int16(value));
                        return;
                    }
                }
                self.reply("error", &[Arg::Str("to PC: Unknown command".into())]);
            }
        }
    }
}

impl Write for SimulatedBoard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        for &byte in buf {
            if state.input_escaped {
                state.input_escaped = false;
            } else if byte == ESCAPE_CHARACTER {
                state.input_escaped = true;
            } else if byte == COMMAND_SEPARATOR {
                let body = std::mem::take(&mut state.input);
                state.handle(&body);
                continue;
            }
            state.input.push(byte);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for SimulatedBoard {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.output.is_empty() {
            // Same signal a serial port gives when its read timeout elapses.
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.output.len());
        for (dst, src) in buf.iter_mut().zip(state.output.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}
