//! Measurement channels and the display seam.
//!
//! Voltage, current, capacity, energy and temperature readouts all behave the
//! same way: a ring buffer of recent samples, a running mean over the valid
//! slots and a formatted readout. They differ only in unit, default fill value
//! and printed precision, which `MeasurementKind` carries.

use std::fmt;

use log::info;

use crate::ring_buffer::RingBuffer;

/// Number of samples a channel keeps, not counting the extra ring slot.
pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementKind {
    Voltage,
    Current,
    Capacity,
    Energy,
    Temperature,
}

impl MeasurementKind {
    pub fn unit(self) -> &'static str {
        match self {
            MeasurementKind::Voltage => "V",
            MeasurementKind::Current => "A",
            MeasurementKind::Capacity => "Ah",
            MeasurementKind::Energy => "Wh",
            MeasurementKind::Temperature => "°C",
        }
    }

    pub fn quantity(self) -> &'static str {
        match self {
            MeasurementKind::Voltage => "voltage",
            MeasurementKind::Current => "current",
            MeasurementKind::Capacity => "capacity",
            MeasurementKind::Energy => "energy",
            MeasurementKind::Temperature => "temperature",
        }
    }

    /// Decimal places shown in readouts.
    pub fn precision(self) -> usize {
        match self {
            MeasurementKind::Voltage | MeasurementKind::Temperature => 2,
            MeasurementKind::Current => 3,
            MeasurementKind::Capacity | MeasurementKind::Energy => 4,
        }
    }

    /// Value a freshly reset plot starts from.
    pub fn default_fill(self) -> f64 {
        match self {
            MeasurementKind::Voltage => 4.0,
            MeasurementKind::Current | MeasurementKind::Capacity | MeasurementKind::Energy => 0.9,
            MeasurementKind::Temperature => 0.0,
        }
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.quantity())
    }
}

/// Static description of one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub label: String,
    pub kind: MeasurementKind,
    pub capacity: usize,
    pub fill: f64,
    pub precision: usize,
}

impl ChannelSpec {
    pub fn new(label: impl Into<String>, kind: MeasurementKind) -> Self {
        Self {
            label: label.into(),
            kind,
            capacity: DEFAULT_CAPACITY,
            fill: kind.default_fill(),
            precision: kind.precision(),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_fill(mut self, fill: f64) -> Self {
        self.fill = fill;
        self
    }

    pub fn with_precision(mut self, precision: usize) -> Self {
        self.precision = precision;
        self
    }
}

/// One measured or derived quantity with its sample history.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementChannel {
    spec: ChannelSpec,
    buffer: RingBuffer<f64>,
}

impl MeasurementChannel {
    pub fn new(spec: ChannelSpec) -> Self {
        let buffer = RingBuffer::new(spec.capacity, spec.fill);
        Self { spec, buffer }
    }

    /// Store a sample and count it towards the mean.
    pub fn record(&mut self, value: f64) {
        self.buffer.push(value);
        self.buffer.record_valid();
    }

    pub fn reset(&mut self) {
        self.buffer.reset();
    }

    pub fn spec(&self) -> &ChannelSpec {
        &self.spec
    }

    pub fn label(&self) -> &str {
        &self.spec.label
    }

    pub fn buffer(&self) -> &RingBuffer<f64> {
        &self.buffer
    }

    pub fn latest(&self) -> Option<f64> {
        self.buffer.latest()
    }

    pub fn mean(&self) -> f64 {
        self.buffer.mean()
    }

    pub fn readout(&self) -> Readout<'_> {
        Readout {
            label: &self.spec.label,
            kind: self.spec.kind,
            precision: self.spec.precision,
            samples: self.buffer.as_slice(),
            latest: self.buffer.latest().unwrap_or(self.spec.fill),
            mean: self.buffer.mean(),
        }
    }
}

/// What a display needs to redraw one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Readout<'a> {
    pub label: &'a str,
    pub kind: MeasurementKind,
    pub precision: usize,
    /// All ring slots in physical order, as plotted.
    pub samples: &'a [f64],
    pub latest: f64,
    pub mean: f64,
}

impl Readout<'_> {
    pub fn format_value(&self, value: f64) -> String {
        format!("{:.*} {}", self.precision, value, self.kind.unit())
    }

    pub fn latest_text(&self) -> String {
        self.format_value(self.latest)
    }

    pub fn mean_text(&self) -> String {
        self.format_value(self.mean)
    }
}

/// Receiver of channel updates and run status; rendering is its own business.
pub trait DisplaySink: Send {
    fn show(&mut self, readout: &Readout<'_>);
    fn status(&mut self, text: &str);
}

/// Display that writes readouts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDisplay;

impl DisplaySink for LogDisplay {
    fn show(&mut self, readout: &Readout<'_>) {
        info!(
            "{}: {} (mean {})",
            readout.label,
            readout.latest_text(),
            readout.mean_text()
        );
    }

    fn status(&mut self, text: &str) {
        info!("status: {text}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_spec_takes_kind_defaults() {
        let spec = ChannelSpec::new("Cell current", MeasurementKind::Current);
        assert_eq!(spec.capacity, DEFAULT_CAPACITY);
        assert_eq!(spec.fill, 0.9);
        assert_eq!(spec.precision, 3);
    }

    #[test]
    fn channel_records_and_reports() {
        let mut channel = MeasurementChannel::new(
            ChannelSpec::new("Cell voltage", MeasurementKind::Voltage).with_capacity(10),
        );
        channel.record(4.0);
        channel.record(4.2);
        let readout = channel.readout();
        assert_eq!(readout.samples.len(), 11);
        assert_eq!(readout.latest_text(), "4.20 V");
        assert_eq!(readout.mean_text(), "4.10 V");
    }

    #[test]
    fn fresh_channel_reads_fill_value() {
        let channel = MeasurementChannel::new(
            ChannelSpec::new("Channel 1", MeasurementKind::Voltage)
                .with_fill(0.0)
                .with_precision(3),
        );
        let readout = channel.readout();
        assert_eq!(readout.latest_text(), "0.000 V");
        assert!(readout.mean.is_nan());
    }

    #[test]
    fn reset_clears_history() {
        let mut channel =
            MeasurementChannel::new(ChannelSpec::new("Cell energy", MeasurementKind::Energy));
        channel.record(0.5);
        channel.reset();
        assert_eq!(channel.latest(), None);
        assert_eq!(channel.buffer().valid_count(), 0);
        assert!(channel.buffer().as_slice().iter().all(|&v| v == 0.9));
    }
}
