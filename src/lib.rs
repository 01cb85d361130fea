//! Sensor poller for Arduino measurement boards speaking CmdMessenger.
//!
//! The boards (LiPo cell charging evaluation, four-channel voltage meter,
//! temperature sensor) answer one request at a time over a serial port. This
//! crate polls them on a fixed timer and keeps the recent history of every
//! measured or derived quantity in a fixed-size ring buffer.
//!
//! # Layers
//!
//! 1. [`messenger`]: framing and the per-board command tables.
//! 2. [`client::DeviceSession`]: one request, settle, one reply, under a
//!    non-blocking single-permit lock. Failures become
//!    [`AcquisitionOutcome::Failure`], never errors.
//! 3. [`scheduler::PollingScheduler`]: Running/Stopped state machine and the
//!    timer that feeds [`measurement::MeasurementChannel`]s.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use das_poller::{BoardProfile, DeviceSession, Poller};
//!
//! let session = DeviceSession::open_serial("/dev/ttyUSB0", 9600, BoardProfile::Temperature)?;
//! let poller = Poller::new(Arc::new(session), Duration::from_secs(2), 100);
//! poller.tick();
//! # Ok::<(), das_poller::DriverError>(())
//! ```

pub mod client;
pub mod config;
mod errors;
pub mod logging;
pub mod measurement;
pub mod messenger;
pub mod ring_buffer;
pub mod scheduler;
pub mod simulator;

pub use client::{AcquisitionOutcome, DeviceSession};
pub use config::PollerConfig;
pub use errors::*;
pub use measurement::{DisplaySink, LogDisplay, MeasurementChannel, MeasurementKind, Readout};
pub use messenger::{BoardProfile, Control, Request};
pub use ring_buffer::RingBuffer;
pub use scheduler::{FailurePolicy, Poller, PollingScheduler, RunState, TickReport};
pub use simulator::SimulatedBoard;
