//! Acquisition client for CmdMessenger measurement boards.
//!
//! Every device transaction follows the same pattern: take the single device
//! permit without waiting, send one framed command, sleep a fixed settle
//! interval while the board answers, then read exactly one framed reply. The
//! board gives no event when its answer is ready, so the settle interval
//! stands in for an acknowledgement.
//!
//! Failures never escape as errors. `acquire` folds them into an
//! `AcquisitionOutcome` and control commands only log them; the caller's next
//! timer tick is the only retry.

use std::io::{ErrorKind, Read, Write};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::errors::{DriverError, FailureReason, Result};
use crate::messenger::{
    decode_frame, encode_frame, read_frame, BoardProfile, CommandTable, Control, Frame, Request,
};

// ============================================================================
// Constants
// ============================================================================

/// Baud rate compiled into the board firmware.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Delay between sending a request and reading its reply.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(100);

/// How long to keep reading once the settle interval has passed.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(200);

/// Per-read timeout on the serial port; the frame reader loops until its deadline.
const PORT_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Value reported in place of a failed measurement.
pub const SENTINEL: f64 = 0.0;

// ============================================================================
// Outcome
// ============================================================================

/// Result of one measurement request. There are no partial values.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionOutcome {
    Success(f64),
    Failure(FailureReason),
}

impl AcquisitionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AcquisitionOutcome::Success(_))
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            AcquisitionOutcome::Success(v) => Some(*v),
            AcquisitionOutcome::Failure(_) => None,
        }
    }

    /// The measured value, or `SENTINEL` for a failure.
    pub fn value_or_sentinel(&self) -> f64 {
        self.value().unwrap_or(SENTINEL)
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            AcquisitionOutcome::Success(_) => None,
            AcquisitionOutcome::Failure(reason) => Some(reason),
        }
    }
}

impl From<std::result::Result<f64, FailureReason>> for AcquisitionOutcome {
    fn from(result: std::result::Result<f64, FailureReason>) -> Self {
        match result {
            Ok(v) => AcquisitionOutcome::Success(v),
            Err(reason) => AcquisitionOutcome::Failure(reason),
        }
    }
}

// ============================================================================
// Transport Abstraction
// ============================================================================

/// Trait for Read + Write + Send, allowing serial ports and simulated boards alike.
trait Transport: Read + Write + Send {}
impl<T: Read + Write + Send> Transport for T {}

// ============================================================================
// Device Session
// ============================================================================

/// An open connection to one measurement board.
///
/// The transport sits behind a mutex that acts as the single device permit.
/// It is only ever taken with `try_lock`, so a busy device skips the request
/// instead of queueing it.
pub struct DeviceSession {
    transport: Mutex<Box<dyn Transport>>,
    table: CommandTable,
    profile: BoardProfile,
    settle: Duration,
    response_timeout: Duration,
}

impl DeviceSession {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Open the board's serial port (e.g. `/dev/ttyUSB0`).
    ///
    /// Failing to open the port is fatal for the application; the error is
    /// reported as `DriverError::ChannelUnavailable`.
    pub fn open_serial(path: &str, baud_rate: u32, profile: BoardProfile) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(PORT_READ_TIMEOUT)
            .open()
            .map_err(|e| DriverError::ChannelUnavailable {
                port: path.to_string(),
                reason: e.to_string(),
            })?;
        info!("serial port {path} opened at {baud_rate} baud ({profile} board)");
        Ok(Self::from_transport(port, profile))
    }

    /// Wrap an already-open transport, such as a `SimulatedBoard`.
    pub fn from_transport<T>(transport: T, profile: BoardProfile) -> Self
    where
        T: Read + Write + Send + 'static,
    {
        Self {
            transport: Mutex::new(Box::new(transport)),
            table: CommandTable::for_profile(profile),
            profile,
            settle: DEFAULT_SETTLE,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn profile(&self) -> BoardProfile {
        self.profile
    }

    pub fn settle(&self) -> Duration {
        self.settle
    }

    pub fn command_table(&self) -> &CommandTable {
        &self.table
    }

    // ------------------------------------------------------------------------
    // Device Commands
    // ------------------------------------------------------------------------

    /// Request one measurement.
    ///
    /// Returns `Failure(Skipped)` at once when another transaction holds the
    /// device, `Failure(Malformed)` when the reply is missing or cannot be
    /// decoded, and `Failure(Transport)` on I/O errors.
    pub fn acquire(&self, request: Request) -> AcquisitionOutcome {
        let name = request.command_name();
        let Some(mut transport) = self.try_permit() else {
            debug!("{name}: device busy, skipping");
            return AcquisitionOutcome::Failure(FailureReason::Skipped);
        };

        let outcome = self
            .transaction(&mut transport, &name)
            .map_err(FailureReason::from)
            .and_then(|frame| self.decode_value(request, &frame));
        drop(transport);

        match &outcome {
            Ok(value) => debug!("{name} -> {value}"),
            Err(reason) => warn!("{name} failed: {reason}"),
        }
        outcome.into()
    }

    /// Send a command that only expects an acknowledgement.
    ///
    /// The acknowledgement text is logged. Errors are logged and swallowed.
    pub fn send_control_command(&self, control: Control) {
        let name = control.command_name();
        let Some(mut transport) = self.try_permit() else {
            warn!("could not send {name}: device busy");
            return;
        };

        match self.transaction(&mut transport, name) {
            Ok(frame) => {
                let reply = self.table.name_of(frame.command_id).unwrap_or("unknown");
                let text = frame.str_arg(0).unwrap_or_default();
                info!("{name}: {reply} {text}");
            }
            Err(e) => warn!("{name} not acknowledged: {e}"),
        }
    }

    /// Ask the board whether it is ready and return its acknowledgement text.
    pub fn ping(&self) -> Result<String> {
        let mut transport = self
            .try_permit()
            .ok_or_else(|| DriverError::Timeout("device busy".into()))?;
        let frame = self.transaction(&mut transport, "areYouReady")?;
        match self.table.name_of(frame.command_id) {
            Some("sendAcknowledge") => frame.str_arg(0),
            other => Err(DriverError::Protocol(format!(
                "unexpected reply to areYouReady: {}",
                other.unwrap_or("unknown command")
            ))),
        }
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    fn try_permit(&self) -> Option<MutexGuard<'_, Box<dyn Transport>>> {
        match self.transport.try_lock() {
            Ok(guard) => Some(guard),
            // A panicked holder left the port in an unknown state; the next
            // transaction flushes stale input anyway.
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Send `name`, wait the settle interval and read one reply.
    fn transaction(&self, transport: &mut Box<dyn Transport>, name: &str) -> Result<Frame> {
        let id = self.table.id_of(name).ok_or_else(|| {
            DriverError::Protocol(format!(
                "{name} is not part of the {} command set",
                self.profile
            ))
        })?;

        flush_input(transport)?;
        transport.write_all(&encode_frame(id, &[]))?;
        transport.flush()?;
        std::thread::sleep(self.settle);

        let body = read_frame(transport, Instant::now() + self.response_timeout)?;
        decode_frame(&body)
    }

    fn decode_value(
        &self,
        request: Request,
        frame: &Frame,
    ) -> std::result::Result<f64, FailureReason> {
        let reply = self.table.name_of(frame.command_id).ok_or_else(|| {
            FailureReason::Malformed(format!("unknown reply command {}", frame.command_id))
        })?;

        if reply == "error" {
            let text = frame.str_arg(0).unwrap_or_default();
            return Err(FailureReason::Malformed(format!("device error: {text}")));
        }
        if reply != request.reply_name() {
            return Err(FailureReason::Malformed(format!(
                "expected {}, got {reply}",
                request.reply_name()
            )));
        }

        let value = match reply {
            "int16Value" => f64::from(frame.int16_arg(0)?),
            _ => f64::from(frame.float_arg(0)?),
        };
        if !value.is_finite() {
            return Err(FailureReason::Malformed(format!("non-finite value {value}")));
        }
        Ok(value)
    }
}

/// Discard bytes left over from an earlier, timed-out transaction.
fn flush_input(transport: &mut Box<dyn Transport>) -> Result<()> {
    let mut buf = [0u8; 256];
    let start = Instant::now();
    let max_flush = Duration::from_millis(50);
    let mut iterations = 0usize;
    loop {
        iterations += 1;
        match transport.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => debug!("discarded {n} stale byte(s)"),
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::TimedOut => break,
            Err(e) => return Err(e.into()),
        }

        if iterations > 16 || start.elapsed() > max_flush {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{Fault, SimulatedBoard};
    use std::sync::Arc;

    fn session(profile: BoardProfile) -> (DeviceSession, SimulatedBoard) {
        let board = SimulatedBoard::new(profile);
        let session = DeviceSession::from_transport(board.clone(), profile)
            .with_settle(Duration::ZERO)
            .with_response_timeout(Duration::from_millis(30));
        (session, board)
    }

    #[test]
    fn acquires_float_measurement() {
        let (session, board) = session(BoardProfile::ChargingEvaluation);
        board.set_current(1.5);
        assert_eq!(
            session.acquire(Request::MeasuredCurrent),
            AcquisitionOutcome::Success(1.5)
        );
    }

    #[test]
    fn acquires_switch_status_as_int16() {
        let (session, board) = session(BoardProfile::FourChannelVoltage);
        board.set_switch(3, 0);
        assert_eq!(session.acquire(Request::SwitchStatus(3)).value(), Some(0.0));
        assert_eq!(session.acquire(Request::SwitchStatus(1)).value(), Some(1.0));
    }

    #[test]
    fn busy_permit_skips_without_blocking() {
        let (session, board) = session(BoardProfile::ChargingEvaluation);
        let held = session.transport.lock().unwrap();

        let started = Instant::now();
        let outcome = session.acquire(Request::MeasuredVoltage);
        assert_eq!(outcome, AcquisitionOutcome::Failure(FailureReason::Skipped));
        assert!(started.elapsed() < Duration::from_millis(20));
        drop(held);

        assert!(board.received_commands().is_empty());
        assert!(session.acquire(Request::MeasuredVoltage).is_success());
    }

    #[test]
    fn busy_permit_skips_across_threads() {
        let board = SimulatedBoard::new(BoardProfile::Temperature);
        let session = Arc::new(
            DeviceSession::from_transport(board, BoardProfile::Temperature)
                .with_settle(Duration::from_millis(150)),
        );

        let slow = Arc::clone(&session);
        let handle = std::thread::spawn(move || slow.acquire(Request::MeasuredTemperature));
        std::thread::sleep(Duration::from_millis(50));

        let contended = session.acquire(Request::MeasuredTemperature);
        assert_eq!(contended.failure(), Some(&FailureReason::Skipped));
        assert_eq!(contended.value_or_sentinel(), SENTINEL);
        assert_eq!(handle.join().unwrap().value(), Some(21.5));
    }

    #[test]
    fn garbled_reply_is_malformed() {
        let (session, board) = session(BoardProfile::ChargingEvaluation);
        board.inject_fault(Fault::Garbled);
        assert!(matches!(
            session.acquire(Request::MeasuredVoltage),
            AcquisitionOutcome::Failure(FailureReason::Malformed(_))
        ));
        assert_eq!(session.acquire(Request::MeasuredVoltage).value(), Some(4.0));
    }

    #[test]
    fn missing_reply_is_malformed() {
        let (session, board) = session(BoardProfile::Temperature);
        board.inject_fault(Fault::Silent);
        assert!(matches!(
            session.acquire(Request::MeasuredTemperature).failure(),
            Some(FailureReason::Malformed(_))
        ));
    }

    #[test]
    fn request_outside_profile_is_rejected() {
        let (session, board) = session(BoardProfile::Temperature);
        assert!(!session.acquire(Request::MeasuredCurrent).is_success());
        assert!(board.received_commands().is_empty());
    }

    #[test]
    fn control_commands_reach_the_board() {
        let (session, board) = session(BoardProfile::ChargingEvaluation);
        session.send_control_command(Control::TurnOff);
        assert!(!board.is_measuring());
        session.send_control_command(Control::TurnOn);
        session.send_control_command(Control::Reset);
        assert!(board.is_measuring());
        assert_eq!(
            board.received_commands(),
            vec!["turnOffMeasurements", "turnOnMeasurements", "resetMeasurements"]
        );
    }

    #[test]
    fn control_command_on_dead_transport_is_absorbed() {
        let session = DeviceSession::from_transport(std::io::empty(), BoardProfile::Temperature)
            .with_settle(Duration::ZERO)
            .with_response_timeout(Duration::from_millis(5));
        // io::Empty swallows the request and never answers.
        session.send_control_command(Control::Reset);
        assert!(!session.acquire(Request::MeasuredTemperature).is_success());
    }

    /// Port whose writes fail as if the USB cable had been pulled.
    struct UnpluggedPort;

    impl Read for UnpluggedPort {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for UnpluggedPort {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(ErrorKind::BrokenPipe, "device unplugged"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn io_error_is_a_transport_failure() {
        let session = DeviceSession::from_transport(UnpluggedPort, BoardProfile::Temperature)
            .with_settle(Duration::ZERO)
            .with_response_timeout(Duration::from_millis(5));

        let outcome = session.acquire(Request::MeasuredTemperature);
        assert!(matches!(
            outcome,
            AcquisitionOutcome::Failure(FailureReason::Transport(_))
        ));
        assert_eq!(outcome.value_or_sentinel(), SENTINEL);

        session.send_control_command(Control::TurnOff);
        assert!(matches!(session.ping(), Err(DriverError::Io(_))));
    }

    #[test]
    fn missing_serial_port_is_unavailable() {
        let result = DeviceSession::open_serial(
            "/nonexistent/das-poller-port",
            DEFAULT_BAUD_RATE,
            BoardProfile::ChargingEvaluation,
        );
        match result {
            Err(DriverError::ChannelUnavailable { port, .. }) => {
                assert_eq!(port, "/nonexistent/das-poller-port");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("opened a port that does not exist"),
        }
    }

    #[test]
    fn ping_returns_acknowledgement() {
        let (session, _board) = session(BoardProfile::FourChannelVoltage);
        assert_eq!(session.ping().unwrap(), "to PC: Arduino ready");
    }
}
