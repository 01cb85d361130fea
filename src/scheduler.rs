//! Timer-driven polling of a measurement board.
//!
//! `Poller` holds everything one tick needs: the device session, the channel
//! buffers and the run state. `PollingScheduler` adds the Running/Stopped
//! state machine and owns the timer task that calls `Poller::tick` every
//! period.
//!
//! # Timing
//!
//! The timer sleeps for one period, runs the tick on tokio's blocking pool and
//! waits for it before sleeping again. Ticks therefore never overlap and
//! processing time is not compensated: a 2 s period with a 300 ms tick fires
//! every 2.3 s. Derived quantities use the nominal period, not wall time.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::client::{AcquisitionOutcome, DeviceSession, SENTINEL};
use crate::measurement::{
    ChannelSpec, DisplaySink, LogDisplay, MeasurementChannel, MeasurementKind,
};
use crate::messenger::{BoardProfile, Control, Request};

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Channel positions for the charging evaluation board.
const CELL_VOLTAGE: usize = 0;
const CELL_CURRENT: usize = 1;
const CELL_CAPACITY: usize = 2;
const CELL_ENERGY: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Stopped,
}

impl RunState {
    /// Status text shown to the user.
    pub fn status_text(self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Stopped => "stopped",
        }
    }
}

/// What to do with a measurement that could not be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Leave buffers and means untouched.
    #[default]
    Skip,
    /// Record the sentinel value as if it had been measured.
    RecordZero,
}

/// Result of one timer tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickReport {
    /// Measurements are off; nothing was requested.
    Idle,
    Completed {
        /// Channels that received a new sample.
        updated: usize,
        /// Requests that failed.
        failed: usize,
    },
}

struct PollState {
    run_state: RunState,
    channels: Vec<MeasurementChannel>,
    /// Seconds of charging accumulated from successful ticks.
    charging_time: f64,
    ticks: u64,
    display: Box<dyn DisplaySink>,
}

/// Channel layout and tick logic for one board.
pub struct Poller {
    session: Arc<DeviceSession>,
    profile: BoardProfile,
    period: Duration,
    policy: FailurePolicy,
    state: Mutex<PollState>,
}

fn channel_specs(profile: BoardProfile, capacity: usize) -> Vec<ChannelSpec> {
    let specs: Vec<ChannelSpec> = match profile {
        BoardProfile::ChargingEvaluation => vec![
            ChannelSpec::new("Cell voltage", MeasurementKind::Voltage),
            ChannelSpec::new("Cell current", MeasurementKind::Current),
            ChannelSpec::new("Cell capacity", MeasurementKind::Capacity),
            ChannelSpec::new("Cell energy", MeasurementKind::Energy),
        ],
        BoardProfile::FourChannelVoltage => (1..=4)
            .map(|ch| {
                ChannelSpec::new(format!("Channel{ch}"), MeasurementKind::Voltage)
                    .with_fill(0.0)
                    .with_precision(3)
            })
            .collect(),
        BoardProfile::Temperature => {
            vec![ChannelSpec::new("Temperature", MeasurementKind::Temperature)]
        }
    };
    specs
        .into_iter()
        .map(|spec| spec.with_capacity(capacity))
        .collect()
}

fn record_samples(state: &mut PollState, samples: &[(usize, f64)]) {
    let PollState {
        channels, display, ..
    } = state;
    for &(index, value) in samples {
        if let Some(channel) = channels.get_mut(index) {
            channel.record(value);
            display.show(&channel.readout());
        }
    }
}

/// Divider ratio selected by a channel switch: 1 means 1:1, anything else 1:10.
pub fn switch_scale(status: f64) -> f64 {
    if status == 1.0 {
        1.0
    } else {
        10.0
    }
}

impl Poller {
    /// Poller for the session's board, starting in `Running`.
    pub fn new(session: Arc<DeviceSession>, period: Duration, capacity: usize) -> Self {
        let profile = session.profile();
        let channels = channel_specs(profile, capacity)
            .into_iter()
            .map(MeasurementChannel::new)
            .collect();
        Self {
            session,
            profile,
            period,
            policy: FailurePolicy::default(),
            state: Mutex::new(PollState {
                run_state: RunState::Running,
                channels,
                charging_time: 0.0,
                ticks: 0,
                display: Box::new(LogDisplay),
            }),
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_display(self, display: Box<dyn DisplaySink>) -> Self {
        self.lock().display = display;
        self
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn run_state(&self) -> RunState {
        self.lock().run_state
    }

    pub fn charging_time(&self) -> f64 {
        self.lock().charging_time
    }

    /// Ticks that ran while measurements were on.
    pub fn ticks(&self) -> u64 {
        self.lock().ticks
    }

    /// Copy of every channel, in board order.
    pub fn channels(&self) -> Vec<MeasurementChannel> {
        self.lock().channels.clone()
    }

    pub fn channel(&self, label: &str) -> Option<MeasurementChannel> {
        self.lock()
            .channels
            .iter()
            .find(|c| c.label() == label)
            .cloned()
    }

    fn lock(&self) -> MutexGuard<'_, PollState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_run_state(&self, run_state: RunState) {
        let mut state = self.lock();
        state.run_state = run_state;
        state.display.status(run_state.status_text());
    }

    /// Restore every channel to its fill value and zero the charging time.
    pub fn reset_channels(&self) {
        let mut state = self.lock();
        state.channels.iter_mut().for_each(MeasurementChannel::reset);
        state.charging_time = 0.0;
        let PollState {
            channels, display, ..
        } = &mut *state;
        for channel in channels.iter() {
            display.show(&channel.readout());
        }
    }

    /// Apply the failure policy to one outcome.
    fn usable(&self, request: Request, outcome: AcquisitionOutcome) -> Option<f64> {
        match outcome {
            AcquisitionOutcome::Success(value) => Some(value),
            AcquisitionOutcome::Failure(reason) => match self.policy {
                FailurePolicy::Skip => {
                    debug!("{}: sample dropped ({reason})", request.command_name());
                    None
                }
                FailurePolicy::RecordZero => {
                    debug!("{}: recording sentinel ({reason})", request.command_name());
                    Some(SENTINEL)
                }
            },
        }
    }

    fn sample(&self, request: Request, failed: &mut usize) -> Option<f64> {
        let outcome = self.session.acquire(request);
        if !outcome.is_success() {
            *failed += 1;
        }
        self.usable(request, outcome)
    }

    /// Run one polling cycle.
    ///
    /// Nothing is requested while stopped. Device traffic happens without
    /// holding the channel lock; results are discarded if measurements were
    /// switched off in the meantime.
    pub fn tick(&self) -> TickReport {
        if self.run_state() != RunState::Running {
            trace!("tick while stopped");
            return TickReport::Idle;
        }
        let report = match self.profile {
            BoardProfile::ChargingEvaluation => self.tick_charging(),
            BoardProfile::FourChannelVoltage => self.tick_four_channel(),
            BoardProfile::Temperature => self.tick_temperature(),
        };
        if let TickReport::Completed { updated, failed } = report {
            debug!("tick complete: {updated} channel(s) updated, {failed} failure(s)");
        }
        report
    }

    /// Commit `samples` (channel index, value) if still running.
    fn commit(&self, samples: &[(usize, f64)]) -> bool {
        let mut state = self.lock();
        if state.run_state != RunState::Running {
            debug!("measurements stopped during tick; discarding results");
            return false;
        }
        state.ticks += 1;
        record_samples(&mut state, samples);
        true
    }

    /// Commit one charging step. Capacity and energy use the charging time
    /// read under the same lock as the commit.
    fn commit_charging(&self, voltage: f64, current: f64) -> bool {
        let mut state = self.lock();
        if state.run_state != RunState::Running {
            debug!("measurements stopped during tick; discarding results");
            return false;
        }
        state.ticks += 1;
        state.charging_time += self.period.as_secs_f64();
        let hours = state.charging_time / SECONDS_PER_HOUR;
        let samples = [
            (CELL_VOLTAGE, voltage),
            (CELL_CURRENT, current),
            (CELL_CAPACITY, current * hours),
            (CELL_ENERGY, current * voltage * hours),
        ];
        record_samples(&mut state, &samples);
        true
    }

    fn count_tick(&self) {
        let mut state = self.lock();
        if state.run_state == RunState::Running {
            state.ticks += 1;
        }
    }

    /// Voltage and current, then capacity and energy derived from them.
    ///
    /// The tick is all-or-nothing: derived values need both samples.
    fn tick_charging(&self) -> TickReport {
        let mut failed = 0;
        let voltage = self.sample(Request::MeasuredVoltage, &mut failed);
        let current = match voltage {
            Some(_) => self.sample(Request::MeasuredCurrent, &mut failed),
            None => None,
        };
        let (Some(voltage), Some(current)) = (voltage, current) else {
            self.count_tick();
            return TickReport::Completed { updated: 0, failed };
        };

        let updated = if self.commit_charging(voltage, current) {
            4
        } else {
            0
        };
        TickReport::Completed { updated, failed }
    }

    /// Each channel: switch position, then the scaled voltage.
    fn tick_four_channel(&self) -> TickReport {
        let mut failed = 0;
        let mut samples = Vec::with_capacity(4);
        for ch in 1..=4u8 {
            let Some(status) = self.sample(Request::SwitchStatus(ch), &mut failed) else {
                continue;
            };
            let scale = switch_scale(status);
            trace!("channel {ch} divider 1:{scale}");
            let Some(raw) = self.sample(Request::MeasuredVoltageChannel(ch), &mut failed) else {
                continue;
            };
            samples.push((ch as usize - 1, raw * scale));
        }
        let updated = if samples.is_empty() {
            self.count_tick();
            0
        } else if self.commit(&samples) {
            samples.len()
        } else {
            0
        };
        TickReport::Completed { updated, failed }
    }

    fn tick_temperature(&self) -> TickReport {
        let mut failed = 0;
        let Some(celsius) = self.sample(Request::MeasuredTemperature, &mut failed) else {
            self.count_tick();
            return TickReport::Completed { updated: 0, failed };
        };
        let updated = usize::from(self.commit(&[(0, celsius)]));
        TickReport::Completed { updated, failed }
    }
}

/// Owned timer task; aborted when dropped.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Fire `poller.tick()` every period on `runtime`.
    pub fn spawn(poller: Arc<Poller>, runtime: &Handle) -> Self {
        let period = poller.period();
        let task = runtime.spawn(async move {
            info!("measurement timer started ({period:?} period)");
            loop {
                tokio::time::sleep(period).await;
                let tick_poller = Arc::clone(&poller);
                match tokio::task::spawn_blocking(move || tick_poller.tick()).await {
                    Ok(report) => trace!("tick: {report:?}"),
                    Err(e) if e.is_cancelled() => break,
                    Err(e) => error!("measurement tick panicked: {e}"),
                }
            }
        });
        Self { task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Running/Stopped state machine around a `Poller`.
pub struct PollingScheduler {
    poller: Arc<Poller>,
    runtime: Handle,
    timer: Option<TimerHandle>,
}

impl PollingScheduler {
    pub fn new(poller: Poller, runtime: Handle) -> Self {
        Self {
            poller: Arc::new(poller),
            runtime,
            timer: None,
        }
    }

    /// Arm the timer if measurements are on and no timer is running.
    pub fn start(&mut self) {
        if self.poller.run_state() == RunState::Running && self.timer.is_none() {
            self.timer = Some(TimerHandle::spawn(Arc::clone(&self.poller), &self.runtime));
        }
    }

    pub fn poller(&self) -> &Arc<Poller> {
        &self.poller
    }

    pub fn run_state(&self) -> RunState {
        self.poller.run_state()
    }

    pub fn is_timer_armed(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stopped -> Running: tell the board, then re-arm the timer.
    pub fn measurements_on(&mut self) {
        if self.run_state() == RunState::Running {
            debug!("measurements already on");
            return;
        }
        self.poller.session().send_control_command(Control::TurnOn);
        self.poller.set_run_state(RunState::Running);
        self.start();
        info!("measurements on");
    }

    /// Running -> Stopped: release the timer, then tell the board.
    pub fn measurements_off(&mut self) {
        if self.run_state() == RunState::Stopped {
            debug!("measurements already off");
            return;
        }
        self.poller.set_run_state(RunState::Stopped);
        self.timer = None;
        self.poller.session().send_control_command(Control::TurnOff);
        info!("measurements off");
    }

    /// Flip between Running and Stopped.
    pub fn toggle(&mut self) {
        match self.run_state() {
            RunState::Running => self.measurements_off(),
            RunState::Stopped => self.measurements_on(),
        }
    }

    /// Reset board and buffers; the run state is left as it is.
    pub fn reset(&mut self) {
        self.poller.session().send_control_command(Control::Reset);
        self.poller.reset_channels();
        info!("measurements reset ({})", self.run_state().status_text());
    }

    /// Stop the timer and hand back the poller.
    pub fn shutdown(mut self) -> Arc<Poller> {
        if self.timer.take().is_some() {
            debug!("measurement timer released");
        }
        if self.poller.run_state() == RunState::Running {
            warn!("shutting down while measurements are on");
        }
        Arc::clone(&self.poller)
    }
}
