//! Application layer: the deferred handlers.
//!
//! The timer's two interrupts and the bus completions all arrive here as
//! scheduler events. Handlers are short: each one collects at most one
//! completion, decides, and at most starts one transaction.
//!
//! # Cycle
//!
//! ```text
//! boot            → PART_ID read → SELECT white → ENABLE channel → ready
//! timer compare   → FORCE command                 (ready only)
//! timer underflow → HOSTOUT read → Dark / Bright  (ready only)
//!                 → setup retry                   (not ready)
//! ```
//!
//! Only one request is ever in flight. A timer event that finds the bus
//! still busy with the previous request skips its turn.

use crate::bus::{BusPort, Completion, Outcome, SharedBus, StartError, Transaction};
use crate::config::AppConfig;
use crate::fault::{self, Fault};
use crate::led::{Indication, Indicator, StatusLed};
use crate::scheduler::{EventId, Scheduler};
use crate::si1133::{LightReading, SensorError, SetupStep, Si1133};

// Completions outrank timer events, so an outcome is always collected
// before the next request is considered.
pub const SENSOR_SETUP_DONE: EventId = EventId::new(0);
pub const SENSOR_COMMAND_DONE: EventId = EventId::new(1);
pub const SENSOR_READ_DONE: EventId = EventId::new(2);
pub const TIMER_COMPARE: EventId = EventId::new(3);
pub const TIMER_UNDERFLOW: EventId = EventId::new(4);

/// The request currently on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Request {
    Setup(SetupStep),
    Force,
    Read,
}

/// Application state handed to every handler.
pub struct App<'a, 'b, P: BusPort, I: Indicator> {
    bus: &'a SharedBus<'b, P>,
    sensor: Si1133,
    status: StatusLed<I>,
    config: AppConfig,
    /// Request whose completion event has not run yet.
    in_flight: Option<Request>,
    /// Bring-up finished.
    ready: bool,
    /// Failed requests since the last good reading.
    failures: u8,
    last_reading: Option<LightReading>,
}

impl<'a, 'b, P: BusPort, I: Indicator> App<'a, 'b, P, I> {
    /// Creates the application with the sensor not yet set up.
    ///
    /// # Arguments
    ///
    /// * `bus` - Shared bus master the sensor sits on
    /// * `led` - Status LED; switched to the "starting" indication
    /// * `config` - Sensor address, threshold, fault limit and bus budget
    pub fn new(bus: &'a SharedBus<'b, P>, led: I, config: AppConfig) -> Self {
        Self {
            bus,
            sensor: Si1133::new(config.sensor_address, config.budget),
            status: StatusLed::new(led),
            config,
            in_flight: None,
            ready: false,
            failures: 0,
            last_reading: None,
        }
    }

    /// Fills the registration table.
    pub fn register(scheduler: &mut Scheduler<'_, Self>) {
        scheduler.register(SENSOR_SETUP_DONE, Self::on_setup_done);
        scheduler.register(SENSOR_COMMAND_DONE, Self::on_command_done);
        scheduler.register(SENSOR_READ_DONE, Self::on_read_done);
        scheduler.register(TIMER_COMPARE, Self::on_timer_compare);
        scheduler.register(TIMER_UNDERFLOW, Self::on_timer_underflow);
    }

    /// Begins sensor bring-up. Call once after the handlers are registered.
    pub fn start(&mut self) {
        self.begin_setup();
    }

    /// What the LED currently shows.
    pub fn indication(&self) -> Indication {
        self.status.indication()
    }

    /// The most recent successful reading, if any.
    pub fn last_reading(&self) -> Option<LightReading> {
        self.last_reading
    }

    /// True once bring-up has finished and periodic sampling runs.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Failed requests since the last good reading.
    pub fn consecutive_failures(&self) -> u8 {
        self.failures
    }

    pub fn status(&self) -> &StatusLed<I> {
        &self.status
    }

    fn on_timer_compare(&mut self) {
        if !self.ready {
            return;
        }
        if self.in_flight.is_some() {
            #[cfg(feature = "defmt")]
            defmt::warn!("force skipped: {} still in flight", self.in_flight);
            return;
        }

        let tx = self.sensor.force_measurement(SENSOR_COMMAND_DONE);
        self.issue(Request::Force, tx);
    }

    fn on_timer_underflow(&mut self) {
        self.status.tick();

        if self.in_flight.is_some() {
            #[cfg(feature = "defmt")]
            defmt::warn!("read skipped: {} still in flight", self.in_flight);
            return;
        }

        if self.ready {
            let tx = self.sensor.read_white_light(SENSOR_READ_DONE);
            self.issue(Request::Read, tx);
        } else {
            self.begin_setup();
        }
    }

    fn on_setup_done(&mut self) {
        let completion = self.collect(SENSOR_SETUP_DONE);
        let Some(Request::Setup(step)) = self.in_flight.take() else {
            fault::raise(Fault::UnexpectedCompletion(SENSOR_SETUP_DONE));
        };

        match self.sensor.check_setup(step, &completion) {
            Ok(()) => match step.next() {
                Some(next) => {
                    let tx = self.sensor.setup(next, SENSOR_SETUP_DONE);
                    self.issue(Request::Setup(next), tx);
                }
                None => {
                    #[cfg(feature = "defmt")]
                    defmt::info!("sensor ready");
                    self.ready = true;
                }
            },
            Err(err) => self.record_failure(err),
        }
    }

    fn on_command_done(&mut self) {
        let completion = self.collect(SENSOR_COMMAND_DONE);
        if self.in_flight.take() != Some(Request::Force) {
            fault::raise(Fault::UnexpectedCompletion(SENSOR_COMMAND_DONE));
        }

        if let Outcome::Failure(fault) = completion.outcome {
            self.record_failure(fault.into());
        }
    }

    fn on_read_done(&mut self) {
        let completion = self.collect(SENSOR_READ_DONE);
        if self.in_flight.take() != Some(Request::Read) {
            fault::raise(Fault::UnexpectedCompletion(SENSOR_READ_DONE));
        }

        match self.sensor.decode_reading(&completion) {
            Ok(reading) => {
                #[cfg(feature = "defmt")]
                defmt::debug!("white light: {=u16}", reading.counts());

                self.failures = 0;
                self.last_reading = Some(reading);
                if reading.counts() < self.config.dark_threshold {
                    self.status.show(Indication::Dark);
                } else {
                    self.status.show(Indication::Bright);
                }
            }
            Err(err) => self.record_failure(err),
        }
    }

    fn begin_setup(&mut self) {
        self.ready = false;
        let tx = self.sensor.setup(SetupStep::FIRST, SENSOR_SETUP_DONE);
        self.issue(Request::Setup(SetupStep::FIRST), tx);
    }

    fn issue(&mut self, request: Request, tx: Transaction) {
        match self.bus.start(tx) {
            Ok(()) => self.in_flight = Some(request),
            Err(StartError::Busy) => fault::raise(Fault::BusBusy),
            Err(StartError::InvalidLength) => fault::raise(Fault::InvalidTransfer),
        }
    }

    #[track_caller]
    fn collect(&mut self, event: EventId) -> Completion {
        match self.bus.take_completion() {
            Some(completion) => completion,
            None => fault::raise(Fault::MissingCompletion(event)),
        }
    }

    #[cfg_attr(not(feature = "defmt"), allow(unused_variables))]
    fn record_failure(&mut self, err: SensorError) {
        #[cfg(feature = "defmt")]
        defmt::warn!("sensor request failed: {}", err);

        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.config.fault_limit {
            self.status.show(Indication::Unreachable);
        }
    }
}
