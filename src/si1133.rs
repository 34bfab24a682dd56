//! Si1133 ambient light sensor protocol.
//!
//! Builds the bus transactions the application needs and decodes what comes
//! back. Nothing here touches the bus directly; every request is a
//! [`Transaction`] handed to the bus master, and every answer is a
//! [`Completion`] delivered through the scheduler.
//!
//! # Measurement cycle
//!
//! 1. Bring-up: verify the part id, then program channel 0 for the white
//!    photodiode and enable it in the channel list.
//! 2. `FORCE` command: starts one conversion on the enabled channels.
//! 3. Read `HOSTOUT0..1`: 16-bit big-endian white-light counts.
//!
//! Parameters are written through the host interface: the value goes into
//! `HOSTIN0` and a `PARAM_SET` command naming the parameter goes into
//! `COMMAND`. The two registers are adjacent, so a single auto-incrementing
//! write does both.

use crate::bus::{Budget, BusFault, Completion, Outcome, Transaction};
use crate::scheduler::EventId;

pub const REG_PART_ID: u8 = 0x00;
pub const REG_HOSTIN0: u8 = 0x0A;
pub const REG_COMMAND: u8 = 0x0B;
pub const REG_HOSTOUT0: u8 = 0x13;

pub const CMD_FORCE: u8 = 0x11;
pub const CMD_PARAM_SET: u8 = 0x80;

pub const PARAM_CHAN_LIST: u8 = 0x01;
pub const PARAM_ADCCONFIG0: u8 = 0x02;

/// `ADCMUX` selection for the large white photodiode.
pub const ADCMUX_WHITE: u8 = 0x0B;

/// Expected content of `PART_ID`.
pub const PART_ID: u8 = 0x33;

/// Bytes of one white-light result.
const RESULT_LEN: usize = 2;

/// Why a sensor request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorError {
    Bus(BusFault),
    /// Something answered at the sensor address, but it is not an Si1133.
    UnexpectedPartId(u8),
    /// The completion carried fewer bytes than the request asked for.
    ShortRead,
}

impl From<BusFault> for SensorError {
    fn from(fault: BusFault) -> Self {
        SensorError::Bus(fault)
    }
}

/// One white-light measurement in raw ADC counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LightReading(pub u16);

impl LightReading {
    pub fn counts(self) -> u16 {
        self.0
    }
}

/// Sensor bring-up, one transaction per step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SetupStep {
    CheckPartId,
    SelectWhiteChannel,
    EnableChannel,
}

impl SetupStep {
    pub const FIRST: SetupStep = SetupStep::CheckPartId;

    pub fn next(self) -> Option<SetupStep> {
        match self {
            SetupStep::CheckPartId => Some(SetupStep::SelectWhiteChannel),
            SetupStep::SelectWhiteChannel => Some(SetupStep::EnableChannel),
            SetupStep::EnableChannel => None,
        }
    }
}

/// Transaction builder and decoder for one Si1133.
#[derive(Debug, Clone, Copy)]
pub struct Si1133 {
    address: u8,
    budget: Budget,
}

impl Si1133 {
    pub const fn new(address: u8, budget: Budget) -> Self {
        Self { address, budget }
    }

    /// The transaction for one bring-up step.
    pub fn setup(&self, step: SetupStep, event: EventId) -> Transaction {
        let tx = match step {
            SetupStep::CheckPartId => Transaction::read(self.address, REG_PART_ID, 1, event),
            SetupStep::SelectWhiteChannel => self.param_set(PARAM_ADCCONFIG0, ADCMUX_WHITE, event),
            SetupStep::EnableChannel => self.param_set(PARAM_CHAN_LIST, 0x01, event),
        };
        tx.with_budget(self.budget)
    }

    /// Checks the completion of a bring-up step.
    pub fn check_setup(&self, step: SetupStep, completion: &Completion) -> Result<(), SensorError> {
        let data = match &completion.outcome {
            Outcome::Success(data) => data,
            Outcome::Failure(fault) => return Err((*fault).into()),
        };

        match step {
            SetupStep::CheckPartId => match data.first() {
                Some(&PART_ID) => Ok(()),
                Some(&other) => Err(SensorError::UnexpectedPartId(other)),
                None => Err(SensorError::ShortRead),
            },
            SetupStep::SelectWhiteChannel | SetupStep::EnableChannel => Ok(()),
        }
    }

    /// Starts one conversion.
    pub fn force_measurement(&self, event: EventId) -> Transaction {
        Transaction::write(self.address, REG_COMMAND, &[CMD_FORCE], event).with_budget(self.budget)
    }

    /// Reads the result of the last forced conversion.
    pub fn read_white_light(&self, event: EventId) -> Transaction {
        Transaction::read(self.address, REG_HOSTOUT0, RESULT_LEN, event).with_budget(self.budget)
    }

    /// Decodes the completion of [`read_white_light`](Self::read_white_light).
    pub fn decode_reading(&self, completion: &Completion) -> Result<LightReading, SensorError> {
        match &completion.outcome {
            Outcome::Success(data) => match data.as_slice() {
                [high, low, ..] => Ok(LightReading(u16::from_be_bytes([*high, *low]))),
                _ => Err(SensorError::ShortRead),
            },
            Outcome::Failure(fault) => Err((*fault).into()),
        }
    }

    fn param_set(&self, param: u8, value: u8, event: EventId) -> Transaction {
        Transaction::write(self.address, REG_HOSTIN0, &[value, CMD_PARAM_SET | param], event)
    }
}
