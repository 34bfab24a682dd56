//! Build-time configuration.

use crate::bus::Budget;
use crate::power::SleepLevel;

/// 7-bit bus address of the Si1133 light sensor.
pub const SENSOR_ADDRESS: u8 = 0x55;

/// White-light counts below this read as "dark" and light the blue LED.
pub const DARK_THRESHOLD: u16 = 20;

/// Consecutive failed sensor transactions before the indicator switches to
/// the "sensor unreachable" pattern.
pub const FAULT_LIMIT: u8 = 3;

/// Sampling period of the low-power timer in seconds.
pub const SAMPLE_PERIOD_SECS: f32 = 2.0;

/// Offset of the compare event (force measurement) into each period, in
/// seconds. The underflow at the end of the period reads the result.
pub const FORCE_OFFSET_SECS: f32 = 1.0;

/// Low-power timer input clock (LSE).
pub const LPTIM_CLOCK_HZ: u32 = 32_768;

/// Low-power timer prescaler, as the divisor.
pub const LPTIM_PRESCALER: u32 = 2;

/// Sleep level the bus blocks while a transaction is in flight; the I2C
/// kernel clock does not run in Stop.
pub const BUS_SLEEP_BLOCK: SleepLevel = SleepLevel::Stop;

/// Sleep level the running timer blocks; LPTIM1 is powered down in Standby.
pub const TIMER_SLEEP_BLOCK: SleepLevel = SleepLevel::Standby;

/// Default transaction budget. Eight bytes of payload plus framing stay
/// well under the phase limit; the tick limit is in timer events.
pub const BUS_BUDGET: Budget = Budget {
    max_phases: 24,
    max_ticks: 2,
};

/// Application tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AppConfig {
    pub sensor_address: u8,
    pub dark_threshold: u16,
    pub fault_limit: u8,
    pub budget: Budget,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sensor_address: SENSOR_ADDRESS,
            dark_threshold: DARK_THRESHOLD,
            fault_limit: FAULT_LIMIT,
            budget: BUS_BUDGET,
        }
    }
}

/// Timer ticks for a duration in seconds.
pub const fn lptim_ticks(secs: f32) -> u16 {
    (secs * (LPTIM_CLOCK_HZ / LPTIM_PRESCALER) as f32) as u16
}
