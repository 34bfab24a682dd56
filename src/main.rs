//! Firmware for a battery-powered ambient light indicator.
//!
//! # Overview
//!
//! An Si1133 light sensor is sampled every two seconds and the RGB LED shows
//! the result:
//! - Blue when the room is dark
//! - Off when it is bright
//! - Blinking red when the sensor stops answering
//!
//! # Hardware
//!
//! - **MCU**: STM32L031G6U6 (Cortex-M0+, ultra-low-power)
//! - **Sensor**: Si1133 on I2C1, powered from a GPIO enable
//! - **LED**: common-cathode RGB, one GPIO per channel
//! - **Timebase**: LPTIM1 clocked from the 32.768 kHz LSE crystal
//!
//! # Low Power Operation
//!
//! Nothing runs in interrupt context beyond register handling. Interrupts
//! post events; the main loop dispatches them and then drops into the
//! deepest sleep level the sleep arbiter permits:
//! - Stop while only the timer is running
//! - Sleep while a bus transaction is in flight (I2C1 is clocked from PCLK)
//!
//! # Module Organization
//!
//! - [`hardware`] - Pin mappings, LPTIM1, the I2C1 port and interrupt handlers
//! - The `lightsense_rs` library - everything that runs on the host as well

#![no_std]
#![no_main]

mod hardware;

use embassy_stm32::{
    Config,
    rcc::{LsConfig, LseConfig, mux::ClockMux},
    time::Hertz,
};
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

use hardware::{Board, I2c1Port};
use lightsense_rs::app::App;
use lightsense_rs::bus::{I2cMaster, SharedBus};
use lightsense_rs::config::AppConfig;
use lightsense_rs::power::{self, SleepArbiter};
use lightsense_rs::scheduler::{PendingEvents, Scheduler};

/// Events posted by the interrupt handlers.
static EVENTS: PendingEvents = PendingEvents::new();

/// Sleep blocks held by the timer and the bus.
static SLEEP: SleepArbiter = SleepArbiter::new();

/// Bus master shared with the I2C1 and LPTIM1 interrupts.
static BUS: SharedBus<'static, I2c1Port> = SharedBus::new();

type LightApp = App<'static, 'static, I2c1Port, hardware::Led>;

static APP: StaticCell<LightApp> = StaticCell::new();

/// Creates a low-power clock configuration for STM32L031.
///
/// # Clock Settings
///
/// - **MSI**: 66 kHz in normal mode, 2.097 MHz in debug mode (for reliable debugging)
/// - **System clock**: MSI (no PLL)
/// - **LSE**: 32.768 kHz external crystal for LPTIM1
/// - **Voltage scale**: Range 1
///
/// I2C1 runs from PCLK1, so the bus timing in [`hardware`] follows the MSI
/// range selected here.
///
/// # Returns
///
/// Configured RCC settings for embassy-stm32 initialization
fn create_low_power_config() -> embassy_stm32::rcc::Config {
    embassy_stm32::rcc::Config {
        #[cfg(feature = "debug-mode")]
        msi: Some(embassy_stm32::rcc::MSIRange::RANGE2M),
        #[cfg(not(feature = "debug-mode"))]
        msi: Some(embassy_stm32::rcc::MSIRange::RANGE66K),
        hsi: false,
        hse: None,
        pll: None,
        sys: embassy_stm32::rcc::Sysclk::MSI,
        ahb_pre: embassy_stm32::rcc::AHBPrescaler::DIV1,
        apb1_pre: embassy_stm32::rcc::APBPrescaler::DIV1,
        apb2_pre: embassy_stm32::rcc::APBPrescaler::DIV1,
        ls: LsConfig {
            rtc: embassy_stm32::rcc::RtcClockSource::LSE,
            lsi: false,
            lse: Some(LseConfig {
                frequency: Hertz::hz(32768),
                mode: embassy_stm32::rcc::LseMode::Oscillator(embassy_stm32::rcc::LseDrive::Low),
            }),
        },
        voltage_scale: embassy_stm32::rcc::VoltageScale::RANGE1,
        mux: ClockMux::default(),
    }
}

/// Main entry point for the light indicator firmware.
///
/// # Initialization Sequence
///
/// 1. Configure clocks for low power operation
/// 2. Initialize STM32 peripherals, the LED and the sensor supply
/// 3. Install the bus master on I2C1
/// 4. Register the event handlers and start sensor bring-up
/// 5. Start LPTIM1
/// 6. Enter the dispatch / idle loop
///
/// # Main Loop
///
/// Each pass runs every event that was pending when it began, then sleeps
/// unless something new arrived in the meantime.
#[cortex_m_rt::entry]
fn main() -> ! {
    let mut config = Config::default();
    config.rcc = create_low_power_config();

    let p = embassy_stm32::init(config);
    let mut core = cortex_m::Peripherals::take().unwrap();

    #[cfg(feature = "debug-mode")]
    defmt::info!("Light indicator firmware starting...");

    #[cfg(feature = "debug-mode")]
    defmt::info!("Initializing board...");

    let board = Board::new(p);

    #[cfg(feature = "debug-mode")]
    defmt::info!("Installing bus master...");

    BUS.install(I2cMaster::new(board.i2c, &EVENTS, &SLEEP));
    hardware::enable_i2c_interrupt();

    #[cfg(feature = "debug-mode")]
    defmt::info!("Registering handlers...");

    let app = APP.init(App::new(&BUS, board.led, AppConfig::default()));
    let mut scheduler = Scheduler::new(&EVENTS);
    LightApp::register(&mut scheduler);
    app.start();

    #[cfg(feature = "debug-mode")]
    defmt::info!("Starting LPTIM1...");

    hardware::start_timer(&SLEEP);

    #[cfg(feature = "debug-mode")]
    defmt::info!("Entering dispatch loop...");

    // Keeps the sensor powered for as long as the loop runs.
    let _sensor_power = board.sensor_power;

    loop {
        scheduler.dispatch_pending(app);
        power::idle(&SLEEP, &EVENTS, |level| {
            hardware::enter_sleep(&mut core.SCB, level)
        });
    }
}
