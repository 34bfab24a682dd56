//! Hardware abstraction and peripheral initialization.
//!
//! This module defines the pin mappings, the register-level I2C1 port, the
//! LPTIM1 timebase and the interrupt handlers for the light indicator board.
//!
//! # Pin Assignments
//!
//! ## Status LED (active high)
//! - **PA5**: LED_R - Red channel
//! - **PA6**: LED_G - Green channel
//! - **PA7**: LED_B - Blue channel
//!
//! ## Light Sensor (Si1133, U2)
//! - **PA4**: SENSOR_EN - Supply enable for the sensor
//! - **PB6**: I2C1_SCL (AF1, open drain)
//! - **PB7**: I2C1_SDA (AF1, open drain)
//!
//! ## Low Power & Timebase
//! - **PC14**: OSC32_IN - 32.768 kHz crystal input
//! - **PC15**: OSC32_OUT - 32.768 kHz crystal output
//!
//! ## Debug (SWD)
//! - **PA13**: SWDIO
//! - **PA14**: SWCLK

use cortex_m::peripheral::{NVIC, SCB};
use embassy_stm32::gpio::{Level, Output, Speed};
use embassy_stm32::pac;
use pac::interrupt;

use lightsense_rs::app::{TIMER_COMPARE, TIMER_UNDERFLOW};
use lightsense_rs::bus::{BusEvent, BusPort, Primitive};
use lightsense_rs::config::{self, FORCE_OFFSET_SECS, SAMPLE_PERIOD_SECS, lptim_ticks};
use lightsense_rs::led::RgbLed;
use lightsense_rs::power::{SleepArbiter, SleepLevel};

use crate::{BUS, EVENTS};

/// EXTI line that carries the LPTIM1 wakeup out of Stop.
const LPTIM1_EXTI_LINE: usize = 29;

/// IMR register index for EXTI line 29 (lines 0-31 are in IMR1)
const IMR1_REG_IDX: usize = 0;

/// Alternate function of PB6/PB7 that routes them to I2C1.
const I2C1_AF: u8 = 1;

/// I2C1 bus timing, in kernel clock cycles.
///
/// At 66 kHz the bus runs near 10 kHz; in debug mode, with MSI at 2.097 MHz
/// and a prescaler of two, it runs near 55 kHz.
#[cfg(not(feature = "debug-mode"))]
const I2C_TIMING: (u8, u8, u8) = (0, 3, 2);
#[cfg(feature = "debug-mode")]
const I2C_TIMING: (u8, u8, u8) = (1, 9, 7);

/// RGB LED on three push-pull outputs.
pub type Led = RgbLed<Output<'static>, Output<'static>, Output<'static>>;

/// Top-level peripheral container for the light indicator.
pub struct Board {
    /// Status LED
    pub led: Led,
    /// Sensor supply enable; the sensor is powered while this is high
    pub sensor_power: Output<'static>,
    /// Register access for the sensor bus
    pub i2c: I2c1Port,
}

impl Board {
    /// Initializes all peripherals from STM32 peripheral singleton.
    ///
    /// # Initial GPIO States
    ///
    /// - PA5, PA6, PA7 (LED): Low
    /// - PA4 (SENSOR_EN): High
    /// - PB6, PB7: I2C1, open drain with pull-ups
    ///
    /// # Arguments
    ///
    /// * `p` - STM32 peripheral singleton from embassy_stm32::init()
    pub fn new(p: embassy_stm32::Peripherals) -> Self {
        let sensor_power = Output::new(p.PA4, Level::High, Speed::Low);
        let led = RgbLed::new(
            Output::new(p.PA5, Level::Low, Speed::Low),
            Output::new(p.PA6, Level::Low, Speed::Low),
            Output::new(p.PA7, Level::Low, Speed::Low),
        );

        // PB6/PB7 and I2C1 are driven through the PAC below; taking them here
        // keeps the HAL from handing them out again.
        let _ = (p.PB6, p.PB7, p.I2C1);

        Self {
            led,
            sensor_power,
            i2c: I2c1Port::new(),
        }
    }
}

/// I2C1 (v2 peripheral) as a [`BusPort`].
///
/// The v2 peripheral sends the start condition and the address as a single
/// operation and counts bytes itself. The port runs it in reload mode with
/// one byte per step, so every primitive ends in exactly one interrupt:
///
/// - `Start` touches no register; the start goes out with the address,
///   so its completion is synthesized
/// - `Address` sends start + address with NBYTES = 0; TCR means ACK
/// - `Write` loads one byte on TXIS; TCR means ACK, or TC for the last
///   byte, which leaves the peripheral where a stop or restart is legal
/// - A TXIS with no byte queued is reported as NACK
/// - `Read` clocks one byte, leaving reload off for the last one so the
///   peripheral answers it with NACK; RXNE carries the byte
/// - `Stop` ends reload and requests the stop; STOPF reports it
///
/// Synthesized completions are delivered by pending the I2C1 interrupt.
/// Bus errors and arbitration loss are cleared and left to the
/// transaction budget.
pub struct I2c1Port {
    synthetic: Option<BusEvent>,
    tx_byte: Option<u8>,
    expect_ack: bool,
}

impl I2c1Port {
    fn new() -> Self {
        let (presc, scll, sclh) = I2C_TIMING;

        pac::RCC.apb1enr().modify(|w| w.set_i2c1en(true));

        let gpio = pac::GPIOB;
        for pin in [6, 7] {
            gpio.otyper()
                .modify(|w| w.set_ot(pin, pac::gpio::vals::Ot::OPENDRAIN));
            gpio.pupdr()
                .modify(|w| w.set_pupdr(pin, pac::gpio::vals::Pupdr::PULLUP));
            gpio.afr(0).modify(|w| w.set_afr(pin, I2C1_AF));
            gpio.moder()
                .modify(|w| w.set_moder(pin, pac::gpio::vals::Moder::ALTERNATE));
        }

        let i2c = pac::I2C1;
        i2c.cr1().modify(|w| w.set_pe(false));
        i2c.timingr().write(|w| {
            w.set_presc(presc);
            w.set_scll(scll);
            w.set_sclh(sclh);
            w.set_sdadel(0);
            w.set_scldel(1);
        });
        i2c.cr1().modify(|w| {
            w.set_txie(true);
            w.set_rxie(true);
            w.set_nackie(true);
            w.set_stopie(true);
            w.set_errie(true);
            w.set_pe(true);
        });

        Self {
            synthetic: None,
            tx_byte: None,
            expect_ack: false,
        }
    }

    fn synthesize(&mut self, event: BusEvent) {
        self.synthetic = Some(event);
        NVIC::pend(embassy_stm32::interrupt::I2C1);
    }

    /// Arms the transfer-complete interrupt for the next TCR.
    fn arm_tc(&self) {
        pac::I2C1.cr1().modify(|w| w.set_tcie(true));
    }
}

impl BusPort for I2c1Port {
    fn issue(&mut self, primitive: Primitive) {
        let i2c = pac::I2C1;

        match primitive {
            Primitive::Start { .. } => self.synthesize(BusEvent::StartDone),
            Primitive::Address { address, read } => {
                self.expect_ack = true;
                self.arm_tc();
                i2c.cr2().write(|w| {
                    w.set_sadd(u16::from(address) << 1);
                    w.set_dir(if read {
                        pac::i2c::vals::Dir::READ
                    } else {
                        pac::i2c::vals::Dir::WRITE
                    });
                    w.set_nbytes(0);
                    w.set_reload(pac::i2c::vals::Reload::NOT_COMPLETED);
                    w.set_autoend(pac::i2c::vals::Autoend::SOFTWARE);
                    w.set_start(true);
                });
            }
            Primitive::Write { byte, last } => {
                self.tx_byte = Some(byte);
                self.expect_ack = true;
                self.arm_tc();
                i2c.cr1().modify(|w| w.set_txie(true));
                i2c.cr2().modify(|w| {
                    w.set_reload(if last {
                        pac::i2c::vals::Reload::COMPLETED
                    } else {
                        pac::i2c::vals::Reload::NOT_COMPLETED
                    });
                    w.set_nbytes(1);
                });
            }
            Primitive::Read { last } => {
                self.expect_ack = false;
                i2c.cr2().modify(|w| {
                    w.set_reload(if last {
                        pac::i2c::vals::Reload::COMPLETED
                    } else {
                        pac::i2c::vals::Reload::NOT_COMPLETED
                    });
                    w.set_nbytes(1);
                });
            }
            Primitive::Stop => {
                self.expect_ack = false;
                i2c.cr2().modify(|w| {
                    w.set_reload(pac::i2c::vals::Reload::COMPLETED);
                    w.set_stop(true);
                });
            }
        }
    }

    fn poll(&mut self) -> Option<BusEvent> {
        if let Some(event) = self.synthetic.take() {
            return Some(event);
        }

        let i2c = pac::I2C1;
        let isr = i2c.isr().read();

        if isr.nackf() {
            i2c.icr().write(|w| w.set_nackcf(true));
            i2c.cr1().modify(|w| w.set_tcie(false));
            self.expect_ack = false;
            return Some(BusEvent::Nack);
        }
        if isr.berr() || isr.arlo() {
            i2c.icr().write(|w| {
                w.set_berrcf(true);
                w.set_arlocf(true);
            });
            return None;
        }
        if isr.txis() {
            let Some(byte) = self.tx_byte.take() else {
                // Nothing queued to send.
                i2c.cr1().modify(|w| w.set_txie(false));
                self.expect_ack = false;
                return Some(BusEvent::Nack);
            };
            i2c.txdr().write(|w| w.set_txdata(byte));
            return None;
        }
        if isr.rxne() {
            return Some(BusEvent::Received(i2c.rxdr().read().rxdata()));
        }
        if isr.tcr() || isr.tc() {
            // Both flags stay set until the next primitive reloads NBYTES.
            i2c.cr1().modify(|w| w.set_tcie(false));
            if core::mem::take(&mut self.expect_ack) {
                return Some(BusEvent::Ack);
            }
            return None;
        }
        if isr.stopf() {
            i2c.icr().write(|w| w.set_stopcf(true));
            return Some(BusEvent::StopDone);
        }

        None
    }

    fn abort(&mut self) {
        self.synthetic = None;
        self.tx_byte = None;
        self.expect_ack = false;

        // Clearing PE resets the peripheral state machine and releases the lines.
        let i2c = pac::I2C1;
        i2c.cr1().modify(|w| {
            w.set_tcie(false);
            w.set_pe(false);
        });
        i2c.cr1().modify(|w| w.set_pe(true));
    }
}

/// Unmasks the I2C1 interrupt once the bus master is installed.
pub fn enable_i2c_interrupt() {
    unsafe {
        NVIC::unmask(embassy_stm32::interrupt::I2C1);
    }
}

/// Configures and starts LPTIM1 as the sampling timebase.
///
/// The counter runs from LSE, divided by two, and wraps every
/// [`SAMPLE_PERIOD_SECS`]. The compare match fires [`FORCE_OFFSET_SECS`]
/// into each period; the wrap ("underflow") fires at its end. Both wake the
/// core from Stop through EXTI line 29.
///
/// LPTIM1 loses its state in Standby, so the running timer holds a block on
/// [`config::TIMER_SLEEP_BLOCK`] for as long as it runs.
///
/// # Arguments
///
/// * `arbiter` - Sleep arbiter that records the timer's block
pub fn start_timer(arbiter: &SleepArbiter) {
    let rcc = pac::RCC;
    let lptim = pac::LPTIM1;
    let exti = pac::EXTI;

    rcc.ccipr()
        .modify(|w| w.set_lptim1sel(pac::rcc::vals::Lptimsel::LSE));
    rcc.apb1enr().modify(|w| w.set_lptim1en(true));

    lptim
        .cfgr()
        .modify(|w| w.set_presc(pac::lptim::vals::Presc::DIV2));
    lptim.ier().write(|w| {
        w.set_cmpmie(true);
        w.set_arrmie(true);
    });

    // CMP and ARR only accept writes while the timer is enabled.
    lptim.cr().modify(|w| w.set_enable(true));
    lptim.cmp().write(|w| w.set_cmp(lptim_ticks(FORCE_OFFSET_SECS)));
    lptim.arr().write(|w| w.set_arr(lptim_ticks(SAMPLE_PERIOD_SECS) - 1));

    exti.imr(IMR1_REG_IDX)
        .modify(|w| w.set_line(LPTIM1_EXTI_LINE, true));

    arbiter.block(config::TIMER_SLEEP_BLOCK);

    unsafe {
        NVIC::unmask(embassy_stm32::interrupt::LPTIM1);
    }

    lptim.cr().modify(|w| w.set_cntstrt(true));
}

/// Enters `level` until the next interrupt.
///
/// Called with interrupts masked from the idle path; `WFI` still wakes on a
/// pending interrupt and the handler runs once the mask is lifted.
/// Standby would lose RAM contents and LPTIM1, so it is entered as Stop.
///
/// # Arguments
///
/// * `scb` - System control block, for the SLEEPDEEP bit
/// * `level` - Permitted depth from the sleep arbiter
pub fn enter_sleep(scb: &mut SCB, level: SleepLevel) {
    match level {
        SleepLevel::Run => return,
        SleepLevel::Sleep => scb.clear_sleepdeep(),
        SleepLevel::Stop | SleepLevel::Standby => {
            pac::PWR
                .cr()
                .modify(|w| w.set_pdds(pac::pwr::vals::Pdds::STOP_MODE));
            scb.set_sleepdeep();
        }
    }

    cortex_m::asm::wfi();
    scb.clear_sleepdeep();
}

/// LPTIM1 interrupt handler.
///
/// Clears the match flags and posts the matching timer events. Every timer
/// interrupt also counts as one tick for the bus transaction budget.
#[interrupt]
fn LPTIM1() {
    let lptim = pac::LPTIM1;
    let isr = lptim.isr().read();

    if isr.cmpm() {
        lptim.icr().write(|w| w.set_cmpmcf(true));
        EVENTS.post(TIMER_COMPARE);
    }
    if isr.arrm() {
        lptim.icr().write(|w| w.set_arrmcf(true));
        EVENTS.post(TIMER_UNDERFLOW);
    }

    pac::EXTI
        .pr(IMR1_REG_IDX)
        .write(|w| w.set_line(LPTIM1_EXTI_LINE, true));

    BUS.tick();
}

/// I2C1 interrupt handler.
///
/// Advances the bus master by one hardware completion.
#[interrupt]
fn I2C1() {
    BUS.on_interrupt();
}
