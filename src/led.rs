//! Indicator LED.
//!
//! The board carries one RGB LED with three active-high channels. The
//! application never drives pins directly; it picks an [`Indication`] and
//! [`StatusLed`] maps it onto channels.
//!
//! # Indications
//!
//! ```text
//! Starting    → green on            (sensor bring-up in progress)
//! Bright      → all off
//! Dark        → blue on
//! Unreachable → red blinking        (one toggle per timer period)
//! ```
//!
//! `Unreachable` is deliberately unlike both readings, so a dead sensor is
//! never mistaken for a dark room.

use core::convert::Infallible;

use embedded_hal::digital::v2::OutputPin;

/// One channel of the RGB LED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Color {
    Red,
    Green,
    Blue,
}

/// Something that can switch LED channels.
pub trait Indicator {
    fn set_led(&mut self, color: Color, on: bool);
}

/// RGB LED on three push-pull outputs.
pub struct RgbLed<R, G, B> {
    red: R,
    green: G,
    blue: B,
}

impl<R, G, B> RgbLed<R, G, B>
where
    R: OutputPin<Error = Infallible>,
    G: OutputPin<Error = Infallible>,
    B: OutputPin<Error = Infallible>,
{
    /// Takes the three channel outputs and switches them all off.
    pub fn new(red: R, green: G, blue: B) -> Self {
        let mut led = Self { red, green, blue };
        led.set_led(Color::Red, false);
        led.set_led(Color::Green, false);
        led.set_led(Color::Blue, false);
        led
    }
}

impl<R, G, B> Indicator for RgbLed<R, G, B>
where
    R: OutputPin<Error = Infallible>,
    G: OutputPin<Error = Infallible>,
    B: OutputPin<Error = Infallible>,
{
    fn set_led(&mut self, color: Color, on: bool) {
        match color {
            Color::Red => drive(&mut self.red, on),
            Color::Green => drive(&mut self.green, on),
            Color::Blue => drive(&mut self.blue, on),
        }
    }
}

fn drive<P: OutputPin<Error = Infallible>>(pin: &mut P, on: bool) {
    let _ = if on { pin.set_high() } else { pin.set_low() };
}

/// What the LED currently tells the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Indication {
    #[default]
    Starting,
    Bright,
    Dark,
    Unreachable,
}

/// Maps indications onto LED channels and runs the fallback blink.
pub struct StatusLed<I: Indicator> {
    led: I,
    indication: Indication,
    blink_on: bool,
}

impl<I: Indicator> StatusLed<I> {
    /// Takes the LED and shows [`Indication::Starting`].
    pub fn new(led: I) -> Self {
        let mut status = Self {
            led,
            indication: Indication::Starting,
            blink_on: false,
        };
        status.apply();
        status
    }

    pub fn indication(&self) -> Indication {
        self.indication
    }

    pub fn led(&self) -> &I {
        &self.led
    }

    /// Switches to `indication`. Re-showing the current one is a no-op, so a
    /// running blink keeps its phase.
    pub fn show(&mut self, indication: Indication) {
        if indication == self.indication {
            return;
        }
        self.indication = indication;
        self.blink_on = true;
        self.apply();
    }

    /// Advances the blink once per timer period.
    pub fn tick(&mut self) {
        if self.indication == Indication::Unreachable {
            self.blink_on = !self.blink_on;
            self.led.set_led(Color::Red, self.blink_on);
        }
    }

    fn apply(&mut self) {
        let (red, green, blue) = match self.indication {
            Indication::Starting => (false, true, false),
            Indication::Bright => (false, false, false),
            Indication::Dark => (false, false, true),
            Indication::Unreachable => (self.blink_on, false, false),
        };
        self.led.set_led(Color::Red, red);
        self.led.set_led(Color::Green, green);
        self.led.set_led(Color::Blue, blue);
    }
}
