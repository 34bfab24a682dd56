//! Ambient-light sensor firmware core.
//!
//! Everything the firmware does that is not register access lives here and
//! builds for the host, so it can be tested without a board:
//!
//! - [`bus`] - Interrupt-driven two-wire transaction state machine
//! - [`scheduler`] - Deferred events posted from interrupts, run in the main loop
//! - [`power`] - Sleep-mode arbitration and the idle path
//! - [`si1133`] - Light sensor transactions and result decoding
//! - [`led`] - RGB status LED
//! - [`app`] - Handlers tying timer, bus and LED together
//! - [`config`] - Build-time constants
//! - [`fault`] - Contract violations

#![cfg_attr(not(test), no_std)]

pub mod app;
pub mod bus;
pub mod config;
pub mod fault;
pub mod led;
pub mod power;
pub mod scheduler;
pub mod si1133;
