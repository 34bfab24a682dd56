//! Contract-violation faults.
//!
//! A fault is a logic defect fixed at build time: a missing handler
//! registration, an unbalanced sleep block, a transaction started on a busy
//! bus. None of them are recoverable and none are ever corrected silently.
//! Every check in the crate funnels into [`raise`], which panics. On target,
//! `panic-probe` prints the message over defmt and halts the core; under
//! test the panic message is observable with `#[should_panic]`.

use core::fmt;

use crate::power::SleepLevel;
use crate::scheduler::EventId;

/// A contract violation detected at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Fault {
    /// `unblock` on a sleep level whose counter is already zero.
    UnbalancedUnblock(SleepLevel),
    /// An event was posted that has no registered handler.
    UnregisteredEvent(EventId),
    /// A second handler was registered for the same event.
    DuplicateHandler(EventId),
    /// `dispatch_next` was called with nothing pending.
    NothingPending,
    /// A transaction was started while another one was still outstanding.
    BusBusy,
    /// The bus refused a transaction whose shape is fixed at build time.
    InvalidTransfer,
    /// A completion event fired but the bus had no completion to hand out.
    MissingCompletion(EventId),
    /// A completion event fired for a request that was not in flight.
    UnexpectedCompletion(EventId),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::UnbalancedUnblock(level) => {
                write!(f, "unblock of {:?} with a zero block count", level)
            }
            Fault::UnregisteredEvent(id) => {
                write!(f, "event {} has no registered handler", id.index())
            }
            Fault::DuplicateHandler(id) => {
                write!(f, "event {} already has a handler", id.index())
            }
            Fault::NothingPending => write!(f, "dispatch with no pending event"),
            Fault::BusBusy => write!(f, "transaction started on a busy bus"),
            Fault::InvalidTransfer => write!(f, "transaction length does not fit"),
            Fault::MissingCompletion(id) => {
                write!(f, "event {} fired without a bus completion", id.index())
            }
            Fault::UnexpectedCompletion(id) => {
                write!(f, "event {} does not match the request in flight", id.index())
            }
        }
    }
}

/// The fault hook. Never returns.
#[track_caller]
#[cold]
pub fn raise(fault: Fault) -> ! {
    panic!("contract violation: {}", fault)
}
