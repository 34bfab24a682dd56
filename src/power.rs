//! Sleep-mode arbitration and the idle path.
//!
//! Peripherals that need clocks to stay running take a *block* on the
//! shallowest sleep level they cannot survive. The arbiter keeps one
//! counter per level and answers, at any instant, which level the idle path
//! may enter.
//!
//! # Levels
//!
//! Levels are ordered lightest to deepest:
//!
//! ```text
//! Run < Sleep < Stop < Standby
//! ```
//!
//! A block on level `L` forbids `L` and every deeper level. Blocking `Run`
//! keeps the core awake entirely.
//!
//! # Concurrency
//!
//! Counters are shared between interrupt context (a bus transaction ends in
//! an ISR and releases its block there) and normal context. Every update is a
//! single atomic read-modify-write, so an interrupt landing between the read
//! and the write of a counter cannot lose an update.

use portable_atomic::{AtomicU8, Ordering};

use crate::fault::{self, Fault};
use crate::scheduler::PendingEvents;

/// Power-saving depth, lightest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SleepLevel {
    /// Core running, no sleep at all.
    Run = 0,
    /// Core clock gated, peripherals running (`WFI`).
    Sleep = 1,
    /// High-speed clocks off, low-speed peripherals and SRAM retained.
    Stop = 2,
    /// Everything off except the backup domain; SRAM is lost.
    Standby = 3,
}

impl SleepLevel {
    /// Number of levels.
    pub const COUNT: usize = 4;

    /// All levels, lightest to deepest.
    pub const ALL: [SleepLevel; Self::COUNT] = [
        SleepLevel::Run,
        SleepLevel::Sleep,
        SleepLevel::Stop,
        SleepLevel::Standby,
    ];

    /// The deepest level the hardware offers.
    pub const DEEPEST: SleepLevel = SleepLevel::Standby;

    /// The next lighter level. `Run` is its own shallower level.
    pub const fn shallower(self) -> SleepLevel {
        match self {
            SleepLevel::Run | SleepLevel::Sleep => SleepLevel::Run,
            SleepLevel::Stop => SleepLevel::Sleep,
            SleepLevel::Standby => SleepLevel::Stop,
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// Per-level block counters.
///
/// Every [`block`](Self::block) must be paired with exactly one
/// [`unblock`](Self::unblock) of the same level, including on error paths.
/// A leaked block keeps the processor out of the deeper levels forever.
pub struct SleepArbiter {
    blocks: [AtomicU8; SleepLevel::COUNT],
}

impl SleepArbiter {
    /// Creates an arbiter with no blocks held.
    pub const fn new() -> Self {
        Self {
            blocks: [const { AtomicU8::new(0) }; SleepLevel::COUNT],
        }
    }

    /// Forbids `level` and every deeper level until the matching unblock.
    ///
    /// The counter saturates rather than wrapping; a saturated counter keeps
    /// the level blocked, which is the safe direction.
    pub fn block(&self, level: SleepLevel) {
        // The closure always returns Some, so the update cannot fail.
        let _ = self.blocks[level.index()].fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |count| Some(count.saturating_add(1)),
        );
    }

    /// Releases one block on `level`.
    ///
    /// # Panics
    ///
    /// Raises [`Fault::UnbalancedUnblock`] if the counter is already zero.
    #[track_caller]
    pub fn unblock(&self, level: SleepLevel) {
        let released = self.blocks[level.index()].fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |count| count.checked_sub(1),
        );

        if released.is_err() {
            fault::raise(Fault::UnbalancedUnblock(level));
        }
    }

    /// Number of blocks currently held on `level`.
    pub fn count(&self, level: SleepLevel) -> u8 {
        self.blocks[level.index()].load(Ordering::Acquire)
    }

    /// The deepest level the idle path may currently enter.
    ///
    /// Scans from the deepest level toward the lightest. Every blocked level
    /// pulls the answer to just above it, so the lightest blocked level
    /// decides. With nothing blocked the answer is [`SleepLevel::DEEPEST`].
    pub fn current_permitted_depth(&self) -> SleepLevel {
        let mut permitted = SleepLevel::DEEPEST;
        for level in SleepLevel::ALL.iter().rev() {
            if self.count(*level) != 0 {
                permitted = level.shallower();
            }
        }
        permitted
    }
}

impl Default for SleepArbiter {
    fn default() -> Self {
        Self::new()
    }
}

/// One pass of the idle path.
///
/// Checks for pending events and, if there are none, hands the currently
/// permitted depth to `enter`, which performs the actual sleep. Both steps run
/// inside a single critical section: an event posted after the check but
/// before the sleep instruction would otherwise sit unserviced until the next
/// unrelated wakeup. On Cortex-M, `WFI` still wakes on an interrupt that is
/// pended while interrupts are masked, and the handler runs as soon as the
/// critical section ends.
///
/// # Returns
///
/// The level handed to `enter`, or `None` if events were pending and the
/// core did not sleep.
pub fn idle<F>(arbiter: &SleepArbiter, events: &PendingEvents, enter: F) -> Option<SleepLevel>
where
    F: FnOnce(SleepLevel),
{
    critical_section::with(|_| {
        if events.has_pending() {
            return None;
        }

        let level = arbiter.current_permitted_depth();
        enter(level);
        Some(level)
    })
}
