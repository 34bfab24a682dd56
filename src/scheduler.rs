//! Deferred-event scheduler.
//!
//! Interrupt handlers do the minimum and [`post`](PendingEvents::post) an
//! event; the main loop later [`dispatch`](Scheduler::dispatch_next)es the
//! matching handler in normal context. Pending events are a bitmask, one
//! bit per event source, so posting is a single atomic OR and posting twice
//! before dispatch collapses into one handler call.
//!
//! # Ordering
//!
//! Dispatch order is fixed priority: the lowest pending id runs first.
//! Arrival order is not recorded.
//!
//! # Registration
//!
//! The handler table is built once at boot. Posting an id that has no
//! handler, registering an id twice, or dispatching with nothing pending are
//! contract violations and raise a [`Fault`].

use portable_atomic::{AtomicU32, Ordering};

use crate::fault::{self, Fault};

/// Capacity of the pending set (one bit per id).
pub const MAX_EVENTS: usize = 32;

/// Identifier of a deferred-event source. Lower ids have higher priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EventId(u8);

impl EventId {
    /// Creates an id. Evaluated at compile time for the `const` ids the
    /// application declares.
    ///
    /// # Panics
    ///
    /// If `index` is not below [`MAX_EVENTS`].
    pub const fn new(index: u8) -> Self {
        assert!((index as usize) < MAX_EVENTS, "event id out of range");
        Self(index)
    }

    /// Bit position in the pending set; also the priority rank.
    pub const fn index(self) -> u8 {
        self.0
    }

    const fn mask(self) -> u32 {
        1 << self.0
    }
}

/// The set of posted-but-undispatched events.
///
/// Shared between interrupt and normal context; lives in a `static`.
pub struct PendingEvents {
    pending: AtomicU32,
    registered: AtomicU32,
}

impl PendingEvents {
    /// Creates an empty set with nothing registered. `const`, so it can
    /// initialize a `static`.
    pub const fn new() -> Self {
        Self {
            pending: AtomicU32::new(0),
            registered: AtomicU32::new(0),
        }
    }

    /// Marks `id` as having a handler. Called by [`Scheduler::register`].
    pub fn enable(&self, id: EventId) {
        self.registered.fetch_or(id.mask(), Ordering::AcqRel);
    }

    /// Marks `id` pending. Safe from any interrupt priority; never blocks.
    ///
    /// # Panics
    ///
    /// Raises [`Fault::UnregisteredEvent`] if `id` has no handler.
    #[track_caller]
    pub fn post(&self, id: EventId) {
        if self.registered.load(Ordering::Acquire) & id.mask() == 0 {
            fault::raise(Fault::UnregisteredEvent(id));
        }
        self.pending.fetch_or(id.mask(), Ordering::Release);
    }

    /// True if any event is waiting for dispatch.
    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) != 0
    }

    /// Snapshot of the pending bitmask.
    pub fn pending_mask(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    /// Clears and returns the highest-priority pending id among the bits
    /// set in `within`.
    ///
    /// The bit is cleared before the caller runs the handler, so a post that
    /// lands while the handler is running leaves a fresh pending bit.
    fn claim_next(&self, within: u32) -> Option<EventId> {
        let pending = self.pending.load(Ordering::Acquire) & within;
        if pending == 0 {
            return None;
        }

        // Only normal context clears bits, and only here. Interrupts can only
        // set bits in between, so the chosen bit is still set.
        let id = EventId(pending.trailing_zeros() as u8);
        self.pending.fetch_and(!id.mask(), Ordering::AcqRel);
        Some(id)
    }
}

impl Default for PendingEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// A deferred handler. Receives the application context by `&mut`.
pub type Handler<C> = fn(&mut C);

/// Registration table plus dispatcher over a shared [`PendingEvents`].
///
/// `C` is the context handed to every handler: the application state on
/// target, a recorder in tests.
pub struct Scheduler<'a, C> {
    events: &'a PendingEvents,
    handlers: [Option<Handler<C>>; MAX_EVENTS],
}

impl<'a, C> Scheduler<'a, C> {
    /// Creates an empty handler table over `events`.
    ///
    /// # Arguments
    ///
    /// * `events` - Pending set shared with the interrupt handlers
    pub fn new(events: &'a PendingEvents) -> Self {
        Self {
            events,
            handlers: [None; MAX_EVENTS],
        }
    }

    /// Registers the handler for `id`. One handler per id.
    ///
    /// # Panics
    ///
    /// Raises [`Fault::DuplicateHandler`] if `id` already has a handler.
    #[track_caller]
    pub fn register(&mut self, id: EventId, handler: Handler<C>) {
        let slot = &mut self.handlers[id.index() as usize];
        if slot.is_some() {
            fault::raise(Fault::DuplicateHandler(id));
        }
        *slot = Some(handler);
        self.events.enable(id);
    }

    /// [`PendingEvents::post`] on the scheduler's set.
    #[track_caller]
    pub fn post(&self, id: EventId) {
        self.events.post(id);
    }

    /// True if any event is waiting for dispatch.
    pub fn has_pending(&self) -> bool {
        self.events.has_pending()
    }

    /// Claims the highest-priority pending event and runs its handler.
    ///
    /// # Returns
    ///
    /// The id that was dispatched.
    ///
    /// # Panics
    ///
    /// Raises [`Fault::NothingPending`] if the set is empty, and
    /// [`Fault::UnregisteredEvent`] if the claimed id has no handler.
    #[track_caller]
    pub fn dispatch_next(&self, ctx: &mut C) -> EventId {
        let Some(id) = self.events.claim_next(u32::MAX) else {
            fault::raise(Fault::NothingPending);
        };
        self.run(id, ctx);
        id
    }

    /// Dispatches the events that are pending when the pass starts, in
    /// priority order.
    ///
    /// Events posted during the pass, by handlers or by interrupts, are left
    /// for the next pass even when they outrank the rest of the snapshot;
    /// the idle path sees them pending and does not sleep.
    ///
    /// # Returns
    ///
    /// Number of handlers run.
    pub fn dispatch_pending(&self, ctx: &mut C) -> usize {
        let mut snapshot = self.events.pending_mask();
        let mut dispatched = 0;
        while let Some(id) = self.events.claim_next(snapshot) {
            snapshot &= !id.mask();
            self.run(id, ctx);
            dispatched += 1;
        }
        dispatched
    }

    #[track_caller]
    fn run(&self, id: EventId, ctx: &mut C) {
        let Some(handler) = self.handlers[id.index() as usize] else {
            fault::raise(Fault::UnregisteredEvent(id));
        };
        handler(ctx);
    }
}
