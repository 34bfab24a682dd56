//! Interrupt-driven two-wire bus master.
//!
//! A transaction is a sequence of *phases*. Each phase issues exactly one bus
//! primitive and then waits for the hardware to report its completion in an
//! interrupt. The interrupt handler feeds that completion into
//! [`transition`], which names the next phase and the next primitive. No
//! phase ever waits inside a handler, so each interrupt entry is O(1).
//!
//! ```text
//! Idle → SendStart → SendAddressWrite → SendRegister ─┬→ SendData* ─┐
//!                                                     └─────────────┤
//!        ┌───────────────────────── write only ─────────────────────┤
//!        │      SendRepeatedStart ← read or command-read ───────────┘
//!        │             ↓
//!        │      SendAddressRead → ReceiveData* ─┐
//!        ↓                                      ↓
//!     SendStop ←────────────────────────────────┘
//!        ↓
//!      Idle (done)
//! ```
//!
//! Any active phase can fall into `Error`: a not-acknowledge on an address
//! or data byte, an event the phase does not expect, or an exhausted
//! [`Budget`]. `Error` issues a stop condition and, once the stop completes,
//! the transaction ends with a failure outcome. There is no retry here;
//! that policy belongs to the caller.
//!
//! # Completion
//!
//! Every accepted transaction ends exactly once. On the way out the driver
//! releases its sleep block, parks a [`Completion`] holding the outcome and
//! the buffer, and posts the transaction's completion event. The handler
//! for that event collects the completion with
//! [`I2cMaster::take_completion`]. Until it does, the bus stays busy.
//!
//! # Hardware boundary
//!
//! Register access lives behind [`BusPort`]. Everything in this module is
//! plain logic and runs unchanged against a scripted fake port.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

use crate::config;
use crate::power::SleepArbiter;
use crate::scheduler::{EventId, PendingEvents};

/// Largest number of data bytes a single transaction moves.
pub const MAX_TRANSFER: usize = 8;

/// Transaction data buffer. Moves into the driver on start and back out
/// with the completion.
pub type Buffer = heapless::Vec<u8, MAX_TRANSFER>;

/// Shape of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Operation {
    /// Write the register byte followed by the buffer.
    Write,
    /// Write the register byte, then read `len` bytes after a repeated start.
    Read,
    /// Write the command byte followed by the buffer as arguments, then read
    /// `len` bytes after a repeated start.
    CommandRead,
}

/// One bus-level action issued to the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Primitive {
    /// Start condition. `repeated` is set for the start between the write
    /// and read halves of a read.
    Start { repeated: bool },
    /// 7-bit address plus the R/W bit.
    Address { address: u8, read: bool },
    /// One data byte from master to slave. `last` marks the final byte
    /// before the stop or the repeated start, so the peripheral can end
    /// the byte count instead of waiting for more.
    Write { byte: u8, last: bool },
    /// Clock in one byte. `last` answers it with not-acknowledge.
    Read { last: bool },
    /// Stop condition.
    Stop,
}

/// Hardware completion reported by the bus interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusEvent {
    /// A start or repeated start is on the bus.
    StartDone,
    /// The slave acknowledged the last address or data byte.
    Ack,
    /// The slave did not acknowledge the last address or data byte.
    Nack,
    /// A byte was clocked in.
    Received(u8),
    /// The stop condition completed and the bus is free.
    StopDone,
}

/// Why a transaction failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusFault {
    /// No device acknowledged the address.
    AddressNack,
    /// The device refused a data byte.
    DataNack,
    /// The transaction ran past its budget.
    Timeout,
    /// The hardware reported something the current phase does not expect.
    Protocol,
}

/// Why [`I2cMaster::start`] refused a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StartError {
    /// A transaction is in flight or its completion has not been collected.
    Busy,
    /// `len` does not fit the operation or the buffer.
    InvalidLength,
}

/// Upper bound on how long a transaction may take.
///
/// Completion interrupts only arrive when the bus actually completes
/// something. A slave that stretches the clock forever or vanishes
/// mid-transfer would leave the master waiting indefinitely without this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Budget {
    /// Bus events accepted before the transaction is declared timed out.
    pub max_phases: u16,
    /// Timer ticks accepted before the transaction is declared timed out.
    pub max_ticks: u32,
}

impl Default for Budget {
    fn default() -> Self {
        config::BUS_BUDGET
    }
}

/// A request for one bus exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// 7-bit slave address.
    pub address: u8,
    /// Shape of the exchange.
    pub op: Operation,
    /// Register address, or the command byte for [`Operation::CommandRead`].
    pub register: u8,
    /// Payload to write, or the command arguments. Received bytes replace
    /// it for reads.
    pub buffer: Buffer,
    /// Bytes to write for [`Operation::Write`], bytes to read otherwise.
    pub len: usize,
    /// Posted once the transaction ends, successfully or not.
    pub event: EventId,
    /// Limit after which the transaction fails with [`BusFault::Timeout`].
    pub budget: Budget,
}

impl Transaction {
    /// Creates a transaction with the default [`Budget`].
    ///
    /// # Arguments
    ///
    /// * `address` - 7-bit slave address
    /// * `op` - Operation kind
    /// * `register` - Register address or command byte
    /// * `buffer` - Payload for writes and command arguments
    /// * `len` - Bytes to write, or bytes to read
    /// * `event` - Completion event posted when the transaction ends
    pub fn new(
        address: u8,
        op: Operation,
        register: u8,
        buffer: Buffer,
        len: usize,
        event: EventId,
    ) -> Self {
        Self {
            address,
            op,
            register,
            buffer,
            len,
            event,
            budget: Budget::default(),
        }
    }

    /// Writes `data` to `register`.
    ///
    /// Data beyond [`MAX_TRANSFER`] bytes is dropped and the length check in
    /// [`I2cMaster::start`] rejects the request.
    pub fn write(address: u8, register: u8, data: &[u8], event: EventId) -> Self {
        let buffer = Buffer::from_slice(&data[..data.len().min(MAX_TRANSFER)]).unwrap_or_default();
        let len = data.len();
        Self::new(address, Operation::Write, register, buffer, len, event)
    }

    /// Reads `len` bytes starting at `register`.
    pub fn read(address: u8, register: u8, len: usize, event: EventId) -> Self {
        Self::new(address, Operation::Read, register, Buffer::new(), len, event)
    }

    /// Replaces the default budget.
    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = budget;
        self
    }

    fn validate(&mut self) -> Result<(), StartError> {
        match self.op {
            Operation::Write => {
                if self.len > self.buffer.len() {
                    return Err(StartError::InvalidLength);
                }
                self.buffer.truncate(self.len);
            }
            Operation::Read => {
                if self.len == 0 || self.len > MAX_TRANSFER {
                    return Err(StartError::InvalidLength);
                }
                self.buffer.clear();
            }
            Operation::CommandRead => {
                if self.len == 0 || self.len > MAX_TRANSFER {
                    return Err(StartError::InvalidLength);
                }
            }
        }
        Ok(())
    }
}

/// Current phase of the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    Idle,
    SendStart,
    SendAddressWrite,
    SendRegister,
    /// Writing payload byte `index`.
    SendData { index: usize },
    SendRepeatedStart,
    SendAddressRead,
    /// `received` bytes are already in.
    ReceiveData { received: usize },
    SendStop,
    /// Unwinding: the stop is on its way and the fault is remembered.
    Error(BusFault),
}

/// What the driver does after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Action {
    Issue(Primitive),
    /// The transaction is over.
    Finish(Result<(), BusFault>),
    /// Nothing to do; the event is ignored.
    Wait,
}

/// The parts of a transaction that decide its phase sequence.
#[derive(Debug, Clone, Copy)]
pub struct Plan<'a> {
    pub address: u8,
    pub register: u8,
    /// Bytes written after the register byte.
    pub payload: &'a [u8],
    /// Bytes read after the repeated start; zero for a plain write.
    pub read_len: usize,
}

/// The bus state machine: given the current phase and a completion event,
/// returns the next phase and what to do about it.
pub fn transition(phase: Phase, event: BusEvent, plan: &Plan<'_>) -> (Phase, Action) {
    use BusEvent::*;
    use Phase::*;

    match (phase, event) {
        (Idle, _) => (Idle, Action::Wait),

        (SendStart, StartDone) => (
            SendAddressWrite,
            Action::Issue(Primitive::Address {
                address: plan.address,
                read: false,
            }),
        ),
        (SendAddressWrite, Ack) => (
            SendRegister,
            Action::Issue(Primitive::Write {
                byte: plan.register,
                last: plan.payload.is_empty(),
            }),
        ),
        (SendAddressWrite | SendAddressRead, Nack) => unwind(BusFault::AddressNack),

        (SendRegister, Ack) => after_write(0, plan),
        (SendData { index }, Ack) => after_write(index + 1, plan),
        (SendRegister | SendData { .. }, Nack) => unwind(BusFault::DataNack),

        (SendRepeatedStart, StartDone) => (
            SendAddressRead,
            Action::Issue(Primitive::Address {
                address: plan.address,
                read: true,
            }),
        ),
        (SendAddressRead, Ack) => (
            ReceiveData { received: 0 },
            Action::Issue(Primitive::Read {
                last: plan.read_len <= 1,
            }),
        ),
        (ReceiveData { received }, Received(_)) => {
            let received = received + 1;
            if received < plan.read_len {
                (
                    ReceiveData { received },
                    Action::Issue(Primitive::Read {
                        last: received + 1 == plan.read_len,
                    }),
                )
            } else {
                (SendStop, Action::Issue(Primitive::Stop))
            }
        }

        (SendStop, StopDone) => (Idle, Action::Finish(Ok(()))),
        (Error(fault), StopDone) => (Idle, Action::Finish(Err(fault))),
        (Error(fault), _) => (Error(fault), Action::Wait),

        _ => unwind(BusFault::Protocol),
    }
}

fn after_write(next: usize, plan: &Plan<'_>) -> (Phase, Action) {
    if let Some(&byte) = plan.payload.get(next) {
        (
            Phase::SendData { index: next },
            Action::Issue(Primitive::Write {
                byte,
                last: next + 1 == plan.payload.len(),
            }),
        )
    } else if plan.read_len > 0 {
        (
            Phase::SendRepeatedStart,
            Action::Issue(Primitive::Start { repeated: true }),
        )
    } else {
        (Phase::SendStop, Action::Issue(Primitive::Stop))
    }
}

fn unwind(fault: BusFault) -> (Phase, Action) {
    (Phase::Error(fault), Action::Issue(Primitive::Stop))
}

/// Register-level access to the bus peripheral.
pub trait BusPort {
    /// Puts one primitive on the bus. Must return without waiting for it.
    fn issue(&mut self, primitive: Primitive);

    /// Decodes and clears the completion that raised the current interrupt.
    fn poll(&mut self) -> Option<BusEvent>;

    /// Forces the peripheral back to idle after a stop that never completed.
    fn abort(&mut self);
}

/// How a transaction ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Bytes read, or the bytes written for [`Operation::Write`].
    Success(Buffer),
    Failure(BusFault),
}

/// A finished transaction waiting for its handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Slave address of the finished transaction.
    pub address: u8,
    /// Its operation kind.
    pub op: Operation,
    /// Its register or command byte.
    pub register: u8,
    /// Success with the data, or the fault.
    pub outcome: Outcome,
}

struct Active {
    tx: Transaction,
    phase: Phase,
    phases: u16,
    ticks: u32,
}

impl Active {
    fn plan(&self) -> Plan<'_> {
        let payload: &[u8] = match self.tx.op {
            Operation::Write | Operation::CommandRead => &self.tx.buffer,
            Operation::Read => &[],
        };
        let read_len = match self.tx.op {
            Operation::Write => 0,
            Operation::Read | Operation::CommandRead => self.tx.len,
        };
        Plan {
            address: self.tx.address,
            register: self.tx.register,
            payload,
            read_len,
        }
    }
}

/// Single-transaction bus master driven by completion interrupts.
pub struct I2cMaster<'a, P: BusPort> {
    port: P,
    events: &'a PendingEvents,
    arbiter: &'a SleepArbiter,
    active: Option<Active>,
    completed: Option<Completion>,
}

impl<'a, P: BusPort> I2cMaster<'a, P> {
    /// Creates an idle master.
    ///
    /// # Arguments
    ///
    /// * `port` - Register access for the bus peripheral
    /// * `events` - Pending set that receives completion events
    /// * `arbiter` - Sleep arbiter that holds the bus block during a transaction
    pub fn new(port: P, events: &'a PendingEvents, arbiter: &'a SleepArbiter) -> Self {
        Self {
            port,
            events,
            arbiter,
            active: None,
            completed: None,
        }
    }

    /// True while a transaction is in flight or its completion is uncollected.
    pub fn is_busy(&self) -> bool {
        self.active.is_some() || self.completed.is_some()
    }

    /// Current phase; [`Phase::Idle`] when nothing is in flight.
    pub fn phase(&self) -> Phase {
        self.active.as_ref().map_or(Phase::Idle, |active| active.phase)
    }

    /// The hardware port, for inspection.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Accepts a transaction and issues its start condition.
    ///
    /// Returns immediately. The outcome arrives later through the
    /// transaction's completion event. A busy bus refuses the request; the
    /// caller serializes its own transactions.
    pub fn start(&mut self, mut tx: Transaction) -> Result<(), StartError> {
        if self.is_busy() {
            return Err(StartError::Busy);
        }
        tx.validate()?;

        #[cfg(feature = "defmt")]
        defmt::trace!("bus: start {} @ {=u8:#x} reg {=u8:#x}", tx.op, tx.address, tx.register);

        self.arbiter.block(config::BUS_SLEEP_BLOCK);
        self.active = Some(Active {
            tx,
            phase: Phase::SendStart,
            phases: 0,
            ticks: 0,
        });
        self.port.issue(Primitive::Start { repeated: false });
        Ok(())
    }

    /// Hands out the finished transaction and frees the bus.
    pub fn take_completion(&mut self) -> Option<Completion> {
        self.completed.take()
    }

    /// Top half for the bus interrupt.
    pub fn on_interrupt(&mut self) {
        if let Some(event) = self.port.poll() {
            self.on_event(event);
        }
    }

    /// Advances the transaction by one hardware completion.
    pub fn on_event(&mut self, event: BusEvent) {
        let Some(active) = self.active.as_mut() else {
            #[cfg(feature = "defmt")]
            defmt::trace!("bus: spurious {} while idle", event);
            return;
        };

        active.phases = active.phases.saturating_add(1);
        if active.phases > active.tx.budget.max_phases {
            self.overrun();
            return;
        }

        match (active.phase, event) {
            (Phase::SendAddressRead, BusEvent::Ack) => active.tx.buffer.clear(),
            (Phase::ReceiveData { .. }, BusEvent::Received(byte)) => {
                // Capacity was checked against `len` in `start`.
                let _ = active.tx.buffer.push(byte);
            }
            _ => {}
        }

        let (phase, action) = transition(active.phase, event, &active.plan());
        active.phase = phase;
        self.act(action);
    }

    /// Advances the tick budget. Call from a periodic timer interrupt.
    pub fn tick(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        active.ticks = active.ticks.saturating_add(1);
        if active.ticks > active.tx.budget.max_ticks {
            self.overrun();
        }
    }

    fn act(&mut self, action: Action) {
        match action {
            Action::Issue(primitive) => self.port.issue(primitive),
            Action::Finish(result) => self.finish(result),
            Action::Wait => {}
        }
    }

    /// The budget ran out. The first overrun unwinds with a stop and a fresh
    /// budget; an overrun during the unwind abandons the stop.
    fn overrun(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        match active.phase {
            Phase::Error(fault) => {
                #[cfg(feature = "defmt")]
                defmt::warn!("bus: stop never completed, aborting");

                self.port.abort();
                self.finish(Err(fault));
            }
            _ => {
                active.phase = Phase::Error(BusFault::Timeout);
                active.phases = 0;
                active.ticks = 0;
                self.port.issue(Primitive::Stop);
            }
        }
    }

    fn finish(&mut self, result: Result<(), BusFault>) {
        let Some(active) = self.active.take() else {
            return;
        };
        let tx = active.tx;

        let outcome = match result {
            Ok(()) => Outcome::Success(tx.buffer),
            Err(fault) => {
                #[cfg(feature = "defmt")]
                defmt::debug!("bus: {=u8:#x} failed: {}", tx.address, fault);
                Outcome::Failure(fault)
            }
        };

        self.arbiter.unblock(config::BUS_SLEEP_BLOCK);
        self.completed = Some(Completion {
            address: tx.address,
            op: tx.op,
            register: tx.register,
            outcome,
        });
        self.events.post(tx.event);
    }
}

/// A bus master shared between its interrupt and normal context.
///
/// Every access runs inside a critical section, so the interrupt never sees
/// a half-started transaction.
pub struct SharedBus<'a, P: BusPort> {
    inner: Mutex<CriticalSectionRawMutex, RefCell<Option<I2cMaster<'a, P>>>>,
}

impl<'a, P: BusPort> SharedBus<'a, P> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(None)),
        }
    }

    /// Installs the driver once the peripheral is configured.
    pub fn install(&self, master: I2cMaster<'a, P>) {
        self.inner.lock(|cell| {
            cell.replace(Some(master));
        });
    }

    /// Runs `f` against the driver. `None` before [`install`](Self::install).
    pub fn with<R>(&self, f: impl FnOnce(&mut I2cMaster<'a, P>) -> R) -> Option<R> {
        self.inner.lock(|cell| cell.borrow_mut().as_mut().map(f))
    }

    /// [`I2cMaster::start`], or [`StartError::Busy`] before install.
    pub fn start(&self, tx: Transaction) -> Result<(), StartError> {
        self.with(|master| master.start(tx))
            .unwrap_or(Err(StartError::Busy))
    }

    /// [`I2cMaster::take_completion`]; `None` before install.
    pub fn take_completion(&self) -> Option<Completion> {
        self.with(|master| master.take_completion()).flatten()
    }

    /// Call from the bus interrupt handler.
    pub fn on_interrupt(&self) {
        self.with(|master| master.on_interrupt());
    }

    /// Call from the periodic timer interrupt handler.
    pub fn tick(&self) {
        self.with(|master| master.tick());
    }
}

impl<P: BusPort> Default for SharedBus<'_, P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::power::SleepLevel;

    /// Records every primitive and replays scripted completions from `poll`.
    #[derive(Default)]
    pub(crate) struct FakePort {
        pub issued: Vec<Primitive>,
        pub script: VecDeque<BusEvent>,
        pub aborts: usize,
    }

    impl FakePort {
        pub fn stops(&self) -> usize {
            self.issued.iter().filter(|p| **p == Primitive::Stop).count()
        }
    }

    impl BusPort for FakePort {
        fn issue(&mut self, primitive: Primitive) {
            self.issued.push(primitive);
        }

        fn poll(&mut self) -> Option<BusEvent> {
            self.script.pop_front()
        }

        fn abort(&mut self) {
            self.aborts += 1;
        }
    }

    const DONE: EventId = EventId::new(3);

    fn setup() -> (PendingEvents, SleepArbiter) {
        let events = PendingEvents::new();
        events.enable(DONE);
        (events, SleepArbiter::new())
    }

    fn feed(master: &mut I2cMaster<'_, FakePort>, script: &[BusEvent]) {
        for event in script {
            master.on_event(*event);
        }
    }

    use BusEvent::*;

    const READ_ONE: [BusEvent; 7] = [StartDone, Ack, Ack, StartDone, Ack, Received(0x2A), StopDone];

    #[test]
    fn read_of_one_byte_completes_with_data() {
        let (events, arbiter) = setup();
        let mut master = I2cMaster::new(FakePort::default(), &events, &arbiter);

        master
            .start(Transaction::read(0x55, 0x13, 1, DONE))
            .expect("idle bus accepts");
        feed(&mut master, &READ_ONE);

        assert_eq!(events.pending_mask(), 1 << DONE.index());
        let completion = master.take_completion().expect("completion parked");
        assert_eq!(completion.address, 0x55);
        assert_eq!(
            completion.outcome,
            Outcome::Success(Buffer::from_slice(&[0x2A]).unwrap())
        );
        assert_eq!(
            master.port().issued,
            [
                Primitive::Start { repeated: false },
                Primitive::Address { address: 0x55, read: false },
                Primitive::Write { byte: 0x13, last: true },
                Primitive::Start { repeated: true },
                Primitive::Address { address: 0x55, read: true },
                Primitive::Read { last: true },
                Primitive::Stop,
            ]
        );
        assert!(!master.is_busy());
        assert_eq!(master.phase(), Phase::Idle);
    }

    #[test]
    fn multi_byte_read_acks_all_but_last() {
        let (events, arbiter) = setup();
        let mut master = I2cMaster::new(FakePort::default(), &events, &arbiter);

        master.start(Transaction::read(0x55, 0x13, 3, DONE)).unwrap();
        feed(
            &mut master,
            &[StartDone, Ack, Ack, StartDone, Ack, Received(1), Received(2), Received(3), StopDone],
        );

        let reads: Vec<_> = master
            .port()
            .issued
            .iter()
            .filter(|p| matches!(p, Primitive::Read { .. }))
            .copied()
            .collect();
        assert_eq!(
            reads,
            [
                Primitive::Read { last: false },
                Primitive::Read { last: false },
                Primitive::Read { last: true },
            ]
        );
        assert_eq!(
            master.take_completion().unwrap().outcome,
            Outcome::Success(Buffer::from_slice(&[1, 2, 3]).unwrap())
        );
    }

    #[test]
    fn write_sends_register_then_payload_then_stop() {
        let (events, arbiter) = setup();
        let mut master = I2cMaster::new(FakePort::default(), &events, &arbiter);

        master.start(Transaction::write(0x55, 0x0B, &[0x11], DONE)).unwrap();
        feed(&mut master, &[StartDone, Ack, Ack, Ack, StopDone]);

        assert_eq!(
            master.port().issued,
            [
                Primitive::Start { repeated: false },
                Primitive::Address { address: 0x55, read: false },
                Primitive::Write { byte: 0x0B, last: false },
                Primitive::Write { byte: 0x11, last: true },
                Primitive::Stop,
            ]
        );
        let completion = master.take_completion().unwrap();
        assert_eq!(completion.op, Operation::Write);
        assert!(matches!(completion.outcome, Outcome::Success(_)));
    }

    #[test]
    fn command_read_writes_arguments_before_repeated_start() {
        let (events, arbiter) = setup();
        let mut master = I2cMaster::new(FakePort::default(), &events, &arbiter);

        let args = Buffer::from_slice(&[0xA5]).unwrap();
        let tx = Transaction::new(0x40, Operation::CommandRead, 0xE3, args, 2, DONE);
        master.start(tx).unwrap();
        feed(
            &mut master,
            &[StartDone, Ack, Ack, Ack, StartDone, Ack, Received(0x12), Received(0x34), StopDone],
        );

        assert_eq!(
            master.port().issued[2..4],
            [
                Primitive::Write { byte: 0xE3, last: false },
                Primitive::Write { byte: 0xA5, last: true },
            ]
        );
        assert_eq!(
            master.take_completion().unwrap().outcome,
            Outcome::Success(Buffer::from_slice(&[0x12, 0x34]).unwrap())
        );
    }

    #[test]
    fn address_nack_unwinds_with_one_stop_and_one_event() {
        let (events, arbiter) = setup();
        let mut master = I2cMaster::new(FakePort::default(), &events, &arbiter);

        master.start(Transaction::read(0x55, 0x13, 1, DONE)).unwrap();
        master.on_event(StartDone);
        master.on_event(Nack);

        assert_eq!(master.phase(), Phase::Error(BusFault::AddressNack));
        assert!(!events.has_pending());

        master.on_event(StopDone);

        assert_eq!(master.port().stops(), 1);
        assert_eq!(events.pending_mask(), 1 << DONE.index());
        assert_eq!(
            master.take_completion().unwrap().outcome,
            Outcome::Failure(BusFault::AddressNack)
        );
        assert!(master.take_completion().is_none());
    }

    #[test]
    fn data_nack_on_register_byte_fails_the_write() {
        let (events, arbiter) = setup();
        let mut master = I2cMaster::new(FakePort::default(), &events, &arbiter);

        master.start(Transaction::write(0x55, 0x0B, &[0x11], DONE)).unwrap();
        feed(&mut master, &[StartDone, Ack, Nack, StopDone]);

        assert_eq!(master.port().stops(), 1);
        assert_eq!(
            master.take_completion().unwrap().outcome,
            Outcome::Failure(BusFault::DataNack)
        );
    }

    #[test]
    fn data_nack_on_payload_byte_fails_the_write() {
        let (events, arbiter) = setup();
        let mut master = I2cMaster::new(FakePort::default(), &events, &arbiter);

        master.start(Transaction::write(0x55, 0x0A, &[0x0B, 0x82], DONE)).unwrap();
        feed(&mut master, &[StartDone, Ack, Ack, Ack, Nack]);

        assert_eq!(master.phase(), Phase::Error(BusFault::DataNack));
        assert!(!events.has_pending());

        master.on_event(StopDone);
        assert_eq!(
            master.port().issued[2..],
            [
                Primitive::Write { byte: 0x0A, last: false },
                Primitive::Write { byte: 0x0B, last: false },
                Primitive::Write { byte: 0x82, last: true },
                Primitive::Stop,
            ]
        );
        assert_eq!(events.pending_mask(), 1 << DONE.index());
        assert_eq!(
            master.take_completion().unwrap().outcome,
            Outcome::Failure(BusFault::DataNack)
        );
        assert_eq!(arbiter.count(SleepLevel::Stop), 0);
    }

    #[test]
    fn final_write_before_restart_or_stop_is_marked_last() {
        let write = Plan {
            address: 0x55,
            register: 0x0B,
            payload: &[0x11],
            read_len: 0,
        };
        assert_eq!(
            transition(Phase::SendAddressWrite, Ack, &write).1,
            Action::Issue(Primitive::Write { byte: 0x0B, last: false })
        );
        assert_eq!(
            transition(Phase::SendRegister, Ack, &write).1,
            Action::Issue(Primitive::Write { byte: 0x11, last: true })
        );

        // A register read ends its write half on the register byte.
        let read = Plan {
            address: 0x55,
            register: 0x13,
            payload: &[],
            read_len: 2,
        };
        assert_eq!(
            transition(Phase::SendAddressWrite, Ack, &read).1,
            Action::Issue(Primitive::Write { byte: 0x13, last: true })
        );
    }

    #[test]
    fn unexpected_event_is_a_protocol_fault() {
        let (events, arbiter) = setup();
        let mut master = I2cMaster::new(FakePort::default(), &events, &arbiter);

        master.start(Transaction::read(0x55, 0x13, 1, DONE)).unwrap();
        master.on_event(Received(0xFF));
        assert_eq!(master.phase(), Phase::Error(BusFault::Protocol));

        // Further noise during the unwind is ignored.
        master.on_event(Ack);
        master.on_event(StopDone);

        assert_eq!(master.port().stops(), 1);
        assert_eq!(
            master.take_completion().unwrap().outcome,
            Outcome::Failure(BusFault::Protocol)
        );
    }

    #[test]
    fn tick_budget_forces_timeout() {
        let (events, arbiter) = setup();
        let mut master = I2cMaster::new(FakePort::default(), &events, &arbiter);
        let budget = Budget { max_phases: 32, max_ticks: 2 };

        master
            .start(Transaction::read(0x55, 0x13, 1, DONE).with_budget(budget))
            .unwrap();
        master.on_event(StartDone);
        // The slave stretches the clock forever: no more completions.
        master.tick();
        master.tick();
        assert_eq!(master.phase(), Phase::SendAddressWrite);
        master.tick();
        assert_eq!(master.phase(), Phase::Error(BusFault::Timeout));
        assert_eq!(master.port().stops(), 1);

        master.on_event(StopDone);
        assert_eq!(
            master.take_completion().unwrap().outcome,
            Outcome::Failure(BusFault::Timeout)
        );
    }

    #[test]
    fn phase_budget_forces_timeout() {
        let (events, arbiter) = setup();
        let mut master = I2cMaster::new(FakePort::default(), &events, &arbiter);
        let budget = Budget { max_phases: 3, max_ticks: 100 };

        master
            .start(Transaction::read(0x55, 0x13, 1, DONE).with_budget(budget))
            .unwrap();
        feed(&mut master, &[StartDone, Ack, Ack, StartDone]);

        assert_eq!(master.phase(), Phase::Error(BusFault::Timeout));
        master.on_event(StopDone);
        assert_eq!(
            master.take_completion().unwrap().outcome,
            Outcome::Failure(BusFault::Timeout)
        );
    }

    #[test]
    fn stuck_unwind_terminates_within_bounded_ticks() {
        let (events, arbiter) = setup();
        let mut master = I2cMaster::new(FakePort::default(), &events, &arbiter);
        let budget = Budget { max_phases: 8, max_ticks: 4 };

        master
            .start(Transaction::read(0x55, 0x13, 1, DONE).with_budget(budget))
            .unwrap();

        // Neither the start nor the unwinding stop ever completes.
        let mut steps = 0;
        while master.is_busy() && master.completed.is_none() {
            master.tick();
            steps += 1;
            assert!(steps <= 2 * (budget.max_ticks as usize + 1), "transaction never ended");
        }

        assert_eq!(master.port().aborts, 1);
        assert_eq!(events.pending_mask(), 1 << DONE.index());
        assert_eq!(
            master.take_completion().unwrap().outcome,
            Outcome::Failure(BusFault::Timeout)
        );
    }

    #[test]
    fn busy_until_completion_is_collected() {
        let (events, arbiter) = setup();
        let mut master = I2cMaster::new(FakePort::default(), &events, &arbiter);

        master.start(Transaction::read(0x55, 0x13, 1, DONE)).unwrap();
        assert_eq!(
            master.start(Transaction::read(0x55, 0x13, 1, DONE)),
            Err(StartError::Busy)
        );

        feed(&mut master, &READ_ONE);
        assert_eq!(
            master.start(Transaction::read(0x55, 0x13, 1, DONE)),
            Err(StartError::Busy)
        );

        master.take_completion().unwrap();
        assert_eq!(master.start(Transaction::read(0x55, 0x13, 1, DONE)), Ok(()));
    }

    #[test]
    fn invalid_lengths_are_refused_without_touching_the_bus() {
        let (events, arbiter) = setup();
        let mut master = I2cMaster::new(FakePort::default(), &events, &arbiter);

        assert_eq!(
            master.start(Transaction::read(0x55, 0x13, 0, DONE)),
            Err(StartError::InvalidLength)
        );
        assert_eq!(
            master.start(Transaction::read(0x55, 0x13, MAX_TRANSFER + 1, DONE)),
            Err(StartError::InvalidLength)
        );
        assert_eq!(
            master.start(Transaction::write(0x55, 0x0B, &[0; MAX_TRANSFER + 1], DONE)),
            Err(StartError::InvalidLength)
        );
        assert!(master.port().issued.is_empty());
        assert!(!master.is_busy());
        assert_eq!(arbiter.count(SleepLevel::Stop), 0);
    }

    #[test]
    fn sleep_block_is_held_for_the_transaction_and_released_on_error() {
        let (events, arbiter) = setup();
        let mut master = I2cMaster::new(FakePort::default(), &events, &arbiter);

        master.start(Transaction::read(0x55, 0x13, 1, DONE)).unwrap();
        assert_eq!(arbiter.current_permitted_depth(), SleepLevel::Sleep);

        feed(&mut master, &[StartDone, Nack, StopDone]);
        assert_eq!(arbiter.current_permitted_depth(), SleepLevel::Standby);
    }

    #[test]
    fn events_while_idle_are_ignored() {
        let (events, arbiter) = setup();
        let mut master = I2cMaster::new(FakePort::default(), &events, &arbiter);

        feed(&mut master, &[Ack, StopDone, Received(1)]);
        master.tick();

        assert!(master.port().issued.is_empty());
        assert!(!events.has_pending());
        assert!(!master.is_busy());
    }

    #[test]
    fn interrupt_top_half_polls_the_port() {
        let (events, arbiter) = setup();
        let mut port = FakePort::default();
        port.script.extend(READ_ONE);
        let mut master = I2cMaster::new(port, &events, &arbiter);

        master.start(Transaction::read(0x55, 0x13, 1, DONE)).unwrap();
        for _ in 0..READ_ONE.len() {
            master.on_interrupt();
        }
        // An interrupt with nothing to decode is harmless.
        master.on_interrupt();

        assert_eq!(
            master.take_completion().unwrap().outcome,
            Outcome::Success(Buffer::from_slice(&[0x2A]).unwrap())
        );
    }

    #[test]
    fn shared_bus_refuses_work_before_install() {
        let bus: SharedBus<'_, FakePort> = SharedBus::new();
        assert_eq!(
            bus.start(Transaction::read(0x55, 0x13, 1, DONE)),
            Err(StartError::Busy)
        );
        assert!(bus.take_completion().is_none());
    }

    #[test]
    fn shared_bus_runs_a_transaction_end_to_end() {
        let (events, arbiter) = setup();
        let bus = SharedBus::new();
        let mut port = FakePort::default();
        port.script.extend(READ_ONE);
        bus.install(I2cMaster::new(port, &events, &arbiter));

        bus.start(Transaction::read(0x55, 0x13, 1, DONE)).unwrap();
        for _ in 0..READ_ONE.len() {
            bus.on_interrupt();
        }

        let completion = bus.take_completion().expect("completed");
        assert_eq!(
            completion.outcome,
            Outcome::Success(Buffer::from_slice(&[0x2A]).unwrap())
        );
    }

    #[test]
    fn transition_is_pure_over_phase_and_event() {
        let plan = Plan {
            address: 0x55,
            register: 0x13,
            payload: &[],
            read_len: 2,
        };

        assert_eq!(
            transition(Phase::SendAddressRead, Ack, &plan),
            (
                Phase::ReceiveData { received: 0 },
                Action::Issue(Primitive::Read { last: false })
            )
        );
        assert_eq!(
            transition(Phase::ReceiveData { received: 0 }, Received(9), &plan),
            (
                Phase::ReceiveData { received: 1 },
                Action::Issue(Primitive::Read { last: true })
            )
        );
        assert_eq!(
            transition(Phase::ReceiveData { received: 1 }, Received(9), &plan),
            (Phase::SendStop, Action::Issue(Primitive::Stop))
        );
        assert_eq!(
            transition(Phase::Error(BusFault::DataNack), StopDone, &plan),
            (Phase::Idle, Action::Finish(Err(BusFault::DataNack)))
        );
        assert_eq!(transition(Phase::Idle, Ack, &plan), (Phase::Idle, Action::Wait));
    }
}
