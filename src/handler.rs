//! The 17-state bus state machine: receive, reactive answer, arbitration,
//! active transmit, release — plus statistics.
//!
//! The state set is a closed sum type dispatched on by value rather than
//! a class hierarchy with virtual dispatch: a `receive`/`send` pair of
//! match statements over [`State`] drives every transition.

use crate::consts::{is_master_address, slave_address, ACK, EXP, NAK, SYN};
use crate::counters::Counters;
use crate::error::{ErrorKind, Warning};
use crate::telegram::{Telegram, TelegramState, TelegramType};

/// One of the 17 states the bus can be in: receive, reactive answer,
/// arbitration, active transmit, and release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    PassiveReceiveMaster,
    PassiveReceiveMasterAck,
    PassiveReceiveSlave,
    PassiveReceiveSlaveAck,
    ReactiveSendMasterPosAck,
    ReactiveSendMasterNegAck,
    ReactiveSendSlave,
    ReactiveReceiveSlaveAck,
    RequestBusFirstTry,
    RequestBusPriorityRetry,
    RequestBusSecondTry,
    ActiveSendMaster,
    ActiveReceiveMasterAck,
    ActiveReceiveSlave,
    ActiveSendSlavePosAck,
    ActiveSendSlaveNegAck,
    ReleaseBus,
}

/// Outcome of the active cycle that just concluded (or aborted), reported
/// once via [`Handler::take_cycle_outcome`].
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Cycle succeeded; carries the slave's response bytes (empty for MM
    /// and broadcast telegrams, which have no response payload).
    Success(Vec<u8>),
    /// Cycle failed on the wire after a retry was already exhausted.
    Failed(ErrorKind),
    /// Arbitration was lost outright (not a priority-class tie) or the
    /// priority-class retry window never produced a `SYN`. This is not a
    /// terminal failure of the request: the same request should be
    /// retried at the next free window.
    ArbitrationLost,
}

type WriteCb = Box<dyn FnMut(u8) + Send>;
type DataAvailableCb = Box<dyn Fn() -> bool + Send>;
type TelegramCb = Box<dyn FnMut(&[u8], &[u8]) + Send>;
type ReactiveCb = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;
type ErrorCb = Box<dyn FnMut(&str) + Send>;
/// `true` for a byte read from the bus, `false` for a byte written to it.
type TraceCb = Box<dyn FnMut(u8, bool) + Send>;

/// The bus state machine. Owns exactly one in-flight active (outbound)
/// cycle and one in-flight passive (overheard) cycle at a time — they
/// never overlap, since arbitration is atomic per cycle.
pub struct Handler {
    address: u8,
    slave_address: u8,

    bus_write: Option<WriteCb>,
    is_data_available: Option<DataAvailableCb>,
    active_cb: Option<TelegramCb>,
    passive_cb: Option<TelegramCb>,
    reactive_cb: Option<ReactiveCb>,
    error_cb: Option<ErrorCb>,
    trace_cb: Option<TraceCb>,

    state: State,
    counters: Counters,

    max_lock_counter: u8,
    lock_counter: u8,

    // passive (overheard) cycle
    passive_telegram: Telegram,
    passive_master: Vec<u8>,
    passive_master_dbx: usize,
    passive_master_repeated: bool,

    passive_slave: Vec<u8>,
    passive_slave_dbx: usize,
    passive_slave_index: usize,
    passive_slave_repeated: bool,

    // active (outbound) cycle
    active: bool,
    active_telegram: Telegram,

    active_master: Vec<u8>,
    active_master_index: usize,
    active_master_repeated: bool,

    active_slave: Vec<u8>,
    active_slave_dbx: usize,
    active_slave_repeated: bool,

    cycle_outcome: Option<CycleOutcome>,
}

impl core::fmt::Debug for Handler {
    /// The five callback slots hold trait objects with no useful `Debug`
    /// representation, so they're omitted; the rest of the cycle state is
    /// printed in full.
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Handler")
            .field("address", &self.address)
            .field("slave_address", &self.slave_address)
            .field("state", &self.state)
            .field("counters", &self.counters)
            .field("max_lock_counter", &self.max_lock_counter)
            .field("lock_counter", &self.lock_counter)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl Handler {
    /// Creates a handler for `source`. An invalid master address falls
    /// back to `0xff`.
    pub fn new(source: u8) -> Self {
        let mut h = Handler {
            address: 0,
            slave_address: 0,
            bus_write: None,
            is_data_available: None,
            active_cb: None,
            passive_cb: None,
            reactive_cb: None,
            error_cb: None,
            trace_cb: None,
            state: State::PassiveReceiveMaster,
            counters: Counters::new(),
            max_lock_counter: crate::consts::DEFAULT_MAX_LOCK_COUNTER,
            lock_counter: crate::consts::DEFAULT_MAX_LOCK_COUNTER,
            passive_telegram: Telegram::empty(),
            passive_master: Vec::new(),
            passive_master_dbx: 0,
            passive_master_repeated: false,
            passive_slave: Vec::new(),
            passive_slave_dbx: 0,
            passive_slave_index: 0,
            passive_slave_repeated: false,
            active: false,
            active_telegram: Telegram::empty(),
            active_master: Vec::new(),
            active_master_index: 0,
            active_master_repeated: false,
            active_slave: Vec::new(),
            active_slave_dbx: 0,
            active_slave_repeated: false,
            cycle_outcome: None,
        };
        h.set_address(source);
        h
    }

    /// Registers the bus-write callback: emits one byte onto the wire.
    pub fn set_bus_write_callback(&mut self, cb: impl FnMut(u8) + Send + 'static) {
        self.bus_write = Some(Box::new(cb));
    }

    /// Registers the callback polled before starting arbitration: returning
    /// `true` means the caller has other work pending and arbitration
    /// should not start this window.
    pub fn set_is_data_available_callback(&mut self, cb: impl Fn() -> bool + Send + 'static) {
        self.is_data_available = Some(Box::new(cb));
    }

    /// Registers the callback invoked when one of *our own* enqueued
    /// requests completes (`master`, `slave` bytes, both unstuffed).
    pub fn set_active_callback(&mut self, cb: impl FnMut(&[u8], &[u8]) + Send + 'static) {
        self.active_cb = Some(Box::new(cb));
    }

    /// Registers the callback invoked for a fully overheard telegram not
    /// addressed to us.
    pub fn set_passive_callback(&mut self, cb: impl FnMut(&[u8], &[u8]) + Send + 'static) {
        self.passive_cb = Some(Box::new(cb));
    }

    /// Registers the callback invoked for a telegram addressed to us,
    /// which must return the slave response bytes (`NN D1..DN`, no CRC) or
    /// `None` if this command is unrecognized (answered with a NAK).
    pub fn set_reactive_callback(&mut self, cb: impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static) {
        self.reactive_cb = Some(Box::new(cb));
    }

    /// Registers the diagnostic error-message sink.
    pub fn set_error_callback(&mut self, cb: impl FnMut(&str) + Send + 'static) {
        self.error_cb = Some(Box::new(cb));
    }

    /// Registers the raw-byte trace sink (`is_read`: true for bytes read,
    /// false for bytes written).
    pub fn set_trace_callback(&mut self, cb: impl FnMut(u8, bool) + Send + 'static) {
        self.trace_cb = Some(Box::new(cb));
    }

    /// Sets our own bus address, deriving the paired slave address.
    /// Falls back to `0xff` if `source` is not a valid master address.
    pub fn set_address(&mut self, source: u8) {
        self.address = if is_master_address(source) { source } else { 0xff };
        self.slave_address = slave_address(self.address);
    }

    /// Our own master address.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Our paired slave address (`address + 5`).
    pub fn slave_address(&self) -> u8 {
        self.slave_address
    }

    /// Sets the lock counter ceiling. Any value above
    /// [`crate::consts::MAX_LOCK_COUNTER_CEILING`] is silently clamped to
    /// [`crate::consts::DEFAULT_MAX_LOCK_COUNTER`] rather than to the
    /// ceiling itself — this is the source's literal, if surprising,
    /// behaviour, carried forward unchanged.
    pub fn set_max_lock_counter(&mut self, counter: u8) {
        self.max_lock_counter = if counter > crate::consts::MAX_LOCK_COUNTER_CEILING {
            crate::consts::DEFAULT_MAX_LOCK_COUNTER
        } else {
            counter
        };
        self.lock_counter = self.max_lock_counter;
    }

    /// The current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Whether an active (outbound) cycle is currently in flight or queued
    /// to start.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Resets cycle state (buffers, counters-of-progress) without touching
    /// statistics, and returns to [`State::PassiveReceiveMaster`].
    pub fn reset(&mut self) {
        self.state = State::PassiveReceiveMaster;
        self.reset_active();
        self.reset_passive();
    }

    /// Statistics snapshot.
    pub fn counters(&self) -> Counters {
        self.counters
    }

    /// Clears all statistics counters.
    pub fn reset_counters(&mut self) {
        self.counters = Counters::new();
    }

    /// Takes ownership of `master_bytes` as the handler's one in-flight
    /// active telegram (`QQ ZZ PB SB NN D1..DN`, no CRC; `QQ` must equal
    /// our own address and is overwritten with it regardless). Returns
    /// `false` if the bytes don't form a valid master telegram, or if no
    /// bus-write callback is registered — without one, the handler could
    /// arbitrate and believe it had written bytes that never reached the
    /// wire, then wait forever for an echo that will never arrive.
    pub fn enqueue_active(&mut self, payload: &[u8]) -> bool {
        self.active = false;
        if payload.is_empty() || self.bus_write.is_none() {
            return false;
        }
        self.active_telegram = Telegram::build_master(self.address, payload);
        if self.active_telegram.master_state() == TelegramState::Ok {
            self.active = true;
        } else {
            self.counters.request_error += 1;
        }
        self.active
    }

    /// Takes the outcome of the active cycle that just concluded, if any.
    /// Returns `None` while a cycle is still in progress.
    pub fn take_cycle_outcome(&mut self) -> Option<CycleOutcome> {
        self.cycle_outcome.take()
    }

    /// Feeds one byte read from the bus into the state machine, then emits
    /// at most one reply byte through the write callback. This is the
    /// single entry point the driver loop calls per byte.
    pub fn run(&mut self, byte: u8) {
        log::trace!("<{byte:02x}");
        if let Some(cb) = self.trace_cb.as_mut() {
            cb(byte, true);
        }
        self.receive(byte);
        self.send();
    }

    fn emit(&mut self, byte: u8) {
        log::trace!(">{byte:02x}");
        if let Some(cb) = self.trace_cb.as_mut() {
            cb(byte, false);
        }
        if let Some(cb) = self.bus_write.as_mut() {
            cb(byte);
        }
    }

    fn log_error(&mut self, message: &str) {
        log::error!("{message}");
        if let Some(cb) = self.error_cb.as_mut() {
            cb(message);
        }
    }

    fn log_warn(&self, warning: Warning) {
        log::warn!("{warning}");
    }

    fn change_state(&mut self, state: State) {
        if self.state != state {
            log::debug!("{:?}", state);
            if state == State::PassiveReceiveMaster || self.state == State::PassiveReceiveMaster {
                log::info!("{:?} -> {:?}", self.state, state);
            }
            self.state = state;
        }
    }

    fn receive(&mut self, byte: u8) {
        match self.state {
            State::PassiveReceiveMaster => self.on_passive_receive_master(byte),
            State::PassiveReceiveMasterAck => self.on_passive_receive_master_ack(byte),
            State::PassiveReceiveSlave => self.on_passive_receive_slave(byte),
            State::PassiveReceiveSlaveAck => self.on_passive_receive_slave_ack(byte),
            State::ReactiveSendMasterPosAck => self.on_reactive_send_master_pos_ack(),
            State::ReactiveSendMasterNegAck => self.on_reactive_send_master_neg_ack(),
            State::ReactiveSendSlave => self.on_reactive_send_slave(),
            State::ReactiveReceiveSlaveAck => self.on_reactive_receive_slave_ack(byte),
            State::RequestBusFirstTry => self.on_request_bus_first_try(byte),
            State::RequestBusPriorityRetry => self.on_request_bus_priority_retry(byte),
            State::RequestBusSecondTry => self.on_request_bus_second_try(byte),
            State::ActiveSendMaster => self.on_active_send_master(),
            State::ActiveReceiveMasterAck => self.on_active_receive_master_ack(byte),
            State::ActiveReceiveSlave => self.on_active_receive_slave(byte),
            State::ActiveSendSlavePosAck => self.on_active_send_slave_pos_ack(),
            State::ActiveSendSlaveNegAck => self.on_active_send_slave_neg_ack(),
            State::ReleaseBus => self.change_state(State::PassiveReceiveMaster),
        }
    }

    fn send(&mut self) {
        match self.state {
            State::ReactiveSendMasterPosAck => self.emit(ACK),
            State::ReactiveSendMasterNegAck => self.emit(NAK),
            State::ReactiveSendSlave => {
                let byte = self.passive_slave[self.passive_slave_index];
                self.emit(byte);
            }
            State::RequestBusFirstTry | State::RequestBusSecondTry => {
                let address = self.address;
                self.emit(address);
            }
            State::ActiveSendMaster => {
                let byte = self.active_master[self.active_master_index];
                self.emit(byte);
            }
            State::ActiveSendSlavePosAck => self.emit(ACK),
            State::ActiveSendSlaveNegAck => self.emit(NAK),
            State::ReleaseBus => self.emit(SYN),
            _ => {}
        }
    }

    fn on_passive_receive_master(&mut self, byte: u8) {
        if byte != SYN {
            self.passive_master.push(byte);

            if self.passive_master.len() == 5 {
                self.passive_master_dbx = self.passive_master[4] as usize;
            }
            if byte == EXP {
                self.passive_master_dbx += 1;
            }

            if self.passive_master.len() >= 5 + self.passive_master_dbx + 1 {
                let wire = crate::sequence::Sequence::from_stuffed(&self.passive_master);
                self.passive_telegram = Telegram::empty();
                self.passive_telegram.create_master(&wire);

                if self.passive_telegram.master_state() == TelegramState::Ok {
                    let master_bytes = self.passive_telegram.master().as_slice().to_vec();
                    match self.passive_telegram.kind() {
                        TelegramType::Broadcast => {
                            self.reactive_cb.as_mut().map(|cb| cb(&master_bytes));
                            self.counters.passive_bc += 1;
                            self.reset_passive();
                        }
                        _ if self.passive_master[1] == self.address => {
                            let response = self
                                .reactive_cb
                                .as_mut()
                                .and_then(|cb| cb(&master_bytes));
                            self.counters.passive_mm_at_me += 1;
                            let _ = response;
                            self.change_state(State::ReactiveSendMasterPosAck);
                        }
                        _ if self.passive_master[1] == self.slave_address => {
                            self.counters.passive_ms_at_me += 1;
                            let response = self
                                .reactive_cb
                                .as_mut()
                                .and_then(|cb| cb(&master_bytes))
                                .unwrap_or_default();
                            self.passive_telegram
                                .create_slave(&crate::sequence::Sequence::from_bytes(&response));
                            if self.passive_telegram.slave_state() == TelegramState::Ok {
                                let mut slave =
                                    crate::sequence::Sequence::from_bytes(self.passive_telegram.slave().as_slice());
                                let crc = self.passive_telegram.slave_crc();
                                slave.push(crc, false);
                                slave.stuff();
                                self.passive_slave = slave.as_slice().to_vec();
                                self.change_state(State::ReactiveSendMasterPosAck);
                            } else {
                                self.counters.errors_reactive_slave += 1;
                                self.on_passive_errors();
                                self.change_state(State::ReleaseBus);
                            }
                        }
                        _ => {
                            self.change_state(State::PassiveReceiveMasterAck);
                        }
                    }
                } else if self.passive_master[1] == self.address || self.passive_master[1] == self.slave_address {
                    self.counters.errors_reactive_master += 1;
                    self.passive_telegram = Telegram::empty();
                    self.passive_master.clear();
                    self.passive_master_dbx = 0;
                    self.change_state(State::ReactiveSendMasterNegAck);
                } else if matches!(
                    self.passive_telegram.kind(),
                    TelegramType::MasterMaster | TelegramType::MasterSlave
                ) {
                    self.change_state(State::PassiveReceiveMasterAck);
                } else {
                    self.counters.errors_passive_master += 1;
                    self.on_passive_errors();
                }
            }
        } else {
            if self.passive_master.len() != 1 && self.lock_counter > 0 {
                self.lock_counter -= 1;
            }
            self.on_passive_errors();
            self.on_active_errors();

            let available = self.is_data_available.as_ref().map(|cb| cb()).unwrap_or(false);

            if self.lock_counter == 0 && !available && self.active {
                let mut master = crate::sequence::Sequence::from_bytes(self.active_telegram.master().as_slice());
                let crc = self.active_telegram.master_crc();
                master.push(crc, false);
                master.stuff();
                self.active_master = master.as_slice().to_vec();
                self.change_state(State::RequestBusFirstTry);
            }
        }
    }

    fn on_passive_receive_master_ack(&mut self, byte: u8) {
        if byte == ACK {
            if self.passive_telegram.kind() == TelegramType::MasterMaster {
                let master = self.passive_telegram.master().as_slice().to_vec();
                let slave = self.passive_telegram.slave().as_slice().to_vec();
                self.passive_cb.as_mut().map(|cb| cb(&master, &slave));
                self.counters.passive_mm += 1;
                self.reset_passive();
                self.change_state(State::PassiveReceiveMaster);
            } else {
                self.change_state(State::PassiveReceiveSlave);
            }
        } else if byte != SYN && !self.passive_master_repeated {
            self.passive_master_repeated = true;
            self.passive_telegram = Telegram::empty();
            self.passive_master.clear();
            self.passive_master_dbx = 0;
            self.change_state(State::PassiveReceiveMaster);
        } else {
            self.counters.errors_passive_master_ack += 1;
            self.log_warn(Warning::AckNegativeRetry);
            self.on_passive_errors();
            self.change_state(State::PassiveReceiveMaster);
        }
    }

    fn on_passive_receive_slave(&mut self, byte: u8) {
        self.passive_slave.push(byte);
        if self.passive_slave.len() == 1 {
            self.passive_slave_dbx = byte as usize;
        }
        if byte == EXP {
            self.passive_slave_dbx += 1;
        }
        if self.passive_slave.len() >= 1 + self.passive_slave_dbx + 1 {
            let wire = crate::sequence::Sequence::from_stuffed(&self.passive_slave);
            self.passive_telegram.create_slave(&wire);
            if self.passive_telegram.slave_state() != TelegramState::Ok {
                self.counters.errors_passive_slave += 1;
            }
            self.change_state(State::PassiveReceiveSlaveAck);
        }
    }

    fn on_passive_receive_slave_ack(&mut self, byte: u8) {
        if byte == ACK {
            let master = self.passive_telegram.master().as_slice().to_vec();
            let slave = self.passive_telegram.slave().as_slice().to_vec();
            self.passive_cb.as_mut().map(|cb| cb(&master, &slave));
            self.counters.passive_ms += 1;
            self.reset_passive();
            self.change_state(State::PassiveReceiveMaster);
        } else if byte == NAK && !self.passive_slave_repeated {
            self.passive_slave_repeated = true;
            self.passive_slave.clear();
            self.passive_slave_dbx = 0;
            self.change_state(State::PassiveReceiveSlave);
        } else {
            self.counters.errors_passive_slave_ack += 1;
            self.log_warn(Warning::AckNegativeRetry);
            self.on_passive_errors();
            self.change_state(State::PassiveReceiveMaster);
        }
    }

    fn on_reactive_send_master_pos_ack(&mut self) {
        if self.passive_telegram.kind() == TelegramType::MasterMaster {
            self.reset_passive();
            self.change_state(State::PassiveReceiveMaster);
        } else {
            self.change_state(State::ReactiveSendSlave);
        }
    }

    fn on_reactive_send_master_neg_ack(&mut self) {
        self.change_state(State::PassiveReceiveMaster);
        if !self.passive_master_repeated {
            self.passive_master_repeated = true;
        } else {
            self.counters.errors_reactive_master_ack += 1;
            self.on_passive_errors();
        }
    }

    fn on_reactive_send_slave(&mut self) {
        self.passive_slave_index += 1;
        if self.passive_slave_index >= self.passive_slave.len() {
            self.change_state(State::ReactiveReceiveSlaveAck);
        }
    }

    fn on_reactive_receive_slave_ack(&mut self, byte: u8) {
        if byte == NAK && !self.passive_slave_repeated {
            self.passive_slave_repeated = true;
            self.passive_slave_index = 0;
            self.change_state(State::ReactiveSendSlave);
        } else {
            if byte == NAK {
                self.counters.errors_reactive_slave_ack += 1;
                self.log_warn(Warning::MessageInvalid);
                self.on_passive_errors();
            } else {
                self.reset_passive();
            }
            self.change_state(State::PassiveReceiveMaster);
        }
    }

    fn on_request_bus_first_try(&mut self, byte: u8) {
        if byte != self.address {
            if (byte & 0x0F) == (self.address & 0x0F) {
                self.log_warn(Warning::PriorityClassFitRetry);
                self.change_state(State::RequestBusPriorityRetry);
            } else {
                self.log_warn(Warning::ArbitrationLost);
                self.counters.request_lost += 1;
                self.counters.request_lost_1 += 1;
                self.passive_master.push(byte);
                self.active = false;
                self.active_telegram = Telegram::empty();
                self.active_master.clear();
                self.cycle_outcome = Some(CycleOutcome::ArbitrationLost);
                self.change_state(State::PassiveReceiveMaster);
            }
        } else {
            self.counters.request_won += 1;
            self.counters.request_won_1 += 1;
            self.active_master_index = 1;
            self.change_state(State::ActiveSendMaster);
        }
    }

    fn on_request_bus_priority_retry(&mut self, byte: u8) {
        if byte != SYN {
            self.counters.request_error += 1;
            self.active = false;
            self.active_telegram = Telegram::empty();
            self.active_master.clear();
            self.cycle_outcome = Some(CycleOutcome::ArbitrationLost);
            self.change_state(State::PassiveReceiveMaster);
        } else {
            self.counters.request_retry += 1;
            self.change_state(State::RequestBusSecondTry);
        }
    }

    fn on_request_bus_second_try(&mut self, byte: u8) {
        if byte != self.address {
            self.counters.request_lost += 1;
            self.counters.request_lost_2 += 1;
            self.passive_master.push(byte);
            self.active = false;
            self.active_telegram = Telegram::empty();
            self.active_master.clear();
            self.cycle_outcome = Some(CycleOutcome::ArbitrationLost);
            self.change_state(State::PassiveReceiveMaster);
        } else {
            self.counters.request_won += 1;
            self.counters.request_won_2 += 1;
            self.active_master_index = 1;
            self.change_state(State::ActiveSendMaster);
        }
    }

    fn on_active_send_master(&mut self) {
        self.active_master_index += 1;
        if self.active_master_index >= self.active_master.len() {
            if self.active_telegram.kind() == TelegramType::Broadcast {
                let master = self.active_telegram.master().as_slice().to_vec();
                self.active_cb.as_mut().map(|cb| cb(&master, &[]));
                self.counters.active_bc += 1;
                self.cycle_outcome = Some(CycleOutcome::Success(Vec::new()));
                self.reset_active();
                self.change_state(State::ReleaseBus);
            } else {
                self.change_state(State::ActiveReceiveMasterAck);
            }
        }
    }

    fn on_active_receive_master_ack(&mut self, byte: u8) {
        if byte == ACK {
            if self.active_telegram.kind() == TelegramType::MasterMaster {
                let master = self.active_telegram.master().as_slice().to_vec();
                self.active_cb.as_mut().map(|cb| cb(&master, &[]));
                self.counters.active_mm += 1;
                self.cycle_outcome = Some(CycleOutcome::Success(Vec::new()));
                self.reset_active();
                self.change_state(State::ReleaseBus);
            } else {
                self.change_state(State::ActiveReceiveSlave);
            }
        } else if !self.active_master_repeated {
            self.log_warn(Warning::AckNegativeRetry);
            self.active_master_repeated = true;
            self.active_master_index = 0;
            self.change_state(State::ActiveSendMaster);
        } else {
            self.counters.errors_active_master_ack += 1;
            self.cycle_outcome = Some(CycleOutcome::Failed(ErrorKind::Transmit));
            self.on_active_errors_force();
            self.change_state(State::ReleaseBus);
        }
    }

    fn on_active_receive_slave(&mut self, byte: u8) {
        self.active_slave.push(byte);
        if self.active_slave.len() == 1 {
            self.active_slave_dbx = byte as usize;
        }
        if byte == EXP {
            self.active_slave_dbx += 1;
        }
        if self.active_slave.len() >= 1 + self.active_slave_dbx + 1 {
            let wire = crate::sequence::Sequence::from_stuffed(&self.active_slave);
            self.active_telegram.create_slave(&wire);
            if self.active_telegram.slave_state() == TelegramState::Ok {
                self.change_state(State::ActiveSendSlavePosAck);
            } else {
                self.counters.errors_active_slave += 1;
                self.active_slave.clear();
                self.active_slave_dbx = 0;
                self.change_state(State::ActiveSendSlaveNegAck);
            }
        }
    }

    fn on_active_send_slave_pos_ack(&mut self) {
        let master = self.active_telegram.master().as_slice().to_vec();
        let slave = self.active_telegram.slave().as_slice().to_vec();
        self.active_cb.as_mut().map(|cb| cb(&master, &slave));
        self.counters.active_ms += 1;
        self.cycle_outcome = Some(CycleOutcome::Success(slave));
        self.reset_active();
        self.change_state(State::ReleaseBus);
    }

    fn on_active_send_slave_neg_ack(&mut self) {
        if !self.active_slave_repeated {
            self.active_slave_repeated = true;
            self.log_warn(Warning::ResponseInvalidRetry);
            self.change_state(State::ActiveReceiveSlave);
        } else {
            self.counters.errors_active_slave_ack += 1;
            self.cycle_outcome = Some(CycleOutcome::Failed(ErrorKind::Transmit));
            self.on_active_errors_force();
            self.change_state(State::ReleaseBus);
        }
    }

    fn on_passive_errors(&mut self) {
        let dirty = !self.passive_master.is_empty()
            || self.passive_master_dbx > 0
            || self.passive_master_repeated
            || !self.passive_slave.is_empty()
            || self.passive_slave_dbx > 0
            || self.passive_slave_index > 0
            || self.passive_slave_repeated;
        if !dirty {
            return;
        }
        self.log_error(&format!(
            "passive | master DBx: {} repeated: {} | slave DBx: {} index: {} repeated: {}",
            self.passive_master_dbx,
            self.passive_master_repeated,
            self.passive_slave_dbx,
            self.passive_slave_index,
            self.passive_slave_repeated
        ));

        // Bucket the reset by trigger, then always clear: every abandon
        // returns to PassiveReceiveMaster with empty transient buffers.
        if self.passive_master.len() == 1 && self.passive_master[0] == 0x00 {
            self.counters.resets_passive_00 += 1;
        } else if self.passive_master.len() == 6 && self.passive_master[2] == 0x07 && self.passive_master[3] == 0x04 {
            self.counters.resets_passive_0704 += 1;
        }
        self.reset_passive();
    }

    fn on_active_errors(&mut self) {
        let dirty = !self.active_master.is_empty()
            || self.active_master_index > 0
            || self.active_master_repeated
            || !self.active_slave.is_empty()
            || self.active_slave_dbx > 0
            || self.active_slave_repeated;
        if !dirty {
            return;
        }
        self.on_active_errors_force();
    }

    fn on_active_errors_force(&mut self) {
        self.log_error(&format!(
            "active | master index: {} repeated: {} | slave DBx: {} repeated: {}",
            self.active_master_index, self.active_master_repeated, self.active_slave_dbx, self.active_slave_repeated
        ));
        self.counters.resets_active += 1;
        self.reset_active();
    }

    fn reset_passive(&mut self) {
        self.passive_telegram = Telegram::empty();

        self.passive_master.clear();
        self.passive_master_dbx = 0;
        self.passive_master_repeated = false;

        self.passive_slave.clear();
        self.passive_slave_dbx = 0;
        self.passive_slave_index = 0;
        self.passive_slave_repeated = false;
    }

    fn reset_active(&mut self) {
        self.lock_counter = self.max_lock_counter;

        self.active = false;
        self.active_telegram = Telegram::empty();

        self.active_master.clear();
        self.active_master_index = 0;
        self.active_master_repeated = false;

        self.active_slave.clear();
        self.active_slave_dbx = 0;
        self.active_slave_repeated = false;
    }
}
