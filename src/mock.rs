//! Mock hardware for testing the drivers off target.
//!
//! Everything here records what the driver did so tests can assert on bus
//! traffic, line levels and elapsed delays.

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet, VecDeque},
    convert::Infallible,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
};

use embedded_hal::{
    blocking::{
        delay::{DelayMs, DelayUs},
        i2c::{Read, SevenBitAddress, Write, WriteRead},
    },
    digital::v2::{InputPin, OutputPin},
};

use crate::sensors::ultrasonic::{EchoLines, MicrosClock};

/// Error returned by [`MockI2c`] when a transaction is not acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockI2cError {
    Nack,
}

/// A single register write seen on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    pub device: u8,
    pub register: u8,
    pub value: u8,
}

/// I2C bus populated with register-mapped devices.
///
/// A device exists once any of its registers has been set. Transactions to
/// unknown devices are not acknowledged.
#[derive(Debug, Default)]
pub struct MockI2c {
    devices: HashMap<u8, [u8; 256]>,
    queued: HashMap<(u8, u8), VecDeque<u8>>,
    failing_reads: HashSet<u8>,
    failing_read_starts: HashSet<(u8, u8)>,
    failing_writes: HashSet<(u8, u8)>,
    writes: Vec<RegisterWrite>,
}

impl MockI2c {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_register(&mut self, device: u8, register: u8, value: u8) {
        self.set_registers(device, register, &[value]);
    }

    pub fn set_registers(&mut self, device: u8, start: u8, values: &[u8]) {
        let map = self.devices.entry(device).or_insert([0u8; 256]);
        for (offset, value) in values.iter().enumerate() {
            map[(start as usize + offset) & 0xFF] = *value;
        }
    }

    pub fn register(&self, device: u8, register: u8) -> u8 {
        self.devices
            .get(&device)
            .map(|map| map[register as usize])
            .unwrap_or(0)
    }

    /// Values returned by the next reads starting at `register`, before the
    /// register map value is used again.
    pub fn queue_reads(&mut self, device: u8, register: u8, values: &[u8]) {
        self.devices.entry(device).or_insert([0u8; 256]);
        self.queued
            .entry((device, register))
            .or_default()
            .extend(values.iter().copied());
    }

    pub fn fail_reads(&mut self, device: u8, fail: bool) {
        if fail {
            self.failing_reads.insert(device);
        } else {
            self.failing_reads.remove(&device);
        }
    }

    /// Rejects burst reads starting at `register`.
    pub fn fail_read(&mut self, device: u8, register: u8) {
        self.failing_read_starts.insert((device, register));
    }

    /// Rejects every write that touches `register`.
    pub fn fail_write(&mut self, device: u8, register: u8) {
        self.failing_writes.insert((device, register));
    }

    pub fn clear_failures(&mut self) {
        self.failing_reads.clear();
        self.failing_read_starts.clear();
        self.failing_writes.clear();
    }

    pub fn writes(&self) -> &[RegisterWrite] {
        &self.writes
    }

    /// Values written to one register, oldest first.
    pub fn writes_to(&self, device: u8, register: u8) -> Vec<u8> {
        self.writes
            .iter()
            .filter(|w| w.device == device && w.register == register)
            .map(|w| w.value)
            .collect()
    }

    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }

    fn read_from(&mut self, device: u8, start: u8, buffer: &mut [u8]) -> Result<(), MockI2cError> {
        if self.failing_reads.contains(&device) || self.failing_read_starts.contains(&(device, start)) {
            return Err(MockI2cError::Nack);
        }
        let map = *self.devices.get(&device).ok_or(MockI2cError::Nack)?;
        for (offset, byte) in buffer.iter_mut().enumerate() {
            let register = ((start as usize + offset) & 0xFF) as u8;
            *byte = self
                .queued
                .get_mut(&(device, register))
                .and_then(|queue| queue.pop_front())
                .unwrap_or(map[register as usize]);
        }
        Ok(())
    }
}

impl Write for MockI2c {
    type Error = MockI2cError;

    fn write(&mut self, address: SevenBitAddress, bytes: &[u8]) -> Result<(), Self::Error> {
        if !self.devices.contains_key(&address) {
            return Err(MockI2cError::Nack);
        }
        let (start, values) = match bytes.split_first() {
            Some(split) => split,
            None => return Ok(()),
        };
        for offset in 0..values.len() {
            let register = start.wrapping_add(offset as u8);
            if self.failing_writes.contains(&(address, register)) {
                return Err(MockI2cError::Nack);
            }
        }
        for (offset, value) in values.iter().enumerate() {
            let register = start.wrapping_add(offset as u8);
            self.set_register(address, register, *value);
            self.writes.push(RegisterWrite {
                device: address,
                register,
                value: *value,
            });
        }
        Ok(())
    }
}

impl WriteRead for MockI2c {
    type Error = MockI2cError;

    fn write_read(
        &mut self,
        address: SevenBitAddress,
        bytes: &[u8],
        buffer: &mut [u8],
    ) -> Result<(), Self::Error> {
        let start = bytes.first().copied().unwrap_or(0);
        self.read_from(address, start, buffer)
    }
}

impl Read for MockI2c {
    type Error = MockI2cError;

    fn read(&mut self, address: SevenBitAddress, buffer: &mut [u8]) -> Result<(), Self::Error> {
        self.read_from(address, 0, buffer)
    }
}

/// Delay provider that only records what was requested.
#[derive(Debug, Default, Clone)]
pub struct MockDelay {
    /// Every requested delay in microseconds, in call order.
    pub calls: Vec<u32>,
}

impl MockDelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_us(&self) -> u64 {
        self.calls.iter().map(|us| *us as u64).sum()
    }

    /// Number of delays of exactly `ms` milliseconds.
    pub fn count_ms(&self, ms: u32) -> usize {
        self.calls.iter().filter(|us| **us == ms * 1000).count()
    }
}

impl DelayMs<u16> for MockDelay {
    fn delay_ms(&mut self, ms: u16) {
        self.calls.push(ms as u32 * 1000);
    }
}

impl DelayMs<u32> for MockDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.calls.push(ms * 1000);
    }
}

impl DelayUs<u16> for MockDelay {
    fn delay_us(&mut self, us: u16) {
        self.calls.push(us as u32);
    }
}

impl DelayUs<u32> for MockDelay {
    fn delay_us(&mut self, us: u32) {
        self.calls.push(us);
    }
}

/// Electrical state of a two-wire bus with one misbehaving peripheral.
#[derive(Debug, Default)]
pub struct WireState {
    pub scl_driven_low: bool,
    pub sda_driven_low: bool,
    /// Peripheral holds SCL low permanently.
    pub scl_stuck: bool,
    /// Peripheral stretches SCL forever once the first clock pulse was sent.
    pub stretch_after_pulse: bool,
    /// Peripheral holds SDA low until this many clock pulses were received.
    pub sda_release_after: Option<u32>,
    /// Clock pulses (low to released transitions) sent by the host.
    pub clock_pulses: u32,
    /// Times the host drove SDA low.
    pub sda_pulses: u32,
}

impl WireState {
    fn scl_low(&self) -> bool {
        self.scl_driven_low || self.scl_stuck || (self.stretch_after_pulse && self.clock_pulses > 0)
    }

    fn sda_low(&self) -> bool {
        self.sda_driven_low
            || self
                .sda_release_after
                .map_or(false, |pulses| self.clock_pulses < pulses)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wire {
    Scl,
    Sda,
}

/// Open-drain line of a [`WireState`]: `set_low` drives, `set_high` releases.
#[derive(Debug, Clone)]
pub struct MockLine {
    state: Rc<RefCell<WireState>>,
    wire: Wire,
}

/// Creates the clock and data lines of one bus.
pub fn mock_wires(state: WireState) -> (MockLine, MockLine, Rc<RefCell<WireState>>) {
    let state = Rc::new(RefCell::new(state));
    (
        MockLine {
            state: state.clone(),
            wire: Wire::Scl,
        },
        MockLine {
            state: state.clone(),
            wire: Wire::Sda,
        },
        state,
    )
}

impl OutputPin for MockLine {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        let mut state = self.state.borrow_mut();
        match self.wire {
            Wire::Scl => state.scl_driven_low = true,
            Wire::Sda => {
                state.sda_driven_low = true;
                state.sda_pulses += 1;
            }
        }
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        let mut state = self.state.borrow_mut();
        match self.wire {
            Wire::Scl => {
                if state.scl_driven_low {
                    state.clock_pulses += 1;
                }
                state.scl_driven_low = false;
            }
            Wire::Sda => state.sda_driven_low = false,
        }
        Ok(())
    }
}

impl InputPin for MockLine {
    type Error = Infallible;

    fn is_high(&self) -> Result<bool, Self::Error> {
        self.is_low().map(|low| !low)
    }

    fn is_low(&self) -> Result<bool, Self::Error> {
        let state = self.state.borrow();
        Ok(match self.wire {
            Wire::Scl => state.scl_low(),
            Wire::Sda => state.sda_low(),
        })
    }
}

/// Microsecond clock that tests move by hand. Every read can also advance
/// it by a fixed step so busy-wait loops terminate.
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    now: Arc<AtomicU32>,
    step: Arc<AtomicU32>,
}

impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, us: u32) {
        self.now.store(us, Ordering::SeqCst);
    }

    pub fn advance(&self, us: u32) {
        self.now.fetch_add(us, Ordering::SeqCst);
    }

    pub fn auto_step(&self, us: u32) {
        self.step.store(us, Ordering::SeqCst);
    }

    pub fn now(&self) -> u32 {
        self.now.load(Ordering::SeqCst)
    }
}

impl MicrosClock for MockClock {
    fn micros(&self) -> u32 {
        let step = self.step.load(Ordering::SeqCst);
        self.now.fetch_add(step, Ordering::SeqCst)
    }
}

/// Error returned by [`MockEchoLines`] when a fault was injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockPinError {
    Fault,
}

/// Trigger and echo lines of an ultrasonic sensor.
///
/// The echo level is either set by hand or follows a pulse window on the
/// [`MockClock`].
#[derive(Debug, Clone)]
pub struct MockEchoLines {
    clock: MockClock,
    trigger_high: Arc<AtomicBool>,
    echo_high: Arc<AtomicBool>,
    attached: Arc<AtomicBool>,
    attaches: Arc<AtomicU32>,
    detaches: Arc<AtomicU32>,
    pulse: Arc<(AtomicU32, AtomicU32)>,
    fail_trigger: Arc<AtomicBool>,
}

impl MockEchoLines {
    pub fn new(clock: MockClock) -> Self {
        Self {
            clock,
            trigger_high: Arc::new(AtomicBool::new(false)),
            echo_high: Arc::new(AtomicBool::new(false)),
            attached: Arc::new(AtomicBool::new(false)),
            attaches: Arc::new(AtomicU32::new(0)),
            detaches: Arc::new(AtomicU32::new(0)),
            pulse: Arc::new((AtomicU32::new(0), AtomicU32::new(0))),
            fail_trigger: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_echo(&self, high: bool) {
        self.echo_high.store(high, Ordering::SeqCst);
    }

    /// Echo reads high while the clock is within `[rise, fall)`.
    pub fn echo_pulse(&self, rise: u32, fall: u32) {
        self.pulse.0.store(rise, Ordering::SeqCst);
        self.pulse.1.store(fall, Ordering::SeqCst);
    }

    /// The next trigger write fails and leaves the level unchanged.
    pub fn fail_next_trigger(&self) {
        self.fail_trigger.store(true, Ordering::SeqCst);
    }

    pub fn trigger_is_high(&self) -> bool {
        self.trigger_high.load(Ordering::SeqCst)
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn attaches(&self) -> u32 {
        self.attaches.load(Ordering::SeqCst)
    }

    pub fn detaches(&self) -> u32 {
        self.detaches.load(Ordering::SeqCst)
    }
}

impl EchoLines for MockEchoLines {
    type Error = MockPinError;

    fn set_trigger(&self, high: bool) -> Result<(), Self::Error> {
        if self.fail_trigger.swap(false, Ordering::SeqCst) {
            return Err(MockPinError::Fault);
        }
        self.trigger_high.store(high, Ordering::SeqCst);
        Ok(())
    }

    fn echo_is_high(&self) -> Result<bool, Self::Error> {
        let (rise, fall) = (
            self.pulse.0.load(Ordering::SeqCst),
            self.pulse.1.load(Ordering::SeqCst),
        );
        let now = self.clock.now();
        let in_pulse = rise < fall && (rise..fall).contains(&now);
        Ok(in_pulse || self.echo_high.load(Ordering::SeqCst))
    }

    fn attach_interrupt(&self) -> Result<(), Self::Error> {
        self.attached.store(true, Ordering::SeqCst);
        self.attaches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn detach_interrupt(&self) -> Result<(), Self::Error> {
        self.attached.store(false, Ordering::SeqCst);
        self.detaches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
