//! Interrupt driven ultrasonic rangefinder (HC-SR04 style, inverted trigger).
//!
//! The trigger rests high. Pulling it low starts a ping, the echo line then
//! stays high for as long as the sound travels. The edge interrupt timestamps
//! both echo edges while the main loop keeps calling [`Ultrasonic::update`].

use std::{
    error::Error,
    fmt::{Debug, Display, Formatter},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
};

use embedded_hal::blocking::delay::DelayUs;
use log::*;

/// A cycle without falling edge is abandoned after this many microseconds.
pub const CYCLE_TIMEOUT_US: u32 = 20_000;
/// Echo duration per centimetre of distance, there and back.
pub const US_PER_CM: f32 = 58.0;

const PROBE_TRIGGER_US: u16 = 50;
const PROBE_TIMEOUT_US: u32 = 2_000;

/// Trigger output and echo input of the sensor.
///
/// All methods take `&self`: they are called from the edge interrupt as well
/// as from the polling side.
pub trait EchoLines: Send + Sync {
    type Error: Debug;

    fn set_trigger(&self, high: bool) -> Result<(), Self::Error>;

    fn echo_is_high(&self) -> Result<bool, Self::Error>;

    /// Enables the interrupt on both echo edges.
    fn attach_interrupt(&self) -> Result<(), Self::Error>;

    fn detach_interrupt(&self) -> Result<(), Self::Error>;
}

/// Free running microsecond counter, wrapping at `u32::MAX`.
pub trait MicrosClock: Send + Sync {
    fn micros(&self) -> u32;
}

/// State shared between [`Ultrasonic`] and its [`EchoHandler`].
#[derive(Debug)]
pub struct EchoState {
    echo_start: AtomicU32,
    echo_end: AtomicU32,
    cycle_start: AtomicU32,
    finished: AtomicBool,
    timeout_error: AtomicBool,
    listening: AtomicBool,
}

impl Default for EchoState {
    fn default() -> Self {
        Self {
            echo_start: AtomicU32::new(0),
            echo_end: AtomicU32::new(0),
            cycle_start: AtomicU32::new(0),
            // the first update starts a cycle
            finished: AtomicBool::new(true),
            timeout_error: AtomicBool::new(false),
            listening: AtomicBool::new(false),
        }
    }
}

struct Shared<L, C> {
    lines: L,
    clock: C,
    state: EchoState,
}

pub struct Ultrasonic<L, C>
where
    L: EchoLines,
    C: MicrosClock,
{
    shared: Arc<Shared<L, C>>,
}

impl<L, C> Ultrasonic<L, C>
where
    L: EchoLines,
    C: MicrosClock,
{
    pub fn new(lines: L, clock: C) -> Self {
        Self {
            shared: Arc::new(Shared {
                lines,
                clock,
                state: EchoState::default(),
            }),
        }
    }

    /// Returns the handler the platform has to call on every echo edge.
    pub fn echo_handler(&self) -> EchoHandler<L, C> {
        EchoHandler {
            shared: self.shared.clone(),
        }
    }

    /// Sends a single ping and waits for its echo.
    pub fn setup<D: DelayUs<u16>>(&mut self, delay: &mut D) -> Result<(), SensorError<L::Error>> {
        let lines = &self.shared.lines;
        info!("ultrasonic: probing for echo...");
        lines.set_trigger(true)?;
        delay.delay_us(PROBE_TRIGGER_US);
        lines.set_trigger(false)?;

        match self.pulse_in(PROBE_TIMEOUT_US)? {
            Some(width) => debug!("ultrasonic: probe echo after {width} us"),
            None => {
                warn!("ultrasonic: no echo within {PROBE_TIMEOUT_US} us");
                return Err(SensorError::NoEcho);
            }
        }
        lines.set_trigger(true)?;
        Ok(())
    }

    /// Starts a new measurement cycle once the previous one finished, or
    /// abandons the running cycle after [`CYCLE_TIMEOUT_US`].
    ///
    /// Returns [`SensorError::Timeout`] from the abandoned cycle until a later
    /// cycle sees a rising echo edge.
    pub fn update(&mut self) -> Result<(), SensorError<L::Error>> {
        let Shared {
            lines,
            clock,
            state,
        } = &*self.shared;
        let now = clock.micros();

        if state.finished.load(Ordering::Acquire) {
            state.cycle_start.store(now, Ordering::Relaxed);
            state.finished.store(false, Ordering::Relaxed);
            state.listening.store(true, Ordering::Release);
            lines.attach_interrupt()?;
            lines.set_trigger(false)?;
        } else {
            let elapsed = now.wrapping_sub(state.cycle_start.load(Ordering::Relaxed));
            // a falling edge may have won the race for the cycle
            if elapsed >= CYCLE_TIMEOUT_US && state.listening.swap(false, Ordering::AcqRel) {
                debug!("ultrasonic: no echo after {elapsed} us");
                state.timeout_error.store(true, Ordering::Relaxed);
                end_cycle(lines, state)?;
            }
        }

        if state.timeout_error.load(Ordering::Relaxed) {
            return Err(SensorError::Timeout);
        }
        Ok(())
    }

    /// Returns the distance of the last complete echo in centimetres.
    ///
    /// `None` while the latest rising edge is newer than the latest falling
    /// edge, i.e. no complete echo is available.
    pub fn distance(&mut self) -> Result<Option<u16>, SensorError<L::Error>> {
        self.update()?;
        let state = &self.shared.state;
        let start = state.echo_start.load(Ordering::Relaxed);
        let end = state.echo_end.load(Ordering::Relaxed);
        if start < end {
            Ok(Some(((end - start) as f32 / US_PER_CM) as u16))
        } else {
            Ok(None)
        }
    }

    /// Like [`Ultrasonic::distance`], but keeps the previous value in
    /// `distance` when no complete echo is available.
    pub fn distance_into(&mut self, distance: &mut u16) -> Result<(), SensorError<L::Error>> {
        if let Some(cm) = self.distance()? {
            *distance = cm;
        }
        Ok(())
    }

    pub fn timed_out(&self) -> bool {
        self.shared.state.timeout_error.load(Ordering::Relaxed)
    }

    /// Measures the width of the next high pulse on the echo line. `None`
    /// when the pulse did not start and end within `timeout_us`.
    fn pulse_in(&self, timeout_us: u32) -> Result<Option<u32>, L::Error> {
        let Shared { lines, clock, .. } = &*self.shared;
        let begin = clock.micros();
        let expired = || clock.micros().wrapping_sub(begin) > timeout_us;

        while lines.echo_is_high()? {
            if expired() {
                return Ok(None);
            }
        }
        while !lines.echo_is_high()? {
            if expired() {
                return Ok(None);
            }
        }
        let rise = clock.micros();
        while lines.echo_is_high()? {
            if expired() {
                return Ok(None);
            }
        }
        Ok(Some(clock.micros().wrapping_sub(rise)))
    }
}

/// Echo edge interrupt handler of one [`Ultrasonic`].
pub struct EchoHandler<L, C> {
    shared: Arc<Shared<L, C>>,
}

impl<L, C> Clone for EchoHandler<L, C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<L, C> EchoHandler<L, C>
where
    L: EchoLines,
    C: MicrosClock,
{
    /// Timestamps an echo edge. Edges outside of a measurement cycle are ignored.
    pub fn on_edge(&self) -> Result<(), SensorError<L::Error>> {
        let Shared {
            lines,
            clock,
            state,
        } = &*self.shared;
        if !state.listening.load(Ordering::Acquire) {
            return Ok(());
        }

        let now = clock.micros();
        if lines.echo_is_high()? {
            state.echo_start.store(now, Ordering::Relaxed);
            state.timeout_error.store(false, Ordering::Relaxed);
        } else if state.listening.swap(false, Ordering::AcqRel) {
            state.echo_end.store(now, Ordering::Relaxed);
            end_cycle(lines, state)?;
        }
        Ok(())
    }
}

/// Re-arms the trigger, stops edge interrupts and marks the cycle finished.
///
/// The cycle is finished even if a pin fails, so the next update starts a
/// new one. Reports the first pin error.
fn end_cycle<L: EchoLines>(lines: &L, state: &EchoState) -> Result<(), L::Error> {
    let trigger = lines.set_trigger(true);
    let detach = lines.detach_interrupt();
    state.finished.store(true, Ordering::Release);
    trigger.and(detach)
}

/// Describes errors returned by the rangefinder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError<E: Debug> {
    /// The probe ping at setup was not answered.
    NoEcho,
    /// A measurement cycle ended without falling echo edge.
    Timeout,
    Pin(E),
}

impl<E: Debug> Display for SensorError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use SensorError::*;
        match self {
            NoEcho => f.write_str("Ultrasonic sensor did not answer"),
            Timeout => f.write_str("Echo timed out"),
            Pin(error) => write!(f, "Pin error: {:?}", error),
        }
    }
}

impl<E: Debug> Error for SensorError<E> {}

impl<E: Debug> From<E> for SensorError<E> {
    fn from(error: E) -> Self {
        SensorError::Pin(error)
    }
}
