use std::{
    error::Error,
    fmt::{Debug, Display, Formatter},
};

use embedded_hal::{
    blocking::delay::{DelayMs, DelayUs},
    digital::v2::{InputPin, OutputPin},
};
use log::*;

/// Clock pulses sent before giving up on a peripheral that holds SDA low.
const MAX_CLOCK_PULSES: u8 = 20;
/// Polls of SCL (10 ms apart) while a peripheral stretches the clock.
const MAX_STRETCH_POLLS: u8 = 20;
const STRETCH_POLL_MS: u16 = 10;
const HALF_PERIOD_US: u16 = 10;

/// Releases a two-wire bus that a peripheral keeps busy after an unclean reset.
///
/// Both lines must be open-drain: `set_high` releases the line to its
/// pulled-up idle level and `set_low` drives it low. A peripheral caught in
/// the middle of a read keeps SDA low; clocking it until it lets go and then
/// sending a start and stop condition puts it back into idle. A peripheral
/// holding SCL low cannot be helped from the host side.
pub fn free_bus<SCL, SDA, D, E>(scl: &mut SCL, sda: &mut SDA, delay: &mut D) -> Result<(), RecoveryError<E>>
where
    SCL: InputPin<Error = E> + OutputPin<Error = E>,
    SDA: InputPin<Error = E> + OutputPin<Error = E>,
    D: DelayUs<u16> + DelayMs<u16>,
    E: Debug,
{
    scl.set_high()?;
    sda.set_high()?;
    delay.delay_us(HALF_PERIOD_US);

    if scl.is_low()? {
        warn!("free_bus: SCL is held low by a peripheral");
        return Err(RecoveryError::ClockHeldLow);
    }

    if sda.is_low()? {
        info!("free_bus: SDA is held low, clocking the peripheral free...");
        let mut pulses = 0;
        while sda.is_low()? && pulses < MAX_CLOCK_PULSES {
            pulses += 1;
            scl.set_low()?;
            delay.delay_us(HALF_PERIOD_US);
            scl.set_high()?;
            delay.delay_us(HALF_PERIOD_US);

            let mut polls = MAX_STRETCH_POLLS;
            while scl.is_low()? && polls > 0 {
                polls -= 1;
                delay.delay_ms(STRETCH_POLL_MS);
            }
            if scl.is_low()? {
                warn!("free_bus: peripheral kept stretching the clock after {pulses} pulses");
                return Err(RecoveryError::ClockStretchTimeout);
            }
        }

        if sda.is_low()? {
            warn!("free_bus: SDA still low after {pulses} clock pulses");
            return Err(RecoveryError::DataHeldLow);
        }
        debug!("free_bus: SDA released after {pulses} clock pulses");

        // start condition followed by a stop condition
        sda.set_low()?;
        delay.delay_us(HALF_PERIOD_US);
        sda.set_high()?;
        delay.delay_us(HALF_PERIOD_US);
    }

    sda.set_high()?;
    scl.set_high()?;

    if scl.is_low()? || sda.is_low()? {
        warn!("free_bus: bus did not return to idle");
        return Err(RecoveryError::BusNotIdle);
    }
    Ok(())
}

/// Describes why the bus could not be recovered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryError<E: Debug> {
    /// SCL was low before recovery started.
    ClockHeldLow,
    /// A peripheral stretched the clock for longer than 200 ms.
    ClockStretchTimeout,
    /// SDA stayed low through all clock pulses.
    DataHeldLow,
    /// One of the lines was low after the lines were released.
    BusNotIdle,
    /// Driving or sampling a line failed.
    Pin(E),
}

impl<E: Debug> Display for RecoveryError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use RecoveryError::*;
        match self {
            ClockHeldLow => f.write_str("Clock line is held low by a peripheral"),
            ClockStretchTimeout => f.write_str("Peripheral did not release the clock line"),
            DataHeldLow => f.write_str("Data line is still held low"),
            BusNotIdle => f.write_str("Bus did not return to idle"),
            Pin(error) => write!(f, "Pin error: {:?}", error),
        }
    }
}

impl<E: Debug> Error for RecoveryError<E> {}

impl<E: Debug> From<E> for RecoveryError<E> {
    fn from(error: E) -> Self {
        RecoveryError::Pin(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{mock_wires, MockDelay, WireState};

    #[test]
    fn idle_bus_is_left_alone() {
        let (mut scl, mut sda, state) = mock_wires(WireState::default());
        let mut delay = MockDelay::new();

        assert_eq!(free_bus(&mut scl, &mut sda, &mut delay), Ok(()));
        assert_eq!(state.borrow().clock_pulses, 0);
        assert_eq!(state.borrow().sda_pulses, 0);
    }

    #[test]
    fn clock_held_low_fails_without_toggling() {
        let (mut scl, mut sda, state) = mock_wires(WireState {
            scl_stuck: true,
            sda_release_after: Some(3),
            ..Default::default()
        });
        let mut delay = MockDelay::new();

        assert_eq!(
            free_bus(&mut scl, &mut sda, &mut delay),
            Err(RecoveryError::ClockHeldLow)
        );
        assert_eq!(state.borrow().clock_pulses, 0);
        assert_eq!(delay.calls, vec![10]);
    }

    #[test]
    fn stuck_data_line_is_clocked_free() {
        let (mut scl, mut sda, state) = mock_wires(WireState {
            sda_release_after: Some(5),
            ..Default::default()
        });
        let mut delay = MockDelay::new();

        assert_eq!(free_bus(&mut scl, &mut sda, &mut delay), Ok(()));

        let state = state.borrow();
        assert_eq!(state.clock_pulses, 5);
        // manual start and stop condition
        assert_eq!(state.sda_pulses, 1);
        assert!(!state.scl_driven_low);
        assert!(!state.sda_driven_low);
    }

    #[test]
    fn gives_up_after_twenty_clock_pulses() {
        let (mut scl, mut sda, state) = mock_wires(WireState {
            sda_release_after: Some(u32::MAX),
            ..Default::default()
        });
        let mut delay = MockDelay::new();

        assert_eq!(
            free_bus(&mut scl, &mut sda, &mut delay),
            Err(RecoveryError::DataHeldLow)
        );
        assert_eq!(state.borrow().clock_pulses, 20);
        assert_eq!(state.borrow().sda_pulses, 0);
    }

    #[test]
    fn endless_clock_stretching_times_out_after_200ms() {
        let (mut scl, mut sda, state) = mock_wires(WireState {
            sda_release_after: Some(3),
            stretch_after_pulse: true,
            ..Default::default()
        });
        let mut delay = MockDelay::new();

        assert_eq!(
            free_bus(&mut scl, &mut sda, &mut delay),
            Err(RecoveryError::ClockStretchTimeout)
        );
        assert_eq!(state.borrow().clock_pulses, 1);
        assert_eq!(delay.count_ms(10), 20);
    }

    #[test]
    fn errors_render_readable_messages() {
        let error: RecoveryError<()> = RecoveryError::DataHeldLow;
        assert_eq!(error.to_string(), "Data line is still held low");
        let error: RecoveryError<&str> = RecoveryError::Pin("gpio");
        assert_eq!(error.to_string(), "Pin error: \"gpio\"");
    }
}
