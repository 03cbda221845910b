use core::fmt::Debug;

use embedded_hal::blocking::i2c::*;
use serde::Deserialize;

/// Byte level register access on a two-wire bus.
///
/// Both chip drivers talk to their device exclusively through these three
/// operations, so any bus (a bare driver, a `shared-bus` proxy, a mock) works
/// as long as it implements the embedded-hal blocking I2C traits.
pub trait RegisterBus {
    type Error: Debug;

    /// Reads a single register.
    ///
    /// There is no error signal: a failed transfer yields `0x00`. Callers
    /// cross-check against a register with a known value, e.g. the chip id.
    fn read_byte(&mut self, device: u8, register: u8) -> u8;

    /// Reads `buffer.len()` consecutive registers starting at `start`.
    fn read_bytes(&mut self, device: u8, start: u8, buffer: &mut [u8]) -> Result<(), Self::Error>;

    /// Writes a single register.
    fn write_byte(&mut self, device: u8, register: u8, value: u8) -> Result<(), Self::Error>;
}

impl<I2C, E> RegisterBus for I2C
where
    I2C: Write<Error = E> + WriteRead<Error = E>,
    E: Debug,
{
    type Error = E;

    fn read_byte(&mut self, device: u8, register: u8) -> u8 {
        let mut buffer = [0u8; 1];
        self.write_read(device, &[register], &mut buffer).ok();
        buffer[0]
    }

    fn read_bytes(&mut self, device: u8, start: u8, buffer: &mut [u8]) -> Result<(), E> {
        self.write_read(device, &[start], buffer)
    }

    fn write_byte(&mut self, device: u8, register: u8, value: u8) -> Result<(), E> {
        self.write(device, &[register, value])
    }
}

/// Clock and timeout of the shared bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// SCL frequency in Hz.
    pub frequency_hz: u32,
    /// Longest time a peripheral may stretch the clock, in milliseconds.
    pub timeout_ms: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 400_000,
            timeout_ms: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockI2c, MockI2cError};

    const DEVICE: u8 = 0x42;

    #[test]
    fn read_byte_returns_register_value() {
        let mut i2c = MockI2c::new();
        i2c.set_register(DEVICE, 0x10, 0xAB);

        assert_eq!(i2c.read_byte(DEVICE, 0x10), 0xAB);
    }

    #[test]
    fn read_byte_yields_zero_when_device_is_absent() {
        let mut i2c = MockI2c::new();
        i2c.set_register(DEVICE, 0x10, 0xAB);

        assert_eq!(i2c.read_byte(0x13, 0x10), 0x00);
    }

    #[test]
    fn read_bytes_reads_consecutive_registers() {
        let mut i2c = MockI2c::new();
        i2c.set_registers(DEVICE, 0x20, &[1, 2, 3, 4]);

        let mut buffer = [0u8; 4];
        i2c.read_bytes(DEVICE, 0x20, &mut buffer).unwrap();
        assert_eq!(buffer, [1, 2, 3, 4]);
    }

    #[test]
    fn read_bytes_fails_on_nack() {
        let mut i2c = MockI2c::new();
        i2c.set_registers(DEVICE, 0x20, &[1, 2]);
        i2c.fail_reads(DEVICE, true);

        let mut buffer = [0u8; 2];
        assert_eq!(
            i2c.read_bytes(DEVICE, 0x20, &mut buffer),
            Err(MockI2cError::Nack)
        );
    }

    #[test]
    fn write_byte_updates_register_and_reports_failure() {
        let mut i2c = MockI2c::new();
        i2c.set_register(DEVICE, 0x3D, 0x00);
        i2c.write_byte(DEVICE, 0x3D, 0x0C).unwrap();
        assert_eq!(i2c.register(DEVICE, 0x3D), 0x0C);

        i2c.fail_write(DEVICE, 0x3D);
        assert!(i2c.write_byte(DEVICE, 0x3D, 0x00).is_err());
        assert_eq!(i2c.register(DEVICE, 0x3D), 0x0C);
    }

    #[test]
    fn write_byte_to_absent_device_fails() {
        let mut i2c = MockI2c::new();
        assert_eq!(i2c.write_byte(DEVICE, 0x3D, 0x0C), Err(MockI2cError::Nack));
        assert!(i2c.writes().is_empty());
    }

    #[test]
    fn default_config_is_fast_mode() {
        let config = BusConfig::default();
        assert_eq!(config.frequency_hz, 400_000);
        assert_eq!(config.timeout_ms, 1000);
    }

    #[test]
    fn config_fills_missing_fields_with_defaults() {
        let config: BusConfig = serde_json::from_str(r#"{ "frequency_hz": 100000 }"#).unwrap();
        assert_eq!(
            config,
            BusConfig {
                frequency_hz: 100_000,
                timeout_ms: 1000
            }
        );
    }
}
