//! Sensor acquisition for the flight controller: BME280 environmental sensor,
//! BNO055 orientation sensor and an interrupt driven ultrasonic rangefinder,
//! plus recovery of the shared I2C bus.

pub mod bus;
pub mod recovery;
pub mod sensors;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use bus::{BusConfig, RegisterBus};
pub use recovery::{free_bus, RecoveryError};
pub use sensors::{bme280, bno055, i2c_sensor::I2CSensor, ultrasonic};
