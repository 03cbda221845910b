use std::{
    error::Error,
    fmt::{Debug, Display, Formatter},
};

use bitfield::bitfield;
use embedded_hal::blocking::delay::DelayMs;
use log::*;
use serde::{Deserialize, Serialize};

use super::i2c_sensor::I2CSensor;
use crate::bus::RegisterBus;

pub const ADDRESS: u8 = 0x28;
pub const ADDRESS_ALTERNATIVE: u8 = 0x29;

// BNO055 Register address (page 0)
// Chip identification number, always reads 0xA0.
const BNO055_CHIP_ID_REG: u8 = 0x00;
// Selects register page 0 or 1.
const BNO055_PAGE_ID_REG: u8 = 0x07;
// Heading, roll and pitch, 3 little endian words.
const BNO055_EULER_H_LSB_REG: u8 = 0x1A;
// Linear acceleration X, Y and Z, 3 little endian words.
const BNO055_LINEAR_ACCEL_X_LSB_REG: u8 = 0x28;
// Calibration status of system, gyroscope, accelerometer and magnetometer.
const BNO055_CALIB_STAT_REG: u8 = 0x35;
const BNO055_SYS_STAT_REG: u8 = 0x39;
const BNO055_SYS_ERR_REG: u8 = 0x3A;
// Output units of acceleration, angular rate and Euler angles.
const BNO055_UNIT_SEL_REG: u8 = 0x3B;
const BNO055_OPR_MODE_REG: u8 = 0x3D;
const BNO055_PWR_MODE_REG: u8 = 0x3E;
// Self test, reset, interrupt reset and clock selection.
const BNO055_SYS_TRIGGER_REG: u8 = 0x3F;
const BNO055_AXIS_MAP_CONFIG_REG: u8 = 0x41;
const BNO055_AXIS_MAP_SIGN_REG: u8 = 0x42;
// First of the 22 offset and radius registers, up to 0x6A.
const BNO055_ACCEL_OFFSET_X_LSB_REG: u8 = 0x55;

const BNO055_CHIP_ID: u8 = 0xA0;
const BNO055_PAGE_ZERO: u8 = 0x00;
const BNO055_POWER_MODE_NORMAL: u8 = 0x00;
const BNO055_SYS_TRIGGER_RESET: u8 = 0b0010_0000;
const BNO055_SYS_TRIGGER_EXT_CLOCK: u8 = 0b1000_0000;
// X and Y swapped, Z kept; Y inverted. Matches the board mounting.
const BNO055_AXIS_MAP: u8 = 0x21;
const BNO055_AXIS_SIGN: u8 = 0x02;
// mg, rad/s, radians, °C, Windows orientation
const BNO055_UNITS: u8 = 0b0000_0111;
const BNO055_SYS_STATUS_ERROR: u8 = 0x01;

const POWER_ON_GRACE_MS: u16 = 1000;
// datasheet: 650 ms from reset to configuration mode
const RESET_SETTLE_MS: u16 = 700;
const POST_RESET_MS: u16 = 50;
const CONFIG_SETTLE_MS: u16 = 10;
// datasheet: up to 19 ms to change operating mode
const MODE_SWITCH_MS: u16 = 30;
const POLL_ATTEMPTS: u8 = 100;
const POLL_INTERVAL_MS: u16 = 10;

/// Euler angle resolution in radians mode.
pub const EULER_LSB_PER_RAD: f32 = 900.0;
/// Acceleration resolution in mg mode.
pub const ACCEL_LSB_PER_G: f32 = 1000.0;

/// Bit set in [`Bno055::calib_stat`] while the gyroscope is not calibrated.
pub const GYRO_UNCALIBRATED: u8 = 1;
/// Bit set in [`Bno055::calib_stat`] while the accelerometer is not calibrated.
pub const ACCEL_UNCALIBRATED: u8 = 2;
/// Bit set in [`Bno055::calib_stat`] while the magnetometer is not calibrated.
pub const MAG_UNCALIBRATED: u8 = 4;

/// Operation Mode of the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationMode {
    /// Configuration mode, the only mode that accepts configuration writes.
    Config = 0x00,
    AccOnly = 0x01,
    MagOnly = 0x02,
    GyroOnly = 0x03,
    AccMag = 0x04,
    AccGyro = 0x05,
    MagGyro = 0x06,
    /// All three sensors, no fusion.
    Amg = 0x07,
    /// Relative orientation from accelerometer and gyroscope.
    Imu = 0x08,
    /// Absolute heading from accelerometer and magnetometer.
    Compass = 0x09,
    /// Relative orientation from accelerometer and magnetometer.
    M4g = 0x0A,
    /// Full fusion without fast magnetometer calibration.
    NdofFmcOff = 0x0B,
    /// Full 9 degrees of freedom fusion.
    Ndof = 0x0C,
}

impl OperationMode {
    pub fn is_fusion(&self) -> bool {
        *self as u8 >= OperationMode::Imu as u8
    }
}

impl TryFrom<u8> for OperationMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use OperationMode::*;
        Ok(match value {
            0x00 => Config,
            0x01 => AccOnly,
            0x02 => MagOnly,
            0x03 => GyroOnly,
            0x04 => AccMag,
            0x05 => AccGyro,
            0x06 => MagGyro,
            0x07 => Amg,
            0x08 => Imu,
            0x09 => Compass,
            0x0A => M4g,
            0x0B => NdofFmcOff,
            0x0C => Ndof,
            other => return Err(other),
        })
    }
}

bitfield! {
    /// Calibration status, each field ranges from 0 (uncalibrated) to 3 (fully calibrated).
    pub struct CalibStat(u8);
    impl Debug;
    pub u8, sys, _: 7, 6;
    pub u8, gyr, _: 5, 4;
    pub u8, acc, _: 3, 2;
    pub u8, mag, _: 1, 0;
}

impl CalibStat {
    /// Mask of the sensors that are not fully calibrated, 0 when all are.
    pub fn uncalibrated(&self) -> u8 {
        if self.0 == 0xFF {
            return 0;
        }
        let mut mask = 0;
        if self.gyr() != 3 {
            mask |= GYRO_UNCALIBRATED;
        }
        if self.acc() != 3 {
            mask |= ACCEL_UNCALIBRATED;
        }
        if self.mag() != 3 {
            mask |= MAG_UNCALIBRATED;
        }
        mask
    }
}

/// Internal error reported in the SYS_ERR register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemError {
    /// System status reports an error without an error code.
    Unspecified,
    PeripheralInit,
    SystemInit,
    SelfTest,
    RegisterValueOutOfRange,
    RegisterAddressOutOfRange,
    RegisterWrite,
    LowPowerModeUnavailable,
    AccelPowerModeUnavailable,
    FusionConfig,
    SensorConfig,
    Unknown(u8),
}

impl SystemError {
    pub fn from_register(value: u8) -> Self {
        use SystemError::*;
        match value {
            0x00 => Unspecified,
            0x01 => PeripheralInit,
            0x02 => SystemInit,
            0x03 => SelfTest,
            0x04 => RegisterValueOutOfRange,
            0x05 => RegisterAddressOutOfRange,
            0x06 => RegisterWrite,
            0x07 => LowPowerModeUnavailable,
            0x08 => AccelPowerModeUnavailable,
            0x09 => FusionConfig,
            0x0A => SensorConfig,
            other => Unknown(other),
        }
    }

    pub fn register_value(&self) -> u8 {
        use SystemError::*;
        match self {
            Unspecified => 0x00,
            PeripheralInit => 0x01,
            SystemInit => 0x02,
            SelfTest => 0x03,
            RegisterValueOutOfRange => 0x04,
            RegisterAddressOutOfRange => 0x05,
            RegisterWrite => 0x06,
            LowPowerModeUnavailable => 0x07,
            AccelPowerModeUnavailable => 0x08,
            FusionConfig => 0x09,
            SensorConfig => 0x0A,
            Unknown(value) => *value,
        }
    }

    /// Setup result code, 3 to 13 for the documented errors.
    ///
    /// Codes 1 and 2 are taken by "not responding" and "bus error".
    pub fn code(&self) -> u8 {
        3u8.saturating_add(self.register_value())
    }
}

/// Heading, roll and pitch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct Euler<T> {
    pub heading: T,
    pub roll: T,
    pub pitch: T,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct Vector3<T> {
    pub x: T,
    pub y: T,
    pub z: T,
}

/// Sensor offsets and radii that restore a previous calibration.
///
/// Stored on the device and persisted as 22 bytes: 11 little endian words in
/// field order.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationOffsets {
    pub accel_x: i16,
    pub accel_y: i16,
    pub accel_z: i16,
    pub mag_x: i16,
    pub mag_y: i16,
    pub mag_z: i16,
    pub gyro_x: i16,
    pub gyro_y: i16,
    pub gyro_z: i16,
    pub accel_radius: i16,
    pub mag_radius: i16,
}

impl CalibrationOffsets {
    pub const LEN: usize = 22;

    pub fn from_words(words: [i16; 11]) -> Self {
        Self {
            accel_x: words[0],
            accel_y: words[1],
            accel_z: words[2],
            mag_x: words[3],
            mag_y: words[4],
            mag_z: words[5],
            gyro_x: words[6],
            gyro_y: words[7],
            gyro_z: words[8],
            accel_radius: words[9],
            mag_radius: words[10],
        }
    }

    pub fn to_words(&self) -> [i16; 11] {
        [
            self.accel_x,
            self.accel_y,
            self.accel_z,
            self.mag_x,
            self.mag_y,
            self.mag_z,
            self.gyro_x,
            self.gyro_y,
            self.gyro_z,
            self.accel_radius,
            self.mag_radius,
        ]
    }

    pub fn from_bytes(bytes: &[u8; Self::LEN]) -> Self {
        let mut words = [0i16; 11];
        for (word, pair) in words.iter_mut().zip(bytes.chunks_exact(2)) {
            *word = i16::from_le_bytes([pair[0], pair[1]]);
        }
        Self::from_words(words)
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut bytes = [0u8; Self::LEN];
        for (pair, word) in bytes.chunks_exact_mut(2).zip(self.to_words()) {
            pair.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }
}

pub struct Bno055<B>
where
    B: RegisterBus,
{
    bus: B,
    address: u8,
    mode: Option<OperationMode>,
}

impl<B> I2CSensor<B> for Bno055<B>
where
    B: RegisterBus,
{
    const DEFAULT_ADDRESS: u8 = ADDRESS;

    /// Creates a new sensor driver.
    fn new(bus: B, address: u8) -> Self {
        Self {
            bus,
            address,
            mode: None,
        }
    }

    /// Releases the underlying I2C bus and destroys the driver.
    fn release(self) -> B {
        self.bus
    }
}

impl<B> Bno055<B>
where
    B: RegisterBus,
{
    /// Resets and configures the device and starts NDOF fusion.
    pub fn setup<D: DelayMs<u16>>(&mut self, delay: &mut D) -> Result<(), SensorError<B::Error>> {
        info!("bno055: verifying connection...");
        if !self.is_connected() {
            // give the sensor time to come out of power-on
            delay.delay_ms(POWER_ON_GRACE_MS);
            if !self.is_connected() {
                warn!("bno055: no device at {:#04x}", self.address);
                return Err(SensorError::NotConnected);
            }
        }

        self.set_mode(OperationMode::Config, delay)?;

        info!("bno055: resetting...");
        self.bus
            .write_byte(self.address, BNO055_SYS_TRIGGER_REG, BNO055_SYS_TRIGGER_RESET)?;
        delay.delay_ms(RESET_SETTLE_MS);
        if !self.poll_connected(delay) {
            warn!("bno055: device did not come back after reset");
            return Err(SensorError::NotConnected);
        }
        delay.delay_ms(POST_RESET_MS);

        info!("bno055: configuring...");
        self.bus
            .write_byte(self.address, BNO055_PWR_MODE_REG, BNO055_POWER_MODE_NORMAL)?;
        delay.delay_ms(CONFIG_SETTLE_MS);
        self.bus
            .write_byte(self.address, BNO055_PAGE_ID_REG, BNO055_PAGE_ZERO)?;
        self.bus
            .write_byte(self.address, BNO055_SYS_TRIGGER_REG, BNO055_SYS_TRIGGER_EXT_CLOCK)?;
        delay.delay_ms(CONFIG_SETTLE_MS);
        self.bus
            .write_byte(self.address, BNO055_AXIS_MAP_CONFIG_REG, BNO055_AXIS_MAP)?;
        self.bus
            .write_byte(self.address, BNO055_AXIS_MAP_SIGN_REG, BNO055_AXIS_SIGN)?;
        self.bus
            .write_byte(self.address, BNO055_UNIT_SEL_REG, BNO055_UNITS)?;

        info!("bno055: starting fusion...");
        self.set_mode(OperationMode::Ndof, delay)?;

        let status = self.bus.read_byte(self.address, BNO055_SYS_STAT_REG);
        let error = self.bus.read_byte(self.address, BNO055_SYS_ERR_REG);
        if status == BNO055_SYS_STATUS_ERROR || error != 0 {
            let error = SystemError::from_register(error);
            warn!("bno055: system error {:?} (status {:#04x})", error, status);
            return Err(SensorError::System(error));
        }
        Ok(())
    }

    /// Reads the operating mode from the device and caches it.
    pub fn mode(&mut self) -> Result<OperationMode, SensorError<B::Error>> {
        let raw = self.bus.read_byte(self.address, BNO055_OPR_MODE_REG) & 0x0F;
        match OperationMode::try_from(raw) {
            Ok(mode) => {
                self.mode = Some(mode);
                Ok(mode)
            }
            Err(raw) => {
                self.mode = None;
                Err(SensorError::InvalidMode(raw))
            }
        }
    }

    /// The last mode written to or read from the device.
    pub fn cached_mode(&self) -> Option<OperationMode> {
        self.mode
    }

    /// Switches the operating mode. Does nothing when the device is already
    /// in `mode`, otherwise waits for the switch to complete.
    pub fn set_mode<D: DelayMs<u16>>(
        &mut self,
        mode: OperationMode,
        delay: &mut D,
    ) -> Result<(), SensorError<B::Error>> {
        if self.mode == Some(mode) {
            return Ok(());
        }
        self.bus
            .write_byte(self.address, BNO055_OPR_MODE_REG, mode as u8)?;
        self.mode = Some(mode);
        debug!("bno055: switched to {:?}", mode);
        delay.delay_ms(MODE_SWITCH_MS);
        Ok(())
    }

    /// Returns heading, roll and pitch in 1/900 rad.
    pub fn euler(&mut self) -> Result<Euler<i16>, SensorError<B::Error>> {
        let [heading, roll, pitch] = self.read_vector(BNO055_EULER_H_LSB_REG)?;
        Ok(Euler {
            heading,
            roll,
            pitch,
        })
    }

    /// Returns heading, roll and pitch in rad.
    pub fn euler_f32(&mut self) -> Result<Euler<f32>, SensorError<B::Error>> {
        let raw = self.euler()?;
        Ok(Euler {
            heading: raw.heading as f32 / EULER_LSB_PER_RAD,
            roll: raw.roll as f32 / EULER_LSB_PER_RAD,
            pitch: raw.pitch as f32 / EULER_LSB_PER_RAD,
        })
    }

    /// Returns the acceleration without gravity in mg.
    pub fn linear_acceleration(&mut self) -> Result<Vector3<i16>, SensorError<B::Error>> {
        let [x, y, z] = self.read_vector(BNO055_LINEAR_ACCEL_X_LSB_REG)?;
        Ok(Vector3 { x, y, z })
    }

    /// Returns the acceleration without gravity in g.
    pub fn linear_acceleration_f32(&mut self) -> Result<Vector3<f32>, SensorError<B::Error>> {
        let raw = self.linear_acceleration()?;
        Ok(Vector3 {
            x: raw.x as f32 / ACCEL_LSB_PER_G,
            y: raw.y as f32 / ACCEL_LSB_PER_G,
            z: raw.z as f32 / ACCEL_LSB_PER_G,
        })
    }

    /// Returns the raw calibration status register.
    pub fn calib_status(&mut self) -> CalibStat {
        CalibStat(self.bus.read_byte(self.address, BNO055_CALIB_STAT_REG))
    }

    /// Returns 0 when gyroscope, accelerometer and magnetometer are fully
    /// calibrated, otherwise a mask of [`GYRO_UNCALIBRATED`],
    /// [`ACCEL_UNCALIBRATED`] and [`MAG_UNCALIBRATED`].
    pub fn calib_stat(&mut self) -> u8 {
        self.calib_status().uncalibrated()
    }

    /// Reads the calibration offsets of a fully calibrated device.
    pub fn calib_data<D: DelayMs<u16>>(
        &mut self,
        delay: &mut D,
    ) -> Result<CalibrationOffsets, SensorError<B::Error>> {
        let uncalibrated = self.calib_stat();
        if uncalibrated != 0 {
            return Err(SensorError::NotCalibrated(uncalibrated));
        }
        self.in_config_mode(delay, |sensor| {
            let mut bytes = [0u8; CalibrationOffsets::LEN];
            sensor
                .bus
                .read_bytes(sensor.address, BNO055_ACCEL_OFFSET_X_LSB_REG, &mut bytes)?;
            Ok(CalibrationOffsets::from_bytes(&bytes))
        })
    }

    /// Writes calibration offsets, e.g. a profile saved after an earlier
    /// calibration. The device does not need to be calibrated.
    ///
    /// Every offset register is written even if one write fails. The first
    /// failure is returned.
    pub fn set_calib_data<D: DelayMs<u16>>(
        &mut self,
        offsets: &CalibrationOffsets,
        delay: &mut D,
    ) -> Result<(), SensorError<B::Error>> {
        let bytes = offsets.to_bytes();
        self.in_config_mode(delay, |sensor| {
            let mut first_error = None;
            for (register, byte) in (BNO055_ACCEL_OFFSET_X_LSB_REG..).zip(bytes) {
                if let Err(error) = sensor.bus.write_byte(sensor.address, register, byte) {
                    warn!("bno055: writing offset register {:#04x} failed", register);
                    first_error.get_or_insert(error);
                }
            }
            match first_error {
                Some(error) => Err(SensorError::Bus(error)),
                None => Ok(()),
            }
        })
    }

    /// Runs `transfer` in configuration mode and switches back to the
    /// previous mode afterwards, whether or not the transfer succeeded.
    fn in_config_mode<T, D: DelayMs<u16>>(
        &mut self,
        delay: &mut D,
        transfer: impl FnOnce(&mut Self) -> Result<T, SensorError<B::Error>>,
    ) -> Result<T, SensorError<B::Error>> {
        let previous = self.mode()?;
        self.set_mode(OperationMode::Config, delay)?;

        let result = transfer(self);
        let restored = self.set_mode(previous, delay);
        if let Err(error) = &restored {
            warn!("bno055: failed to restore {:?}: {}", previous, error);
        }

        let value = result?;
        restored?;
        Ok(value)
    }

    fn read_vector(&mut self, start: u8) -> Result<[i16; 3], SensorError<B::Error>> {
        let mut data = [0u8; 6];
        self.bus.read_bytes(self.address, start, &mut data)?;
        Ok([
            i16::from_le_bytes([data[0], data[1]]),
            i16::from_le_bytes([data[2], data[3]]),
            i16::from_le_bytes([data[4], data[5]]),
        ])
    }

    fn is_connected(&mut self) -> bool {
        self.bus.read_byte(self.address, BNO055_CHIP_ID_REG) == BNO055_CHIP_ID
    }

    fn poll_connected<D: DelayMs<u16>>(&mut self, delay: &mut D) -> bool {
        for _ in 0..POLL_ATTEMPTS {
            if self.is_connected() {
                return true;
            }
            delay.delay_ms(POLL_INTERVAL_MS);
        }
        self.is_connected()
    }
}

/// Describes errors returned by the orientation sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError<E: Debug> {
    /// The chip id register did not read 0xA0, even after a power-on grace period.
    NotConnected,
    /// An I2C transaction did not complete.
    Bus(E),
    /// The device reports an internal error.
    System(SystemError),
    /// The mode register holds a value outside of the known modes.
    InvalidMode(u8),
    /// Calibration offsets are only meaningful once every sensor is
    /// calibrated. Holds the [`Bno055::calib_stat`] mask.
    NotCalibrated(u8),
}

impl<E: Debug> SensorError<E> {
    /// Numeric result code of a failed setup: 1 not connected, 2 bus error,
    /// 3 to 13 for internal errors. Other errors map to 0.
    pub fn code(&self) -> u8 {
        match self {
            SensorError::NotConnected => 1,
            SensorError::Bus(_) => 2,
            SensorError::System(error) => error.code(),
            _ => 0,
        }
    }
}

impl<E: Debug> Display for SensorError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use SensorError::*;
        match self {
            NotConnected => f.write_str("BNO055 is not connected or not responding"),
            Bus(error) => write!(f, "Bus error: {:?}", error),
            System(error) => write!(f, "Internal error {:?} (code {})", error, error.code()),
            InvalidMode(raw) => write!(f, "Invalid operating mode {:#04x}", raw),
            NotCalibrated(mask) => write!(f, "Sensors not calibrated (mask {:#05b})", mask),
        }
    }
}

impl<E: Debug> Error for SensorError<E> {}

impl<E: Debug> From<E> for SensorError<E> {
    fn from(error: E) -> Self {
        SensorError::Bus(error)
    }
}
