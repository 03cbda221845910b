use std::{
    error::Error,
    fmt::{Debug, Display, Formatter},
};

use bitfield::bitfield;
use embedded_hal::blocking::delay::DelayMs;
use log::*;
use serde::Serialize;

use super::i2c_sensor::I2CSensor;
use crate::bus::RegisterBus;

pub const ADDRESS: u8 = 0x76;
pub const ADDRESS_SECONDARY: u8 = 0x77;

// BME280 Register address
// Temperature and pressure trimming parameters, 0x88 up to 0xA1 (dig_H1).
const BME280_CALIB_TP_REG: u8 = 0x88;
// Chip identification number, always reads 0x60.
const BME280_CHIP_ID_REG: u8 = 0xD0;
// Writing 0xB6 performs a complete power-on reset.
const BME280_RESET_REG: u8 = 0xE0;
// Humidity trimming parameters, 0xE1 up to 0xE7.
const BME280_CALIB_H_REG: u8 = 0xE1;
// Humidity oversampling. Only takes effect after a write to CTRL_MEAS.
const BME280_CTRL_HUM_REG: u8 = 0xF2;
const BME280_STATUS_REG: u8 = 0xF3;
// Temperature and pressure oversampling, operating mode.
const BME280_CTRL_MEAS_REG: u8 = 0xF4;
// Standby time and IIR filter.
const BME280_CONFIG_REG: u8 = 0xF5;
const BME280_DATA_PRESS_REG: u8 = 0xF7;
const BME280_DATA_TEMP_REG: u8 = 0xFA;

const BME280_CHIP_ID: u8 = 0x60;
const BME280_RESET_COMMAND: u8 = 0xB6;

// Raw value reported by a channel whose oversampling is set to skipped.
const SKIPPED_20BIT: i32 = 0x80000;
const SKIPPED_16BIT: i32 = 0x8000;

const POWER_ON_GRACE_MS: u16 = 1000;
const POLL_ATTEMPTS: u8 = 100;
const POLL_INTERVAL_MS: u16 = 10;

/// Standard sea level pressure in Pa.
pub const SEA_LEVEL_PA: f32 = 101_325.0;

/// Operating mode of the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    Sleep = 0b00,
    Forced = 0b01,
    Normal = 0b11,
}

/// Oversampling of one measurement channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Oversampling {
    /// Channel disabled, reads back the "skipped" sentinel.
    Skipped = 0b000,
    X1 = 0b001,
    X2 = 0b010,
    X4 = 0b011,
    X8 = 0b100,
    X16 = 0b101,
}

/// IIR filter coefficient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Filter {
    Off = 0b000,
    X2 = 0b001,
    X4 = 0b010,
    X8 = 0b011,
    X16 = 0b100,
}

/// Inactive time between two measurements in normal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Standby {
    Ms0_5 = 0b000,
    Ms62_5 = 0b001,
    Ms125 = 0b010,
    Ms250 = 0b011,
    Ms500 = 0b100,
    Ms1000 = 0b101,
    Ms10 = 0b110,
    Ms20 = 0b111,
}

/// Measurement configuration written by [`Bme280::set_config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub mode: Mode,
    pub temperature: Oversampling,
    pub pressure: Oversampling,
    pub humidity: Oversampling,
    pub filter: Filter,
    pub standby: Standby,
}

impl Default for Settings {
    /// Fast, heavily filtered pressure for altitude hold. Humidity is off.
    fn default() -> Self {
        Self {
            mode: Mode::Normal,
            temperature: Oversampling::X1,
            pressure: Oversampling::X4,
            humidity: Oversampling::Skipped,
            filter: Filter::X16,
            standby: Standby::Ms0_5,
        }
    }
}

bitfield! {
    /// Status of the sensor.
    pub struct Status(u8);
    impl Debug;
    pub bool, measuring, _: 3;
    pub bool, im_update, _: 0;
}

bitfield! {
    struct CtrlMeas(u8);
    impl Debug;
    u8, osrs_t, set_osrs_t: 7, 5;
    u8, osrs_p, set_osrs_p: 4, 2;
    u8, mode, set_mode: 1, 0;
}

bitfield! {
    struct Config(u8);
    impl Debug;
    u8, t_sb, set_t_sb: 7, 5;
    u8, filter, set_filter: 4, 2;
    bool, spi3w_en, set_spi3w_en: 0;
}

/// Factory trimming parameters of one device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Calibration {
    pub dig_t1: u16,
    pub dig_t2: i16,
    pub dig_t3: i16,

    pub dig_p1: u16,
    pub dig_p2: i16,
    pub dig_p3: i16,
    pub dig_p4: i16,
    pub dig_p5: i16,
    pub dig_p6: i16,
    pub dig_p7: i16,
    pub dig_p8: i16,
    pub dig_p9: i16,

    pub dig_h1: u8,
    pub dig_h2: i16,
    pub dig_h3: u8,
    pub dig_h4: i16,
    pub dig_h5: i16,
    pub dig_h6: i8,
}

impl Calibration {
    /// Decodes the two trimming blocks, `0x88..=0xA1` and `0xE1..=0xE7`.
    pub fn from_registers(tp: &[u8; 26], h: &[u8; 7]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([tp[i], tp[i + 1]]);
        let i16_at = |i: usize| i16::from_le_bytes([tp[i], tp[i + 1]]);

        Self {
            dig_t1: u16_at(0),
            dig_t2: i16_at(2),
            dig_t3: i16_at(4),

            dig_p1: u16_at(6),
            dig_p2: i16_at(8),
            dig_p3: i16_at(10),
            dig_p4: i16_at(12),
            dig_p5: i16_at(14),
            dig_p6: i16_at(16),
            dig_p7: i16_at(18),
            dig_p8: i16_at(20),
            dig_p9: i16_at(22),

            dig_h1: tp[25],
            dig_h2: i16::from_le_bytes([h[0], h[1]]),
            dig_h3: h[2],
            // 12 bit signed values sharing the nibbles of 0xE5
            dig_h4: ((h[3] as i8 as i16) << 4) | (h[4] & 0x0F) as i16,
            dig_h5: ((h[5] as i8 as i16) << 4) | (h[4] >> 4) as i16,
            dig_h6: h[6] as i8,
        }
    }

    /// Returns the temperature in 0.01 °C and the fine temperature needed by
    /// the pressure and humidity compensation.
    pub fn compensate_temperature(&self, adc_t: i32) -> (i32, i32) {
        // 64 bit: a full scale sample overflows the 32 bit products
        let adc_t = adc_t as i64;
        let t1 = self.dig_t1 as i64;
        let var1 = (((adc_t >> 3) - (t1 << 1)) * self.dig_t2 as i64) >> 11;
        let var2 = (((((adc_t >> 4) - t1) * ((adc_t >> 4) - t1)) >> 12) * self.dig_t3 as i64) >> 14;
        let t_fine = var1 + var2;
        (((t_fine * 5 + 128) >> 8) as i32, t_fine as i32)
    }

    /// Returns the pressure in Pa as unsigned Q24.8.
    pub fn compensate_pressure(&self, adc_p: i32, t_fine: i32) -> u32 {
        let mut var1 = t_fine as i64 - 128_000;
        let mut var2 = var1 * var1 * self.dig_p6 as i64;
        var2 += (var1 * self.dig_p5 as i64) << 17;
        var2 += (self.dig_p4 as i64) << 35;
        var1 = ((var1 * var1 * self.dig_p3 as i64) >> 8) + ((var1 * self.dig_p2 as i64) << 12);
        var1 = (((1i64 << 47) + var1) * self.dig_p1 as i64) >> 33;
        if var1 == 0 {
            return 0;
        }

        let mut p = 1_048_576 - adc_p as i64;
        p = (((p << 31) - var2) * 3125) / var1;
        var1 = (self.dig_p9 as i64 * (p >> 13) * (p >> 13)) >> 25;
        var2 = (self.dig_p8 as i64 * p) >> 19;
        (((p + var1 + var2) >> 8) + ((self.dig_p7 as i64) << 4)) as u32
    }

    /// Returns the relative humidity in % as unsigned Q22.10.
    pub fn compensate_humidity(&self, adc_h: i32, t_fine: i32) -> u32 {
        let v = t_fine as i64 - 76_800;
        let scaled = (((adc_h as i64) << 14) - ((self.dig_h4 as i64) << 20) - (self.dig_h5 as i64 * v)
            + 16_384)
            >> 15;
        let gain = (((((v * self.dig_h6 as i64) >> 10) * (((v * self.dig_h3 as i64) >> 11) + 32_768))
            >> 10)
            + 2_097_152)
            * self.dig_h2 as i64
            + 8192;
        let mut h = scaled * (gain >> 14);
        h -= (((h >> 15) * (h >> 15)) >> 7) * self.dig_h1 as i64 >> 4;
        (h.clamp(0, 419_430_400) >> 12) as u32
    }
}

/// Altitude in metres for a pressure in Pa, relative to [`SEA_LEVEL_PA`].
pub fn barometric_altitude(pressure_pa: f32) -> f32 {
    44_330.0 * (1.0 - (pressure_pa / SEA_LEVEL_PA).powf(0.1903))
}

/// Measurement channel of the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Temperature,
    Pressure,
    Humidity,
}

pub struct Bme280<B>
where
    B: RegisterBus,
{
    bus: B,
    address: u8,
    calibration: Calibration,
    t_fine: i32,
}

impl<B> I2CSensor<B> for Bme280<B>
where
    B: RegisterBus,
{
    const DEFAULT_ADDRESS: u8 = ADDRESS;

    /// Creates a new sensor driver.
    fn new(bus: B, address: u8) -> Self {
        Self {
            bus,
            address,
            calibration: Calibration::default(),
            t_fine: 0,
        }
    }

    /// Releases the underlying I2C bus and destroys the driver.
    fn release(self) -> B {
        self.bus
    }
}

impl<B> Bme280<B>
where
    B: RegisterBus,
{
    /// Resets the device, loads its calibration and starts continuous
    /// measurements with the default [`Settings`].
    pub fn setup<D: DelayMs<u16>>(&mut self, delay: &mut D) -> Result<(), SensorError<B::Error>> {
        self.setup_with(&Settings::default(), delay)
    }

    /// Same as [`Bme280::setup`] with caller supplied settings.
    pub fn setup_with<D: DelayMs<u16>>(
        &mut self,
        settings: &Settings,
        delay: &mut D,
    ) -> Result<(), SensorError<B::Error>> {
        info!("bme280: verifying connection...");
        if !self.is_connected() {
            // give the sensor time to come out of power-on
            delay.delay_ms(POWER_ON_GRACE_MS);
            if !self.is_connected() {
                warn!("bme280: no device at {:#04x}", self.address);
                return Err(SensorError::NotConnected);
            }
        }

        info!("bme280: resetting...");
        self.bus
            .write_byte(self.address, BME280_RESET_REG, BME280_RESET_COMMAND)?;
        delay.delay_ms(POLL_INTERVAL_MS);
        if !self.poll(delay, |sensor| sensor.is_connected()) {
            warn!("bme280: device did not come back after reset");
            return Err(SensorError::NotConnected);
        }

        // trimming registers are undefined while the NVM copy is running
        if !self.poll(delay, |sensor| !sensor.status().im_update()) {
            warn!("bme280: NVM copy did not finish");
            return Err(SensorError::NotConnected);
        }

        info!("bme280: reading calibration...");
        self.read_calibration()?;
        debug!("bme280: calibration: {:?}", self.calibration);

        info!("bme280: configuring...");
        self.set_config(settings)?;
        Ok(())
    }

    /// Reads the factory calibration into the driver.
    pub fn read_calibration(&mut self) -> Result<(), SensorError<B::Error>> {
        let mut tp = [0u8; 26];
        self.bus
            .read_bytes(self.address, BME280_CALIB_TP_REG, &mut tp)?;
        let mut h = [0u8; 7];
        self.bus
            .read_bytes(self.address, BME280_CALIB_H_REG, &mut h)?;
        self.calibration = Calibration::from_registers(&tp, &h);
        Ok(())
    }

    /// Writes oversampling, operating mode, filter and standby time.
    pub fn set_config(&mut self, settings: &Settings) -> Result<(), SensorError<B::Error>> {
        let mut ctrl_meas = CtrlMeas(0);
        ctrl_meas.set_osrs_t(settings.temperature as u8);
        ctrl_meas.set_osrs_p(settings.pressure as u8);
        ctrl_meas.set_mode(settings.mode as u8);

        let mut config = Config(0);
        config.set_t_sb(settings.standby as u8);
        config.set_filter(settings.filter as u8);
        config.set_spi3w_en(false);

        self.bus
            .write_byte(self.address, BME280_CTRL_HUM_REG, settings.humidity as u8)?;
        self.bus
            .write_byte(self.address, BME280_CTRL_MEAS_REG, ctrl_meas.0)?;
        self.bus
            .write_byte(self.address, BME280_CONFIG_REG, config.0)?;
        Ok(())
    }

    /// Returns the current status of the sensor.
    pub fn status(&mut self) -> Status {
        Status(self.bus.read_byte(self.address, BME280_STATUS_REG))
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    /// Fine temperature of the latest temperature compensation.
    pub fn fine_temperature(&self) -> i32 {
        self.t_fine
    }

    /// Returns the temperature in 0.01 °C, 2251 is 22.51 °C.
    pub fn temperature(&mut self) -> Result<i32, SensorError<B::Error>> {
        let mut data = [0u8; 3];
        self.bus
            .read_bytes(self.address, BME280_DATA_TEMP_REG, &mut data)?;
        self.compensate_temperature(&data)
    }

    /// Returns the temperature in °C.
    pub fn temperature_f32(&mut self) -> Result<f32, SensorError<B::Error>> {
        self.temperature().map(|t| t as f32 / 100.0)
    }

    /// Returns the pressure in Pa as Q24.8, 24674867 is 96386.2 Pa.
    ///
    /// Temperature is compensated from the same burst read first, so the
    /// fine temperature is always current.
    pub fn pressure(&mut self) -> Result<u32, SensorError<B::Error>> {
        let mut data = [0u8; 6];
        self.bus
            .read_bytes(self.address, BME280_DATA_PRESS_REG, &mut data)?;
        self.compensate_temperature(&data[3..6])?;

        let adc_p = raw20(&data[0..3]);
        if adc_p == SKIPPED_20BIT {
            return Err(SensorError::MeasurementDisabled(Channel::Pressure));
        }
        Ok(self.calibration.compensate_pressure(adc_p, self.t_fine))
    }

    /// Returns the pressure in Pa.
    pub fn pressure_f32(&mut self) -> Result<f32, SensorError<B::Error>> {
        self.pressure().map(|p| p as f32 / 256.0)
    }

    /// Returns the relative humidity in % as Q22.10, 47445 is 46.333 %RH.
    pub fn humidity(&mut self) -> Result<u32, SensorError<B::Error>> {
        let mut data = [0u8; 5];
        self.bus
            .read_bytes(self.address, BME280_DATA_TEMP_REG, &mut data)?;
        self.compensate_temperature(&data[0..3])?;

        let adc_h = i32::from(u16::from_be_bytes([data[3], data[4]]));
        if adc_h == SKIPPED_16BIT {
            return Err(SensorError::MeasurementDisabled(Channel::Humidity));
        }
        Ok(self.calibration.compensate_humidity(adc_h, self.t_fine))
    }

    /// Returns the relative humidity in %.
    pub fn humidity_f32(&mut self) -> Result<f32, SensorError<B::Error>> {
        self.humidity().map(|h| h as f32 / 1024.0)
    }

    /// Returns the altitude above sea level in cm.
    pub fn altitude(&mut self) -> Result<i32, SensorError<B::Error>> {
        self.altitude_f32().map(|m| (m * 100.0) as i32)
    }

    /// Returns the altitude above sea level in m.
    pub fn altitude_f32(&mut self) -> Result<f32, SensorError<B::Error>> {
        self.pressure_f32().map(barometric_altitude)
    }

    fn is_connected(&mut self) -> bool {
        self.bus.read_byte(self.address, BME280_CHIP_ID_REG) == BME280_CHIP_ID
    }

    fn compensate_temperature(&mut self, data: &[u8]) -> Result<i32, SensorError<B::Error>> {
        let adc_t = raw20(data);
        if adc_t == SKIPPED_20BIT {
            return Err(SensorError::MeasurementDisabled(Channel::Temperature));
        }
        let (temperature, t_fine) = self.calibration.compensate_temperature(adc_t);
        self.t_fine = t_fine;
        Ok(temperature)
    }

    fn poll<D: DelayMs<u16>>(&mut self, delay: &mut D, mut ready: impl FnMut(&mut Self) -> bool) -> bool {
        for _ in 0..POLL_ATTEMPTS {
            if ready(self) {
                return true;
            }
            delay.delay_ms(POLL_INTERVAL_MS);
        }
        ready(self)
    }
}

/// Combines msb, lsb and xlsb registers into a 20 bit sample
fn raw20(data: &[u8]) -> i32 {
    (data[0] as i32) << 12 | (data[1] as i32) << 4 | (data[2] as i32) >> 4
}

/// Describes errors returned by the environmental sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError<E: Debug> {
    /// The chip id register did not read 0x60, even after a power-on grace period.
    NotConnected,
    /// An I2C transaction did not complete.
    Bus(E),
    /// The channel's oversampling is set to skipped.
    MeasurementDisabled(Channel),
}

impl<E: Debug> Display for SensorError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use SensorError::*;
        match self {
            NotConnected => f.write_str("BME280 is not connected or not responding"),
            Bus(error) => write!(f, "Bus error: {:?}", error),
            MeasurementDisabled(channel) => write!(f, "{:?} measurement is disabled", channel),
        }
    }
}

impl<E: Debug> Error for SensorError<E> {}

impl<E: Debug> From<E> for SensorError<E> {
    fn from(error: E) -> Self {
        SensorError::Bus(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDelay, MockI2c, MockI2cError};

    // Trimming values of the datasheet compensation example, dig_H1 = 75.
    const TP_CALIB: [u8; 26] = [
        0x70, 0x6B, 0x43, 0x67, 0x18, 0xFC, 0x7D, 0x8E, 0x43, 0xD6, 0xD0, 0x0B, 0x27, 0x0B, 0x8C,
        0x00, 0xF9, 0xFF, 0x8C, 0x3C, 0xF8, 0xC6, 0x70, 0x17, 0x00, 0x4B,
    ];
    // dig_H2 = 362, dig_H3 = 0, dig_H4 = 324, dig_H5 = 50, dig_H6 = 30
    const H_CALIB: [u8; 7] = [0x6A, 0x01, 0x00, 0x14, 0x24, 0x03, 0x1E];

    // adc_P = 415148, adc_T = 519888, adc_H = 30000
    const DATA: [u8; 8] = [0x65, 0x5A, 0xC0, 0x7E, 0xED, 0x00, 0x75, 0x30];

    fn calibration() -> Calibration {
        Calibration::from_registers(&TP_CALIB, &H_CALIB)
    }

    fn device() -> MockI2c {
        let mut i2c = MockI2c::new();
        i2c.set_register(ADDRESS, BME280_CHIP_ID_REG, BME280_CHIP_ID);
        i2c.set_registers(ADDRESS, BME280_CALIB_TP_REG, &TP_CALIB);
        i2c.set_registers(ADDRESS, BME280_CALIB_H_REG, &H_CALIB);
        i2c.set_registers(ADDRESS, BME280_DATA_PRESS_REG, &DATA);
        i2c
    }

    fn ready_sensor() -> Bme280<MockI2c> {
        let mut sensor = Bme280::new(device(), ADDRESS);
        sensor.setup(&mut MockDelay::new()).unwrap();
        sensor
    }

    #[test]
    fn decodes_trimming_registers() {
        let c = calibration();
        assert_eq!((c.dig_t1, c.dig_t2, c.dig_t3), (27504, 26435, -1000));
        assert_eq!(
            [c.dig_p1 as i32, c.dig_p2 as i32, c.dig_p3 as i32, c.dig_p4 as i32, c.dig_p5 as i32],
            [36477, -10685, 3024, 2855, 140]
        );
        assert_eq!(
            [c.dig_p6, c.dig_p7, c.dig_p8, c.dig_p9],
            [-7, 15500, -14600, 6000]
        );
        assert_eq!(c.dig_h1, 75);
        assert_eq!(c.dig_h2, 362);
        assert_eq!(c.dig_h3, 0);
        assert_eq!(c.dig_h4, 324);
        assert_eq!(c.dig_h5, 50);
        assert_eq!(c.dig_h6, 30);
    }

    #[test]
    fn sign_extends_packed_humidity_trimming() {
        let h = [0x00, 0x00, 0x00, 0xF0, 0xA8, 0xFF, 0xE2];
        let c = Calibration::from_registers(&TP_CALIB, &h);
        assert_eq!(c.dig_h4, -248);
        assert_eq!(c.dig_h5, -6);
        assert_eq!(c.dig_h6, -30);
    }

    #[test]
    fn compensates_datasheet_example() {
        let c = calibration();
        let (temperature, t_fine) = c.compensate_temperature(519_888);
        assert_eq!(temperature, 2508);
        assert_eq!(t_fine, 128_422);
        assert_eq!(c.compensate_pressure(415_148, t_fine), 25_767_233);
        assert_eq!(c.compensate_humidity(30_000, t_fine), 52_306);
        assert_eq!(c.compensate_humidity(27_000, t_fine), 35_159);
    }

    #[test]
    fn compensation_is_deterministic() {
        let c = calibration();
        let first = (
            c.compensate_temperature(500_000),
            c.compensate_pressure(400_000, 120_000),
            c.compensate_humidity(25_000, 120_000),
        );
        let second = (
            c.compensate_temperature(500_000),
            c.compensate_pressure(400_000, 120_000),
            c.compensate_humidity(25_000, 120_000),
        );
        assert_eq!(first, second);
    }

    #[test]
    fn full_scale_temperature_does_not_overflow() {
        let c = Calibration {
            dig_t1: 27504,
            dig_t2: 32000,
            dig_t3: -1000,
            ..Default::default()
        };
        assert_eq!(c.compensate_temperature(0xFFFF0), (22_791, 1_166_915));

        let c = Calibration {
            dig_t1: 1,
            dig_t3: i16::MAX,
            ..Default::default()
        };
        assert_eq!(c.compensate_temperature(0xFFFFF), (40_956, 2_096_960));

        // trimming not loaded yet
        assert_eq!(Calibration::default().compensate_temperature(0xFFFF0), (0, 0));
    }

    #[test]
    fn pressure_with_zero_divisor_reads_zero() {
        let c = Calibration::default();
        assert_eq!(c.compensate_pressure(415_148, 128_422), 0);
    }

    #[test]
    fn humidity_is_clamped_to_full_scale() {
        let c = calibration();
        assert_eq!(c.compensate_humidity(65_535, 128_422), 419_430_400 >> 12);
        assert_eq!(c.compensate_humidity(0, 128_422), 0);
    }

    #[test]
    fn setup_resets_and_configures() {
        let sensor = ready_sensor();
        assert_eq!(*sensor.calibration(), calibration());

        let i2c = sensor.release();
        assert_eq!(i2c.writes_to(ADDRESS, BME280_RESET_REG), vec![0xB6]);
        assert_eq!(i2c.writes_to(ADDRESS, BME280_CTRL_HUM_REG), vec![0x00]);
        // osrs_t x1, osrs_p x4, normal mode
        assert_eq!(i2c.writes_to(ADDRESS, BME280_CTRL_MEAS_REG), vec![0x2F]);
        // standby 0.5 ms, filter x16
        assert_eq!(i2c.writes_to(ADDRESS, BME280_CONFIG_REG), vec![0x10]);

        let order: Vec<u8> = i2c.writes().iter().map(|w| w.register).collect();
        assert_eq!(
            order,
            vec![
                BME280_RESET_REG,
                BME280_CTRL_HUM_REG,
                BME280_CTRL_MEAS_REG,
                BME280_CONFIG_REG
            ]
        );
    }

    #[test]
    fn setup_gives_a_slow_sensor_one_more_chance() {
        let mut i2c = device();
        i2c.queue_reads(ADDRESS, BME280_CHIP_ID_REG, &[0x00]);
        let mut delay = MockDelay::new();

        let mut sensor = Bme280::new(i2c, ADDRESS);
        assert_eq!(sensor.setup(&mut delay), Ok(()));
        assert_eq!(delay.count_ms(1000), 1);
    }

    #[test]
    fn setup_rejects_foreign_chip() {
        let mut i2c = device();
        // BMP280
        i2c.set_register(ADDRESS, BME280_CHIP_ID_REG, 0x58);
        let mut delay = MockDelay::new();

        let mut sensor = Bme280::new(i2c, ADDRESS);
        assert_eq!(sensor.setup(&mut delay), Err(SensorError::NotConnected));
        assert_eq!(delay.count_ms(1000), 1);
        assert!(sensor.release().writes().is_empty());
    }

    #[test]
    fn setup_reports_missing_device() {
        let mut sensor = Bme280::new(MockI2c::new(), ADDRESS);
        assert_eq!(
            sensor.setup(&mut MockDelay::new()),
            Err(SensorError::NotConnected)
        );
    }

    #[test]
    fn setup_reports_bus_error_during_configuration() {
        let mut i2c = device();
        i2c.fail_write(ADDRESS, BME280_CONFIG_REG);

        let mut sensor = Bme280::new(i2c, ADDRESS);
        assert_eq!(
            sensor.setup(&mut MockDelay::new()),
            Err(SensorError::Bus(MockI2cError::Nack))
        );
    }

    #[test]
    fn setup_waits_for_nvm_copy() {
        let mut i2c = device();
        i2c.queue_reads(ADDRESS, BME280_STATUS_REG, &[0x01, 0x09, 0x01]);
        let mut delay = MockDelay::new();

        let mut sensor = Bme280::new(i2c, ADDRESS);
        assert_eq!(sensor.setup(&mut delay), Ok(()));
        // one after the reset command, three while im_update is set
        assert_eq!(delay.count_ms(10), 4);
    }

    #[test]
    fn setup_gives_up_when_nvm_copy_never_finishes() {
        let mut i2c = device();
        i2c.set_register(ADDRESS, BME280_STATUS_REG, 0x01);

        let mut sensor = Bme280::new(i2c, ADDRESS);
        assert_eq!(
            sensor.setup(&mut MockDelay::new()),
            Err(SensorError::NotConnected)
        );
    }

    #[test]
    fn reads_temperature() {
        let mut sensor = ready_sensor();
        assert_eq!(sensor.temperature(), Ok(2508));
        assert_eq!(sensor.fine_temperature(), 128_422);
        assert!((sensor.temperature_f32().unwrap() - 25.08).abs() < 1e-4);
    }

    #[test]
    fn pressure_recomputes_temperature_from_same_burst() {
        let mut sensor = ready_sensor();
        // no temperature read yet
        assert_eq!(sensor.fine_temperature(), 0);
        assert_eq!(sensor.pressure(), Ok(25_767_233));
        assert_eq!(sensor.fine_temperature(), 128_422);

        // a colder sample changes the fine temperature used for pressure
        let mut i2c = sensor.release();
        i2c.set_registers(ADDRESS, BME280_DATA_TEMP_REG, &[0x70, 0x00, 0x00]);
        let mut sensor = Bme280::new(i2c, ADDRESS);
        sensor.read_calibration().unwrap();
        let pressure = sensor.pressure().unwrap();

        let c = calibration();
        let (_, t_fine) = c.compensate_temperature(0x70000);
        assert_eq!(sensor.fine_temperature(), t_fine);
        assert_eq!(pressure, c.compensate_pressure(415_148, t_fine));
    }

    #[test]
    fn pressure_in_pascal() {
        let mut sensor = ready_sensor();
        let pressure = sensor.pressure_f32().unwrap();
        assert!((pressure - 100_653.25).abs() < 0.01);
    }

    #[test]
    fn humidity_needs_humidity_oversampling() {
        let mut i2c = device();
        i2c.set_registers(ADDRESS, 0xFD, &[0x80, 0x00]);
        let mut sensor = Bme280::new(i2c, ADDRESS);
        sensor.setup(&mut MockDelay::new()).unwrap();

        assert_eq!(
            sensor.humidity(),
            Err(SensorError::MeasurementDisabled(Channel::Humidity))
        );
    }

    #[test]
    fn reads_humidity() {
        let settings = Settings {
            humidity: Oversampling::X1,
            ..Default::default()
        };
        let mut sensor = Bme280::new(device(), ADDRESS);
        sensor.setup_with(&settings, &mut MockDelay::new()).unwrap();

        assert_eq!(sensor.humidity(), Ok(52_306));
        assert_eq!(sensor.fine_temperature(), 128_422);
        assert!((sensor.humidity_f32().unwrap() - 51.080_078).abs() < 1e-4);

        let i2c = sensor.release();
        assert_eq!(i2c.writes_to(ADDRESS, BME280_CTRL_HUM_REG), vec![0x01]);
    }

    #[test]
    fn disabled_channels_are_reported() {
        let mut i2c = device();
        i2c.set_registers(ADDRESS, BME280_DATA_PRESS_REG, &[0x80, 0x00, 0x00]);
        let mut sensor = Bme280::new(i2c, ADDRESS);
        sensor.setup(&mut MockDelay::new()).unwrap();
        assert_eq!(
            sensor.pressure(),
            Err(SensorError::MeasurementDisabled(Channel::Pressure))
        );

        let mut i2c = sensor.release();
        i2c.set_registers(ADDRESS, BME280_DATA_TEMP_REG, &[0x80, 0x00, 0x00]);
        let mut sensor = Bme280::new(i2c, ADDRESS);
        assert_eq!(
            sensor.temperature(),
            Err(SensorError::MeasurementDisabled(Channel::Temperature))
        );
        assert_eq!(
            sensor.pressure(),
            Err(SensorError::MeasurementDisabled(Channel::Temperature))
        );
    }

    #[test]
    fn measurement_bus_failure_is_not_retried() {
        let mut sensor = ready_sensor();
        let mut i2c = sensor.release();
        i2c.fail_reads(ADDRESS, true);
        sensor = Bme280::new(i2c, ADDRESS);

        assert_eq!(
            sensor.temperature(),
            Err(SensorError::Bus(MockI2cError::Nack))
        );
    }

    #[test]
    fn altitude_variants_agree() {
        let mut sensor = ready_sensor();
        let metres = sensor.altitude_f32().unwrap();
        let centimetres = sensor.altitude().unwrap();

        assert!((metres - 56.08).abs() < 0.05);
        assert_eq!(centimetres, (metres * 100.0) as i32);
    }

    #[test]
    fn altitude_below_sea_level_is_negative() {
        assert!(barometric_altitude(102_000.0) < 0.0);
        assert_eq!(barometric_altitude(SEA_LEVEL_PA), 0.0);
    }
}
