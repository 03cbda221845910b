use core::ffi::c_void;
use std::{sync::Mutex, time::Duration};

use async_broadcast::{broadcast, Receiver, Sender, TryRecvError};
use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use esp_idf_hal::{
    cpu::core,
    delay::{Ets, FreeRtos},
    gpio::PinDriver,
    i2c::*,
    peripherals::Peripherals,
    prelude::*,
};
use esp_idf_sys::{self as _, esp, esp_app_desc, EspError}; // If using the `binstart` feature of `esp-idf-sys`, always keep this module imported
use log::*;
use shared_bus::{BusManager, I2cProxy};

use esp32_flight_sensors::{
    bme280::{self, Bme280},
    bno055::{Bno055, Euler, Vector3},
    free_bus,
    ultrasonic::{EchoHandler, EchoLines, MicrosClock, Ultrasonic},
    BusConfig, I2CSensor,
};

use anyhow::{anyhow, Result};

#[toml_cfg::toml_config]
pub struct Config {
    #[default(400_000)]
    i2c_baudrate: u32,
    #[default(1000)]
    i2c_timeout_ms: u32,
    #[default(0x76)]
    bme280_address: u8,
    #[default(0x28)]
    bno055_address: u8,
    #[default(25)]
    echo_gpio: i32,
    #[default(26)]
    trigger_gpio: i32,
    #[default(1000)]
    environment_interval_ms: u64,
    #[default(100)]
    orientation_interval_ms: u64,
    #[default(50)]
    range_interval_ms: u64,
}

esp_app_desc!();

type SharedI2c = I2cProxy<'static, Mutex<I2cDriver<'static>>>;
type RangeFinder = Ultrasonic<BoardEchoLines, BoardClock>;

type EnvironmentReading = (f32, f32, f32);
type OrientationReading = (Euler<f32>, Vector3<f32>);
type RangeReading = u16;

fn main() -> Result<()> {
    // It is necessary to call this function once. Otherwise some patches to the runtime
    // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
    esp_idf_sys::link_patches();
    // Bind the log crate to the ESP Logging facilities
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("main: running on core: {:?}", core());
    let cfg = CONFIG;

    info!("Setting up board...");
    let peripherals =
        Peripherals::take().ok_or_else(|| anyhow!("peripherals already taken"))?;
    let mut sda = peripherals.pins.gpio21;
    let mut scl = peripherals.pins.gpio22;

    info!("Recovering I2C bus...");
    {
        let mut sda_line = PinDriver::input_output_od(&mut sda)?;
        let mut scl_line = PinDriver::input_output_od(&mut scl)?;
        if let Err(err) = free_bus(&mut scl_line, &mut sda_line, &mut BoardDelay) {
            warn!("main: bus recovery failed: {}", err);
        }
    }

    info!("Setting up I2C bus...");
    let bus_config = BusConfig {
        frequency_hz: cfg.i2c_baudrate,
        timeout_ms: cfg.i2c_timeout_ms,
    };
    let config = I2cConfig::new()
        .baudrate(bus_config.frequency_hz.Hz().into())
        .timeout(Duration::from_millis(bus_config.timeout_ms.into()).into());
    let driver = I2cDriver::new(peripherals.i2c1, sda, scl, &config)?;
    let bus: &'static _ = shared_bus::new_std!(I2cDriver = driver)
        .ok_or_else(|| anyhow!("I2C bus manager already created"))?;

    info!("Setting up ultrasonic sensor...");
    let lines = BoardEchoLines::new(cfg.echo_gpio, cfg.trigger_gpio)?;
    let range_finder = Ultrasonic::new(lines, BoardClock);
    install_echo_isr(cfg.echo_gpio, range_finder.echo_handler())?;

    info!("Starting async run loop...");
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(async_main(bus, range_finder))
}

async fn async_main(
    i2c_bus: &'static BusManager<Mutex<I2cDriver<'static>>>,
    range_finder: RangeFinder,
) -> Result<()> {
    info!("main async: running on core: {:?}", core());
    let cfg = CONFIG;

    info!("async_main: setup broadcast channels...");
    let (mut sender_environment, mut receiver_environment) = broadcast(1);
    let (mut sender_orientation, mut receiver_orientation) = broadcast(1);
    let (mut sender_range, mut receiver_range) = broadcast(1);

    sender_environment.set_overflow(true);
    sender_orientation.set_overflow(true);
    sender_range.set_overflow(true);

    info!("setup sensors...");
    tokio::spawn(environment_sensor(
        Bme280::new(i2c_bus.acquire_i2c(), cfg.bme280_address),
        sender_environment,
    ));
    tokio::spawn(orientation_sensor(
        Bno055::new(i2c_bus.acquire_i2c(), cfg.bno055_address),
        sender_orientation,
    ));
    tokio::spawn(range_sensor(range_finder, sender_range));

    loop {
        if let Some((temperature, pressure, altitude)) = latest(&mut receiver_environment) {
            info!(
                "main: {:.2} °C, {:.1} Pa, {:.2} m",
                temperature, pressure, altitude
            );
        }

        if let Some((euler, acceleration)) = latest(&mut receiver_orientation) {
            info!(
                "main: heading {:.3} rad, roll {:.3} rad, pitch {:.3} rad, linear acceleration {:?} g",
                euler.heading, euler.roll, euler.pitch, acceleration
            );
        }

        if let Some(distance) = latest(&mut receiver_range) {
            info!("main: distance {} cm", distance);
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// Newest value of a channel that overwrites old values when full.
fn latest<T: Clone>(rx: &mut Receiver<T>) -> Option<T> {
    match rx.try_recv() {
        Ok(value) => Some(value),
        Err(TryRecvError::Overflowed(_)) => rx.try_recv().ok(),
        _ => None,
    }
}

async fn environment_setup(sensor: &mut Bme280<SharedI2c>) -> Result<()> {
    info!("environment_sensor: setup: running on {:?}", core());
    sensor.setup(&mut BoardDelay)?;
    info!(
        "environment_sensor: calibration: {}",
        serde_json::to_string(sensor.calibration())?
    );
    Ok(())
}

async fn environment_sensor(
    mut sensor: Bme280<SharedI2c>,
    tx: Sender<EnvironmentReading>,
) -> Result<()> {
    while let Err(err) = environment_setup(&mut sensor).await {
        warn!("environment_sensor: error: {:?}", err);
        tokio::time::sleep(Duration::from_millis(5000)).await;
    }

    loop {
        debug!("environment_sensor: reading measurements...");
        let temperature = sensor.temperature_f32();
        let pressure = sensor.pressure_f32();
        match (temperature, pressure) {
            (Ok(temperature), Ok(pressure)) => {
                let altitude = bme280::barometric_altitude(pressure);
                tx.broadcast((temperature, pressure, altitude)).await?;
            }
            (Err(e), _) | (_, Err(e)) => warn!("environment_sensor: error: {}", e),
        }

        tokio::time::sleep(Duration::from_millis(CONFIG.environment_interval_ms)).await;
    }
}

async fn orientation_setup(sensor: &mut Bno055<SharedI2c>) -> Result<()> {
    info!("orientation_sensor: setup: running on {:?}", core());
    sensor.setup(&mut BoardDelay)?;
    Ok(())
}

async fn orientation_sensor(
    mut sensor: Bno055<SharedI2c>,
    tx: Sender<OrientationReading>,
) -> Result<()> {
    while let Err(err) = orientation_setup(&mut sensor).await {
        warn!("orientation_sensor: error: {:?}", err);
        tokio::time::sleep(Duration::from_millis(5000)).await;
    }

    let mut profile_logged = false;
    loop {
        if !profile_logged && sensor.calib_stat() == 0 {
            let offsets = sensor.calib_data(&mut BoardDelay)?;
            info!(
                "orientation_sensor: calibration profile: {}",
                serde_json::to_string(&offsets)?
            );
            profile_logged = true;
        }

        let euler = sensor.euler_f32()?;
        let acceleration = sensor.linear_acceleration_f32()?;
        tx.broadcast((euler, acceleration)).await?;

        tokio::time::sleep(Duration::from_millis(CONFIG.orientation_interval_ms)).await;
    }
}

async fn range_sensor(mut sensor: RangeFinder, tx: Sender<RangeReading>) -> Result<()> {
    while let Err(err) = sensor.setup(&mut BoardDelay) {
        warn!("range_sensor: error: {}", err);
        tokio::time::sleep(Duration::from_millis(5000)).await;
    }

    loop {
        match sensor.distance() {
            Ok(Some(distance)) => {
                tx.broadcast(distance).await?;
            }
            Ok(None) => {}
            Err(e) => debug!("range_sensor: {}", e),
        }

        tokio::time::sleep(Duration::from_millis(CONFIG.range_interval_ms)).await;
    }
}

struct BoardDelay;

impl DelayMs<u16> for BoardDelay {
    fn delay_ms(&mut self, ms: u16) {
        FreeRtos::delay_ms(ms.into());
    }
}

impl DelayUs<u16> for BoardDelay {
    fn delay_us(&mut self, us: u16) {
        Ets::delay_us(us.into());
    }
}

/// Trigger and echo pins driven through the raw GPIO driver, so they can be
/// used from the edge interrupt.
struct BoardEchoLines {
    echo: i32,
    trigger: i32,
}

impl BoardEchoLines {
    fn new(echo: i32, trigger: i32) -> Result<Self, EspError> {
        use esp_idf_sys::*;

        esp!(unsafe { gpio_reset_pin(trigger) })?;
        esp!(unsafe { gpio_set_direction(trigger, gpio_mode_t_GPIO_MODE_OUTPUT) })?;
        esp!(unsafe { gpio_set_level(trigger, 1) })?;

        esp!(unsafe { gpio_reset_pin(echo) })?;
        esp!(unsafe { gpio_set_direction(echo, gpio_mode_t_GPIO_MODE_INPUT) })?;
        esp!(unsafe { gpio_set_intr_type(echo, gpio_int_type_t_GPIO_INTR_ANYEDGE) })?;

        Ok(Self { echo, trigger })
    }
}

impl EchoLines for BoardEchoLines {
    type Error = EspError;

    fn set_trigger(&self, high: bool) -> Result<(), Self::Error> {
        esp!(unsafe { esp_idf_sys::gpio_set_level(self.trigger, high.into()) })
    }

    fn echo_is_high(&self) -> Result<bool, Self::Error> {
        Ok(unsafe { esp_idf_sys::gpio_get_level(self.echo) } != 0)
    }

    fn attach_interrupt(&self) -> Result<(), Self::Error> {
        esp!(unsafe { esp_idf_sys::gpio_intr_enable(self.echo) })
    }

    fn detach_interrupt(&self) -> Result<(), Self::Error> {
        esp!(unsafe { esp_idf_sys::gpio_intr_disable(self.echo) })
    }
}

struct BoardClock;

impl MicrosClock for BoardClock {
    fn micros(&self) -> u32 {
        // wraps like the Arduino counter
        unsafe { esp_idf_sys::esp_timer_get_time() as u32 }
    }
}

type RangeHandler = EchoHandler<BoardEchoLines, BoardClock>;

unsafe extern "C" fn echo_isr(arg: *mut c_void) {
    let handler = &*(arg as *const RangeHandler);
    handler.on_edge().ok();
}

/// Registers the edge handler for the echo pin. The interrupt stays disabled
/// until the range finder starts a measurement cycle.
fn install_echo_isr(echo: i32, handler: RangeHandler) -> Result<(), EspError> {
    use esp_idf_sys::*;

    let handler: &'static RangeHandler = Box::leak(Box::new(handler));
    esp!(unsafe { gpio_install_isr_service(0) })?;
    esp!(unsafe {
        gpio_isr_handler_add(
            echo,
            Some(echo_isr),
            handler as *const RangeHandler as *mut c_void,
        )
    })?;
    esp!(unsafe { gpio_intr_disable(echo) })
}
