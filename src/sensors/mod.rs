pub mod bme280;
pub mod bno055;
pub mod i2c_sensor;
pub mod ultrasonic;

#[cfg(test)]
mod tests {
    use super::{
        bme280::{self, Bme280},
        bno055::{self, Bno055},
        i2c_sensor::I2CSensor,
    };
    use crate::mock::{MockDelay, MockI2c};

    #[test]
    fn drivers_share_one_bus() {
        let mut i2c = MockI2c::new();
        // BME280: chip id, trimming registers and one sample, adc_T = 519888
        i2c.set_register(bme280::ADDRESS, 0xD0, 0x60);
        i2c.set_registers(
            bme280::ADDRESS,
            0x88,
            &[
                0x70, 0x6B, 0x43, 0x67, 0x18, 0xFC, 0x7D, 0x8E, 0x43, 0xD6, 0xD0, 0x0B, 0x27,
                0x0B, 0x8C, 0x00, 0xF9, 0xFF, 0x8C, 0x3C, 0xF8, 0xC6, 0x70, 0x17, 0x00, 0x4B,
            ],
        );
        i2c.set_registers(bme280::ADDRESS, 0xE1, &[0x6A, 0x01, 0x00, 0x14, 0x24, 0x03, 0x1E]);
        i2c.set_registers(
            bme280::ADDRESS,
            0xF7,
            &[0x65, 0x5A, 0xC0, 0x7E, 0xED, 0x00, 0x75, 0x30],
        );
        // BNO055: chip id and a heading of 1 rad
        i2c.set_register(bno055::ADDRESS, 0x00, 0xA0);
        i2c.set_registers(bno055::ADDRESS, 0x1A, &[0x84, 0x03, 0x00, 0x00, 0x00, 0x00]);

        let manager = shared_bus::BusManagerSimple::new(i2c);
        let mut environment = Bme280::with_default_address(manager.acquire_i2c());
        let mut orientation = Bno055::with_default_address(manager.acquire_i2c());
        let mut delay = MockDelay::new();

        environment.setup(&mut delay).unwrap();
        orientation.setup(&mut delay).unwrap();

        assert_eq!(environment.temperature().unwrap(), 2508);
        assert_eq!(orientation.euler().unwrap().heading, 900);
    }
}
