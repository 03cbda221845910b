use crate::bus::RegisterBus;

pub trait I2CSensor<B>
where
    B: RegisterBus,
{
    /// Address the device answers on with its address pin at the default level.
    const DEFAULT_ADDRESS: u8;

    /// Creates a new sensor driver.
    fn new(bus: B, address: u8) -> Self;

    /// Creates a new sensor driver on the default address.
    fn with_default_address(bus: B) -> Self
    where
        Self: Sized,
    {
        Self::new(bus, Self::DEFAULT_ADDRESS)
    }

    /// Releases the underlying I2C bus and destroys the driver.
    fn release(self) -> B;
}
