//! embedded-sdfat - Shared bus exclusivity
//!
//! The SD card shares its SPI bus with other peripherals (the EEPROM, and
//! the LED pod refresh that runs from a timer interrupt). Every card
//! operation runs with the bus claimed through a [`BusLock`], and the claim
//! is dropped on every exit path, errors included.

/// Something that keeps other users off the SPI bus while it is held, e.g.
/// by masking the timer interrupt that refreshes the LED pods.
pub trait BusLock {
    /// Claim the bus.
    fn lock(&mut self);
    /// Give the bus back.
    fn unlock(&mut self);
}

/// For a bus the card has to itself.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoBusLock;

impl BusLock for NoBusLock {
    fn lock(&mut self) {}
    fn unlock(&mut self) {}
}

/// Holds a [`BusLock`] until dropped.
pub struct BusGuard<'l, L>
where
    L: BusLock,
{
    lock: &'l mut L,
}

impl<'l, L> BusGuard<'l, L>
where
    L: BusLock,
{
    /// Claim the bus through `lock`.
    pub fn acquire(lock: &'l mut L) -> Self {
        lock.lock();
        BusGuard { lock }
    }
}

impl<'l, L> Drop for BusGuard<'l, L>
where
    L: BusLock,
{
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
