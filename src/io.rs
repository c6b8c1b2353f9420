//! Register access abstraction.
//!
//! The protocol engine never touches MMIO directly; everything goes
//! through [`RegisterBus`] so the same engine drives real hardware and
//! the register-file double used by the unit tests.

use crate::error::{Result, Uhs2Error};

/// Host controller register access, delays and transfer-buffer hooks.
///
/// Offsets are relative to the start of the host register block.
/// Implementations for real hardware map these to MMIO reads/writes of
/// the matching width.
pub trait RegisterBus {
    fn read8(&self, offset: u16) -> u8;
    fn read16(&self, offset: u16) -> u16;
    fn read32(&self, offset: u16) -> u32;

    fn write8(&mut self, offset: u16, value: u8);
    fn write16(&mut self, offset: u16, value: u16);
    fn write32(&mut self, offset: u16, value: u32);

    /// Busy-wait for `us` microseconds.
    fn udelay(&mut self, us: u32);

    /// Card presence as reported by the slot.
    fn card_present(&self) -> bool;

    /// Copy received data out of the controller transfer buffer.
    fn dma_read(&mut self, buf: &mut [u8]);

    /// Stage data into the controller transfer buffer for transmission.
    fn dma_write(&mut self, data: &[u8]);

    /// Tear down any mapping set up for the current transfer.
    fn dma_release(&mut self);

    /// Poll a 32-bit register until `done` accepts its value.
    ///
    /// Samples before the first delay, so a condition that already
    /// holds costs no wait at all. Returns [`Uhs2Error::Timeout`] once
    /// `timeout_us` has elapsed without `done` being satisfied.
    fn poll32(
        &mut self,
        offset: u16,
        interval_us: u32,
        timeout_us: u32,
        done: impl Fn(u32) -> bool,
    ) -> Result<()>
    where
        Self: Sized,
    {
        let mut waited = 0u32;
        loop {
            if done(self.read32(offset)) {
                return Ok(());
            }
            if waited >= timeout_us {
                return Err(Uhs2Error::Timeout);
            }
            self.udelay(interval_us);
            waited = waited.saturating_add(interval_us);
        }
    }

    /// 16-bit variant of [`RegisterBus::poll32`].
    fn poll16(
        &mut self,
        offset: u16,
        interval_us: u32,
        timeout_us: u32,
        done: impl Fn(u16) -> bool,
    ) -> Result<()>
    where
        Self: Sized,
    {
        let mut waited = 0u32;
        loop {
            if done(self.read16(offset)) {
                return Ok(());
            }
            if waited >= timeout_us {
                return Err(Uhs2Error::Timeout);
            }
            self.udelay(interval_us);
            waited = waited.saturating_add(interval_us);
        }
    }
}
