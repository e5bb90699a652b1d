use embedded_hal::{blocking::spi::Transfer, digital::v2::OutputPin};

use super::proto::*;
use super::{transfer, PollBudget, BUSY_POLL_LIMIT, RESPONSE_POLL_LIMIT, TOKEN_POLL_LIMIT};
use crate::{trace, warn, Error};

/// A struct used to ensure that communication only occurs
/// when CS is low.
///
/// Creating it selects the card, dropping it deselects the card again, so
/// every early return leaves the card deselected.
pub struct SdMmcSpiBusy<'spi, 'cs, SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    spi: &'spi mut SPI,
    cs: &'cs mut CS,
}

impl<'spi, 'cs, SPI, CS> Drop for SdMmcSpiBusy<'spi, 'cs, SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    fn drop(&mut self) {
        self.cs_high().ok();
    }
}

impl<'spi, 'cs, SPI, CS> SdMmcSpiBusy<'spi, 'cs, SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    pub fn new(spi: &'spi mut SPI, cs: &'cs mut CS) -> Result<Self, Error> {
        let mut me = Self { spi, cs };
        me.cs_low()?;
        Ok(me)
    }

    fn cs_high(&mut self) -> Result<(), Error> {
        self.cs.set_high().map_err(|_| Error::Gpio)
    }

    fn cs_low(&mut self) -> Result<(), Error> {
        self.cs.set_low().map_err(|_| Error::Gpio)
    }

    /// Receive a byte from the SD card by clocking in an 0xFF byte.
    pub fn receive(&mut self) -> Result<u8, Error> {
        transfer(&mut *self.spi, IDLE_BYTE)
    }

    /// Send a byte to the SD card.
    pub fn send(&mut self, out: u8) -> Result<(), Error> {
        let _ = transfer(&mut *self.spi, out)?;
        Ok(())
    }

    /// Spin until the card returns 0xFF, or we spin too many times and
    /// timeout.
    pub fn wait_not_busy(&mut self) -> Result<(), Error> {
        let mut budget = PollBudget::new(BUSY_POLL_LIMIT);
        loop {
            let s = self.receive()?;
            if s == IDLE_BYTE {
                break;
            }
            budget.spend(Error::BusyTimeout)?;
        }
        Ok(())
    }

    /// Wait for an R1 response. Anything with the top bit set is the card
    /// still thinking.
    fn response(&mut self, no_response: Error) -> Result<u8, Error> {
        let mut budget = PollBudget::new(RESPONSE_POLL_LIMIT);
        loop {
            let result = self.receive()?;
            if (result & R1_START_MASK) == 0 {
                return Ok(result);
            }
            budget.spend(no_response)?;
        }
    }

    /// Send a command frame and return the card's R1 response.
    pub fn command(&mut self, command: u8, arg: u32, no_response: Error) -> Result<u8, Error> {
        trace!("CMD{} arg={:x}", command, arg);
        for b in command_frame(command, arg).iter() {
            self.send(*b)?;
        }
        self.response(no_response)
    }

    /// Send a command that must be answered with `expected`.
    pub fn card_command(
        &mut self,
        command: u8,
        arg: u32,
        expected: u8,
        rejected: Error,
    ) -> Result<(), Error> {
        let r1 = self.command(command, arg, rejected)?;
        if r1 != expected {
            warn!("CMD{} rejected with R1={:x}", command, r1);
            return Err(rejected);
        }
        Ok(())
    }

    /// End a multiple block read.
    pub fn stop_transmission(&mut self) -> Result<(), Error> {
        trace!("CMD{} arg=0", CMD12);
        for b in command_frame(CMD12, 0).iter() {
            self.send(*b)?;
        }
        // skip stuff byte for stop read
        let _ = self.receive()?;
        let r1 = self.response(Error::CommandRejected)?;
        if r1 != R1_READY_STATE {
            warn!("CMD{} rejected with R1={:x}", CMD12, r1);
            return Err(Error::CommandRejected);
        }
        self.wait_not_busy()
    }

    /// Read an arbitrary number of bytes from the card. Always fills the
    /// given buffer, so make sure it's the right size.
    pub fn read_data(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        // Get first non-FF byte.
        let mut budget = PollBudget::new(TOKEN_POLL_LIMIT);
        let status = loop {
            let s = self.receive()?;
            if s != IDLE_BYTE {
                break s;
            }
            budget.spend(Error::ReadTokenMissing)?;
        };
        if status != DATA_START_BLOCK {
            warn!("Expected data token, got {:x}", status);
            return Err(Error::ReadTokenMissing);
        }

        for b in buffer.iter_mut() {
            *b = self.receive()?;
        }

        // The CRC is not checked in SPI mode
        let _ = self.receive()?;
        let _ = self.receive()?;

        Ok(())
    }

    /// Write an arbitrary number of bytes to the card.
    pub fn write_data(&mut self, token: u8, buffer: &[u8]) -> Result<(), Error> {
        self.send(token)?;
        for &b in buffer.iter() {
            self.send(b)?;
        }
        self.send(IDLE_BYTE)?;
        self.send(IDLE_BYTE)?;
        let status = self.receive()?;
        if (status & DATA_RES_MASK) != DATA_RES_ACCEPTED {
            warn!("Data response {:x}", status);
            Err(Error::WriteRejected)
        } else {
            Ok(())
        }
    }
}
