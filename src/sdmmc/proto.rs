//! embedded-sdfat - SD/MMC Protocol
//!
//! Constants and pure helpers for talking to legacy SD and MMC cards in SPI
//! mode. Nothing here touches the bus.

//==============================================================================

// SD card and MMC commands used by the driver

/// GO_IDLE_STATE - init card in spi mode if CS low
pub const CMD0: u8 = 0x00;
/// SEND_OP_COND - start the initialization process
pub const CMD1: u8 = 0x01;
/// SEND_CSD - read the Card Specific Data (CSD register)
pub const CMD9: u8 = 0x09;
/// STOP_TRANSMISSION - end multiple block read sequence
pub const CMD12: u8 = 0x0C;
/// READ_SINGLE_BLOCK - read a single data block from the card
pub const CMD17: u8 = 0x11;
/// READ_MULTIPLE_BLOCK - read a multiple data blocks from the card
pub const CMD18: u8 = 0x12;
/// WRITE_BLOCK - write a single data block to the card
pub const CMD24: u8 = 0x18;
/// WRITE_MULTIPLE_BLOCK - write blocks of data until a STOP_TRANSMISSION
pub const CMD25: u8 = 0x19;
/// ERASE_WR_BLK_START - sets the address of the first block to be erased
pub const CMD32: u8 = 0x20;
/// ERASE_WR_BLK_END - sets the address of the last block of the continuous
/// range to be erased
pub const CMD33: u8 = 0x21;
/// ERASE - erase all previously selected blocks
pub const CMD38: u8 = 0x26;

//==============================================================================

/// status for card in the ready state
pub const R1_READY_STATE: u8 = 0x00;

/// status for card in the idle state
pub const R1_IDLE_STATE: u8 = 0x01;

/// An R1 response always has its top bit clear
pub const R1_START_MASK: u8 = 0x80;

/// start data token for read or write single block
pub const DATA_START_BLOCK: u8 = 0xFE;

/// stop token for write multiple blocks
pub const STOP_TRAN_TOKEN: u8 = 0xFD;

/// start data token for write multiple blocks
pub const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;

/// mask for data response tokens after a write block operation
pub const DATA_RES_MASK: u8 = 0x0F;

/// write data accepted token
pub const DATA_RES_ACCEPTED: u8 = 0x05;

/// The CRC that is valid for CMD0 with a zero argument. Outside CMD0 the
/// card ignores the CRC in SPI mode, so every frame carries it.
pub const FIXED_CRC: u8 = 0x95;

/// What the card sends while it has nothing to say
pub const IDLE_BYTE: u8 = 0xFF;

//==============================================================================

/// Build the six bytes that carry `command` with argument `arg`.
pub fn command_frame(command: u8, arg: u32) -> [u8; 6] {
    let arg = arg.to_be_bytes();
    [0x40 | command, arg[0], arg[1], arg[2], arg[3], FIXED_CRC]
}

/// The Card Specific Data register of a legacy (version 1) card.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct Csd {
    /// The 16 register bytes, most significant first
    pub data: [u8; 16],
}

impl Csd {
    /// An all-zero register.
    pub fn new() -> Csd {
        Csd::default()
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    define_field!(read_block_length, u8, [(5, 0, 4)]);
    define_field!(device_size, u32, [(6, 0, 2), (7, 0, 8), (8, 6, 2)]);
    define_field!(device_size_multiplier, u8, [(9, 0, 2), (10, 7, 1)]);

    /// Returns the card capacity in bytes, saturating at `u32::MAX`.
    pub fn card_capacity_bytes(&self) -> u32 {
        let multiplier = self.device_size_multiplier() + 2;
        let block_len = u64::from(self.read_block_length());
        let capacity = (u64::from(self.device_size()) + 1) << (u64::from(multiplier) + block_len);
        if capacity > u64::from(u32::MAX) {
            u32::MAX
        } else {
            capacity as u32
        }
    }
}
