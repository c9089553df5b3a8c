/// Size of one logical block, in bytes.
pub const BLOCK_SIZE: usize = 512;
/// [`BLOCK_SIZE`] as `u64` for capacity arithmetic.
pub const BLOCK_SIZE_U64: u64 = BLOCK_SIZE as u64;
/// Filler byte clocked out while the host only wants to read.
pub const FILL_BYTE: u8 = 0xFF;

pub mod commands {
    /// Start and transmission bits of the first frame byte.
    pub const CMD_BASE: u8 = 0x40;
    /// Mask for the 6-bit command index.
    pub const CMD_INDEX_MASK: u8 = 0x3F;
    /// GO_IDLE_STATE - init card in spi mode if CS low.
    pub const CMD0: u8 = 0;
    /// SEND_IF_COND - verify SD Memory Card interface operating condition.
    pub const CMD8: u8 = 8;
    /// SEND_CSD - read the Card Specific Data (CSD register).
    pub const CMD9: u8 = 9;
    /// STOP_TRANSMISSION - end multiple block read sequence.
    pub const CMD12: u8 = 12;
    /// SET_BLOCKLEN - set the block length for block commands.
    pub const CMD16: u8 = 16;
    /// READ_SINGLE_BLOCK - read a single data block from the card.
    pub const CMD17: u8 = 17;
    /// READ_MULTIPLE_BLOCK - read a multiple data blocks from the card.
    pub const CMD18: u8 = 18;
    /// WRITE_BLOCK - write a single data block to the card.
    pub const CMD24: u8 = 24;
    /// WRITE_MULTIPLE_BLOCK - write blocks of data until a STOP_TRANSMISSION.
    pub const CMD25: u8 = 25;
    /// SD_SEND_OP_COMD - Sends host capacity support information and activates
    /// the card's initialization process. Must follow [`CMD55`].
    pub const ACMD41: u8 = 41;
    /// APP_CMD - escape for application specific command.
    pub const CMD55: u8 = 55;
    /// READ_OCR - read the OCR register of a card.
    pub const CMD58: u8 = 58;
}

pub mod args {
    /// CMD8 argument: 2.7-3.6V supply and the 0xAA check pattern.
    pub const IF_COND: u32 = 0x0000_01AA;
    /// ACMD41 argument with the host capacity support (HCS) bit.
    pub const HCS: u32 = 0x4000_0000;
    /// Length of the CMD8 (R7) and CMD58 (R3) payload following R1.
    pub const R7_R3_PAYLOAD_LEN: usize = 4;
}

pub mod tokens {
    /// Start data token for read or write single block.
    pub const DATA_START_BLOCK: u8 = 0xFE;
    /// Stop token for write multiple blocks.
    pub const STOP_TRAN: u8 = 0xFD;
    /// Start data token for write multiple blocks.
    pub const WRITE_MULTIPLE: u8 = 0xFC;
    /// Data error tokens have the upper nibble cleared.
    pub const DATA_ERROR_MASK: u8 = 0xF0;
    /// Mask for data response tokens after a write block operation.
    pub const DATA_RES_MASK: u8 = 0x1F;
    /// Write data accepted token.
    pub const DATA_RES_ACCEPTED: u8 = 0x05;
    /// Card holds MISO low while it is busy programming.
    pub const BUSY: u8 = 0x00;
    /// Number of checksum bytes trailing every data block.
    pub const CRC_LEN: usize = 2;
}
