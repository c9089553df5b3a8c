use crate::consts::BLOCK_SIZE_U64;

use bitfield::bitfield;
use size::{consts::KiB, Size};

/// Card Specific Data block.
pub type CsdData = [u8; 16];

/// `CSD_STRUCTURE` of a version 1 (standard capacity) register.
const CSD_STRUCTURE_V1: u8 = 0b00;
/// `CSD_STRUCTURE` of a version 2 (high/extended capacity) register.
const CSD_STRUCTURE_V2: u8 = 0b01;

bitfield! {
    /// Card Specific Data, version 1.
    pub struct CsdV1(u128);
    pub u8, version, _: 127, 126;
    pub u8, read_block_length, _: 83, 80;
    pub u16, device_size, _: 73, 62;
    pub u8, device_size_multiplier, _: 49, 47;
}

bitfield! {
    /// Card Specific Data, version 2.
    pub struct CsdV2(u128);
    pub u8, version, _: 127, 126;
    pub u32, device_size, _: 69, 48;
}

/// Card Specific Data, generic container.
pub enum Csd {
    V1(CsdV1),
    V2(CsdV2),
}

/// Represents capacity provider.
pub trait CapacityProvider {
    /// Returns the card capacity in bytes.
    fn card_capacity(&self) -> Size {
        Size::from_bytes(self.card_capacity_blocks() * BLOCK_SIZE_U64)
    }

    /// Returns the card capacity in 512-byte blocks.
    fn card_capacity_blocks(&self) -> u64;
}

impl From<CsdData> for CsdV1 {
    fn from(csd_data: CsdData) -> Self {
        CsdV1(u128::from_be_bytes(csd_data))
    }
}

impl From<CsdData> for CsdV2 {
    fn from(csd_data: CsdData) -> Self {
        CsdV2(u128::from_be_bytes(csd_data))
    }
}

impl Csd {
    /// Picks the layout by `CSD_STRUCTURE`, the top two bits of byte 0.
    ///
    /// Returns the unknown structure value on error.
    pub fn parse(csd_data: CsdData) -> Result<Csd, u8> {
        match csd_data[0] >> 6 {
            CSD_STRUCTURE_V1 => Ok(Csd::V1(CsdV1::from(csd_data))),
            CSD_STRUCTURE_V2 => Ok(Csd::V2(CsdV2::from(csd_data))),
            structure => Err(structure),
        }
    }
}

/// `READ_BL_LEN` of a 512-byte block.
const READ_BL_LEN_512: u8 = 9;

impl CapacityProvider for CsdV1 {
    /// `(C_SIZE + 1) * 2^(C_SIZE_MULT + 2)` blocks of `2^READ_BL_LEN` bytes,
    /// counted in 512-byte blocks. 2GB and 4GB cards report 1024 and 2048
    /// byte blocks.
    fn card_capacity_blocks(&self) -> u64 {
        let block_len_shift = self.read_block_length().saturating_sub(READ_BL_LEN_512);

        (u64::from(self.device_size()) + 1)
            << (self.device_size_multiplier() + 2 + block_len_shift)
    }
}

impl CapacityProvider for CsdV2 {
    fn card_capacity_blocks(&self) -> u64 {
        (u64::from(self.device_size()) + 1) * (KiB as u64)
    }
}

impl CapacityProvider for Csd {
    fn card_capacity_blocks(&self) -> u64 {
        match self {
            Csd::V1(csd) => csd.card_capacity_blocks(),
            Csd::V2(csd) => csd.card_capacity_blocks(),
        }
    }
}
