use crate::{consts::commands, crc::crc7};

/// Six bytes sent for every command: start bits and index, big-endian
/// argument, CRC7 and end bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct CommandFrame([u8; CommandFrame::LEN]);

impl CommandFrame {
    /// Frame length in bytes.
    pub const LEN: usize = 6;

    /// Builds the frame for command `index` (0..=63) with `arg`.
    pub fn new(index: u8, arg: u32) -> Self {
        let [a0, a1, a2, a3] = arg.to_be_bytes();
        let mut buf = [
            commands::CMD_BASE | (index & commands::CMD_INDEX_MASK),
            a0,
            a1,
            a2,
            a3,
            0,
        ];
        let crc_index = buf.len() - 1;

        buf[crc_index] = (crc7(&buf[..crc_index]) << 1) | 0x01;

        CommandFrame(buf)
    }

    /// Command index.
    pub fn index(&self) -> u8 {
        self.0[0] & commands::CMD_INDEX_MASK
    }

    /// Command argument.
    pub fn arg(&self) -> u32 {
        u32::from_be_bytes([self.0[1], self.0[2], self.0[3], self.0[4]])
    }

    /// CRC7 with the end bit, as sent.
    pub fn crc(&self) -> u8 {
        self.0[Self::LEN - 1]
    }

    /// Bytes in wire order.
    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}
