use crate::consts::FILL_BYTE;

use bitfield::bitfield;

bitfield! {
    /// R1 response bitset.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct R1Response(u8);
    impl Debug;
    pub in_idle_state, _: 0;
    pub erase_reset, _: 1;
    pub illegal_command, _: 2;
    pub command_crc_error, _: 3;
    pub erase_sequence_error, _: 4;
    pub address_error, _: 5;
    pub parameter_error, _: 6;
    pub start_bit, _: 7;
}

impl R1Response {
    /// Card finished initialization and accepted the command.
    pub const READY_STATE: R1Response = R1Response(0x00);
    /// Card is in the idle state and running its initialization.
    pub const IN_IDLE_STATE: R1Response = R1Response(0x01);
    /// Idle card that does not know the command, i.e. CMD8 on a version 1 card.
    pub const IN_IDLE_AND_ILLEGAL: R1Response = R1Response(0x05);

    /// A status byte always has bit 7 cleared, anything else is still bus idle.
    pub fn is_valid(&self) -> bool {
        !self.start_bit()
    }

    /// Raw status byte.
    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// Status byte for diagnostics, the bus idle level stands for no response.
pub fn raw_status(r1: Option<R1Response>) -> u8 {
    r1.map_or(FILL_BYTE, |r1| r1.bits())
}

/// How the status byte poll finishes a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseOpts {
    /// Bytes to clock in and drop after the status byte (R3/R7 payload).
    pub extra_bytes: usize,
    /// Deselect the card and clock one filler byte afterwards.
    pub release: bool,
    /// Drop one byte before polling, the stuff byte following CMD12.
    pub skip_lead_byte: bool,
}

impl ResponseOpts {
    /// Poll R1 and release the card.
    pub const RELEASE: ResponseOpts = ResponseOpts {
        extra_bytes: 0,
        release: true,
        skip_lead_byte: false,
    };

    /// Poll R1 and keep the card selected for a data phase.
    pub const HOLD: ResponseOpts = ResponseOpts {
        extra_bytes: 0,
        release: false,
        skip_lead_byte: false,
    };

    /// Same options, draining `extra_bytes` after the status byte.
    pub const fn with_extra(self, extra_bytes: usize) -> Self {
        ResponseOpts {
            extra_bytes,
            ..self
        }
    }

    /// Same options, dropping one byte before the poll starts.
    pub const fn skip_lead_byte(self) -> Self {
        ResponseOpts {
            skip_lead_byte: true,
            ..self
        }
    }
}

impl Default for ResponseOpts {
    fn default() -> Self {
        Self::RELEASE
    }
}
