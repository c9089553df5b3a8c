use crate::{
    bus::{Bus, BusClock, ErrorFor},
    config::SdCardConfig,
    consts::{commands, tokens, BLOCK_SIZE, FILL_BYTE},
    response::{R1Response, ResponseOpts},
    trace, warn, Error,
};

use switch_hal::OutputSwitch;

impl<Spi, Cs, Config> Bus<Spi, Cs, Config>
where
    Spi: BusClock,
    Cs: OutputSwitch,
    Config: SdCardConfig,
{
    /// Maps the status of a data command to an error unless it is 0.
    fn check_ready(cmd: u8, r1: Option<R1Response>) -> Result<(), ErrorFor<Spi, Cs>> {
        match r1 {
            Some(R1Response::READY_STATE) => Ok(()),
            Some(r1) => Err(Error::ErrorCommand(cmd, r1.bits())),
            None => Err(Error::TimeoutCommand(cmd)),
        }
    }

    /// Sends a data command and keeps the card selected for the data phase.
    fn data_command(&self, cmd: u8, address: u32) -> Result<(), ErrorFor<Spi, Cs>> {
        let r1 = self.command(cmd, address, ResponseOpts::HOLD)?;
        Self::check_ready(cmd, r1)
    }

    fn stop_transmission(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        self.send_command(commands::CMD12, 0x0000_0000)?;
        let r1 = self.await_response(ResponseOpts::HOLD.skip_lead_byte())?;
        Self::check_ready(commands::CMD12, r1)
    }

    /// Read one data block: start token, payload, checksum.
    ///
    /// Bytes other than the start token or a data error token are skipped.
    pub(crate) fn read_data(&self, data: &mut [u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        let token = self.wait_for_token(
            Config::DATA_TOKEN_ATTEMPTS,
            |token| {
                token == tokens::DATA_START_BLOCK
                    || (token != 0 && (token & tokens::DATA_ERROR_MASK) == 0)
            },
            Error::TimeoutReadBuffer,
        )?;

        if token != tokens::DATA_START_BLOCK {
            return Err(Error::ReadError(token));
        }

        self.receive_slice(data)?;
        self.skip_bytes(tokens::CRC_LEN)
    }

    /// Write one data block and wait until the card has programmed it.
    fn write_data(&self, token: u8, data: &[u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        self.send(token)?;
        self.send_slice(data)?;
        self.send_slice(&[FILL_BYTE; tokens::CRC_LEN])?;

        let response = self.receive()?;
        if (response & tokens::DATA_RES_MASK) != tokens::DATA_RES_ACCEPTED {
            return Err(Error::WriteError(response));
        }

        self.wait_not_busy()
    }

    /// Reads `buf.len() / BLOCK_SIZE` blocks starting at card `address`.
    ///
    /// `buf` must be a non-empty multiple of [`BLOCK_SIZE`].
    pub(crate) fn read_blocks(&self, address: u32, buf: &mut [u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        let block_count = buf.len() / BLOCK_SIZE;

        trace!("SD read {} block(s) at 0x{:08X}", block_count, address);

        self.cs_scope(|s| {
            if block_count == 1 {
                s.data_command(commands::CMD17, address)?;
                s.read_data(buf)
            } else {
                s.data_command(commands::CMD18, address)?;
                let streamed = buf
                    .chunks_mut(BLOCK_SIZE)
                    .try_for_each(|chunk| s.read_data(chunk));

                match streamed {
                    Ok(()) => s.stop_transmission(),
                    Err(err) => {
                        warn!("SD multiple block read aborted");
                        // The read error is what the caller needs to see.
                        let _ = s.stop_transmission();
                        Err(err)
                    }
                }
            }
        })
    }

    /// Writes `buf.len() / BLOCK_SIZE` blocks starting at card `address`.
    ///
    /// `buf` must be a non-empty multiple of [`BLOCK_SIZE`].
    pub(crate) fn write_blocks(&self, address: u32, buf: &[u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        let block_count = buf.len() / BLOCK_SIZE;

        trace!("SD write {} block(s) at 0x{:08X}", block_count, address);

        self.cs_scope(|s| {
            if block_count == 1 {
                s.data_command(commands::CMD24, address)?;
                s.write_data(tokens::DATA_START_BLOCK, buf)
            } else {
                s.data_command(commands::CMD25, address)?;
                for block in buf.chunks(BLOCK_SIZE) {
                    s.write_data(tokens::WRITE_MULTIPLE, block)?;
                }
                s.send(tokens::STOP_TRAN)?;
                s.skip_bytes(1)?;
                s.wait_not_busy()
            }
        })
    }
}
