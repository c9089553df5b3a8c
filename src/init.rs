use crate::{
    bus::{Bus, BusClock, ErrorFor},
    config::SdCardConfig,
    consts::{args, commands, BLOCK_SIZE},
    csd::{CapacityProvider, Csd, CsdData},
    debug, error, info,
    response::{raw_status, R1Response, ResponseOpts},
    warn, CardVersion, Error,
};

use embedded_hal::blocking::delay::DelayMs;
use switch_hal::OutputSwitch;

/// What the initialization found out about the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Session {
    pub(crate) version: CardVersion,
    pub(crate) sectors: u64,
}

impl<Spi, Cs, Config> Bus<Spi, Cs, Config>
where
    Spi: BusClock,
    Cs: OutputSwitch,
    Config: SdCardConfig,
{
    /// Brings the card from power-on to the ready state.
    ///
    /// The card is left deselected whatever the outcome.
    pub(crate) fn initialize<D: DelayMs<u32>>(
        &self,
        delay: &mut D,
    ) -> Result<Session, ErrorFor<Spi, Cs>> {
        info!("SD initialize started");

        let result = self.init_sequence(delay);

        match &result {
            Ok(session) => info!(
                "SD successfully initialized, version: {:?}, blocks: {}",
                session.version, session.sectors
            ),
            Err(_) => {
                error!("Failed to initialize SD");
                // The failure is what the caller needs to see.
                let _ = self.release();
            }
        }

        result
    }

    fn init_sequence<D: DelayMs<u32>>(&self, delay: &mut D) -> Result<Session, ErrorFor<Spi, Cs>> {
        self.wake_up()?;
        self.go_idle()?;

        let version = self.send_if_cond()?;
        match version {
            CardVersion::V1 => self.init_v1()?,
            CardVersion::V2 => self.init_v2(delay)?,
        }

        let sectors = self.read_csd()?.card_capacity_blocks();

        self.set_block_length()?;
        self.set_clock_rate(Config::OPERATING_CLOCK_HZ)?;

        Ok(Session { version, sectors })
    }

    /// Slow clock, card deselected, at least 74 clock cycles.
    fn wake_up(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        self.set_clock_rate(Config::INIT_CLOCK_HZ)?;
        self.unselect()?;
        self.skip_bytes(Config::WAKE_UP_BYTES)
    }

    /// Enter SD to SPI mode.
    fn go_idle(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        for i in 0..Config::GO_IDLE_ATTEMPTS {
            debug!("Enter to SPI mode for SD, attempt: {}", i + 1);

            match self.command(commands::CMD0, 0x0000_0000, ResponseOpts::RELEASE)? {
                Some(R1Response::IN_IDLE_STATE) => return Ok(()),
                Some(r1) => warn!("Wrong response from CMD0: 0x{:02X}", r1.bits()),
                None => {}
            }
        }

        error!("No SD card");
        Err(Error::NoCard)
    }

    /// Tells the card generations apart by whether they know CMD8.
    fn send_if_cond(&self) -> Result<CardVersion, ErrorFor<Spi, Cs>> {
        debug!("Verifying SD Memory Card interface operating condition");

        let opts = ResponseOpts::RELEASE.with_extra(args::R7_R3_PAYLOAD_LEN);

        match self.command(commands::CMD8, args::IF_COND, opts)? {
            Some(R1Response::IN_IDLE_STATE) => Ok(CardVersion::V2),
            Some(R1Response::IN_IDLE_AND_ILLEGAL) => Ok(CardVersion::V1),
            r1 => {
                error!("Unrecognized CMD8 response: 0x{:02X}", raw_status(r1));
                Err(Error::UnsupportedCard(raw_status(r1)))
            }
        }
    }

    /// CMD55 prefix followed by the application command.
    fn app_command(&self, cmd: u8, arg: u32) -> Result<Option<R1Response>, ErrorFor<Spi, Cs>> {
        self.command(commands::CMD55, 0x0000_0000, ResponseOpts::RELEASE)?;
        self.command(cmd, arg, ResponseOpts::RELEASE)
    }

    /// Reads OCR; the register content is not needed.
    fn read_ocr(&self) -> Result<Option<R1Response>, ErrorFor<Spi, Cs>> {
        self.command(
            commands::CMD58,
            0x0000_0000,
            ResponseOpts::RELEASE.with_extra(args::R7_R3_PAYLOAD_LEN),
        )
    }

    fn init_v1(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        debug!("Sending host capacity support information, v1 card");

        for _ in 0..Config::INIT_ATTEMPTS {
            if self.app_command(commands::ACMD41, args::HCS)? == Some(R1Response::READY_STATE) {
                return Ok(());
            }
        }

        error!("Timeout waiting for v1 card");
        Err(Error::InitTimeout(CardVersion::V1))
    }

    fn init_v2<D: DelayMs<u32>>(&self, delay: &mut D) -> Result<(), ErrorFor<Spi, Cs>> {
        debug!("Sending host capacity support information, v2 card");

        for _ in 0..Config::INIT_ATTEMPTS {
            delay.delay_ms(Config::OP_COND_POLL_DELAY_MS);

            self.read_ocr()?;

            if self.app_command(commands::ACMD41, args::HCS)? == Some(R1Response::READY_STATE) {
                self.read_ocr()?;
                return Ok(());
            }
        }

        error!("Timeout waiting for v2 card");
        Err(Error::InitTimeout(CardVersion::V2))
    }

    /// Read CSD.
    fn read_csd(&self) -> Result<Csd, ErrorFor<Spi, Cs>> {
        let mut csd_data: CsdData = Default::default();

        self.cs_scope(|s| match s.command(commands::CMD9, 0x0000_0000, ResponseOpts::HOLD)? {
            Some(R1Response::READY_STATE) => s.read_data(&mut csd_data),
            r1 => Err(Error::RegisterReadError(raw_status(r1))),
        })?;

        let csd = Csd::parse(csd_data).map_err(|structure| {
            error!("SD CSD format not supported: 0x{:02X}", structure);
            Error::UnsupportedCsd(structure)
        })?;

        debug!("SD CSD blocks: {}", csd.card_capacity_blocks());

        Ok(csd)
    }

    fn set_block_length(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        match self.command(commands::CMD16, BLOCK_SIZE as u32, ResponseOpts::RELEASE)? {
            Some(R1Response::READY_STATE) => Ok(()),
            r1 => {
                error!("Can't set {} block size", BLOCK_SIZE);
                Err(Error::BlockLengthError(raw_status(r1)))
            }
        }
    }
}
