use crate::{
    command::CommandFrame,
    config::SdCardConfig,
    consts::{tokens, FILL_BYTE},
    response::{R1Response, ResponseOpts},
    trace, warn, Error,
};

use core::{
    cell::{Cell, RefCell},
    marker::PhantomData,
};
use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

/// SPI peripheral that can change its clock rate at runtime.
///
/// The card has to be woken up at 100-400 kHz and is only sped up once the
/// initialization is done.
pub trait BusClock: Transfer<u8> {
    /// Reconfigures the bus clock to `hz`.
    fn set_clock_rate(&mut self, hz: u32) -> Result<(), <Self as Transfer<u8>>::Error>;
}

/// [`Error`] for a transport and chip select pair.
pub type ErrorFor<Spi, Cs> =
    Error<<Spi as Transfer<u8>>::Error, <Cs as OutputSwitch>::Error>;

/// Command framer over an exclusively owned SPI bus and chip select.
pub(crate) struct Bus<Spi, Cs, Config> {
    spi: RefCell<Spi>,
    cs: RefCell<Cs>,
    clock_hz: Cell<u32>,
    config: PhantomData<Config>,
}

impl<Spi, Cs, Config> Bus<Spi, Cs, Config>
where
    Spi: BusClock,
    Cs: OutputSwitch,
    Config: SdCardConfig,
{
    pub(crate) fn new(spi: Spi, cs: Cs) -> Self {
        Bus {
            spi: RefCell::new(spi),
            cs: RefCell::new(cs),
            clock_hz: Cell::new(0),
            config: PhantomData::<Config>,
        }
    }

    pub(crate) fn into_inner(self) -> (Spi, Cs) {
        (self.spi.into_inner(), self.cs.into_inner())
    }

    /// Last clock rate set through [`Bus::set_clock_rate`], 0 if never set.
    pub(crate) fn clock_rate(&self) -> u32 {
        self.clock_hz.get()
    }

    pub(crate) fn set_clock_rate(&self, hz: u32) -> Result<(), ErrorFor<Spi, Cs>> {
        trace!("SD bus clock: {} Hz", hz);

        self.spi
            .borrow_mut()
            .set_clock_rate(hz)
            .map_err(Error::Transport)?;
        self.clock_hz.set(hz);

        Ok(())
    }

    /// Activate chip select.
    pub(crate) fn select(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        self.cs.borrow_mut().on().map_err(Error::SelectError)
    }

    /// Deactivate chip select.
    pub(crate) fn unselect(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        self.cs.borrow_mut().off().map_err(Error::SelectError)
    }

    /// Deselect the card and give it one byte of clock to let go of MISO.
    pub(crate) fn release(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        self.unselect()?;
        self.send(FILL_BYTE)
    }

    /// CS scope. The card is released on every exit, the error of `f` wins
    /// over an error of the release itself.
    pub(crate) fn cs_scope<F, R>(&self, f: F) -> Result<R, ErrorFor<Spi, Cs>>
    where
        F: FnOnce(&Self) -> Result<R, ErrorFor<Spi, Cs>>,
    {
        let result = self.select().and_then(|_| f(self));
        let released = self.release();
        let value = result?;
        released?;

        Ok(value)
    }

    /// Send one byte and receive one byte.
    pub(crate) fn transfer(&self, data: u8) -> Result<u8, ErrorFor<Spi, Cs>> {
        self.spi
            .borrow_mut()
            .transfer(&mut [data])
            .map(|b| b[0])
            .map_err(Error::Transport)
    }

    /// Receive a byte from the SD card by clocking in an 0xFF byte.
    pub(crate) fn receive(&self) -> Result<u8, ErrorFor<Spi, Cs>> {
        self.transfer(FILL_BYTE)
    }

    /// Send a byte to the SD card.
    pub(crate) fn send(&self, data: u8) -> Result<(), ErrorFor<Spi, Cs>> {
        self.transfer(data).map(|_| ())
    }

    /// Send a slice to the SD card.
    pub(crate) fn send_slice(&self, data: &[u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        for byte in data.iter() {
            self.send(*byte)?;
        }

        Ok(())
    }

    /// Receive a slice from the SD card, clocking out filler bytes.
    pub(crate) fn receive_slice(&self, data: &mut [u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        data.fill(FILL_BYTE);
        self.spi
            .borrow_mut()
            .transfer(data)
            .map(|_| ())
            .map_err(Error::Transport)
    }

    /// Clock `count` filler bytes and drop whatever comes back.
    pub(crate) fn skip_bytes(&self, count: usize) -> Result<(), ErrorFor<Spi, Cs>> {
        for _ in 0..count {
            self.receive()?;
        }

        Ok(())
    }

    /// Wait for token.
    pub(crate) fn wait_for_token<F: Fn(u8) -> bool>(
        &self,
        attempts: usize,
        token_validator: F,
        error: ErrorFor<Spi, Cs>,
    ) -> Result<u8, ErrorFor<Spi, Cs>> {
        for _ in 0..attempts {
            let token = self.receive()?;

            if token_validator(token) {
                return Ok(token);
            }
        }

        Err(error)
    }

    /// Spin while the card holds MISO low.
    pub(crate) fn wait_not_busy(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        self.wait_for_token(
            Config::WRITE_BUSY_ATTEMPTS,
            |token| token != tokens::BUSY,
            Error::TimeoutWaitAvailable,
        )
        .map(|_| ())
    }

    /// Selects the card and sends one command frame.
    ///
    /// Must be followed by [`Bus::await_response`] before the card is
    /// released.
    pub(crate) fn send_command(&self, index: u8, arg: u32) -> Result<CommandFrame, ErrorFor<Spi, Cs>> {
        let frame = CommandFrame::new(index, arg);

        self.select()?;
        self.send_slice(frame.as_bytes())?;

        trace!("SD CMD{} arg: 0x{:08X}", index, arg);

        Ok(frame)
    }

    /// Polls for the status byte of the last command.
    ///
    /// Returns `None` if no valid status byte showed up within
    /// [`SdCardConfig::RESPONSE_ATTEMPTS`] polls; the card is released then.
    pub(crate) fn await_response(
        &self,
        opts: ResponseOpts,
    ) -> Result<Option<R1Response>, ErrorFor<Spi, Cs>> {
        if opts.skip_lead_byte {
            self.skip_bytes(1)?;
        }

        for _ in 0..Config::RESPONSE_ATTEMPTS {
            let r1 = R1Response(self.receive()?);

            if r1.is_valid() {
                self.skip_bytes(opts.extra_bytes)?;

                if opts.release {
                    self.release()?;
                }

                return Ok(Some(r1));
            }
        }

        warn!("SD response timeout");
        self.release()?;

        Ok(None)
    }

    /// Sends a command and polls its status byte.
    pub(crate) fn command(
        &self,
        index: u8,
        arg: u32,
        opts: ResponseOpts,
    ) -> Result<Option<R1Response>, ErrorFor<Spi, Cs>> {
        self.send_command(index, arg)?;
        self.await_response(opts)
    }
}
