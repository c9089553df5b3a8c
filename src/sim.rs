//! Simulated SPI-mode SD card for the unit tests.
//!
//! The card answers byte by byte like the real thing: a response shows up
//! after one NCR filler byte, data blocks are framed with tokens and two
//! checksum bytes, writes are followed by a data response and busy bytes.
//! Everything the host clocks is recorded.

use crate::{bus::BusClock, consts::BLOCK_SIZE};

use core::convert::Infallible;
use embedded_hal::blocking::{delay::DelayMs, spi::Transfer};
use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    rc::Rc,
    vec::Vec,
};
use switch_hal::OutputSwitch;

const FILL: u8 = 0xFF;
const R1_IDLE: u8 = 0x01;
const R1_ILLEGAL: u8 = 0x04;
const R1_ADDRESS_ERROR: u8 = 0x20;
const R1_PARAMETER_ERROR: u8 = 0x40;
const DATA_ACCEPTED: u8 = 0xE5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Absent,
    V1,
    V2,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Command,
    ReadMulti { next: u32 },
    Write { multi: bool, next: u32 },
}

struct State {
    kind: Kind,
    block_count: u32,
    blocks: BTreeMap<u32, [u8; BLOCK_SIZE]>,
    csd: [u8; 16],

    selected: bool,
    idle: bool,
    app_cmd: bool,
    mode: Mode,
    frame: Vec<u8>,
    miso: VecDeque<u8>,
    rx: Option<Vec<u8>>,
    stuck_busy: bool,

    cmd0_status: u8,
    op_cond_rounds: usize,
    never_ready: bool,
    reject_block_len: bool,
    write_response: u8,
    busy_bytes: usize,
    busy_forever: bool,
    withhold_data: bool,
    read_lead: Vec<u8>,
    forced: Option<(u8, u8)>,

    exchanged: usize,
    mosi: Vec<u8>,
    commands: Vec<(u8, u32)>,
    clocks: Vec<u32>,
    selects: usize,
    delay_ms: u32,
}

impl State {
    fn new(kind: Kind, block_count: u32, csd: [u8; 16]) -> Self {
        State {
            kind,
            block_count,
            blocks: BTreeMap::new(),
            csd,
            selected: false,
            idle: false,
            app_cmd: false,
            mode: Mode::Command,
            frame: Vec::new(),
            miso: VecDeque::new(),
            rx: None,
            stuck_busy: false,
            cmd0_status: R1_IDLE,
            op_cond_rounds: 2,
            never_ready: false,
            reject_block_len: false,
            write_response: DATA_ACCEPTED,
            busy_bytes: 3,
            busy_forever: false,
            withhold_data: false,
            read_lead: Vec::new(),
            forced: None,
            exchanged: 0,
            mosi: Vec::new(),
            commands: Vec::new(),
            clocks: Vec::new(),
            selects: 0,
            delay_ms: 0,
        }
    }

    fn idle_bit(&self) -> u8 {
        if self.idle {
            R1_IDLE
        } else {
            0
        }
    }

    fn r1(&mut self, status: u8) {
        self.miso.extend([FILL, status]);
    }

    fn pop(&mut self) -> u8 {
        match self.miso.pop_front() {
            Some(byte) => byte,
            None if self.stuck_busy => 0x00,
            None => FILL,
        }
    }

    /// Byte address for version 1 cards, block address otherwise.
    fn block_of(&self, arg: u32) -> Option<u32> {
        let block = match self.kind {
            Kind::V1 if arg % BLOCK_SIZE as u32 != 0 => return None,
            Kind::V1 => arg / BLOCK_SIZE as u32,
            _ => arg,
        };

        (block < self.block_count).then_some(block)
    }

    fn queue_block(&mut self, block: u32) {
        if self.withhold_data || block >= self.block_count {
            return;
        }

        let data = self.blocks.get(&block).copied().unwrap_or([0; BLOCK_SIZE]);
        self.miso.extend([FILL, FILL]);
        self.miso.extend(self.read_lead.iter().copied());
        self.miso.push_back(0xFE);
        self.miso.extend(data);
        self.miso.extend([0x12, 0x34]);
    }

    fn exchange(&mut self, mosi: u8) -> u8 {
        self.exchanged += 1;
        self.mosi.push(mosi);

        if !self.selected || self.kind == Kind::Absent {
            return FILL;
        }

        if let Mode::Write { multi, next } = self.mode {
            return self.write_byte(multi, next, mosi);
        }

        if !self.frame.is_empty() || (mosi & 0xC0) == 0x40 {
            let out = self.pop();
            self.frame.push(mosi);
            if self.frame.len() == 6 {
                let frame = core::mem::take(&mut self.frame);
                self.handle(&frame);
            }
            return out;
        }

        if self.miso.is_empty() {
            if let Mode::ReadMulti { next } = self.mode {
                self.queue_block(next);
                self.mode = Mode::ReadMulti { next: next + 1 };
            }
        }

        self.pop()
    }

    fn write_byte(&mut self, multi: bool, next: u32, mosi: u8) -> u8 {
        if let Some(rx) = self.rx.as_mut() {
            rx.push(mosi);
            if rx.len() == BLOCK_SIZE + 2 {
                let rx = self.rx.take().unwrap_or_default();
                self.finish_block(multi, next, &rx[..BLOCK_SIZE]);
            }
            return FILL;
        }

        match mosi {
            0xFE if !multi => self.rx = Some(Vec::new()),
            0xFC if multi => self.rx = Some(Vec::new()),
            0xFD if multi => {
                self.mode = Mode::Command;
                self.miso.push_back(FILL);
                self.miso.extend(core::iter::repeat(0x00).take(self.busy_bytes));
            }
            _ => return self.pop(),
        }

        FILL
    }

    fn finish_block(&mut self, multi: bool, next: u32, data: &[u8]) {
        self.miso.push_back(self.write_response);

        if (self.write_response & 0x1F) != 0x05 {
            self.mode = Mode::Command;
            return;
        }

        let mut block = [0; BLOCK_SIZE];
        block.copy_from_slice(data);
        self.blocks.insert(next, block);

        self.miso.extend(core::iter::repeat(0x00).take(self.busy_bytes));
        self.stuck_busy = self.busy_forever;
        self.mode = if multi {
            Mode::Write {
                multi,
                next: next + 1,
            }
        } else {
            Mode::Command
        };
    }

    fn handle(&mut self, frame: &[u8]) {
        let index = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let app_cmd = core::mem::take(&mut self.app_cmd);

        self.commands.push((index, arg));
        self.miso.clear();

        if let Some((forced, status)) = self.forced {
            if forced == index {
                self.r1(status);
                return;
            }
        }

        match index {
            0 => {
                self.idle = true;
                self.mode = Mode::Command;
                self.r1(self.cmd0_status);
            }
            8 => match self.kind {
                Kind::V2 => {
                    self.r1(self.idle_bit());
                    self.miso.extend([0x00, 0x00, 0x01, (arg & 0xFF) as u8]);
                }
                Kind::V1 => self.r1(self.idle_bit() | R1_ILLEGAL),
                _ => self.r1(0x09),
            },
            55 => {
                self.app_cmd = true;
                self.r1(self.idle_bit());
            }
            41 if app_cmd => {
                if self.never_ready || self.op_cond_rounds > 0 {
                    self.op_cond_rounds = self.op_cond_rounds.saturating_sub(1);
                    self.r1(R1_IDLE);
                } else {
                    self.idle = false;
                    self.r1(0x00);
                }
            }
            58 => {
                self.r1(self.idle_bit());
                let ocr0 = match (self.idle, self.kind) {
                    (true, _) => 0x00,
                    (false, Kind::V2) => 0xC0,
                    (false, _) => 0x80,
                };
                self.miso.extend([ocr0, 0xFF, 0x80, 0x00]);
            }
            9 => {
                self.r1(0x00);
                self.miso.extend([FILL, 0xFE]);
                let csd = self.csd;
                self.miso.extend(csd);
                self.miso.extend([FILL, FILL]);
            }
            16 if arg == BLOCK_SIZE as u32 && !self.reject_block_len => self.r1(0x00),
            16 => self.r1(R1_PARAMETER_ERROR),
            12 => {
                self.mode = Mode::Command;
                self.miso.push_back(FILL);
                self.r1(0x00);
            }
            17 | 18 | 24 | 25 => match self.block_of(arg) {
                None => self.r1(R1_ADDRESS_ERROR),
                Some(block) => {
                    self.r1(0x00);
                    match index {
                        17 => self.queue_block(block),
                        18 => self.mode = Mode::ReadMulti { next: block },
                        24 => {
                            self.mode = Mode::Write {
                                multi: false,
                                next: block,
                            }
                        }
                        _ => {
                            self.mode = Mode::Write {
                                multi: true,
                                next: block,
                            }
                        }
                    }
                }
            },
            _ => self.r1(self.idle_bit() | R1_ILLEGAL),
        }
    }
}

/// Handle to the simulated card; clones share the card.
#[derive(Clone)]
pub struct SimCard(Rc<RefCell<State>>);

impl SimCard {
    fn with_state(state: State) -> Self {
        SimCard(Rc::new(RefCell::new(state)))
    }

    /// Version 2 high capacity card; `block_count` must be a multiple of 1024.
    pub fn sdhc(block_count: u32) -> Self {
        let c_size = block_count / 1024 - 1;
        let mut csd = [0; 16];
        csd[0] = 0x40;
        csd[5] = 0x59;
        csd[7] = ((c_size >> 16) & 0x3F) as u8;
        csd[8] = (c_size >> 8) as u8;
        csd[9] = c_size as u8;
        Self::with_state(State::new(Kind::V2, block_count, csd))
    }

    /// Version 1 standard capacity card; `block_count` must be a multiple of 512.
    ///
    /// Above 1GB the CSD reports 1024-byte blocks like real 2GB cards do.
    pub fn v1(block_count: u32) -> Self {
        let (read_bl_len, units) = if block_count > 4096 << 9 {
            (10, block_count / 1024)
        } else {
            (9, block_count / 512)
        };
        let c_size = units - 1;
        let c_size_mult = 7;
        let mut csd = [0; 16];
        csd[5] = 0x50 | read_bl_len;
        csd[6] = ((c_size >> 10) & 0x03) as u8;
        csd[7] = (c_size >> 2) as u8;
        csd[8] = ((c_size & 0x03) << 6) as u8;
        csd[9] = (c_size_mult >> 1) & 0x03;
        csd[10] = (c_size_mult & 0x01) << 7;
        Self::with_state(State::new(Kind::V1, block_count, csd))
    }

    /// Nothing on the bus, MISO stays high.
    pub fn absent() -> Self {
        Self::with_state(State::new(Kind::Absent, 0, [0; 16]))
    }

    /// Card that answers CMD8 with a status nobody knows.
    pub fn unknown() -> Self {
        Self::with_state(State::new(Kind::Unknown, 0, [0; 16]))
    }

    fn update(self, f: impl FnOnce(&mut State)) -> Self {
        f(&mut self.0.borrow_mut());
        self
    }

    pub fn with_csd(self, csd: [u8; 16]) -> Self {
        self.update(|s| s.csd = csd)
    }

    pub fn with_cmd0_status(self, status: u8) -> Self {
        self.update(|s| s.cmd0_status = status)
    }

    pub fn with_op_cond_rounds(self, rounds: usize) -> Self {
        self.update(|s| s.op_cond_rounds = rounds)
    }

    pub fn never_ready(self) -> Self {
        self.update(|s| s.never_ready = true)
    }

    pub fn reject_block_len(self) -> Self {
        self.update(|s| s.reject_block_len = true)
    }

    pub fn fail_command(&self, index: u8, status: u8) {
        self.0.borrow_mut().forced = Some((index, status));
    }

    pub fn set_write_response(&self, response: u8) {
        self.0.borrow_mut().write_response = response;
    }

    pub fn set_busy_forever(&self) {
        self.0.borrow_mut().busy_forever = true;
    }

    pub fn set_withhold_data(&self) {
        self.0.borrow_mut().withhold_data = true;
    }

    /// Bytes sent between the NAC fillers and the data start token.
    pub fn set_read_lead(&self, bytes: &[u8]) {
        self.0.borrow_mut().read_lead = bytes.to_vec();
    }

    pub fn spi(&self) -> SimSpi {
        SimSpi(self.0.clone())
    }

    pub fn cs(&self) -> SimCs {
        SimCs(self.0.clone())
    }

    pub fn delay(&self) -> SimDelay {
        SimDelay(self.0.clone())
    }

    pub fn selected(&self) -> bool {
        self.0.borrow().selected
    }

    pub fn exchanged(&self) -> usize {
        self.0.borrow().exchanged
    }

    pub fn mosi_log(&self) -> Vec<u8> {
        self.0.borrow().mosi.clone()
    }

    /// Indices of the commands received, in order.
    pub fn commands(&self) -> Vec<u8> {
        self.0.borrow().commands.iter().map(|(index, _)| *index).collect()
    }

    pub fn command_log(&self) -> Vec<(u8, u32)> {
        self.0.borrow().commands.clone()
    }

    pub fn clock_history(&self) -> Vec<u32> {
        self.0.borrow().clocks.clone()
    }

    /// Card is still in a multiple block read.
    pub fn streaming(&self) -> bool {
        matches!(self.0.borrow().mode, Mode::ReadMulti { .. })
    }

    pub fn selects(&self) -> usize {
        self.0.borrow().selects
    }

    pub fn delay_ms(&self) -> u32 {
        self.0.borrow().delay_ms
    }

    pub fn block(&self, block: u32) -> [u8; BLOCK_SIZE] {
        self.0
            .borrow()
            .blocks
            .get(&block)
            .copied()
            .unwrap_or([0; BLOCK_SIZE])
    }

    pub fn set_block(&self, block: u32, data: [u8; BLOCK_SIZE]) {
        self.0.borrow_mut().blocks.insert(block, data);
    }

    /// Clears the byte, selection and command logs.
    pub fn reset_counters(&self) {
        let mut state = self.0.borrow_mut();
        state.exchanged = 0;
        state.selects = 0;
        state.mosi.clear();
        state.commands.clear();
    }
}

pub struct SimSpi(Rc<RefCell<State>>);

impl Transfer<u8> for SimSpi {
    type Error = Infallible;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        let mut state = self.0.borrow_mut();
        for word in words.iter_mut() {
            *word = state.exchange(*word);
        }

        Ok(words)
    }
}

impl BusClock for SimSpi {
    fn set_clock_rate(&mut self, hz: u32) -> Result<(), Infallible> {
        self.0.borrow_mut().clocks.push(hz);
        Ok(())
    }
}

pub struct SimCs(Rc<RefCell<State>>);

impl OutputSwitch for SimCs {
    type Error = Infallible;

    fn on(&mut self) -> Result<(), Self::Error> {
        let mut state = self.0.borrow_mut();
        if !state.selected {
            state.selects += 1;
        }
        state.selected = true;
        Ok(())
    }

    fn off(&mut self) -> Result<(), Self::Error> {
        let mut state = self.0.borrow_mut();
        state.selected = false;
        state.frame.clear();
        state.miso.clear();
        state.rx = None;
        state.stuck_busy = false;
        // a read stream keeps going until CMD12
        if let Mode::Write { .. } = state.mode {
            state.mode = Mode::Command;
        }
        Ok(())
    }
}

pub struct SimDelay(Rc<RefCell<State>>);

impl DelayMs<u32> for SimDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.0.borrow_mut().delay_ms += ms;
    }
}

/// Block filled with a pattern derived from `seed`.
pub fn pattern(seed: u8) -> [u8; BLOCK_SIZE] {
    let mut block = [0; BLOCK_SIZE];
    for (i, byte) in block.iter_mut().enumerate() {
        *byte = seed.wrapping_mul(31).wrapping_add(i as u8);
    }
    block
}
