/// Represents config for [`SdCard`](crate::SdCard).
///
/// All retry budgets are iteration counts, not wall-clock deadlines, so the
/// real elapsed time scales with the bus clock.
pub trait SdCardConfig {
    /// Max bytes polled while waiting for a status byte (R1).
    const RESPONSE_ATTEMPTS: usize;
    /// Max attempts to reach the idle state with GO_IDLE_STATE.
    const GO_IDLE_ATTEMPTS: usize;
    /// Max iterations of the ACMD41 negotiation loop.
    const INIT_ATTEMPTS: usize;
    /// Max bytes polled while waiting for a data start token.
    const DATA_TOKEN_ATTEMPTS: usize;
    /// Max bytes polled while the card signals busy after a write.
    const WRITE_BUSY_ATTEMPTS: usize;
    /// Filler bytes clocked with the card deselected after power-up.
    const WAKE_UP_BYTES: usize;
    /// Bus clock during initialization, in Hz.
    const INIT_CLOCK_HZ: u32;
    /// Bus clock after a successful initialization, in Hz.
    const OPERATING_CLOCK_HZ: u32;
    /// Pause between OCR negotiation rounds of a version 2 card, in ms.
    const OP_COND_POLL_DELAY_MS: u32;
}

/// Default implementation of [`SdCardConfig`](crate::SdCardConfig).
pub struct DefaultSdCardConfig;

impl SdCardConfig for DefaultSdCardConfig {
    const RESPONSE_ATTEMPTS: usize = 1000;
    const GO_IDLE_ATTEMPTS: usize = 5;
    const INIT_ATTEMPTS: usize = 1000;
    const DATA_TOKEN_ATTEMPTS: usize = 1000;
    const WRITE_BUSY_ATTEMPTS: usize = 500_000;
    const WAKE_UP_BYTES: usize = 16;
    const INIT_CLOCK_HZ: u32 = 100_000;
    const OPERATING_CLOCK_HZ: u32 = 500_000;
    const OP_COND_POLL_DELAY_MS: u32 = 50;
}
