//! Retransmission bookkeeping for one DHCPv6 message exchange (RFC 8415 §15).

use std::time::{Duration, Instant};

use rand::Rng;

use crate::dhcp6::TransactionId;
use crate::timer::Timer;

const JITTER_DIVISOR: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterMode {
    /// `[v, 1.1 v]`, for the first Solicit timeout.
    Positive,
    /// `[0.9 v, 1.1 v]`
    Full,
}

/// Applies RFC 8415 randomization to a duration.
pub fn add_jitter(value: Duration, mode: JitterMode) -> Duration {
    let value_ms = value.as_millis().min(u32::MAX as u128) as u64;
    let jitter = value_ms / JITTER_DIVISOR;
    let mut rng = rand::rng();
    let randomized = match mode {
        JitterMode::Positive => value_ms + rng.random_range(0..=jitter),
        JitterMode::Full => value_ms + rng.random_range(0..=2 * jitter) - jitter,
    };
    Duration::from_millis(randomized)
}

fn random_transaction_id() -> TransactionId {
    let mut rng = rand::rng();
    [rng.random(), rng.random(), rng.random()]
}

#[derive(Debug, Clone)]
pub struct RetxTracker {
    transaction_id: TransactionId,
    start_time: Option<Instant>,
    timeout: Duration,
    max_timeout: Option<Duration>,
    count: u16,
    max_count: Option<u16>,
    end_time: Option<Instant>,
    long_elapsed_time: bool,
}

impl Default for RetxTracker {
    fn default() -> Self {
        Self {
            transaction_id: [0; 3],
            start_time: None,
            timeout: Duration::ZERO,
            max_timeout: None,
            count: 0,
            max_count: None,
            end_time: None,
            long_elapsed_time: false,
        }
    }
}

impl RetxTracker {
    /// Begins a new exchange with a fresh transaction id. `max_timeout` of
    /// `None` means unbounded.
    pub fn start(&mut self, now: Instant, initial: Duration, max_timeout: Option<Duration>, mode: JitterMode) {
        let old = self.transaction_id;
        loop {
            self.transaction_id = random_transaction_id();
            if self.transaction_id != old {
                break;
            }
        }

        self.start_time = Some(now);
        self.timeout = add_jitter(initial, mode);
        self.max_timeout = max_timeout;
        self.count = 0;
        self.max_count = None;
        self.end_time = None;
        self.long_elapsed_time = false;
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_max_count(&mut self, max_count: u16) {
        self.max_count = Some(max_count);
    }

    pub fn set_max_timeout(&mut self, max_timeout: Duration) {
        self.max_timeout = Some(max_timeout);
    }

    pub fn set_end_time(&mut self, end_time: Instant) {
        self.end_time = Some(end_time);
    }

    /// True until the first message of the exchange has been followed by
    /// a retransmission.
    pub fn is_first_attempt(&self) -> bool {
        self.count <= 1
    }

    pub fn should_retx(&self, now: Instant) -> bool {
        if let Some(max_count) = self.max_count {
            if self.count > max_count {
                return false;
            }
        }
        if let Some(end_time) = self.end_time {
            if now >= end_time {
                return false;
            }
        }
        true
    }

    /// Arms `timer` for the current timeout, never past the end time.
    pub fn schedule_timeout(&self, timer: &mut Timer, now: Instant) {
        timer.fire_at(now + self.timeout);
        if let Some(end_time) = self.end_time {
            timer.fire_at_if_earlier(end_time);
        }
    }

    /// `RT = RTprev + (RTprev ± 10%)`, capped at a re-jittered maximum.
    pub fn update_timeout_and_count(&mut self) {
        self.timeout += add_jitter(self.timeout, JitterMode::Full);

        if let Some(max_timeout) = self.max_timeout {
            if self.timeout > max_timeout {
                self.timeout = add_jitter(max_timeout, JitterMode::Full);
            }
        }

        self.count = self.count.saturating_add(1);
    }

    /// Elapsed time option value in hundredths of a second. Saturates at
    /// `0xffff` and stays there for the rest of the exchange.
    pub fn elapsed_time(&mut self, now: Instant) -> u16 {
        if self.count == 0 {
            return 0;
        }
        if self.long_elapsed_time {
            return u16::MAX;
        }

        let start = self.start_time.unwrap_or(now);
        let hundredths = now.saturating_duration_since(start).as_millis() / 10;
        let elapsed = hundredths.min(u16::MAX as u128) as u16;
        if elapsed == u16::MAX {
            self.long_elapsed_time = true;
        }
        elapsed
    }
}
