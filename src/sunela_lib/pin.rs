/// PIN operations
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use std::time::{Duration, Instant};

use super::error::{Error, Result};

pub const MIN_PIN_LEN: usize = 4;
pub const MAX_PIN_LEN: usize = 8;

pub const PIN_FREE_ATTEMPTS: u32 = 3;

const PIN_WAIT_MIN_S: u64 = 60;
const PIN_WAIT_MAX_S: u64 = 3600;
/// log2(max / min)
const PIN_WAIT_LOG2: u32 = 6;

/// Encode a PIN of 4-8 decimal digits as a u32: start from all-ones and
/// shift one nibble per digit, so length is part of the value.
pub fn pin_encode(s: &str) -> Result<u32> {
    if s.len() < MIN_PIN_LEN || s.len() > MAX_PIN_LEN {
        return Err(Error::InvalidInput("PIN must be 4 to 8 digits"));
    }
    let mut pin: u32 = 0xffffffff;
    for c in s.chars() {
        let d = c
            .to_digit(10)
            .ok_or(Error::InvalidInput("PIN must be decimal digits"))?;
        pin = pin << 4 | d;
    }
    Ok(pin)
}

/// Wait before the next attempt is accepted, in seconds.
pub fn pin_wait_s(attempts: u32) -> u64 {
    if attempts < PIN_FREE_ATTEMPTS {
        0
    } else if attempts > PIN_FREE_ATTEMPTS + PIN_WAIT_LOG2 {
        PIN_WAIT_MAX_S
    } else {
        (PIN_WAIT_MIN_S << (attempts - PIN_FREE_ATTEMPTS)).min(PIN_WAIT_MAX_S)
    }
}

/// Failed-attempt counter with exponentially growing cooldown.
#[derive(Debug, Default)]
pub struct PinGuard {
    attempts: u32,
    cooldown_until: Option<Instant>,
}

impl PinGuard {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn success(&mut self) {
        self.attempts = 0;
        self.cooldown_until = None;
    }

    pub fn fail(&mut self) {
        self.attempts += 1;
        if self.attempts >= PIN_FREE_ATTEMPTS {
            self.cooldown_until =
                Some(Instant::now() + Duration::from_secs(pin_wait_s(self.attempts)));
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn cooldown(&self) -> Duration {
        match self.cooldown_until {
            Some(until) => until.saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// Err(Locked) while the cooldown is running.
    pub fn check(&self) -> Result<()> {
        let left = self.cooldown();
        if left.is_zero() {
            Ok(())
        } else {
            Err(Error::Locked(left.as_secs().max(1)))
        }
    }
}

/// Shuffled digit layout for the on-screen PIN pad.
pub fn pin_shuffle() -> [u8; 10] {
    let mut digits = [0u8, 1, 2, 3, 4, 5, 6, 7, 8, 9];
    digits.shuffle(&mut OsRng);
    digits
}
