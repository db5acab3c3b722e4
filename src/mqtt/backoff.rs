//! Exponential backoff with full jitter.
//!
//! Each delay is drawn uniformly from `0..=jitter_max`, where `jitter_max`
//! starts at the base delay and doubles after every attempt until it
//! reaches the cap.  After `max_attempts` delays the sequence is exhausted.

use core::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::config::AgentConfig;

pub struct Backoff {
    base_ms: u32,
    max_ms: u32,
    max_attempts: u8,
    attempts: u8,
    jitter_max_ms: u32,
    rng: SmallRng,
}

impl Backoff {
    pub fn new(base_ms: u32, max_ms: u32, max_attempts: u8, seed: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            max_attempts,
            attempts: 0,
            jitter_max_ms: base_ms,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub fn from_config(cfg: &AgentConfig, seed: u64) -> Self {
        Self::new(
            cfg.backoff_base_ms,
            cfg.backoff_max_ms,
            cfg.max_connect_attempts,
            seed,
        )
    }

    /// Next delay, or `None` once every attempt has been used.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        let delay = self.rng.gen_range(0..=self.jitter_max_ms);
        self.jitter_max_ms = self.jitter_max_ms.saturating_mul(2).min(self.max_ms);
        Some(Duration::from_millis(u64::from(delay)))
    }

    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.jitter_max_ms = self.base_ms;
    }
}
