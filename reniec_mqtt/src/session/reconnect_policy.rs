// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reconnect policies for a [`Session`](crate::session::Session).

use std::time::Duration;

use rand::Rng;

use crate::error::ConnectionError;

/// Trait defining interface for reconnect policies.
pub trait ReconnectPolicy {
    /// Get the next reconnect delay.
    /// Returns None if no reconnect should be attempted.
    fn next_reconnect_delay(&self, prev_attempts: u32, error: &ConnectionError)
        -> Option<Duration>;
}

/// A reconnect policy that will exponentially backoff the delay between reconnect attempts.
///
/// Delays start at 128ms and grow to the specified max wait time, before applying jitter.
//  Jitter can subtract up to 10% of the delay
#[derive(Clone, Debug)]
pub struct ExponentialBackoffWithJitter {
    /// The longest possible time to wait between reconnect attempts.
    pub max_wait: Duration,
    /// The max number of reconnect attempts before giving up.
    pub max_reconnect_attempts: Option<u32>,
}

impl ExponentialBackoffWithJitter {
    const MIN_EXPONENT: u32 = 7;
    const BASE_DELAY_MS: u64 = 2;

    /// Calculate the delay for the next reconnect attempt.
    fn calculate_delay(&self, prev_attempts: u32) -> Duration {
        let exponent = prev_attempts.saturating_add(Self::MIN_EXPONENT);
        let interval =
            Duration::from_millis(Self::BASE_DELAY_MS.saturating_pow(exponent)).min(self.max_wait);
        let jitter_multiplier = rand::thread_rng().gen_range(0.90..=1.0);
        interval.mul_f64(jitter_multiplier)
    }
}

impl Default for ExponentialBackoffWithJitter {
    /// Indefinite reconnect, with a max wait time of 60 seconds.
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(60),
            max_reconnect_attempts: None,
        }
    }
}

impl ReconnectPolicy for ExponentialBackoffWithJitter {
    fn next_reconnect_delay(
        &self,
        prev_attempts: u32,
        error: &ConnectionError,
    ) -> Option<Duration> {
        // A refused connection will be refused again
        if matches!(error, ConnectionError::ConnectionRefused(_)) {
            return None;
        }
        match self.max_reconnect_attempts {
            Some(max_attempts) if prev_attempts >= max_attempts => None,
            _ => Some(self.calculate_delay(prev_attempts)),
        }
    }
}
