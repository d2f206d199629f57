//! Retry policy for failed snapshot rebuilds.
//!
//! A failed rebuild puts its key straight back on the queue. The policy only
//! decides how many times that happens before the key is dropped; there is
//! no delay between attempts.

use serde::{Deserialize, Serialize};

/// How many times a failing key is re-enqueued.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts per key (0 = infinite)
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Retry forever
    pub fn unbounded() -> Self {
        Self { max_attempts: 0 }
    }

    /// Give up on a key after `attempts` failed rebuilds
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
        }
    }

    /// Whether a key that has failed `attempts` times should be tried again
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }
}
