//! GENA event sequence numbers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GenaError;

/// Unsigned 32-bit event counter that wraps to 0 after `u32::MAX`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EventSequence(u32);

impl EventSequence {
    pub const ZERO: EventSequence = EventSequence(0);

    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// The number that follows this one.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    pub fn increment(&mut self) {
        *self = self.next();
    }
}

impl From<u32> for EventSequence {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for EventSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventSequence {
    type Err = GenaError;

    /// Parse a `SEQ` header value.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map(Self)
            .map_err(|_| GenaError::InvalidSequence(s.to_string()))
    }
}

/// Result of comparing an incoming sequence with the last one observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Exactly the expected successor
    InOrder,
    /// Ahead of the expected successor by `missed` numbers
    Gap { missed: u32 },
    /// Behind the expected successor; a duplicate or late message
    Stale { expected: EventSequence },
}

impl SequenceCheck {
    /// Classify `incoming` given the `last` sequence seen.
    pub fn evaluate(last: EventSequence, incoming: EventSequence) -> Self {
        let expected = last.next();
        if incoming == expected {
            SequenceCheck::InOrder
        } else if incoming.value() > expected.value() {
            SequenceCheck::Gap {
                missed: incoming.value() - expected.value(),
            }
        } else {
            SequenceCheck::Stale { expected }
        }
    }
}
