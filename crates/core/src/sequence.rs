//! Global event log positions.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Position of a committed event in the global event log.
///
/// Sequence numbers are assigned by the event store on commit and are:
/// - **strictly increasing**: each committed event gets `previous + 1`
/// - **gap-free**: a contiguous batch of `n` events ending at `h` starts at `h - n + 1`
/// - **1-based**: [`SequenceNumber::none`] (`0`) means "nothing applied yet"
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// The position before the first event.
    pub const fn none() -> Self {
        Self(0)
    }

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// First sequence number of a contiguous batch of `len` events ending at `self`.
    ///
    /// Fails when the batch cannot end at `self` (it would have to start at or
    /// before [`SequenceNumber::none`]).
    pub fn batch_start(self, len: usize) -> Result<Self, CoreError> {
        let len = len as u64;
        if len == 0 {
            return Ok(self.next());
        }
        if len > self.0 {
            return Err(CoreError::validation(format!(
                "a batch of {len} events cannot end at sequence number {}",
                self.0
            )));
        }
        Ok(Self(self.0 - len + 1))
    }
}

impl core::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SequenceNumber> for u64 {
    fn from(value: SequenceNumber) -> Self {
        value.0
    }
}
