// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

use async_trait::async_trait;
use canonical_error::CanonicalError;

/// Abstract bank of N binary output lines.
///
/// `set()` is idempotent and establishes a line's base level. `pulse()`
/// drives the line high, waits, then restores the base level; it returns
/// only after the pulse completes. Overlapping pulses on one line extend the
/// high period, with the most recent pulse performing the restore.
#[async_trait]
pub trait OutputBank {
    fn num_lines(&self) -> usize;

    /// Errors:
    ///   InvalidArgument: `line` is out of range.
    ///   Unavailable: the output driver faulted.
    async fn set(&self, line: usize, level: bool) -> Result<(), CanonicalError>;

    async fn pulse(&self, line: usize, duration: Duration)
                   -> Result<(), CanonicalError>;

    /// Current level of every line, index order.
    async fn read_states(&self) -> Vec<bool>;
}
