// Monotone sequence-number guard. Every mutating command from a client
// carries a sequence number one greater than the last one the engine
// accepted; replay and full-sync paths bypass the guard and set it directly.

use crate::error::{KvError, Result};
use std::sync::atomic::{AtomicU64, Ordering};

pub struct SequenceGuard {
    last_accepted: AtomicU64,
}

impl SequenceGuard {
    pub fn new(starting_at: u64) -> Self {
        Self {
            last_accepted: AtomicU64::new(starting_at),
        }
    }

    /// Accepts `seq` only if it is exactly one more than the last accepted
    /// value, advancing the guard on success.
    pub fn validate_and_advance(&self, seq: u64) -> Result<()> {
        self.check(seq)?;
        self.advance(seq);
        Ok(())
    }

    /// The sequence number that would be accepted next.
    pub fn expected(&self) -> u64 {
        self.last_accepted.load(Ordering::SeqCst) + 1
    }

    /// Checks `seq` against the expected next value without consuming it.
    /// Callers that must do work between validating and committing (CPut's
    /// read-compare step) use this, then call `advance` only once that work
    /// has succeeded - a failed compare must not burn the sequence number.
    pub fn check(&self, seq: u64) -> Result<()> {
        let expected = self.expected();
        if seq != expected {
            return Err(KvError::Sequence { expected, got: seq });
        }
        Ok(())
    }

    /// Unconditionally advances the guard to `seq`. Callers must have
    /// already validated `seq` via `check`.
    pub fn advance(&self, seq: u64) {
        self.last_accepted.store(seq, Ordering::SeqCst);
    }

    pub fn reset(&self, value: u64) {
        self.last_accepted.store(value, Ordering::SeqCst);
    }

    pub fn current(&self) -> u64 {
        self.last_accepted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_strictly_next_sequence() {
        let guard = SequenceGuard::new(0);
        guard.validate_and_advance(1).unwrap();
        guard.validate_and_advance(2).unwrap();
        assert_eq!(guard.current(), 2);
    }

    #[test]
    fn rejects_out_of_order_sequence() {
        let guard = SequenceGuard::new(5);
        let err = guard.validate_and_advance(5).unwrap_err();
        assert!(matches!(
            err,
            KvError::Sequence { expected: 6, got: 5 }
        ));
    }

    #[test]
    fn reset_repoints_the_expected_next_value() {
        let guard = SequenceGuard::new(10);
        guard.reset(0);
        guard.validate_and_advance(1).unwrap();
    }
}
