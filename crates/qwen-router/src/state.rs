//! Retry and rotation policy
//!
//! Pure transition functions: given the dispatch mode, the classification
//! of a failure and the account's consecutive auth-error count, return the
//! step the router (or stream relay) must take. No I/O happens here.

use provider::ErrorClassification;

/// Consecutive auth errors on one account that trigger rotation.
pub const AUTH_ROTATION_THRESHOLD: u32 = 3;

/// Whether rotation is possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Only the default (unnamed) account exists
    Single,
    /// One or more named accounts, rotated in discovery order
    Multi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationReason {
    QuotaExceeded,
    AuthThreshold,
}

impl RotationReason {
    pub fn label(&self) -> &'static str {
        match self {
            RotationReason::QuotaExceeded => "quota_exceeded",
            RotationReason::AuthThreshold => "auth_threshold",
        }
    }
}

/// What to do after a failed upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Advance to the next account and keep looping
    Rotate(RotationReason),
    /// Refresh this account's token and retry it exactly once
    RefreshAndRetry,
    /// Stop and surface the error
    Abort,
}

pub fn on_failure(mode: Mode, classification: ErrorClassification, consecutive_auth_errors: u32) -> Step {
    match (mode, classification) {
        (Mode::Multi, ErrorClassification::QuotaExceeded) => {
            Step::Rotate(RotationReason::QuotaExceeded)
        }
        (Mode::Multi, ErrorClassification::AuthError)
            if consecutive_auth_errors >= AUTH_ROTATION_THRESHOLD =>
        {
            Step::Rotate(RotationReason::AuthThreshold)
        }
        (_, ErrorClassification::AuthError) => Step::RefreshAndRetry,
        (Mode::Single, ErrorClassification::QuotaExceeded) => Step::Abort,
        (_, ErrorClassification::Timeout | ErrorClassification::Fatal) => Step::Abort,
    }
}

/// What to do when an already-started stream fails. Bytes already sent
/// cannot be retracted, so every outcome ends the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStep {
    /// Refresh silently so the next call gets a fresh token, then end the
    /// stream with an error event
    RefreshForNextCall,
    /// End the stream telling the caller the account will be rotated on the
    /// next call
    RotationRequired,
    /// End the stream with an error event
    Terminate,
}

pub fn on_stream_failure(
    mode: Mode,
    classification: ErrorClassification,
    consecutive_auth_errors: u32,
) -> StreamStep {
    match (mode, classification) {
        (Mode::Multi, ErrorClassification::AuthError)
            if consecutive_auth_errors >= AUTH_ROTATION_THRESHOLD =>
        {
            StreamStep::RotationRequired
        }
        (_, ErrorClassification::AuthError) => StreamStep::RefreshForNextCall,
        _ => StreamStep::Terminate,
    }
}

/// Position in the rotation order for one dispatch.
///
/// Starts at the default account and allows exactly `len` iterations. The
/// index only moves on `advance()`; an in-place retry consumes an iteration
/// without moving.
#[derive(Debug, Clone)]
pub struct Cursor {
    index: usize,
    len: usize,
    iterations: usize,
}

impl Cursor {
    pub fn new(len: usize, start: usize) -> Self {
        Self {
            index: if len == 0 { 0 } else { start % len },
            len,
            iterations: 0,
        }
    }

    /// Begin the next iteration, returning the account index to use, or
    /// `None` once every iteration has been spent.
    pub fn next_iteration(&mut self) -> Option<usize> {
        if self.iterations >= self.len {
            return None;
        }
        self.iterations += 1;
        Some(self.index)
    }

    pub fn advance(&mut self) {
        if self.len > 0 {
            self.index = (self.index + 1) % self.len;
        }
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ErrorClassification::*;

    #[test]
    fn multi_mode_quota_rotates() {
        assert_eq!(
            on_failure(Mode::Multi, QuotaExceeded, 0),
            Step::Rotate(RotationReason::QuotaExceeded)
        );
    }

    #[test]
    fn multi_mode_rotates_on_third_auth_error_only() {
        assert_eq!(on_failure(Mode::Multi, AuthError, 1), Step::RefreshAndRetry);
        assert_eq!(on_failure(Mode::Multi, AuthError, 2), Step::RefreshAndRetry);
        assert_eq!(
            on_failure(Mode::Multi, AuthError, 3),
            Step::Rotate(RotationReason::AuthThreshold)
        );
        assert_eq!(
            on_failure(Mode::Multi, AuthError, 4),
            Step::Rotate(RotationReason::AuthThreshold)
        );
    }

    #[test]
    fn timeout_and_fatal_always_abort() {
        for mode in [Mode::Single, Mode::Multi] {
            assert_eq!(on_failure(mode, Timeout, 0), Step::Abort);
            assert_eq!(on_failure(mode, Fatal, 0), Step::Abort);
        }
    }

    #[test]
    fn single_mode_never_rotates() {
        assert_eq!(on_failure(Mode::Single, AuthError, 5), Step::RefreshAndRetry);
        assert_eq!(on_failure(Mode::Single, QuotaExceeded, 0), Step::Abort);
    }

    #[test]
    fn stream_failures_never_retry() {
        assert_eq!(
            on_stream_failure(Mode::Single, AuthError, 7),
            StreamStep::RefreshForNextCall
        );
        assert_eq!(
            on_stream_failure(Mode::Multi, AuthError, 2),
            StreamStep::RefreshForNextCall
        );
        assert_eq!(
            on_stream_failure(Mode::Multi, AuthError, 3),
            StreamStep::RotationRequired
        );
        assert_eq!(
            on_stream_failure(Mode::Multi, QuotaExceeded, 0),
            StreamStep::Terminate
        );
        assert_eq!(on_stream_failure(Mode::Single, Fatal, 0), StreamStep::Terminate);
    }

    #[test]
    fn cursor_wraps_and_bounds_iterations() {
        let mut cursor = Cursor::new(3, 2);
        assert_eq!(cursor.next_iteration(), Some(2));
        cursor.advance();
        assert_eq!(cursor.next_iteration(), Some(0));
        // in-place retry: no advance
        assert_eq!(cursor.next_iteration(), Some(0));
        assert_eq!(cursor.next_iteration(), None);
        assert_eq!(cursor.iterations(), 3);
    }

    #[test]
    fn empty_cursor_has_no_iterations() {
        let mut cursor = Cursor::new(0, 0);
        assert_eq!(cursor.next_iteration(), None);
    }
}
