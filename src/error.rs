//! # Engine Error Kinds
//!
//! This module defines the typed error surface of the test engine and the
//! policy attached to each kind: whether a failure kills the current trial,
//! the whole test, or the process, and which exit code it maps to when the
//! engine is driven from the command line.
//!
//! ## Fatality classes
//!
//! - **Recovered locally**: transient send backpressure and receive timeouts
//!   never surface here; they are retried inside the sender/receiver loops.
//! - **Trial-fatal**: `RateUnderrun` and `Timeout` fail one trial; the
//!   orchestrator records the failure and advances to the next parameter
//!   point.
//! - **Test-fatal**: NIC-level errors (`NicUnavailable`, `PermissionDenied`,
//!   `LinkDown`, `UnknownLineRate`) abort the entire run.
//! - **User-initiated**: `Cancelled` terminates the run but still reports
//!   every trial completed before the cancel point.

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// All error kinds the engine can produce.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration rejected by the validation rules applied at `start`.
    #[error("invalid configuration: {0}")]
    BadConfig(String),

    /// Another run currently owns the engine (the NIC port is exclusive).
    #[error("engine busy: a test run is already active")]
    Busy,

    /// The interface could not be opened or disappeared mid-run.
    #[error("NIC unavailable: {0}")]
    NicUnavailable(String),

    /// Raw-socket access requires CAP_NET_RAW (or root).
    #[error("permission denied opening {0} (raw sockets need CAP_NET_RAW)")]
    PermissionDenied(String),

    /// The interface exists but carrier is down.
    #[error("link down on interface {0}")]
    LinkDown(String),

    /// The driver reported a zero link speed and no explicit rate was given.
    #[error("unknown line rate on {0}: driver reports no speed, set line_rate_bps explicitly")]
    UnknownLineRate(String),

    /// Requested frame size cannot carry the signed probe payload.
    #[error("frame size {0} is below the {1}-byte minimum framed size")]
    FrameTooSmall(usize, usize),

    /// The sender could not sustain the offered rate; distinct from DUT loss.
    #[error("rate underrun: sent {sent} frames, at least {required} required for an admissible trial")]
    RateUnderrun { sent: u64, required: u64 },

    /// A trial exceeded its hard ceiling (duration + warmup + drain + 5 s).
    #[error("trial exceeded its hard ceiling of {0:?}")]
    Timeout(Duration),

    /// The shared cancel token was set.
    #[error("cancelled")]
    Cancelled,

    /// Invariant violation or unexpected I/O failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Trial-fatal errors fail one trial; the test continues with the next
    /// parameter point.
    pub fn is_trial_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::RateUnderrun { .. } | EngineError::Timeout(_)
        )
    }

    /// Test-fatal errors abort the entire run with an error summary.
    pub fn is_test_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::NicUnavailable(_)
                | EngineError::PermissionDenied(_)
                | EngineError::LinkDown(_)
                | EngineError::UnknownLineRate(_)
        )
    }

    /// Process exit code when the engine is invoked as a command.
    ///
    /// 0 success, 2 invalid configuration, 3 NIC error, 4 cancelled,
    /// 5 internal failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::BadConfig(_) | EngineError::Busy => 2,
            EngineError::NicUnavailable(_)
            | EngineError::PermissionDenied(_)
            | EngineError::LinkDown(_)
            | EngineError::UnknownLineRate(_) => 3,
            EngineError::Cancelled => 4,
            _ => 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_classes_are_disjoint() {
        let trial = EngineError::RateUnderrun {
            sent: 1,
            required: 2,
        };
        assert!(trial.is_trial_fatal());
        assert!(!trial.is_test_fatal());

        let test = EngineError::LinkDown("eth0".into());
        assert!(test.is_test_fatal());
        assert!(!test.is_trial_fatal());
    }

    #[test]
    fn exit_codes_follow_the_command_contract() {
        assert_eq!(EngineError::BadConfig("x".into()).exit_code(), 2);
        assert_eq!(EngineError::NicUnavailable("x".into()).exit_code(), 3);
        assert_eq!(EngineError::Cancelled.exit_code(), 4);
        assert_eq!(EngineError::Internal("x".into()).exit_code(), 5);
    }
}
