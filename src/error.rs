//! The driver's error taxonomy.
//!
//! Every failure that can come out of a `run_stmt`, `cancel_last`, or query
//! round-trip is represented here instead of as an ad hoc string.  Each
//! variant carries the sentence text that provoked it (where one exists) so
//! callers can log or retry without re-threading context through the call
//! stack.
//!
//! This module intentionally does not pull in `thiserror`: the enum is small
//! and stable enough that a hand-written `Display`/`Error` impl is no more
//! work, and it keeps the dependency graph the same shape as the crate this
//! one grew out of.

use std::fmt;
use std::io;

/// Whether an error leaves the session usable, or forces a full reset+replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recoverability {
    /// The prover is still alive and the mirror is still trustworthy; the
    /// caller may retry or issue `cancel_failed` and continue.
    Recoverable,
    /// The prover must be assumed dead or permanently confused; only a full
    /// reset and command-log replay can restore a usable session.
    Unrecoverable,
}

/// The complete error taxonomy for the driver.
///
/// `#[non_exhaustive]` because new `CoqExn` sub-classifications are expected
/// as the prover's error text is observed in the wild.
#[derive(Debug)]
#[non_exhaustive]
pub enum DriverError {
    /// `Stream.Error`, `Syntax error`, `CLexer.Error`, `Invalid_argument`.
    Parse { statement: String, message: String },
    /// `NoSuchGoals`.
    NoSuchGoal { statement: String, message: String },
    /// `Unable to unify`, `CErrors.UserError`, `ExplainErr.EvaluatedError`.
    Unification { statement: String, message: String },
    /// An identifier matched `identifier .* is reserved`.
    ReservedIdentifier { statement: String, message: String },
    /// `Overflowed` or a literal `Stack overflow`. Unrecoverable.
    Overflow { statement: String, message: String },
    /// `Anomaly`. Unrecoverable.
    Anomaly { statement: String, message: String },
    /// No response within the configured timeout, even after two interrupts.
    /// Unrecoverable.
    Timeout { statement: String },
    /// The writer half observed `EPIPE` or the reader thread's channel hung
    /// up. Unrecoverable.
    BrokenPipe(io::Error),
    /// The classifier could not match an inbound message against any known
    /// shape.
    BadResponse { raw: String },
    /// Filesystem-level failure: prelude discovery, the outgoing-message
    /// transcript, or loading a source file.
    Io(io::Error),
    /// A configuration value failed validation before the child process was
    /// ever spawned.
    InvalidConfig { message: String },
}

impl DriverError {
    /// Does this error admit a `cancel_failed`/retry, or does it
    /// demand the reset+replay path?
    pub fn recoverability(&self) -> Recoverability {
        use DriverError::*;
        match self {
            Overflow { .. } | Anomaly { .. } | Timeout { .. } | BrokenPipe(_) | BadResponse { .. } => {
                Recoverability::Unrecoverable
            }
            Parse { .. }
            | NoSuchGoal { .. }
            | Unification { .. }
            | ReservedIdentifier { .. }
            | Io(_)
            | InvalidConfig { .. } => Recoverability::Recoverable,
        }
    }

    /// The offending statement text, if this error is attributable to one.
    pub fn statement(&self) -> Option<&str> {
        use DriverError::*;
        match self {
            Parse { statement, .. }
            | NoSuchGoal { statement, .. }
            | Unification { statement, .. }
            | ReservedIdentifier { statement, .. }
            | Overflow { statement, .. }
            | Anomaly { statement, .. }
            | Timeout { statement } => Some(statement),
            BrokenPipe(_) | BadResponse { .. } | Io(_) | InvalidConfig { .. } => None,
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use DriverError::*;
        match self {
            Parse { statement, message } => {
                write!(f, "parse error in `{}`: {}", statement, message)
            }
            NoSuchGoal { statement, message } => {
                write!(f, "no such goal after `{}`: {}", statement, message)
            }
            Unification { statement, message } => {
                write!(f, "unification error in `{}`: {}", statement, message)
            }
            ReservedIdentifier { statement, message } => {
                write!(f, "reserved identifier in `{}`: {}", statement, message)
            }
            Overflow { statement, message } => {
                write!(f, "overflow in `{}`: {}", statement, message)
            }
            Anomaly { statement, message } => {
                write!(f, "prover anomaly in `{}`: {}", statement, message)
            }
            Timeout { statement } => write!(f, "timed out waiting for a response to `{}`", statement),
            BrokenPipe(e) => write!(f, "broken pipe to prover subprocess: {}", e),
            BadResponse { raw } => write!(f, "unrecognized message from prover: {}", raw),
            Io(e) => write!(f, "io error: {}", e),
            InvalidConfig { message } => write!(f, "invalid configuration: {}", message),
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DriverError::BrokenPipe(e) | DriverError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DriverError {
    fn from(e: io::Error) -> Self {
        DriverError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_and_anomaly_are_unrecoverable() {
        let e = DriverError::Overflow {
            statement: "foo.".into(),
            message: "Stack overflow".into(),
        };
        assert_eq!(e.recoverability(), Recoverability::Unrecoverable);
        let e = DriverError::Anomaly {
            statement: "foo.".into(),
            message: "Anomaly".into(),
        };
        assert_eq!(e.recoverability(), Recoverability::Unrecoverable);
    }

    #[test]
    fn unification_is_recoverable_and_carries_statement() {
        let e = DriverError::Unification {
            statement: "apply nonsense.".into(),
            message: "Unable to unify".into(),
        };
        assert_eq!(e.recoverability(), Recoverability::Recoverable);
        assert_eq!(e.statement(), Some("apply nonsense."));
    }

    #[test]
    fn bad_response_carries_no_statement() {
        let e = DriverError::BadResponse { raw: "(Weird)".into() };
        assert_eq!(e.statement(), None);
    }
}
