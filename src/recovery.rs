//! The cancellation and recovery controller.
//!
//! Everything here operates on an already-constructed [`crate::driver::Driver`]
//! and is concerned purely with keeping the mirror consistent with the
//! prover after a partial failure: a single cancel, the idempotent
//! "did the last command actually land" recovery call issued after a failed
//! `run_stmt`, and the full kill-reinitialize-replay path for unrecoverable
//! failures.

use crate::classifier::{ClassifiedMessage, ExnKind};
use crate::driver::Driver;
use crate::error::DriverError;
use crate::mirror::CommandLogEntry;

/// Turn a classified `CoqExn` into the corresponding typed error.
pub(crate) fn exn_to_error(kind: ExnKind, statement: String, message: String) -> DriverError {
    match kind {
        ExnKind::Parse => DriverError::Parse { statement, message },
        ExnKind::NoSuchGoal => DriverError::NoSuchGoal { statement, message },
        ExnKind::NotFound => DriverError::Parse { statement, message },
        ExnKind::Overflow => DriverError::Overflow { statement, message },
        ExnKind::Anomaly => DriverError::Anomaly { statement, message },
        ExnKind::ReservedIdentifier => DriverError::ReservedIdentifier { statement, message },
        ExnKind::Unification => DriverError::Unification { statement, message },
        ExnKind::Other => DriverError::Unification { statement, message },
    }
}

/// Cancel the last accepted statement and roll the mirror back to its
/// pre-statement state.
pub fn cancel_last(driver: &mut Driver) -> Result<(), DriverError> {
    driver.drain_residual_messages();

    let cancelled_state = match driver.mirror.cur_state {
        Some(sid) => sid,
        None => return Ok(()),
    };
    let ctx_before = driver.mirror.proof_context.clone();

    driver.send_line(&format!("(Cancel ({}))", cancelled_state.0))?;

    // One Feedback carrying the rolled-back id, then the Canceled answer,
    // then Completed.
    loop {
        match driver.recv_classified("<cancel>")? {
            ClassifiedMessage::Ack | ClassifiedMessage::Feedback { .. } => continue,
            ClassifiedMessage::Canceled(new_state) => {
                driver.mirror.cur_state = Some(new_state);
                break;
            }
            ClassifiedMessage::CoqExn { kind, messages, .. } => {
                return Err(exn_to_error(kind, "<cancel>".to_string(), messages));
            }
            other => return Err(DriverError::BadResponse { raw: format!("{:?}", other) }),
        }
    }
    driver.drain_completed("<cancel>")?;

    driver.refresh_proof_context_into_mirror()?;

    if let Some(history) = driver.mirror.tactic_history.as_mut() {
        let last_matches = history.last_tactic_state() == Some(cancelled_state);
        if last_matches || history_top_is_subgoal(history) {
            let fg_before = ctx_before.map(|c| c.fg).unwrap_or_default();
            history.remove_last(fg_before);
        }
    }

    driver.mirror.command_history.trim_if_matches(cancelled_state);
    Ok(())
}

fn history_top_is_subgoal(history: &crate::mirror::TacticHistory) -> bool {
    // A brace close/open is rolled back even though it has no state id of
    // its own attached to a tactic entry; remove_last is safe to call
    // whenever the history is non-empty, so the caller only needs to avoid
    // calling it on an empty history.
    !history.is_empty() && history.last_tactic_state().is_none()
}

/// Idempotent recovery call issued after a failed `run_stmt`: a no-op if the
/// command log's last entry is already accepted at `cur_state`; otherwise
/// runs the same sequence as `cancel_last`.
pub fn cancel_failed(driver: &mut Driver) -> Result<(), DriverError> {
    let already_consistent = match (driver.mirror.command_history.last(), driver.mirror.cur_state) {
        (Some(CommandLogEntry { accepted: true, state_id: Some(sid), .. }), Some(cur)) => *sid == cur,
        _ => false,
    };
    if already_consistent {
        return Ok(());
    }

    match cancel_last(driver) {
        Ok(()) => Ok(()),
        Err(e) if driver.options_reset_on_cancel_fail() => {
            reset_and_replay(driver)?;
            Err(e)
        }
        Err(e) => Err(e),
    }
}

/// Kill the child, reinitialize the mirror and transport, and replay every
/// accepted command-log entry. Used when cancellation itself fails (with
/// `reset_on_cancel_fail` set), the pipe is broken, or an unrecoverable
/// `CoqExn` (overflow, anomaly) is observed.
pub fn reset_and_replay(driver: &mut Driver) -> Result<(), DriverError> {
    log::warn!("resetting prover session after an unrecoverable failure");
    let replay_log: Vec<CommandLogEntry> = driver.mirror.command_history.accepted().cloned().collect();

    driver.reinitialize_transport()?;
    driver.mirror = crate::mirror::Mirror::new();
    driver.bump_reset_count();

    for entry in replay_log {
        // Errors during replay are logged but do not abort the overall
        // reset: the goal is to get back as much of the prior session as
        // possible, not to guarantee the replay is itself infallible.
        if let Err(e) = driver.run_stmt_internal(&entry.text) {
            log::error!("replay of `{}` failed during reset: {}", entry.text, e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverOptions;
    use crate::transport::ScriptedTransport;
    use std::time::Duration;

    fn opts() -> DriverOptions {
        let dir = tempfile::tempdir().unwrap();
        // leak the tempdir for the duration of the test process; fine in tests
        let path = dir.into_path();
        DriverOptions { project_path: path, timeout: Duration::from_millis(50), ..DriverOptions::default() }
    }

    #[test]
    fn cancel_last_is_noop_without_a_current_state() {
        let transport = ScriptedTransport::new(vec![]);
        let mut driver = Driver::for_test(opts(), Box::new(transport));
        assert!(cancel_last(&mut driver).is_ok());
    }

    #[test]
    fn cancel_last_sends_cancel_and_rolls_back_cur_state() {
        let t = ScriptedTransport::new(vec![
            vec!["(Answer 0 (Added 2 () ()))", "(Answer 0 Completed)"],
            vec!["(Answer 0 Completed)"],
            vec!["(Answer 0 (Canceled (1)))", "(Answer 0 Completed)"],
        ]);
        let mut driver = Driver::for_test(opts(), Box::new(t));
        driver.run_stmt_internal("Definition x := 1.").unwrap();
        assert_eq!(driver.mirror.cur_state, Some(crate::mirror::StateId(2)));

        cancel_last(&mut driver).unwrap();
        assert_eq!(driver.mirror.cur_state, Some(crate::mirror::StateId(1)));
        assert!(driver.mirror.command_history.is_empty());
    }

    #[test]
    fn cancel_failed_is_a_noop_when_already_consistent() {
        let t = ScriptedTransport::new(vec![vec!["(Answer 0 (Added 2 () ()))", "(Answer 0 Completed)"], vec![
            "(Answer 0 Completed)",
        ]]);
        let mut driver = Driver::for_test(opts(), Box::new(t));
        driver.run_stmt_internal("Definition x := 1.").unwrap();
        cancel_failed(&mut driver).unwrap();
        // already consistent: no further Cancel round trip was attempted, so
        // cur_state is untouched.
        assert_eq!(driver.mirror.cur_state, Some(crate::mirror::StateId(2)));
    }

    #[test]
    fn exn_to_error_maps_overflow_and_unification() {
        match exn_to_error(ExnKind::Overflow, "s".into(), "m".into()) {
            DriverError::Overflow { .. } => {}
            other => panic!("unexpected: {:?}", other),
        }
        match exn_to_error(ExnKind::Unification, "s".into(), "m".into()) {
            DriverError::Unification { .. } => {}
            other => panic!("unexpected: {:?}", other),
        }
    }
}
