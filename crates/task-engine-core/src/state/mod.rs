//! Task lifecycle state machine.
//!
//! A pure transition table: no I/O, no locking. The engine performs the
//! actual persisted transition (via `task_engine_db::queries::tasks`,
//! itself a CAS update) and consults this table first to decide whether
//! the attempted move is legal at all.

use task_engine_db::models::TaskStatus;

/// The task state machine.
///
/// Valid transition graph:
///
/// ```text
/// created       -> claimed
/// scheduled     -> claimed
/// waiting_retry -> claimed
/// claimed       -> running
/// claimed       -> scheduled   (lease expiry recovery)
/// running       -> scheduled   (lease expiry recovery)
/// running       -> succeeded
/// running       -> waiting_retry
/// running       -> failed
/// *             -> canceled    (any non-terminal status, via pending request)
/// *             -> paused      (any non-terminal status, via pending request)
/// paused        -> scheduled   (resume)
/// ```
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph. Cancel/pause are legal from any non-terminal
    /// status; resume is only legal from `paused`.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        if from.is_terminal() {
            return false;
        }

        match to {
            TaskStatus::Canceled | TaskStatus::Paused => from != to,
            TaskStatus::Scheduled => matches!(
                from,
                TaskStatus::Claimed
                    | TaskStatus::Running
                    | TaskStatus::WaitingRetry
                    | TaskStatus::Paused
            ),
            TaskStatus::Claimed => matches!(
                from,
                TaskStatus::Created | TaskStatus::Scheduled | TaskStatus::WaitingRetry
            ),
            TaskStatus::Running => from == TaskStatus::Claimed,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::WaitingRetry => {
                from == TaskStatus::Running
            }
            TaskStatus::Created | TaskStatus::Paused => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskStatus::*;

    #[test]
    fn claim_reachable_from_all_runnable_statuses() {
        for from in TaskStatus::RUNNABLE {
            assert!(TaskStateMachine::is_valid_transition(from, Claimed), "{from:?}");
        }
    }

    #[test]
    fn claimed_only_advances_to_running() {
        assert!(TaskStateMachine::is_valid_transition(Claimed, Running));
        assert!(!TaskStateMachine::is_valid_transition(Claimed, Succeeded));
    }

    #[test]
    fn running_terminates_or_retries() {
        assert!(TaskStateMachine::is_valid_transition(Running, Succeeded));
        assert!(TaskStateMachine::is_valid_transition(Running, Failed));
        assert!(TaskStateMachine::is_valid_transition(Running, WaitingRetry));
        assert!(!TaskStateMachine::is_valid_transition(Running, Created));
    }

    #[test]
    fn lease_expiry_recovers_to_scheduled() {
        assert!(TaskStateMachine::is_valid_transition(Claimed, Scheduled));
        assert!(TaskStateMachine::is_valid_transition(Running, Scheduled));
    }

    #[test]
    fn cancel_and_pause_available_from_any_non_terminal_status() {
        for from in [Created, Scheduled, Claimed, Running, WaitingRetry] {
            assert!(TaskStateMachine::is_valid_transition(from, Canceled), "{from:?}");
            assert!(TaskStateMachine::is_valid_transition(from, Paused), "{from:?}");
        }
    }

    #[test]
    fn terminal_statuses_accept_no_further_transitions() {
        for from in [Succeeded, Failed, Canceled] {
            for to in [
                Created, Scheduled, Claimed, Running, WaitingRetry, Succeeded, Failed, Canceled,
                Paused,
            ] {
                assert!(!TaskStateMachine::is_valid_transition(from, to), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn paused_resumes_to_scheduled_only() {
        assert!(TaskStateMachine::is_valid_transition(Paused, Scheduled));
        assert!(!TaskStateMachine::is_valid_transition(Paused, Running));
        assert!(!TaskStateMachine::is_valid_transition(Paused, Claimed));
    }

    #[test]
    fn no_transition_to_self() {
        for s in [Created, Scheduled, Claimed, Running, WaitingRetry, Paused] {
            assert!(!TaskStateMachine::is_valid_transition(s, s), "{s:?}");
        }
    }
}
