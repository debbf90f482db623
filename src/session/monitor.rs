//! Completion polling
//!
//! Sessions with human participants wait for oTree to report every
//! participant as finished before exporting.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::interrupt::InterruptFlag;
use crate::otree::{ExperimentHost, SessionDetail};

/// Granularity of interruptible sleeps
const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// Finished counts of one status poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionSnapshot {
    pub total: usize,
    pub finished: usize,
    pub humans_finished: usize,
    pub bots_finished: usize,
}

impl CompletionSnapshot {
    pub fn all_finished(&self) -> bool {
        self.total > 0 && self.finished >= self.total
    }
}

/// How waiting ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    Interrupted,
}

/// Count finished participants, `is_human` indexed by `id_in_session - 1`
pub fn summarize(detail: &SessionDetail, is_human: &[bool]) -> CompletionSnapshot {
    let mut snapshot = CompletionSnapshot {
        total: detail.participants.len(),
        ..Default::default()
    };

    let mut participants: Vec<_> = detail.participants.iter().collect();
    participants.sort_by_key(|p| p.id_in_session);

    for p in participants {
        let human = (p.id_in_session as usize)
            .checked_sub(1)
            .and_then(|idx| is_human.get(idx))
            .copied()
            .unwrap_or(true);
        let kind = if human { "HUMAN" } else { "BOT" };

        if p.is_finished() {
            snapshot.finished += 1;
            if human {
                snapshot.humans_finished += 1;
            } else {
                snapshot.bots_finished += 1;
            }
            debug!("  {} ({}): COMPLETED", p.code, kind);
        } else {
            debug!(
                "  {} ({}): IN PROGRESS ({}.{})",
                p.code,
                kind,
                p.current_app_name.as_deref().unwrap_or("unknown"),
                p.current_page_name.as_deref().unwrap_or("unknown")
            );
        }
    }

    snapshot
}

/// Sleep for `duration`, returning early (false) when interrupted
pub fn sleep_unless_interrupted(duration: Duration, interrupt: &InterruptFlag) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if interrupt.is_raised() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

/// Poll the host until every participant finished or the user interrupts
pub fn wait_for_completion(
    host: &dyn ExperimentHost,
    session_id: &str,
    is_human: &[bool],
    poll_interval: Duration,
    interrupt: &InterruptFlag,
) -> WaitOutcome {
    loop {
        if !sleep_unless_interrupted(poll_interval, interrupt) {
            info!("Session {}: interrupted, proceeding to data export", session_id);
            return WaitOutcome::Interrupted;
        }

        let detail = match host.session_detail(session_id) {
            Ok(detail) => detail,
            Err(e) => {
                warn!("Session {}: could not check status: {}", session_id, e);
                continue;
            }
        };

        let snapshot = summarize(&detail, is_human);
        info!(
            "Session {}: {}/{} participants completed ({} humans, {} bots)",
            session_id, snapshot.finished, snapshot.total, snapshot.humans_finished, snapshot.bots_finished
        );

        if snapshot.all_finished() {
            info!("Session {}: all participants completed", session_id);
            return WaitOutcome::Completed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::otree::testing::FakeHost;
    use crate::otree::ParticipantStatus;

    fn status(id: u32, finished: Option<bool>) -> ParticipantStatus {
        ParticipantStatus {
            code: format!("p{}", id),
            id_in_session: id,
            finished,
            current_page_name: None,
            current_app_name: None,
        }
    }

    #[test]
    fn test_summarize_counts_by_kind() {
        let detail = SessionDetail {
            code: "sess01".to_string(),
            participants: vec![status(3, Some(true)), status(1, Some(true)), status(2, None)],
        };

        let snapshot = summarize(&detail, &[true, false, false]);

        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.finished, 2);
        assert_eq!(snapshot.humans_finished, 1);
        assert_eq!(snapshot.bots_finished, 1);
        assert!(!snapshot.all_finished());
    }

    #[test]
    fn test_empty_session_is_not_finished() {
        assert!(!summarize(&SessionDetail::default(), &[]).all_finished());
    }

    #[test]
    fn test_wait_until_everyone_finished() {
        let host = FakeHost::new(2).with_snapshots(vec![
            vec![false, false],
            vec![true, false],
            vec![true, true],
        ]);

        let outcome = wait_for_completion(&host, "sess01", &[true, false], Duration::ZERO, &InterruptFlag::new());

        assert_eq!(outcome, WaitOutcome::Completed);
        assert!(host.snapshots.lock().unwrap().len() == 1);
    }

    #[test]
    fn test_wait_stops_on_interrupt() {
        let host = FakeHost::new(1).with_snapshots(vec![vec![false]]);
        let interrupt = InterruptFlag::new();
        interrupt.raise();

        let outcome = wait_for_completion(&host, "sess01", &[true], Duration::from_secs(60), &interrupt);

        assert_eq!(outcome, WaitOutcome::Interrupted);
    }

    #[test]
    fn test_sleep_completes_without_interrupt() {
        assert!(sleep_unless_interrupted(Duration::from_millis(1), &InterruptFlag::new()));
    }
}
