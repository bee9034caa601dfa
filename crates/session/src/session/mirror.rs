use std::cmp::Ordering;

use tokio::sync::watch;

use super::state::{GameResult, SessionState, SessionStatus, TerminalReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    Gap,
    Divergent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Applied,
    IgnoredStale,
    Conflict(ConflictKind),
}

impl AdvanceOutcome {
    pub fn needs_resync(self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// One client's copy of one session.
///
/// The watch channel's write lock is the update guard: every mutation runs
/// inside `send_if_modified`, so two advances never interleave and observers
/// are only woken when something actually changed.
#[derive(Debug)]
pub struct SessionMirror {
    tx: watch::Sender<SessionState>,
}

impl SessionMirror {
    pub fn new(initial: SessionState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn current_state(&self) -> SessionState {
        self.tx.borrow().clone()
    }

    pub fn ply_index(&self) -> u32 {
        self.tx.borrow().ply_index
    }

    pub fn status(&self) -> SessionStatus {
        self.tx.borrow().status
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    pub fn try_advance(&self, candidate: &SessionState) -> AdvanceOutcome {
        let mut outcome = AdvanceOutcome::IgnoredStale;
        self.tx.send_if_modified(|current| {
            outcome = advance(current, candidate);
            outcome == AdvanceOutcome::Applied
        });
        outcome
    }

    pub fn try_advance_with<E>(
        &self,
        build: impl FnOnce(&SessionState) -> Result<SessionState, E>,
    ) -> Result<(SessionState, AdvanceOutcome), E> {
        let mut slot = None;
        self.tx.send_if_modified(|current| match build(current) {
            Ok(candidate) => {
                let outcome = advance(current, &candidate);
                slot = Some(Ok((candidate, outcome)));
                outcome == AdvanceOutcome::Applied
            }
            Err(err) => {
                slot = Some(Err(err));
                false
            }
        });
        match slot {
            Some(result) => result,
            None => unreachable!("send_if_modified always runs its closure"),
        }
    }

    /// Replaces the state with an authoritative snapshot regardless of ply.
    /// `settlement_done` is never reset.
    pub fn force_apply(&self, snapshot: &SessionState) -> bool {
        self.tx.send_if_modified(|current| {
            let mut next = snapshot.clone();
            next.settlement_done |= current.settlement_done && next.status == SessionStatus::Finished;
            if *current == next {
                return false;
            }
            *current = next;
            true
        })
    }

    pub fn finish(&self, result: GameResult, reason: TerminalReason) -> Option<SessionState> {
        let mut finished = None;
        self.tx.send_if_modified(|current| {
            if current.status != SessionStatus::Playing {
                return false;
            }
            *current = current.finished(result, reason);
            finished = Some(current.clone());
            true
        });
        finished
    }

    pub fn mark_settled(&self) -> bool {
        self.tx.send_if_modified(|current| {
            if current.settlement_done || current.status != SessionStatus::Finished {
                return false;
            }
            current.settlement_done = true;
            true
        })
    }

    pub fn update_with<E>(
        &self,
        build: impl FnOnce(&SessionState) -> Result<SessionState, E>,
    ) -> Result<SessionState, E> {
        let mut slot = None;
        self.tx.send_if_modified(|current| match build(current) {
            Ok(next) => {
                let changed = *current != next;
                *current = next.clone();
                slot = Some(Ok(next));
                changed
            }
            Err(err) => {
                slot = Some(Err(err));
                false
            }
        });
        match slot {
            Some(result) => result,
            None => unreachable!("send_if_modified always runs its closure"),
        }
    }
}

fn advance(current: &mut SessionState, candidate: &SessionState) -> AdvanceOutcome {
    if candidate.session_id != current.session_id {
        log::warn!(
            "Ignoring candidate for session {} on mirror of {}",
            candidate.session_id,
            current.session_id
        );
        return AdvanceOutcome::IgnoredStale;
    }

    let local = current.ply_index;
    let remote = candidate.ply_index;

    match remote.cmp(&local) {
        Ordering::Less => AdvanceOutcome::IgnoredStale,
        Ordering::Equal => {
            if candidate.position != current.position || outcomes_disagree(current, candidate) {
                AdvanceOutcome::Conflict(ConflictKind::Divergent)
            } else if merge_metadata(current, candidate) {
                AdvanceOutcome::Applied
            } else {
                AdvanceOutcome::IgnoredStale
            }
        }
        Ordering::Greater if remote == local + 1 => {
            if current.status.is_retired() {
                return AdvanceOutcome::IgnoredStale;
            }
            let extends_local = candidate.move_log.len() == remote as usize
                && candidate.move_log.starts_with(&current.move_log);
            if !extends_local
                || !current.status.can_transition_to(candidate.status)
                || !seats_compatible(current, candidate)
            {
                return AdvanceOutcome::Conflict(ConflictKind::Divergent);
            }

            let settled = current.settlement_done;
            *current = candidate.clone();
            current.settlement_done |= settled;
            AdvanceOutcome::Applied
        }
        Ordering::Greater => AdvanceOutcome::Conflict(ConflictKind::Gap),
    }
}

fn outcomes_disagree(current: &SessionState, candidate: &SessionState) -> bool {
    current.status.is_retired()
        && candidate.status.is_retired()
        && (current.status, current.result, current.termination)
            != (candidate.status, candidate.result, candidate.termination)
}

fn seats_compatible(current: &SessionState, candidate: &SessionState) -> bool {
    let compatible = |local: &Option<_>, remote: &Option<_>| match (local, remote) {
        (Some(a), Some(b)) => a == b,
        (Some(_), None) => false,
        (None, _) => true,
    };
    compatible(&current.white, &candidate.white) && compatible(&current.black, &candidate.black)
}

fn merge_metadata(current: &mut SessionState, candidate: &SessionState) -> bool {
    let mut changed = false;

    if !current.status.is_retired() {
        if current.white.is_none() && candidate.white.is_some() {
            current.white = candidate.white.clone();
            changed = true;
        }
        if current.black.is_none() && candidate.black.is_some() {
            current.black = candidate.black.clone();
            changed = true;
        }
        if candidate.status.rank() > current.status.rank() {
            current.status = candidate.status;
            current.result = candidate.result;
            current.termination = candidate.termination;
            changed = true;
        }
    }

    if current.status == SessionStatus::Finished
        && candidate.settlement_done
        && !current.settlement_done
    {
        current.settlement_done = true;
        changed = true;
    }

    changed
}
