use std::collections::HashMap;

use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::segment::{CandidateSource, CommitCandidate, SegmentId};

/// Closed segments retained before the oldest are pruned.
const CLOSED_SEGMENT_RETENTION: usize = 256;

#[derive(Debug, Default)]
struct SegmentState {
    recovery_pending: bool,
    recovery_resolved: bool,
    best_candidate: Option<CommitCandidate>,
    finalized: bool,
    closed: bool,
    committed_final_count: u32,
    saw_final_from_asr: bool,
    finalized_text: Option<String>,
    finalize_commit_id: Option<String>,
    finalize_at: Option<Instant>,
}

/// Outcome of submitting a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOutcome {
    /// The candidate replaced (or became) the segment's best candidate.
    pub accepted: bool,
    /// The segment may be finalized right now with its best candidate.
    pub can_commit: bool,
}

/// What `close_segment` did.
#[derive(Debug)]
pub enum CloseOutcome {
    /// Recovery still pending; the close is deferred until it resolves.
    Deferred,
    /// The best candidate was finalized as part of closing.
    Finalized(CommitCandidate),
    /// Nothing left to do (no candidate, or already closed/finalized).
    Done,
}

/// Per-segment dominance arbiter: decides which concurrent producer's text
/// becomes the one committed final for each segment.
///
/// This is the single linearization point for commits; every merge,
/// translation and broadcast passes through here before an outbound final
/// is sent.
#[derive(Debug, Default)]
pub struct FinalityGate {
    segments: HashMap<SegmentId, SegmentState>,
}

impl FinalityGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&mut self, segment: SegmentId) -> &mut SegmentState {
        self.segments.entry(segment).or_default()
    }

    /// While set, `Grammar` and `Forced` candidates are held back for the
    /// segment; only `Recovery` and `AsrFinal` may commit.
    pub fn mark_recovery_pending(&mut self, segment: SegmentId) {
        let state = self.state(segment);
        if !state.finalized {
            state.recovery_pending = true;
            debug!(%segment, "recovery pending");
        }
    }

    /// Clears the pending flag. When the segment already holds a candidate
    /// and is not finalized, returns it so the caller can finalize
    /// immediately rather than waiting for the next submission.
    pub fn mark_recovery_complete(&mut self, segment: SegmentId) -> Option<CommitCandidate> {
        let state = self.state(segment);
        state.recovery_pending = false;
        state.recovery_resolved = true;
        if state.finalized {
            return None;
        }
        state.best_candidate.clone()
    }

    pub fn can_commit(&mut self, candidate: &CommitCandidate) -> bool {
        let state = self.state(candidate.segment);
        if state.finalized {
            return false;
        }
        match candidate.source {
            CandidateSource::Recovery | CandidateSource::AsrFinal => true,
            CandidateSource::Grammar | CandidateSource::Forced => !state.recovery_pending,
        }
    }

    /// Records the candidate when it strictly beats the current best. The
    /// best candidate is tracked even while the segment cannot commit, so
    /// that `mark_recovery_complete` / `close_segment` can finalize it
    /// later.
    pub fn submit_candidate(&mut self, candidate: CommitCandidate) -> SubmitOutcome {
        let can_commit = self.can_commit(&candidate);
        let state = self.state(candidate.segment);

        if state.finalized {
            debug!(
                segment = %candidate.segment,
                source = %candidate.source,
                "candidate rejected: segment already finalized"
            );
            return SubmitOutcome {
                accepted: false,
                can_commit: false,
            };
        }

        if candidate.source == CandidateSource::AsrFinal {
            state.saw_final_from_asr = true;
        }

        let accepted = match &state.best_candidate {
            Some(best) => candidate.beats(best),
            None => true,
        };
        if accepted {
            state.best_candidate = Some(candidate);
        }

        SubmitOutcome {
            accepted,
            can_commit,
        }
    }

    /// Marks the segment finalized and hands back the winning candidate.
    /// Returns `None` iff no candidate was ever submitted. The caller must
    /// arm the recovery watchdog and, after broadcasting, call
    /// [`mark_committed`](Self::mark_committed).
    pub fn finalize_segment(
        &mut self,
        segment: SegmentId,
        commit_id: &str,
        now: Instant,
    ) -> Option<CommitCandidate> {
        let state = self.state(segment);
        if state.finalized {
            return None;
        }
        let best = state.best_candidate.clone()?;
        state.finalized = true;
        state.recovery_pending = false;
        state.finalized_text = Some(best.text.clone());
        state.finalize_commit_id = Some(commit_id.to_string());
        state.finalize_at = Some(now);
        debug!(%segment, commit_id, source = %best.source, "segment finalized");
        Some(best)
    }

    /// Called by the broadcaster after a successful final emit. Returns
    /// `true` when the commit id matched and the watchdog should be
    /// disarmed.
    pub fn mark_committed(&mut self, segment: SegmentId, commit_id: &str) -> bool {
        let state = self.state(segment);
        if state.finalize_commit_id.as_deref() != Some(commit_id) {
            warn!(%segment, commit_id, "mark_committed with unknown commit id");
            return false;
        }
        state.committed_final_count += 1;
        if state.committed_final_count > 1 && (state.saw_final_from_asr || state.recovery_resolved)
        {
            // Exactly-one-commit invariant tripped. A bug signal, not a
            // user-visible fault: log and continue.
            error!(
                %segment,
                count = state.committed_final_count,
                "invariant violation: more than one commit for segment"
            );
        }
        true
    }

    /// Recovery watchdog fire: a segment was finalized but never confirmed
    /// committed. Re-opens it and returns the finalized text so the caller
    /// can re-post it as a `Recovery` candidate.
    pub fn watchdog_fired(&mut self, segment: SegmentId, commit_id: &str) -> Option<String> {
        let state = self.state(segment);
        if state.finalize_commit_id.as_deref() != Some(commit_id) {
            return None;
        }
        if !state.finalized || state.committed_final_count > 0 {
            return None;
        }
        warn!(%segment, commit_id, "finalized segment never committed; retrying as recovery");
        state.finalized = false;
        state.finalize_commit_id = None;
        state.best_candidate = None;
        state.finalized_text.take()
    }

    /// Idempotent close. Defers while recovery is pending; otherwise
    /// finalizes any best candidate and marks the segment closed.
    pub fn close_segment(
        &mut self,
        segment: SegmentId,
        commit_id: &str,
        now: Instant,
    ) -> CloseOutcome {
        {
            let state = self.state(segment);
            if state.closed {
                return CloseOutcome::Done;
            }
            if state.recovery_pending {
                return CloseOutcome::Deferred;
            }
        }
        let finalized = if self.state(segment).finalized {
            None
        } else {
            self.finalize_segment(segment, commit_id, now)
        };
        let state = self.state(segment);
        state.closed = true;
        self.prune_closed();
        match finalized {
            Some(candidate) => CloseOutcome::Finalized(candidate),
            None => CloseOutcome::Done,
        }
    }

    /// Whether the segment has been finalized.
    pub fn is_finalized(&self, segment: SegmentId) -> bool {
        self.segments
            .get(&segment)
            .is_some_and(|state| state.finalized)
    }

    pub fn is_recovery_pending(&self, segment: SegmentId) -> bool {
        self.segments
            .get(&segment)
            .is_some_and(|state| state.recovery_pending)
    }

    /// Committed-final count observed for a segment (test and stats hook).
    pub fn committed_count(&self, segment: SegmentId) -> u32 {
        self.segments
            .get(&segment)
            .map(|state| state.committed_final_count)
            .unwrap_or(0)
    }

    fn prune_closed(&mut self) {
        let closed: Vec<SegmentId> = self
            .segments
            .iter()
            .filter(|(_, state)| state.closed && state.committed_final_count > 0)
            .map(|(id, _)| *id)
            .collect();
        if closed.len() > CLOSED_SEGMENT_RETENTION {
            let mut sorted = closed;
            sorted.sort();
            let drop_count = sorted.len() - CLOSED_SEGMENT_RETENTION;
            for id in sorted.into_iter().take(drop_count) {
                self.segments.remove(&id);
            }
        }
    }
}
