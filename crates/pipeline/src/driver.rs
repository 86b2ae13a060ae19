use tokio::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::finalize::{FinalizationEngine, FinalizeEffect};
use crate::forced::{ForcedCommitEngine, ForcedEffect};
use crate::gate::{CloseOutcome, FinalityGate};
use crate::partials::PartialTracker;
use crate::segment::{CandidateSource, CommitCandidate, CommittedUtterance, SegmentId};
use crate::text;

/// Everything that can happen to the pipeline, delivered through the
/// session's single serialization point.
#[derive(Debug, Clone)]
pub enum PipelineInput {
    Partial(String),
    Final(String),
    Forced(String),
    FinalizeTimer { generation: u64 },
    ForcedTimer { generation: u64 },
    RecoveryWatchdog { segment: SegmentId, commit_id: String },
    /// A candidate produced outside the recognizer path (grammar worker,
    /// recovery transcriber).
    ExternalCandidate {
        segment: SegmentId,
        text: String,
        source: CandidateSource,
    },
    /// The recovery transcriber finished (or gave up) for a segment.
    RecoveryResolved { segment: SegmentId },
    CloseSegment { segment: SegmentId },
}

/// Side effects the session must carry out after a `handle` call.
#[derive(Debug, Clone)]
pub enum PipelineAction {
    /// Forward the live partial for the open segment to the coordinator.
    EmitPartial { segment: SegmentId, text: String },
    /// An authoritative finalized utterance; exactly one per segment.
    Commit(CommittedUtterance),
    ArmFinalizeTimer { generation: u64, delay: Duration },
    ArmForcedTimer { generation: u64, delay: Duration },
    ArmRecoveryWatchdog {
        segment: SegmentId,
        commit_id: String,
        delay: Duration,
    },
    /// A forced restart likely truncated the utterance mid-word: run
    /// post-hoc recovery over the rolling audio buffer.
    RequestRecovery { segment: SegmentId },
}

/// The per-session pipeline state machine: inputs in, actions out. All
/// timer state is generation-counted so the owning actor can ignore stale
/// fires.
pub struct PipelineDriver {
    cfg: PipelineConfig,
    tracker: PartialTracker,
    finalize: FinalizationEngine,
    forced: ForcedCommitEngine,
    gate: FinalityGate,
    current: SegmentId,
}

impl PipelineDriver {
    pub fn new(cfg: PipelineConfig) -> Self {
        Self {
            tracker: PartialTracker::new(),
            finalize: FinalizationEngine::new(cfg.clone()),
            forced: ForcedCommitEngine::new(cfg.clone()),
            gate: FinalityGate::new(),
            cfg,
            current: SegmentId::default(),
        }
    }

    pub fn current_segment(&self) -> SegmentId {
        self.current
    }

    pub fn gate(&self) -> &FinalityGate {
        &self.gate
    }

    /// Broadcast confirmation callback, forwarded to the gate.
    pub fn mark_committed(&mut self, segment: SegmentId, commit_id: &str) {
        self.gate.mark_committed(segment, commit_id);
    }

    pub fn handle(&mut self, input: PipelineInput, now: Instant) -> Vec<PipelineAction> {
        let mut actions = Vec::new();
        match input {
            PipelineInput::Partial(text) => self.on_partial(text, now, &mut actions),
            PipelineInput::Final(text) => self.on_final(text, now, &mut actions),
            PipelineInput::Forced(text) => self.on_forced(text, now, &mut actions),
            PipelineInput::FinalizeTimer { generation } => {
                let effects = self.finalize.on_timer(generation, &self.tracker, now);
                self.apply_finalize_effects(effects, now, &mut actions);
            }
            PipelineInput::ForcedTimer { generation } => {
                let effects = self.forced.on_timer(generation);
                self.apply_forced_effects(effects, now, &mut actions);
            }
            PipelineInput::RecoveryWatchdog { segment, commit_id } => {
                if let Some(lost) = self.gate.watchdog_fired(segment, &commit_id) {
                    let outcome = self.gate.submit_candidate(CommitCandidate {
                        segment,
                        text: lost,
                        source: CandidateSource::Recovery,
                        at: now,
                    });
                    if outcome.can_commit {
                        self.finalize_segment(segment, now, &mut actions);
                    }
                }
            }
            PipelineInput::ExternalCandidate {
                segment,
                text,
                source,
            } => {
                let outcome = self.gate.submit_candidate(CommitCandidate {
                    segment,
                    text,
                    source,
                    at: now,
                });
                // External candidates never force a commit on their own:
                // grammar improvements ride along with whatever commits the
                // segment, and recovery commits via `RecoveryResolved`.
                debug!(
                    %segment,
                    %source,
                    accepted = outcome.accepted,
                    "external candidate submitted"
                );
            }
            PipelineInput::RecoveryResolved { segment } => {
                if let Some(best) = self.gate.mark_recovery_complete(segment) {
                    debug!(%segment, source = %best.source, "recovery resolved, committing best candidate");
                    self.finalize_segment(segment, now, &mut actions);
                }
            }
            PipelineInput::CloseSegment { segment } => {
                // Text still buffered in the engines never reached the
                // gate; hand it over so the close can finalize it instead
                // of abandoning the utterance.
                if segment == self.current {
                    if let Some(text) = self.forced.buffered_text().map(str::to_string) {
                        self.gate.submit_candidate(CommitCandidate {
                            segment,
                            text,
                            source: CandidateSource::Forced,
                            at: now,
                        });
                        self.forced.clear();
                    }
                    if let Some(text) = self.finalize.pending_text().map(str::to_string) {
                        self.gate.submit_candidate(CommitCandidate {
                            segment,
                            text,
                            source: CandidateSource::AsrFinal,
                            at: now,
                        });
                        self.finalize.clear_pending();
                    }
                }
                let commit_id = Uuid::new_v4().to_string();
                match self.gate.close_segment(segment, &commit_id, now) {
                    CloseOutcome::Finalized(best) => {
                        self.emit_commit(segment, commit_id, best, now, &mut actions);
                    }
                    CloseOutcome::Deferred => {
                        debug!(%segment, "close deferred until recovery resolves");
                    }
                    CloseOutcome::Done => {}
                }
            }
        }
        actions
    }

    fn on_partial(&mut self, raw: String, now: Instant, actions: &mut Vec<PipelineAction>) {
        let text = text::squash_ws(&raw);
        if text.is_empty() {
            return;
        }

        let (effects, consumed) = self.forced.on_partial(&text);
        self.apply_forced_effects(effects, now, actions);
        if consumed {
            return;
        }

        self.tracker.update_partial(&text, now);
        let effects = self.finalize.on_partial(&text, &self.tracker, now);
        self.apply_finalize_effects(effects, now, actions);

        if !self.gate.is_finalized(self.current) {
            actions.push(PipelineAction::EmitPartial {
                segment: self.current,
                text,
            });
        }
    }

    fn on_final(&mut self, raw: String, now: Instant, actions: &mut Vec<PipelineAction>) {
        let mut text = text::squash_ws(&raw);
        if text.is_empty() {
            return;
        }

        for effect in self.forced.on_final(&text) {
            match effect {
                ForcedEffect::ReplaceIncomingFinal { text: merged } => {
                    info!("forced buffer merged into incoming final");
                    text = merged;
                }
                other => self.apply_forced_effects(vec![other], now, actions),
            }
        }

        let effects = self.finalize.on_final(&text, &self.tracker, now);
        self.apply_finalize_effects(effects, now, actions);
    }

    fn on_forced(&mut self, raw: String, now: Instant, actions: &mut Vec<PipelineAction>) {
        let text = text::squash_ws(&raw);
        if text.is_empty() {
            return;
        }

        // A truncated flush is the cue for post-hoc recovery over the
        // rolling audio buffer; the gate holds Grammar/Forced commits back
        // until it resolves.
        if text::ends_mid_word(&text) && !self.gate.is_finalized(self.current) {
            self.gate.mark_recovery_pending(self.current);
            actions.push(PipelineAction::RequestRecovery {
                segment: self.current,
            });
        }

        let effects = self.forced.on_forced(&text, &self.tracker, now);
        self.apply_forced_effects(effects, now, actions);
    }

    fn apply_finalize_effects(
        &mut self,
        effects: Vec<FinalizeEffect>,
        now: Instant,
        actions: &mut Vec<PipelineAction>,
    ) {
        for effect in effects {
            match effect {
                FinalizeEffect::Schedule { generation, delay } => {
                    actions.push(PipelineAction::ArmFinalizeTimer { generation, delay });
                }
                FinalizeEffect::Commit { text } => {
                    // The engine manages its own pending state; do not clear
                    // it here or a just-opened wait window would be lost.
                    self.try_commit(text, CandidateSource::AsrFinal, false, now, actions);
                }
            }
        }
    }

    fn apply_forced_effects(
        &mut self,
        effects: Vec<ForcedEffect>,
        now: Instant,
        actions: &mut Vec<PipelineAction>,
    ) {
        for effect in effects {
            match effect {
                ForcedEffect::Schedule { generation, delay } => {
                    actions.push(PipelineAction::ArmForcedTimer { generation, delay });
                }
                ForcedEffect::Commit { text } => {
                    self.try_commit(text, CandidateSource::Forced, true, now, actions);
                }
                ForcedEffect::ReplaceIncomingFinal { .. } => {
                    debug!("unexpected replace effect outside final path, ignoring");
                }
            }
        }
    }

    /// Submits a candidate for the open segment and finalizes when the gate
    /// allows it. `clear_finalize` is false only for commits originating in
    /// the finalization engine itself.
    fn try_commit(
        &mut self,
        text: String,
        source: CandidateSource,
        clear_finalize: bool,
        now: Instant,
        actions: &mut Vec<PipelineAction>,
    ) {
        let segment = self.current;
        let outcome = self.gate.submit_candidate(CommitCandidate {
            segment,
            text,
            source,
            at: now,
        });
        if !outcome.can_commit {
            debug!(%segment, %source, "candidate held back by gate");
            return;
        }
        if clear_finalize {
            self.finalize.clear_pending();
        }
        self.finalize_segment(segment, now, actions);
    }

    fn finalize_segment(
        &mut self,
        segment: SegmentId,
        now: Instant,
        actions: &mut Vec<PipelineAction>,
    ) {
        let commit_id = Uuid::new_v4().to_string();
        if let Some(best) = self.gate.finalize_segment(segment, &commit_id, now) {
            self.emit_commit(segment, commit_id, best, now, actions);
        }
    }

    fn emit_commit(
        &mut self,
        segment: SegmentId,
        commit_id: String,
        best: CommitCandidate,
        _now: Instant,
        actions: &mut Vec<PipelineAction>,
    ) {
        info!(%segment, source = %best.source, "segment committed");
        actions.push(PipelineAction::Commit(CommittedUtterance {
            segment,
            commit_id: commit_id.clone(),
            text: best.text,
            source: best.source,
        }));
        actions.push(PipelineAction::ArmRecoveryWatchdog {
            segment,
            commit_id,
            delay: Duration::from_millis(self.cfg.recovery_watchdog_ms),
        });

        if segment == self.current {
            // The committed segment closes; everything that follows belongs
            // to a fresh one.
            self.tracker.reset();
            self.forced.clear();
            self.current = self.current.next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> PipelineDriver {
        PipelineDriver::new(PipelineConfig::default())
    }

    fn commits(actions: &[PipelineAction]) -> Vec<&CommittedUtterance> {
        actions
            .iter()
            .filter_map(|a| match a {
                PipelineAction::Commit(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    /// Replays armed timers as if their deadlines all fired, advancing a
    /// synthetic clock and collecting commits. Stale generations are
    /// filtered by the engines themselves.
    fn drive_timers(
        driver: &mut PipelineDriver,
        actions: Vec<PipelineAction>,
    ) -> Vec<CommittedUtterance> {
        let mut committed = Vec::new();
        let mut queue = actions;
        let mut at = Instant::now();
        let mut guard = 0;
        while !queue.is_empty() {
            guard += 1;
            assert!(guard < 64, "timer replay did not converge");
            let mut next = Vec::new();
            for action in queue {
                match action {
                    PipelineAction::ArmFinalizeTimer { generation, delay } => {
                        at += delay;
                        next.extend(driver.handle(PipelineInput::FinalizeTimer { generation }, at));
                    }
                    PipelineAction::ArmForcedTimer { generation, delay } => {
                        at += delay;
                        next.extend(driver.handle(PipelineInput::ForcedTimer { generation }, at));
                    }
                    PipelineAction::Commit(c) => committed.push(c),
                    _ => {}
                }
            }
            queue = next;
        }
        committed
    }

    #[tokio::test(start_paused = true)]
    async fn extension_into_final_commits_once() {
        let mut driver = driver();
        let now = Instant::now();

        for partial in ["where", "where two", "where two or three are"] {
            driver.handle(PipelineInput::Partial(partial.to_string()), now);
        }
        let a1 = driver.handle(
            PipelineInput::Final("where two or three are".to_string()),
            now,
        );
        assert!(commits(&a1).is_empty(), "final must wait for extension");

        driver.handle(
            PipelineInput::Partial("where two or three are gathered".to_string()),
            now,
        );
        driver.handle(
            PipelineInput::Partial("where two or three are gathered together".to_string()),
            now,
        );
        let a2 = driver.handle(
            PipelineInput::Final("where two or three are gathered together".to_string()),
            now,
        );
        assert!(commits(&a2).is_empty());

        // Let the pending final ripen to the ceiling.
        let committed = drive_timers(&mut driver, a2);
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].text, "where two or three are gathered together");
        assert_eq!(committed[0].source, CandidateSource::AsrFinal);
        assert_eq!(driver.current_segment(), SegmentId(1));
    }

    #[tokio::test(start_paused = true)]
    async fn forced_restart_with_continuation_commits_full_sentence() {
        let mut driver = driver();
        let now = Instant::now();

        driver.handle(PipelineInput::Partial("Our own self".to_string()), now);
        driver.handle(
            PipelineInput::Partial("Our own self-centered desires".to_string()),
            now,
        );
        let a = driver.handle(
            PipelineInput::Forced("Our own self-centered desires".to_string()),
            now,
        );
        // Sentence-incomplete: buffered with a safety timer, no commit yet,
        // and the mid-word truncation kicks off recovery.
        assert!(commits(&a).is_empty());
        assert!(a
            .iter()
            .any(|x| matches!(x, PipelineAction::ArmForcedTimer { .. })));
        assert!(a
            .iter()
            .any(|x| matches!(x, PipelineAction::RequestRecovery { .. })));

        // The extending partial merges with the buffer; the resulting
        // Forced candidate is held back while recovery is pending.
        let a = driver.handle(
            PipelineInput::Partial("Our own self-centered desires cordoned off".to_string()),
            now,
        );
        assert!(commits(&a).is_empty());

        let a = driver.handle(
            PipelineInput::Final(
                "Our own self-centered desires cordoned off from others.".to_string(),
            ),
            now,
        );
        let committed = drive_timers(&mut driver, a);
        assert_eq!(committed.len(), 1);
        assert_eq!(
            committed[0].text,
            "Our own self-centered desires cordoned off from others."
        );
        assert_eq!(committed[0].source, CandidateSource::AsrFinal);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_buffer_merges_into_following_final() {
        let mut driver = driver();
        let now = Instant::now();

        driver.handle(
            PipelineInput::Forced("Our own self-centered desires".to_string()),
            now,
        );
        let a = driver.handle(
            PipelineInput::Final("desires cordoned off from others.".to_string()),
            now,
        );
        assert!(commits(&a).is_empty());

        let committed = drive_timers(&mut driver, a);
        assert_eq!(committed.len(), 1);
        assert_eq!(
            committed[0].text,
            "Our own self-centered desires cordoned off from others."
        );
        assert_eq!(committed[0].source, CandidateSource::AsrFinal);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_dominates_grammar() {
        let mut driver = driver();
        let now = Instant::now();
        let segment = driver.current_segment();

        // Mid-word forced text triggers recovery.
        let a = driver.handle(PipelineInput::Forced("where two or thr".to_string()), now);
        assert!(a
            .iter()
            .any(|x| matches!(x, PipelineAction::RequestRecovery { .. })));

        driver.handle(
            PipelineInput::ExternalCandidate {
                segment,
                text: "Where two or three are.".to_string(),
                source: CandidateSource::Grammar,
            },
            now,
        );
        // Safety timer fires: the Forced commit is held back by the gate.
        let a = driver.handle(
            PipelineInput::ForcedTimer { generation: 1 },
            now + Duration::from_millis(1500),
        );
        assert!(commits(&a).is_empty(), "forced commit must wait for recovery");

        driver.handle(
            PipelineInput::ExternalCandidate {
                segment,
                text: "where two or three are gathered together".to_string(),
                source: CandidateSource::Recovery,
            },
            now,
        );
        let a = driver.handle(PipelineInput::RecoveryResolved { segment }, now);
        let committed = commits(&a);
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].text, "where two or three are gathered together");
        assert_eq!(committed[0].source, CandidateSource::Recovery);
    }

    #[tokio::test(start_paused = true)]
    async fn incomplete_final_commits_by_ceiling() {
        let mut driver = driver();
        let now = Instant::now();

        let a = driver.handle(PipelineInput::Final("The Lord is".to_string()), now);
        let committed = drive_timers(&mut driver, a);
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].text, "The Lord is");
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_reposts_uncommitted_final() {
        let mut driver = driver();
        let now = Instant::now();

        let a = driver.handle(PipelineInput::Final("It is finished.".to_string()), now);
        let committed = drive_timers(&mut driver, a);
        assert_eq!(committed.len(), 1);
        let first = &committed[0];

        // No mark_committed arrives; the watchdog re-posts as Recovery.
        let a = driver.handle(
            PipelineInput::RecoveryWatchdog {
                segment: first.segment,
                commit_id: first.commit_id.clone(),
            },
            now + Duration::from_secs(5),
        );
        let again = commits(&a);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].text, "It is finished.");
        assert_eq!(again[0].source, CandidateSource::Recovery);
        assert_ne!(again[0].commit_id, first.commit_id);
    }

    #[tokio::test(start_paused = true)]
    async fn close_segment_flushes_pending_final() {
        let mut driver = driver();
        let now = Instant::now();

        // The final is still inside its wait window when the close lands.
        let a = driver.handle(PipelineInput::Final("The Lord is".to_string()), now);
        assert!(commits(&a).is_empty());

        let segment = driver.current_segment();
        let a = driver.handle(PipelineInput::CloseSegment { segment }, now);
        let committed = commits(&a);
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].text, "The Lord is");
        assert_eq!(committed[0].source, CandidateSource::AsrFinal);
        assert_eq!(driver.current_segment(), segment.next());
    }

    #[tokio::test(start_paused = true)]
    async fn close_segment_flushes_forced_buffer() {
        let mut driver = driver();
        let now = Instant::now();

        // Ends on punctuation: buffered without marking recovery pending.
        let a = driver.handle(PipelineInput::Forced("Trailing words,".to_string()), now);
        assert!(commits(&a).is_empty());

        let segment = driver.current_segment();
        let a = driver.handle(PipelineInput::CloseSegment { segment }, now);
        let committed = commits(&a);
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].text, "Trailing words,");
        assert_eq!(committed[0].source, CandidateSource::Forced);
    }

    #[tokio::test(start_paused = true)]
    async fn close_without_any_candidate_commits_nothing() {
        let mut driver = driver();
        let now = Instant::now();
        let segment = driver.current_segment();
        let a = driver.handle(PipelineInput::CloseSegment { segment }, now);
        assert!(commits(&a).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn committed_segment_watchdog_is_silent() {
        let mut driver = driver();
        let now = Instant::now();

        let a = driver.handle(PipelineInput::Final("It is finished.".to_string()), now);
        let committed = drive_timers(&mut driver, a);
        let first = &committed[0];
        driver.mark_committed(first.segment, &first.commit_id);

        let a = driver.handle(
            PipelineInput::RecoveryWatchdog {
                segment: first.segment,
                commit_id: first.commit_id.clone(),
            },
            now + Duration::from_secs(5),
        );
        assert!(commits(&a).is_empty());
    }
}
