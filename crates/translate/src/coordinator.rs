use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, timeout};
use tracing::{debug, info, warn};

use voxrelay_pipeline::text;
use voxrelay_pipeline::{CandidateSource, CommittedUtterance, LastCommit, SegmentId};

use crate::events::{ScriptureEvent, TranslationEvent};
use crate::scripture::ScriptureDetector;
use crate::worker::{GrammarCorrector, TranslateError, TranslationRequest, Translator};

/// Coordinator tunables. The defaults implement the documented policy;
/// tests shrink them to keep scenarios short.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub source_lang: String,
    /// Emit a new partial only when it grew by this many characters...
    pub partial_min_growth: usize,
    /// ...and this much time passed since the previous emit.
    pub partial_min_interval: Duration,
    /// Concurrent partial translations per language pair; the oldest is
    /// cancelled beyond this.
    pub max_inflight_per_pair: usize,
    /// A new partial shorter than this fraction of the previous one is a
    /// recognizer reset.
    pub reset_length_ratio: f64,
    /// Prefix length compared for reset detection.
    pub reset_prefix_chars: usize,
    pub grammar_timeout: Duration,
    /// Window after a broadcast final during which the next final may be
    /// deduplicated against its tail.
    pub continuation_window: Duration,
    pub detect_scripture: bool,
}

impl CoordinatorSettings {
    pub fn for_source(source_lang: &str) -> Self {
        Self {
            source_lang: source_lang.to_string(),
            partial_min_growth: 2,
            partial_min_interval: Duration::from_millis(150),
            max_inflight_per_pair: 5,
            reset_length_ratio: 0.6,
            reset_prefix_chars: 50,
            grammar_timeout: Duration::from_millis(2000),
            continuation_window: Duration::from_millis(3000),
            detect_scripture: false,
        }
    }

    fn grammar_applies(&self) -> bool {
        self.source_lang.starts_with("en")
    }
}

/// What the coordinator hands back to the session for broadcasting.
#[derive(Debug)]
pub enum CoordinatorEvent {
    /// One partial `translation` event, ready for seq stamping.
    Partial(TranslationEvent),
    /// Everything produced for one committed utterance: one event per
    /// language, emitted together so the broadcaster can confirm the
    /// commit exactly once.
    Final {
        segment: SegmentId,
        commit_id: String,
        events: Vec<TranslationEvent>,
        scripture: Option<ScriptureEvent>,
    },
    /// A grammar-corrected candidate for the finality gate.
    GrammarCandidate { segment: SegmentId, text: String },
}

struct FinalJob {
    utterance: CommittedUtterance,
    targets: Vec<String>,
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Fans committed utterances out to the per-language translation workers,
/// throttles partial retranslation, and deduplicates consecutive finals.
///
/// Owned by the session actor; results come back through the event channel
/// so they re-enter the session's serialization point.
pub struct TranslationCoordinator {
    settings: CoordinatorSettings,
    translator: Option<Arc<dyn Translator>>,
    grammar: Option<Arc<dyn GrammarCorrector>>,
    events_tx: mpsc::Sender<CoordinatorEvent>,
    final_tx: mpsc::Sender<FinalJob>,
    _final_worker: AbortOnDrop,

    // Partial throttle state for the open segment.
    last_sent_text: String,
    last_emit_at: Option<Instant>,
    emitted_segment: Option<SegmentId>,
    /// In-flight partial translations per target language.
    inflight: HashMap<String, VecDeque<tokio::task::AbortHandle>>,
}

impl TranslationCoordinator {
    pub fn new(
        settings: CoordinatorSettings,
        translator: Option<Arc<dyn Translator>>,
        grammar: Option<Arc<dyn GrammarCorrector>>,
        events_tx: mpsc::Sender<CoordinatorEvent>,
    ) -> Self {
        let (final_tx, final_rx) = mpsc::channel(64);
        let worker = FinalWorker {
            settings: settings.clone(),
            translator: translator.clone(),
            grammar: grammar.clone(),
            events_tx: events_tx.clone(),
            scripture: settings
                .detect_scripture
                .then(ScriptureDetector::new),
            last_commit: None,
        };
        let handle = tokio::spawn(worker.run(final_rx));

        Self {
            settings,
            translator,
            grammar,
            events_tx,
            final_tx,
            _final_worker: AbortOnDrop(handle),
            last_sent_text: String::new(),
            last_emit_at: None,
            emitted_segment: None,
            inflight: HashMap::new(),
        }
    }

    /// A live partial for the open segment. Applies reset detection and
    /// throttling, then fans the surviving text out to every target.
    pub fn on_partial(&mut self, segment: SegmentId, partial: &str, targets: &[String]) {
        let now = Instant::now();

        if self.detect_reset(partial) {
            debug!("partial reset detected, cancelling in-flight translations");
            self.cancel_inflight();
            self.last_sent_text.clear();
            self.last_emit_at = None;
        }

        let first_for_segment = self.emitted_segment != Some(segment);
        let grew = partial.chars().count()
            >= self.last_sent_text.chars().count() + self.settings.partial_min_growth;
        let interval_ok = self
            .last_emit_at
            .is_none_or(|at| now.duration_since(at) >= self.settings.partial_min_interval);
        if !first_for_segment && !(grew && interval_ok) {
            return;
        }

        self.last_sent_text = partial.to_string();
        self.last_emit_at = Some(now);
        self.emitted_segment = Some(segment);

        // Host-facing source event goes out regardless of workers.
        let mut source_event = TranslationEvent::new(
            segment,
            partial,
            &self.settings.source_lang,
            &self.settings.source_lang,
        );
        source_event.is_partial = true;
        self.send_event(CoordinatorEvent::Partial(source_event));

        for target in targets {
            if *target == self.settings.source_lang {
                continue;
            }
            self.spawn_partial_translation(segment, partial, target);
        }

        if self.settings.grammar_applies() {
            self.spawn_partial_grammar(segment, partial);
        }
    }

    /// A committed utterance. Cancels the segment's in-flight partial
    /// translations and queues the final fan-out (processed in commit
    /// order by a dedicated worker).
    pub async fn on_commit(&mut self, utterance: CommittedUtterance, targets: Vec<String>) {
        self.cancel_inflight();
        self.last_sent_text.clear();
        self.last_emit_at = None;
        self.emitted_segment = None;

        if self
            .final_tx
            .send(FinalJob { utterance, targets })
            .await
            .is_err()
        {
            warn!("final translation worker gone; dropping commit fan-out");
        }
    }

    fn detect_reset(&self, partial: &str) -> bool {
        if self.last_sent_text.is_empty() {
            return false;
        }
        let prev: Vec<char> = self.last_sent_text.to_lowercase().chars().collect();
        let new: Vec<char> = partial.to_lowercase().chars().collect();
        if (new.len() as f64) < self.settings.reset_length_ratio * prev.len() as f64 {
            return true;
        }
        let check = self.settings.reset_prefix_chars.min(prev.len()).min(new.len());
        prev[..check] != new[..check]
    }

    fn spawn_partial_translation(&mut self, segment: SegmentId, partial: &str, target: &str) {
        let mut event = TranslationEvent::new(
            segment,
            partial,
            &self.settings.source_lang,
            target,
        );
        event.is_partial = true;

        let Some(translator) = self.translator.clone() else {
            // Translation disabled: the partial still goes out, marked as
            // untranslated. Silent dropping is prohibited.
            self.send_event(CoordinatorEvent::Partial(event));
            return;
        };

        let req = TranslationRequest {
            text: partial.to_string(),
            source_lang: self.settings.source_lang.clone(),
            target_lang: target.to_string(),
        };
        let events_tx = self.events_tx.clone();
        let original = partial.to_string();
        let handle = tokio::spawn(async move {
            match translator.translate_partial(req).await {
                Ok(translated) => {
                    event.translated_text = Some(translated);
                    event.has_translation = true;
                }
                Err(TranslateError::Cancelled) => return,
                Err(e) => {
                    debug!(%e, "partial translation failed, emitting source text");
                    event.translated_text = Some(original);
                    event.translation_error = Some(true);
                }
            }
            let _ = events_tx.send(CoordinatorEvent::Partial(event)).await;
        });

        let queue = self.inflight.entry(target.to_string()).or_default();
        queue.push_back(handle.abort_handle());
        while queue.len() > self.settings.max_inflight_per_pair {
            if let Some(oldest) = queue.pop_front() {
                debug!(%target, "in-flight cap exceeded, cancelling oldest partial translation");
                oldest.abort();
            }
        }
    }

    fn spawn_partial_grammar(&mut self, segment: SegmentId, partial: &str) {
        let Some(grammar) = self.grammar.clone() else {
            return;
        };
        let events_tx = self.events_tx.clone();
        let source_lang = self.settings.source_lang.clone();
        let budget = self.settings.grammar_timeout;
        let original = partial.to_string();
        tokio::spawn(async move {
            let corrected = match timeout(budget, grammar.correct_partial(&original)).await {
                Ok(Ok(corrected)) if corrected != original => corrected,
                // Fallback is the original text, which already went out.
                _ => return,
            };
            let _ = events_tx
                .send(CoordinatorEvent::GrammarCandidate {
                    segment,
                    text: corrected.clone(),
                })
                .await;

            let mut event = TranslationEvent::new(segment, &original, &source_lang, &source_lang);
            event.is_partial = true;
            event.corrected_text = Some(corrected);
            event.has_correction = true;
            event.update_type = Some("grammar".to_string());
            let _ = events_tx.send(CoordinatorEvent::Partial(event)).await;
        });
    }

    fn cancel_inflight(&mut self) {
        for (_, queue) in self.inflight.iter_mut() {
            for handle in queue.drain(..) {
                handle.abort();
            }
        }
    }

    fn send_event(&self, event: CoordinatorEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            warn!(%e, "coordinator event channel saturated, dropping event");
        }
    }
}

/// Processes committed utterances strictly in commit order: grammar, tail
/// dedup, per-language fan-out, event assembly.
struct FinalWorker {
    settings: CoordinatorSettings,
    translator: Option<Arc<dyn Translator>>,
    grammar: Option<Arc<dyn GrammarCorrector>>,
    events_tx: mpsc::Sender<CoordinatorEvent>,
    scripture: Option<ScriptureDetector>,
    last_commit: Option<LastCommit>,
}

impl FinalWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<FinalJob>) {
        while let Some(job) = rx.recv().await {
            self.process(job).await;
        }
        debug!("final translation worker stopped");
    }

    async fn process(&mut self, job: FinalJob) {
        let FinalJob { utterance, targets } = job;
        let original = utterance.text.clone();

        let corrected = self.correct(&original).await;
        let source_text = corrected.clone().unwrap_or_else(|| original.clone());

        let emit_text = self.dedup_against_last(&source_text, utterance.source);
        let forced = utterance.source == CandidateSource::Forced;

        let mut events = Vec::with_capacity(targets.len() + 1);

        let mut source_event = TranslationEvent::new(
            utterance.segment,
            &emit_text,
            &self.settings.source_lang,
            &self.settings.source_lang,
        );
        source_event.corrected_text = corrected.clone();
        source_event.has_correction = corrected.is_some();
        if forced {
            source_event.force_final = Some(true);
        }
        events.push(source_event);

        let translations = self.translate_all(&emit_text, &targets).await;
        for (target, outcome) in translations {
            let mut event = TranslationEvent::new(
                utterance.segment,
                &emit_text,
                &self.settings.source_lang,
                &target,
            );
            event.corrected_text = corrected.clone();
            event.has_correction = corrected.is_some();
            if forced {
                event.force_final = Some(true);
            }
            match outcome {
                Ok(translated) => {
                    event.translated_text = Some(translated);
                    event.has_translation = true;
                }
                Err(TranslateError::Disabled) => {}
                Err(e) => {
                    info!(%target, %e, "final translation failed, emitting source text");
                    event.translated_text = Some(emit_text.clone());
                    event.translation_error = Some(true);
                }
            }
            events.push(event);
        }

        let scripture = self
            .scripture
            .as_ref()
            .and_then(|detector| detector.detect(&source_text));

        let _ = self
            .events_tx
            .send(CoordinatorEvent::Final {
                segment: utterance.segment,
                commit_id: utterance.commit_id,
                events,
                scripture,
            })
            .await;
    }

    async fn correct(&self, original: &str) -> Option<String> {
        if !self.settings.grammar_applies() {
            return None;
        }
        let grammar = self.grammar.as_ref()?;
        match timeout(self.settings.grammar_timeout, grammar.correct_final(original)).await {
            Ok(Ok(corrected)) if !corrected.is_empty() && corrected != original => Some(corrected),
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                debug!(%e, "grammar correction failed, keeping original");
                None
            }
            Err(_) => {
                debug!("grammar correction timed out, keeping original");
                None
            }
        }
    }

    /// Tail-dedup against the previous commit within the continuation
    /// window. Forced commits break continuation in both directions: a
    /// forced commit is never shortened, and nothing merges into one.
    fn dedup_against_last(&mut self, text: &str, source: CandidateSource) -> String {
        let now = Instant::now();
        let emit = match &self.last_commit {
            Some(prev)
                if source != CandidateSource::Forced
                    && !prev.forced
                    && now.duration_since(prev.at) <= self.settings.continuation_window =>
            {
                continuation_delta(&prev.text, text)
            }
            _ => None,
        }
        .unwrap_or_else(|| text.to_string());

        self.last_commit = Some(LastCommit {
            text: text.to_string(),
            at: now,
            forced: source == CandidateSource::Forced,
        });
        emit
    }

    async fn translate_all(
        &self,
        text: &str,
        targets: &[String],
    ) -> Vec<(String, Result<String, TranslateError>)> {
        let jobs = targets
            .iter()
            .filter(|t| **t != self.settings.source_lang)
            .map(|target| {
                let target = target.clone();
                let translator = self.translator.clone();
                let req = TranslationRequest {
                    text: text.to_string(),
                    source_lang: self.settings.source_lang.clone(),
                    target_lang: target.clone(),
                };
                async move {
                    let outcome = match translator {
                        Some(t) => t.translate_final(req).await,
                        None => Err(TranslateError::Disabled),
                    };
                    (target, outcome)
                }
            });
        futures::future::join_all(jobs).await
    }
}

/// The part of `next` worth broadcasting when it continues `prev`:
/// the suffix beyond an exact (case/whitespace-insensitive) restatement,
/// or the overlap-merge remainder when it gains at least 3 characters.
fn continuation_delta(prev: &str, next: &str) -> Option<String> {
    let prev_n = text::normalize(prev);
    let next_n = text::normalize(next);
    if next_n.starts_with(&prev_n) && next_n.chars().count() > prev_n.chars().count() {
        let prev_chars = text::squash_ws(prev).chars().count();
        let delta: String = text::squash_ws(next).chars().skip(prev_chars).collect();
        let delta = delta.trim().to_string();
        if !delta.is_empty() {
            return Some(delta);
        }
        return None;
    }

    let merged = text::merge_with_overlap(prev, next)?;
    let gained = merged.chars().count().saturating_sub(prev.chars().count());
    if gained >= 3 {
        let delta: String = merged.chars().skip(prev.chars().count()).collect();
        let delta = delta.trim().to_string();
        if !delta.is_empty() {
            return Some(delta);
        }
    }
    None
}
