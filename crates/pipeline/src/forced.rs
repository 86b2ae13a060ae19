use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::config::PipelineConfig;
use crate::partials::PartialTracker;
use crate::text;

/// Effects requested by the forced-commit engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForcedEffect {
    /// Commit this text with `source=Forced` right now.
    Commit { text: String },
    /// Arm the safety timer for the buffered forced final.
    Schedule { generation: u64, delay: Duration },
    /// The buffered forced text merged into an incoming recognizer final;
    /// hand the merged text to the finalization engine instead of the
    /// original.
    ReplaceIncomingFinal { text: String },
}

/// Buffers `Forced` events (a recognizer restart flushed an uncommitted
/// partial) so an utterance is not fragmented across restarts: the buffered
/// text either merges with the next partial/final or commits on a safety
/// timeout.
#[derive(Debug)]
pub struct ForcedCommitEngine {
    cfg: PipelineConfig,
    buffer: Option<(String, Instant)>,
    generation: u64,
}

impl ForcedCommitEngine {
    pub fn new(cfg: PipelineConfig) -> Self {
        Self {
            cfg,
            buffer: None,
            generation: 0,
        }
    }

    pub fn has_buffer(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn buffered_text(&self) -> Option<&str> {
        self.buffer.as_ref().map(|(t, _)| t.as_str())
    }

    pub fn clear(&mut self) {
        self.buffer = None;
        self.generation += 1;
    }

    fn schedule(&mut self) -> ForcedEffect {
        self.generation += 1;
        ForcedEffect::Schedule {
            generation: self.generation,
            delay: Duration::from_millis(self.cfg.forced_final_max_wait_ms),
        }
    }

    /// A `Forced` event arrived from the recognizer adapter.
    pub fn on_forced(
        &mut self,
        raw: &str,
        tracker: &PartialTracker,
        now: Instant,
    ) -> Vec<ForcedEffect> {
        let mut t = raw.to_string();
        if let Some(ext) = tracker.check_longest_extends(
            &t,
            Duration::from_millis(self.cfg.latest_partial_max_age_ms),
            now,
        ) {
            t = ext.extended_text;
        }

        if text::ends_with_complete_sentence(&t) {
            self.clear();
            return vec![ForcedEffect::Commit { text: t }];
        }

        debug!("buffering sentence-incomplete forced final");
        self.buffer = Some((t, now));
        vec![self.schedule()]
    }

    /// A partial arrived while a forced final is buffered. Returns the
    /// effects plus whether the partial was consumed by the merge (and so
    /// must not be processed as a normal partial).
    pub fn on_partial(&mut self, partial: &str) -> (Vec<ForcedEffect>, bool) {
        let Some((buffered, _)) = self.buffer.as_ref() else {
            return (vec![], false);
        };

        if text::extends(buffered, partial) && partial.chars().count() >= buffered.chars().count() {
            let text = partial.to_string();
            self.clear();
            return (vec![ForcedEffect::Commit { text }], true);
        }

        if let Some(merged) = text::merge_with_overlap(buffered, partial) {
            self.clear();
            return (vec![ForcedEffect::Commit { text: merged }], true);
        }

        // New utterance: flush the buffer unchanged; the partial proceeds
        // through the normal path.
        let text = buffered.clone();
        self.clear();
        (vec![ForcedEffect::Commit { text }], false)
    }

    /// A recognizer `Final` arrived while a forced final is buffered.
    pub fn on_final(&mut self, final_text: &str) -> Vec<ForcedEffect> {
        let Some((buffered, _)) = self.buffer.as_ref() else {
            return vec![];
        };

        if let Some(merged) = text::merge_with_overlap(buffered, final_text) {
            self.clear();
            return vec![ForcedEffect::ReplaceIncomingFinal { text: merged }];
        }

        let text = buffered.clone();
        self.clear();
        vec![ForcedEffect::Commit { text }]
    }

    /// Safety timer fired: commit the buffer as-is.
    pub fn on_timer(&mut self, generation: u64) -> Vec<ForcedEffect> {
        if generation != self.generation {
            return vec![];
        }
        let Some((text, _)) = self.buffer.take() else {
            return vec![];
        };
        debug!("forced final safety timeout, committing buffered text");
        vec![ForcedEffect::Commit { text }]
    }
}
