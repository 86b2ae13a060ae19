use tokio::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::partials::PartialTracker;
use crate::text;

/// Minimum added characters for an overlap merge to replace a final.
const MIN_MERGE_GAIN_CHARS: usize = 3;

/// Quiet period after the previous final before a non-extending final may
/// force the pending one out.
const NON_EXTENDING_GRACE: Duration = Duration::from_millis(600);

/// A non-extending final arriving within this window keeps a
/// sentence-incomplete, never-extended pending final waiting.
const SENTENCE_INCOMPLETE_HOLD: Duration = Duration::from_millis(3000);

/// Window after the first candidate during which a non-extending partial
/// still stretches the wait.
const PARTIAL_STRETCH_WINDOW: Duration = Duration::from_millis(5000);

/// What the engine wants done after digesting an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeEffect {
    /// (Re)arm the finalization timer. Stale generations must be ignored
    /// when they fire.
    Schedule { generation: u64, delay: Duration },
    /// Submit this text as the segment's `AsrFinal` commit candidate.
    Commit { text: String },
}

#[derive(Debug)]
struct PendingFinal {
    text: String,
    /// When the wait window opened.
    first_at: Instant,
    /// Arrival of the most recent recognizer final folded into `text`.
    last_final_at: Instant,
    extended_count: u32,
}

/// Turns the recognizer's lossy stream of `Final` events plus late partials
/// into exactly one best commit candidate per utterance, within a bounded
/// deadline.
#[derive(Debug)]
pub struct FinalizationEngine {
    cfg: PipelineConfig,
    pending: Option<PendingFinal>,
    generation: u64,
}

impl FinalizationEngine {
    pub fn new(cfg: PipelineConfig) -> Self {
        Self {
            cfg,
            pending: None,
            generation: 0,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending_text(&self) -> Option<&str> {
        self.pending.as_ref().map(|p| p.text.as_str())
    }

    /// Drops any pending final. Called when another producer (forced,
    /// recovery) committed the segment out from under the engine.
    pub fn clear_pending(&mut self) {
        self.pending = None;
        self.generation += 1;
    }

    fn longest_window(&self) -> Duration {
        Duration::from_millis(self.cfg.longest_partial_max_age_ms)
    }

    fn latest_window(&self) -> Duration {
        Duration::from_millis(self.cfg.latest_partial_max_age_ms)
    }

    /// Wait-window policy for a final with text `t`.
    fn wait_for(&self, t: &str) -> Duration {
        let len = t.chars().count() as u64;
        let base = if len > 300 {
            3500.min(1000 + 3 * (len - 300))
        } else if len > 200 {
            1800
        } else {
            1000
        };
        let mut wait = base;
        if !text::ends_with_complete_sentence(t) {
            wait = wait.max((20 * len).clamp(4000, 8000));
        }
        if text::ends_mid_word(t) {
            wait = wait.max(1200);
        }
        Duration::from_millis(wait)
    }

    /// Tries to recover words the recognizer silently dropped from a final,
    /// using the tracked partials: prefix extension first, then an overlap
    /// merge that must gain at least a few characters.
    fn pre_extend(&self, t: &str, tracker: &PartialTracker, now: Instant) -> String {
        if let Some(ext) = tracker
            .check_longest_extends(t, self.longest_window(), now)
            .or_else(|| tracker.check_latest_extends(t, self.latest_window(), now))
        {
            info!(
                missing_words = ext.missing_words,
                "final extended from tracked partial"
            );
            return ext.extended_text;
        }

        for source in [tracker.longest_text(), tracker.latest_text()] {
            let Some(partial) = source else { continue };
            if let Some(merged) = text::merge_with_overlap(t, partial)
                && merged.chars().count() >= t.chars().count() + MIN_MERGE_GAIN_CHARS
            {
                debug!("final extended via overlap merge with partial");
                return merged;
            }
        }
        t.to_string()
    }

    fn schedule(&mut self, delay: Duration) -> FinalizeEffect {
        self.generation += 1;
        FinalizeEffect::Schedule {
            generation: self.generation,
            delay,
        }
    }

    /// A non-forced `Final` arrived.
    pub fn on_final(
        &mut self,
        raw: &str,
        tracker: &PartialTracker,
        now: Instant,
    ) -> Vec<FinalizeEffect> {
        let t = self.pre_extend(raw, tracker, now);

        let Some(pending) = self.pending.as_mut() else {
            let delay = self.wait_for(&t);
            self.pending = Some(PendingFinal {
                text: t,
                first_at: now,
                last_final_at: now,
                extended_count: 0,
            });
            return vec![self.schedule(delay)];
        };

        // Longer restatement of the pending final: fold it in and restart
        // the wait under the new text's policy.
        if text::extends(&pending.text, &t) {
            if t.chars().count() > pending.text.chars().count() {
                pending.text = t;
                pending.extended_count += 1;
            }
            pending.last_final_at = now;
            let delay = self.wait_for(&self.pending.as_ref().unwrap().text);
            return vec![self.schedule(delay)];
        }

        if let Some(merged) = text::merge_with_overlap(&pending.text, &t)
            && merged.chars().count() >= pending.text.chars().count() + MIN_MERGE_GAIN_CHARS
        {
            pending.text = merged;
            pending.extended_count += 1;
            pending.last_final_at = now;
            let delay = self.wait_for(&self.pending.as_ref().unwrap().text);
            return vec![self.schedule(delay)];
        }

        let since_final = now.duration_since(pending.last_final_at);
        if since_final < NON_EXTENDING_GRACE {
            debug!("non-extending final inside grace period, still waiting");
            return vec![];
        }

        // Keep an incomplete, never-extended pending alive a little longer;
        // the recognizer often re-emits the sentence end moments later.
        if !text::ends_with_complete_sentence(&pending.text)
            && pending.extended_count == 0
            && since_final < SENTENCE_INCOMPLETE_HOLD
        {
            debug!("holding sentence-incomplete pending final");
            return vec![];
        }

        // Flush the pending final (upgraded with the freshest extending
        // partial, if any) and open a new wait for the incoming one.
        let commit_text = {
            let pending = self.pending.take().expect("pending checked above");
            tracker
                .check_longest_extends(&pending.text, self.longest_window(), now)
                .or_else(|| tracker.check_latest_extends(&pending.text, self.latest_window(), now))
                .map(|ext| ext.extended_text)
                .unwrap_or(pending.text)
        };

        let delay = self.wait_for(&t);
        self.pending = Some(PendingFinal {
            text: t,
            first_at: now,
            last_final_at: now,
            extended_count: 0,
        });
        vec![FinalizeEffect::Commit { text: commit_text }, self.schedule(delay)]
    }

    /// A partial arrived while a final is pending. The caller has already
    /// fed the partial to the tracker.
    pub fn on_partial(
        &mut self,
        partial: &str,
        _tracker: &PartialTracker,
        now: Instant,
    ) -> Vec<FinalizeEffect> {
        let Some(pending) = self.pending.as_mut() else {
            return vec![];
        };

        if text::extends(&pending.text, partial)
            && partial.chars().count() > pending.text.chars().count()
        {
            pending.text = partial.to_string();
            let delay = self.wait_for(&self.pending.as_ref().unwrap().text);
            return vec![self.schedule(delay)];
        }

        let age = now.duration_since(pending.first_at);
        if !text::ends_with_complete_sentence(&pending.text) && age < PARTIAL_STRETCH_WINDOW {
            // Stretch the wait so the timer can retry extension once this
            // partial has settled, but never past the hard ceiling.
            let elapsed_ms = age.as_millis() as u64;
            let upper = self
                .cfg
                .max_finalization_wait_ms
                .saturating_sub(elapsed_ms)
                .max(1000);
            let delay_ms = 2500u64.saturating_sub(elapsed_ms).clamp(1000, upper);
            return vec![self.schedule(Duration::from_millis(delay_ms))];
        }

        vec![]
    }

    /// The finalization timer fired.
    pub fn on_timer(
        &mut self,
        generation: u64,
        tracker: &PartialTracker,
        now: Instant,
    ) -> Vec<FinalizeEffect> {
        if generation != self.generation {
            return vec![];
        }
        let longest_window = self.longest_window();
        let latest_window = self.latest_window();
        let ceiling = Duration::from_millis(self.cfg.max_finalization_wait_ms);
        let cap = Duration::from_millis(self.cfg.finalization_reschedule_cap_ms);

        let Some(pending) = self.pending.as_mut() else {
            return vec![];
        };

        // Last chance to pick up a partial that outran the final.
        if let Some(ext) = tracker
            .check_longest_extends(&pending.text, longest_window, now)
            .or_else(|| tracker.check_latest_extends(&pending.text, latest_window, now))
        {
            pending.text = ext.extended_text;
        }

        let elapsed = now.duration_since(pending.first_at);
        if text::ends_with_complete_sentence(&pending.text) || elapsed >= ceiling {
            let pending = self.pending.take().expect("pending checked above");
            return vec![FinalizeEffect::Commit { text: pending.text }];
        }

        let remaining = ceiling - elapsed;
        let delay = remaining.min(cap);
        debug!(?delay, "pending final still incomplete, rescheduling");
        vec![self.schedule(delay)]
    }
}
