use tokio::time::Instant;

use crate::text;

/// Stable view of the tracker, taken when finalization needs to reason
/// about partials without holding the live fields.
#[derive(Debug, Clone)]
pub struct PartialSnapshot {
    pub latest_text: String,
    pub latest_at: Option<Instant>,
    pub longest_text: String,
    pub longest_at: Option<Instant>,
}

/// A partial that extends a base text, plus what the base was missing.
#[derive(Debug, Clone)]
pub struct Extension {
    pub extended_text: String,
    pub missing_words: usize,
}

/// Per-segment partial history: the most recent partial and the longest
/// partial observed since the last commit.
#[derive(Debug, Default)]
pub struct PartialTracker {
    latest: Option<(String, Instant)>,
    longest: Option<(String, Instant)>,
}

impl PartialTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `text` as the latest partial; promotes it to longest when it
    /// outgrows the previous record. The latest may legitimately shrink
    /// after a recognizer reset.
    pub fn update_partial(&mut self, text: &str, now: Instant) {
        let is_longer = self
            .longest
            .as_ref()
            .is_none_or(|(longest, _)| text.chars().count() > longest.chars().count());
        if is_longer {
            self.longest = Some((text.to_string(), now));
        }
        self.latest = Some((text.to_string(), now));
    }

    /// Clears all fields. Called only immediately after a commit or before
    /// a new segment starts.
    pub fn reset(&mut self) {
        self.latest = None;
        self.longest = None;
    }

    pub fn snapshot(&self) -> PartialSnapshot {
        PartialSnapshot {
            latest_text: self.latest.as_ref().map(|(t, _)| t.clone()).unwrap_or_default(),
            latest_at: self.latest.as_ref().map(|(_, at)| *at),
            longest_text: self.longest.as_ref().map(|(t, _)| t.clone()).unwrap_or_default(),
            longest_at: self.longest.as_ref().map(|(_, at)| *at),
        }
    }

    pub fn latest_text(&self) -> Option<&str> {
        self.latest.as_ref().map(|(t, _)| t.as_str())
    }

    pub fn longest_text(&self) -> Option<&str> {
        self.longest.as_ref().map(|(t, _)| t.as_str())
    }

    /// Returns the longest partial as an extension of `base`, when it is
    /// fresh enough, strictly longer, and passes the extension match.
    pub fn check_longest_extends(
        &self,
        base: &str,
        max_age: tokio::time::Duration,
        now: Instant,
    ) -> Option<Extension> {
        check_extends(self.longest.as_ref(), base, max_age, now)
    }

    /// Same as [`check_longest_extends`](Self::check_longest_extends) for
    /// the most recent partial.
    pub fn check_latest_extends(
        &self,
        base: &str,
        max_age: tokio::time::Duration,
        now: Instant,
    ) -> Option<Extension> {
        check_extends(self.latest.as_ref(), base, max_age, now)
    }
}

fn check_extends(
    tracked: Option<&(String, Instant)>,
    base: &str,
    max_age: tokio::time::Duration,
    now: Instant,
) -> Option<Extension> {
    let (text, at) = tracked?;
    if now.duration_since(*at) > max_age {
        return None;
    }
    if text.chars().count() <= base.chars().count() {
        return None;
    }
    if !text::extends(base, text) {
        return None;
    }
    Some(Extension {
        extended_text: text.clone(),
        missing_words: text::added_word_count(base, text),
    })
}
