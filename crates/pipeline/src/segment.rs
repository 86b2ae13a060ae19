use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Monotonic per-session identity of one utterance: the unit between two
/// commits. Assigned when a segment opens and carried through candidates,
/// gate state and outbound events.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct SegmentId(pub u64);

impl SegmentId {
    pub fn next(self) -> SegmentId {
        SegmentId(self.0 + 1)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg-{}", self.0)
    }
}

/// Which async producer proposed a commit candidate. Declaration order is
/// priority order: later variants dominate earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Grammar,
    Forced,
    Recovery,
    AsrFinal,
}

impl fmt::Display for CandidateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CandidateSource::Grammar => "grammar",
            CandidateSource::Forced => "forced",
            CandidateSource::Recovery => "recovery",
            CandidateSource::AsrFinal => "asr_final",
        };
        f.write_str(name)
    }
}

/// A proposed final text for a segment.
#[derive(Debug, Clone)]
pub struct CommitCandidate {
    pub segment: SegmentId,
    pub text: String,
    pub source: CandidateSource,
    pub at: Instant,
}

impl CommitCandidate {
    /// Strict dominance: higher priority wins; equal priority falls back to
    /// strictly longer text.
    pub fn beats(&self, other: &CommitCandidate) -> bool {
        if self.source != other.source {
            return self.source > other.source;
        }
        self.text.chars().count() > other.text.chars().count()
    }
}

/// The authoritative output of the finality gate for one segment.
#[derive(Debug, Clone)]
pub struct CommittedUtterance {
    pub segment: SegmentId,
    pub commit_id: String,
    pub text: String,
    pub source: CandidateSource,
}

/// The most recently broadcast final, kept for continuation merging and
/// leading-overlap dedup of the next final.
#[derive(Debug, Clone)]
pub struct LastCommit {
    pub text: String,
    pub at: Instant,
    /// Forced commits break continuation; the next final never merges into
    /// one.
    pub forced: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn priority_ordering() {
        assert!(CandidateSource::AsrFinal > CandidateSource::Recovery);
        assert!(CandidateSource::Recovery > CandidateSource::Forced);
        assert!(CandidateSource::Forced > CandidateSource::Grammar);
    }

    #[tokio::test(start_paused = true)]
    async fn same_priority_longer_text_wins() {
        let now = Instant::now();
        let short = CommitCandidate {
            segment: SegmentId(1),
            text: "where two".into(),
            source: CandidateSource::AsrFinal,
            at: now,
        };
        let long = CommitCandidate {
            segment: SegmentId(1),
            text: "where two or three".into(),
            source: CandidateSource::AsrFinal,
            at: now,
        };
        assert!(long.beats(&short));
        assert!(!short.beats(&long));
        assert!(!short.beats(&short.clone()));
    }
}
