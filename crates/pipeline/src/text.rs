//! Text reconciliation utilities shared by the finalization and
//! forced-commit engines: prefix-extension checks and overlap merging of
//! transcript fragments that the recognizer re-emitted with silent gaps.

/// Suffixes accepted by the token-level stem match.
const STEM_SUFFIXES: [&str; 6] = ["ing", "ed", "er", "s", "es", "ly"];

/// Longest overlap scanned by [`merge_with_overlap`].
const MAX_OVERLAP_SCAN: usize = 200;

/// Collapses runs of whitespace into single spaces and trims the ends.
pub fn squash_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Single-spaced lowercase form used for loose comparisons.
pub fn normalize(s: &str) -> String {
    squash_ws(&s.to_lowercase())
}

/// True when the text ends with a terminal sentence mark (`.` `!` `?` `…`),
/// possibly followed by closing quotes or brackets.
pub fn ends_with_complete_sentence(s: &str) -> bool {
    let trimmed = s.trim_end();
    let mut chars = trimmed.chars().rev();
    for c in chars.by_ref() {
        match c {
            '"' | '\'' | '\u{201d}' | '\u{2019}' | '»' | ')' | ']' => continue,
            '.' | '!' | '?' | '…' => return true,
            _ => return false,
        }
    }
    false
}

/// True when the text was likely cut mid-word: the last character is
/// alphanumeric rather than whitespace or punctuation.
pub fn ends_mid_word(s: &str) -> bool {
    s.chars().next_back().is_some_and(|c| c.is_alphanumeric())
}

/// True when `a` and `b` are the same word under the stem rule: one is the
/// other plus a single common suffix.
fn stem_equal(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let (short, long) = if a.len() < b.len() { (a, b) } else { (b, a) };
    long.strip_prefix(short)
        .is_some_and(|rest| STEM_SUFFIXES.contains(&rest))
}

/// Extension match: does `candidate` begin with `base`?
///
/// Tried in order: exact prefix, whitespace-normalized lowercase prefix,
/// case-preserving prefix over the normalized forms, then a token-level
/// pass where `candidate`'s leading tokens must equal `base`'s tokens
/// exactly or under the stem rule.
pub fn extends(base: &str, candidate: &str) -> bool {
    if base.is_empty() {
        return true;
    }
    if candidate.starts_with(base) {
        return true;
    }

    let base_n = normalize(base);
    let cand_n = normalize(candidate);
    if cand_n.starts_with(&base_n) {
        return true;
    }

    // Case-preserving prefix over squashed whitespace; only meaningful for
    // bases long enough that a coincidental match is unlikely.
    let base_s = squash_ws(base);
    let cand_s = squash_ws(candidate);
    if base_s.chars().count() > 5 {
        let prefix: String = cand_s.chars().take(base_s.chars().count()).collect();
        if prefix == base_s {
            return true;
        }
    }

    // Token-level: candidate's first |base| tokens match base's tokens
    // exactly or by stem.
    let base_tokens: Vec<String> = base_n.split(' ').map(str::to_string).collect();
    let cand_tokens: Vec<String> = cand_n.split(' ').map(str::to_string).collect();
    if cand_tokens.len() < base_tokens.len() {
        return false;
    }
    base_tokens
        .iter()
        .zip(cand_tokens.iter())
        .all(|(b, c)| stem_equal(b, c))
}

/// Lowercased content words (longer than `min_len` characters).
fn content_words(s: &str, min_len: usize) -> Vec<String> {
    normalize(s)
        .split(' ')
        .filter(|w| w.chars().count() > min_len)
        .map(str::to_string)
        .collect()
}

/// Merges two fragments that overlap at the boundary.
///
/// Returns the merged text, or `None` when no safe merge exists. The
/// refusal is deliberately conservative: a wrong merge duplicates or
/// interleaves words in the committed transcript, while a refused merge
/// only costs a second event.
pub fn merge_with_overlap(prev: &str, next: &str) -> Option<String> {
    if next.is_empty() {
        return Some(prev.to_string());
    }
    if prev.is_empty() {
        return Some(next.to_string());
    }

    // 1. `next` restates `prev` from the start.
    if next.starts_with(prev) || normalize(next).starts_with(&normalize(prev)) {
        return Some(next.to_string());
    }

    let prev_chars: Vec<char> = prev.chars().collect();
    let next_chars: Vec<char> = next.chars().collect();

    // 2. Scan suffix-of-prev == prefix-of-next overlaps, longest first.
    let max_l = prev_chars.len().min(next_chars.len()).min(MAX_OVERLAP_SCAN);
    for l in (3..=max_l).rev() {
        let tail: String = prev_chars[prev_chars.len() - l..].iter().collect();
        let head: String = next_chars[..l].iter().collect();
        let matched = tail == head
            || tail.to_lowercase() == head.to_lowercase()
            || (l >= 5 && normalize(&tail) == normalize(&head));
        if matched {
            let rest: String = next_chars[l..].iter().collect();
            return Some(format!("{prev}{rest}"));
        }
    }

    // 3. A much longer `next` sharing almost no vocabulary with `prev` is a
    //    different utterance, not a lossy continuation.
    if next_chars.len() as f64 > 1.5 * prev_chars.len() as f64 {
        let prev_words = content_words(prev, 2);
        let next_words = content_words(next, 2);
        let shared = prev_words
            .iter()
            .filter(|w| next_words.contains(w))
            .count();
        let required = 2.min((0.3 * prev_words.len() as f64).floor() as usize);
        if shared < required {
            return None;
        }
    }

    None
}

/// Number of whitespace-separated words in `extended` beyond `base`.
pub fn added_word_count(base: &str, extended: &str) -> usize {
    let base_words = squash_ws(base).split(' ').filter(|w| !w.is_empty()).count();
    let ext_words = squash_ws(extended)
        .split(' ')
        .filter(|w| !w.is_empty())
        .count();
    ext_words.saturating_sub(base_words)
}
