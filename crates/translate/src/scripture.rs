use regex::Regex;
use tracing::debug;

use crate::events::{ScriptureEvent, ScriptureReference};

/// Book names and the abbreviations speakers actually use.
const BOOKS: [(&str, &[&str]); 20] = [
    ("Genesis", &["genesis", "gen"]),
    ("Exodus", &["exodus", "ex"]),
    ("Deuteronomy", &["deuteronomy", "deut"]),
    ("Psalms", &["psalms", "psalm", "ps"]),
    ("Proverbs", &["proverbs", "prov"]),
    ("Isaiah", &["isaiah", "isa"]),
    ("Jeremiah", &["jeremiah", "jer"]),
    ("Daniel", &["daniel", "dan"]),
    ("Matthew", &["matthew", "matt", "mt"]),
    ("Mark", &["mark", "mk"]),
    ("Luke", &["luke", "lk"]),
    ("John", &["john", "jn"]),
    ("Acts", &["acts"]),
    ("Romans", &["romans", "rom"]),
    ("Corinthians", &["corinthians", "cor"]),
    ("Galatians", &["galatians", "gal"]),
    ("Ephesians", &["ephesians", "eph"]),
    ("Philippians", &["philippians", "phil"]),
    ("Hebrews", &["hebrews", "heb"]),
    ("Revelation", &["revelation", "rev"]),
];

/// Detects explicit scripture references ("John 3:16", "Psalm 23") in
/// committed source text.
pub struct ScriptureDetector {
    pattern: Regex,
}

impl ScriptureDetector {
    pub fn new() -> Self {
        let names: Vec<&str> = BOOKS
            .iter()
            .flat_map(|(_, aliases)| aliases.iter().copied())
            .collect();
        // Optional leading ordinal covers "1 Corinthians 13" and friends.
        let pattern = Regex::new(&format!(
            r"(?i)\b(?:([123])\s+)?({})\.?\s+(\d{{1,3}})(?:\s*:\s*(\d{{1,3}}))?\b",
            names.join("|")
        ))
        .expect("scripture pattern is valid");
        Self { pattern }
    }

    pub fn detect(&self, text: &str) -> Option<ScriptureEvent> {
        let caps = self.pattern.captures(text)?;
        let ordinal = caps.get(1).map(|m| m.as_str().to_string());
        let raw_book = caps.get(2)?.as_str().to_lowercase();
        let chapter: u32 = caps.get(3)?.as_str().parse().ok()?;
        let verse: Option<u32> = caps.get(4).and_then(|m| m.as_str().parse().ok());

        let canonical = BOOKS
            .iter()
            .find(|(_, aliases)| aliases.contains(&raw_book.as_str()))
            .map(|(name, _)| *name)?;
        let book = match ordinal {
            Some(n) => format!("{n} {canonical}"),
            None => canonical.to_string(),
        };

        let (confidence, method) = if verse.is_some() {
            (0.92, "chapter-verse")
        } else {
            (0.6, "chapter-only")
        };

        let display_text = match verse {
            Some(v) => format!("{book} {chapter}:{v}"),
            None => format!("{book} {chapter}"),
        };
        debug!(%display_text, "scripture reference detected");

        Some(ScriptureEvent {
            event_type: "scriptureDetected".to_string(),
            reference: ScriptureReference {
                book,
                chapter,
                verse,
            },
            display_text,
            confidence,
            method: method.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            seq_id: 0,
        })
    }
}

impl Default for ScriptureDetector {
    fn default() -> Self {
        Self::new()
    }
}
