use dashmap::DashMap;
use tokio::time::{Duration, Instant};

/// Cache key for translated text. Long texts are bucketed by length class
/// plus their boundary content so that near-identical retranscriptions of
/// the same utterance hit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    source_lang: String,
    target_lang: String,
    length_class: usize,
    prefix: String,
    suffix: String,
}

/// Prefix length used for short texts.
const SHORT_PREFIX_LEN: usize = 150;
/// Texts below this length are keyed on prefix alone.
const SHORT_TEXT_LEN: usize = 300;
/// Boundary lengths for long texts.
const LONG_PREFIX_LEN: usize = 100;
const LONG_SUFFIX_LEN: usize = 100;

impl CacheKey {
    pub fn for_text(source_lang: &str, target_lang: &str, text: &str) -> Self {
        let chars: Vec<char> = text.chars().collect();
        let (prefix, suffix) = if chars.len() < SHORT_TEXT_LEN {
            (
                chars.iter().take(SHORT_PREFIX_LEN).collect::<String>(),
                String::new(),
            )
        } else {
            (
                chars.iter().take(LONG_PREFIX_LEN).collect::<String>(),
                chars[chars.len() - LONG_SUFFIX_LEN..].iter().collect::<String>(),
            )
        };
        Self {
            source_lang: source_lang.to_string(),
            target_lang: target_lang.to_string(),
            length_class: chars.len() / 100,
            prefix,
            suffix,
        }
    }
}

/// Bounded TTL cache, shared by all sessions of a worker and safe under
/// concurrent reads and writes.
#[derive(Debug)]
pub struct TranslationCache {
    entries: DashMap<CacheKey, (String, Instant)>,
    capacity: usize,
    ttl: Duration,
}

impl TranslationCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            ttl,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<String> {
        let entry = self.entries.get(key)?;
        let (text, expires_at) = entry.value();
        if Instant::now() >= *expires_at {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(text.clone())
    }

    pub fn insert(&self, key: CacheKey, text: String) {
        if self.entries.len() >= self.capacity {
            self.evict();
        }
        self.entries.insert(key, (text, Instant::now() + self.ttl));
    }

    /// Drops expired entries; when still over capacity, drops the entries
    /// closest to expiry.
    fn evict(&self) {
        let now = Instant::now();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
        while self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().1)
                .map(|e| e.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
