// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Collected records, their fingerprints, and deduplication.

use fnv::{FnvHashSet, FnvHasher};
use serde::{Deserialize, Serialize};
use std::hash::Hasher;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Number of normalized text characters that feed the fingerprint.
pub const FINGERPRINT_TEXT_CHARS: usize = 100;

/// The named orderings a collection run visits, in phase order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    /// Newest first.
    Recent,
    /// Lowest rating first.
    Worst,
    /// Highest rating first.
    Best,
}

impl SortKey {
    pub const ALL: [SortKey; 3] = [SortKey::Recent, SortKey::Worst, SortKey::Best];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recent => "recent",
            Self::Worst => "worst",
            Self::Best => "best",
        }
    }
}

impl std::fmt::Display for SortKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single collected record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Identifier assigned by the surface, when it exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub author: String,
    pub text: String,
    /// Star rating, usually 1-5.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f32>,
    /// Date string as displayed by the surface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    /// Phase that produced this item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<SortKey>,
}

impl Item {
    pub fn new(author: impl Into<String>, text: impl Into<String>, rating: Option<f32>) -> Self {
        Self {
            source_id: None,
            author: author.into(),
            text: text.into(),
            rating,
            date: None,
            phase: None,
        }
    }

    pub fn with_phase(mut self, phase: SortKey) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Content fingerprint using the default [`ContentFingerprinter`].
    pub fn fingerprint(&self) -> String {
        ContentFingerprinter.fingerprint(self)
    }
}

/// Derives the dedup identity of an item.
///
/// Two items describing the same content must produce the same key, no
/// matter which phase saw them or how the surface formatted them.
pub trait Fingerprinter: Send + Sync {
    fn fingerprint(&self, item: &Item) -> String;
}

/// Default fingerprint: author + truncated text + rating, normalized and
/// hashed with FNV-1a.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentFingerprinter;

impl Fingerprinter for ContentFingerprinter {
    fn fingerprint(&self, item: &Item) -> String {
        let author = normalize(&item.author);
        let text: String = normalize(&item.text)
            .chars()
            .take(FINGERPRINT_TEXT_CHARS)
            .collect();
        let rating = item
            .rating
            .map(|r| format!("{r:.1}"))
            .unwrap_or_else(|| "-".to_string());

        let mut hasher = FnvHasher::default();
        hasher.write(author.as_bytes());
        hasher.write_u8(0x1f);
        hasher.write(text.trim_end().as_bytes());
        hasher.write_u8(0x1f);
        hasher.write(rating.as_bytes());
        format!("{:016x}", hasher.finish())
    }
}

/// Lowercase, drop punctuation and symbols, collapse whitespace runs.
fn normalize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_space = false;
    for ch in s.chars() {
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(ch.to_lowercase());
        } else if ch.is_whitespace() {
            pending_space = true;
        }
    }
    out
}

/// Unique items accumulated during one phase.
///
/// The buffer is owned by the caller of the pagination loop so whatever it
/// holds survives a failure inside that loop.
pub struct ItemBuffer {
    items: Vec<Item>,
    seen: FnvHashSet<String>,
    fingerprinter: Arc<dyn Fingerprinter>,
}

impl ItemBuffer {
    pub fn new(fingerprinter: Arc<dyn Fingerprinter>) -> Self {
        Self {
            items: Vec::new(),
            seen: FnvHashSet::default(),
            fingerprinter,
        }
    }

    /// Merge a batch, keeping the first occurrence of each fingerprint.
    /// Returns how many new items were added.
    pub fn merge(&mut self, batch: Vec<Item>) -> usize {
        let before = self.items.len();
        for item in batch {
            let key = self.fingerprinter.fingerprint(&item);
            if self.seen.insert(key) {
                self.items.push(item);
            }
        }
        self.items.len() - before
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Item> {
        self.items
    }
}

/// Output of the deduplication pass.
#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    pub items: Vec<Item>,
    pub duplicates_removed: usize,
    /// Set when the fingerprinter failed and the raw input was returned.
    pub degraded: bool,
}

/// Remove content-equivalent items, keeping the first occurrence.
///
/// Never fails: if the fingerprinter panics, the raw concatenation is
/// returned unchanged with `degraded` set.
pub fn deduplicate(items: Vec<Item>, fingerprinter: &dyn Fingerprinter) -> DedupOutcome {
    let attempt = catch_unwind(AssertUnwindSafe(|| {
        let mut seen = FnvHashSet::default();
        let mut keep = Vec::with_capacity(items.len());
        for (idx, item) in items.iter().enumerate() {
            if seen.insert(fingerprinter.fingerprint(item)) {
                keep.push(idx);
            }
        }
        keep
    }));

    match attempt {
        Ok(keep) => {
            let duplicates_removed = items.len() - keep.len();
            let mut keep = keep.into_iter().peekable();
            let items = items
                .into_iter()
                .enumerate()
                .filter_map(|(idx, item)| {
                    if keep.peek() == Some(&idx) {
                        keep.next();
                        Some(item)
                    } else {
                        None
                    }
                })
                .collect();
            DedupOutcome {
                items,
                duplicates_removed,
                degraded: false,
            }
        }
        Err(_) => {
            tracing::warn!(
                "deduplication failed; returning {} raw item(s) unchanged",
                items.len()
            );
            DedupOutcome {
                items,
                duplicates_removed: 0,
                degraded: true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn review(author: &str, text: &str, rating: f32) -> Item {
        Item::new(author, text, Some(rating))
    }

    #[test]
    fn test_fingerprint_ignores_formatting() {
        let a = review("Jane D.", "Great  coffee,\n friendly staff!", 5.0);
        let b = review("  jane d ", "great coffee friendly STAFF", 5.0);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_distinguishes_rating_and_author() {
        let a = review("Jane", "Fine", 4.0);
        assert_ne!(a.fingerprint(), review("Jane", "Fine", 3.0).fingerprint());
        assert_ne!(a.fingerprint(), review("John", "Fine", 4.0).fingerprint());
        assert_ne!(
            a.fingerprint(),
            Item::new("Jane", "Fine", None).fingerprint()
        );
    }

    #[test]
    fn test_fingerprint_truncates_long_text() {
        let base = "x".repeat(FINGERPRINT_TEXT_CHARS);
        let a = review("A", &format!("{base} first ending"), 2.0);
        let b = review("A", &format!("{base} second ending"), 2.0);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_ignores_phase_tag() {
        let a = review("A", "same", 1.0).with_phase(SortKey::Worst);
        let b = review("A", "same", 1.0).with_phase(SortKey::Recent);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_deduplicate_keeps_first_occurrence() {
        let items = vec![
            review("A", "one", 5.0).with_phase(SortKey::Recent),
            review("B", "two", 1.0),
            review("a", "ONE", 5.0).with_phase(SortKey::Best),
        ];
        let out = deduplicate(items, &ContentFingerprinter);
        assert_eq!(out.items.len(), 2);
        assert_eq!(out.duplicates_removed, 1);
        assert_eq!(out.items[0].phase, Some(SortKey::Recent));
        assert!(!out.degraded);
    }

    #[test]
    fn test_deduplicate_is_idempotent() {
        let items = vec![
            review("A", "one", 5.0),
            review("A", "one", 5.0),
            review("B", "two", 2.0),
        ];
        let once = deduplicate(items, &ContentFingerprinter);
        let twice = deduplicate(once.items.clone(), &ContentFingerprinter);
        assert_eq!(twice.duplicates_removed, 0);
        assert_eq!(twice.items, once.items);
    }

    #[test]
    fn test_deduplicate_empty() {
        let out = deduplicate(Vec::new(), &ContentFingerprinter);
        assert!(out.items.is_empty());
        assert_eq!(out.duplicates_removed, 0);
    }

    struct Exploding;

    impl Fingerprinter for Exploding {
        fn fingerprint(&self, _item: &Item) -> String {
            panic!("fingerprinter bug")
        }
    }

    #[test]
    fn test_deduplicate_degrades_to_raw_items() {
        let items = vec![review("A", "one", 5.0), review("A", "one", 5.0)];
        let out = deduplicate(items, &Exploding);
        assert!(out.degraded);
        assert_eq!(out.items.len(), 2);
        assert_eq!(out.duplicates_removed, 0);
    }

    #[test]
    fn test_buffer_merge_counts_only_new_items() {
        let mut buffer = ItemBuffer::new(Arc::new(ContentFingerprinter));
        assert_eq!(buffer.merge(vec![review("A", "1", 1.0), review("B", "2", 2.0)]), 2);
        assert_eq!(buffer.merge(vec![review("A", "1", 1.0), review("C", "3", 3.0)]), 1);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_sort_key_serde_names() {
        assert_eq!(serde_json::to_string(&SortKey::Worst).unwrap(), "\"worst\"");
        assert_eq!(SortKey::Best.to_string(), "best");
    }
}
