//! Run-scoped duplicate detection keyed by `(title, url)`.

use std::collections::HashSet;

use racefeed_core::RawEvent;

/// Per-run `(title, url)` identity tracking. Cross-run idempotence comes from
/// the store's upsert by url, not from here.
#[derive(Debug, Default)]
pub struct DedupEngine {
    seen: HashSet<(String, String)>,
}

impl DedupEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the key was already seen this run; state is only updated on first sight.
    pub fn is_duplicate(&mut self, event: &RawEvent) -> bool {
        !self.seen.insert(event.identity())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use racefeed_core::RawEventRecord;

    fn event(title: &str, url: &str) -> RawEvent {
        RawEvent::new(RawEventRecord {
            title: title.to_string(),
            local: "Franca - SP".to_string(),
            date: "23/11/2025".to_string(),
            url: url.to_string(),
            source: "peloto".to_string(),
            crawled_at: Utc::now(),
            raw_file: "x".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn second_sighting_is_a_duplicate() {
        let mut dedup = DedupEngine::new();
        assert!(!dedup.is_duplicate(&event("A", "https://a.example.com")));
        assert!(dedup.is_duplicate(&event("A", "https://a.example.com")));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn same_url_with_other_title_is_kept() {
        let mut dedup = DedupEngine::new();
        assert!(!dedup.is_duplicate(&event("A", "https://a.example.com")));
        assert!(!dedup.is_duplicate(&event("B", "https://a.example.com")));
        assert_eq!(dedup.len(), 2);
    }
}
