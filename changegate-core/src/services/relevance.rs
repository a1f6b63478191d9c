// src/services/relevance.rs
//! Cheap keyword pre-filter in front of the classifier.
//!
//! A changed page that mentions none of the keywords is not worth a model
//! call. Matching runs on the [`for_keywords`] form of both sides, so a
//! keyword split across a line break still matches.

use crate::services::normalize::for_keywords;

/// Keywords the broker uses when announcing platform maintenance or market closures.
pub const DEFAULT_KEYWORDS: &[&str] = &["maintenance", "crypto market is closed", "ctrader"];

#[derive(Debug, Clone, Default)]
pub struct RelevanceFilter {
    keywords: Vec<String>,
}

impl RelevanceFilter {
    /// Blank keywords are ignored. No keywords at all means everything is relevant.
    pub fn new<I, K>(keywords: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut out: Vec<String> = Vec::new();
        for k in keywords {
            let k = for_keywords(k.as_ref());
            if !k.is_empty() && !out.contains(&k) {
                out.push(k);
            }
        }
        Self { keywords: out }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// Keywords present in `text`, in configured order.
    pub fn matches(&self, text: &str) -> Vec<String> {
        let haystack = for_keywords(text);
        self.keywords
            .iter()
            .filter(|k| haystack.contains(k.as_str()))
            .cloned()
            .collect()
    }

    pub fn is_relevant(&self, text: &str) -> bool {
        self.keywords.is_empty() || !self.matches(text).is_empty()
    }
}
