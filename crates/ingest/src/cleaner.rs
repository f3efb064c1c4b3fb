use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::reader::ReviewRow;

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

/// Characters rewritten before whitespace collapsing.
const REPLACEMENTS: &[(char, &str)] = &[
    ('\u{00a0}', " "),
    ('\u{000b}', " "),
    ('+', ""),
    ('\u{201c}', "\""),
    ('\u{201d}', "\""),
    ('\u{2019}', "'"),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    pub min_review_chars: usize,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self { min_review_chars: 40 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanStats {
    pub input: usize,
    pub dropped_short: usize,
    pub dropped_duplicate: usize,
}

pub struct ReviewCleaner {
    config: CleanerConfig,
}

impl ReviewCleaner {
    pub fn new(config: CleanerConfig) -> Self {
        Self { config }
    }

    /// Normalize review text: rewrite odd characters, collapse whitespace, NFKC.
    pub fn normalize(&self, text: &str) -> String {
        let mut normalized = text.trim().to_string();

        for (from, to) in REPLACEMENTS {
            if normalized.contains(*from) {
                normalized = normalized.replace(*from, to);
            }
        }

        let collapsed = WHITESPACE.replace_all(&normalized, " ");
        collapsed.trim().nfkc().collect()
    }

    /// Clean every row, then drop short texts and exact duplicates (first one wins).
    pub fn clean(&self, rows: Vec<ReviewRow>) -> (Vec<ReviewRow>, CleanStats) {
        let mut stats = CleanStats {
            input: rows.len(),
            ..CleanStats::default()
        };
        let mut seen = HashSet::new();
        let mut kept = Vec::with_capacity(rows.len());

        for mut row in rows {
            row.text = self.normalize(&row.text);

            if row.text.chars().count() < self.config.min_review_chars {
                stats.dropped_short += 1;
                continue;
            }
            if !seen.insert(row.text.clone()) {
                stats.dropped_duplicate += 1;
                continue;
            }
            kept.push(row);
        }

        tracing::info!(
            input = stats.input,
            kept = kept.len(),
            dropped_short = stats.dropped_short,
            dropped_duplicate = stats.dropped_duplicate,
            "cleaned reviews"
        );

        (kept, stats)
    }
}
