//! URL pattern compilation.
//!
//! Every enabled pattern across all affiliate URLs is compiled into a single
//! case-insensitive alternation used as a cheap pre-check, plus an ordered
//! index back to the owning affiliate for exact attribution after a hit.

use regex::{Regex, RegexBuilder};

use crate::config::{AffiliateUrl, MatchType, UrlPattern};

/// A single enabled pattern and the affiliate that owns it.
#[derive(Debug, Clone)]
struct CompiledPattern {
    affiliate_index: usize,
    pattern_id: String,
    regex: Regex,
}

/// A pattern that could not be compiled and was left out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedPattern {
    pub affiliate_id: String,
    pub pattern_id: String,
    pub error: String,
}

/// Affiliate hit produced by [`PatternMatcher::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternHit {
    pub affiliate_index: usize,
    pub pattern_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct PatternMatcher {
    combined: Option<Regex>,
    entries: Vec<CompiledPattern>,
    rejected: Vec<RejectedPattern>,
}

impl PatternMatcher {
    pub fn compile(affiliates: &[AffiliateUrl]) -> Self {
        let mut entries = Vec::new();
        let mut rejected = Vec::new();
        let mut fragments = Vec::new();

        for (affiliate_index, affiliate) in affiliates.iter().enumerate() {
            for pattern in affiliate.patterns.iter().filter(|pattern| pattern.enabled) {
                let fragment = fragment_for(pattern);
                match build_regex(&fragment) {
                    Ok(regex) => {
                        fragments.push(format!("(?:{})", fragment));
                        entries.push(CompiledPattern {
                            affiliate_index,
                            pattern_id: pattern.id.clone(),
                            regex,
                        });
                    }
                    Err(err) => {
                        log::warn!(
                            "skipping url pattern {} of affiliate {}: {}",
                            pattern.id,
                            affiliate.id,
                            err
                        );
                        rejected.push(RejectedPattern {
                            affiliate_id: affiliate.id.clone(),
                            pattern_id: pattern.id.clone(),
                            error: err.to_string(),
                        });
                    }
                }
            }
        }

        let combined = if fragments.is_empty() {
            None
        } else {
            match build_regex(&fragments.join("|")) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    // Size limit on the union; is_match falls back to a scan.
                    log::warn!("combined url pattern failed to compile: {}", err);
                    None
                }
            }
        };

        Self {
            combined,
            entries,
            rejected,
        }
    }

    /// True when no enabled pattern survived compilation.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn rejected(&self) -> &[RejectedPattern] {
        &self.rejected
    }

    /// Does any pattern match `url`?
    pub fn is_match(&self, url: &str) -> bool {
        match self.combined {
            Some(ref regex) => regex.is_match(url),
            None => self.entries.iter().any(|entry| entry.regex.is_match(url)),
        }
    }

    /// Matching affiliates in configuration order, at most one hit each. The
    /// reported pattern is the first of that affiliate's patterns to match.
    pub fn resolve(&self, url: &str) -> Vec<PatternHit> {
        let mut hits: Vec<PatternHit> = Vec::new();
        for entry in &self.entries {
            if hits
                .last()
                .is_some_and(|hit| hit.affiliate_index == entry.affiliate_index)
            {
                continue;
            }
            if entry.regex.is_match(url) {
                hits.push(PatternHit {
                    affiliate_index: entry.affiliate_index,
                    pattern_id: entry.pattern_id.clone(),
                });
            }
        }
        hits
    }
}

fn fragment_for(pattern: &UrlPattern) -> String {
    match pattern.match_type {
        MatchType::Exact => format!("^{}$", regex::escape(&pattern.pattern)),
        MatchType::Contains => regex::escape(&pattern.pattern),
        MatchType::Regex => pattern.pattern.clone(),
    }
}

fn build_regex(source: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(source).case_insensitive(true).build()
}
