//! Keyword rule matching: exact, contains, and cached-regex modes.

use std::sync::Arc;

use dashmap::DashMap;
use omc_storage::KeywordRule;
use regex::Regex;
use uuid::Uuid;

/// Compiled patterns per rule, rebuilt when the rule's keyword list changes.
#[derive(Clone, Default)]
pub struct RegexCache {
    entries: Arc<DashMap<Uuid, Arc<CompiledRule>>>,
}

struct CompiledRule {
    source: Vec<String>,
    patterns: Vec<Regex>,
}

impl RegexCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn compiled(&self, rule: &KeywordRule) -> Arc<CompiledRule> {
        if let Some(entry) = self.entries.get(&rule.id) {
            if entry.source == rule.keywords {
                return entry.clone();
            }
        }

        let mut patterns = Vec::with_capacity(rule.keywords.len());
        for keyword in &rule.keywords {
            match Regex::new(keyword) {
                Ok(regex) => patterns.push(regex),
                Err(err) => {
                    tracing::warn!(
                        rule = %rule.id,
                        pattern = %keyword,
                        error = %err,
                        "invalid regex keyword skipped"
                    );
                }
            }
        }
        let compiled = Arc::new(CompiledRule {
            source: rule.keywords.clone(),
            patterns,
        });
        self.entries.insert(rule.id, compiled.clone());
        compiled
    }
}

pub fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// First-match-wins check for one rule against the inbound text.
pub fn rule_matches(rule: &KeywordRule, text: &str, cache: &RegexCache) -> bool {
    let normalized = normalize(text);
    match rule.match_type.as_str() {
        "exact" => rule
            .keywords
            .iter()
            .any(|keyword| normalize(keyword) == normalized),
        "contains" => rule
            .keywords
            .iter()
            .any(|keyword| normalized.contains(&normalize(keyword))),
        "regex" => {
            let compiled = cache.compiled(rule);
            compiled.patterns.iter().any(|regex| regex.is_match(text))
        }
        other => {
            tracing::warn!(rule = %rule.id, match_type = %other, "unknown match type");
            false
        }
    }
}

/// Trigger-keyword check shared by flows and AI contexts: case-insensitive
/// substring on the normalized text.
pub fn keywords_match(keywords: &[String], text: &str) -> bool {
    let normalized = normalize(text);
    keywords
        .iter()
        .any(|keyword| !keyword.is_empty() && normalized.contains(&normalize(keyword)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn rule(match_type: &str, keywords: &[&str]) -> KeywordRule {
        KeywordRule {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            name: "test".into(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            match_type: match_type.into(),
            priority: 0,
            enabled: true,
            response_type: "text".into(),
            response_text: "hi".into(),
            buttons: None,
            transfer_team_id: None,
            farewell_text: String::new(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn exact_matching_normalizes_case_and_whitespace() {
        let cache = RegexCache::new();
        let r = rule("exact", &["Hello"]);
        assert!(rule_matches(&r, "  hello  ", &cache));
        assert!(!rule_matches(&r, "hello there", &cache));
    }

    #[test]
    fn contains_matching() {
        let cache = RegexCache::new();
        let r = rule("contains", &["hi", "hello"]);
        assert!(rule_matches(&r, "Hi there", &cache));
        assert!(rule_matches(&r, "well HELLO friend", &cache));
        assert!(!rule_matches(&r, "goodbye", &cache));
    }

    #[test]
    fn regex_matching_with_invalid_pattern_skipped() {
        let cache = RegexCache::new();
        let r = rule("regex", &["[0-9]{4}", "(unclosed"]);
        assert!(rule_matches(&r, "order 1234", &cache));
        assert!(!rule_matches(&r, "no digits here", &cache));
    }

    #[test]
    fn regex_cache_recompiles_on_keyword_change() {
        let cache = RegexCache::new();
        let mut r = rule("regex", &["foo"]);
        assert!(rule_matches(&r, "foo bar", &cache));

        r.keywords = vec!["baz".into()];
        assert!(!rule_matches(&r, "foo bar", &cache));
        assert!(rule_matches(&r, "baz", &cache));
    }

    #[test]
    fn trigger_keywords() {
        assert!(keywords_match(&["start".into()], "START now"));
        assert!(!keywords_match(&["start".into()], "stop"));
        assert!(!keywords_match(&[String::new()], "anything"));
    }
}
