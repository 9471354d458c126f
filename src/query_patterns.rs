//! N+1 query detection for performance traces
//!
//! Queries are reduced to their shape (literals replaced by `?`, whitespace
//! collapsed) and grouped. A shape that repeats at least three times within
//! one trace is reported as a candidate N+1 problem.

use crate::event::QueryExecution;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Traces with fewer queries than this carry too little signal
pub const MIN_QUERIES: usize = 3;

/// Repetitions of one shape that make it a candidate
pub const MIN_OCCURRENCES: usize = 3;

pub const DEFAULT_MAX_PATTERNS: usize = 5;

const MAX_SLOW_QUERIES: usize = 5;

static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'(?:[^']|'')*'").expect("valid string literal pattern"));

static NUMERIC_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:\.\d+)?\b").expect("valid numeric literal pattern"));

static IN_LIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bIN\s*\(\s*\?(?:\s*,\s*\?)*\s*\)").expect("valid IN list pattern")
});

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));

static TRANSACTION_CONTROL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(BEGIN|COMMIT|ROLLBACK|SAVEPOINT|RELEASE\s+SAVEPOINT|END)\b")
        .expect("valid transaction control pattern")
});

/// A repeated query shape within one trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NPlusOnePattern {
    pub pattern: String,
    pub count: usize,
    pub total_duration_ms: f64,
    pub example: String,
}

/// A query at or above the slow threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowQuery {
    pub sql: String,
    pub duration_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QueryPatternDetector {
    max_patterns: usize,
}

impl Default for QueryPatternDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PATTERNS)
    }
}

impl QueryPatternDetector {
    pub fn new(max_patterns: usize) -> Self {
        Self { max_patterns }
    }

    /// Report repeated shapes, strongest first
    ///
    /// Ordered by occurrence count, then by summed duration. At most
    /// `max_patterns` entries are returned.
    pub fn detect(&self, queries: &[QueryExecution]) -> Vec<NPlusOnePattern> {
        if queries.len() < MIN_QUERIES {
            return Vec::new();
        }

        let mut index: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<NPlusOnePattern> = Vec::new();

        for query in queries {
            if TRANSACTION_CONTROL.is_match(&query.sql) {
                continue;
            }

            let pattern = normalize_query(&query.sql);
            if pattern.is_empty() {
                continue;
            }

            match index.get(&pattern) {
                Some(&i) => {
                    groups[i].count += 1;
                    groups[i].total_duration_ms += query.duration_ms;
                }
                None => {
                    index.insert(pattern.clone(), groups.len());
                    groups.push(NPlusOnePattern {
                        pattern,
                        count: 1,
                        total_duration_ms: query.duration_ms,
                        example: query.sql.clone(),
                    });
                }
            }
        }

        let mut candidates: Vec<NPlusOnePattern> = groups
            .into_iter()
            .filter(|group| group.count >= MIN_OCCURRENCES)
            .collect();

        // Stable sort keeps first-seen order among equals
        candidates.sort_by(|a, b| {
            b.count.cmp(&a.count).then_with(|| {
                b.total_duration_ms
                    .partial_cmp(&a.total_duration_ms)
                    .unwrap_or(Ordering::Equal)
            })
        });
        candidates.truncate(self.max_patterns);
        candidates
    }
}

/// Reduce a query to its shape
pub fn normalize_query(sql: &str) -> String {
    let shaped = STRING_LITERAL.replace_all(sql, "?");
    let shaped = NUMERIC_LITERAL.replace_all(&shaped, "?");
    let shaped = IN_LIST.replace_all(&shaped, "IN (?)");
    WHITESPACE.replace_all(shaped.trim(), " ").into_owned()
}

/// Queries at or above `threshold_ms`, slowest first, at most five
pub fn slow_queries(queries: &[QueryExecution], threshold_ms: f64) -> Vec<SlowQuery> {
    let mut slow: Vec<SlowQuery> = queries
        .iter()
        .filter(|q| q.duration_ms >= threshold_ms)
        .map(|q| SlowQuery {
            sql: q.sql.clone(),
            duration_ms: q.duration_ms,
            name: q.name.clone(),
        })
        .collect();

    slow.sort_by(|a, b| b.duration_ms.partial_cmp(&a.duration_ms).unwrap_or(Ordering::Equal));
    slow.truncate(MAX_SLOW_QUERIES);
    slow
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(sql: &str, duration_ms: f64) -> QueryExecution {
        QueryExecution::new(sql, duration_ms)
    }

    #[test]
    fn test_normalize_query() {
        assert_eq!(
            normalize_query("SELECT * FROM users WHERE id = 42 AND name = 'O''Brien'"),
            "SELECT * FROM users WHERE id = ? AND name = ?"
        );
        assert_eq!(
            normalize_query("SELECT *\n  FROM posts WHERE id IN (1, 2,3)"),
            "SELECT * FROM posts WHERE id IN (?)"
        );
        // Digits inside identifiers are part of the name
        assert_eq!(normalize_query("SELECT col1 FROM t2"), "SELECT col1 FROM t2");
    }

    #[test]
    fn test_detects_single_repeated_pattern() {
        let queries = vec![
            q("SELECT * FROM posts", 2.0),
            q("SELECT * FROM comments WHERE post_id = 1", 1.0),
            q("SELECT * FROM comments WHERE post_id = 2", 1.5),
            q("SELECT * FROM comments WHERE post_id = 3", 2.5),
            q("SELECT COUNT(*) FROM users", 0.5),
        ];

        let patterns = QueryPatternDetector::default().detect(&queries);

        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].pattern, "SELECT * FROM comments WHERE post_id = ?");
        assert_eq!(patterns[0].count, 3);
        assert_eq!(patterns[0].total_duration_ms, 5.0);
        assert_eq!(patterns[0].example, "SELECT * FROM comments WHERE post_id = 1");
    }

    #[test]
    fn test_too_few_queries_reports_nothing() {
        let queries = vec![q("SELECT 1", 1.0), q("SELECT 1", 1.0)];
        assert!(QueryPatternDetector::default().detect(&queries).is_empty());
        assert!(QueryPatternDetector::default().detect(&[]).is_empty());
    }

    #[test]
    fn test_transaction_control_is_ignored() {
        let queries = vec![
            q("BEGIN", 0.1),
            q("BEGIN", 0.1),
            q("BEGIN", 0.1),
            q("COMMIT", 0.1),
        ];
        assert!(QueryPatternDetector::default().detect(&queries).is_empty());
    }

    #[test]
    fn test_patterns_ranked_and_capped() {
        let mut queries = Vec::new();
        for i in 0..4 {
            queries.push(q(&format!("SELECT * FROM a WHERE id = {}", i), 1.0));
        }
        for i in 0..3 {
            queries.push(q(&format!("SELECT * FROM b WHERE id = {}", i), 10.0));
        }
        for i in 0..3 {
            queries.push(q(&format!("SELECT * FROM c WHERE id = {}", i), 1.0));
        }

        let patterns = QueryPatternDetector::new(2).detect(&queries);
        let shapes: Vec<_> = patterns.iter().map(|p| p.pattern.as_str()).collect();
        assert_eq!(
            shapes,
            vec!["SELECT * FROM a WHERE id = ?", "SELECT * FROM b WHERE id = ?"]
        );
    }

    #[test]
    fn test_slow_queries_top_five() {
        let queries: Vec<_> = (1..=8).map(|i| q(&format!("q{}", i), i as f64 * 50.0)).collect();

        let slow = slow_queries(&queries, 100.0);

        assert_eq!(slow.len(), 5);
        assert_eq!(slow[0].duration_ms, 400.0);
        assert_eq!(slow[4].duration_ms, 200.0);
        assert!(slow_queries(&queries, 1_000.0).is_empty());
    }
}
