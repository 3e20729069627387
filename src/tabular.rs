//! In-memory index over delimited-text (CSV) sources.
//!
//! CSV sources are never chunked or embedded. Each one is parsed into a
//! [`TabularRecordSet`] and cached by source id; queries scan the cached
//! rows directly.
//!
//! Two query forms are supported:
//!
//! - **Smart query**: the query is tokenized into lower-cased terms of at
//!   least three characters (stop words dropped). A row matches when any
//!   term is a substring of its concatenated cells.
//! - **Column query**: `"<column> contains|equals|is <value>"`, evaluated
//!   against one named column.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use anyhow::{bail, Result};
use serde::Serialize;

use crate::models::Source;

/// A parsed row: header name → cell value.
pub type Row = BTreeMap<String, String>;

/// Banner line prefixed to CSV text stored in a document's `content`.
const CSV_BANNER: &str = "CSV Data:";

/// Terms shorter than this are ignored by smart queries.
const MIN_TERM_CHARS: usize = 3;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "him", "his", "how", "its", "may", "who", "did", "get", "let",
    "say", "she", "too", "use", "what", "when", "where", "which", "with", "that", "this",
    "from", "they", "them", "have", "were", "been", "will", "would", "could", "should",
    "their", "there", "these", "those", "about", "into", "than", "then", "some", "such",
    "only", "also", "does", "show", "find", "tell", "give", "list", "please",
];

/// Cached parse of one CSV source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TabularRecordSet {
    pub source_id: String,
    pub title: String,
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
}

/// Summary of a cached source, without its rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TabularSourceInfo {
    pub source_id: String,
    pub title: String,
    pub headers: Vec<String>,
    pub row_count: usize,
}

/// Rows of one source that matched a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TabularMatch {
    pub source_id: String,
    pub title: String,
    pub headers: Vec<String>,
    pub match_count: usize,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnOp {
    Contains,
    Equals,
}

/// A `"<column> contains|equals|is <value>"` query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnQuery {
    pub column: String,
    pub op: ColumnOp,
    pub value: String,
}

impl ColumnQuery {
    /// Parse a column query. Returns `None` when the text has no
    /// `contains`/`equals`/`is` keyword with a column before it and a
    /// value after it.
    pub fn parse(query: &str) -> Option<Self> {
        let tokens: Vec<&str> = query.split_whitespace().collect();
        let (pos, op) = tokens
            .iter()
            .enumerate()
            .skip(1)
            .find_map(|(i, t)| match t.to_ascii_lowercase().as_str() {
                "contains" => Some((i, ColumnOp::Contains)),
                "equals" | "is" => Some((i, ColumnOp::Equals)),
                _ => None,
            })?;

        let column = tokens[..pos].join(" ");
        let value = tokens[pos + 1..].join(" ");
        let value = value.trim_matches(|c| c == '"' || c == '\'').trim();
        if value.is_empty() {
            return None;
        }

        Some(ColumnQuery {
            column,
            op,
            value: value.to_string(),
        })
    }

    fn matches(&self, row: &Row, column: &str) -> bool {
        let Some(cell) = row.get(column) else {
            return false;
        };
        let cell = cell.to_lowercase();
        let value = self.value.to_lowercase();
        match self.op {
            ColumnOp::Contains => cell.contains(&value),
            ColumnOp::Equals => cell == value,
        }
    }

    /// The header in `headers` this query refers to, compared case-insensitively.
    ///
    /// The full column text wins; failing that, ever shorter runs of its
    /// trailing words are tried, so `"rows where site is north"` still
    /// lands on `site`.
    fn resolve_column<'h>(&self, headers: &'h [String]) -> Option<&'h str> {
        let words: Vec<&str> = self.column.split_whitespace().collect();
        (0..words.len()).find_map(|start| {
            let name = words[start..].join(" ");
            headers
                .iter()
                .find(|h| h.eq_ignore_ascii_case(&name))
                .map(String::as_str)
        })
    }
}

/// Split one CSV line on commas, ignoring commas inside double quotes.
///
/// Quote characters toggle the in-quotes state and are not kept.
pub fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in line.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

/// Parse CSV text into headers and rows.
///
/// A leading `"CSV Data: <name>"` banner line is skipped. Blank lines are
/// ignored. Missing trailing cells become empty strings.
pub fn parse_csv(text: &str) -> Result<(Vec<String>, Vec<Row>)> {
    let mut lines = text
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty())
        .peekable();

    if lines
        .peek()
        .is_some_and(|first| first.trim_start().starts_with(CSV_BANNER))
    {
        lines.next();
    }

    let Some(header_line) = lines.next() else {
        bail!("CSV has no header line");
    };
    let headers = split_csv_line(header_line);
    if headers.iter().all(|h| h.is_empty()) {
        bail!("CSV header line is empty");
    }

    let rows = lines
        .map(|line| {
            let cells = split_csv_line(line);
            headers
                .iter()
                .enumerate()
                .map(|(i, h)| (h.clone(), cells.get(i).cloned().unwrap_or_default()))
                .collect::<Row>()
        })
        .collect();

    Ok((headers, rows))
}

/// Lower-cased query terms used for smart queries.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    query
        .split(|c: char| !c.is_alphanumeric() && c != '-' && c != '_' && c != '.')
        .map(|t| t.trim_matches('.').to_lowercase())
        .filter(|t| t.chars().count() >= MIN_TERM_CHARS)
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Render a row as `"header: value, header: value"` in header order.
pub fn format_row(headers: &[String], row: &Row) -> String {
    headers
        .iter()
        .map(|h| format!("{}: {}", h, row.get(h).map(String::as_str).unwrap_or("")))
        .collect::<Vec<_>>()
        .join(", ")
}

fn row_matches_terms(row: &Row, terms: &[String]) -> bool {
    let haystack = row
        .values()
        .map(|v| v.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");
    terms.iter().any(|t| haystack.contains(t.as_str()))
}

fn sort_and_truncate(matches: &mut Vec<TabularMatch>, max_results: usize) {
    matches.sort_by(|a, b| {
        b.match_count
            .cmp(&a.match_count)
            .then_with(|| a.source_id.cmp(&b.source_id))
    });
    matches.truncate(max_results);
}

/// Process-local cache of parsed CSV sources.
#[derive(Default)]
pub struct TabularIndex {
    sources: RwLock<HashMap<String, TabularRecordSet>>,
}

impl TabularIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `csv_text` and replace any cached record set for `source.id`.
    ///
    /// On parse failure the previous record set (if any) is left untouched.
    pub fn add_csv_source(&self, source: &Source, csv_text: &str) -> Result<usize> {
        let (headers, rows) = parse_csv(csv_text)?;
        let row_count = rows.len();
        let set = TabularRecordSet {
            source_id: source.id.clone(),
            title: source.title.clone(),
            headers,
            rows,
        };
        self.sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source.id.clone(), set);
        tracing::debug!(source_id = %source.id, rows = row_count, "cached CSV source");
        Ok(row_count)
    }

    /// Drop a cached source. Returns whether anything was removed.
    pub fn remove_csv_source(&self, source_id: &str) -> bool {
        self.sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(source_id)
            .is_some()
    }

    pub fn contains(&self, source_id: &str) -> bool {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(source_id)
    }

    pub fn get_all_sources(&self) -> Vec<TabularSourceInfo> {
        let guard = self.sources.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<TabularSourceInfo> = guard
            .values()
            .map(|s| TabularSourceInfo {
                source_id: s.source_id.clone(),
                title: s.title.clone(),
                headers: s.headers.clone(),
                row_count: s.rows.len(),
            })
            .collect();
        out.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        out
    }

    pub fn get_source_data(&self, source_id: &str) -> Option<TabularRecordSet> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source_id)
            .cloned()
    }

    /// Total cached rows across all sources.
    pub fn row_count(&self) -> usize {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|s| s.rows.len())
            .sum()
    }

    /// Keyword query across every cached source (OR semantics over terms).
    pub fn smart_query(&self, query: &str, max_results: usize) -> Vec<TabularMatch> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Vec::new();
        }

        let guard = self.sources.read().unwrap_or_else(PoisonError::into_inner);
        let mut matches: Vec<TabularMatch> = guard
            .values()
            .filter_map(|set| {
                let rows: Vec<Row> = set
                    .rows
                    .iter()
                    .filter(|row| row_matches_terms(row, &terms))
                    .cloned()
                    .collect();
                (!rows.is_empty()).then(|| TabularMatch {
                    source_id: set.source_id.clone(),
                    title: set.title.clone(),
                    headers: set.headers.clone(),
                    match_count: rows.len(),
                    rows,
                })
            })
            .collect();
        drop(guard);

        sort_and_truncate(&mut matches, max_results);
        matches
    }

    /// Column-scoped query across every source that has the named column.
    pub fn column_query(&self, query: &ColumnQuery, max_results: usize) -> Vec<TabularMatch> {
        let guard = self.sources.read().unwrap_or_else(PoisonError::into_inner);
        let mut matches: Vec<TabularMatch> = guard
            .values()
            .filter_map(|set| {
                let column = query.resolve_column(&set.headers)?;
                let rows: Vec<Row> = set
                    .rows
                    .iter()
                    .filter(|row| query.matches(row, column))
                    .cloned()
                    .collect();
                (!rows.is_empty()).then(|| TabularMatch {
                    source_id: set.source_id.clone(),
                    title: set.title.clone(),
                    headers: set.headers.clone(),
                    match_count: rows.len(),
                    rows,
                })
            })
            .collect();
        drop(guard);

        sort_and_truncate(&mut matches, max_results);
        matches
    }

    /// Smart query merged with an optional column query.
    ///
    /// Column matches for sources missing from the text results are
    /// appended, then the combined list is re-sorted by match count.
    pub fn query(
        &self,
        query: &str,
        column_query: Option<&str>,
        max_results: usize,
    ) -> Vec<TabularMatch> {
        let mut results = self.smart_query(query, max_results);

        let Some(parsed) = column_query.and_then(ColumnQuery::parse) else {
            return results;
        };

        let seen: HashSet<String> = results.iter().map(|m| m.source_id.clone()).collect();
        results.extend(
            self.column_query(&parsed, max_results)
                .into_iter()
                .filter(|m| !seen.contains(&m.source_id)),
        );
        sort_and_truncate(&mut results, max_results);
        results
    }

    /// Query a single cached source.
    ///
    /// A column query is used when the text parses as one and names an
    /// existing column; otherwise the text is treated as a smart query.
    /// Returns `None` when the source is not cached.
    pub fn query_source(&self, source_id: &str, query: &str) -> Option<Vec<Row>> {
        let guard = self.sources.read().unwrap_or_else(PoisonError::into_inner);
        let set = guard.get(source_id)?;

        if let Some(parsed) = ColumnQuery::parse(query) {
            if let Some(column) = parsed.resolve_column(&set.headers) {
                return Some(
                    set.rows
                        .iter()
                        .filter(|row| parsed.matches(row, column))
                        .cloned()
                        .collect(),
                );
            }
        }

        let terms = query_terms(query);
        Some(
            set.rows
                .iter()
                .filter(|row| row_matches_terms(row, &terms))
                .cloned()
                .collect(),
        )
    }
}
