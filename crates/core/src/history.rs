//! Response History
//!
//! A bounded, chronologically ordered buffer of complete model responses.
//! Every read hands out clones, so a consumer (a renderer reading stats, the
//! router mining commands) never holds a reference into the buffer while a new
//! response is being appended.

use crate::extractor::{CommandExtractor, ExtractedCommand};
use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Default number of responses kept.
pub const DEFAULT_CAPACITY: usize = 50;

/// Characters of context kept on each side of a search match.
const SNIPPET_RADIUS: usize = 100;

/// History shared between the conversation loop and the router.
pub type SharedHistory = Arc<RwLock<ResponseHistory>>;

/// Telemetry attached to a buffered response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub model_id: String,
    /// Zero unless the provider reported usage.
    pub token_count: u32,
    pub response_time_ms: u64,
}

impl Default for ResponseMetadata {
    fn default() -> Self {
        Self {
            model_id: "unknown".to_string(),
            token_count: 0,
            response_time_ms: 0,
        }
    }
}

/// A complete model response as stored in the history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferedResponse {
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: ResponseMetadata,
}

/// One hit from [`ResponseHistory::search_pattern`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMatch {
    pub pattern: String,
    pub context_snippet: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: ResponseMetadata,
}

/// Aggregate view of the buffer.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    pub total_responses: usize,
    pub oldest_timestamp: Option<DateTime<Utc>>,
    pub newest_timestamp: Option<DateTime<Utc>>,
    /// Total content length in characters.
    pub total_content_length: usize,
    pub average_response_time_ms: f64,
}

/// Bounded FIFO buffer of model responses.
pub struct ResponseHistory {
    entries: VecDeque<BufferedResponse>,
    capacity: usize,
    extractor: CommandExtractor,
}

impl ResponseHistory {
    /// Creates a buffer holding at most `capacity` responses (at least one).
    pub fn new(capacity: usize, extractor: CommandExtractor) -> Self {
        let capacity = capacity.max(1);
        Self {
            // Capacity is user-configured; allocate lazily past the default.
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity,
            extractor,
        }
    }

    /// Wraps the buffer for sharing across the session.
    pub fn shared(self) -> SharedHistory {
        Arc::new(RwLock::new(self))
    }

    /// Appends a response, evicting the oldest one when full.
    pub fn append(&mut self, content: impl Into<String>, metadata: Option<ResponseMetadata>) {
        self.entries.push_back(BufferedResponse {
            content: content.into(),
            timestamp: Utc::now(),
            metadata: metadata.unwrap_or_default(),
        });
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Up to `count` most recent responses, oldest first.
    pub fn recent(&self, count: usize) -> Vec<BufferedResponse> {
        let skip = self.entries.len().saturating_sub(count);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// The newest response, if any.
    pub fn latest(&self) -> Option<BufferedResponse> {
        self.entries.back().cloned()
    }

    /// Case-insensitive regex search across every buffered response, newest first.
    pub fn search_pattern(&self, pattern: &str) -> Result<Vec<SearchMatch>, regex::Error> {
        let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        let mut matches = Vec::new();
        for entry in self.entries.iter().rev() {
            for found in regex.find_iter(&entry.content) {
                matches.push(SearchMatch {
                    pattern: pattern.to_string(),
                    context_snippet: snippet(&entry.content, found.start(), found.end()),
                    timestamp: entry.timestamp,
                    metadata: entry.metadata.clone(),
                });
            }
        }
        Ok(matches)
    }

    /// Embedded commands from every buffered response, oldest response first.
    pub fn extract_commands(&self) -> Vec<ExtractedCommand> {
        self.entries
            .iter()
            .flat_map(|entry| self.extractor.extract(&entry.content))
            .collect()
    }

    pub fn stats(&self) -> HistoryStats {
        if self.entries.is_empty() {
            return HistoryStats::default();
        }
        let total_time: u64 = self
            .entries
            .iter()
            .map(|e| e.metadata.response_time_ms)
            .sum();
        HistoryStats {
            total_responses: self.entries.len(),
            oldest_timestamp: self.entries.front().map(|e| e.timestamp),
            newest_timestamp: self.entries.back().map(|e| e.timestamp),
            total_content_length: self.entries.iter().map(|e| e.content.chars().count()).sum(),
            average_response_time_ms: total_time as f64 / self.entries.len() as f64,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn extractor(&self) -> &CommandExtractor {
        &self.extractor
    }
}

impl Default for ResponseHistory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, CommandExtractor::default())
    }
}

/// Cuts a window of `SNIPPET_RADIUS` characters around `start..end`, marking
/// truncated sides with an ellipsis.
fn snippet(content: &str, start: usize, end: usize) -> String {
    let window_start = content[..start]
        .char_indices()
        .rev()
        .nth(SNIPPET_RADIUS - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let window_end = content[end..]
        .char_indices()
        .nth(SNIPPET_RADIUS)
        .map(|(i, _)| end + i)
        .unwrap_or(content.len());

    let mut out = String::new();
    if window_start > 0 {
        out.push_str("...");
    }
    out.push_str(&content[window_start..window_end]);
    if window_end < content.len() {
        out.push_str("...");
    }
    out
}
