//! Log tails, their summaries, and the per-invocation cache.

use crate::Result;
use crate::result::LogSummary;
use chrono::{DateTime, Utc};
use futures::lock::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::LazyLock;

/// Lines kept verbatim in a summary
const TAIL_LINES: usize = 5;

static ERROR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(error|err|failed|failure|exception|panic|fatal)\b|exit code: [1-9]")
        .expect("error pattern is a valid regex")
});

static WARNING_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(warn|warning|deprecated|retrying|timeout)\b")
        .expect("warning pattern is a valid regex")
});

/// Count errors and warnings in `lines` and keep the last few verbatim
pub fn summarize_lines(lines: &[String]) -> LogSummary {
    let mut summary = LogSummary {
        lines: lines.len(),
        ..LogSummary::default()
    };

    for line in lines {
        if ERROR_PATTERN.is_match(line) {
            summary.errors += 1;
            summary.last_error = Some(line.trim().to_string());
        } else if WARNING_PATTERN.is_match(line) {
            summary.warnings += 1;
        }
    }

    let skip = lines.len().saturating_sub(TAIL_LINES);
    summary.tail = lines[skip..].to_vec();
    summary
}

/// Last `lines` lines of a text file; a missing file has none
pub async fn tail_file(path: &Path, lines: usize) -> Result<Vec<String>> {
    let content = match smol::fs::read(path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let all: Vec<&str> = content.lines().collect();
    let skip = all.len().saturating_sub(lines);
    Ok(all[skip..].iter().map(|l| l.to_string()).collect())
}

/// Caches owned by one fleet invocation
///
/// Log summaries are fetched at most once per service per invocation, and
/// the last time each service was observed running is remembered. Nothing
/// here outlives the invocation.
#[derive(Debug, Default)]
pub struct LogCache {
    summaries: Mutex<HashMap<String, LogSummary>>,
    last_seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl LogCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached summary for `key`, fetching and summarizing on a miss
    pub async fn summary<F, Fut>(&self, key: &str, fetch: F) -> Result<LogSummary>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<String>>>,
    {
        if let Some(hit) = self.summaries.lock().await.get(key) {
            return Ok(hit.clone());
        }

        let lines = fetch().await?;
        let summary = summarize_lines(&lines);
        self.summaries
            .lock()
            .await
            .insert(key.to_string(), summary.clone());
        Ok(summary)
    }

    /// Drop the cached summary for `key`
    pub async fn invalidate(&self, key: &str) {
        self.summaries.lock().await.remove(key);
    }

    /// Remember that `key` was seen running at `at`
    pub async fn mark_seen(&self, key: &str, at: DateTime<Utc>) {
        self.last_seen.lock().await.insert(key.to_string(), at);
    }

    /// When `key` was last seen running during this invocation
    pub async fn last_seen(&self, key: &str) -> Option<DateTime<Utc>> {
        self.last_seen.lock().await.get(key).copied()
    }
}
