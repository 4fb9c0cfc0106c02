//! Memoized handler classifications keyed by exact native address range.

use crate::pattern::HandlerPattern;
use crate::result::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// First and last native address of a handler occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandlerRange {
    pub start: u64,
    pub end: u64,
}

impl HandlerRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }
}

/// Persisted form of one cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheRecord {
    start: u64,
    end: u64,
    pattern: HandlerPattern,
}

/// Pattern cache. Lookups only hit on an identical range; overlapping or nested ranges are
/// different handlers as far as the cache is concerned.
#[derive(Debug, Default)]
pub struct HandlerCache {
    patterns: HashMap<HandlerRange, HandlerPattern>,
    hits: usize,
    misses: usize,
}

impl HandlerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up `range`, counting the hit or miss.
    pub fn get(&mut self, range: HandlerRange) -> Option<&HandlerPattern> {
        match self.patterns.get(&range) {
            Some(pattern) => {
                self.hits += 1;
                Some(pattern)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, range: HandlerRange, pattern: HandlerPattern) {
        self.patterns.insert(range, pattern);
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }

    /// Entries ordered by range.
    pub fn entries(&self) -> Vec<(HandlerRange, &HandlerPattern)> {
        let mut entries: Vec<_> = self
            .patterns
            .iter()
            .map(|(range, pattern)| (*range, pattern))
            .collect();
        entries.sort_by_key(|(range, _)| *range);
        entries
    }

    pub fn to_json(&self) -> Result<String> {
        let records: Vec<CacheRecord> = self
            .entries()
            .into_iter()
            .map(|(range, pattern)| CacheRecord {
                start: range.start,
                end: range.end,
                pattern: pattern.clone(),
            })
            .collect();
        Ok(serde_json::to_string_pretty(&records)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let records: Vec<CacheRecord> = serde_json::from_str(json)?;
        let patterns = records
            .into_iter()
            .map(|record| (HandlerRange::new(record.start, record.end), record.pattern))
            .collect();
        Ok(Self {
            patterns,
            ..Default::default()
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = self.to_json()?;
        std::fs::write(path, json).map_err(|source| Error::FileWrite {
            path: path.display().to_string(),
            source,
        })?;
        tracing::info!(path = %path.display(), entries = self.len(), "handler cache saved");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| Error::FileRead {
            path: path.display().to_string(),
            source,
        })?;
        let cache = Self::from_json(&json)?;
        tracing::info!(path = %path.display(), entries = cache.len(), "handler cache loaded");
        Ok(cache)
    }
}
