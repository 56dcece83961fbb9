//! In-memory replicated log.
//!
//! Entries are contiguous and 1-based: the entry with id `n` lives at vector
//! position `n - 1`, which keeps every lookup O(1). Id 0 is the "no entry"
//! sentinel with term 0.

use tlr_core::{LogEntry, LogId, Term};

#[derive(Debug, Default)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Log {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Rebuild a log from recovered entries. Callers guarantee the entries
    /// are contiguous from id 1, which holds for anything this crate encoded.
    #[must_use]
    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        debug_assert!(
            entries
                .iter()
                .enumerate()
                .all(|(i, e)| e.id == i as LogId + 1),
            "recovered log must be contiguous from id 1"
        );
        Self { entries }
    }

    /// Id of the last entry (0 if the log is empty).
    #[inline]
    #[must_use]
    pub fn last_id(&self) -> LogId {
        self.entries.len() as LogId
    }

    /// Term of the last entry (0 if the log is empty).
    #[inline]
    #[must_use]
    pub fn last_term(&self) -> Term {
        self.entries.last().map_or(0, |e| e.term)
    }

    #[must_use]
    pub fn get(&self, id: LogId) -> Option<&LogEntry> {
        if id == 0 || id > self.last_id() {
            return None;
        }
        self.entries.get(id as usize - 1)
    }

    /// Term of the entry at `id`, if present.
    #[must_use]
    pub fn term_at(&self, id: LogId) -> Option<Term> {
        self.get(id).map(|e| e.term)
    }

    /// Consistency probe: does the log contain an entry at `id` with `term`?
    /// Id 0 always matches (the sentinel precedes every log).
    #[must_use]
    pub fn matches(&self, id: LogId, term: Term) -> bool {
        if id == 0 {
            return true;
        }
        self.term_at(id) == Some(term)
    }

    /// Append one entry at the tail. The caller assigns contiguous ids.
    pub fn append(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.id, self.last_id() + 1, "log ids must be contiguous");
        self.entries.push(entry);
    }

    /// Delete every entry with id >= `from_id`.
    pub fn truncate_from(&mut self, from_id: LogId) {
        let keep = from_id.saturating_sub(1) as usize;
        if keep < self.entries.len() {
            self.entries.truncate(keep);
        }
    }

    /// Clone the suffix starting at `from_id` (empty when past the tail).
    /// Entry payloads are `Bytes`, so this is refcount bumps, not copies.
    #[must_use]
    pub fn entries_from(&self, from_id: LogId) -> Vec<LogEntry> {
        if from_id == 0 || from_id > self.last_id() {
            return Vec::new();
        }
        self.entries[from_id as usize - 1..].to_vec()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, oldest first. Used by the durable-state encoder.
    #[must_use]
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
}
