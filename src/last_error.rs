// src/last_error.rs
//! Per-channel last-error history.
//!
//! Every channel gets a bounded ring of the ten most recent command
//! outcomes. Before a command runs, a pending sentinel (`None`) is
//! appended; write handlers later replace it with the result document or
//! an error document. `getlasterror`, `getpreverror` and `reseterror`
//! read this history without appending to it.

use crate::document::mark_okay;
use crate::error::{Result, ServerError};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};

/// Opaque identifier of a client channel.
pub type ChannelId = u64;

const HISTORY_CAPACITY: usize = 10;

/// Bounded list: appending past capacity drops the oldest entry.
struct LimitedList {
    capacity: usize,
    entries: VecDeque<Option<Value>>,
}

impl LimitedList {
    fn new(capacity: usize) -> Self {
        LimitedList {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    fn push(&mut self, entry: Option<Value>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }
}

/// The per-channel histories of a database.
pub struct LastResults {
    channels: Mutex<HashMap<ChannelId, LimitedList>>,
}

impl Default for LastResults {
    fn default() -> Self {
        Self::new()
    }
}

impl LastResults {
    pub fn new() -> Self {
        LastResults {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Append the pending sentinel for a channel, creating its history
    /// lazily.
    pub fn clear_last_status(&self, channel: ChannelId) {
        let mut channels = self.channels.lock();
        channels
            .entry(channel)
            .or_insert_with(|| LimitedList::new(HISTORY_CAPACITY))
            .push(None);
    }

    /// Replace the channel's newest entry with a result document. The
    /// newest entry must be the pending sentinel.
    pub fn put_last_result(&self, channel: ChannelId, result: Value) -> Result<()> {
        let mut channels = self.channels.lock();
        let history = channels
            .get_mut(&channel)
            .ok_or_else(|| ServerError::Internal(format!("channel {} has no history", channel)))?;
        let slot = history
            .entries
            .back_mut()
            .ok_or_else(|| ServerError::Internal(format!("channel {} has no pending slot", channel)))?;
        if let Some(previous) = slot {
            return Err(ServerError::Internal(format!(
                "last result already set: {}",
                previous
            )));
        }
        *slot = Some(result);
        Ok(())
    }

    /// Record a write error into the pending slot.
    pub fn put_last_error(&self, channel: ChannelId, error: &ServerError) -> Result<()> {
        self.put_last_result(channel, error.to_last_error_document(channel))
    }

    /// `getlasterror`: the most recent recorded outcome, skipping
    /// pending sentinels left by reads, or `{err: null}` if none.
    pub fn get_last_error(&self, channel: ChannelId) -> Value {
        let channels = self.channels.lock();
        if let Some(history) = channels.get(&channel) {
            for entry in history.entries.iter().rev() {
                if let Some(result) = entry {
                    let mut result = result.clone();
                    mark_okay(&mut result);
                    return result;
                }
            }
        }
        json!({"err": null, "ok": 1})
    }

    /// `getpreverror`: scan backwards for the first relevant outcome
    /// (a recorded error, or a write that touched documents), tagged
    /// with its 1-based distance from the top. The oldest entry is never
    /// examined; `{nPrev: -1}` when nothing relevant is found.
    pub fn get_prev_error(&self, channel: ChannelId) -> Value {
        let channels = self.channels.lock();
        if let Some(history) = channels.get(&channel) {
            let len = history.entries.len();
            for distance in 1..len {
                let entry = match &history.entries[len - distance] {
                    Some(entry) => entry,
                    None => continue,
                };
                let has_error = entry.get("err").map(|e| !e.is_null()).unwrap_or(false);
                let touched = entry
                    .get("n")
                    .and_then(|n| n.as_i64())
                    .map(|n| n > 0)
                    .unwrap_or(false);
                if has_error || touched {
                    let mut result = entry.clone();
                    if let Value::Object(map) = &mut result {
                        map.insert("nPrev".to_string(), json!(distance));
                    }
                    mark_okay(&mut result);
                    return result;
                }
            }
        }
        json!({"nPrev": -1, "ok": 1})
    }

    /// `reseterror`: truncate the channel's history.
    pub fn reset(&self, channel: ChannelId) -> Value {
        let mut channels = self.channels.lock();
        if let Some(history) = channels.get_mut(&channel) {
            history.entries.clear();
        }
        json!({"ok": 1})
    }

    /// Channel closed: forget its history.
    pub fn remove_channel(&self, channel: ChannelId) {
        self.channels.lock().remove(&channel);
    }

    #[cfg(test)]
    fn history_len(&self, channel: ChannelId) -> usize {
        self.channels
            .lock()
            .get(&channel)
            .map(|h| h.entries.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_last_error_empty() {
        let results = LastResults::new();
        assert_eq!(results.get_last_error(1), json!({"err": null, "ok": 1}));
    }

    #[test]
    fn test_result_replaces_pending_sentinel() {
        let results = LastResults::new();
        results.clear_last_status(1);
        results.put_last_result(1, json!({"n": 1})).unwrap();
        assert_eq!(results.get_last_error(1), json!({"n": 1, "ok": 1}));
    }

    #[test]
    fn test_double_record_is_an_internal_error() {
        let results = LastResults::new();
        results.clear_last_status(1);
        results.put_last_result(1, json!({"n": 1})).unwrap();
        assert!(results.put_last_result(1, json!({"n": 2})).is_err());
    }

    #[test]
    fn test_record_without_pending_slot_is_an_internal_error() {
        let results = LastResults::new();
        assert!(results.put_last_result(1, json!({"n": 1})).is_err());
    }

    #[test]
    fn test_get_last_error_skips_unrecorded_reads() {
        let results = LastResults::new();
        results.clear_last_status(1);
        results.put_last_result(1, json!({"n": 1})).unwrap();
        // a read appends a sentinel that is never replaced
        results.clear_last_status(1);
        assert_eq!(results.get_last_error(1), json!({"n": 1, "ok": 1}));
    }

    #[test]
    fn test_get_last_error_does_not_mutate_history() {
        let results = LastResults::new();
        results.clear_last_status(1);
        results.put_last_result(1, json!({"n": 1})).unwrap();
        assert_eq!(results.get_last_error(1), results.get_last_error(1));
    }

    #[test]
    fn test_history_is_bounded() {
        let results = LastResults::new();
        for i in 0..25 {
            results.clear_last_status(1);
            results.put_last_result(1, json!({"n": i})).unwrap();
        }
        assert_eq!(results.history_len(1), 10);
        assert_eq!(results.get_last_error(1), json!({"n": 24, "ok": 1}));
    }

    #[test]
    fn test_error_document_recorded() {
        let results = LastResults::new();
        results.clear_last_status(3);
        let error = ServerError::command(16459, "attempt to insert in system namespace");
        results.put_last_error(3, &error).unwrap();
        let last = results.get_last_error(3);
        assert_eq!(last["err"], json!("attempt to insert in system namespace"));
        assert_eq!(last["code"], json!(16459));
        assert_eq!(last["connectionId"], json!(3));
        assert_eq!(last["ok"], json!(1));
    }

    #[test]
    fn test_get_prev_error_never_examines_oldest_entry() {
        let results = LastResults::new();
        results.clear_last_status(1);
        results.put_last_result(1, json!({"n": 1})).unwrap();
        // a single (oldest) entry is out of scan range
        assert_eq!(results.get_prev_error(1), json!({"nPrev": -1, "ok": 1}));

        results.clear_last_status(1);
        results.put_last_result(1, json!({"n": 2})).unwrap();
        let prev = results.get_prev_error(1);
        assert_eq!(prev["n"], json!(2));
        assert_eq!(prev["nPrev"], json!(1));
    }

    #[test]
    fn test_get_prev_error_skips_irrelevant_entries() {
        let results = LastResults::new();
        results.clear_last_status(1);
        results.put_last_result(1, json!({"n": 0})).unwrap();
        results.clear_last_status(1);
        results.put_last_result(1, json!({"n": 3})).unwrap();
        results.clear_last_status(1);
        results.put_last_result(1, json!({"n": 0})).unwrap();
        results.clear_last_status(1); // unrecorded read
        let prev = results.get_prev_error(1);
        assert_eq!(prev["n"], json!(3));
        assert_eq!(prev["nPrev"], json!(3));
    }

    #[test]
    fn test_reset_then_get_last_error() {
        let results = LastResults::new();
        results.clear_last_status(1);
        results.put_last_result(1, json!({"n": 1})).unwrap();
        assert_eq!(results.reset(1), json!({"ok": 1}));
        assert_eq!(results.get_last_error(1), json!({"err": null, "ok": 1}));
    }

    #[test]
    fn test_remove_channel() {
        let results = LastResults::new();
        results.clear_last_status(1);
        results.put_last_result(1, json!({"n": 1})).unwrap();
        results.remove_channel(1);
        assert_eq!(results.get_last_error(1), json!({"err": null, "ok": 1}));
        assert_eq!(results.history_len(1), 0);
    }
}
