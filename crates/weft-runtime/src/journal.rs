//! Step journal: ordered `{key, outcome}` records used for replay.
//!
//! One journal is shared by every context of a run. Keyed execs and
//! `ExecutionContext::run` steps record here; a run seeded with an earlier
//! journal returns the recorded outcome instead of re-executing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use weft_core::error::{Result, WeftError};

use crate::scope::lock;

/// Recorded result of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StepOutcome {
    Ok { value: serde_json::Value },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub key: String,
    pub outcome: StepOutcome,
}

/// Ordered step records. Serializes as a plain JSON array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Journal {
    entries: Vec<JournalEntry>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First outcome recorded under `key`.
    pub fn get(&self, key: &str) -> Option<&StepOutcome> {
        self.entries.iter().find(|e| e.key == key).map(|e| &e.outcome)
    }

    /// Append an entry unless `key` is already recorded.
    pub fn record(&mut self, key: impl Into<String>, outcome: StepOutcome) -> bool {
        let key = key.into();
        if self.get(&key).is_some() {
            return false;
        }
        self.entries.push(JournalEntry { key, outcome });
        true
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Default)]
struct JournalState {
    entries: Vec<JournalEntry>,
    index: HashMap<String, usize>,
}

/// Shared, append-only journal of one run.
#[derive(Clone, Default)]
pub(crate) struct JournalHandle {
    state: Arc<Mutex<JournalState>>,
}

impl JournalHandle {
    pub fn seeded(journal: Journal) -> Self {
        let mut state = JournalState::default();
        for entry in journal.entries {
            if !state.index.contains_key(&entry.key) {
                state.index.insert(entry.key.clone(), state.entries.len());
                state.entries.push(entry);
            }
        }
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn lookup(&self, key: &str) -> Option<StepOutcome> {
        let state = lock(&self.state);
        state
            .index
            .get(key)
            .map(|&i| state.entries[i].outcome.clone())
    }

    /// First writer wins; later records for the same key are ignored.
    pub fn record(&self, key: String, outcome: StepOutcome) {
        let mut state = lock(&self.state);
        if state.index.contains_key(&key) {
            return;
        }
        let position = state.entries.len();
        state.index.insert(key.clone(), position);
        state.entries.push(JournalEntry { key, outcome });
    }

    pub fn snapshot(&self) -> Journal {
        Journal {
            entries: lock(&self.state).entries.clone(),
        }
    }
}

/// Converts typed step outputs to and from journal values.
pub(crate) struct JournalCodec<O> {
    encode: fn(&O) -> Result<serde_json::Value>,
    decode: fn(serde_json::Value) -> Result<O>,
}

impl<O> Clone for JournalCodec<O> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<O> Copy for JournalCodec<O> {}

impl<O: Serialize + DeserializeOwned> JournalCodec<O> {
    pub fn json() -> Self {
        Self {
            encode: |value| Ok(serde_json::to_value(value)?),
            decode: |value| Ok(serde_json::from_value(value)?),
        }
    }
}

impl<O> JournalCodec<O> {
    /// Turn a recorded outcome back into a step result.
    pub fn replay(&self, key: &str, outcome: StepOutcome) -> Result<O> {
        match outcome {
            StepOutcome::Ok { value } => (self.decode)(value),
            StepOutcome::Error { message } => Err(WeftError::Journaled {
                key: key.to_string(),
                message,
            }),
        }
    }

    /// Outcome to record for `result`. Cancellations are never recorded.
    pub fn outcome(&self, result: &Result<O>) -> Option<Result<StepOutcome>> {
        match result {
            Ok(value) => Some((self.encode)(value).map(|value| StepOutcome::Ok { value })),
            Err(e) if e.is_cancelled() => None,
            Err(e) => Some(Ok(StepOutcome::Error {
                message: e.to_string(),
            })),
        }
    }
}

/// Journal key of `key` inside the keyed execs named by `path`.
pub(crate) fn journal_key(path: &[String], key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", path.join("/"), key)
    }
}
