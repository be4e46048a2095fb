use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use nanoid::nanoid;
use serde::{Deserialize, Serialize};

/// Entries beyond this are evicted oldest-first.
pub const HISTORY_CAP: usize = 100;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub timestamp_ms: u128,
    pub round_id: String,
    #[serde(flatten)]
    pub kind: HistoryKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryKind {
    Instruction { text: String },
    ModelResponse { narration: Option<String>, action_count: usize },
    ActionResult { name: String, success: bool, selector: Option<String>, info: Option<String> },
    Note { text: String },
    Screenshot,
}

pub(crate) fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// Append-only, round-grouped, size-bounded record of one session's
/// instructions, model turns and action results.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryLog {
    entries: VecDeque<HistoryEntry>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a fresh round id; entries pushed with it belong to one
    /// instruction-to-completion cycle.
    pub fn begin_round(&self) -> String {
        nanoid!()
    }

    pub fn push(&mut self, round_id: &str, kind: HistoryKind) {
        self.entries.push_back(HistoryEntry {
            id: nanoid!(),
            timestamp_ms: now_ms(),
            round_id: round_id.to_string(),
            kind,
        });
        while self.entries.len() > HISTORY_CAP {
            self.entries.pop_front();
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn round(&self, round_id: &str) -> impl Iterator<Item = &HistoryEntry> {
        let round_id = round_id.to_string();
        self.entries.iter().filter(move |e| e.round_id == round_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn to_vec(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn replace(&mut self, entries: Vec<HistoryEntry>) {
        self.entries = entries.into();
        while self.entries.len() > HISTORY_CAP {
            self.entries.pop_front();
        }
    }
}
