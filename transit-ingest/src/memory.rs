//! In-process index that records writes and fails on request.

use crate::{Category, IndexClient, WriteFailure};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;

#[derive(Debug, Default)]
struct State {
    documents: Vec<(Category, Value)>,
    script: VecDeque<bool>,
    fail_all: bool,
    attempts: usize,
}

/// Index double for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryIndex {
    state: Mutex<State>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for the next writes (`true` succeeds); unscripted writes succeed
    pub fn script(&self, outcomes: impl IntoIterator<Item = bool>) {
        self.state.lock().script.extend(outcomes);
    }

    /// Fail every write until cleared
    pub fn fail_all(&self, fail: bool) {
        self.state.lock().fail_all = fail;
    }

    /// Documents written successfully, in order
    pub fn documents(&self) -> Vec<(Category, Value)> {
        self.state.lock().documents.clone()
    }

    /// Number of write attempts, failed ones included
    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }
}

#[async_trait]
impl IndexClient for MemoryIndex {
    async fn write(&self, category: Category, document: &Value) -> Result<(), WriteFailure> {
        let mut state = self.state.lock();
        state.attempts += 1;
        let ok = !state.fail_all && state.script.pop_front().unwrap_or(true);
        if !ok {
            return Err(WriteFailure::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        state.documents.push((category, document.clone()));
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
