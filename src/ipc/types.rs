use crate::engine::Engine;
use crate::import::{CancelToken, ImportSummary, RowIssue};
use crate::store::{RecordStore, SqliteStore};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

const BATCH_HISTORY_LEN: usize = 16;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Serialized writer for response and event lines.
#[derive(Clone)]
pub struct Outbox(Arc<Mutex<Box<dyn Write + Send>>>);

impl Outbox {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self(Arc::new(Mutex::new(out)))
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn send(&self, value: &serde_json::Value) {
        let line = serde_json::to_string(value).unwrap_or_else(|_| "{\"ok\":false}".to_string());
        let mut out = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if writeln!(out, "{}", line).and_then(|_| out.flush()).is_err() {
            tracing::warn!("stdout closed, dropping message");
        }
    }
}

/// Cancel tokens of running batches, shared between the reader thread and
/// the worker.
#[derive(Clone, Default)]
pub struct CancelRegistry(Arc<Mutex<HashMap<String, CancelToken>>>);

impl CancelRegistry {
    pub fn register(&self, batch_id: &str) -> CancelToken {
        let mut map = self.0.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(batch_id.to_string()).or_default().clone()
    }

    /// Returns false when no batch with this id is pending or running.
    pub fn cancel(&self, batch_id: &str) -> bool {
        let map = self.0.lock().unwrap_or_else(|e| e.into_inner());
        match map.get(batch_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, batch_id: &str) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(batch_id);
    }
}

pub struct FinishedBatch {
    pub summary: ImportSummary,
    pub issues: Vec<RowIssue>,
}

pub struct Workspace {
    pub path: PathBuf,
    pub store: Arc<SqliteStore>,
    pub engine: Engine,
}

impl Workspace {
    pub fn new(path: PathBuf, store: SqliteStore) -> Self {
        let store = Arc::new(store);
        let engine = Engine::new(Arc::clone(&store) as Arc<dyn RecordStore>);
        Self {
            path,
            store,
            engine,
        }
    }
}

pub struct AppState {
    pub workspace: Option<Workspace>,
    pub outbox: Outbox,
    pub cancels: CancelRegistry,
    pub batches: VecDeque<FinishedBatch>,
}

impl AppState {
    pub fn new(outbox: Outbox, cancels: CancelRegistry) -> Self {
        Self {
            workspace: None,
            outbox,
            cancels,
            batches: VecDeque::new(),
        }
    }

    pub fn remember_batch(&mut self, batch: FinishedBatch) {
        self.batches
            .retain(|b| b.summary.batch_id != batch.summary.batch_id);
        if self.batches.len() == BATCH_HISTORY_LEN {
            self.batches.pop_front();
        }
        self.batches.push_back(batch);
    }
}
