//! Flow persistence: one JSON file per flow under `<data_dir>/flows`,
//! an in-memory cache for fast reads, and a per-flow mutex so
//! `executeRound`/`resumeFlow` serialize on the same flow.
//!
//! This mirrors the Mail Store's cache-plus-durable-log shape, but each
//! flow mutates over its lifetime rather than being append-only, so the
//! unit of persistence here is "one file per id", not one shared log.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use flowmail_core::error::{FlowMailError, Result};
use flowmail_core::models::{Flow, FlowStatus};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

/// Held for the duration of `executeRound`/`resumeFlow` on a single
/// flow. Dropping it releases the per-flow lock.
pub struct FlowLock {
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

pub struct FlowStore {
    dir: PathBuf,
    cache: RwLock<HashMap<String, Flow>>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl FlowStore {
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        let dir = data_dir.join("flows");
        std::fs::create_dir_all(&dir)?;
        let store = FlowStore {
            dir,
            cache: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        };
        store.load_all()?;
        Ok(store)
    }

    fn load_all(&self) -> Result<()> {
        let mut cache = self.cache.write().expect("flow store lock poisoned");
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)?;
            let flow: Flow = serde_json::from_str(&raw)?;
            cache.insert(flow.id.clone(), flow);
        }
        Ok(())
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Persists a flow, creating or overwriting its file, and updates
    /// the in-memory cache. Writes to a temp file first so a crash
    /// mid-write never leaves a half-written flow file behind.
    pub fn save(&self, flow: &Flow) -> Result<()> {
        let path = self.path_for(&flow.id);
        let tmp_path = self.dir.join(format!("{}.json.tmp", flow.id));
        let json = serde_json::to_string_pretty(flow)?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &path)?;
        self.cache.write().expect("flow store lock poisoned").insert(flow.id.clone(), flow.clone());
        debug!(flow_id = %flow.id, status = ?flow.status, "persisted flow");
        Ok(())
    }

    /// Inserts a brand-new flow. Fails if a flow with the same id is
    /// already on disk, matching the Mail Store's uniqueness discipline.
    pub fn insert(&self, flow: Flow) -> Result<()> {
        if self.path_for(&flow.id).exists() {
            return Err(FlowMailError::InvariantViolation(format!("flow {} already exists", flow.id)));
        }
        self.save(&flow)
    }

    pub fn get(&self, id: &str) -> Result<Flow> {
        self.cache
            .read()
            .expect("flow store lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| FlowMailError::NotFound(format!("flow {id}")))
    }

    pub fn list_by_agent(&self, agent_id: &str, status: Option<FlowStatus>) -> Vec<Flow> {
        self.cache
            .read()
            .expect("flow store lock poisoned")
            .values()
            .filter(|f| f.agent_id == agent_id)
            .filter(|f| status.map(|s| f.status == s).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn list_waiting_for_agent(&self, agent_id: &str) -> Vec<Flow> {
        self.list_by_agent(agent_id, Some(FlowStatus::Waiting))
    }

    /// All flows in `{running, waiting}`, across every agent — the
    /// timeout sweeper's scan set.
    pub fn list_open(&self) -> Vec<Flow> {
        self.cache
            .read()
            .expect("flow store lock poisoned")
            .values()
            .filter(|f| matches!(f.status, FlowStatus::Running | FlowStatus::Waiting))
            .cloned()
            .collect()
    }

    fn mutex_for(&self, flow_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("flow lock map poisoned");
        locks.entry(flow_id.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Acquires the per-flow mutex, bounded by `wait`. Returns
    /// `FlowBusy` if another caller is already holding it past that
    /// timeout, bounding how long one caller waits on another's in-flight round.
    pub async fn acquire(&self, flow_id: &str, wait: Duration) -> Result<FlowLock> {
        let mutex = self.mutex_for(flow_id);
        match tokio::time::timeout(wait, mutex.lock_owned()).await {
            Ok(guard) => Ok(FlowLock { _guard: guard }),
            Err(_) => Err(FlowMailError::FlowBusy(flow_id.to_string())),
        }
    }
}
