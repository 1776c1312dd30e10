//! The unified mail store: an append-only log of inbound and outbound
//! messages, keyed by message-id, with conversation grouping.
//!
//! Persistence is a single JSONL append log — the source of truth —
//! replayed into an in-memory cache at startup, the same shape the
//! session manager uses for per-key JSONL history. Writes take an
//! exclusive lock for the whole insert-then-append sequence so the
//! `messageId` uniqueness invariant holds cheaply; reads are lock-free
//! snapshots taken under a brief read lock.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use flowmail_core::error::{FlowMailError, Result};
use flowmail_core::models::{normalize_message_id, MailKind, StoredMail};
use tracing::{debug, warn};

pub struct MailStore {
    log_path: PathBuf,
    entries: RwLock<HashMap<String, StoredMail>>,
    conversations: RwLock<HashMap<String, Vec<String>>>,
    write_lock: Mutex<()>,
}

impl MailStore {
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        let log_path = data_dir.join("mail-log.jsonl");
        let store = MailStore {
            log_path,
            entries: RwLock::new(HashMap::new()),
            conversations: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
        };
        store.replay()?;
        Ok(store)
    }

    fn replay(&self) -> Result<()> {
        if !self.log_path.exists() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(&self.log_path)?;
        let mut entries = self.entries.write().expect("mail store lock poisoned");
        let mut conversations = self.conversations.write().expect("mail store lock poisoned");
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: StoredMail = serde_json::from_str(line)?;
            index_entry(&mut entries, &mut conversations, entry);
        }
        Ok(())
    }

    pub fn store_inbound(&self, mut entry: StoredMail) -> Result<StoredMail> {
        entry.kind = MailKind::Inbound;
        self.insert(entry)
    }

    pub fn store_outbound(&self, mut entry: StoredMail) -> Result<StoredMail> {
        entry.kind = MailKind::Outbound;
        self.insert(entry)
    }

    fn insert(&self, mut entry: StoredMail) -> Result<StoredMail> {
        let _guard = self.write_lock.lock().expect("mail store write lock poisoned");

        entry.message_id = normalize_message_id(&entry.message_id);
        if entry.message_id.is_empty() {
            return Err(FlowMailError::InvariantViolation(
                "stored mail entry has an empty message id".to_string(),
            ));
        }
        entry.in_reply_to = entry.in_reply_to.iter().map(|s| normalize_message_id(s)).collect();
        entry.references = entry.references.iter().map(|s| normalize_message_id(s)).collect();

        {
            let entries = self.entries.read().expect("mail store lock poisoned");
            if entries.contains_key(&entry.message_id) {
                return Err(FlowMailError::DuplicateMessageId(entry.message_id.clone()));
            }
            if !entry.in_reply_to.is_empty() && entry.kind == MailKind::Outbound {
                let has_any_ancestor = entry
                    .in_reply_to
                    .iter()
                    .any(|id| entries.contains_key(id));
                if !has_any_ancestor {
                    return Err(FlowMailError::InvariantViolation(format!(
                        "outbound entry {} replies to an id not present in the store",
                        entry.message_id
                    )));
                }
            }
        }

        entry.conversation_id = self.derive_conversation_id(&entry);

        let line = serde_json::to_string(&entry)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(file, "{line}")?;

        let mut entries = self.entries.write().expect("mail store lock poisoned");
        let mut conversations = self.conversations.write().expect("mail store lock poisoned");
        debug!(message_id = %entry.message_id, kind = ?entry.kind, "stored mail entry");
        index_entry(&mut entries, &mut conversations, entry.clone());
        Ok(entry)
    }

    fn derive_conversation_id(&self, entry: &StoredMail) -> String {
        let entries = self.entries.read().expect("mail store lock poisoned");
        entry
            .in_reply_to
            .iter()
            .chain(entry.references.iter())
            .find_map(|id| entries.get(id).map(|ancestor| ancestor.conversation_id.clone()))
            .unwrap_or_else(|| entry.message_id.clone())
    }

    pub fn get_by_message_id(&self, id: &str) -> Result<StoredMail> {
        let id = normalize_message_id(id);
        self.entries
            .read()
            .expect("mail store lock poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| FlowMailError::NotFound(format!("mail entry {id}")))
    }

    pub fn conversation_for(&self, id: &str) -> Result<Vec<StoredMail>> {
        let id = normalize_message_id(id);
        let entries = self.entries.read().expect("mail store lock poisoned");
        let conversation_id = entries
            .get(&id)
            .map(|e| e.conversation_id.clone())
            .unwrap_or(id);
        let conversations = self.conversations.read().expect("mail store lock poisoned");
        let Some(ids) = conversations.get(&conversation_id) else {
            return Ok(Vec::new());
        };
        let mut result: Vec<StoredMail> = ids.iter().filter_map(|mid| entries.get(mid).cloned()).collect();
        result.sort_by_key(|e| e.timestamp);
        Ok(result)
    }

    /// Removes every entry belonging to `agent_id`. Orphan entries (no
    /// agent attributed) are preserved. Rewrites the log to drop them so
    /// the store's own invariant (`storeInbound`/`storeOutbound`
    /// uniqueness) doesn't resurrect stale history on the next restart.
    pub fn clear_for_agent(&self, agent_id: &str) -> Result<usize> {
        let _guard = self.write_lock.lock().expect("mail store write lock poisoned");
        let mut entries = self.entries.write().expect("mail store lock poisoned");
        let mut conversations = self.conversations.write().expect("mail store lock poisoned");

        let removed: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.agent_id.as_deref() == Some(agent_id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &removed {
            entries.remove(id);
        }
        for ids in conversations.values_mut() {
            ids.retain(|id| !removed.contains(id));
        }
        conversations.retain(|_, ids| !ids.is_empty());

        let mut remaining: Vec<&StoredMail> = entries.values().collect();
        remaining.sort_by_key(|e| e.timestamp);
        let mut file = std::fs::File::create(&self.log_path)?;
        for entry in remaining {
            writeln!(file, "{}", serde_json::to_string(entry)?)?;
        }
        if !removed.is_empty() {
            warn!(agent_id, removed = removed.len(), "cleared agent's mail entries");
        }
        Ok(removed.len())
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Outbound entries whose transport send was never confirmed —
    /// the crash-recovery scan set for a redelivery sweep.
    pub fn list_unconfirmed(&self) -> Vec<StoredMail> {
        self.entries
            .read()
            .expect("mail store lock poisoned")
            .values()
            .filter(|e| e.kind == MailKind::Outbound && !e.delivery_confirmed)
            .cloned()
            .collect()
    }
}

fn index_entry(
    entries: &mut HashMap<String, StoredMail>,
    conversations: &mut HashMap<String, Vec<String>>,
    entry: StoredMail,
) {
    conversations
        .entry(entry.conversation_id.clone())
        .or_default()
        .push(entry.message_id.clone());
    entries.insert(entry.message_id.clone(), entry);
}
