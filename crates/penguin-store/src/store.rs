// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use penguin_config::{CheckpointConfig, ContextConfig};
use penguin_model::Message;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, CheckpointKind};
use crate::record::{
    AppendRecord, CheckpointRecord, LogRecord, ReplaceRecord, RollbackRecord, SCHEMA_VERSION,
};
use crate::trim;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no such session: {0}")]
    UnknownSession(String),
    #[error("session already exists: {0}")]
    SessionExists(String),
    #[error("no such checkpoint: {0}")]
    UnknownCheckpoint(String),
    #[error("no such message id {id} in session {session}")]
    UnknownMessage { session: String, id: u64 },
    #[error("corrupt record at {path}:{line}: {source}")]
    Corrupt {
        path: String,
        line: usize,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct StoredMessage {
    message: Message,
    tombstoned: bool,
    pinned: bool,
    /// Unknown on-disk fields, carried for re-serialization.
    extra: serde_json::Map<String, serde_json::Value>,
}

struct SessionState {
    id: String,
    records: Vec<StoredMessage>,
    /// Id handed to the next append.  Reset to `head + 1` by rollback so
    /// the active branch stays contiguous.
    next_id: u64,
    /// Highest visible message id; 0 when the branch is empty.
    head: u64,
    checkpoints: Vec<Checkpoint>,
    dir: Option<PathBuf>,
}

/// Append-only conversation log per session, with a checkpoint index.
///
/// The store is the only component that mutates session state.  Appends to
/// one session are serialized by that session's lock — the single
/// serialization point the `shared` context-sharing mode relies on.  No
/// lock is held across I/O on *other* sessions.
pub struct ConversationStore {
    root: Option<PathBuf>,
    sessions: Mutex<HashMap<String, Arc<Mutex<SessionState>>>>,
}

impl ConversationStore {
    /// Volatile store for tests and embedded use.
    pub fn in_memory() -> Self {
        Self {
            root: None,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open (or create) a persistent store rooted at `root`, loading every
    /// session directory found there.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let store = Self {
            root: Some(root.clone()),
            sessions: Mutex::new(HashMap::new()),
        };
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            match load_session(&id, &entry.path()) {
                Ok(state) => {
                    store
                        .sessions
                        .lock()
                        .unwrap()
                        .insert(id, Arc::new(Mutex::new(state)));
                }
                Err(e) => warn!(session = %id, error = %e, "skipping unloadable session"),
            }
        }
        Ok(store)
    }

    fn session(&self, session_id: &str) -> Result<Arc<Mutex<SessionState>>, StoreError> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownSession(session_id.to_string()))
    }

    /// Create a session with a fresh id.
    pub fn create_session(&self) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        self.create_session_with_id(&id)?;
        Ok(id)
    }

    /// Create a session with a caller-chosen id (used by `branch`).
    pub fn create_session_with_id(&self, session_id: &str) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(session_id) {
            return Err(StoreError::SessionExists(session_id.to_string()));
        }
        let dir = self.session_dir(session_id);
        if let Some(d) = &dir {
            std::fs::create_dir_all(d)?;
        }
        sessions.insert(
            session_id.to_string(),
            Arc::new(Mutex::new(SessionState {
                id: session_id.to_string(),
                records: Vec::new(),
                next_id: 1,
                head: 0,
                checkpoints: Vec::new(),
                dir,
            })),
        );
        Ok(())
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Append a message; its id is assigned here and returned.
    pub fn append(&self, session_id: &str, mut message: Message) -> Result<u64, StoreError> {
        let session = self.session(session_id)?;
        let mut s = session.lock().unwrap();
        message.id = s.next_id;
        s.next_id += 1;
        s.head = message.id;

        let record = AppendRecord {
            v: SCHEMA_VERSION,
            message: message.clone(),
            pinned: false,
            extra: serde_json::Map::new(),
        };
        if let Some(dir) = s.dir.clone() {
            append_log_line(&dir, &LogRecord::Append(record))?;
        }
        let id = message.id;
        s.records.push(StoredMessage {
            message,
            tombstoned: false,
            pinned: false,
            extra: serde_json::Map::new(),
        });
        Ok(id)
    }

    /// Edit a message: the edit is appended as a new message and the old
    /// one is tombstoned within the active branch.  Returns the new id.
    pub fn replace(
        &self,
        session_id: &str,
        message_id: u64,
        mut message: Message,
    ) -> Result<u64, StoreError> {
        let session = self.session(session_id)?;
        let mut s = session.lock().unwrap();
        let old = s
            .records
            .iter_mut()
            .find(|r| !r.tombstoned && r.message.id == message_id)
            .ok_or(StoreError::UnknownMessage {
                session: session_id.to_string(),
                id: message_id,
            })?;
        old.tombstoned = true;
        let pinned = old.pinned;

        message.id = s.next_id;
        s.next_id += 1;
        s.head = message.id;
        if let Some(dir) = s.dir.clone() {
            append_log_line(
                &dir,
                &LogRecord::Replace(ReplaceRecord {
                    v: SCHEMA_VERSION,
                    replaced: message_id,
                    message: message.clone(),
                    pinned,
                    extra: serde_json::Map::new(),
                }),
            )?;
        }
        let id = message.id;
        s.records.push(StoredMessage {
            message,
            tombstoned: false,
            pinned,
            extra: serde_json::Map::new(),
        });
        Ok(id)
    }

    /// Highest visible message id; 0 when the branch is empty.
    pub fn head(&self, session_id: &str) -> Result<u64, StoreError> {
        Ok(self.session(session_id)?.lock().unwrap().head)
    }

    /// Visible messages with `from_id <= id <= to_id`, in order.
    pub fn range(
        &self,
        session_id: &str,
        from_id: u64,
        to_id: u64,
    ) -> Result<Vec<Message>, StoreError> {
        let session = self.session(session_id)?;
        let s = session.lock().unwrap();
        Ok(s.records
            .iter()
            .filter(|r| !r.tombstoned && r.message.id >= from_id && r.message.id <= to_id)
            .map(|r| r.message.clone())
            .collect())
    }

    /// All visible messages of the active branch.
    pub fn messages(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        self.range(session_id, 1, u64::MAX)
    }

    /// Mark a message as pinned: trimming will never project it away.
    pub fn pin(&self, session_id: &str, message_id: u64) -> Result<(), StoreError> {
        let session = self.session(session_id)?;
        let mut s = session.lock().unwrap();
        let rec = s
            .records
            .iter_mut()
            .find(|r| !r.tombstoned && r.message.id == message_id)
            .ok_or(StoreError::UnknownMessage {
                session: session_id.to_string(),
                id: message_id,
            })?;
        rec.pinned = true;
        Ok(())
    }

    /// Token-bounded read-time projection of the active branch.  The log is
    /// never mutated by trimming.
    pub fn context_window(
        &self,
        session_id: &str,
        cfg: &ContextConfig,
    ) -> Result<Vec<Message>, StoreError> {
        let session = self.session(session_id)?;
        let s = session.lock().unwrap();
        let msgs: Vec<Message> = s
            .records
            .iter()
            .filter(|r| !r.tombstoned)
            .map(|r| {
                if r.pinned {
                    r.message
                        .clone()
                        .with_meta("pinned", serde_json::Value::Bool(true))
                } else {
                    r.message.clone()
                }
            })
            .collect();
        drop(s);
        Ok(trim::context_window(&msgs, cfg))
    }

    /// Record the current head as a checkpoint.  O(1).
    pub fn checkpoint(
        &self,
        session_id: &str,
        kind: CheckpointKind,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<String, StoreError> {
        let session = self.session(session_id)?;
        let mut s = session.lock().unwrap();
        let parent = if kind == CheckpointKind::Auto {
            s.checkpoints
                .iter()
                .rev()
                .find(|c| c.kind == CheckpointKind::Auto)
                .map(|c| c.id.clone())
        } else {
            None
        };
        let cp = Checkpoint {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            head: s.head,
            kind,
            name,
            description,
            parent_checkpoint_id: parent,
            created_at: Utc::now(),
        };
        let id = cp.id.clone();
        s.checkpoints.push(cp);
        persist_checkpoints(&s)?;
        debug!(session = %session_id, checkpoint = %id, "checkpoint created");
        Ok(id)
    }

    pub fn checkpoints(&self, session_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        Ok(self.session(session_id)?.lock().unwrap().checkpoints.clone())
    }

    /// Move the branch head back to the checkpoint, tombstoning everything
    /// after it.  Atomic with respect to concurrent appends: both take the
    /// session lock.
    pub fn rollback(&self, session_id: &str, checkpoint_id: &str) -> Result<(), StoreError> {
        let session = self.session(session_id)?;
        let mut s = session.lock().unwrap();
        let head = s
            .checkpoints
            .iter()
            .find(|c| c.id == checkpoint_id)
            .map(|c| c.head)
            .ok_or_else(|| StoreError::UnknownCheckpoint(checkpoint_id.to_string()))?;
        for rec in s.records.iter_mut() {
            if !rec.tombstoned && rec.message.id > head {
                rec.tombstoned = true;
            }
        }
        s.head = head;
        s.next_id = head + 1;
        if let Some(dir) = s.dir.clone() {
            append_log_line(
                &dir,
                &LogRecord::Rollback(RollbackRecord {
                    v: SCHEMA_VERSION,
                    head,
                    extra: serde_json::Map::new(),
                }),
            )?;
        }
        debug!(session = %session_id, head, "rolled back");
        Ok(())
    }

    /// Create `new_session_id` seeded with the source branch up to the
    /// checkpoint's head.  The source session is unaffected; the two share
    /// nothing afterwards.
    pub fn branch(
        &self,
        session_id: &str,
        checkpoint_id: &str,
        new_session_id: &str,
    ) -> Result<(), StoreError> {
        let source = self.session(session_id)?;
        let seed: Vec<(Message, bool)> = {
            let s = source.lock().unwrap();
            let head = s
                .checkpoints
                .iter()
                .find(|c| c.id == checkpoint_id)
                .map(|c| c.head)
                .ok_or_else(|| StoreError::UnknownCheckpoint(checkpoint_id.to_string()))?;
            s.records
                .iter()
                .filter(|r| !r.tombstoned && r.message.id <= head)
                .map(|r| (r.message.clone(), r.pinned))
                .collect()
        };

        self.create_session_with_id(new_session_id)?;
        let target = self.session(new_session_id)?;
        let mut t = target.lock().unwrap();
        for (message, pinned) in seed {
            t.head = message.id;
            t.next_id = message.id + 1;
            if let Some(dir) = t.dir.clone() {
                append_log_line(
                    &dir,
                    &LogRecord::Append(AppendRecord {
                        v: SCHEMA_VERSION,
                        message: message.clone(),
                        pinned,
                        extra: serde_json::Map::new(),
                    }),
                )?;
            }
            t.records.push(StoredMessage {
                message,
                tombstoned: false,
                pinned,
                extra: serde_json::Map::new(),
            });
        }
        Ok(())
    }

    /// Remove a session.  Branched descendants are independent sessions and
    /// are not touched.  Idempotent.
    pub fn remove_session(&self, session_id: &str, delete_files: bool) -> Result<(), StoreError> {
        let removed = self.sessions.lock().unwrap().remove(session_id);
        if let Some(session) = removed {
            let s = session.lock().unwrap();
            if delete_files {
                if let Some(dir) = &s.dir {
                    if dir.exists() {
                        std::fs::remove_dir_all(dir)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply the retention policy to a session's checkpoints.
    ///
    /// Auto checkpoints older than `retention_hours` are pruned, always
    /// keeping the newest `min_auto_kept`.  Manual checkpoints are never
    /// pruned within `manual_max_age_hours`; beyond that age they go too.
    pub fn prune_checkpoints(
        &self,
        session_id: &str,
        cfg: &CheckpointConfig,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let session = self.session(session_id)?;
        let mut s = session.lock().unwrap();
        let horizon = now - chrono::Duration::hours(cfg.retention_hours as i64);
        let manual_horizon = now - chrono::Duration::hours(cfg.manual_max_age_hours as i64);

        let auto_total = s
            .checkpoints
            .iter()
            .filter(|c| c.kind == CheckpointKind::Auto)
            .count();
        let mut prunable = auto_total.saturating_sub(cfg.min_auto_kept);
        let before = s.checkpoints.len();
        // Oldest first: retain scans in insertion order, which is creation
        // order, so the floor keeps the newest.
        s.checkpoints.retain(|c| match c.kind {
            CheckpointKind::Auto => {
                if prunable > 0 && c.created_at < horizon {
                    prunable -= 1;
                    return false;
                }
                true
            }
            CheckpointKind::Manual => c.created_at >= manual_horizon,
        });
        let pruned = before - s.checkpoints.len();
        if pruned > 0 {
            persist_checkpoints(&s)?;
            debug!(session = %session_id, pruned, "pruned auto checkpoints");
        }
        Ok(pruned)
    }

    fn session_dir(&self, session_id: &str) -> Option<PathBuf> {
        self.root.as_ref().map(|r| r.join(session_id))
    }
}

// ─── Persistence helpers ──────────────────────────────────────────────────────

fn append_log_line(dir: &Path, record: &LogRecord) -> Result<(), StoreError> {
    let path = dir.join("messages.jsonl");
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let line = serde_json::to_string(record).expect("log records always serialize");
    writeln!(file, "{line}")?;
    Ok(())
}

fn persist_checkpoints(s: &SessionState) -> Result<(), StoreError> {
    let Some(dir) = &s.dir else { return Ok(()) };
    let records: Vec<CheckpointRecord> = s
        .checkpoints
        .iter()
        .map(|c| CheckpointRecord {
            v: SCHEMA_VERSION,
            checkpoint: c.clone(),
            extra: serde_json::Map::new(),
        })
        .collect();
    let json = serde_json::to_string_pretty(&records).expect("checkpoints always serialize");
    std::fs::write(dir.join("checkpoints.json"), json)?;
    Ok(())
}

fn load_session(id: &str, dir: &Path) -> Result<SessionState, StoreError> {
    let mut state = SessionState {
        id: id.to_string(),
        records: Vec::new(),
        next_id: 1,
        head: 0,
        checkpoints: Vec::new(),
        dir: Some(dir.to_path_buf()),
    };

    let log_path = dir.join("messages.jsonl");
    if log_path.is_file() {
        let file = std::fs::File::open(&log_path)?;
        for (lineno, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: LogRecord =
                serde_json::from_str(&line).map_err(|source| StoreError::Corrupt {
                    path: log_path.display().to_string(),
                    line: lineno + 1,
                    source,
                })?;
            match record {
                LogRecord::Append(a) => {
                    state.head = a.message.id;
                    state.next_id = a.message.id + 1;
                    state.records.push(StoredMessage {
                        message: a.message,
                        tombstoned: false,
                        pinned: a.pinned,
                        extra: a.extra,
                    });
                }
                LogRecord::Replace(r) => {
                    if let Some(old) = state
                        .records
                        .iter_mut()
                        .find(|rec| !rec.tombstoned && rec.message.id == r.replaced)
                    {
                        old.tombstoned = true;
                    }
                    state.head = r.message.id;
                    state.next_id = r.message.id + 1;
                    state.records.push(StoredMessage {
                        message: r.message,
                        tombstoned: false,
                        pinned: r.pinned,
                        extra: r.extra,
                    });
                }
                LogRecord::Rollback(r) => {
                    for rec in state.records.iter_mut() {
                        if !rec.tombstoned && rec.message.id > r.head {
                            rec.tombstoned = true;
                        }
                    }
                    state.head = r.head;
                    state.next_id = r.head + 1;
                }
            }
        }
    }

    let cp_path = dir.join("checkpoints.json");
    if cp_path.is_file() {
        let text = std::fs::read_to_string(&cp_path)?;
        let records: Vec<CheckpointRecord> =
            serde_json::from_str(&text).map_err(|source| StoreError::Corrupt {
                path: cp_path.display().to_string(),
                line: 0,
                source,
            })?;
        state.checkpoints = records.into_iter().map(|r| r.checkpoint).collect();
    }

    Ok(state)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
