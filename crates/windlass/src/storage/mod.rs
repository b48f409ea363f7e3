//! In-memory materialization of one workflow's durable state
//!
//! This module provides:
//! - [`Storage`]: the full snapshot for one workflow instance (name registry,
//!   history, entry metadata, inbox, workflow-level state/output/error)
//! - [`Entry`]/[`EntryMetadata`]/[`Message`] durable records
//! - [`keys`]: the durable key layout
//!
//! Exactly one `Storage` exists per running invocation. It is constructed
//! fresh on first run, reloaded from the driver on every later invocation,
//! mutated only by the executor and the context operations it creates, and
//! flushed (dirty records only) at every pause or terminal transition.

pub mod keys;

mod entry;

pub use entry::{
    BranchSlot, BranchStatus, Entry, EntryKind, EntryMetadata, EntryStatus, LoopCheckpoint, Message,
};

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::str::FromStr;

use uuid::Uuid;

use crate::driver::{BatchOp, DriverError, EngineDriver};
use crate::error::StoredError;
use crate::location::{location_key, Location, NameIndex, NameRegistry};

/// Workflow lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    /// Created but never run.
    Pending,

    /// An invocation is executing the workflow function.
    Running,

    /// Paused on a sleep deadline, a message wait, or a retry backoff.
    /// Not terminal: a later invocation replays into it.
    Sleeping,

    /// An unrecoverable failure occurred; compensation is in progress.
    RollingBack,

    /// Terminal: failed (compensation finished or was bypassed).
    Failed,

    /// Terminal: completed successfully.
    Completed,

    /// Terminal: cancelled by the host.
    Cancelled,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Sleeping => "sleeping",
            Self::RollingBack => "rolling_back",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether no further invocation will make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Completed | Self::Cancelled)
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "sleeping" => Ok(Self::Sleeping),
            "rolling_back" => Ok(Self::RollingBack),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown workflow state '{other}'")),
        }
    }
}

/// Dirty records drained out of [`Storage::flush_ops`].
///
/// `ops` should be applied atomically via [`EngineDriver::batch`];
/// `delete_prefixes` are bulk subtree deletions from loop-history trimming,
/// applied afterwards via [`EngineDriver::delete_prefix`].
#[derive(Debug, Default)]
pub struct FlushSet {
    pub ops: Vec<BatchOp>,
    pub delete_prefixes: Vec<String>,
}

impl FlushSet {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.delete_prefixes.is_empty()
    }
}

/// Full in-memory snapshot for one workflow instance.
pub struct Storage {
    /// Interned operation names.
    pub registry: NameRegistry,
    persisted_names: usize,

    /// History entries keyed by rendered location key. A `BTreeMap` keeps
    /// child enumeration in the same order the driver would list it.
    pub history: BTreeMap<String, Entry>,

    /// Operational metadata keyed by entry id.
    pub metadata: HashMap<Uuid, EntryMetadata>,

    /// Inbox, ordered by message id.
    pub messages: Vec<Message>,
    consumed_messages: Vec<u64>,

    deleted_history_keys: Vec<String>,
    deleted_metadata: Vec<Uuid>,
    trimmed_prefixes: Vec<String>,

    pub state: WorkflowState,
    state_dirty: bool,

    pub input: Option<serde_json::Value>,
    input_dirty: bool,

    pub output: Option<serde_json::Value>,
    output_dirty: bool,

    pub error: Option<StoredError>,
    error_dirty: bool,

    version_dirty: bool,
}

impl Storage {
    /// Fresh storage for a workflow that has never run.
    pub fn new() -> Self {
        Self {
            registry: NameRegistry::new(),
            persisted_names: 0,
            history: BTreeMap::new(),
            metadata: HashMap::new(),
            messages: Vec::new(),
            consumed_messages: Vec::new(),
            deleted_history_keys: Vec::new(),
            deleted_metadata: Vec::new(),
            trimmed_prefixes: Vec::new(),
            state: WorkflowState::Pending,
            state_dirty: true,
            input: None,
            input_dirty: false,
            output: None,
            output_dirty: false,
            error: None,
            error_dirty: false,
            version_dirty: true,
        }
    }

    /// Load the snapshot from the driver's namespace.
    ///
    /// A namespace without a `wf/version` record is treated as fresh; any
    /// messages already delivered into it are still picked up.
    pub async fn load<D: EngineDriver + ?Sized>(driver: &D) -> Result<Self, DriverError> {
        let rows = driver.list("").await?;

        let mut names: Vec<(NameIndex, String)> = Vec::new();
        let mut history = BTreeMap::new();
        let mut metadata = HashMap::new();
        let mut messages: Vec<Message> = Vec::new();
        let mut state = None;
        let mut input = None;
        let mut output = None;
        let mut error = None;
        let mut version: Option<String> = None;

        for (key, value) in rows {
            if let Some(idx) = keys::parse_name_key(&key) {
                let name = String::from_utf8(value).map_err(|e| DriverError::Corrupt {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
                names.push((idx, name));
            } else if let Some(location_key) = key.strip_prefix(keys::HISTORY_PREFIX) {
                let entry: Entry = decode(&key, &value)?;
                history.insert(location_key.to_string(), entry);
            } else if keys::parse_message_key(&key).is_some() {
                messages.push(decode(&key, &value)?);
            } else if let Some(id) = keys::parse_metadata_key(&key) {
                metadata.insert(id, decode::<EntryMetadata>(&key, &value)?);
            } else {
                match key.as_str() {
                    keys::WF_STATE_KEY => {
                        let text = String::from_utf8_lossy(&value).into_owned();
                        state = Some(WorkflowState::from_str(&text).map_err(|reason| {
                            DriverError::Corrupt {
                                key: key.clone(),
                                reason,
                            }
                        })?);
                    }
                    keys::WF_INPUT_KEY => input = Some(decode(&key, &value)?),
                    keys::WF_OUTPUT_KEY => output = Some(decode(&key, &value)?),
                    keys::WF_ERROR_KEY => error = Some(decode(&key, &value)?),
                    keys::WF_VERSION_KEY => {
                        version = Some(String::from_utf8_lossy(&value).into_owned());
                    }
                    // Unknown keys are ignored for forward compatibility.
                    _ => {}
                }
            }
        }

        let fresh = match version {
            None => true,
            Some(v) if v == keys::SCHEMA_VERSION => false,
            Some(found) => {
                return Err(DriverError::SchemaVersion {
                    expected: keys::SCHEMA_VERSION.to_string(),
                    found,
                })
            }
        };

        names.sort_by_key(|(idx, _)| *idx);
        messages.sort_by_key(|m| m.id);

        if fresh {
            let mut storage = Self::new();
            storage.messages = messages;
            return Ok(storage);
        }

        let registry = NameRegistry::from_names(names.into_iter().map(|(_, n)| n).collect());
        let persisted_names = registry.len();

        Ok(Self {
            registry,
            persisted_names,
            history,
            metadata,
            messages,
            consumed_messages: Vec::new(),
            deleted_history_keys: Vec::new(),
            deleted_metadata: Vec::new(),
            trimmed_prefixes: Vec::new(),
            state: state.unwrap_or(WorkflowState::Pending),
            state_dirty: false,
            input,
            input_dirty: false,
            output,
            output_dirty: false,
            error,
            error_dirty: false,
            version_dirty: false,
        })
    }

    // =========================================================================
    // Workflow-level mutation
    // =========================================================================

    pub fn set_state(&mut self, state: WorkflowState) {
        if self.state != state {
            self.state = state;
            self.state_dirty = true;
        }
    }

    pub fn set_input(&mut self, input: serde_json::Value) {
        self.input = Some(input);
        self.input_dirty = true;
    }

    pub fn set_output(&mut self, output: serde_json::Value) {
        self.output = Some(output);
        self.output_dirty = true;
    }

    pub fn set_error(&mut self, error: Option<StoredError>) {
        self.error = error;
        self.error_dirty = true;
    }

    // =========================================================================
    // Names, entries, metadata
    // =========================================================================

    /// Intern an operation name.
    pub fn register_name(&mut self, name: &str) -> NameIndex {
        self.registry.register(name)
    }

    /// Rendered history key for a location.
    pub fn location_key(&self, location: &Location) -> String {
        location_key(&self.registry, location)
    }

    pub fn entry(&self, key: &str) -> Option<&Entry> {
        self.history.get(key)
    }

    /// Mutable entry access; marks the entry dirty.
    pub fn entry_mut(&mut self, key: &str) -> Option<&mut Entry> {
        self.history.get_mut(key).map(|e| {
            e.dirty = true;
            e
        })
    }

    /// Insert a new entry (dirty) with fresh pending metadata (dirty).
    pub fn insert_entry(&mut self, key: String, location: Location, kind: EntryKind) -> Uuid {
        let id = Uuid::now_v7();
        self.history.insert(
            key,
            Entry {
                id,
                location,
                kind,
                dirty: true,
            },
        );
        self.metadata.insert(id, EntryMetadata::pending());
        id
    }

    pub fn entry_metadata(&self, id: Uuid) -> Option<&EntryMetadata> {
        self.metadata.get(&id)
    }

    /// Mutable metadata access; marks the metadata dirty.
    pub fn entry_metadata_mut(&mut self, id: Uuid) -> Option<&mut EntryMetadata> {
        self.metadata.get_mut(&id).map(|m| {
            m.dirty = true;
            m
        })
    }

    /// Number of history entries.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// First unconsumed message matching `names` (any message if empty).
    pub fn find_message(&self, names: &[String]) -> Option<&Message> {
        self.messages
            .iter()
            .find(|m| names.is_empty() || names.contains(&m.name))
    }

    /// Remove a message from the inbox; the durable record is deleted on the
    /// next flush.
    pub fn consume_message(&mut self, id: u64) -> Option<Message> {
        let pos = self.messages.iter().position(|m| m.id == id)?;
        self.consumed_messages.push(id);
        Some(self.messages.remove(pos))
    }

    // =========================================================================
    // Loop-history trimming
    // =========================================================================

    /// Delete the whole subtree rooted at `location` (the root entry included)
    /// from history and metadata, returning the number of removed entries.
    ///
    /// The durable subtree is removed on the next flush: exact deletes for the
    /// records held in memory plus a bulk prefix delete for the subtree.
    pub fn trim_subtree(&mut self, location: &Location) -> usize {
        let root = self.location_key(location);
        let child_prefix = format!("{root}/");

        let keys: Vec<String> = self
            .history
            .range::<String, _>((Bound::Included(root.clone()), Bound::Unbounded))
            .take_while(|(k, _)| *k == &root || k.starts_with(&child_prefix))
            .map(|(k, _)| k.clone())
            .collect();

        let removed = keys.len();
        for key in keys {
            if let Some(entry) = self.history.remove(&key) {
                self.metadata.remove(&entry.id);
                self.deleted_metadata.push(entry.id);
            }
            self.deleted_history_keys.push(key);
        }
        self.trimmed_prefixes.push(keys::history_key(&child_prefix));

        removed
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Drain all dirty records into a [`FlushSet`] and clear the dirty flags.
    ///
    /// Deletions come first in the batch: a trimmed key can be re-occupied by
    /// a tombstone in the same flush, and the put must win.
    pub fn flush_ops(&mut self) -> Result<FlushSet, DriverError> {
        let mut set = FlushSet::default();

        for id in self.consumed_messages.drain(..) {
            set.ops.push(BatchOp::Delete {
                key: keys::message_key(id),
            });
        }
        for key in self.deleted_history_keys.drain(..) {
            set.ops.push(BatchOp::Delete {
                key: keys::history_key(&key),
            });
        }
        for id in self.deleted_metadata.drain(..) {
            set.ops.push(BatchOp::Delete {
                key: keys::metadata_key(id),
            });
        }

        for idx in self.persisted_names..self.registry.len() {
            set.ops.push(BatchOp::Put {
                key: keys::name_key(idx as NameIndex),
                value: self.registry.names()[idx].clone().into_bytes(),
            });
        }
        self.persisted_names = self.registry.len();

        for (location_key, entry) in self.history.iter_mut() {
            if entry.dirty {
                set.ops.push(BatchOp::Put {
                    key: keys::history_key(location_key),
                    value: encode(entry)?,
                });
                entry.dirty = false;
            }
        }

        for (id, metadata) in self.metadata.iter_mut() {
            if metadata.dirty {
                set.ops.push(BatchOp::Put {
                    key: keys::metadata_key(*id),
                    value: encode(metadata)?,
                });
                metadata.dirty = false;
            }
        }

        if self.state_dirty {
            set.ops.push(BatchOp::Put {
                key: keys::WF_STATE_KEY.to_string(),
                value: self.state.as_str().as_bytes().to_vec(),
            });
            self.state_dirty = false;
        }
        if self.input_dirty {
            if let Some(input) = &self.input {
                set.ops.push(BatchOp::Put {
                    key: keys::WF_INPUT_KEY.to_string(),
                    value: encode(input)?,
                });
            }
            self.input_dirty = false;
        }
        if self.output_dirty {
            if let Some(output) = &self.output {
                set.ops.push(BatchOp::Put {
                    key: keys::WF_OUTPUT_KEY.to_string(),
                    value: encode(output)?,
                });
            }
            self.output_dirty = false;
        }
        if self.error_dirty {
            match &self.error {
                Some(error) => set.ops.push(BatchOp::Put {
                    key: keys::WF_ERROR_KEY.to_string(),
                    value: encode(error)?,
                }),
                None => set.ops.push(BatchOp::Delete {
                    key: keys::WF_ERROR_KEY.to_string(),
                }),
            }
            self.error_dirty = false;
        }
        if self.version_dirty {
            set.ops.push(BatchOp::Put {
                key: keys::WF_VERSION_KEY.to_string(),
                value: keys::SCHEMA_VERSION.as_bytes().to_vec(),
            });
            self.version_dirty = false;
        }

        set.delete_prefixes = self.trimmed_prefixes.drain(..).collect();

        Ok(set)
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, DriverError> {
    serde_json::to_vec(value).map_err(|e| DriverError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, value: &[u8]) -> Result<T, DriverError> {
    serde_json::from_slice(value).map_err(|e| DriverError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
