//! Durable "is a program running, and which one".
//!
//! This record is the only mutual-exclusion gate for program execution. The
//! in-memory copy is authoritative; disk is written on every transition and
//! read back to verify. [`RecordStore::load`] reconciles the two and is the
//! single place that resolves a check-then-act window against disk.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{ControlError, Result};
use crate::events::{EventKind, EventLog};
use crate::io::{self, Loaded};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    #[serde(default)]
    pub program_running: bool,
    #[serde(default)]
    pub current_program_id: Option<String>,
}

impl ExecutionRecord {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn running(program_id: impl Into<String>) -> Self {
        Self {
            program_running: true,
            current_program_id: Some(program_id.into()),
        }
    }

    /// `current_program_id` must be set whenever a program is running.
    pub fn is_consistent(&self) -> bool {
        !self.program_running || self.current_program_id.is_some()
    }
}

/// Where the record document lives.
pub(crate) trait RecordDisk: Send + Sync {
    fn write(&self, path: &Path, record: &ExecutionRecord) -> anyhow::Result<()>;
    fn read(&self, path: &Path) -> anyhow::Result<Loaded<ExecutionRecord>>;
}

/// Plain JSON file with atomic replacement.
struct JsonDisk;

impl RecordDisk for JsonDisk {
    fn write(&self, path: &Path, record: &ExecutionRecord) -> anyhow::Result<()> {
        io::write_json(path, record)
    }

    fn read(&self, path: &Path) -> anyhow::Result<Loaded<ExecutionRecord>> {
        io::read_json(path)
    }
}

#[derive(Clone)]
pub struct RecordStore {
    path: PathBuf,
    memory: Arc<Mutex<ExecutionRecord>>,
    disk: Arc<dyn RecordDisk>,
    events: EventLog,
}

impl RecordStore {
    /// Open the record at `path` with an idle in-memory copy, then reconcile
    /// with whatever is on disk.
    pub fn open(path: impl Into<PathBuf>, events: EventLog) -> Result<Self> {
        Self::open_with(path, events, Arc::new(JsonDisk))
    }

    pub(crate) fn open_with(
        path: impl Into<PathBuf>,
        events: EventLog,
        disk: Arc<dyn RecordDisk>,
    ) -> Result<Self> {
        let store = Self {
            path: path.into(),
            memory: Arc::new(Mutex::new(ExecutionRecord::idle())),
            disk,
            events,
        };
        store.load()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> ExecutionRecord {
        self.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock().program_running
    }

    pub fn current_program_id(&self) -> Option<String> {
        self.lock().current_program_id.clone()
    }

    /// Persist the in-memory record.
    pub fn save(&self) -> Result<()> {
        let memory = self.lock();
        self.persist(&memory)
    }

    /// Reconcile disk with memory and return the resulting record.
    ///
    /// - absent or unparsable file: memory becomes idle and is persisted;
    /// - disk "not running" while memory is running: memory wins and is
    ///   re-persisted (a stale snapshot must never abort a live program);
    /// - otherwise memory adopts disk.
    pub fn load(&self) -> Result<ExecutionRecord> {
        let mut memory = self.lock();

        let loaded = self.disk.read(&self.path).map_err(ControlError::storage)?;
        match loaded {
            Loaded::Missing => {
                self.events.info(
                    EventKind::Program,
                    "execution record not found, initialising idle state",
                );
                *memory = ExecutionRecord::idle();
                self.persist(&memory)?;
            }
            Loaded::Corrupt(reason) => {
                self.events.warn(
                    EventKind::Program,
                    format!("execution record unreadable ({reason}), initialising idle state"),
                );
                *memory = ExecutionRecord::idle();
                self.persist(&memory)?;
            }
            Loaded::Valid(disk) if !disk.is_consistent() => {
                self.events.warn(
                    EventKind::Program,
                    "execution record marks a program running without an id, initialising idle state",
                );
                *memory = ExecutionRecord::idle();
                self.persist(&memory)?;
            }
            Loaded::Valid(disk) if !disk.program_running && memory.program_running => {
                self.events.warn(
                    EventKind::Program,
                    format!(
                        "stale execution record on disk, keeping running program {}",
                        memory.current_program_id.as_deref().unwrap_or("?")
                    ),
                );
                self.persist(&memory)?;
            }
            Loaded::Valid(disk) => {
                *memory = disk;
            }
        }

        Ok(memory.clone())
    }

    /// Atomically claim the record for `program_id`. Returns `false` when a
    /// program is already running; nothing changes in that case.
    pub fn try_begin(&self, program_id: &str) -> Result<bool> {
        let mut memory = self.lock();
        if memory.program_running {
            return Ok(false);
        }
        *memory = ExecutionRecord::running(program_id);
        self.persist(&memory)?;
        Ok(true)
    }

    /// Mark idle and persist.
    pub fn clear(&self) -> Result<()> {
        let mut memory = self.lock();
        *memory = ExecutionRecord::idle();
        self.persist(&memory)
    }

    /// Process start: nothing can be running yet, whatever disk says.
    pub fn reset_on_boot(&self) -> Result<()> {
        let previous = self.snapshot();
        if previous.program_running {
            self.events.warn(
                EventKind::Program,
                format!(
                    "program {} was marked running at startup, resetting",
                    previous.current_program_id.as_deref().unwrap_or("?")
                ),
            );
        }
        self.clear()
    }

    /// Write, read back, and rewrite once on mismatch.
    fn persist(&self, record: &ExecutionRecord) -> Result<()> {
        self.disk.write(&self.path, record).map_err(ControlError::storage)?;

        match self.disk.read(&self.path) {
            Ok(Loaded::Valid(on_disk)) if on_disk == *record => return Ok(()),
            Ok(_) => {}
            Err(e) => {
                self.events.warn(
                    EventKind::Program,
                    format!("execution record verification failed: {e:#}"),
                );
            }
        }

        self.events.warn(
            EventKind::Program,
            "execution record verification mismatch, rewriting",
        );
        self.disk.write(&self.path, record).map_err(ControlError::storage)?;
        match self.disk.read(&self.path) {
            Ok(Loaded::Valid(on_disk)) if on_disk == *record => Ok(()),
            Ok(_) => Err(ControlError::storage(anyhow!(
                "execution record still differs after rewrite: {}",
                self.path.display()
            ))),
            Err(e) => Err(ControlError::storage(e)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ExecutionRecord> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
