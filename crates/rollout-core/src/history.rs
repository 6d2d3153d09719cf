//! Rollout history
//!
//! Append-only log of rollout starts and outcomes, optionally backed by a
//! JSON-lines file. A `Started` record with no matching `Finished` record
//! after a restart marks a rollout that was abandoned in flight; those are
//! reported, never resumed.

use crate::error::HistoryError;
use crate::types::{ArtifactRef, Environment, Phase, RolloutId, RolloutState};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Terminal outcome of a rollout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    RolledBack,
    RollbackFailed,
    Aborted,
}

impl Outcome {
    /// Outcome for a terminal phase, `None` otherwise
    #[must_use]
    pub fn from_phase(phase: Phase) -> Option<Self> {
        match phase {
            Phase::Completed => Some(Self::Completed),
            Phase::RolledBack => Some(Self::RolledBack),
            Phase::RollbackFailed => Some(Self::RollbackFailed),
            Phase::Aborted => Some(Self::Aborted),
            _ => None,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Completed => "COMPLETED",
            Self::RolledBack => "ROLLED_BACK",
            Self::RollbackFailed => "ROLLBACK_FAILED",
            Self::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// One line of the history file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum HistoryRecord {
    Started {
        id: RolloutId,
        environment: Environment,
        artifact: ArtifactRef,
        at: DateTime<Utc>,
    },
    Finished {
        id: RolloutId,
        environment: Environment,
        outcome: Outcome,
        at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl HistoryRecord {
    #[must_use]
    pub fn id(&self) -> RolloutId {
        match self {
            Self::Started { id, .. } | Self::Finished { id, .. } => *id,
        }
    }
}

/// A rollout as reconstructed from its records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: RolloutId,
    pub environment: Environment,
    pub artifact: ArtifactRef,
    pub started_at: DateTime<Utc>,
    /// `None` while in flight (or abandoned)
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<Outcome>,
    pub reason: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<RolloutId, HistoryEntry>,
    file: Option<File>,
}

/// Append-only rollout history
#[derive(Debug)]
pub struct HistoryLog {
    inner: Mutex<Inner>,
    path: Option<PathBuf>,
    /// In flight when the file was last written, computed at open
    abandoned: Vec<HistoryEntry>,
}

impl Default for HistoryLog {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl HistoryLog {
    /// History kept only for the life of the process
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            path: None,
            abandoned: Vec::new(),
        }
    }

    /// Open (or create) a JSON-lines history file
    ///
    /// # Errors
    /// - `HistoryError::Io` if the file cannot be read or opened for append
    /// - `HistoryError::Malformed` naming the first unparseable line; a
    ///   truncated final line is a torn write and is discarded instead
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let path = path.into();
        let mut entries = BTreeMap::new();

        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            let mut offset = 0;
            for (index, raw) in contents.split_inclusive('\n').enumerate() {
                let start = offset;
                offset += raw.len();
                let line = raw.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<HistoryRecord>(line) {
                    Ok(record) => apply(&mut entries, record),
                    // Crash mid-append: drop the partial record so the next
                    // append starts on a clean line
                    Err(e) if e.is_eof() && contents[offset..].trim().is_empty() => {
                        tracing::warn!(
                            path = %path.display(),
                            line = index + 1,
                            error = %e,
                            "Discarding torn final history record"
                        );
                        OpenOptions::new()
                            .write(true)
                            .open(&path)?
                            .set_len(start as u64)?;
                        break;
                    }
                    Err(e) => {
                        return Err(HistoryError::Malformed {
                            line: index + 1,
                            message: e.to_string(),
                        })
                    }
                }
            }
        }

        let abandoned: Vec<HistoryEntry> = entries
            .values()
            .filter(|e| e.outcome.is_none())
            .cloned()
            .collect();
        if !abandoned.is_empty() {
            tracing::warn!(
                path = %path.display(),
                count = abandoned.len(),
                "Rollouts abandoned in flight, manual reconciliation required"
            );
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                entries,
                file: Some(file),
            }),
            path: Some(path),
            abandoned,
        })
    }

    /// Record that a rollout started
    ///
    /// # Errors
    /// Returns an error if the record cannot be written.
    pub fn record_started(&self, state: &RolloutState) -> Result<(), HistoryError> {
        self.append(HistoryRecord::Started {
            id: state.id,
            environment: state.environment().clone(),
            artifact: state.request.artifact.clone(),
            at: state.started_at,
        })
    }

    /// Record a rollout's terminal outcome; ignored for non-terminal states
    ///
    /// # Errors
    /// Returns an error if the record cannot be written.
    pub fn record_finished(&self, state: &RolloutState) -> Result<(), HistoryError> {
        let Some(outcome) = Outcome::from_phase(state.phase) else {
            return Ok(());
        };
        self.append(HistoryRecord::Finished {
            id: state.id,
            environment: state.environment().clone(),
            outcome,
            at: state.finished_at.unwrap_or_else(Utc::now),
            reason: state.failure.as_ref().map(|f| f.reason.clone()),
        })
    }

    /// All known rollouts, oldest first
    #[must_use]
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.inner.lock().entries.values().cloned().collect()
    }

    /// Look up one rollout
    #[must_use]
    pub fn get(&self, id: RolloutId) -> Option<HistoryEntry> {
        self.inner.lock().entries.get(&id).cloned()
    }

    /// Rollouts that were in flight when the file was last written
    #[must_use]
    pub fn abandoned(&self) -> &[HistoryEntry] {
        &self.abandoned
    }

    /// Backing file, if any
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn append(&self, record: HistoryRecord) -> Result<(), HistoryError> {
        let mut inner = self.inner.lock();
        if let Some(file) = inner.file.as_mut() {
            let mut line = serde_json::to_vec(&record)?;
            line.push(b'\n');
            file.write_all(&line)?;
            file.flush()?;
        }
        apply(&mut inner.entries, record);
        Ok(())
    }
}

fn apply(entries: &mut BTreeMap<RolloutId, HistoryEntry>, record: HistoryRecord) {
    match record {
        HistoryRecord::Started {
            id,
            environment,
            artifact,
            at,
        } => {
            entries.insert(
                id,
                HistoryEntry {
                    id,
                    environment,
                    artifact,
                    started_at: at,
                    finished_at: None,
                    outcome: None,
                    reason: None,
                },
            );
        }
        HistoryRecord::Finished {
            id,
            outcome,
            at,
            reason,
            ..
        } => {
            if let Some(entry) = entries.get_mut(&id) {
                entry.finished_at = Some(at);
                entry.outcome = Some(outcome);
                entry.reason = reason;
            } else {
                tracing::warn!(rollout_id = %id, "Finished record without a start, ignored");
            }
        }
    }
}
