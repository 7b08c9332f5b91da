//! Durable step log backing replay-based suspension.
//!
//! Every unit of work in a run (one page fetch, one persist, one downstream
//! announcement) executes through [`StepLog::step`]. The step's output is
//! appended to an on-disk log before the next step is scheduled, so the run
//! may suspend at any point (process restart included) and resume on any
//! worker: replay returns the recorded outputs for completed steps instead of
//! re-invoking their side effects, then execution continues from the first
//! unrecorded step.
//!
//! One log file exists per (run, scope): the controller's own steps live in
//! the `run` scope, each part reader gets a `part-N` scope so concurrent
//! readers never interleave in one file. Step numbering is deterministic
//! (sequential per scope); a label mismatch against history means the caller
//! diverged from the recorded run and is reported as corruption rather than
//! silently re-executed.

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use groupsync_common::SyncError;

/// One recorded step: deterministic sequence number, caller label and the
/// serialized output that replay will hand back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub seq: u32,
    pub label: String,
    pub output: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only JSONL step log for one scope of one run.
pub struct StepLog {
    path: PathBuf,
    scope: String,
    /// Records loaded from disk, consumed front-first during replay.
    pending_replay: VecDeque<StepRecord>,
    next_seq: u32,
}

impl StepLog {
    /// Open the log for `scope` under `dir`, loading any prior history.
    pub fn open(dir: &Path, scope: &str) -> Result<Self, SyncError> {
        fs::create_dir_all(dir).map_err(|e| SyncError::StepLogCorrupt {
            scope: scope.to_string(),
            detail: format!("cannot create state dir: {}", e),
        })?;
        let path = dir.join(format!("{}.jsonl", scope));

        let mut pending_replay = VecDeque::new();
        if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| SyncError::StepLogCorrupt {
                scope: scope.to_string(),
                detail: format!("cannot read log: {}", e),
            })?;
            for (lineno, line) in content.lines().enumerate() {
                if line.is_empty() {
                    continue;
                }
                let record: StepRecord =
                    serde_json::from_str(line).map_err(|e| SyncError::StepLogCorrupt {
                        scope: scope.to_string(),
                        detail: format!("line {}: {}", lineno + 1, e),
                    })?;
                pending_replay.push_back(record);
            }
        }

        Ok(Self {
            path,
            scope: scope.to_string(),
            next_seq: pending_replay.len() as u32,
            pending_replay,
        })
    }

    /// Number of steps already recorded when the log was opened and not yet
    /// replayed.
    pub fn replay_remaining(&self) -> usize {
        self.pending_replay.len()
    }

    /// Execute one step.
    ///
    /// If the next recorded entry matches `label`, its output is returned
    /// without invoking `op`. Otherwise `op` runs and its output is durably
    /// appended before this call returns. A failed `op` records nothing, so
    /// the step re-runs on the next invocation.
    pub async fn step<T, F, Fut>(&mut self, label: &str, op: F) -> Result<T, SyncError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, SyncError>>,
    {
        if let Some(front) = self.pending_replay.front() {
            if front.label != label {
                return Err(SyncError::StepLogCorrupt {
                    scope: self.scope.clone(),
                    detail: format!(
                        "replay expected step '{}' at seq {}, caller asked for '{}'",
                        front.label, front.seq, label
                    ),
                });
            }
            let record = self.pending_replay.pop_front().expect("front checked");
            debug!(scope = %self.scope, seq = record.seq, label, "replaying recorded step");
            return serde_json::from_value(record.output).map_err(|e| SyncError::StepLogCorrupt {
                scope: self.scope.clone(),
                detail: format!("step '{}' output does not deserialize: {}", label, e),
            });
        }

        let output = op().await?;
        self.append(label, &output)?;
        Ok(output)
    }

    fn append<T: Serialize>(&mut self, label: &str, output: &T) -> Result<(), SyncError> {
        let record = StepRecord {
            seq: self.next_seq,
            label: label.to_string(),
            output: serde_json::to_value(output).map_err(|e| SyncError::StepLogCorrupt {
                scope: self.scope.clone(),
                detail: format!("step '{}' output does not serialize: {}", label, e),
            })?,
            recorded_at: Utc::now(),
        };

        let line = serde_json::to_string(&record).map_err(|e| SyncError::StepLogCorrupt {
            scope: self.scope.clone(),
            detail: e.to_string(),
        })?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SyncError::StepLogCorrupt {
                scope: self.scope.clone(),
                detail: format!("cannot open log for append: {}", e),
            })?;
        writeln!(file, "{}", line).map_err(|e| SyncError::StepLogCorrupt {
            scope: self.scope.clone(),
            detail: format!("cannot append: {}", e),
        })?;
        // The step is only "completed" once the record is on disk.
        file.sync_all().map_err(|e| SyncError::StepLogCorrupt {
            scope: self.scope.clone(),
            detail: format!("cannot sync: {}", e),
        })?;

        debug!(scope = %self.scope, seq = self.next_seq, label, "recorded step");
        self.next_seq += 1;
        Ok(())
    }
}

/// Remove all step logs for one run. Called when the run reaches any final
/// outcome: success, terminal failure, or wholesale deferral.
pub fn clear_run_state(dir: &Path) -> std::io::Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    Ok(())
}
