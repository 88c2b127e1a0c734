//! Append-only session history with durable writes and trend analytics.
//!
//! The history lives in a single JSON array file. Writes go through a
//! temp-file + fsync + rename sequence so a record acknowledged to clients
//! survives a crash. The persistence thread owns the file; HTTP handlers
//! read a shared in-memory copy.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use steadyscript_types::{ExerciseMode, ServerMessage, SessionRecord};

use crate::errors::StoreError;

/// Write retries on persistence failure (exponential backoff).
const WRITE_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Bound of the pipeline -> persistence channel. Overflow blocks the
/// pipeline: safer than losing a completed session.
pub const PERSIST_QUEUE_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

/// Response body of `GET /api/sessions`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionRecord>,
    pub trend: Trend,
    #[serde(rename = "trendPercent")]
    pub trend_percent: f64,
}

pub struct SessionStore {
    path: PathBuf,
    records: Vec<SessionRecord>,
}

impl SessionStore {
    /// Load existing history, or start empty. A malformed file is treated
    /// as empty (with a warning) rather than refusing to start.
    pub fn load(path: &Path) -> Self {
        let records = match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<SessionRecord>>(&bytes) {
                Ok(records) => records,
                Err(e) => {
                    warn!("ignoring malformed session history {}: {e}", path.display());
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        info!(
            "session store at {} ({} records)",
            path.display(),
            records.len()
        );
        Self {
            path: path.to_path_buf(),
            records,
        }
    }

    pub fn records(&self) -> &[SessionRecord] {
        &self.records
    }

    /// Append one record and write the file durably.
    pub fn append(&mut self, record: SessionRecord) -> Result<(), StoreError> {
        self.records.push(record);
        self.write_atomic()
    }

    fn write_atomic(&self) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(|source| StoreError::Write {
                    path: self.path.clone(),
                    source,
                })?;
            }
        }
        let bytes = serde_json::to_vec_pretty(&self.records)?;
        let tmp = self.path.with_extension("json.tmp");
        let write = || -> std::io::Result<()> {
            fs::write(&tmp, &bytes)?;
            let f = fs::File::open(&tmp)?;
            f.sync_all()?;
            fs::rename(&tmp, &self.path)?;
            Ok(())
        };
        write().map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

/// Query the history: newest-first records plus trend summary.
pub fn query(
    records: &[SessionRecord],
    limit: usize,
    session_type: Option<ExerciseMode>,
) -> SessionsResponse {
    let mut sorted: Vec<SessionRecord> = records
        .iter()
        .filter(|r| session_type.map_or(true, |t| r.session_type == t))
        .cloned()
        .collect();
    sorted.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let (trend, trend_percent) = compute_trend(&sorted);
    sorted.truncate(limit);

    SessionsResponse {
        sessions: sorted,
        trend,
        trend_percent,
    }
}

/// Trend over `tremor_score`: mean of the most recent five records versus
/// the five before that (input must be newest-first).
pub fn compute_trend(newest_first: &[SessionRecord]) -> (Trend, f64) {
    let scores: Vec<f64> = newest_first.iter().map(|r| r.tremor_score).collect();
    let recent = &scores[..scores.len().min(5)];
    let previous = &scores[scores.len().min(5)..scores.len().min(10)];

    if recent.is_empty() {
        return (Trend::Stable, 0.0);
    }
    let avg_recent = recent.iter().sum::<f64>() / recent.len() as f64;
    let avg_previous = if previous.is_empty() {
        avg_recent
    } else {
        previous.iter().sum::<f64>() / previous.len() as f64
    };

    let percent = if avg_previous > 0.0 {
        (avg_recent - avg_previous) / avg_previous * 100.0
    } else {
        0.0
    };
    let trend = if percent > 5.0 {
        Trend::Improving
    } else if percent < -5.0 {
        Trend::Declining
    } else {
        Trend::Stable
    };
    (trend, (percent * 10.0).round() / 10.0)
}

/// Persistence thread body: receive finalized records, commit them
/// durably, then (and only then) announce `session_complete` to clients.
pub fn persistence_loop(
    mut store: SessionStore,
    record_rx: crossbeam_channel::Receiver<SessionRecord>,
    history: Arc<RwLock<Vec<SessionRecord>>>,
    event_tx: tokio::sync::broadcast::Sender<ServerMessage>,
) {
    *history.write() = store.records().to_vec();

    while let Ok(record) = record_rx.recv() {
        let mut committed = false;
        for attempt in 0..WRITE_ATTEMPTS {
            match store.append(record.clone()) {
                Ok(()) => {
                    committed = true;
                    break;
                }
                Err(e) => {
                    warn!(
                        "session write failed (attempt {}/{}): {e}",
                        attempt + 1,
                        WRITE_ATTEMPTS
                    );
                    // The record is already in memory; drop it before retry
                    // so the next append does not duplicate it.
                    if attempt + 1 < WRITE_ATTEMPTS {
                        store.records.pop();
                        std::thread::sleep(BACKOFF_BASE * 2u32.pow(attempt));
                    }
                }
            }
        }

        if committed {
            *history.write() = store.records().to_vec();
            let _ = event_tx.send(ServerMessage::SessionComplete(record));
        } else {
            error!("giving up persisting session record after {WRITE_ATTEMPTS} attempts");
            let _ = event_tx.send(ServerMessage::Error(
                "failed to persist completed session".to_string(),
            ));
        }
    }
}
