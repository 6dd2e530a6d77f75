//! Durable record of which payments have been forwarded.
//!
//! The whole ledger is a small JSON document. Every mutation is applied to a
//! copy of the state, written to a temporary file beside the ledger, fsynced
//! and renamed over the old file; the in-memory state only changes once that
//! write succeeded. A crash therefore leaves either the old or the new state on
//! disk, never a torn one.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::LedgerError;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForwardStatus {
    Pending,
    Sent,
    FailedPermanent,
}

impl ForwardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardStatus::Pending => "pending",
            ForwardStatus::Sent => "sent",
            ForwardStatus::FailedPermanent => "failed-permanent",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ForwardStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRecord {
    pub payment_id: String,
    pub status: ForwardStatus,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl ForwardRecord {
    fn new(payment_id: &str) -> Self {
        Self {
            payment_id: payment_id.to_string(),
            status: ForwardStatus::Pending,
            last_attempt_at: None,
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardStats {
    pub forwarded_count: u64,
    #[serde(with = "rust_decimal::serde::str")]
    pub forwarded_total: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerState {
    version: u32,
    high_water_mark: DateTime<Utc>,
    records: BTreeMap<String, ForwardRecord>,
    #[serde(default)]
    stats: ForwardStats,
}

impl LedgerState {
    fn fresh(start: DateTime<Utc>) -> Self {
        Self {
            version: FORMAT_VERSION,
            high_water_mark: start,
            records: BTreeMap::new(),
            stats: ForwardStats::default(),
        }
    }

    fn transition(&mut self, payment_id: &str, to: ForwardStatus) -> Result<&mut ForwardRecord, LedgerError> {
        let record = self
            .records
            .entry(payment_id.to_string())
            .or_insert_with(|| ForwardRecord::new(payment_id));
        if record.status != ForwardStatus::Pending && record.status != to {
            return Err(LedgerError::InvalidTransition {
                payment_id: payment_id.to_string(),
                from: record.status.as_str(),
                to: to.as_str(),
            });
        }
        Ok(record)
    }
}

pub struct Ledger {
    path: Option<PathBuf>,
    state: LedgerState,
}

impl Ledger {
    /// Loads the ledger at `path`. A missing file starts a fresh ledger whose
    /// high-water mark is `start`, so history before the first run is ignored.
    pub fn open(path: impl Into<PathBuf>, start: DateTime<Utc>) -> Result<Self, LedgerError> {
        let path = path.into();
        if path.exists() {
            let data = std::fs::read(&path)?;
            let state: LedgerState = serde_json::from_slice(&data)?;
            let ledger = Self {
                path: Some(path),
                state,
            };
            info!(
                sent = ledger.sent_count(),
                high_water_mark = %ledger.high_water_mark(),
                "Ledger loaded"
            );
            return Ok(ledger);
        }

        let ledger = Self {
            path: Some(path),
            state: LedgerState::fresh(start),
        };
        ledger.write(&ledger.state)?;
        info!(high_water_mark = %start, "Ledger created");
        Ok(ledger)
    }

    /// Non-durable ledger, for demos and tests.
    pub fn in_memory(start: DateTime<Utc>) -> Self {
        Self {
            path: None,
            state: LedgerState::fresh(start),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_sent(&self, payment_id: &str) -> bool {
        self.status(payment_id) == Some(ForwardStatus::Sent)
    }

    pub fn status(&self, payment_id: &str) -> Option<ForwardStatus> {
        self.state.records.get(payment_id).map(|r| r.status)
    }

    pub fn record(&self, payment_id: &str) -> Option<&ForwardRecord> {
        self.state.records.get(payment_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &ForwardRecord> {
        self.state.records.values()
    }

    pub fn sent_count(&self) -> usize {
        self.records()
            .filter(|r| r.status == ForwardStatus::Sent)
            .count()
    }

    pub fn high_water_mark(&self) -> DateTime<Utc> {
        self.state.high_water_mark
    }

    pub fn stats(&self) -> &ForwardStats {
        &self.state.stats
    }

    /// Moves the mark forward; earlier timestamps are ignored. Returns whether it moved.
    pub fn advance_high_water_mark(&mut self, to: DateTime<Utc>) -> Result<bool, LedgerError> {
        if to <= self.state.high_water_mark {
            return Ok(false);
        }
        self.commit(|state| {
            state.high_water_mark = to;
            Ok(())
        })?;
        debug!(high_water_mark = %to, "High-water mark advanced");
        Ok(true)
    }

    /// Counts a failed delivery attempt and returns the attempt total.
    pub fn record_failure(&mut self, payment_id: &str, at: DateTime<Utc>) -> Result<u32, LedgerError> {
        self.commit(|state| {
            let record = state.transition(payment_id, ForwardStatus::Pending)?;
            record.attempts += 1;
            record.last_attempt_at = Some(at);
            Ok(record.attempts)
        })
    }

    /// Records a confirmed delivery. Marking an already-sent payment is a no-op.
    pub fn mark_sent(&mut self, payment_id: &str, amount: Decimal, at: DateTime<Utc>) -> Result<(), LedgerError> {
        if self.is_sent(payment_id) {
            return Ok(());
        }
        self.commit(|state| {
            let record = state.transition(payment_id, ForwardStatus::Sent)?;
            record.status = ForwardStatus::Sent;
            record.attempts += 1;
            record.last_attempt_at = Some(at);
            state.stats.forwarded_count += 1;
            state.stats.forwarded_total += amount;
            Ok(())
        })
    }

    /// Gives up on a payment for good.
    pub fn mark_failed(&mut self, payment_id: &str, at: DateTime<Utc>) -> Result<(), LedgerError> {
        if self.status(payment_id) == Some(ForwardStatus::FailedPermanent) {
            return Ok(());
        }
        self.commit(|state| {
            let record = state.transition(payment_id, ForwardStatus::FailedPermanent)?;
            record.status = ForwardStatus::FailedPermanent;
            record.last_attempt_at = Some(at);
            Ok(())
        })
    }

    pub fn reset_stats(&mut self) -> Result<(), LedgerError> {
        self.commit(|state| {
            state.stats = ForwardStats::default();
            Ok(())
        })
    }

    fn commit<T>(
        &mut self,
        mutate: impl FnOnce(&mut LedgerState) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut next = self.state.clone();
        let out = mutate(&mut next)?;
        self.write(&next)?;
        self.state = next;
        Ok(out)
    }

    fn write(&self, state: &LedgerState) -> Result<(), LedgerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let data = serde_json::to_vec_pretty(state)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| LedgerError::Io(e.error))?;
        sync_dir(&dir)?;
        Ok(())
    }
}

/// Flushes the directory entry so the rename itself is durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

// No directory handle to flush on this platform.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
