// src/gc.rs

//! Garbage collection of stale chunk-index records.
//!
//! Owners are queued as they change: *removed* owners lose every record,
//! *replaced* owners lose every record not stamped with their current mtime.
//! A pass walks the whole index once and only deletes records that match
//! the queue as it stood when the pass started. A time-bounded sweep that
//! runs out of budget leaves the pass open; the next sweep picks it up at
//! the first key it did not visit.

use crate::error::Result;
use crate::index::{ ChunkIndex, LocationRecord };
use crate::proto::FileId;
use serde::{ Deserialize, Serialize };
use std::collections::{ HashMap, HashSet };
use std::sync::{ Mutex, MutexGuard };
use std::time::{ Duration, Instant };

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub interval_secs: u64,
    pub time_budget_ms: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            interval_secs: 300,
            time_budget_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Pending {
    removed: HashSet<FileId>,
    replaced: HashMap<FileId, u64>,
}

impl Pending {
    fn is_stale(&self, record: &LocationRecord) -> bool {
        if self.removed.contains(&record.owner) {
            return true;
        }
        match self.replaced.get(&record.owner) {
            Some(&mtime) => record.mtime != Some(mtime),
            None => false,
        }
    }

    fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.replaced.is_empty()
    }
}

// A pass over the index that may span several budgeted sweeps.
#[derive(Debug)]
struct Pass {
    snapshot: Pending,
    /// Key of the first entry not visited yet.
    resume: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub scanned: usize,
    pub deleted: usize,
    /// False when the time budget ran out before the end of the index; the
    /// pass is then continued by the next sweep.
    pub complete: bool,
}

#[derive(Default)]
pub struct GcTracker {
    pending: Mutex<Pending>,
    pass: Mutex<Option<Pass>>,
}

// Neither the queue nor the pass holds invariants a panicking holder could break.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl GcTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        lock(&self.pending)
    }

    /// Every record owned by `owner` is stale.
    pub fn mark_removed(&self, owner: FileId) {
        let mut pending = self.lock();
        pending.replaced.remove(&owner);
        pending.removed.insert(owner);
    }

    /// `owner` now has new content stamped `mtime`; older records are stale.
    pub fn mark_replaced(&self, owner: FileId, mtime: u64) {
        let mut pending = self.lock();
        pending.removed.remove(&owner);
        pending.replaced.insert(owner, mtime);
    }

    /// Number of owners waiting for a sweep.
    pub fn pending(&self) -> usize {
        let pending = self.lock();
        pending.removed.len() + pending.replaced.len()
    }

    /// True while a budgeted sweep has left a pass unfinished.
    pub fn in_progress(&self) -> bool {
        lock(&self.pass).is_some()
    }

    /// Deletes the records made stale by queued owners. With a `budget`, the
    /// walk stops once it has run that long and the next sweep resumes
    /// where it stopped. Owners queued while a pass is open wait for the
    /// following pass.
    pub fn sweep(&self, index: &ChunkIndex, budget: Option<Duration>) -> Result<GcReport> {
        let mut slot = lock(&self.pass);
        let mut report = GcReport::default();
        let mut pass = match slot.take() {
            Some(pass) => pass,
            None => {
                let snapshot = self.lock().clone();
                if snapshot.is_empty() {
                    report.complete = true;
                    return Ok(report);
                }
                Pass { snapshot, resume: None }
            }
        };

        let deadline = budget.map(|b| Instant::now() + b);
        let cursor = match &pass.resume {
            Some(key) => index.open_cursor_from(key)?,
            None => index.open_cursor_all()?,
        };
        report.complete = true;
        if let Some(mut cursor) = cursor {
            loop {
                report.scanned += 1;
                if cursor.get().is_some_and(|r| pass.snapshot.is_stale(r)) {
                    cursor.delete_current()?;
                    report.deleted += 1;
                }
                if !cursor.advance()? {
                    break;
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    report.complete = false;
                    pass.resume = Some(cursor.key().to_vec());
                    break;
                }
            }
        }

        if report.complete {
            // Owners re-queued with different state during the pass stay queued.
            let mut pending = self.lock();
            for owner in &pass.snapshot.removed {
                pending.removed.remove(owner);
            }
            for (owner, mtime) in &pass.snapshot.replaced {
                if pending.replaced.get(owner) == Some(mtime) {
                    pending.replaced.remove(owner);
                }
            }
        } else {
            *slot = Some(pass);
        }

        log::info!(
            "GC sweep: scanned {} entries, deleted {}{}",
            report.scanned,
            report.deleted,
            if report.complete { "" } else { " (budget exhausted, will resume)" }
        );
        Ok(report)
    }
}

/// Sweeps and syncs the index every `config.interval_secs`, forever.
pub async fn run_periodic(tracker: &GcTracker, index: &ChunkIndex, config: &GcConfig) {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.interval_secs.max(1)));
    let budget = Duration::from_millis(config.time_budget_ms);
    loop {
        ticker.tick().await;
        if let Err(e) = tracker.sweep(index, Some(budget)) {
            log::warn!("GC sweep failed: {}", e);
        }
        if let Err(e) = index.sync() {
            log::warn!("Index sync failed: {}", e);
        }
    }
}
