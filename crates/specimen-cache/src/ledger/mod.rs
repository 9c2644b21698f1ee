//! Run ledger: processing runs and their append-only lineage.
//!
//! Layout under the ledger directory:
//!
//! ```text
//! runs/<run_id>.msgpack      one ProcessingRun per file
//! lineage/<run_id>.jsonl     one LineageEntry per line, append-only
//! ```
//!
//! Lineage is never rewritten. Recording the same specimen twice in a run
//! keeps both lines. Appends to one run are serialised by a per-run lock, and
//! different runs never contend.

use crate::core::io::{read_optional, write_atomic};
use crate::hash::ContentHash;
use crate::stats::RunStats;
use crate::types::{LineageEntry, LineageStatus, ProcessingRun};
use crate::{Result, SpecimenError};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const RUNS_DIR: &str = "runs";
const LINEAGE_DIR: &str = "lineage";

/// Lineage counts for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageCounts {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cached: usize,
    pub cache_hits: usize,
}

impl LineageCounts {
    fn add(&mut self, entry: &LineageEntry) {
        self.total += 1;
        match entry.status {
            LineageStatus::Completed => self.completed += 1,
            LineageStatus::Failed => self.failed += 1,
            LineageStatus::Skipped => self.skipped += 1,
            LineageStatus::Cached => self.cached += 1,
        }
        if entry.cache_hit {
            self.cache_hits += 1;
        }
    }
}

pub struct RunLedger {
    runs_dir: PathBuf,
    lineage_dir: PathBuf,
    run_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RunLedger {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let runs_dir = dir.join(RUNS_DIR);
        let lineage_dir = dir.join(LINEAGE_DIR);
        fs::create_dir_all(&runs_dir)?;
        fs::create_dir_all(&lineage_dir)?;

        Ok(Self {
            runs_dir,
            lineage_dir,
            run_locks: DashMap::new(),
        })
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{}.msgpack", run_id))
    }

    fn lineage_path(&self, run_id: &str) -> PathBuf {
        self.lineage_dir.join(format!("{}.jsonl", run_id))
    }

    fn lock_for(&self, run_id: &str) -> Arc<Mutex<()>> {
        self.run_locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Register a new run.
    ///
    /// # Errors
    ///
    /// - `SpecimenError::InvalidArgument` - `run_id` is empty or contains
    ///   characters outside `[A-Za-z0-9._:-]`
    /// - `SpecimenError::DuplicateRunId` - a run with this id already exists
    pub fn start_run(
        &self,
        run_id: &str,
        config_snapshot: serde_json::Value,
        operator: Option<String>,
    ) -> Result<ProcessingRun> {
        validate_run_id(run_id)?;

        let run = ProcessingRun {
            run_id: run_id.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            config_snapshot,
            operator,
            stats: None,
        };
        let serialized = rmp_serde::to_vec(&run)?;

        // Fully written temp file, then a hard link that fails if the run exists.
        let mut temp = tempfile::NamedTempFile::new_in(&self.runs_dir)?;
        temp.write_all(&serialized)?;
        temp.as_file().sync_all()?;
        match fs::hard_link(temp.path(), self.run_path(run_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(SpecimenError::DuplicateRunId(run_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!("Started run {}", run_id);
        Ok(run)
    }

    /// Mark a run completed. Completing it again returns the stored run unchanged.
    pub fn complete_run(&self, run_id: &str) -> Result<ProcessingRun> {
        self.complete_run_with_stats(run_id, None)
    }

    /// Mark a run completed and keep the batch counters with it.
    pub fn complete_run_with_stats(&self, run_id: &str, stats: Option<RunStats>) -> Result<ProcessingRun> {
        let lock = self.lock_for(run_id);
        let _guard = lock.lock();

        let mut run = self
            .get_run(run_id)?
            .ok_or_else(|| SpecimenError::UnknownRun(run_id.to_string()))?;
        if run.is_completed() {
            return Ok(run);
        }

        run.completed_at = Some(Utc::now());
        run.stats = stats;
        write_atomic(&self.run_path(run_id), &rmp_serde::to_vec(&run)?)?;

        tracing::info!("Completed run {}", run_id);
        Ok(run)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<ProcessingRun>> {
        if validate_run_id(run_id).is_err() {
            return Ok(None);
        }
        match read_optional(&self.run_path(run_id))? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All runs, oldest first.
    pub fn list_runs(&self) -> Result<Vec<ProcessingRun>> {
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.runs_dir)?.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(run_id) = name.strip_suffix(".msgpack") else {
                continue;
            };
            if let Some(run) = self.get_run(run_id)? {
                runs.push(run);
            }
        }
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.run_id.cmp(&b.run_id)));
        Ok(runs)
    }

    /// Append a minimal lineage entry.
    pub fn record_lineage(
        &self,
        run_id: &str,
        specimen_hash: &ContentHash,
        status: LineageStatus,
        cache_hit: bool,
    ) -> Result<()> {
        self.append(LineageEntry::new(run_id, status, cache_hit).with_specimen(specimen_hash.clone()))
    }

    /// Append a lineage entry.
    ///
    /// # Errors
    ///
    /// - `SpecimenError::UnknownRun` - the run was never started
    /// - `SpecimenError::Io` - the lineage log could not be written
    pub fn append(&self, entry: LineageEntry) -> Result<()> {
        let run_id = entry.run_id.clone();
        if self.get_run(&run_id)?.is_none() {
            return Err(SpecimenError::UnknownRun(run_id));
        }

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let lock = self.lock_for(&run_id);
        let _guard = lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(self.lineage_path(&run_id))?;
        if ends_torn(&mut file)? {
            // Terminate the fragment so it stays a line of its own.
            line.insert(0, b'\n');
        }
        file.write_all(&line)?;
        file.flush()?;

        Ok(())
    }

    /// Lineage of one run in recording order.
    pub fn lineage(&self, run_id: &str) -> Result<Vec<LineageEntry>> {
        if self.get_run(run_id)?.is_none() {
            return Err(SpecimenError::UnknownRun(run_id.to_string()));
        }

        let file = match fs::File::open(self.lineage_path(run_id)) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LineageEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    // A torn final line from an interrupted append
                    tracing::warn!("Skipping unreadable lineage line {} of run {}: {}", index + 1, run_id, e);
                }
            }
        }
        Ok(entries)
    }

    /// Every lineage entry for a specimen across all runs, oldest run first.
    pub fn lineage_for_specimen(&self, specimen_hash: &ContentHash) -> Result<Vec<LineageEntry>> {
        let mut entries = Vec::new();
        for run in self.list_runs()? {
            entries.extend(
                self.lineage(&run.run_id)?
                    .into_iter()
                    .filter(|entry| entry.specimen_hash.as_ref() == Some(specimen_hash)),
            );
        }
        Ok(entries)
    }

    pub fn run_stats(&self, run_id: &str) -> Result<LineageCounts> {
        let mut counts = LineageCounts::default();
        for entry in self.lineage(run_id)? {
            counts.add(&entry);
        }
        Ok(counts)
    }
}

/// Whether the log is non-empty and its last byte is not a newline.
fn ends_torn(file: &mut fs::File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

fn validate_run_id(run_id: &str) -> Result<()> {
    let valid = !run_id.is_empty()
        && run_id != "."
        && run_id != ".."
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'));
    if valid {
        Ok(())
    } else {
        Err(SpecimenError::invalid_argument(format!(
            "run id must be a non-empty token of [A-Za-z0-9._:-], got {:?}",
            run_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use serde_json::json;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, RunLedger) {
        let dir = tempdir().unwrap();
        let ledger = RunLedger::open(dir.path().join("ledger")).unwrap();
        (dir, ledger)
    }

    #[test]
    fn test_start_and_get_run() {
        let (_dir, ledger) = setup();
        let run = ledger
            .start_run("run-1", json!({"engine": "vision"}), Some("curator".to_string()))
            .unwrap();
        assert!(!run.is_completed());

        let stored = ledger.get_run("run-1").unwrap().unwrap();
        assert_eq!(stored, run);
        assert_eq!(stored.config_snapshot["engine"], "vision");
    }

    #[test]
    fn test_duplicate_run_id() {
        let (_dir, ledger) = setup();
        ledger.start_run("run-1", json!({}), None).unwrap();
        let err = ledger.start_run("run-1", json!({}), None).unwrap_err();
        assert!(matches!(err, SpecimenError::DuplicateRunId(id) if id == "run-1"));
    }

    #[test]
    fn test_invalid_run_ids() {
        let (_dir, ledger) = setup();
        for bad in ["", "a/b", "..", "run 1", "ünïcode"] {
            let err = ledger.start_run(bad, json!({}), None).unwrap_err();
            assert!(matches!(err, SpecimenError::InvalidArgument { .. }), "accepted {:?}", bad);
        }
        assert!(ledger.start_run("2026-10-17T09:30:00.1_a", json!({}), None).is_ok());
    }

    #[test]
    fn test_complete_run_idempotent() {
        let (_dir, ledger) = setup();
        ledger.start_run("run-1", json!({}), None).unwrap();

        let first = ledger.complete_run("run-1").unwrap();
        assert!(first.is_completed());
        let second = ledger.complete_run("run-1").unwrap();
        assert_eq!(first.completed_at, second.completed_at);
    }

    #[test]
    fn test_completed_run_keeps_stats() {
        let (_dir, ledger) = setup();
        ledger.start_run("run-1", json!({}), None).unwrap();
        assert_eq!(ledger.get_run("run-1").unwrap().unwrap().stats, None);

        let stats = RunStats {
            total_lookups: 4,
            cache_hits: 3,
            cache_misses: 1,
            fresh_extractions: 1,
            failures: 0,
            eviction_count: 2,
        };
        ledger.complete_run_with_stats("run-1", Some(stats)).unwrap();

        let stored = ledger.get_run("run-1").unwrap().unwrap();
        assert_eq!(stored.stats, Some(stats));
        // Completing again does not overwrite the recorded counters.
        ledger.complete_run_with_stats("run-1", Some(RunStats::default())).unwrap();
        assert_eq!(ledger.get_run("run-1").unwrap().unwrap().stats, Some(stats));
    }

    #[test]
    fn test_unknown_run() {
        let (_dir, ledger) = setup();
        assert!(matches!(ledger.complete_run("nope").unwrap_err(), SpecimenError::UnknownRun(_)));
        assert!(matches!(
            ledger
                .record_lineage("nope", &hash_bytes(b"x"), LineageStatus::Completed, false)
                .unwrap_err(),
            SpecimenError::UnknownRun(_)
        ));
        assert!(matches!(ledger.lineage("nope").unwrap_err(), SpecimenError::UnknownRun(_)));
    }

    #[test]
    fn test_lineage_is_append_only_with_duplicates() {
        let (_dir, ledger) = setup();
        let h1 = hash_bytes(b"one");
        ledger.start_run("run-1", json!({}), None).unwrap();

        ledger.record_lineage("run-1", &h1, LineageStatus::Completed, false).unwrap();
        ledger.record_lineage("run-1", &h1, LineageStatus::Completed, false).unwrap();

        let entries = ledger.lineage("run-1").unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.specimen_hash.as_ref() == Some(&h1)));
    }

    #[test]
    fn test_lineage_after_completion_is_allowed() {
        let (_dir, ledger) = setup();
        ledger.start_run("run-1", json!({}), None).unwrap();
        ledger.complete_run("run-1").unwrap();
        ledger
            .record_lineage("run-1", &hash_bytes(b"late"), LineageStatus::Cached, true)
            .unwrap();
        assert_eq!(ledger.lineage("run-1").unwrap().len(), 1);
    }

    #[test]
    fn test_lineage_for_specimen_across_runs() {
        let (_dir, ledger) = setup();
        let h1 = hash_bytes(b"one");
        let h2 = hash_bytes(b"two");

        ledger.start_run("run-1", json!({}), None).unwrap();
        ledger.record_lineage("run-1", &h1, LineageStatus::Completed, false).unwrap();
        ledger.record_lineage("run-1", &h2, LineageStatus::Failed, false).unwrap();

        ledger.start_run("run-2", json!({}), None).unwrap();
        ledger.record_lineage("run-2", &h1, LineageStatus::Cached, true).unwrap();

        let history = ledger.lineage_for_specimen(&h1).unwrap();
        let runs: Vec<&str> = history.iter().map(|e| e.run_id.as_str()).collect();
        assert_eq!(runs, vec!["run-1", "run-2"]);
        assert_eq!(history[1].status, LineageStatus::Cached);
    }

    #[test]
    fn test_run_stats() {
        let (_dir, ledger) = setup();
        ledger.start_run("run-1", json!({}), None).unwrap();
        ledger.record_lineage("run-1", &hash_bytes(b"a"), LineageStatus::Completed, false).unwrap();
        ledger.record_lineage("run-1", &hash_bytes(b"b"), LineageStatus::Cached, true).unwrap();
        ledger.record_lineage("run-1", &hash_bytes(b"c"), LineageStatus::Skipped, true).unwrap();
        ledger
            .append(LineageEntry::new("run-1", LineageStatus::Failed, false).with_detail("missing"))
            .unwrap();

        let counts = ledger.run_stats("run-1").unwrap();
        assert_eq!(
            counts,
            LineageCounts {
                total: 4,
                completed: 1,
                failed: 1,
                skipped: 1,
                cached: 1,
                cache_hits: 2,
            }
        );
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let (dir, ledger) = setup();
        ledger.start_run("run-1", json!({}), None).unwrap();
        ledger.record_lineage("run-1", &hash_bytes(b"a"), LineageStatus::Completed, false).unwrap();

        let path = dir.path().join("ledger").join(LINEAGE_DIR).join("run-1.jsonl");
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(b"{\"run_id\":\"run-1\",\"sta").unwrap();

        assert_eq!(ledger.lineage("run-1").unwrap().len(), 1);
    }

    #[test]
    fn test_append_after_torn_line_keeps_entry() {
        let (dir, ledger) = setup();
        ledger.start_run("run-1", json!({}), None).unwrap();
        ledger.record_lineage("run-1", &hash_bytes(b"a"), LineageStatus::Completed, false).unwrap();

        let path = dir.path().join("ledger").join(LINEAGE_DIR).join("run-1.jsonl");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"run_id\":\"run-1\",\"sta").unwrap();
        drop(file);

        ledger.record_lineage("run-1", &hash_bytes(b"b"), LineageStatus::Cached, true).unwrap();
        ledger.record_lineage("run-1", &hash_bytes(b"c"), LineageStatus::Failed, false).unwrap();

        let entries = ledger.lineage("run-1").unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].specimen_hash, Some(hash_bytes(b"b")));
        assert_eq!(entries[2].status, LineageStatus::Failed);
        assert!(fs::read(&path).unwrap().ends_with(b"\n"));
    }

    #[test]
    fn test_list_runs_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let ledger = RunLedger::open(dir.path()).unwrap();
            ledger.start_run("b-run", json!({}), None).unwrap();
            ledger.start_run("a-run", json!({}), None).unwrap();
        }

        let ledger = RunLedger::open(dir.path()).unwrap();
        let runs = ledger.list_runs().unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs[0].started_at <= runs[1].started_at);
        assert!(matches!(
            ledger.start_run("a-run", json!({}), None).unwrap_err(),
            SpecimenError::DuplicateRunId(_)
        ));
    }

    #[test]
    fn test_concurrent_appends() {
        let (_dir, ledger) = setup();
        let ledger = Arc::new(ledger);
        ledger.start_run("run-1", json!({}), None).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for j in 0..25 {
                        let hash = hash_bytes(format!("{}-{}", i, j).as_bytes());
                        ledger.record_lineage("run-1", &hash, LineageStatus::Completed, false).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ledger.lineage("run-1").unwrap().len(), 200);
    }
}
