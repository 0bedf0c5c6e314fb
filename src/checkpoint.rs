//! Crash-safe benchmark progress.
//!
//! The checkpoint is an explicit struct passed through the harness, not a
//! global. It only grows: completed ids are added, per-horizon sums
//! accumulate, and a completed question is never reprocessed. Persistence
//! is write-temp-then-rename so an interrupted flush can never leave a
//! corrupt file behind.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::logging::{json_log, obj, v_num, v_str, Domain};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HorizonTally {
    pub sum_sq_err: f64,
    pub scored: u64,
    pub excluded: u64,
    pub failed: u64,
}

impl HorizonTally {
    pub fn mean_brier(&self) -> Option<f64> {
        if self.scored == 0 {
            None
        } else {
            Some(self.sum_sq_err / self.scored as f64)
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub completed: BTreeSet<String>,
    pub horizons: BTreeMap<u32, HorizonTally>,
    pub total_penalty: f64,
    pub questions_failed: u64,
}

impl Checkpoint {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading checkpoint {}", path.display()))?;
        let cp: Checkpoint = serde_json::from_str(&raw)
            .with_context(|| format!("parsing checkpoint {}", path.display()))?;
        json_log(
            Domain::Checkpoint,
            "loaded",
            obj(&[
                ("path", v_str(&path.display().to_string())),
                ("completed", v_num(cp.completed.len() as f64)),
            ]),
        );
        Ok(cp)
    }

    pub fn is_complete(&self, question_id: &str) -> bool {
        self.completed.contains(question_id)
    }

    pub fn tally_mut(&mut self, horizon_days: u32) -> &mut HorizonTally {
        self.horizons.entry(horizon_days).or_default()
    }

    pub fn overall_mean_brier(&self) -> Option<f64> {
        let (sum, n) = self
            .horizons
            .values()
            .fold((0.0, 0u64), |(s, n), t| (s + t.sum_sq_err, n + t.scored));
        if n == 0 {
            None
        } else {
            Some(sum / n as f64)
        }
    }

    pub fn total_scored(&self) -> u64 {
        self.horizons.values().map(|t| t.scored).sum()
    }

    pub fn total_excluded(&self) -> u64 {
        self.horizons.values().map(|t| t.excluded).sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.horizons.values().map(|t| t.failed).sum()
    }
}

/// Serializes flushes: one writer at a time, temp file + atomic rename,
/// fsync before the rename so the old state survives a crash mid-flush.
#[derive(Debug)]
pub struct CheckpointFile {
    path: PathBuf,
}

impl CheckpointFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Checkpoint> {
        Checkpoint::load(&self.path)
    }

    pub fn persist(&self, cp: &Checkpoint) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("creating checkpoint dir {}", dir.display()))?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut f = File::create(&tmp)
                .with_context(|| format!("creating {}", tmp.display()))?;
            let body = serde_json::to_string_pretty(cp)?;
            f.write_all(body.as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        json_log(
            Domain::Checkpoint,
            "persisted",
            obj(&[
                ("path", v_str(&self.path.display().to_string())),
                ("completed", v_num(cp.completed.len() as f64)),
                ("total_penalty", v_num(cp.total_penalty)),
            ]),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let file = CheckpointFile::new(dir.path().join("cp.json"));
        let cp = file.load().unwrap();
        assert!(cp.completed.is_empty());
        assert!(cp.overall_mean_brier().is_none());
    }

    #[test]
    fn test_persist_load_roundtrip() {
        let dir = tempdir().unwrap();
        let file = CheckpointFile::new(dir.path().join("cp.json"));
        let mut cp = Checkpoint::default();
        cp.completed.insert("q-1".to_string());
        let t = cp.tally_mut(30);
        t.sum_sq_err += 0.0001;
        t.scored += 1;
        cp.total_penalty = 0.25;
        file.persist(&cp).unwrap();

        let loaded = file.load().unwrap();
        assert!(loaded.is_complete("q-1"));
        assert_eq!(loaded.horizons[&30].scored, 1);
        assert!((loaded.horizons[&30].sum_sq_err - 0.0001).abs() < 1e-12);
        assert_eq!(loaded.total_penalty, 0.25);
    }

    #[test]
    fn test_persist_replaces_atomically() {
        let dir = tempdir().unwrap();
        let file = CheckpointFile::new(dir.path().join("cp.json"));
        let mut cp = Checkpoint::default();
        cp.completed.insert("a".to_string());
        file.persist(&cp).unwrap();
        cp.completed.insert("b".to_string());
        file.persist(&cp).unwrap();
        let loaded = file.load().unwrap();
        assert_eq!(loaded.completed.len(), 2);
        // no temp file is left behind after a clean flush
        assert!(!dir.path().join("cp.json.tmp").exists());
    }

    #[test]
    fn test_mean_brier_excludes_unscored() {
        let mut cp = Checkpoint::default();
        let t = cp.tally_mut(7);
        t.excluded = 3;
        assert!(cp.horizons[&7].mean_brier().is_none());
        assert!(cp.overall_mean_brier().is_none());
        assert_eq!(cp.total_excluded(), 3);
    }
}
