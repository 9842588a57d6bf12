//! Last-run bookkeeping that decides which services are due.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::Frequency;

/// Schedule state could not be read or written. Never fatal.
#[derive(Error, Debug)]
pub enum ScheduleStateError {
    #[error("schedule state I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("schedule state is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Service key → unix timestamp of its last attempt, persisted as JSON.
#[derive(Debug)]
pub struct ScheduleTracker {
    path: PathBuf,
    last_run: BTreeMap<String, i64>,
}

impl ScheduleTracker {
    /// Load persisted state. Missing or unreadable state means "never run".
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let last_run = match read_state(&path) {
            Ok(state) => {
                tracing::info!("Loaded schedule state for {} services", state.len());
                state
            }
            Err(ScheduleStateError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                BTreeMap::new()
            }
            Err(e) => {
                tracing::warn!(
                    "Ignoring schedule state at {}: {}; every service is due",
                    path.display(),
                    e
                );
                BTreeMap::new()
            }
        };
        Self { path, last_run }
    }

    /// Fastest is always due; otherwise due once the interval has elapsed
    /// since the last attempt, or when there was none.
    pub fn is_due(&self, id: &str, frequency: Frequency, now: i64) -> bool {
        let interval = frequency.interval_seconds();
        if interval == 0 {
            return true;
        }
        match self.last_run.get(id) {
            None => true,
            Some(last) => now - last >= interval,
        }
    }

    pub fn mark_run(&mut self, id: &str, now: i64) {
        self.last_run.insert(id.to_string(), now);
    }

    pub fn last_run(&self, id: &str) -> Option<i64> {
        self.last_run.get(id).copied()
    }

    /// Write the state atomically (temp file, then rename).
    pub fn persist(&self) -> Result<(), ScheduleStateError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(&self.last_run)?;
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn read_state(path: &Path) -> Result<BTreeMap<String, i64>, ScheduleStateError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio_test::assert_ok;

    fn tracker(dir: &TempDir) -> ScheduleTracker {
        ScheduleTracker::load(dir.path().join("state").join("schedule.json"))
    }

    #[test]
    fn test_fastest_always_due() {
        let dir = TempDir::new().unwrap();
        let mut t = tracker(&dir);
        t.mark_run("svc", 1_000);
        assert!(t.is_due("svc", Frequency::Fastest, 1_000));
    }

    #[test]
    fn test_due_iff_interval_elapsed() {
        let dir = TempDir::new().unwrap();
        let mut t = tracker(&dir);
        for freq in Frequency::ALL {
            let id = freq.label();
            assert!(t.is_due(id, freq, 5_000), "{id} never run must be due");
            t.mark_run(id, 5_000);

            let interval = freq.interval_seconds();
            for elapsed in [0, 1, (interval - 1).max(0), interval, interval + 1, 100_000] {
                assert_eq!(
                    t.is_due(id, freq, 5_000 + elapsed),
                    elapsed >= interval,
                    "{id} after {elapsed}s"
                );
            }
        }
    }

    #[test]
    fn test_restart_yields_same_decisions() {
        let dir = TempDir::new().unwrap();
        let mut before = tracker(&dir);
        before.mark_run("net:external:Google:google.com", 10_000);
        before.mark_run("net:internal:Gateway:10.0.0.1", 12_000);
        assert_ok!(before.persist());

        let after = tracker(&dir);
        for now in [10_000, 12_500, 13_600, 15_700, 60_000] {
            for freq in Frequency::ALL {
                for id in ["net:external:Google:google.com", "net:internal:Gateway:10.0.0.1", "new"] {
                    assert_eq!(before.is_due(id, freq, now), after.is_due(id, freq, now));
                }
            }
        }
        assert_eq!(after.last_run("net:internal:Gateway:10.0.0.1"), Some(12_000));
    }

    #[test]
    fn test_corrupt_state_means_everything_due() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("schedule.json");
        std::fs::write(&path, "{not json").unwrap();

        let t = ScheduleTracker::load(&path);
        assert!(t.is_due("anything", Frequency::TwelveHours, 0));
        assert_eq!(t.last_run("anything"), None);
    }

    #[test]
    fn test_persist_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("schedule.json");
        let mut t = ScheduleTracker::load(&path);
        t.mark_run("a", 1);
        assert_ok!(t.persist());
        assert!(path.exists());
        assert!(!dir.path().join("schedule.json.tmp").exists());
    }
}
