//! Persisted record of which entity first failed at which stage.
//!
//! The ledger is seeded with every expected entity at run start. Each stage
//! audit folds its failed ids in with [`FailureLedger::write`], which reloads
//! the file, applies the update and dumps it again, so the on-disk state is
//! authoritative across restarts. An entity keeps the first stage it failed
//! at.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::core::StageName;
use crate::errors::Result;

/// Project label reported for ids outside the expected-entity list.
pub const UNKNOWN_PROJECT: &str = "unknown";

/// On-disk shape of the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct LedgerState {
    sample_state: BTreeMap<String, Option<String>>,
    project_map: BTreeMap<String, String>,
}

/// One row of the failure report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRow {
    /// The failed entity.
    pub sample_id: String,
    /// Its project, or `unknown`.
    pub project: String,
    /// The first stage it failed at.
    pub failed_at: String,
}

/// Mergeable, file-backed failure ledger. Single writer per run.
#[derive(Debug, Clone)]
pub struct FailureLedger {
    path: PathBuf,
    state: LedgerState,
}

impl FailureLedger {
    /// Creates a ledger for `entities` (id, project) with no failures and
    /// persists it.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be written.
    pub fn create<I, S, P>(path: impl Into<PathBuf>, entities: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, P)>,
        S: Into<String>,
        P: Into<String>,
    {
        let mut state = LedgerState::default();
        for (id, project) in entities {
            let id = id.into();
            state.sample_state.insert(id.clone(), None);
            state.project_map.insert(id, project.into());
        }
        let ledger = Self {
            path: path.into(),
            state,
        };
        ledger.dump()?;
        Ok(ledger)
    }

    /// Opens an existing ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let mut ledger = Self {
            path: path.into(),
            state: LedgerState::default(),
        };
        ledger.load()?;
        Ok(ledger)
    }

    /// Opens the ledger at `path`, creating it from `entities` when absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or written.
    pub fn open_or_create<I, S, P>(path: impl Into<PathBuf>, entities: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, P)>,
        S: Into<String>,
        P: Into<String>,
    {
        let path = path.into();
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path, entities)
        }
    }

    /// The ledger file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the in-memory state with the file's contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(&mut self) -> Result<()> {
        let text = fs::read_to_string(&self.path)?;
        self.state = serde_json::from_str(&text)?;
        Ok(())
    }

    /// Writes the in-memory state via a temporary sibling and a rename.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn dump(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut tmp_name = self.path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp = self.path.with_file_name(tmp_name);

        let mut writer = BufWriter::new(fs::File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut writer, &self.state)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Marks each id as failed at `stage` unless it already failed earlier.
    ///
    /// Returns the number of ids newly marked.
    pub fn update<S: AsRef<str>>(&mut self, failed_ids: &[S], stage: StageName) -> usize {
        let mut newly_failed = 0;
        for id in failed_ids {
            let id = id.as_ref();
            let slot = self.state.sample_state.entry(id.to_string()).or_insert_with(|| {
                warn!(sample_id = %id, stage = %stage, "Failed id is not an expected entity");
                None
            });
            if slot.is_none() {
                *slot = Some(stage.to_string());
                newly_failed += 1;
            }
        }
        newly_failed
    }

    /// Loads, folds in `failed_ids` at `stage` and dumps.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read or written.
    pub fn write<S: AsRef<str>>(&mut self, failed_ids: &[S], stage: StageName) -> Result<usize> {
        self.load()?;
        let newly_failed = self.update(failed_ids, stage);
        self.dump()?;
        debug!(
            stage = %stage,
            reported = failed_ids.len(),
            newly_failed,
            "Updated failure ledger {}",
            self.path.display()
        );
        Ok(newly_failed)
    }

    /// The first stage `id` failed at, if any.
    #[must_use]
    pub fn failed_at(&self, id: &str) -> Option<&str> {
        self.state.sample_state.get(id).and_then(|s| s.as_deref())
    }

    /// Number of tracked entities, expected or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.sample_state.len()
    }

    /// Returns true if the ledger tracks no entities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.sample_state.is_empty()
    }

    /// Rows for every failed entity, sorted by id.
    #[must_use]
    pub fn report(&self) -> Vec<LedgerRow> {
        self.state
            .sample_state
            .iter()
            .filter_map(|(id, stage)| {
                stage.as_ref().map(|stage| LedgerRow {
                    sample_id: id.clone(),
                    project: self
                        .state
                        .project_map
                        .get(id)
                        .cloned()
                        .unwrap_or_else(|| UNKNOWN_PROJECT.to_string()),
                    failed_at: stage.clone(),
                })
            })
            .collect()
    }
}

/// Renders report rows as TSV with a header line.
///
/// # Errors
///
/// Returns an error if the writer fails.
pub fn write_report_tsv<W: Write>(rows: &[LedgerRow], mut writer: W) -> Result<()> {
    writeln!(writer, "sample_id\tproject\tfailed_at")?;
    for row in rows {
        writeln!(writer, "{}\t{}\t{}", row.sample_id, row.project, row.failed_at)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entities() -> Vec<(&'static str, &'static str)> {
        vec![("s1", "p1"), ("s2", "p1"), ("s3", "p2")]
    }

    #[test]
    fn test_first_failure_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = FailureLedger::create(dir.path().join("failed.json"), entities()).unwrap();

        assert_eq!(ledger.write(&["s1"], StageName::Convert).unwrap(), 1);
        assert_eq!(ledger.write(&["s1", "s2"], StageName::Filter).unwrap(), 1);

        assert_eq!(ledger.failed_at("s1"), Some("ConvertJob"));
        assert_eq!(ledger.failed_at("s2"), Some("NuQCJob"));
        assert_eq!(ledger.failed_at("s3"), None);
    }

    #[test]
    fn test_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.json");
        {
            let mut ledger = FailureLedger::create(&path, entities()).unwrap();
            ledger.write(&["s3"], StageName::Filter).unwrap();
        }

        let mut reopened = FailureLedger::open_or_create(&path, Vec::<(String, String)>::new()).unwrap();
        assert_eq!(reopened.len(), 3);
        reopened.write(&["s3"], StageName::Report).unwrap();
        assert_eq!(reopened.failed_at("s3"), Some("NuQCJob"));
    }

    #[test]
    fn test_write_reloads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.json");
        let mut first = FailureLedger::create(&path, entities()).unwrap();
        let mut second = FailureLedger::open(&path).unwrap();

        second.write(&["s2"], StageName::Convert).unwrap();
        first.write(&["s1"], StageName::Filter).unwrap();

        let merged = FailureLedger::open(&path).unwrap();
        assert_eq!(merged.failed_at("s1"), Some("NuQCJob"));
        assert_eq!(merged.failed_at("s2"), Some("ConvertJob"));
    }

    #[test]
    fn test_persisted_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.json");
        let mut ledger = FailureLedger::create(&path, [("s1", "p1")]).unwrap();
        ledger.write(&["s1"], StageName::GenPrep).unwrap();

        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "sample_state": {"s1": "GenPrepFileJob"},
                "project_map": {"s1": "p1"}
            })
        );
        assert!(!dir.path().join("failed.json.tmp").exists());
    }

    #[test]
    fn test_report_rows_and_unknown_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = FailureLedger::create(dir.path().join("failed.json"), entities()).unwrap();
        ledger.write(&["s3", "stray", "s1"], StageName::Filter).unwrap();

        let rows = ledger.report();
        let ids: Vec<&str> = rows.iter().map(|r| r.sample_id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s3", "stray"]);
        assert_eq!(rows[2].project, UNKNOWN_PROJECT);

        let mut out = Vec::new();
        write_report_tsv(&rows, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("sample_id\tproject\tfailed_at\n"));
        assert!(text.contains("s3\tp2\tNuQCJob\n"));
    }

    #[test]
    fn test_open_missing_ledger_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FailureLedger::open(dir.path().join("absent.json")).is_err());
    }
}
