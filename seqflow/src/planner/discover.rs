//! Discovery of paired read files on disk.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::ReadPair;
use crate::errors::{ConfigError, Result};
use crate::utils::naming::{is_read_file, parse_read_file, Orientation};

/// Directory names never descended into during discovery.
pub const IGNORED_DIRS: &[&str] = &["zero_files", "work", "Reports", "Logs", "Stats", "logs"];

const UNDETERMINED_PREFIX: &str = "Undetermined";

#[derive(Default)]
struct Mates {
    forward: Option<PathBuf>,
    reverse: Option<PathBuf>,
}

/// Lists every forward/reverse pair under `input_dir`, labelled with the
/// name of the directory that directly contains it.
///
/// Index reads and `Undetermined*` files are skipped. Pairs come back sorted
/// by forward path.
///
/// # Errors
///
/// Returns an error if a directory cannot be read, a read file carries no
/// orientation token, or a mate is missing.
pub fn discover_pairs(input_dir: &Path) -> Result<Vec<ReadPair>> {
    // (parent dir, pair key) -> mates
    let mut groups: BTreeMap<(PathBuf, String), Mates> = BTreeMap::new();
    let mut pending = vec![input_dir.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                if !IGNORED_DIRS.contains(&name.as_str()) {
                    pending.push(path);
                }
                continue;
            }
            if !is_read_file(&name) || name.starts_with(UNDETERMINED_PREFIX) {
                continue;
            }

            let parsed = parse_read_file(&name)?;
            let mates = groups.entry((dir.clone(), parsed.pair_key())).or_default();
            match parsed.orientation {
                Orientation::R1 => mates.forward = Some(path),
                Orientation::R2 => mates.reverse = Some(path),
                Orientation::I1 | Orientation::I2 => {
                    debug!("Skipping index read {}", path.display());
                }
            }
        }
    }

    let mut pairs = Vec::with_capacity(groups.len());
    for ((dir, _), mates) in groups {
        let (forward, reverse) = match (mates.forward, mates.reverse) {
            (Some(f), Some(r)) => (f, r),
            (None, None) => continue,
            (Some(lonely), None) | (None, Some(lonely)) => {
                return Err(ConfigError::new(format!(
                    "read file {} has no mate",
                    lonely.display()
                ))
                .with_fix_hint("every R1 file needs an R2 file with the same name apart from the orientation token")
                .into());
            }
        };

        let project = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let size_bytes = fs::metadata(&forward)?.len() + fs::metadata(&reverse)?.len();
        pairs.push(ReadPair {
            forward,
            reverse,
            project,
            size_bytes,
        });
    }

    pairs.sort_by(|a, b| a.forward.cmp(&b.forward));
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SeqflowError;

    fn touch(path: &Path, bytes: usize) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![b'A'; bytes]).unwrap();
    }

    #[test]
    fn test_discover_pairs_by_project() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("projA/s1_S1_L001_R1_001.fastq.gz"), 10);
        touch(&root.join("projA/s1_S1_L001_R2_001.fastq.gz"), 20);
        touch(&root.join("projA/s1_S1_L001_I1_001.fastq.gz"), 5);
        touch(&root.join("projB/s2_S2_L001_R1_001.fastq.gz"), 1);
        touch(&root.join("projB/s2_S2_L001_R2_001.fastq.gz"), 1);
        touch(&root.join("projB/notes.txt"), 1);
        touch(&root.join("Undetermined_S0_L001_R1_001.fastq.gz"), 100);
        touch(&root.join("Undetermined_S0_L001_R2_001.fastq.gz"), 100);
        touch(&root.join("Reports/x_R1.fastq"), 1);

        let pairs = discover_pairs(root).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].project, "projA");
        assert_eq!(pairs[0].size_bytes, 30);
        assert_eq!(pairs[1].project, "projB");
        assert!(pairs[1].reverse.ends_with("s2_S2_L001_R2_001.fastq.gz"));
    }

    #[test]
    fn test_sample_name_with_orientation_substring() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("p/Sample_R1_extra_S1_L001_R1_001.fastq.gz"), 3);
        touch(&root.join("p/Sample_R1_extra_S1_L001_R2_001.fastq.gz"), 3);

        let pairs = discover_pairs(root).unwrap();
        assert_eq!(pairs.len(), 1);
        assert!(pairs[0].forward.ends_with("Sample_R1_extra_S1_L001_R1_001.fastq.gz"));
        assert!(pairs[0].reverse.ends_with("Sample_R1_extra_S1_L001_R2_001.fastq.gz"));
    }

    #[test]
    fn test_missing_mate_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("p/a_S1_L001_R1_001.fastq.gz"), 3);
        let err = discover_pairs(dir.path()).unwrap_err();
        assert!(matches!(err, SeqflowError::Config(_)));
    }

    #[test]
    fn test_read_without_token_is_naming_error() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("p/mystery.fastq.gz"), 3);
        let err = discover_pairs(dir.path()).unwrap_err();
        assert!(matches!(err, SeqflowError::Naming(_)));
    }
}
