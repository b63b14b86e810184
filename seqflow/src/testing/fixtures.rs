//! Filesystem and configuration fixtures.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{AssayKind, PipelineConfig};

/// Writes `bytes` filler bytes to `path`, creating parent directories.
///
/// # Panics
///
/// Panics if the file cannot be written.
pub fn write_filler(path: &Path, bytes: usize) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create fixture directory");
    }
    fs::write(path, vec![b'N'; bytes]).expect("write fixture file");
}

/// Writes `<sample>_S<index>_L001_R{1,2}_001.fastq.gz` under `dir`.
///
/// # Panics
///
/// Panics if a file cannot be written.
pub fn write_read_pair(dir: &Path, sample: &str, index: u32, forward_bytes: usize, reverse_bytes: usize) -> (PathBuf, PathBuf) {
    let forward = dir.join(format!("{sample}_S{index}_L001_R1_001.fastq.gz"));
    let reverse = dir.join(format!("{sample}_S{index}_L001_R2_001.fastq.gz"));
    write_filler(&forward, forward_bytes);
    write_filler(&reverse, reverse_bytes);
    (forward, reverse)
}

/// A valid configuration rooted at `output_dir`.
///
/// Three projects: `proj1` host-filtered, `proj2` adapter-trimmed, `proj3`
/// neither. Two samples each, `s1`..`s6` in order.
///
/// # Panics
///
/// Panics if the built-in document does not deserialize.
#[must_use]
pub fn test_config(output_dir: &Path, assay: AssayKind) -> PipelineConfig {
    let resources = serde_json::json!({"queue": "test", "memory_mb": 1024, "wall_time_minutes": 60});
    serde_json::from_value(serde_json::json!({
        "run_dir": output_dir.join("instrument_run"),
        "output_dir": output_dir,
        "sample_sheet": output_dir.join("sheet.csv"),
        "assay": assay,
        "protocol": "illumina",
        "projects": [
            {"name": "proj1", "host_filtering": true, "adapter_trimming": true},
            {"name": "proj2", "adapter_trimming": true},
            {"name": "proj3"}
        ],
        "samples": [
            {"sample_id": "s1", "project": "proj1"},
            {"sample_id": "s2", "project": "proj1"},
            {"sample_id": "s3", "project": "proj2"},
            {"sample_id": "s4", "project": "proj2"},
            {"sample_id": "s5", "project": "proj3"},
            {"sample_id": "s6", "project": "proj3"}
        ],
        "convert": {"bcl_convert": {}, "resources": resources},
        "filter": {
            "bucket_count": 2,
            "min_bytes": 100,
            "host_index": "/refs/host.mmi",
            "resources": resources
        },
        "report": {"resources": resources},
        "scheduler": {"poll_interval_secs": 1}
    }))
    .expect("fixture configuration deserializes")
}
