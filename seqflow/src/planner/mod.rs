//! Size-balanced bucket planning for array jobs.
//!
//! Paired read files are discovered under an input directory, labelled with
//! their project (the immediate parent directory), and packed into buckets
//! with longest-processing-time-first greedy assignment. Each bucket becomes
//! one array task and is described by a tab-separated manifest file.

mod discover;

pub use discover::{discover_pairs, IGNORED_DIRS};

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::errors::{ConfigError, Result, SeqflowError};

/// A forward/reverse read file pair belonging to one project.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReadPair {
    /// The forward (R1) file.
    pub forward: PathBuf,
    /// The reverse (R2) file.
    pub reverse: PathBuf,
    /// The project label.
    pub project: String,
    /// Combined size of both files in bytes.
    pub size_bytes: u64,
}

impl ReadPair {
    /// Renders the pair as one manifest line (without newline).
    #[must_use]
    pub fn manifest_line(&self) -> String {
        format!(
            "{}\t{}\t{}",
            self.forward.display(),
            self.reverse.display(),
            self.project
        )
    }
}

/// A group of pairs assigned to one array task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bucket {
    /// 1-based bucket number, matching the array task index.
    pub number: usize,
    /// Pairs in manifest order.
    pub pairs: Vec<ReadPair>,
    /// Cumulative size of all pairs in bytes.
    pub size_bytes: u64,
}

/// The outcome of a planning pass.
#[derive(Debug, Clone, Default)]
pub struct BucketPlan {
    /// The realized buckets, numbered 1..=N.
    pub buckets: Vec<Bucket>,
    /// Manifest paths, one per bucket, in bucket order.
    pub manifests: Vec<PathBuf>,
}

impl BucketPlan {
    /// Number of buckets actually produced.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Byte total of the largest bucket; sizes per-task resources.
    #[must_use]
    pub fn max_bucket_bytes(&self) -> u64 {
        self.buckets.iter().map(|b| b.size_bytes).max().unwrap_or(0)
    }

    /// Returns true when no input pairs were found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Packs pairs into at most `target` buckets, largest pair first, each pair
/// going to the bucket with the smallest running total.
///
/// The realized bucket count is `min(target, pairs.len())`.
#[must_use]
pub fn pack(mut pairs: Vec<ReadPair>, target: usize) -> Vec<Bucket> {
    let count = target.min(pairs.len());
    if count == 0 {
        return Vec::new();
    }

    pairs.sort_by(|a, b| {
        b.size_bytes
            .cmp(&a.size_bytes)
            .then_with(|| a.forward.cmp(&b.forward))
    });

    let mut buckets: Vec<Bucket> = (1..=count)
        .map(|number| Bucket {
            number,
            ..Bucket::default()
        })
        .collect();

    // (total, slot) so equal totals fall back to the lowest bucket number
    let mut heap: BinaryHeap<Reverse<(u64, usize)>> = (0..count).map(|i| Reverse((0, i))).collect();

    for pair in pairs {
        let Some(Reverse((total, slot))) = heap.pop() else {
            break;
        };
        let bucket = &mut buckets[slot];
        bucket.size_bytes = total + pair.size_bytes;
        bucket.pairs.push(pair);
        heap.push(Reverse((bucket.size_bytes, slot)));
    }

    for bucket in &mut buckets {
        bucket.pairs.sort_by(|a, b| a.forward.cmp(&b.forward));
    }
    buckets
}

/// Path of the manifest for bucket `number`.
#[must_use]
pub fn manifest_path(prefix: &Path, number: usize) -> PathBuf {
    PathBuf::from(format!("{}-{number}", prefix.display()))
}

/// Writes one manifest per bucket at `<prefix>-<n>`.
///
/// # Errors
///
/// Returns an error if a manifest cannot be written.
pub fn write_manifests(buckets: &[Bucket], prefix: &Path) -> Result<Vec<PathBuf>> {
    if let Some(parent) = prefix.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut paths = Vec::with_capacity(buckets.len());
    for bucket in buckets {
        let path = manifest_path(prefix, bucket.number);
        let mut writer = BufWriter::new(fs::File::create(&path)?);
        for pair in &bucket.pairs {
            writeln!(writer, "{}", pair.manifest_line())?;
        }
        writer.flush()?;
        debug!(
            bucket = bucket.number,
            pairs = bucket.pairs.len(),
            size_bytes = bucket.size_bytes,
            "Wrote bucket manifest {}",
            path.display()
        );
        paths.push(path);
    }
    Ok(paths)
}

/// Reads a manifest back into `(forward, reverse, project)` triples.
///
/// # Errors
///
/// Returns an error if the file cannot be read or a line does not have
/// exactly three tab-separated fields.
pub fn read_manifest(path: &Path) -> Result<Vec<(PathBuf, PathBuf, String)>> {
    let reader = BufReader::new(fs::File::open(path)?);
    let mut entries = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        let [forward, reverse, project] = fields.as_slice() else {
            return Err(ConfigError::new(format!(
                "malformed manifest line {} in {}: expected 3 fields, found {}",
                line_no + 1,
                path.display(),
                fields.len()
            ))
            .into());
        };
        entries.push((PathBuf::from(forward), PathBuf::from(reverse), (*project).to_string()));
    }
    Ok(entries)
}

/// Discovers pairs under `input_dir`, packs them into at most
/// `target_bucket_count` buckets and writes the manifests.
///
/// Zero pairs yields an empty plan; callers decide whether that is fatal.
///
/// # Errors
///
/// Returns an error if `target_bucket_count` is zero, discovery fails, or a
/// manifest cannot be written.
pub fn plan(input_dir: &Path, target_bucket_count: usize, output_prefix: &Path) -> Result<BucketPlan> {
    if target_bucket_count == 0 {
        return Err(SeqflowError::Config(
            ConfigError::new("target bucket count must be at least 1").with_field("bucket_count"),
        ));
    }

    let pairs = discover_pairs(input_dir)?;
    let pair_count = pairs.len();
    let buckets = pack(pairs, target_bucket_count);
    let manifests = write_manifests(&buckets, output_prefix)?;

    let plan = BucketPlan { buckets, manifests };
    info!(
        pairs = pair_count,
        requested = target_bucket_count,
        bucket_count = plan.bucket_count(),
        max_bucket_bytes = plan.max_bucket_bytes(),
        "Planned buckets for {}",
        input_dir.display()
    );
    Ok(plan)
}
