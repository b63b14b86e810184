//! Relocation of a stage's raw outputs into the per-project layout the next
//! stage expects.
//!
//! Files produced directly under `<stage_dir>/<project>/` are moved into a
//! category directory chosen by the project's processing plan. Pairs with an
//! undersized mate are then quarantined into `<project>/zero_files/`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::utils::naming::{is_read_file, parse_read_file, Orientation};

/// Directory receiving quarantined pairs.
pub const ZERO_FILES_DIR: &str = "zero_files";

/// Where a project's processed reads are filed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Host reads removed.
    FilteredSequences,
    /// Adapters trimmed, host reads kept.
    TrimmedSequences,
    /// Neither; amplicon data passes through.
    Amplicon,
}

impl Category {
    /// The category's directory name.
    #[must_use]
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::FilteredSequences => "filtered_sequences",
            Self::TrimmedSequences => "trimmed_sequences",
            Self::Amplicon => "amplicon",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// How one project is processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectPlan {
    /// The project name, also its directory name.
    pub name: String,
    /// Whether host reads are filtered out.
    #[serde(default)]
    pub host_filtering: bool,
    /// Whether adapters are trimmed.
    #[serde(default)]
    pub adapter_trimming: bool,
}

impl ProjectPlan {
    /// Creates a plan.
    #[must_use]
    pub fn new(name: impl Into<String>, host_filtering: bool, adapter_trimming: bool) -> Self {
        Self {
            name: name.into(),
            host_filtering,
            adapter_trimming,
        }
    }

    /// The category this project's reads are filed under.
    #[must_use]
    pub fn category(&self) -> Category {
        if self.host_filtering {
            Category::FilteredSequences
        } else if self.adapter_trimming {
            Category::TrimmedSequences
        } else {
            Category::Amplicon
        }
    }
}

/// What happened to one project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectSummary {
    /// Read files moved into the category directory.
    pub files_moved: usize,
    /// Pairs left in the category directory.
    pub pairs_kept: usize,
    /// Pairs moved to `zero_files`.
    pub pairs_quarantined: usize,
    /// Sample ids of quarantined pairs, sorted.
    pub quarantined_samples: Vec<String>,
}

/// Outcome of a reorganization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReorganizeSummary {
    /// Per-project results for projects reorganized in this pass.
    pub projects: BTreeMap<String, ProjectSummary>,
    /// Projects left untouched because they were already reorganized.
    pub already_done: Vec<String>,
    /// Projects with no directory under the stage output.
    pub missing: Vec<String>,
}

impl ReorganizeSummary {
    /// Every quarantined sample id across projects.
    #[must_use]
    pub fn quarantined_samples(&self) -> Vec<String> {
        self.projects
            .values()
            .flat_map(|p| p.quarantined_samples.iter().cloned())
            .collect()
    }
}

#[derive(Default)]
struct FragmentFiles {
    sample_id: String,
    forward: Option<PathBuf>,
    reverse: Option<PathBuf>,
    index: Vec<PathBuf>,
}

impl FragmentFiles {
    fn all(&self) -> impl Iterator<Item = &PathBuf> {
        self.forward
            .iter()
            .chain(self.reverse.iter())
            .chain(self.index.iter())
    }
}

fn file_size(path: Option<&PathBuf>) -> Result<u64> {
    match path {
        Some(path) => Ok(fs::metadata(path)?.len()),
        None => Ok(0),
    }
}

fn move_into(path: &Path, dir: &Path) -> Result<PathBuf> {
    let target = dir.join(path.file_name().unwrap_or_default());
    fs::rename(path, &target)?;
    Ok(target)
}

/// Groups the read files in `dir` by fragment.
fn fragments_in(dir: &Path) -> Result<BTreeMap<String, FragmentFiles>> {
    let mut groups: BTreeMap<String, FragmentFiles> = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_read_file(&name) {
            continue;
        }
        let parsed = parse_read_file(&name)?;
        let group = groups.entry(parsed.pair_key()).or_default();
        group.sample_id = parsed.sample_id().to_string();
        let path = entry.path();
        match parsed.orientation {
            Orientation::R1 => group.forward = Some(path),
            Orientation::R2 => group.reverse = Some(path),
            Orientation::I1 | Orientation::I2 => group.index.push(path),
        }
    }
    Ok(groups)
}

fn reorganize_project(project_dir: &Path, category: Category, min_bytes: u64) -> Result<ProjectSummary> {
    // Validate every name before moving anything.
    let groups = fragments_in(project_dir)?;

    let category_dir = project_dir.join(category.dir_name());
    fs::create_dir_all(&category_dir)?;

    let mut summary = ProjectSummary::default();
    let mut moved: Vec<FragmentFiles> = Vec::with_capacity(groups.len());
    for group in groups.into_values() {
        let mut placed = FragmentFiles {
            sample_id: group.sample_id.clone(),
            ..FragmentFiles::default()
        };
        if let Some(forward) = &group.forward {
            placed.forward = Some(move_into(forward, &category_dir)?);
        }
        if let Some(reverse) = &group.reverse {
            placed.reverse = Some(move_into(reverse, &category_dir)?);
        }
        for index in &group.index {
            placed.index.push(move_into(index, &category_dir)?);
        }
        summary.files_moved += placed.all().count();
        moved.push(placed);
    }

    let zero_dir = project_dir.join(ZERO_FILES_DIR);
    for fragment in moved {
        let forward_size = file_size(fragment.forward.as_ref())?;
        let reverse_size = file_size(fragment.reverse.as_ref())?;
        if forward_size > min_bytes && reverse_size > min_bytes {
            summary.pairs_kept += 1;
            continue;
        }

        fs::create_dir_all(&zero_dir)?;
        for path in fragment.all() {
            move_into(path, &zero_dir)?;
        }
        debug!(
            sample_id = %fragment.sample_id,
            forward_size,
            reverse_size,
            "Quarantined undersized pair"
        );
        summary.pairs_quarantined += 1;
        summary.quarantined_samples.push(fragment.sample_id);
    }
    summary.quarantined_samples.sort();
    summary.quarantined_samples.dedup();
    Ok(summary)
}

/// Moves each project's new read files under `stage_dir` into their category
/// directory and quarantines pairs with a mate of at most `min_bytes`.
///
/// A project whose category directory already exists is left untouched, so
/// the pass can be repeated safely.
///
/// # Errors
///
/// Returns an error if a read file name has no orientation token or a file
/// cannot be moved.
pub fn reorganize(stage_dir: &Path, plans: &[ProjectPlan], min_bytes: u64) -> Result<ReorganizeSummary> {
    let mut summary = ReorganizeSummary::default();

    for plan in plans {
        let project_dir = stage_dir.join(&plan.name);
        if !project_dir.is_dir() {
            warn!(project = %plan.name, "No output directory for project under {}", stage_dir.display());
            summary.missing.push(plan.name.clone());
            continue;
        }

        let category = plan.category();
        if project_dir.join(category.dir_name()).exists() {
            debug!(project = %plan.name, category = %category, "Project already reorganized");
            summary.already_done.push(plan.name.clone());
            continue;
        }

        let project = reorganize_project(&project_dir, category, min_bytes)?;
        info!(
            project = %plan.name,
            category = %category,
            files_moved = project.files_moved,
            pairs_kept = project.pairs_kept,
            pairs_quarantined = project.pairs_quarantined,
            "Reorganized project output"
        );
        summary.projects.insert(plan.name.clone(), project);
    }

    Ok(summary)
}
