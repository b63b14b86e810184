//! Run configuration.
//!
//! A run is described by one JSON document deserialized into
//! [`PipelineConfig`]. Each stage has its own section; everything is checked
//! by [`PipelineConfig::validate`] before any directory is touched or any job
//! is submitted.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::StageName;
use crate::errors::{ConfigError, Result};
use crate::jobs::{JobResources, ResourceScaling};
use crate::reorganize::ProjectPlan;

/// What was sequenced; decides which stages run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssayKind {
    /// Shotgun DNA.
    Metagenomic,
    /// Shotgun RNA.
    Metatranscriptomic,
    /// Targeted amplicons; no filtering stage.
    Amplicon,
}

impl AssayKind {
    /// The stages of a run, in order.
    #[must_use]
    pub fn stages(&self) -> Vec<StageName> {
        match self {
            Self::Metagenomic | Self::Metatranscriptomic => StageName::ALL.to_vec(),
            Self::Amplicon => vec![
                StageName::Convert,
                StageName::Report,
                StageName::GenPrep,
                StageName::PostProcess,
            ],
        }
    }

    /// The minimap2 preset used for host filtering.
    #[must_use]
    pub fn minimap2_preset(&self) -> &'static str {
        match self {
            Self::Metatranscriptomic => "splice:sr",
            Self::Metagenomic | Self::Amplicon => "sr",
        }
    }
}

/// The library protocol; decides how raw output is converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    /// Standard Illumina libraries.
    Illumina,
    /// TellSeq linked reads.
    #[serde(rename = "tellseq")]
    TellSeq,
}

/// `bcl-convert` settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BclConvertConfig {
    /// The executable.
    #[serde(default = "default_bcl_convert")]
    pub executable: String,
}

fn default_bcl_convert() -> String {
    "bcl-convert".to_string()
}

/// `bcl2fastq` settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bcl2FastqConfig {
    /// The executable.
    #[serde(default = "default_bcl2fastq")]
    pub executable: String,
}

fn default_bcl2fastq() -> String {
    "bcl2fastq".to_string()
}

/// TellSeq read-conversion settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TellReadConfig {
    /// The conversion script.
    pub executable: String,
    /// Reference passed to the script, if any.
    #[serde(default)]
    pub reference: Option<PathBuf>,
}

/// A conversion tool chosen for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Converter<'a> {
    /// `bcl-convert`.
    BclConvert(&'a BclConvertConfig),
    /// `bcl2fastq`.
    Bcl2Fastq(&'a Bcl2FastqConfig),
    /// The TellSeq script.
    TellRead(&'a TellReadConfig),
}

impl Converter<'_> {
    /// Short tool name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::BclConvert(_) => "bcl-convert",
            Self::Bcl2Fastq(_) => "bcl2fastq",
            Self::TellRead(_) => "tellread",
        }
    }

    /// The shell command converting `run_dir` into per-project FASTQ under
    /// `output`.
    #[must_use]
    pub fn command(&self, run_dir: &Path, sample_sheet: &Path, output: &Path, threads: u32) -> String {
        let run = run_dir.display();
        let sheet = sample_sheet.display();
        let out = output.display();
        match self {
            Self::BclConvert(c) => format!(
                "{} --sample-sheet {sheet} --output-directory {out} --bcl-input-directory {run} \
                 --bcl-num-decompression-threads {threads} --bcl-num-conversion-threads {threads} \
                 --bcl-num-compression-threads {threads} --bcl-sampleproject-subdirectories true \
                 --no-lane-splitting true --force",
                c.executable
            ),
            Self::Bcl2Fastq(c) => format!(
                "{} --sample-sheet {sheet} --minimum-trimmed-read-length 1 --mask-short-adapter-reads 1 \
                 -R {run} -o {out} --loading-threads {threads} --processing-threads {threads} \
                 --writing-threads {threads} --create-fastq-for-index-reads --ignore-missing-positions \
                 --no-lane-splitting",
                c.executable
            ),
            Self::TellRead(c) => {
                let mut cmd = format!("{} -i {run} -o {out} -s {sheet}", c.executable);
                if let Some(reference) = &c.reference {
                    cmd.push_str(&format!(" -r {}", reference.display()));
                }
                cmd
            }
        }
    }
}

/// Conversion stage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertConfig {
    /// Preferred Illumina converter.
    #[serde(default)]
    pub bcl_convert: Option<BclConvertConfig>,
    /// Fallback Illumina converter.
    #[serde(default)]
    pub bcl2fastq: Option<Bcl2FastqConfig>,
    /// TellSeq converter.
    #[serde(default)]
    pub tellread: Option<TellReadConfig>,
    /// Resources for the single conversion task.
    pub resources: JobResources,
}

impl ConvertConfig {
    /// Picks the converter for `protocol`: `bcl-convert` before `bcl2fastq`
    /// for Illumina, the TellSeq script for TellSeq.
    ///
    /// # Errors
    ///
    /// Returns an error when no suitable converter is configured.
    pub fn select_converter(&self, protocol: ProtocolKind) -> Result<Converter<'_>, ConfigError> {
        match protocol {
            ProtocolKind::Illumina => self
                .bcl_convert
                .as_ref()
                .map(Converter::BclConvert)
                .or_else(|| self.bcl2fastq.as_ref().map(Converter::Bcl2Fastq))
                .ok_or_else(|| {
                    ConfigError::new("no Illumina converter configured")
                        .with_field("convert.bcl_convert")
                        .with_fix_hint("configure convert.bcl_convert or convert.bcl2fastq")
                }),
            ProtocolKind::TellSeq => self
                .tellread
                .as_ref()
                .map(Converter::TellRead)
                .ok_or_else(|| ConfigError::missing("convert.tellread")),
        }
    }
}

/// Filtering stage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Requested number of array tasks.
    pub bucket_count: usize,
    /// Mates at or below this size are quarantined.
    #[serde(default = "default_min_bytes")]
    pub min_bytes: u64,
    /// Parallel demultiplexing shards per task.
    #[serde(default = "default_demux_workers")]
    pub demux_workers: usize,
    /// The trimming executable.
    #[serde(default = "default_fastp")]
    pub fastp: String,
    /// The aligner used for host filtering.
    #[serde(default = "default_minimap2")]
    pub minimap2: String,
    /// The SAM/BAM toolkit.
    #[serde(default = "default_samtools")]
    pub samtools: String,
    /// Host reference index for projects with host filtering.
    #[serde(default)]
    pub host_index: Option<PathBuf>,
    /// Forward adapter sequence.
    #[serde(default)]
    pub adapter_a: Option<String>,
    /// Reverse adapter sequence.
    #[serde(default)]
    pub adapter_b: Option<String>,
    /// Per-task resources before scaling.
    pub resources: JobResources,
    /// Growth of resources with the largest bucket.
    #[serde(default)]
    pub scaling: ResourceScaling,
}

fn default_min_bytes() -> u64 {
    3100
}

fn default_demux_workers() -> usize {
    1
}

fn default_fastp() -> String {
    "fastp".to_string()
}

fn default_minimap2() -> String {
    "minimap2".to_string()
}

fn default_samtools() -> String {
    "samtools".to_string()
}

/// Quality-report stage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportConfig {
    /// The report executable.
    #[serde(default = "default_fastqc")]
    pub fastqc: String,
    /// Per-task resources.
    pub resources: JobResources,
}

fn default_fastqc() -> String {
    "fastqc".to_string()
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between state polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval() -> u64 {
    60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl SchedulerConfig {
    /// The poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// LIMS connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimsConfig {
    /// Base URL of the LIMS API.
    pub base_url: String,
}

/// One expected entity of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleEntry {
    /// The sample id as it appears in read-file names.
    pub sample_id: String,
    /// The owning project.
    pub project: String,
}

/// Complete configuration of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// The instrument run directory.
    pub run_dir: PathBuf,
    /// Root under which stage directories are created.
    pub output_dir: PathBuf,
    /// The sample sheet handed to the converter.
    pub sample_sheet: PathBuf,
    /// What was sequenced.
    pub assay: AssayKind,
    /// The library protocol.
    pub protocol: ProtocolKind,
    /// Per-project processing plans.
    pub projects: Vec<ProjectPlan>,
    /// Expected entities.
    pub samples: Vec<SampleEntry>,
    /// Conversion stage.
    pub convert: ConvertConfig,
    /// Filtering stage; required unless the assay is amplicon.
    #[serde(default)]
    pub filter: Option<FilterConfig>,
    /// Report stage.
    pub report: ReportConfig,
    /// Scheduler polling.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// LIMS registration; skipped when absent.
    #[serde(default)]
    pub lims: Option<LimsConfig>,
    /// The `seqflow` binary invoked from job scripts.
    #[serde(default = "default_executable")]
    pub executable: String,
}

fn default_executable() -> String {
    "seqflow".to_string()
}

fn check_name(value: &str, field: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::missing(field));
    }
    if value.contains('/') || value.contains(char::is_whitespace) || value == "." || value == ".." {
        return Err(ConfigError::new(format!("'{value}' cannot be used as a directory name"))
            .with_field(field));
    }
    Ok(())
}

impl PipelineConfig {
    /// Reads and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// The stages of this run, in order.
    #[must_use]
    pub fn stages(&self) -> Vec<StageName> {
        self.assay.stages()
    }

    /// The filtering section.
    ///
    /// # Errors
    ///
    /// Returns an error when the section is absent.
    pub fn filter(&self) -> Result<&FilterConfig, ConfigError> {
        self.filter.as_ref().ok_or_else(|| ConfigError::missing("filter"))
    }

    /// The plan for `project`, if configured.
    #[must_use]
    pub fn project(&self, name: &str) -> Option<&ProjectPlan> {
        self.projects.iter().find(|p| p.name == name)
    }

    /// Expected `(sample_id, project)` pairs.
    pub fn entities(&self) -> impl Iterator<Item = (String, String)> + '_ {
        self.samples
            .iter()
            .map(|s| (s.sample_id.clone(), s.project.clone()))
    }

    /// Checks every field needed by the configured stages.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run_dir.as_os_str().is_empty() {
            return Err(ConfigError::missing("run_dir"));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::missing("output_dir"));
        }
        if self.sample_sheet.as_os_str().is_empty() {
            return Err(ConfigError::missing("sample_sheet"));
        }
        if self.executable.trim().is_empty() {
            return Err(ConfigError::missing("executable"));
        }

        if self.projects.is_empty() {
            return Err(ConfigError::missing("projects"));
        }
        let mut names = HashSet::new();
        for project in &self.projects {
            check_name(&project.name, "projects.name")?;
            if !names.insert(project.name.as_str()) {
                return Err(ConfigError::new(format!("project '{}' is listed twice", project.name))
                    .with_field("projects"));
            }
        }

        if self.samples.is_empty() {
            return Err(ConfigError::missing("samples"));
        }
        let mut ids = HashSet::new();
        for sample in &self.samples {
            check_name(&sample.sample_id, "samples.sample_id")?;
            if !names.contains(sample.project.as_str()) {
                return Err(ConfigError::new(format!(
                    "sample '{}' belongs to unknown project '{}'",
                    sample.sample_id, sample.project
                ))
                .with_field("samples.project"));
            }
            if !ids.insert(sample.sample_id.as_str()) {
                return Err(ConfigError::new(format!("sample '{}' is listed twice", sample.sample_id))
                    .with_field("samples"));
            }
        }

        self.convert.select_converter(self.protocol)?;
        self.convert.resources.validate("convert.resources")?;

        if self.stages().contains(&StageName::Filter) {
            let filter = self.filter()?;
            if filter.bucket_count == 0 {
                return Err(ConfigError::new("filter.bucket_count must be at least 1")
                    .with_field("filter.bucket_count"));
            }
            if filter.demux_workers == 0 {
                return Err(ConfigError::new("filter.demux_workers must be at least 1")
                    .with_field("filter.demux_workers"));
            }
            if self.projects.iter().any(|p| p.host_filtering) && filter.host_index.is_none() {
                return Err(ConfigError::missing("filter.host_index")
                    .with_fix_hint("projects with host_filtering need a host reference index"));
            }
            filter.resources.validate("filter.resources")?;
        }

        self.report.resources.validate("report.resources")?;

        if self.scheduler.poll_interval_secs == 0 {
            return Err(ConfigError::new("scheduler.poll_interval_secs must be at least 1")
                .with_field("scheduler.poll_interval_secs"));
        }
        if let Some(lims) = &self.lims {
            if lims.base_url.trim().is_empty() {
                return Err(ConfigError::missing("lims.base_url"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config_json() -> serde_json::Value {
        serde_json::json!({
            "run_dir": "/runs/240101_A00953_0001",
            "output_dir": "/work/run1",
            "sample_sheet": "/runs/sheet.csv",
            "assay": "metagenomic",
            "protocol": "illumina",
            "projects": [
                {"name": "proj1", "host_filtering": true, "adapter_trimming": true},
                {"name": "proj2", "adapter_trimming": true}
            ],
            "samples": [
                {"sample_id": "sA", "project": "proj1"},
                {"sample_id": "sB", "project": "proj2"}
            ],
            "convert": {
                "bcl2fastq": {},
                "resources": {"queue": "qiita", "memory_mb": 8192, "wall_time_minutes": 600, "cores": 16}
            },
            "filter": {
                "bucket_count": 4,
                "host_index": "/refs/human.mmi",
                "resources": {"queue": "qiita", "memory_mb": 4096, "wall_time_minutes": 240}
            },
            "report": {
                "resources": {"queue": "qiita", "memory_mb": 2048, "wall_time_minutes": 60}
            }
        })
    }

    fn config() -> PipelineConfig {
        serde_json::from_value(config_json()).unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let config = config();
        assert!(config.validate().is_ok());
        let filter = config.filter().unwrap();
        assert_eq!(filter.min_bytes, 3100);
        assert_eq!(filter.demux_workers, 1);
        assert_eq!(filter.fastp, "fastp");
        assert_eq!(config.scheduler.poll_interval(), Duration::from_secs(60));
        assert_eq!(config.executable, "seqflow");
        assert_eq!(config.convert.resources.pool_size, 30);
    }

    #[test]
    fn test_stage_lists() {
        assert_eq!(AssayKind::Metagenomic.stages().len(), 5);
        assert!(!AssayKind::Amplicon.stages().contains(&StageName::Filter));
    }

    #[test]
    fn test_select_converter_priority() {
        let mut convert = config().convert;
        assert_eq!(convert.select_converter(ProtocolKind::Illumina).unwrap().name(), "bcl2fastq");

        convert.bcl_convert = Some(BclConvertConfig {
            executable: default_bcl_convert(),
        });
        assert_eq!(convert.select_converter(ProtocolKind::Illumina).unwrap().name(), "bcl-convert");

        assert!(convert.select_converter(ProtocolKind::TellSeq).is_err());
        convert.bcl_convert = None;
        convert.bcl2fastq = None;
        assert!(convert.select_converter(ProtocolKind::Illumina).is_err());
    }

    #[test]
    fn test_converter_command() {
        let tool = Bcl2FastqConfig {
            executable: "bcl2fastq".into(),
        };
        let cmd = Converter::Bcl2Fastq(&tool).command(
            Path::new("/run"),
            Path::new("/sheet.csv"),
            Path::new("/out"),
            8,
        );
        assert!(cmd.starts_with("bcl2fastq --sample-sheet /sheet.csv"));
        assert!(cmd.contains("-R /run -o /out"));
        assert!(!cmd.contains('\n'));
    }

    #[test]
    fn test_validate_reports_field() {
        let mut config = config();
        config.filter.as_mut().unwrap().bucket_count = 0;
        assert_eq!(config.validate().unwrap_err().field.as_deref(), Some("filter.bucket_count"));

        let mut config = self::config();
        config.filter = None;
        assert_eq!(config.validate().unwrap_err().field.as_deref(), Some("filter"));

        let mut config = self::config();
        config.samples[1].project = "nope".into();
        assert_eq!(config.validate().unwrap_err().field.as_deref(), Some("samples.project"));

        let mut config = self::config();
        config.filter.as_mut().unwrap().host_index = None;
        assert_eq!(config.validate().unwrap_err().field.as_deref(), Some("filter.host_index"));
    }

    #[test]
    fn test_amplicon_needs_no_filter_section() {
        let mut config = config();
        config.assay = AssayKind::Amplicon;
        config.filter = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        fs::write(&path, serde_json::to_string_pretty(&config_json()).unwrap()).unwrap();
        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded, config());
    }
}
