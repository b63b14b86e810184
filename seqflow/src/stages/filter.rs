//! Adapter trimming, host filtering and demultiplexing as a bucketed array
//! job.
//!
//! Converted pairs are packed into size-balanced buckets. Each array task
//! trims (and, per project, host-filters) its pairs into one interleaved
//! stream whose headers carry `<position>::MUX::`, then demultiplexes that
//! stream back into per-sample files under `$OUTPUT/<project>/`. Once the
//! job is done the outputs are filed by category and undersized pairs are
//! quarantined.

use async_trait::async_trait;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{StageContext, StageOutcome, StageWork};
use crate::config::PipelineConfig;
use crate::core::StageName;
use crate::demux::{output_file_name, SampleInfo, SampleMap};
use crate::errors::{ConfigError, Result, SeqflowError};
use crate::jobs::{run_array_job, JobScriptGenerator};
use crate::planner::{self, manifest_path, Bucket};
use crate::reorganize::reorganize;
use crate::utils::naming::{parse_read_path, Orientation};

/// Runs filtering for every converted pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterStage;

fn sample_map_path(prefix: &Path, number: usize) -> PathBuf {
    manifest_path(prefix, number).with_extension("map")
}

/// The sample index used for a pair whose file name carries none.
fn fallback_index(tag: usize) -> Result<u32, ConfigError> {
    u32::try_from(tag).map_err(|_| ConfigError::new(format!("bucket tag {tag} does not fit a sample index")))
}

/// Tags a bucket's pairs 1..=N in manifest order.
fn bucket_sample_map(bucket: &Bucket) -> Result<SampleMap> {
    let mut entries = Vec::with_capacity(bucket.pairs.len());
    for (pos, pair) in bucket.pairs.iter().enumerate() {
        let parsed = parse_read_path(&pair.forward)?;
        let tag = pos + 1;
        let index = match parsed.sample_number() {
            Some(number) => number,
            None => fallback_index(tag)?,
        };
        entries.push((tag.to_string(), SampleInfo::new(parsed.sample_id(), index, &pair.project)));
    }
    Ok(SampleMap::from_entries(entries)?)
}

/// The shell command array task `bucket.number` runs.
///
/// # Errors
///
/// Returns an error when the filter section is missing, a pair belongs to an
/// unconfigured project, or host filtering has no index.
pub fn bucket_command(config: &PipelineConfig, bucket: &Bucket, sample_map: &Path, cores: u32) -> Result<String> {
    let filter = config.filter()?;
    let stream = format!("${{TMPDIR}}/bucket-{}.fastq", bucket.number);

    let mut per_pair = Vec::with_capacity(bucket.pairs.len());
    for (pos, pair) in bucket.pairs.iter().enumerate() {
        let plan = config.project(&pair.project).ok_or_else(|| {
            ConfigError::new(format!("reads found for unconfigured project '{}'", pair.project))
                .with_field("projects")
        })?;

        let mut cmd = format!(
            "{} -l 45 -i {} -I {} -w {cores} --stdout -j /dev/null -h /dev/null",
            filter.fastp,
            pair.forward.display(),
            pair.reverse.display()
        );
        if plan.adapter_trimming {
            if let Some(a) = &filter.adapter_a {
                cmd.push_str(&format!(" --adapter_sequence {a}"));
            }
            if let Some(b) = &filter.adapter_b {
                cmd.push_str(&format!(" --adapter_sequence_r2 {b}"));
            }
        } else {
            cmd.push_str(" --disable_adapter_trimming");
        }

        if plan.host_filtering {
            let index = filter
                .host_index
                .as_ref()
                .ok_or_else(|| ConfigError::missing("filter.host_index"))?;
            cmd.push_str(&format!(
                " | {} -2 -ax {} -t {cores} {} - | {} fastq -@ {cores} -f 12 -F 256 -N -",
                filter.minimap2,
                config.assay.minimap2_preset(),
                index.display(),
                filter.samtools
            ));
        } else {
            cmd.push_str(r#" | awk 'NR%8==1{$1=$1"/1"} NR%8==5{$1=$1"/2"} {print}'"#);
        }
        cmd.push_str(&format!(
            r#" | awk -v t={} 'NR%4==1{{sub(/^@/, "@" t "::MUX::")}} {{print}}'"#,
            pos + 1
        ));
        per_pair.push(cmd);
    }

    let workers = filter.demux_workers.max(1);
    let demux = format!(
        "seq 0 {} | xargs -P {workers} -I{{}} {} demux --sample-map {} --input {stream} --output ${{OUTPUT}} \
         --task-index {{}} --total-tasks {workers}",
        workers - 1,
        config.executable,
        sample_map.display()
    );

    Ok(format!(
        "set -euo pipefail; mkdir -p ${{TMPDIR}}; {{ {}; }} > {stream}; {demux}; rm -f {stream}",
        per_pair.join("; ")
    ))
}

#[async_trait]
impl StageWork for FilterStage {
    fn name(&self) -> StageName {
        StageName::Filter
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let config = &ctx.config;
        let filter = config.filter()?;
        let input = ctx.stage_dir(StageName::Convert);
        let stage_dir = ctx.stage_dir(self.name());
        let work_dir = ctx.work_dir(self.name());
        fs::create_dir_all(&work_dir)?;

        let prefix = work_dir.join("chunk");
        let plan = planner::plan(&input, filter.bucket_count, &prefix)?;
        if plan.is_empty() {
            return Err(SeqflowError::NoWork(input));
        }

        let resources = filter.resources.scaled_for(plan.max_bucket_bytes(), &filter.scaling);
        let mut seen = HashSet::new();
        let mut expected = Vec::new();
        let mut commands = Vec::with_capacity(plan.bucket_count());
        for bucket in &plan.buckets {
            let map = bucket_sample_map(bucket)?;
            for (_, info) in map.iter() {
                if !seen.insert((info.project.clone(), info.sample_id.clone())) {
                    return Err(ConfigError::new(format!(
                        "sample '{}' of project '{}' has more than one read pair",
                        info.sample_id, info.project
                    ))
                    .with_fix_hint("convert without lane splitting so each sample has one pair")
                    .into());
                }
                expected.push(info.clone());
            }
            let map_path = sample_map_path(&prefix, bucket.number);
            map.save(&map_path)?;
            commands.push(bucket_command(config, bucket, &map_path, resources.cores)?);
        }

        info!(
            buckets = plan.bucket_count(),
            max_bucket_bytes = plan.max_bucket_bytes(),
            memory_mb = resources.memory_mb,
            wall_time = %resources.wall_time(),
            "Submitting filtering job"
        );
        let job = JobScriptGenerator::new(self.name().dir_name(), resources, &work_dir)
            .with_input_prefix(&prefix)
            .with_output(&stage_dir)
            .generate(&commands)?;
        let job_id = run_array_job(ctx.scheduler.as_ref(), &job, config.scheduler.poll_interval()).await?;

        let summary = reorganize(&stage_dir, &config.projects, filter.min_bytes)?;

        let failed = expected.into_iter().filter_map(|info| {
            let category = config.project(&info.project)?.category();
            let kept = stage_dir
                .join(&info.project)
                .join(category.dir_name())
                .join(output_file_name(&info, Orientation::R1));
            (!kept.exists()).then_some(info.sample_id)
        });
        let outcome = StageOutcome::ok().with_failed(failed).with_job_id(job_id);
        info!(
            quarantined = summary.quarantined_samples().len(),
            failed = outcome.failed_ids.len(),
            "Filtering finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::ReadPair;

    fn config() -> PipelineConfig {
        serde_json::from_value(serde_json::json!({
            "run_dir": "/runs/r1",
            "output_dir": "/work/r1",
            "sample_sheet": "/runs/sheet.csv",
            "assay": "metagenomic",
            "protocol": "illumina",
            "projects": [
                {"name": "host", "host_filtering": true, "adapter_trimming": true},
                {"name": "plain"}
            ],
            "samples": [
                {"sample_id": "sA", "project": "host"},
                {"sample_id": "sB", "project": "plain"}
            ],
            "convert": {
                "bcl_convert": {},
                "resources": {"queue": "q", "memory_mb": 1, "wall_time_minutes": 1}
            },
            "filter": {
                "bucket_count": 2,
                "demux_workers": 3,
                "host_index": "/refs/human.mmi",
                "adapter_a": "AGATCGGAAG",
                "resources": {"queue": "q", "memory_mb": 1, "wall_time_minutes": 1}
            },
            "report": {"resources": {"queue": "q", "memory_mb": 1, "wall_time_minutes": 1}}
        }))
        .unwrap()
    }

    fn bucket() -> Bucket {
        let pair = |dir: &str, name: &str| ReadPair {
            forward: PathBuf::from(format!("/work/r1/ConvertJob/{dir}/{name}_R1_001.fastq.gz")),
            reverse: PathBuf::from(format!("/work/r1/ConvertJob/{dir}/{name}_R2_001.fastq.gz")),
            project: dir.to_string(),
            size_bytes: 10,
        };
        Bucket {
            number: 2,
            pairs: vec![pair("host", "sA_S4"), pair("plain", "sB_S7")],
            size_bytes: 20,
        }
    }

    #[test]
    fn test_bucket_sample_map() {
        let map = bucket_sample_map(&bucket()).unwrap();
        assert_eq!(map.get("1"), Some(&SampleInfo::new("sA", 4, "host")));
        assert_eq!(map.get("2"), Some(&SampleInfo::new("sB", 7, "plain")));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_fallback_index_rejects_oversized_tags() {
        assert_eq!(fallback_index(3).unwrap(), 3);
        assert_eq!(fallback_index(u32::MAX as usize).unwrap(), u32::MAX);
        let err = fallback_index(u32::MAX as usize + 1).unwrap_err();
        assert!(err.message.contains("does not fit a sample index"));
    }

    #[test]
    fn test_bucket_command() {
        let cmd = bucket_command(&config(), &bucket(), Path::new("/w/chunk-2.map"), 8).unwrap();

        assert!(cmd.starts_with("set -euo pipefail;"));
        assert!(!cmd.contains('\n'));
        assert!(cmd.contains("--adapter_sequence AGATCGGAAG"));
        assert!(cmd.contains("minimap2 -2 -ax sr -t 8 /refs/human.mmi -"));
        assert!(cmd.contains("--disable_adapter_trimming"));
        assert!(cmd.contains("awk -v t=1 "));
        assert!(cmd.contains("awk -v t=2 "));
        assert!(cmd.contains("> ${TMPDIR}/bucket-2.fastq"));
        assert!(cmd.contains("xargs -P 3 -I{} seqflow demux --sample-map /w/chunk-2.map"));
        assert!(cmd.contains("--total-tasks 3"));
    }

    #[test]
    fn test_bucket_command_rejects_unknown_project() {
        let mut bucket = bucket();
        bucket.pairs[0].project = "stray".to_string();
        assert!(bucket_command(&config(), &bucket, Path::new("/w/m"), 1).is_err());
    }

    #[test]
    fn test_sample_map_path() {
        assert_eq!(sample_map_path(Path::new("/w/chunk"), 3), PathBuf::from("/w/chunk-3.map"));
    }
}
