//! Sample-prep file generation.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{info, warn};

use super::{project_of, sample_of, StageContext, StageOutcome, StageWork};
use crate::core::StageName;
use crate::errors::Result;
use crate::lims::fetch_tube_ids;
use crate::planner::{discover_pairs, ReadPair};

/// File name suffix of per-project prep files.
pub const PREP_SUFFIX: &str = "_prep.tsv";

/// Writes one prep file per project listing its kept pairs. Expected
/// samples with no kept pair fail here.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenPrepStage;

fn write_prep(
    path: &Path,
    project: &str,
    rows: &BTreeMap<String, &ReadPair>,
    tube_ids: &BTreeMap<String, String>,
) -> Result<()> {
    let mut writer = BufWriter::new(fs::File::create(path)?);
    writeln!(writer, "sample_name\ttube_id\tproject\tforward\treverse\tsize_bytes")?;
    for (sample, pair) in rows {
        writeln!(
            writer,
            "{sample}\t{}\t{project}\t{}\t{}\t{}",
            tube_ids.get(sample).map_or("", String::as_str),
            pair.forward.display(),
            pair.reverse.display(),
            pair.size_bytes
        )?;
    }
    writer.flush()?;
    Ok(())
}

#[async_trait]
impl StageWork for GenPrepStage {
    fn name(&self) -> StageName {
        StageName::GenPrep
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let config = &ctx.config;
        let input = ctx.stage_dir(ctx.reads_stage());
        let stage_dir = ctx.stage_dir(self.name());
        fs::create_dir_all(&stage_dir)?;

        let pairs = discover_pairs(&input)?;
        let mut by_project: BTreeMap<String, BTreeMap<String, &ReadPair>> = BTreeMap::new();
        for pair in &pairs {
            by_project
                .entry(project_of(pair, &input))
                .or_default()
                .insert(sample_of(pair)?, pair);
        }

        let mut present = BTreeSet::new();
        for plan in &config.projects {
            let Some(rows) = by_project.get(&plan.name) else {
                warn!(project = %plan.name, "No kept reads; no prep file written");
                continue;
            };
            let tube_ids = match &ctx.lims {
                Some(lims) => fetch_tube_ids(lims.as_ref(), &plan.name).await?,
                None => BTreeMap::new(),
            };

            let project_dir = stage_dir.join(&plan.name);
            fs::create_dir_all(&project_dir)?;
            let path = project_dir.join(format!("{}{PREP_SUFFIX}", plan.name));
            write_prep(&path, &plan.name, rows, &tube_ids)?;
            info!(project = %plan.name, samples = rows.len(), "Wrote prep file {}", path.display());

            present.extend(rows.keys().map(|s| (plan.name.clone(), s.clone())));
        }

        let failed = config
            .samples
            .iter()
            .filter(|s| !present.contains(&(s.project.clone(), s.sample_id.clone())))
            .map(|s| s.sample_id.clone());
        Ok(StageOutcome::ok().with_failed(failed))
    }
}
