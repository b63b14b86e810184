//! The tag → sample/project map used to route multiplexed reads.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::errors::{ConfigError, Result};

/// Where reads carrying one origin tag belong.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleInfo {
    /// The sample identifier.
    pub sample_id: String,
    /// The sample's position on the sample sheet.
    pub sample_index: u32,
    /// The owning project.
    pub project: String,
}

impl SampleInfo {
    /// Creates a new sample entry.
    #[must_use]
    pub fn new(sample_id: impl Into<String>, sample_index: u32, project: impl Into<String>) -> Self {
        Self {
            sample_id: sample_id.into(),
            sample_index,
            project: project.into(),
        }
    }
}

/// Immutable mapping from origin tag to sample.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleMap {
    entries: BTreeMap<String, SampleInfo>,
}

fn check_component(value: &str, field: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::missing(field));
    }
    if value.contains('/') || value == "." || value == ".." {
        return Err(ConfigError::new(format!("'{value}' is not usable as a path component"))
            .with_field(field));
    }
    Ok(())
}

impl SampleMap {
    /// Builds a map, rejecting duplicate tags and unusable names.
    ///
    /// Every tag must own its output files: two tags naming the same
    /// project, sample id and index are rejected.
    ///
    /// # Errors
    ///
    /// Returns an error on a duplicate or empty tag, two tags sharing an
    /// output, or a sample id/project that cannot be used as a path component.
    pub fn from_entries(
        entries: impl IntoIterator<Item = (String, SampleInfo)>,
    ) -> Result<Self, ConfigError> {
        let mut map = BTreeMap::new();
        let mut outputs = BTreeMap::new();
        for (tag, info) in entries {
            check_component(&tag, "tag")?;
            check_component(&info.sample_id, "sample_id")?;
            check_component(&info.project, "project")?;
            if map.contains_key(&tag) {
                return Err(ConfigError::new(format!("duplicate origin tag '{tag}'")));
            }
            let output = (info.project.clone(), info.sample_id.clone(), info.sample_index);
            if let Some(other) = outputs.insert(output, tag.clone()) {
                return Err(ConfigError::new(format!(
                    "origin tags '{other}' and '{tag}' both write sample '{}' (S{}) of project '{}'",
                    info.sample_id, info.sample_index, info.project
                ))
                .with_field("tag"));
            }
            map.insert(tag, info);
        }
        Ok(Self { entries: map })
    }

    /// Looks up a tag.
    #[must_use]
    pub fn get(&self, tag: &str) -> Option<&SampleInfo> {
        self.entries.get(tag)
    }

    /// Number of tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the map has no tags.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates tags and samples in tag order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &SampleInfo)> {
        self.entries.iter()
    }

    /// Parses the `tag<TAB>sample_id<TAB>sample_index<TAB>project` format.
    ///
    /// # Errors
    ///
    /// Returns an error on read failure or a malformed line.
    pub fn read_tsv<R: BufRead>(reader: R) -> Result<Self> {
        let mut entries = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            let [tag, sample_id, index, project] = fields.as_slice() else {
                return Err(ConfigError::new(format!(
                    "sample map line {}: expected 4 tab-separated fields",
                    line_no + 1
                ))
                .into());
            };
            let sample_index = index.parse::<u32>().map_err(|_| {
                ConfigError::new(format!(
                    "sample map line {}: sample index '{index}' is not a number",
                    line_no + 1
                ))
            })?;
            entries.push(((*tag).to_string(), SampleInfo::new(*sample_id, sample_index, *project)));
        }
        Ok(Self::from_entries(entries)?)
    }

    /// Loads a map from a TSV file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        Self::read_tsv(BufReader::new(fs::File::open(path)?))
    }

    /// Writes the map as TSV, one tag per line in tag order.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(fs::File::create(path)?);
        for (tag, info) in &self.entries {
            writeln!(
                writer,
                "{tag}\t{}\t{}\t{}",
                info.sample_id, info.sample_index, info.project
            )?;
        }
        writer.flush()?;
        Ok(())
    }
}
