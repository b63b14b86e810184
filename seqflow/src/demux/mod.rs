//! Streaming demultiplexer.
//!
//! Filtering tasks emit one interleaved FASTQ stream in which every header
//! carries the read's origin as `<tag>::MUX::<original-id>`. This module
//! routes each pair back to per-sample, per-project gzip files. Parallel
//! tasks share one logical stream by sharding on the tag alone, so a shard
//! can be re-run on its own and produce the same bytes.

mod sample_map;

pub use sample_map::{SampleInfo, SampleMap};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use seq_io::fastq::{OwnedRecord, Reader, Record};
use sha2::{Digest, Sha256};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::errors::{ConfigError, NamingConventionError, Result};
use crate::utils::naming::Orientation;

/// Separator between the origin tag and the original read id.
pub const MUX_SEPARATOR: &str = "::MUX::";

/// Lane token used in demultiplexed file names.
pub const DEFAULT_LANE: &str = "L001";

/// Returns the shard that owns `tag` among `total_tasks` shards.
///
/// Numeric tags shard by value; anything else by a SHA-256 digest of the
/// tag bytes. Depends on the tag alone.
#[must_use]
pub fn shard_for(tag: &str, total_tasks: usize) -> usize {
    let total = total_tasks.max(1) as u64;
    let value = tag.parse::<u64>().unwrap_or_else(|_| {
        let digest = Sha256::digest(tag.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(head)
    });
    (value % total) as usize
}

/// File name of a demultiplexed read file.
#[must_use]
pub fn output_file_name(info: &SampleInfo, orientation: Orientation) -> String {
    format!(
        "{}_S{}_{DEFAULT_LANE}_{}_001.fastq.gz",
        info.sample_id, info.sample_index, orientation
    )
}

/// A parsed multiplexed read header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxHeader<'a> {
    /// The origin tag.
    pub tag: &'a str,
    /// The original read id, mate suffix included.
    pub read_id: &'a str,
    /// The read id without its `/1` or `/2` suffix.
    pub base_id: &'a str,
    /// 1 or 2.
    pub mate: u8,
    /// The whitespace byte between the id and the annotations.
    pub separator: u8,
    /// Everything after the first whitespace, verbatim.
    pub annotations: Option<&'a str>,
}

/// Parses a header line (without the leading `@`).
///
/// # Errors
///
/// Returns an error if the header is not UTF-8, has no `::MUX::` separator,
/// or the original id lacks a `/1` or `/2` mate suffix.
pub fn parse_mux_header(head: &[u8]) -> Result<MuxHeader<'_>, NamingConventionError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| NamingConventionError::new(String::from_utf8_lossy(head), "header is not UTF-8"))?;

    let (id, separator, annotations) = match text.find(|c: char| c.is_ascii_whitespace()) {
        Some(pos) => {
            let rest = &text[pos + 1..];
            (&text[..pos], text.as_bytes()[pos], Some(rest).filter(|r| !r.is_empty()))
        }
        None => (text, b' ', None),
    };

    let (tag, read_id) = id
        .split_once(MUX_SEPARATOR)
        .ok_or_else(|| NamingConventionError::new(text, "missing ::MUX:: origin tag"))?;
    if tag.is_empty() || read_id.is_empty() {
        return Err(NamingConventionError::new(text, "empty origin tag or read id"));
    }

    let (base_id, mate) = if let Some(base) = read_id.strip_suffix("/1") {
        (base, 1)
    } else if let Some(base) = read_id.strip_suffix("/2") {
        (base, 2)
    } else {
        return Err(NamingConventionError::new(text, "read id has no /1 or /2 mate suffix"));
    };

    Ok(MuxHeader {
        tag,
        read_id,
        base_id,
        mate,
        separator,
        annotations,
    })
}

/// Counters reported by one demultiplexing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DemuxSummary {
    /// Pairs read from the input.
    pub pairs_seen: u64,
    /// Pairs written by this shard.
    pub pairs_emitted: u64,
    /// Pairs whose tag is not in the sample map.
    pub pairs_unknown: u64,
    /// Pairs owned by other shards.
    pub pairs_other_shard: u64,
    /// Pairs written per sample id.
    pub per_sample: BTreeMap<String, u64>,
}

type GzFile = GzEncoder<BufWriter<File>>;

struct PairWriter {
    forward: GzFile,
    reverse: GzFile,
}

impl PairWriter {
    fn create(out_dir: &Path, info: &SampleInfo) -> Result<Self> {
        let project_dir = out_dir.join(&info.project);
        fs::create_dir_all(&project_dir)?;
        let open = |orientation| -> io::Result<GzFile> {
            let path = project_dir.join(output_file_name(info, orientation));
            debug!("Opening {}", path.display());
            Ok(GzEncoder::new(
                BufWriter::new(File::create(path)?),
                Compression::default(),
            ))
        };
        Ok(Self {
            forward: open(Orientation::R1)?,
            reverse: open(Orientation::R2)?,
        })
    }

    fn finish(self) -> io::Result<()> {
        self.forward.finish()?.flush()?;
        self.reverse.finish()?.flush()?;
        Ok(())
    }
}

fn write_record<W: Write>(writer: &mut W, header: &MuxHeader<'_>, record: &OwnedRecord) -> io::Result<()> {
    writer.write_all(b"@")?;
    writer.write_all(header.read_id.as_bytes())?;
    if let Some(annotations) = header.annotations {
        writer.write_all(&[header.separator])?;
        writer.write_all(annotations.as_bytes())?;
    }
    writer.write_all(b"\n")?;
    writer.write_all(record.seq())?;
    writer.write_all(b"\n+\n")?;
    writer.write_all(record.qual())?;
    writer.write_all(b"\n")
}

/// Routes one shard of an interleaved multiplexed stream.
#[derive(Debug)]
pub struct Demultiplexer<'a> {
    sample_map: &'a SampleMap,
    out_dir: PathBuf,
    task_index: usize,
    total_tasks: usize,
}

impl<'a> Demultiplexer<'a> {
    /// Creates a demultiplexer for shard `task_index` of `total_tasks`.
    ///
    /// # Errors
    ///
    /// Returns an error if `total_tasks` is zero or `task_index` is out of
    /// range.
    pub fn new(
        sample_map: &'a SampleMap,
        out_dir: impl Into<PathBuf>,
        task_index: usize,
        total_tasks: usize,
    ) -> Result<Self> {
        if total_tasks == 0 {
            return Err(ConfigError::new("total demultiplexing tasks must be at least 1")
                .with_field("total_tasks")
                .into());
        }
        if task_index >= total_tasks {
            return Err(ConfigError::new(format!(
                "task index {task_index} is out of range for {total_tasks} tasks"
            ))
            .with_field("task_index")
            .into());
        }
        Ok(Self {
            sample_map,
            out_dir: out_dir.into(),
            task_index,
            total_tasks,
        })
    }

    /// Consumes the stream, writing this shard's pairs.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed FASTQ, a header that breaks the naming
    /// convention, mismatched mates, a truncated pair, or an I/O failure.
    pub fn run<R: Read>(&self, input: R) -> Result<DemuxSummary> {
        let mut reader = Reader::new(input);
        let mut writers: HashMap<String, PairWriter> = HashMap::new();
        let mut summary = DemuxSummary::default();

        loop {
            let Some(first) = reader.next() else {
                break;
            };
            let forward = first?.to_owned_record();
            let reverse = match reader.next() {
                Some(second) => second?.to_owned_record(),
                None => {
                    return Err(NamingConventionError::new(
                        String::from_utf8_lossy(forward.head()),
                        "stream ended before the reverse mate",
                    )
                    .into());
                }
            };
            summary.pairs_seen += 1;

            let fwd = parse_mux_header(forward.head())?;
            let rev = parse_mux_header(reverse.head())?;
            if fwd.mate != 1 || rev.mate != 2 || fwd.tag != rev.tag || fwd.base_id != rev.base_id {
                return Err(NamingConventionError::new(
                    format!("{} / {}", fwd.read_id, rev.read_id),
                    "records are not an interleaved R1/R2 pair",
                )
                .into());
            }

            let Some(info) = self.sample_map.get(fwd.tag) else {
                summary.pairs_unknown += 1;
                continue;
            };
            if shard_for(fwd.tag, self.total_tasks) != self.task_index {
                summary.pairs_other_shard += 1;
                continue;
            }

            let writer = match writers.entry(fwd.tag.to_string()) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => {
                    e.insert(PairWriter::create(&self.out_dir, info)?)
                }
            };
            write_record(&mut writer.forward, &fwd, &forward)?;
            write_record(&mut writer.reverse, &rev, &reverse)?;

            summary.pairs_emitted += 1;
            *summary.per_sample.entry(info.sample_id.clone()).or_insert(0) += 1;
        }

        for writer in writers.into_values() {
            writer.finish()?;
        }

        info!(
            task_index = self.task_index,
            total_tasks = self.total_tasks,
            pairs_seen = summary.pairs_seen,
            pairs_emitted = summary.pairs_emitted,
            pairs_unknown = summary.pairs_unknown,
            samples = summary.per_sample.len(),
            "Demultiplexed shard"
        );
        Ok(summary)
    }
}

/// Demultiplexes shard `task_index` of `input` into `out_dir`.
///
/// # Errors
///
/// See [`Demultiplexer::new`] and [`Demultiplexer::run`].
pub fn demux<R: Read>(
    sample_map: &SampleMap,
    input: R,
    out_dir: &Path,
    task_index: usize,
    total_tasks: usize,
) -> Result<DemuxSummary> {
    Demultiplexer::new(sample_map, out_dir, task_index, total_tasks)?.run(input)
}

/// Opens a read stream from a file (gzip detected by magic bytes) or stdin.
///
/// # Errors
///
/// Returns an error if the file cannot be opened.
pub fn open_reads(path: Option<&Path>) -> Result<Box<dyn Read>> {
    let Some(path) = path else {
        return Ok(Box::new(io::stdin().lock()));
    };
    let mut magic = [0u8; 2];
    let is_gz = {
        let mut file = File::open(path)?;
        file.read(&mut magic)? == 2 && magic == [0x1F, 0x8B]
    };
    let file = BufReader::new(File::open(path)?);
    if is_gz {
        Ok(Box::new(MultiGzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SeqflowError;
    use pretty_assertions::assert_eq;

    fn sample_map() -> SampleMap {
        SampleMap::from_entries([
            ("1".to_string(), SampleInfo::new("sA", 1, "proj1")),
            ("2".to_string(), SampleInfo::new("sB", 2, "proj1")),
            ("3".to_string(), SampleInfo::new("sC", 3, "proj2")),
            ("bc-x".to_string(), SampleInfo::new("sD", 4, "proj2")),
        ])
        .unwrap()
    }

    fn pair(tag: &str, id: &str, annotations: &str) -> String {
        let ann = if annotations.is_empty() {
            String::new()
        } else {
            format!(" {annotations}")
        };
        format!(
            "@{tag}::MUX::{id}/1{ann}\nACGT\n+\nIIII\n@{tag}::MUX::{id}/2{ann}\nTTGA\n+\nJJJJ\n"
        )
    }

    fn stream() -> String {
        let mut s = String::new();
        for (i, tag) in ["1", "2", "3", "bc-x", "9", "1", "3", "2"].iter().enumerate() {
            s.push_str(&pair(tag, &format!("read{i}"), if i % 2 == 0 { "BX:Z:AAAC-1" } else { "" }));
        }
        s
    }

    fn read_gz(path: &Path) -> String {
        let mut out = String::new();
        MultiGzDecoder::new(File::open(path).unwrap())
            .read_to_string(&mut out)
            .unwrap();
        out
    }

    fn collect_outputs(dir: &Path) -> BTreeMap<String, String> {
        let mut outputs = BTreeMap::new();
        for project in fs::read_dir(dir).unwrap() {
            let project = project.unwrap().path();
            for file in fs::read_dir(&project).unwrap() {
                let file = file.unwrap().path();
                let key = format!(
                    "{}/{}",
                    project.file_name().unwrap().to_string_lossy(),
                    file.file_name().unwrap().to_string_lossy()
                );
                outputs.insert(key, read_gz(&file));
            }
        }
        outputs
    }

    #[test]
    fn test_parse_mux_header() {
        let header = parse_mux_header(b"12::MUX::M00123:1:FC:1:1:100:200/2 BX:Z:ACGT-1 RX:Z:GG").unwrap();
        assert_eq!(header.tag, "12");
        assert_eq!(header.read_id, "M00123:1:FC:1:1:100:200/2");
        assert_eq!(header.base_id, "M00123:1:FC:1:1:100:200");
        assert_eq!(header.mate, 2);
        assert_eq!(header.separator, b' ');
        assert_eq!(header.annotations, Some("BX:Z:ACGT-1 RX:Z:GG"));
    }

    #[test]
    fn test_tab_separated_annotations_kept_verbatim() {
        let header = parse_mux_header(b"1::MUX::r7/1\tCB:Z:AACG\tUB:Z:TT").unwrap();
        assert_eq!(header.separator, b'\t');
        assert_eq!(header.annotations, Some("CB:Z:AACG\tUB:Z:TT"));

        let dir = tempfile::tempdir().unwrap();
        let input = "@1::MUX::r7/1\tCB:Z:AACG\nACGT\n+\nIIII\n@1::MUX::r7/2\tCB:Z:AACG\nTTGA\n+\nJJJJ\n";
        demux(&sample_map(), input.as_bytes(), dir.path(), 0, 1).unwrap();
        let forward = read_gz(&dir.path().join("proj1/sA_S1_L001_R1_001.fastq.gz"));
        assert_eq!(forward, "@r7/1\tCB:Z:AACG\nACGT\n+\nIIII\n");
    }

    #[test]
    fn test_tags_sharing_an_output_are_rejected() {
        let err = SampleMap::from_entries([
            ("1".to_string(), SampleInfo::new("s1", 1, "P")),
            ("2".to_string(), SampleInfo::new("s1", 1, "P")),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("both write sample 's1'"));

        let map = SampleMap::from_entries([
            ("1".to_string(), SampleInfo::new("s1", 1, "P")),
            ("2".to_string(), SampleInfo::new("s1", 2, "P")),
        ])
        .unwrap();
        let mut input = String::new();
        for (i, tag) in ["1", "2", "1", "2"].iter().enumerate() {
            input.push_str(&pair(tag, &format!("read{i}"), ""));
        }
        let dir = tempfile::tempdir().unwrap();
        let summary = demux(&map, input.as_bytes(), dir.path(), 0, 1).unwrap();
        assert_eq!(summary.pairs_emitted, 4);
        let records: usize = ["P/s1_S1_L001_R1_001.fastq.gz", "P/s1_S2_L001_R1_001.fastq.gz"]
            .iter()
            .map(|f| read_gz(&dir.path().join(f)).lines().count() / 4)
            .sum();
        assert_eq!(records, 4);
    }

    #[test]
    fn test_parse_mux_header_rejects_bad_headers() {
        assert!(parse_mux_header(b"read1/1").is_err());
        assert!(parse_mux_header(b"1::MUX::read1").is_err());
        assert!(parse_mux_header(b"::MUX::read1/1").is_err());
    }

    #[test]
    fn test_shard_is_pure_and_in_range() {
        assert_eq!(shard_for("7", 3), 1);
        assert_eq!(shard_for("bc-x", 5), shard_for("bc-x", 5));
        for tag in ["a", "b", "ACGTACGT", "42"] {
            assert!(shard_for(tag, 4) < 4);
            assert_eq!(shard_for(tag, 1), 0);
        }
    }

    #[test]
    fn test_demux_routes_pairs_and_preserves_annotations() {
        let dir = tempfile::tempdir().unwrap();
        let summary = demux(&sample_map(), stream().as_bytes(), dir.path(), 0, 1).unwrap();

        assert_eq!(summary.pairs_seen, 8);
        assert_eq!(summary.pairs_unknown, 1);
        assert_eq!(summary.pairs_emitted, 7);
        assert_eq!(summary.per_sample.get("sA"), Some(&2));

        let r1 = read_gz(&dir.path().join("proj1/sA_S1_L001_R1_001.fastq.gz"));
        let r2 = read_gz(&dir.path().join("proj1/sA_S1_L001_R2_001.fastq.gz"));
        assert_eq!(r1, "@read0/1 BX:Z:AAAC-1\nACGT\n+\nIIII\n@read5/1\nACGT\n+\nIIII\n");
        assert_eq!(r2, "@read0/2 BX:Z:AAAC-1\nTTGA\n+\nJJJJ\n@read5/2\nTTGA\n+\nJJJJ\n");
        assert!(dir.path().join("proj2/sD_S4_L001_R1_001.fastq.gz").exists());
    }

    #[test]
    fn test_shards_partition_the_stream() {
        let map = sample_map();
        let single = tempfile::tempdir().unwrap();
        demux(&map, stream().as_bytes(), single.path(), 0, 1).unwrap();
        let expected = collect_outputs(single.path());

        let total = 3;
        let mut union = BTreeMap::new();
        let mut emitted = 0;
        for task in 0..total {
            let shard_dir = tempfile::tempdir().unwrap();
            let summary = demux(&map, stream().as_bytes(), shard_dir.path(), task, total).unwrap();
            emitted += summary.pairs_emitted;
            for (key, content) in collect_outputs(shard_dir.path()) {
                assert!(union.insert(key.clone(), content).is_none(), "{key} written by two shards");
            }
        }
        assert_eq!(emitted, 7);
        assert_eq!(union, expected);
    }

    #[test]
    fn test_rerunning_a_shard_is_byte_identical() {
        let map = sample_map();
        let dir = tempfile::tempdir().unwrap();
        demux(&map, stream().as_bytes(), dir.path(), 1, 2).unwrap();
        let path = dir.path().join("proj2/sC_S3_L001_R1_001.fastq.gz");
        let first = fs::read(&path).unwrap();
        demux(&map, stream().as_bytes(), dir.path(), 1, 2).unwrap();
        assert_eq!(fs::read(&path).unwrap(), first);
    }

    #[test]
    fn test_mismatched_mates_are_fatal() {
        let input = "@1::MUX::a/1\nA\n+\nI\n@1::MUX::b/2\nA\n+\nI\n";
        let dir = tempfile::tempdir().unwrap();
        let err = demux(&sample_map(), input.as_bytes(), dir.path(), 0, 1).unwrap_err();
        assert!(matches!(err, SeqflowError::Naming(_)));
    }

    #[test]
    fn test_truncated_pair_is_fatal() {
        let input = "@1::MUX::a/1\nA\n+\nI\n";
        let dir = tempfile::tempdir().unwrap();
        assert!(demux(&sample_map(), input.as_bytes(), dir.path(), 0, 1).is_err());
    }

    #[test]
    fn test_task_index_out_of_range() {
        let map = sample_map();
        assert!(Demultiplexer::new(&map, "/tmp/out", 2, 2).is_err());
        assert!(Demultiplexer::new(&map, "/tmp/out", 0, 0).is_err());
    }

    #[test]
    fn test_open_reads_detects_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.fastq.gz");
        let mut enc = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        enc.write_all(pair("1", "r", "").as_bytes()).unwrap();
        enc.finish().unwrap();

        let mut text = String::new();
        open_reads(Some(&path)).unwrap().read_to_string(&mut text).unwrap();
        assert!(text.starts_with("@1::MUX::r/1"));
    }
}
