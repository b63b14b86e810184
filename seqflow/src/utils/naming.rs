//! Read-file naming conventions.
//!
//! Read files carry their orientation as a delimited token in the name
//! (`sample_S1_L001_R1_001.fastq.gz`). Sample names can themselves contain
//! orientation-like tokens (`Sample_R1_extra`), so the matcher only honours
//! the rightmost recognized token. Two names belong to the same pair when they
//! are identical apart from that token.

use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use crate::errors::NamingConventionError;

static SAMPLE_LAYOUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<sample>.+?)_S(?P<number>\d+)(_L\d{3})?$").expect("static regex is valid")
});

/// Extensions recognized as read files, longest first.
pub const READ_EXTENSIONS: &[&str] = &[".fastq.gz", ".fq.gz", ".fastq", ".fq"];

const DELIMITERS: &[char] = &['_', '.'];

/// Which read of a fragment a file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Orientation {
    /// Forward read.
    R1,
    /// Reverse read.
    R2,
    /// First index read.
    I1,
    /// Second index read.
    I2,
}

impl Orientation {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "R1" => Some(Self::R1),
            "R2" => Some(Self::R2),
            "I1" => Some(Self::I1),
            "I2" => Some(Self::I2),
            _ => None,
        }
    }

    /// The token as it appears in file names.
    #[must_use]
    pub fn token(&self) -> &'static str {
        match self {
            Self::R1 => "R1",
            Self::R2 => "R2",
            Self::I1 => "I1",
            Self::I2 => "I2",
        }
    }

    /// Returns true for index reads.
    #[must_use]
    pub fn is_index(&self) -> bool {
        matches!(self, Self::I1 | Self::I2)
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// A read-file name split around its orientation token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadFileName {
    /// The full file name.
    pub file_name: String,
    /// The orientation carried by the rightmost recognized token.
    pub orientation: Orientation,
    /// Everything before the orientation token, delimiter excluded.
    pub prefix: String,
    /// Byte offset of the orientation token in `file_name`.
    pub token_start: usize,
    /// Everything after the orientation token, extension included.
    pub suffix: String,
}

impl ReadFileName {
    /// A key shared by every file of the same fragment set.
    #[must_use]
    pub fn pair_key(&self) -> String {
        format!("{}\u{0}{}", &self.file_name[..self.token_start], self.suffix)
    }

    /// The file name of the mate with the given orientation.
    #[must_use]
    pub fn mate_name(&self, orientation: Orientation) -> String {
        format!(
            "{}{}{}",
            &self.file_name[..self.token_start],
            orientation.token(),
            self.suffix
        )
    }

    /// The sample id encoded in `<sample>_S<index>_L<lane>` prefixes, or the
    /// whole prefix when it does not follow that layout.
    #[must_use]
    pub fn sample_id(&self) -> &str {
        SAMPLE_LAYOUT
            .captures(&self.prefix)
            .and_then(|caps| caps.name("sample"))
            .map_or(self.prefix.as_str(), |m| m.as_str())
    }

    /// The `_S<n>` sample-sheet number, when the prefix carries one.
    #[must_use]
    pub fn sample_number(&self) -> Option<u32> {
        SAMPLE_LAYOUT
            .captures(&self.prefix)
            .and_then(|caps| caps.name("number"))
            .and_then(|m| m.as_str().parse().ok())
    }
}

/// Returns true if the name carries a read-file extension.
#[must_use]
pub fn is_read_file(name: &str) -> bool {
    READ_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// Parses a read-file name using the rightmost orientation token.
///
/// # Errors
///
/// Returns an error if the name has no read-file extension or carries no
/// delimited orientation token.
pub fn parse_read_file(name: &str) -> Result<ReadFileName, NamingConventionError> {
    let ext = READ_EXTENSIONS
        .iter()
        .find(|ext| name.ends_with(*ext))
        .ok_or_else(|| NamingConventionError::new(name, "not a FASTQ file name"))?;
    let stem = &name[..name.len() - ext.len()];

    let mut found = None;
    let mut start = 0;
    for (idx, ch) in stem.char_indices().chain(std::iter::once((stem.len(), '_'))) {
        if DELIMITERS.contains(&ch) {
            if let Some(orientation) = Orientation::from_token(&stem[start..idx]) {
                found = Some((start, idx, orientation));
            }
            start = idx + ch.len_utf8();
        }
    }

    let (tok_start, tok_end, orientation) = found.ok_or_else(|| {
        NamingConventionError::new(name, "no R1/R2/I1/I2 orientation token")
    })?;

    let prefix = stem[..tok_start.saturating_sub(1)].to_string();
    Ok(ReadFileName {
        file_name: name.to_string(),
        orientation,
        prefix,
        token_start: tok_start,
        suffix: name[tok_end..].to_string(),
    })
}

/// Parses the file name component of a path.
///
/// # Errors
///
/// Returns an error if the path has no UTF-8 file name or the name does not
/// parse.
pub fn parse_read_path(path: &Path) -> Result<ReadFileName, NamingConventionError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| NamingConventionError::new(path.display().to_string(), "no file name"))?;
    parse_read_file(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_standard_name() {
        let parsed = parse_read_file("sampleA_S1_L001_R1_001.fastq.gz").unwrap();
        assert_eq!(parsed.orientation, Orientation::R1);
        assert_eq!(parsed.prefix, "sampleA_S1_L001");
        assert_eq!(parsed.suffix, "_001.fastq.gz");
        assert_eq!(parsed.sample_id(), "sampleA");
        assert_eq!(parsed.sample_number(), Some(1));
    }

    #[test]
    fn test_rightmost_token_wins() {
        let r1 = parse_read_file("Sample_R2_extra_R1_001.fastq.gz").unwrap();
        let r2 = parse_read_file("Sample_R2_extra_R2_001.fastq.gz").unwrap();
        assert_eq!(r1.orientation, Orientation::R1);
        assert_eq!(r2.orientation, Orientation::R2);
        assert_eq!(r1.pair_key(), r2.pair_key());
        assert_eq!(r1.prefix, "Sample_R2_extra");
    }

    #[test]
    fn test_substring_is_not_a_token() {
        // "XR1" and "R1x" are not delimited tokens
        let parsed = parse_read_file("XR1_R1x_R2.fq").unwrap();
        assert_eq!(parsed.orientation, Orientation::R2);
        assert!(parse_read_file("sampleR1.fastq.gz").is_err());
    }

    #[test]
    fn test_dot_delimited_token() {
        let parsed = parse_read_file("sample.R2.fq.gz").unwrap();
        assert_eq!(parsed.orientation, Orientation::R2);
        assert_eq!(parsed.prefix, "sample");
        assert_eq!(parsed.suffix, ".fq.gz");
    }

    #[test]
    fn test_mate_name() {
        let parsed = parse_read_file("s_S2_L001_R1_001.fastq.gz").unwrap();
        assert_eq!(parsed.mate_name(Orientation::R2), "s_S2_L001_R2_001.fastq.gz");
        assert_eq!(parsed.mate_name(Orientation::I1), "s_S2_L001_I1_001.fastq.gz");

        let leading = parse_read_file("R1.fastq").unwrap();
        assert_eq!(leading.prefix, "");
        assert_eq!(leading.mate_name(Orientation::R2), "R2.fastq");
    }

    #[test]
    fn test_rejects_non_fastq() {
        assert!(parse_read_file("sample_R1.bam").is_err());
        assert!(!is_read_file("notes.txt"));
        assert!(is_read_file("a_R1.fq"));
    }

    #[test]
    fn test_pair_key_respects_delimiter() {
        let a = parse_read_file("a_R1.fq").unwrap();
        let b = parse_read_file("a.R2.fq").unwrap();
        assert_ne!(a.pair_key(), b.pair_key());
    }

    #[test]
    fn test_sample_id_without_layout() {
        let parsed = parse_read_file("plainname_R1.fastq").unwrap();
        assert_eq!(parsed.sample_id(), "plainname");
    }
}
