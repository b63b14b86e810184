//! Small shared helpers: timestamps, run ids, and read-file naming.

pub mod naming;
pub mod timestamps;

pub use naming::{parse_read_file, Orientation, ReadFileName};
pub use timestamps::{format_iso8601, iso_timestamp, Timestamp};

/// Generates a new, time-ordered run identifier.
#[must_use]
pub fn generate_run_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_run_id_is_valid() {
        let id = generate_run_id();
        let parsed = uuid::Uuid::parse_str(&id).unwrap();
        assert_eq!(parsed.get_version_num(), 7);
    }

    #[test]
    fn test_iso_timestamp_format() {
        let ts = iso_timestamp();
        assert!(ts.contains('T'));
        assert!(ts.contains(':'));
    }
}
