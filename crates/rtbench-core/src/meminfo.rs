//! Host memory accounting via `/proc/meminfo`.
//!
//! Used memory is defined as `MemTotal - MemAvailable`, both in kB as
//! reported by the kernel.

use std::path::PathBuf;

use rtbench_common::constants::MEMINFO_PATH;
use rtbench_common::error::{BenchError, Result};

/// The two `/proc/meminfo` fields the harness consumes, in kB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    /// `MemTotal:` value.
    pub total_kb: u64,
    /// `MemAvailable:` value.
    pub available_kb: u64,
}

impl MemInfo {
    /// Memory currently in use, in kB.
    #[must_use]
    pub const fn used_kb(&self) -> u64 {
        self.total_kb.saturating_sub(self.available_kb)
    }
}

/// Parses the text of `/proc/meminfo`.
///
/// Other lines are ignored and the two fields may appear in any order.
///
/// # Errors
///
/// Returns an error if either field is missing or not an integer.
pub fn parse_meminfo(content: &str) -> Result<MemInfo> {
    let mut total = None;
    let mut available = None;

    for line in content.lines() {
        let slot = if line.starts_with("MemTotal:") {
            &mut total
        } else if line.starts_with("MemAvailable:") {
            &mut available
        } else {
            continue;
        };
        *slot = Some(parse_field(line)?);
        if total.is_some() && available.is_some() {
            break;
        }
    }

    match (total, available) {
        (Some(total_kb), Some(available_kb)) => Ok(MemInfo {
            total_kb,
            available_kb,
        }),
        (None, _) => Err(missing("MemTotal")),
        (_, None) => Err(missing("MemAvailable")),
    }
}

fn parse_field(line: &str) -> Result<u64> {
    let value = line.split_whitespace().nth(1).ok_or_else(|| BenchError::Parse {
        what: "/proc/meminfo",
        message: format!("line has no value: {line}"),
    })?;
    value.parse().map_err(|e| BenchError::Parse {
        what: "/proc/meminfo",
        message: format!("{line}: {e}"),
    })
}

fn missing(field: &str) -> BenchError {
    BenchError::Parse {
        what: "/proc/meminfo",
        message: format!("{field} field not found"),
    }
}

/// Source of used-memory samples.
pub trait MemorySource: Send + Sync {
    /// Returns the host's used memory in kB.
    ///
    /// # Errors
    ///
    /// Returns an error if the sample cannot be taken.
    fn used_kb(&self) -> Result<u64>;
}

/// Samples memory from a meminfo file, `/proc/meminfo` by default.
#[derive(Debug, Clone)]
pub struct ProcMeminfo {
    path: PathBuf,
}

impl ProcMeminfo {
    /// Reads from an alternative meminfo-formatted file.
    #[must_use]
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Reads and parses the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or malformed.
    pub fn read(&self) -> Result<MemInfo> {
        let content =
            std::fs::read_to_string(&self.path).map_err(|e| BenchError::io(&self.path, e))?;
        parse_meminfo(&content)
    }
}

impl Default for ProcMeminfo {
    fn default() -> Self {
        Self::with_path(MEMINFO_PATH)
    }
}

impl MemorySource for ProcMeminfo {
    fn used_kb(&self) -> Result<u64> {
        let info = self.read()?;
        tracing::debug!(
            total_kb = info.total_kb,
            available_kb = info.available_kb,
            "sampled meminfo"
        );
        Ok(info.used_kb())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
MemTotal:       16303036 kB
MemFree:         1190860 kB
MemAvailable:    9829012 kB
Buffers:          638412 kB
Cached:          7602632 kB
";

    #[test]
    fn used_is_total_minus_available() {
        let info = parse_meminfo(SAMPLE).unwrap();
        assert_eq!(info.total_kb, 16_303_036);
        assert_eq!(info.available_kb, 9_829_012);
        assert_eq!(info.used_kb(), 6_474_024);
    }

    #[test]
    fn fields_may_appear_in_any_order() {
        let input = "Cached: 1 kB\nMemAvailable: 250 kB\nSwapTotal: 0 kB\nMemTotal: 1000 kB\n";
        assert_eq!(parse_meminfo(input).unwrap().used_kb(), 750);
    }

    #[test]
    fn missing_available_is_an_error() {
        let err = parse_meminfo("MemTotal: 1000 kB\nMemFree: 10 kB\n").unwrap_err();
        assert!(err.to_string().contains("MemAvailable"));
    }

    #[test]
    fn non_numeric_value_is_an_error() {
        let input = "MemTotal: lots kB\nMemAvailable: 1 kB\n";
        assert!(parse_meminfo(input).is_err());
    }

    #[test]
    fn proc_meminfo_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meminfo");
        std::fs::write(&path, SAMPLE).unwrap();

        let source = ProcMeminfo::with_path(&path);
        assert_eq!(source.used_kb().unwrap(), 6_474_024);
    }

    #[test]
    fn proc_meminfo_missing_file_is_io_error() {
        let source = ProcMeminfo::with_path("/nonexistent/meminfo");
        assert!(matches!(source.used_kb(), Err(BenchError::Io { .. })));
    }
}
