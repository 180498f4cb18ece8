//! Result files.
//!
//! Each run writes one uniquely named file under
//! `<results-dir>/<metric dir>/`. The first line is a header
//! `<runtime><meta>,<snapshotter>,<iterations>,<unit>`, followed by one
//! sample per line.

use std::fs::DirBuilder;
use std::io::{BufWriter, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rtbench_common::config::Config;
use rtbench_common::error::{BenchError, Result};

/// Which measurement a result file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Per-container memory footprint, in kB.
    Memory,
    /// Create-to-callback latency, in ms.
    Startup,
}

impl Metric {
    /// Subdirectory of the results directory.
    #[must_use]
    pub const fn dir(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Startup => "start",
        }
    }

    /// Leading component of the file name.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        self.dir()
    }

    /// Unit written in the header.
    #[must_use]
    pub const fn unit(self) -> &'static str {
        match self {
            Self::Memory => "kB",
            Self::Startup => "ms",
        }
    }
}

/// A measurement value as written to a result file.
pub trait Sample {
    /// One-line textual form.
    fn render(&self) -> String;
}

impl Sample for f64 {
    fn render(&self) -> String {
        format!("{self:.6}")
    }
}

impl Sample for Duration {
    fn render(&self) -> String {
        self.as_millis().to_string()
    }
}

/// `<runtime><meta>,<snapshotter>,<iterations>,<unit>`
#[must_use]
pub fn header(metric: Metric, config: &Config) -> String {
    format!(
        "{},{},{},{}",
        config.runtime_label(),
        config.snapshotter,
        config.iterations,
        metric.unit()
    )
}

/// `<metric>-<runtime><meta>-<snapshotter>-<iterations>_`
#[must_use]
pub fn file_prefix(metric: Metric, config: &Config) -> String {
    format!(
        "{}-{}-{}-{}_",
        metric.prefix(),
        config.runtime_label(),
        config.snapshotter,
        config.iterations
    )
}

/// Writes `samples` to a new file under `base/<metric dir>` and returns
/// its path.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be created or written.
pub fn write_result<S: Sample>(
    base: &Path,
    metric: Metric,
    config: &Config,
    samples: &[S],
) -> Result<PathBuf> {
    let dir = base.join(metric.dir());
    DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(&dir)
        .map_err(|e| BenchError::io(&dir, e))?;

    let (file, path) = tempfile::Builder::new()
        .prefix(&file_prefix(metric, config))
        .tempfile_in(&dir)
        .and_then(|file| file.keep().map_err(|e| e.error))
        .map_err(|e| BenchError::io(&dir, e))?;

    let mut out = BufWriter::new(file);
    let mut write = || -> std::io::Result<()> {
        writeln!(out, "{}", header(metric, config))?;
        for sample in samples {
            writeln!(out, "{}", sample.render())?;
        }
        out.flush()
    };
    write().map_err(|e| BenchError::io(&path, e))?;

    Ok(path)
}
