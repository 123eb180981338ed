//! Sample files.
//!
//! Acquisitions are written as CSV: the metadata first, as `# `-prefixed
//! pretty JSON lines, then an `index,value` header and one row per sample.
//! File names carry the sweep parameters they were taken at, e.g.
//! `ti_bias-0p1_temp-m5.csv`.

use crate::session::{MeasurementOptions, MeasurementProfile};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Descriptive header written at the top of every sample file.
#[derive(Debug, Clone, Serialize)]
pub struct SampleMetadata {
    pub profile: MeasurementProfile,
    pub unit: String,
    pub resource: String,
    pub identity: Option<String>,
    pub options: MeasurementOptions,
    pub params: BTreeMap<String, f64>,
    pub created_at: DateTime<Utc>,
}

impl SampleMetadata {
    pub fn new(profile: MeasurementProfile, resource: &str, options: MeasurementOptions) -> Self {
        Self {
            profile,
            unit: profile.unit().to_string(),
            resource: resource.to_string(),
            identity: None,
            options,
            params: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }
}

/// Build `prefix_key1-val1_key2-val2.ext`.
///
/// Values are written compactly: `.` becomes `p` and a leading `-` becomes
/// `m`, so `-0.1` reads `m0p1`. Characters unsafe in file names are replaced
/// with `_`.
pub fn sweep_file_name<'a, I>(prefix: &str, params: I, ext: &str) -> String
where
    I: IntoIterator<Item = (&'a str, f64)>,
{
    let mut name = sanitize(prefix);
    for (key, value) in params {
        name.push('_');
        name.push_str(&sanitize(key));
        name.push('-');
        name.push_str(&compact_value(value));
    }
    let ext = ext.trim_start_matches('.');
    if !ext.is_empty() {
        name.push('.');
        name.push_str(&sanitize(ext));
    }
    name
}

fn compact_value(value: f64) -> String {
    value.to_string().replace('-', "m").replace('.', "p")
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::SampleMetadata;
    use crate::error::RelayResult;
    use std::fs::{self, File};
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use tracing::info;

    /// Streams samples of one acquisition into a CSV file.
    pub struct SampleWriter {
        path: PathBuf,
        writer: csv::Writer<File>,
        rows: usize,
    }

    impl SampleWriter {
        /// Create the file (and its directory) and write the metadata header.
        pub fn create(path: impl AsRef<Path>, metadata: &SampleMetadata) -> RelayResult<Self> {
            let path = path.as_ref().to_path_buf();
            if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                fs::create_dir_all(dir)?;
            }

            let mut file = File::create(&path)?;
            let json_string = serde_json::to_string_pretty(metadata)?;
            for line in json_string.lines() {
                file.write_all(b"# ")?;
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
            }

            let mut writer = csv::Writer::from_writer(file);
            writer.write_record(["index", "value"])?;

            info!(path = %path.display(), "Sample file created");
            Ok(Self {
                path,
                writer,
                rows: 0,
            })
        }

        /// File being written.
        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Append samples; indices continue across calls.
        pub fn write_samples(&mut self, samples: &[f64]) -> RelayResult<()> {
            for sample in samples {
                self.writer
                    .write_record([self.rows.to_string(), sample.to_string()])?;
                self.rows += 1;
            }
            Ok(())
        }

        /// Flush and close, returning the number of rows written.
        pub fn finish(mut self) -> RelayResult<usize> {
            self.writer.flush()?;
            info!(path = %self.path.display(), rows = self.rows, "Sample file closed");
            Ok(self.rows)
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::SampleMetadata;
    use crate::error::{RelayError, RelayResult};
    use std::path::Path;

    pub struct SampleWriter;

    impl SampleWriter {
        pub fn create(_path: impl AsRef<Path>, _metadata: &SampleMetadata) -> RelayResult<Self> {
            Err(RelayError::FeatureNotEnabled("storage_csv".to_string()))
        }

        pub fn path(&self) -> &Path {
            Path::new("")
        }

        pub fn write_samples(&mut self, _samples: &[f64]) -> RelayResult<()> {
            Err(RelayError::FeatureNotEnabled("storage_csv".to_string()))
        }

        pub fn finish(self) -> RelayResult<usize> {
            Err(RelayError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::SampleWriter;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::SampleWriter;
