//! Metric metadata persisted alongside recorded data.
//!
//! Metadata is collected from the source catalog once per recording session,
//! written to `metadata.json` and read back, unchanged, by every replay.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Metadata`]
pub enum Error {
    /// Reading or writing the metadata file failed.
    #[error("Metadata file {path:?}: {source}")]
    Io {
        /// The metadata file path
        path: PathBuf,
        /// The underlying IO error
        source: io::Error,
    },
    /// The metadata file is not valid JSON of the expected shape.
    #[error("Metadata file {path:?} is malformed: {source}")]
    Json {
        /// The metadata file path
        path: PathBuf,
        /// The underlying serde error
        source: serde_json::Error,
    },
}

/// The semantics of a metric's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKind {
    /// An instantaneous measurement
    Gauge,
    /// A count of events since the previous report
    Counter,
    /// A monotonically increasing running total
    CumulativeCounter,
}

/// Everything needed to re-emit a metric's points.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MetricMeta {
    /// The kind of the metric
    #[serde(alias = "sf_metricType")]
    pub kind: MetricKind,
    /// The metric name emitted on replay
    #[serde(alias = "sf_metric")]
    pub display_name: String,
    /// Dimensions emitted with every replayed point
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
}

/// Metric metadata keyed by metric id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    inner: FxHashMap<String, MetricMeta>,
}

impl Metadata {
    /// Create an empty [`Metadata`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the metadata for `id`.
    pub fn insert(&mut self, id: impl Into<String>, meta: MetricMeta) {
        self.inner.insert(id.into(), meta);
    }

    /// Look up the metadata for `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&MetricMeta> {
        self.inner.get(id)
    }

    /// Number of known metrics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether no metric is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Every known metric id, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.inner.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Read metadata from `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or is not a JSON object of metric
    /// metadata.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let inner = serde_json::from_str(&contents).map_err(|source| Error::Json {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { inner })
    }

    /// Write metadata to `path`, entries sorted by id.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be written.
    pub fn store(&self, path: &Path) -> Result<(), Error> {
        let sorted: BTreeMap<&String, &MetricMeta> = self.inner.iter().collect();
        let contents = serde_json::to_string_pretty(&sorted).map_err(|source| Error::Json {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, contents).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl FromIterator<(String, MetricMeta)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, MetricMeta)>>(iter: I) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}

impl Extend<(String, MetricMeta)> for Metadata {
    fn extend<I: IntoIterator<Item = (String, MetricMeta)>>(&mut self, iter: I) {
        self.inner.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{Metadata, MetricKind, MetricMeta};

    fn meta(kind: MetricKind, name: &str) -> MetricMeta {
        MetricMeta {
            kind,
            display_name: name.to_string(),
            dimensions: BTreeMap::from([("host".to_string(), "web-1".to_string())]),
        }
    }

    #[test]
    fn store_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("metadata.json");

        let metadata: Metadata = [
            ("b".to_string(), meta(MetricKind::Counter, "requests")),
            ("a".to_string(), meta(MetricKind::Gauge, "cpu.utilization")),
        ]
        .into_iter()
        .collect();
        metadata.store(&path).expect("store");

        let contents = std::fs::read_to_string(&path).expect("read");
        assert!(contents.find("\"a\"") < contents.find("\"b\""));
        assert!(contents.contains("\"kind\": \"COUNTER\""));

        let loaded = Metadata::load(&path).expect("load");
        assert_eq!(loaded, metadata);
        assert_eq!(loaded.ids(), vec!["a", "b"]);
    }

    #[test]
    fn load_accepts_legacy_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("metadata.json");
        std::fs::write(
            &path,
            r#"{"AAAAAKWB2Yo": {"sf_metricType": "CUMULATIVE_COUNTER", "sf_metric": "bytes.sent", "dimensions": {"host": "web-1"}}}"#,
        )
        .expect("write");

        let loaded = Metadata::load(&path).expect("load");
        assert_eq!(
            loaded.get("AAAAAKWB2Yo"),
            Some(&meta(MetricKind::CumulativeCounter, "bytes.sent"))
        );
    }

    #[test]
    fn load_rejects_unknown_kind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("metadata.json");
        std::fs::write(
            &path,
            r#"{"x": {"kind": "HISTOGRAM", "display_name": "latency"}}"#,
        )
        .expect("write");

        assert!(matches!(
            Metadata::load(&path),
            Err(super::Error::Json { .. })
        ));
    }
}
