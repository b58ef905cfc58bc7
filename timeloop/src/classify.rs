//! Sort replayed readings into per-kind batches.
//!
//! Replay re-stamps every reading with the current time: the ingest endpoint
//! sees the data as live.
//!
//! ## Metrics
//!
//! `unknown_metric`: Readings dropped because their metric has no metadata
//!

use std::collections::BTreeMap;

use metrics::counter;
use serde::Serialize;
use tracing::warn;

use crate::{
    metadata::{Metadata, MetricKind},
    slot::Reading,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Errors produced by [`datapoint`]
pub enum Error {
    /// The reading's metric id is absent from the metadata.
    #[error("No metadata for metric {0}")]
    UnknownMetric(String),
}

/// A dispatch-ready datapoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Datapoint {
    /// Metric name
    pub metric: String,
    /// Value
    pub value: f64,
    /// Milliseconds since the unix epoch
    pub timestamp: i64,
    /// Dimensions of the metric time series
    pub dimensions: BTreeMap<String, String>,
}

/// Datapoints grouped by metric kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Batch {
    /// Gauge datapoints
    #[serde(rename = "gauge")]
    pub gauges: Vec<Datapoint>,
    /// Counter datapoints
    #[serde(rename = "counter")]
    pub counters: Vec<Datapoint>,
    /// Cumulative counter datapoints
    #[serde(rename = "cumulative_counter")]
    pub cumulative_counters: Vec<Datapoint>,
}

impl Batch {
    /// Add `point` to the bucket of `kind`.
    pub fn push(&mut self, kind: MetricKind, point: Datapoint) {
        match kind {
            MetricKind::Gauge => self.gauges.push(point),
            MetricKind::Counter => self.counters.push(point),
            MetricKind::CumulativeCounter => self.cumulative_counters.push(point),
        }
    }

    /// Total number of datapoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.gauges.len() + self.counters.len() + self.cumulative_counters.len()
    }

    /// Whether the batch holds no datapoints.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build the datapoint for one reading, stamped `now_ms`.
///
/// # Errors
///
/// Returns [`Error::UnknownMetric`] if `metadata` has no entry for the reading.
pub fn datapoint(
    reading: &Reading,
    metadata: &Metadata,
    now_ms: i64,
) -> Result<(MetricKind, Datapoint), Error> {
    let meta = metadata
        .get(&reading.id)
        .ok_or_else(|| Error::UnknownMetric(reading.id.clone()))?;
    Ok((
        meta.kind,
        Datapoint {
            metric: meta.display_name.clone(),
            value: reading.value,
            timestamp: now_ms,
            dimensions: meta.dimensions.clone(),
        },
    ))
}

/// Classify every reading. Readings of unknown metrics are logged, counted
/// and left out.
#[must_use]
pub fn classify(readings: &[Reading], metadata: &Metadata, now_ms: i64) -> Batch {
    let mut batch = Batch::default();
    for reading in readings {
        match datapoint(reading, metadata, now_ms) {
            Ok((kind, point)) => batch.push(kind, point),
            Err(err) => {
                warn!("dropping reading: {err}");
                counter!("unknown_metric").increment(1);
            }
        }
    }
    batch
}
