//! Upstream collaborators used while recording.
//!
//! A [`Catalog`] resolves query expressions to the metrics they match. A
//! [`Source`] serves the raw samples of one metric over a millisecond window.
//! The [`signalfx`] module speaks both over HTTP.

use async_trait::async_trait;

use crate::metadata::{MetricKind, MetricMeta};

pub mod signalfx;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Source`] and [`Catalog`] implementations
pub enum Error {
    /// The store cannot serve the requested window in one call. Callers may
    /// retry with a narrower window.
    #[error("Requested range is too large for the source")]
    RangeTooLarge,
    /// The request did not complete.
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The server answered with an unexpected status.
    #[error("Unexpected status {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, for diagnosis
        body: String,
    },
    /// The server answered with a body of unexpected shape.
    #[error("Malformed response: {0}")]
    Response(String),
}

/// How the source aggregates samples when it downsamples a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rollup {
    /// Mean of the samples
    Average,
    /// Sum of the samples
    Sum,
    /// Largest sample
    Max,
}

impl Rollup {
    /// Query parameter value for this rollup.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Rollup::Average => "average",
            Rollup::Sum => "sum",
            Rollup::Max => "max",
        }
    }
}

impl From<MetricKind> for Rollup {
    fn from(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Gauge => Rollup::Average,
            MetricKind::Counter => Rollup::Sum,
            MetricKind::CumulativeCounter => Rollup::Max,
        }
    }
}

/// One raw sample as served by a [`Source`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Milliseconds since the unix epoch
    pub timestamp_ms: i64,
    /// Sample value
    pub value: f64,
}

/// A time series store.
#[async_trait]
pub trait Source: Send + Sync {
    /// Samples of `metric_id` with `start_ms <= timestamp < end_ms`, in time
    /// order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RangeTooLarge`] when the window must be narrowed, any
    /// other variant when the metric cannot be served at all.
    async fn query(
        &self,
        metric_id: &str,
        rollup: Rollup,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Sample>, Error>;
}

/// A metric metadata catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Every metric matched by `query`, with its metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be queried.
    async fn lookup(&self, query: &str) -> Result<Vec<(String, MetricMeta)>, Error>;
}
