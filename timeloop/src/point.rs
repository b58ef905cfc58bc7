//! A single recorded observation.

/// One observation of one metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    /// Source identifier of the metric time series
    pub metric_id: String,
    /// Observed value
    pub value: f64,
    /// Absolute time of the observation, seconds since the unix epoch
    pub timestamp_seconds: i64,
}

impl Point {
    /// Create a new [`Point`].
    #[must_use]
    pub fn new(metric_id: impl Into<String>, value: f64, timestamp_seconds: i64) -> Self {
        Self {
            metric_id: metric_id.into(),
            value,
            timestamp_seconds,
        }
    }
}
