//! Failure adaptive range fetching.
//!
//! A source store may refuse to serve a wide window in one call. The
//! [`RangeFetcher`] answers that by halving the window and fetching each half,
//! repeatedly, until every piece is served or a piece one second wide is still
//! refused.
//!
//! ## Metrics
//!
//! `range_split`: Number of times a window was halved
//!

use metrics::counter;
use tracing::{debug, warn};

use crate::{
    metadata::MetricKind,
    point::Point,
    source::{self, Rollup, Source},
};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`RangeFetcher`]
pub enum Error {
    /// The source could not serve a piece of the window.
    #[error("Source unavailable for {metric_id} over [{start}, {end}): {source}")]
    SourceUnavailable {
        /// The metric being fetched
        metric_id: String,
        /// Start of the failing piece, seconds
        start: i64,
        /// End of the failing piece, seconds, exclusive
        end: i64,
        /// The last error returned by the source
        source: source::Error,
    },
}

/// Downloads the points of one metric over a window of seconds.
#[derive(Debug)]
pub struct RangeFetcher<'a, S: ?Sized> {
    source: &'a S,
}

impl<'a, S> RangeFetcher<'a, S>
where
    S: Source + ?Sized,
{
    /// Create a new [`RangeFetcher`] reading from `source`.
    #[must_use]
    pub fn new(source: &'a S) -> Self {
        Self { source }
    }

    /// Every point of `metric_id` in `[start, end)`, in time order.
    ///
    /// The source is asked for the whole window first. A refusal splits the
    /// window at its midpoint and the left half is fetched before the right
    /// one. Samples the source returns outside the asked window are dropped,
    /// so a sample on a split boundary is reported exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SourceUnavailable`] when the source fails for any
    /// reason other than the window size, or when a one second window is still
    /// too large.
    pub async fn fetch(
        &self,
        metric_id: &str,
        start: i64,
        end: i64,
        kind: MetricKind,
    ) -> Result<Vec<Point>, Error> {
        let rollup = Rollup::from(kind);
        let mut points = Vec::new();
        // Right halves are pushed first so the left half pops first.
        let mut pending = vec![(start, end)];

        while let Some((lo, hi)) = pending.pop() {
            if hi - lo < 1 {
                continue;
            }
            let (lo_ms, hi_ms) = (lo * 1000, hi * 1000);
            match self.source.query(metric_id, rollup, lo_ms, hi_ms).await {
                Ok(samples) => {
                    debug!("{metric_id}: {count} samples in [{lo}, {hi})", count = samples.len());
                    points.extend(
                        samples
                            .into_iter()
                            .filter(|sample| (lo_ms..hi_ms).contains(&sample.timestamp_ms))
                            .map(|sample| Point {
                                metric_id: metric_id.to_string(),
                                value: sample.value,
                                timestamp_seconds: sample.timestamp_ms.div_euclid(1000),
                            }),
                    );
                }
                Err(source::Error::RangeTooLarge) if hi - lo > 1 => {
                    let mid = (lo + hi).div_euclid(2);
                    debug!("{metric_id}: splitting [{lo}, {hi}) at {mid}");
                    counter!("range_split").increment(1);
                    pending.push((mid, hi));
                    pending.push((lo, mid));
                }
                Err(source) => {
                    warn!("{metric_id}: source failed over [{lo}, {hi}): {source}");
                    return Err(Error::SourceUnavailable {
                        metric_id: metric_id.to_string(),
                        start: lo,
                        end: hi,
                        source,
                    });
                }
            }
        }

        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{Error, RangeFetcher};
    use crate::{
        metadata::MetricKind,
        source::{self, Rollup, Sample, Source},
    };

    /// Serves one sample per second, refusing any window wider than
    /// `max_width_ms`.
    struct Refusing {
        max_width_ms: i64,
        calls: Mutex<Vec<(i64, i64)>>,
    }

    impl Refusing {
        fn new(max_width_ms: i64) -> Self {
            Self {
                max_width_ms,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Source for Refusing {
        async fn query(
            &self,
            _metric_id: &str,
            rollup: Rollup,
            start_ms: i64,
            end_ms: i64,
        ) -> Result<Vec<Sample>, source::Error> {
            assert_eq!(rollup, Rollup::Max);
            self.calls.lock().expect("lock").push((start_ms, end_ms));
            if end_ms - start_ms > self.max_width_ms {
                return Err(source::Error::RangeTooLarge);
            }
            // Inclusive of the end, like a store with closed windows.
            Ok((start_ms / 1000..=end_ms / 1000)
                .map(|s| Sample {
                    timestamp_ms: s * 1000,
                    value: s as f64,
                })
                .collect())
        }
    }

    struct Broken;

    #[async_trait]
    impl Source for Broken {
        async fn query(
            &self,
            _metric_id: &str,
            _rollup: Rollup,
            _start_ms: i64,
            _end_ms: i64,
        ) -> Result<Vec<Sample>, source::Error> {
            Err(source::Error::Response("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn splits_until_served_and_keeps_order() {
        let source = Refusing::new(1000);
        let fetcher = RangeFetcher::new(&source);

        let points = fetcher
            .fetch("m", 0, 1000, MetricKind::CumulativeCounter)
            .await
            .expect("fetch");

        let timestamps: Vec<i64> = points.iter().map(|p| p.timestamp_seconds).collect();
        assert_eq!(timestamps, (0..1000).collect::<Vec<_>>());
        assert!(points.iter().all(|p| p.metric_id == "m"));
        assert!(
            source
                .calls
                .lock()
                .expect("lock")
                .iter()
                .all(|(lo, hi)| hi > lo)
        );
    }

    #[tokio::test]
    async fn whole_window_when_not_refused() {
        let source = Refusing::new(i64::MAX);
        let fetcher = RangeFetcher::new(&source);

        let points = fetcher
            .fetch("m", 100, 110, MetricKind::CumulativeCounter)
            .await
            .expect("fetch");
        assert_eq!(points.len(), 10);
        assert_eq!(source.calls.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn degenerate_window_is_empty() {
        let fetcher = RangeFetcher::new(&Broken);
        let points = fetcher
            .fetch("m", 50, 50, MetricKind::Gauge)
            .await
            .expect("fetch");
        assert!(points.is_empty());
    }

    #[tokio::test]
    async fn one_second_refusal_is_unavailable() {
        let source = Refusing::new(0);
        let fetcher = RangeFetcher::new(&source);

        let result = fetcher
            .fetch("m", 0, 8, MetricKind::CumulativeCounter)
            .await;
        assert!(matches!(
            result,
            Err(Error::SourceUnavailable {
                start: 0,
                end: 1,
                source: source::Error::RangeTooLarge,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let fetcher = RangeFetcher::new(&Broken);
        let result = fetcher.fetch("m", 0, 1000, MetricKind::Counter).await;
        assert!(matches!(
            result,
            Err(Error::SourceUnavailable {
                start: 0,
                end: 1000,
                source: source::Error::Response(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn sub_second_samples_are_floored() {
        struct Fractional;

        #[async_trait]
        impl Source for Fractional {
            async fn query(
                &self,
                _metric_id: &str,
                _rollup: Rollup,
                start_ms: i64,
                _end_ms: i64,
            ) -> Result<Vec<Sample>, source::Error> {
                Ok(vec![Sample {
                    timestamp_ms: start_ms + 999,
                    value: 1.0,
                }])
            }
        }

        let points = RangeFetcher::new(&Fractional)
            .fetch("m", -5, 5, MetricKind::Gauge)
            .await
            .expect("fetch");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].timestamp_seconds, -5);
    }
}
