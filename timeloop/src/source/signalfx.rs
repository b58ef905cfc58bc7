//! HTTP source and catalog speaking the SignalFx JSON API.
//!
//! Every request carries the recording token in the `X-SF-TOKEN` header. The
//! time series endpoint answers `413 Payload Too Large` when a window holds
//! more samples than it will return at once, which maps to
//! [`Error::RangeTooLarge`].

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use reqwest::StatusCode;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::{Catalog, Error, Rollup, Sample, Source};
use crate::metadata::{MetricKind, MetricMeta};

const TOKEN_HEADER: &str = "X-SF-TOKEN";

/// Time allowed for one request unless configured otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct WindowResponse {
    #[serde(default)]
    data: FxHashMap<String, Vec<(i64, Option<f64>)>>,
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    rs: Vec<Map<String, Value>>,
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, Error> {
    let status = response.status();
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        return Err(Error::RangeTooLarge);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

/// Reads metric time series from a SignalFx time series server.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
    server: String,
    token: String,
    timeout: Duration,
}

impl HttpSource {
    /// Create a new [`HttpSource`] against `server`, for instance
    /// `https://api.signalfx.com`.
    #[must_use]
    pub fn new(server: &str, token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            server: server.trim_end_matches('/').to_string(),
            token: token.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Give up on any request that takes longer than `timeout`.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }
}

#[async_trait]
impl Source for HttpSource {
    async fn query(
        &self,
        metric_id: &str,
        rollup: Rollup,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Sample>, Error> {
        let url = format!("{}/v1/timeserieswindow", self.server);
        debug!("querying {metric_id} over [{start_ms}, {end_ms})");
        let response = self
            .client
            .get(&url)
            .header(TOKEN_HEADER, &self.token)
            .timeout(self.timeout)
            .query(&[
                ("query", format!("sf_tsid:{metric_id}")),
                ("startMs", start_ms.to_string()),
                ("endMs", end_ms.to_string()),
                ("rollup", rollup.as_str().to_string()),
            ])
            .send()
            .await?;
        let mut window: WindowResponse = check(response).await?.json().await?;

        let mut samples: Vec<Sample> = window
            .data
            .remove(metric_id)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(timestamp_ms, value)| {
                value.map(|value| Sample {
                    timestamp_ms,
                    value,
                })
            })
            .collect();
        samples.sort_by_key(|sample| sample.timestamp_ms);
        Ok(samples)
    }
}

/// Resolves query expressions through the SignalFx metric time series API.
#[derive(Debug, Clone)]
pub struct HttpCatalog {
    client: reqwest::Client,
    server: String,
    token: String,
    timeout: Duration,
}

impl HttpCatalog {
    /// Create a new [`HttpCatalog`] against `server`.
    #[must_use]
    pub fn new(server: &str, token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            server: server.trim_end_matches('/').to_string(),
            token: token.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Give up on any request that takes longer than `timeout`.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }
}

fn metric_meta(mut raw: Map<String, Value>) -> Result<(String, MetricMeta), Error> {
    let id = match raw.remove("sf_id") {
        Some(Value::String(id)) => id,
        Some(Value::Number(id)) => id.to_string(),
        _ => return Err(Error::Response("metric without sf_id".to_string())),
    };
    let kind: MetricKind = raw
        .remove("sf_metricType")
        .map(serde_json::from_value)
        .transpose()
        .map_err(|err| Error::Response(format!("metric {id}: {err}")))?
        .ok_or_else(|| Error::Response(format!("metric {id} without sf_metricType")))?;
    let display_name = match raw.remove("sf_metric") {
        Some(Value::String(name)) => name,
        _ => return Err(Error::Response(format!("metric {id} without sf_metric"))),
    };
    let dimensions: BTreeMap<String, String> = raw
        .into_iter()
        .filter(|(key, _)| !key.starts_with("sf") && !key.starts_with("_sf"))
        .map(|(key, value)| match value {
            Value::String(value) => (key, value),
            other => (key, other.to_string()),
        })
        .collect();
    Ok((
        id,
        MetricMeta {
            kind,
            display_name,
            dimensions,
        },
    ))
}

#[async_trait]
impl Catalog for HttpCatalog {
    async fn lookup(&self, query: &str) -> Result<Vec<(String, MetricMeta)>, Error> {
        let url = format!("{}/v1/metrictimeseries", self.server);
        let response = self
            .client
            .get(&url)
            .header(TOKEN_HEADER, &self.token)
            .timeout(self.timeout)
            .query(&[("query", query)])
            .send()
            .await?;
        let body: CatalogResponse = check(response).await?.json().await?;
        body.rs.into_iter().map(metric_meta).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use serde_json::json;
    use warp::{Filter, http::StatusCode};

    use super::{HttpCatalog, HttpSource};
    use crate::{
        metadata::MetricKind,
        source::{Catalog, Error, Rollup, Sample, Source},
    };

    // Spawns `routes` on an ephemeral port and evaluates to its base url.
    macro_rules! serve {
        ($routes:expr) => {{
            let (addr, serve_fut) = warp::serve($routes).bind_ephemeral(([127, 0, 0, 1], 0));
            tokio::spawn(serve_fut);
            format!("http://{addr}")
        }};
    }

    fn window_route() -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone
    {
        warp::path!("v1" / "timeserieswindow")
            .and(warp::header::<String>("x-sf-token"))
            .and(warp::query::<HashMap<String, String>>())
            .map(|token: String, params: HashMap<String, String>| {
                assert_eq!(token, "secret");
                assert_eq!(params["query"], "sf_tsid:cpu");
                assert_eq!(params["rollup"], "average");
                let start: i64 = params["startMs"].parse().expect("startMs");
                let end: i64 = params["endMs"].parse().expect("endMs");
                if end - start > 10_000 {
                    return warp::reply::with_status(
                        warp::reply::json(&json!({"message": "too many points"})),
                        StatusCode::PAYLOAD_TOO_LARGE,
                    );
                }
                warp::reply::with_status(
                    warp::reply::json(&json!({
                        "data": {"cpu": [[start + 2000, 2.5], [start, 1.5], [start + 1000, null]]}
                    })),
                    StatusCode::OK,
                )
            })
    }

    #[tokio::test]
    async fn source_reads_window() {
        let server = serve!(window_route());
        let source = HttpSource::new(&server, "secret");

        let samples = source
            .query("cpu", Rollup::Average, 1_000, 5_000)
            .await
            .expect("query");
        assert_eq!(
            samples,
            vec![
                Sample {
                    timestamp_ms: 1_000,
                    value: 1.5
                },
                Sample {
                    timestamp_ms: 3_000,
                    value: 2.5
                },
            ]
        );
    }

    #[tokio::test]
    async fn source_maps_payload_too_large() {
        let server = serve!(window_route());
        let source = HttpSource::new(&server, "secret");

        let result = source.query("cpu", Rollup::Average, 0, 60_000).await;
        assert!(matches!(result, Err(Error::RangeTooLarge)));
    }

    #[tokio::test]
    async fn source_reports_other_statuses() {
        let route = warp::path!("v1" / "timeserieswindow").map(|| {
            warp::reply::with_status("nope", StatusCode::UNAUTHORIZED)
        });
        let server = serve!(route);
        let source = HttpSource::new(&server, "wrong");

        let result = source.query("cpu", Rollup::Sum, 0, 1_000).await;
        assert!(matches!(result, Err(Error::Status { status: 401, .. })));
    }

    #[tokio::test]
    async fn stalled_server_times_out() {
        let route = warp::path!("v1" / "timeserieswindow").and_then(|| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, warp::Rejection>(warp::reply())
        });
        let server = serve!(route);
        let source = HttpSource::new(&server, "secret").with_timeout(Duration::from_millis(50));

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            source.query("cpu", Rollup::Sum, 0, 1_000),
        )
        .await
        .expect("request outlived its timeout");
        assert!(matches!(result, Err(Error::Http(ref err)) if err.is_timeout()));
    }

    #[tokio::test]
    async fn catalog_lookup_filters_dimensions() {
        let route = warp::path!("v1" / "metrictimeseries")
            .and(warp::query::<HashMap<String, String>>())
            .map(|params: HashMap<String, String>| {
                assert_eq!(params["query"], "sf_metric:requests AND host:web-*");
                warp::reply::json(&json!({
                    "count": 1,
                    "rs": [{
                        "sf_id": "AAAAAKWB2Yo",
                        "sf_metricType": "COUNTER",
                        "sf_metric": "requests",
                        "sf_createdOnMs": 1_500_000_000_000_i64,
                        "_sf_organizationID": "org",
                        "host": "web-1",
                        "region": "us-west-2"
                    }]
                }))
            });
        let server = serve!(route);
        let catalog = HttpCatalog::new(&server, "secret");

        let found = catalog
            .lookup("sf_metric:requests AND host:web-*")
            .await
            .expect("lookup");
        assert_eq!(found.len(), 1);
        let (id, meta) = &found[0];
        assert_eq!(id, "AAAAAKWB2Yo");
        assert_eq!(meta.kind, MetricKind::Counter);
        assert_eq!(meta.display_name, "requests");
        assert_eq!(
            meta.dimensions.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["host", "region"]
        );
    }
}
