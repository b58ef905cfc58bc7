//! HTTP ingest speaking the SignalFx datapoint API.

use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use super::{Error, Sink};
use crate::classify::Batch;

/// Time allowed for one request unless configured otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts batches to `<endpoint>/v2/datapoint`.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    token: String,
    timeout: Duration,
}

impl HttpSink {
    /// Create a new [`HttpSink`] for the ingest `endpoint`, for instance
    /// `https://ingest.signalfx.com`.
    #[must_use]
    pub fn new(endpoint: &str, token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}/v2/datapoint", endpoint.trim_end_matches('/')),
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
impl Sink for HttpSink {
    async fn send(&self, batch: &Batch) -> Result<(), Error> {
        if batch.is_empty() {
            return Ok(());
        }
        let response = self
            .client
            .post(&self.url)
            .header("X-SF-TOKEN", &self.token)
            .timeout(self.timeout)
            .json(batch)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Status {
                status: status.as_u16(),
                body,
            });
        }
        trace!("sent {count} datapoints", count = batch.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use serde_json::Value;
    use warp::{Filter, http::StatusCode};

    use super::HttpSink;
    use crate::{
        classify::{Batch, Datapoint},
        metadata::MetricKind,
        sink::{Error, Sink},
    };

    fn batch() -> Batch {
        let mut batch = Batch::default();
        batch.push(
            MetricKind::Gauge,
            Datapoint {
                metric: "cpu".to_string(),
                value: 0.5,
                timestamp: 1_000,
                dimensions: BTreeMap::new(),
            },
        );
        batch
    }

    #[tokio::test]
    async fn posts_batch_with_token() {
        let received: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&received);
        let route = warp::post()
            .and(warp::path!("v2" / "datapoint"))
            .and(warp::header::<String>("x-sf-token"))
            .and(warp::body::json())
            .map(move |token: String, body: Value| {
                assert_eq!(token, "ingest-token");
                captured.lock().expect("lock").push(body);
                warp::reply()
            });
        let (addr, serve_fut) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(serve_fut);

        let sink = HttpSink::new(&format!("http://{addr}/"), "ingest-token");
        sink.send(&batch()).await.expect("send");
        sink.send(&Batch::default()).await.expect("empty send");

        let received = received.lock().expect("lock");
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["gauge"][0]["metric"], "cpu");
        assert_eq!(received[0]["counter"], Value::Array(Vec::new()));
    }

    #[tokio::test]
    async fn rejected_batch_is_an_error() {
        let route = warp::path!("v2" / "datapoint")
            .map(|| warp::reply::with_status("bad token", StatusCode::UNAUTHORIZED));
        let (addr, serve_fut) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(serve_fut);

        let sink = HttpSink::new(&format!("http://{addr}"), "wrong");
        let result = sink.send(&batch()).await;
        assert!(matches!(result, Err(Error::Status { status: 401, .. })));
    }

    #[tokio::test]
    async fn stalled_endpoint_times_out() {
        let route = warp::path!("v2" / "datapoint").and_then(|| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, warp::Rejection>(warp::reply())
        });
        let (addr, serve_fut) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(serve_fut);

        let sink = HttpSink::new(&format!("http://{addr}"), "token")
            .with_timeout(Duration::from_millis(50));
        let result = tokio::time::timeout(Duration::from_secs(5), sink.send(&batch()))
            .await
            .expect("request outlived its timeout");
        assert!(matches!(result, Err(Error::Http(ref err)) if err.is_timeout()));
    }
}
