//! Downstream ingest of replayed batches.
//!
//! Dispatch is fire-and-forget by default: the replay scheduler logs a failed
//! [`Sink::send`] and moves to the next offset, so points sent during an ingest
//! outage are lost. Wrap a sink in [`Retry`] to spend a bounded amount of time
//! retrying before giving up.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::debug;

use crate::classify::Batch;

pub mod signalfx;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Sink`] implementations
pub enum Error {
    /// The request did not complete.
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The endpoint rejected the batch.
    #[error("Ingest rejected batch with status {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, for diagnosis
        body: String,
    },
}

/// Accepts batches of datapoints.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Deliver `batch`.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch was not accepted.
    async fn send(&self, batch: &Batch) -> Result<(), Error>;
}

#[async_trait]
impl<T> Sink for Arc<T>
where
    T: Sink + ?Sized,
{
    async fn send(&self, batch: &Batch) -> Result<(), Error> {
        self.as_ref().send(batch).await
    }
}

/// Retries a failed send a fixed number of times, pausing between attempts.
#[derive(Debug, Clone)]
pub struct Retry<S> {
    inner: S,
    retries: u32,
    backoff: Duration,
}

impl<S> Retry<S> {
    /// Create a new [`Retry`] making at most `retries` extra attempts.
    #[must_use]
    pub fn new(inner: S, retries: u32, backoff: Duration) -> Self {
        Self {
            inner,
            retries,
            backoff,
        }
    }
}

#[async_trait]
impl<S> Sink for Retry<S>
where
    S: Sink,
{
    async fn send(&self, batch: &Batch) -> Result<(), Error> {
        let mut attempt = 0;
        loop {
            match self.inner.send(batch).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.retries => {
                    attempt += 1;
                    debug!("send failed, retry {attempt}/{retries}: {err}", retries = self.retries);
                    tokio::time::sleep(self.backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
