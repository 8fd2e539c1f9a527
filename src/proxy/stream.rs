use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, StatusCode};
use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use tracing::{error, info};

use crate::cache::{CachedResponse, ResponseCache};
use crate::observability::metrics;

/// Pending cache insertion riding along with the client stream. Chunks are
/// buffered as they pass through; a body that outgrows `max_bytes` drops the
/// buffer and the insertion with it.
pub(crate) struct CacheWrite {
    cache: Arc<ResponseCache>,
    key: String,
    status: StatusCode,
    headers: HeaderMap,
    ttl: Duration,
    max_bytes: usize,
    buf: BytesMut,
    overflowed: bool,
}

impl CacheWrite {
    pub(crate) fn new(
        cache: Arc<ResponseCache>,
        key: String,
        status: StatusCode,
        headers: HeaderMap,
        ttl: Duration,
        max_bytes: usize,
    ) -> Self {
        Self {
            cache,
            key,
            status,
            headers,
            ttl,
            max_bytes,
            buf: BytesMut::new(),
            overflowed: false,
        }
    }

    fn observe(&mut self, chunk: &Bytes) {
        if self.overflowed {
            return;
        }
        if self.buf.len() + chunk.len() > self.max_bytes {
            self.overflowed = true;
            self.buf = BytesMut::new();
            return;
        }
        self.buf.extend_from_slice(chunk);
    }

    fn commit(self) {
        if self.overflowed {
            return;
        }
        self.cache.set(
            &self.key,
            CachedResponse {
                status: self.status,
                headers: self.headers,
                body: self.buf.freeze(),
                expires_at: Some(Instant::now() + self.ttl),
            },
        );
    }
}

/// Bookkeeping emitted once the body finishes streaming: the request metric
/// and the access log line, with a duration that covers the full transfer.
pub(crate) struct RequestOutcome {
    pub route: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub cache_enabled: bool,
    pub started: Instant,
}

/// Relays the upstream body to the client chunk by chunk. When a cache write
/// is attached, chunks are teed into its buffer and the entry is inserted on
/// clean completion. The client stream is never delayed by the tee.
pub(crate) struct RelayBody {
    inner: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    cache_write: Option<CacheWrite>,
    outcome: Option<RequestOutcome>,
}

impl RelayBody {
    pub(crate) fn new(
        inner: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
        cache_write: Option<CacheWrite>,
        outcome: RequestOutcome,
    ) -> Self {
        Self {
            inner: Box::pin(inner),
            cache_write,
            outcome: Some(outcome),
        }
    }

    fn finish(&mut self, clean: bool) {
        let Some(outcome) = self.outcome.take() else { return };
        let duration = outcome.started.elapsed();

        metrics::observe_request(&outcome.route, &outcome.method, outcome.status, duration);

        if clean {
            info!(
                method = %outcome.method,
                path = %outcome.path,
                status = outcome.status,
                upstream = %outcome.route,
                cache_enabled = outcome.cache_enabled,
                duration_ms = duration.as_millis() as u64,
                "proxy request"
            );
            if let Some(write) = self.cache_write.take() {
                write.commit();
            }
        } else {
            error!(
                method = %outcome.method,
                path = %outcome.path,
                status = outcome.status,
                upstream = %outcome.route,
                duration_ms = duration.as_millis() as u64,
                "response stream aborted"
            );
            self.cache_write = None;
        }
    }
}

impl Stream for RelayBody {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(write) = this.cache_write.as_mut() {
                    write.observe(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.finish(false);
                Poll::Ready(Some(Err(io::Error::new(io::ErrorKind::Other, err))))
            }
            Poll::Ready(None) => {
                this.finish(true);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RelayBody {
    fn drop(&mut self) {
        // Client went away mid-stream: record the request, skip the cache.
        self.finish(false);
    }
}
