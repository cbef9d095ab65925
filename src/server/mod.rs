use std::convert::Infallible;
use std::fmt::Debug;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use opentelemetry::trace::TraceContextExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::pin;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::metrics_provider::{IN_FLIGHT_REQUESTS, METRICS_PROVIDER};
use crate::proxy::{Proxy, ProxyBody};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub mod lifecycle;
pub mod listener;
pub mod probe;

/// Serves one client connection.
///
/// The connection is asked to close gracefully after `timeouts[0]` or when
/// `shutdown` flips, and is dropped `timeouts[1]` later if still open. An
/// upgraded connection leaves this loop as soon as it is handed over.
pub async fn serve_connection<S>(
    stream: TokioIo<S>,
    proxy: Arc<Proxy>,
    remote_address: SocketAddr,
    timeouts: Arc<[Duration; 2]>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: Unpin + AsyncWrite + AsyncRead + Send + Debug + 'static,
{
    let conn = http1::Builder::new()
        .serve_connection(
            stream,
            service_fn(move |request| handle_request(Arc::clone(&proxy), request, remote_address)),
        )
        .with_upgrades();
    pin!(conn);

    update_in_flight(IN_FLIGHT_REQUESTS.fetch_add(1, Ordering::Relaxed) + 1);

    let [query_timeout, grace_period] = *timeouts;
    let deadline = tokio::time::sleep(query_timeout);
    pin!(deadline);
    let mut closing = false;

    loop {
        tokio::select! {
            res = conn.as_mut() => {
                match res {
                    Ok(()) => debug!("Connection from {remote_address} closed"),
                    Err(error) => debug!("Error serving connection from {remote_address}: {error}"),
                }
                break;
            }
            () = &mut deadline => {
                if closing {
                    debug!("Grace period elapsed, dropping connection from {remote_address}");
                    break;
                }
                debug!("Query timeout reached, closing connection from {remote_address}");
                conn.as_mut().graceful_shutdown();
                deadline.as_mut().reset(tokio::time::Instant::now() + grace_period);
                closing = true;
            }
            Ok(_) = shutdown.wait_for(|stopping| *stopping), if !closing => {
                debug!("Draining connection from {remote_address}");
                conn.as_mut().graceful_shutdown();
                closing = true;
            }
        }
    }

    update_in_flight(IN_FLIGHT_REQUESTS.fetch_sub(1, Ordering::Relaxed) - 1);
}

/// Logs a failed `accept` and pauses before the next one, so that
/// descriptor exhaustion does not turn the accept loop into a busy loop.
pub async fn accept_failed(listener: &str, error: &io::Error) {
    warn!("{listener} listener failed to accept connection: {error}");
    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
}

fn update_in_flight(count: u64) {
    METRICS_PROVIDER
        .metric_http_request_in_flight
        .set(i64::try_from(count).unwrap_or(i64::MAX));
}

#[instrument(skip(proxy, request))]
async fn handle_request(
    proxy: Arc<Proxy>,
    request: Request<Incoming>,
    remote_address: SocketAddr,
) -> Result<Response<ProxyBody>, Infallible> {
    let start_time = Instant::now();
    let method = request.method().to_owned();
    let path = request.uri().path().to_owned();

    let trace_id = {
        let context = Span::current().context();
        let span = context.span();
        let span_context = span.span_context();
        if span_context.is_valid() {
            Some(span_context.trace_id().to_string())
        } else {
            None
        }
    };

    let response = proxy
        .handle(request.map(ProxyBody::from), remote_address)
        .await;

    #[allow(clippy::cast_precision_loss)]
    let elapsed = start_time.elapsed().as_millis() as f64;
    let status = response.status();

    METRICS_PROVIDER.metric_http_request_total.inc();
    METRICS_PROVIDER
        .metric_http_request_duration
        .observe(elapsed);

    let log = if let Some(trace_id) = trace_id {
        format!("{trace_id} {elapsed:?} - {status} {method} {path}")
    } else {
        format!("{elapsed:?} - {status} {method} {path}")
    };

    if status.is_server_error() {
        error!("{log}");
    } else {
        info!("{log}");
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_accept_failure_pauses_before_retry() {
        let start = tokio::time::Instant::now();
        accept_failed("proxy", &io::Error::other("Too many open files")).await;
        assert!(start.elapsed() >= ACCEPT_RETRY_DELAY);
    }
}
