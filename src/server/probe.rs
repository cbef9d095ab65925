use crate::configuration::ProbeConfig;
use crate::metrics_provider::METRICS_PROVIDER;
use crate::server::accept_failed;
use crate::server::lifecycle::Readiness;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

const READY_PATH: &str = "/ready";
const METRICS_PATH: &str = "/metrics";

/// Plain HTTP listener answering kubelet readiness probes and metric scrapes.
pub struct ProbeServer {
    binding_address: SocketAddr,
    readiness: Readiness,
}

impl ProbeServer {
    pub fn new(config: &ProbeConfig, readiness: Readiness) -> Self {
        Self {
            binding_address: SocketAddr::new(config.bind_address, config.port),
            readiness,
        }
    }

    pub async fn bind(&self) -> io::Result<TcpListener> {
        let listener = TcpListener::bind(self.binding_address).await?;
        info!("Probe listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Serves probes until the task is dropped.
    pub async fn serve(self, listener: TcpListener) {
        loop {
            let (tcp, remote_address) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    accept_failed("probe", &error).await;
                    continue;
                }
            };

            let readiness = self.readiness.clone();
            tokio::spawn(async move {
                let service = service_fn(move |request: Request<Incoming>| {
                    let response = handle_probe(&readiness, request.method(), request.uri().path());
                    async move { Ok::<_, Infallible>(response) }
                });

                if let Err(error) = http1::Builder::new()
                    .serve_connection(TokioIo::new(tcp), service)
                    .await
                {
                    debug!("Error serving probe connection from {remote_address}: {error}");
                }
            });
        }
    }
}

fn handle_probe(readiness: &Readiness, method: &Method, path: &str) -> Response<Full<Bytes>> {
    if ![Method::GET, Method::HEAD].contains(method) {
        return text_response(StatusCode::NOT_FOUND, "not found\n");
    }

    match path {
        READY_PATH if readiness.is_ready() => text_response(StatusCode::OK, "ok\n"),
        READY_PATH => text_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &format!("{:?}\n", readiness.state()),
        ),
        METRICS_PATH => match METRICS_PROVIDER.gather() {
            Ok((content_type, metrics)) => {
                let mut response = Response::new(Full::new(Bytes::from(metrics)));
                if let Ok(content_type) = HeaderValue::from_str(&content_type) {
                    response.headers_mut().insert(CONTENT_TYPE, content_type);
                }
                response
            }
            Err(e) => {
                error!("Failed to gather metrics: {e}");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error\n")
            }
        },
        _ => text_response(StatusCode::NOT_FOUND, "not found\n"),
    }
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
