use crate::configuration;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, StatusCode};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::RootCertStore;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug)]
pub enum Error {
    Request(String),
    Status(StatusCode),
    Timeout,
    Decode(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Request(s) => write!(f, "HTTP request failed: {s}"),
            Error::Status(status) => write!(f, "unexpected HTTP status: {status}"),
            Error::Timeout => write!(f, "HTTP request timed out"),
            Error::Decode(s) => write!(f, "unable to decode response: {s}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<hyper::http::Error> for Error {
    fn from(error: hyper::http::Error) -> Self {
        Error::Request(error.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Decode(error.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct HttpClientConfig {
    pub server_ca_bundle: Option<String>,
    pub client_certificate: Option<String>,
    pub client_private_key: Option<String>,
    pub timeout: Duration,
}

/// JSON-over-HTTPS client for the identity provider and the token review API.
#[derive(Clone, Debug)]
pub struct HttpClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(config: &HttpClientConfig) -> Result<Self, configuration::Error> {
        let tls_config = build_tls_config(
            config.server_ca_bundle.as_deref(),
            config.client_certificate.as_deref(),
            config.client_private_key.as_deref(),
        )?;

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .build();

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Self {
            client,
            timeout: config.timeout,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, uri: &str) -> Result<T, Error> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(ACCEPT, "application/json")
            .body(Full::new(Bytes::new()))?;

        self.send(request).await
    }

    pub async fn post_json<B, T>(
        &self,
        uri: &str,
        body: &B,
        authorization: Option<HeaderValue>,
    ) -> Result<T, Error>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let mut request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json");
        if let Some(authorization) = authorization {
            request = request.header(AUTHORIZATION, authorization);
        }

        let request = request.body(Full::new(Bytes::from(serde_json::to_vec(body)?)))?;
        self.send(request).await
    }

    async fn send<T: DeserializeOwned>(&self, request: Request<Full<Bytes>>) -> Result<T, Error> {
        debug!("{} {}", request.method(), request.uri());

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| Error::Request(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(Error::Status(status));
            }

            response
                .into_body()
                .collect()
                .await
                .map(|body| body.to_bytes())
                .map_err(|e| Error::Request(e.to_string()))
        };

        let body = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| Error::Timeout)??;

        Ok(serde_json::from_slice(&body)?)
    }
}

pub fn build_tls_config(
    ca_bundle: Option<&str>,
    client_cert: Option<&str>,
    client_key: Option<&str>,
) -> Result<rustls::ClientConfig, configuration::Error> {
    let mut root_store = RootCertStore::empty();

    let certs = if let Some(bundle) = ca_bundle {
        CertificateDer::pem_file_iter(bundle)?.collect::<Result<Vec<_>, _>>()?
    } else {
        rustls_native_certs::load_native_certs().certs
    };

    let (added, ignored) = root_store.add_parsable_certificates(certs);
    debug!("Loaded {added} trusted certificates ({ignored} ignored)");

    let config = rustls::ClientConfig::builder().with_root_certificates(root_store);

    match (client_cert, client_key) {
        (Some(cert), Some(key)) => {
            let certs = CertificateDer::pem_file_iter(cert)?.collect::<Result<Vec<_>, _>>()?;
            let key = PrivateKeyDer::from_pem_file(key)?;
            Ok(config.with_client_auth_cert(certs, key)?)
        }
        (None, None) => Ok(config.with_no_client_auth()),
        _ => {
            warn!("Client certificate and key must both be provided");
            Ok(config.with_no_client_auth())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let client = HttpClient::new(&HttpClientConfig {
            server_ca_bundle: None,
            client_certificate: None,
            client_private_key: None,
            timeout: Duration::from_millis(100),
        })
        .unwrap();

        let result = client
            .get_json::<Value>(&format!("http://{address}/.well-known/openid-configuration"))
            .await;

        assert!(matches!(result, Err(Error::Timeout)), "{result:?}");
        server.abort();
    }
}
