use crate::configuration::watcher::Reloadable;
use crate::configuration::{self, UpstreamConfig};
use crate::http_client::build_tls_config;
use crate::proxy::upgrade;
use crate::proxy::{Error, ImpersonationAssertion, ProxyBody};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use hyper::header::{HeaderValue, AUTHORIZATION, CONNECTION, HOST, UPGRADE};
use hyper::http::uri::PathAndQuery;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// A single upstream round trip.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, request: Request<ProxyBody>) -> Result<Response<ProxyBody>, Error>;
}

/// The two transports built once at startup.
///
/// `plain` forwards requests as they are. `authenticated` swaps the client's
/// credentials for the proxy's own and is the base for per-request
/// impersonation.
#[derive(Clone)]
pub struct TransportSet {
    pub plain: Arc<dyn Transport>,
    pub authenticated: Arc<dyn Transport>,
}

impl TransportSet {
    pub fn new(upstream: UpstreamTransport, credentials: Arc<UpstreamCredentials>) -> Self {
        let plain: Arc<dyn Transport> = Arc::new(upstream);
        let authenticated = Arc::new(CredentialTransport {
            credentials,
            inner: Arc::clone(&plain),
        });

        Self {
            plain,
            authenticated,
        }
    }
}

/// TLS client to the upstream server, rebasing request URIs onto its URL.
///
/// Requests reach it with their hop-by-hop headers already removed, so every
/// header added on the way is sent as is.
pub struct UpstreamTransport {
    base: Uri,
    client: Client<HttpsConnector<HttpConnector>, ProxyBody>,
}

impl UpstreamTransport {
    pub fn new(config: &UpstreamConfig) -> Result<Self, configuration::Error> {
        let base = config.uri()?;
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

        info!("Upstream transport ready for {base}");
        Ok(Self { base, client })
    }
}

#[async_trait]
impl Transport for UpstreamTransport {
    async fn round_trip(&self, request: Request<ProxyBody>) -> Result<Response<ProxyBody>, Error> {
        let (mut parts, body) = request.into_parts();

        parts.uri = upstream_uri(&self.base, &parts.uri)?;
        parts.headers.remove(HOST);

        debug!("Forwarding {} {}", parts.method, parts.uri);
        let response = self
            .client
            .request(Request::from_parts(parts, body))
            .await
            .map_err(|e| Error::Upstream(format!("upstream request failed: {e}")))?;

        let (mut parts, body) = response.into_parts();
        if upgrade::remove_hop_by_hop(&mut parts.headers).is_some()
            && parts.status != StatusCode::SWITCHING_PROTOCOLS
        {
            parts.headers.remove(CONNECTION);
            parts.headers.remove(UPGRADE);
        }

        Ok(Response::from_parts(parts, ProxyBody::from(body)))
    }
}

/// Credentials the proxy presents to the upstream as itself.
pub struct UpstreamCredentials {
    token_file: Option<PathBuf>,
    authorization: ArcSwapOption<HeaderValue>,
}

impl UpstreamCredentials {
    pub fn new(token_file: Option<PathBuf>) -> Result<Self, configuration::Error> {
        let credentials = Self {
            token_file,
            authorization: ArcSwapOption::empty(),
        };
        credentials.reload()?;
        Ok(credentials)
    }

    pub fn authorization(&self) -> Option<HeaderValue> {
        self.authorization.load_full().map(|value| (*value).clone())
    }

    /// Re-reads the token file, keeping the previous token on failure.
    pub fn reload(&self) -> Result<(), configuration::Error> {
        let Some(token_file) = &self.token_file else {
            return Ok(());
        };

        let token = fs::read_to_string(token_file)?;
        let token = token.trim();
        if token.is_empty() {
            return Err(configuration::Error::Validation(format!(
                "upstream token file {} is empty",
                token_file.display()
            )));
        }

        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))?;
        value.set_sensitive(true);
        self.authorization.store(Some(Arc::new(value)));

        debug!("Loaded upstream token from {}", token_file.display());
        Ok(())
    }
}

impl Reloadable for UpstreamCredentials {
    fn name(&self) -> &'static str {
        "upstream token"
    }

    fn reload(&self) -> Result<(), configuration::Error> {
        UpstreamCredentials::reload(self)
    }
}

/// Replaces the client's `Authorization` with the proxy's credential.
struct CredentialTransport {
    credentials: Arc<UpstreamCredentials>,
    inner: Arc<dyn Transport>,
}

#[async_trait]
impl Transport for CredentialTransport {
    async fn round_trip(
        &self,
        mut request: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, Error> {
        let headers = request.headers_mut();
        headers.remove(AUTHORIZATION);
        if let Some(authorization) = self.credentials.authorization() {
            headers.insert(AUTHORIZATION, authorization);
        }

        self.inner.round_trip(request).await
    }
}

/// Per-request decorator injecting an impersonation assertion.
pub struct ImpersonatingTransport<'a> {
    assertion: ImpersonationAssertion,
    inner: &'a dyn Transport,
}

impl<'a> ImpersonatingTransport<'a> {
    pub fn new(assertion: ImpersonationAssertion, inner: &'a dyn Transport) -> Self {
        Self { assertion, inner }
    }
}

#[async_trait]
impl<'a> Transport for ImpersonatingTransport<'a> {
    async fn round_trip(
        &self,
        mut request: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, Error> {
        self.assertion.apply(request.headers_mut())?;
        self.inner.round_trip(request).await
    }
}

pub fn upstream_uri(base: &Uri, request: &Uri) -> Result<Uri, Error> {
    let base_path = base.path().trim_end_matches('/');
    let request_path = request.path();

    let mut path_and_query = if request_path.starts_with('/') {
        format!("{base_path}{request_path}")
    } else {
        format!("{base_path}/{request_path}")
    };
    if let Some(query) = request.query() {
        path_and_query.push('?');
        path_and_query.push_str(query);
    }

    let mut parts = base.clone().into_parts();
    parts.path_and_query = Some(
        PathAndQuery::try_from(path_and_query)
            .map_err(|e| Error::Internal(format!("invalid upstream path: {e}")))?,
    );

    Uri::from_parts(parts).map_err(|e| Error::Internal(format!("invalid upstream URI: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::VerifiedIdentity;
    use crate::proxy::impersonation::{IMPERSONATE_GROUP, IMPERSONATE_USER};
    use hyper::HeaderMap;
    use std::io::Write;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        seen: Mutex<Vec<HeaderMap>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn round_trip(
            &self,
            request: Request<ProxyBody>,
        ) -> Result<Response<ProxyBody>, Error> {
            self.seen.lock().unwrap().push(request.headers().clone());
            Ok(Response::new(ProxyBody::empty()))
        }
    }

    #[test]
    fn test_upstream_uri() {
        let base = Uri::from_static("https://10.0.0.1:6443");
        let request = Uri::from_static("/api/v1/pods?watch=true");
        assert_eq!(
            upstream_uri(&base, &request).unwrap(),
            "https://10.0.0.1:6443/api/v1/pods?watch=true"
        );

        let base = Uri::from_static("https://cluster.example.com/k8s/");
        let request = Uri::from_static("/apis/apps/v1");
        assert_eq!(
            upstream_uri(&base, &request).unwrap(),
            "https://cluster.example.com/k8s/apis/apps/v1"
        );

        let request = Uri::from_static("http://proxy.local:6443/version");
        assert_eq!(
            upstream_uri(&base, &request).unwrap(),
            "https://cluster.example.com/k8s/version"
        );
    }

    #[tokio::test]
    async fn test_credential_transport_replaces_authorization() {
        let mut token_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(token_file, "proxy-service-account-token").unwrap();

        let credentials =
            Arc::new(UpstreamCredentials::new(Some(token_file.path().to_path_buf())).unwrap());
        let recorder = Arc::new(RecordingTransport::default());
        let transport = CredentialTransport {
            credentials,
            inner: recorder.clone(),
        };

        let request = Request::builder()
            .header(AUTHORIZATION, "Bearer client-oidc-token")
            .body(ProxyBody::empty())
            .unwrap();
        transport.round_trip(request).await.unwrap();

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(
            seen[0].get(AUTHORIZATION).unwrap(),
            "Bearer proxy-service-account-token"
        );
    }

    #[tokio::test]
    async fn test_credential_transport_without_token_strips_authorization() {
        let credentials = Arc::new(UpstreamCredentials::new(None).unwrap());
        let recorder = Arc::new(RecordingTransport::default());
        let transport = CredentialTransport {
            credentials,
            inner: recorder.clone(),
        };

        let request = Request::builder()
            .header(AUTHORIZATION, "Bearer client-oidc-token")
            .body(ProxyBody::empty())
            .unwrap();
        transport.round_trip(request).await.unwrap();

        assert!(recorder.seen.lock().unwrap()[0].get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_credentials_keep_previous_token_on_failed_reload() {
        let mut token_file = tempfile::NamedTempFile::new().unwrap();
        write!(token_file, "first").unwrap();

        let credentials = UpstreamCredentials::new(Some(token_file.path().to_path_buf())).unwrap();
        assert_eq!(credentials.authorization().unwrap(), "Bearer first");

        token_file.as_file().set_len(0).unwrap();
        assert!(credentials.reload().is_err());
        assert_eq!(credentials.authorization().unwrap(), "Bearer first");
    }

    #[tokio::test]
    async fn test_impersonating_transport_decorates_request() {
        let recorder = RecordingTransport::default();
        let assertion = ImpersonationAssertion::try_from(VerifiedIdentity {
            name: "alice".to_string(),
            groups: vec!["dev".to_string()],
            ..Default::default()
        })
        .unwrap();

        let transport = ImpersonatingTransport::new(assertion, &recorder);
        transport
            .round_trip(Request::new(ProxyBody::empty()))
            .await
            .unwrap();

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen[0].get(IMPERSONATE_USER).unwrap(), "alice");
        assert_eq!(seen[0].get_all(IMPERSONATE_GROUP).iter().count(), 2);
    }
}
