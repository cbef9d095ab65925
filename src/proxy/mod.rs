use crate::configuration::{self, Configuration};
use crate::metrics_provider::AUTH_DECISIONS;
use hyper::http::request::Parts;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, instrument};

mod body;
mod error;
mod identity;
pub mod impersonation;
mod request_ext;
mod transport;
mod upgrade;

pub use body::ProxyBody;
pub use error::{AuthError, Error};
pub use identity::{IdentityVerifier, TokenReviewer, VerifiedIdentity};
pub use impersonation::ImpersonationAssertion;
pub use request_ext::HeaderExt;
pub use transport::{
    ImpersonatingTransport, Transport, TransportSet, UpstreamCredentials, UpstreamTransport,
};

#[cfg(test)]
pub use identity::{MockIdentityVerifier, MockTokenReviewer};

/// Settings of the request pipeline, fixed for the lifetime of the process.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub token_passthrough: bool,
    pub passthrough_allows_impersonation: bool,
    pub disable_impersonation: bool,
    pub upstream_url: Uri,
}

impl ProxyConfig {
    pub fn new(config: &Configuration) -> Result<Self, configuration::Error> {
        Ok(Self {
            token_passthrough: config.token_passthrough.enabled,
            passthrough_allows_impersonation: config.token_passthrough.allow_client_impersonation,
            disable_impersonation: config.proxy.disable_impersonation,
            upstream_url: config.upstream()?.uri()?,
        })
    }
}

/// Authenticates each inbound request and forwards it upstream.
pub struct Proxy {
    config: ProxyConfig,
    verifier: Arc<dyn IdentityVerifier>,
    token_reviewer: Option<Arc<dyn TokenReviewer>>,
    transports: TransportSet,
}

impl Proxy {
    pub fn new(
        config: ProxyConfig,
        verifier: Arc<dyn IdentityVerifier>,
        transports: TransportSet,
    ) -> Self {
        Self {
            config,
            verifier,
            token_reviewer: None,
            transports,
        }
    }

    #[must_use]
    pub fn with_token_reviewer(mut self, token_reviewer: Arc<dyn TokenReviewer>) -> Self {
        self.token_reviewer = Some(token_reviewer);
        self
    }

    pub fn verifier(&self) -> &Arc<dyn IdentityVerifier> {
        &self.verifier
    }

    /// Runs the pipeline and turns rejections into plain-text responses.
    ///
    /// Rejection detail is logged together with the remote address and is
    /// never part of the response.
    #[instrument(skip(self, request))]
    pub async fn handle(
        &self,
        request: Request<ProxyBody>,
        remote_address: SocketAddr,
    ) -> Response<ProxyBody> {
        match self.round_trip(request).await {
            Ok(response) => response,
            Err(error) => {
                match &error {
                    Error::Upstream(_) | Error::Internal(_) => {
                        error!("{remote_address}: {error}");
                    }
                    Error::Unauthorized(_)
                    | Error::ImpersonationAttempt
                    | Error::MissingIdentityName => {
                        debug!("{remote_address}: {error}");
                    }
                }
                error.to_response()
            }
        }
    }

    pub async fn round_trip(&self, request: Request<ProxyBody>) -> Result<Response<ProxyBody>, Error> {
        let (mut parts, body) = request.into_parts();
        if let Some(protocol) = upgrade::remove_hop_by_hop(&mut parts.headers) {
            debug!("Client requested upgrade to {protocol:?}");
        }

        let primary = match self.verifier.verify(&parts).await {
            Ok(Some(identity)) => {
                record_decision("oidc", "success");
                return self.forward_verified(parts, body, identity).await;
            }
            Ok(None) => AuthError::MissingToken,
            Err(error) => error,
        };

        record_decision("oidc", "failure");
        self.forward_reviewed(parts, body, primary).await
    }

    async fn forward_verified(
        &self,
        parts: Parts,
        body: ProxyBody,
        identity: VerifiedIdentity,
    ) -> Result<Response<ProxyBody>, Error> {
        if self.config.disable_impersonation {
            debug!("Impersonation disabled, forwarding request as is");
            return forward(self.transports.plain.as_ref(), parts, body).await;
        }

        let assertion = ImpersonationAssertion::for_request(&parts.headers, identity)?;
        debug!(
            "Impersonating '{}' upstream at {}",
            assertion.user, self.config.upstream_url
        );

        let transport =
            ImpersonatingTransport::new(assertion, self.transports.authenticated.as_ref());
        forward(&transport, parts, body).await
    }

    /// Fallback for requests the identity verifier did not accept.
    ///
    /// A token confirmed by the reviewer is forwarded with its original
    /// headers through the plain transport.
    async fn forward_reviewed(
        &self,
        parts: Parts,
        body: ProxyBody,
        primary: AuthError,
    ) -> Result<Response<ProxyBody>, Error> {
        let reviewer = match &self.token_reviewer {
            Some(reviewer) if self.config.token_passthrough => reviewer,
            _ => return Err(Error::Unauthorized(primary.to_string())),
        };

        let Some(token) = parts.bearer_token() else {
            return Err(Error::Unauthorized(format!(
                "{primary}; {}",
                AuthError::MissingToken
            )));
        };

        match reviewer.review(&token).await {
            Ok(true) => {
                record_decision("token_review", "success");
                if !self.config.passthrough_allows_impersonation
                    && impersonation::has_impersonation(&parts.headers)
                {
                    return Err(Error::ImpersonationAttempt);
                }

                debug!("Token accepted by review, forwarding request as is");
                forward(self.transports.plain.as_ref(), parts, body).await
            }
            Ok(false) => {
                record_decision("token_review", "failure");
                Err(Error::Unauthorized(format!(
                    "{primary}; token review: token not authenticated"
                )))
            }
            Err(secondary) => {
                record_decision("token_review", "failure");
                Err(Error::Unauthorized(format!("{primary}; {secondary}")))
            }
        }
    }
}

/// Sends the request through `transport`, bridging both connections when
/// the upstream switches protocols.
async fn forward(
    transport: &dyn Transport,
    mut parts: Parts,
    body: ProxyBody,
) -> Result<Response<ProxyBody>, Error> {
    let client_upgrade = parts.extensions.remove::<OnUpgrade>();

    let mut response = transport
        .round_trip(Request::from_parts(parts, body))
        .await?;
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Ok(response);
    }

    match (client_upgrade, response.extensions_mut().remove::<OnUpgrade>()) {
        (Some(client), Some(upstream)) => {
            upgrade::spawn_bridge(client, upstream);
            Ok(response)
        }
        _ => Err(Error::Upstream(
            "upstream switched protocols on a connection that cannot be upgraded".to_string(),
        )),
    }
}

fn record_decision(path: &str, result: &str) {
    AUTH_DECISIONS.with_label_values(&[path, result]).inc();
}

#[cfg(test)]
pub mod test_utils {
    use super::*;
    use crate::configuration::UpstreamConfig;
    use hyper::body::Incoming;
    use hyper::header::{HeaderName, HeaderValue, CONNECTION, UPGRADE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::path::Path;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Request headers the upstream reflects back as `x-seen-<name>`.
    const REFLECTED: [&str; 3] = ["authorization", "impersonate-user", "impersonate-group"];

    /// Starts an upstream that reflects request headers back and, when asked
    /// to upgrade, switches protocols and echoes the raw stream.
    pub async fn spawn_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let (tcp, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(tcp), service_fn(reflect))
                        .with_upgrades()
                        .await;
                });
            }
        });

        address
    }

    async fn reflect(mut request: Request<Incoming>) -> Result<Response<ProxyBody>, Infallible> {
        let mut response = Response::new(ProxyBody::empty());
        for name in REFLECTED {
            let seen = HeaderName::try_from(format!("x-seen-{name}")).unwrap();
            for value in request.headers().get_all(name) {
                response.headers_mut().append(seen.clone(), value.clone());
            }
        }

        if let Some(protocol) = request.headers().get(UPGRADE).cloned() {
            let upgrade = hyper::upgrade::on(&mut request);
            tokio::spawn(async move {
                let mut upgraded = TokioIo::new(upgrade.await.unwrap());
                let mut buffer = [0; 64];
                while let Ok(read) = upgraded.read(&mut buffer).await {
                    if read == 0 || upgraded.write_all(&buffer[..read]).await.is_err() {
                        break;
                    }
                }
            });

            *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
            let headers = response.headers_mut();
            headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
            headers.insert(UPGRADE, protocol);
        }

        Ok(response)
    }

    /// Transports to the upstream at `address`, presenting the token in
    /// `token_file` as the proxy's own credential.
    pub fn upstream_transports(address: SocketAddr, token_file: &Path) -> TransportSet {
        let upstream = UpstreamConfig {
            url: format!("http://{address}"),
            server_ca_bundle: None,
            client_certificate: None,
            client_private_key: None,
            token_file: Some(token_file.to_path_buf()),
            request_timeout: 10,
        };

        TransportSet::new(
            UpstreamTransport::new(&upstream).unwrap(),
            Arc::new(UpstreamCredentials::new(upstream.token_file.clone()).unwrap()),
        )
    }
}
