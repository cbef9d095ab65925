use crate::configuration::{self, OidcConfig};
use crate::http_client::{HttpClient, HttpClientConfig};
use crate::proxy::{AuthError, HeaderExt, IdentityVerifier, VerifiedIdentity};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use hyper::http::request::Parts;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

mod claims;

use claims::map_claims;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ProviderMetadata {
    issuer: String,
    jwks_uri: String,
}

/// Verifies bearer tokens issued by the configured OpenID Connect provider.
///
/// Keys are fetched by a background task; until the first fetch succeeds
/// every token is reported as unverifiable.
pub struct OidcVerifier {
    config: OidcConfig,
    algorithms: Vec<Algorithm>,
    audiences: Vec<String>,
    client: HttpClient,
    keys: ArcSwapOption<JwkSet>,
    last_refresh: Mutex<Option<Instant>>,
    ready: watch::Sender<bool>,
}

impl OidcVerifier {
    pub fn new(config: &OidcConfig) -> Result<Self, configuration::Error> {
        let client = HttpClient::new(&HttpClientConfig {
            server_ca_bundle: config.ca_file.clone(),
            client_certificate: None,
            client_private_key: None,
            timeout: Duration::from_secs(config.request_timeout),
        })?;

        let mut audiences = vec![config.client_id.clone()];
        audiences.extend(config.api_audiences.iter().cloned());

        let (ready, _) = watch::channel(false);

        Ok(Self {
            config: config.clone(),
            algorithms: config.algorithms()?,
            audiences,
            client,
            keys: ArcSwapOption::empty(),
            last_refresh: Mutex::new(None),
            ready,
        })
    }

    /// Starts discovery with capped exponential backoff, then refreshes the
    /// key set periodically.
    pub fn spawn_refresh(self: &Arc<Self>) -> JoinHandle<()> {
        let verifier = Arc::clone(self);

        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            while let Err(error) = verifier.refresh().await {
                warn!(
                    "Unable to load keys from {}: {error} (retrying in {backoff:?})",
                    verifier.config.issuer_url
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }

            let interval = Duration::from_secs(verifier.config.jwks_refresh_interval);
            loop {
                tokio::time::sleep(interval).await;
                if let Err(error) = verifier.refresh().await {
                    warn!("Unable to refresh keys, keeping previous set: {error}");
                }
            }
        })
    }

    async fn refresh(&self) -> Result<(), AuthError> {
        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            self.config.issuer_url.trim_end_matches('/')
        );

        let metadata: ProviderMetadata = self
            .client
            .get_json(&discovery_url)
            .await
            .map_err(|e| AuthError::Unavailable(format!("discovery failed: {e}")))?;

        if metadata.issuer != self.config.issuer_url {
            return Err(AuthError::Unavailable(format!(
                "issuer mismatch: expected {}, got {}",
                self.config.issuer_url, metadata.issuer
            )));
        }

        let keys: JwkSet = self
            .client
            .get_json(&metadata.jwks_uri)
            .await
            .map_err(|e| AuthError::Unavailable(format!("key set fetch failed: {e}")))?;

        if keys.keys.is_empty() {
            return Err(AuthError::Unavailable(format!(
                "key set at {} is empty",
                metadata.jwks_uri
            )));
        }

        info!(
            "Loaded {} signing keys from {}",
            keys.keys.len(),
            metadata.jwks_uri
        );
        self.install_keys(keys);
        Ok(())
    }

    pub fn install_keys(&self, keys: JwkSet) {
        self.keys.store(Some(Arc::new(keys)));
        *self
            .last_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        self.ready.send_replace(true);
    }

    /// Claims the right to refresh the key set for an unknown key id.
    fn claim_refresh(&self) -> bool {
        let mut last_refresh = self
            .last_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match *last_refresh {
            Some(at) if at.elapsed() < MIN_REFRESH_INTERVAL => false,
            _ => {
                *last_refresh = Some(Instant::now());
                true
            }
        }
    }

    pub async fn verify_token(&self, token: &str) -> Result<VerifiedIdentity, AuthError> {
        let header = decode_header(token)
            .map_err(|e| AuthError::InvalidToken(format!("malformed token header: {e}")))?;

        if !self.algorithms.contains(&header.alg) {
            return Err(AuthError::InvalidToken(format!(
                "signing algorithm {:?} is not accepted",
                header.alg
            )));
        }

        let claims = match self.decode_claims(token, &header.alg, header.kid.as_deref())? {
            Some(claims) => claims,
            None if self.claim_refresh() => {
                debug!("Unknown key id {:?}, refreshing key set", header.kid);
                self.refresh().await?;
                self.decode_claims(token, &header.alg, header.kid.as_deref())?
                    .ok_or_else(|| {
                        AuthError::InvalidToken(format!("no key matches kid {:?}", header.kid))
                    })?
            }
            None => {
                return Err(AuthError::InvalidToken(format!(
                    "no key matches kid {:?}",
                    header.kid
                )))
            }
        };

        map_claims(&self.config, &claims)
    }

    /// Returns `Ok(None)` when no key in the current set matches the token.
    fn decode_claims(
        &self,
        token: &str,
        algorithm: &Algorithm,
        kid: Option<&str>,
    ) -> Result<Option<Map<String, Value>>, AuthError> {
        let Some(keys) = self.keys.load_full() else {
            return Err(AuthError::Unavailable(
                "signing keys not loaded yet".to_string(),
            ));
        };

        let candidates: Vec<&Jwk> = match kid {
            Some(kid) => keys.find(kid).into_iter().collect(),
            None => keys.keys.iter().collect(),
        };
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut validation = Validation::new(*algorithm);
        validation.set_issuer(&[&self.config.issuer_url]);
        validation.set_audience(self.audiences.as_slice());
        validation.leeway = self.config.clock_skew_tolerance;
        validation.validate_exp = true;
        validation.validate_nbf = true;

        let mut last_error = None;
        for jwk in candidates {
            let key = match DecodingKey::from_jwk(jwk) {
                Ok(key) => key,
                Err(error) => {
                    debug!("Skipping unusable key {:?}: {error}", jwk.common.key_id);
                    last_error = Some(error);
                    continue;
                }
            };

            match decode::<Map<String, Value>>(token, &key, &validation) {
                Ok(data) => return Ok(Some(data.claims)),
                Err(error) => last_error = Some(error),
            }
        }

        Err(AuthError::InvalidToken(match last_error {
            Some(error) => error.to_string(),
            None => "no usable key".to_string(),
        }))
    }
}

#[async_trait]
impl IdentityVerifier for OidcVerifier {
    async fn verify(&self, parts: &Parts) -> Result<Option<VerifiedIdentity>, AuthError> {
        let Some(token) = parts.bearer_token() else {
            return Ok(None);
        };

        self.verify_token(&token).await.map(Some)
    }

    async fn ready(&self) {
        let mut ready = self.ready.subscribe();
        let _ = ready.wait_for(|ready| *ready).await;
    }
}
