//! Token validation through the upstream `TokenReview` API.
//!
//! Used as the fallback path for tokens the OIDC verifier does not accept,
//! typically service account tokens of in-cluster workloads.

use crate::configuration::{self, UpstreamConfig};
use crate::http_client::{HttpClient, HttpClientConfig};
use crate::proxy::{AuthError, TokenReviewer, UpstreamCredentials};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const TOKEN_REVIEW_PATH: &str = "/apis/authentication.k8s.io/v1/tokenreviews";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenReview<'a> {
    api_version: &'static str,
    kind: &'static str,
    spec: TokenReviewSpec<'a>,
}

#[derive(Debug, Serialize)]
struct TokenReviewSpec<'a> {
    token: &'a str,
    #[serde(skip_serializing_if = "no_audiences")]
    audiences: &'a [String],
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn no_audiences(audiences: &&[String]) -> bool {
    audiences.is_empty()
}

#[derive(Debug, Deserialize)]
struct TokenReviewResponse {
    #[serde(default)]
    status: Option<TokenReviewStatus>,
}

#[derive(Debug, Default, Deserialize)]
struct TokenReviewStatus {
    #[serde(default)]
    authenticated: bool,
    #[serde(default)]
    audiences: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct KubeTokenReviewer {
    client: HttpClient,
    endpoint: String,
    audiences: Vec<String>,
    credentials: Arc<UpstreamCredentials>,
}

impl KubeTokenReviewer {
    pub fn new(
        upstream: &UpstreamConfig,
        audiences: Vec<String>,
        credentials: Arc<UpstreamCredentials>,
    ) -> Result<Self, configuration::Error> {
        let client = HttpClient::new(&HttpClientConfig {
            server_ca_bundle: upstream.server_ca_bundle.clone(),
            client_certificate: upstream.client_certificate.clone(),
            client_private_key: upstream.client_private_key.clone(),
            timeout: Duration::from_secs(upstream.request_timeout),
        })?;

        let endpoint = format!("{}{TOKEN_REVIEW_PATH}", upstream.url.trim_end_matches('/'));

        Ok(Self {
            client,
            endpoint,
            audiences,
            credentials,
        })
    }

    fn evaluate(&self, status: &TokenReviewStatus) -> bool {
        if !status.authenticated {
            debug!(
                "Token review rejected token: {}",
                status.error.as_deref().unwrap_or("not authenticated")
            );
            return false;
        }

        if self.audiences.is_empty() {
            return true;
        }

        let accepted = status
            .audiences
            .iter()
            .any(|audience| self.audiences.contains(audience));
        if !accepted {
            debug!(
                "Token review audiences {:?} do not intersect {:?}",
                status.audiences, self.audiences
            );
        }
        accepted
    }
}

#[async_trait]
impl TokenReviewer for KubeTokenReviewer {
    async fn review(&self, token: &str) -> Result<bool, AuthError> {
        let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let review = TokenReview {
            api_version: "authentication.k8s.io/v1",
            kind: "TokenReview",
            spec: TokenReviewSpec {
                token,
                audiences: &self.audiences,
            },
        };

        let response: TokenReviewResponse = self
            .client
            .post_json(&self.endpoint, &review, self.credentials.authorization())
            .await
            .map_err(|e| AuthError::Unavailable(format!("token review: {e}")))?;

        Ok(self.evaluate(&response.status.unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reviewer(audiences: &[&str]) -> KubeTokenReviewer {
        let upstream = UpstreamConfig {
            url: "https://10.0.0.1:443/".to_string(),
            server_ca_bundle: None,
            client_certificate: None,
            client_private_key: None,
            token_file: None,
            request_timeout: 10,
        };

        KubeTokenReviewer::new(
            &upstream,
            audiences.iter().map(ToString::to_string).collect(),
            Arc::new(UpstreamCredentials::new(None).unwrap()),
        )
        .unwrap()
    }

    fn status(value: serde_json::Value) -> TokenReviewStatus {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_endpoint() {
        assert_eq!(
            reviewer(&[]).endpoint,
            "https://10.0.0.1:443/apis/authentication.k8s.io/v1/tokenreviews"
        );
    }

    #[test]
    fn test_request_body() {
        let audiences = vec!["api".to_string()];
        let review = TokenReview {
            api_version: "authentication.k8s.io/v1",
            kind: "TokenReview",
            spec: TokenReviewSpec {
                token: "abc",
                audiences: &audiences,
            },
        };

        assert_eq!(
            serde_json::to_value(&review).unwrap(),
            json!({
                "apiVersion": "authentication.k8s.io/v1",
                "kind": "TokenReview",
                "spec": {"token": "abc", "audiences": ["api"]}
            })
        );

        let review = TokenReview {
            spec: TokenReviewSpec {
                token: "abc",
                audiences: &[],
            },
            ..review
        };
        assert_eq!(
            serde_json::to_value(&review).unwrap()["spec"],
            json!({"token": "abc"})
        );
    }

    #[test]
    fn test_evaluate_authenticated() {
        let reviewer = reviewer(&[]);
        assert!(reviewer.evaluate(&status(json!({"authenticated": true}))));
        assert!(!reviewer.evaluate(&status(json!({"authenticated": false}))));
        assert!(!reviewer.evaluate(&status(json!({"error": "token expired"}))));
    }

    #[test]
    fn test_evaluate_audiences() {
        let reviewer = reviewer(&["api", "proxy"]);
        assert!(reviewer.evaluate(&status(
            json!({"authenticated": true, "audiences": ["proxy"]})
        )));
        assert!(!reviewer.evaluate(&status(
            json!({"authenticated": true, "audiences": ["other"]})
        )));
        assert!(!reviewer.evaluate(&status(json!({"authenticated": true}))));
    }

    #[tokio::test]
    async fn test_empty_token_is_rejected_locally() {
        assert_eq!(
            reviewer(&[]).review("Bearer ").await,
            Err(AuthError::MissingToken)
        );
    }
}
