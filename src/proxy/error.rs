use crate::proxy::ProxyBody;
use hyper::header::{HeaderValue, CONTENT_TYPE, WWW_AUTHENTICATE, X_CONTENT_TYPE_OPTIONS};
use hyper::{Response, StatusCode};
use std::fmt;
use tracing::debug;

/// Reasons a request could not be tied to a trusted identity.
///
/// Produced by identity verifiers and token reviewers. The text is only ever
/// logged, never returned to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthError {
    MissingToken,
    InvalidToken(String),
    Unavailable(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::MissingToken => write!(f, "no bearer token found in request header"),
            AuthError::InvalidToken(s) => write!(f, "token rejected: {s}"),
            AuthError::Unavailable(s) => write!(f, "token verification unavailable: {s}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Per-request failure taxonomy.
///
/// Every variant maps to exactly one status and one client-facing phrase in
/// [`Error::status`] and [`Error::client_message`]; the carried detail stays
/// server side.
#[derive(Debug, PartialEq)]
pub enum Error {
    /// Primary verification failed and no fallback accepted the token.
    Unauthorized(String),
    /// The client sent impersonation headers of its own.
    ImpersonationAttempt,
    /// The verified identity has no usable name.
    MissingIdentityName,
    /// The upstream round trip failed.
    Upstream(String),
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Unauthorized(s) => write!(f, "unauthorized: {s}"),
            Error::ImpersonationAttempt => write!(f, "impersonation headers present in request"),
            Error::MissingIdentityName => write!(f, "no name in verified identity"),
            Error::Upstream(s) => write!(f, "upstream error: {s}"),
            Error::Internal(s) => write!(f, "internal error: {s}"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::ImpersonationAttempt | Error::MissingIdentityName => StatusCode::FORBIDDEN,
            Error::Upstream(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn client_message(&self) -> &'static str {
        match self {
            Error::Unauthorized(_) => "Unauthorized",
            Error::ImpersonationAttempt => {
                "Impersonation requests are disabled when using oidc-impersonation-proxy"
            }
            Error::MissingIdentityName => "Username claim not available in OIDC Issuer response",
            Error::Upstream(_) | Error::Internal(_) => "Internal Server Error",
        }
    }

    /// Plain-text rejection response, in the shape of `http.Error`.
    pub fn to_response(&self) -> Response<ProxyBody> {
        let mut response = Response::new(ProxyBody::fixed(format!(
            "{}\n",
            self.client_message()
        )));
        *response.status_mut() = self.status();

        let headers = response.headers_mut();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        if let Error::Unauthorized(_) = self {
            headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }

        response
    }
}

impl From<hyper::http::Error> for Error {
    fn from(error: hyper::http::Error) -> Self {
        debug!("HTTP error: {error:?}");
        Error::Internal(format!("HTTP error: {error}"))
    }
}

impl From<hyper::header::InvalidHeaderValue> for Error {
    fn from(error: hyper::header::InvalidHeaderValue) -> Self {
        debug!("Invalid header value: {error:?}");
        Error::Internal(format!("invalid header value: {error}"))
    }
}

impl From<hyper::header::InvalidHeaderName> for Error {
    fn from(error: hyper::header::InvalidHeaderName) -> Self {
        debug!("Invalid header name: {error:?}");
        Error::Internal(format!("invalid header name: {error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::Unauthorized("oidc: expired".to_string()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(Error::ImpersonationAttempt.status(), StatusCode::FORBIDDEN);
        assert_eq!(Error::MissingIdentityName.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            Error::Upstream("connection refused".to_string()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            Error::Internal("boom".to_string()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_response_does_not_leak_detail() {
        let error = Error::Unauthorized("issuer https://idp.internal key kid-7 unknown".to_string());
        let response = error.to_response();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(WWW_AUTHENTICATE).unwrap(),
            "Bearer"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"Unauthorized\n");
    }

    #[tokio::test]
    async fn test_internal_response_is_generic() {
        let response = Error::Upstream("dial tcp 10.0.0.1:443: refused".to_string()).to_response();
        assert!(response.headers().get(WWW_AUTHENTICATE).is_none());

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"Internal Server Error\n");
    }
}
