use crate::proxy::AuthError;
use async_trait::async_trait;
use hyper::http::request::Parts;
use std::collections::BTreeMap;

/// Identity attested by an [`IdentityVerifier`].
///
/// An empty `name` is representable but never forwarded.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VerifiedIdentity {
    pub name: String,
    pub groups: Vec<String>,
    pub extra: BTreeMap<String, Vec<String>>,
}

/// Primary bearer-token verification.
///
/// `Ok(None)` means the request carried nothing this verifier could check.
/// The pipeline handles `Ok(None)` and `Err(_)` the same way.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, parts: &Parts) -> Result<Option<VerifiedIdentity>, AuthError>;

    /// Resolves once the verifier is able to check tokens.
    async fn ready(&self);
}

/// Secondary check asking an independent authority whether a token is
/// currently valid.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenReviewer: Send + Sync {
    async fn review(&self, token: &str) -> Result<bool, AuthError>;
}
