//! Translation of a verified identity into upstream impersonation headers.
//!
//! Only the proxy may assert impersonation. Any impersonation-family header
//! sent by the client is a rejection condition on the primary path.

use crate::proxy::{Error, VerifiedIdentity};
use hyper::header::{HeaderName, HeaderValue};
use hyper::HeaderMap;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

pub const IMPERSONATE_USER: HeaderName = HeaderName::from_static("impersonate-user");
pub const IMPERSONATE_GROUP: HeaderName = HeaderName::from_static("impersonate-group");
pub const IMPERSONATE_UID: HeaderName = HeaderName::from_static("impersonate-uid");
pub const IMPERSONATE_EXTRA_PREFIX: &str = "impersonate-extra-";

/// Group every authenticated identity belongs to upstream.
pub const ALL_AUTHENTICATED: &str = "system:authenticated";

/// True for `Impersonate-User`, `Impersonate-Group`, `Impersonate-Uid` and any
/// `Impersonate-Extra-*` header, regardless of case.
pub fn is_impersonation_header(name: &HeaderName) -> bool {
    let name = name.as_str().to_ascii_lowercase();

    name == IMPERSONATE_USER.as_str()
        || name == IMPERSONATE_GROUP.as_str()
        || name == IMPERSONATE_UID.as_str()
        || name.starts_with(IMPERSONATE_EXTRA_PREFIX)
}

pub fn has_impersonation(headers: &HeaderMap) -> bool {
    headers.keys().any(is_impersonation_header)
}

pub fn remove_impersonation(headers: &mut HeaderMap) {
    let names: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_impersonation_header(name))
        .cloned()
        .collect();

    for name in names {
        headers.remove(name);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImpersonationAssertion {
    pub user: String,
    pub groups: BTreeSet<String>,
    pub extra: BTreeMap<String, Vec<String>>,
}

impl ImpersonationAssertion {
    /// Checks the inbound headers, then the identity name, then builds the
    /// assertion.
    pub fn for_request(headers: &HeaderMap, identity: VerifiedIdentity) -> Result<Self, Error> {
        if has_impersonation(headers) {
            return Err(Error::ImpersonationAttempt);
        }

        Self::try_from(identity)
    }

    /// Replaces any impersonation headers with this assertion.
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<(), Error> {
        remove_impersonation(headers);

        headers.insert(IMPERSONATE_USER, HeaderValue::from_str(&self.user)?);
        for group in &self.groups {
            headers.append(IMPERSONATE_GROUP, HeaderValue::from_str(group)?);
        }

        for (key, values) in &self.extra {
            let name = HeaderName::try_from(format!(
                "{IMPERSONATE_EXTRA_PREFIX}{}",
                escape_extra_key(key)
            ))?;
            for value in values {
                headers.append(name.clone(), HeaderValue::from_str(value)?);
            }
        }

        Ok(())
    }
}

impl TryFrom<VerifiedIdentity> for ImpersonationAssertion {
    type Error = Error;

    fn try_from(identity: VerifiedIdentity) -> Result<Self, Self::Error> {
        if identity.name.is_empty() {
            return Err(Error::MissingIdentityName);
        }

        let mut groups: BTreeSet<String> = identity.groups.into_iter().collect();
        groups.insert(ALL_AUTHENTICATED.to_string());

        Ok(Self {
            user: identity.name,
            groups,
            extra: identity.extra,
        })
    }
}

/// Percent-encodes every byte that is not a header token character, so
/// that keys like `example.com/scopes` survive as header names.
fn escape_extra_key(key: &str) -> String {
    let mut escaped = String::with_capacity(key.len());
    for byte in key.to_ascii_lowercase().bytes() {
        let is_token = byte.is_ascii_alphanumeric()
            || matches!(
                byte,
                b'!' | b'#' | b'$' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_'
                    | b'`' | b'|' | b'~'
            );
        if is_token {
            escaped.push(char::from(byte));
        } else {
            let _ = write!(escaped, "%{byte:02X}");
        }
    }
    escaped
}
