use crate::configuration::OidcConfig;
use crate::proxy::{AuthError, VerifiedIdentity};
use serde_json::{Map, Value};

const EMAIL_CLAIM: &str = "email";
const EMAIL_VERIFIED_CLAIM: &str = "email_verified";
const DISABLED_PREFIX: &str = "-";

/// Maps validated token claims onto an identity.
///
/// A missing username claim produces an empty name, which the pipeline
/// refuses to forward.
pub fn map_claims(
    config: &OidcConfig,
    claims: &Map<String, Value>,
) -> Result<VerifiedIdentity, AuthError> {
    check_required_claims(config, claims)?;

    let name = match claims.get(&config.username_claim) {
        Some(Value::String(username)) if !username.is_empty() => {
            if config.username_claim == EMAIL_CLAIM {
                check_email_verified(claims)?;
            }
            format!("{}{username}", username_prefix(config))
        }
        Some(Value::String(_)) | None => String::new(),
        Some(other) => {
            return Err(AuthError::InvalidToken(format!(
                "claim '{}' is not a string: {other}",
                config.username_claim
            )))
        }
    };

    let groups = match &config.groups_claim {
        Some(claim) => groups(claim, claims)?,
        None => Vec::new(),
    };
    let groups_prefix = config.groups_prefix.as_deref().unwrap_or_default();

    Ok(VerifiedIdentity {
        name,
        groups: groups
            .into_iter()
            .map(|group| format!("{groups_prefix}{group}"))
            .collect(),
        ..Default::default()
    })
}

fn username_prefix(config: &OidcConfig) -> String {
    match config.username_prefix.as_deref() {
        Some(DISABLED_PREFIX) => String::new(),
        Some(prefix) => prefix.to_string(),
        None if config.username_claim == EMAIL_CLAIM => String::new(),
        None => format!("{}#", config.issuer_url),
    }
}

fn check_email_verified(claims: &Map<String, Value>) -> Result<(), AuthError> {
    match claims.get(EMAIL_VERIFIED_CLAIM) {
        None | Some(Value::Bool(true)) => Ok(()),
        Some(Value::Bool(false)) => Err(AuthError::InvalidToken(
            "email not verified".to_string(),
        )),
        Some(other) => Err(AuthError::InvalidToken(format!(
            "claim '{EMAIL_VERIFIED_CLAIM}' is not a boolean: {other}"
        ))),
    }
}

fn check_required_claims(
    config: &OidcConfig,
    claims: &Map<String, Value>,
) -> Result<(), AuthError> {
    for (claim, expected) in &config.required_claims {
        match claims.get(claim) {
            Some(Value::String(value)) if value == expected => {}
            Some(_) => {
                return Err(AuthError::InvalidToken(format!(
                    "required claim '{claim}' does not match"
                )))
            }
            None => {
                return Err(AuthError::InvalidToken(format!(
                    "required claim '{claim}' is missing"
                )))
            }
        }
    }

    Ok(())
}

fn groups(claim: &str, claims: &Map<String, Value>) -> Result<Vec<String>, AuthError> {
    match claims.get(claim) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(group)) => Ok(vec![group.clone()]),
        Some(Value::Array(values)) => values
            .iter()
            .map(|value| match value {
                Value::String(group) => Ok(group.clone()),
                other => Err(AuthError::InvalidToken(format!(
                    "claim '{claim}' contains a non-string value: {other}"
                ))),
            })
            .collect(),
        Some(other) => Err(AuthError::InvalidToken(format!(
            "claim '{claim}' is neither a string nor an array: {other}"
        ))),
    }
}
