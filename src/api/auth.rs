//! Admin key and per-user token checks.

use std::path::Path;

use axum::http::HeaderMap;
use serde::Deserialize;
use tracing::debug;

use crate::catalog::validate_name;
use crate::error::ServiceError;
use crate::fs_util::read_optional;
use crate::service::DataLinkService;

/// Header carrying the admin key.
pub const ADMIN_KEY_HEADER: &str = "x-datalink-admin-key";

/// Header carrying a per-user token.
pub const TOKEN_HEADER: &str = "x-datalink-token";

#[derive(Debug, Deserialize)]
struct TokenRecord {
    token: String,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

fn is_admin(service: &DataLinkService, headers: &HeaderMap) -> bool {
    match (&service.config().admin_key, header(headers, ADMIN_KEY_HEADER)) {
        (Some(expected), Some(given)) => expected == given,
        _ => false,
    }
}

/// Requires the admin key.
pub(crate) fn require_admin(service: &DataLinkService, headers: &HeaderMap) -> Result<(), ServiceError> {
    if is_admin(service, headers) {
        Ok(())
    } else {
        Err(ServiceError::Unauthorized)
    }
}

/// Requires the admin key or `user`'s token.
///
/// # Errors
///
/// Returns a validation error for a malformed user name, or unauthorized when
/// neither credential matches.
pub(crate) async fn require_user(
    service: &DataLinkService,
    headers: &HeaderMap,
    user: &str,
) -> Result<(), ServiceError> {
    validate_name("user", user)?;
    if is_admin(service, headers) {
        return Ok(());
    }
    let Some(given) = header(headers, TOKEN_HEADER) else {
        return Err(ServiceError::Unauthorized);
    };
    match stored_token(&service.config().tokens_dir(), user).await {
        Some(expected) if expected == given => Ok(()),
        _ => {
            debug!(user, "token rejected");
            Err(ServiceError::Unauthorized)
        }
    }
}

async fn stored_token(tokens_dir: &Path, user: &str) -> Option<String> {
    let path = tokens_dir.join(format!("{user}.json"));
    let content = read_optional(&path).await.ok()??;
    let record: TokenRecord = serde_json::from_slice(&content).ok()?;
    Some(record.token).filter(|token| !token.is_empty())
}
