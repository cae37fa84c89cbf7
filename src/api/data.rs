//! Local catalog views and entry mutations.

use axum::body::Bytes;
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::PathRejection;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::HeaderMap;
use serde::Deserialize;
use tracing::info;

use super::auth::{require_admin, require_user};
use super::{ApiResult, ok};
use crate::catalog::EntryKey;
use crate::error::ServiceError;
use crate::service::DataLinkService;
use crate::transfer::TransferError;

/// Body of `PATCH /data/:user/:source/:id`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct EntryPatch {
    in_use: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub(super) struct FetchQuery {
    force: Option<String>,
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "" | "1" | "true" | "yes")
}

pub(super) async fn stats(State(service): State<DataLinkService>) -> ApiResult {
    Ok(ok("ok", service.stats()))
}

pub(super) async fn view_all(State(service): State<DataLinkService>, headers: HeaderMap) -> ApiResult {
    require_admin(&service, &headers)?;
    let all = service.view_all();
    Ok(ok(format!("{} users", all.len()), all))
}

pub(super) async fn view_user(
    State(service): State<DataLinkService>,
    headers: HeaderMap,
    Path(user): Path<String>,
) -> ApiResult {
    require_user(&service, &headers, &user).await?;
    Ok(ok(user.clone(), service.view_user(&user)?))
}

pub(super) async fn view_source(
    State(service): State<DataLinkService>,
    headers: HeaderMap,
    Path((user, source)): Path<(String, String)>,
) -> ApiResult {
    require_user(&service, &headers, &user).await?;
    let entries = service.view_source(&user, &source)?;
    Ok(ok(format!("{} entries", entries.len()), entries))
}

async fn authorized_key(
    service: &DataLinkService,
    headers: &HeaderMap,
    (user, source, id): (String, String, String),
) -> Result<EntryKey, ServiceError> {
    require_user(service, headers, &user).await?;
    Ok(EntryKey::new(user, source, id)?)
}

pub(super) async fn view_entry(
    State(service): State<DataLinkService>,
    headers: HeaderMap,
    Path(path): Path<(String, String, String)>,
) -> ApiResult {
    let key = authorized_key(&service, &headers, path).await?;
    let entry = service.view_entry(&key)?;
    Ok(ok(entry.status.as_str(), entry))
}

pub(super) async fn fetch(
    State(service): State<DataLinkService>,
    headers: HeaderMap,
    Path(path): Path<(String, String, String)>,
    Query(query): Query<FetchQuery>,
) -> ApiResult {
    let key = authorized_key(&service, &headers, path).await?;
    let force = query.force.as_deref().is_some_and(is_truthy);
    let outcome = service.fetch(&key, force).await?;
    let entry = service.catalog().get_entry(&key);
    Ok(ok(outcome.message(), entry))
}

pub(super) async fn remove(
    State(service): State<DataLinkService>,
    headers: HeaderMap,
    Path(path): Path<(String, String, String)>,
) -> ApiResult {
    let key = authorized_key(&service, &headers, path).await?;
    service.remove(&key).await?;
    Ok(ok("removed", key.to_string()))
}

pub(super) async fn abort(
    State(service): State<DataLinkService>,
    headers: HeaderMap,
    Path(path): Path<(String, String, String)>,
) -> ApiResult {
    let key = authorized_key(&service, &headers, path).await?;
    let entry = service.abort(&key).await?;
    Ok(ok(entry.status.as_str(), entry))
}

pub(super) async fn update(
    State(service): State<DataLinkService>,
    headers: HeaderMap,
    Path(path): Path<(String, String, String)>,
    body: Bytes,
) -> ApiResult {
    let key = authorized_key(&service, &headers, path).await?;
    let patch: EntryPatch = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::validation(format!("invalid update: {e}")))?;
    let in_use = patch
        .in_use
        .ok_or_else(|| ServiceError::validation("nothing to update"))?;
    let entry = service.set_in_use(&key, in_use).await?;
    Ok(ok("updated", entry))
}

pub(super) async fn upload(
    State(service): State<DataLinkService>,
    headers: HeaderMap,
    path: Result<Path<(String, String, String)>, PathRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult {
    let Path(path) = path?;
    let key = authorized_key(&service, &headers, path).await?;
    let mut multipart = multipart?;
    let mut session = service.begin_upload(&key).await?;

    let mut received = 0usize;
    let result: Result<(), TransferError> = async {
        while let Some(field) = multipart.next_field().await.map_err(|e| TransferError::Upload {
            message: e.to_string(),
        })? {
            let Some(name) = field.file_name().map(str::to_string) else {
                continue;
            };
            session.write_file(&name, field).await?;
            received += 1;
        }
        if received == 0 {
            return Err(TransferError::Upload {
                message: "no files in request".to_string(),
            });
        }
        Ok(())
    }
    .await;

    let entry = service.finish_upload(session, result).await?;
    info!(entry = %key, files = received, "upload accepted");
    Ok(ok("uploaded", entry))
}
