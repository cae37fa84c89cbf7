//! Connector metadata, remote catalogs and search.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use serde::Deserialize;

use super::auth::require_admin;
use super::{ApiResult, ok};
use crate::error::ServiceError;
use crate::search::SearchField;
use crate::service::DataLinkService;
use crate::source::SourceCatalog;

pub(super) async fn list(State(service): State<DataLinkService>) -> ApiResult {
    let infos = service.source_info("*")?;
    Ok(ok(format!("{} sources", infos.len()), infos))
}

pub(super) async fn show(State(service): State<DataLinkService>, Path(id): Path<String>) -> ApiResult {
    let mut infos = service.source_info(&id)?;
    if id == "*" {
        return Ok(ok(format!("{} sources", infos.len()), infos));
    }
    match infos.pop() {
        Some(info) => Ok(ok(info.name, info)),
        None => Err(ServiceError::not_found(format!("unknown source: {id}")).into()),
    }
}

pub(super) async fn catalog(State(service): State<DataLinkService>, Path(id): Path<String>) -> ApiResult {
    let catalogs = service.source_catalogs(&id)?;
    if id == "*" {
        let all: BTreeMap<&str, &SourceCatalog> = catalogs
            .iter()
            .map(|(name, catalog)| (*name, catalog.as_ref()))
            .collect();
        return Ok(ok(format!("{} catalogs", all.len()), all));
    }
    match catalogs.values().next() {
        Some(catalog) => Ok(ok(format!("{} entries", catalog.len()), catalog.as_ref())),
        None => Err(ServiceError::NotReady(format!("catalog of {id} is not available yet")).into()),
    }
}

pub(super) async fn refresh(
    State(service): State<DataLinkService>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    require_admin(&service, &headers)?;
    let started = service.refresh_sources(&id)?;
    Ok(ok("catalog refresh started", started))
}

#[derive(Debug, Deserialize)]
pub(super) struct SearchQuery {
    f: Option<String>,
    q: Option<String>,
}

pub(super) async fn search(
    State(service): State<DataLinkService>,
    Query(query): Query<SearchQuery>,
) -> ApiResult {
    let field = match query.f.as_deref() {
        None => SearchField::Pdb,
        Some(f) => f.parse::<SearchField>().map_err(ServiceError::validation)?,
    };
    let value = query
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ServiceError::validation("missing search value `q`"))?;
    run_search(&service, field, value).await
}

pub(super) async fn search_pdb(State(service): State<DataLinkService>, Path(pdb): Path<String>) -> ApiResult {
    run_search(&service, SearchField::Pdb, &pdb).await
}

async fn run_search(service: &DataLinkService, field: SearchField, value: &str) -> ApiResult {
    let results = service.search(field, value).await?;
    Ok(ok(format!("{} matches for {field} {value}", results.results.len()), results))
}
