use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequestParts, Query, State},
    http::request::Parts,
    routing::get,
    Json, Router,
};
use axum_extra::{headers::Host, TypedHeader};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::services::sites::{Site, SiteInfo};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/sites", get(list_sites))
}

#[derive(Debug, Default, Deserialize)]
struct SiteQuery {
    site: Option<String>,
}

/// The site a request addresses: `?site=` first, then the Host header, then
/// the default site.
pub struct CurrentSite(pub Site);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for CurrentSite {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let query = Query::<SiteQuery>::try_from_uri(&parts.uri)
            .map(|Query(q)| q)
            .unwrap_or_default();
        let host = TypedHeader::<Host>::from_request_parts(parts, state)
            .await
            .ok()
            .map(|TypedHeader(host)| host.hostname().to_string());

        let site = state
            .sites
            .resolve(query.site.as_deref(), host.as_deref())?;
        Ok(CurrentSite(site.clone()))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SitesResponse {
    default_site: String,
    sites: Vec<SiteInfo>,
}

async fn list_sites(State(state): State<Arc<AppState>>) -> Result<Json<SitesResponse>, AppError> {
    let default_site = state.sites.default_site()?.slug.clone();
    Ok(Json(SitesResponse {
        default_site,
        sites: state.sites.all().iter().map(Site::info).collect(),
    }))
}
