use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use super::AppState;
use crate::db::models::CityEntry;
use crate::db::queries;
use crate::errors::AppError;

/// Number of hits returned by a search.
const DEFAULT_RESULT_COUNT: i64 = 5;

/// Queries shorter than this are rejected.
const MIN_QUERY_LEN: usize = 3;

#[derive(Debug, Deserialize, IntoParams)]
pub struct SearchParams {
    /// Name prefix to search for (at least 3 characters)
    pub query: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CitiesSearchResponse {
    pub cities: Vec<CityEntry>,
}

/// Search catalog cities by name prefix, most populous first.
#[utoipa::path(
    get,
    path = "/api/v1/cities/search",
    tag = "Cities",
    params(SearchParams),
    responses(
        (status = 200, description = "Matching cities", body = CitiesSearchResponse),
        (status = 400, description = "Query too short", body = crate::errors::ErrorResponse),
    )
)]
pub async fn search_cities(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<CitiesSearchResponse>, AppError> {
    if params.query.chars().count() < MIN_QUERY_LEN {
        return Err(AppError::BadRequest(format!(
            "search query must be at least {} characters",
            MIN_QUERY_LEN
        )));
    }

    let cities = queries::search_cities(&state.pool, &params.query, DEFAULT_RESULT_COUNT).await?;
    Ok(Json(CitiesSearchResponse { cities }))
}
