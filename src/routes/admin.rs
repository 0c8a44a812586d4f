use axum::{Json, Router, extract::State, routing::post};

use crate::{
    error::AppResult, middleware::auth::AuthUser, response::ApiResponse,
    services::aggregate_service, state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/aggregates/recompute", post(recompute_aggregates))
}

#[utoipa::path(
    post,
    path = "/api/admin/aggregates/recompute",
    responses(
        (status = 200, description = "Rebuild sales and rating aggregates of every product"),
        (status = 403, description = "Forbidden"),
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn recompute_aggregates(
    State(state): State<AppState>,
    user: AuthUser,
) -> AppResult<Json<ApiResponse<serde_json::Value>>> {
    let resp = aggregate_service::rebuild_aggregates(&state, &user).await?;
    Ok(Json(resp))
}
