use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

use crate::{
    error::AppError,
    models::claim::{Claim, GenerateClaimsRequest},
    scope::RequestScope,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/generate", post(generate_claims))
        .route("/unbilled", get(unbilled_claims))
}

/// Batch claim generation. Trips that already carry a claim are skipped, so
/// the response holds only what this call created.
async fn generate_claims(
    State(state): State<AppState>,
    scope: RequestScope,
    Json(req): Json<GenerateClaimsRequest>,
) -> Result<(StatusCode, Json<Vec<Claim>>), AppError> {
    if req.trip_ids.is_empty() {
        return Err(AppError::BadRequest(
            "tripIds must name at least one trip".into(),
        ));
    }
    let claims = state
        .billing
        .generate_claims_for_trips(&scope.org_id, scope.actor.as_deref(), &req.trip_ids)
        .await?;
    Ok((StatusCode::CREATED, Json(claims)))
}

async fn unbilled_claims(
    State(state): State<AppState>,
    scope: RequestScope,
) -> Result<Json<Vec<Claim>>, AppError> {
    let claims = state.billing.unbilled_claims(&scope.org_id).await?;
    Ok(Json(claims))
}
