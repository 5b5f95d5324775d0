use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

use crate::{
    error::AppError,
    models::{
        member::{SignatureRequest, TripMember},
        stop::{ArriveStopRequest, CompleteStopRequest, Stop},
        trip::{
            CancelTripRequest, CreateTripRequest, NoShowRequest, RejectReportRequest, Trip,
            TripAggregate, TripQuery, UpdateTripRequest,
        },
    },
    routes::reports,
    scope::RequestScope,
    state::AppState,
};

// Data-URI signature payloads outgrow axum's 2 MB default body cap.
const SIGNATURE_BODY_LIMIT: usize = 10 * 1024 * 1024;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_trip).get(list_trips))
        .route("/driver/:driver_id", get(driver_trips))
        .route("/:id", get(get_trip).put(update_trip))
        .route("/:id/start", post(start_trip))
        .route("/:id/complete", post(complete_trip))
        .route("/:id/cancel", post(cancel_trip))
        .route("/:id/no-show", post(mark_no_show))
        .route("/:id/verify-report", post(verify_report))
        .route("/:id/reject-report", post(reject_report))
        .route("/:id/report", get(reports::download_report))
        .route("/:id/stops/:stop_id/arrive", post(arrive_at_stop))
        .route("/:id/stops/:stop_id/complete", post(complete_stop))
        .route("/:id/members/:member_ref/ready", post(mark_member_ready))
        .route(
            "/:id/members/:member_ref/signature",
            post(save_signature).layer(DefaultBodyLimit::max(SIGNATURE_BODY_LIMIT)),
        )
}

async fn create_trip(
    State(state): State<AppState>,
    scope: RequestScope,
    Json(req): Json<CreateTripRequest>,
) -> Result<(StatusCode, Json<TripAggregate>), AppError> {
    let actor = scope.require_actor()?;
    let aggregate = state.trips.create_trip(&scope.org_id, actor, req).await?;
    Ok((StatusCode::CREATED, Json(aggregate)))
}

async fn list_trips(
    State(state): State<AppState>,
    scope: RequestScope,
    Query(query): Query<TripQuery>,
) -> Result<Json<Vec<Trip>>, AppError> {
    let trips = state.trips.list_trips(&scope.org_id, &query).await?;
    Ok(Json(trips))
}

async fn driver_trips(
    State(state): State<AppState>,
    scope: RequestScope,
    Path(driver_id): Path<String>,
) -> Result<Json<Vec<TripAggregate>>, AppError> {
    let trips = state
        .trips
        .list_driver_trips(&scope.org_id, &driver_id)
        .await?;
    Ok(Json(trips))
}

async fn get_trip(
    State(state): State<AppState>,
    scope: RequestScope,
    Path(id): Path<String>,
) -> Result<Json<TripAggregate>, AppError> {
    let aggregate = state.trips.get_trip(&scope.org_id, &id).await?;
    Ok(Json(aggregate))
}

async fn update_trip(
    State(state): State<AppState>,
    scope: RequestScope,
    Path(id): Path<String>,
    Json(patch): Json<UpdateTripRequest>,
) -> Result<Json<TripAggregate>, AppError> {
    let actor = scope.require_actor()?;
    let aggregate = state
        .trips
        .update_trip(&scope.org_id, &id, actor, patch)
        .await?;
    Ok(Json(aggregate))
}

async fn start_trip(
    State(state): State<AppState>,
    scope: RequestScope,
    Path(id): Path<String>,
) -> Result<Json<Trip>, AppError> {
    let trip = state.trips.start_trip(&scope.org_id, &id).await?;
    Ok(Json(trip))
}

async fn complete_trip(
    State(state): State<AppState>,
    scope: RequestScope,
    Path(id): Path<String>,
) -> Result<Json<Trip>, AppError> {
    let trip = state.trips.complete_trip(&scope.org_id, &id).await?;
    Ok(Json(trip))
}

async fn cancel_trip(
    State(state): State<AppState>,
    scope: RequestScope,
    Path(id): Path<String>,
    Json(req): Json<CancelTripRequest>,
) -> Result<Json<Trip>, AppError> {
    let actor = scope.require_actor()?;
    let trip = state
        .trips
        .cancel_trip(&scope.org_id, &id, actor, req)
        .await?;
    Ok(Json(trip))
}

async fn mark_no_show(
    State(state): State<AppState>,
    scope: RequestScope,
    Path(id): Path<String>,
    body: Option<Json<NoShowRequest>>,
) -> Result<Json<Trip>, AppError> {
    let actor = scope.require_actor()?;
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let trip = state
        .trips
        .mark_no_show(&scope.org_id, &id, actor, req)
        .await?;
    Ok(Json(trip))
}

async fn verify_report(
    State(state): State<AppState>,
    scope: RequestScope,
    Path(id): Path<String>,
) -> Result<Json<Trip>, AppError> {
    let verifier = scope.require_actor()?;
    let trip = state.trips.verify_report(&scope.org_id, &id, verifier).await?;
    Ok(Json(trip))
}

async fn reject_report(
    State(state): State<AppState>,
    scope: RequestScope,
    Path(id): Path<String>,
    Json(req): Json<RejectReportRequest>,
) -> Result<Json<Trip>, AppError> {
    let verifier = scope.require_actor()?;
    let trip = state
        .trips
        .reject_report(&scope.org_id, &id, verifier, &req.reason)
        .await?;
    Ok(Json(trip))
}

async fn arrive_at_stop(
    State(state): State<AppState>,
    scope: RequestScope,
    Path((trip_id, stop_id)): Path<(String, String)>,
    body: Option<Json<ArriveStopRequest>>,
) -> Result<Json<Stop>, AppError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let stop = state
        .progress
        .arrive_at_stop(&scope.org_id, &trip_id, &stop_id, req.gps)
        .await?;
    Ok(Json(stop))
}

async fn complete_stop(
    State(state): State<AppState>,
    scope: RequestScope,
    Path((trip_id, stop_id)): Path<(String, String)>,
    body: Option<Json<CompleteStopRequest>>,
) -> Result<Json<Stop>, AppError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let stop = state
        .progress
        .complete_stop(&scope.org_id, &trip_id, &stop_id, req.odometer)
        .await?;
    Ok(Json(stop))
}

async fn mark_member_ready(
    State(state): State<AppState>,
    scope: RequestScope,
    Path((trip_id, member_ref)): Path<(String, String)>,
) -> Result<Json<TripMember>, AppError> {
    let entry = state
        .progress
        .mark_member_ready(&scope.org_id, &trip_id, &member_ref)
        .await?;
    Ok(Json(entry))
}

async fn save_signature(
    State(state): State<AppState>,
    scope: RequestScope,
    Path((trip_id, member_ref)): Path<(String, String)>,
    Json(req): Json<SignatureRequest>,
) -> Result<Json<TripMember>, AppError> {
    let entry = state
        .progress
        .save_member_signature(&scope.org_id, &trip_id, &member_ref, req)
        .await?;
    Ok(Json(entry))
}
