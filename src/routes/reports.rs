use axum::{
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;

use crate::{
    error::AppError,
    scope::RequestScope,
    services::report::ReportData,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/reports/:id/pdf", get(download_report))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReportQuery {
    member: Option<String>,
}

/// Renders the daily trip report on demand and streams it back as a PDF
/// download. Defaults to the first member on the manifest; `?member=`
/// selects another by manifest row id or member id.
pub async fn download_report(
    State(state): State<AppState>,
    scope: RequestScope,
    Path(trip_id): Path<String>,
    Query(query): Query<ReportQuery>,
) -> Result<Response, AppError> {
    let aggregate = state.trips.get_trip(&scope.org_id, &trip_id).await?;
    let manifest = match &query.member {
        Some(member_ref) => aggregate
            .members
            .iter()
            .find(|m| m.id == *member_ref || m.member_id == *member_ref)
            .ok_or_else(|| AppError::NotFound(format!("trip member {member_ref}")))?,
        None => aggregate
            .members
            .first()
            .ok_or_else(|| AppError::BadRequest("trip has no members to report on".into()))?,
    };
    let driver = match &aggregate.trip.driver_id {
        Some(id) => Some(state.roster.driver(&scope.org_id, id).await?),
        None => None,
    };
    let vehicle = match &aggregate.trip.vehicle_id {
        Some(id) => Some(state.roster.vehicle(&scope.org_id, id).await?),
        None => None,
    };
    let member = state
        .roster
        .member(&scope.org_id, &manifest.member_id)
        .await?;

    let data = ReportData::compose(
        &state.config.provider,
        &aggregate,
        driver.as_ref(),
        vehicle.as_ref(),
        &member,
        manifest,
    );
    let rendered = state.reports.generate(data).await?;

    let headers = [
        (header::CONTENT_TYPE, "application/pdf".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=trip-report-{trip_id}.pdf"),
        ),
    ];
    Ok((headers, rendered.bytes).into_response())
}
