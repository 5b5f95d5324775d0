use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod billing;
pub mod reports;
pub mod trips;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/trips", trips::router())
        .nest("/billing", billing::router())
        .merge(reports::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
