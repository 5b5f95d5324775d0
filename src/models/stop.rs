use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopKind {
    Pickup,
    Dropoff,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Stop {
    pub id: String,
    pub trip_id: String,
    pub kind: StopKind,
    #[serde(rename = "order")]
    pub stop_order: i64,
    pub address: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub arrived_at: Option<DateTime<Utc>>,
    pub departed_at: Option<DateTime<Utc>>,
    pub odometer: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStopRequest {
    pub kind: StopKind,
    pub address: String,
    /// 1-based position. Either every stop names one or none does; when
    /// absent, stops are numbered in the order they were sent.
    pub order: Option<i64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct GpsPoint {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArriveStopRequest {
    pub gps: Option<GpsPoint>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteStopRequest {
    pub odometer: Option<f64>,
}
