use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberStatus {
    Scheduled,
    ReadyForPickup,
    PickedUp,
    DroppedOff,
    Completed,
}

/// One manifest entry: a member riding on a trip, with the stops that
/// pick them up and drop them off and whatever signature was captured.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TripMember {
    pub id: String,
    pub trip_id: String,
    pub member_id: String,
    pub status: MemberStatus,
    pub pickup_stop_id: Option<String>,
    pub dropoff_stop_id: Option<String>,
    pub signature: Option<String>,
    pub is_proxy_signature: bool,
    pub proxy_signer_name: Option<String>,
    pub proxy_relationship: Option<String>,
    pub proxy_reason: Option<String>,
    pub ready_at: Option<DateTime<Utc>>,
    pub notified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTripMemberRequest {
    pub member_id: String,
    /// Stop references by `order`; defaults are the first pickup and the
    /// last dropoff of the trip.
    pub pickup_stop_order: Option<i64>,
    pub dropoff_stop_order: Option<i64>,
}

/// Signature payloads are stored verbatim; whether the string is a usable
/// image data URI is the capturing client's problem until render time.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureRequest {
    pub signature: String,
    #[serde(default)]
    pub is_proxy_signature: bool,
    pub proxy_signer_name: Option<String>,
    pub proxy_relationship: Option<String>,
    pub proxy_reason: Option<String>,
}
