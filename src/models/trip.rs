use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use sqlx::FromRow;

use super::member::{CreateTripMemberRequest, TripMember};
use super::stop::{CreateStopRequest, Stop};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripStatus {
    PendingApproval,
    Scheduled,
    InProgress,
    WaitingForClients,
    Completed,
    Finalized,
    Cancelled,
    NoShow,
}

impl TripStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripStatus::PendingApproval => "PENDING_APPROVAL",
            TripStatus::Scheduled => "SCHEDULED",
            TripStatus::InProgress => "IN_PROGRESS",
            TripStatus::WaitingForClients => "WAITING_FOR_CLIENTS",
            TripStatus::Completed => "COMPLETED",
            TripStatus::Finalized => "FINALIZED",
            TripStatus::Cancelled => "CANCELLED",
            TripStatus::NoShow => "NO_SHOW",
        }
    }

    /// The transition table. `NO_SHOW` is deliberately unreachable here;
    /// it is entered only through the dedicated no-show operation.
    pub fn can_transition_to(self, next: TripStatus) -> bool {
        use TripStatus::*;
        match self {
            PendingApproval => matches!(next, Scheduled | Cancelled),
            Scheduled => matches!(next, InProgress | Cancelled),
            InProgress => matches!(next, WaitingForClients | Completed | Cancelled),
            WaitingForClients => matches!(next, InProgress | Completed),
            Completed => matches!(next, Finalized),
            Finalized | Cancelled | NoShow => false,
        }
    }

    /// Locked trips accept no edit except the COMPLETED -> FINALIZED step.
    pub fn is_locked(self) -> bool {
        matches!(self, TripStatus::Completed | TripStatus::Finalized)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TripStatus::Finalized | TripStatus::Cancelled | TripStatus::NoShow
        )
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripType {
    DropOff,
    PickUp,
    RoundTrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewStatus {
    Verified,
    Rejected,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub id: String,
    pub org_id: String,
    pub trip_date: NaiveDate,
    pub trip_type: TripType,
    pub status: TripStatus,
    pub driver_id: Option<String>,
    pub vehicle_id: Option<String>,
    pub carpool: bool,
    pub mobility: Option<String>,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub cancelled_by: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancel_notes: Option<String>,
    pub review_status: Option<ReviewStatus>,
    pub review_rejection_reason: Option<String>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The persisted entity graph the state machine operates on.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TripAggregate {
    #[serde(flatten)]
    pub trip: Trip,
    pub stops: Vec<Stop>,
    pub members: Vec<TripMember>,
}

fn default_false() -> bool {
    false
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTripRequest {
    pub trip_date: NaiveDate,
    pub trip_type: TripType,
    pub driver_id: Option<String>,
    pub vehicle_id: Option<String>,
    #[serde(default = "default_false")]
    pub carpool: bool,
    pub mobility: Option<String>,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub stops: Vec<CreateStopRequest>,
    pub members: Vec<CreateTripMemberRequest>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTripRequest {
    pub trip_date: Option<NaiveDate>,
    pub trip_type: Option<TripType>,
    pub status: Option<TripStatus>,
    pub driver_id: Option<String>,
    pub vehicle_id: Option<String>,
    pub carpool: Option<bool>,
    pub mobility: Option<String>,
    pub reason: Option<String>,
    pub notes: Option<String>,
}

impl UpdateTripRequest {
    /// The single patch a locked trip still accepts.
    pub fn is_finalize_only(&self) -> bool {
        self.status == Some(TripStatus::Finalized)
            && self.trip_date.is_none()
            && self.trip_type.is_none()
            && self.driver_id.is_none()
            && self.vehicle_id.is_none()
            && self.carpool.is_none()
            && self.mobility.is_none()
            && self.reason.is_none()
            && self.notes.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTripRequest {
    pub reason: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoShowRequest {
    pub notes: Option<String>,
    #[serde(default = "default_false")]
    pub attempted_contact: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectReportRequest {
    pub reason: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripQuery {
    pub date: Option<NaiveDate>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}
