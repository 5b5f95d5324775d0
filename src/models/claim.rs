use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use sqlx::FromRow;

/// Placeholder pricing until a rating engine exists: every generated claim
/// bills the base NEMT procedure code at a flat $15.00.
pub const DEFAULT_PROCEDURE_CODE: &str = "A0120";
pub const DEFAULT_BILLED_AMOUNT_CENTS: i64 = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimStatus {
    Unbilled,
    Queued,
    Submitted,
    Paid,
    Denied,
    NeedsReview,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub id: String,
    pub claim_number: String,
    pub trip_id: String,
    pub org_id: String,
    pub status: ClaimStatus,
    pub procedure_code: String,
    pub diagnosis_code: Option<String>,
    pub billed_amount_cents: i64,
    pub submission_payload: Option<String>,
    pub response_payload: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateClaimsRequest {
    pub trip_ids: Vec<String>,
}
