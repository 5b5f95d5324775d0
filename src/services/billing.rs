//! Claim generation for completed trips.
//!
//! A trip can only ever produce one claim. The guarantee lives in the
//! database: `claims.trip_id` is unique and generation inserts with
//! `ON CONFLICT DO NOTHING`, so two racing batches cannot both win.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::{
    db::DbPool,
    error::AppError,
    models::claim::{Claim, ClaimStatus, DEFAULT_BILLED_AMOUNT_CENTS, DEFAULT_PROCEDURE_CODE},
    services::audit::AuditService,
};

const CLAIM_COLUMNS: &str = "id, claim_number, trip_id, org_id, status, procedure_code, \
     diagnosis_code, billed_amount_cents, submission_payload, response_payload, \
     created_at, updated_at";

#[derive(Clone)]
pub struct BillingService {
    db: DbPool,
    audit: AuditService,
}

impl BillingService {
    pub fn new(db: DbPool, audit: AuditService) -> Self {
        Self { db, audit }
    }

    /// Creates claims for the given trips, skipping any trip that already
    /// has one. Returns only the claims created by this call.
    pub async fn generate_claims_for_trips(
        &self,
        org_id: &str,
        actor: Option<&str>,
        trip_ids: &[String],
    ) -> Result<Vec<Claim>, AppError> {
        let mut created = Vec::new();
        for trip_id in trip_ids {
            let exists =
                sqlx::query_scalar::<_, String>("SELECT id FROM trips WHERE id = ?1 AND org_id = ?2")
                    .bind(trip_id)
                    .bind(org_id)
                    .fetch_optional(&self.db)
                    .await?;
            if exists.is_none() {
                return Err(AppError::NotFound(format!("trip {trip_id}")));
            }

            let now = Utc::now();
            let claim_id = Uuid::new_v4().to_string();
            let claim_number = claim_number_for(trip_id, now.timestamp_millis());
            let result = sqlx::query(
                "INSERT INTO claims (id, claim_number, trip_id, org_id, status, procedure_code, \
                 billed_amount_cents, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8) \
                 ON CONFLICT (trip_id) DO NOTHING",
            )
            .bind(&claim_id)
            .bind(&claim_number)
            .bind(trip_id)
            .bind(org_id)
            .bind(ClaimStatus::Unbilled)
            .bind(DEFAULT_PROCEDURE_CODE)
            .bind(DEFAULT_BILLED_AMOUNT_CENTS)
            .bind(now)
            .execute(&self.db)
            .await?;
            if result.rows_affected() == 0 {
                continue;
            }

            let claim = sqlx::query_as::<_, Claim>(&format!(
                "SELECT {CLAIM_COLUMNS} FROM claims WHERE id = ?1"
            ))
            .bind(&claim_id)
            .fetch_one(&self.db)
            .await?;
            self.audit.record(
                org_id,
                actor,
                "claim.created",
                json!({ "tripId": trip_id, "claimNumber": claim.claim_number }),
            );
            created.push(claim);
        }
        Ok(created)
    }

    pub async fn unbilled_claims(&self, org_id: &str) -> Result<Vec<Claim>, AppError> {
        let claims = sqlx::query_as::<_, Claim>(&format!(
            "SELECT {CLAIM_COLUMNS} FROM claims WHERE org_id = ?1 AND status = ?2 \
             ORDER BY created_at"
        ))
        .bind(org_id)
        .bind(ClaimStatus::Unbilled)
        .fetch_all(&self.db)
        .await?;
        Ok(claims)
    }
}

/// Claim numbers carry the generation instant and a short trip handle so a
/// biller can eyeball which trip a claim belongs to.
fn claim_number_for(trip_id: &str, epoch_millis: i64) -> String {
    let handle: String = trip_id.chars().take(4).collect();
    format!("CLM-{epoch_millis}-{handle}")
}
