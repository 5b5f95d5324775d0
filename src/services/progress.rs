//! Execution-time tracking: stop arrivals and departures, member readiness
//! and dropoff signature capture.

use chrono::Utc;

use crate::{
    db::DbPool,
    error::AppError,
    models::{
        member::{MemberStatus, SignatureRequest, TripMember},
        stop::{GpsPoint, Stop, StopKind},
    },
    services::{
        lifecycle::{STOP_COLUMNS, TRIP_MEMBER_COLUMNS},
        notify::NotifyService,
    },
};

#[derive(Clone)]
pub struct ProgressService {
    db: DbPool,
    notify: NotifyService,
}

impl ProgressService {
    pub fn new(db: DbPool, notify: NotifyService) -> Self {
        Self { db, notify }
    }

    /// Stamps the arrival time and, when the device reported a fix, snaps the
    /// stop coordinates to the actual position.
    pub async fn arrive_at_stop(
        &self,
        org_id: &str,
        trip_id: &str,
        stop_id: &str,
        gps: Option<GpsPoint>,
    ) -> Result<Stop, AppError> {
        self.trip_driver(org_id, trip_id).await?;
        let stop = self.load_stop(trip_id, stop_id).await?;
        let now = Utc::now();
        sqlx::query(
            "UPDATE stops SET arrived_at = ?1, lat = COALESCE(?2, lat), lon = COALESCE(?3, lon) \
             WHERE id = ?4",
        )
        .bind(now)
        .bind(gps.as_ref().map(|p| p.lat))
        .bind(gps.as_ref().map(|p| p.lon))
        .bind(&stop.id)
        .execute(&self.db)
        .await?;
        self.load_stop(trip_id, stop_id).await
    }

    /// Stamps the departure and advances every member tied to the stop:
    /// pickups move waiting members to PICKED_UP, dropoffs move riding
    /// members to DROPPED_OFF. Members already past that point are left
    /// alone.
    pub async fn complete_stop(
        &self,
        org_id: &str,
        trip_id: &str,
        stop_id: &str,
        odometer: Option<f64>,
    ) -> Result<Stop, AppError> {
        self.trip_driver(org_id, trip_id).await?;
        let stop = self.load_stop(trip_id, stop_id).await?;
        let now = Utc::now();
        sqlx::query(
            "UPDATE stops SET departed_at = ?1, odometer = COALESCE(?2, odometer) WHERE id = ?3",
        )
        .bind(now)
        .bind(odometer)
        .bind(&stop.id)
        .execute(&self.db)
        .await?;

        match stop.kind {
            StopKind::Pickup => {
                sqlx::query(
                    "UPDATE trip_members SET status = ?1 \
                     WHERE trip_id = ?2 AND pickup_stop_id = ?3 AND status IN (?4, ?5)",
                )
                .bind(MemberStatus::PickedUp)
                .bind(trip_id)
                .bind(&stop.id)
                .bind(MemberStatus::Scheduled)
                .bind(MemberStatus::ReadyForPickup)
                .execute(&self.db)
                .await?;
            }
            StopKind::Dropoff => {
                sqlx::query(
                    "UPDATE trip_members SET status = ?1 \
                     WHERE trip_id = ?2 AND dropoff_stop_id = ?3 AND status = ?4",
                )
                .bind(MemberStatus::DroppedOff)
                .bind(trip_id)
                .bind(&stop.id)
                .bind(MemberStatus::PickedUp)
                .execute(&self.db)
                .await?;
            }
        }
        self.load_stop(trip_id, stop_id).await
    }

    /// Marks a manifest entry ready for pickup and pings the assigned driver.
    /// `notified_at` is only stamped when a notification actually went out.
    pub async fn mark_member_ready(
        &self,
        org_id: &str,
        trip_id: &str,
        member_ref: &str,
    ) -> Result<TripMember, AppError> {
        let driver_id = self.trip_driver(org_id, trip_id).await?;
        let entry = self.load_member(trip_id, member_ref).await?;
        let now = Utc::now();
        let notified_at = self.notify.is_enabled().then_some(now);
        sqlx::query(
            "UPDATE trip_members SET status = ?1, ready_at = ?2, notified_at = ?3 WHERE id = ?4",
        )
        .bind(MemberStatus::ReadyForPickup)
        .bind(now)
        .bind(notified_at)
        .bind(&entry.id)
        .execute(&self.db)
        .await?;

        self.notify
            .member_ready(org_id, trip_id, &entry.id, driver_id.as_deref());
        self.load_member(trip_id, member_ref).await
    }

    /// Stores the dropoff signature. Proxy signatures keep who signed and
    /// why alongside the strokes.
    pub async fn save_member_signature(
        &self,
        org_id: &str,
        trip_id: &str,
        member_ref: &str,
        req: SignatureRequest,
    ) -> Result<TripMember, AppError> {
        if req.signature.trim().is_empty() {
            return Err(AppError::BadRequest("signature payload is empty".into()));
        }
        if req.is_proxy_signature && req.proxy_signer_name.as_deref().unwrap_or("").trim().is_empty()
        {
            return Err(AppError::BadRequest(
                "a proxy signature requires the signer's name".into(),
            ));
        }
        self.trip_driver(org_id, trip_id).await?;
        let entry = self.load_member(trip_id, member_ref).await?;
        sqlx::query(
            "UPDATE trip_members SET signature = ?1, is_proxy_signature = ?2, \
             proxy_signer_name = ?3, proxy_relationship = ?4, proxy_reason = ?5 WHERE id = ?6",
        )
        .bind(&req.signature)
        .bind(req.is_proxy_signature)
        .bind(&req.proxy_signer_name)
        .bind(&req.proxy_relationship)
        .bind(&req.proxy_reason)
        .bind(&entry.id)
        .execute(&self.db)
        .await?;
        self.load_member(trip_id, member_ref).await
    }

    /// Confirms the trip belongs to the org and returns its driver, if any.
    async fn trip_driver(&self, org_id: &str, trip_id: &str) -> Result<Option<String>, AppError> {
        sqlx::query_scalar::<_, Option<String>>(
            "SELECT driver_id FROM trips WHERE id = ?1 AND org_id = ?2",
        )
        .bind(trip_id)
        .bind(org_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("trip {trip_id}")))
    }

    async fn load_stop(&self, trip_id: &str, stop_id: &str) -> Result<Stop, AppError> {
        sqlx::query_as::<_, Stop>(&format!(
            "SELECT {STOP_COLUMNS} FROM stops WHERE id = ?1 AND trip_id = ?2"
        ))
        .bind(stop_id)
        .bind(trip_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("stop {stop_id}")))
    }

    /// Accepts either the manifest row id or the member's own id.
    async fn load_member(&self, trip_id: &str, member_ref: &str) -> Result<TripMember, AppError> {
        sqlx::query_as::<_, TripMember>(&format!(
            "SELECT {TRIP_MEMBER_COLUMNS} FROM trip_members \
             WHERE trip_id = ?1 AND (id = ?2 OR member_id = ?2)"
        ))
        .bind(trip_id)
        .bind(member_ref)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("trip member {member_ref}")))
    }
}
