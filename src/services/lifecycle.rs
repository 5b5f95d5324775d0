//! Trip lifecycle: aggregate creation, status transitions, cancellation
//! flows and report review bookkeeping.

use chrono::Utc;
use serde_json::json;
use sqlx::sqlite::SqliteQueryResult;
use uuid::Uuid;

use crate::{
    db::DbPool,
    error::AppError,
    models::{
        member::{MemberStatus, TripMember},
        stop::{CreateStopRequest, Stop, StopKind},
        trip::{
            CancelTripRequest, CreateTripRequest, NoShowRequest, Trip, TripAggregate, TripQuery,
            TripStatus, UpdateTripRequest,
        },
    },
    services::{audit::AuditService, roster::RosterService},
};

pub(crate) const TRIP_COLUMNS: &str = "id, org_id, trip_date, trip_type, status, driver_id, \
     vehicle_id, carpool, mobility, reason, notes, started_at, completed_at, cancel_reason, \
     cancelled_by, cancelled_at, cancel_notes, review_status, review_rejection_reason, \
     reviewed_by, reviewed_at, created_by, version, created_at, updated_at";
pub(crate) const STOP_COLUMNS: &str = "id, trip_id, kind, stop_order, address, lat, lon, \
     scheduled_at, arrived_at, departed_at, odometer";
pub(crate) const TRIP_MEMBER_COLUMNS: &str = "id, trip_id, member_id, status, pickup_stop_id, \
     dropoff_stop_id, signature, is_proxy_signature, proxy_signer_name, proxy_relationship, \
     proxy_reason, ready_at, notified_at";

/// Owns every write against the `trips` table.
///
/// Status changes go through the transition table on [`TripStatus`] and are
/// applied with a compare-and-swap on the row version, so two racing updates
/// resolve to one winner and one `Conflict`.
#[derive(Clone)]
pub struct TripService {
    db: DbPool,
    roster: RosterService,
    audit: AuditService,
}

impl TripService {
    pub fn new(db: DbPool, roster: RosterService, audit: AuditService) -> Self {
        Self { db, roster, audit }
    }

    /// Creates the trip together with its stops and member manifest in one
    /// transaction. A failure on any row leaves nothing behind.
    pub async fn create_trip(
        &self,
        org_id: &str,
        actor: &str,
        req: CreateTripRequest,
    ) -> Result<TripAggregate, AppError> {
        if req.members.is_empty() {
            return Err(AppError::BadRequest(
                "a trip requires at least one member".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for entry in &req.members {
            if !seen.insert(entry.member_id.as_str()) {
                return Err(AppError::BadRequest(format!(
                    "member {} appears more than once on the manifest",
                    entry.member_id
                )));
            }
        }
        if !req.stops.iter().any(|s| s.kind == StopKind::Pickup)
            || !req.stops.iter().any(|s| s.kind == StopKind::Dropoff)
        {
            return Err(AppError::BadRequest(
                "a trip requires at least one pickup and one dropoff stop".into(),
            ));
        }
        let orders = resolve_stop_orders(&req.stops)?;

        let mut vehicle_id = req.vehicle_id.clone();
        if let Some(driver_id) = &req.driver_id {
            let driver = self.roster.require_active_driver(org_id, driver_id).await?;
            if vehicle_id.is_none() {
                vehicle_id = driver.default_vehicle_id.clone();
            }
        }
        if let Some(vid) = &vehicle_id {
            self.roster.vehicle(org_id, vid).await?;
        }
        for entry in &req.members {
            self.roster.member(org_id, &entry.member_id).await?;
        }

        let now = Utc::now();
        let trip_id = Uuid::new_v4().to_string();
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "INSERT INTO trips (id, org_id, trip_date, trip_type, status, driver_id, vehicle_id, \
             carpool, mobility, reason, notes, created_by, version, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, ?13, ?13)",
        )
        .bind(&trip_id)
        .bind(org_id)
        .bind(req.trip_date)
        .bind(req.trip_type)
        .bind(TripStatus::PendingApproval)
        .bind(&req.driver_id)
        .bind(&vehicle_id)
        .bind(req.carpool)
        .bind(&req.mobility)
        .bind(&req.reason)
        .bind(&req.notes)
        .bind(actor)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let mut inserted: Vec<(i64, String, StopKind)> = Vec::with_capacity(req.stops.len());
        for (stop, order) in req.stops.iter().zip(&orders) {
            let stop_id = Uuid::new_v4().to_string();
            sqlx::query(
                "INSERT INTO stops (id, trip_id, kind, stop_order, address, lat, lon, scheduled_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .bind(&stop_id)
            .bind(&trip_id)
            .bind(stop.kind)
            .bind(*order)
            .bind(&stop.address)
            .bind(stop.lat)
            .bind(stop.lon)
            .bind(stop.scheduled_at)
            .execute(&mut *tx)
            .await?;
            inserted.push((*order, stop_id, stop.kind));
        }

        let default_pickup = inserted
            .iter()
            .filter(|(_, _, kind)| *kind == StopKind::Pickup)
            .min_by_key(|(order, _, _)| *order)
            .map(|(_, id, _)| id.clone());
        let default_dropoff = inserted
            .iter()
            .filter(|(_, _, kind)| *kind == StopKind::Dropoff)
            .max_by_key(|(order, _, _)| *order)
            .map(|(_, id, _)| id.clone());

        for entry in &req.members {
            let pickup_stop_id = match entry.pickup_stop_order {
                Some(order) => Some(find_stop_by_order(&inserted, order).ok_or_else(|| {
                    AppError::BadRequest(format!("pickupStopOrder {order} does not match any stop"))
                })?),
                None => default_pickup.clone(),
            };
            let dropoff_stop_id = match entry.dropoff_stop_order {
                Some(order) => Some(find_stop_by_order(&inserted, order).ok_or_else(|| {
                    AppError::BadRequest(format!(
                        "dropoffStopOrder {order} does not match any stop"
                    ))
                })?),
                None => default_dropoff.clone(),
            };
            sqlx::query(
                "INSERT INTO trip_members (id, trip_id, member_id, status, pickup_stop_id, dropoff_stop_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&trip_id)
            .bind(&entry.member_id)
            .bind(MemberStatus::Scheduled)
            .bind(&pickup_stop_id)
            .bind(&dropoff_stop_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.audit.record(
            org_id,
            Some(actor),
            "trip.created",
            json!({ "tripId": trip_id, "tripDate": req.trip_date }),
        );
        self.get_trip(org_id, &trip_id).await
    }

    pub async fn get_trip(&self, org_id: &str, trip_id: &str) -> Result<TripAggregate, AppError> {
        let trip = self.load_trip(org_id, trip_id).await?;
        self.load_aggregate(trip).await
    }

    pub async fn list_trips(
        &self,
        org_id: &str,
        query: &TripQuery,
    ) -> Result<Vec<Trip>, AppError> {
        let base = format!("SELECT {TRIP_COLUMNS} FROM trips WHERE org_id = ?1");
        let trips = if let Some(date) = query.date {
            sqlx::query_as::<_, Trip>(&format!("{base} AND trip_date = ?2 ORDER BY created_at"))
                .bind(org_id)
                .bind(date)
                .fetch_all(&self.db)
                .await?
        } else {
            match (query.start_date, query.end_date) {
                (Some(start), Some(end)) => {
                    sqlx::query_as::<_, Trip>(&format!(
                        "{base} AND trip_date >= ?2 AND trip_date <= ?3 \
                         ORDER BY trip_date, created_at"
                    ))
                    .bind(org_id)
                    .bind(start)
                    .bind(end)
                    .fetch_all(&self.db)
                    .await?
                }
                (Some(start), None) => {
                    sqlx::query_as::<_, Trip>(&format!(
                        "{base} AND trip_date >= ?2 ORDER BY trip_date, created_at"
                    ))
                    .bind(org_id)
                    .bind(start)
                    .fetch_all(&self.db)
                    .await?
                }
                (None, Some(end)) => {
                    sqlx::query_as::<_, Trip>(&format!(
                        "{base} AND trip_date <= ?2 ORDER BY trip_date, created_at"
                    ))
                    .bind(org_id)
                    .bind(end)
                    .fetch_all(&self.db)
                    .await?
                }
                (None, None) => {
                    sqlx::query_as::<_, Trip>(&format!(
                        "{base} ORDER BY trip_date DESC, created_at"
                    ))
                    .bind(org_id)
                    .fetch_all(&self.db)
                    .await?
                }
            }
        };
        Ok(trips)
    }

    /// Driver manifest view: full aggregates, newest service date first.
    pub async fn list_driver_trips(
        &self,
        org_id: &str,
        driver_id: &str,
    ) -> Result<Vec<TripAggregate>, AppError> {
        let trips = sqlx::query_as::<_, Trip>(&format!(
            "SELECT {TRIP_COLUMNS} FROM trips WHERE org_id = ?1 AND driver_id = ?2 \
             ORDER BY trip_date DESC, created_at"
        ))
        .bind(org_id)
        .bind(driver_id)
        .fetch_all(&self.db)
        .await?;
        let mut aggregates = Vec::with_capacity(trips.len());
        for trip in trips {
            aggregates.push(self.load_aggregate(trip).await?);
        }
        Ok(aggregates)
    }

    /// Applies a partial update. Locked trips only accept the single
    /// COMPLETED -> FINALIZED patch; any status change goes through the
    /// transition table first.
    pub async fn update_trip(
        &self,
        org_id: &str,
        trip_id: &str,
        actor: &str,
        patch: UpdateTripRequest,
    ) -> Result<TripAggregate, AppError> {
        let trip = self.load_trip(org_id, trip_id).await?;
        if trip.status.is_locked() {
            let finalizing = trip.status == TripStatus::Completed && patch.is_finalize_only();
            if !finalizing {
                return Err(AppError::Locked(format!(
                    "trip {} is {} and can no longer be edited",
                    trip.id, trip.status
                )));
            }
        }
        let next_status = patch.status.unwrap_or(trip.status);
        if next_status != trip.status {
            ensure_transition(&trip, next_status)?;
        }
        if let Some(driver_id) = &patch.driver_id {
            self.roster.require_active_driver(org_id, driver_id).await?;
        }
        if let Some(vehicle_id) = &patch.vehicle_id {
            self.roster.vehicle(org_id, vehicle_id).await?;
        }

        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE trips SET trip_date = ?1, trip_type = ?2, status = ?3, driver_id = ?4, \
             vehicle_id = ?5, carpool = ?6, mobility = ?7, reason = ?8, notes = ?9, \
             updated_at = ?10, version = version + 1 \
             WHERE id = ?11 AND org_id = ?12 AND version = ?13",
        )
        .bind(patch.trip_date.unwrap_or(trip.trip_date))
        .bind(patch.trip_type.unwrap_or(trip.trip_type))
        .bind(next_status)
        .bind(patch.driver_id.clone().or_else(|| trip.driver_id.clone()))
        .bind(patch.vehicle_id.clone().or_else(|| trip.vehicle_id.clone()))
        .bind(patch.carpool.unwrap_or(trip.carpool))
        .bind(patch.mobility.clone().or_else(|| trip.mobility.clone()))
        .bind(patch.reason.clone().or_else(|| trip.reason.clone()))
        .bind(patch.notes.clone().or_else(|| trip.notes.clone()))
        .bind(now)
        .bind(trip_id)
        .bind(org_id)
        .bind(trip.version)
        .execute(&self.db)
        .await?;
        ensure_applied(result)?;

        self.audit.record(
            org_id,
            Some(actor),
            "trip.updated",
            json!({ "tripId": trip_id, "status": next_status }),
        );
        self.get_trip(org_id, trip_id).await
    }

    /// Moves the trip to IN_PROGRESS and stamps `started_at` on the first
    /// start only; re-entry from WAITING_FOR_CLIENTS keeps the original.
    pub async fn start_trip(&self, org_id: &str, trip_id: &str) -> Result<Trip, AppError> {
        let trip = self.load_trip(org_id, trip_id).await?;
        ensure_transition(&trip, TripStatus::InProgress)?;
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE trips SET status = ?1, started_at = COALESCE(started_at, ?2), \
             updated_at = ?2, version = version + 1 \
             WHERE id = ?3 AND org_id = ?4 AND version = ?5",
        )
        .bind(TripStatus::InProgress)
        .bind(now)
        .bind(trip_id)
        .bind(org_id)
        .bind(trip.version)
        .execute(&self.db)
        .await?;
        ensure_applied(result)?;
        self.load_trip(org_id, trip_id).await
    }

    /// Completes the trip and settles every dropped-off manifest entry to
    /// COMPLETED in the same transaction.
    pub async fn complete_trip(&self, org_id: &str, trip_id: &str) -> Result<Trip, AppError> {
        let trip = self.load_trip(org_id, trip_id).await?;
        ensure_transition(&trip, TripStatus::Completed)?;
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let result = sqlx::query(
            "UPDATE trips SET status = ?1, completed_at = ?2, updated_at = ?2, \
             version = version + 1 WHERE id = ?3 AND org_id = ?4 AND version = ?5",
        )
        .bind(TripStatus::Completed)
        .bind(now)
        .bind(trip_id)
        .bind(org_id)
        .bind(trip.version)
        .execute(&mut *tx)
        .await?;
        ensure_applied(result)?;
        sqlx::query("UPDATE trip_members SET status = ?1 WHERE trip_id = ?2 AND status = ?3")
            .bind(MemberStatus::Completed)
            .bind(trip_id)
            .bind(MemberStatus::DroppedOff)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.audit.record(
            org_id,
            None,
            "trip.completed",
            json!({ "tripId": trip_id }),
        );
        self.load_trip(org_id, trip_id).await
    }

    pub async fn cancel_trip(
        &self,
        org_id: &str,
        trip_id: &str,
        actor: &str,
        req: CancelTripRequest,
    ) -> Result<Trip, AppError> {
        if req.reason.trim().is_empty() {
            return Err(AppError::BadRequest("cancellation requires a reason".into()));
        }
        let trip = self.load_trip(org_id, trip_id).await?;
        if trip.status.is_locked() {
            return Err(AppError::Locked(format!(
                "trip {} is {} and can no longer be cancelled",
                trip.id, trip.status
            )));
        }
        ensure_transition(&trip, TripStatus::Cancelled)?;
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE trips SET status = ?1, cancel_reason = ?2, cancelled_by = ?3, \
             cancelled_at = ?4, cancel_notes = ?5, updated_at = ?4, version = version + 1 \
             WHERE id = ?6 AND org_id = ?7 AND version = ?8",
        )
        .bind(TripStatus::Cancelled)
        .bind(req.reason.trim())
        .bind(actor)
        .bind(now)
        .bind(&req.notes)
        .bind(trip_id)
        .bind(org_id)
        .bind(trip.version)
        .execute(&self.db)
        .await?;
        ensure_applied(result)?;

        self.audit.record(
            org_id,
            Some(actor),
            "trip.cancelled",
            json!({ "tripId": trip_id, "reason": req.reason }),
        );
        self.load_trip(org_id, trip_id).await
    }

    /// No-show is its own operation, not a cancel variant: it only applies to
    /// SCHEDULED and IN_PROGRESS trips and always records whether the member
    /// was contacted.
    pub async fn mark_no_show(
        &self,
        org_id: &str,
        trip_id: &str,
        actor: &str,
        req: NoShowRequest,
    ) -> Result<Trip, AppError> {
        let trip = self.load_trip(org_id, trip_id).await?;
        if !matches!(
            trip.status,
            TripStatus::Scheduled | TripStatus::InProgress
        ) {
            return Err(AppError::InvalidTransition {
                from: trip.status,
                to: TripStatus::NoShow,
            });
        }
        let notes = no_show_notes(req.notes.as_deref(), req.attempted_contact);
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE trips SET status = ?1, cancel_reason = ?2, cancelled_by = ?3, \
             cancelled_at = ?4, cancel_notes = ?5, updated_at = ?4, version = version + 1 \
             WHERE id = ?6 AND org_id = ?7 AND version = ?8",
        )
        .bind(TripStatus::NoShow)
        .bind("NO_SHOW")
        .bind(actor)
        .bind(now)
        .bind(&notes)
        .bind(trip_id)
        .bind(org_id)
        .bind(trip.version)
        .execute(&self.db)
        .await?;
        ensure_applied(result)?;

        self.audit.record(
            org_id,
            Some(actor),
            "trip.no_show",
            json!({ "tripId": trip_id, "attemptedContact": req.attempted_contact }),
        );
        self.load_trip(org_id, trip_id).await
    }

    /// Review columns sit outside the edit lock, so a finalized trip can
    /// still be verified. The update touches nothing the lock protects.
    pub async fn verify_report(
        &self,
        org_id: &str,
        trip_id: &str,
        verifier: &str,
    ) -> Result<Trip, AppError> {
        self.load_trip(org_id, trip_id).await?;
        let now = Utc::now();
        sqlx::query(
            "UPDATE trips SET review_status = ?1, review_rejection_reason = NULL, \
             reviewed_by = ?2, reviewed_at = ?3, updated_at = ?3 \
             WHERE id = ?4 AND org_id = ?5",
        )
        .bind(crate::models::trip::ReviewStatus::Verified)
        .bind(verifier)
        .bind(now)
        .bind(trip_id)
        .bind(org_id)
        .execute(&self.db)
        .await?;

        self.audit.record(
            org_id,
            Some(verifier),
            "trip.report_verified",
            json!({ "tripId": trip_id }),
        );
        self.load_trip(org_id, trip_id).await
    }

    pub async fn reject_report(
        &self,
        org_id: &str,
        trip_id: &str,
        verifier: &str,
        reason: &str,
    ) -> Result<Trip, AppError> {
        if reason.trim().is_empty() {
            return Err(AppError::BadRequest("rejection requires a reason".into()));
        }
        self.load_trip(org_id, trip_id).await?;
        let now = Utc::now();
        sqlx::query(
            "UPDATE trips SET review_status = ?1, review_rejection_reason = ?2, \
             reviewed_by = ?3, reviewed_at = ?4, updated_at = ?4 \
             WHERE id = ?5 AND org_id = ?6",
        )
        .bind(crate::models::trip::ReviewStatus::Rejected)
        .bind(reason.trim())
        .bind(verifier)
        .bind(now)
        .bind(trip_id)
        .bind(org_id)
        .execute(&self.db)
        .await?;

        self.audit.record(
            org_id,
            Some(verifier),
            "trip.report_rejected",
            json!({ "tripId": trip_id, "reason": reason }),
        );
        self.load_trip(org_id, trip_id).await
    }

    pub(crate) async fn load_trip(&self, org_id: &str, trip_id: &str) -> Result<Trip, AppError> {
        sqlx::query_as::<_, Trip>(&format!(
            "SELECT {TRIP_COLUMNS} FROM trips WHERE id = ?1 AND org_id = ?2"
        ))
        .bind(trip_id)
        .bind(org_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("trip {trip_id}")))
    }

    async fn load_aggregate(&self, trip: Trip) -> Result<TripAggregate, AppError> {
        let stops = sqlx::query_as::<_, Stop>(&format!(
            "SELECT {STOP_COLUMNS} FROM stops WHERE trip_id = ?1 ORDER BY stop_order"
        ))
        .bind(&trip.id)
        .fetch_all(&self.db)
        .await?;
        let members = sqlx::query_as::<_, TripMember>(&format!(
            "SELECT {TRIP_MEMBER_COLUMNS} FROM trip_members WHERE trip_id = ?1 ORDER BY rowid"
        ))
        .bind(&trip.id)
        .fetch_all(&self.db)
        .await?;
        Ok(TripAggregate {
            trip,
            stops,
            members,
        })
    }
}

fn ensure_transition(trip: &Trip, next: TripStatus) -> Result<(), AppError> {
    if trip.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(AppError::InvalidTransition {
            from: trip.status,
            to: next,
        })
    }
}

fn ensure_applied(result: SqliteQueryResult) -> Result<(), AppError> {
    if result.rows_affected() == 0 {
        return Err(AppError::Conflict(
            "trip was modified concurrently, retry".into(),
        ));
    }
    Ok(())
}

/// Stop ordering is all-or-nothing: either every stop carries an explicit
/// order covering 1..N, or none does and request order is kept.
fn resolve_stop_orders(stops: &[CreateStopRequest]) -> Result<Vec<i64>, AppError> {
    let explicit = stops.iter().filter(|s| s.order.is_some()).count();
    if explicit == 0 {
        return Ok((1..=stops.len() as i64).collect());
    }
    if explicit != stops.len() {
        return Err(AppError::BadRequest(
            "stop order must be set on every stop or on none".into(),
        ));
    }
    let orders: Vec<i64> = stops.iter().map(|s| s.order.unwrap_or_default()).collect();
    let mut sorted = orders.clone();
    sorted.sort_unstable();
    let expected: Vec<i64> = (1..=stops.len() as i64).collect();
    if sorted != expected {
        return Err(AppError::BadRequest(format!(
            "stop orders must cover 1..{} without gaps or duplicates",
            stops.len()
        )));
    }
    Ok(orders)
}

fn find_stop_by_order(stops: &[(i64, String, StopKind)], order: i64) -> Option<String> {
    stops
        .iter()
        .find(|(stop_order, _, _)| *stop_order == order)
        .map(|(_, id, _)| id.clone())
}

fn no_show_notes(notes: Option<&str>, attempted_contact: bool) -> String {
    let contact = if attempted_contact {
        "Attempted contact: Yes."
    } else {
        "Attempted contact: No."
    };
    match notes {
        Some(extra) if !extra.trim().is_empty() => {
            format!("Marked as no-show. {contact} {extra}")
        }
        _ => format!("Marked as no-show. {contact}"),
    }
}
