use crate::{
    db::DbPool,
    error::AppError,
    models::roster::{Driver, Member, Vehicle},
};

const DRIVER_COLUMNS: &str = "id, org_id, full_name, status, default_vehicle_id, signature, created_at";
const VEHICLE_COLUMNS: &str = "id, org_id, identifier, color, make, model, vehicle_type, created_at";
const MEMBER_COLUMNS: &str =
    "id, org_id, external_id, first_name, last_name, date_of_birth, address, created_at";

/// Read-only lookups into collaborator-owned master data.
#[derive(Clone)]
pub struct RosterService {
    db: DbPool,
}

impl RosterService {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    pub async fn driver(&self, org_id: &str, driver_id: &str) -> Result<Driver, AppError> {
        sqlx::query_as::<_, Driver>(&format!(
            "SELECT {DRIVER_COLUMNS} FROM drivers WHERE id = ?1 AND org_id = ?2"
        ))
        .bind(driver_id)
        .bind(org_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("driver {driver_id}")))
    }

    /// Compliance guard: a trip may only be assigned to an active driver.
    pub async fn require_active_driver(
        &self,
        org_id: &str,
        driver_id: &str,
    ) -> Result<Driver, AppError> {
        let driver = self.driver(org_id, driver_id).await?;
        if !driver.status.is_active() {
            return Err(AppError::ComplianceViolation(format!(
                "driver {} is not active and cannot be assigned to a trip",
                driver.id
            )));
        }
        Ok(driver)
    }

    pub async fn vehicle(&self, org_id: &str, vehicle_id: &str) -> Result<Vehicle, AppError> {
        sqlx::query_as::<_, Vehicle>(&format!(
            "SELECT {VEHICLE_COLUMNS} FROM vehicles WHERE id = ?1 AND org_id = ?2"
        ))
        .bind(vehicle_id)
        .bind(org_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("vehicle {vehicle_id}")))
    }

    pub async fn member(&self, org_id: &str, member_id: &str) -> Result<Member, AppError> {
        sqlx::query_as::<_, Member>(&format!(
            "SELECT {MEMBER_COLUMNS} FROM members WHERE id = ?1 AND org_id = ?2"
        ))
        .bind(member_id)
        .bind(org_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("member {member_id}")))
    }
}
