// Read-only collaborator data. The fleet and member services own these
// records; this service joins against them for the compliance guard and
// the report header, and never writes them.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverStatus {
    Active,
    Inactive,
    Suspended,
}

impl DriverStatus {
    pub fn is_active(self) -> bool {
        self == DriverStatus::Active
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Driver {
    pub id: String,
    pub org_id: String,
    pub full_name: String,
    pub status: DriverStatus,
    pub default_vehicle_id: Option<String>,
    pub signature: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub id: String,
    pub org_id: String,
    pub identifier: String,
    pub color: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub vehicle_type: String,
    pub created_at: DateTime<Utc>,
}

impl Vehicle {
    /// "White Ford" style string for the report's color/make field.
    pub fn color_make(&self) -> String {
        match (self.color.as_deref(), self.make.as_deref()) {
            (Some(color), Some(make)) => format!("{color} {make}"),
            (Some(color), None) => color.to_string(),
            (None, Some(make)) => make.to_string(),
            (None, None) => String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: String,
    pub org_id: String,
    pub external_id: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: Option<NaiveDate>,
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Member {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}
