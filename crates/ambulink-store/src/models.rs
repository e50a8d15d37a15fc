//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` so it can be published as-is on the
//! broker's state topics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ambulink_shared::{
    AmbulanceCallStatus, AmbulanceCapability, AmbulanceStatus, CallStatus, ClientActivity,
    ClientStatus, EquipmentType, Location, LocationType, ResourceKind, SubjectKind,
    WaypointStatus,
};

// ---------------------------------------------------------------------------
// Users, groups, grants
// ---------------------------------------------------------------------------

/// An authenticated account, as resolved from a broker username.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
    /// Staff (dispatchers) can read every resource.
    pub is_staff: bool,
    /// Superusers bypass every ACL check.
    pub is_superuser: bool,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: i64,
    pub name: String,
}

/// One row of `permission_grants`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionGrant {
    pub subject_kind: SubjectKind,
    pub subject_id: i64,
    pub resource_kind: ResourceKind,
    pub resource_id: i64,
    pub can_read: bool,
    pub can_write: bool,
}

// ---------------------------------------------------------------------------
// Ambulance
// ---------------------------------------------------------------------------

/// Live state of an ambulance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ambulance {
    pub id: i64,
    pub identifier: String,
    pub capability: AmbulanceCapability,
    pub status: AmbulanceStatus,
    /// Bearing in degrees clockwise from north.
    pub orientation: Option<f64>,
    pub location: Option<Location>,
    /// Device-reported time of the last position fix.
    pub timestamp: Option<DateTime<Utc>>,
    pub comment: Option<String>,
    pub equipmentholder_id: Option<i64>,
    pub updated_by: Option<i64>,
    pub updated_on: DateTime<Utc>,
}

/// Immutable snapshot of an ambulance state, one per applied update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AmbulanceUpdate {
    pub id: i64,
    pub ambulance_id: i64,
    pub status: AmbulanceStatus,
    pub orientation: Option<f64>,
    pub location: Option<Location>,
    pub timestamp: Option<DateTime<Utc>>,
    pub comment: Option<String>,
    pub updated_by: Option<i64>,
    pub updated_on: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Hospital
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Hospital {
    pub id: i64,
    pub name: String,
    pub address: Option<String>,
    pub comment: Option<String>,
    pub location: Option<Location>,
    pub equipmentholder_id: Option<i64>,
    pub updated_by: Option<i64>,
    pub updated_on: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Equipment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Equipment {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EquipmentType,
    pub default_value: String,
}

/// The value one holder (ambulance or hospital) has for one equipment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EquipmentItem {
    pub holder_id: i64,
    pub equipment_id: i64,
    pub equipment_name: String,
    pub equipment_type: EquipmentType,
    pub value: String,
    pub comment: Option<String>,
    pub updated_by: Option<i64>,
    pub updated_on: DateTime<Utc>,
}

/// Which ambulance or hospital owns an equipment holder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HolderOwner {
    pub holder_id: i64,
    pub kind: ResourceKind,
    pub resource_id: i64,
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Call {
    pub id: i64,
    pub status: CallStatus,
    pub details: String,
    pub priority: String,
    pub created_at: DateTime<Utc>,
    pub updated_on: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Assignment of one ambulance to one call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AmbulanceCall {
    pub id: i64,
    pub call_id: i64,
    pub ambulance_id: i64,
    pub status: AmbulanceCallStatus,
    pub updated_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Waypoint {
    pub id: i64,
    pub ambulance_call_id: i64,
    pub order: i64,
    pub status: WaypointStatus,
    pub location_type: LocationType,
    pub name: Option<String>,
    pub location: Location,
    pub updated_by: Option<i64>,
    pub updated_on: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// A device session, keyed by the broker client id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Client {
    pub client_id: String,
    pub user_id: i64,
    pub status: ClientStatus,
    pub ambulance_id: Option<i64>,
    pub hospital_id: Option<i64>,
    pub updated_on: DateTime<Utc>,
}

/// Append-only audit row written on every session transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientLog {
    pub id: i64,
    pub client_id: String,
    pub user_id: i64,
    pub status: ClientStatus,
    pub activity: ClientActivity,
    pub details: String,
    pub ambulance_id: Option<i64>,
    pub hospital_id: Option<i64>,
    pub updated_on: DateTime<Utc>,
}
