use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

// ---------------------------------------------------------------------------
// Geography
// ---------------------------------------------------------------------------

/// A WGS84 point in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Presence status of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Online,
    Offline,
    Disconnected,
    Reconnected,
}

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Disconnected => "disconnected",
            Self::Reconnected => "reconnected",
        }
    }

    /// Whether a session in this status holds a live broker connection.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Online | Self::Reconnected)
    }
}

impl FromStr for ClientStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "disconnected" => Ok(Self::Disconnected),
            "reconnected" => Ok(Self::Reconnected),
            _ => Err(ParseError::unknown("client status", s)),
        }
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a session audit row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientActivity {
    Handshake,
    AmbulanceLogin,
    AmbulanceLogout,
    HospitalLogin,
    HospitalLogout,
}

impl ClientActivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Handshake => "HS",
            Self::AmbulanceLogin => "AI",
            Self::AmbulanceLogout => "AO",
            Self::HospitalLogin => "HI",
            Self::HospitalLogout => "HO",
        }
    }
}

impl FromStr for ClientActivity {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HS" => Ok(Self::Handshake),
            "AI" => Ok(Self::AmbulanceLogin),
            "AO" => Ok(Self::AmbulanceLogout),
            "HI" => Ok(Self::HospitalLogin),
            "HO" => Ok(Self::HospitalLogout),
            _ => Err(ParseError::unknown("client activity", s)),
        }
    }
}

// ---------------------------------------------------------------------------
// Ambulances
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AmbulanceStatus {
    #[serde(rename = "UK")]
    Unknown,
    #[serde(rename = "AV")]
    Available,
    #[serde(rename = "OS")]
    OutOfService,
    #[serde(rename = "PB")]
    PatientBound,
    #[serde(rename = "AP")]
    AtPatient,
    #[serde(rename = "HB")]
    HospitalBound,
    #[serde(rename = "AH")]
    AtHospital,
    #[serde(rename = "BB")]
    BaseBound,
    #[serde(rename = "AB")]
    AtBase,
    #[serde(rename = "WB")]
    WaypointBound,
    #[serde(rename = "AW")]
    AtWaypoint,
}

impl AmbulanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UK",
            Self::Available => "AV",
            Self::OutOfService => "OS",
            Self::PatientBound => "PB",
            Self::AtPatient => "AP",
            Self::HospitalBound => "HB",
            Self::AtHospital => "AH",
            Self::BaseBound => "BB",
            Self::AtBase => "AB",
            Self::WaypointBound => "WB",
            Self::AtWaypoint => "AW",
        }
    }
}

impl FromStr for AmbulanceStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UK" => Ok(Self::Unknown),
            "AV" => Ok(Self::Available),
            "OS" => Ok(Self::OutOfService),
            "PB" => Ok(Self::PatientBound),
            "AP" => Ok(Self::AtPatient),
            "HB" => Ok(Self::HospitalBound),
            "AH" => Ok(Self::AtHospital),
            "BB" => Ok(Self::BaseBound),
            "AB" => Ok(Self::AtBase),
            "WB" => Ok(Self::WaypointBound),
            "AW" => Ok(Self::AtWaypoint),
            _ => Err(ParseError::unknown("ambulance status", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AmbulanceCapability {
    #[serde(rename = "B")]
    Basic,
    #[serde(rename = "A")]
    Advanced,
    #[serde(rename = "R")]
    Rescue,
}

impl AmbulanceCapability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "B",
            Self::Advanced => "A",
            Self::Rescue => "R",
        }
    }
}

impl FromStr for AmbulanceCapability {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "B" => Ok(Self::Basic),
            "A" => Ok(Self::Advanced),
            "R" => Ok(Self::Rescue),
            _ => Err(ParseError::unknown("ambulance capability", s)),
        }
    }
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallStatus {
    #[serde(rename = "P")]
    Pending,
    #[serde(rename = "S")]
    Started,
    #[serde(rename = "E")]
    Ended,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "P",
            Self::Started => "S",
            Self::Ended => "E",
        }
    }
}

impl FromStr for CallStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "P" => Ok(Self::Pending),
            "S" => Ok(Self::Started),
            "E" => Ok(Self::Ended),
            _ => Err(ParseError::unknown("call status", s)),
        }
    }
}

/// Status of one ambulance's assignment to a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AmbulanceCallStatus {
    #[serde(rename = "R")]
    Requested,
    #[serde(rename = "O")]
    Ongoing,
    #[serde(rename = "D")]
    Declined,
    #[serde(rename = "S")]
    Suspended,
    #[serde(rename = "C")]
    Completed,
}

impl AmbulanceCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "R",
            Self::Ongoing => "O",
            Self::Declined => "D",
            Self::Suspended => "S",
            Self::Completed => "C",
        }
    }

    /// Human-readable name used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Ongoing => "ongoing",
            Self::Declined => "declined",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
        }
    }

    /// Parse the literal status a device publishes on its call status topic.
    ///
    /// `accepted` is the device's way of saying it takes the call, which
    /// makes the assignment ongoing.
    pub fn from_name(s: &str) -> Result<Self, ParseError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "requested" => Ok(Self::Requested),
            "accepted" | "ongoing" => Ok(Self::Ongoing),
            "declined" => Ok(Self::Declined),
            "suspended" => Ok(Self::Suspended),
            "completed" => Ok(Self::Completed),
            _ => Err(ParseError::unknown("ambulance call status", s)),
        }
    }

    /// Assignments that still keep their call alive.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Requested | Self::Ongoing | Self::Suspended)
    }
}

impl FromStr for AmbulanceCallStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "R" => Ok(Self::Requested),
            "O" => Ok(Self::Ongoing),
            "D" => Ok(Self::Declined),
            "S" => Ok(Self::Suspended),
            "C" => Ok(Self::Completed),
            _ => Err(ParseError::unknown("ambulance call status", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaypointStatus {
    #[serde(rename = "C")]
    Created,
    #[serde(rename = "V")]
    Visiting,
    #[serde(rename = "D")]
    Visited,
    #[serde(rename = "S")]
    Skipped,
}

impl WaypointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "C",
            Self::Visiting => "V",
            Self::Visited => "D",
            Self::Skipped => "S",
        }
    }
}

impl FromStr for WaypointStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "C" => Ok(Self::Created),
            "V" => Ok(Self::Visiting),
            "D" => Ok(Self::Visited),
            "S" => Ok(Self::Skipped),
            _ => Err(ParseError::unknown("waypoint status", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocationType {
    #[serde(rename = "i")]
    Incident,
    #[serde(rename = "h")]
    Hospital,
    #[serde(rename = "b")]
    Base,
    #[serde(rename = "w")]
    Waypoint,
    #[serde(rename = "o")]
    Other,
}

impl LocationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incident => "i",
            Self::Hospital => "h",
            Self::Base => "b",
            Self::Waypoint => "w",
            Self::Other => "o",
        }
    }
}

impl FromStr for LocationType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "i" => Ok(Self::Incident),
            "h" => Ok(Self::Hospital),
            "b" => Ok(Self::Base),
            "w" => Ok(Self::Waypoint),
            "o" => Ok(Self::Other),
            _ => Err(ParseError::unknown("location type", s)),
        }
    }
}

// ---------------------------------------------------------------------------
// Equipment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EquipmentType {
    #[serde(rename = "B")]
    Boolean,
    #[serde(rename = "I")]
    Integer,
    #[serde(rename = "S")]
    String,
}

impl EquipmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boolean => "B",
            Self::Integer => "I",
            Self::String => "S",
        }
    }

    /// Check that `value` is acceptable for an item of this type.
    pub fn accepts(&self, value: &str) -> bool {
        match self {
            Self::Boolean => matches!(value, "True" | "False" | "true" | "false"),
            Self::Integer => value.trim().parse::<i64>().is_ok(),
            Self::String => true,
        }
    }
}

impl FromStr for EquipmentType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "B" => Ok(Self::Boolean),
            "I" => Ok(Self::Integer),
            "S" => Ok(Self::String),
            _ => Err(ParseError::unknown("equipment type", s)),
        }
    }
}

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

/// Direction of a broker access request, as sent by the ACL hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Subscribe,
    Publish,
}

impl Direction {
    /// Map the broker's `acc` code (1 = subscribe, 2 = publish).
    pub fn from_acc(acc: u8) -> Option<Self> {
        match acc {
            1 => Some(Self::Subscribe),
            2 => Some(Self::Publish),
            _ => None,
        }
    }
}

/// Kind of entity a permission grant applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Ambulance,
    Hospital,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ambulance => "ambulance",
            Self::Hospital => "hospital",
        }
    }
}

impl FromStr for ResourceKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ambulance" => Ok(Self::Ambulance),
            "hospital" => Ok(Self::Hospital),
            _ => Err(ParseError::unknown("resource kind", s)),
        }
    }
}

/// Holder of a permission grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    User,
    Group,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
        }
    }
}

impl FromStr for SubjectKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "group" => Ok(Self::Group),
            _ => Err(ParseError::unknown("subject kind", s)),
        }
    }
}
