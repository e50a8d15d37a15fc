use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AmbulanceStatus, Location, LocationType, WaypointStatus};

/// Partial ambulance update published by a vehicle terminal.
///
/// Every field is optional; absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AmbulancePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AmbulanceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Payload of `user/{u}/client/{c}/ambulance/{id}/data`: a single patch or
/// an ordered batch of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AmbulanceUpdates {
    Many(Vec<AmbulancePatch>),
    One(AmbulancePatch),
}

impl AmbulanceUpdates {
    pub fn from_slice(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn into_vec(self) -> Vec<AmbulancePatch> {
        match self {
            Self::Many(patches) => patches,
            Self::One(patch) => vec![patch],
        }
    }
}

/// Partial hospital update published by a hospital console.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HospitalPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

/// Partial equipment item update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EquipmentItemPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Where a waypoint points to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaypointLocation {
    #[serde(rename = "type")]
    pub kind: LocationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub location: Location,
}

/// Create-or-update payload for a call waypoint. Creating (waypoint id 0)
/// requires `location`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaypointPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WaypointStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<WaypointLocation>,
}

/// Reply sent on a session's private error topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub topic: String,
    pub payload: String,
    pub error: String,
}

impl ErrorReply {
    pub fn new(topic: &str, payload: &[u8], error: impl Into<String>) -> Self {
        Self {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            error: error.into(),
        }
    }
}

/// One resource entry of a user profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileGrant {
    pub id: i64,
    pub can_read: bool,
    pub can_write: bool,
}

/// Effective permission summary, published retained on `user/{u}/profile`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub ambulances: Vec<ProfileGrant>,
    pub hospitals: Vec<ProfileGrant>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_and_batch_ambulance_payloads() {
        let one = AmbulanceUpdates::from_slice(br#"{"status":"AV"}"#).unwrap();
        assert_eq!(one.into_vec().len(), 1);

        let many = AmbulanceUpdates::from_slice(
            br#"[{"status":"AH","location":{"latitude":1.0,"longitude":2.0}},{"comment":"x"}]"#,
        )
        .unwrap()
        .into_vec();
        assert_eq!(many.len(), 2);
        assert_eq!(many[0].location, Some(Location::new(1.0, 2.0)));
        assert_eq!(many[1].comment.as_deref(), Some("x"));
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!(AmbulanceUpdates::from_slice(br#"{"status":"ZZ"}"#).is_err());
    }

    #[test]
    fn error_reply_keeps_payload_text() {
        let reply = ErrorReply::new("user/a/client/b/status", b"bogus", "unknown client status");
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["payload"], "bogus");
        assert_eq!(json["error"], "unknown client status");
    }
}
