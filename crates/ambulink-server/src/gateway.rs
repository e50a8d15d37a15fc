//! Outbound notifications.
//!
//! Handlers never publish while holding the store lock: they return a list
//! of [`Notification`]s which the caller hands to [`PublishGateway`] once the
//! transaction has committed.

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};

use ambulink_net::{BrokerConnection, PublishReceipt, QoS};
use ambulink_shared::constants::{CACHE_CLEAR, CONTROL_TOPIC};
use ambulink_shared::protocol::{ErrorReply, Profile};
use ambulink_shared::{topics, AmbulanceCallStatus, EquipmentType};
use ambulink_store::{
    Ambulance, AmbulanceCall, Call, Database, EquipmentItem, Hospital, StoreError, Waypoint,
};

use crate::error::BridgeError;
use crate::permissions::{load_holder_owners, Permissions};
use crate::state::SharedDb;

/// State topics are retained and delivered exactly once.
const STATE_QOS: QoS = QoS::ExactlyOnce;
const ERROR_QOS: QoS = QoS::AtLeastOnce;

/// One equipment entry of `hospital/{id}/metadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EquipmentMetadata {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EquipmentType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AmbulanceCallSnapshot {
    #[serde(flatten)]
    pub ambulance_call: AmbulanceCall,
    pub waypoints: Vec<Waypoint>,
}

/// A call with every assignment and their waypoints, as published on
/// `call/{id}/data`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    #[serde(flatten)]
    pub call: Call,
    pub ambulance_calls: Vec<AmbulanceCallSnapshot>,
}

impl CallSnapshot {
    pub fn load(db: &Database, call_id: i64) -> Result<Self, StoreError> {
        let call = db.get_call(call_id)?;
        let ambulance_calls = db
            .list_ambulance_calls(call_id)?
            .into_iter()
            .map(|ambulance_call| {
                let waypoints = db.list_waypoints(ambulance_call.id)?;
                Ok(AmbulanceCallSnapshot {
                    ambulance_call,
                    waypoints,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        Ok(Self {
            call,
            ambulance_calls,
        })
    }
}

/// Something to publish after a successful commit.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Ambulance(Ambulance),
    Hospital(Hospital),
    HospitalMetadata {
        hospital_id: i64,
        equipment: Vec<EquipmentMetadata>,
    },
    EquipmentItem(EquipmentItem),
    Call(CallSnapshot),
    AmbulanceCallStatus {
        ambulance_id: i64,
        call_id: i64,
        status: AmbulanceCallStatus,
    },
    Profile {
        username: String,
        profile: Profile,
    },
}

impl Notification {
    pub fn hospital_metadata(db: &Database, hospital: &Hospital) -> Result<Self, StoreError> {
        let equipment = match hospital.equipmentholder_id {
            Some(holder) => db
                .list_equipment_items(holder)?
                .into_iter()
                .map(|item| EquipmentMetadata {
                    id: item.equipment_id,
                    name: item.equipment_name,
                    kind: item.equipment_type,
                })
                .collect(),
            None => Vec::new(),
        };
        Ok(Self::HospitalMetadata {
            hospital_id: hospital.id,
            equipment,
        })
    }

    pub fn call(db: &Database, call_id: i64) -> Result<Self, StoreError> {
        Ok(Self::Call(CallSnapshot::load(db, call_id)?))
    }

    pub fn profile(perms: &Permissions) -> Self {
        Self::Profile {
            username: perms.username.clone(),
            profile: perms.profile(),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes, BridgeError> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

#[derive(Clone)]
pub struct PublishGateway {
    conn: BrokerConnection,
}

impl PublishGateway {
    pub fn new(conn: BrokerConnection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.conn
    }

    async fn state(&self, topic: String, payload: Bytes) -> PublishReceipt {
        debug!(topic = %topic, "publishing state");
        self.conn.publish(topic, payload, STATE_QOS, true).await
    }

    pub async fn publish_ambulance(&self, ambulance: &Ambulance) -> Result<PublishReceipt, BridgeError> {
        let payload = encode(ambulance)?;
        Ok(self.state(topics::ambulance_data(ambulance.id), payload).await)
    }

    pub async fn publish_hospital(&self, hospital: &Hospital) -> Result<PublishReceipt, BridgeError> {
        let payload = encode(hospital)?;
        Ok(self.state(topics::hospital_data(hospital.id), payload).await)
    }

    pub async fn publish_hospital_metadata(
        &self,
        hospital_id: i64,
        equipment: &[EquipmentMetadata],
    ) -> Result<PublishReceipt, BridgeError> {
        let payload = encode(&equipment)?;
        Ok(self.state(topics::hospital_metadata(hospital_id), payload).await)
    }

    pub async fn publish_equipment_item(
        &self,
        item: &EquipmentItem,
    ) -> Result<PublishReceipt, BridgeError> {
        let payload = encode(item)?;
        let topic = topics::equipment_item_data(item.holder_id, item.equipment_id);
        Ok(self.state(topic, payload).await)
    }

    pub async fn publish_call(&self, call: &CallSnapshot) -> Result<PublishReceipt, BridgeError> {
        let payload = encode(call)?;
        Ok(self.state(topics::call_data(call.call.id), payload).await)
    }

    /// The status name goes out as a bare string, not JSON.
    pub async fn publish_ambulance_call_status(
        &self,
        ambulance_id: i64,
        call_id: i64,
        status: AmbulanceCallStatus,
    ) -> PublishReceipt {
        let topic = topics::ambulance_call_status(ambulance_id, call_id);
        self.state(topic, Bytes::from_static(status.name().as_bytes()))
            .await
    }

    pub async fn publish_profile(
        &self,
        username: &str,
        profile: &Profile,
    ) -> Result<PublishReceipt, BridgeError> {
        let payload = encode(profile)?;
        Ok(self.state(topics::user_profile(username), payload).await)
    }

    /// Reply on the sender's private error topic. Never retained.
    pub async fn publish_error(
        &self,
        username: &str,
        client_id: &str,
        reply: &ErrorReply,
    ) -> Result<PublishReceipt, BridgeError> {
        let payload = encode(reply)?;
        let topic = topics::client_error(username, client_id);
        Ok(self.conn.publish(topic, payload, ERROR_QOS, false).await)
    }

    /// Tell every bridge instance to drop its permission cache.
    pub async fn publish_cache_clear(&self) -> PublishReceipt {
        self.conn
            .publish(
                CONTROL_TOPIC,
                Bytes::from_static(CACHE_CLEAR.as_bytes()),
                STATE_QOS,
                false,
            )
            .await
    }

    pub async fn publish(&self, notification: &Notification) -> Result<PublishReceipt, BridgeError> {
        match notification {
            Notification::Ambulance(ambulance) => self.publish_ambulance(ambulance).await,
            Notification::Hospital(hospital) => self.publish_hospital(hospital).await,
            Notification::HospitalMetadata {
                hospital_id,
                equipment,
            } => self.publish_hospital_metadata(*hospital_id, equipment).await,
            Notification::EquipmentItem(item) => self.publish_equipment_item(item).await,
            Notification::Call(call) => self.publish_call(call).await,
            Notification::AmbulanceCallStatus {
                ambulance_id,
                call_id,
                status,
            } => Ok(self
                .publish_ambulance_call_status(*ambulance_id, *call_id, *status)
                .await),
            Notification::Profile { username, profile } => {
                self.publish_profile(username, profile).await
            }
        }
    }

    /// Publish in order. A notification that cannot be encoded is logged and
    /// skipped.
    pub async fn publish_all(&self, notifications: &[Notification]) -> usize {
        let mut sent = 0;
        for notification in notifications {
            match self.publish(notification).await {
                Ok(_) => sent += 1,
                Err(e) => warn!(error = %e, "dropping notification"),
            }
        }
        sent
    }

    /// Publish the retained state of every resource and user profile.
    pub async fn seed_all(&self, db: &SharedDb) -> Result<usize, BridgeError> {
        let notifications = {
            let db = db.lock().await;
            collect_seed(&db)?
        };
        let sent = self.publish_all(&notifications).await;
        info!(sent, "retained state seeded");
        Ok(sent)
    }
}

fn collect_seed(db: &Database) -> Result<Vec<Notification>, StoreError> {
    let mut out = Vec::new();

    for ambulance in db.list_ambulances()? {
        out.push(Notification::Ambulance(ambulance));
    }
    for hospital in db.list_hospitals()? {
        out.push(Notification::hospital_metadata(db, &hospital)?);
        out.push(Notification::Hospital(hospital));
    }
    for item in db.list_all_equipment_items()? {
        out.push(Notification::EquipmentItem(item));
    }
    let holders = load_holder_owners(db)?;
    for user in db.list_users()? {
        if !user.is_active {
            continue;
        }
        let perms = Permissions::load(db, &user, holders.clone())?;
        out.push(Notification::profile(&perms));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use ambulink_net::BrokerConfig;
    use ambulink_shared::AmbulanceCapability;
    use tokio::sync::Mutex;

    fn gateway() -> PublishGateway {
        let (conn, _event_loop, _inbound) = BrokerConnection::new(&BrokerConfig::default());
        PublishGateway::new(conn)
    }

    #[tokio::test]
    async fn test_state_topics_are_retained_exactly_once() {
        let gateway = gateway();
        let db = Database::open_in_memory().unwrap();
        let amb = db
            .create_ambulance("AMB-1", AmbulanceCapability::Basic)
            .unwrap();

        let receipt = gateway.publish_ambulance(&amb).await.unwrap();
        assert_eq!(receipt, PublishReceipt::Buffered);

        gateway
            .publish_ambulance_call_status(amb.id, 4, AmbulanceCallStatus::Ongoing)
            .await;

        let buffered = gateway.connection().buffered();
        assert_eq!(buffered.len(), 2);
        assert_eq!(buffered[0].topic, format!("ambulance/{}/data", amb.id));
        assert_eq!(buffered[0].qos, QoS::ExactlyOnce);
        assert!(buffered[0].retain);
        assert_eq!(buffered[1].topic, format!("ambulance/{}/call/4/status", amb.id));
        assert_eq!(&buffered[1].payload[..], b"ongoing");
    }

    #[tokio::test]
    async fn test_error_replies_are_not_retained() {
        let gateway = gateway();
        let reply = ErrorReply::new("user/a/client/b/status", b"zzz", "unknown client status");
        gateway.publish_error("a", "b", &reply).await.unwrap();
        gateway.publish_cache_clear().await;

        let buffered = gateway.connection().buffered();
        assert_eq!(buffered[0].topic, "user/a/client/b/error");
        assert_eq!(buffered[0].qos, QoS::AtLeastOnce);
        assert!(!buffered[0].retain);
        assert_eq!(buffered[1].topic, "message");
        assert_eq!(&buffered[1].payload[..], b"cache_clear");
        assert!(!buffered[1].retain);
    }

    #[tokio::test]
    async fn test_seed_publishes_every_resource() {
        let gateway = gateway();
        let db = Database::open_in_memory().unwrap();
        db.create_user("alice", false, false).unwrap();
        let amb = db
            .create_ambulance("AMB-1", AmbulanceCapability::Basic)
            .unwrap();
        let hosp = db.create_hospital("General").unwrap();
        let oxygen = db
            .create_equipment("oxygen", EquipmentType::Boolean, "True")
            .unwrap();
        db.add_equipment_item(amb.equipmentholder_id.unwrap(), oxygen.id)
            .unwrap();
        db.add_equipment_item(hosp.equipmentholder_id.unwrap(), oxygen.id)
            .unwrap();
        let db: SharedDb = Arc::new(Mutex::new(db));

        // ambulance, hospital metadata + data, two items, one profile
        assert_eq!(gateway.seed_all(&db).await.unwrap(), 6);

        let topics: Vec<String> = gateway
            .connection()
            .buffered()
            .into_iter()
            .map(|m| m.topic)
            .collect();
        assert!(topics.contains(&format!("hospital/{}/metadata", hosp.id)));
        assert!(topics.contains(&"user/alice/profile".to_string()));
    }

    #[test]
    fn test_call_snapshot_nests_waypoints() {
        let db = Database::open_in_memory().unwrap();
        let amb = db
            .create_ambulance("AMB-1", AmbulanceCapability::Basic)
            .unwrap();
        let call = db.create_call("chest pain", "A").unwrap();
        let ac = db.add_ambulance_call(call.id, amb.id).unwrap();
        db.create_waypoint(
            ac.id,
            0,
            ambulink_shared::WaypointStatus::Created,
            ambulink_shared::LocationType::Incident,
            None,
            ambulink_shared::Location::new(32.5, -117.0),
            None,
        )
        .unwrap();

        let snapshot = CallSnapshot::load(&db, call.id).unwrap();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["id"], call.id);
        assert_eq!(json["ambulance_calls"][0]["ambulance_id"], amb.id);
        assert_eq!(json["ambulance_calls"][0]["waypoints"].as_array().unwrap().len(), 1);
    }
}
