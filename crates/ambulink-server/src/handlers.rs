//! Per-route message handlers.
//!
//! Each handler runs inside the router's store transaction and returns the
//! notifications to publish once it commits. Any error rolls the whole
//! message back.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use ambulink_shared::protocol::{
    AmbulancePatch, AmbulanceUpdates, EquipmentItemPatch, HospitalPatch, WaypointPatch,
};
use ambulink_shared::{
    geo, AmbulanceCallStatus, CallStatus, ClientStatus, Location, ResourceKind, WaypointStatus,
};
use ambulink_store::{Ambulance, AmbulanceCall, Client, Database, StoreError};

use crate::error::BridgeError;
use crate::gateway::Notification;
use crate::permissions::{PermissionCache, Permissions};
use crate::router::{Inbound, Sender};
use crate::session::{self, SessionRequest};

pub fn apply(
    db: &Database,
    cache: &PermissionCache,
    inbound: &Inbound,
    payload: &[u8],
) -> Result<Vec<Notification>, BridgeError> {
    match inbound {
        Inbound::ClientStatus { sender } => client_status(db, cache, sender, payload),
        Inbound::AmbulanceData { sender, ambulance } => {
            let session = Session::resolve(db, cache, sender)?;
            ambulance_data(db, &session, *ambulance, payload)
        }
        Inbound::HospitalData { sender, hospital } => {
            let session = Session::resolve(db, cache, sender)?;
            hospital_data(db, &session, *hospital, payload)
        }
        Inbound::EquipmentItemData {
            sender,
            holder,
            equipment,
        } => {
            let session = Session::resolve(db, cache, sender)?;
            equipment_item_data(db, &session, *holder, *equipment, payload)
        }
        Inbound::CallStatus {
            sender,
            ambulance,
            call,
        } => {
            let session = Session::resolve(db, cache, sender)?;
            call_status(db, &session, *ambulance, *call, payload)
        }
        Inbound::WaypointData {
            sender,
            ambulance,
            call,
            waypoint,
        } => {
            let session = Session::resolve(db, cache, sender)?;
            waypoint_data(db, &session, *ambulance, *call, *waypoint, payload)
        }
        Inbound::Control => Ok(Vec::new()),
    }
}

/// The live session a message was published from.
struct Session {
    perms: Arc<Permissions>,
    client: Client,
}

impl Session {
    fn resolve(db: &Database, cache: &PermissionCache, sender: &Sender) -> Result<Self, BridgeError> {
        let perms = cache
            .get_or_load(db, &sender.username)?
            .ok_or_else(|| BridgeError::unknown(format!("user '{}'", sender.username)))?;
        let client = db
            .find_client(&sender.client_id)?
            .ok_or_else(|| BridgeError::unknown(format!("client '{}'", sender.client_id)))?;
        if client.user_id != perms.user_id {
            return Err(BridgeError::unauthorized(format!(
                "client '{}' belongs to another user",
                sender.client_id
            )));
        }
        Ok(Self { perms, client })
    }

    fn user_id(&self) -> Option<i64> {
        Some(self.perms.user_id)
    }

    fn require_ambulance(&self, ambulance_id: i64) -> Result<(), BridgeError> {
        if self.client.ambulance_id == Some(ambulance_id) {
            Ok(())
        } else {
            Err(BridgeError::unauthorized(format!(
                "session is not attached to ambulance {ambulance_id}"
            )))
        }
    }

    fn require_hospital(&self, hospital_id: i64) -> Result<(), BridgeError> {
        if self.client.hospital_id == Some(hospital_id) {
            Ok(())
        } else {
            Err(BridgeError::unauthorized(format!(
                "session is not attached to hospital {hospital_id}"
            )))
        }
    }
}

/// Map a missing row to an `UnknownResource` naming what was looked up.
fn lookup<T>(result: Result<T, StoreError>, what: &str, id: i64) -> Result<T, BridgeError> {
    match result {
        Err(StoreError::NotFound) => Err(BridgeError::unknown(format!("{what} {id}"))),
        other => Ok(other?),
    }
}

fn json<T: DeserializeOwned>(payload: &[u8]) -> Result<T, BridgeError> {
    serde_json::from_slice(payload).map_err(|e| BridgeError::invalid(e.to_string()))
}

fn text(payload: &[u8]) -> Result<&str, BridgeError> {
    std::str::from_utf8(payload)
        .map(str::trim)
        .map_err(|_| BridgeError::invalid("payload is not valid UTF-8"))
}

fn valid_location(location: &Location) -> Result<(), BridgeError> {
    if location.is_valid() {
        Ok(())
    } else {
        Err(BridgeError::invalid(format!(
            "location out of range: {}, {}",
            location.latitude, location.longitude
        )))
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

fn client_status(
    db: &Database,
    cache: &PermissionCache,
    sender: &Sender,
    payload: &[u8],
) -> Result<Vec<Notification>, BridgeError> {
    let status: ClientStatus = text(payload)?
        .parse()
        .map_err(|e: ambulink_shared::ParseError| BridgeError::invalid(e.to_string()))?;
    let outcome = session::upsert(
        db,
        cache,
        &sender.username,
        &sender.client_id,
        &SessionRequest::status(status),
    )?;
    Ok(outcome.notifications)
}

// ---------------------------------------------------------------------------
// Ambulances
// ---------------------------------------------------------------------------

fn ambulance_data(
    db: &Database,
    session: &Session,
    ambulance_id: i64,
    payload: &[u8],
) -> Result<Vec<Notification>, BridgeError> {
    let patches = AmbulanceUpdates::from_slice(payload)
        .map_err(|e| BridgeError::invalid(e.to_string()))?
        .into_vec();
    if patches.is_empty() {
        return Err(BridgeError::invalid("empty update batch"));
    }
    let ambulance = lookup(db.get_ambulance(ambulance_id), "ambulance", ambulance_id)?;
    session.require_ambulance(ambulance_id)?;

    let mut states = fold_ambulance_updates(&ambulance, &patches, session.user_id(), Utc::now())?;

    let Some(live) = states.pop() else {
        return Err(BridgeError::invalid("empty update batch"));
    };
    for snapshot in &states {
        db.insert_ambulance_update(snapshot)?;
    }
    db.save_ambulance(&live)?;

    Ok(vec![Notification::Ambulance(live)])
}

/// Apply `patches` left to right, returning the state after each one.
///
/// A supplied orientation always wins; otherwise the bearing is derived
/// from the previous location whenever the location moves.
pub fn fold_ambulance_updates(
    current: &Ambulance,
    patches: &[AmbulancePatch],
    updated_by: Option<i64>,
    now: DateTime<Utc>,
) -> Result<Vec<Ambulance>, BridgeError> {
    let mut state = current.clone();
    let mut states = Vec::with_capacity(patches.len());

    for patch in patches {
        let previous = state.location;

        if let Some(location) = &patch.location {
            valid_location(location)?;
            state.location = Some(*location);
        }
        if let Some(status) = patch.status {
            state.status = status;
        }
        if let Some(timestamp) = patch.timestamp {
            state.timestamp = Some(timestamp);
        }
        if let Some(comment) = &patch.comment {
            state.comment = Some(comment.clone());
        }

        match patch.orientation {
            Some(orientation) if orientation.is_finite() => {
                state.orientation = Some(orientation.rem_euclid(360.0));
            }
            Some(_) => return Err(BridgeError::invalid("orientation must be finite")),
            None => {
                if let (Some(from), Some(to)) = (previous, patch.location) {
                    if geo::distance(&from, &to) > 0.0 {
                        state.orientation = Some(geo::bearing(&from, &to));
                    }
                }
            }
        }

        state.updated_by = updated_by;
        state.updated_on = now;
        states.push(state.clone());
    }

    Ok(states)
}

// ---------------------------------------------------------------------------
// Hospitals and equipment
// ---------------------------------------------------------------------------

fn hospital_data(
    db: &Database,
    session: &Session,
    hospital_id: i64,
    payload: &[u8],
) -> Result<Vec<Notification>, BridgeError> {
    let patch: HospitalPatch = json(payload)?;
    let mut hospital = lookup(db.get_hospital(hospital_id), "hospital", hospital_id)?;
    session.require_hospital(hospital_id)?;

    if let Some(name) = patch.name {
        if name.trim().is_empty() {
            return Err(BridgeError::invalid("hospital name cannot be empty"));
        }
        hospital.name = name;
    }
    if let Some(address) = patch.address {
        hospital.address = Some(address);
    }
    if let Some(comment) = patch.comment {
        hospital.comment = Some(comment);
    }
    if let Some(location) = patch.location {
        valid_location(&location)?;
        hospital.location = Some(location);
    }
    hospital.updated_by = session.user_id();
    hospital.updated_on = Utc::now();
    db.save_hospital(&hospital)?;

    Ok(vec![Notification::Hospital(hospital)])
}

fn equipment_item_data(
    db: &Database,
    session: &Session,
    holder_id: i64,
    equipment_id: i64,
    payload: &[u8],
) -> Result<Vec<Notification>, BridgeError> {
    let patch: EquipmentItemPatch = json(payload)?;

    let owner = db
        .holder_owner(holder_id)?
        .ok_or_else(|| BridgeError::unknown(format!("equipment holder {holder_id}")))?;
    let attached = match owner.kind {
        ResourceKind::Ambulance => session.client.ambulance_id,
        ResourceKind::Hospital => session.client.hospital_id,
    };
    if attached != Some(owner.resource_id) {
        return Err(BridgeError::unauthorized(format!(
            "session is not attached to the owner of equipment holder {holder_id}"
        )));
    }

    let mut item = lookup(
        db.get_equipment_item(holder_id, equipment_id),
        "equipment item",
        equipment_id,
    )?;
    if let Some(value) = patch.value {
        if !item.equipment_type.accepts(&value) {
            return Err(BridgeError::invalid(format!(
                "'{value}' is not a valid {} value",
                item.equipment_name
            )));
        }
        item.value = value;
    }
    if let Some(comment) = patch.comment {
        item.comment = Some(comment);
    }
    item.updated_by = session.user_id();
    item.updated_on = Utc::now();
    db.save_equipment_item(&item)?;

    Ok(vec![Notification::EquipmentItem(item)])
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

/// The assignment of an attached ambulance to an existing call.
fn assignment(
    db: &Database,
    session: &Session,
    ambulance_id: i64,
    call_id: i64,
) -> Result<AmbulanceCall, BridgeError> {
    lookup(db.get_ambulance(ambulance_id), "ambulance", ambulance_id)?;
    session.require_ambulance(ambulance_id)?;
    lookup(db.get_call(call_id), "call", call_id)?;
    db.find_ambulance_call(call_id, ambulance_id)?
        .ok_or_else(|| {
            BridgeError::unauthorized(format!(
                "ambulance {ambulance_id} is not assigned to call {call_id}"
            ))
        })
}

fn call_status(
    db: &Database,
    session: &Session,
    ambulance_id: i64,
    call_id: i64,
    payload: &[u8],
) -> Result<Vec<Notification>, BridgeError> {
    let status = AmbulanceCallStatus::from_name(text(payload)?)
        .map_err(|e| BridgeError::invalid(e.to_string()))?;
    let mut current = assignment(db, session, ambulance_id, call_id)?;
    let now = Utc::now();

    let mut notifications = Vec::new();
    let mut touched_calls = vec![call_id];

    if status == AmbulanceCallStatus::Ongoing {
        let ongoing = db.list_ambulance_calls_with_status(ambulance_id, AmbulanceCallStatus::Ongoing)?;
        for mut other in ongoing.into_iter().filter(|other| other.id != current.id) {
            other.status = AmbulanceCallStatus::Suspended;
            other.updated_on = now;
            db.save_ambulance_call(&other)?;
            notifications.push(Notification::AmbulanceCallStatus {
                ambulance_id,
                call_id: other.call_id,
                status: other.status,
            });
            if !touched_calls.contains(&other.call_id) {
                touched_calls.push(other.call_id);
            }
        }

        let mut call = db.get_call(call_id)?;
        if call.status == CallStatus::Pending {
            call.status = CallStatus::Started;
            call.updated_on = now;
            db.save_call(&call)?;
        }
    }

    current.status = status;
    current.updated_on = now;
    db.save_ambulance_call(&current)?;
    notifications.push(Notification::AmbulanceCallStatus {
        ambulance_id,
        call_id,
        status,
    });

    if status == AmbulanceCallStatus::Completed {
        let open = db
            .list_ambulance_calls(call_id)?
            .iter()
            .any(|ac| ac.status.is_open());
        if !open {
            let mut call = db.get_call(call_id)?;
            call.status = CallStatus::Ended;
            call.ended_at = Some(now);
            call.updated_on = now;
            db.save_call(&call)?;
        }
    }

    for id in touched_calls {
        notifications.push(Notification::call(db, id)?);
    }
    Ok(notifications)
}

fn waypoint_data(
    db: &Database,
    session: &Session,
    ambulance_id: i64,
    call_id: i64,
    waypoint_id: i64,
    payload: &[u8],
) -> Result<Vec<Notification>, BridgeError> {
    let patch: WaypointPatch = json(payload)?;
    let assignment = assignment(db, session, ambulance_id, call_id)?;

    if waypoint_id == 0 {
        let target = patch
            .location
            .ok_or_else(|| BridgeError::invalid("location is required to create a waypoint"))?;
        valid_location(&target.location)?;
        let order = match patch.order {
            Some(order) => order,
            None => db.next_waypoint_order(assignment.id)?,
        };
        db.create_waypoint(
            assignment.id,
            order,
            patch.status.unwrap_or(WaypointStatus::Created),
            target.kind,
            target.name.as_deref(),
            target.location,
            session.user_id(),
        )?;
    } else {
        let mut waypoint = lookup(db.get_waypoint(waypoint_id), "waypoint", waypoint_id)?;
        if waypoint.ambulance_call_id != assignment.id {
            return Err(BridgeError::unknown(format!(
                "waypoint {waypoint_id} of call {call_id}"
            )));
        }
        if let Some(order) = patch.order {
            waypoint.order = order;
        }
        if let Some(status) = patch.status {
            waypoint.status = status;
        }
        if let Some(target) = patch.location {
            valid_location(&target.location)?;
            waypoint.location_type = target.kind;
            waypoint.name = target.name;
            waypoint.location = target.location;
        }
        waypoint.updated_by = session.user_id();
        waypoint.updated_on = Utc::now();
        db.save_waypoint(&waypoint)?;
    }

    Ok(vec![Notification::call(db, call_id)?])
}

#[cfg(test)]
mod tests {
    use super::*;
    use ambulink_shared::{AmbulanceCapability, AmbulanceStatus, EquipmentType, SubjectKind};
    use ambulink_store::PermissionGrant;

    use crate::gateway::CallSnapshot;

    struct Fixture {
        db: Database,
        cache: PermissionCache,
        amb: Ambulance,
        hosp: i64,
    }

    fn sender() -> Sender {
        Sender {
            username: "alice".into(),
            client_id: "dev-1".into(),
        }
    }

    /// alice on dev-1, attached to a writable ambulance.
    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let alice = db.create_user("alice", false, false).unwrap();
        let amb = db
            .create_ambulance("AMB-1", AmbulanceCapability::Basic)
            .unwrap();
        let hosp = db.create_hospital("General").unwrap();
        db.set_grant(&PermissionGrant {
            subject_kind: SubjectKind::User,
            subject_id: alice.id,
            resource_kind: ResourceKind::Ambulance,
            resource_id: amb.id,
            can_read: true,
            can_write: true,
        })
        .unwrap();

        let cache = PermissionCache::new();
        session::upsert(
            &db,
            &cache,
            "alice",
            "dev-1",
            &SessionRequest {
                status: Some(ClientStatus::Online),
                ambulance: Some(Some(amb.id)),
                hospital: None,
            },
        )
        .unwrap();

        Fixture {
            db,
            cache,
            amb,
            hosp: hosp.id,
        }
    }

    impl Fixture {
        fn send(&self, inbound: Inbound, payload: &str) -> Result<Vec<Notification>, BridgeError> {
            self.db
                .transaction(|db| apply(db, &self.cache, &inbound, payload.as_bytes()))
        }

        fn ambulance_topic(&self) -> Inbound {
            Inbound::AmbulanceData {
                sender: sender(),
                ambulance: self.amb.id,
            }
        }
    }

    #[test]
    fn test_bulk_updates_fold_left_to_right() {
        let f = fixture();
        let l0 = Location::new(32.5, -117.0);
        let l1 = Location::new(32.6, -116.9);

        let payload = r#"[
            {"status":"AH","location":{"latitude":32.5,"longitude":-117.0}},
            {"location":{"latitude":32.6,"longitude":-116.9},"timestamp":"2024-05-01T10:00:00Z"},
            {"status":"OS"}
        ]"#;
        let notifications = f.send(f.ambulance_topic(), payload).unwrap();
        assert_eq!(notifications.len(), 1);

        let live = f.db.get_ambulance(f.amb.id).unwrap();
        assert_eq!(live.status, AmbulanceStatus::OutOfService);
        assert_eq!(live.location, Some(l1));
        assert_eq!(
            live.timestamp.unwrap().to_rfc3339(),
            "2024-05-01T10:00:00+00:00"
        );
        let expected = geo::bearing(&l0, &l1);
        assert!((live.orientation.unwrap() - expected).abs() < 1e-9);

        let history = f.db.list_ambulance_updates(f.amb.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, AmbulanceStatus::AtHospital);
        assert_eq!(history[0].orientation, None);
        assert_eq!(history[1].location, Some(l1));
    }

    #[test]
    fn test_explicit_orientation_wins() {
        let mut amb = fixture().amb;
        amb.location = Some(Location::new(10.0, 10.0));
        let patches = vec![AmbulancePatch {
            location: Some(Location::new(10.1, 10.0)),
            orientation: Some(270.0),
            ..AmbulancePatch::default()
        }];
        let states = fold_ambulance_updates(&amb, &patches, None, Utc::now()).unwrap();
        assert_eq!(states[0].orientation, Some(270.0));
    }

    #[test]
    fn test_invalid_payloads_are_validation_errors() {
        let f = fixture();
        for payload in ["[]", "{not json", r#"{"status":"ZZ"}"#, r#"{"location":{"latitude":95.0,"longitude":0.0}}"#] {
            let err = f.send(f.ambulance_topic(), payload).unwrap_err();
            assert!(matches!(err, BridgeError::Validation(_)), "{payload}: {err}");
        }
        assert!(f.db.list_ambulance_updates(f.amb.id).unwrap().is_empty());
    }

    #[test]
    fn test_unattached_hospital_is_rejected() {
        let f = fixture();
        let err = f
            .send(
                Inbound::HospitalData {
                    sender: sender(),
                    hospital: f.hosp,
                },
                r#"{"comment":"full"}"#,
            )
            .unwrap_err();
        assert!(matches!(err, BridgeError::Authorization(_)));
    }

    #[test]
    fn test_missing_rows_are_unknown_before_attachment() {
        let f = fixture();
        let missing = 9_999;
        let cases = [
            (
                Inbound::AmbulanceData {
                    sender: sender(),
                    ambulance: missing,
                },
                r#"{"status":"AV"}"#,
            ),
            (
                Inbound::HospitalData {
                    sender: sender(),
                    hospital: missing,
                },
                r#"{"comment":"full"}"#,
            ),
            (
                Inbound::CallStatus {
                    sender: sender(),
                    ambulance: missing,
                    call: 1,
                },
                "accepted",
            ),
        ];
        for (inbound, payload) in cases {
            let err = f.send(inbound, payload).unwrap_err();
            assert!(matches!(err, BridgeError::UnknownResource(_)), "{err}");
        }
    }

    #[test]
    fn test_equipment_value_is_type_checked() {
        let f = fixture();
        let holder = f.amb.equipmentholder_id.unwrap();
        let beds = f
            .db
            .create_equipment("stretchers", EquipmentType::Integer, "1")
            .unwrap();
        f.db.add_equipment_item(holder, beds.id).unwrap();
        let topic = || Inbound::EquipmentItemData {
            sender: sender(),
            holder,
            equipment: beds.id,
        };

        let err = f.send(topic(), r#"{"value":"many"}"#).unwrap_err();
        assert!(matches!(err, BridgeError::Validation(_)));

        f.send(topic(), r#"{"value":"2"}"#).unwrap();
        assert_eq!(f.db.get_equipment_item(holder, beds.id).unwrap().value, "2");

        let other_holder = f.db.get_hospital(f.hosp).unwrap().equipmentholder_id.unwrap();
        let err = f
            .send(
                Inbound::EquipmentItemData {
                    sender: sender(),
                    holder: other_holder,
                    equipment: beds.id,
                },
                r#"{"value":"2"}"#,
            )
            .unwrap_err();
        assert!(matches!(err, BridgeError::Authorization(_)));
    }

    #[test]
    fn test_accepting_a_call_suspends_the_other_one() {
        let f = fixture();
        let first = f.db.create_call("fall", "B").unwrap();
        let second = f.db.create_call("fire", "A").unwrap();
        f.db.add_ambulance_call(first.id, f.amb.id).unwrap();
        f.db.add_ambulance_call(second.id, f.amb.id).unwrap();
        let status = |call| Inbound::CallStatus {
            sender: sender(),
            ambulance: f.amb.id,
            call,
        };

        f.send(status(first.id), "accepted").unwrap();
        assert_eq!(f.db.get_call(first.id).unwrap().status, CallStatus::Started);

        let notifications = f.send(status(second.id), "Ongoing").unwrap();
        let suspended = f.db.find_ambulance_call(first.id, f.amb.id).unwrap().unwrap();
        assert_eq!(suspended.status, AmbulanceCallStatus::Suspended);
        assert!(notifications.contains(&Notification::AmbulanceCallStatus {
            ambulance_id: f.amb.id,
            call_id: first.id,
            status: AmbulanceCallStatus::Suspended,
        }));

        f.send(status(second.id), "completed").unwrap();
        let ended = f.db.get_call(second.id).unwrap();
        assert_eq!(ended.status, CallStatus::Ended);
        assert!(ended.ended_at.is_some());

        let err = f.send(status(second.id), "bogus").unwrap_err();
        assert!(matches!(err, BridgeError::Validation(_)));
    }

    #[test]
    fn test_call_without_assignment_is_rejected() {
        let f = fixture();
        let call = f.db.create_call("fall", "B").unwrap();
        let err = f
            .send(
                Inbound::CallStatus {
                    sender: sender(),
                    ambulance: f.amb.id,
                    call: call.id,
                },
                "accepted",
            )
            .unwrap_err();
        assert!(matches!(err, BridgeError::Authorization(_)));

        let err = f
            .send(
                Inbound::CallStatus {
                    sender: sender(),
                    ambulance: f.amb.id,
                    call: call.id + 100,
                },
                "accepted",
            )
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnknownResource(_)));
    }

    #[test]
    fn test_waypoints_create_and_update() {
        let f = fixture();
        let call = f.db.create_call("fall", "B").unwrap();
        let ac = f.db.add_ambulance_call(call.id, f.amb.id).unwrap();
        let topic = |waypoint| Inbound::WaypointData {
            sender: sender(),
            ambulance: f.amb.id,
            call: call.id,
            waypoint,
        };

        let err = f.send(topic(0), r#"{"order":1}"#).unwrap_err();
        assert!(matches!(err, BridgeError::Validation(_)));

        let created = f
            .send(
                topic(0),
                r#"{"location":{"type":"i","location":{"latitude":32.5,"longitude":-117.0}}}"#,
            )
            .unwrap();
        let Notification::Call(CallSnapshot { ambulance_calls, .. }) = &created[0] else {
            panic!("expected call snapshot");
        };
        let waypoint = &ambulance_calls[0].waypoints[0];
        assert_eq!(waypoint.order, 0);
        assert_eq!(waypoint.status, WaypointStatus::Created);

        f.send(topic(waypoint.id), r#"{"status":"V"}"#).unwrap();
        let updated = f.db.list_waypoints(ac.id).unwrap();
        assert_eq!(updated[0].status, WaypointStatus::Visiting);

        let err = f.send(topic(waypoint.id + 50), r#"{"status":"V"}"#).unwrap_err();
        assert!(matches!(err, BridgeError::UnknownResource(_)));
    }
}
