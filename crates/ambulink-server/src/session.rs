//! Device session lifecycle.
//!
//! A session is keyed by the broker client id and may hold at most one
//! ambulance and one hospital. Every transition is saved and audited inside
//! the caller's store transaction; the returned notifications are published
//! only after it commits.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use ambulink_shared::constants::MAX_CLIENT_ID_LEN;
use ambulink_shared::{AmbulanceStatus, ClientActivity, ClientStatus, ResourceKind};
use ambulink_store::{Client, Database, StoreError};

use crate::error::BridgeError;
use crate::gateway::Notification;
use crate::permissions::{PermissionCache, Permissions};

/// A requested session change. `None` leaves a field as it is; for the
/// attachments `Some(None)` detaches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRequest {
    pub status: Option<ClientStatus>,
    pub ambulance: Option<Option<i64>>,
    pub hospital: Option<Option<i64>>,
}

impl SessionRequest {
    pub fn status(status: ClientStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    fn attaches(&self) -> bool {
        matches!(self.ambulance, Some(Some(_))) || matches!(self.hospital, Some(Some(_)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionOutcome {
    /// The session after the change; `None` if it never existed.
    pub client: Option<Client>,
    pub notifications: Vec<Notification>,
}

impl SessionOutcome {
    fn unchanged(client: Option<Client>) -> Self {
        Self {
            client,
            notifications: Vec::new(),
        }
    }
}

/// Resolve `username` and apply `request`. Must run inside a transaction.
pub fn upsert(
    db: &Database,
    cache: &PermissionCache,
    username: &str,
    client_id: &str,
    request: &SessionRequest,
) -> Result<SessionOutcome, BridgeError> {
    let perms = cache
        .get_or_load(db, username)?
        .ok_or_else(|| BridgeError::unknown(format!("user '{username}'")))?;
    apply(db, &perms, client_id, request)
}

/// Apply one transition for the session `client_id` owned by `perms`.
pub fn apply(
    db: &Database,
    perms: &Permissions,
    client_id: &str,
    request: &SessionRequest,
) -> Result<SessionOutcome, BridgeError> {
    if client_id.is_empty() || client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(BridgeError::invalid(format!(
            "client id must be 1 to {MAX_CLIENT_ID_LEN} bytes"
        )));
    }
    if !perms.is_active {
        return Err(BridgeError::unauthorized("inactive user"));
    }

    let existing = db.find_client(client_id)?;
    if let Some(client) = &existing {
        if client.user_id != perms.user_id {
            return Err(BridgeError::unauthorized(format!(
                "client '{client_id}' belongs to another user"
            )));
        }
    }

    let current = existing.as_ref().map(|c| c.status);
    let next = match (current, request.status) {
        (None, None) => return Err(BridgeError::unknown(format!("client '{client_id}'"))),
        (None, Some(ClientStatus::Disconnected | ClientStatus::Offline)) => {
            debug!(client_id, "ignoring departure of unknown client");
            return Ok(SessionOutcome::unchanged(None));
        }
        (None, Some(_)) => ClientStatus::Online,
        (Some(ClientStatus::Offline), Some(ClientStatus::Reconnected)) => {
            return Err(BridgeError::invalid("an offline session cannot reconnect"));
        }
        (Some(ClientStatus::Disconnected), Some(ClientStatus::Disconnected))
        | (
            Some(ClientStatus::Offline),
            Some(ClientStatus::Disconnected | ClientStatus::Offline),
        ) => return Ok(SessionOutcome::unchanged(existing)),
        (Some(current), None) => current,
        (Some(_), Some(requested)) => requested,
    };

    let prev_ambulance = existing.as_ref().and_then(|c| c.ambulance_id);
    let prev_hospital = existing.as_ref().and_then(|c| c.hospital_id);

    let (ambulance, hospital) = if next.is_live() {
        let mut ambulance = request.ambulance.unwrap_or(prev_ambulance);
        let hospital = request.hospital.unwrap_or(prev_hospital);

        if let Some(id) = ambulance.filter(|id| Some(*id) != prev_ambulance) {
            check_attach(db, perms, ResourceKind::Ambulance, id)?;
        }
        if let Some(id) = hospital.filter(|id| Some(*id) != prev_hospital) {
            check_attach(db, perms, ResourceKind::Hospital, id)?;
        }

        if request.status == Some(ClientStatus::Reconnected)
            && ambulance.is_none()
            && request.ambulance.is_none()
        {
            ambulance = restore_ambulance(db, perms, client_id)?;
        }
        (ambulance, hospital)
    } else {
        if request.attaches() {
            return Err(BridgeError::invalid(format!(
                "cannot attach while going {next}"
            )));
        }
        (None, None)
    };

    let now = Utc::now();
    let client = Client {
        client_id: client_id.to_string(),
        user_id: perms.user_id,
        status: next,
        ambulance_id: ambulance,
        hospital_id: hospital,
        updated_on: now,
    };
    db.save_client(&client)?;

    if next.is_live() && request.status.is_some() {
        db.insert_client_log(&client, ClientActivity::Handshake, "", None, None)?;
    }
    record_attachments(db, &client, prev_ambulance, prev_hospital)?;

    if next == ClientStatus::Offline {
        if let Some(id) = prev_ambulance {
            mark_unknown(db, id, perms.user_id, now)?;
        }
    }

    info!(
        client_id,
        user = %perms.username,
        from = ?current,
        to = %next,
        ambulance = ?ambulance,
        hospital = ?hospital,
        "session updated"
    );

    let notifications = affected(db, prev_ambulance, ambulance, prev_hospital, hospital)?;
    Ok(SessionOutcome {
        client: Some(client),
        notifications,
    })
}

/// Mark every live session Disconnected, releasing its attachments. Run
/// once at startup, before the broker connection comes up.
pub fn reap(db: &Database) -> Result<Vec<Notification>, BridgeError> {
    let live = db.list_clients_with_status(&[ClientStatus::Online, ClientStatus::Reconnected])?;
    let mut notifications = Vec::new();
    let now = Utc::now();

    for stale in &live {
        let client = Client {
            status: ClientStatus::Disconnected,
            ambulance_id: None,
            hospital_id: None,
            updated_on: now,
            ..stale.clone()
        };
        db.save_client(&client)?;
        record_attachments(db, &client, stale.ambulance_id, stale.hospital_id)?;
        notifications.extend(affected(db, stale.ambulance_id, None, stale.hospital_id, None)?);
    }

    if !live.is_empty() {
        info!(count = live.len(), "stale sessions marked disconnected");
    }
    Ok(notifications)
}

fn check_attach(
    db: &Database,
    perms: &Permissions,
    kind: ResourceKind,
    id: i64,
) -> Result<(), BridgeError> {
    let exists = match kind {
        ResourceKind::Ambulance => db.get_ambulance(id).map(|_| ()),
        ResourceKind::Hospital => db.get_hospital(id).map(|_| ()),
    };
    match exists {
        Ok(()) => {}
        Err(StoreError::NotFound) => {
            return Err(BridgeError::unknown(format!("{} {id}", kind.as_str())))
        }
        Err(e) => return Err(e.into()),
    }
    if !perms.can_write(kind, id) {
        return Err(BridgeError::unauthorized(format!(
            "no write access to {} {id}",
            kind.as_str()
        )));
    }
    Ok(())
}

/// The ambulance released by the session's last logout, if it can be taken
/// back.
fn restore_ambulance(
    db: &Database,
    perms: &Permissions,
    client_id: &str,
) -> Result<Option<i64>, BridgeError> {
    let Some(id) = db.last_ambulance_logout(client_id)? else {
        return Ok(None);
    };
    if !perms.can_write(ResourceKind::Ambulance, id) {
        info!(client_id, ambulance = id, "not restoring ambulance: no longer writable");
        return Ok(None);
    }
    if let Some(holder) = db.find_client_by_ambulance(id)? {
        if holder.client_id != client_id {
            info!(
                client_id,
                ambulance = id,
                held_by = %holder.client_id,
                "not restoring ambulance: held by another session"
            );
            return Ok(None);
        }
    }
    match db.get_ambulance(id) {
        Ok(_) => Ok(Some(id)),
        Err(StoreError::NotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Logout before login, ambulances before hospitals.
fn record_attachments(
    db: &Database,
    client: &Client,
    prev_ambulance: Option<i64>,
    prev_hospital: Option<i64>,
) -> Result<(), StoreError> {
    if prev_ambulance != client.ambulance_id {
        if let Some(id) = prev_ambulance {
            db.insert_client_log(client, ClientActivity::AmbulanceLogout, "", Some(id), None)?;
        }
        if let Some(id) = client.ambulance_id {
            db.insert_client_log(client, ClientActivity::AmbulanceLogin, "", Some(id), None)?;
        }
    }
    if prev_hospital != client.hospital_id {
        if let Some(id) = prev_hospital {
            db.insert_client_log(client, ClientActivity::HospitalLogout, "", None, Some(id))?;
        }
        if let Some(id) = client.hospital_id {
            db.insert_client_log(client, ClientActivity::HospitalLogin, "", None, Some(id))?;
        }
    }
    Ok(())
}

fn mark_unknown(
    db: &Database,
    ambulance_id: i64,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let mut ambulance = db.get_ambulance(ambulance_id)?;
    if ambulance.status == AmbulanceStatus::Unknown {
        return Ok(());
    }
    ambulance.status = AmbulanceStatus::Unknown;
    ambulance.updated_by = Some(user_id);
    ambulance.updated_on = now;
    db.save_ambulance(&ambulance)?;
    db.insert_ambulance_update(&ambulance)?;
    Ok(())
}

fn affected(
    db: &Database,
    prev_ambulance: Option<i64>,
    ambulance: Option<i64>,
    prev_hospital: Option<i64>,
    hospital: Option<i64>,
) -> Result<Vec<Notification>, StoreError> {
    let mut out = Vec::new();
    if prev_ambulance != ambulance {
        for id in prev_ambulance.into_iter().chain(ambulance) {
            out.push(Notification::Ambulance(db.get_ambulance(id)?));
        }
    }
    if prev_hospital != hospital {
        for id in prev_hospital.into_iter().chain(hospital) {
            out.push(Notification::Hospital(db.get_hospital(id)?));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ambulink_shared::{AmbulanceCapability, SubjectKind};
    use ambulink_store::PermissionGrant;

    struct Fixture {
        db: Database,
        cache: PermissionCache,
        amb: i64,
        hosp: i64,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let alice = db.create_user("alice", false, false).unwrap();
        let bob = db.create_user("bob", false, false).unwrap();
        let amb = db
            .create_ambulance("AMB-1", AmbulanceCapability::Basic)
            .unwrap();
        let hosp = db.create_hospital("General").unwrap();
        for user in [alice.id, bob.id] {
            db.set_grant(&PermissionGrant {
                subject_kind: SubjectKind::User,
                subject_id: user,
                resource_kind: ResourceKind::Ambulance,
                resource_id: amb.id,
                can_read: true,
                can_write: true,
            })
            .unwrap();
        }
        Fixture {
            db,
            cache: PermissionCache::new(),
            amb: amb.id,
            hosp: hosp.id,
        }
    }

    impl Fixture {
        fn run(
            &self,
            username: &str,
            client_id: &str,
            request: SessionRequest,
        ) -> Result<SessionOutcome, BridgeError> {
            self.db
                .transaction(|db| upsert(db, &self.cache, username, client_id, &request))
        }

        fn activities(&self, client_id: &str) -> Vec<ClientActivity> {
            self.db
                .list_client_logs(client_id)
                .unwrap()
                .into_iter()
                .map(|log| log.activity)
                .collect()
        }
    }

    fn attach(status: ClientStatus, ambulance: i64) -> SessionRequest {
        SessionRequest {
            status: Some(status),
            ambulance: Some(Some(ambulance)),
            hospital: None,
        }
    }

    #[test]
    fn test_handshake_is_idempotent() {
        let f = fixture();
        f.run("alice", "dev-1", SessionRequest::status(ClientStatus::Online))
            .unwrap();
        let outcome = f
            .run("alice", "dev-1", SessionRequest::status(ClientStatus::Online))
            .unwrap();

        let client = outcome.client.unwrap();
        assert_eq!(client.status, ClientStatus::Online);
        assert_eq!(client.ambulance_id, None);
        assert!(outcome.notifications.is_empty());
        assert_eq!(
            f.activities("dev-1"),
            vec![ClientActivity::Handshake, ClientActivity::Handshake]
        );
    }

    #[test]
    fn test_ambulance_held_by_one_session_only() {
        let f = fixture();
        f.run("alice", "dev-1", attach(ClientStatus::Online, f.amb))
            .unwrap();

        let err = f
            .run("bob", "dev-2", attach(ClientStatus::Online, f.amb))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Store(StoreError::Conflict(_))));
        assert!(f.db.find_client("dev-2").unwrap().is_none());
        assert!(f.activities("dev-2").is_empty());

        let holder = f.db.find_client_by_ambulance(f.amb).unwrap().unwrap();
        assert_eq!(holder.client_id, "dev-1");
    }

    #[test]
    fn test_reconnect_restores_ambulance() {
        let f = fixture();
        f.run("alice", "dev-1", attach(ClientStatus::Online, f.amb))
            .unwrap();
        let gone = f
            .run("alice", "dev-1", SessionRequest::status(ClientStatus::Disconnected))
            .unwrap();
        assert_eq!(gone.client.unwrap().ambulance_id, None);
        assert_eq!(gone.notifications.len(), 1);

        // Repeated disconnect changes nothing.
        f.run("alice", "dev-1", SessionRequest::status(ClientStatus::Disconnected))
            .unwrap();

        let back = f
            .run("alice", "dev-1", SessionRequest::status(ClientStatus::Reconnected))
            .unwrap();
        let client = back.client.unwrap();
        assert_eq!(client.status, ClientStatus::Reconnected);
        assert_eq!(client.ambulance_id, Some(f.amb));

        assert_eq!(
            f.activities("dev-1"),
            vec![
                ClientActivity::Handshake,
                ClientActivity::AmbulanceLogin,
                ClientActivity::AmbulanceLogout,
                ClientActivity::Handshake,
                ClientActivity::AmbulanceLogin,
            ]
        );
    }

    #[test]
    fn test_reconnect_skips_ambulance_taken_meanwhile() {
        let f = fixture();
        f.run("alice", "dev-1", attach(ClientStatus::Online, f.amb))
            .unwrap();
        f.run("alice", "dev-1", SessionRequest::status(ClientStatus::Disconnected))
            .unwrap();
        f.run("bob", "dev-2", attach(ClientStatus::Online, f.amb))
            .unwrap();

        let back = f
            .run("alice", "dev-1", SessionRequest::status(ClientStatus::Reconnected))
            .unwrap();
        assert_eq!(back.client.unwrap().ambulance_id, None);
    }

    #[test]
    fn test_offline_session_cannot_reconnect() {
        let f = fixture();
        f.run("alice", "dev-1", SessionRequest::status(ClientStatus::Online))
            .unwrap();
        f.run("alice", "dev-1", SessionRequest::status(ClientStatus::Offline))
            .unwrap();

        let err = f
            .run("alice", "dev-1", SessionRequest::status(ClientStatus::Reconnected))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Validation(_)));

        let online = f
            .run("alice", "dev-1", SessionRequest::status(ClientStatus::Online))
            .unwrap();
        assert_eq!(online.client.unwrap().status, ClientStatus::Online);
    }

    #[test]
    fn test_unwritable_attach_changes_nothing() {
        let f = fixture();
        f.run("alice", "dev-1", SessionRequest::status(ClientStatus::Online))
            .unwrap();
        let before = f.activities("dev-1");

        let err = f
            .run(
                "alice",
                "dev-1",
                SessionRequest {
                    status: Some(ClientStatus::Online),
                    ambulance: None,
                    hospital: Some(Some(f.hosp)),
                },
            )
            .unwrap_err();
        assert!(matches!(err, BridgeError::Authorization(_)));
        assert_eq!(f.activities("dev-1"), before);
        assert_eq!(f.db.find_client("dev-1").unwrap().unwrap().hospital_id, None);
    }

    #[test]
    fn test_offline_marks_ambulance_unknown() {
        let f = fixture();
        let mut amb = f.db.get_ambulance(f.amb).unwrap();
        amb.status = AmbulanceStatus::Available;
        f.db.save_ambulance(&amb).unwrap();

        f.run("alice", "dev-1", attach(ClientStatus::Online, f.amb))
            .unwrap();
        let outcome = f
            .run("alice", "dev-1", SessionRequest::status(ClientStatus::Offline))
            .unwrap();

        match &outcome.notifications[..] {
            [Notification::Ambulance(published)] => {
                assert_eq!(published.status, AmbulanceStatus::Unknown)
            }
            other => panic!("unexpected notifications: {other:?}"),
        }
        assert_eq!(f.db.list_ambulance_updates(f.amb).unwrap().len(), 1);
    }

    #[test]
    fn test_departure_of_unknown_client_is_ignored() {
        let f = fixture();
        let outcome = f
            .run("alice", "dev-9", SessionRequest::status(ClientStatus::Disconnected))
            .unwrap();
        assert!(outcome.client.is_none());
        assert!(f.db.find_client("dev-9").unwrap().is_none());
    }

    #[test]
    fn test_foreign_client_id_is_rejected() {
        let f = fixture();
        f.run("alice", "dev-1", SessionRequest::status(ClientStatus::Online))
            .unwrap();
        let err = f
            .run("bob", "dev-1", SessionRequest::status(ClientStatus::Online))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Authorization(_)));
    }

    #[test]
    fn test_reap_disconnects_live_sessions() {
        let f = fixture();
        f.run("alice", "dev-1", attach(ClientStatus::Online, f.amb))
            .unwrap();
        f.run("bob", "dev-2", SessionRequest::status(ClientStatus::Online))
            .unwrap();

        let notifications = f.db.transaction(reap).unwrap();
        assert_eq!(notifications.len(), 1);

        for id in ["dev-1", "dev-2"] {
            let client = f.db.find_client(id).unwrap().unwrap();
            assert_eq!(client.status, ClientStatus::Disconnected);
            assert_eq!(client.ambulance_id, None);
        }
        assert_eq!(f.db.last_ambulance_logout("dev-1").unwrap(), Some(f.amb));
    }
}
