//! Broker access control.
//!
//! The broker asks the bridge, through the HTTP hook, whether a client may
//! subscribe to or publish on a topic. [`decide`] is a pure function over
//! the caller's cached [`Permissions`]; [`AclAuthorizer`] only resolves
//! those permissions, touching the store on a cache miss.

use std::sync::Arc;

use tracing::debug;

use ambulink_shared::{Direction, ResourceKind};

use crate::error::BridgeError;
use crate::permissions::{PermissionCache, Permissions};
use crate::state::SharedDb;

fn id(segment: &str) -> Option<i64> {
    segment.parse().ok()
}

/// A single-level wildcard or an integer id.
fn id_or_wildcard(segment: &str) -> bool {
    segment == "+" || id(segment).is_some()
}

/// Decide one access request. `None` means the user does not exist.
pub fn decide(
    perms: Option<&Permissions>,
    username: &str,
    client_id: &str,
    direction: Direction,
    topic: &str,
) -> bool {
    let Some(perms) = perms else {
        return false;
    };
    if !perms.is_active {
        return false;
    }
    if perms.is_superuser {
        return true;
    }

    let segments: Vec<&str> = topic.split('/').collect();
    match direction {
        Direction::Subscribe => may_subscribe(perms, username, client_id, &segments),
        Direction::Publish => may_publish(perms, username, client_id, &segments),
    }
}

fn may_subscribe(perms: &Permissions, username: &str, client_id: &str, topic: &[&str]) -> bool {
    match topic {
        ["user", u, "profile"] => *u == username,
        ["user", u, "client", c, "error"] => *u == username && *c == client_id,

        ["ambulance", amb, "data"] => {
            id(amb).is_some_and(|amb| perms.can_read(ResourceKind::Ambulance, amb))
        }
        ["ambulance", amb, "call", call, "status"] => {
            id_or_wildcard(call)
                && id(amb).is_some_and(|amb| perms.can_read(ResourceKind::Ambulance, amb))
        }

        ["hospital", hosp, "data" | "metadata"] => {
            id(hosp).is_some_and(|hosp| perms.can_read(ResourceKind::Hospital, hosp))
        }

        ["equipment", holder, "item", item, "data"] => {
            id_or_wildcard(item) && id(holder).is_some_and(|holder| perms.can_read_holder(holder))
        }

        ["call", call, "data"] => id_or_wildcard(call) && perms.is_staff,

        _ => false,
    }
}

fn may_publish(perms: &Permissions, username: &str, client_id: &str, topic: &[&str]) -> bool {
    let ["user", u, "client", c, rest @ ..] = topic else {
        return false;
    };
    if *u != username || *c != client_id {
        return false;
    }

    match rest {
        ["status"] => true,

        ["ambulance", amb, "data"]
        | ["ambulance", amb, "call", _, "status"]
        | ["ambulance", amb, "call", _, "waypoint", _, "data"] => {
            ids_valid(rest) && id(amb).is_some_and(|amb| perms.can_write(ResourceKind::Ambulance, amb))
        }

        ["hospital", hosp, "data"] => {
            id(hosp).is_some_and(|hosp| perms.can_write(ResourceKind::Hospital, hosp))
        }

        ["equipment", holder, "item", item, "data"] => {
            id(item).is_some() && id(holder).is_some_and(|holder| perms.can_write_holder(holder))
        }

        _ => false,
    }
}

/// Every parameter position of an ambulance publish topic holds an integer.
fn ids_valid(rest: &[&str]) -> bool {
    rest.iter()
        .skip(1)
        .step_by(2)
        .all(|segment| id(segment).is_some())
}

/// Resolves permissions and applies [`decide`].
#[derive(Clone)]
pub struct AclAuthorizer {
    cache: Arc<PermissionCache>,
    db: SharedDb,
}

impl AclAuthorizer {
    pub fn new(cache: Arc<PermissionCache>, db: SharedDb) -> Self {
        Self { cache, db }
    }

    async fn permissions(&self, username: &str) -> Result<Option<Arc<Permissions>>, BridgeError> {
        if let Some(perms) = self.cache.get(username) {
            return Ok(Some(perms));
        }
        let db = self.db.lock().await;
        Ok(self.cache.load(&db, username)?)
    }

    pub async fn authorize(
        &self,
        username: &str,
        client_id: &str,
        direction: Direction,
        topic: &str,
    ) -> Result<bool, BridgeError> {
        let perms = self.permissions(username).await?;
        let allowed = decide(perms.as_deref(), username, client_id, direction, topic);
        if !allowed {
            debug!(username, client_id, ?direction, topic, "access denied");
        }
        Ok(allowed)
    }

    pub async fn is_superuser(&self, username: &str) -> Result<bool, BridgeError> {
        let perms = self.permissions(username).await?;
        Ok(perms.is_some_and(|p| p.is_active && p.is_superuser))
    }
}
