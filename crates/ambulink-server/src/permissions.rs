//! Effective permissions and the process-wide permission cache.
//!
//! A [`Permissions`] value is the union of a user's direct grants and the
//! grants of every group they belong to. The cache memoizes one value per
//! user inside an immutable generation, along with the equipment holder
//! ownership table all of them share; [`PermissionCache::invalidate`]
//! swaps in an empty generation so no reader ever sees a half-cleared map.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use ambulink_shared::protocol::{Profile, ProfileGrant};
use ambulink_shared::ResourceKind;
use ambulink_store::{Database, StoreError, User};

/// Read and write sets for one resource kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Access {
    pub read: BTreeSet<i64>,
    pub write: BTreeSet<i64>,
}

impl Access {
    /// Write access implies read access.
    pub fn can_read(&self, id: i64) -> bool {
        self.read.contains(&id) || self.write.contains(&id)
    }

    pub fn can_write(&self, id: i64) -> bool {
        self.write.contains(&id)
    }

    fn grant(&mut self, id: i64, read: bool, write: bool) {
        if read {
            self.read.insert(id);
        }
        if write {
            self.write.insert(id);
        }
    }

    fn profile(&self) -> Vec<ProfileGrant> {
        self.read
            .union(&self.write)
            .map(|&id| ProfileGrant {
                id,
                can_read: self.read.contains(&id),
                can_write: self.write.contains(&id),
            })
            .collect()
    }
}

/// Equipment holder -> owning resource.
pub type HolderOwners = HashMap<i64, (ResourceKind, i64)>;

pub fn load_holder_owners(db: &Database) -> Result<Arc<HolderOwners>, StoreError> {
    let owners = db
        .list_holder_owners()?
        .into_iter()
        .map(|owner| (owner.holder_id, (owner.kind, owner.resource_id)))
        .collect();
    Ok(Arc::new(owners))
}

#[derive(Debug, Clone)]
pub struct Permissions {
    pub user_id: i64,
    pub username: String,
    pub is_active: bool,
    pub is_staff: bool,
    pub is_superuser: bool,
    pub ambulances: Access,
    pub hospitals: Access,
    pub equipment_holders: Arc<HolderOwners>,
}

impl Permissions {
    pub fn load(
        db: &Database,
        user: &User,
        equipment_holders: Arc<HolderOwners>,
    ) -> Result<Self, StoreError> {
        let mut ambulances = Access::default();
        let mut hospitals = Access::default();

        for grant in db.grants_for_user(user.id)? {
            let access = match grant.resource_kind {
                ResourceKind::Ambulance => &mut ambulances,
                ResourceKind::Hospital => &mut hospitals,
            };
            access.grant(grant.resource_id, grant.can_read, grant.can_write);
        }

        Ok(Self {
            user_id: user.id,
            username: user.username.clone(),
            is_active: user.is_active,
            is_staff: user.is_staff,
            is_superuser: user.is_superuser,
            ambulances,
            hospitals,
            equipment_holders,
        })
    }

    fn access(&self, kind: ResourceKind) -> &Access {
        match kind {
            ResourceKind::Ambulance => &self.ambulances,
            ResourceKind::Hospital => &self.hospitals,
        }
    }

    pub fn can_read(&self, kind: ResourceKind, id: i64) -> bool {
        self.is_superuser || self.is_staff || self.access(kind).can_read(id)
    }

    pub fn can_write(&self, kind: ResourceKind, id: i64) -> bool {
        self.is_superuser || self.access(kind).can_write(id)
    }

    pub fn can_read_holder(&self, holder_id: i64) -> bool {
        match self.equipment_holders.get(&holder_id) {
            Some(&(kind, id)) => self.can_read(kind, id),
            None => self.is_superuser,
        }
    }

    pub fn can_write_holder(&self, holder_id: i64) -> bool {
        match self.equipment_holders.get(&holder_id) {
            Some(&(kind, id)) => self.can_write(kind, id),
            None => self.is_superuser,
        }
    }

    /// Stored grants as published on `user/{u}/profile`.
    pub fn profile(&self) -> Profile {
        Profile {
            ambulances: self.ambulances.profile(),
            hospitals: self.hospitals.profile(),
        }
    }
}

/// One immutable cache generation.
#[derive(Default)]
struct Generation {
    by_user: DashMap<i64, Arc<Permissions>>,
    by_username: DashMap<String, i64>,
    holders: OnceLock<Arc<HolderOwners>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Generation {
    /// The ownership table, read from the store at most once per
    /// generation.
    fn holders(&self, db: &Database) -> Result<Arc<HolderOwners>, StoreError> {
        if let Some(holders) = self.holders.get() {
            return Ok(holders.clone());
        }
        let loaded = load_holder_owners(db)?;
        Ok(self.holders.get_or_init(|| loaded).clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

pub struct PermissionCache {
    current: ArcSwap<Generation>,
}

impl Default for PermissionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionCache {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Generation::default()),
        }
    }

    /// Cached permissions for `username`, without touching the store.
    pub fn get(&self, username: &str) -> Option<Arc<Permissions>> {
        let generation = self.current.load();
        let user_id = *generation.by_username.get(username)?;
        let perms = generation.by_user.get(&user_id)?.value().clone();
        generation.hits.fetch_add(1, Ordering::Relaxed);
        Some(perms)
    }

    /// Load from the store and remember the result. Unknown users are not
    /// cached.
    pub fn load(
        &self,
        db: &Database,
        username: &str,
    ) -> Result<Option<Arc<Permissions>>, StoreError> {
        // Insert into the generation that was current when the load began,
        // so an invalidate racing with us drops the stale entry.
        let generation = self.current.load_full();
        generation.misses.fetch_add(1, Ordering::Relaxed);

        let Some(user) = db.get_user_by_username(username)? else {
            return Ok(None);
        };
        let holders = generation.holders(db)?;
        let perms = Arc::new(Permissions::load(db, &user, holders)?);
        generation.by_username.insert(user.username.clone(), user.id);
        generation.by_user.insert(user.id, perms.clone());
        debug!(username, user_id = user.id, "permissions loaded");
        Ok(Some(perms))
    }

    pub fn get_or_load(
        &self,
        db: &Database,
        username: &str,
    ) -> Result<Option<Arc<Permissions>>, StoreError> {
        match self.get(username) {
            Some(perms) => Ok(Some(perms)),
            None => self.load(db, username),
        }
    }

    /// Drop every entry and reset the counters.
    pub fn invalidate(&self) {
        self.current.store(Arc::new(Generation::default()));
        debug!("permission cache invalidated");
    }

    pub fn stats(&self) -> CacheStats {
        let generation = self.current.load();
        CacheStats {
            hits: generation.hits.load(Ordering::Relaxed),
            misses: generation.misses.load(Ordering::Relaxed),
            size: generation.by_user.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ambulink_shared::{AmbulanceCapability, SubjectKind};
    use ambulink_store::PermissionGrant;

    fn grant(kind: ResourceKind, user_id: i64, id: i64, read: bool, write: bool) -> PermissionGrant {
        PermissionGrant {
            subject_kind: SubjectKind::User,
            subject_id: user_id,
            resource_kind: kind,
            resource_id: id,
            can_read: read,
            can_write: write,
        }
    }

    #[test]
    fn test_write_implies_read_and_holders_follow_owner() {
        let db = Database::open_in_memory().unwrap();
        let alice = db.create_user("alice", false, false).unwrap();
        let amb = db
            .create_ambulance("AMB-1", AmbulanceCapability::Basic)
            .unwrap();
        db.set_grant(&grant(ResourceKind::Ambulance, alice.id, amb.id, false, true))
            .unwrap();

        let perms = Permissions::load(&db, &alice, load_holder_owners(&db).unwrap()).unwrap();
        assert!(perms.can_read(ResourceKind::Ambulance, amb.id));
        assert!(perms.can_write(ResourceKind::Ambulance, amb.id));
        assert!(!perms.can_read(ResourceKind::Hospital, amb.id));

        let holder = amb.equipmentholder_id.unwrap();
        assert!(perms.can_read_holder(holder));
        assert!(perms.can_write_holder(holder));
        assert!(!perms.can_read_holder(holder + 100));

        let profile = perms.profile();
        assert_eq!(
            profile.ambulances,
            vec![ProfileGrant {
                id: amb.id,
                can_read: false,
                can_write: true
            }]
        );
    }

    #[test]
    fn test_staff_reads_everything_but_writes_nothing() {
        let db = Database::open_in_memory().unwrap();
        let staff = db.create_user("dispatch", true, false).unwrap();
        let perms = Permissions::load(&db, &staff, load_holder_owners(&db).unwrap()).unwrap();
        assert!(perms.can_read(ResourceKind::Hospital, 42));
        assert!(!perms.can_write(ResourceKind::Hospital, 42));
    }

    #[test]
    fn test_invalidate_resets_counters() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("alice", false, false).unwrap();
        let cache = PermissionCache::new();

        assert!(cache.get_or_load(&db, "alice").unwrap().is_some());
        for _ in 0..3 {
            assert!(cache.get_or_load(&db, "alice").unwrap().is_some());
        }
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 3,
                misses: 1,
                size: 1
            }
        );

        cache.invalidate();
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 0,
                misses: 0,
                size: 0
            }
        );

        assert!(cache.get_or_load(&db, "alice").unwrap().is_some());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn test_unknown_user_is_not_cached() {
        let db = Database::open_in_memory().unwrap();
        let cache = PermissionCache::new();
        assert!(cache.get_or_load(&db, "ghost").unwrap().is_none());
        assert!(cache.get_or_load(&db, "ghost").unwrap().is_none());
        let stats = cache.stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn test_holder_table_is_shared_within_a_generation() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("alice", false, false).unwrap();
        db.create_user("bob", false, false).unwrap();
        let amb = db
            .create_ambulance("AMB-1", AmbulanceCapability::Basic)
            .unwrap();
        let cache = PermissionCache::new();

        let alice = cache.get_or_load(&db, "alice").unwrap().unwrap();
        // Created after the generation read its table.
        let late = db
            .create_ambulance("AMB-2", AmbulanceCapability::Basic)
            .unwrap();
        let bob = cache.get_or_load(&db, "bob").unwrap().unwrap();

        assert!(Arc::ptr_eq(&alice.equipment_holders, &bob.equipment_holders));
        assert!(alice
            .equipment_holders
            .contains_key(&amb.equipmentholder_id.unwrap()));
        assert!(!bob
            .equipment_holders
            .contains_key(&late.equipmentholder_id.unwrap()));

        cache.invalidate();
        let bob = cache.get_or_load(&db, "bob").unwrap().unwrap();
        assert!(bob
            .equipment_holders
            .contains_key(&late.equipmentholder_id.unwrap()));
    }
}
