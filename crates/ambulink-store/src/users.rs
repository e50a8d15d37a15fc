//! Users, groups and permission grants.
//!
//! Every mutation in this module affects effective permissions; callers are
//! responsible for invalidating any permission cache afterwards.

use rusqlite::{params, OptionalExtension};

use ambulink_shared::{ResourceKind, SubjectKind};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Group, HolderOwner, PermissionGrant, User};
use crate::sql::get_enum;

impl Database {
    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    pub fn create_user(&self, username: &str, is_staff: bool, is_superuser: bool) -> Result<User> {
        self.conn()
            .execute(
                "INSERT INTO users (username, is_staff, is_superuser, is_active)
                 VALUES (?1, ?2, ?3, 1)",
                params![username, is_staff, is_superuser],
            )
            .map_err(StoreError::from_write)?;

        Ok(User {
            id: self.conn().last_insert_rowid(),
            username: username.to_string(),
            is_staff,
            is_superuser,
            is_active: true,
        })
    }

    pub fn get_user(&self, id: i64) -> Result<User> {
        self.conn()
            .query_row(
                "SELECT id, username, is_staff, is_superuser, is_active
                 FROM users WHERE id = ?1",
                params![id],
                row_to_user,
            )
            .map_err(StoreError::from_read)
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let user = self
            .conn()
            .query_row(
                "SELECT id, username, is_staff, is_superuser, is_active
                 FROM users WHERE username = ?1",
                params![username],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, username, is_staff, is_superuser, is_active
             FROM users ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], row_to_user)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn set_user_active(&self, id: i64, active: bool) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE users SET is_active = ?1 WHERE id = ?2",
            params![active, id],
        )?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    pub fn create_group(&self, name: &str) -> Result<Group> {
        self.conn()
            .execute("INSERT INTO groups (name) VALUES (?1)", params![name])
            .map_err(StoreError::from_write)?;
        Ok(Group {
            id: self.conn().last_insert_rowid(),
            name: name.to_string(),
        })
    }

    /// Add a user to a group. Returns `false` if already a member.
    pub fn add_group_member(&self, group_id: i64, user_id: i64) -> Result<bool> {
        let affected = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO group_members (group_id, user_id) VALUES (?1, ?2)",
                params![group_id, user_id],
            )
            .map_err(StoreError::from_write)?;
        Ok(affected > 0)
    }

    pub fn remove_group_member(&self, group_id: i64, user_id: i64) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            params![group_id, user_id],
        )?;
        Ok(affected > 0)
    }

    pub fn list_group_members(&self, group_id: i64) -> Result<Vec<User>> {
        let mut stmt = self.conn().prepare(
            "SELECT u.id, u.username, u.is_staff, u.is_superuser, u.is_active
             FROM users u
             JOIN group_members m ON m.user_id = u.id
             WHERE m.group_id = ?1
             ORDER BY u.id ASC",
        )?;
        let rows = stmt.query_map(params![group_id], row_to_user)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    // ------------------------------------------------------------------
    // Grants
    // ------------------------------------------------------------------

    /// Create or replace the grant for `(subject, resource)`.
    pub fn set_grant(&self, grant: &PermissionGrant) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO permission_grants
                    (subject_kind, subject_id, resource_kind, resource_id, can_read, can_write)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (subject_kind, subject_id, resource_kind, resource_id)
                 DO UPDATE SET can_read = excluded.can_read, can_write = excluded.can_write",
                params![
                    grant.subject_kind.as_str(),
                    grant.subject_id,
                    grant.resource_kind.as_str(),
                    grant.resource_id,
                    grant.can_read,
                    grant.can_write,
                ],
            )
            .map_err(StoreError::from_write)?;
        Ok(())
    }

    pub fn delete_grant(
        &self,
        subject_kind: SubjectKind,
        subject_id: i64,
        resource_kind: ResourceKind,
        resource_id: i64,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM permission_grants
             WHERE subject_kind = ?1 AND subject_id = ?2
               AND resource_kind = ?3 AND resource_id = ?4",
            params![
                subject_kind.as_str(),
                subject_id,
                resource_kind.as_str(),
                resource_id
            ],
        )?;
        Ok(affected > 0)
    }

    /// Every grant that applies to a user: direct grants plus the grants of
    /// all groups the user belongs to.
    pub fn grants_for_user(&self, user_id: i64) -> Result<Vec<PermissionGrant>> {
        let mut stmt = self.conn().prepare(
            "SELECT subject_kind, subject_id, resource_kind, resource_id, can_read, can_write
             FROM permission_grants
             WHERE subject_kind = 'user' AND subject_id = ?1
             UNION ALL
             SELECT g.subject_kind, g.subject_id, g.resource_kind, g.resource_id,
                    g.can_read, g.can_write
             FROM permission_grants g
             JOIN group_members m ON m.group_id = g.subject_id
             WHERE g.subject_kind = 'group' AND m.user_id = ?1",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_grant)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Map of every equipment holder to the ambulance or hospital owning it.
    pub fn list_holder_owners(&self) -> Result<Vec<HolderOwner>> {
        let mut stmt = self.conn().prepare(
            "SELECT equipmentholder_id, 'ambulance', id FROM ambulances
             WHERE equipmentholder_id IS NOT NULL
             UNION ALL
             SELECT equipmentholder_id, 'hospital', id FROM hospitals
             WHERE equipmentholder_id IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(HolderOwner {
                holder_id: row.get(0)?,
                kind: get_enum(row, 1)?,
                resource_id: row.get(2)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        is_staff: row.get(2)?,
        is_superuser: row.get(3)?,
        is_active: row.get(4)?,
    })
}

fn row_to_grant(row: &rusqlite::Row<'_>) -> rusqlite::Result<PermissionGrant> {
    Ok(PermissionGrant {
        subject_kind: get_enum(row, 0)?,
        subject_id: row.get(1)?,
        resource_kind: get_enum(row, 2)?,
        resource_id: row.get(3)?,
        can_read: row.get(4)?,
        can_write: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(subject_kind: SubjectKind, subject_id: i64, resource_id: i64, write: bool) -> PermissionGrant {
        PermissionGrant {
            subject_kind,
            subject_id,
            resource_kind: ResourceKind::Ambulance,
            resource_id,
            can_read: true,
            can_write: write,
        }
    }

    #[test]
    fn grants_union_direct_and_group() {
        let db = Database::open_in_memory().unwrap();
        let alice = db.create_user("alice", false, false).unwrap();
        let crew = db.create_group("crew").unwrap();
        assert!(db.add_group_member(crew.id, alice.id).unwrap());
        assert!(!db.add_group_member(crew.id, alice.id).unwrap());

        db.set_grant(&grant(SubjectKind::User, alice.id, 1, false)).unwrap();
        db.set_grant(&grant(SubjectKind::Group, crew.id, 2, true)).unwrap();

        let grants = db.grants_for_user(alice.id).unwrap();
        assert_eq!(grants.len(), 2);
        assert!(grants.iter().any(|g| g.resource_id == 2 && g.can_write));

        let members = db.list_group_members(crew.id).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].username, "alice");

        assert!(db.remove_group_member(crew.id, alice.id).unwrap());
        assert_eq!(db.grants_for_user(alice.id).unwrap().len(), 1);
    }

    #[test]
    fn set_grant_is_an_upsert() {
        let db = Database::open_in_memory().unwrap();
        let bob = db.create_user("bob", false, false).unwrap();

        db.set_grant(&grant(SubjectKind::User, bob.id, 5, false)).unwrap();
        db.set_grant(&grant(SubjectKind::User, bob.id, 5, true)).unwrap();

        let grants = db.grants_for_user(bob.id).unwrap();
        assert_eq!(grants.len(), 1);
        assert!(grants[0].can_write);

        assert!(db
            .delete_grant(SubjectKind::User, bob.id, ResourceKind::Ambulance, 5)
            .unwrap());
        assert!(db.grants_for_user(bob.id).unwrap().is_empty());
    }

    #[test]
    fn duplicate_username_is_a_conflict() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("carol", false, false).unwrap();
        assert!(matches!(
            db.create_user("carol", false, false),
            Err(StoreError::Conflict(_))
        ));
    }
}
