//! Equipment catalogue, holders and per-holder items.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use ambulink_shared::{EquipmentType, ResourceKind};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Equipment, EquipmentItem, HolderOwner};
use crate::sql::{get_enum, get_ts, ts};

const ITEM_SELECT: &str = "SELECT i.holder_id, i.equipment_id, e.name, e.kind, i.value, i.comment,
            i.updated_by, i.updated_on
     FROM equipment_items i
     JOIN equipment e ON e.id = i.equipment_id";

impl Database {
    pub(crate) fn create_equipment_holder(&self) -> Result<i64> {
        self.conn()
            .execute("INSERT INTO equipment_holders DEFAULT VALUES", [])?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn create_equipment(
        &self,
        name: &str,
        kind: EquipmentType,
        default_value: &str,
    ) -> Result<Equipment> {
        self.conn()
            .execute(
                "INSERT INTO equipment (name, kind, default_value) VALUES (?1, ?2, ?3)",
                params![name, kind.as_str(), default_value],
            )
            .map_err(StoreError::from_write)?;
        Ok(Equipment {
            id: self.conn().last_insert_rowid(),
            name: name.to_string(),
            kind,
            default_value: default_value.to_string(),
        })
    }

    /// Give a holder an item of `equipment`, initialised to its default value.
    pub fn add_equipment_item(&self, holder_id: i64, equipment_id: i64) -> Result<EquipmentItem> {
        self.conn()
            .execute(
                "INSERT INTO equipment_items (holder_id, equipment_id, value, updated_on)
                 SELECT ?1, id, default_value, ?3 FROM equipment WHERE id = ?2",
                params![holder_id, equipment_id, ts(&Utc::now())],
            )
            .map_err(StoreError::from_write)?;
        self.get_equipment_item(holder_id, equipment_id)
    }

    pub fn get_equipment_item(&self, holder_id: i64, equipment_id: i64) -> Result<EquipmentItem> {
        self.conn()
            .query_row(
                &format!("{ITEM_SELECT} WHERE i.holder_id = ?1 AND i.equipment_id = ?2"),
                params![holder_id, equipment_id],
                row_to_item,
            )
            .map_err(StoreError::from_read)
    }

    pub fn list_equipment_items(&self, holder_id: i64) -> Result<Vec<EquipmentItem>> {
        let mut stmt = self.conn().prepare(&format!(
            "{ITEM_SELECT} WHERE i.holder_id = ?1 ORDER BY e.name ASC"
        ))?;
        let rows = stmt.query_map(params![holder_id], row_to_item)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn list_all_equipment_items(&self) -> Result<Vec<EquipmentItem>> {
        let mut stmt = self.conn().prepare(&format!(
            "{ITEM_SELECT} ORDER BY i.holder_id ASC, i.equipment_id ASC"
        ))?;
        let rows = stmt.query_map([], row_to_item)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn save_equipment_item(&self, item: &EquipmentItem) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE equipment_items
             SET value = ?1, comment = ?2, updated_by = ?3, updated_on = ?4
             WHERE holder_id = ?5 AND equipment_id = ?6",
            params![
                item.value,
                item.comment,
                item.updated_by,
                ts(&item.updated_on),
                item.holder_id,
                item.equipment_id,
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Resolve the ambulance or hospital owning a holder, if any.
    pub fn holder_owner(&self, holder_id: i64) -> Result<Option<HolderOwner>> {
        let owner = self
            .conn()
            .query_row(
                "SELECT 'ambulance', id FROM ambulances WHERE equipmentholder_id = ?1
                 UNION ALL
                 SELECT 'hospital', id FROM hospitals WHERE equipmentholder_id = ?1",
                params![holder_id],
                |row| {
                    Ok(HolderOwner {
                        holder_id,
                        kind: get_enum::<ResourceKind>(row, 0)?,
                        resource_id: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(owner)
    }
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<EquipmentItem> {
    Ok(EquipmentItem {
        holder_id: row.get(0)?,
        equipment_id: row.get(1)?,
        equipment_name: row.get(2)?,
        equipment_type: get_enum(row, 3)?,
        value: row.get(4)?,
        comment: row.get(5)?,
        updated_by: row.get(6)?,
        updated_on: get_ts(row, 7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ambulink_shared::AmbulanceCapability;

    #[test]
    fn items_start_at_default_and_resolve_owner() {
        let db = Database::open_in_memory().unwrap();
        let amb = db.create_ambulance("A-1", AmbulanceCapability::Basic).unwrap();
        let holder = amb.equipmentholder_id.unwrap();
        let oxygen = db
            .create_equipment("oxygen", EquipmentType::Boolean, "True")
            .unwrap();

        let item = db.add_equipment_item(holder, oxygen.id).unwrap();
        assert_eq!(item.value, "True");
        assert_eq!(item.equipment_type, EquipmentType::Boolean);

        let owner = db.holder_owner(holder).unwrap().unwrap();
        assert_eq!(owner.kind, ResourceKind::Ambulance);
        assert_eq!(owner.resource_id, amb.id);

        let hospital = db.create_hospital("General").unwrap();
        let owners = db.list_holder_owners().unwrap();
        assert_eq!(owners.len(), 2);
        assert!(owners
            .iter()
            .any(|o| o.kind == ResourceKind::Hospital && o.resource_id == hospital.id));
    }
}
