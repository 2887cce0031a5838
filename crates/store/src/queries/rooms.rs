use chrono::{DateTime, Utc};
use rusqlite::params;

use ag_domain::{Error, Result};

use crate::records::{ts_to_sql, RoomRecord};
use crate::store::{db_err, Store};

const ROOM_COLUMNS: &str = "id, owner_id, name, world_id, is_paused, is_finished, \
     max_interactions, created_at, last_activity_at, last_read_at";

impl Store {
    /// Insert a room. Duplicate (owner, name, world) surfaces as
    /// [`Error::Conflict`].
    pub fn create_room(
        &self,
        owner_id: Option<&str>,
        name: &str,
        world_id: Option<i64>,
        max_interactions: Option<i64>,
    ) -> Result<RoomRecord> {
        self.with_conn(|conn| {
            let now = ts_to_sql(Utc::now());
            conn.execute(
                "INSERT INTO rooms (owner_id, name, world_id, max_interactions, \
                 created_at, last_activity_at) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![owner_id, name, world_id, max_interactions, now],
            )
            .map_err(db_err)?;
            let id = conn.last_insert_rowid();
            self.room_row(conn, id)?
                .ok_or_else(|| Error::Storage("room vanished after insert".into()))
        })
    }

    pub fn get_room(&self, id: i64) -> Result<Option<RoomRecord>> {
        self.with_conn(|conn| self.room_row(conn, id))
    }

    /// Rooms visible to a caller. `owner = None` lists everything
    /// (admin); otherwise only the owner's rooms.
    pub fn list_rooms(&self, owner: Option<&str>) -> Result<Vec<RoomRecord>> {
        self.with_conn(|conn| {
            let sql = match owner {
                Some(_) => format!(
                    "SELECT {ROOM_COLUMNS} FROM rooms WHERE owner_id = ?1 \
                     ORDER BY last_activity_at DESC"
                ),
                None => format!("SELECT {ROOM_COLUMNS} FROM rooms ORDER BY last_activity_at DESC"),
            };
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = match owner {
                Some(owner) => stmt.query_map(params![owner], RoomRecord::from_row),
                None => stmt.query_map([], RoomRecord::from_row),
            }
            .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
        })
    }

    /// Rooms eligible for an autonomous round: not paused, not
    /// finished, recently active, and not bound to a TRPG world.
    pub fn active_rooms(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<RoomRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {ROOM_COLUMNS} FROM rooms \
                     WHERE is_paused = 0 AND is_finished = 0 \
                       AND last_activity_at >= ?1 AND world_id IS NULL \
                     ORDER BY last_activity_at DESC LIMIT ?2"
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![ts_to_sql(cutoff), limit as i64], RoomRecord::from_row)
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
        })
    }

    pub fn set_room_paused(&self, id: i64, is_paused: bool) -> Result<()> {
        self.update_room_flag(id, "is_paused", is_paused)
    }

    pub fn set_room_finished(&self, id: i64, is_finished: bool) -> Result<()> {
        self.update_room_flag(id, "is_finished", is_finished)
    }

    pub fn set_room_max_interactions(&self, id: i64, max_interactions: Option<i64>) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE rooms SET max_interactions = ?2 WHERE id = ?1",
                    params![id, max_interactions],
                )
                .map_err(db_err)?;
            ensure_found(changed, id)
        })
    }

    pub fn mark_room_read(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE rooms SET last_read_at = ?2 WHERE id = ?1",
                    params![id, ts_to_sql(at)],
                )
                .map_err(db_err)?;
            ensure_found(changed, id)
        })
    }

    pub fn delete_room(&self, id: i64) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute("DELETE FROM rooms WHERE id = ?1", params![id])
                .map_err(db_err)?;
            ensure_found(changed, id)
        })
    }

    fn update_room_flag(&self, id: i64, column: &str, value: bool) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    &format!("UPDATE rooms SET {column} = ?2 WHERE id = ?1"),
                    params![id, value as i64],
                )
                .map_err(db_err)?;
            ensure_found(changed, id)
        })
    }

    fn room_row(&self, conn: &rusqlite::Connection, id: i64) -> Result<Option<RoomRecord>> {
        use rusqlite::OptionalExtension;
        conn.query_row(
            &format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id = ?1"),
            params![id],
            RoomRecord::from_row,
        )
        .optional()
        .map_err(db_err)
    }
}

fn ensure_found(changed: usize, id: i64) -> Result<()> {
    if changed == 0 {
        Err(Error::NotFound(format!("room {id}")))
    } else {
        Ok(())
    }
}
