//! tatami-store — SQLite persistence for members, embeddings, the class
//! timetable and attendance.
//!
//! One [`SqliteStore`] implements every storage contract the core consumes.
//! Calls are blocking; async callers go through `spawn_blocking`.

pub mod classes;
pub mod records;
pub mod schema;

use chrono::NaiveDateTime;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tatami_core::{
    BeltRank, CheckInMethod, Descriptor, EmbeddingStore, MemberCard, MemberEmbedding, MemberId,
    MemberRegistry, NewMember, StoreError, MAX_STRIPES,
};
use thiserror::Error;

pub use classes::{Class, ClassError, NewClass, CHECK_IN_LEAD_MINUTES, DISPLAY_LEAD_MINUTES};
pub use records::{AttendanceRecord, FIRST_VISIT, OPEN_MAT};

/// Membership status. Only `active` and `trial` members are matched at the kiosk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Active,
    Pending,
    Overdue,
    Inactive,
    Trial,
    Cancelled,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberStatus::Active => "active",
            MemberStatus::Pending => "pending",
            MemberStatus::Overdue => "overdue",
            MemberStatus::Inactive => "inactive",
            MemberStatus::Trial => "trial",
            MemberStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for MemberStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "active" => MemberStatus::Active,
            "pending" => MemberStatus::Pending,
            "overdue" => MemberStatus::Overdue,
            "inactive" => MemberStatus::Inactive,
            "trial" => MemberStatus::Trial,
            "cancelled" => MemberStatus::Cancelled,
            other => return Err(format!("unknown member status: {other}")),
        })
    }
}

#[derive(Error, Debug)]
pub enum RankError {
    #[error("stripes must be between 0 and {MAX_STRIPES}, got {0}")]
    InvalidStripes(u8),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// A member as listed to operators. The photo and embedding are summarised, not returned.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Member {
    pub id: MemberId,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub belt_rank: BeltRank,
    pub stripes: u8,
    pub status: MemberStatus,
    pub join_date: NaiveDateTime,
    pub last_check_in: Option<NaiveDateTime>,
    pub attendance_count: u32,
    pub has_profile_image: bool,
    pub has_face: bool,
}

const MEMBER_COLUMNS: &str = "id, first_name, last_name, email, phone, status, join_date,
    last_check_in, attendance_count, profile_image IS NOT NULL, face_embedding IS NOT NULL,
    belt_rank, stripes";

/// Parse a text column through `FromStr`, reporting failures against that column.
fn parsed<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    row.get::<_, String>(idx)?.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn member_from_row(row: &Row<'_>) -> rusqlite::Result<Member> {
    Ok(Member {
        id: MemberId::new(row.get::<_, String>(0)?),
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
        belt_rank: parsed(row, 11)?,
        stripes: row.get(12)?,
        status: parsed(row, 5)?,
        join_date: row.get(6)?,
        last_check_in: row.get(7)?,
        attendance_count: row.get(8)?,
        has_profile_image: row.get(9)?,
        has_face: row.get(10)?,
    })
}

pub(crate) fn member_card(conn: &Connection, member_id: &MemberId) -> Result<MemberCard, StoreError> {
    conn.query_row(
        "SELECT id, first_name, last_name, belt_rank, stripes, profile_image IS NOT NULL
         FROM members WHERE id = ?1",
        params![member_id.as_str()],
        |row| {
            Ok(MemberCard {
                id: MemberId::new(row.get::<_, String>(0)?),
                first_name: row.get(1)?,
                last_name: row.get(2)?,
                belt_rank: parsed(row, 3)?,
                stripes: row.get(4)?,
                has_profile_image: row.get(5)?,
            })
        },
    )
    .optional()
    .map_err(backend)?
    .ok_or_else(|| StoreError::MemberNotFound(member_id.clone()))
}

pub(crate) fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(Box::new(err))
}

pub(crate) fn member_exists(conn: &Connection, member_id: &MemberId) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM members WHERE id = ?1",
        params![member_id.as_str()],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
}

fn parse_embedding(member_id: &MemberId, json: Option<String>) -> Result<Option<Descriptor>, StoreError> {
    json.map(|json| {
        serde_json::from_str::<Descriptor>(&json).map_err(|e| StoreError::Corrupt {
            member: member_id.clone(),
            reason: format!("face_embedding: {e}"),
        })
    })
    .transpose()
}

fn encode_embedding(embedding: &Descriptor) -> Result<String, StoreError> {
    serde_json::to_string(embedding).map_err(|e| StoreError::Backend(Box::new(e)))
}

fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// SQLite-backed store. The connection is shared behind a mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(Box::new(e)))?;
        }
        let conn = Connection::open(path).map_err(backend)?;
        schema::apply(&conn).map_err(backend)?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        schema::apply(&conn).map_err(backend)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn embeddings_where(&self, filter: &str) -> Result<Vec<MemberEmbedding>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT id, face_embedding FROM members {filter} ORDER BY id"
            ))
            .map_err(backend)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)))
            .map_err(backend)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(backend)?;

        rows.into_iter()
            .map(|(id, json)| {
                let member_id = MemberId::new(id);
                let embedding = parse_embedding(&member_id, json)?;
                Ok(MemberEmbedding { member_id, embedding })
            })
            .collect()
    }

    pub fn list_members(&self) -> Result<Vec<Member>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MEMBER_COLUMNS} FROM members ORDER BY last_name, first_name, id"
            ))
            .map_err(backend)?;
        let rows = stmt.query_map([], member_from_row).map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
    }

    pub fn get_member(&self, member_id: &MemberId) -> Result<Member, StoreError> {
        self.conn()
            .query_row(
                &format!("SELECT {MEMBER_COLUMNS} FROM members WHERE id = ?1"),
                params![member_id.as_str()],
                member_from_row,
            )
            .optional()
            .map_err(backend)?
            .ok_or_else(|| StoreError::MemberNotFound(member_id.clone()))
    }

    /// Name, belt and photo flag for greeting the member at the kiosk.
    pub fn member_card(&self, member_id: &MemberId) -> Result<MemberCard, StoreError> {
        member_card(&self.conn(), member_id)
    }

    /// PNG bytes of the member's profile photo, if one was captured.
    pub fn profile_image(&self, member_id: &MemberId) -> Result<Option<Vec<u8>>, StoreError> {
        self.conn()
            .query_row(
                "SELECT profile_image FROM members WHERE id = ?1",
                params![member_id.as_str()],
                |row| row.get::<_, Option<Vec<u8>>>(0),
            )
            .optional()
            .map_err(backend)?
            .ok_or_else(|| StoreError::MemberNotFound(member_id.clone()))
    }

    /// Store `png` as the profile photo unless the member already has one.
    /// Returns whether the photo was stored.
    pub fn set_profile_image_if_missing(&self, member_id: &MemberId, png: &[u8]) -> Result<bool, StoreError> {
        let conn = self.conn();
        let changed = conn
            .execute(
                "UPDATE members SET profile_image = ?2, updated_at = ?3
                 WHERE id = ?1 AND profile_image IS NULL",
                params![member_id.as_str(), png, now()],
            )
            .map_err(backend)?;
        if changed == 0 && !member_exists(&conn, member_id).map_err(backend)? {
            return Err(StoreError::MemberNotFound(member_id.clone()));
        }
        Ok(changed > 0)
    }

    /// Promote (or correct) a member's belt and stripe count.
    pub fn set_rank(&self, member_id: &MemberId, belt: BeltRank, stripes: u8) -> Result<(), RankError> {
        if stripes > MAX_STRIPES {
            return Err(RankError::InvalidStripes(stripes));
        }
        let changed = self
            .conn()
            .execute(
                "UPDATE members SET belt_rank = ?2, stripes = ?3, updated_at = ?4 WHERE id = ?1",
                params![member_id.as_str(), belt.as_str(), stripes, now()],
            )
            .map_err(backend)?;
        if changed == 0 {
            return Err(StoreError::MemberNotFound(member_id.clone()).into());
        }
        tracing::info!(member = %member_id, belt = belt.as_str(), stripes, "rank updated");
        Ok(())
    }

    pub fn set_status(&self, member_id: &MemberId, status: MemberStatus) -> Result<(), StoreError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE members SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![member_id.as_str(), status.as_str(), now()],
            )
            .map_err(backend)?;
        if changed == 0 {
            return Err(StoreError::MemberNotFound(member_id.clone()));
        }
        tracing::info!(member = %member_id, status = status.as_str(), "member status changed");
        Ok(())
    }

    /// Delete a member together with their embedding and attendance history.
    pub fn remove_member(&self, member_id: &MemberId) -> Result<(), StoreError> {
        let changed = self
            .conn()
            .execute("DELETE FROM members WHERE id = ?1", params![member_id.as_str()])
            .map_err(backend)?;
        if changed == 0 {
            return Err(StoreError::MemberNotFound(member_id.clone()));
        }
        tracing::info!(member = %member_id, "member removed");
        Ok(())
    }
}

impl EmbeddingStore for SqliteStore {
    fn get(&self, member_id: &MemberId) -> Result<Option<Descriptor>, StoreError> {
        let json = self
            .conn()
            .query_row(
                "SELECT face_embedding FROM members WHERE id = ?1",
                params![member_id.as_str()],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map_err(backend)?
            .ok_or_else(|| StoreError::MemberNotFound(member_id.clone()))?;
        parse_embedding(member_id, json)
    }

    fn get_all(&self) -> Result<Vec<MemberEmbedding>, StoreError> {
        self.embeddings_where("")
    }

    fn set(&self, member_id: &MemberId, embedding: &Descriptor) -> Result<(), StoreError> {
        let json = encode_embedding(embedding)?;
        let changed = self
            .conn()
            .execute(
                "UPDATE members SET face_embedding = ?2, updated_at = ?3 WHERE id = ?1",
                params![member_id.as_str(), json, now()],
            )
            .map_err(backend)?;
        if changed == 0 {
            return Err(StoreError::MemberNotFound(member_id.clone()));
        }
        Ok(())
    }

    fn gallery(&self) -> Result<Vec<MemberEmbedding>, StoreError> {
        self.embeddings_where("WHERE status IN ('active', 'trial')")
    }
}

impl MemberRegistry for SqliteStore {
    fn enroll(&self, member: &NewMember) -> Result<MemberId, StoreError> {
        let id = MemberId::new(uuid::Uuid::new_v4().to_string());
        let embedding = member.descriptor.as_ref().map(encode_embedding).transpose()?;
        let now = now();

        let mut conn = self.conn();
        let tx = conn.transaction().map_err(backend)?;
        tx.execute(
            "INSERT INTO members (id, first_name, last_name, email, phone, status, join_date,
                 last_check_in, attendance_count, profile_image, face_embedding, belt_rank, stripes,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 1, ?8, ?9, ?10, ?11, ?7, ?7)",
            params![
                id.as_str(),
                member.first_name,
                member.last_name,
                member.email,
                member.phone,
                MemberStatus::Trial.as_str(),
                now,
                member.profile_image,
                embedding,
                member.belt_rank.as_str(),
                member.stripes
            ],
        )
        .map_err(backend)?;
        records::insert_attendance(&tx, &id, None, FIRST_VISIT, now, CheckInMethod::Facial)
            .map_err(backend)?;
        tx.commit().map_err(backend)?;

        Ok(id)
    }
}
