//! Attendance records and the once-per-class-per-day rule.

use crate::classes::{classes_on, find_current_class, CHECK_IN_LEAD_MINUTES};
use crate::{backend, member_card, member_exists, SqliteStore};
use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tatami_core::{AttendanceRecorder, CheckIn, CheckInMethod, CheckInOutcome, MemberId, StoreError};

/// Class name used when no timetable slot is current.
pub const OPEN_MAT: &str = "Open Mat";
/// Class name of the attendance row written at enrollment.
pub const FIRST_VISIT: &str = "First Visit";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub member_id: MemberId,
    pub class_id: Option<String>,
    pub class_name: String,
    pub check_in_time: NaiveDateTime,
    pub method: String,
}

pub(crate) fn insert_attendance(
    conn: &Connection,
    member_id: &MemberId,
    class_id: Option<&str>,
    class_name: &str,
    at: NaiveDateTime,
    method: CheckInMethod,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO attendance (id, member_id, class_id, class_name, check_in_time, check_in_method)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            uuid::Uuid::new_v4().to_string(),
            member_id.as_str(),
            class_id,
            class_name,
            at,
            method.as_str()
        ],
    )?;
    Ok(())
}

fn checked_in_today(
    conn: &Connection,
    member_id: &MemberId,
    class_name: &str,
    now: NaiveDateTime,
) -> rusqlite::Result<bool> {
    let day_start = now.date().and_time(NaiveTime::MIN);
    let day_end = day_start + Duration::days(1);
    conn.query_row(
        "SELECT 1 FROM attendance
         WHERE member_id = ?1 AND class_name = ?2
           AND check_in_time >= ?3 AND check_in_time < ?4
         LIMIT 1",
        params![member_id.as_str(), class_name, day_start, day_end],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
}

impl SqliteStore {
    /// Record a check-in as of `now` (local time).
    pub fn record_check_in_at(
        &self,
        member_id: &MemberId,
        method: CheckInMethod,
        now: NaiveDateTime,
    ) -> Result<CheckInOutcome, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(backend)?;

        if !member_exists(&tx, member_id).map_err(backend)? {
            return Err(StoreError::MemberNotFound(member_id.clone()));
        }

        let day = now.weekday().num_days_from_sunday() as u8;
        let classes = classes_on(&tx, day).map_err(backend)?;
        let current = find_current_class(&classes, now, CHECK_IN_LEAD_MINUTES);
        let class_id = current.map(|c| c.id.clone());
        let class_name = current.map_or_else(|| OPEN_MAT.to_string(), |c| c.name.clone());

        if checked_in_today(&tx, member_id, &class_name, now).map_err(backend)? {
            tracing::debug!(member = %member_id, class = %class_name, "already checked in today");
            return Ok(CheckInOutcome::AlreadyCheckedIn);
        }

        insert_attendance(&tx, member_id, class_id.as_deref(), &class_name, now, method).map_err(backend)?;
        tx.execute(
            "UPDATE members
             SET attendance_count = attendance_count + 1, last_check_in = ?2, updated_at = ?2
             WHERE id = ?1",
            params![member_id.as_str(), now],
        )
        .map_err(backend)?;
        let member = member_card(&tx, member_id)?;
        tx.commit().map_err(backend)?;

        tracing::info!(member = %member_id, class = %class_name, method = method.as_str(), "check-in recorded");
        Ok(CheckInOutcome::Recorded(CheckIn {
            member,
            class_id,
            class_name,
        }))
    }

    /// Attendance history for one member, newest first.
    pub fn attendance(&self, member_id: &MemberId) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.conn();
        if !member_exists(&conn, member_id).map_err(backend)? {
            return Err(StoreError::MemberNotFound(member_id.clone()));
        }
        let mut stmt = conn
            .prepare(
                "SELECT id, member_id, class_id, class_name, check_in_time, check_in_method
                 FROM attendance WHERE member_id = ?1
                 ORDER BY check_in_time DESC, id",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![member_id.as_str()], |row| {
                Ok(AttendanceRecord {
                    id: row.get(0)?,
                    member_id: MemberId::new(row.get::<_, String>(1)?),
                    class_id: row.get(2)?,
                    class_name: row.get(3)?,
                    check_in_time: row.get(4)?,
                    method: row.get(5)?,
                })
            })
            .map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
    }
}

impl AttendanceRecorder for SqliteStore {
    fn record_check_in(
        &self,
        member_id: &MemberId,
        method: CheckInMethod,
    ) -> Result<CheckInOutcome, StoreError> {
        self.record_check_in_at(member_id, method, chrono::Local::now().naive_local())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::NewClass;
    use chrono::NaiveDate;
    use tatami_core::{BeltRank, MemberCard, MemberRegistry, NewMember};

    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn store_with_member() -> (SqliteStore, MemberId) {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store
            .enroll(&NewMember {
                first_name: "Keenan".into(),
                last_name: "Cornelius".into(),
                ..Default::default()
            })
            .unwrap();
        (store, id)
    }

    #[test]
    fn test_check_in_outside_classes_is_open_mat() {
        let (store, id) = store_with_member();
        let outcome = store.record_check_in_at(&id, CheckInMethod::Facial, at(16, 10, 0)).unwrap();
        match outcome {
            CheckInOutcome::Recorded(check_in) => {
                assert_eq!(check_in.class_name, OPEN_MAT);
                assert_eq!(check_in.class_id, None);
            }
            CheckInOutcome::AlreadyCheckedIn => panic!("expected a new record"),
        }
        let member = store.get_member(&id).unwrap();
        assert_eq!(member.attendance_count, 2);
        assert_eq!(member.last_check_in, Some(at(16, 10, 0)));
    }

    #[test]
    fn test_check_in_attributed_to_current_class() {
        let (store, id) = store_with_member();
        let class = store
            .add_class(NewClass {
                name: "Adults Gi".into(),
                day_of_week: 5,
                start_time: "18:00".into(),
                duration_minutes: Some(60),
            })
            .unwrap();

        let outcome = store.record_check_in_at(&id, CheckInMethod::Manual, at(16, 17, 50)).unwrap();
        assert_eq!(
            outcome,
            CheckInOutcome::Recorded(CheckIn {
                member: MemberCard {
                    id: id.clone(),
                    first_name: "Keenan".into(),
                    last_name: "Cornelius".into(),
                    belt_rank: BeltRank::White,
                    stripes: 0,
                    has_profile_image: false,
                },
                class_id: Some(class.id),
                class_name: "Adults Gi".into(),
            })
        );
    }

    #[test]
    fn test_second_check_in_same_class_same_day() {
        let (store, id) = store_with_member();
        store.record_check_in_at(&id, CheckInMethod::Facial, at(16, 9, 0)).unwrap();
        let again = store.record_check_in_at(&id, CheckInMethod::Facial, at(16, 21, 0)).unwrap();
        assert_eq!(again, CheckInOutcome::AlreadyCheckedIn);
        assert_eq!(store.get_member(&id).unwrap().attendance_count, 2);

        let next_day = store.record_check_in_at(&id, CheckInMethod::Facial, at(17, 9, 0)).unwrap();
        assert!(matches!(next_day, CheckInOutcome::Recorded(_)));
    }

    #[test]
    fn test_check_in_unknown_member() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .record_check_in_at(&MemberId::from("nobody"), CheckInMethod::Facial, at(16, 9, 0))
            .unwrap_err();
        assert!(matches!(err, StoreError::MemberNotFound(_)));
    }

    #[test]
    fn test_attendance_history_newest_first() {
        let (store, id) = store_with_member();
        // Enrollment is stamped with the real clock, so this visit is older.
        let earlier = NaiveDate::from_ymd_opt(2020, 1, 6).unwrap().and_hms_opt(9, 0, 0).unwrap();
        store.record_check_in_at(&id, CheckInMethod::Qr, earlier).unwrap();

        let history = store.attendance(&id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].class_name, FIRST_VISIT);
        assert_eq!(history[0].method, "facial");
        assert_eq!(history[1].class_name, OPEN_MAT);
        assert_eq!(history[1].method, "qr");
        assert_eq!(history[1].check_in_time, earlier);
    }
}
