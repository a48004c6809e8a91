//! Weekly class timetable and current-class resolution.

use crate::{backend, SqliteStore};
use chrono::{Datelike, NaiveDateTime, Timelike};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use tatami_core::StoreError;
use thiserror::Error;

/// A check-in this many minutes before a class starts counts toward it.
pub const CHECK_IN_LEAD_MINUTES: i64 = 15;
/// The kiosk display announces a class this early.
pub const DISPLAY_LEAD_MINUTES: i64 = 30;
pub const DEFAULT_DURATION_MINUTES: u32 = 60;

#[derive(Error, Debug)]
pub enum ClassError {
    #[error("day of week must be 0 (Sunday) to 6, got {0}")]
    InvalidDay(u8),
    #[error("start time must be HH:MM, got {0:?}")]
    InvalidStartTime(String),
    #[error("class name is required")]
    MissingName,
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// One weekly timetable slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Class {
    pub id: String,
    pub name: String,
    /// 0 = Sunday.
    pub day_of_week: u8,
    /// "HH:MM", 24-hour.
    pub start_time: String,
    pub duration_minutes: u32,
    pub is_active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewClass {
    pub name: String,
    pub day_of_week: u8,
    pub start_time: String,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
}

/// Minutes after midnight for an "HH:MM" string.
pub fn parse_start_time(s: &str) -> Option<i64> {
    let (h, m) = s.split_once(':')?;
    let h: i64 = h.trim().parse().ok()?;
    let m: i64 = m.trim().parse().ok()?;
    ((0..24).contains(&h) && (0..60).contains(&m)).then_some(h * 60 + m)
}

/// First active class on `now`'s weekday whose window
/// `[start - lead, start + duration]` contains `now`.
pub fn find_current_class(classes: &[Class], now: NaiveDateTime, lead_minutes: i64) -> Option<&Class> {
    let day = now.weekday().num_days_from_sunday() as u8;
    let minutes = i64::from(now.hour() * 60 + now.minute());

    classes
        .iter()
        .filter(|c| c.is_active && c.day_of_week == day)
        .find(|c| {
            let Some(start) = parse_start_time(&c.start_time) else {
                tracing::warn!(class = %c.id, start = %c.start_time, "unparseable class start time");
                return false;
            };
            let end = start + i64::from(c.duration_minutes);
            minutes >= start - lead_minutes && minutes <= end
        })
}

fn class_from_row(row: &Row<'_>) -> rusqlite::Result<Class> {
    Ok(Class {
        id: row.get(0)?,
        name: row.get(1)?,
        day_of_week: row.get(2)?,
        start_time: row.get(3)?,
        duration_minutes: row.get(4)?,
        is_active: row.get(5)?,
    })
}

/// Active classes for one weekday, in start-time order.
pub(crate) fn classes_on(conn: &Connection, day_of_week: u8) -> rusqlite::Result<Vec<Class>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, day_of_week, start_time, duration_minutes, is_active
         FROM classes WHERE day_of_week = ?1 AND is_active = 1
         ORDER BY start_time, id",
    )?;
    let rows = stmt.query_map(params![day_of_week], class_from_row)?;
    rows.collect()
}

impl SqliteStore {
    pub fn add_class(&self, class: NewClass) -> Result<Class, ClassError> {
        let name = class.name.trim().to_string();
        if name.is_empty() {
            return Err(ClassError::MissingName);
        }
        if class.day_of_week > 6 {
            return Err(ClassError::InvalidDay(class.day_of_week));
        }
        let start = parse_start_time(&class.start_time)
            .ok_or_else(|| ClassError::InvalidStartTime(class.start_time.clone()))?;

        let class = Class {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            day_of_week: class.day_of_week,
            start_time: format!("{:02}:{:02}", start / 60, start % 60),
            duration_minutes: class.duration_minutes.unwrap_or(DEFAULT_DURATION_MINUTES),
            is_active: true,
        };

        self.conn()
            .execute(
                "INSERT INTO classes (id, name, day_of_week, start_time, duration_minutes, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    class.id,
                    class.name,
                    class.day_of_week,
                    class.start_time,
                    class.duration_minutes,
                    class.is_active
                ],
            )
            .map_err(backend)?;

        tracing::info!(class = %class.id, name = %class.name, day = class.day_of_week, start = %class.start_time, "class added");
        Ok(class)
    }

    /// The whole timetable, by day then start time.
    pub fn list_classes(&self) -> Result<Vec<Class>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, day_of_week, start_time, duration_minutes, is_active
                 FROM classes ORDER BY day_of_week, start_time, id",
            )
            .map_err(backend)?;
        let rows = stmt.query_map([], class_from_row).map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
    }

    pub fn current_class(&self, now: NaiveDateTime, lead_minutes: i64) -> Result<Option<Class>, StoreError> {
        let day = now.weekday().num_days_from_sunday() as u8;
        let classes = classes_on(&self.conn(), day).map_err(backend)?;
        Ok(find_current_class(&classes, now, lead_minutes).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn class(id: &str, day: u8, start: &str, duration: u32) -> Class {
        Class {
            id: id.into(),
            name: format!("class {id}"),
            day_of_week: day,
            start_time: start.into(),
            duration_minutes: duration,
            is_active: true,
        }
    }

    // 2026-10-16 is a Friday (day 5).
    fn friday(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 16)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_parse_start_time() {
        assert_eq!(parse_start_time("06:30"), Some(390));
        assert_eq!(parse_start_time("18:00"), Some(1080));
        assert_eq!(parse_start_time("24:00"), None);
        assert_eq!(parse_start_time("7pm"), None);
    }

    #[test]
    fn test_current_class_window() {
        let classes = vec![class("evening", 5, "18:00", 60)];
        assert!(find_current_class(&classes, friday(17, 44), CHECK_IN_LEAD_MINUTES).is_none());
        assert!(find_current_class(&classes, friday(17, 45), CHECK_IN_LEAD_MINUTES).is_some());
        assert!(find_current_class(&classes, friday(19, 0), CHECK_IN_LEAD_MINUTES).is_some());
        assert!(find_current_class(&classes, friday(19, 1), CHECK_IN_LEAD_MINUTES).is_none());
        assert!(find_current_class(&classes, friday(17, 31), DISPLAY_LEAD_MINUTES).is_some());
    }

    #[test]
    fn test_current_class_ignores_other_days_and_inactive() {
        let mut inactive = class("off", 5, "12:00", 60);
        inactive.is_active = false;
        let classes = vec![class("thursday", 4, "12:00", 60), inactive];
        assert!(find_current_class(&classes, friday(12, 10), CHECK_IN_LEAD_MINUTES).is_none());
    }

    #[test]
    fn test_first_overlapping_class_wins() {
        let classes = vec![class("gi", 5, "17:15", 45), class("open-mat", 5, "18:00", 120)];
        let current = find_current_class(&classes, friday(17, 50), CHECK_IN_LEAD_MINUTES).unwrap();
        assert_eq!(current.id, "gi");
    }

    #[test]
    fn test_add_and_resolve_class() {
        let store = SqliteStore::open_in_memory().unwrap();
        let added = store
            .add_class(NewClass {
                name: " Fundamentals ".into(),
                day_of_week: 5,
                start_time: "6:30".into(),
                duration_minutes: None,
            })
            .unwrap();
        assert_eq!(added.name, "Fundamentals");
        assert_eq!(added.start_time, "06:30");
        assert_eq!(added.duration_minutes, DEFAULT_DURATION_MINUTES);

        assert_eq!(store.list_classes().unwrap(), vec![added.clone()]);
        assert_eq!(
            store.current_class(friday(6, 20), CHECK_IN_LEAD_MINUTES).unwrap(),
            Some(added)
        );
        assert_eq!(store.current_class(friday(9, 0), CHECK_IN_LEAD_MINUTES).unwrap(), None);
    }

    #[test]
    fn test_add_class_validation() {
        let store = SqliteStore::open_in_memory().unwrap();
        let new = |day, start: &str| NewClass {
            name: "No Gi".into(),
            day_of_week: day,
            start_time: start.into(),
            duration_minutes: Some(45),
        };
        assert!(matches!(store.add_class(new(7, "10:00")), Err(ClassError::InvalidDay(7))));
        assert!(matches!(
            store.add_class(new(1, "25:00")),
            Err(ClassError::InvalidStartTime(_))
        ));
        assert!(store.list_classes().unwrap().is_empty());
    }
}
