use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("roll number already registered: {0}")]
    RollNoConflict(String),
    #[error("failed to create database directory: {0}")]
    Dir(#[source] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Student {
    pub student_id: i64,
    pub roll_no: String,
    pub name: String,
}

/// A stored enrollment photo: the gallery row before its embedding is known.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoRecord {
    pub photo_id: i64,
    pub student_id: i64,
    pub photo_ref: String,
}

/// One attendance event joined with its student, as listed for a day.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub student_id: i64,
    pub name: Option<String>,
    pub roll_no: Option<String>,
    pub date: String,
    pub time_in: String,
    pub status: String,
    pub created_at: String,
}

/// One row of the CSV export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRow {
    #[serde(rename = "Roll No")]
    pub roll_no: Option<String>,
    #[serde(rename = "Name")]
    pub name: Option<String>,
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Time In")]
    pub time_in: String,
    #[serde(rename = "Status")]
    pub status: String,
}

/// SQLite-backed storage for students, their photos and attendance events.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if db_path != Path::new(":memory:") {
            if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(StoreError::Dir)?;
            }
        }

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS students (
                     student_id INTEGER PRIMARY KEY AUTOINCREMENT,
                     roll_no TEXT NOT NULL UNIQUE,
                     name TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS photos (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     student_id INTEGER NOT NULL REFERENCES students(student_id),
                     photo_path TEXT NOT NULL,
                     filename TEXT NOT NULL,
                     created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_photos_student ON photos(student_id);
                 CREATE TABLE IF NOT EXISTS attendance (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     student_id INTEGER NOT NULL REFERENCES students(student_id),
                     date TEXT NOT NULL,
                     time_in TEXT NOT NULL,
                     status TEXT NOT NULL,
                     created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Insert a student. Fails with [`StoreError::RollNoConflict`] on a duplicate roll number.
    pub async fn insert_student(&self, roll_no: &str, name: &str) -> Result<i64, StoreError> {
        let roll = roll_no.to_string();
        let name = name.to_string();

        let id = self
            .conn
            .call(move |conn| {
                match conn.execute(
                    "INSERT INTO students (roll_no, name) VALUES (?1, ?2)",
                    rusqlite::params![roll, name],
                ) {
                    Ok(_) => Ok(Some(conn.last_insert_rowid())),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        Ok(None)
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        id.ok_or_else(|| StoreError::RollNoConflict(roll_no.to_string()))
    }

    pub async fn find_student_by_roll(&self, roll_no: &str) -> Result<Option<Student>, StoreError> {
        let roll = roll_no.to_string();
        self.query_student(
            "SELECT student_id, roll_no, name FROM students WHERE roll_no = ?1",
            roll,
        )
        .await
    }

    pub async fn get_student(&self, student_id: i64) -> Result<Option<Student>, StoreError> {
        self.query_student(
            "SELECT student_id, roll_no, name FROM students WHERE student_id = ?1",
            student_id,
        )
        .await
    }

    async fn query_student<P>(
        &self,
        sql: &'static str,
        param: P,
    ) -> Result<Option<Student>, StoreError>
    where
        P: rusqlite::ToSql + Send + 'static,
    {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(sql)?;
                let mut rows = stmt.query_map([param], |row| {
                    Ok(Student {
                        student_id: row.get(0)?,
                        roll_no: row.get(1)?,
                        name: row.get(2)?,
                    })
                })?;
                Ok(rows.next().transpose()?)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn count_students(&self) -> Result<i64, StoreError> {
        self.conn
            .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM students", [], |r| r.get(0))?))
            .await
            .map_err(StoreError::from)
    }

    pub async fn count_photos(&self, student_id: i64) -> Result<i64, StoreError> {
        self.conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM photos WHERE student_id = ?1",
                    [student_id],
                    |r| r.get(0),
                )?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Whether any photo row already uses `filename`.
    pub async fn filename_exists(&self, filename: &str) -> Result<bool, StoreError> {
        let filename = filename.to_string();
        self.conn
            .call(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM photos WHERE filename = ?1",
                    [filename],
                    |r| r.get(0),
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Record a stored photo. Returns the photo id.
    pub async fn insert_photo(
        &self,
        student_id: i64,
        photo_ref: &str,
        filename: &str,
    ) -> Result<i64, StoreError> {
        let photo_ref = photo_ref.to_string();
        let filename = filename.to_string();
        let created_at = chrono::Local::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO photos (student_id, photo_path, filename, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![student_id, photo_ref, filename, created_at],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn photo_refs_for_student(&self, student_id: i64) -> Result<Vec<String>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare("SELECT photo_path FROM photos WHERE student_id = ?1 ORDER BY id")?;
                let rows = stmt.query_map([student_id], |row| row.get(0))?;
                Ok(rows.collect::<Result<Vec<String>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Delete every photo row of a student. Returns the number removed.
    pub async fn delete_photos_for_student(&self, student_id: i64) -> Result<usize, StoreError> {
        self.conn
            .call(move |conn| {
                Ok(conn.execute("DELETE FROM photos WHERE student_id = ?1", [student_id])?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Delete a student with their photo rows and attendance events.
    /// Returns whether the student existed.
    pub async fn delete_student(&self, student_id: i64) -> Result<bool, StoreError> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM photos WHERE student_id = ?1", [student_id])?;
                tx.execute("DELETE FROM attendance WHERE student_id = ?1", [student_id])?;
                let removed =
                    tx.execute("DELETE FROM students WHERE student_id = ?1", [student_id])?;
                tx.commit()?;
                Ok(removed > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Every stored photo, ordered by photo id. This order is the gallery order.
    pub async fn list_gallery_entries(&self) -> Result<Vec<PhotoRecord>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT id, student_id, photo_path FROM photos ORDER BY id")?;
                let rows = stmt.query_map([], |row| {
                    Ok(PhotoRecord {
                        photo_id: row.get(0)?,
                        student_id: row.get(1)?,
                        photo_ref: row.get(2)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Append an attendance event. Returns the event id.
    pub async fn insert_event(
        &self,
        student_id: i64,
        date: &str,
        time_in: &str,
        status: &str,
        created_at: &str,
    ) -> Result<i64, StoreError> {
        let (date, time_in, status, created_at) = (
            date.to_string(),
            time_in.to_string(),
            status.to_string(),
            created_at.to_string(),
        );
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance (student_id, date, time_in, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![student_id, date, time_in, status, created_at],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Events of one date (`YYYY-MM-DD`), newest `time_in` first.
    pub async fn attendance_for_date(
        &self,
        date: &str,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let date = date.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT a.id, a.student_id, s.name, s.roll_no,
                            a.date, a.time_in, a.status, a.created_at
                     FROM attendance a
                     LEFT JOIN students s ON a.student_id = s.student_id
                     WHERE a.date = ?1
                     ORDER BY a.time_in DESC, a.id DESC",
                )?;
                let rows = stmt.query_map([date], |row| {
                    Ok(AttendanceRecord {
                        id: row.get(0)?,
                        student_id: row.get(1)?,
                        name: row.get(2)?,
                        roll_no: row.get(3)?,
                        date: row.get(4)?,
                        time_in: row.get(5)?,
                        status: row.get(6)?,
                        created_at: row.get(7)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// All events for export, newest first.
    pub async fn export_rows(&self) -> Result<Vec<ExportRow>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT s.roll_no, s.name, a.date, a.time_in, a.status
                     FROM attendance a
                     LEFT JOIN students s ON a.student_id = s.student_id
                     ORDER BY a.date DESC, a.time_in DESC, a.id DESC",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(ExportRow {
                        roll_no: row.get(0)?,
                        name: row.get(1)?,
                        date: row.get(2)?,
                        time_in: row.get(3)?,
                        status: row.get(4)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn mem() -> Store {
        Store::open(Path::new(":memory:")).await.unwrap()
    }

    #[tokio::test]
    async fn test_student_roundtrip() {
        let store = mem().await;
        let id = store.insert_student("R1", "Asha").await.unwrap();

        let by_roll = store.find_student_by_roll("R1").await.unwrap().unwrap();
        assert_eq!(by_roll.student_id, id);
        assert_eq!(by_roll.name, "Asha");
        assert_eq!(store.get_student(id).await.unwrap(), Some(by_roll));
        assert!(store.get_student(id + 100).await.unwrap().is_none());
        assert_eq!(store.count_students().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_roll_conflicts() {
        let store = mem().await;
        store.insert_student("R1", "Asha").await.unwrap();
        let err = store.insert_student("R1", "Other").await.unwrap_err();
        assert!(matches!(err, StoreError::RollNoConflict(ref r) if r == "R1"));
    }

    #[tokio::test]
    async fn test_gallery_ordered_by_photo_id() {
        let store = mem().await;
        let a = store.insert_student("R1", "A").await.unwrap();
        let b = store.insert_student("R2", "B").await.unwrap();
        let p1 = store.insert_photo(b, "/p/R2.png", "R2.png").await.unwrap();
        let p2 = store.insert_photo(a, "/p/R1.png", "R1.png").await.unwrap();

        let gallery = store.list_gallery_entries().await.unwrap();
        assert_eq!(
            gallery,
            vec![
                PhotoRecord { photo_id: p1, student_id: b, photo_ref: "/p/R2.png".into() },
                PhotoRecord { photo_id: p2, student_id: a, photo_ref: "/p/R1.png".into() },
            ]
        );
        assert!(store.filename_exists("R1.png").await.unwrap());
        assert!(!store.filename_exists("R3.png").await.unwrap());
        assert_eq!(store.count_photos(a).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_photos_for_student() {
        let store = mem().await;
        let a = store.insert_student("R1", "A").await.unwrap();
        store.insert_photo(a, "/p/1.png", "1.png").await.unwrap();
        store.insert_photo(a, "/p/2.png", "2.png").await.unwrap();

        assert_eq!(store.photo_refs_for_student(a).await.unwrap(), vec!["/p/1.png", "/p/2.png"]);
        assert_eq!(store.delete_photos_for_student(a).await.unwrap(), 2);
        assert!(store.photo_refs_for_student(a).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_student_cascades() {
        let store = mem().await;
        let a = store.insert_student("R1", "A").await.unwrap();
        store.insert_photo(a, "/p/R1.png", "R1.png").await.unwrap();
        store
            .insert_event(a, "2026-03-02", "09:00:00", "present", "2026-03-02T09:00:00")
            .await
            .unwrap();

        assert!(store.delete_student(a).await.unwrap());
        assert!(store.get_student(a).await.unwrap().is_none());
        assert!(store.list_gallery_entries().await.unwrap().is_empty());
        assert!(store.attendance_for_date("2026-03-02").await.unwrap().is_empty());
        assert!(!store.delete_student(a).await.unwrap());
    }

    #[tokio::test]
    async fn test_attendance_for_date_newest_first() {
        let store = mem().await;
        let a = store.insert_student("R1", "A").await.unwrap();
        store.insert_event(a, "2026-03-02", "09:00:00", "present", "x").await.unwrap();
        store.insert_event(a, "2026-03-02", "11:30:00", "present", "x").await.unwrap();
        store.insert_event(a, "2026-03-01", "10:00:00", "present", "x").await.unwrap();

        let day = store.attendance_for_date("2026-03-02").await.unwrap();
        assert_eq!(day.len(), 2);
        assert_eq!(day[0].time_in, "11:30:00");
        assert_eq!(day[0].name.as_deref(), Some("A"));
        assert_eq!(day[0].roll_no.as_deref(), Some("R1"));
    }

    #[tokio::test]
    async fn test_export_rows_order() {
        let store = mem().await;
        let a = store.insert_student("R1", "A").await.unwrap();
        store.insert_event(a, "2026-03-01", "10:00:00", "present", "x").await.unwrap();
        store.insert_event(a, "2026-03-02", "08:00:00", "present", "x").await.unwrap();

        let rows = store.export_rows().await.unwrap();
        assert_eq!(rows[0].date, "2026-03-02");
        assert_eq!(rows[1].date, "2026-03-01");
    }
}
