//! Attendance event recording and export.
//!
//! Every successful match appends a new event. There is no per-day
//! deduplication: a student matched three times today has three events.

use crate::store::{Store, StoreError};
use chrono::NaiveDateTime;
use serde::Serialize;
use thiserror::Error;

pub const STATUS_PRESENT: &str = "present";
pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceEvent {
    pub event_id: i64,
    pub student_id: i64,
    pub date: String,
    pub time_in: String,
    pub status: String,
    pub created_at: String,
}

#[derive(Clone)]
pub struct AttendanceRecorder {
    store: Store,
}

impl AttendanceRecorder {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Append a "present" event for `student_id` at local wall-clock time `at`.
    pub async fn record(
        &self,
        student_id: i64,
        at: NaiveDateTime,
    ) -> Result<AttendanceEvent, StoreError> {
        let date = at.format(DATE_FORMAT).to_string();
        let time_in = at.format(TIME_FORMAT).to_string();
        let created_at = at.format("%Y-%m-%dT%H:%M:%S%.6f").to_string();

        let event_id = self
            .store
            .insert_event(student_id, &date, &time_in, STATUS_PRESENT, &created_at)
            .await?;

        tracing::info!(
            event_id,
            student_id,
            date = %date,
            time_in = %time_in,
            "attendance recorded"
        );

        Ok(AttendanceEvent {
            event_id,
            student_id,
            date,
            time_in,
            status: STATUS_PRESENT.to_string(),
            created_at,
        })
    }

    /// All events as CSV (`Roll No,Name,Date,Time In,Status`), newest first.
    pub async fn export_csv(&self) -> Result<Vec<u8>, ExportError> {
        let rows = self.store.export_rows().await?;

        let mut writer = csv::Writer::from_writer(Vec::new());
        if rows.is_empty() {
            // serialize() only emits the header alongside the first row.
            writer.write_record(["Roll No", "Name", "Date", "Time In", "Status"])?;
        }
        for row in &rows {
            writer.serialize(row)?;
        }
        writer
            .into_inner()
            .map_err(|e| ExportError::Csv(e.into_error().into()))
    }
}
