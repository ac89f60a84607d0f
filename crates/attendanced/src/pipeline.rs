//! Mark-attendance pipeline: liveness, query extraction, gallery build,
//! matching and recording.

use crate::engine::{EngineError, EngineHandle};
use crate::recorder::AttendanceRecorder;
use crate::store::{Store, StoreError};
use attendance_core::{
    decode, DecodeError, FaceMatch, GalleryEntry, LivenessDecision, LivenessRejection, Matcher,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Provide 'frames' (recommended) or 'image'")]
    MissingInput,
    #[error("Failed to decode image: {0}")]
    Decode(#[from] DecodeError),
    #[error("No motion detected - likely spoof")]
    NotLive(LivenessDecision),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Inbound request: `frames` (liveness-checked) or a single `image`.
#[derive(Debug, Default, Deserialize)]
pub struct MarkRequest {
    #[serde(default)]
    pub frames: Option<Vec<String>>,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedStudent {
    pub student_id: i64,
    pub name: String,
    pub roll_no: String,
    pub photo_path: String,
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkOutcome {
    pub matched: Vec<MatchedStudent>,
    pub liveness_checked: bool,
    /// Faces detected in the query image, matched or not.
    pub faces_found: usize,
}

#[derive(Clone)]
pub struct Pipeline {
    engine: EngineHandle,
    store: Store,
    recorder: AttendanceRecorder,
    matcher: Arc<dyn Matcher + Send + Sync>,
    threshold: f32,
}

impl Pipeline {
    pub fn new(
        engine: EngineHandle,
        store: Store,
        matcher: Arc<dyn Matcher + Send + Sync>,
        threshold: f32,
    ) -> Self {
        Self {
            recorder: AttendanceRecorder::new(store.clone()),
            engine,
            store,
            matcher,
            threshold,
        }
    }

    /// Run one mark-attendance request. Matched students get an event at `now`.
    pub async fn mark_attendance(
        &self,
        request: MarkRequest,
        now: NaiveDateTime,
    ) -> Result<MarkOutcome, PipelineError> {
        let (query, liveness_checked) = self.select_query(request).await?;

        let queries = self.engine.extract_query(query).await?;
        if queries.is_empty() {
            tracing::debug!(liveness_checked, "no faces in query image");
            return Ok(MarkOutcome {
                matched: Vec::new(),
                liveness_checked,
                faces_found: 0,
            });
        }

        let gallery = self.build_gallery().await?;
        let matches = self.matcher.match_all(&queries, &gallery, self.threshold);
        tracing::debug!(
            faces = queries.len(),
            gallery = gallery.len(),
            matches = matches.len(),
            "query matched against gallery"
        );

        let matched = self.record_matches(matches, now, liveness_checked).await?;

        Ok(MarkOutcome {
            matched,
            liveness_checked,
            faces_found: queries.len(),
        })
    }

    /// Record an event per match and resolve the student details.
    ///
    /// A student deleted after the gallery was built is skipped: no event,
    /// not reported.
    async fn record_matches(
        &self,
        matches: Vec<FaceMatch>,
        now: NaiveDateTime,
        liveness_checked: bool,
    ) -> Result<Vec<MatchedStudent>, PipelineError> {
        let mut matched = Vec::with_capacity(matches.len());
        for m in matches {
            let Some(student) = self.store.get_student(m.student_id).await? else {
                tracing::warn!(
                    student_id = m.student_id,
                    photo_ref = %m.photo_ref,
                    "matched student no longer enrolled, skipped"
                );
                continue;
            };
            self.recorder.record(m.student_id, now).await?;
            tracing::info!(
                student_id = m.student_id,
                distance = m.distance,
                liveness_checked,
                "student matched"
            );
            matched.push(MatchedStudent {
                student_id: m.student_id,
                name: student.name,
                roll_no: student.roll_no,
                photo_path: m.photo_ref,
                distance: m.distance,
            });
        }
        Ok(matched)
    }

    /// Pick the query image. Non-empty `frames` always take the liveness path
    /// and match on the middle frame; `image` is used only without frames.
    async fn select_query(
        &self,
        request: MarkRequest,
    ) -> Result<(Vec<u8>, bool), PipelineError> {
        match (request.frames.filter(|f| !f.is_empty()), request.image) {
            (Some(frames), _) => {
                let mut decoded = Vec::with_capacity(frames.len());
                for (i, payload) in frames.iter().enumerate() {
                    match decode::decode_payload(payload) {
                        Ok(bytes) => decoded.push(bytes),
                        Err(e) => {
                            tracing::warn!(
                                frame = i,
                                error = %e,
                                "frame payload undecodable, failing closed"
                            );
                            return Err(PipelineError::NotLive(LivenessDecision::rejected(
                                LivenessRejection::UndecodableFrame,
                            )));
                        }
                    }
                }

                let mid = decoded.len() / 2;
                let decision = self.engine.liveness(decoded.clone()).await?;
                if !decision.is_live {
                    tracing::warn!(
                        frames = decoded.len(),
                        motion_pixels = decision.motion_pixels,
                        rejection = ?decision.rejection,
                        "liveness check failed"
                    );
                    return Err(PipelineError::NotLive(decision));
                }
                Ok((decoded.swap_remove(mid), true))
            }
            (None, Some(image)) => Ok((decode::decode_payload(&image)?, false)),
            (None, None) => Err(PipelineError::MissingInput),
        }
    }

    /// Embeddings for every stored photo, in photo-id order.
    ///
    /// Photos that fail or have no face are skipped; they never abort the request.
    async fn build_gallery(&self) -> Result<Vec<GalleryEntry>, PipelineError> {
        let records = self.store.list_gallery_entries().await?;

        // Lookups run concurrently on the worker pool; join_all keeps input order.
        let lookups = records.into_iter().map(|record| async move {
            let result = self.engine.enrollment_embedding(&record.photo_ref).await;
            (record, result)
        });
        let results = futures::future::join_all(lookups).await;

        let mut gallery = Vec::with_capacity(results.len());
        for (record, result) in results {
            match result {
                Ok(Some(embedding)) => gallery.push(GalleryEntry {
                    photo_id: record.photo_id,
                    student_id: record.student_id,
                    photo_ref: record.photo_ref,
                    embedding,
                }),
                Ok(None) => tracing::warn!(
                    photo_id = record.photo_id,
                    photo_ref = %record.photo_ref,
                    "no face in enrollment photo, skipped"
                ),
                Err(e) => tracing::warn!(
                    photo_id = record.photo_id,
                    photo_ref = %record.photo_ref,
                    error = %e,
                    "enrollment photo unusable, skipped"
                ),
            }
        }
        Ok(gallery)
    }
}
