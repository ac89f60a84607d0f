//! Student enrollment: adding, replacing and deleting enrollment photos.
//!
//! Every path that removes or replaces a photo evicts its cache entry, and
//! every path that stores one warms the cache in the background.

use crate::engine::EngineHandle;
use crate::photos::{PhotoError, PhotoStore};
use crate::store::{Store, StoreError};
use attendance_core::{decode, DecodeError};
use image::{DynamicImage, ImageFormat, RgbImage};
use serde::Serialize;
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("{0} required")]
    MissingField(&'static str),
    #[error("invalid photo: {0}")]
    Decode(#[from] DecodeError),
    #[error("failed to encode photo: {0}")]
    Encode(#[from] image::ImageError),
    #[error("student_id not found: {0}")]
    StudentNotFound(i64),
    #[error("Student already has a photo - upload refused")]
    AlreadyHasPhoto(i64),
    #[error("Filename collision - upload refused: {0}")]
    FilenameCollision(String),
    #[error(transparent)]
    Photo(#[from] PhotoError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("photo task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Serialize)]
pub struct AddStudentOutcome {
    pub student_id: i64,
    pub photo_url: Option<String>,
    pub message: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplacePhotoOutcome {
    pub photo_url: String,
}

#[derive(Clone)]
pub struct Enrollment {
    store: Store,
    photos: Arc<dyn PhotoStore>,
    engine: EngineHandle,
}

impl Enrollment {
    pub fn new(store: Store, photos: Arc<dyn PhotoStore>, engine: EngineHandle) -> Self {
        Self { store, photos, engine }
    }

    /// Create a student, or attach a first photo to an existing one.
    ///
    /// The photo is stored as `<roll_no>.png`. An existing student that
    /// already has a photo is refused, as is a filename that is already taken.
    /// A new student whose filename is taken is still created, without photo.
    pub async fn add_student_with_photo(
        &self,
        roll_no: &str,
        name: &str,
        photo: Option<&str>,
    ) -> Result<AddStudentOutcome, EnrollmentError> {
        let (roll_no, name) = (roll_no.trim(), name.trim());
        if roll_no.is_empty() {
            return Err(EnrollmentError::MissingField("roll_no"));
        }
        if name.is_empty() {
            return Err(EnrollmentError::MissingField("name"));
        }

        let png = match photo {
            Some(payload) => Some(decode_photo(payload.to_string()).await?),
            None => None,
        };
        let filename = format!("{roll_no}.png");
        let photo_ref = self.photos.photo_ref(&filename)?;

        if let Some(student) = self.store.find_student_by_roll(roll_no).await? {
            if self.store.count_photos(student.student_id).await? > 0 {
                return Err(EnrollmentError::AlreadyHasPhoto(student.student_id));
            }
            let png = png.ok_or(EnrollmentError::MissingField("photo"))?;
            if self.filename_taken(&photo_ref, &filename).await? {
                return Err(EnrollmentError::FilenameCollision(filename));
            }
            let photo_url = self.store_photo(student.student_id, &filename, png).await?;
            tracing::info!(
                student_id = student.student_id,
                roll_no,
                "photo attached to existing student"
            );
            return Ok(AddStudentOutcome {
                student_id: student.student_id,
                photo_url: Some(photo_url),
                message: "Photo attached",
            });
        }

        let student_id = self.store.insert_student(roll_no, name).await?;
        tracing::info!(student_id, roll_no, "student created");

        let Some(png) = png else {
            return Ok(AddStudentOutcome {
                student_id,
                photo_url: None,
                message: "Student created",
            });
        };

        if self.filename_taken(&photo_ref, &filename).await? {
            tracing::warn!(
                student_id,
                filename = %filename,
                "photo filename taken, student created without photo"
            );
            return Ok(AddStudentOutcome {
                student_id,
                photo_url: None,
                message: "Student created but photo filename exists - attach later",
            });
        }

        let photo_url = self.store_photo(student_id, &filename, png).await?;
        Ok(AddStudentOutcome {
            student_id,
            photo_url: Some(photo_url),
            message: "Student created",
        })
    }

    /// Replace all photos of a student with one new photo.
    pub async fn replace_photo(
        &self,
        student_id: i64,
        photo: &str,
    ) -> Result<ReplacePhotoOutcome, EnrollmentError> {
        let png = decode_photo(photo.to_string()).await?;
        if self.store.get_student(student_id).await?.is_none() {
            return Err(EnrollmentError::StudentNotFound(student_id));
        }

        let old = self.store.photo_refs_for_student(student_id).await?;
        self.store.delete_photos_for_student(student_id).await?;
        self.discard_photos(&old).await;

        let filename = format!("{student_id}_{}.png", uuid::Uuid::new_v4().simple());
        let photo_url = self.store_photo(student_id, &filename, png).await?;
        tracing::info!(student_id, replaced = old.len(), "photo replaced");
        Ok(ReplacePhotoOutcome { photo_url })
    }

    /// Delete a student with their photos and attendance events.
    pub async fn delete_student(&self, student_id: i64) -> Result<(), EnrollmentError> {
        let refs = self.store.photo_refs_for_student(student_id).await?;
        if !self.store.delete_student(student_id).await? {
            return Err(EnrollmentError::StudentNotFound(student_id));
        }
        self.discard_photos(&refs).await;
        tracing::info!(student_id, photos = refs.len(), "student deleted");
        Ok(())
    }

    async fn filename_taken(
        &self,
        photo_ref: &str,
        filename: &str,
    ) -> Result<bool, EnrollmentError> {
        let photos = Arc::clone(&self.photos);
        let photo_ref = photo_ref.to_string();
        if tokio::task::spawn_blocking(move || photos.exists(&photo_ref)).await? {
            return Ok(true);
        }
        Ok(self.store.filename_exists(filename).await?)
    }

    /// Save the file, record the row, warm the cache. Returns the public photo URL.
    async fn store_photo(
        &self,
        student_id: i64,
        filename: &str,
        png: Vec<u8>,
    ) -> Result<String, EnrollmentError> {
        let photos = Arc::clone(&self.photos);
        let name = filename.to_string();
        let saved = tokio::task::spawn_blocking(move || photos.save(&name, &png)).await?;
        let photo_ref = saved.map_err(|e| match e {
            PhotoError::Exists(_) => EnrollmentError::FilenameCollision(filename.to_string()),
            other => other.into(),
        })?;

        if let Err(e) = self.store.insert_photo(student_id, &photo_ref, filename).await {
            let photos = Arc::clone(&self.photos);
            let orphan = photo_ref.clone();
            let cleanup = tokio::task::spawn_blocking(move || photos.delete(&orphan)).await;
            if !matches!(cleanup, Ok(Ok(()))) {
                tracing::warn!(photo_ref = %photo_ref, "orphan photo left behind");
            }
            return Err(e.into());
        }

        self.engine.warm(photo_ref);
        Ok(format!("/photos/{filename}"))
    }

    /// Delete photo files and evict their cache entries. Rows must already be gone.
    async fn discard_photos(&self, refs: &[String]) {
        let photos = Arc::clone(&self.photos);
        let owned = refs.to_vec();
        let failed = tokio::task::spawn_blocking(move || {
            owned
                .into_iter()
                .filter_map(|photo_ref| photos.delete(&photo_ref).err().map(|e| (photo_ref, e)))
                .collect::<Vec<_>>()
        })
        .await;
        match failed {
            Ok(failed) => {
                for (photo_ref, e) in failed {
                    tracing::warn!(
                        photo_ref = %photo_ref,
                        error = %e,
                        "failed to delete photo file"
                    );
                }
            }
            Err(e) => tracing::warn!(error = %e, "photo delete task failed"),
        }
        for photo_ref in refs {
            self.engine.cache().evict(photo_ref);
        }
    }
}

/// Decode a base64/data-URL photo and re-encode it as PNG, off the runtime threads.
async fn decode_photo(payload: String) -> Result<Vec<u8>, EnrollmentError> {
    tokio::task::spawn_blocking(move || {
        let bytes = decode::decode_payload(&payload)?;
        let rgb = decode::decode_rgb(&bytes)?;
        Ok(encode_png(&rgb)?)
    })
    .await?
}

fn encode_png(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.clone()).write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{data_url, png, solid, Harness};

    fn enrollment(h: &Harness) -> Enrollment {
        Enrollment::new(h.store.clone(), h.photos.clone(), h.engine.clone())
    }

    #[tokio::test]
    async fn test_new_student_with_photo() {
        let h = Harness::new().await;
        let e = enrollment(&h);

        let out = e
            .add_student_with_photo("R1", "Asha", Some(&data_url(&solid(10))))
            .await
            .unwrap();
        assert_eq!(out.photo_url.as_deref(), Some("/photos/R1.png"));

        let gallery = h.store.list_gallery_entries().await.unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery[0].student_id, out.student_id);
        assert_eq!(gallery[0].photo_ref, h.photos.photo_ref("R1.png").unwrap());
        assert!(h.wait_cached(&gallery[0].photo_ref).await);
    }

    #[tokio::test]
    async fn test_student_with_photo_refuses_second() {
        let h = Harness::new().await;
        let e = enrollment(&h);
        let photo = data_url(&solid(10));
        e.add_student_with_photo("R1", "Asha", Some(&photo)).await.unwrap();

        let err = e.add_student_with_photo("R1", "Asha", Some(&photo)).await.unwrap_err();
        assert!(matches!(err, EnrollmentError::AlreadyHasPhoto(_)));
    }

    #[tokio::test]
    async fn test_attach_photo_to_existing_student() {
        let h = Harness::new().await;
        let e = enrollment(&h);
        let created = e.add_student_with_photo("R1", "Asha", None).await.unwrap();
        assert!(created.photo_url.is_none());

        let err = e.add_student_with_photo("R1", "Asha", None).await.unwrap_err();
        assert!(matches!(err, EnrollmentError::MissingField("photo")));

        let attached = e
            .add_student_with_photo("R1", "Asha", Some(&data_url(&solid(10))))
            .await
            .unwrap();
        assert_eq!(attached.student_id, created.student_id);
        assert_eq!(attached.message, "Photo attached");
    }

    #[tokio::test]
    async fn test_filename_collision_creates_student_without_photo() {
        let h = Harness::new().await;
        h.photos.save("R1.png", &png(&solid(10))).unwrap();
        let e = enrollment(&h);

        let out = e
            .add_student_with_photo("R1", "Asha", Some(&data_url(&solid(20))))
            .await
            .unwrap();
        assert!(out.photo_url.is_none());
        assert!(h.store.get_student(out.student_id).await.unwrap().is_some());
        assert!(h.store.list_gallery_entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_photo_creates_nothing() {
        let h = Harness::new().await;
        let e = enrollment(&h);
        let err = e
            .add_student_with_photo("R1", "Asha", Some("data:image/png;base64,AAAA"))
            .await
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::Decode(_)));
        assert!(h.store.find_student_by_roll("R1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_fields() {
        let h = Harness::new().await;
        let e = enrollment(&h);
        assert!(matches!(
            e.add_student_with_photo(" ", "Asha", None).await,
            Err(EnrollmentError::MissingField("roll_no"))
        ));
        assert!(matches!(
            e.add_student_with_photo("R1", "", None).await,
            Err(EnrollmentError::MissingField("name"))
        ));
    }

    #[tokio::test]
    async fn test_replace_photo_evicts_old_entry() {
        let h = Harness::new().await;
        let e = enrollment(&h);
        let out = e
            .add_student_with_photo("R1", "Asha", Some(&data_url(&solid(10))))
            .await
            .unwrap();
        let old_ref = h.photos.photo_ref("R1.png").unwrap();
        assert!(h.wait_cached(&old_ref).await);

        let replaced = e.replace_photo(out.student_id, &data_url(&solid(40))).await.unwrap();
        assert_ne!(replaced.photo_url, "/photos/R1.png");
        assert!(!h.engine.cache().contains(&old_ref));
        assert!(!h.photos.exists(&old_ref));

        let gallery = h.store.list_gallery_entries().await.unwrap();
        assert_eq!(gallery.len(), 1);
        let new_ref = &gallery[0].photo_ref;
        let emb = h.engine.enrollment_embedding(new_ref).await.unwrap().unwrap();
        assert!((emb.values[0] - 0.4).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_replace_photo_unknown_student() {
        let h = Harness::new().await;
        let err = enrollment(&h)
            .replace_photo(42, &data_url(&solid(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::StudentNotFound(42)));
    }

    #[tokio::test]
    async fn test_delete_student_removes_photos_and_cache() {
        let h = Harness::new().await;
        let e = enrollment(&h);
        let out = e
            .add_student_with_photo("R1", "Asha", Some(&data_url(&solid(10))))
            .await
            .unwrap();
        let photo_ref = h.photos.photo_ref("R1.png").unwrap();
        assert!(h.wait_cached(&photo_ref).await);

        e.delete_student(out.student_id).await.unwrap();
        assert!(!h.photos.exists(&photo_ref));
        assert!(!h.engine.cache().contains(&photo_ref));
        assert!(h.store.get_student(out.student_id).await.unwrap().is_none());

        let err = e.delete_student(out.student_id).await.unwrap_err();
        assert!(matches!(err, EnrollmentError::StudentNotFound(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_photo_work_runs_on_single_threaded_runtime() {
        let h = Harness::new().await;
        let e = enrollment(&h);
        let out = e
            .add_student_with_photo("R1", "Asha", Some(&data_url(&solid(10))))
            .await
            .unwrap();
        let replaced = e.replace_photo(out.student_id, &data_url(&solid(30))).await.unwrap();
        let filename = replaced.photo_url.trim_start_matches("/photos/");
        let new_ref = h.photos.photo_ref(filename).unwrap();
        assert!(h.photos.exists(&new_ref));

        e.delete_student(out.student_id).await.unwrap();
        assert!(!h.photos.exists(&new_ref));
    }
}
