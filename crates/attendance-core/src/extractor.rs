//! Image to embeddings: detection, alignment and recognition behind one seam.

use crate::detector::{DetectorError, FaceDetector};
use crate::models::{self, ModelIntegrityError};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Embedding;
use image::RgbImage;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("model integrity: {0}")]
    Integrity(#[from] ModelIntegrityError),
    #[error("extraction failed: {0}")]
    Failed(String),
}

/// Produces one embedding per face found in an RGB image.
///
/// An empty vector means no face was found; that is not an error.
/// Implementations must be usable from several worker threads at once.
pub trait EmbeddingExtractor: Send + Sync {
    fn extract(&self, image: &RgbImage) -> Result<Vec<Embedding>, ExtractError>;
}

/// Which face of a multi-face enrollment photo becomes the student's template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentFacePolicy {
    /// The first face the extractor reports (highest detector confidence).
    FirstDetected,
}

pub const ENROLLMENT_FACE_POLICY: EnrollmentFacePolicy = EnrollmentFacePolicy::FirstDetected;

impl EnrollmentFacePolicy {
    pub fn select(self, mut faces: Vec<Embedding>) -> Option<Embedding> {
        match self {
            EnrollmentFacePolicy::FirstDetected => {
                if faces.is_empty() {
                    None
                } else {
                    Some(faces.swap_remove(0))
                }
            }
        }
    }
}

/// Extract the single template embedding for an enrollment photo.
///
/// `Ok(None)` when the photo contains no face.
pub fn extract_enrollment(
    extractor: &dyn EmbeddingExtractor,
    image: &RgbImage,
) -> Result<Option<Embedding>, ExtractError> {
    let faces = extractor.extract(image)?;
    if faces.len() > 1 {
        tracing::warn!(
            faces = faces.len(),
            policy = ?ENROLLMENT_FACE_POLICY,
            "enrollment photo contains several faces"
        );
    }
    Ok(ENROLLMENT_FACE_POLICY.select(faces))
}

/// SCRFD + ArcFace extractor.
///
/// ONNX sessions need `&mut` to run, so each model sits behind its own mutex.
/// Detection of the next image can proceed while another thread recognizes.
pub struct OnnxExtractor {
    detector: Mutex<FaceDetector>,
    recognizer: Mutex<FaceRecognizer>,
}

impl OnnxExtractor {
    pub fn load(scrfd_path: &str, arcface_path: &str) -> Result<Self, ExtractError> {
        let detector = FaceDetector::load(scrfd_path)?;
        tracing::info!(path = scrfd_path, "SCRFD detector loaded");

        let recognizer = FaceRecognizer::load(arcface_path)?;
        tracing::info!(path = arcface_path, "ArcFace recognizer loaded");

        Ok(Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
        })
    }

    /// Load both models from `model_dir`, checking their SHA-256 first when `verify` is set.
    pub fn from_model_dir(model_dir: &Path, verify: bool) -> Result<Self, ExtractError> {
        if verify {
            models::verify_models_dir(model_dir)?;
            tracing::info!(dir = %model_dir.display(), "model checksums verified");
        } else {
            tracing::warn!("model checksum verification disabled");
        }
        let scrfd = model_dir.join(models::DETECTOR_MODEL);
        let arcface = model_dir.join(models::RECOGNIZER_MODEL);
        Self::load(&scrfd.to_string_lossy(), &arcface.to_string_lossy())
    }
}

impl EmbeddingExtractor for OnnxExtractor {
    fn extract(&self, image: &RgbImage) -> Result<Vec<Embedding>, ExtractError> {
        let faces = self
            .detector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .detect(image)?;
        tracing::debug!(faces = faces.len(), "faces detected");

        let mut recognizer = self.recognizer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut embeddings = Vec::with_capacity(faces.len());
        for face in &faces {
            if face.landmarks.is_none() {
                tracing::debug!(confidence = face.confidence, "skipping face without landmarks");
                continue;
            }
            embeddings.push(recognizer.extract(image, face)?);
        }
        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    /// Returns one embedding per distinct value in `faces`.
    struct FixedExtractor {
        faces: Vec<f32>,
    }

    impl EmbeddingExtractor for FixedExtractor {
        fn extract(&self, _image: &RgbImage) -> Result<Vec<Embedding>, ExtractError> {
            Ok(self.faces.iter().map(|&v| Embedding::new(vec![v, 0.0])).collect())
        }
    }

    struct FailingExtractor;

    impl EmbeddingExtractor for FailingExtractor {
        fn extract(&self, _image: &RgbImage) -> Result<Vec<Embedding>, ExtractError> {
            Err(ExtractError::Failed("boom".into()))
        }
    }

    fn blank() -> RgbImage {
        RgbImage::from_pixel(8, 8, Rgb([0, 0, 0]))
    }

    #[test]
    fn test_enrollment_no_face_is_none() {
        let ex = FixedExtractor { faces: vec![] };
        assert!(extract_enrollment(&ex, &blank()).unwrap().is_none());
    }

    #[test]
    fn test_enrollment_takes_first_face() {
        let ex = FixedExtractor {
            faces: vec![0.7, 0.2, 0.9],
        };
        let emb = extract_enrollment(&ex, &blank()).unwrap().unwrap();
        assert_eq!(emb.values, vec![0.7, 0.0]);
    }

    #[test]
    fn test_enrollment_propagates_errors() {
        let err = extract_enrollment(&FailingExtractor, &blank()).unwrap_err();
        assert!(matches!(err, ExtractError::Failed(_)));
    }

    #[test]
    fn test_policy_select() {
        let faces = vec![Embedding::new(vec![1.0]), Embedding::new(vec![2.0])];
        assert_eq!(
            EnrollmentFacePolicy::FirstDetected.select(faces).unwrap().values,
            vec![1.0]
        );
        assert!(EnrollmentFacePolicy::FirstDetected.select(vec![]).is_none());
    }

    #[test]
    fn test_from_model_dir_verifies_first() {
        let dir = tempfile::tempdir().unwrap();
        let err = OnnxExtractor::from_model_dir(dir.path(), true).err().unwrap();
        assert!(matches!(err, ExtractError::Integrity(_)));
    }

    #[test]
    fn test_from_model_dir_missing_without_verify() {
        let dir = tempfile::tempdir().unwrap();
        let err = OnnxExtractor::from_model_dir(dir.path(), false).err().unwrap();
        assert!(matches!(err, ExtractError::Detector(DetectorError::ModelNotFound(_))));
    }
}
