//! attendance-core: face matching and liveness pipeline.
//!
//! Uses SCRFD for face detection and ArcFace for face embeddings, both running
//! via ONNX Runtime for CPU inference. Liveness is a frame-difference motion
//! heuristic. Enrollment embeddings are memoised in an [`EmbeddingCache`].

pub mod alignment;
pub mod cache;
pub mod decode;
pub mod detector;
pub mod extractor;
pub mod liveness;
pub mod models;
pub mod recognizer;
pub mod types;

pub use cache::EmbeddingCache;
pub use decode::DecodeError;
pub use detector::FaceDetector;
pub use extractor::{
    extract_enrollment, EmbeddingExtractor, EnrollmentFacePolicy, ExtractError, OnnxExtractor,
    ENROLLMENT_FACE_POLICY,
};
pub use liveness::{LivenessDecision, LivenessDetector, LivenessRejection, MotionLiveness};
pub use models::default_model_dir;
pub use recognizer::FaceRecognizer;
pub use types::{BoundingBox, Embedding, EuclideanMatcher, FaceMatch, GalleryEntry, Matcher};
