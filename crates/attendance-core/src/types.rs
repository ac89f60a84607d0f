use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default acceptance threshold on the ArcFace Euclidean distance scale.
/// A match is accepted only when the best distance is strictly below it.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.50;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for ArcFace w600k_r50).
///
/// Never mutated once produced; shared behind `Arc` by the cache and gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Euclidean distance between two embeddings.
    ///
    /// Embeddings of different dimensionality are incomparable and report
    /// `f32::INFINITY`, so they can never be accepted as a match.
    pub fn distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One matchable unit of the gallery: an enrolled photo and its embedding.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub photo_id: i64,
    pub student_id: i64,
    /// Photo store identifier the embedding was derived from.
    pub photo_ref: String,
    pub embedding: Arc<Embedding>,
}

/// An accepted match of one query embedding against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceMatch {
    /// Position of the query embedding this match belongs to.
    pub query_index: usize,
    pub photo_id: i64,
    pub student_id: i64,
    pub photo_ref: String,
    pub distance: f32,
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    /// Best acceptable match for `probe`, or `None` when the gallery is empty
    /// or the nearest entry is not below `threshold`.
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32)
        -> Option<FaceMatch>;

    /// Match every query independently, preserving query order in the output.
    ///
    /// The same gallery entry may match several queries; no deduplication
    /// happens here.
    fn match_all(
        &self,
        queries: &[Embedding],
        gallery: &[GalleryEntry],
        threshold: f32,
    ) -> Vec<FaceMatch> {
        queries
            .iter()
            .enumerate()
            .filter_map(|(i, probe)| {
                self.compare(probe, gallery, threshold).map(|mut m| {
                    m.query_index = i;
                    m
                })
            })
            .collect()
    }
}

/// Nearest-neighbour matcher under Euclidean distance.
///
/// Ties on exactly equal distance resolve to the lowest gallery index.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &[GalleryEntry],
        threshold: f32,
    ) -> Option<FaceMatch> {
        let mut best: Option<(usize, f32)> = None;

        for (i, entry) in gallery.iter().enumerate() {
            let d = probe.distance(&entry.embedding);
            // Strict comparison keeps the first index on ties and skips NaN.
            let better = match best {
                None => d.is_finite(),
                Some((_, best_d)) => d < best_d,
            };
            if better {
                best = Some((i, d));
            }
        }

        let (idx, distance) = best?;
        // A NaN threshold compares as unordered and rejects.
        if distance.partial_cmp(&threshold) != Some(std::cmp::Ordering::Less) {
            tracing::debug!(distance, threshold, "nearest gallery entry above threshold");
            return None;
        }

        let entry = &gallery[idx];
        Some(FaceMatch {
            query_index: 0,
            photo_id: entry.photo_id,
            student_id: entry.student_id,
            photo_ref: entry.photo_ref.clone(),
            distance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(photo_id: i64, student_id: i64, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            photo_id,
            student_id,
            photo_ref: format!("photos/{photo_id}.png"),
            embedding: Arc::new(Embedding::new(values)),
        }
    }

    #[test]
    fn test_distance_identical_is_zero() {
        let a = Embedding::new(vec![0.3, -0.2, 0.9]);
        let b = a.clone();
        assert_eq!(a.distance(&b), 0.0);
    }

    #[test]
    fn test_distance_known_geometry() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_dimension_mismatch_is_infinite() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![0.0, 0.0, 0.0]);
        assert_eq!(a.distance(&b), f32::INFINITY);
    }

    #[test]
    fn test_empty_gallery_yields_no_match() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        assert!(EuclideanMatcher.compare(&probe, &[], DEFAULT_MATCH_THRESHOLD).is_none());
        assert!(EuclideanMatcher
            .match_all(&[probe], &[], DEFAULT_MATCH_THRESHOLD)
            .is_empty());
    }

    #[test]
    fn test_query_equal_to_entry_matches_it() {
        let gallery = vec![
            entry(1, 10, vec![1.0, 0.0, 0.0]),
            entry(2, 20, vec![0.0, 1.0, 0.0]),
        ];
        let probe = Embedding::new(vec![0.0, 1.0, 0.0]);
        let m = EuclideanMatcher
            .compare(&probe, &gallery, DEFAULT_MATCH_THRESHOLD)
            .unwrap();
        assert_eq!(m.student_id, 20);
        assert_eq!(m.photo_id, 2);
        assert_eq!(m.distance, 0.0);
    }

    #[test]
    fn test_nearest_entry_searched_across_whole_gallery() {
        let gallery = vec![
            entry(1, 10, vec![0.0, 0.0]),
            entry(2, 20, vec![0.45, 0.0]),
            entry(3, 30, vec![0.1, 0.0]),
        ];
        let probe = Embedding::new(vec![0.12, 0.0]);
        let m = EuclideanMatcher.compare(&probe, &gallery, 0.5).unwrap();
        assert_eq!(m.student_id, 30);
        assert!((m.distance - 0.02).abs() < 1e-5);
    }

    #[test]
    fn test_threshold_is_strict() {
        let gallery = vec![entry(1, 10, vec![0.0, 0.0])];
        let at = Embedding::new(vec![0.5, 0.0]);
        let below = Embedding::new(vec![0.49, 0.0]);
        assert!(EuclideanMatcher.compare(&at, &gallery, 0.5).is_none());
        assert!(EuclideanMatcher.compare(&below, &gallery, 0.5).is_some());
    }

    #[test]
    fn test_non_finite_threshold_never_accepts_a_stranger() {
        let gallery = vec![entry(1, 10, vec![0.0, 0.0])];
        let stranger = Embedding::new(vec![2.4, 0.0]);
        assert!(EuclideanMatcher.compare(&stranger, &gallery, f32::NAN).is_none());
        assert!(EuclideanMatcher
            .match_all(&[stranger], &gallery, f32::NAN)
            .is_empty());
    }

    #[test]
    fn test_tie_resolves_to_first_index() {
        let gallery = vec![
            entry(7, 70, vec![0.2, 0.0]),
            entry(3, 30, vec![-0.2, 0.0]),
        ];
        let probe = Embedding::new(vec![0.0, 0.0]);
        for _ in 0..5 {
            let m = EuclideanMatcher.compare(&probe, &gallery, 0.5).unwrap();
            assert_eq!(m.photo_id, 7);
        }
    }

    #[test]
    fn test_match_all_preserves_query_order() {
        let gallery = vec![entry(1, 10, vec![0.0, 0.0]), entry(2, 20, vec![1.0, 1.0])];
        let queries = vec![
            Embedding::new(vec![1.0, 1.05]),
            Embedding::new(vec![5.0, 5.0]),
            Embedding::new(vec![0.05, 0.0]),
        ];
        let matches = EuclideanMatcher.match_all(&queries, &gallery, 0.5);
        assert_eq!(matches.len(), 2);
        assert_eq!((matches[0].query_index, matches[0].student_id), (0, 20));
        assert_eq!((matches[1].query_index, matches[1].student_id), (2, 10));
    }

    #[test]
    fn test_same_entry_may_match_several_queries() {
        let gallery = vec![entry(1, 10, vec![0.0, 0.0])];
        let queries = vec![Embedding::new(vec![0.1, 0.0]), Embedding::new(vec![0.0, 0.1])];
        let matches = EuclideanMatcher.match_all(&queries, &gallery, 0.5);
        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|m| m.student_id == 10));
    }

    #[test]
    fn test_match_all_is_deterministic() {
        let gallery = vec![entry(1, 10, vec![0.0, 0.3]), entry(2, 20, vec![0.3, 0.0])];
        let queries = vec![Embedding::new(vec![0.1, 0.1])];
        let first = EuclideanMatcher.match_all(&queries, &gallery, 0.5);
        let second = EuclideanMatcher.match_all(&queries, &gallery, 0.5);
        assert_eq!(first, second);
    }
}
