//! Liveness detection via inter-frame motion.
//!
//! A static photograph held to the camera produces near-identical frames. A
//! live subject moves, so consecutive frames differ in a noticeable number of
//! pixels. This module counts luminance changes between consecutive frames and
//! declares the capture live when any pair changes enough.
//!
//! # Threat Coverage
//!
//! - **Blocks:** A printed photo or a still image on a screen held steady.
//! - **Does not block:** Moving a printed photo, video replay, or anything else
//!   that produces gross scene change. The check detects motion, not faces.
//!
//! The check fails closed: fewer than two frames, an undecodable frame, or
//! frames of differing size all report "not live".

use crate::decode;
use image::GrayImage;
use serde::Serialize;

/// Default per-pixel luminance difference that counts as a changed pixel.
pub const DEFAULT_PIXEL_DIFF_THRESHOLD: u8 = 30;

/// Default number of changed pixels a frame pair must exceed to count as motion.
pub const DEFAULT_MOTION_PIXEL_THRESHOLD: usize = 1000;

/// Minimum number of frames required to evaluate motion.
pub const MIN_LIVENESS_FRAMES: usize = 2;

/// Why a liveness check did not pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessRejection {
    /// Fewer than [`MIN_LIVENESS_FRAMES`] frames supplied.
    InsufficientFrames,
    /// At least one frame could not be decoded.
    UndecodableFrame,
    /// Consecutive frames have different dimensions.
    FrameSizeMismatch,
    /// Frames decoded but no pair changed enough.
    NoMotion,
}

/// Outcome of one liveness check. Scoped to a single request, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LivenessDecision {
    pub is_live: bool,
    /// Largest changed-pixel count seen across the analysed frame pairs.
    pub motion_pixels: usize,
    /// Number of consecutive frame pairs compared.
    pub frame_pairs_analysed: usize,
    pub rejection: Option<LivenessRejection>,
}

impl LivenessDecision {
    /// A negative decision reached before any pair was compared.
    pub fn rejected(reason: LivenessRejection) -> Self {
        Self {
            is_live: false,
            motion_pixels: 0,
            frame_pairs_analysed: 0,
            rejection: Some(reason),
        }
    }
}

/// Strategy for deciding whether an ordered frame sequence shows a live subject.
///
/// Frames are encoded image bytes in capture order.
pub trait LivenessDetector: Send + Sync {
    fn check(&self, frames: &[Vec<u8>]) -> LivenessDecision;
}

/// Frame-difference motion heuristic.
#[derive(Debug, Clone, Copy)]
pub struct MotionLiveness {
    pub pixel_diff_threshold: u8,
    pub motion_pixel_threshold: usize,
}

impl Default for MotionLiveness {
    fn default() -> Self {
        Self {
            pixel_diff_threshold: DEFAULT_PIXEL_DIFF_THRESHOLD,
            motion_pixel_threshold: DEFAULT_MOTION_PIXEL_THRESHOLD,
        }
    }
}

impl MotionLiveness {
    pub fn new(pixel_diff_threshold: u8, motion_pixel_threshold: usize) -> Self {
        Self {
            pixel_diff_threshold,
            motion_pixel_threshold,
        }
    }

    /// Run the motion check on already-decoded luminance frames.
    pub fn check_luma(&self, frames: &[GrayImage]) -> LivenessDecision {
        if frames.len() < MIN_LIVENESS_FRAMES {
            return LivenessDecision::rejected(LivenessRejection::InsufficientFrames);
        }

        let mut peak = 0usize;
        let mut pairs = 0usize;

        for pair in frames.windows(2) {
            let Some(changed) = count_motion_pixels(&pair[0], &pair[1], self.pixel_diff_threshold)
            else {
                return LivenessDecision {
                    is_live: false,
                    motion_pixels: peak,
                    frame_pairs_analysed: pairs,
                    rejection: Some(LivenessRejection::FrameSizeMismatch),
                };
            };
            pairs += 1;
            peak = peak.max(changed);

            if changed > self.motion_pixel_threshold {
                return LivenessDecision {
                    is_live: true,
                    motion_pixels: peak,
                    frame_pairs_analysed: pairs,
                    rejection: None,
                };
            }
        }

        LivenessDecision {
            is_live: false,
            motion_pixels: peak,
            frame_pairs_analysed: pairs,
            rejection: Some(LivenessRejection::NoMotion),
        }
    }
}

impl LivenessDetector for MotionLiveness {
    fn check(&self, frames: &[Vec<u8>]) -> LivenessDecision {
        if frames.len() < MIN_LIVENESS_FRAMES {
            return LivenessDecision::rejected(LivenessRejection::InsufficientFrames);
        }

        let mut luma = Vec::with_capacity(frames.len());
        for (i, bytes) in frames.iter().enumerate() {
            match decode::decode_luma(bytes) {
                Ok(img) => luma.push(img),
                Err(e) => {
                    tracing::warn!(
                        frame = i,
                        error = %e,
                        "liveness: frame undecodable, failing closed"
                    );
                    return LivenessDecision::rejected(LivenessRejection::UndecodableFrame);
                }
            }
        }

        self.check_luma(&luma)
    }
}

/// Convenience form of [`MotionLiveness`]: `true` only when motion is detected.
pub fn is_live(
    frames: &[Vec<u8>],
    pixel_diff_threshold: u8,
    motion_pixel_threshold: usize,
) -> bool {
    MotionLiveness::new(pixel_diff_threshold, motion_pixel_threshold)
        .check(frames)
        .is_live
}

/// Count pixels whose luminance differs by more than `diff_threshold`.
///
/// Returns `None` when the frames differ in size.
pub fn count_motion_pixels(a: &GrayImage, b: &GrayImage, diff_threshold: u8) -> Option<usize> {
    if a.dimensions() != b.dimensions() {
        return None;
    }
    Some(
        a.as_raw()
            .iter()
            .zip(b.as_raw().iter())
            .filter(|(p, q)| p.abs_diff(**q) > diff_threshold)
            .count(),
    )
}
