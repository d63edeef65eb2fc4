//! Parameter blocks for the trackers, the resolver and the camera workers.
//!
//! All blocks deserialize from the TOML configuration file with per-field
//! defaults, so a minimal config stays minimal.

use serde::{Deserialize, Serialize};

fn default_detector_min_conf() -> f32 {
    0.5
}
fn default_track_activation_threshold() -> f32 {
    0.5
}
fn default_minimum_matching_threshold() -> f32 {
    0.3
}
fn default_low_confidence_floor() -> f32 {
    0.1
}
fn default_lost_track_buffer() -> u32 {
    30
}
fn default_minimum_consecutive_frames() -> u32 {
    3
}
fn default_frame_rate() -> f32 {
    30.0
}

/// Primary (motion/IoU) tracker parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackingParams {
    /// Detections below this confidence never enter tracking.
    #[serde(default = "default_detector_min_conf")]
    pub detector_min_conf: f32,
    /// Detections at or above this confidence participate in the
    /// high-confidence association stage and may spawn new tracks.
    #[serde(default = "default_track_activation_threshold")]
    pub track_activation_threshold: f32,
    /// IoU floor for an association. Pairs at or below this value are
    /// disallowed regardless of assignment optimality.
    #[serde(default = "default_minimum_matching_threshold")]
    pub minimum_matching_threshold: f32,
    /// Lower confidence bound for the recovery stage against lost tracks.
    #[serde(default = "default_low_confidence_floor")]
    pub low_confidence_floor: f32,
    /// How many consecutive missed frames a lost track survives before it is
    /// removed.
    #[serde(default = "default_lost_track_buffer")]
    pub lost_track_buffer: u32,
    /// Consecutive matched frames before a tentative track is confirmed.
    #[serde(default = "default_minimum_consecutive_frames")]
    pub minimum_consecutive_frames: u32,
    /// Nominal stream frame rate. Informational; pacing uses the camera
    /// worker's own target.
    #[serde(default = "default_frame_rate")]
    pub frame_rate: f32,
}

impl Default for TrackingParams {
    fn default() -> Self {
        Self {
            detector_min_conf: default_detector_min_conf(),
            track_activation_threshold: default_track_activation_threshold(),
            minimum_matching_threshold: default_minimum_matching_threshold(),
            low_confidence_floor: default_low_confidence_floor(),
            lost_track_buffer: default_lost_track_buffer(),
            minimum_consecutive_frames: default_minimum_consecutive_frames(),
            frame_rate: default_frame_rate(),
        }
    }
}

fn default_max_age() -> u32 {
    30
}
fn default_n_init() -> u32 {
    3
}
fn default_secondary_conf_threshold() -> f32 {
    0.5
}
fn default_secondary_similarity() -> f32 {
    0.7
}
fn default_gallery_budget() -> usize {
    100
}
fn default_secondary_stride() -> u64 {
    15
}

/// Secondary (appearance) tracker parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecondaryParams {
    /// Frames an appearance prototype survives without being seen.
    #[serde(default = "default_max_age")]
    pub max_age: u32,
    /// Consecutive appearance matches before a secondary track is confirmed.
    #[serde(default = "default_n_init")]
    pub n_init: u32,
    /// Tracks with confidence below this are handed to the secondary stage.
    #[serde(default = "default_secondary_conf_threshold")]
    pub secondary_conf_threshold: f32,
    /// Cosine similarity floor for appearance re-association.
    #[serde(default = "default_secondary_similarity")]
    pub similarity_threshold: f32,
    /// Maximum number of appearance prototypes kept per camera.
    #[serde(default = "default_gallery_budget")]
    pub gallery_budget: usize,
    /// Run the appearance stage every this many frames.
    #[serde(default = "default_secondary_stride")]
    pub stride: u64,
}

impl Default for SecondaryParams {
    fn default() -> Self {
        Self {
            max_age: default_max_age(),
            n_init: default_n_init(),
            secondary_conf_threshold: default_secondary_conf_threshold(),
            similarity_threshold: default_secondary_similarity(),
            gallery_budget: default_gallery_budget(),
            stride: default_secondary_stride(),
        }
    }
}

fn default_embedding_dim() -> usize {
    512
}
fn default_min_crop_w() -> u32 {
    32
}
fn default_min_crop_h() -> u32 {
    64
}
fn default_ref_area() -> f32 {
    // native crop of the re-id model, 128x256 px
    32768.0
}

/// Appearance embedding extraction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmbedderParams {
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
    /// Crops narrower than this are skipped.
    #[serde(default = "default_min_crop_w")]
    pub min_crop_w: u32,
    /// Crops shorter than this are skipped.
    #[serde(default = "default_min_crop_h")]
    pub min_crop_h: u32,
    /// Reference crop area for the quality score.
    #[serde(default = "default_ref_area")]
    pub ref_area: f32,
}

impl Default for EmbedderParams {
    fn default() -> Self {
        Self {
            embedding_dim: default_embedding_dim(),
            min_crop_w: default_min_crop_w(),
            min_crop_h: default_min_crop_h(),
            ref_area: default_ref_area(),
        }
    }
}

impl EmbedderParams {
    /// Observation quality in `[0, 1]` from detection confidence and crop
    /// area relative to the reference area.
    pub fn quality(&self, confidence: f32, crop_area: f32) -> f32 {
        let area_term = (crop_area / self.ref_area).min(1.0).max(0.0);
        0.5 * confidence.clamp(0.0, 1.0) + 0.5 * area_term
    }
}

fn default_similarity_threshold() -> f32 {
    0.5
}
fn default_person_timeout_sec() -> f64 {
    30.0
}
fn default_cleanup_interval_sec() -> f64 {
    60.0
}
fn default_db_sync_interval_sec() -> f64 {
    5.0
}
fn default_spatial_iou_floor() -> f32 {
    0.3
}
fn default_covisibility_window_sec() -> f64 {
    2.0
}
fn default_same_camera_boost() -> f32 {
    1.1
}
fn default_boost_window_sec() -> f64 {
    5.0
}
fn default_ema_alpha() -> f32 {
    0.9
}
fn default_knn_k() -> usize {
    5
}

/// Global resolver parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResolverParams {
    /// Cosine similarity floor for an appearance match. A similarity exactly
    /// equal to the floor is not a match.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Seconds since `last_seen` after which a person is inactive.
    #[serde(default = "default_person_timeout_sec")]
    pub person_timeout_sec: f64,
    /// Period of the background eviction task.
    #[serde(default = "default_cleanup_interval_sec")]
    pub cleanup_interval_sec: f64,
    /// Period of the background gallery sync task.
    #[serde(default = "default_db_sync_interval_sec")]
    pub db_sync_interval_sec: f64,
    /// IoU floor for a cross-camera spatial match. Exact equality is not a
    /// match.
    #[serde(default = "default_spatial_iou_floor")]
    pub spatial_iou_floor: f32,
    /// Two cameras' observations count as simultaneous within this window
    /// (inclusive).
    #[serde(default = "default_covisibility_window_sec")]
    pub covisibility_window_sec: f64,
    /// Similarity multiplier when the candidate was last seen on the querying
    /// camera within `boost_window_sec`.
    #[serde(default = "default_same_camera_boost")]
    pub same_camera_boost: f32,
    #[serde(default = "default_boost_window_sec")]
    pub boost_window_sec: f64,
    /// Weight of the old canonical embedding in the EMA update.
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f32,
    /// Neighbors requested from the store on cold-start recall.
    #[serde(default = "default_knn_k")]
    pub knn_k: usize,
}

impl Default for ResolverParams {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            person_timeout_sec: default_person_timeout_sec(),
            cleanup_interval_sec: default_cleanup_interval_sec(),
            db_sync_interval_sec: default_db_sync_interval_sec(),
            spatial_iou_floor: default_spatial_iou_floor(),
            covisibility_window_sec: default_covisibility_window_sec(),
            same_camera_boost: default_same_camera_boost(),
            boost_window_sec: default_boost_window_sec(),
            ema_alpha: default_ema_alpha(),
            knn_k: default_knn_k(),
        }
    }
}

fn default_target_fps() -> f32 {
    30.0
}
fn default_max_consecutive_failures() -> u32 {
    10
}
fn default_open_timeout_ms() -> u64 {
    10_000
}
fn default_read_timeout_ms() -> u64 {
    5_000
}

/// Per-camera ingest parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraParams {
    /// Frames above this rate are dropped before detection.
    #[serde(default = "default_target_fps")]
    pub target_fps: f32,
    /// Consecutive read failures before the capture is recycled.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for CameraParams {
    fn default() -> Self {
        Self {
            target_fps: default_target_fps(),
            max_consecutive_failures: default_max_consecutive_failures(),
            open_timeout_ms: default_open_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_score() {
        let p = EmbedderParams::default();
        // full confidence, full area
        assert!((p.quality(1.0, p.ref_area) - 1.0).abs() < 1e-6);
        // full confidence, tiny crop
        assert!(p.quality(1.0, 0.0) <= 0.5 + 1e-6);
        // area term saturates at the reference area
        assert!((p.quality(0.0, p.ref_area * 10.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let p: TrackingParams = toml::from_str("").unwrap();
        assert_eq!(p, TrackingParams::default());
        let r: ResolverParams = toml::from_str("").unwrap();
        assert_eq!(r, ResolverParams::default());
    }
}
