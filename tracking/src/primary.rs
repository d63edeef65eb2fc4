use nalgebra::DMatrix;
use tracing::trace;

use warden_types::{BBox, Detection, TrackingParams};

use crate::assignment::greedy_assign;

/// A confirmed track as reported upstream for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalTrack {
    pub local_id: u32,
    pub bbox: BBox,
    pub confidence: f32,
}

/// Everything the primary tracker has to say about one frame.
#[derive(Debug, Default)]
pub struct PrimaryOutput {
    /// Confirmed tracks, ascending local id. Only these are reported to the
    /// resolver.
    pub confirmed: Vec<LocalTrack>,
    /// Tracks fully removed this frame. Their bindings must be cleared.
    pub removed: Vec<u32>,
    /// Low-confidence detections no track claimed. Input for the appearance
    /// stage.
    pub residuals: Vec<Detection>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TrackState {
    /// Seen fewer than `minimum_consecutive_frames` times.
    Tentative { hits: u32 },
    Confirmed,
    /// Not matched for `misses` consecutive frames.
    Lost { misses: u32 },
}

#[derive(Debug, Clone)]
struct Track {
    local_id: u32,
    bbox: BBox,
    confidence: f32,
    state: TrackState,
    /// Whether this track was ever reported upstream. Removals of
    /// never-reported tracks are not announced.
    reported: bool,
}

/// Motion/IoU tracker, one instance per camera.
///
/// A two-stage cascade per frame: high-confidence detections associate to
/// live tracks by IoU, then low-confidence detections get a chance to recover
/// lost tracks so a brief occlusion or a flickering detector does not spawn a
/// duplicate id.
pub struct PrimaryTracker {
    params: TrackingParams,
    tracks: Vec<Track>,
    next_id: u32,
}

impl PrimaryTracker {
    pub fn new(params: TrackingParams) -> Self {
        Self {
            params,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    /// Number of tracks currently alive (any state).
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Advance one frame.
    ///
    /// `detections` is the full per-frame detection set; the tracker does its
    /// own confidence partitioning.
    pub fn update(&mut self, detections: &[Detection]) -> PrimaryOutput {
        let activation = self.params.track_activation_threshold;
        let low_floor = self.params.low_confidence_floor;
        let min_consecutive = self.params.minimum_consecutive_frames;
        let lost_buffer = self.params.lost_track_buffer;
        let floor = self.params.minimum_matching_threshold as f64;

        let mut high: Vec<Detection> = Vec::new();
        let mut low: Vec<Detection> = Vec::new();
        for det in detections {
            if !det.bbox.is_valid() {
                continue;
            }
            if det.confidence >= activation {
                high.push(*det);
            } else if det.confidence >= low_floor {
                low.push(*det);
            }
        }

        let mut matched_track = vec![false; self.tracks.len()];
        let mut high_used = vec![false; high.len()];
        let mut low_used = vec![false; low.len()];

        // Stage 1: high-confidence detections vs live (tentative + confirmed)
        // tracks.
        let live_idx: Vec<usize> = (0..self.tracks.len())
            .filter(|&i| !matches!(self.tracks[i].state, TrackState::Lost { .. }))
            .collect();
        self.associate(&live_idx, &high, floor, &mut matched_track, &mut high_used);

        // Stage 1b: remaining high-confidence detections vs lost tracks, so a
        // track recovering from occlusion reclaims its id instead of spawning
        // a duplicate.
        let lost_idx: Vec<usize> = (0..self.tracks.len())
            .filter(|&i| {
                matches!(self.tracks[i].state, TrackState::Lost { .. }) && !matched_track[i]
            })
            .collect();
        self.associate(&lost_idx, &high, floor, &mut matched_track, &mut high_used);

        // Stage 2: low-confidence recovery against still-unmatched lost
        // tracks only.
        let lost_idx: Vec<usize> = (0..self.tracks.len())
            .filter(|&i| {
                matches!(self.tracks[i].state, TrackState::Lost { .. }) && !matched_track[i]
            })
            .collect();
        self.associate(&lost_idx, &low, floor, &mut matched_track, &mut low_used);

        // Unmatched high-confidence detections become candidate new tracks.
        for (di, det) in high.iter().enumerate() {
            if high_used[di] {
                continue;
            }
            let local_id = self.next_id;
            self.next_id += 1;
            let state = if min_consecutive <= 1 {
                TrackState::Confirmed
            } else {
                TrackState::Tentative { hits: 1 }
            };
            trace!(local_id, "new tentative track");
            self.tracks.push(Track {
                local_id,
                bbox: det.bbox,
                confidence: det.confidence,
                state,
                reported: false,
            });
            matched_track.push(true);
        }

        // Miss handling and removal.
        let mut removed = Vec::new();
        let mut keep = Vec::with_capacity(self.tracks.len());
        for (i, mut track) in std::mem::take(&mut self.tracks).into_iter().enumerate() {
            if matched_track[i] {
                keep.push(track);
                continue;
            }
            match track.state {
                TrackState::Tentative { .. } => {
                    // Confirmation requires consecutive frames; a miss kills
                    // the candidate. It was never reported, so nothing to
                    // announce.
                    trace!(local_id = track.local_id, "dropping unmatched tentative track");
                }
                TrackState::Confirmed => {
                    track.state = TrackState::Lost { misses: 1 };
                    keep.push(track);
                }
                TrackState::Lost { misses } => {
                    let misses = misses + 1;
                    if misses >= lost_buffer {
                        trace!(local_id = track.local_id, "removing lost track");
                        if track.reported {
                            removed.push(track.local_id);
                        }
                    } else {
                        track.state = TrackState::Lost { misses };
                        keep.push(track);
                    }
                }
            }
        }
        self.tracks = keep;

        let mut confirmed: Vec<LocalTrack> = self
            .tracks
            .iter_mut()
            .filter(|t| t.state == TrackState::Confirmed)
            .map(|t| {
                t.reported = true;
                LocalTrack {
                    local_id: t.local_id,
                    bbox: t.bbox,
                    confidence: t.confidence,
                }
            })
            .collect();
        confirmed.sort_by_key(|t| t.local_id);

        let residuals = low
            .iter()
            .enumerate()
            .filter(|(i, _)| !low_used[*i])
            .map(|(_, d)| *d)
            .collect();

        PrimaryOutput {
            confirmed,
            removed,
            residuals,
        }
    }

    /// Drop every track, returning the ids whose bindings must be cleared.
    pub fn drain(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.tracks)
            .into_iter()
            .filter(|t| t.reported)
            .map(|t| t.local_id)
            .collect()
    }

    /// Match `detections` to the tracks selected by `track_idx` (ascending id
    /// order) and apply the match to track state.
    fn associate(
        &mut self,
        track_idx: &[usize],
        detections: &[Detection],
        floor: f64,
        matched_track: &mut [bool],
        det_used: &mut [bool],
    ) {
        if track_idx.is_empty() || detections.is_empty() {
            return;
        }

        let mut scores = DMatrix::<f64>::zeros(track_idx.len(), detections.len());
        for (r, &ti) in track_idx.iter().enumerate() {
            for (c, det) in detections.iter().enumerate() {
                if det_used[c] {
                    continue;
                }
                scores[(r, c)] = self.tracks[ti].bbox.iou(&det.bbox) as f64;
            }
        }
        let confs: Vec<f32> = detections.iter().map(|d| d.confidence).collect();
        let assignment = greedy_assign(&scores, floor, &confs);

        let min_consecutive = self.params.minimum_consecutive_frames;
        for (r, c) in assignment.pairs {
            let ti = track_idx[r];
            let det = &detections[c];
            let track = &mut self.tracks[ti];
            track.bbox = det.bbox;
            track.confidence = det.confidence;
            track.state = match track.state {
                TrackState::Tentative { hits } => {
                    let hits = hits + 1;
                    if hits >= min_consecutive {
                        TrackState::Confirmed
                    } else {
                        TrackState::Tentative { hits }
                    }
                }
                TrackState::Confirmed => TrackState::Confirmed,
                // Recovered.
                TrackState::Lost { .. } => TrackState::Confirmed,
            };
            matched_track[ti] = true;
            det_used[c] = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, conf: f32) -> Detection {
        Detection {
            bbox: BBox::new(x1, y1, x2, y2),
            confidence: conf,
        }
    }

    fn tracker() -> PrimaryTracker {
        PrimaryTracker::new(TrackingParams::default())
    }

    #[test]
    fn test_confirmation_after_consecutive_frames() {
        let mut t = tracker();
        let d = det(10.0, 10.0, 50.0, 100.0, 0.9);

        // default minimum_consecutive_frames is 3
        assert!(t.update(&[d]).confirmed.is_empty());
        assert!(t.update(&[d]).confirmed.is_empty());
        let out = t.update(&[d]);
        assert_eq!(out.confirmed.len(), 1);
        assert_eq!(out.confirmed[0].local_id, 1);
    }

    #[test]
    fn test_id_stable_across_frames() {
        let mut t = tracker();
        let mut last_id = None;
        for i in 0..20 {
            let offset = i as f32 * 2.0;
            let out = t.update(&[det(10.0 + offset, 10.0, 50.0 + offset, 100.0, 0.9)]);
            if let Some(trk) = out.confirmed.first() {
                if let Some(prev) = last_id {
                    assert_eq!(prev, trk.local_id);
                }
                last_id = Some(trk.local_id);
            }
        }
        assert_eq!(last_id, Some(1));
    }

    #[test]
    fn test_tentative_dropped_on_miss() {
        let mut t = tracker();
        t.update(&[det(10.0, 10.0, 50.0, 100.0, 0.9)]);
        let out = t.update(&[]);
        assert!(out.confirmed.is_empty());
        assert!(out.removed.is_empty());
        assert!(t.is_empty());
    }

    #[test]
    fn test_occlusion_recovery_same_id() {
        let mut t = tracker();
        let d = det(10.0, 10.0, 50.0, 100.0, 0.9);
        for _ in 0..3 {
            t.update(&[d]);
        }
        // occluded for a few frames, well under lost_track_buffer
        for _ in 0..5 {
            let out = t.update(&[]);
            assert!(out.confirmed.is_empty());
            assert!(out.removed.is_empty());
        }
        let out = t.update(&[d]);
        assert_eq!(out.confirmed.len(), 1);
        assert_eq!(out.confirmed[0].local_id, 1);
    }

    #[test]
    fn test_low_confidence_recovery() {
        let mut t = tracker();
        let d = det(10.0, 10.0, 50.0, 100.0, 0.9);
        for _ in 0..3 {
            t.update(&[d]);
        }
        t.update(&[]);
        // same place, but below the activation threshold
        let weak = det(10.0, 10.0, 50.0, 100.0, 0.3);
        let out = t.update(&[weak]);
        assert_eq!(out.confirmed.len(), 1);
        assert_eq!(out.confirmed[0].local_id, 1);
        assert!(out.residuals.is_empty());
    }

    #[test]
    fn test_low_confidence_never_spawns() {
        let mut t = tracker();
        let out = t.update(&[det(10.0, 10.0, 50.0, 100.0, 0.3)]);
        assert!(t.is_empty());
        assert_eq!(out.residuals.len(), 1);
    }

    #[test]
    fn test_removal_after_lost_buffer() {
        let params = TrackingParams {
            lost_track_buffer: 5,
            ..Default::default()
        };
        let mut t = PrimaryTracker::new(params);
        let d = det(10.0, 10.0, 50.0, 100.0, 0.9);
        for _ in 0..3 {
            t.update(&[d]);
        }
        let mut removed = Vec::new();
        for _ in 0..6 {
            removed.extend(t.update(&[]).removed);
        }
        assert_eq!(removed, vec![1]);
        assert!(t.is_empty());
    }

    #[test]
    fn test_two_people_two_ids() {
        let mut t = tracker();
        let a = det(10.0, 10.0, 50.0, 100.0, 0.9);
        let b = det(200.0, 10.0, 240.0, 100.0, 0.85);
        let mut out = PrimaryOutput::default();
        for _ in 0..3 {
            out = t.update(&[a, b]);
        }
        assert_eq!(out.confirmed.len(), 2);
        assert_ne!(out.confirmed[0].local_id, out.confirmed[1].local_id);
    }

    #[test]
    fn test_contested_track_goes_to_higher_confidence() {
        let mut t = tracker();
        let d = det(10.0, 10.0, 50.0, 100.0, 0.9);
        for _ in 0..3 {
            t.update(&[d]);
        }
        // two detections over the same track; the stronger one keeps id 1,
        // the other spawns a new track
        let strong = det(10.0, 10.0, 50.0, 100.0, 0.95);
        let weak_overlap = det(12.0, 10.0, 52.0, 100.0, 0.6);
        let out = t.update(&[weak_overlap, strong]);
        assert_eq!(out.confirmed.len(), 1);
        assert_eq!(out.confirmed[0].local_id, 1);
        assert!((out.confirmed[0].confidence - 0.95).abs() < 1e-6);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_iou_floor_is_strict() {
        let params = TrackingParams {
            minimum_consecutive_frames: 1,
            ..Default::default()
        };
        let mut t = PrimaryTracker::new(params);
        t.update(&[det(0.0, 0.0, 10.0, 10.0, 0.9)]);
        // a shifted box with IoU well below the 0.3 floor starts a new track
        let out = t.update(&[det(9.0, 9.0, 19.0, 19.0, 0.9)]);
        assert_eq!(out.confirmed.len(), 1);
        assert_eq!(out.confirmed[0].local_id, 2);
    }

    #[test]
    fn test_drain_reports_only_reported_tracks() {
        let mut t = tracker();
        let d = det(10.0, 10.0, 50.0, 100.0, 0.9);
        for _ in 0..3 {
            t.update(&[d]);
        }
        // a second, never-confirmed track
        t.update(&[d, det(200.0, 10.0, 240.0, 100.0, 0.9)]);
        let drained = t.drain();
        assert_eq!(drained, vec![1]);
        assert!(t.is_empty());
    }
}
