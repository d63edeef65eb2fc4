//! Shared vocabulary types for the warden multi-camera people tracker.
//!
//! Everything here is plain data: identifiers, geometry, detections,
//! appearance embeddings, parameter blocks and the records exchanged with the
//! persistence layer. No I/O happens in this crate.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod embedding;
mod params;

pub use embedding::Embedding;
pub use params::{
    CameraParams, EmbedderParams, ResolverParams, SecondaryParams, TrackingParams,
};

#[derive(thiserror::Error, Debug)]
pub enum WardenTypesError {
    #[error("embedding is empty")]
    EmptyEmbedding,
    #[error("embedding contains a non-finite component")]
    NonFiniteEmbedding,
    #[error("embedding has (near) zero norm")]
    ZeroNormEmbedding,
    #[error("frame buffer length {got} does not match {width}x{height} RGB8")]
    BadFrameBuffer { got: usize, width: u32, height: u32 },
    #[error("frame has zero dimension")]
    EmptyFrame,
}

/// Identifies one camera.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CamId(pub u32);

impl std::fmt::Display for CamId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for CamId {
    fn from(v: u32) -> Self {
        CamId(v)
    }
}

/// Identifies a person across all cameras.
///
/// Allocated monotonically by the resolver and never reused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GlobalId(pub u64);

impl std::fmt::Display for GlobalId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Axis-aligned bounding box in pixel coordinates, `(x1, y1)` top-left,
/// `(x2, y2)` bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) * 0.5, (self.y1 + self.y2) * 0.5)
    }

    /// A box is usable if all coordinates are finite and it spans a
    /// positive area.
    pub fn is_valid(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|v| v.is_finite())
            && self.x2 > self.x1
            && self.y2 > self.y1
    }

    /// Intersection over union with `other`. Zero for disjoint or degenerate
    /// boxes.
    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        if ix2 <= ix1 || iy2 <= iy1 {
            return 0.0;
        }
        let inter = (ix2 - ix1) * (iy2 - iy1);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// One person detection in one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,
}

/// Which tracker stage produced a local track. Diagnostics only; the
/// resolver treats both identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackSource {
    Primary,
    Secondary,
}

/// A decoded video frame. Packed RGB8, row-major, contiguous.
#[derive(Clone)]
pub struct Frame {
    pub camera: CamId,
    /// Monotonic per camera. Restarts at zero when the capture is recycled.
    pub frame_index: u64,
    pub stamp: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn rgb8(
        camera: CamId,
        frame_index: u64,
        stamp: DateTime<Utc>,
        width: u32,
        height: u32,
        data: Vec<u8>,
    ) -> Result<Self, WardenTypesError> {
        if width == 0 || height == 0 {
            return Err(WardenTypesError::EmptyFrame);
        }
        if data.len() != width as usize * height as usize * 3 {
            return Err(WardenTypesError::BadFrameBuffer {
                got: data.len(),
                width,
                height,
            });
        }
        Ok(Self {
            camera,
            frame_index,
            stamp,
            width,
            height,
            data,
        })
    }

    /// Copy out the region covered by `bbox`, clamped to the frame. Returns
    /// `None` when the clamped region is empty.
    pub fn crop(&self, bbox: &BBox) -> Option<Frame> {
        let x1 = (bbox.x1.floor().max(0.0) as u32).min(self.width);
        let y1 = (bbox.y1.floor().max(0.0) as u32).min(self.height);
        let x2 = (bbox.x2.ceil().max(0.0) as u32).min(self.width);
        let y2 = (bbox.y2.ceil().max(0.0) as u32).min(self.height);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        let (w, h) = (x2 - x1, y2 - y1);
        let mut data = Vec::with_capacity(w as usize * h as usize * 3);
        for row in y1..y2 {
            let start = (row * self.width + x1) as usize * 3;
            let end = start + w as usize * 3;
            data.extend_from_slice(&self.data[start..end]);
        }
        Some(Frame {
            camera: self.camera,
            frame_index: self.frame_index,
            stamp: self.stamp,
            width: w,
            height: h,
            data,
        })
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("camera", &self.camera)
            .field("frame_index", &self.frame_index)
            .field("stamp", &self.stamp)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

/// Change-stream events emitted as the resolver mutates bindings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    PersonAppeared { global_id: GlobalId, camera: CamId },
    PersonMoved {
        global_id: GlobalId,
        from: CamId,
        to: CamId,
    },
    PersonDisappeared { global_id: GlobalId },
}

/// A camera position fix for one person: where they were last seen on one
/// camera, and when.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    pub bbox: BBox,
    pub stamp: DateTime<Utc>,
}

/// Read-only copy of one global person, as returned by snapshot queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonSnapshot {
    pub global_id: GlobalId,
    pub assigned_name: Option<String>,
    pub best_quality: f32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub total_appearances: u64,
    pub cameras_visited: BTreeSet<CamId>,
    pub camera_tracks: BTreeMap<CamId, u32>,
    pub camera_positions: BTreeMap<CamId, PositionFix>,
}

/// The persisted gallery record for one global person.
///
/// This is the row shape the gallery store reads and writes. The canonical
/// embedding is stored as a raw vector; it is re-normalized on rehydration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonRecord {
    pub global_id: GlobalId,
    pub assigned_name: Option<String>,
    pub canonical_embedding: Option<Vec<f32>>,
    pub best_quality: f32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub total_appearances: u64,
    pub cameras_visited: BTreeSet<CamId>,
    pub is_active: bool,
    pub last_positions: BTreeMap<CamId, PositionFix>,
}

/// Aggregate resolver statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolverStats {
    pub total_persons_seen: usize,
    pub active_persons: usize,
    pub multi_camera_persons: usize,
    pub total_bindings: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(0.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&b) - 1.0).abs() < 1e-6);

        let c = BBox::new(5.0, 0.0, 15.0, 10.0);
        // intersection 50, union 150
        assert!((a.iou(&c) - 1.0 / 3.0).abs() < 1e-6);

        let d = BBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&d), 0.0);

        // degenerate
        let e = BBox::new(5.0, 5.0, 5.0, 5.0);
        assert_eq!(a.iou(&e), 0.0);
    }

    #[test]
    fn test_bbox_valid() {
        assert!(BBox::new(0.0, 0.0, 1.0, 1.0).is_valid());
        assert!(!BBox::new(0.0, 0.0, 0.0, 1.0).is_valid());
        assert!(!BBox::new(f32::NAN, 0.0, 1.0, 1.0).is_valid());
        assert!(!BBox::new(2.0, 0.0, 1.0, 1.0).is_valid());
    }

    #[test]
    fn test_frame_crop() {
        let camera = CamId(1);
        let w = 4u32;
        let h = 3u32;
        let mut data = Vec::new();
        for i in 0..(w * h) {
            data.extend_from_slice(&[i as u8, i as u8, i as u8]);
        }
        let frame = Frame::rgb8(camera, 0, Utc::now(), w, h, data).unwrap();

        let crop = frame.crop(&BBox::new(1.0, 1.0, 3.0, 3.0)).unwrap();
        assert_eq!(crop.width, 2);
        assert_eq!(crop.height, 2);
        // rows 1..3, cols 1..3 of the 4-wide frame
        assert_eq!(crop.data[0], 5);
        assert_eq!(crop.data[3], 6);
        assert_eq!(crop.data[6], 9);

        // fully outside
        assert!(frame.crop(&BBox::new(10.0, 10.0, 20.0, 20.0)).is_none());
    }

    #[test]
    fn test_frame_rejects_bad_buffer() {
        assert!(Frame::rgb8(CamId(0), 0, Utc::now(), 2, 2, vec![0u8; 5]).is_err());
        assert!(Frame::rgb8(CamId(0), 0, Utc::now(), 0, 2, vec![]).is_err());
    }

    #[test]
    fn test_event_serde() {
        let ev = Event::PersonMoved {
            global_id: GlobalId(7),
            from: CamId(1),
            to: CamId(2),
        };
        let buf = serde_json::to_string(&ev).unwrap();
        assert!(buf.contains("person_moved"));
        let back: Event = serde_json::from_str(&buf).unwrap();
        assert_eq!(ev, back);
    }
}
