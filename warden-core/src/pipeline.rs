//! Per-camera processing pipeline.
//!
//! Owned by one camera worker. Every processed frame flows detector →
//! primary tracker → (embedder + appearance stage, at a lower rate) →
//! resolver. The pipeline is synchronous; all awaiting happens in the
//! worker around it.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use tracking::{AppearanceTracker, PrimaryTracker};
use warden_types::{
    BBox, CamId, Detection, Embedding, EmbedderParams, Frame, SecondaryParams, TrackSource,
    TrackingParams,
};

use crate::detector::PersonDetector;
use crate::embedder::AppearanceEmbedder;
use crate::resolver::GlobalResolver;

/// Bounded ring of recent per-frame person counts, for diagnostics.
const COUNT_HISTORY_LEN: usize = 100;

pub struct CameraPipeline {
    camera: CamId,
    detector: Arc<dyn PersonDetector>,
    embedder: Option<Arc<dyn AppearanceEmbedder>>,
    resolver: GlobalResolver,
    primary: PrimaryTracker,
    secondary: AppearanceTracker,
    secondary_params: SecondaryParams,
    embedder_params: EmbedderParams,
    frames_processed: u64,
    count_history: VecDeque<(DateTime<Utc>, u32)>,
}

impl CameraPipeline {
    pub fn new(
        camera: CamId,
        detector: Arc<dyn PersonDetector>,
        embedder: Option<Arc<dyn AppearanceEmbedder>>,
        resolver: GlobalResolver,
        tracking_params: TrackingParams,
        secondary_params: SecondaryParams,
        embedder_params: EmbedderParams,
    ) -> Self {
        Self {
            camera,
            detector,
            embedder,
            resolver,
            primary: PrimaryTracker::new(tracking_params),
            secondary: AppearanceTracker::new(secondary_params.clone()),
            secondary_params,
            embedder_params,
            frames_processed: 0,
            count_history: VecDeque::with_capacity(COUNT_HISTORY_LEN),
        }
    }

    pub fn camera(&self) -> CamId {
        self.camera
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    /// Recent `(stamp, people_count)` samples, oldest first.
    pub fn count_history(&self) -> impl Iterator<Item = &(DateTime<Utc>, u32)> {
        self.count_history.iter()
    }

    /// Run one frame through the full per-camera pipeline.
    ///
    /// Returns the number of confirmed people on this camera this tick.
    pub fn process_frame(&mut self, frame: &Frame) -> u32 {
        // A failing detector means an empty frame, never a dead camera.
        let detections = match self.detector.detect(frame) {
            Ok(d) => d,
            Err(e) => {
                debug!(camera = %self.camera, "detector failed on frame: {e}");
                Vec::new()
            }
        };

        let out = self.primary.update(&detections);

        // The appearance path is amortized: embeddings are extracted and the
        // secondary stage runs only every `stride` processed frames.
        let appearance_tick = self.embedder.is_some()
            && self.frames_processed % self.secondary_params.stride == 0;

        let mut people = 0u32;
        for track in &out.confirmed {
            let embedding = if appearance_tick {
                self.extract_embedding(frame, &track.bbox)
            } else {
                None
            };
            let quality = self
                .embedder_params
                .quality(track.confidence, track.bbox.area());
            self.report(track.local_id, track.bbox, embedding, quality, TrackSource::Primary);
            people += 1;
        }

        if appearance_tick && !out.residuals.is_empty() {
            people += self.run_secondary(frame, &out.residuals);
        }

        for local_id in &out.removed {
            self.resolver.unbind(self.camera, *local_id);
        }

        if self.count_history.len() == COUNT_HISTORY_LEN {
            self.count_history.pop_front();
        }
        self.count_history.push_back((frame.stamp, people));
        self.frames_processed += 1;
        people
    }

    /// Appearance re-association for detections the primary left behind.
    fn run_secondary(&mut self, frame: &Frame, residuals: &[Detection]) -> u32 {
        let mut candidates: Vec<(Detection, Embedding)> = Vec::new();
        for det in residuals {
            if det.confidence >= self.secondary_params.secondary_conf_threshold {
                // Confident enough that the primary will pick it up by
                // motion alone next tick.
                continue;
            }
            if let Some(embedding) = self.extract_embedding(frame, &det.bbox) {
                candidates.push((*det, embedding));
            }
        }
        if candidates.is_empty() {
            return 0;
        }

        let matches = self.secondary.associate(frame.frame_index, &candidates);
        let mut people = 0;
        for m in matches {
            if !m.confirmed {
                continue;
            }
            let quality = self
                .embedder_params
                .quality(m.detection.confidence, m.detection.bbox.area());
            self.report(
                m.local_id,
                m.detection.bbox,
                Some(m.embedding),
                quality,
                TrackSource::Secondary,
            );
            people += 1;
        }
        people
    }

    fn extract_embedding(&self, frame: &Frame, bbox: &BBox) -> Option<Embedding> {
        let embedder = self.embedder.as_ref()?;
        // Tiny crops produce garbage vectors; skip them.
        if (bbox.width() as u32) < self.embedder_params.min_crop_w
            || (bbox.height() as u32) < self.embedder_params.min_crop_h
        {
            return None;
        }
        match embedder.embed(frame, bbox) {
            Ok(e) if e.dim() == self.embedder_params.embedding_dim => Some(e),
            Ok(e) => {
                debug!(
                    camera = %self.camera,
                    got = e.dim(),
                    want = self.embedder_params.embedding_dim,
                    "discarding embedding with unexpected dimension"
                );
                None
            }
            Err(e) => {
                debug!(camera = %self.camera, "embedding extraction failed: {e}");
                None
            }
        }
    }

    fn report(
        &self,
        local_id: u32,
        bbox: BBox,
        embedding: Option<Embedding>,
        quality: f32,
        source: TrackSource,
    ) {
        match self
            .resolver
            .resolve(self.camera, local_id, embedding.as_ref(), quality, bbox)
        {
            Ok(global_id) => {
                debug!(
                    camera = %self.camera,
                    local_id,
                    global_id = %global_id,
                    ?source,
                    "track resolved"
                );
            }
            Err(e) => {
                debug!(camera = %self.camera, local_id, "resolver rejected track: {e}");
            }
        }
    }

    /// Clear all local state and release every binding this camera owns.
    /// Called on worker wind-down. Capture recycling does NOT flush: after a
    /// short outage the primary tracker re-associates survivors by IoU and
    /// identities carry over without churn.
    pub fn flush(&mut self) {
        for local_id in self.primary.drain() {
            self.resolver.unbind(self.camera, local_id);
        }
        self.secondary.clear();
    }
}
