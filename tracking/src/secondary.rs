use nalgebra::DMatrix;
use tracing::trace;

use warden_types::{Detection, Embedding, SecondaryParams};

use crate::assignment::greedy_assign;
use crate::SECONDARY_ID_BASE;

/// A residual detection re-associated (or newly tracked) by appearance.
#[derive(Debug, Clone)]
pub struct SecondaryMatch {
    pub local_id: u32,
    pub detection: Detection,
    pub embedding: Embedding,
    /// Secondary tracks confirm after `n_init` appearance matches. Only
    /// confirmed matches are reported upstream.
    pub confirmed: bool,
}

#[derive(Debug, Clone)]
struct Prototype {
    local_id: u32,
    embedding: Embedding,
    last_seen_frame: u64,
    hits: u32,
}

/// Appearance re-association for detections the primary tracker abandoned.
///
/// Keeps a bounded per-camera gallery of recent appearance prototypes and
/// matches residual detections against it by cosine similarity. Runs at a
/// lower rate than the primary; it never sees detections the primary already
/// claimed, so it cannot override a primary assignment.
pub struct AppearanceTracker {
    params: SecondaryParams,
    prototypes: Vec<Prototype>,
    next_id: u32,
}

impl AppearanceTracker {
    pub fn new(params: SecondaryParams) -> Self {
        Self {
            params,
            prototypes: Vec::new(),
            next_id: SECONDARY_ID_BASE,
        }
    }

    pub fn gallery_len(&self) -> usize {
        self.prototypes.len()
    }

    /// Associate residual detections with the prototype gallery.
    ///
    /// `frame` is the camera's frame counter; prototype expiry (`max_age`)
    /// counts in frames of this counter.
    pub fn associate(
        &mut self,
        frame: u64,
        candidates: &[(Detection, Embedding)],
    ) -> Vec<SecondaryMatch> {
        // Expire prototypes not seen within max_age frames.
        let max_age = self.params.max_age as u64;
        self.prototypes
            .retain(|p| frame.saturating_sub(p.last_seen_frame) <= max_age);

        if candidates.is_empty() {
            return Vec::new();
        }

        // Prototypes stay in insertion order, so ascending id order holds and
        // greedy assignment favors older (smaller-id) prototypes on ties.
        let floor = self.params.similarity_threshold as f64;
        let mut scores = DMatrix::<f64>::zeros(self.prototypes.len(), candidates.len());
        for (r, proto) in self.prototypes.iter().enumerate() {
            for (c, (_, emb)) in candidates.iter().enumerate() {
                scores[(r, c)] = proto.embedding.cosine(emb) as f64;
            }
        }
        let confs: Vec<f32> = candidates.iter().map(|(d, _)| d.confidence).collect();
        let assignment = greedy_assign(&scores, floor, &confs);

        let mut out = Vec::new();
        for (r, c) in &assignment.pairs {
            let (det, emb) = &candidates[*c];
            let proto = &mut self.prototypes[*r];
            proto.hits += 1;
            proto.last_seen_frame = frame;
            // Blend the prototype toward the new observation; a pure replace
            // would make the gallery chase detector noise.
            proto.embedding = proto.embedding.ema(emb, 0.9);
            trace!(local_id = proto.local_id, "appearance reattachment");
            out.push(SecondaryMatch {
                local_id: proto.local_id,
                detection: *det,
                embedding: emb.clone(),
                confirmed: proto.hits >= self.params.n_init,
            });
        }

        for c in assignment.unmatched_cols {
            let (det, emb) = &candidates[c];
            let local_id = self.next_id;
            self.next_id += 1;
            self.prototypes.push(Prototype {
                local_id,
                embedding: emb.clone(),
                last_seen_frame: frame,
                hits: 1,
            });
            out.push(SecondaryMatch {
                local_id,
                detection: *det,
                embedding: emb.clone(),
                confirmed: 1 >= self.params.n_init,
            });
        }

        // Enforce the gallery budget, dropping the stalest prototypes first.
        if self.prototypes.len() > self.params.gallery_budget {
            self.prototypes
                .sort_by_key(|p| std::cmp::Reverse(p.last_seen_frame));
            self.prototypes.truncate(self.params.gallery_budget);
            self.prototypes.sort_by_key(|p| p.local_id);
        }

        out
    }

    /// Forget everything (capture recycled, camera stopped).
    pub fn clear(&mut self) {
        self.prototypes.clear();
    }
}
