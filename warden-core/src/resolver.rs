//! Cross-camera global identity resolution.
//!
//! The resolver owns the in-memory gallery of global persons, the
//! `(camera, local track) → global id` binding map and the monotonic id
//! counter, all behind one mutex. Camera pipelines call [`GlobalResolver::resolve`]
//! once per confirmed local track per tick and [`GlobalResolver::unbind`]
//! when the primary tracker removes a track. Everything else is snapshot
//! queries and the change-stream.
//!
//! The cycle between persons and their bindings is broken by keying the
//! binding map outside the person: a person only carries a small
//! `camera_tracks` map indexed by camera id, never a back-pointer.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use warden_types::{
    BBox, CamId, Embedding, Event, GlobalId, PersonRecord, PersonSnapshot, PositionFix,
    ResolverParams, ResolverStats,
};

use crate::store::GalleryStore;
use crate::{Error, Result};

/// Capacity of the change-stream channel. Lagging subscribers lose the
/// oldest events, never the newest.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct GlobalPerson {
    global_id: GlobalId,
    canonical: Option<Embedding>,
    best_quality: f32,
    assigned_name: Option<String>,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    total_appearances: u64,
    cameras_visited: BTreeSet<CamId>,
    camera_tracks: BTreeMap<CamId, u32>,
    camera_positions: BTreeMap<CamId, PositionFix>,
}

impl GlobalPerson {
    fn new(global_id: GlobalId, now: DateTime<Utc>) -> Self {
        Self {
            global_id,
            canonical: None,
            best_quality: 0.0,
            assigned_name: None,
            first_seen: now,
            last_seen: now,
            total_appearances: 0,
            cameras_visited: BTreeSet::new(),
            camera_tracks: BTreeMap::new(),
            camera_positions: BTreeMap::new(),
        }
    }

    /// Rehydrate from a persisted record. Persisted bindings are stale, so
    /// `camera_tracks` and `camera_positions` start empty.
    fn from_record(record: &PersonRecord) -> Self {
        let canonical = record
            .canonical_embedding
            .as_ref()
            .and_then(|raw| Embedding::unit_norm(raw.clone()).ok());
        Self {
            global_id: record.global_id,
            canonical,
            best_quality: record.best_quality,
            assigned_name: record.assigned_name.clone(),
            first_seen: record.first_seen,
            last_seen: record.last_seen,
            total_appearances: record.total_appearances,
            cameras_visited: record.cameras_visited.clone(),
            camera_tracks: BTreeMap::new(),
            camera_positions: BTreeMap::new(),
        }
    }

    fn is_active(&self, now: DateTime<Utc>, timeout_sec: f64) -> bool {
        elapsed_sec(self.last_seen, now) < timeout_sec
    }

    /// Fold one observation into this person.
    fn apply_observation(
        &mut self,
        camera: CamId,
        local_id: u32,
        embedding: Option<&Embedding>,
        quality: f32,
        bbox: BBox,
        now: DateTime<Utc>,
        ema_alpha: f32,
    ) {
        self.camera_tracks.insert(camera, local_id);
        self.camera_positions
            .insert(camera, PositionFix { bbox, stamp: now });
        self.cameras_visited.insert(camera);
        self.last_seen = now;
        self.total_appearances += 1;

        if let Some(embedding) = embedding {
            match &self.canonical {
                None => {
                    self.canonical = Some(embedding.clone());
                    self.best_quality = quality;
                }
                Some(canonical) => {
                    if quality > self.best_quality {
                        self.canonical = Some(embedding.clone());
                        self.best_quality = quality;
                    } else {
                        self.canonical = Some(canonical.ema(embedding, ema_alpha));
                    }
                }
            }
        }
    }

    fn to_snapshot(&self) -> PersonSnapshot {
        PersonSnapshot {
            global_id: self.global_id,
            assigned_name: self.assigned_name.clone(),
            best_quality: self.best_quality,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            total_appearances: self.total_appearances,
            cameras_visited: self.cameras_visited.clone(),
            camera_tracks: self.camera_tracks.clone(),
            camera_positions: self.camera_positions.clone(),
        }
    }

    fn to_record(&self, now: DateTime<Utc>, timeout_sec: f64) -> PersonRecord {
        PersonRecord {
            global_id: self.global_id,
            assigned_name: self.assigned_name.clone(),
            canonical_embedding: self.canonical.as_ref().map(|e| e.as_slice().to_vec()),
            best_quality: self.best_quality,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            total_appearances: self.total_appearances,
            cameras_visited: self.cameras_visited.clone(),
            is_active: self.is_active(now, timeout_sec),
            last_positions: self.camera_positions.clone(),
        }
    }
}

fn elapsed_sec(earlier: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - earlier).num_milliseconds() as f64 / 1000.0
}

struct ResolverInner {
    params: ResolverParams,
    persons: BTreeMap<GlobalId, GlobalPerson>,
    bindings: BTreeMap<(CamId, u32), GlobalId>,
    next_global_id: u64,
    /// Persons mutated since the last sync to the gallery store.
    dirty: BTreeSet<GlobalId>,
    events_tx: broadcast::Sender<Event>,
}

enum MatchOutcome {
    Matched(GlobalId),
    /// No in-memory match; the caller should consult the gallery store.
    NeedRecall,
    Created(GlobalId),
}

impl ResolverInner {
    fn person_for_binding(&mut self, key: (CamId, u32)) -> Option<&mut GlobalPerson> {
        let gid = *self.bindings.get(&key)?;
        match self.persons.get_mut(&gid) {
            Some(p) => Some(p),
            // The binding map and person map disagree. There is no way to
            // continue without silently corrupting identities.
            None => panic!(
                "resolver invariant violated: binding {:?} references unknown person {}",
                key, gid
            ),
        }
    }

    fn bind(
        &mut self,
        gid: GlobalId,
        camera: CamId,
        local_id: u32,
        embedding: Option<&Embedding>,
        quality: f32,
        bbox: BBox,
        now: DateTime<Utc>,
    ) {
        let ema_alpha = self.params.ema_alpha;
        let person = self
            .persons
            .get_mut(&gid)
            .expect("bind target exists by construction");

        let event = if person.camera_tracks.is_empty() {
            Event::PersonAppeared {
                global_id: gid,
                camera,
            }
        } else {
            // Moving: report the most recently seen previous camera.
            let from = person
                .camera_positions
                .iter()
                .max_by_key(|(_, fix)| fix.stamp)
                .map(|(cam, _)| *cam)
                .unwrap_or_else(|| *person.camera_tracks.keys().next().expect("non-empty"));
            Event::PersonMoved {
                global_id: gid,
                from,
                to: camera,
            }
        };

        person.apply_observation(camera, local_id, embedding, quality, bbox, now, ema_alpha);
        self.bindings.insert((camera, local_id), gid);
        self.dirty.insert(gid);
        // A send error only means nobody is subscribed.
        let _ = self.events_tx.send(event);
    }

    fn alloc_person(&mut self, now: DateTime<Utc>) -> GlobalId {
        let gid = GlobalId(self.next_global_id);
        self.next_global_id += 1;
        self.persons.insert(gid, GlobalPerson::new(gid, now));
        gid
    }

    /// Best appearance match among active in-memory persons not already
    /// bound on `camera`.
    ///
    /// Candidates must clear the raw similarity floor; the same-camera boost
    /// only affects ranking between qualifying candidates. Ties go to the
    /// smallest global id (map iteration order plus strict improvement).
    fn best_appearance_match(
        &self,
        camera: CamId,
        embedding: &Embedding,
        now: DateTime<Utc>,
    ) -> Option<GlobalId> {
        let p = &self.params;
        let mut best: Option<(GlobalId, f32)> = None;
        for (gid, person) in self.persons.iter() {
            if !person.is_active(now, p.person_timeout_sec) {
                continue;
            }
            if person.camera_tracks.contains_key(&camera) {
                continue;
            }
            let Some(canonical) = &person.canonical else {
                continue;
            };
            let raw = canonical.cosine(embedding);
            if raw <= p.similarity_threshold {
                continue;
            }
            let mut sim = raw;
            if person.cameras_visited.contains(&camera)
                && elapsed_sec(person.last_seen, now) < p.boost_window_sec
            {
                sim *= p.same_camera_boost;
            }
            if best.map(|(_, s)| sim > s).unwrap_or(true) {
                best = Some((*gid, sim));
            }
        }
        best.map(|(gid, _)| gid)
    }

    /// Best spatial match: a person currently visible on another camera with
    /// an overlapping recent bounding box.
    fn best_spatial_match(
        &self,
        camera: CamId,
        bbox: &BBox,
        now: DateTime<Utc>,
    ) -> Option<GlobalId> {
        let p = &self.params;
        let mut best: Option<(GlobalId, f32)> = None;
        for (gid, person) in self.persons.iter() {
            if !person.is_active(now, p.person_timeout_sec) {
                continue;
            }
            if person.camera_tracks.contains_key(&camera) {
                continue;
            }
            if person.camera_positions.is_empty() {
                continue;
            }
            // Covisibility window, inclusive on the lower side.
            if elapsed_sec(person.last_seen, now) > p.covisibility_window_sec {
                continue;
            }
            for (other_cam, fix) in person.camera_positions.iter() {
                if *other_cam == camera {
                    continue;
                }
                let iou = bbox.iou(&fix.bbox);
                if iou <= p.spatial_iou_floor {
                    continue;
                }
                if best.map(|(_, s)| iou > s).unwrap_or(true) {
                    best = Some((*gid, iou));
                }
            }
        }
        best.map(|(gid, _)| gid)
    }

    fn resolve_in_memory(
        &mut self,
        camera: CamId,
        local_id: u32,
        embedding: Option<&Embedding>,
        quality: f32,
        bbox: BBox,
        now: DateTime<Utc>,
        can_recall: bool,
    ) -> MatchOutcome {
        // Case 1: the pair is already bound.
        let ema_alpha = self.params.ema_alpha;
        if let Some(person) = self.person_for_binding((camera, local_id)) {
            person.apply_observation(camera, local_id, embedding, quality, bbox, now, ema_alpha);
            let gid = person.global_id;
            self.dirty.insert(gid);
            return MatchOutcome::Matched(gid);
        }

        // Case 2: appearance match.
        if let Some(embedding) = embedding {
            if let Some(gid) = self.best_appearance_match(camera, embedding, now) {
                debug!(camera = %camera, local_id, global_id = %gid, "appearance match");
                self.bind(gid, camera, local_id, Some(embedding), quality, bbox, now);
                return MatchOutcome::Matched(gid);
            }
        }

        // Case 3: spatial match against co-visible persons on other cameras.
        if let Some(gid) = self.best_spatial_match(camera, &bbox, now) {
            debug!(camera = %camera, local_id, global_id = %gid, "spatial match");
            self.bind(gid, camera, local_id, embedding, quality, bbox, now);
            return MatchOutcome::Matched(gid);
        }

        if embedding.is_some() && can_recall {
            return MatchOutcome::NeedRecall;
        }

        // Case 4: a new person.
        let gid = self.alloc_person(now);
        info!(camera = %camera, local_id, global_id = %gid, "new person");
        self.bind(gid, camera, local_id, embedding, quality, bbox, now);
        MatchOutcome::Created(gid)
    }
}

/// Shared handle to the resolver.
///
/// There should be a single call to [`GlobalResolver::new`] in the app;
/// `clone()` copies the outer wrapper which links to the inner state via
/// `Arc<Mutex<_>>`.
#[derive(Clone)]
pub struct GlobalResolver {
    inner: Arc<Mutex<ResolverInner>>,
    store: Option<Arc<dyn GalleryStore>>,
}

impl GlobalResolver {
    pub fn new(params: ResolverParams, store: Option<Arc<dyn GalleryStore>>) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut persons = BTreeMap::new();
        let mut next_global_id = 1;

        if let Some(store) = &store {
            match store.load_active() {
                Ok(records) => {
                    info!("hydrated {} active persons from gallery store", records.len());
                    for record in &records {
                        next_global_id = next_global_id.max(record.global_id.0 + 1);
                        persons.insert(record.global_id, GlobalPerson::from_record(record));
                    }
                }
                Err(e) => {
                    warn!("gallery store unavailable at startup ({e}); continuing in memory");
                }
            }
        }

        Self {
            inner: Arc::new(Mutex::new(ResolverInner {
                params,
                persons,
                bindings: BTreeMap::new(),
                next_global_id,
                dirty: BTreeSet::new(),
                events_tx,
            })),
            store,
        }
    }

    /// Resolve one confirmed local track to a global id.
    pub fn resolve(
        &self,
        camera: CamId,
        local_id: u32,
        embedding: Option<&Embedding>,
        quality: f32,
        bbox: BBox,
    ) -> Result<GlobalId> {
        self.resolve_at(Utc::now(), camera, local_id, embedding, quality, bbox)
    }

    /// [`GlobalResolver::resolve`] with an explicit clock, for tests and
    /// replay.
    pub fn resolve_at(
        &self,
        now: DateTime<Utc>,
        camera: CamId,
        local_id: u32,
        embedding: Option<&Embedding>,
        quality: f32,
        bbox: BBox,
    ) -> Result<GlobalId> {
        if !bbox.is_valid() {
            debug!(camera = %camera, local_id, "rejecting observation with degenerate bbox");
            return Err(Error::InvalidInput("degenerate bounding box"));
        }
        if !quality.is_finite() {
            debug!(camera = %camera, local_id, "rejecting observation with non-finite quality");
            return Err(Error::InvalidInput("non-finite quality"));
        }
        let quality = quality.clamp(0.0, 1.0);

        let (outcome, knn_k) = {
            let mut inner = self.inner.lock();
            let can_recall = self.store.is_some();
            let outcome = inner.resolve_in_memory(
                camera, local_id, embedding, quality, bbox, now, can_recall,
            );
            (outcome, inner.params.knn_k)
        };

        match outcome {
            MatchOutcome::Matched(gid) | MatchOutcome::Created(gid) => Ok(gid),
            MatchOutcome::NeedRecall => {
                // Cold-start recall: query the store without holding the
                // resolver lock across I/O.
                let embedding = embedding.expect("recall implies embedding");
                let store = self.store.as_ref().expect("recall implies store");
                let neighbors = match store.knn(embedding, knn_k) {
                    Ok(n) => n,
                    Err(e) => {
                        debug!("gallery knn unavailable: {e}");
                        Vec::new()
                    }
                };

                let mut inner = self.inner.lock();
                // Another task may have bound this pair while the lock was
                // released.
                if let Some(person) = inner.person_for_binding((camera, local_id)) {
                    let gid = person.global_id;
                    return Ok(gid);
                }
                let floor = inner.params.similarity_threshold;
                let recalled = neighbors
                    .into_iter()
                    .filter(|(record, sim)| {
                        *sim > floor && !inner.persons.contains_key(&record.global_id)
                    })
                    .max_by_key(|(_, sim)| ordered_float::NotNan::new(*sim).ok());
                if let Some((record, sim)) = recalled {
                    let gid = record.global_id;
                    info!(global_id = %gid, sim, "rehydrated person from gallery store");
                    inner.next_global_id = inner.next_global_id.max(gid.0 + 1);
                    inner
                        .persons
                        .insert(gid, GlobalPerson::from_record(&record));
                    inner.bind(gid, camera, local_id, Some(embedding), quality, bbox, now);
                    Ok(gid)
                } else {
                    let gid = inner.alloc_person(now);
                    info!(camera = %camera, local_id, global_id = %gid, "new person");
                    inner.bind(gid, camera, local_id, Some(embedding), quality, bbox, now);
                    Ok(gid)
                }
            }
        }
    }

    /// Clear the binding for a removed local track.
    pub fn unbind(&self, camera: CamId, local_id: u32) {
        let mut inner = self.inner.lock();
        let Some(gid) = inner.bindings.remove(&(camera, local_id)) else {
            return;
        };
        let Some(person) = inner.persons.get_mut(&gid) else {
            panic!(
                "resolver invariant violated: binding ({camera}, {local_id}) references unknown person {gid}"
            );
        };
        person.camera_tracks.remove(&camera);
        person.camera_positions.remove(&camera);
        let empty = person.camera_tracks.is_empty();
        inner.dirty.insert(gid);
        if empty {
            let _ = inner.events_tx.send(Event::PersonDisappeared { global_id: gid });
        }
        debug!(camera = %camera, local_id, global_id = %gid, "binding cleared");
    }

    /// Number of distinct active global ids currently bound on any camera in
    /// `cameras` (the de-duplicated room count).
    pub fn count_in_room(&self, cameras: &[CamId]) -> u32 {
        self.count_in_room_at(Utc::now(), cameras)
    }

    pub fn count_in_room_at(&self, now: DateTime<Utc>, cameras: &[CamId]) -> u32 {
        let inner = self.inner.lock();
        let timeout = inner.params.person_timeout_sec;
        inner
            .bindings
            .iter()
            .filter(|((cam, _), _)| cameras.contains(cam))
            .map(|(_, gid)| *gid)
            .unique()
            .filter(|gid| {
                inner
                    .persons
                    .get(gid)
                    .map(|p| p.is_active(now, timeout))
                    .unwrap_or(false)
            })
            .count() as u32
    }

    /// Snapshots of all currently active persons.
    pub fn list_active(&self) -> Vec<PersonSnapshot> {
        self.list_active_at(Utc::now())
    }

    pub fn list_active_at(&self, now: DateTime<Utc>) -> Vec<PersonSnapshot> {
        let inner = self.inner.lock();
        let timeout = inner.params.person_timeout_sec;
        inner
            .persons
            .values()
            .filter(|p| p.is_active(now, timeout))
            .map(|p| p.to_snapshot())
            .collect()
    }

    pub fn get(&self, global_id: GlobalId) -> Option<PersonSnapshot> {
        self.inner
            .lock()
            .persons
            .get(&global_id)
            .map(|p| p.to_snapshot())
    }

    /// Assign a display name to a person. Propagated to the gallery store.
    pub fn set_name(&self, global_id: GlobalId, name: &str) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            let Some(person) = inner.persons.get_mut(&global_id) else {
                return Err(Error::InvalidInput("unknown global id"));
            };
            person.assigned_name = Some(name.to_string());
            inner.dirty.insert(global_id);
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.set_name(global_id, name) {
                warn!("failed to persist name for {global_id}: {e}");
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> ResolverStats {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> ResolverStats {
        let inner = self.inner.lock();
        let timeout = inner.params.person_timeout_sec;
        let active: Vec<&GlobalPerson> = inner
            .persons
            .values()
            .filter(|p| p.is_active(now, timeout))
            .collect();
        ResolverStats {
            total_persons_seen: inner.persons.len(),
            active_persons: active.len(),
            multi_camera_persons: active
                .iter()
                .filter(|p| p.cameras_visited.len() > 1)
                .count(),
            total_bindings: inner.bindings.len(),
        }
    }

    /// Subscribe to binding-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.lock().events_tx.subscribe()
    }

    /// Remove persons that timed out and hold no camera track. Returns their
    /// final records so the caller can persist them as inactive.
    pub fn evict_inactive(&self) -> Vec<PersonRecord> {
        self.evict_inactive_at(Utc::now())
    }

    pub fn evict_inactive_at(&self, now: DateTime<Utc>) -> Vec<PersonRecord> {
        let mut inner = self.inner.lock();
        let timeout = inner.params.person_timeout_sec;
        let evict: Vec<GlobalId> = inner
            .persons
            .values()
            .filter(|p| !p.is_active(now, timeout) && p.camera_tracks.is_empty())
            .map(|p| p.global_id)
            .collect();
        if evict.is_empty() {
            return Vec::new();
        }
        info!("evicting {} inactive persons", evict.len());
        let mut records = Vec::with_capacity(evict.len());
        for gid in evict {
            // The person holds no tracks, so no bindings reference it; the
            // sweep below is the consistency backstop.
            inner.bindings.retain(|_, g| *g != gid);
            inner.dirty.remove(&gid);
            if let Some(person) = inner.persons.remove(&gid) {
                records.push(person.to_record(now, timeout));
            }
        }
        records
    }

    /// Drain the dirty set into records for the periodic gallery sync.
    pub fn take_dirty_records(&self) -> Vec<PersonRecord> {
        self.take_dirty_records_at(Utc::now())
    }

    pub fn take_dirty_records_at(&self, now: DateTime<Utc>) -> Vec<PersonRecord> {
        let mut inner = self.inner.lock();
        let timeout = inner.params.person_timeout_sec;
        let dirty = std::mem::take(&mut inner.dirty);
        dirty
            .iter()
            .filter_map(|gid| inner.persons.get(gid))
            .map(|p| p.to_record(now, timeout))
            .collect()
    }

    /// Records for every person currently in memory (shutdown flush).
    pub fn all_records(&self) -> Vec<PersonRecord> {
        let now = Utc::now();
        let inner = self.inner.lock();
        let timeout = inner.params.person_timeout_sec;
        inner
            .persons
            .values()
            .map(|p| p.to_record(now, timeout))
            .collect()
    }

    pub fn store(&self) -> Option<&Arc<dyn GalleryStore>> {
        self.store.as_ref()
    }

    pub fn params(&self) -> ResolverParams {
        self.inner.lock().params.clone()
    }

    /// Full consistency check, used by tests.
    ///
    /// Verifies that every binding references a known person which lists the
    /// binding in its `camera_tracks`, and the converse.
    pub fn verify_invariants(&self) {
        let inner = self.inner.lock();
        for ((camera, local_id), gid) in inner.bindings.iter() {
            let person = inner
                .persons
                .get(gid)
                .unwrap_or_else(|| panic!("binding ({camera},{local_id}) -> missing person {gid}"));
            assert_eq!(
                person.camera_tracks.get(camera),
                Some(local_id),
                "person {gid} does not list binding ({camera},{local_id})"
            );
        }
        for person in inner.persons.values() {
            for (camera, local_id) in person.camera_tracks.iter() {
                assert_eq!(
                    inner.bindings.get(&(*camera, *local_id)),
                    Some(&person.global_id),
                    "person {} lists unbound track ({camera},{local_id})",
                    person.global_id
                );
            }
            if let Some(canonical) = &person.canonical {
                let norm: f32 = canonical.as_slice().iter().map(|v| v * v).sum::<f32>().sqrt();
                assert!(
                    (norm - 1.0).abs() < 1e-3,
                    "person {} canonical embedding norm {norm}",
                    person.global_id
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn params() -> ResolverParams {
        ResolverParams::default()
    }

    fn resolver() -> GlobalResolver {
        GlobalResolver::new(params(), None)
    }

    fn bbox() -> BBox {
        BBox::new(100.0, 100.0, 180.0, 320.0)
    }

    fn emb(dim: usize, hot: usize) -> Embedding {
        let mut v = vec![0.0f32; dim];
        v[hot] = 1.0;
        Embedding::unit_norm(v).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        "2025-01-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_create_and_rebind() {
        let r = resolver();
        let now = t0();
        let e = emb(8, 0);

        let g1 = r
            .resolve_at(now, CamId(1), 10, Some(&e), 0.8, bbox())
            .unwrap();
        assert_eq!(g1, GlobalId(1));
        assert_eq!(r.count_in_room_at(now, &[CamId(1)]), 1);

        // Same pair again: idempotent.
        let g2 = r
            .resolve_at(now + Duration::seconds(1), CamId(1), 10, Some(&e), 0.8, bbox())
            .unwrap();
        assert_eq!(g1, g2);
        assert_eq!(r.count_in_room_at(now, &[CamId(1)]), 1);
        assert_eq!(r.stats_at(now).total_persons_seen, 1);
        r.verify_invariants();
    }

    #[test]
    fn test_appearance_match_across_cameras() {
        let r = resolver();
        let now = t0();
        let e = emb(8, 3);

        let g1 = r
            .resolve_at(now, CamId(1), 10, Some(&e), 0.8, bbox())
            .unwrap();
        let g2 = r
            .resolve_at(now + Duration::seconds(1), CamId(2), 55, Some(&e), 0.7, bbox())
            .unwrap();
        assert_eq!(g1, g2);

        let snap = r.get(g1).unwrap();
        assert_eq!(snap.camera_tracks.len(), 2);
        assert_eq!(snap.camera_tracks[&CamId(1)], 10);
        assert_eq!(snap.camera_tracks[&CamId(2)], 55);
        assert_eq!(r.count_in_room_at(now, &[CamId(1), CamId(2)]), 1);
        r.verify_invariants();
    }

    #[test]
    fn test_similarity_floor_boundary_is_not_a_match() {
        // Orthogonal embeddings have cosine exactly 0.0. With the floor at
        // 0.0, equality must not match.
        let p = ResolverParams {
            similarity_threshold: 0.0,
            ..params()
        };
        let r = GlobalResolver::new(p, None);
        let now = t0();

        // Disjoint boxes so the spatial stage cannot match either.
        let g1 = r
            .resolve_at(now, CamId(1), 1, Some(&emb(8, 0)), 0.8, bbox())
            .unwrap();
        let g2 = r
            .resolve_at(
                now,
                CamId(2),
                1,
                Some(&emb(8, 1)),
                0.8,
                BBox::new(500.0, 500.0, 560.0, 700.0),
            )
            .unwrap();
        assert_ne!(g1, g2);
    }

    #[test]
    fn test_spatial_match_without_embedding() {
        let r = resolver();
        let now = t0();

        let g1 = r
            .resolve_at(now, CamId(1), 1, Some(&emb(8, 0)), 0.8, bbox())
            .unwrap();
        // Overlapping box on another camera, within the covisibility window,
        // no embedding available.
        let g2 = r
            .resolve_at(
                now + Duration::seconds(1),
                CamId(2),
                7,
                None,
                0.5,
                BBox::new(110.0, 110.0, 190.0, 330.0),
            )
            .unwrap();
        assert_eq!(g1, g2);
        r.verify_invariants();
    }

    #[test]
    fn test_spatial_iou_floor_boundary_is_not_a_match() {
        // Boxes engineered for IoU exactly 1/3; with the floor set to the
        // same value, the match must be rejected.
        let iou_floor = BBox::new(0.0, 0.0, 2.0, 1.0).iou(&BBox::new(1.0, 0.0, 3.0, 1.0));
        let p = ResolverParams {
            spatial_iou_floor: iou_floor,
            ..params()
        };
        let r = GlobalResolver::new(p, None);
        let now = t0();

        let g1 = r
            .resolve_at(now, CamId(1), 1, None, 0.5, BBox::new(0.0, 0.0, 2.0, 1.0))
            .unwrap();
        let g2 = r
            .resolve_at(now, CamId(2), 1, None, 0.5, BBox::new(1.0, 0.0, 3.0, 1.0))
            .unwrap();
        assert_ne!(g1, g2);
    }

    #[test]
    fn test_covisibility_window_inclusive_lower_side() {
        let r = resolver();
        let now = t0();

        let g1 = r
            .resolve_at(now, CamId(1), 1, None, 0.5, bbox())
            .unwrap();
        // Exactly at the window boundary (2 s): still allowed.
        let g2 = r
            .resolve_at(now + Duration::seconds(2), CamId(2), 1, None, 0.5, bbox())
            .unwrap();
        assert_eq!(g1, g2);

        // Beyond the window: new identity.
        let r = resolver();
        let g1 = r.resolve_at(now, CamId(1), 1, None, 0.5, bbox()).unwrap();
        let g3 = r
            .resolve_at(now + Duration::seconds(3), CamId(2), 1, None, 0.5, bbox())
            .unwrap();
        assert_ne!(g1, g3);
    }

    #[test]
    fn test_boost_cannot_rescue_subfloor_similarity() {
        let r = resolver();
        let now = t0();

        // Person on camera 1 with embedding along axis 0.
        let e0 = emb(8, 0);
        let g1 = r.resolve_at(now, CamId(1), 1, Some(&e0), 0.9, bbox()).unwrap();
        r.unbind(CamId(1), 1);

        // Query with raw similarity ~0.48 (below floor 0.5); with the 1.1
        // same-camera boost this would be 0.53 if the boost were allowed to
        // carry it over the floor.
        let mut v = vec![0.0f32; 8];
        v[0] = 0.48;
        v[1] = (1.0f32 - 0.48 * 0.48).sqrt();
        let query = Embedding::unit_norm(v).unwrap();
        let g2 = r
            .resolve_at(
                now + Duration::seconds(1),
                CamId(1),
                2,
                Some(&query),
                0.9,
                BBox::new(500.0, 500.0, 560.0, 700.0),
            )
            .unwrap();
        assert_ne!(g1, g2);
    }

    #[test]
    fn test_disallow_second_binding_same_camera() {
        let r = resolver();
        let now = t0();
        let e = emb(8, 2);

        let g1 = r.resolve_at(now, CamId(1), 1, Some(&e), 0.9, bbox()).unwrap();
        // Identical appearance, same camera, different local track: must not
        // merge (the person is already bound on camera 1), and the identical
        // overlapping box must not spatially merge either.
        let g2 = r.resolve_at(now, CamId(1), 2, Some(&e), 0.9, bbox()).unwrap();
        assert_ne!(g1, g2);

        let snap = r.get(g1).unwrap();
        assert_eq!(snap.camera_tracks.len(), 1);
        r.verify_invariants();
    }

    #[test]
    fn test_unbind_and_disappear() {
        let r = resolver();
        let now = t0();
        let mut events = r.subscribe();

        let g1 = r
            .resolve_at(now, CamId(1), 1, Some(&emb(8, 0)), 0.8, bbox())
            .unwrap();
        r.unbind(CamId(1), 1);

        assert_eq!(r.count_in_room_at(now, &[CamId(1)]), 0);
        let snap = r.get(g1).unwrap();
        assert!(snap.camera_tracks.is_empty());

        assert_eq!(
            events.try_recv().unwrap(),
            Event::PersonAppeared {
                global_id: g1,
                camera: CamId(1)
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            Event::PersonDisappeared { global_id: g1 }
        );
        r.verify_invariants();
    }

    #[test]
    fn test_moved_event() {
        let r = resolver();
        let now = t0();
        let mut events = r.subscribe();
        let e = emb(8, 5);

        let g1 = r.resolve_at(now, CamId(1), 1, Some(&e), 0.8, bbox()).unwrap();
        let _ = r
            .resolve_at(now + Duration::seconds(1), CamId(2), 9, Some(&e), 0.8, bbox())
            .unwrap();

        assert_eq!(
            events.try_recv().unwrap(),
            Event::PersonAppeared {
                global_id: g1,
                camera: CamId(1)
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            Event::PersonMoved {
                global_id: g1,
                from: CamId(1),
                to: CamId(2)
            }
        );
    }

    #[test]
    fn test_eviction() {
        let r = resolver();
        let now = t0();

        let g1 = r
            .resolve_at(now, CamId(1), 1, Some(&emb(8, 0)), 0.8, bbox())
            .unwrap();
        r.unbind(CamId(1), 1);

        // Not yet timed out: nothing evicted.
        assert!(r.evict_inactive_at(now + Duration::seconds(10)).is_empty());

        let later = now + Duration::seconds(120);
        let evicted = r.evict_inactive_at(later);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].global_id, g1);
        assert!(!evicted[0].is_active);
        assert!(r.get(g1).is_none());

        // The id is never reused.
        let g2 = r
            .resolve_at(later, CamId(1), 2, Some(&emb(8, 1)), 0.8, bbox())
            .unwrap();
        assert!(g2.0 > g1.0);
        r.verify_invariants();
    }

    #[test]
    fn test_person_still_bound_is_not_evicted() {
        let r = resolver();
        let now = t0();
        let g1 = r
            .resolve_at(now, CamId(1), 1, Some(&emb(8, 0)), 0.8, bbox())
            .unwrap();
        // Timed out but still bound: stays in memory.
        assert!(r.evict_inactive_at(now + Duration::seconds(120)).is_empty());
        assert!(r.get(g1).is_some());
    }

    #[test]
    fn test_rejects_degenerate_input() {
        let r = resolver();
        let now = t0();
        assert!(r
            .resolve_at(now, CamId(1), 1, None, 0.5, BBox::new(5.0, 5.0, 5.0, 9.0))
            .is_err());
        assert!(r
            .resolve_at(now, CamId(1), 1, None, f32::NAN, bbox())
            .is_err());
        // no state was created
        assert_eq!(r.stats_at(now).total_persons_seen, 0);
    }

    #[test]
    fn test_canonical_embedding_update() {
        let r = resolver();
        let now = t0();

        let low_q = emb(8, 0);
        let g = r
            .resolve_at(now, CamId(1), 1, Some(&low_q), 0.3, bbox())
            .unwrap();

        // Higher quality replaces the canonical embedding.
        let high_q = emb(8, 1);
        r.resolve_at(now, CamId(1), 1, Some(&high_q), 0.9, bbox())
            .unwrap();
        let snap = r.get(g).unwrap();
        assert!((snap.best_quality - 0.9).abs() < 1e-6);

        // Lower quality is blended, best_quality unchanged.
        r.resolve_at(now, CamId(1), 1, Some(&low_q), 0.1, bbox())
            .unwrap();
        let snap = r.get(g).unwrap();
        assert!((snap.best_quality - 0.9).abs() < 1e-6);
        r.verify_invariants();
    }

    #[test]
    fn test_set_name() {
        let r = resolver();
        let now = t0();
        let g = r
            .resolve_at(now, CamId(1), 1, Some(&emb(8, 0)), 0.8, bbox())
            .unwrap();
        r.set_name(g, "front desk").unwrap();
        assert_eq!(r.get(g).unwrap().assigned_name.as_deref(), Some("front desk"));
        assert!(r.set_name(GlobalId(999), "x").is_err());
    }

    /// S4: a person persisted by a prior run is recalled through the store's
    /// knn on their first reappearance, keeping their original global id.
    #[test]
    fn test_cold_start_recall_from_store() {
        use crate::store::{GalleryStore, JsonGalleryStore};
        use std::collections::BTreeSet;

        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn GalleryStore> =
            Arc::new(JsonGalleryStore::open(dir.path().join("g.jsonl")).unwrap());

        let e = emb(8, 4);
        let now = Utc::now();
        store
            .upsert_batch(&[PersonRecord {
                global_id: GlobalId(7),
                assigned_name: Some("alice".into()),
                canonical_embedding: Some(e.as_slice().to_vec()),
                best_quality: 0.9,
                first_seen: now,
                last_seen: now,
                total_appearances: 12,
                cameras_visited: BTreeSet::from([CamId(1)]),
                // Not active: startup hydration skips it, so the first
                // resolve must go through knn recall.
                is_active: false,
                last_positions: BTreeMap::new(),
            }])
            .unwrap();

        let r = GlobalResolver::new(params(), Some(store));
        assert_eq!(r.stats().total_persons_seen, 0);

        let g = r
            .resolve_at(now, CamId(3), 2, Some(&e), 0.8, bbox())
            .unwrap();
        assert_eq!(g, GlobalId(7));

        let snap = r.get(g).unwrap();
        assert_eq!(snap.assigned_name.as_deref(), Some("alice"));
        // Persisted bindings are stale; only the fresh binding exists.
        assert_eq!(snap.camera_tracks.len(), 1);
        assert_eq!(snap.camera_tracks[&CamId(3)], 2);

        // The id counter moved past the rehydrated id.
        let g2 = r
            .resolve_at(now, CamId(3), 5, Some(&emb(8, 6)), 0.8, BBox::new(400.0, 10.0, 460.0, 200.0))
            .unwrap();
        assert_eq!(g2, GlobalId(8));
        r.verify_invariants();
    }

    /// Startup hydration loads active persons with their bindings cleared.
    #[test]
    fn test_startup_hydration_clears_bindings() {
        use crate::store::{GalleryStore, JsonGalleryStore};
        use std::collections::BTreeSet;

        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn GalleryStore> =
            Arc::new(JsonGalleryStore::open(dir.path().join("g.jsonl")).unwrap());
        let now = Utc::now();
        store
            .upsert_batch(&[PersonRecord {
                global_id: GlobalId(3),
                assigned_name: None,
                canonical_embedding: Some(emb(8, 0).as_slice().to_vec()),
                best_quality: 0.5,
                first_seen: now,
                last_seen: now,
                total_appearances: 4,
                cameras_visited: BTreeSet::from([CamId(2)]),
                is_active: true,
                last_positions: BTreeMap::from([(
                    CamId(2),
                    warden_types::PositionFix {
                        bbox: bbox(),
                        stamp: now,
                    },
                )]),
            }])
            .unwrap();

        let r = GlobalResolver::new(params(), Some(store));
        let snap = r.get(GlobalId(3)).unwrap();
        assert!(snap.camera_tracks.is_empty());
        assert!(snap.camera_positions.is_empty());
        assert_eq!(r.count_in_room_at(now, &[CamId(2)]), 0);
        r.verify_invariants();
    }

    #[test]
    fn test_dirty_records_drain() {
        let r = resolver();
        let now = t0();
        r.resolve_at(now, CamId(1), 1, Some(&emb(8, 0)), 0.8, bbox())
            .unwrap();
        let records = r.take_dirty_records_at(now);
        assert_eq!(records.len(), 1);
        assert!(records[0].is_active);
        // drained
        assert!(r.take_dirty_records_at(now).is_empty());
    }
}
