//! Background maintenance: gallery eviction and store sync.
//!
//! Both tasks are cooperative: they tick on an interval, observe the
//! cancellation token, and never let a store failure take the engine down.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::resolver::GlobalResolver;

/// Retry buffer cap for records the store refused; beyond this the oldest
/// are dropped (they will be re-marked dirty on their next observation).
const MAX_PENDING_RECORDS: usize = 10_000;

/// Periodically batch-upserts dirty persons into the gallery store.
///
/// Failed batches are kept and retried on the next tick, silently from the
/// resolver's point of view.
pub async fn gallery_sync_task(
    resolver: GlobalResolver,
    interval: Duration,
    cancel: CancellationToken,
) {
    let Some(store) = resolver.store().cloned() else {
        debug!("no gallery store configured; sync task idle");
        return;
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut pending = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        pending.extend(resolver.take_dirty_records());
        if pending.is_empty() {
            continue;
        }
        if pending.len() > MAX_PENDING_RECORDS {
            let excess = pending.len() - MAX_PENDING_RECORDS;
            warn!("gallery sync backlog over cap; dropping {excess} oldest records");
            pending.drain(..excess);
        }
        match store.upsert_batch(&pending) {
            Ok(()) => {
                debug!("synced {} persons to gallery store", pending.len());
                pending.clear();
            }
            Err(e) => {
                warn!("gallery sync failed ({e}); will retry {} records", pending.len());
            }
        }
    }

    debug!("gallery sync task stopped");
}

/// Periodically evicts timed-out, unbound persons from memory, persisting
/// their final (inactive) records.
pub async fn eviction_task(
    resolver: GlobalResolver,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let evicted = resolver.evict_inactive();
        if evicted.is_empty() {
            continue;
        }
        if let Some(store) = resolver.store() {
            if let Err(e) = store.upsert_batch(&evicted) {
                warn!("failed to persist {} evicted persons: {e}", evicted.len());
            }
        }
    }

    debug!("eviction task stopped");
}

/// Write the complete in-memory gallery to the store. Called once at
/// shutdown.
pub fn flush_to_store(resolver: &GlobalResolver) {
    let Some(store) = resolver.store() else {
        return;
    };
    let records = resolver.all_records();
    match store.upsert_batch(&records) {
        Ok(()) => info!("flushed {} persons to gallery store", records.len()),
        Err(e) => warn!("final gallery flush failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{GalleryStore, JsonGalleryStore};
    use crate::{Error, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use warden_types::{BBox, CamId, Embedding, GlobalId, PersonRecord, ResolverParams};

    fn embedding() -> Embedding {
        Embedding::unit_norm(vec![1.0, 0.0, 0.0, 0.0]).unwrap()
    }

    fn bbox() -> BBox {
        BBox::new(10.0, 10.0, 90.0, 200.0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sync_task_persists_dirty_persons() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn GalleryStore> =
            Arc::new(JsonGalleryStore::open(dir.path().join("g.jsonl")).unwrap());
        let resolver = GlobalResolver::new(ResolverParams::default(), Some(store.clone()));

        let e = embedding();
        resolver.resolve(CamId(1), 1, Some(&e), 0.8, bbox()).unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(gallery_sync_task(
            resolver.clone(),
            Duration::from_millis(20),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(120)).await;
        cancel.cancel();
        task.await.unwrap();

        let active = store.load_active().unwrap();
        assert_eq!(active.len(), 1);
        assert!(active[0].canonical_embedding.is_some());
    }

    /// Store that fails its first N upserts, to exercise the retry path.
    struct FlakyStore {
        inner: JsonGalleryStore,
        failures_left: AtomicUsize,
    }

    impl GalleryStore for FlakyStore {
        fn load_active(&self) -> Result<Vec<PersonRecord>> {
            self.inner.load_active()
        }
        fn upsert_batch(&self, records: &[PersonRecord]) -> Result<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Store("transient write failure".into()));
            }
            self.inner.upsert_batch(records)
        }
        fn knn(&self, embedding: &Embedding, k: usize) -> Result<Vec<(PersonRecord, f32)>> {
            self.inner.knn(embedding, k)
        }
        fn set_name(&self, global_id: GlobalId, name: &str) -> Result<()> {
            self.inner.set_name(global_id, name)
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sync_retries_after_transient_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn GalleryStore> = Arc::new(FlakyStore {
            inner: JsonGalleryStore::open(dir.path().join("g.jsonl")).unwrap(),
            failures_left: AtomicUsize::new(2),
        });
        let resolver = GlobalResolver::new(ResolverParams::default(), Some(store.clone()));
        resolver
            .resolve(CamId(1), 1, Some(&embedding()), 0.8, bbox())
            .unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(gallery_sync_task(
            resolver.clone(),
            Duration::from_millis(15),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        task.await.unwrap();

        // The record survived the two failed ticks and landed on the third.
        assert_eq!(store.load_active().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_eviction_task_persists_inactive_record() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn GalleryStore> =
            Arc::new(JsonGalleryStore::open(dir.path().join("g.jsonl")).unwrap());
        let params = ResolverParams {
            person_timeout_sec: 0.05,
            ..Default::default()
        };
        let resolver = GlobalResolver::new(params, Some(store.clone()));

        let g = resolver
            .resolve(CamId(1), 1, Some(&embedding()), 0.8, bbox())
            .unwrap();
        resolver.unbind(CamId(1), 1);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(eviction_task(
            resolver.clone(),
            Duration::from_millis(20),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        task.await.unwrap();

        assert!(resolver.get(g).is_none());
        // Persisted, flagged inactive.
        assert!(store.load_active().unwrap().is_empty());
        let (rec, _) = &store.knn(&embedding(), 1).unwrap()[0];
        assert_eq!(rec.global_id, g);
        assert!(!rec.is_active);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_final_flush() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn GalleryStore> =
            Arc::new(JsonGalleryStore::open(dir.path().join("g.jsonl")).unwrap());
        let resolver = GlobalResolver::new(ResolverParams::default(), Some(store.clone()));
        resolver
            .resolve(CamId(1), 1, Some(&embedding()), 0.8, bbox())
            .unwrap();

        flush_to_store(&resolver);
        assert_eq!(store.load_active().unwrap().len(), 1);
    }
}
