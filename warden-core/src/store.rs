//! Gallery persistence.
//!
//! The resolver talks to storage through [`GalleryStore`], a key-value plus
//! vector-search surface. [`JsonGalleryStore`] is the bundled implementation:
//! one JSON record per line in a single snapshot file, rewritten atomically
//! (temp file + rename) on every sync. Galleries are small (thousands of
//! persons, not millions), so a full rewrite and a linear cosine scan are
//! the simple, correct choices here.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use warden_types::{Embedding, GlobalId, PersonRecord};

use crate::Result;

/// How far back `knn` will consider persons that are no longer flagged
/// active.
const RECALL_HORIZON_SEC: i64 = 3600;

/// Key-value and vector-search store for the person gallery.
///
/// Implementations synchronize internally; the resolver never holds its own
/// lock across these calls.
pub trait GalleryStore: Send + Sync {
    /// Hydrate persons whose `is_active` flag is set.
    fn load_active(&self) -> Result<Vec<PersonRecord>>;

    /// Idempotent write. A conflict on `global_id` replaces the mutable
    /// fields and keeps the better-quality canonical embedding.
    fn upsert_batch(&self, records: &[PersonRecord]) -> Result<()>;

    /// Nearest neighbors by cosine over stored canonical embeddings,
    /// restricted to active or recently-active persons. Descending
    /// similarity.
    fn knn(&self, embedding: &Embedding, k: usize) -> Result<Vec<(PersonRecord, f32)>>;

    /// Update the assigned name. A missing record is not an error; the name
    /// arrives with the next upsert.
    fn set_name(&self, global_id: GlobalId, name: &str) -> Result<()>;
}

/// File-backed gallery store: JSON lines, atomic rewrite.
pub struct JsonGalleryStore {
    path: PathBuf,
    records: RwLock<BTreeMap<GlobalId, PersonRecord>>,
}

impl JsonGalleryStore {
    /// Open (or create) the gallery snapshot at `path`.
    ///
    /// Unparseable lines are skipped with a warning rather than poisoning
    /// the whole gallery.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut records = BTreeMap::new();
        match std::fs::File::open(&path) {
            Ok(file) => {
                for (lineno, line) in BufReader::new(file).lines().enumerate() {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<PersonRecord>(&line) {
                        Ok(record) => {
                            records.insert(record.global_id, record);
                        }
                        Err(e) => {
                            warn!(
                                "skipping unparseable gallery record at {}:{}: {e}",
                                path.display(),
                                lineno + 1
                            );
                        }
                    }
                }
                debug!("loaded {} gallery records from {}", records.len(), path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no gallery snapshot at {}; starting empty", path.display());
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    /// Rewrite the snapshot file from the in-memory map.
    fn save(&self) -> Result<()> {
        let tmp_path = self.path.with_extension("jsonl.tmp");
        {
            let records = self.records.read();
            let mut file = std::fs::File::create(&tmp_path)?;
            for record in records.values() {
                let line = serde_json::to_string(record)?;
                writeln!(file, "{line}")?;
            }
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

/// Merge `new` into `old` with the upsert conflict rules.
fn merge_record(old: &PersonRecord, new: &PersonRecord) -> PersonRecord {
    let mut merged = new.clone();
    merged.first_seen = old.first_seen.min(new.first_seen);
    // Keep the better-quality canonical embedding.
    if old.canonical_embedding.is_some()
        && (new.canonical_embedding.is_none() || new.best_quality < old.best_quality)
    {
        merged.canonical_embedding = old.canonical_embedding.clone();
        merged.best_quality = old.best_quality;
    }
    if merged.assigned_name.is_none() {
        merged.assigned_name = old.assigned_name.clone();
    }
    merged
}

impl GalleryStore for JsonGalleryStore {
    fn load_active(&self) -> Result<Vec<PersonRecord>> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.is_active)
            .cloned()
            .collect())
    }

    fn upsert_batch(&self, records: &[PersonRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        {
            let mut map = self.records.write();
            for record in records {
                let merged = match map.get(&record.global_id) {
                    Some(old) => merge_record(old, record),
                    None => record.clone(),
                };
                map.insert(record.global_id, merged);
            }
        }
        // The in-memory map is already consistent; a failed disk write is
        // reported so the caller can retry on the next sync.
        self.save()
    }

    fn knn(&self, embedding: &Embedding, k: usize) -> Result<Vec<(PersonRecord, f32)>> {
        let horizon = Utc::now() - Duration::seconds(RECALL_HORIZON_SEC);
        let mut scored: Vec<(PersonRecord, f32)> = self
            .records
            .read()
            .values()
            .filter(|r| r.is_active || r.last_seen >= horizon)
            .filter_map(|r| {
                let raw = r.canonical_embedding.as_ref()?;
                let canonical = Embedding::unit_norm(raw.clone()).ok()?;
                Some((r.clone(), canonical.cosine(embedding)))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    fn set_name(&self, global_id: GlobalId, name: &str) -> Result<()> {
        let found = {
            let mut map = self.records.write();
            match map.get_mut(&global_id) {
                Some(record) => {
                    record.assigned_name = Some(name.to_string());
                    true
                }
                None => false,
            }
        };
        if found {
            self.save()
        } else {
            // Not yet persisted; the name rides along with the next upsert.
            Ok(())
        }
    }
}

impl std::fmt::Debug for JsonGalleryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonGalleryStore")
            .field("path", &self.path)
            .field("records", &self.records.read().len())
            .finish()
    }
}
