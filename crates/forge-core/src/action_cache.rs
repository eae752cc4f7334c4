//! Memoization from [`ActionKey`] to cached outputs, with keyed-MAC
//! integrity tags, LRU eviction, and at-most-once coalescing of concurrent
//! builds for the same key.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use hmac::{Hmac, Mac};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{instrument, warn};

use crate::binary_format::RecordFields;
use crate::content_store::ContentStore;
use crate::error::{BuildError, BuildResult, ErrorKind};
use crate::fingerprint::{CanonicalWriter, Fingerprint};
use crate::graph::TargetId;

type HmacSha256 = Hmac<Sha256>;

/// Cryptographic identity of an [`crate::executor::Action`], derived from
/// everything that can affect its output. Two actions with equal keys must
/// produce byte-identical outputs under hermetic execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionKey(Fingerprint);

impl ActionKey {
    pub fn compute(
        target: &TargetId,
        ordered_source_fingerprints: &[Fingerprint],
        ordered_dep_output_fingerprints: &[Fingerprint],
        ordered_flags: &[String],
        canonical_env: &[(String, String)],
        tool_version: &str,
    ) -> Self {
        let mut w = CanonicalWriter::new();
        w.write_str(target.as_str());
        w.write_u64(ordered_source_fingerprints.len() as u64);
        for fp in ordered_source_fingerprints {
            w.write_bytes(fp.as_bytes());
        }
        w.write_u64(ordered_dep_output_fingerprints.len() as u64);
        for fp in ordered_dep_output_fingerprints {
            w.write_bytes(fp.as_bytes());
        }
        w.write_ordered_strings(ordered_flags.iter().map(String::as_str));
        w.write_sorted_map(canonical_env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        w.write_str(tool_version);
        Self(Fingerprint::of_bytes(&w.into_bytes()))
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }
}

/// A cached action's metadata, used by eviction policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntryMetadata {
    pub size: u64,
    pub timestamp: u64,
    pub access_count: u64,
}

/// One memoized action: its outputs live in the [`ContentStore`] under
/// `output_fingerprints`; this record is the pointer plus bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub action_key: ActionKey,
    pub output_fingerprint: Fingerprint,
    pub output_paths: Vec<PathBuf>,
    pub output_fingerprints: Vec<Fingerprint>,
    pub metadata: CacheEntryMetadata,
    integrity_tag: Vec<u8>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum EvictionPolicy {
    MaxEntries(usize),
    MaxBytes(u64),
}

struct InFlight {
    result: Mutex<Option<BuildResult<CacheEntry>>>,
    condvar: Condvar,
}

/// Persistent, process-synchronized map from [`ActionKey`] to [`CacheEntry`].
pub struct ActionCache {
    root: PathBuf,
    content: Arc<ContentStore>,
    entries: DashMap<ActionKey, CacheEntry>,
    in_flight: DashMap<ActionKey, Arc<InFlight>>,
    secret: Vec<u8>,
    hits: AtomicU64,
    misses: AtomicU64,
}

const FIELD_ACTION_KEY: u16 = 1;
const FIELD_OUTPUT_FINGERPRINT: u16 = 2;
const FIELD_OUTPUT_PATHS: u16 = 3;
const FIELD_OUTPUT_FINGERPRINTS: u16 = 4;
const FIELD_METADATA: u16 = 5;
const FIELD_INTEGRITY_TAG: u16 = 6;

impl ActionCache {
    pub fn open(root: impl Into<PathBuf>, content: Arc<ContentStore>, workspace_secret: &[u8]) -> BuildResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| BuildError::io("IO_CREATE_FAILED", &e, &root).wrap("opening action cache"))?;
        let cache = Self {
            root,
            content,
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            secret: workspace_secret.to_vec(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        };
        cache.load_existing()?;
        Ok(cache)
    }

    fn load_existing(&self) -> BuildResult<()> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(it) => it,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(BuildError::io("IO_READ_FAILED", &e, &self.root)),
        };
        for entry in read_dir {
            let entry = entry.map_err(|e| BuildError::io("IO_READ_FAILED", &e, &self.root))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let bytes = match fs::read(&path) {
                Ok(b) => b,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable action cache entry");
                    continue;
                }
            };
            match Self::decode_entry(&bytes) {
                Ok(entry) => {
                    self.entries.insert(entry.action_key, entry);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e.message, "skipping malformed action cache entry");
                }
            }
        }
        Ok(())
    }

    fn entry_path(&self, key: &ActionKey) -> PathBuf {
        self.root.join(key.to_hex())
    }

    fn compute_tag(&self, key: &ActionKey, output_fingerprint: &Fingerprint) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts keys of any length");
        mac.update(key.0.as_bytes());
        mac.update(output_fingerprint.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    fn verify_tag(&self, entry: &CacheEntry) -> bool {
        self.compute_tag(&entry.action_key, &entry.output_fingerprint) == entry.integrity_tag
    }

    /// Looks up `key`. A present-but-corrupt entry (bad tag, or an output no
    /// longer present in the content store) is treated as a miss: it is
    /// removed and the caller rebuilds.
    #[instrument(level = "debug", skip(self))]
    pub fn lookup(&self, key: &ActionKey) -> BuildResult<Option<CacheEntry>> {
        let Some(entry) = self.entries.get(key).map(|r| r.value().clone()) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        if !self.verify_tag(&entry) {
            warn!(action_key = %key.to_hex(), "action cache integrity tag mismatch, treating as miss");
            self.remove(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        for fp in &entry.output_fingerprints {
            if !self.content.has(fp) {
                warn!(action_key = %key.to_hex(), "action cache entry references missing content, treating as miss");
                self.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        if let Some(mut slot) = self.entries.get_mut(key) {
            slot.metadata.access_count += 1;
        }
        Ok(Some(entry))
    }

    /// Writes outputs to the content store and commits a [`CacheEntry`]
    /// pointing at them. `outputs` pairs each declared output path with its
    /// bytes.
    #[instrument(level = "debug", skip(self, outputs))]
    pub fn put(&self, key: ActionKey, outputs: Vec<(PathBuf, Vec<u8>)>, now: u64) -> BuildResult<CacheEntry> {
        let mut output_paths = Vec::with_capacity(outputs.len());
        let mut output_fingerprints = Vec::with_capacity(outputs.len());
        let mut total_size = 0u64;
        for (path, bytes) in outputs {
            total_size += bytes.len() as u64;
            let fp = self.content.store(&bytes)?;
            output_paths.push(path);
            output_fingerprints.push(fp);
        }
        let output_fingerprint = Fingerprint::of_sequence(output_fingerprints.iter());
        let integrity_tag = self.compute_tag(&key, &output_fingerprint);

        let entry = CacheEntry {
            action_key: key,
            output_fingerprint,
            output_paths,
            output_fingerprints,
            metadata: CacheEntryMetadata {
                size: total_size,
                timestamp: now,
                access_count: 0,
            },
            integrity_tag,
        };

        self.persist(&entry)?;
        self.entries.insert(key, entry.clone());
        Ok(entry)
    }

    fn encode_entry(entry: &CacheEntry) -> BuildResult<Vec<u8>> {
        let mut fields = RecordFields::new();
        fields.set(FIELD_ACTION_KEY, entry.action_key.0.as_bytes().to_vec());
        fields.set(FIELD_OUTPUT_FINGERPRINT, entry.output_fingerprint.as_bytes().to_vec());
        fields.set(
            FIELD_OUTPUT_PATHS,
            bincode::serialize(&entry.output_paths).map_err(|e| BuildError::internal(e.to_string()))?,
        );
        fields.set(
            FIELD_OUTPUT_FINGERPRINTS,
            bincode::serialize(&entry.output_fingerprints).map_err(|e| BuildError::internal(e.to_string()))?,
        );
        fields.set(
            FIELD_METADATA,
            bincode::serialize(&entry.metadata).map_err(|e| BuildError::internal(e.to_string()))?,
        );
        fields.set(FIELD_INTEGRITY_TAG, entry.integrity_tag.clone());
        Ok(fields.encode())
    }

    fn decode_entry(bytes: &[u8]) -> BuildResult<CacheEntry> {
        let fields = RecordFields::decode(bytes)?;
        let action_key_bytes = fields.get_bytes(FIELD_ACTION_KEY)?;
        let action_key_arr: [u8; 32] = action_key_bytes
            .try_into()
            .map_err(|_| BuildError::internal("action key field has unexpected length"))?;
        let output_fp_bytes = fields.get_bytes(FIELD_OUTPUT_FINGERPRINT)?;
        let output_fp_arr: [u8; 32] = output_fp_bytes
            .try_into()
            .map_err(|_| BuildError::internal("output fingerprint field has unexpected length"))?;

        Ok(CacheEntry {
            action_key: ActionKey(Fingerprint::from_bytes_unchecked(action_key_arr)),
            output_fingerprint: Fingerprint::from_bytes_unchecked(output_fp_arr),
            output_paths: bincode::deserialize(&fields.get_bytes(FIELD_OUTPUT_PATHS)?)
                .map_err(|e| BuildError::internal(e.to_string()))?,
            output_fingerprints: bincode::deserialize(&fields.get_bytes(FIELD_OUTPUT_FINGERPRINTS)?)
                .map_err(|e| BuildError::internal(e.to_string()))?,
            metadata: bincode::deserialize(&fields.get_bytes(FIELD_METADATA)?)
                .map_err(|e| BuildError::internal(e.to_string()))?,
            integrity_tag: fields.get_bytes(FIELD_INTEGRITY_TAG)?,
        })
    }

    fn persist(&self, entry: &CacheEntry) -> BuildResult<()> {
        let path = self.entry_path(&entry.action_key);
        let bytes = Self::encode_entry(entry)?;
        let tmp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        let write_result = (|| -> std::io::Result<()> {
            use std::io::Write;
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            Ok(())
        })();
        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(BuildError::io("IO_WRITE_FAILED", &e, &path).wrap("persisting action cache entry"));
        }
        fs::rename(&tmp_path, &path).map_err(|e| BuildError::io("IO_WRITE_FAILED", &e, &path).wrap("finalizing action cache entry"))?;
        Ok(())
    }

    fn remove(&self, key: &ActionKey) {
        self.entries.remove(key);
        let _ = fs::remove_file(self.entry_path(key));
    }

    /// Durable persistence of pending writes. Entries are written
    /// synchronously in [`Self::put`], so this only needs to fsync the
    /// directory to make the set of entry files durable.
    pub fn flush(&self) -> BuildResult<()> {
        if let Ok(dir) = fs::File::open(&self.root) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bytes: self.entries.iter().map(|e| e.metadata.size).sum(),
        }
    }

    /// Evicts entries per `policy`, releasing their entry-file references.
    /// The content store itself is untouched here -- a separate garbage
    /// collection pass over all live entries' output fingerprints is
    /// responsible for reclaiming unreferenced object bytes.
    #[instrument(level = "debug", skip(self))]
    pub fn evict(&self, policy: EvictionPolicy) -> BuildResult<usize> {
        let mut candidates: Vec<(ActionKey, CacheEntryMetadata)> =
            self.entries.iter().map(|e| (*e.key(), e.metadata.clone())).collect();
        // LRU: lowest access_count first, ties broken by oldest timestamp.
        candidates.sort_by(|a, b| a.1.access_count.cmp(&b.1.access_count).then(a.1.timestamp.cmp(&b.1.timestamp)));

        let mut removed = 0usize;
        match policy {
            EvictionPolicy::MaxEntries(max) => {
                let overflow = candidates.len().saturating_sub(max);
                for (key, _) in candidates.into_iter().take(overflow) {
                    self.remove(&key);
                    removed += 1;
                }
            }
            EvictionPolicy::MaxBytes(max_bytes) => {
                let mut total: u64 = candidates.iter().map(|(_, m)| m.size).sum();
                for (key, metadata) in candidates {
                    if total <= max_bytes {
                        break;
                    }
                    self.remove(&key);
                    total = total.saturating_sub(metadata.size);
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Runs `build` for `key` if no build is already in flight; otherwise
    /// blocks until the in-flight build completes and returns its result.
    /// Guarantees at most one build runs per key at a time, matching the
    /// at-most-once execution invariant.
    pub fn coalesced_build(
        &self,
        key: ActionKey,
        build: impl FnOnce() -> BuildResult<CacheEntry>,
    ) -> BuildResult<CacheEntry> {
        if let Some(entry) = self.lookup(&key)? {
            return Ok(entry);
        }

        let (became_builder, slot) = {
            let mut became_builder = false;
            let slot = self
                .in_flight
                .entry(key)
                .or_insert_with(|| {
                    became_builder = true;
                    Arc::new(InFlight {
                        result: Mutex::new(None),
                        condvar: Condvar::new(),
                    })
                })
                .clone();
            (became_builder, slot)
        };

        if became_builder {
            let result = build();
            {
                let mut guard = slot.result.lock();
                *guard = Some(result.clone());
            }
            slot.condvar.notify_all();
            self.in_flight.remove(&key);
            return result;
        }

        let mut guard = slot.result.lock();
        while guard.is_none() {
            slot.condvar.wait(&mut guard);
        }
        guard.clone().expect("condvar only wakes after result is set")
    }
}

fn _assert_send_sync() {
    fn assert<T: Send + Sync>() {}
    assert::<ActionCache>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    fn cache(dir: &Path) -> ActionCache {
        let content = Arc::new(ContentStore::open(dir.join("cas")).unwrap());
        ActionCache::open(dir.join("actions"), content, b"workspace-secret").unwrap()
    }

    fn key(name: &str) -> ActionKey {
        ActionKey::compute(&TargetId::new(name), &[], &[], &[], &[], "v1")
    }

    #[test]
    fn put_then_lookup_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let k = key("//p:a");
        let entry = cache.put(k, vec![(PathBuf::from("out.bin"), b"payload".to_vec())], 1).unwrap();
        let found = cache.lookup(&k).unwrap().unwrap();
        assert_eq!(found.output_fingerprint, entry.output_fingerprint);
    }

    #[test]
    fn tampered_integrity_tag_is_treated_as_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let k = key("//p:a");
        cache.put(k, vec![(PathBuf::from("out.bin"), b"payload".to_vec())], 1).unwrap();
        cache.entries.get_mut(&k).unwrap().integrity_tag = vec![0u8; 32];
        assert!(cache.lookup(&k).unwrap().is_none());
    }

    #[test]
    fn miss_then_hit_updates_stats() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let k = key("//p:a");
        assert!(cache.lookup(&k).unwrap().is_none());
        cache.put(k, vec![], 1).unwrap();
        cache.lookup(&k).unwrap();
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn evict_max_entries_keeps_most_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        for i in 0..5 {
            cache.put(key(&format!("//p:{i}")), vec![], i as u64).unwrap();
        }
        let removed = cache.evict(EvictionPolicy::MaxEntries(2)).unwrap();
        assert_eq!(removed, 3);
        assert_eq!(cache.stats().entries, 2);
    }

    #[test]
    fn concurrent_builds_for_same_key_coalesce() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(cache(dir.path()));
        let k = key("//p:shared");
        let barrier = Arc::new(Barrier::new(4));
        let build_count = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                let build_count = build_count.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    cache
                        .coalesced_build(k, || {
                            build_count.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(20));
                            Ok(CacheEntry {
                                action_key: k,
                                output_fingerprint: Fingerprint::empty(),
                                output_paths: vec![],
                                output_fingerprints: vec![],
                                metadata: CacheEntryMetadata { size: 0, timestamp: 0, access_count: 0 },
                                integrity_tag: vec![],
                            })
                        })
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(build_count.load(Ordering::SeqCst), 1);
    }
}
