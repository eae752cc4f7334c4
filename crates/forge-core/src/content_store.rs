//! Content-addressed storage: maps a [`Fingerprint`] to the bytes it was
//! computed from, persisted on disk under `<root>/objects/<hex[0..2]>/<hex>`.
//!
//! Writes go to a sibling temp file, are `fsync`'d, then renamed into place
//! so a crash mid-write never leaves a partially-written object visible at
//! its final path. Reads re-hash the loaded bytes and compare against the
//! requested fingerprint; a mismatch is treated as corruption, not a miss,
//! and the offending file is quarantined rather than silently served.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{instrument, warn};

use crate::error::{BuildError, BuildResult, ErrorKind};
use crate::fingerprint::Fingerprint;

/// On-disk content-addressed object store.
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn open(root: impl Into<PathBuf>) -> BuildResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| BuildError::io("IO_CREATE_FAILED", &e, &root).wrap("opening content store"))?;
        Ok(Self { root })
    }

    fn object_path(&self, fp: &Fingerprint) -> PathBuf {
        let hex = fp.to_hex();
        self.root.join(&hex[0..2]).join(&hex)
    }

    /// Writes `bytes` under the store and returns its fingerprint. A write
    /// of content that's already present is a cheap no-op after the hash
    /// check -- the existing object is left untouched.
    #[instrument(level = "debug", skip(self, bytes), fields(len = bytes.len()))]
    pub fn store(&self, bytes: &[u8]) -> BuildResult<Fingerprint> {
        let fp = Fingerprint::of_bytes(bytes);
        let path = self.object_path(&fp);
        if path.exists() {
            return Ok(fp);
        }
        let dir = path.parent().expect("object path always has a parent");
        fs::create_dir_all(dir).map_err(|e| BuildError::io("IO_CREATE_FAILED", &e, dir).wrap("staging object directory"))?;

        let tmp_path = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        self.atomic_write(&tmp_path, &path, bytes)?;
        Ok(fp)
    }

    fn atomic_write(&self, tmp_path: &Path, final_path: &Path, bytes: &[u8]) -> BuildResult<()> {
        let write_result = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(tmp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            Ok(())
        })();
        if let Err(e) = write_result {
            let _ = fs::remove_file(tmp_path);
            return Err(BuildError::io("IO_WRITE_FAILED", &e, final_path).wrap("writing content object"));
        }
        fs::rename(tmp_path, final_path)
            .map_err(|e| BuildError::io("IO_WRITE_FAILED", &e, final_path).wrap("finalizing content object"))?;
        Ok(())
    }

    /// Loads the bytes for `fp`, verifying `Fingerprint::of_bytes(&bytes) ==
    /// fp` before returning them. On mismatch the object is moved aside into
    /// `<root>/quarantine/` and a [`ErrorKind::Cache`] error is returned.
    #[instrument(level = "debug", skip(self))]
    pub fn load(&self, fp: &Fingerprint) -> BuildResult<Vec<u8>> {
        let path = self.object_path(fp);
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BuildError::new(ErrorKind::Cache, "CACHE_OBJECT_MISSING", format!("no object for {fp}"))
                    .with_file(&path)
            } else {
                BuildError::io("IO_READ_FAILED", &e, &path).wrap("loading content object")
            }
        })?;

        let actual = Fingerprint::of_bytes(&bytes);
        if actual != *fp {
            self.quarantine(&path, fp);
            return Err(BuildError::new(
                ErrorKind::Cache,
                "CACHE_INTEGRITY_MISMATCH",
                format!("object at {} hashes to {actual}, expected {fp}", path.display()),
            )
            .with_file(&path));
        }
        Ok(bytes)
    }

    pub fn has(&self, fp: &Fingerprint) -> bool {
        self.object_path(fp).exists()
    }

    fn quarantine(&self, path: &Path, fp: &Fingerprint) {
        let quarantine_dir = self.root.join("quarantine");
        if let Err(e) = fs::create_dir_all(&quarantine_dir) {
            warn!(error = %e, "failed to create quarantine directory, leaving corrupt object in place");
            return;
        }
        let dest = quarantine_dir.join(fp.to_hex());
        if let Err(e) = fs::rename(path, &dest) {
            warn!(error = %e, path = %path.display(), "failed to quarantine corrupt object");
        }
    }

    /// Removes every object whose fingerprint is not in `retain`. Returns
    /// the number of objects removed. Directory structure (the two-char hex
    /// prefix dirs) is left in place even when emptied.
    #[instrument(level = "debug", skip(self, retain))]
    pub fn garbage_collect(&self, retain: &std::collections::HashSet<Fingerprint>) -> BuildResult<usize> {
        let mut removed = 0usize;
        let entries = fs::read_dir(&self.root)
            .map_err(|e| BuildError::io("IO_READ_FAILED", &e, &self.root).wrap("scanning content store"))?;
        for prefix_entry in entries {
            let prefix_entry = prefix_entry.map_err(|e| BuildError::io("IO_READ_FAILED", &e, &self.root))?;
            let prefix_path = prefix_entry.path();
            if !prefix_path.is_dir() || prefix_path.file_name().and_then(|n| n.to_str()) == Some("quarantine") {
                continue;
            }
            for object_entry in fs::read_dir(&prefix_path)
                .map_err(|e| BuildError::io("IO_READ_FAILED", &e, &prefix_path))?
            {
                let object_entry = object_entry.map_err(|e| BuildError::io("IO_READ_FAILED", &e, &prefix_path))?;
                let object_path = object_entry.path();
                let Some(name) = object_path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let Ok(fp) = Fingerprint::from_hex(name) else {
                    continue;
                };
                if !retain.contains(&fp) {
                    fs::remove_file(&object_path)
                        .map_err(|e| BuildError::io("IO_WRITE_FAILED", &e, &object_path).wrap("garbage collecting object"))?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let fp = store.store(b"hello world").unwrap();
        assert!(store.has(&fp));
        assert_eq!(store.load(&fp).unwrap(), b"hello world");
    }

    #[test]
    fn missing_object_is_cache_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let fp = Fingerprint::of_bytes(b"never stored");
        let err = store.load(&fp).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cache);
    }

    #[test]
    fn corrupted_object_is_quarantined_not_served() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let fp = store.store(b"original").unwrap();
        let path = store.object_path(&fp);
        fs::write(&path, b"tampered").unwrap();

        let err = store.load(&fp).unwrap_err();
        assert_eq!(err.code, "CACHE_INTEGRITY_MISMATCH");
        assert!(!path.exists());
        assert!(dir.path().join("quarantine").join(fp.to_hex()).exists());
    }

    #[test]
    fn garbage_collect_removes_unreferenced_objects() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let keep = store.store(b"keep me").unwrap();
        let drop = store.store(b"drop me").unwrap();

        let mut retain = std::collections::HashSet::new();
        retain.insert(keep);
        let removed = store.garbage_collect(&retain).unwrap();

        assert_eq!(removed, 1);
        assert!(store.has(&keep));
        assert!(!store.has(&drop));
    }

    #[test]
    fn storing_duplicate_content_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let fp1 = store.store(b"same bytes").unwrap();
        let fp2 = store.store(b"same bytes").unwrap();
        assert_eq!(fp1, fp2);
    }
}
