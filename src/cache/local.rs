use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{CacheStats, PutStatus, Store};
use crate::config::Codec;
use crate::core::{Hash32, unix_now};
use crate::error::CacheError;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileRecord {
    /// Digest of the stored (encoded) bytes, names the blob.
    hash: Hash32,
    /// Size of the stored blob.
    size: u64,
    mode: u32,
    codec: Codec,
    /// Target for symlinks; these have no blob.
    link: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    key: String,
    stamp: u64,
    files: BTreeMap<String, FileRecord>,
}

impl Entry {
    fn size(&self) -> u64 {
        self.files.values().map(|f| f.size).sum()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactReport {
    pub removed_entries: usize,
    pub removed_blobs: usize,
    /// Bytes held by blobs after compaction.
    pub size: u64,
}

/// Disk-resident, content-addressed artifact cache.
///
/// ```text
/// <root>/blobs/<xx>/<hash>          encoded file contents
/// <root>/entries/<xx>/<hash>.cbor   key -> files metadata; mtime is the LRU stamp
/// <root>/tray/                      temporaries renamed into place
/// ```
#[derive(Debug)]
pub struct LocalCache {
    root: Utf8PathBuf,
    codec: Codec,
    tray_seq: AtomicU64,
    stats: CacheStats,
}

impl LocalCache {
    pub fn open(root: impl Into<Utf8PathBuf>, codec: Codec) -> Result<Self, CacheError> {
        let root = root.into();
        for dir in ["blobs", "entries", "tray"] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self {
            root,
            codec,
            tray_seq: AtomicU64::new(0),
            stats: CacheStats::default(),
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    fn entry_path(&self, key: &str) -> Utf8PathBuf {
        let hash = Hash32::hash(key);
        self.root
            .join("entries")
            .join(hash.shard())
            .join(format!("{}.cbor", hash.to_hex()))
    }

    fn blob_path(&self, hash: Hash32) -> Utf8PathBuf {
        self.root
            .join("blobs")
            .join(hash.shard())
            .join(hash.to_hex())
    }

    fn tray_path(&self) -> Utf8PathBuf {
        let seq = self.tray_seq.fetch_add(1, Ordering::SeqCst);
        self.root
            .join("tray")
            .join(format!("{}-{seq}", std::process::id()))
    }

    /// Write `data` to `dst` through the tray so readers never see a partial
    /// file.
    fn write_atomic(&self, dst: &Utf8Path, data: &[u8]) -> io::Result<()> {
        if let Some(dir) = dst.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.tray_path();
        fs::write(&tmp, data)?;
        fs::rename(&tmp, dst)
    }

    fn read_entry(&self, path: &Utf8Path) -> Result<Option<Entry>, CacheError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(ciborium::from_reader(BufReader::new(file))?))
    }

    fn write_entry(&self, entry: &Entry) -> Result<(), CacheError> {
        let dst = self.entry_path(&entry.key);
        if let Some(dir) = dst.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.tray_path();
        {
            let file = File::create(&tmp)?;
            ciborium::into_writer(entry, BufWriter::new(file))?;
        }
        fs::rename(&tmp, &dst)?;
        Ok(())
    }

    fn touch(&self, path: &Utf8Path) {
        let result = File::options()
            .write(true)
            .open(path)
            .and_then(|f| f.set_modified(SystemTime::now()));
        if let Err(e) = result {
            debug!(path = %path, "couldn't refresh cache entry stamp: {e}");
        }
    }

    pub fn has(&self, key: &str) -> bool {
        let found = self.entry_path(key).is_file();
        self.stats.lookup(found);
        found
    }

    /// Forget a single key; blobs are collected on the next compaction.
    pub fn clear(&self, key: &str) -> Result<(), CacheError> {
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn restore_entry(&self, entry: &Entry, into: &Utf8Path) -> Result<u64, CacheError> {
        let mut restored: Vec<Utf8PathBuf> = Vec::with_capacity(entry.files.len());
        let result = (|| -> Result<u64, CacheError> {
            let mut bytes = 0;
            for (rel, record) in &entry.files {
                let dst = into.join(rel);
                if let Some(dir) = dst.parent() {
                    fs::create_dir_all(dir)?;
                }
                if fs::symlink_metadata(&dst).is_ok() {
                    fs::remove_file(&dst)?;
                }

                if let Some(target) = &record.link {
                    symlink(target, &dst)?;
                    restored.push(dst);
                    continue;
                }

                let blob = self.blob_path(record.hash);
                let stored = fs::read(&blob).map_err(|e| CacheError::Corrupt {
                    key: entry.key.clone(),
                    reason: format!("blob for '{rel}' unreadable: {e}"),
                })?;
                if stored.len() as u64 != record.size {
                    return Err(CacheError::Corrupt {
                        key: entry.key.clone(),
                        reason: format!(
                            "blob for '{rel}' has {} bytes, expected {}",
                            stored.len(),
                            record.size
                        ),
                    });
                }

                let data = record.codec.decode(&stored)?;
                fs::write(&dst, &data)?;
                restored.push(dst.clone());
                set_mode(&dst, record.mode)?;
                bytes += data.len() as u64;
            }
            Ok(bytes)
        })();

        if result.is_err() {
            for path in restored {
                let _ = fs::remove_file(path);
            }
        }
        result
    }

    /// Evicts entries unused for longer than `ttl`, then least recently used
    /// ones until the cache fits in `max_size`, then unreferenced blobs.
    pub fn compact(
        &self,
        ttl: Option<Duration>,
        max_size: Option<u64>,
    ) -> Result<CompactReport, CacheError> {
        let start = Instant::now();
        let mut entries = self.list_entries()?;
        entries.sort_by_key(|(_, _, mtime)| *mtime);

        let now = SystemTime::now();
        let mut removed_entries = 0;
        let mut kept = Vec::with_capacity(entries.len());
        for (path, entry, mtime) in entries {
            let expired = ttl.is_some_and(|ttl| {
                now.duration_since(mtime)
                    .map(|age| age > ttl)
                    .unwrap_or(false)
            });
            if expired {
                fs::remove_file(&path)?;
                removed_entries += 1;
            } else {
                kept.push((path, entry));
            }
        }

        if let Some(max_size) = max_size {
            let mut total: u64 = kept.iter().map(|(_, e)| e.size()).sum();
            let mut survivors = Vec::with_capacity(kept.len());
            for (path, entry) in kept {
                if total > max_size {
                    total -= entry.size();
                    fs::remove_file(&path)?;
                    removed_entries += 1;
                } else {
                    survivors.push((path, entry));
                }
            }
            kept = survivors;
        }

        let report = self.collect_blobs(&kept, removed_entries)?;
        self.stats.record("compact", true, 0, start.elapsed());
        info!(
            removed_entries = report.removed_entries,
            removed_blobs = report.removed_blobs,
            size = report.size,
            "compacted local cache"
        );
        Ok(report)
    }

    /// Removes every entry whose key is not in `retain`.
    pub fn strip(&self, retain: &HashSet<String>) -> Result<CompactReport, CacheError> {
        let mut removed_entries = 0;
        let mut kept = Vec::new();
        for (path, entry, _) in self.list_entries()? {
            if retain.contains(&entry.key) {
                kept.push((path, entry));
            } else {
                fs::remove_file(&path)?;
                removed_entries += 1;
            }
        }
        self.collect_blobs(&kept, removed_entries)
    }

    /// Bytes held by blobs.
    pub fn size(&self) -> Result<u64, CacheError> {
        let mut size = 0;
        for path in shard_files(&self.root.join("blobs"))? {
            size += fs::metadata(&path)?.len();
        }
        Ok(size)
    }

    fn list_entries(&self) -> Result<Vec<(Utf8PathBuf, Entry, SystemTime)>, CacheError> {
        let mut out = Vec::new();
        for path in shard_files(&self.root.join("entries"))? {
            let mtime = fs::metadata(&path)?.modified()?;
            match self.read_entry(&path) {
                Ok(Some(entry)) => out.push((path, entry, mtime)),
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path, "dropping unreadable cache entry: {e}");
                    let _ = fs::remove_file(&path);
                }
            }
        }
        Ok(out)
    }

    fn collect_blobs(
        &self,
        kept: &[(Utf8PathBuf, Entry)],
        removed_entries: usize,
    ) -> Result<CompactReport, CacheError> {
        let referenced: HashSet<String> = kept
            .iter()
            .flat_map(|(_, e)| e.files.values())
            .filter(|f| f.link.is_none())
            .map(|f| f.hash.to_hex())
            .collect();

        let mut removed_blobs = 0;
        let mut size = 0;
        for path in shard_files(&self.root.join("blobs"))? {
            let referenced = path
                .file_name()
                .is_some_and(|name| referenced.contains(name));
            if referenced {
                size += fs::metadata(&path)?.len();
            } else {
                fs::remove_file(&path)?;
                removed_blobs += 1;
            }
        }

        Ok(CompactReport {
            removed_entries,
            removed_blobs,
            size,
        })
    }
}

impl Store for LocalCache {
    fn probe(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.has(key))
    }

    fn restore(&self, key: &str, into: &Utf8Path) -> Result<bool, CacheError> {
        let start = Instant::now();
        let path = self.entry_path(key);
        let Some(entry) = self.read_entry(&path)? else {
            self.stats.record("get", true, 0, start.elapsed());
            return Ok(false);
        };

        match self.restore_entry(&entry, into) {
            Ok(bytes) => {
                self.touch(&path);
                self.stats.record("get", true, bytes, start.elapsed());
                debug!(key, bytes, "restored from local cache");
                Ok(true)
            }
            Err(e) => {
                self.stats.record("get", false, 0, start.elapsed());
                if matches!(e, CacheError::Corrupt { .. }) {
                    let _ = fs::remove_file(&path);
                }
                Err(e)
            }
        }
    }

    fn put(
        &self,
        key: &str,
        root: &Utf8Path,
        files: &[Utf8PathBuf],
    ) -> Result<PutStatus, CacheError> {
        let start = Instant::now();
        let mut records = BTreeMap::new();
        let mut bytes = 0;

        for rel in files {
            let src = root.join(rel);
            let meta = fs::symlink_metadata(&src)?;

            if meta.file_type().is_symlink() {
                let target = fs::read_link(&src)?;
                records.insert(
                    rel.to_string(),
                    FileRecord {
                        hash: Hash32::default(),
                        size: 0,
                        mode: 0,
                        codec: Codec::None,
                        link: Some(target.to_string_lossy().into_owned()),
                    },
                );
                continue;
            }

            let data = fs::read(&src)?;
            let stored = self.codec.encode(&data)?;
            let hash = Hash32::hash(&stored);
            let blob = self.blob_path(hash);
            if !blob.exists() {
                self.write_atomic(&blob, &stored)?;
            }
            bytes += data.len() as u64;

            records.insert(
                rel.to_string(),
                FileRecord {
                    hash,
                    size: stored.len() as u64,
                    mode: file_mode(&meta),
                    codec: self.codec,
                    link: None,
                },
            );
        }

        self.write_entry(&Entry {
            key: key.to_string(),
            stamp: unix_now(),
            files: records,
        })?;

        self.stats.record("put", true, bytes, start.elapsed());
        debug!(key, bytes, "stored in local cache");
        Ok(PutStatus::Stored)
    }
}

fn shard_files(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, CacheError> {
    let mut out = Vec::new();
    let pattern = format!("{}/*/*", glob::Pattern::escape(dir.as_str()));
    let paths = glob::glob(&pattern).map_err(|e| io::Error::other(e.to_string()))?;
    for path in paths {
        let path = path.map_err(|e| io::Error::other(e.to_string()))?;
        if let Ok(path) = Utf8PathBuf::try_from(path)
            && path.is_file()
        {
            out.push(path);
        }
    }
    Ok(out)
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(_: &fs::Metadata) -> u32 {
    0
}

#[cfg(unix)]
fn set_mode(path: &Utf8Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode == 0 {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_: &Utf8Path, _: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn symlink(target: &str, link: &Utf8Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(target: &str, link: &Utf8Path) -> io::Result<()> {
    let source = link.parent().map(|p| p.join(target)).unwrap_or_else(|| target.into());
    fs::copy(source, link).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    fn artifact(root: &Utf8Path, files: &[(&str, &[u8])]) -> Vec<Utf8PathBuf> {
        files
            .iter()
            .map(|(rel, data)| {
                let path = root.join(rel);
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(&path, data).unwrap();
                Utf8PathBuf::from(*rel)
            })
            .collect()
    }

    #[test]
    fn put_then_restore_is_byte_identical() {
        for codec in [Codec::None, Codec::Zstd(3)] {
            let (_dir, base) = tmp();
            let cache = LocalCache::open(base.join("cache"), codec).unwrap();
            let src = base.join("src");
            let files = artifact(&src, &[("bin/tool", b"\x7fELF tool"), ("lib/a.a", b"archive")]);

            assert!(!cache.has("uid-1"));
            assert_eq!(cache.put("uid-1", &src, &files).unwrap(), PutStatus::Stored);
            assert!(cache.has("uid-1"));

            let dst = base.join("dst");
            assert!(cache.restore("uid-1", &dst).unwrap());
            assert_eq!(fs::read(dst.join("bin/tool")).unwrap(), b"\x7fELF tool");
            assert_eq!(fs::read(dst.join("lib/a.a")).unwrap(), b"archive");
            assert!(!cache.restore("missing", &dst).unwrap());
        }
    }

    #[cfg(unix)]
    #[test]
    fn keeps_modes_and_symlinks() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, base) = tmp();
        let cache = LocalCache::open(base.join("cache"), Codec::None).unwrap();
        let src = base.join("src");
        let mut files = artifact(&src, &[("bin/run", b"#!/bin/sh")]);
        fs::set_permissions(src.join("bin/run"), fs::Permissions::from_mode(0o755)).unwrap();
        std::os::unix::fs::symlink("run", src.join("bin/alias")).unwrap();
        files.push("bin/alias".into());

        cache.put("k", &src, &files).unwrap();
        let dst = base.join("dst");
        cache.restore("k", &dst).unwrap();

        let mode = fs::metadata(dst.join("bin/run")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(fs::read_link(dst.join("bin/alias")).unwrap().to_str(), Some("run"));
    }

    #[test]
    fn identical_files_share_a_blob() {
        let (_dir, base) = tmp();
        let cache = LocalCache::open(base.join("cache"), Codec::None).unwrap();
        let src = base.join("src");
        let files = artifact(&src, &[("a", b"same"), ("b", b"same")]);
        cache.put("k", &src, &files).unwrap();
        assert_eq!(cache.size().unwrap(), 4);
    }

    #[test]
    fn corrupt_blob_rolls_back_and_forgets_entry() {
        let (_dir, base) = tmp();
        let cache = LocalCache::open(base.join("cache"), Codec::None).unwrap();
        let src = base.join("src");
        let files = artifact(&src, &[("a", b"aaaa"), ("b", b"bbbb")]);
        cache.put("k", &src, &files).unwrap();

        let blob = cache.blob_path(Hash32::hash(b"bbbb"));
        fs::write(&blob, b"short").unwrap();

        let dst = base.join("dst");
        let err = cache.restore("k", &dst).unwrap_err();
        assert!(matches!(err, CacheError::Corrupt { .. }));
        assert!(!dst.join("a").exists());
        assert!(!cache.has("k"));
    }

    #[test]
    fn compact_evicts_lru_and_collects_blobs() {
        let (_dir, base) = tmp();
        let cache = LocalCache::open(base.join("cache"), Codec::None).unwrap();
        let src = base.join("src");

        let old = artifact(&src, &[("old", b"0123456789")]);
        cache.put("old", &src, &old).unwrap();
        let old_entry = cache.entry_path("old");
        File::options()
            .write(true)
            .open(&old_entry)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();

        let new = artifact(&src, &[("new", b"abcdefghij")]);
        cache.put("new", &src, &new).unwrap();

        let report = cache.compact(None, Some(15)).unwrap();
        assert_eq!(report.removed_entries, 1);
        assert_eq!(report.removed_blobs, 1);
        assert_eq!(report.size, 10);
        assert!(!cache.has("old"));
        assert!(cache.has("new"));

        std::thread::sleep(Duration::from_millis(20));
        let report = cache.compact(Some(Duration::ZERO), None).unwrap();
        assert_eq!(report.removed_entries, 1);
        assert_eq!(cache.size().unwrap(), 0);
    }

    #[test]
    fn strip_retains_reachable_keys() {
        let (_dir, base) = tmp();
        let cache = LocalCache::open(base.join("cache"), Codec::None).unwrap();
        let src = base.join("src");
        let files = artifact(&src, &[("x", b"x")]);
        cache.put("keep", &src, &files).unwrap();
        cache.put("drop", &src, &artifact(&src, &[("y", b"y")])).unwrap();

        let retain: HashSet<String> = ["keep".to_string()].into_iter().collect();
        let report = cache.strip(&retain).unwrap();
        assert_eq!(report.removed_entries, 1);
        assert_eq!(report.removed_blobs, 1);
        assert!(cache.has("keep"));
        assert!(!cache.has("drop"));
    }
}
