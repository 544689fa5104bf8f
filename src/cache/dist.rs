use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CacheStats, PutStatus, Store};
use crate::config::{Codec, DistCacheOptions};
use crate::core::{Hash32, unix_now};
use crate::error::{CacheError, RemoteError};

/// Opaque key to blob store with expiry, the boundary of the distributed
/// tier.
pub trait RemoteStore: Send + Sync {
    fn probe(&self, key: &str) -> Result<bool, RemoteError>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError>;
    fn put(&self, key: &str, data: &[u8], ttl: Option<Duration>) -> Result<(), RemoteError>;
    /// Refresh the recency of an entry.
    fn touch(&self, key: &str) -> Result<(), RemoteError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ArchivedFile {
    path: String,
    mode: u32,
    len: u64,
    link: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ArchiveHeader {
    files: Vec<ArchivedFile>,
}

const TAG_NONE: u8 = 0;
const TAG_ZSTD: u8 = 1;

/// Packs files into `[codec tag][encoded: header length, CBOR header, file bytes]`.
fn pack(root: &Utf8Path, files: &[Utf8PathBuf], codec: Codec) -> Result<Vec<u8>, CacheError> {
    let mut header = ArchiveHeader { files: Vec::new() };
    let mut body = Vec::new();

    for rel in files {
        let src = root.join(rel);
        let meta = fs::symlink_metadata(&src)?;
        if meta.file_type().is_symlink() {
            let target = fs::read_link(&src)?;
            header.files.push(ArchivedFile {
                path: rel.to_string(),
                mode: 0,
                len: 0,
                link: Some(target.to_string_lossy().into_owned()),
            });
            continue;
        }

        let data = fs::read(&src)?;
        header.files.push(ArchivedFile {
            path: rel.to_string(),
            mode: file_mode(&meta),
            len: data.len() as u64,
            link: None,
        });
        body.extend_from_slice(&data);
    }

    let mut head = Vec::new();
    ciborium::into_writer(&header, &mut head)?;

    let mut plain = Vec::with_capacity(8 + head.len() + body.len());
    plain.extend_from_slice(&(head.len() as u64).to_le_bytes());
    plain.extend_from_slice(&head);
    plain.extend_from_slice(&body);

    let tag = match codec {
        Codec::None => TAG_NONE,
        Codec::Zstd(_) => TAG_ZSTD,
    };
    let mut payload = vec![tag];
    payload.extend_from_slice(&codec.encode(&plain)?);
    Ok(payload)
}

fn unpack(key: &str, payload: &[u8], into: &Utf8Path) -> Result<u64, CacheError> {
    let corrupt = |reason: &str| CacheError::Corrupt {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    let (&tag, rest) = payload.split_first().ok_or_else(|| corrupt("empty payload"))?;
    let plain = match tag {
        TAG_NONE => Codec::None.decode(rest)?,
        TAG_ZSTD => Codec::Zstd(0).decode(rest)?,
        _ => return Err(corrupt("unknown codec")),
    };

    let mut cursor = Cursor::new(plain.as_slice());
    let mut len = [0u8; 8];
    cursor
        .read_exact(&mut len)
        .map_err(|_| corrupt("truncated header length"))?;
    let head_len = u64::from_le_bytes(len) as usize;
    let head_end = 8usize
        .checked_add(head_len)
        .filter(|&end| end <= plain.len())
        .ok_or_else(|| corrupt("truncated header"))?;
    let header: ArchiveHeader = ciborium::from_reader(&plain[8..head_end])?;

    let mut offset = head_end;
    let mut written: Vec<Utf8PathBuf> = Vec::new();
    let result = (|| -> Result<u64, CacheError> {
        for file in &header.files {
            let dst = into.join(&file.path);
            if let Some(dir) = dst.parent() {
                fs::create_dir_all(dir)?;
            }
            if fs::symlink_metadata(&dst).is_ok() {
                fs::remove_file(&dst)?;
            }

            if let Some(target) = &file.link {
                symlink(target, &dst)?;
                written.push(dst);
                continue;
            }

            let end = offset
                .checked_add(file.len as usize)
                .filter(|&end| end <= plain.len())
                .ok_or_else(|| corrupt("truncated body"))?;
            fs::write(&dst, &plain[offset..end])?;
            written.push(dst.clone());
            set_mode(&dst, file.mode)?;
            offset = end;
        }
        Ok((offset - head_end) as u64)
    })();

    if result.is_err() {
        for path in written {
            let _ = fs::remove_file(path);
        }
    }
    result
}

/// The distributed tier: a [`RemoteStore`] plus codec, retry and time
/// budgets, and the upload filters.
pub struct DistCache {
    remote: Arc<dyn RemoteStore>,
    options: DistCacheOptions,
    stats: CacheStats,
}

impl std::fmt::Debug for DistCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistCache")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl DistCache {
    pub fn new(remote: Arc<dyn RemoteStore>, options: DistCacheOptions) -> Self {
        Self {
            remote,
            options,
            stats: CacheStats::default(),
        }
    }

    pub fn options(&self) -> &DistCacheOptions {
        &self.options
    }

    pub fn is_writable(&self) -> bool {
        !self.options.readonly
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Runs `f` against the remote with the retry and per-call time budget.
    fn call<T, F>(
        &self,
        op: &'static str,
        size: impl Fn(&T) -> u64,
        f: F,
    ) -> Result<T, RemoteError>
    where
        T: Send + 'static,
        F: Fn(&dyn RemoteStore) -> Result<T, RemoteError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let attempts = self.options.retries + 1;
        let mut last = RemoteError::Unavailable("no attempts made".into());

        for attempt in 0..attempts {
            let start = Instant::now();
            match self.attempt(op, start, Arc::clone(&f)) {
                Ok(value) => {
                    self.stats.record(op, true, size(&value), start.elapsed());
                    return Ok(value);
                }
                Err(e) => {
                    self.stats.record(op, false, 0, start.elapsed());
                    warn!(op, attempt, "distributed cache call failed: {e}");
                    last = e;
                    if attempt + 1 < attempts {
                        thread::sleep(Duration::from_millis(10 << attempt.min(6)));
                    }
                }
            }
        }

        Err(last)
    }

    /// A single call. With a budget the call runs on its own thread and is
    /// abandoned once the budget runs out.
    fn attempt<T, F>(
        &self,
        op: &'static str,
        start: Instant,
        f: Arc<F>,
    ) -> Result<T, RemoteError>
    where
        T: Send + 'static,
        F: Fn(&dyn RemoteStore) -> Result<T, RemoteError> + Send + Sync + 'static,
    {
        let Some(budget) = self.options.call_timeout() else {
            return (*f)(self.remote.as_ref());
        };

        let (tx, rx) = mpsc::channel();
        let remote = Arc::clone(&self.remote);
        thread::Builder::new()
            .name(format!("dist-{op}"))
            .spawn(move || {
                let _ = tx.send((*f)(remote.as_ref()));
            })?;

        match rx.recv_timeout(budget) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(RemoteError::Timeout {
                op,
                elapsed: start.elapsed(),
            }),
            Err(RecvTimeoutError::Disconnected) => Err(RemoteError::Unavailable(format!(
                "remote call '{op}' ended without a result"
            ))),
        }
    }
}

impl Store for DistCache {
    fn probe(&self, key: &str) -> Result<bool, CacheError> {
        let owned = key.to_string();
        let found = self.call("has", |_| 0, move |remote| remote.probe(&owned))?;
        self.stats.lookup(found);
        Ok(found)
    }

    fn restore(&self, key: &str, into: &Utf8Path) -> Result<bool, CacheError> {
        let owned = key.to_string();
        let payload = self.call(
            "get",
            |p: &Option<Vec<u8>>| p.as_ref().map_or(0, |p| p.len() as u64),
            move |remote| remote.get(&owned),
        )?;

        let Some(payload) = payload else {
            self.stats.lookup(false);
            return Ok(false);
        };

        let bytes = unpack(key, &payload, into)?;
        self.stats.lookup(true);
        debug!(key, bytes, "restored from distributed cache");

        let owned = key.to_string();
        if self.options.simulate_lru
            && let Err(e) = self.call("touch", |_| 0, move |remote| remote.touch(&owned))
        {
            debug!(key, "couldn't refresh remote entry: {e}");
        }

        Ok(true)
    }

    fn put(
        &self,
        key: &str,
        root: &Utf8Path,
        files: &[Utf8PathBuf],
    ) -> Result<PutStatus, CacheError> {
        if self.options.readonly {
            return Ok(PutStatus::Skipped("readonly"));
        }

        let payload = pack(root, files, self.options.codec)?;
        let size = payload.len() as u64;

        if let Some(max) = self.options.max_file_size
            && size > max
        {
            debug!(key, size, max, "payload too large for distributed cache");
            return Ok(PutStatus::Skipped("too large"));
        }

        let owned = key.to_string();
        if let Some(min) = self.options.probe_before_put_min_size
            && size >= min
        {
            let key = owned.clone();
            if self.call("probe-before-put", |_| 0, move |remote| remote.probe(&key))? {
                return Ok(PutStatus::Skipped("present"));
            }
        }

        let ttl = self.options.ttl();
        let payload = Arc::new(payload);
        self.call("put", |_| size, move |remote| remote.put(&owned, &payload, ttl))?;
        Ok(PutStatus::Stored)
    }
}

/// In-process remote store.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    entries: Mutex<HashMap<String, (Vec<u8>, Option<Instant>)>>,
    failing: AtomicBool,
    puts: AtomicUsize,
    gets: AtomicUsize,
    touches: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn touches(&self) -> usize {
        self.touches.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), RemoteError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("memory remote set to fail".into()));
        }
        Ok(())
    }

    fn live(&self, key: &str) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let expired = match entries.get(key) {
            Some((_, Some(expiry))) => Instant::now() >= *expiry,
            Some((_, None)) => false,
            None => return None,
        };
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|(data, _)| data.clone())
    }
}

impl RemoteStore for MemoryRemote {
    fn probe(&self, key: &str) -> Result<bool, RemoteError> {
        self.check()?;
        Ok(self.live(key).is_some())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        self.check()?;
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(self.live(key))
    }

    fn put(&self, key: &str, data: &[u8], ttl: Option<Duration>) -> Result<(), RemoteError> {
        self.check()?;
        self.puts.fetch_add(1, Ordering::SeqCst);
        let expiry = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), (data.to_vec(), expiry));
        Ok(())
    }

    fn touch(&self, key: &str) -> Result<(), RemoteError> {
        self.check()?;
        self.touches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Remote store kept in a directory, e.g. on a network mount.
///
/// Each key maps to `<hash>.blob` with an optional `<hash>.expires` file
/// holding the unix expiry time. When `max_size` is set, puts evict the
/// least recently touched blobs until the store fits.
#[derive(Debug)]
pub struct DirRemote {
    root: Utf8PathBuf,
    max_size: Option<u64>,
    lock: Mutex<()>,
}

impl DirRemote {
    pub fn open(root: impl Into<Utf8PathBuf>, max_size: Option<u64>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            max_size,
            lock: Mutex::new(()),
        })
    }

    fn paths(&self, key: &str) -> (Utf8PathBuf, Utf8PathBuf) {
        let hex = Hash32::hash(key).to_hex();
        (
            self.root.join(format!("{hex}.blob")),
            self.root.join(format!("{hex}.expires")),
        )
    }

    fn expired(&self, expires: &Utf8Path) -> bool {
        fs::read_to_string(expires)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .is_some_and(|at| unix_now() >= at)
    }

    fn live_blob(&self, key: &str) -> Option<Utf8PathBuf> {
        let (blob, expires) = self.paths(key);
        if !blob.is_file() {
            return None;
        }
        if self.expired(&expires) {
            let _ = fs::remove_file(&blob);
            let _ = fs::remove_file(&expires);
            return None;
        }
        Some(blob)
    }

    fn evict(&self) -> io::Result<()> {
        let Some(max) = self.max_size else {
            return Ok(());
        };

        let mut blobs = Vec::new();
        let mut total = 0;
        for entry in self.root.read_dir_utf8()? {
            let entry = entry?;
            if entry.path().extension() != Some("blob") {
                continue;
            }
            let meta = entry.metadata()?;
            total += meta.len();
            blobs.push((meta.modified()?, meta.len(), entry.path().to_owned()));
        }

        blobs.sort_by_key(|(mtime, _, _)| *mtime);
        for (_, len, path) in blobs {
            if total <= max {
                break;
            }
            fs::remove_file(&path)?;
            let _ = fs::remove_file(path.with_extension("expires"));
            total -= len;
        }
        Ok(())
    }
}

impl RemoteStore for DirRemote {
    fn probe(&self, key: &str) -> Result<bool, RemoteError> {
        Ok(self.live_blob(key).is_some())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        match self.live_blob(key) {
            Some(blob) => Ok(Some(fs::read(blob)?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, data: &[u8], ttl: Option<Duration>) -> Result<(), RemoteError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let (blob, expires) = self.paths(key);
        let tmp = blob.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &blob)?;
        match ttl {
            Some(ttl) => fs::write(&expires, (unix_now() + ttl.as_secs()).to_string())?,
            None => {
                let _ = fs::remove_file(&expires);
            }
        }
        self.evict()?;
        Ok(())
    }

    fn touch(&self, key: &str) -> Result<(), RemoteError> {
        let (blob, _) = self.paths(key);
        File::options()
            .write(true)
            .open(blob)?
            .set_modified(SystemTime::now())?;
        Ok(())
    }
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

    fn write(root: &Utf8Path, rel: &str, data: &[u8]) -> Utf8PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, data).unwrap();
        Utf8PathBuf::from(rel)
    }

    fn writable() -> DistCacheOptions {
        DistCacheOptions {
            readonly: false,
            retries: 0,
            ..DistCacheOptions::default()
        }
    }

    #[test]
    fn round_trip_through_memory_remote() {
        let (_dir, base) = tmp();
        let remote = Arc::new(MemoryRemote::new());
        let cache = DistCache::new(remote.clone(), writable());
        let src = base.join("src");
        let files = vec![
            write(&src, "out/a.txt", b"hello"),
            write(&src, "out/b.bin", &[0u8, 1, 2, 3]),
        ];

        assert!(!cache.probe("k").unwrap());
        assert_eq!(cache.put("k", &src, &files).unwrap(), PutStatus::Stored);
        assert!(cache.probe("k").unwrap());

        let dst = base.join("dst");
        assert!(cache.restore("k", &dst).unwrap());
        assert_eq!(fs::read(dst.join("out/a.txt")).unwrap(), b"hello");
        assert_eq!(fs::read(dst.join("out/b.bin")).unwrap(), [0u8, 1, 2, 3]);
        assert_eq!(cache.stats().hits().found, 2);
    }

    #[test]
    fn put_filters() {
        let (_dir, base) = tmp();
        let src = base.join("src");
        let files = vec![write(&src, "a", &[7u8; 4096])];

        let readonly = DistCache::new(Arc::new(MemoryRemote::new()), DistCacheOptions::default());
        assert_eq!(
            readonly.put("k", &src, &files).unwrap(),
            PutStatus::Skipped("readonly")
        );

        let limited = DistCache::new(
            Arc::new(MemoryRemote::new()),
            DistCacheOptions {
                max_file_size: Some(16),
                codec: Codec::None,
                ..writable()
            },
        );
        assert_eq!(
            limited.put("k", &src, &files).unwrap(),
            PutStatus::Skipped("too large")
        );

        let remote = Arc::new(MemoryRemote::new());
        let probing = DistCache::new(
            remote.clone(),
            DistCacheOptions {
                probe_before_put_min_size: Some(1),
                ..writable()
            },
        );
        assert_eq!(probing.put("k", &src, &files).unwrap(), PutStatus::Stored);
        assert_eq!(
            probing.put("k", &src, &files).unwrap(),
            PutStatus::Skipped("present")
        );
        assert_eq!(remote.puts(), 1);
    }

    #[test]
    fn retries_then_fails() {
        let remote = Arc::new(MemoryRemote::new());
        remote.set_failing(true);
        let cache = DistCache::new(
            remote,
            DistCacheOptions {
                retries: 2,
                ..writable()
            },
        );
        let err = cache.probe("k").unwrap_err();
        assert!(matches!(err, CacheError::Remote(RemoteError::Unavailable(_))));
        let has = cache.stats().ops()["has"];
        assert_eq!(has.count, 3);
        assert_eq!(has.failures, 3);
    }

    struct StalledRemote(Duration);

    impl RemoteStore for StalledRemote {
        fn probe(&self, _: &str) -> Result<bool, RemoteError> {
            thread::sleep(self.0);
            Ok(true)
        }

        fn get(&self, _: &str) -> Result<Option<Vec<u8>>, RemoteError> {
            thread::sleep(self.0);
            Ok(None)
        }

        fn put(&self, _: &str, _: &[u8], _: Option<Duration>) -> Result<(), RemoteError> {
            thread::sleep(self.0);
            Ok(())
        }

        fn touch(&self, _: &str) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    #[test]
    fn stalled_call_gives_up_at_budget() {
        let cache = DistCache::new(
            Arc::new(StalledRemote(Duration::from_secs(5))),
            DistCacheOptions {
                retries: 1,
                call_timeout_ms: Some(50),
                ..writable()
            },
        );

        let start = Instant::now();
        let err = cache.restore("k", Utf8Path::new("unused")).unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(matches!(
            err,
            CacheError::Remote(RemoteError::Timeout { op: "get", .. })
        ));
        let get = cache.stats().ops()["get"];
        assert_eq!(get.count, 2);
        assert_eq!(get.failures, 2);
    }

    #[test]
    fn call_within_budget_succeeds() {
        let cache = DistCache::new(
            Arc::new(StalledRemote(Duration::from_millis(5))),
            DistCacheOptions {
                call_timeout_ms: Some(2_000),
                ..writable()
            },
        );
        assert!(cache.probe("k").unwrap());
    }

    #[test]
    fn simulate_lru_touches_on_hit() {
        let (_dir, base) = tmp();
        let remote = Arc::new(MemoryRemote::new());
        let cache = DistCache::new(
            remote.clone(),
            DistCacheOptions {
                simulate_lru: true,
                ..writable()
            },
        );
        let src = base.join("src");
        let files = vec![write(&src, "a", b"a")];
        cache.put("k", &src, &files).unwrap();
        cache.restore("k", &base.join("dst")).unwrap();
        assert_eq!(remote.touches(), 1);
    }

    #[test]
    fn dir_remote_expires_and_evicts() {
        let (_dir, base) = tmp();
        let remote = DirRemote::open(base.join("remote"), Some(8)).unwrap();

        remote.put("gone", b"x", Some(Duration::ZERO)).unwrap();
        assert!(!remote.probe("gone").unwrap());

        remote.put("first", b"12345", None).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        remote.put("second", b"67890", None).unwrap();
        assert!(!remote.probe("first").unwrap());
        assert_eq!(remote.get("second").unwrap().as_deref(), Some(&b"67890"[..]));
    }

    #[test]
    fn corrupt_payload_is_reported() {
        let (_dir, base) = tmp();
        let remote = Arc::new(MemoryRemote::new());
        remote.put("k", &[TAG_NONE, 1, 2], None).unwrap();
        let cache = DistCache::new(remote, writable());
        let err = cache.restore("k", &base.join("dst")).unwrap_err();
        assert!(matches!(err, CacheError::Corrupt { .. }));
    }
}
