use std::fs;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use tracing::{debug, trace, warn};

use crate::core::{Hash32, Hash32Builder, link_or_copy, unix_now};
use crate::error::BuildRootError;
use crate::graph::visible_path;

const STAMP: &str = "STAMP";

/// Allocates per-node build roots inside one run-scoped directory and keeps
/// track of how much disk space live roots take.
#[derive(Debug)]
pub struct BuildRootSet {
    path: Utf8PathBuf,
    next_id: AtomicUsize,
    keep: bool,
    limit_output_size: Option<u64>,
    limit_total_size: Option<u64>,
    usage: AtomicU64,
}

impl BuildRootSet {
    /// Creates a fresh set under `base`, removing sets left behind by runs
    /// older than `stale_ttl`.
    pub fn create(
        base: &Utf8Path,
        keep: bool,
        limit_output_size: Option<u64>,
        limit_total_size: Option<u64>,
        stale_ttl: Duration,
    ) -> Result<Arc<Self>, BuildRootError> {
        fs::create_dir_all(base)?;
        sieve_stale(base, stale_ttl);

        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let path = base.join(format!("{}-{:x}", std::process::id(), nanos));
        fs::create_dir_all(&path)?;
        fs::write(path.join(STAMP), unix_now().to_string())?;

        debug!(path = %path, "created build root set");

        Ok(Arc::new(Self {
            path,
            next_id: AtomicUsize::new(0),
            keep,
            limit_output_size,
            limit_total_size,
            usage: AtomicU64::new(0),
        }))
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Bytes of validated outputs in roots that are still alive.
    pub fn usage(&self) -> u64 {
        self.usage.load(Ordering::SeqCst)
    }

    /// Issues a new build root. Nothing is created on disk until
    /// [`BuildRoot::create`].
    pub fn new_root(
        self: &Arc<Self>,
        outputs: &[String],
        refcount: usize,
        dir_outputs: &[String],
        compute_hash: bool,
    ) -> Arc<BuildRoot> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let path = self.path.join(format!("{id:06x}"));
        let rel = |items: &[String]| -> Vec<Utf8PathBuf> {
            items
                .iter()
                .filter_map(|o| visible_path(o))
                .map(Utf8PathBuf::from)
                .collect()
        };

        Arc::new(BuildRoot {
            set: self.clone(),
            path,
            outputs: rel(outputs),
            dir_outputs: rel(dir_outputs),
            compute_hash,
            state: Mutex::new(RootState {
                refcount: refcount as i64,
                ..RootState::default()
            }),
        })
    }

    /// Removes the whole set unless temporaries are kept.
    pub fn cleanup(&self) {
        if self.keep {
            debug!(path = %self.path, "keeping build roots");
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.path) {
            warn!(path = %self.path, "couldn't remove build roots: {e}");
        }
    }

    fn charge(&self, bytes: u64) -> Result<(), BuildRootError> {
        let used = self.usage.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if let Some(limit) = self.limit_total_size
            && used > limit
        {
            self.usage.fetch_sub(bytes, Ordering::SeqCst);
            return Err(BuildRootError::TotalSizeExceeded { used, limit });
        }
        Ok(())
    }

    fn refund(&self, bytes: u64) {
        let _ = self
            .usage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |u| {
                Some(u.saturating_sub(bytes))
            });
    }
}

fn sieve_stale(base: &Utf8Path, ttl: Duration) {
    let Ok(entries) = base.read_dir_utf8() else {
        return;
    };
    for entry in entries.flatten() {
        let stamp = entry.path().join(STAMP);
        let age = fs::metadata(&stamp)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok());
        if let Some(age) = age
            && age > ttl
        {
            debug!(path = %entry.path(), "removing stale build root set");
            let _ = fs::remove_dir_all(entry.path());
        }
    }
}

#[derive(Debug, Default)]
struct RootState {
    refcount: i64,
    created: bool,
    released: bool,
    size: u64,
    files: Vec<Utf8PathBuf>,
    digest: Option<Hash32>,
}

/// An isolated working directory owned by exactly one node.
#[derive(Debug)]
pub struct BuildRoot {
    set: Arc<BuildRootSet>,
    path: Utf8PathBuf,
    /// Declared outputs relative to the root.
    outputs: Vec<Utf8PathBuf>,
    dir_outputs: Vec<Utf8PathBuf>,
    compute_hash: bool,
    state: Mutex<RootState>,
}

impl BuildRoot {
    fn state(&self) -> MutexGuard<'_, RootState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn tmp_dir(&self) -> Utf8PathBuf {
        self.path.join("tmp")
    }

    pub fn outputs(&self) -> &[Utf8PathBuf] {
        &self.outputs
    }

    pub fn refcount(&self) -> i64 {
        self.state().refcount
    }

    pub fn is_released(&self) -> bool {
        self.state().released
    }

    /// Creates the directory along with parents of every declared output.
    pub fn create(&self) -> Result<(), BuildRootError> {
        let mut state = self.state();
        if state.released {
            return Err(BuildRootError::Released(self.path.to_string()));
        }
        fs::create_dir_all(self.tmp_dir())?;
        for output in &self.outputs {
            if let Some(parent) = self.path.join(output).parent() {
                fs::create_dir_all(parent)?;
            }
        }
        for dir in &self.dir_outputs {
            fs::create_dir_all(self.path.join(dir))?;
        }
        state.created = true;
        Ok(())
    }

    /// Checks the outputs left by a command or a restore and charges their
    /// size against the limits.
    pub fn validate(&self) -> Result<(), BuildRootError> {
        let mut files: Vec<Utf8PathBuf> = Vec::new();
        let dir_set: std::collections::HashSet<&Utf8PathBuf> = self.dir_outputs.iter().collect();

        for output in &self.outputs {
            if dir_set.contains(output) {
                continue;
            }
            files.push(output.clone());
        }

        for dir in &self.dir_outputs {
            let base = self.path.join(dir);
            if !base.is_dir() {
                return Err(BuildRootError::MissingOutput(dir.to_string()));
            }
            let pattern = format!("{}/**/*", glob::Pattern::escape(base.as_str()));
            let entries = glob::glob(&pattern).map_err(|e| std::io::Error::other(e.to_string()))?;
            for entry in entries {
                let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
                let Ok(entry) = Utf8PathBuf::try_from(entry) else {
                    continue;
                };
                if entry.is_dir() {
                    continue;
                }
                if let Ok(rel) = entry.strip_prefix(&self.path) {
                    files.push(rel.to_owned());
                }
            }
        }

        let mut sizes = Vec::with_capacity(files.len());
        for rel in &files {
            let full = self.path.join(rel);
            let meta = fs::symlink_metadata(&full)
                .map_err(|_| BuildRootError::MissingOutput(rel.to_string()))?;

            if meta.file_type().is_symlink() {
                self.check_symlink(rel, &files)?;
                continue;
            }
            if !meta.is_file() {
                return Err(BuildRootError::NotAFile(rel.to_string()));
            }
            sizes.push((meta.len(), rel.clone()));
        }

        let size: u64 = sizes.iter().map(|(s, _)| s).sum();
        if let Some(limit) = self.set.limit_output_size
            && size > limit
        {
            sizes.sort_by(|a, b| b.0.cmp(&a.0));
            let largest = sizes
                .iter()
                .take(5)
                .map(|(s, p)| format!("  {p}: {s}"))
                .collect::<Vec<_>>()
                .join("\n");
            return Err(BuildRootError::OutputsExceedLimit {
                size,
                limit,
                largest,
            });
        }

        let previous = {
            let state = self.state();
            state.size
        };
        self.set.charge(size)?;
        self.set.refund(previous);

        let mut state = self.state();
        state.size = size;
        state.files = files;
        trace!(root = %self.path, size, "validated outputs");
        Ok(())
    }

    fn check_symlink(&self, rel: &Utf8Path, files: &[Utf8PathBuf]) -> Result<(), BuildRootError> {
        let full = self.path.join(rel);
        let target = fs::read_link(&full)?;
        let target = Utf8PathBuf::try_from(target)
            .map_err(|e| BuildRootError::EscapingSymlink {
                path: rel.to_string(),
                target: e.into_path_buf().display().to_string(),
            })?;

        let escaping = || BuildRootError::EscapingSymlink {
            path: rel.to_string(),
            target: target.to_string(),
        };

        if target.is_absolute() {
            return Err(escaping());
        }

        let base = rel.parent().unwrap_or(Utf8Path::new(""));
        let resolved = normalize(&base.join(&target)).ok_or_else(escaping)?;
        if !files.contains(&resolved) {
            return Err(BuildRootError::DanglingSymlink {
                path: rel.to_string(),
                target: target.to_string(),
            });
        }
        Ok(())
    }

    /// Output files after validation, relative to the root. Directory
    /// outputs are expanded into the files they contain.
    pub fn files(&self) -> Vec<Utf8PathBuf> {
        let state = self.state();
        if state.files.is_empty() {
            self.outputs.clone()
        } else {
            state.files.clone()
        }
    }

    /// Combined digest of the outputs, computed once. `None` for roots of
    /// nodes without content identity.
    pub fn digest(&self) -> Result<Option<Hash32>, BuildRootError> {
        if !self.compute_hash {
            return Ok(None);
        }
        if let Some(digest) = self.state().digest {
            return Ok(Some(digest));
        }

        let mut files = self.files();
        files.sort();
        let hashes = files
            .par_iter()
            .map(|rel| Hash32::hash_file(self.path.join(rel)).map(|h| (rel.clone(), h)))
            .collect::<Result<Vec<_>, _>>()?;

        let digest = hashes
            .into_iter()
            .fold(Hash32Builder::new(), |acc, (rel, hash)| {
                acc.part(rel.as_str()).part(hash.to_hex())
            })
            .finish();

        self.state().digest = Some(digest);
        Ok(Some(digest))
    }

    pub fn inc(&self) -> Result<(), BuildRootError> {
        let mut state = self.state();
        if state.released {
            return Err(BuildRootError::Released(self.path.to_string()));
        }
        state.refcount += 1;
        Ok(())
    }

    /// Drops one reference; the directory is deleted when none remain.
    pub fn dec(&self) -> Result<(), BuildRootError> {
        let mut state = self.state();
        state.refcount -= 1;
        if state.refcount < 0 {
            return Err(BuildRootError::NegativeRefcount(self.path.to_string()));
        }
        if state.refcount > 0 || self.set.keep || state.released {
            return Ok(());
        }

        state.released = true;
        let size = std::mem::take(&mut state.size);
        drop(state);

        trace!(root = %self.path, "releasing build root");
        self.set.refund(size);
        match fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes the root regardless of outstanding references, used when its
    /// contents must not be consumed.
    pub fn discard(&self) {
        let mut state = self.state();
        if state.released {
            return;
        }
        state.released = true;
        let size = std::mem::take(&mut state.size);
        drop(state);

        self.set.refund(size);
        if let Err(e) = fs::remove_dir_all(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(root = %self.path, "couldn't discard build root: {e}");
        }
    }

    /// Links this root's outputs into `into` at the same relative paths, then
    /// drops the reference held on behalf of the consumer.
    pub fn steal_into(&self, into: &BuildRoot) -> Result<(), BuildRootError> {
        for rel in self.files() {
            let src = self.path.join(&rel);
            let dst = into.path.join(&rel);
            if fs::symlink_metadata(&src)?.file_type().is_symlink() {
                let target = fs::read_link(&src)?;
                if let Some(parent) = dst.parent() {
                    fs::create_dir_all(parent)?;
                }
                let _ = fs::remove_file(&dst);
                symlink(&target, &dst)?;
                continue;
            }
            link_or_copy(&src, &dst)?;
        }
        self.dec()
    }
}

#[cfg(unix)]
fn symlink(target: &std::path::Path, link: &Utf8Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(target: &std::path::Path, link: &Utf8Path) -> std::io::Result<()> {
    let base = link.parent().map(|p| p.as_std_path().join(target));
    fs::copy(base.unwrap_or_else(|| target.to_path_buf()), link).map(|_| ())
}

/// Lexically resolves `.` and `..`; `None` when the path climbs out.
fn normalize(path: &Utf8Path) -> Option<Utf8PathBuf> {
    let mut out = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Utf8Component::Normal(part) => out.push(part),
            Utf8Component::RootDir | Utf8Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(dir: &tempfile::TempDir, limit: Option<u64>, total: Option<u64>) -> Arc<BuildRootSet> {
        let base = Utf8Path::from_path(dir.path()).unwrap();
        BuildRootSet::create(base, false, limit, total, Duration::from_secs(3600)).unwrap()
    }

    fn outputs(items: &[&str]) -> Vec<String> {
        items.iter().map(|i| format!("$(BUILD_ROOT)/{i}")).collect()
    }

    #[test]
    fn refcount_reclaims_directory() {
        let dir = tempfile::tempdir().unwrap();
        let set = set(&dir, None, None);
        let root = set.new_root(&outputs(&["out/a.txt"]), 2, &[], false);
        root.create().unwrap();
        fs::write(root.path().join("out/a.txt"), b"abc").unwrap();
        root.validate().unwrap();
        assert_eq!(set.usage(), 3);

        root.dec().unwrap();
        assert!(root.path().exists());
        root.dec().unwrap();
        assert!(!root.path().exists());
        assert_eq!(set.usage(), 0);
        assert!(root.inc().is_err());
        assert!(matches!(root.dec(), Err(BuildRootError::NegativeRefcount(_))));
    }

    #[test]
    fn validate_reports_missing_and_oversized() {
        let dir = tempfile::tempdir().unwrap();
        let set = set(&dir, Some(4), None);

        let root = set.new_root(&outputs(&["a", "b"]), 1, &[], false);
        root.create().unwrap();
        fs::write(root.path().join("a"), b"abc").unwrap();
        assert!(matches!(root.validate(), Err(BuildRootError::MissingOutput(p)) if p == "b"));

        fs::write(root.path().join("b"), b"abc").unwrap();
        match root.validate() {
            Err(BuildRootError::OutputsExceedLimit { size, limit, .. }) => {
                assert_eq!(size, 6);
                assert_eq!(limit, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn total_limit_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let set = set(&dir, None, Some(5));
        let first = set.new_root(&outputs(&["a"]), 1, &[], false);
        first.create().unwrap();
        fs::write(first.path().join("a"), b"abcd").unwrap();
        first.validate().unwrap();

        let second = set.new_root(&outputs(&["a"]), 1, &[], false);
        second.create().unwrap();
        fs::write(second.path().join("a"), b"abcd").unwrap();
        assert!(matches!(second.validate(), Err(BuildRootError::TotalSizeExceeded { .. })));

        first.dec().unwrap();
        second.validate().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_must_stay_inside() {
        let dir = tempfile::tempdir().unwrap();
        let set = set(&dir, None, None);
        let root = set.new_root(&outputs(&["lib/real.so", "lib/link.so"]), 1, &[], false);
        root.create().unwrap();
        fs::write(root.path().join("lib/real.so"), b"elf").unwrap();
        std::os::unix::fs::symlink("real.so", root.path().join("lib/link.so")).unwrap();
        root.validate().unwrap();

        fs::remove_file(root.path().join("lib/link.so")).unwrap();
        std::os::unix::fs::symlink("/etc/passwd", root.path().join("lib/link.so")).unwrap();
        assert!(matches!(root.validate(), Err(BuildRootError::EscapingSymlink { .. })));

        fs::remove_file(root.path().join("lib/link.so")).unwrap();
        std::os::unix::fs::symlink("../../x", root.path().join("lib/link.so")).unwrap();
        assert!(matches!(root.validate(), Err(BuildRootError::EscapingSymlink { .. })));
    }

    #[test]
    fn dir_outputs_are_expanded_and_hashed() {
        let dir = tempfile::tempdir().unwrap();
        let set = set(&dir, None, None);
        let root = set.new_root(&outputs(&["gen"]), 1, &outputs(&["gen"]), true);
        root.create().unwrap();
        fs::create_dir_all(root.path().join("gen/sub")).unwrap();
        fs::write(root.path().join("gen/a.h"), b"a").unwrap();
        fs::write(root.path().join("gen/sub/b.h"), b"b").unwrap();
        root.validate().unwrap();

        let mut files = root.files();
        files.sort();
        assert_eq!(
            files,
            vec![Utf8PathBuf::from("gen/a.h"), Utf8PathBuf::from("gen/sub/b.h")]
        );

        let digest = root.digest().unwrap().unwrap();
        assert_eq!(root.digest().unwrap(), Some(digest));
    }

    #[test]
    fn steal_links_outputs_and_drops_reference() {
        let dir = tempfile::tempdir().unwrap();
        let set = set(&dir, None, None);
        let dep = set.new_root(&outputs(&["lib/x.a"]), 1, &[], false);
        dep.create().unwrap();
        fs::write(dep.path().join("lib/x.a"), b"archive").unwrap();
        dep.validate().unwrap();

        let consumer = set.new_root(&outputs(&["bin/y"]), 1, &[], false);
        consumer.create().unwrap();
        dep.steal_into(&consumer).unwrap();

        assert_eq!(fs::read(consumer.path().join("lib/x.a")).unwrap(), b"archive");
        assert!(dep.is_released());
    }

    #[test]
    fn stale_sets_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        let old = base.join("old-set");
        fs::create_dir_all(&old).unwrap();
        fs::write(old.join(STAMP), "0").unwrap();

        let _set = BuildRootSet::create(base, false, None, None, Duration::ZERO).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let _other = BuildRootSet::create(base, false, None, None, Duration::ZERO).unwrap();
        assert!(!old.exists());
    }

    #[test]
    fn normalize_rejects_escape() {
        assert_eq!(normalize(Utf8Path::new("a/./b/../c")), Some(Utf8PathBuf::from("a/c")));
        assert_eq!(normalize(Utf8Path::new("a/../../c")), None);
    }
}
