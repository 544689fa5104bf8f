use std::collections::HashMap;
use std::fs;
use std::io;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, trace};

use crate::config::ResultOptions;
use crate::core::{Hash32, link_or_copy};
use crate::error::{ConflictError, PublishError};

/// Persistent copies of result files that `symlink_root` links point at.
///
/// Each file lives at `<root>/<blake3(path)>/<basename>`, so the link for a
/// given output path always resolves to the same place across runs.
#[derive(Debug)]
pub struct SymlinkStore {
    root: Utf8PathBuf,
}

impl SymlinkStore {
    pub fn open(root: impl Into<Utf8PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Copies `src` into the store under `rel` and returns the stored path.
    pub fn store(&self, src: &Utf8Path, rel: &Utf8Path) -> io::Result<Utf8PathBuf> {
        let slot = self.root.join(Hash32::hash(rel.as_str()).to_hex());
        let dst = slot.join(rel.file_name().unwrap_or("output"));
        link_or_copy(src, &dst)?;
        if let Err(e) = fs::File::open(&slot).and_then(|dir| dir.set_modified(SystemTime::now())) {
            debug!(slot = %slot, "couldn't stamp stored result: {e}");
        }
        Ok(dst)
    }

    /// Removes stored results not refreshed within `ttl`; returns how many
    /// were removed.
    pub fn sieve(&self, ttl: Duration) -> io::Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in self.root.read_dir_utf8()? {
            let entry = entry?;
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| now.duration_since(t).ok());
            if age.is_some_and(|age| age > ttl) {
                trace!(path = %entry.path(), "removing expired stored result");
                fs::remove_dir_all(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Materializes outputs of result nodes into the externally visible trees.
#[derive(Debug)]
pub struct ResultCollector {
    options: ResultOptions,
    output_root: Option<Utf8PathBuf>,
    symlink_root: Option<Utf8PathBuf>,
    store: Option<SymlinkStore>,
    claimed: Mutex<HashMap<Utf8PathBuf, String>>,
}

impl ResultCollector {
    /// `store_dir` holds the [`SymlinkStore`] and is only used when
    /// `symlink_root` is set.
    pub fn new(
        options: ResultOptions,
        output_root: Option<Utf8PathBuf>,
        symlink_root: Option<Utf8PathBuf>,
        store_dir: &Utf8Path,
    ) -> io::Result<Self> {
        let store = match &symlink_root {
            Some(_) => Some(SymlinkStore::open(store_dir)?),
            None => None,
        };
        Ok(Self {
            options,
            output_root,
            symlink_root,
            store,
            claimed: Mutex::new(HashMap::new()),
        })
    }

    /// Suffixes listed in `suppress_outputs` are always hidden; default
    /// suppressed suffixes only unless re-enabled through `add_result`.
    pub fn is_suppressed(&self, path: &str) -> bool {
        let ends = |suffix: &String| path.ends_with(suffix.as_str());
        if self.options.suppress_outputs.iter().any(ends) {
            return true;
        }
        self.options.default_suppress_outputs.iter().any(ends)
            && !self.options.add_result.iter().any(ends)
    }

    fn claim(&self, dst: &Utf8Path, uid: &str) -> Result<(), ConflictError> {
        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        match claimed.get(dst) {
            Some(owner) if owner != uid => Err(ConflictError {
                path: dst.to_string(),
                uids: vec![owner.clone(), uid.to_string()],
            }),
            Some(_) => Ok(()),
            None => {
                claimed.insert(dst.to_owned(), uid.to_string());
                Ok(())
            }
        }
    }

    /// Publishes `files` (relative to `root`) for `uid` and returns the
    /// visible paths. Without any output tree configured the relative paths
    /// are reported as they are.
    pub fn publish(
        &self,
        uid: &str,
        root: &Utf8Path,
        files: &[Utf8PathBuf],
    ) -> Result<Vec<Utf8PathBuf>, PublishError> {
        let mut published = Vec::new();

        for rel in files {
            if self.is_suppressed(rel.as_str()) {
                trace!(uid, path = %rel, "suppressed result output");
                continue;
            }
            let src = root.join(rel);

            if let Some(output_root) = &self.output_root {
                let dst = output_root.join(rel);
                self.claim(&dst, uid)?;
                link_or_copy(&src, &dst)?;
                published.push(dst);
            }

            if let (Some(symlink_root), Some(store)) = (&self.symlink_root, &self.store) {
                let link = symlink_root.join(rel);
                self.claim(&link, uid)?;
                let target = store.store(&src, rel)?;
                replace_symlink(&target, &link)?;
                published.push(link);
            }

            if self.output_root.is_none() && self.symlink_root.is_none() {
                published.push(rel.clone());
            }
        }

        debug!(uid, count = published.len(), "published result");
        Ok(published)
    }

    /// Applies the symlink store TTL, if any.
    pub fn sieve(&self) -> io::Result<usize> {
        match (&self.store, self.options.symlinks_ttl_secs) {
            (Some(store), Some(ttl)) => store.sieve(Duration::from_secs(ttl)),
            _ => Ok(0),
        }
    }
}

fn replace_symlink(target: &Utf8Path, link: &Utf8Path) -> io::Result<()> {
    if let Some(dir) = link.parent() {
        fs::create_dir_all(dir)?;
    }
    if fs::symlink_metadata(link).is_ok() {
        fs::remove_file(link)?;
    }
    symlink(target, link)
}

#[cfg(unix)]
fn symlink(target: &Utf8Path, link: &Utf8Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(target: &Utf8Path, link: &Utf8Path) -> io::Result<()> {
    fs::copy(target, link).map(|_| ())
}
