use std::fs;
use std::io;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

/// Atomic reference-counted string type used for identifiers.
pub type ArcStr = Arc<str>;

/// A 32-byte BLAKE3 hash used for content addressing.
///
/// In `kamado`, this serves three purposes:
/// 1. It names blobs in the local cache, so identical files are stored once.
/// 2. It fingerprints the outputs of a build root, which lets a consumer
///    derive a content key from its own `selfUid` plus the digests of its
///    dependencies.
/// 3. It turns arbitrary keys (uids, paths) into fixed-width file names.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn hash_file(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        Ok(blake3::Hasher::new().update_mmap(path)?.finalize().into())
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    /// Two-level shard prefix for on-disk fan-out, e.g. `ab`.
    pub(crate) fn shard(self) -> String {
        let hex = self.to_hex();
        hex[..2].to_string()
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental hasher for combining several parts into one digest. Parts are
/// length-prefixed so that `["ab", "c"]` and `["a", "bc"]` differ.
#[derive(Default)]
pub(crate) struct Hash32Builder(blake3::Hasher);

impl Hash32Builder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn part(mut self, bytes: impl AsRef<[u8]>) -> Self {
        let bytes = bytes.as_ref();
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }

    pub(crate) fn finish(self) -> Hash32 {
        self.0.finalize().into()
    }
}

/// Hard link `src` to `dst`, falling back to a copy across filesystems.
pub(crate) fn link_or_copy(src: &Utf8Path, dst: &Utf8Path) -> io::Result<()> {
    if let Some(dir) = dst.parent() {
        fs::create_dir_all(dir)?;
    }

    if fs::symlink_metadata(dst).is_ok() {
        fs::remove_file(dst)?;
    }

    if fs::hard_link(src, dst).is_err() {
        fs::copy(src, dst)?;
    }

    Ok(())
}

/// Seconds since the unix epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Seconds since the unix epoch as a float, used for timings in the log.
pub(crate) fn unix_now_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hex_is_lowercase_and_full_width() {
        let hash = Hash32::hash(b"kamado");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(hash.shard(), hex[..2]);
    }

    #[test]
    fn builder_separates_parts() {
        let a = Hash32Builder::new().part("ab").part("c").finish();
        let b = Hash32Builder::new().part("a").part("bc").finish();
        assert_ne!(a, b);
    }

    #[test]
    fn hash_file_matches_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"content").unwrap();
        assert_eq!(Hash32::hash_file(&path).unwrap(), Hash32::hash(b"content"));
    }

    #[test]
    fn link_or_copy_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let src = root.join("src");
        let dst = root.join("nested/dst");
        fs::write(&src, b"new").unwrap();
        fs::create_dir_all(root.join("nested")).unwrap();
        fs::write(&dst, b"old").unwrap();

        link_or_copy(&src, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"new");
    }
}
