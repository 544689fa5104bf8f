use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::core::link_or_copy;
use crate::error::FetchError;

pub const SOURCE_ROOT: &str = "SOURCE_ROOT";
pub const TOOL_ROOT: &str = "TOOL_ROOT";
pub const RESOURCE_ROOT: &str = "RESOURCE_ROOT";
pub const BUILD_ROOT: &str = "BUILD_ROOT";
pub const TOKEN_PATH: &str = "TOKEN_PATH";

/// Symbolic path variables written as `$(NAME)` in node commands.
#[derive(Debug, Clone, Default)]
pub struct Patterns {
    values: BTreeMap<String, String>,
}

impl Patterns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Substitute every known pattern; unknown ones are left in place.
    pub fn fill(&self, text: &str) -> String {
        self.fill_with(text, &[])
    }

    /// Like [`Patterns::fill`], with `extra` taking precedence.
    pub fn fill_with(&self, text: &str, extra: &[(&str, &str)]) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some((start, end, name)) = next_pattern(rest) {
            out.push_str(&rest[..start]);
            let value = extra
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| *v)
                .or_else(|| self.get(name));
            match value {
                Some(value) => out.push_str(value),
                None => out.push_str(&rest[start..end]),
            }
            rest = &rest[end..];
        }
        out.push_str(rest);
        out
    }

    /// Pattern names used in `texts` that are neither known nor in `extra`.
    pub fn unresolved<'a>(
        &self,
        texts: impl IntoIterator<Item = &'a str>,
        extra: &[&str],
    ) -> BTreeSet<String> {
        let mut missing = BTreeSet::new();
        for text in texts {
            let mut rest = text;
            while let Some((_, end, name)) = next_pattern(rest) {
                if !self.contains(name) && !extra.contains(&name) {
                    missing.insert(name.to_string());
                }
                rest = &rest[end..];
            }
        }
        missing
    }
}

/// Finds the next `$(NAME)` and returns its byte range and name.
fn next_pattern(text: &str) -> Option<(usize, usize, &str)> {
    let mut offset = 0;
    while let Some(pos) = text[offset..].find("$(") {
        let start = offset + pos;
        let name_start = start + 2;
        let close = text[name_start..].find(')')?;
        let name = &text[name_start..name_start + close];
        if !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Some((start, name_start + close + 1, name));
        }
        offset = name_start;
    }
    None
}

/// Collaborator that materializes an external resource on disk.
pub trait Fetcher: Send + Sync {
    /// Uri schemes this fetcher understands, without the trailing colon.
    fn schemes(&self) -> Vec<String>;

    /// Place the resource named by `uri` inside the empty directory `into`.
    fn fetch(&self, uri: &str, into: &Utf8Path) -> anyhow::Result<()>;
}

/// Fetches `file:<path>` resources by linking or copying them.
#[derive(Debug, Default)]
pub struct FileFetcher;

impl Fetcher for FileFetcher {
    fn schemes(&self) -> Vec<String> {
        vec!["file".into()]
    }

    fn fetch(&self, uri: &str, into: &Utf8Path) -> anyhow::Result<()> {
        let path = Utf8Path::new(uri.strip_prefix("file:").unwrap_or(uri));
        let meta = fs::metadata(path)?;

        if meta.is_file() {
            let name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("resource path '{path}' has no file name"))?;
            link_or_copy(path, &into.join(name))?;
            return Ok(());
        }

        let pattern = format!("{}/**/*", glob::Pattern::escape(path.as_str()));
        for entry in glob::glob(&pattern)? {
            let entry = Utf8PathBuf::try_from(entry?)?;
            if !entry.is_file() {
                continue;
            }
            let rel = entry.strip_prefix(path)?;
            link_or_copy(&entry, &into.join(rel))?;
        }

        Ok(())
    }
}

/// Registry dispatching resource uris to fetchers by scheme.
#[derive(Clone, Default)]
pub struct Fetchers {
    by_scheme: HashMap<String, Arc<dyn Fetcher>>,
}

impl Fetchers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `file:` fetcher.
    pub fn with_defaults() -> Self {
        let mut fetchers = Self::new();
        fetchers.register(Arc::new(FileFetcher));
        fetchers
    }

    pub fn register(&mut self, fetcher: Arc<dyn Fetcher>) {
        for scheme in fetcher.schemes() {
            self.by_scheme.insert(scheme, fetcher.clone());
        }
    }

    /// Directory a resource is placed in, relative to the resource root:
    /// `<scheme>/<id>` with path separators flattened.
    pub fn resource_dir(uri: &str) -> Utf8PathBuf {
        let (scheme, rest) = uri.split_once(':').unwrap_or(("res", uri));
        let id: String = rest
            .trim_start_matches('/')
            .chars()
            .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
            .collect();
        Utf8PathBuf::from(scheme).join(id)
    }

    pub fn fetch(&self, uri: &str, into: &Utf8Path) -> Result<(), FetchError> {
        let scheme = uri.split_once(':').map(|(s, _)| s).unwrap_or_default();
        let fetcher = self
            .by_scheme
            .get(scheme)
            .ok_or_else(|| FetchError::NoFetcher(uri.to_string()))?;

        debug!(uri, into = %into, "fetching resource");
        fs::create_dir_all(into).map_err(|e| FetchError::Failed {
            uri: uri.to_string(),
            source: e.into(),
        })?;
        fetcher.fetch(uri, into).map_err(|source| FetchError::Failed {
            uri: uri.to_string(),
            source,
        })
    }
}

impl std::fmt::Debug for Fetchers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetchers")
            .field("schemes", &self.by_scheme.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_replaces_known_and_keeps_unknown() {
        let mut patterns = Patterns::new();
        patterns.insert(SOURCE_ROOT, "/src");
        assert_eq!(
            patterns.fill("$(SOURCE_ROOT)/a.c -o $(BUILD_ROOT)/a.o $(X"),
            "/src/a.c -o $(BUILD_ROOT)/a.o $(X"
        );
        assert_eq!(
            patterns.fill_with("$(BUILD_ROOT)/a.o", &[(BUILD_ROOT, "/b/1")]),
            "/b/1/a.o"
        );
        assert_eq!(patterns.fill("$$(SOURCE_ROOT)"), "$/src");
    }

    #[test]
    fn unresolved_skips_extra_names() {
        let mut patterns = Patterns::new();
        patterns.insert(SOURCE_ROOT, "/src");
        let missing = patterns.unresolved(
            ["$(SOURCE_ROOT)/x", "$(BUILD_ROOT)/y", "$(JDK)/bin/java", "$(JDK)"],
            &[BUILD_ROOT],
        );
        assert_eq!(missing.into_iter().collect::<Vec<_>>(), vec!["JDK".to_string()]);
    }

    #[test]
    fn resource_dir_is_flat() {
        assert_eq!(Fetchers::resource_dir("sbr:123"), Utf8PathBuf::from("sbr/123"));
        assert_eq!(
            Fetchers::resource_dir("file:/opt/tool"),
            Utf8PathBuf::from("file/opt_tool")
        );
    }

    #[test]
    fn file_fetcher_copies_trees() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let src = root.join("tool");
        fs::create_dir_all(src.join("bin")).unwrap();
        fs::write(src.join("bin/run"), b"#!/bin/sh").unwrap();

        let fetchers = Fetchers::with_defaults();
        let into = root.join("res");
        fetchers.fetch(&format!("file:{src}"), &into).unwrap();
        assert_eq!(fs::read(into.join("bin/run")).unwrap(), b"#!/bin/sh");

        let err = fetchers.fetch("sbr:1", &into).unwrap_err();
        assert!(matches!(err, FetchError::NoFetcher(_)));
    }
}
