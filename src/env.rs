use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

use crate::config::Options;

type Guard = Box<dyn FnOnce() + Send>;

/// Scoped resources released in reverse acquisition order.
///
/// Dropping the stack releases whatever is still held, so cleanup happens
/// on every exit path, early returns and panics included.
#[derive(Default)]
pub struct CleanupStack {
    guards: Vec<(&'static str, Guard)>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &'static str, guard: impl FnOnce() + Send + 'static) {
        self.guards.push((name, Box::new(guard)));
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Release everything now.
    pub fn release(&mut self) {
        while let Some((name, guard)) = self.guards.pop() {
            debug!(guard = name, "releasing");
            guard();
        }
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.guards.iter().map(|(name, _)| *name).collect();
        f.debug_struct("CleanupStack").field("guards", &names).finish()
    }
}

/// Process environment of a run, established once and never mutated.
///
/// Child processes receive [`ExecEnv::base_env`] merged with the node's
/// own variables; the real process environment is left alone.
#[derive(Debug, Clone)]
pub struct ExecEnv {
    vars: BTreeMap<String, String>,
    token_path: Option<Utf8PathBuf>,
    scratch: Utf8PathBuf,
}

impl ExecEnv {
    /// Sets up the token file and scratch prefix under `run_dir`, pushing
    /// their removal onto `cleanup`.
    pub fn create(
        options: &Options,
        run_dir: &Utf8Path,
        cleanup: &mut CleanupStack,
    ) -> io::Result<Self> {
        let mut vars = BTreeMap::new();
        vars.insert("LC_ALL".to_string(), "C".to_string());
        vars.insert("LANG".to_string(), "en".to_string());

        let scratch = run_dir.join("scratch");
        fs::create_dir_all(&scratch)?;

        let token_path = match &options.token {
            Some(token) => {
                let path = run_dir.join(".token");
                write_private(&path, token.as_bytes())?;
                let guard_path = path.clone();
                cleanup.push("token file", move || {
                    if let Err(e) = fs::remove_file(&guard_path)
                        && e.kind() != io::ErrorKind::NotFound
                    {
                        warn!(path = %guard_path, "couldn't remove token file: {e}");
                    }
                });
                Some(path)
            }
            None => None,
        };

        Ok(Self {
            vars,
            token_path,
            scratch,
        })
    }

    /// Variables every child process receives.
    pub fn base_env(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn token_path(&self) -> Option<&Utf8Path> {
        self.token_path.as_deref()
    }

    pub fn scratch(&self) -> &Utf8Path {
        &self.scratch
    }
}

fn write_private(path: &Utf8Path, data: &[u8]) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(data)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn releases_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let mut stack = CleanupStack::new();
            for name in ["first", "second", "third"] {
                let log = log.clone();
                stack.push(name, move || log.lock().unwrap().push(name));
            }
            assert_eq!(stack.len(), 3);
        }
        assert_eq!(*log.lock().unwrap(), vec!["third", "second", "first"]);
    }

    #[test]
    fn token_file_lives_for_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let options = Options {
            token: Some("secret".into()),
            ..Options::default()
        };

        let mut stack = CleanupStack::new();
        let env = ExecEnv::create(&options, root, &mut stack).unwrap();
        let token = env.token_path().unwrap().to_owned();
        assert_eq!(fs::read_to_string(&token).unwrap(), "secret");
        assert_eq!(env.base_env().get("LC_ALL").map(String::as_str), Some("C"));
        assert!(env.scratch().is_dir());

        stack.release();
        assert!(!token.exists());
    }
}
