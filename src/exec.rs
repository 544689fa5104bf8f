use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use tracing::{debug, trace};

use crate::engine::CancelToken;
use crate::error::ExecError;

/// A fully substituted command line ready to be executed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub args: Vec<String>,
    pub cwd: Option<Utf8PathBuf>,
    pub env: BTreeMap<String, String>,
    /// File receiving stdout instead of the captured buffer.
    pub stdout: Option<Utf8PathBuf>,
    /// File receiving stderr instead of the captured buffer.
    pub stderr: Option<Utf8PathBuf>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Collaborator running node commands.
///
/// Implementations must return promptly with [`ExecError::Aborted`] once
/// `cancel` reports an abort.
pub trait Executor: Send + Sync {
    fn execute(&self, invocation: &Invocation, cancel: &CancelToken)
    -> Result<ExecOutput, ExecError>;
}

/// Runs commands as child processes of the current process.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    poll: Duration,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(10),
        }
    }
}

impl ProcessExecutor {
    pub fn new(poll: Duration) -> Self {
        Self { poll }
    }

    fn wait(
        &self,
        child: &mut Child,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<ExitStatus, ExecError> {
        let start = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }

            if cancel.is_aborted() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExecError::Aborted);
            }

            if let Some(timeout) = timeout
                && start.elapsed() > timeout
            {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExecError::Timeout(timeout));
            }

            thread::sleep(self.poll);
        }
    }

    /// Output read by a capture thread. A background process may hold the
    /// pipe open after the command ended; the thread is left behind once
    /// `give_up` says so.
    fn collect(
        &self,
        handle: Option<thread::JoinHandle<String>>,
        give_up: &impl Fn() -> bool,
    ) -> String {
        let Some(handle) = handle else {
            return String::new();
        };
        while !handle.is_finished() {
            if give_up() {
                debug!("output still open after the command ended, leaving it behind");
                return String::new();
            }
            thread::sleep(self.poll);
        }
        handle.join().unwrap_or_default()
    }
}

/// How long output is still read after a command was killed.
const CAPTURE_GRACE: Duration = Duration::from_millis(100);

fn capture(stream: Option<impl Read + Send + 'static>) -> Option<thread::JoinHandle<String>> {
    stream.map(|mut stream| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stream.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    1
}

impl Executor for ProcessExecutor {
    fn execute(
        &self,
        invocation: &Invocation,
        cancel: &CancelToken,
    ) -> Result<ExecOutput, ExecError> {
        let (program, args) = invocation.args.split_first().ok_or(ExecError::Empty)?;

        let mut command = Command::new(program);
        command.args(args).envs(&invocation.env).stdin(Stdio::null());

        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd);
        }

        match &invocation.stdout {
            Some(path) => command.stdout(File::create(path)?),
            None => command.stdout(Stdio::piped()),
        };

        match &invocation.stderr {
            Some(path) => command.stderr(File::create(path)?),
            None => command.stderr(Stdio::piped()),
        };

        trace!(args = ?invocation.args, cwd = ?invocation.cwd, "spawning");

        let mut child = command.spawn().map_err(|source| ExecError::Spawn {
            program: program.clone(),
            source,
        })?;

        let start = Instant::now();
        let stdout = capture(child.stdout.take());
        let stderr = capture(child.stderr.take());

        let (status, deadline) = match self.wait(&mut child, invocation.timeout, cancel) {
            Ok(status) => (Ok(status), invocation.timeout.map(|t| start + t)),
            Err(e) => (Err(e), Some(Instant::now() + CAPTURE_GRACE)),
        };
        let give_up = || cancel.is_aborted() || deadline.is_some_and(|d| Instant::now() >= d);
        let stdout = self.collect(stdout, &give_up);
        let stderr = self.collect(stderr, &give_up);
        let exit_code = exit_code(status?);

        debug!(program, exit_code, "command finished");

        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Invocation {
        Invocation {
            args: vec!["/bin/sh".into(), "-c".into(), script.into()],
            ..Default::default()
        }
    }

    #[test]
    fn captures_output_and_exit_code() {
        let exec = ProcessExecutor::default();
        let out = exec
            .execute(&sh("echo out; echo err >&2; exit 3"), &CancelToken::new())
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[test]
    fn passes_env_and_redirects_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("out.txt")).unwrap();
        let mut inv = sh("printf %s \"$GREETING\"");
        inv.env.insert("GREETING".into(), "hi".into());
        inv.stdout = Some(path.clone());

        let out = ProcessExecutor::default()
            .execute(&inv, &CancelToken::new())
            .unwrap();
        assert!(out.success());
        assert_eq!(std::fs::read_to_string(path).unwrap(), "hi");
    }

    #[test]
    fn times_out() {
        let mut inv = sh("sleep 5");
        inv.timeout = Some(Duration::from_millis(50));
        let err = ProcessExecutor::default()
            .execute(&inv, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)));
    }

    #[test]
    fn timeout_does_not_wait_for_background_output() {
        let mut inv = sh("sleep 5 & wait");
        inv.timeout = Some(Duration::from_millis(50));
        let start = Instant::now();
        let err = ProcessExecutor::default()
            .execute(&inv, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn abort_kills_child() {
        let token = CancelToken::new();
        token.abort("test");
        let err = ProcessExecutor::default()
            .execute(&sh("sleep 5"), &token)
            .unwrap_err();
        assert!(matches!(err, ExecError::Aborted));
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = ProcessExecutor::default()
            .execute(&Invocation::default(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, ExecError::Empty));
    }
}
