//! Privileged external command execution.
//!
//! Every component that drives system tooling (`ip`, `iw`, `nmcli`,
//! `iptables`, the aircrack suite) goes through the [`Exec`] trait so tests
//! can substitute a scripted mock. Argv is always a list of strings, never a
//! concatenated command line.

use crate::error::Error;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use derive_builder::Builder;
use dyn_clone::{clone_trait_object, DynClone};
use getset::{CopyGetters, Getters};
use log::{debug, warn};
use nix::{
    sys::signal::{kill, Signal},
    unistd::{Pid, Uid},
};
use std::{fmt::Debug, process::Stdio, time::Duration};
use tokio::{io::AsyncReadExt, process::Command, time};

/// Grace period between SIGTERM and SIGKILL when a timeout expires.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Builder, Clone, Debug, CopyGetters, Getters)]
#[builder(default, pattern = "owned", setter(into))]
/// Per-invocation options for the executor.
pub struct ExecOpts {
    #[get_copy = "pub"]
    /// Prepend `sudo` when the current user is not root.
    require_root: bool,

    #[get_copy = "pub"]
    #[builder(default = "true")]
    /// Fail on non-zero exit status.
    check: bool,

    #[get_copy = "pub"]
    /// Kill the child and fail once this duration elapses.
    timeout: Option<Duration>,
}

impl Default for ExecOpts {
    fn default() -> Self {
        Self {
            require_root: false,
            check: true,
            timeout: None,
        }
    }
}

impl ExecOpts {
    /// Options for a root-elevated, checked call.
    pub fn root() -> Self {
        Self {
            require_root: true,
            ..Self::default()
        }
    }

    /// Options for a root-elevated best-effort call, used on cleanup paths.
    pub fn root_unchecked() -> Self {
        Self {
            require_root: true,
            check: false,
            ..Self::default()
        }
    }

    /// Root-elevated, checked, with a timeout.
    pub fn root_timeout(timeout: Duration) -> Self {
        Self {
            require_root: true,
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

#[async_trait]
/// The external command execution trait.
pub trait Exec: Debug + DynClone + Send + Sync {
    /// Run a command and return its trimmed stdout.
    ///
    /// With `check` set, a non-zero exit becomes [`Error::CommandFailed`].
    /// Without it, stdout is returned regardless of the exit status.
    async fn run(&self, argv: &[String], opts: &ExecOpts) -> Result<String>;

    /// Best-effort variant which never fails, for cleanup callers.
    async fn run_unchecked(&self, argv: &[String], opts: &ExecOpts) -> String {
        let mut opts = opts.clone();
        opts.check = false;
        match self.run(argv, &opts).await {
            Ok(stdout) => stdout,
            Err(e) => {
                warn!("Ignoring failure of {}: {:#}", argv.join(" "), e);
                String::new()
            }
        }
    }
}

clone_trait_object!(Exec);

#[derive(Clone, Debug, Default)]
/// DefaultExec runs commands through `tokio::process` with the sudo, timeout
/// and capture discipline described above.
pub struct DefaultExec;

#[async_trait]
impl Exec for DefaultExec {
    async fn run(&self, argv: &[String], opts: &ExecOpts) -> Result<String> {
        if argv.is_empty() {
            bail!("empty argv");
        }

        let argv = maybe_sudo(argv, opts.require_root());
        let joined = argv.join(" ");
        debug!("Executing: {}", joined);

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                anyhow::Error::new(Error::CommandNotFound {
                    program: argv[0].clone(),
                })
            } else {
                anyhow::Error::new(e).context(format!("spawn {}", argv[0]))
            }
        })?;

        let mut stdout_pipe = child.stdout.take().context("take stdout pipe")?;
        let mut stderr_pipe = child.stderr.take().context("take stderr pipe")?;
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout_pipe.read_to_end(&mut buf).await.ok();
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr_pipe.read_to_end(&mut buf).await.ok();
            buf
        });

        let status = match opts.timeout() {
            Some(limit) => match time::timeout(limit, child.wait()).await {
                Ok(status) => status.context("wait for child")?,
                Err(_) => {
                    terminate_with_grace(&mut child).await;
                    let err = Error::CommandTimeout {
                        argv: joined,
                        timeout: limit,
                    };
                    if opts.check() {
                        return Err(err.into());
                    }
                    warn!("{}", err);
                    return Ok(String::new());
                }
            },
            None => child.wait().await.context("wait for child")?,
        };

        let stdout = collect(stdout_task.await.unwrap_or_default());
        let stderr = collect(stderr_task.await.unwrap_or_default());

        if !stdout.is_empty() {
            debug!("{} stdout: {}", argv[0], stdout);
        }
        if !stderr.is_empty() {
            debug!("{} stderr: {}", argv[0], stderr);
        }

        if !status.success() && opts.check() {
            return Err(Error::CommandFailed {
                argv: joined,
                code: status.code().unwrap_or(-1),
                stdout,
                stderr,
            }
            .into());
        }

        Ok(stdout)
    }
}

/// Prepend sudo when elevation is required and the caller is not uid 0.
fn maybe_sudo(argv: &[String], require_root: bool) -> Vec<String> {
    if require_root && !Uid::effective().is_root() && argv[0] != "sudo" {
        let mut elevated = Vec::with_capacity(argv.len() + 1);
        elevated.push("sudo".to_string());
        elevated.extend_from_slice(argv);
        elevated
    } else {
        argv.to_vec()
    }
}

/// SIGTERM the child, give it a short grace period, then SIGKILL.
async fn terminate_with_grace(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        let pid = Pid::from_raw(pid as i32);
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            warn!("Failed to SIGTERM pid {}: {}", pid, e);
        }
        if time::timeout(KILL_GRACE, child.wait()).await.is_err() {
            warn!("Child {} survived SIGTERM, killing", pid);
            child.kill().await.ok();
        }
    }
}

fn collect(buf: Vec<u8>) -> String {
    String::from_utf8_lossy(&buf).trim().to_string()
}

/// Build an argv vector from string-likes.
pub fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parts.into_iter().map(|s| s.as_ref().to_string()).collect()
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    #[derive(Clone, Debug, Default)]
    /// A scripted Exec mock: each call pops the next canned reply and records
    /// the argv it was invoked with.
    pub struct ExecMock {
        replies: Arc<Mutex<VecDeque<Result<String, i32>>>>,
        calls: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl ExecMock {
        pub fn push_ok(&self, stdout: &str) {
            self.replies
                .lock()
                .expect("lock replies")
                .push_back(Ok(stdout.to_string()));
        }

        pub fn push_failure(&self, code: i32) {
            self.replies
                .lock()
                .expect("lock replies")
                .push_back(Err(code));
        }

        pub fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().expect("lock calls").clone()
        }

        pub fn joined_calls(&self) -> Vec<String> {
            self.calls().iter().map(|c| c.join(" ")).collect()
        }
    }

    #[async_trait]
    impl Exec for ExecMock {
        async fn run(&self, argv: &[String], opts: &ExecOpts) -> Result<String> {
            self.calls
                .lock()
                .expect("lock calls")
                .push(argv.to_vec());
            let reply = self
                .replies
                .lock()
                .expect("lock replies")
                .pop_front()
                .unwrap_or(Ok(String::new()));
            match reply {
                Ok(stdout) => Ok(stdout),
                Err(code) if opts.check() => Err(Error::CommandFailed {
                    argv: argv.join(" "),
                    code,
                    stdout: String::new(),
                    stderr: "mocked failure".into(),
                }
                .into()),
                Err(_) => Ok(String::new()),
            }
        }
    }

    #[tokio::test]
    async fn run_success() -> Result<()> {
        let echo = which::which("echo")?;
        let out = DefaultExec
            .run(
                &argv([echo.to_string_lossy().as_ref(), "hello", "world"]),
                &ExecOpts::default(),
            )
            .await?;
        assert_eq!(out, "hello world");
        Ok(())
    }

    #[tokio::test]
    async fn run_failure_checked() -> Result<()> {
        let false_bin = which::which("false")?;
        let res = DefaultExec
            .run(
                &argv([false_bin.to_string_lossy().as_ref()]),
                &ExecOpts::default(),
            )
            .await;
        let err = res.expect_err("false must fail when checked");
        match err.downcast_ref::<Error>() {
            Some(Error::CommandFailed { code, .. }) => assert_eq!(*code, 1),
            other => panic!("unexpected error: {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn run_failure_unchecked_returns_stdout() -> Result<()> {
        let sh = which::which("sh")?;
        let out = DefaultExec
            .run(
                &argv([
                    sh.to_string_lossy().as_ref(),
                    "-c",
                    "echo partial; exit 3",
                ]),
                &ExecOptsBuilder::default().check(false).build()?,
            )
            .await?;
        assert_eq!(out, "partial");
        Ok(())
    }

    #[tokio::test]
    async fn run_missing_binary() {
        let res = DefaultExec
            .run(
                &argv(["definitely-not-on-path-xyz"]),
                &ExecOpts::default(),
            )
            .await;
        let err = res.expect_err("missing binary must fail");
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::CommandNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn run_timeout_kills_child() -> Result<()> {
        let sleep = which::which("sleep")?;
        let res = DefaultExec
            .run(
                &argv([sleep.to_string_lossy().as_ref(), "30"]),
                &ExecOptsBuilder::default()
                    .timeout(Some(Duration::from_millis(200)))
                    .build()?,
            )
            .await;
        let err = res.expect_err("timeout must surface");
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::CommandTimeout { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn run_unchecked_swallows_everything() {
        let out = DefaultExec
            .run_unchecked(&argv(["definitely-not-on-path-xyz"]), &ExecOpts::default())
            .await;
        assert_eq!(out, "");
    }

    #[test]
    fn sudo_prepended_for_non_root() {
        let elevated = maybe_sudo(&argv(["iw", "list"]), true);
        if Uid::effective().is_root() {
            assert_eq!(elevated, argv(["iw", "list"]));
        } else {
            assert_eq!(elevated, argv(["sudo", "iw", "list"]));
        }
    }

    #[test]
    fn sudo_never_doubled() {
        let elevated = maybe_sudo(&argv(["sudo", "iw", "list"]), true);
        assert_eq!(elevated[0], "sudo");
        assert_ne!(elevated.get(1).map(String::as_str), Some("sudo"));
    }
}
