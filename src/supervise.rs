//! Supervision of long-running helper processes.
//!
//! Helpers such as hostapd, dnsmasq and airodump-ng are detached into a fresh
//! process group so that signalling the leader reaches any children. Shutdown
//! always escalates SIGTERM → grace wait → SIGKILL, and the last stderr lines
//! are retained in a ring buffer for failure classification.

use anyhow::{Context, Result};
use log::{debug, warn};
use nix::{
    sys::signal::{killpg, Signal},
    unistd::{setsid, Pid, Uid},
};
use std::{
    collections::VecDeque,
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    time,
};

/// Number of stderr lines retained per helper.
const STDERR_RING_CAPACITY: usize = 64;

/// A supervised helper process running in its own process group.
#[derive(Debug)]
pub struct Helper {
    name: String,
    child: Child,
    pgid: Pid,
    stderr: Arc<Mutex<VecDeque<String>>>,
}

impl Helper {
    /// Spawn `argv` detached into a new session/process group. Elevates with
    /// sudo when the caller is not root.
    pub fn spawn(name: &str, argv: &[String]) -> Result<Self> {
        anyhow::ensure!(!argv.is_empty(), "empty argv for helper {}", name);

        let argv = if !Uid::effective().is_root() && argv[0] != "sudo" {
            let mut elevated = vec!["sudo".to_string()];
            elevated.extend_from_slice(argv);
            elevated
        } else {
            argv.to_vec()
        };
        debug!("Spawning helper {}: {}", name, argv.join(" "));

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        // Detach into a new session so the whole group can be signalled.
        unsafe {
            command.pre_exec(|| {
                setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("spawn helper {}", name))?;
        let pgid = Pid::from_raw(child.id().context("helper already reaped")? as i32);

        let stderr = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_RING_CAPACITY)));
        if let Some(pipe) = child.stderr.take() {
            let ring = Arc::clone(&stderr);
            let helper_name = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(pipe).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{}] {}", helper_name, line);
                    let mut ring = match ring.lock() {
                        Ok(ring) => ring,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    if ring.len() == STDERR_RING_CAPACITY {
                        ring.pop_front();
                    }
                    ring.push_back(line);
                }
            });
        }

        Ok(Self {
            name: name.to_string(),
            child,
            pgid,
            stderr,
        })
    }

    /// The helper name used for logging.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The process id of the group leader, if it has not been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Whether the helper is still running.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Exit code if the helper has terminated on its own.
    pub fn exit_code(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => status.code(),
            _ => None,
        }
    }

    /// The retained tail of the helper's stderr.
    pub fn stderr_tail(&self) -> String {
        let ring = match self.stderr.lock() {
            Ok(ring) => ring,
            Err(poisoned) => poisoned.into_inner(),
        };
        ring.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Stop the helper group: SIGTERM, wait up to `grace`, then SIGKILL.
    pub async fn stop(&mut self, grace: Duration) {
        if !self.is_running() {
            debug!("Helper {} already stopped", self.name);
            return;
        }

        debug!("Stopping helper {} (pgid {})", self.name, self.pgid);
        if let Err(e) = killpg(self.pgid, Signal::SIGTERM) {
            warn!("Failed to SIGTERM helper {}: {}", self.name, e);
        }

        if time::timeout(grace, self.child.wait()).await.is_err() {
            warn!("Helper {} survived SIGTERM, killing group", self.name);
            if let Err(e) = killpg(self.pgid, Signal::SIGKILL) {
                warn!("Failed to SIGKILL helper {}: {}", self.name, e);
            }
            self.child.wait().await.ok();
        }
    }
}

impl Drop for Helper {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            warn!("Helper {} leaked into drop, killing group", self.name);
            killpg(self.pgid, Signal::SIGKILL).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::argv;

    fn bin(name: &str) -> Result<String> {
        Ok(which::which(name)?.to_string_lossy().to_string())
    }

    #[tokio::test]
    async fn spawn_and_stop_gracefully() -> Result<()> {
        let mut helper = Helper::spawn("sleeper", &argv([bin("sleep")?.as_str(), "30"]))?;
        assert!(helper.is_running());

        helper.stop(Duration::from_secs(2)).await;
        assert!(!helper.is_running());
        Ok(())
    }

    #[tokio::test]
    async fn premature_exit_is_observed() -> Result<()> {
        let mut helper = Helper::spawn("falser", &argv([bin("false")?.as_str()]))?;
        time::sleep(Duration::from_millis(300)).await;

        assert!(!helper.is_running());
        assert_eq!(helper.exit_code(), Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn stderr_tail_is_captured() -> Result<()> {
        let sh = bin("sh")?;
        let mut helper = Helper::spawn(
            "echoer",
            &argv([sh.as_str(), "-c", "echo config error >&2; sleep 30"]),
        )?;
        time::sleep(Duration::from_millis(300)).await;

        assert!(helper.stderr_tail().contains("config error"));
        helper.stop(Duration::from_secs(2)).await;
        Ok(())
    }

    #[tokio::test]
    async fn stop_twice_is_harmless() -> Result<()> {
        let mut helper = Helper::spawn("sleeper", &argv([bin("sleep")?.as_str(), "30"]))?;
        helper.stop(Duration::from_secs(2)).await;
        helper.stop(Duration::from_secs(2)).await;
        assert!(!helper.is_running());
        Ok(())
    }
}
