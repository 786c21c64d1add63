//! Error handling helpers and primitives.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
/// Failure kinds surfaced by the toolkit core.
pub enum Error {
    #[error("executable not found: {program}")]
    /// An external executable is missing from PATH.
    CommandNotFound { program: String },

    #[error("command timed out after {timeout:?}: {argv}")]
    /// A child process exceeded its timeout and was killed.
    CommandTimeout { argv: String, timeout: Duration },

    #[error("command failed with exit code {code}: {argv}: {stderr}")]
    /// A checked command exited non-zero.
    CommandFailed {
        argv: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("monitor mode unavailable on {interface}: {reason}")]
    /// Both the ip/iw and the airmon-ng paths failed.
    MonitorModeUnavailable { interface: String, reason: String },

    #[error("role assignment failed: {0}")]
    /// No interface satisfies the capability required for a workflow role.
    RoleAssignmentFailed(String),

    #[error("target selection failed: {0}")]
    /// The scan produced no usable networks or the requested target is absent.
    TargetSelectionFailed(String),

    #[error("infrastructure startup failed: {0}")]
    /// AP, DHCP/DNS, traffic redirection or the portal failed to come up.
    InfraStartupFailed(String),

    #[error("no usable wordlist: {0}")]
    WordlistUnavailable(String),

    #[error("plugin not found: {0}")]
    PluginNotFound(String),
}

/// Chain creates a string from an error stack.
pub fn chain(res: anyhow::Error) -> String {
    res.chain()
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn chain() {
        let first = anyhow!("error 1");
        let second = anyhow!("error 2");

        let res = super::chain(first.context(second));

        assert_eq!(res, "error 2: error 1");
    }

    #[test]
    fn command_failed_display() {
        let err = Error::CommandFailed {
            argv: "iw dev wlan0 info".into(),
            code: 1,
            stdout: String::new(),
            stderr: "command failed".into(),
        };
        assert!(err.to_string().contains("exit code 1"));
        assert!(err.to_string().contains("iw dev wlan0 info"));
    }
}
