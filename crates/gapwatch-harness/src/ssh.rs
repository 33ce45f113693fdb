//! SSH plumbing: one-shot commands to the switch and interactive shells on
//! the neighbor routers.
//!
//! Both go through the system `ssh` binary with host-key checking off; the
//! switch side is a single remote command per invocation, the neighbor side
//! is a long-lived shell driven prompt-to-prompt like a human operator.

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SshError {
    #[error("ssh I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("ssh session closed while waiting for prompt {0:?}")]
    Closed(String),
    #[error("timed out waiting for prompt {0:?}")]
    Timeout(String),
}

/// Per-command ceiling for interactive shells. The orchestrator's own
/// deadlines are much larger; this only turns a wedged shell into an error
/// the observer can report.
const SHELL_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Run one command on the switch. Returns the remote exit code.
pub async fn run_dut_command(dut_ssh: &str, command: &str) -> Result<i32, SshError> {
    info!(target = dut_ssh, command, "running remote command");
    let output = Command::new("ssh")
        .arg("-o")
        .arg("StrictHostKeyChecking=no")
        .arg(dut_ssh)
        .arg(command)
        .stdin(Stdio::null())
        .output()
        .await?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stdout.trim().is_empty() {
        debug!("remote stdout: {}", stdout.trim());
    }
    if !stderr.trim().is_empty() {
        debug!("remote stderr: {}", stderr.trim());
    }
    // A reboot tears the session down; ssh reports that as 255.
    Ok(output.status.code().unwrap_or(255))
}

/// Exit codes acceptable from a reboot command.
pub fn reboot_exit_ok(code: i32) -> bool {
    matches!(code, 0 | 255)
}

/// The `hostname>` prompt is the last line of the login banner; command
/// mode turns it into `hostname#`.
pub fn extract_hostname(first_prompt: &str) -> String {
    first_prompt
        .lines()
        .last()
        .unwrap_or_default()
        .trim()
        .replace('>', "#")
}

/// An interactive shell on a neighbor router.
pub struct InteractiveShell {
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    hostname: String,
}

impl InteractiveShell {
    /// Open a shell to `login@ip`, enter enable mode, and disable paging.
    pub async fn connect(login: &str, ip: &str) -> Result<Self, SshError> {
        let shell = Command::new("ssh")
            .arg("-tt")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg(format!("{login}@{ip}"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let mut shell = Self::from_child(shell)?;

        let banner = shell.read_until(">").await?;
        shell.hostname = extract_hostname(&banner);
        info!(ip, hostname = %shell.hostname, "neighbor shell connected");

        shell.do_cmd("enable").await?;
        shell.do_cmd("terminal length 0").await?;
        Ok(shell)
    }

    /// Drive an arbitrary child process as a shell (used by tests).
    pub fn from_child(mut child: Child) -> Result<Self, SshError> {
        let stdin = child.stdin.take().ok_or_else(|| {
            SshError::Io(std::io::Error::other("child stdin not piped"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            SshError::Io(std::io::Error::other("child stdout not piped"))
        })?;
        Ok(InteractiveShell {
            _child: child,
            stdin,
            stdout,
            hostname: String::new(),
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn set_hostname(&mut self, hostname: impl Into<String>) {
        self.hostname = hostname.into();
    }

    /// Send `cmd` and collect output until the enable prompt comes back.
    pub async fn do_cmd(&mut self, cmd: &str) -> Result<String, SshError> {
        self.stdin.write_all(cmd.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        let prompt = self.hostname.clone();
        self.read_until(&prompt).await
    }

    async fn read_until(&mut self, prompt: &str) -> Result<String, SshError> {
        let mut collected = String::new();
        let mut buf = [0u8; 16384];
        loop {
            let read = tokio::time::timeout(SHELL_READ_TIMEOUT, self.stdout.read(&mut buf))
                .await
                .map_err(|_| SshError::Timeout(prompt.to_string()))??;
            if read == 0 {
                return Err(SshError::Closed(prompt.to_string()));
            }
            collected.push_str(&String::from_utf8_lossy(&buf[..read]));
            if collected.contains(prompt) {
                return Ok(collected);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_comes_from_the_last_banner_line() {
        let banner = "Last login: never\r\nsome motd\r\nvm-t1-leaf03>";
        assert_eq!(extract_hostname(banner), "vm-t1-leaf03#");
        assert_eq!(extract_hostname("switch>"), "switch#");
    }

    #[test]
    fn reboot_exit_codes() {
        assert!(reboot_exit_ok(0));
        assert!(reboot_exit_ok(255));
        assert!(!reboot_exit_ok(1));
        assert!(!reboot_exit_ok(127));
    }

    #[tokio::test]
    async fn shell_round_trips_against_a_scripted_child() {
        // A stand-in "router": echoes every command, then prints the prompt.
        let script = r#"echo "sw>"; while read line; do echo "got: $line"; echo "sw#"; done"#;
        let child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        let mut shell = InteractiveShell::from_child(child).unwrap();
        let banner = shell.read_until(">").await.unwrap();
        shell.set_hostname(extract_hostname(&banner));
        assert_eq!(shell.hostname(), "sw#");

        let out = shell.do_cmd("show lacp neighbor").await.unwrap();
        assert!(out.contains("got: show lacp neighbor"));
        assert!(out.contains("sw#"));
    }
}
