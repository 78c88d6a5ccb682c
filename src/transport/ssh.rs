//! SSH transport driving the VyOS configuration shell.
//!
//! libssh2 is blocking, so every shell exchange runs on the blocking pool.
//! The shell is opened once per session and kept in configuration mode
//! between calls.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use regex_lite::Regex;

use super::{Transport, TransportError, TransportFactory};
use crate::models::Instance;
use crate::utils;

/// Output fragments VyOS prints when it refuses a command
const ERROR_MARKERS: &[&str] = &[
    "Invalid command",
    "Set failed",
    "Delete failed",
    "is not valid",
    "Commit failed",
    "Configuration path:",
    "Nothing to delete",
];

const READ_CHUNK: usize = 4096;

/// libssh2 read/write timeouts, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IoTimeouts {
    stage_ms: u32,
    commit_ms: u32,
}

/// Opens SSH shell transports with the configured timeouts
pub struct SshTransportFactory {
    connect_timeout_secs: u64,
    timeouts: IoTimeouts,
}

impl SshTransportFactory {
    pub fn new(connect_timeout_secs: u64, stage_timeout_secs: u64, commit_timeout_secs: u64) -> Self {
        Self {
            connect_timeout_secs,
            timeouts: IoTimeouts {
                stage_ms: utils::timeout_ms(stage_timeout_secs),
                commit_ms: utils::timeout_ms(commit_timeout_secs),
            },
        }
    }
}

#[async_trait]
impl TransportFactory for SshTransportFactory {
    async fn connect(&self, instance: &Instance) -> Result<Box<dyn Transport>, TransportError> {
        let host = instance.endpoint.host.clone();
        let port = instance.endpoint.port;
        let user = instance.endpoint.username.clone();
        let pass = instance.endpoint.password.clone();
        let connect_timeout = self.connect_timeout_secs;
        let timeouts = self.timeouts;

        tracing::debug!("Opening SSH shell to {}:{} as {}", host, port, user);
        let shell = tokio::task::spawn_blocking(move || {
            Shell::open(&host, port, &user, &pass, connect_timeout, timeouts)
        })
        .await
        .map_err(|e| TransportError::Connection(format!("Task join error: {}", e)))??;

        Ok(Box::new(SshTransport {
            shell: Arc::new(Mutex::new(shell)),
        }))
    }
}

/// Transport over one interactive VyOS shell
pub struct SshTransport {
    shell: Arc<Mutex<Shell>>,
}

impl SshTransport {
    async fn run<T, F>(&self, f: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Shell) -> Result<T, TransportError> + Send + 'static,
    {
        let shell = self.shell.clone();
        tokio::task::spawn_blocking(move || {
            let mut shell = shell.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut shell)
        })
        .await
        .map_err(|e| TransportError::Io(format!("Task join error: {}", e)))?
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn stage(&mut self, command: &str) -> Result<(), TransportError> {
        let command = command.to_string();
        self.run(move |shell| {
            let output = shell.exchange(&command)?;
            match rejection(&output) {
                Some(detail) => Err(TransportError::Rejected(detail)),
                None => Ok(()),
            }
        })
        .await
    }

    async fn commit(&mut self) -> Result<(), TransportError> {
        self.run(|shell| {
            let output = shell.commit()?;
            match rejection(&output) {
                Some(detail) => Err(TransportError::Rejected(detail)),
                None => Ok(()),
            }
        })
        .await
    }

    async fn discard(&mut self) -> Result<(), TransportError> {
        self.run(|shell| {
            shell.exchange("exit discard")?;
            shell.exchange("configure")?;
            Ok(())
        })
        .await
    }

    async fn detect_version(&mut self) -> Result<String, TransportError> {
        self.run(|shell| {
            let output = shell.exchange("run show version")?;
            parse_version(&output).ok_or_else(|| {
                TransportError::Io(format!(
                    "could not parse version from:\n{}",
                    utils::truncate_lines(&output, 5)
                ))
            })
        })
        .await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.run(|shell| {
            shell.exchange("exit discard")?;
            shell.close();
            Ok(())
        })
        .await
    }
}

/// Interactive shell channel plus the session that owns it
struct Shell {
    session: ssh2::Session,
    channel: ssh2::Channel,
    prompt: Regex,
    timeouts: IoTimeouts,
}

impl Shell {
    fn open(
        host: &str,
        port: u16,
        user: &str,
        pass: &str,
        connect_timeout: u64,
        timeouts: IoTimeouts,
    ) -> Result<Self, TransportError> {
        let session = utils::ssh_connect(host, port, user, pass, connect_timeout)
            .map_err(TransportError::Connection)?;
        session.set_timeout(timeouts.stage_ms);

        let mut channel = session
            .channel_session()
            .map_err(|e| TransportError::Connection(format!("Failed to open channel: {}", e)))?;
        channel
            .request_pty("xterm", None, Some((512, 48, 0, 0)))
            .map_err(|e| TransportError::Connection(format!("Failed to request PTY: {}", e)))?;
        channel
            .shell()
            .map_err(|e| TransportError::Connection(format!("Failed to start shell: {}", e)))?;

        let prompt = Regex::new(r"[\w.\-]+@[\w.\-]+(?::\S*)?[$#]\s*$")
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let mut shell = Self {
            session,
            channel,
            prompt,
            timeouts,
        };

        shell.read_until_prompt()?;
        shell.exchange("set terminal length 0")?;
        shell.exchange("set terminal width 0")?;
        shell.exchange("configure")?;
        Ok(shell)
    }

    /// Send one line and return everything up to the next prompt
    fn exchange(&mut self, line: &str) -> Result<String, TransportError> {
        self.channel
            .write_all(format!("{}\n", line).as_bytes())
            .map_err(|e| TransportError::Io(format!("write failed: {}", e)))?;
        self.channel
            .flush()
            .map_err(|e| TransportError::Io(format!("flush failed: {}", e)))?;
        let output = self.read_until_prompt()?;
        tracing::trace!("vyos> {}\n{}", line, output);
        Ok(output)
    }

    /// `commit` under the commit timeout; the stage timeout is restored after
    fn commit(&mut self) -> Result<String, TransportError> {
        self.session.set_timeout(self.timeouts.commit_ms);
        let output = self.exchange("commit");
        self.session.set_timeout(self.timeouts.stage_ms);
        output
    }

    fn read_until_prompt(&mut self) -> Result<String, TransportError> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = self
                .channel
                .read(&mut chunk)
                .map_err(|e| TransportError::Io(format!("read failed: {}", e)))?;
            if n == 0 {
                return Err(TransportError::Io("shell channel closed".to_string()));
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if self.prompt.is_match(&text) {
                return Ok(text.replace('\r', ""));
            }
        }
    }

    fn close(&mut self) {
        let _ = self.channel.write_all(b"exit\n");
        let _ = self.channel.send_eof();
        let _ = self.channel.close();
    }
}

/// First line carrying a VyOS error marker, if any
fn rejection(output: &str) -> Option<String> {
    let lines: Vec<&str> = output.lines().collect();
    let body = lines.get(1..lines.len().saturating_sub(1)).unwrap_or(&[]);
    body.iter()
        .find(|line| ERROR_MARKERS.iter().any(|m| line.contains(m)))
        .map(|line| line.trim().to_string())
}

fn parse_version(output: &str) -> Option<String> {
    let re = Regex::new(r"Version:\s+VyOS\s+(\S+)").ok()?;
    re.captures(output).map(|caps| caps[1].to_string())
}
