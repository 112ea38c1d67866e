//! Transport bindings for spawned server processes.
//!
//! A server process is reached over one of three bindings: piped standard
//! streams, a localhost socket the runtime pre-opens, or an in-process
//! duplex channel for runtimes that can be driven without a separate
//! process. Whatever the binding, the result is a [`Channel`] of framed
//! bytes handed to the connection layer.
//!
//! Transport misconfiguration (a missing stdio handle, a failed bind) is
//! fatal: logged, surfaced as an error, never retried.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};

use liaison_types::{ServerSpec, TransportKind};

const ACCEPT_TIMEOUT_SECS: u64 = 10;

/// Lines of child stderr retained for crash reports.
const STDERR_TAIL_LINES: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{command} not found in PATH")]
    CommandNotFound {
        command: String,
        #[source]
        source: which::Error,
    },
    #[error("failed to spawn {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("stdio transport misconfigured: child has no {0} handle")]
    MissingStdio(&'static str),
    #[error("failed to bind local socket")]
    Bind(#[source] std::io::Error),
    #[error("server did not connect to the socket within {ACCEPT_TIMEOUT_SECS}s")]
    AcceptTimeout,
    #[error("socket accept failed")]
    Accept(#[source] std::io::Error),
    #[error("ipc transport cannot spawn an external process; attach via Channel::in_process")]
    IpcNotSpawnable,
}

/// A framed duplex byte channel to a server.
pub struct Channel {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl Channel {
    /// An in-process channel pair: one end for the runtime, one for the
    /// embedded server (or a test double).
    #[must_use]
    pub fn in_process() -> (Channel, Channel) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (
            Channel {
                reader: Box::new(a_read),
                writer: Box::new(a_write),
            },
            Channel {
                reader: Box::new(b_read),
                writer: Box::new(b_write),
            },
        )
    }
}

/// Tail buffer over a child's stderr, kept for diagnostic reporting.
#[derive(Clone, Default)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// The last few stderr lines, newline-joined, for crash reports.
    #[must_use]
    pub fn report(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// A spawned server process plus its channel and stderr tail.
pub struct ServerProcess {
    child: Option<Child>,
    channel: Option<Channel>,
    stderr_tail: StderrTail,
    command: String,
}

impl ServerProcess {
    /// Spawn `spec.command` under `root` and connect per `spec.transport`.
    pub async fn spawn(spec: &ServerSpec, root: &Path) -> Result<Self, TransportError> {
        match spec.transport {
            TransportKind::Stdio => Self::spawn_stdio(spec, root).await,
            TransportKind::Socket => Self::spawn_socket(spec, root).await,
            TransportKind::Ipc => Err(TransportError::IpcNotSpawnable),
        }
    }

    /// Wrap an in-process channel as a process-less server, for embedded
    /// runtimes and tests.
    #[must_use]
    pub fn from_channel(channel: Channel) -> Self {
        Self {
            child: None,
            channel: Some(channel),
            stderr_tail: StderrTail::default(),
            command: String::from("<in-process>"),
        }
    }

    async fn spawn_stdio(spec: &ServerSpec, root: &Path) -> Result<Self, TransportError> {
        let resolved = which::which(&spec.command).map_err(|source| {
            TransportError::CommandNotFound {
                command: spec.command.clone(),
                source,
            }
        })?;

        let mut child = Command::new(&resolved)
            .args(&spec.args)
            .current_dir(root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransportError::Spawn {
                command: spec.command.clone(),
                source,
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or(TransportError::MissingStdio("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(TransportError::MissingStdio("stdout"))?;
        let stderr_tail = Self::watch_stderr(&mut child, &spec.command);

        Ok(Self {
            child: Some(child),
            channel: Some(Channel {
                reader: Box::new(stdout),
                writer: Box::new(stdin),
            }),
            stderr_tail,
            command: spec.command.clone(),
        })
    }

    async fn spawn_socket(spec: &ServerSpec, root: &Path) -> Result<Self, TransportError> {
        let resolved = which::which(&spec.command).map_err(|source| {
            TransportError::CommandNotFound {
                command: spec.command.clone(),
                source,
            }
        })?;

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(TransportError::Bind)?;
        let port = listener
            .local_addr()
            .map_err(TransportError::Bind)?
            .port();

        // The port reaches the child through a `{port}` placeholder in its
        // configured args, or as a trailing argument when none is present.
        let mut args: Vec<String> = Vec::with_capacity(spec.args.len() + 1);
        let mut substituted = false;
        for arg in &spec.args {
            if arg.contains("{port}") {
                args.push(arg.replace("{port}", &port.to_string()));
                substituted = true;
            } else {
                args.push(arg.clone());
            }
        }
        if !substituted {
            args.push(port.to_string());
        }

        let mut child = Command::new(&resolved)
            .args(&args)
            .current_dir(root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransportError::Spawn {
                command: spec.command.clone(),
                source,
            })?;
        let stderr_tail = Self::watch_stderr(&mut child, &spec.command);

        let accept = tokio::time::timeout(
            Duration::from_secs(ACCEPT_TIMEOUT_SECS),
            listener.accept(),
        )
        .await;
        let (stream, _addr) = match accept {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(TransportError::Accept(e)),
            Err(_) => return Err(TransportError::AcceptTimeout),
        };
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            child: Some(child),
            channel: Some(Channel {
                reader: Box::new(read_half),
                writer: Box::new(write_half),
            }),
            stderr_tail,
            command: spec.command.clone(),
        })
    }

    /// Tail-buffer the child's stderr; each line is also logged at debug.
    fn watch_stderr(child: &mut Child, command: &str) -> StderrTail {
        let tail = StderrTail::default();
        if let Some(stderr) = child.stderr.take() {
            let tail_clone = tail.clone();
            let command = command.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %command, "stderr: {line}");
                    tail_clone.push(line);
                }
            });
        }
        tail
    }

    /// Take the channel; valid exactly once, when the connection is built.
    pub fn take_channel(&mut self) -> Option<Channel> {
        self.channel.take()
    }

    #[must_use]
    pub fn stderr_tail(&self) -> StderrTail {
        self.stderr_tail.clone()
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Wait for the child to exit, up to `timeout`. Returns `true` when
    /// the process is gone (or there never was one).
    pub async fn wait_with_timeout(&mut self, timeout: Duration) -> bool {
        match self.child.as_mut() {
            Some(child) => tokio::time::timeout(timeout, child.wait()).await.is_ok(),
            None => true,
        }
    }

    /// Forcibly terminate the child, if any.
    pub async fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill().await;
        }
    }
}
