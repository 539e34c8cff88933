//! Transport abstraction for child processes.
//!
//! [`ChildTransport`] is the seam between [`crate::child::ChildClient`] and
//! the underlying I/O. The trait only creates raw handles; the client owns
//! the reader and exit-watch tasks because they are coupled to its pending
//! map. Production code uses [`ProcessTransport`] (spawns the configured
//! command); [`MockTransport`] is an in-memory double for tests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::ChildSpec;
use crate::error::WrapperError;

/// Raw I/O handles produced by a successful [`ChildTransport::spawn`].
pub struct RawChildIo {
    /// Stdin writer for the child. The client wraps it in a mutex so that
    /// aggregator-originated requests and parent-forwarded traffic serialize
    /// at message granularity.
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Raw stdout reader, consumed by the client's reader task.
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// The process handle, retained for exit-status collection. `None` for
    /// transports that do not spawn a real process.
    pub process: Arc<Mutex<Option<Child>>>,
}

impl fmt::Debug for RawChildIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawChildIo").finish_non_exhaustive()
    }
}

/// Abstracts how a child server's I/O comes into existence.
#[async_trait]
pub trait ChildTransport: Send + Sync + fmt::Debug {
    /// Start the child (or equivalent) and return raw I/O handles.
    ///
    /// # Errors
    ///
    /// Returns [`WrapperError::Spawn`] when the underlying process cannot be
    /// started (missing executable, permissions).
    async fn spawn(&self) -> Result<RawChildIo, WrapperError>;
}

/// Production transport: spawns the spec's command as a subprocess.
///
/// The child's environment is the wrapper's own environment with the spec's
/// `env` map overlaid. stderr is inherited so the child's human-readable
/// diagnostics flow through to the wrapper's stderr unchanged.
#[derive(Debug)]
pub struct ProcessTransport {
    spec: ChildSpec,
}

impl ProcessTransport {
    pub fn new(spec: ChildSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl ChildTransport for ProcessTransport {
    async fn spawn(&self) -> Result<RawChildIo, WrapperError> {
        let mut cmd = Command::new(&self.spec.command);
        cmd.args(&self.spec.args)
            .envs(&self.spec.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit());

        let mut child = cmd.spawn().map_err(|source| WrapperError::Spawn {
            command: self.spec.command.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| WrapperError::Spawn {
            command: self.spec.command.clone(),
            source: std::io::Error::other("child stdin unavailable after spawn"),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| WrapperError::Spawn {
            command: self.spec.command.clone(),
            source: std::io::Error::other("child stdout unavailable after spawn"),
        })?;

        Ok(RawChildIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            process: Arc::new(Mutex::new(Some(child))),
        })
    }
}

/// In-memory transport for tests: the "child" is a pair of duplex pipes the
/// test drives through a [`MockTransportHandle`].
pub struct MockTransport {
    /// (stdin writer, stdout reader) for the client side, consumed on spawn.
    io: Mutex<Option<(tokio::io::DuplexStream, tokio::io::DuplexStream)>>,
}

/// Test-side ends of a [`MockTransport`]: read what the client wrote, write
/// what the client should receive.
pub struct MockTransportHandle {
    /// Reads the bytes the client wrote to the child's stdin.
    pub child_stdin: tokio::io::DuplexStream,
    /// Writes bytes that appear on the child's stdout.
    pub child_stdout: tokio::io::DuplexStream,
}

impl MockTransport {
    /// Create a transport and the handle the test uses to play the child.
    pub fn pair() -> (Self, MockTransportHandle) {
        let (stdin_writer, stdin_reader) = tokio::io::duplex(64 * 1024);
        let (stdout_writer, stdout_reader) = tokio::io::duplex(64 * 1024);
        let handle = MockTransportHandle {
            child_stdin: stdin_reader,
            child_stdout: stdout_writer,
        };
        (
            Self {
                io: Mutex::new(Some((stdin_writer, stdout_reader))),
            },
            handle,
        )
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport").finish_non_exhaustive()
    }
}

impl fmt::Debug for MockTransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransportHandle").finish_non_exhaustive()
    }
}

#[async_trait]
impl ChildTransport for MockTransport {
    async fn spawn(&self) -> Result<RawChildIo, WrapperError> {
        let (stdin, stdout) = self.io.lock().await.take().ok_or_else(|| WrapperError::Spawn {
            command: "<mock>".to_string(),
            source: std::io::Error::other("mock transport already spawned"),
        })?;
        Ok(RawChildIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            process: Arc::new(Mutex::new(None)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_process_transport_spawn_missing_binary() {
        let transport = ProcessTransport::new(ChildSpec {
            name: None,
            command: "/nonexistent/binary/that/does/not/exist".to_string(),
            args: Vec::new(),
            env: Default::default(),
        });
        let err = transport.spawn().await.expect_err("spawn must fail");
        assert!(matches!(err, WrapperError::Spawn { .. }));
        assert!(err.to_string().contains("/nonexistent/binary"));
    }

    #[tokio::test]
    async fn test_process_transport_spawn_cat_round_trip() {
        let transport = ProcessTransport::new(ChildSpec {
            name: None,
            command: "cat".to_string(),
            args: Vec::new(),
            env: Default::default(),
        });
        let Ok(io) = transport.spawn().await else {
            // `cat` can be absent in minimal CI images.
            return;
        };

        let mut stdin = io.stdin;
        stdin.write_all(b"hello\n").await.unwrap();
        stdin.flush().await.unwrap();
        let mut stdout = io.stdout;
        let mut buf = [0u8; 6];
        stdout.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\n");

        if let Some(mut child) = io.process.lock().await.take() {
            let _ = child.kill().await;
        }
    }

    #[tokio::test]
    async fn test_mock_transport_round_trip() {
        let (transport, mut handle) = MockTransport::pair();
        let io = transport.spawn().await.unwrap();

        let mut stdin = io.stdin;
        stdin.write_all(b"ping\n").await.unwrap();
        stdin.flush().await.unwrap();
        let mut buf = [0u8; 5];
        handle.child_stdin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping\n");

        handle.child_stdout.write_all(b"pong\n").await.unwrap();
        let mut stdout = io.stdout;
        let mut buf = [0u8; 5];
        stdout.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong\n");
    }

    #[tokio::test]
    async fn test_mock_transport_single_use() {
        let (transport, _handle) = MockTransport::pair();
        transport.spawn().await.unwrap();
        assert!(transport.spawn().await.is_err());
    }
}
