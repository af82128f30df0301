//! Connection providers: how bytes reach a language server.
//!
//! A [`ConnectionProvider`] opens a byte-stream connection to one server
//! process and tears it down again. Two variants exist:
//!
//! - [`ProcessConnection`] talks to the child over its stdin/stdout.
//! - [`SocketConnection`] listens on a local TCP port, launches the child,
//!   and talks over the socket the child connects back to.
//!
//! Streams handed out by [`ConnectionProvider::start`] are only meaningful
//! until the matching [`ConnectionProvider::stop`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::LspResult;
use crate::error::LspError;

/// How long [`SocketConnection`] waits for the server to connect back.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Placeholder replaced by the bound port in socket launch commands.
pub const PORT_PLACEHOLDER: &str = "${port}";

const KILL_GRACE: Duration = Duration::from_secs(1);

/// Byte streams of an established connection.
pub struct ConnectionStreams {
    /// Messages from the server.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Messages to the server.
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// The server's diagnostic output, if any.
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
}

impl fmt::Debug for ConnectionStreams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStreams")
            .field("stderr", &self.stderr.is_some())
            .finish_non_exhaustive()
    }
}

/// Opens and closes the byte-stream connection to one server.
#[async_trait]
pub trait ConnectionProvider: Send + Sync + fmt::Debug {
    /// Establishes the connection.
    ///
    /// # Errors
    ///
    /// Returns [`LspError::ConnectionFailed`] if the process cannot be
    /// launched or the connection cannot be established.
    async fn start(&mut self) -> LspResult<ConnectionStreams>;

    /// Terminates the process and releases the connection. Idempotent.
    async fn stop(&mut self);
}

/// Launches a server and talks to it over stdio.
#[derive(Debug)]
pub struct ProcessConnection {
    commands: Vec<String>,
    working_dir: PathBuf,
    child: Option<Child>,
}

impl ProcessConnection {
    /// Creates a provider for `commands` run in `working_dir`.
    ///
    /// Single quotes are stripped from every command word.
    pub fn new(commands: Vec<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            commands: sanitize(commands),
            working_dir: working_dir.into(),
            child: None,
        }
    }

    /// Command line of the server.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// Directory the server runs in.
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }
}

impl PartialEq for ProcessConnection {
    fn eq(&self, other: &Self) -> bool {
        self.commands == other.commands && self.working_dir == other.working_dir
    }
}

impl Eq for ProcessConnection {}

#[async_trait]
impl ConnectionProvider for ProcessConnection {
    async fn start(&mut self) -> LspResult<ConnectionStreams> {
        self.stop().await;

        let mut child = spawn(&self.commands, &self.working_dir, true)?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            let _ = child.start_kill();
            return Err(LspError::ConnectionFailed(
                "server stdio was not captured".to_string(),
            ));
        };

        self.child = Some(child);
        Ok(ConnectionStreams {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            stderr: stderr.map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
        })
    }

    async fn stop(&mut self) {
        if let Some(child) = self.child.take() {
            terminate(child, &self.commands).await;
        }
    }
}

/// Launches a server that connects back to a local TCP socket.
///
/// The listener is bound before the process starts, so a `${port}` word in
/// the command line can be replaced by the actual port. Only one
/// connection is accepted.
#[derive(Debug)]
pub struct SocketConnection {
    commands: Vec<String>,
    working_dir: PathBuf,
    port: u16,
    accept_timeout: Duration,
    child: Option<Child>,
    bound_port: Option<u16>,
}

impl SocketConnection {
    /// Creates a provider listening on `port` (0 picks an ephemeral port).
    pub fn new(commands: Vec<String>, working_dir: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            commands: sanitize(commands),
            working_dir: working_dir.into(),
            port,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            child: None,
            bound_port: None,
        }
    }

    /// Overrides how long to wait for the server to connect.
    #[must_use]
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Configured port (0 for ephemeral).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Port the listener was bound to by the last `start`.
    pub fn bound_port(&self) -> Option<u16> {
        self.bound_port
    }
}

impl PartialEq for SocketConnection {
    fn eq(&self, other: &Self) -> bool {
        self.commands == other.commands
            && self.working_dir == other.working_dir
            && self.port == other.port
    }
}

impl Eq for SocketConnection {}

#[async_trait]
impl ConnectionProvider for SocketConnection {
    async fn start(&mut self) -> LspResult<ConnectionStreams> {
        self.stop().await;

        if self.commands.is_empty() {
            return Err(LspError::ConnectionFailed("empty server command".to_string()));
        }

        let listener = TcpListener::bind(("127.0.0.1", self.port))
            .await
            .map_err(|e| LspError::ConnectionFailed(format!("bind port {}: {e}", self.port)))?;
        let port = listener
            .local_addr()
            .map_err(|e| LspError::ConnectionFailed(e.to_string()))?
            .port();
        self.bound_port = Some(port);

        let commands: Vec<String> = self
            .commands
            .iter()
            .map(|word| word.replace(PORT_PLACEHOLDER, &port.to_string()))
            .collect();

        let mut child = spawn(&commands, &self.working_dir, false)?;
        let stderr = child.stderr.take();

        debug!(port, timeout = ?self.accept_timeout, "waiting for language server to connect");
        let accepted = tokio::time::timeout(self.accept_timeout, listener.accept()).await;
        // The listener closes here whatever the outcome.
        drop(listener);

        let stream = match accepted {
            Ok(Ok((stream, addr))) => {
                info!(port, peer = %addr, "language server connected");
                stream
            }
            Ok(Err(e)) => {
                terminate(child, &commands).await;
                return Err(LspError::ConnectionFailed(format!("accept on port {port}: {e}")));
            }
            Err(_) => {
                terminate(child, &commands).await;
                return Err(LspError::ConnectionFailed(format!(
                    "no connection on port {port} within {} ms",
                    self.accept_timeout.as_millis()
                )));
            }
        };

        let (read, write) = stream.into_split();
        self.child = Some(child);
        Ok(ConnectionStreams {
            reader: Box::new(read),
            writer: Box::new(write),
            stderr: stderr.map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
        })
    }

    async fn stop(&mut self) {
        self.bound_port = None;
        if let Some(child) = self.child.take() {
            terminate(child, &self.commands).await;
        }
    }
}

fn sanitize(commands: Vec<String>) -> Vec<String> {
    commands
        .into_iter()
        .map(|word| word.replace('\'', ""))
        .collect()
}

fn spawn(commands: &[String], working_dir: &Path, stdio: bool) -> LspResult<Child> {
    let Some((program, args)) = commands.split_first() else {
        return Err(LspError::ConnectionFailed("empty server command".to_string()));
    };

    info!(
        command = %commands.join(" "),
        working_dir = %working_dir.display(),
        "starting language server process"
    );

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(working_dir)
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if stdio {
        command.stdin(Stdio::piped()).stdout(Stdio::piped());
    } else {
        command.stdin(Stdio::null()).stdout(Stdio::null());
    }

    let mut child = command
        .spawn()
        .map_err(|e| LspError::ConnectionFailed(format!("{program}: {e}")))?;

    match child.try_wait() {
        Ok(None) => Ok(child),
        Ok(Some(status)) => Err(LspError::ConnectionFailed(format!(
            "{program} exited immediately with {status}"
        ))),
        Err(e) => {
            let _ = child.start_kill();
            Err(LspError::ConnectionFailed(format!("{program}: {e}")))
        }
    }
}

async fn terminate(mut child: Child, commands: &[String]) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "language server already exited");
    }
    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!(command = %commands.join(" "), %status, "language server stopped"),
        Ok(Err(e)) => warn!(error = %e, "failed to reap language server"),
        Err(_) => warn!(command = %commands.join(" "), "language server did not exit after kill"),
    }
}
