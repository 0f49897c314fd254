//! SSH transport for esxup.
//!
//! Implements the session traits with `ssh2` over a plain `TcpStream`.
//! The blocking libssh2 API runs under `tokio::task::spawn_blocking`;
//! each remote operation opens its own connection, so no libssh2 state
//! has to live across await points. Host identity is checked against a
//! dedicated known-hosts file: first contact records the key silently, a
//! changed key surfaces as a trust mismatch for the orchestrator to
//! confirm.

mod trust;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use esxup_session::{Connector, Credential, RemoteSession, TransportError};

use crate::trust::verify_host_key;

const DEFAULT_PORT: u16 = 22;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default location of the recorded host identities:
/// `~/.esxup/known_hosts`.
#[must_use]
pub fn default_known_hosts_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".esxup").join("known_hosts"))
}

#[derive(Debug, Clone)]
pub struct SshConnector {
    known_hosts: PathBuf,
    timeout: Duration,
}

impl SshConnector {
    #[must_use]
    pub fn new(known_hosts: PathBuf) -> Self {
        Self {
            known_hosts,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        host: &str,
        credential: &Credential,
        accept_changed_key: bool,
    ) -> Result<Box<dyn RemoteSession>, TransportError> {
        let session = SshSession {
            host: host.to_string(),
            credential: credential.clone(),
            known_hosts: self.known_hosts.clone(),
            timeout: self.timeout,
        };

        // Authentication and trust are verified up front so the
        // orchestrator sees mismatches before it starts executing.
        let probe = session.clone();
        tokio::task::spawn_blocking(move || {
            probe.open_authenticated(accept_changed_key).map(|_| ())
        })
        .await
        .map_err(|error| TransportError::failed(host, "connection", error.to_string()))??;

        debug!("connected to {host}");
        Ok(Box::new(session))
    }
}

#[derive(Clone)]
struct SshSession {
    host: String,
    credential: Credential,
    known_hosts: PathBuf,
    timeout: Duration,
}

impl SshSession {
    fn host_port(&self) -> (String, u16) {
        if let Some((name, port)) = self.host.rsplit_once(':')
            && let Ok(port) = port.parse::<u16>()
        {
            return (name.to_string(), port);
        }
        (self.host.clone(), DEFAULT_PORT)
    }

    /// Open a TCP connection, handshake, verify the host key against the
    /// known-hosts file, and authenticate. Blocking.
    fn open_authenticated(
        &self,
        accept_changed_key: bool,
    ) -> Result<ssh2::Session, TransportError> {
        let (name, port) = self.host_port();

        let tcp = TcpStream::connect((name.as_str(), port)).map_err(|error| {
            TransportError::failed(&self.host, "connection", format!("{name}:{port}: {error}"))
        })?;
        tcp.set_read_timeout(Some(self.timeout)).ok();
        tcp.set_write_timeout(Some(self.timeout)).ok();

        let mut session = ssh2::Session::new().map_err(|error| {
            TransportError::failed(&self.host, "session setup", error.to_string())
        })?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|error| TransportError::failed(&self.host, "handshake", error.to_string()))?;

        verify_host_key(
            &session,
            &self.host,
            &name,
            port,
            &self.known_hosts,
            accept_changed_key,
        )?;

        session
            .userauth_password(&self.credential.username, &self.credential.password)
            .map_err(|error| {
                TransportError::failed(&self.host, "authentication", error.to_string())
            })?;
        if !session.authenticated() {
            return Err(TransportError::failed(
                &self.host,
                "authentication",
                "password rejected",
            ));
        }

        Ok(session)
    }

    fn exec_blocking(&self, command: &str) -> Result<String, TransportError> {
        let session = self.open_authenticated(false)?;
        let mut channel = session.channel_session().map_err(|error| {
            TransportError::failed(&self.host, "channel open", error.to_string())
        })?;

        let wrapped = format!("sh -c {}", shell_escape::escape(command.into()));
        channel
            .exec(&wrapped)
            .map_err(|error| TransportError::failed(&self.host, "command execution", error.to_string()))?;

        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .map_err(|error| TransportError::failed(&self.host, "command output", error.to_string()))?;
        let mut stderr = String::new();
        let _ = channel.stderr().read_to_string(&mut stderr);
        let exit_status = channel.exit_status().unwrap_or(0);
        channel.wait_close().ok();

        if exit_status != 0 && stdout.trim().is_empty() {
            let details = if stderr.trim().is_empty() {
                format!("exit status {exit_status}")
            } else {
                stderr.trim().to_string()
            };
            return Err(TransportError::failed(
                &self.host,
                "command execution",
                details,
            ));
        }

        Ok(stdout)
    }

    fn upload_blocking(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let contents = std::fs::read(local).map_err(|error| {
            TransportError::failed(
                &self.host,
                "file upload",
                format!("{}: {error}", local.display()),
            )
        })?;

        let session = self.open_authenticated(false)?;
        let mut channel = session
            .scp_send(Path::new(remote), 0o644, contents.len() as u64, None)
            .map_err(|error| TransportError::failed(&self.host, "file upload", error.to_string()))?;
        channel
            .write_all(&contents)
            .map_err(|error| TransportError::failed(&self.host, "file upload", error.to_string()))?;
        channel.send_eof().ok();
        channel.wait_eof().ok();
        channel.wait_close().ok();
        Ok(())
    }

    fn download_blocking(&self, remote: &str, local: &Path) -> Result<(), TransportError> {
        let session = self.open_authenticated(false)?;
        let (mut channel, stat) = session.scp_recv(Path::new(remote)).map_err(|error| {
            TransportError::failed(&self.host, "file download", error.to_string())
        })?;

        let mut contents = Vec::with_capacity(usize::try_from(stat.size()).unwrap_or(0));
        channel
            .read_to_end(&mut contents)
            .map_err(|error| TransportError::failed(&self.host, "file download", error.to_string()))?;
        channel.send_eof().ok();
        channel.wait_eof().ok();
        channel.wait_close().ok();

        std::fs::write(local, contents).map_err(|error| {
            TransportError::failed(
                &self.host,
                "file download",
                format!("{}: {error}", local.display()),
            )
        })
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&self, command: &str) -> Result<String, TransportError> {
        debug!("exec on {}: {command}", self.host);
        let session = self.clone();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || session.exec_blocking(&command))
            .await
            .map_err(|error| {
                TransportError::failed(&self.host, "command execution", error.to_string())
            })?
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        debug!("upload to {}: {remote}", self.host);
        let session = self.clone();
        let local = local.to_path_buf();
        let remote = remote.to_string();
        tokio::task::spawn_blocking(move || session.upload_blocking(&local, &remote))
            .await
            .map_err(|error| TransportError::failed(&self.host, "file upload", error.to_string()))?
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<(), TransportError> {
        debug!("download from {}: {remote}", self.host);
        let session = self.clone();
        let local = local.to_path_buf();
        let remote = remote.to_string();
        tokio::task::spawn_blocking(move || session.download_blocking(&remote, &local))
            .await
            .map_err(|error| {
                TransportError::failed(&self.host, "file download", error.to_string())
            })?
    }
}
