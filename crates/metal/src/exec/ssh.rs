//! SSH remote shell backed by libssh2.
//!
//! libssh2 is blocking, so every call runs on tokio's blocking pool. A
//! session is used by one provisioning step at a time.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ssh2::{ExtendedData, Session};
use tracing::debug;

use super::{RemoteSession, RemoteShell};
use crate::config::{AuthMethod, NodeConfig};
use crate::error::{Error, Result};

/// Default connect/handshake timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Production [`RemoteShell`] over SSH.
#[derive(Debug, Clone)]
pub struct SshShell {
    connect_timeout: Duration,
}

impl Default for SshShell {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl SshShell {
    /// Create a shell with the default connect timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn connect(&self, node: &NodeConfig) -> Result<Box<dyn RemoteSession>> {
        let node = node.clone();
        let timeout = self.connect_timeout;
        let session = tokio::task::spawn_blocking(move || open_session(&node, timeout))
            .await
            .map_err(|e| Error::command("ssh connect", e.to_string()))??;
        Ok(Box::new(session))
    }
}

fn open_session(node: &NodeConfig, timeout: Duration) -> Result<SshSession> {
    let target = node.ssh_address();
    let conn_err = |e: &dyn std::fmt::Display| Error::connection(&target, e.to_string());

    let addr = target
        .to_socket_addrs()
        .map_err(|e| conn_err(&e))?
        .next()
        .ok_or_else(|| Error::connection(&target, "address did not resolve"))?;
    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| conn_err(&e))?;

    let mut session = Session::new().map_err(|e| conn_err(&e))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
    session.handshake().map_err(|e| conn_err(&e))?;

    let auth = node
        .credentials
        .auth_method()
        .ok_or_else(|| Error::validation(format!("{}: no SSH credentials", node.host)))?;
    let authenticated = match &auth {
        AuthMethod::KeyMaterial(pem) => {
            session.userauth_pubkey_memory(&node.user, None, pem, None)
        }
        AuthMethod::KeyFile(path) => session.userauth_pubkey_file(&node.user, None, path, None),
        AuthMethod::Password(password) => session.userauth_password(&node.user, password),
    };
    authenticated
        .map_err(|e| Error::connection(&target, format!("authentication failed: {e}")))?;

    if !session.authenticated() {
        return Err(Error::connection(&target, "authentication rejected"));
    }

    // Commands may run for minutes (installer scripts); no read timeout.
    session.set_timeout(0);
    debug!(target = %target, user = %node.user, "SSH session established");

    Ok(SshSession {
        session: Arc::new(session),
        target,
        sudo: node.user != "root",
    })
}

struct SshSession {
    session: Arc<Session>,
    target: String,
    sudo: bool,
}

impl SshSession {
    fn wrap(&self, command: &str) -> String {
        if self.sudo {
            format!("sudo -n sh -c '{}'", command.replace('\'', r"'\''"))
        } else {
            command.to_string()
        }
    }
}

/// Drain a channel. Installers may print bytes that are not UTF-8.
fn read_output(reader: &mut impl Read) -> std::io::Result<String> {
    let mut raw = Vec::new();
    reader.read_to_end(&mut raw)?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

fn exec(session: &Session, target: &str, command: &str) -> Result<String> {
    let mut channel = session
        .channel_session()
        .map_err(|e| Error::connection(target, e.to_string()))?;
    channel
        .handle_extended_data(ExtendedData::Merge)
        .map_err(|e| Error::connection(target, e.to_string()))?;
    channel
        .exec(command)
        .map_err(|e| Error::connection(target, e.to_string()))?;

    let output = read_output(&mut channel)?;
    channel
        .wait_close()
        .map_err(|e| Error::connection(target, e.to_string()))?;

    let status = channel
        .exit_status()
        .map_err(|e| Error::connection(target, e.to_string()))?;
    if status == 0 {
        Ok(output)
    } else {
        Err(Error::command(
            format!("`{command}` on {target}"),
            format!("exit status {status}: {}", output.trim()),
        ))
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn run(&self, command: &str) -> Result<String> {
        let session = Arc::clone(&self.session);
        let target = self.target.clone();
        let command = self.wrap(command);
        debug!(target = %target, command = %command, "Running remote command");

        tokio::task::spawn_blocking(move || exec(&session, &target, &command))
            .await
            .map_err(|e| Error::command("ssh exec", e.to_string()))?
    }

    async fn close(&self) {
        let session = Arc::clone(&self.session);
        let _ = tokio::task::spawn_blocking(move || {
            session.disconnect(None, "bye", None).ok();
        })
        .await;
    }
}
