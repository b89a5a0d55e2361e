//! russh-backed SSH transport
//!
//! Everything russh-specific lives here; the rest of the crate talks to
//! hosts through [`crate::ssh::shell::CommandChannel`].

use std::sync::Arc;
use std::time::Instant;

use russh::client::{self, AuthResult, Handle};
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect};
use tokio::time::timeout;
use tracing::debug;

use crate::errors::ControlError;
use crate::inventory::{Credential, Host};
use crate::ssh::shell::{
    CommandOutput, RunRequest, DEFAULT_COMMAND_TIMEOUT, MAX_CAPTURED_OUTPUT, TRUNCATION_MARKER,
};

/// Host key policy: accept-any unless the host carries a pinned SHA-256
/// fingerprint, in which case a mismatch fails the dial.
struct HostKeyPolicy {
    pinned: Option<String>,
}

impl client::Handler for HostKeyPolicy {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        match &self.pinned {
            None => Ok(true),
            Some(expected) => {
                let observed = server_public_key.fingerprint(Default::default()).to_string();
                Ok(&observed == expected)
            }
        }
    }
}

/// One authenticated SSH client connection
pub struct Connection {
    handle: Handle<HostKeyPolicy>,
    remote: String,
}

impl Connection {
    /// Dial and authenticate within `dial_timeout`. Dial failures are not
    /// retried here.
    pub async fn dial(
        host: &Host,
        dial_timeout: std::time::Duration,
    ) -> Result<Self, ControlError> {
        let remote = format!("{}:{}", host.addr, host.port);
        let config = Arc::new(client::Config::default());
        let policy = HostKeyPolicy {
            pinned: host.pinned_host_key.clone(),
        };

        let mut handle = timeout(
            dial_timeout,
            client::connect(config, (host.addr.as_str(), host.port), policy),
        )
        .await
        .map_err(|_| ControlError::Timeout(format!("dial {}", remote)))?
        .map_err(|e| match e {
            russh::Error::UnknownKey => {
                ControlError::AuthFailed(format!("host key mismatch for {}", remote))
            }
            other => ControlError::Unreachable(format!("{}: {}", remote, other)),
        })?;

        let result = match &host.credential {
            Credential::Password { password } => {
                handle
                    .authenticate_password(host.username.as_str(), password.as_str())
                    .await?
            }
            Credential::PrivateKey {
                key_pem,
                passphrase,
            } => {
                let key = decode_secret_key(key_pem, passphrase.as_deref()).map_err(|e| {
                    ControlError::AuthFailed(format!("unable to parse private key: {}", e))
                })?;
                let hash = handle.best_supported_rsa_hash().await?.flatten();
                handle
                    .authenticate_publickey(
                        host.username.as_str(),
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash),
                    )
                    .await?
            }
        };

        if !matches!(result, AuthResult::Success) {
            return Err(ControlError::AuthFailed(format!(
                "authentication rejected for {}@{}",
                host.username, remote
            )));
        }

        debug!("SSH connection established to {}", remote);
        Ok(Self { handle, remote })
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Execute one command on a fresh session channel. Cancellation of the
    /// governing future drops the channel, which terminates the remote
    /// process.
    pub async fn exec(&self, req: &RunRequest) -> Result<CommandOutput, ControlError> {
        let deadline = req.timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT);
        let started = Instant::now();
        match timeout(deadline, self.exec_inner(req)).await {
            Ok(result) => result.map(|mut output| {
                output.elapsed = started.elapsed();
                output
            }),
            Err(_) => Err(ControlError::Timeout(format!(
                "command on {} after {:?}",
                self.remote, deadline
            ))),
        }
    }

    async fn exec_inner(&self, req: &RunRequest) -> Result<CommandOutput, ControlError> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, req.command.as_str()).await?;

        if let Some(stdin) = &req.stdin {
            channel.data(stdin.as_bytes()).await?;
            channel.eof().await?;
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut stdout_truncated = false;
        let mut stderr_truncated = false;
        let mut exit_code = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => {
                    append_capped(&mut stdout, data, &mut stdout_truncated);
                }
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    append_capped(&mut stderr, data, &mut stderr_truncated);
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = Some(exit_status as i32);
                }
                _ => {}
            }
        }

        Ok(CommandOutput {
            stdout: collect_stream(stdout, stdout_truncated),
            stderr: collect_stream(stderr, stderr_truncated),
            exit_code: exit_code.unwrap_or(-1),
            elapsed: Default::default(),
        })
    }

    pub async fn close(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}

fn append_capped(buf: &mut Vec<u8>, data: &[u8], truncated: &mut bool) {
    if buf.len() >= MAX_CAPTURED_OUTPUT {
        *truncated = true;
        return;
    }
    let remaining = MAX_CAPTURED_OUTPUT - buf.len();
    if data.len() > remaining {
        buf.extend_from_slice(&data[..remaining]);
        *truncated = true;
    } else {
        buf.extend_from_slice(data);
    }
}

fn collect_stream(buf: Vec<u8>, truncated: bool) -> String {
    let mut text = String::from_utf8_lossy(&buf).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}
