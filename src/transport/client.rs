//! SSH connection establishment: TCP + handshake, host key verification
//! against known_hosts, and the three auth paths (password, key file, agent).

use crate::config::BridgeConfig;
use crate::credentials::ResolvedAuth;
use crate::error::ConnectError;
use crate::transport::known_hosts::{HostKeyVerification, KnownHostsStore};
use crate::transport::SessionParams;
use parking_lot::Mutex;
use russh::client;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::key::PrivateKeyWithHashAlg;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How unknown host keys are handled. In `Strict` and `AcceptNew` a changed
/// key always fails with `ConnectError::HostKeyMismatch`; `AcceptChanged`
/// exists only for the reconnect after the user has seen that error and
/// confirmed the new fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyMode {
    /// Fail on hosts that are not in known_hosts.
    Strict,
    /// Record first-contact keys (the caller has already confirmed, or
    /// accepts trust-on-first-use).
    AcceptNew,
    /// Replace a changed key that the user has explicitly accepted. Applies
    /// to this connect only; the old known_hosts line is kept as a comment.
    AcceptChanged,
}

pub struct ClientHandler {
    known_hosts: Arc<KnownHostsStore>,
    host: String,
    port: u16,
    mode: HostKeyMode,
    /// Filled in by `check_server_key` so the connect path can turn a
    /// rejected key into a precise error instead of a generic handshake
    /// failure.
    verdict: Arc<Mutex<Option<HostKeyVerification>>>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let verification = self
            .known_hosts
            .verify(&self.host, self.port, server_public_key);
        let accept = match &verification {
            HostKeyVerification::Verified => true,
            HostKeyVerification::Unknown { fingerprint } => match self.mode {
                HostKeyMode::AcceptNew | HostKeyMode::AcceptChanged => {
                    info!(host = %self.host, %fingerprint, "recording first-contact host key");
                    if let Err(e) =
                        self.known_hosts
                            .add_host(&self.host, self.port, server_public_key)
                    {
                        warn!(error = %e, "failed to persist host key");
                    }
                    true
                }
                HostKeyMode::Strict => false,
            },
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => match self.mode {
                HostKeyMode::AcceptChanged => {
                    info!(
                        host = %self.host,
                        old = %expected_fingerprint,
                        new = %actual_fingerprint,
                        "replacing host key after explicit confirmation"
                    );
                    if let Err(e) =
                        self.known_hosts
                            .replace_host(&self.host, self.port, server_public_key)
                    {
                        warn!(error = %e, "failed to persist replaced host key");
                    }
                    true
                }
                HostKeyMode::Strict | HostKeyMode::AcceptNew => {
                    warn!(
                        host = %self.host,
                        expected = %expected_fingerprint,
                        actual = %actual_fingerprint,
                        "host key changed, refusing connection"
                    );
                    false
                }
            },
        };
        *self.verdict.lock() = Some(verification);
        Ok(accept)
    }
}

/// An authenticated SSH session, ready to open SFTP or exec channels.
pub struct ConnectedTransport {
    pub(crate) handle: client::Handle<ClientHandler>,
}

impl ConnectedTransport {
    /// Run a command on the remote and capture stdout. Used for capability
    /// probes and small queries, not transfers.
    pub async fn exec_capture(&self, command: &str) -> Result<(u32, String), ConnectError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ConnectError::Protocol(e.to_string()))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ConnectError::Protocol(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut exit_code = 1u32;
        while let Some(msg) = channel.wait().await {
            match msg {
                russh::ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                russh::ChannelMsg::ExitStatus { exit_status } => exit_code = exit_status,
                russh::ChannelMsg::Eof | russh::ChannelMsg::Close => break,
                _ => {}
            }
        }
        Ok((exit_code, String::from_utf8_lossy(&stdout).into_owned()))
    }

    pub async fn disconnect(&self) {
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
    }
}

/// Connect and authenticate. The resolved secret is consumed here and
/// dropped when this function returns.
pub async fn connect_session(
    params: &SessionParams,
    auth: ResolvedAuth,
    known_hosts: Arc<KnownHostsStore>,
    host_key_mode: HostKeyMode,
    config: &BridgeConfig,
) -> Result<ConnectedTransport, ConnectError> {
    let ssh_config = Arc::new(client::Config {
        keepalive_interval: Some(Duration::from_secs(15)),
        keepalive_max: 3,
        ..Default::default()
    });

    let verdict = Arc::new(Mutex::new(None));
    let handler = ClientHandler {
        known_hosts,
        host: params.host.clone(),
        port: params.port,
        mode: host_key_mode,
        verdict: verdict.clone(),
    };

    let timeout = Duration::from_secs(config.connect_timeout_secs);
    let connect = client::connect(ssh_config, (params.host.as_str(), params.port), handler);
    let mut handle = match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(handle)) => handle,
        Ok(Err(e)) => {
            // A rejected host key surfaces from russh as a generic handshake
            // error; the handler verdict disambiguates.
            let verdict = verdict.lock().take();
            return Err(match verdict {
                Some(HostKeyVerification::Changed {
                    expected_fingerprint,
                    actual_fingerprint,
                }) => ConnectError::HostKeyMismatch {
                    host: params.endpoint(),
                    expected: expected_fingerprint,
                    actual: actual_fingerprint,
                },
                Some(HostKeyVerification::Unknown { fingerprint }) => {
                    ConnectError::HostKeyMismatch {
                        host: params.endpoint(),
                        expected: "(no known_hosts entry)".to_string(),
                        actual: fingerprint,
                    }
                }
                _ => ConnectError::NetworkUnreachable {
                    host: params.host.clone(),
                    port: params.port,
                    reason: e.to_string(),
                },
            });
        }
        Err(_) => {
            return Err(ConnectError::Timeout {
                host: params.host.clone(),
                seconds: config.connect_timeout_secs,
            })
        }
    };

    let authenticated = match auth {
        ResolvedAuth::Password(password) => handle
            .authenticate_password(&params.username, password)
            .await
            .map_err(|e| ConnectError::Protocol(e.to_string()))?,
        ResolvedAuth::KeyFile { path, passphrase } => {
            let key = russh::keys::load_secret_key(&path, passphrase.as_deref())
                .map_err(|e| ConnectError::Credential(format!("cannot load key: {e}")))?;
            handle
                .authenticate_publickey(
                    &params.username,
                    PrivateKeyWithHashAlg::new(Arc::new(key), None),
                )
                .await
                .map_err(|e| ConnectError::Protocol(e.to_string()))?
        }
        ResolvedAuth::Agent => authenticate_with_agent(&mut handle, &params.username).await?,
    };

    if !authenticated.success() {
        return Err(ConnectError::AuthFailure {
            host: params.host.clone(),
            user: params.username.clone(),
        });
    }

    debug!(host = %params.host, user = %params.username, "SSH session authenticated");
    Ok(ConnectedTransport { handle })
}

/// `Signer` wrapper over a type-erased `AgentClient`. russh's built-in
/// `impl Signer for AgentClient` borrows a local `PublicKey` across an await
/// inside `authenticate_publickey_with`, which the compiler cannot prove
/// `Send` through RPITIT (rust-lang/rust#100013). Cloning the key into the
/// future first sidesteps it.
struct AgentSigner<'a> {
    agent: &'a mut AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>,
}

impl russh::Signer for AgentSigner<'_> {
    type Error = russh::AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &russh::keys::ssh_key::PublicKey,
        hash_alg: Option<russh::keys::ssh_key::HashAlg>,
        to_sign: russh::CryptoVec,
    ) -> impl std::future::Future<Output = Result<russh::CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        async move {
            self.agent
                .sign_request(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

async fn authenticate_with_agent(
    handle: &mut client::Handle<ClientHandler>,
    username: &str,
) -> Result<client::AuthResult, ConnectError> {
    let mut agent = AgentClient::connect_env()
        .await
        .map_err(|e| ConnectError::Credential(format!("SSH agent unavailable: {e}")))?
        .dynamic();
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| ConnectError::Credential(format!("agent listing failed: {e}")))?;
    if identities.is_empty() {
        return Err(ConnectError::Credential(
            "SSH agent holds no keys, add one with ssh-add".into(),
        ));
    }

    let mut last = None;
    for key in identities {
        debug!(algorithm = %key.algorithm(), comment = %key.comment(), "trying agent key");
        let result = handle
            .authenticate_publickey_with(
                username,
                key.clone(),
                None,
                &mut AgentSigner { agent: &mut agent },
            )
            .await
            .map_err(|e| ConnectError::Protocol(e.to_string()))?;
        if result.success() {
            return Ok(result);
        }
        last = Some(result);
    }
    last.ok_or_else(|| ConnectError::Credential("no agent key accepted".into()))
}
