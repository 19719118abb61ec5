//! Credential resolution. The engine stores only opaque references
//! (`AuthRef`); actual secrets live in the platform keychain and are fetched
//! at connect time, used, and dropped.

use crate::error::ConnectError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How a session authenticates. Serializable and safe to persist: the
/// password variant carries a keychain account name, never the password.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthRef {
    /// Password stored in the keychain under `service`/`account`.
    Password { service: String, account: String },
    /// Private key on disk; `passphrase_account` names an optional keychain
    /// entry holding the passphrase.
    KeyFile {
        path: PathBuf,
        #[serde(default)]
        passphrase_account: Option<String>,
    },
    /// Defer to the running SSH agent.
    Agent,
}

/// A secret resolved for the duration of one connect attempt.
pub enum ResolvedAuth {
    Password(String),
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
    Agent,
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn resolve(&self, auth: &AuthRef) -> Result<ResolvedAuth, ConnectError>;
}

/// Platform keychain lookup via the `keyring` crate. Lookups are blocking
/// syscalls on every platform, so they run on the blocking pool.
pub struct KeyringProvider {
    service_prefix: String,
}

impl KeyringProvider {
    pub fn new(service_prefix: impl Into<String>) -> Self {
        Self {
            service_prefix: service_prefix.into(),
        }
    }

    async fn lookup(&self, service: &str, account: &str) -> Result<String, ConnectError> {
        let service = format!("{}.{}", self.service_prefix, service);
        let account = account.to_string();
        tokio::task::spawn_blocking(move || {
            let entry = keyring::Entry::new(&service, &account)
                .map_err(|e| ConnectError::Credential(e.to_string()))?;
            entry
                .get_password()
                .map_err(|e| ConnectError::Credential(e.to_string()))
        })
        .await
        .map_err(|e| ConnectError::Credential(format!("keychain task failed: {e}")))?
    }
}

#[async_trait]
impl CredentialProvider for KeyringProvider {
    async fn resolve(&self, auth: &AuthRef) -> Result<ResolvedAuth, ConnectError> {
        match auth {
            AuthRef::Password { service, account } => {
                let secret = self.lookup(service, account).await?;
                Ok(ResolvedAuth::Password(secret))
            }
            AuthRef::KeyFile {
                path,
                passphrase_account,
            } => {
                let passphrase = match passphrase_account {
                    Some(account) => Some(self.lookup("keyfile", account).await?),
                    None => None,
                };
                Ok(ResolvedAuth::KeyFile {
                    path: path.clone(),
                    passphrase,
                })
            }
            AuthRef::Agent => Ok(ResolvedAuth::Agent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_ref_serde_carries_no_secret() {
        let auth = AuthRef::Password {
            service: "prod-db".into(),
            account: "alice".into(),
        };
        let json = serde_json::to_string(&auth).unwrap();
        assert!(json.contains("prod-db"));
        assert!(json.contains("password"));
        let back: AuthRef = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, AuthRef::Password { .. }));
    }

    #[test]
    fn test_key_file_default_passphrase() {
        let json = r#"{"type": "key_file", "path": "/home/a/.ssh/id_ed25519"}"#;
        let auth: AuthRef = serde_json::from_str(json).unwrap();
        match auth {
            AuthRef::KeyFile {
                passphrase_account, ..
            } => assert!(passphrase_account.is_none()),
            _ => panic!("wrong variant"),
        }
    }
}
