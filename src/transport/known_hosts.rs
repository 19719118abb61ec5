//! OpenSSH known_hosts handling: first-contact recording and mismatch
//! detection. Hashed hostnames (`|1|...`) are skipped rather than matched.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::RwLock;
use russh::keys::PublicKeyBase64;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyVerification {
    Verified,
    /// No record for this host yet; `fingerprint` is presented for TOFU
    /// confirmation.
    Unknown { fingerprint: String },
    /// Recorded key differs. Never accepted without explicit confirmation.
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

pub struct KnownHostsStore {
    path: PathBuf,
    /// host-key -> base64 key blob
    entries: RwLock<HashMap<String, String>>,
}

impl KnownHostsStore {
    pub fn open_default() -> Self {
        let path = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ssh")
            .join("known_hosts");
        Self::with_path(path)
    }

    pub fn with_path(path: PathBuf) -> Self {
        let store = Self {
            path,
            entries: RwLock::new(HashMap::new()),
        };
        store.reload();
        store
    }

    fn reload(&self) {
        let mut entries = HashMap::new();
        if let Ok(content) = std::fs::read_to_string(&self.path) {
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') || line.starts_with("|1|") {
                    continue;
                }
                let mut fields = line.split_whitespace();
                let (Some(hosts), Some(_keytype), Some(key)) =
                    (fields.next(), fields.next(), fields.next())
                else {
                    continue;
                };
                for host in hosts.split(',') {
                    entries.insert(host.to_string(), key.to_string());
                }
            }
        }
        *self.entries.write() = entries;
    }

    fn make_key(host: &str, port: u16) -> String {
        if port == 22 {
            host.to_string()
        } else {
            format!("[{host}]:{port}")
        }
    }

    fn fingerprint_of(key_b64: &str) -> String {
        let raw = BASE64.decode(key_b64).unwrap_or_default();
        let hash = Sha256::digest(&raw);
        format!(
            "SHA256:{}",
            BASE64.encode(hash).trim_end_matches('=')
        )
    }

    pub fn verify(
        &self,
        host: &str,
        port: u16,
        key: &russh::keys::PublicKey,
    ) -> HostKeyVerification {
        let presented = key.public_key_base64();
        let actual_fingerprint = Self::fingerprint_of(&presented);
        match self.entries.read().get(&Self::make_key(host, port)) {
            Some(stored) if *stored == presented => HostKeyVerification::Verified,
            Some(stored) => HostKeyVerification::Changed {
                expected_fingerprint: Self::fingerprint_of(stored),
                actual_fingerprint,
            },
            None => HostKeyVerification::Unknown {
                fingerprint: actual_fingerprint,
            },
        }
    }

    /// Record a newly confirmed host key (TOFU accept).
    pub fn add_host(
        &self,
        host: &str,
        port: u16,
        key: &russh::keys::PublicKey,
    ) -> std::io::Result<()> {
        let host_key = Self::make_key(host, port);
        let key_b64 = key.public_key_base64();
        let algo = key.algorithm().to_string();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{host_key} {algo} {key_b64}")?;
        self.entries.write().insert(host_key, key_b64);
        Ok(())
    }

    /// Replace a changed key after the user explicitly accepted the change.
    /// The old line stays in the file as a comment for auditability.
    pub fn replace_host(
        &self,
        host: &str,
        port: u16,
        key: &russh::keys::PublicKey,
    ) -> std::io::Result<()> {
        let host_key = Self::make_key(host, port);
        if let Ok(content) = std::fs::read_to_string(&self.path) {
            let rewritten: String = content
                .lines()
                .map(|line| {
                    let is_old = line
                        .split_whitespace()
                        .next()
                        .map(|hosts| hosts.split(',').any(|h| h == host_key))
                        .unwrap_or(false);
                    if is_old {
                        format!("# replaced {line}\n")
                    } else {
                        format!("{line}\n")
                    }
                })
                .collect();
            if let Err(e) = std::fs::write(&self.path, rewritten) {
                warn!(error = %e, "failed to rewrite known_hosts, appending anyway");
            }
        }
        self.add_host(host, port, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_key_port_handling() {
        assert_eq!(KnownHostsStore::make_key("example.com", 22), "example.com");
        assert_eq!(
            KnownHostsStore::make_key("example.com", 2222),
            "[example.com]:2222"
        );
    }

    #[test]
    fn test_parse_skips_hashed_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(
            &path,
            "# comment\n|1|hash|hash ssh-ed25519 AAAA\nhost1,host2 ssh-ed25519 KEYDATA\n",
        )
        .unwrap();
        let store = KnownHostsStore::with_path(path);
        let entries = store.entries.read();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries.get("host1").unwrap(), "KEYDATA");
        assert_eq!(entries.get("host2").unwrap(), "KEYDATA");
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = KnownHostsStore::fingerprint_of("AAAAB3NzaC1yc2EAAAADAQABAAABAQ");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
    }
}
