//! rsync bulk transport for directory jobs. When rsync exists on both ends
//! and the session authenticates with a key or the agent, a whole directory
//! moves as one subprocess instead of a per-file fan-out.
//!
//! Password sessions cannot use this path: rsync shells out to ssh and there
//! is no way to feed it a password non-interactively without persisting it.

use crate::credentials::AuthRef;
use crate::error::TransportError;
use crate::transport::client::ConnectedTransport;
use crate::transport::{SessionParams, TransferContext};
use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

fn percent_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // permissive on purpose, rsync formats vary across versions
    PATTERN.get_or_init(|| Regex::new(r"(\d+)%").unwrap_or_else(|_| unreachable!()))
}

pub(crate) fn parse_percent(line: &str) -> Option<u8> {
    percent_pattern()
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u8>().ok())
        .map(|p| p.min(100))
}

/// Whether rsync can be used for this session at all. Checked once, cached
/// by the session.
pub async fn probe(params: &SessionParams, connected: &ConnectedTransport) -> bool {
    if !matches!(params.auth, AuthRef::KeyFile { .. } | AuthRef::Agent) {
        return false;
    }
    let local = Command::new("rsync")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false);
    if !local {
        debug!("rsync not found locally, bulk transfers disabled");
        return false;
    }
    match connected.exec_capture("command -v rsync").await {
        Ok((0, _)) => {
            info!(host = %params.host, "rsync available on both ends");
            true
        }
        Ok((code, _)) => {
            debug!(host = %params.host, code, "rsync not found on remote");
            false
        }
        Err(e) => {
            warn!(error = %e, "rsync probe failed");
            false
        }
    }
}

fn ssh_command(params: &SessionParams) -> String {
    let mut cmd = format!("ssh -p {} -o BatchMode=yes", params.port);
    if let AuthRef::KeyFile { path, .. } = &params.auth {
        cmd.push_str(&format!(" -i {}", path.display()));
    }
    cmd
}

/// Trailing slash on the source makes rsync copy contents into the
/// destination instead of nesting the directory one level deeper.
fn contents_of(path: &str) -> String {
    format!("{}/", path.trim_end_matches('/'))
}

pub async fn sync_up(
    params: &SessionParams,
    local_dir: &Path,
    remote_dir: &str,
    ctx: &TransferContext,
) -> Result<(), TransportError> {
    let source = contents_of(&local_dir.to_string_lossy());
    let dest = format!("{}@{}:{}", params.username, params.host, remote_dir);
    run_rsync(params, &source, &dest, ctx).await
}

pub async fn sync_down(
    params: &SessionParams,
    remote_dir: &str,
    local_dir: &Path,
    ctx: &TransferContext,
) -> Result<(), TransportError> {
    let source = format!(
        "{}@{}:{}",
        params.username,
        params.host,
        contents_of(remote_dir)
    );
    let dest = local_dir.to_string_lossy().into_owned();
    tokio::fs::create_dir_all(local_dir).await?;
    run_rsync(params, &source, &dest, ctx).await
}

async fn run_rsync(
    params: &SessionParams,
    source: &str,
    dest: &str,
    ctx: &TransferContext,
) -> Result<(), TransportError> {
    debug!(%source, %dest, "starting rsync");
    let mut child = Command::new("rsync")
        .arg("-az")
        .arg("--progress")
        .arg("-e")
        .arg(ssh_command(params))
        .arg(source)
        .arg(dest)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| TransportError::Io(format!("cannot spawn rsync: {e}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TransportError::Io("rsync stdout missing".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| TransportError::Io("rsync stderr missing".into()))?;

    // Drain stderr concurrently so a chatty rsync never blocks on a full pipe.
    let stderr_task = tokio::spawn(async move {
        let mut out = String::new();
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            out.push_str(&line);
            out.push('\n');
        }
        out
    });

    let mut cancel_rx = ctx.control.subscribe_cancellation();
    let mut lines = BufReader::new(stdout).lines();
    let mut last_percent = 0u8;
    let status = loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(percent) = parse_percent(&line) {
                        if percent != last_percent {
                            last_percent = percent;
                            ctx.send_progress(percent as u64, 100);
                        }
                    }
                }
                // stdout closed, wait for exit
                Ok(None) => break child
                    .wait()
                    .await
                    .map_err(|e| TransportError::Io(e.to_string()))?,
                Err(e) => return Err(TransportError::Io(e.to_string())),
            },
            _ = cancel_rx.changed() => {
                if ctx.control.is_cancelled() {
                    let _ = child.kill().await;
                    return Err(TransportError::Cancelled);
                }
            }
        }
    };

    let stderr_text = stderr_task.await.unwrap_or_default();
    if status.success() {
        ctx.send_progress(100, 100);
        Ok(())
    } else {
        let lower = stderr_text.to_lowercase();
        if lower.contains("permission denied") {
            Err(TransportError::PermissionDenied(stderr_text.trim().into()))
        } else if lower.contains("no such file") {
            Err(TransportError::NotFound(stderr_text.trim().into()))
        } else {
            Err(TransportError::Io(format!(
                "rsync exited with {status}: {}",
                stderr_text.trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_percent() {
        assert_eq!(
            parse_percent("     32,768  12%  113.21kB/s    0:00:04"),
            Some(12)
        );
        assert_eq!(parse_percent("  1,048,576 100%    1.2MB/s"), Some(100));
        assert_eq!(parse_percent("sending incremental file list"), None);
        assert_eq!(parse_percent("report 50.txt"), None);
    }

    #[test]
    fn test_ssh_command_includes_identity() {
        let params = SessionParams {
            host: "example.com".into(),
            port: 2222,
            username: "alice".into(),
            auth: AuthRef::KeyFile {
                path: PathBuf::from("/home/alice/.ssh/id_ed25519"),
                passphrase_account: None,
            },
        };
        let cmd = ssh_command(&params);
        assert!(cmd.contains("-p 2222"));
        assert!(cmd.contains("-i /home/alice/.ssh/id_ed25519"));
        assert!(cmd.contains("BatchMode=yes"));
    }

    #[test]
    fn test_contents_of_adds_single_slash() {
        assert_eq!(contents_of("/srv/data"), "/srv/data/");
        assert_eq!(contents_of("/srv/data/"), "/srv/data/");
    }
}
