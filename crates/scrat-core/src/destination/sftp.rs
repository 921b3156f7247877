use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::known_hosts::{known_host_keys_path, learn_known_hosts_path};
use russh::keys::ssh_key;
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::warn;

use super::runtime::ASYNC_RUNTIME;
use super::{validate_remote_path, Destination, RemoteEntry, RemoteStat, COPY_BUF_SIZE};
use crate::error::{Result, ScratError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

/// SFTP destination over a single SSH session owned by the running job.
/// Authentication is password or private key; host keys are checked against
/// `known_hosts` with trust-on-first-use.
pub struct SftpDestination {
    host: String,
    port: u16,
    username: String,
    password: Option<String>,
    key_path: Option<PathBuf>,
    root: String,
    conn: Option<SftpConn>,
}

struct SftpConn {
    sftp: SftpSession,
    // Keep the SSH handle alive for the lifetime of the SFTP session.
    _session: client::Handle<HostKeyHandler>,
}

struct HostKeyHandler {
    host: String,
    port: u16,
    known_hosts_path: PathBuf,
}

impl client::Handler for HostKeyHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        verify_or_learn_host_key(
            &self.host,
            self.port,
            &self.known_hosts_path,
            server_public_key,
        )
    }
}

fn verify_or_learn_host_key(
    host: &str,
    port: u16,
    known_hosts_path: &Path,
    server_public_key: &ssh_key::PublicKey,
) -> std::result::Result<bool, russh::Error> {
    if let Some(parent) = known_hosts_path.parent() {
        std::fs::create_dir_all(parent).map_err(russh::Error::IO)?;
    }

    let known = known_host_keys_path(host, port, known_hosts_path)?;
    if known.iter().any(|(_, key)| key == server_public_key) {
        return Ok(true);
    }
    if known.is_empty() {
        learn_known_hosts_path(host, port, server_public_key, known_hosts_path)?;
        warn!(host, port, "learned new SSH host key via trust-on-first-use");
        return Ok(true);
    }
    Err(russh::Error::KeyChanged { line: known[0].0 })
}

fn default_known_hosts() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ScratError::Destination("cannot determine home directory".into()))?;
    Ok(home.join(".ssh").join("known_hosts"))
}

fn normalize_root(root: &str) -> String {
    let trimmed = root.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn sftp_not_found(e: &russh_sftp::client::error::Error) -> bool {
    matches!(
        e,
        russh_sftp::client::error::Error::Status(status)
            if status.status_code == StatusCode::NoSuchFile
    )
}

fn sftp_err(op: &str, e: russh_sftp::client::error::Error) -> ScratError {
    ScratError::Destination(format!("sftp {op}: {e}"))
}

fn ssh_err(op: &str, e: russh::Error) -> ScratError {
    match &e {
        russh::Error::IO(_) | russh::Error::ConnectionTimeout => {
            ScratError::TransientIo(format!("ssh {op}: {e}"))
        }
        _ => ScratError::Destination(format!("ssh {op}: {e}")),
    }
}

impl SftpDestination {
    pub fn new(
        host: &str,
        port: u16,
        username: &str,
        password: Option<&str>,
        key_path: Option<&str>,
        root: &str,
    ) -> Self {
        Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
            password: password.map(|p| p.to_string()),
            key_path: key_path.map(PathBuf::from),
            root: normalize_root(root),
            conn: None,
        }
    }

    fn full_path(&self, remote_path: &str) -> String {
        if remote_path.is_empty() {
            return self.root.clone();
        }
        if self.root == "/" {
            format!("/{remote_path}")
        } else {
            format!("{}/{remote_path}", self.root)
        }
    }

    fn session(&mut self) -> Result<&SftpSession> {
        if self.conn.is_none() {
            self.connect()?;
        }
        match &self.conn {
            Some(conn) => Ok(&conn.sftp),
            None => Err(ScratError::Internal("sftp session missing after connect".into())),
        }
    }

    async fn establish(&self) -> Result<SftpConn> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(INACTIVITY_TIMEOUT),
            ..Default::default()
        });
        let handler = HostKeyHandler {
            host: self.host.clone(),
            port: self.port,
            known_hosts_path: default_known_hosts()?,
        };

        let addr = (self.host.as_str(), self.port);
        let mut session = tokio::time::timeout(CONNECT_TIMEOUT, client::connect(config, addr, handler))
            .await
            .map_err(|_| {
                ScratError::TransientIo(format!(
                    "ssh connect to {}:{} timed out",
                    self.host, self.port
                ))
            })?
            .map_err(|e| ssh_err("connect", e))?;

        let authenticated = if let Some(password) = &self.password {
            session
                .authenticate_password(&self.username, password)
                .await
                .map_err(|e| ssh_err("authenticate", e))?
                .success()
        } else {
            let key_path = self.key_path.as_ref().ok_or_else(|| {
                ScratError::Validation(
                    "sftp destination needs either a password or a key_path".into(),
                )
            })?;
            let key = load_secret_key(key_path, None).map_err(|e| {
                ScratError::Destination(format!("load SSH key {}: {e}", key_path.display()))
            })?;
            let hash_alg = session
                .best_supported_rsa_hash()
                .await
                .map_err(|e| ssh_err("negotiate hash", e))?
                .flatten();
            session
                .authenticate_publickey(
                    &self.username,
                    PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                )
                .await
                .map_err(|e| ssh_err("authenticate", e))?
                .success()
        };

        if !authenticated {
            return Err(ScratError::Destination(format!(
                "SSH authentication failed for user '{}' on {}:{}",
                self.username, self.host, self.port
            )));
        }

        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| ssh_err("open channel", e))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| ssh_err("request sftp subsystem", e))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| sftp_err("session init", e))?;

        Ok(SftpConn {
            sftp,
            _session: session,
        })
    }

    /// Create each missing directory level below the root.
    fn ensure_parents(&mut self, remote_path: &str) -> Result<()> {
        let Some((parent, _)) = remote_path.rsplit_once('/') else {
            return Ok(());
        };
        let mut level = String::new();
        for part in parent.split('/').filter(|p| !p.is_empty()) {
            if !level.is_empty() {
                level.push('/');
            }
            level.push_str(part);
            let full = self.full_path(&level);
            let sftp = self.session()?;
            // Exists or raced into existence: both fine.
            let _ = ASYNC_RUNTIME.block_on(sftp.create_dir(&full));
        }
        Ok(())
    }

    fn remove_tree(&mut self, full: String) -> Result<()> {
        let sftp = self.session()?;
        ASYNC_RUNTIME.block_on(remove_tree_async(sftp, full))
    }
}

/// Depth-first removal; directories must be empty before `remove_dir`.
async fn remove_tree_async(sftp: &SftpSession, full: String) -> Result<()> {
    let entries = match sftp.read_dir(&full).await {
        Ok(entries) => entries,
        Err(e) if sftp_not_found(&e) => return Ok(()),
        Err(e) => return Err(sftp_err("read_dir", e)),
    };

    let mut subdirs = Vec::new();
    for entry in entries {
        let child = format!("{full}/{}", entry.file_name());
        if entry.file_type().is_dir() {
            subdirs.push(child);
        } else {
            sftp.remove_file(&child)
                .await
                .map_err(|e| sftp_err("remove_file", e))?;
        }
    }
    for dir in subdirs {
        Box::pin(remove_tree_async(sftp, dir)).await?;
    }
    match sftp.remove_dir(&full).await {
        Ok(()) => Ok(()),
        Err(e) if sftp_not_found(&e) => Ok(()),
        Err(e) => Err(sftp_err("remove_dir", e)),
    }
}

impl Destination for SftpDestination {
    fn connect(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let conn = ASYNC_RUNTIME.block_on(self.establish())?;
        // Make sure the configured root exists.
        let root = self.root.clone();
        if root != "/" {
            let mut level = String::new();
            for part in root.split('/').filter(|p| !p.is_empty()) {
                level.push('/');
                level.push_str(part);
                let _ = ASYNC_RUNTIME.block_on(conn.sftp.create_dir(&level));
            }
        }
        self.conn = Some(conn);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.conn = None;
        Ok(())
    }

    fn put_stream(
        &mut self,
        remote_path: &str,
        reader: &mut dyn Read,
        mut progress: Option<&mut dyn FnMut(u64)>,
    ) -> Result<u64> {
        validate_remote_path(remote_path)?;
        self.ensure_parents(remote_path)?;

        let full = self.full_path(remote_path);
        let sftp = self.session()?;

        ASYNC_RUNTIME.block_on(async {
            let mut file = sftp
                .create(&full)
                .await
                .map_err(|e| sftp_err("create", e))?;

            let mut buf = vec![0u8; COPY_BUF_SIZE];
            let mut total = 0u64;
            loop {
                let n = match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(ScratError::Io(e)),
                };
                file.write_all(&buf[..n])
                    .await
                    .map_err(|e| ScratError::TransientIo(format!("sftp write: {e}")))?;
                total += n as u64;
                if let Some(cb) = progress.as_deref_mut() {
                    cb(total);
                }
            }
            file.shutdown()
                .await
                .map_err(|e| ScratError::TransientIo(format!("sftp close: {e}")))?;
            Ok(total)
        })
    }

    fn get_stream(
        &mut self,
        remote_path: &str,
        writer: &mut dyn Write,
        mut progress: Option<&mut dyn FnMut(u64)>,
    ) -> Result<u64> {
        validate_remote_path(remote_path)?;
        let full = self.full_path(remote_path);
        let sftp = self.session()?;

        ASYNC_RUNTIME.block_on(async {
            let mut file = match sftp.open(&full).await {
                Ok(f) => f,
                Err(e) if sftp_not_found(&e) => {
                    return Err(ScratError::Destination(format!(
                        "object not found: {remote_path}"
                    )))
                }
                Err(e) => return Err(sftp_err("open", e)),
            };

            let mut buf = vec![0u8; COPY_BUF_SIZE];
            let mut total = 0u64;
            loop {
                let n = file
                    .read(&mut buf)
                    .await
                    .map_err(|e| ScratError::TransientIo(format!("sftp read: {e}")))?;
                if n == 0 {
                    break;
                }
                writer.write_all(&buf[..n])?;
                total += n as u64;
                if let Some(cb) = progress.as_deref_mut() {
                    cb(total);
                }
            }
            Ok(total)
        })
    }

    fn list(&mut self, prefix: &str) -> Result<Vec<RemoteEntry>> {
        let full = self.full_path(prefix.trim_end_matches('/'));
        let sftp = self.session()?;

        let entries = ASYNC_RUNTIME.block_on(async {
            match sftp.read_dir(&full).await {
                Ok(entries) => Ok(Some(entries)),
                Err(e) if sftp_not_found(&e) => Ok(None),
                Err(e) => Err(sftp_err("read_dir", e)),
            }
        })?;

        let Some(entries) = entries else {
            return Ok(Vec::new());
        };

        let mut out: Vec<RemoteEntry> = entries
            .into_iter()
            .map(|entry| {
                let metadata = entry.metadata();
                RemoteEntry {
                    name: entry.file_name(),
                    size: metadata.size.unwrap_or(0),
                    is_dir: entry.file_type().is_dir(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn delete(&mut self, remote_path: &str) -> Result<()> {
        validate_remote_path(remote_path)?;
        let full = self.full_path(remote_path);
        let sftp = self.session()?;
        ASYNC_RUNTIME.block_on(async {
            match sftp.remove_file(&full).await {
                Ok(()) => Ok(()),
                Err(e) if sftp_not_found(&e) => Ok(()),
                Err(e) => Err(sftp_err("remove_file", e)),
            }
        })
    }

    fn delete_tree(&mut self, remote_prefix: &str) -> Result<()> {
        validate_remote_path(remote_prefix.trim_end_matches('/'))?;
        let full = self.full_path(remote_prefix.trim_end_matches('/'));
        self.remove_tree(full)
    }

    fn stat(&mut self, remote_path: &str) -> Result<RemoteStat> {
        validate_remote_path(remote_path)?;
        let full = self.full_path(remote_path);
        let sftp = self.session()?;
        ASYNC_RUNTIME.block_on(async {
            match sftp.metadata(&full).await {
                Ok(metadata) => Ok(RemoteStat {
                    exists: true,
                    size: metadata.size.unwrap_or(0),
                }),
                Err(e) if sftp_not_found(&e) => Ok(RemoteStat {
                    exists: false,
                    size: 0,
                }),
                Err(e) => Err(sftp_err("metadata", e)),
            }
        })
    }

    fn free_space(&mut self) -> Result<Option<u64>> {
        // No portable space query in the base SFTP protocol.
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_normalization() {
        assert_eq!(normalize_root(""), "/");
        assert_eq!(normalize_root("/"), "/");
        assert_eq!(normalize_root("backups/"), "/backups");
        assert_eq!(normalize_root("/srv/backups"), "/srv/backups");
    }

    #[test]
    fn full_path_composition() {
        let dest = SftpDestination::new("nas", 22, "backup", Some("pw"), None, "/srv/scrat");
        assert_eq!(dest.full_path(""), "/srv/scrat");
        assert_eq!(
            dest.full_path("backups/x/data.001.scrat"),
            "/srv/scrat/backups/x/data.001.scrat"
        );

        let root = SftpDestination::new("nas", 22, "backup", Some("pw"), None, "/");
        assert_eq!(root.full_path("a"), "/a");
    }
}
