pub mod local;
pub(crate) mod pipe;
pub mod retry;
pub mod shelled;
pub mod smb;
pub mod webdav;

#[cfg(feature = "dest-sftp")]
pub mod sftp;
#[cfg(feature = "dest-sftp")]
pub(crate) mod runtime;

use std::io::{Read, Write};

use crate::config::{DestinationConfig, DestinationKind};
use crate::error::{Result, ScratError};

/// Copy buffer for destination streams.
pub(crate) const COPY_BUF_SIZE: usize = 64 * 1024;

/// Object name used by the connectivity probe.
const PROBE_OBJECT: &str = "scrat-probe.tmp";
const PROBE_BODY: &[u8] = b"scrat destination probe\n";

#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RemoteStat {
    pub exists: bool,
    pub size: u64,
}

/// Uniform object-store-like view of a backup destination.
///
/// Remote paths are `/`-separated and relative to the destination root.
/// Implementations are not assumed thread-safe; each run owns its
/// connection. `put_stream` must consume the reader lazily — never buffer
/// the whole payload.
pub trait Destination: Send {
    /// Establish session state. Idempotent.
    fn connect(&mut self) -> Result<()>;

    /// Tear down session state. Idempotent.
    fn disconnect(&mut self) -> Result<()>;

    /// Create or replace an object, creating intermediate directories.
    /// Returns the stored size in bytes.
    fn put_stream(
        &mut self,
        remote_path: &str,
        reader: &mut dyn Read,
        progress: Option<&mut dyn FnMut(u64)>,
    ) -> Result<u64>;

    /// Stream an object out. Returns the number of bytes written.
    fn get_stream(
        &mut self,
        remote_path: &str,
        writer: &mut dyn Write,
        progress: Option<&mut dyn FnMut(u64)>,
    ) -> Result<u64>;

    /// Direct children of a prefix.
    fn list(&mut self, prefix: &str) -> Result<Vec<RemoteEntry>>;

    fn delete(&mut self, remote_path: &str) -> Result<()>;

    fn delete_tree(&mut self, remote_prefix: &str) -> Result<()>;

    fn stat(&mut self, remote_path: &str) -> Result<RemoteStat>;

    /// Best-effort free space; `None` when the backend cannot tell.
    fn free_space(&mut self) -> Result<Option<u64>>;

    /// Whether the destination can consume a producer-driven stream as bytes
    /// are made. Staged destinations upload sealed segments from a spool
    /// file instead.
    fn streams_directly(&self) -> bool {
        true
    }

    /// Round-trip a small object to verify reachability and write access.
    fn test(&mut self) -> Result<()> {
        self.connect()?;
        self.put_stream(PROBE_OBJECT, &mut &PROBE_BODY[..], None)?;

        let stat = self.stat(PROBE_OBJECT)?;
        if !stat.exists {
            return Err(ScratError::Destination(
                "probe object vanished after upload".into(),
            ));
        }

        let mut echoed = Vec::new();
        self.get_stream(PROBE_OBJECT, &mut echoed, None)?;
        if echoed != PROBE_BODY {
            return Err(ScratError::Destination(
                "probe object came back different".into(),
            ));
        }

        self.delete(PROBE_OBJECT)?;
        Ok(())
    }
}

/// Reject remote paths that could escape the destination root.
pub(crate) fn validate_remote_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(ScratError::Validation("empty remote path".into()));
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(ScratError::Validation(format!(
            "absolute remote path '{path}'"
        )));
    }
    if path.contains('\\') {
        return Err(ScratError::Validation(format!(
            "remote path contains backslash: '{path}'"
        )));
    }
    if path.split('/').any(|part| part == "..") {
        return Err(ScratError::Validation(format!(
            "remote path escapes root: '{path}'"
        )));
    }
    Ok(())
}

/// Copy a stream with an optional byte-count callback.
pub(crate) fn copy_with_progress(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    mut progress: Option<&mut dyn FnMut(u64)>,
) -> std::io::Result<u64> {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
        if let Some(cb) = progress.as_deref_mut() {
            cb(total);
        }
    }
    Ok(total)
}

/// Build the destination backend selected by the configuration.
pub fn destination_from_config(config: &DestinationConfig) -> Result<Box<dyn Destination>> {
    if !config.enabled {
        return Err(ScratError::Validation(format!(
            "destination '{}' is disabled",
            config.id
        )));
    }

    match &config.kind {
        DestinationKind::Local { root_path } => {
            Ok(Box::new(local::LocalDestination::new(root_path)))
        }
        DestinationKind::Smb {
            server,
            share,
            domain,
            root_path,
            mount_point,
        } => Ok(Box::new(smb::SmbDestination::new(
            server,
            share,
            domain.as_deref(),
            root_path.as_deref(),
            mount_point.as_deref(),
        )?)),
        DestinationKind::Webdav {
            url,
            username,
            password,
            allow_insecure_http,
        } => Ok(Box::new(webdav::WebdavDestination::new(
            url,
            username,
            password,
            *allow_insecure_http,
        )?)),
        DestinationKind::ShelledMultiCloud {
            program,
            remote,
            root_path,
        } => Ok(Box::new(shelled::ShelledDestination::new(
            program, remote, root_path,
        ))),
        #[cfg(feature = "dest-sftp")]
        DestinationKind::Sftp {
            host,
            port,
            username,
            password,
            key_path,
            root_path,
        } => Ok(Box::new(sftp::SftpDestination::new(
            host,
            *port,
            username,
            password.as_deref(),
            key_path.as_deref(),
            root_path,
        ))),
        #[cfg(not(feature = "dest-sftp"))]
        DestinationKind::Sftp { .. } => Err(ScratError::Validation(
            "sftp destination requires the 'dest-sftp' feature".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_path_validation() {
        assert!(validate_remote_path("backups/x/data.001.scrat").is_ok());
        assert!(validate_remote_path("").is_err());
        assert!(validate_remote_path("/etc/passwd").is_err());
        assert!(validate_remote_path("a\\b").is_err());
        assert!(validate_remote_path("a/../../b").is_err());
    }

    #[test]
    fn disabled_destination_is_rejected() {
        let config = DestinationConfig {
            id: "off".into(),
            kind: DestinationKind::Local {
                root_path: "/tmp/x".into(),
            },
            enabled: false,
        };
        assert!(matches!(
            destination_from_config(&config),
            Err(ScratError::Validation(_))
        ));
    }
}
