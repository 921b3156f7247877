use std::io::{Read, Write};
use std::path::PathBuf;

use tracing::debug;

use super::local::LocalDestination;
use super::{Destination, RemoteEntry, RemoteStat};
use crate::error::{Result, ScratError};

/// SMB/CIFS share destination.
///
/// The engine does not speak the SMB wire protocol; the share is reached
/// through the OS filesystem layer — the UNC path on Windows, a mount point
/// elsewhere. Credentials and domain membership are handled by the OS when
/// the share is mounted or the UNC session is established.
pub struct SmbDestination {
    /// UNC path or mount point of the share itself.
    share_base: PathBuf,
    inner: LocalDestination,
}

impl SmbDestination {
    pub fn new(
        server: &str,
        share: &str,
        domain: Option<&str>,
        root_path: Option<&str>,
        mount_point: Option<&str>,
    ) -> Result<Self> {
        if server.trim().is_empty() || share.trim().is_empty() {
            return Err(ScratError::Validation(
                "smb destination requires server and share".into(),
            ));
        }

        let share_base = base_path(server, share, mount_point)?;
        let mut base = share_base.clone();
        if let Some(root) = root_path {
            let trimmed = root.trim_matches(['/', '\\']);
            if !trimmed.is_empty() {
                base = base.join(trimmed);
            }
        }

        if let Some(domain) = domain {
            debug!(server, share, domain, "smb destination configured with domain");
        }

        Ok(Self {
            share_base,
            inner: LocalDestination::new(&base),
        })
    }
}

#[cfg(windows)]
fn base_path(server: &str, share: &str, _mount_point: Option<&str>) -> Result<PathBuf> {
    Ok(PathBuf::from(format!(r"\\{server}\{share}")))
}

#[cfg(not(windows))]
fn base_path(server: &str, share: &str, mount_point: Option<&str>) -> Result<PathBuf> {
    match mount_point {
        Some(mount) => Ok(PathBuf::from(mount)),
        None => Err(ScratError::Validation(format!(
            "smb share //{server}/{share} needs mount_point on this platform"
        ))),
    }
}

impl Destination for SmbDestination {
    fn connect(&mut self) -> Result<()> {
        // Unlike a plain local root, an absent share base means the share is
        // not reachable; creating it here would hide a mount problem.
        if !self.share_base.exists() {
            return Err(ScratError::Destination(format!(
                "smb share not reachable at '{}'",
                self.share_base.display()
            )));
        }
        self.inner.connect()
    }

    fn disconnect(&mut self) -> Result<()> {
        self.inner.disconnect()
    }

    fn put_stream(
        &mut self,
        remote_path: &str,
        reader: &mut dyn Read,
        progress: Option<&mut dyn FnMut(u64)>,
    ) -> Result<u64> {
        self.inner.put_stream(remote_path, reader, progress)
    }

    fn get_stream(
        &mut self,
        remote_path: &str,
        writer: &mut dyn Write,
        progress: Option<&mut dyn FnMut(u64)>,
    ) -> Result<u64> {
        self.inner.get_stream(remote_path, writer, progress)
    }

    fn list(&mut self, prefix: &str) -> Result<Vec<RemoteEntry>> {
        self.inner.list(prefix)
    }

    fn delete(&mut self, remote_path: &str) -> Result<()> {
        self.inner.delete(remote_path)
    }

    fn delete_tree(&mut self, remote_prefix: &str) -> Result<()> {
        self.inner.delete_tree(remote_prefix)
    }

    fn stat(&mut self, remote_path: &str) -> Result<RemoteStat> {
        self.inner.stat(remote_path)
    }

    fn free_space(&mut self) -> Result<Option<u64>> {
        self.inner.free_space()
    }
}
