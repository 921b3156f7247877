use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use super::{copy_with_progress, validate_remote_path, Destination, RemoteEntry, RemoteStat};
use crate::error::{Result, ScratError};

/// Destination backed by a local directory, including mounted removable
/// media. `std::fs` directly, no session state.
pub struct LocalDestination {
    root: PathBuf,
}

impl LocalDestination {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, remote_path: &str) -> Result<PathBuf> {
        validate_remote_path(remote_path)?;
        Ok(self.root.join(remote_path))
    }
}

impl Destination for LocalDestination {
    fn connect(&mut self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| {
            ScratError::Destination(format!(
                "cannot create destination root '{}': {e}",
                self.root.display()
            ))
        })
    }

    fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }

    fn put_stream(
        &mut self,
        remote_path: &str,
        reader: &mut dyn Read,
        progress: Option<&mut dyn FnMut(u64)>,
    ) -> Result<u64> {
        let path = self.resolve(remote_path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&path)?;
        let written = copy_with_progress(reader, &mut file, progress)?;
        file.sync_all()?;
        Ok(written)
    }

    fn get_stream(
        &mut self,
        remote_path: &str,
        writer: &mut dyn Write,
        progress: Option<&mut dyn FnMut(u64)>,
    ) -> Result<u64> {
        let path = self.resolve(remote_path)?;
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ScratError::Destination(format!(
                    "object not found: {remote_path}"
                )))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(copy_with_progress(&mut file, writer, progress)?)
    }

    fn list(&mut self, prefix: &str) -> Result<Vec<RemoteEntry>> {
        let dir = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.resolve(prefix.trim_end_matches('/'))?
        };

        let read_dir = match fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            let metadata = entry.metadata()?;
            entries.push(RemoteEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: if metadata.is_file() { metadata.len() } else { 0 },
                is_dir: metadata.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn delete(&mut self, remote_path: &str) -> Result<()> {
        let path = self.resolve(remote_path)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_tree(&mut self, remote_prefix: &str) -> Result<()> {
        let path = self.resolve(remote_prefix.trim_end_matches('/'))?;
        match fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn stat(&mut self, remote_path: &str) -> Result<RemoteStat> {
        let path = self.resolve(remote_path)?;
        match fs::metadata(&path) {
            Ok(metadata) => Ok(RemoteStat {
                exists: true,
                size: if metadata.is_file() { metadata.len() } else { 0 },
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RemoteStat {
                exists: false,
                size: 0,
            }),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(unix)]
    fn free_space(&mut self) -> Result<Option<u64>> {
        use std::os::unix::ffi::OsStrExt;

        let raw = std::ffi::CString::new(self.root.as_os_str().as_bytes())
            .map_err(|_| ScratError::Internal("destination root contains NUL".into()))?;
        let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(raw.as_ptr(), &mut stats) };
        if rc != 0 {
            return Ok(None);
        }
        Ok(Some(stats.f_bavail as u64 * stats.f_frsize as u64))
    }

    #[cfg(not(unix))]
    fn free_space(&mut self) -> Result<Option<u64>> {
        Ok(None)
    }
}
