use std::io::{Read, Write};
use std::process::{Command, Stdio};

use tracing::{debug, warn};

use super::{copy_with_progress, validate_remote_path, Destination, RemoteEntry, RemoteStat};
use crate::error::{Result, ScratError};

/// Destination that shells out to a multi-cloud object mover with an
/// rclone-compatible command surface (`copyto`, `cat`, `lsjson`,
/// `deletefile`, `purge`, `mkdir`, `about`).
///
/// The child process cannot accept a producer-driven stream, so sealed
/// segments are staged locally and handed over as files.
pub struct ShelledDestination {
    program: String,
    remote: String,
    root: String,
    connected: bool,
}

impl ShelledDestination {
    pub fn new(program: &str, remote: &str, root: &str) -> Self {
        Self {
            program: program.to_string(),
            remote: remote.to_string(),
            root: root.trim_matches('/').to_string(),
            connected: false,
        }
    }

    /// `remote:root/path` spec understood by the mover.
    fn spec(&self, remote_path: &str) -> String {
        let mut spec = format!("{}:{}", self.remote, self.root);
        if !remote_path.is_empty() {
            if !self.root.is_empty() {
                spec.push('/');
            }
            spec.push_str(remote_path.trim_end_matches('/'));
        }
        spec
    }

    fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        debug!(program = %self.program, ?args, "invoking mover");
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                ScratError::Destination(format!("cannot run '{}': {e}", self.program))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_mover_failure(args.first().copied().unwrap_or(""), &stderr));
        }
        Ok(output.stdout)
    }
}

/// Exit-status classification by stderr text; the mover does not expose a
/// structured error surface across providers.
fn classify_mover_failure(op: &str, stderr: &str) -> ScratError {
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("timeout")
        || lowered.contains("connection reset")
        || lowered.contains("temporarily")
        || lowered.contains("try again")
    {
        ScratError::TransientIo(format!("mover {op}: {}", stderr.trim()))
    } else {
        ScratError::Destination(format!("mover {op}: {}", stderr.trim()))
    }
}

impl Destination for ShelledDestination {
    fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        // Confirms both that the mover binary runs and the remote resolves.
        self.run(&["mkdir", &self.spec("")])?;
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn put_stream(
        &mut self,
        remote_path: &str,
        reader: &mut dyn Read,
        progress: Option<&mut dyn FnMut(u64)>,
    ) -> Result<u64> {
        validate_remote_path(remote_path)?;

        // Stage to a spool file; the mover only takes file arguments.
        let mut spool = tempfile::NamedTempFile::new()?;
        let written = copy_with_progress(reader, spool.as_file_mut(), progress)?;
        spool.as_file_mut().flush()?;

        let local = spool.path().to_string_lossy().into_owned();
        self.run(&["copyto", &local, &self.spec(remote_path)])?;
        Ok(written)
    }

    fn get_stream(
        &mut self,
        remote_path: &str,
        writer: &mut dyn Write,
        progress: Option<&mut dyn FnMut(u64)>,
    ) -> Result<u64> {
        validate_remote_path(remote_path)?;

        let mut child = Command::new(&self.program)
            .args(["cat", &self.spec(remote_path)])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ScratError::Destination(format!("cannot run '{}': {e}", self.program)))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ScratError::Internal("mover stdout not captured".into()))?;
        let copied = copy_with_progress(&mut stdout, writer, progress)?;

        let output = child
            .wait_with_output()
            .map_err(|e| ScratError::Destination(format!("mover wait: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_mover_failure("cat", &stderr));
        }
        Ok(copied)
    }

    fn list(&mut self, prefix: &str) -> Result<Vec<RemoteEntry>> {
        let stdout = match self.run(&["lsjson", "--max-depth", "1", &self.spec(prefix)]) {
            Ok(out) => out,
            Err(ScratError::Destination(msg)) if msg.contains("not found") => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let parsed: Vec<serde_json::Value> = serde_json::from_slice(&stdout)
            .map_err(|e| ScratError::Destination(format!("mover lsjson parse: {e}")))?;

        let mut entries = Vec::new();
        for item in parsed {
            let Some(name) = item.get("Name").and_then(|v| v.as_str()) else {
                warn!("mover lsjson entry without Name field");
                continue;
            };
            entries.push(RemoteEntry {
                name: name.to_string(),
                size: item.get("Size").and_then(|v| v.as_i64()).unwrap_or(0).max(0) as u64,
                is_dir: item.get("IsDir").and_then(|v| v.as_bool()).unwrap_or(false),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn delete(&mut self, remote_path: &str) -> Result<()> {
        validate_remote_path(remote_path)?;
        match self.run(&["deletefile", &self.spec(remote_path)]) {
            Ok(_) => Ok(()),
            Err(ScratError::Destination(msg)) if msg.contains("not found") => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn delete_tree(&mut self, remote_prefix: &str) -> Result<()> {
        validate_remote_path(remote_prefix.trim_end_matches('/'))?;
        match self.run(&["purge", &self.spec(remote_prefix)]) {
            Ok(_) => Ok(()),
            Err(ScratError::Destination(msg)) if msg.contains("not found") => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn stat(&mut self, remote_path: &str) -> Result<RemoteStat> {
        validate_remote_path(remote_path)?;
        let stdout = match self.run(&["lsjson", &self.spec(remote_path)]) {
            Ok(out) => out,
            // The mover exits nonzero for a missing object.
            Err(ScratError::Destination(_)) => {
                return Ok(RemoteStat {
                    exists: false,
                    size: 0,
                })
            }
            Err(e) => return Err(e),
        };

        let parsed: Vec<serde_json::Value> = serde_json::from_slice(&stdout).unwrap_or_default();
        match parsed.first() {
            Some(item) => Ok(RemoteStat {
                exists: true,
                size: item.get("Size").and_then(|v| v.as_i64()).unwrap_or(0).max(0) as u64,
            }),
            None => Ok(RemoteStat {
                exists: false,
                size: 0,
            }),
        }
    }

    fn free_space(&mut self) -> Result<Option<u64>> {
        let spec = format!("{}:", self.remote);
        let Ok(stdout) = self.run(&["about", "--json", &spec]) else {
            return Ok(None);
        };
        let parsed: serde_json::Value = match serde_json::from_slice(&stdout) {
            Ok(v) => v,
            Err(_) => return Ok(None),
        };
        Ok(parsed.get("free").and_then(|v| v.as_u64()))
    }

    fn streams_directly(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_composition() {
        let dest = ShelledDestination::new("rclone", "gdrive", "/scrat-backup/");
        assert_eq!(dest.spec(""), "gdrive:scrat-backup");
        assert_eq!(
            dest.spec("backups/x/data.001.scrat"),
            "gdrive:scrat-backup/backups/x/data.001.scrat"
        );

        let bare = ShelledDestination::new("rclone", "gdrive", "");
        assert_eq!(bare.spec(""), "gdrive:");
        assert_eq!(bare.spec("a/b"), "gdrive:a/b");
    }

    #[test]
    fn missing_program_is_a_destination_error() {
        let mut dest = ShelledDestination::new("scrat-no-such-mover", "remote", "root");
        assert!(matches!(
            dest.connect(),
            Err(ScratError::Destination(_))
        ));
    }

    #[test]
    fn stderr_classification() {
        assert!(classify_mover_failure("copyto", "connection reset by peer").is_transient());
        assert!(!classify_mover_failure("copyto", "permission denied").is_transient());
    }

    #[test]
    fn staged_destination_flag() {
        let dest = ShelledDestination::new("rclone", "gdrive", "");
        assert!(!dest.streams_directly());
    }
}
