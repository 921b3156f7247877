use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::destination::{validate_remote_path, Destination, RemoteEntry, RemoteStat};
use crate::error::{Result, ScratError};

/// In-memory destination for tests: a map of `/`-separated object paths to
/// their bytes. Supports injecting transient upload failures to exercise
/// the retry path.
pub struct MemoryDestination {
    objects: BTreeMap<String, Vec<u8>>,
    connected: bool,
    fail_puts: u32,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self {
            objects: BTreeMap::new(),
            connected: false,
            fail_puts: 0,
        }
    }

    /// Make the next `n` `put_stream` calls fail with a transient error.
    pub fn fail_next_puts(&mut self, n: u32) {
        self.fail_puts = n;
    }

    pub fn contains(&self, remote_path: &str) -> bool {
        self.objects.contains_key(remote_path)
    }

    pub fn object_names(&self) -> Vec<String> {
        self.objects.keys().cloned().collect()
    }
}

impl Destination for MemoryDestination {
    fn connect(&mut self) -> Result<()> {
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
        mut progress: Option<&mut dyn FnMut(u64)>,
    ) -> Result<u64> {
        validate_remote_path(remote_path)?;
        if self.fail_puts > 0 {
            self.fail_puts -= 1;
            return Err(ScratError::TransientIo("injected upload failure".into()));
        }

        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        let stored = data.len() as u64;
        if let Some(cb) = progress.as_deref_mut() {
            cb(stored);
        }
        self.objects.insert(remote_path.to_string(), data);
        Ok(stored)
    }

    fn get_stream(
        &mut self,
        remote_path: &str,
        writer: &mut dyn Write,
        mut progress: Option<&mut dyn FnMut(u64)>,
    ) -> Result<u64> {
        validate_remote_path(remote_path)?;
        let data = self.objects.get(remote_path).ok_or_else(|| {
            ScratError::Destination(format!("object not found: {remote_path}"))
        })?;
        writer.write_all(data)?;
        let written = data.len() as u64;
        if let Some(cb) = progress.as_deref_mut() {
            cb(written);
        }
        Ok(written)
    }

    fn list(&mut self, prefix: &str) -> Result<Vec<RemoteEntry>> {
        let prefix = prefix.trim_end_matches('/');
        let want = if prefix.is_empty() {
            String::new()
        } else {
            format!("{prefix}/")
        };

        let mut entries: BTreeMap<String, RemoteEntry> = BTreeMap::new();
        for (key, data) in &self.objects {
            let Some(rest) = key.strip_prefix(&want) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            match rest.split_once('/') {
                Some((dir, _)) => {
                    entries.entry(dir.to_string()).or_insert(RemoteEntry {
                        name: dir.to_string(),
                        size: 0,
                        is_dir: true,
                    });
                }
                None => {
                    entries.insert(
                        rest.to_string(),
                        RemoteEntry {
                            name: rest.to_string(),
                            size: data.len() as u64,
                            is_dir: false,
                        },
                    );
                }
            }
        }
        Ok(entries.into_values().collect())
    }

    fn delete(&mut self, remote_path: &str) -> Result<()> {
        validate_remote_path(remote_path)?;
        self.objects.remove(remote_path);
        Ok(())
    }

    fn delete_tree(&mut self, remote_prefix: &str) -> Result<()> {
        let prefix = remote_prefix.trim_end_matches('/');
        validate_remote_path(prefix)?;
        let want = format!("{prefix}/");
        self.objects.retain(|key, _| !key.starts_with(&want));
        Ok(())
    }

    fn stat(&mut self, remote_path: &str) -> Result<RemoteStat> {
        validate_remote_path(remote_path)?;
        match self.objects.get(remote_path) {
            Some(data) => Ok(RemoteStat {
                exists: true,
                size: data.len() as u64,
            }),
            None => Ok(RemoteStat {
                exists: false,
                size: 0,
            }),
        }
    }

    fn free_space(&mut self) -> Result<Option<u64>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::destination::retry::with_retry;

    #[test]
    fn probe_test_roundtrips() {
        let mut dest = MemoryDestination::new();
        dest.test().unwrap();
        assert!(!dest.stat("scrat-probe.tmp").unwrap().exists);
    }

    #[test]
    fn list_returns_direct_children_only() {
        let mut dest = MemoryDestination::new();
        dest.put_stream("backups/a/data.001.scrat", &mut &b"1"[..], None)
            .unwrap();
        dest.put_stream("backups/a/manifest.json.enc", &mut &b"2"[..], None)
            .unwrap();
        dest.put_stream("backups/b/data.001.scrat", &mut &b"3"[..], None)
            .unwrap();
        dest.put_stream("recovery_info.txt", &mut &b"4"[..], None)
            .unwrap();

        let top = dest.list("").unwrap();
        let names: Vec<_> = top.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["backups", "recovery_info.txt"]);

        let backups = dest.list("backups").unwrap();
        let names: Vec<_> = backups.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(backups.iter().all(|e| e.is_dir));

        let within = dest.list("backups/a").unwrap();
        assert_eq!(within.len(), 2);
        assert!(within.iter().all(|e| !e.is_dir));
    }

    #[test]
    fn delete_tree_removes_the_prefix() {
        let mut dest = MemoryDestination::new();
        dest.put_stream("backups/a/data.001.scrat", &mut &b"1"[..], None)
            .unwrap();
        dest.put_stream("backups/b/data.001.scrat", &mut &b"2"[..], None)
            .unwrap();

        dest.delete_tree("backups/a").unwrap();
        assert!(!dest.contains("backups/a/data.001.scrat"));
        assert!(dest.contains("backups/b/data.001.scrat"));
        // Idempotent on a missing tree.
        dest.delete_tree("backups/a").unwrap();
    }

    #[test]
    fn transient_put_failures_exhaust_through_the_retry_loop() {
        let retry = RetryConfig {
            max_retries: 3,
            retry_delay_ms: 1,
            retry_max_delay_ms: 2,
        };

        let mut dest = MemoryDestination::new();
        dest.fail_next_puts(2);
        let stored = with_retry(&retry, "probe upload", || {
            dest.put_stream("obj", &mut &b"payload"[..], None)
        })
        .unwrap();
        assert_eq!(stored, 7);
        assert!(dest.contains("obj"));

        // More failures than the budget: the last error surfaces.
        let mut dest = MemoryDestination::new();
        dest.fail_next_puts(10);
        let err = with_retry(&retry, "probe upload", || {
            dest.put_stream("obj", &mut &b"payload"[..], None)
        })
        .unwrap_err();
        assert!(err.is_transient());
        assert!(!dest.contains("obj"));
    }

    #[test]
    fn traversal_is_rejected() {
        let mut dest = MemoryDestination::new();
        assert!(dest.put_stream("../escape", &mut &b"x"[..], None).is_err());
        assert!(dest.get_stream("/abs", &mut Vec::new(), None).is_err());
    }
}
