use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use tracing::debug;

use super::{copy_with_progress, validate_remote_path, Destination, RemoteEntry, RemoteStat};
use crate::error::{Result, ScratError};

const QUOTA_PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:">
  <D:prop><D:quota-available-bytes/></D:prop>
</D:propfind>"#;

/// WebDAV destination over HTTPS. Certificate verification is on by
/// default; plaintext HTTP requires an explicit opt-in.
pub struct WebdavDestination {
    /// Base URL without a trailing slash, e.g. `https://host/dav/scrat`.
    base_url: String,
    auth: String,
    agent: ureq::Agent,
    connected: bool,
}

impl WebdavDestination {
    pub fn new(
        url: &str,
        username: &str,
        password: &str,
        allow_insecure_http: bool,
    ) -> Result<Self> {
        let trimmed = url.trim_end_matches('/');
        let lowered = trimmed.to_ascii_lowercase();
        if lowered.starts_with("http://") {
            if !allow_insecure_http {
                return Err(ScratError::Validation(
                    "webdav over plaintext HTTP is blocked by default; \
                     set allow_insecure_http to permit it (unsafe)"
                        .into(),
                ));
            }
            tracing::warn!("webdav destination uses plaintext HTTP (allow_insecure_http=true)");
        } else if !lowered.starts_with("https://") {
            return Err(ScratError::Validation(format!(
                "webdav url must be http(s): '{url}'"
            )));
        }

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        let credentials =
            base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));

        Ok(Self {
            base_url: trimmed.to_string(),
            auth: format!("Basic {credentials}"),
            agent,
            connected: false,
        })
    }

    fn url_for(&self, remote_path: &str) -> String {
        if remote_path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, remote_path)
        }
    }

    fn request(&self, method: &str, url: &str) -> ureq::Request {
        self.agent
            .request(method, url)
            .set("Authorization", &self.auth)
    }

    fn classify(op: &str, err: ureq::Error) -> ScratError {
        match err {
            ureq::Error::Status(401, _) | ureq::Error::Status(403, _) => {
                ScratError::Destination(format!("webdav {op}: authentication rejected"))
            }
            ureq::Error::Status(507, _) => {
                ScratError::Destination(format!("webdav {op}: server out of space"))
            }
            ureq::Error::Status(code, _) if code == 429 || code >= 500 => {
                ScratError::TransientIo(format!("webdav {op}: HTTP {code}"))
            }
            ureq::Error::Status(code, _) => {
                ScratError::Destination(format!("webdav {op}: HTTP {code}"))
            }
            ureq::Error::Transport(t) => ScratError::TransientIo(format!("webdav {op}: {t}")),
        }
    }

    /// Create each collection level of `remote_dir` in turn; WebDAV servers
    /// refuse MKCOL with a missing parent. Paths sent to the server carry
    /// the leading separator of the base URL's path.
    fn mkdir_iterative(&self, remote_dir: &str) -> Result<()> {
        if remote_dir.is_empty() {
            return Ok(());
        }
        let mut level = String::new();
        for part in remote_dir.split('/').filter(|p| !p.is_empty()) {
            if !level.is_empty() {
                level.push('/');
            }
            level.push_str(part);
            self.mkcol(&self.url_for(&level))?;
        }
        Ok(())
    }

    fn mkcol(&self, url: &str) -> Result<()> {
        match self.request("MKCOL", url).call() {
            Ok(_) => {
                debug!(url, "created webdav collection");
                Ok(())
            }
            // 405: collection exists; 301: server redirects to the slash
            // form of an existing collection.
            Err(ureq::Error::Status(405, _)) | Err(ureq::Error::Status(301, _)) => Ok(()),
            Err(e) => Err(Self::classify("mkcol", e)),
        }
    }

    /// Create the base collection and its ancestors below the server root.
    fn create_base_collections(&self) -> Result<()> {
        let Some(scheme_end) = self.base_url.find("://") else {
            return Ok(());
        };
        let path_start = match self.base_url[scheme_end + 3..].find('/') {
            Some(i) => scheme_end + 3 + i,
            None => return Ok(()), // URL has no path component
        };
        let origin = &self.base_url[..path_start];

        let mut level = String::new();
        for part in self.base_url[path_start..].split('/').filter(|p| !p.is_empty()) {
            level.push('/');
            level.push_str(part);
            self.mkcol(&format!("{origin}{level}"))?;
        }
        Ok(())
    }
}

impl Destination for WebdavDestination {
    fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        // Probe the base collection; create it if the server reports none.
        match self
            .request("PROPFIND", &self.base_url)
            .set("Depth", "0")
            .call()
        {
            Ok(_) => {}
            Err(ureq::Error::Status(404, _)) => self.create_base_collections()?,
            Err(e) => return Err(Self::classify("connect", e)),
        }
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
        if let Some((parent, _)) = remote_path.rsplit_once('/') {
            self.mkdir_iterative(parent)?;
        }

        let count = Arc::new(AtomicU64::new(0));
        let body = BodyReader {
            inner: reader,
            count: Arc::clone(&count),
            progress,
        };

        self.request("PUT", &self.url_for(remote_path))
            .send(body)
            .map_err(|e| Self::classify("put", e))?;
        Ok(count.load(Ordering::Relaxed))
    }

    fn get_stream(
        &mut self,
        remote_path: &str,
        writer: &mut dyn Write,
        progress: Option<&mut dyn FnMut(u64)>,
    ) -> Result<u64> {
        validate_remote_path(remote_path)?;
        let response = self
            .request("GET", &self.url_for(remote_path))
            .call()
            .map_err(|e| match e {
                ureq::Error::Status(404, _) => {
                    ScratError::Destination(format!("object not found: {remote_path}"))
                }
                other => Self::classify("get", other),
            })?;
        let mut body = response.into_reader();
        Ok(copy_with_progress(&mut body, writer, progress)?)
    }

    fn list(&mut self, prefix: &str) -> Result<Vec<RemoteEntry>> {
        let url = self.url_for(prefix.trim_end_matches('/'));
        let response = match self.request("PROPFIND", &url).set("Depth", "1").call() {
            Ok(r) => r,
            Err(ureq::Error::Status(404, _)) => return Ok(Vec::new()),
            Err(e) => return Err(Self::classify("list", e)),
        };
        let body = response
            .into_string()
            .map_err(|e| ScratError::TransientIo(format!("webdav list body: {e}")))?;

        // Entry sizes are not extracted from the multistatus body; names and
        // collection flags are what the engine consumes.
        let mut entries = Vec::new();
        for href in find_tag_values(&body, "href") {
            let decoded = percent_decode(&href);
            let is_dir = decoded.ends_with('/');
            let name = decoded
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string();
            if name.is_empty() {
                continue;
            }
            // The first response is the listed collection itself.
            let prefix_tail = prefix
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or_default();
            if is_dir && name == prefix_tail {
                continue;
            }
            entries.push(RemoteEntry {
                name,
                size: 0,
                is_dir,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries.dedup_by(|a, b| a.name == b.name);
        Ok(entries)
    }

    fn delete(&mut self, remote_path: &str) -> Result<()> {
        validate_remote_path(remote_path)?;
        match self.request("DELETE", &self.url_for(remote_path)).call() {
            Ok(_) | Err(ureq::Error::Status(404, _)) => Ok(()),
            Err(e) => Err(Self::classify("delete", e)),
        }
    }

    fn delete_tree(&mut self, remote_prefix: &str) -> Result<()> {
        validate_remote_path(remote_prefix.trim_end_matches('/'))?;
        // DELETE on a collection is recursive per RFC 4918.
        match self
            .request("DELETE", &format!("{}/", self.url_for(remote_prefix.trim_end_matches('/'))))
            .call()
        {
            Ok(_) | Err(ureq::Error::Status(404, _)) => Ok(()),
            Err(e) => Err(Self::classify("delete_tree", e)),
        }
    }

    fn stat(&mut self, remote_path: &str) -> Result<RemoteStat> {
        validate_remote_path(remote_path)?;
        let response = match self
            .request("PROPFIND", &self.url_for(remote_path))
            .set("Depth", "0")
            .call()
        {
            Ok(r) => r,
            Err(ureq::Error::Status(404, _)) => {
                return Ok(RemoteStat {
                    exists: false,
                    size: 0,
                })
            }
            Err(e) => return Err(Self::classify("stat", e)),
        };
        let body = response
            .into_string()
            .map_err(|e| ScratError::TransientIo(format!("webdav stat body: {e}")))?;
        let size = find_tag_values(&body, "getcontentlength")
            .first()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(RemoteStat { exists: true, size })
    }

    fn free_space(&mut self) -> Result<Option<u64>> {
        let response = match self
            .request("PROPFIND", &self.base_url)
            .set("Depth", "0")
            .set("Content-Type", "application/xml")
            .send_string(QUOTA_PROPFIND_BODY)
        {
            Ok(r) => r,
            Err(_) => return Ok(None),
        };
        let Ok(body) = response.into_string() else {
            return Ok(None);
        };
        let quota = find_tag_values(&body, "quota-available-bytes")
            .first()
            .and_then(|v| v.parse::<i64>().ok());
        // Servers report -1 or -2 for "unlimited"/"unknown".
        Ok(quota.filter(|v| *v >= 0).map(|v| v as u64))
    }

    fn streams_directly(&self) -> bool {
        false
    }
}

/// Reader wrapper that counts uploaded bytes and feeds the progress callback.
struct BodyReader<'a, 'b> {
    inner: &'a mut dyn Read,
    count: Arc<AtomicU64>,
    progress: Option<&'b mut dyn FnMut(u64)>,
}

impl Read for BodyReader<'_, '_> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(out)?;
        if n > 0 {
            let total = self.count.fetch_add(n as u64, Ordering::Relaxed) + n as u64;
            if let Some(cb) = self.progress.as_deref_mut() {
                cb(total);
            }
        }
        Ok(n)
    }
}

/// Extract text content of every `<ns:name>`-style element with the given
/// local name from a multistatus body. ASCII-case-insensitive, namespace
/// prefixes ignored; attributes and self-closing elements skipped.
fn find_tag_values(body: &str, local_name: &str) -> Vec<String> {
    let lower = body.to_ascii_lowercase();
    let mut values = Vec::new();
    let mut i = 0;

    while let Some(open) = lower[i..].find('<') {
        let tag_start = i + open + 1;
        if lower[tag_start..].starts_with('/') {
            i = tag_start;
            continue;
        }
        let Some(rel_end) = lower[tag_start..].find('>') else {
            break;
        };
        let tag_end = tag_start + rel_end;
        let raw_tag = &lower[tag_start..tag_end];
        let self_closing = raw_tag.ends_with('/');
        let name = raw_tag
            .split_whitespace()
            .next()
            .unwrap_or(raw_tag)
            .trim_end_matches('/');
        let name = name.rsplit(':').next().unwrap_or(name);

        if name == local_name && !self_closing {
            let content_start = tag_end + 1;
            if let Some(rel_close) = lower[content_start..].find("</") {
                values.push(body[content_start..content_start + rel_close].trim().to_string());
                i = content_start + rel_close;
                continue;
            }
        }
        i = tag_end + 1;
    }
    values
}

/// Minimal percent-decoding for href paths.
fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(v) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_http_is_blocked_by_default() {
        let err = WebdavDestination::new("http://dav.example.com/scrat", "u", "p", false);
        assert!(matches!(err, Err(ScratError::Validation(_))));

        assert!(WebdavDestination::new("http://dav.example.com/scrat", "u", "p", true).is_ok());
        assert!(WebdavDestination::new("https://dav.example.com/scrat", "u", "p", false).is_ok());
    }

    #[test]
    fn non_http_scheme_rejected() {
        assert!(WebdavDestination::new("ftp://dav.example.com", "u", "p", false).is_err());
    }

    #[test]
    fn url_building_strips_trailing_slash() {
        let dest = WebdavDestination::new("https://dav.example.com/scrat/", "u", "p", false).unwrap();
        assert_eq!(
            dest.url_for("backups/x/data.001.scrat"),
            "https://dav.example.com/scrat/backups/x/data.001.scrat"
        );
    }

    #[test]
    fn multistatus_href_extraction() {
        let body = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/dav/scrat/backups/</D:href>
  </D:response>
  <D:response>
    <D:href>/dav/scrat/backups/20240501_120000_full/</D:href>
  </D:response>
  <D:response>
    <D:href>/dav/scrat/backups/data%20file.bin</D:href>
  </D:response>
</D:multistatus>"#;

        let hrefs = find_tag_values(body, "href");
        assert_eq!(hrefs.len(), 3);
        assert_eq!(percent_decode(&hrefs[2]), "/dav/scrat/backups/data file.bin");
    }

    #[test]
    fn mixed_case_namespace_tags_are_found() {
        let body = r#"<d:prop><d:getcontentlength>12345</d:getcontentlength></d:prop>"#;
        assert_eq!(find_tag_values(body, "getcontentlength"), vec!["12345"]);

        let body_upper = r#"<D:PROP><D:GETCONTENTLENGTH>99</D:GETCONTENTLENGTH></D:PROP>"#;
        assert_eq!(find_tag_values(body_upper, "getcontentlength"), vec!["99"]);
    }

    #[test]
    fn self_closing_tags_are_skipped() {
        let body = r#"<d:prop><d:quota-available-bytes/></d:prop>"#;
        assert!(find_tag_values(body, "quota-available-bytes").is_empty());
    }

    #[test]
    fn webdav_is_a_staged_destination() {
        let dest = WebdavDestination::new("https://dav.example.com/scrat", "u", "p", false).unwrap();
        assert!(!dest.streams_directly());
    }
}
