//! resolv.conf publisher.
//!
//! Installs `nameserver <ip> # added by dockhand` as the first line of the
//! target file and comments out whatever nameservers were there, so only
//! the local resolver is consulted while the process runs. Every line this
//! publisher writes carries the sentinel suffix, which is how a later
//! rewrite finds and reverses exactly its own edits while leaving
//! operator-authored lines alone.

use async_trait::async_trait;
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::reload::UnitReloader;
use super::Publisher;
use crate::error::Error;

/// Suffix marking publisher-owned lines.
pub const SENTINEL: &str = "# added by dockhand";

/// The upstart job owning the target file.
const RESOLVCONF_JOB: &str = "resolvconf";

/// Publisher for an `/etc/resolv.conf`-style file.
pub struct ResolvConf {
    path: PathBuf,
    reloader: Option<Arc<dyn UnitReloader>>,
}

impl ResolvConf {
    /// Create a publisher for `path`. Without a reloader the file is still
    /// rewritten; only the service poke is skipped.
    pub fn new(path: PathBuf, reloader: Option<Arc<dyn UnitReloader>>) -> Self {
        Self { path, reloader }
    }

    async fn reload(&self) {
        if let Some(reloader) = &self.reloader {
            if let Err(e) = reloader.reload(RESOLVCONF_JOB).await {
                warn!("resolvconf reload failed: {e}");
            }
        }
    }
}

#[async_trait]
impl Publisher for ResolvConf {
    fn name(&self) -> &'static str {
        "resolvconf"
    }

    async fn store_address(&mut self, address: Ipv4Addr) -> Result<(), Error> {
        info!(path = %self.path.display(), %address, "updating resolv.conf");
        let directive = format!("nameserver {address} {SENTINEL}\n");
        rewrite(&directive, &self.path)?;
        self.reload().await;
        Ok(())
    }

    async fn clean(&mut self) {
        info!(path = %self.path.display(), "restoring resolv.conf");
        if let Err(e) = rewrite("", &self.path) {
            warn!(path = %self.path.display(), "failed to restore resolv.conf: {e}");
            return;
        }
        self.reload().await;
    }
}

/// Rewrite the file: drop sentinel-marked lines, put `insert` first, then
/// re-emit the surviving lines. When inserting, survivors are commented
/// out; when clearing (`insert` empty), one comment prefix is removed so
/// the pre-publication content comes back.
pub fn rewrite(insert: &str, path: &Path) -> io::Result<()> {
    let original = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let mut output = String::with_capacity(original.len() + insert.len());
    output.push_str(insert);

    for line in strip_sentinel_lines(&original) {
        if insert.is_empty() {
            output.push_str(line.strip_prefix("# ").unwrap_or(line));
        } else if line.starts_with("# ") {
            // Already commented; re-prefixing here would make repeated
            // store calls diverge.
            output.push_str(line);
        } else {
            output.push_str("# ");
            output.push_str(line);
        }
    }

    fs::write(path, output)
}

/// Lines of `input` (trailing newlines retained) that do not end with the
/// sentinel. Matching lines are dropped together with their newline.
fn strip_sentinel_lines(input: &str) -> impl Iterator<Item = &str> {
    input
        .split_inclusive('\n')
        .filter(|line| !line.trim_end_matches(['\n', '\r']).ends_with(SENTINEL))
}
