//! systemd drop-in publisher.
//!
//! Renders drop-in templates with the resolver's address into a
//! destination config tree and reloads the owning units. Each unit owns a
//! subdirectory and a file extension:
//!
//! - `systemd-resolved.service`: `resolved.conf.d/*.conf`
//! - `systemd-networkd.service`: `network/*.network`
//!
//! Templates are plain files with an `{address}` placeholder. `clean`
//! removes exactly the files this publisher wrote and reloads again.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use super::reload::UnitReloader;
use super::Publisher;
use crate::error::Error;

/// Placeholder replaced with the resolver's address in templates.
const ADDRESS_PLACEHOLDER: &str = "{address}";

#[derive(Debug, Clone, Copy)]
struct Service {
    unit: &'static str,
    dir: &'static str,
    extension: &'static str,
}

const SERVICES: &[Service] = &[
    Service {
        unit: "systemd-resolved.service",
        dir: "resolved.conf.d",
        extension: "conf",
    },
    Service {
        unit: "systemd-networkd.service",
        dir: "network",
        extension: "network",
    },
];

/// Publisher rendering systemd drop-ins.
pub struct SystemdDropIns {
    template_dir: PathBuf,
    dest_dir: PathBuf,
    written: HashMap<&'static str, Vec<PathBuf>>,
    reloader: Arc<dyn UnitReloader>,
}

impl SystemdDropIns {
    /// Create a publisher rendering templates from `template_dir` into
    /// `dest_dir`. The caller decides whether the destination exists;
    /// a missing destination should disable the publisher, not fail it.
    pub fn new(
        template_dir: PathBuf,
        dest_dir: PathBuf,
        reloader: Arc<dyn UnitReloader>,
    ) -> Self {
        Self {
            template_dir,
            dest_dir,
            written: HashMap::new(),
            reloader,
        }
    }

    async fn reload(&self, unit: &str) {
        if let Err(e) = self.reloader.reload(unit).await {
            warn!(unit, "systemd reload failed: {e}");
        }
    }
}

#[async_trait]
impl Publisher for SystemdDropIns {
    fn name(&self) -> &'static str {
        "systemd"
    }

    async fn store_address(&mut self, address: Ipv4Addr) -> Result<(), Error> {
        let address = address.to_string();

        for service in SERVICES {
            let template_dir = self.template_dir.join(service.dir);
            info!(unit = service.unit, dir = %template_dir.display(), "systemd: loading templates");

            let entries = match fs::read_dir(&template_dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(dir = %template_dir.display(), "systemd: {e}");
                    continue;
                }
            };

            let mut written = Vec::new();
            for entry in entries.flatten() {
                let template_path = entry.path();
                if template_path.extension().and_then(|e| e.to_str()) != Some(service.extension) {
                    continue;
                }
                let Some(file_name) = template_path.file_name() else {
                    continue;
                };

                let template = match fs::read_to_string(&template_path) {
                    Ok(template) => template,
                    Err(e) => {
                        warn!(path = %template_path.display(), "systemd: {e}");
                        continue;
                    }
                };

                let dest = self.dest_dir.join(service.dir).join(file_name);
                info!(dest = %dest.display(), "systemd: generating");
                if let Some(parent) = dest.parent() {
                    if let Err(e) = fs::create_dir_all(parent) {
                        warn!(dir = %parent.display(), "systemd: {e}");
                        continue;
                    }
                }
                match fs::write(&dest, template.replace(ADDRESS_PLACEHOLDER, &address)) {
                    Ok(()) => written.push(dest),
                    Err(e) => warn!(dest = %dest.display(), "systemd: {e}"),
                }
            }

            if written.is_empty() {
                info!(unit = service.unit, "systemd: no configs written, skipping reload");
            } else {
                self.written.insert(service.unit, written);
                self.reload(service.unit).await;
            }
        }

        Ok(())
    }

    async fn clean(&mut self) {
        let written = std::mem::take(&mut self.written);
        for (unit, files) in written {
            info!(unit, "systemd: removing configs");
            for file in files {
                if let Err(e) = fs::remove_file(&file) {
                    warn!(path = %file.display(), "systemd: {e}");
                }
            }
            self.reload(unit).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    /// Records requested reloads instead of touching any bus.
    #[derive(Default)]
    struct RecordingReloader {
        reloaded: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl UnitReloader for RecordingReloader {
        async fn reload(&self, unit: &str) -> Result<(), Error> {
            self.reloaded.lock().push(unit.to_string());
            Ok(())
        }
    }

    fn setup_templates(root: &std::path::Path) {
        let resolved = root.join("resolved.conf.d");
        fs::create_dir_all(&resolved).unwrap();
        fs::write(resolved.join("dns.conf"), "[Resolve]\nDNS={address}\n").unwrap();
        fs::write(resolved.join("notes.txt"), "not a template\n").unwrap();

        let network = root.join("network");
        fs::create_dir_all(&network).unwrap();
        fs::write(
            network.join("dns.network"),
            "[Match]\nName=*\n[Network]\nDNS={address}\n",
        )
        .unwrap();
    }

    #[tokio::test]
    async fn store_renders_templates_and_reloads_units() {
        let templates = tempdir().unwrap();
        let dest = tempdir().unwrap();
        setup_templates(templates.path());

        let reloader = Arc::new(RecordingReloader::default());
        let mut publisher = SystemdDropIns::new(
            templates.path().to_path_buf(),
            dest.path().to_path_buf(),
            reloader.clone(),
        );

        publisher.store_address("10.0.0.1".parse().unwrap()).await.unwrap();

        let rendered =
            fs::read_to_string(dest.path().join("resolved.conf.d/dns.conf")).unwrap();
        assert_eq!(rendered, "[Resolve]\nDNS=10.0.0.1\n");

        let network =
            fs::read_to_string(dest.path().join("network/dns.network")).unwrap();
        assert!(network.contains("DNS=10.0.0.1"));

        // the .txt file is not a template for either service
        assert!(!dest.path().join("resolved.conf.d/notes.txt").exists());

        let reloaded = reloader.reloaded.lock().clone();
        assert_eq!(
            reloaded,
            vec![
                "systemd-resolved.service".to_string(),
                "systemd-networkd.service".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn clean_removes_rendered_files_and_reloads_again() {
        let templates = tempdir().unwrap();
        let dest = tempdir().unwrap();
        setup_templates(templates.path());

        let reloader = Arc::new(RecordingReloader::default());
        let mut publisher = SystemdDropIns::new(
            templates.path().to_path_buf(),
            dest.path().to_path_buf(),
            reloader.clone(),
        );

        publisher.store_address("10.0.0.1".parse().unwrap()).await.unwrap();
        publisher.clean().await;

        assert!(!dest.path().join("resolved.conf.d/dns.conf").exists());
        assert!(!dest.path().join("network/dns.network").exists());
        assert_eq!(reloader.reloaded.lock().len(), 4);
    }

    #[tokio::test]
    async fn missing_template_dir_is_not_an_error() {
        let dest = tempdir().unwrap();
        let reloader = Arc::new(RecordingReloader::default());
        let mut publisher = SystemdDropIns::new(
            PathBuf::from("/nonexistent/templates"),
            dest.path().to_path_buf(),
            reloader.clone(),
        );

        publisher.store_address("10.0.0.1".parse().unwrap()).await.unwrap();
        assert!(reloader.reloaded.lock().is_empty());
    }
}
