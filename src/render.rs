//! Renders the on-disk supervision tree.
//!
//! A render pass writes one supervision entry per enabled service, links it
//! into the services directory that `runsvdir` scans, and prunes links for
//! services that are no longer enabled. Files are only rewritten when their
//! content changes, so a pass over an unchanged configuration touches
//! nothing and never makes `runsv` notice a new `run` script.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::layout::{self, Layout};
use crate::scripts::{self, LogRotation};
use crate::service::ServiceDescriptor;

const EXECUTABLE: u32 = 0o755;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error(
        "service '{service}' has invalid environment variable '{key}'; keys must match ^[A-Z_]+$"
    )]
    InvalidEnvKey { service: String, key: String },
    #[error("failed to create {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to link {link:?} -> {target:?}: {source}")]
    Link {
        link: PathBuf,
        target: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove stale link {path:?}: {source}")]
    Prune {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What a render pass changed on disk.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RenderReport {
    /// Files whose content was (re)written.
    pub written: Vec<PathBuf>,
    /// Symlinks created or retargeted.
    pub linked: Vec<PathBuf>,
    /// Service names whose stale links were removed.
    pub pruned: Vec<String>,
}

impl RenderReport {
    pub fn is_unchanged(&self) -> bool {
        self.written.is_empty() && self.linked.is_empty() && self.pruned.is_empty()
    }
}

type WriteFile = fn(&Path, &str) -> io::Result<()>;

pub struct Renderer<'a> {
    layout: &'a Layout,
    rotation: LogRotation,
    write_file: WriteFile,
}

impl<'a> Renderer<'a> {
    pub fn new(layout: &'a Layout, rotation: LogRotation) -> Self {
        Self {
            layout,
            rotation,
            write_file: |path, contents| fs::write(path, contents),
        }
    }

    #[cfg(test)]
    fn with_writer(mut self, write_file: WriteFile) -> Self {
        self.write_file = write_file;
        self
    }

    /// Brings the tree in line with `services`. Safe to call repeatedly.
    pub fn render(&self, services: &[ServiceDescriptor]) -> Result<RenderReport, RenderError> {
        for service in services {
            if let Some(key) = service.invalid_env_key() {
                return Err(RenderError::InvalidEnvKey {
                    service: service.name.clone(),
                    key: key.to_string(),
                });
            }
        }

        for dir in [
            self.layout.sv_dir(),
            self.layout.services_dir(),
            self.layout.log_dir(),
        ] {
            create_dir(&dir)?;
        }

        let enabled: Vec<&ServiceDescriptor> =
            services.iter().filter(|service| service.enabled).collect();
        let width = scripts::label_width(enabled.iter().map(|service| service.name.as_str()));

        let mut report = RenderReport::default();
        for (index, service) in enabled.iter().enumerate() {
            self.render_service(index, width, service, &mut report)?;
        }

        let expected: BTreeSet<&str> = enabled.iter().map(|service| service.name.as_str()).collect();
        self.prune_stale_links(&expected, &mut report)?;

        if !report.is_unchanged() {
            info!(
                written = report.written.len(),
                linked = report.linked.len(),
                pruned = report.pruned.len(),
                "rendered supervision tree"
            );
        }
        Ok(report)
    }

    fn render_service(
        &self,
        index: usize,
        width: usize,
        service: &ServiceDescriptor,
        report: &mut RenderReport,
    ) -> Result<(), RenderError> {
        let entry = self.layout.entry(&service.name);
        let log_dir = self.layout.service_log_dir(&service.name);
        for dir in [
            entry.clone(),
            entry.join("control"),
            entry.join("log"),
            log_dir.clone(),
        ] {
            create_dir(&dir)?;
        }

        let root = self.layout.root();
        self.write_if_changed(&entry.join("run"), &scripts::run_script(root, service), true, report)?;
        self.write_if_changed(&entry.join("finish"), &scripts::finish_script(service), true, report)?;
        // Present `down` keeps runsv from starting the service on its own.
        self.write_if_changed(&entry.join("down"), "", false, report)?;
        self.write_if_changed(
            &entry.join("control").join("t"),
            &scripts::control_term_script(),
            true,
            report,
        )?;
        self.write_if_changed(
            &entry.join("log").join("run"),
            &scripts::log_run_script(&log_dir),
            true,
            report,
        )?;
        let log_config = layout::entry_log_config(&entry);
        self.write_if_changed(
            &log_config,
            &scripts::log_config(&service.name, index, width, self.rotation),
            false,
            report,
        )?;

        ensure_symlink(&log_config, &layout::svlogd_config(&log_dir), report)?;
        ensure_symlink(&entry, &self.layout.service_link(&service.name), report)
    }

    fn write_if_changed(
        &self,
        path: &Path,
        contents: &str,
        executable: bool,
        report: &mut RenderReport,
    ) -> Result<(), RenderError> {
        if let Ok(existing) = fs::read(path) {
            if existing == contents.as_bytes() {
                return Ok(());
            }
        }
        match (self.write_file)(path, contents) {
            Ok(()) => {}
            // The running copy is still valid; the next render retries.
            Err(err) if is_text_file_busy(&err) => {
                debug!(path = %path.display(), "skipped write to busy executable");
                return Ok(());
            }
            Err(source) => {
                return Err(RenderError::Write {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
        if executable {
            fs::set_permissions(path, fs::Permissions::from_mode(EXECUTABLE)).map_err(|source| {
                RenderError::Write {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
        }
        report.written.push(path.to_path_buf());
        Ok(())
    }

    fn prune_stale_links(
        &self,
        expected: &BTreeSet<&str>,
        report: &mut RenderReport,
    ) -> Result<(), RenderError> {
        let services_dir = self.layout.services_dir();
        let entries = fs::read_dir(&services_dir).map_err(|source| RenderError::Prune {
            path: services_dir.clone(),
            source,
        })?;
        let mut stale = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| RenderError::Prune {
                path: services_dir.clone(),
                source,
            })?;
            let is_link = entry
                .file_type()
                .map(|kind| kind.is_symlink())
                .unwrap_or(false);
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_link && !expected.contains(name.as_str()) {
                stale.push((name, entry.path()));
            }
        }
        stale.sort();
        for (name, path) in stale {
            fs::remove_file(&path).map_err(|source| RenderError::Prune {
                path: path.clone(),
                source,
            })?;
            debug!(service = %name, "removed stale service link");
            report.pruned.push(name);
        }
        Ok(())
    }
}

fn create_dir(path: &Path) -> Result<(), RenderError> {
    fs::create_dir_all(path).map_err(|source| RenderError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

fn ensure_symlink(target: &Path, link: &Path, report: &mut RenderReport) -> Result<(), RenderError> {
    let link_error = |source| RenderError::Link {
        link: link.to_path_buf(),
        target: target.to_path_buf(),
        source,
    };
    match fs::symlink_metadata(link) {
        Ok(metadata) if metadata.file_type().is_symlink() => {
            if fs::read_link(link).map_err(link_error)? == target {
                return Ok(());
            }
            fs::remove_file(link).map_err(link_error)?;
        }
        Ok(metadata) if metadata.is_dir() => {
            return Err(link_error(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "a directory is in the way",
            )));
        }
        Ok(_) => {
            debug!(path = %link.display(), "replacing regular file with link");
            fs::remove_file(link).map_err(link_error)?;
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(source) => return Err(link_error(source)),
    }
    symlink(target, link).map_err(link_error)?;
    report.linked.push(link.to_path_buf());
    Ok(())
}

pub fn is_text_file_busy(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ETXTBSY)
}
