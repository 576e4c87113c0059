//! On-disk layout of a supervised installation.
//!
//! Every path the control plane touches is derived from a single installation
//! root: `sv/<name>` holds the supervision entry, `services/<name>` is the
//! symlink `runsvdir` scans, and `log/<name>/current` is the live log.

use std::path::{Path, PathBuf};

const SV_DIR: &str = "sv";
const SERVICES_DIR: &str = "services";
const LOG_DIR: &str = "log";
const STOPPING_SENTINEL: &str = ".stopping";

/// Paths derived from the installation root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        // Derived paths end up in scripts, symlink targets and the runsvdir
        // command line, none of which share our working directory.
        let root = std::path::absolute(&root).unwrap_or(root);
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one supervision entry per rendered service.
    pub fn sv_dir(&self) -> PathBuf {
        self.root.join(SV_DIR)
    }

    /// Directory of symlinks scanned by `runsvdir`.
    pub fn services_dir(&self) -> PathBuf {
        self.root.join(SERVICES_DIR)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join(LOG_DIR)
    }

    pub fn entry(&self, name: &str) -> PathBuf {
        self.sv_dir().join(name)
    }

    pub fn service_link(&self, name: &str) -> PathBuf {
        self.services_dir().join(name)
    }

    pub fn service_log_dir(&self, name: &str) -> PathBuf {
        self.log_dir().join(name)
    }
}

/// Binary status record written by `runsv`.
pub fn status_file(service_dir: &Path) -> PathBuf {
    service_dir.join("supervise").join("status")
}

/// Control FIFO; its presence means `runsv` accepts commands for the service.
pub fn control_fifo(service_dir: &Path) -> PathBuf {
    service_dir.join("supervise").join("ok")
}

/// Marker written before an intentional stop.
pub fn stopping_sentinel(service_dir: &Path) -> PathBuf {
    service_dir.join(STOPPING_SENTINEL)
}

/// `svlogd` config kept in the supervision entry.
pub fn entry_log_config(entry: &Path) -> PathBuf {
    entry.join("log").join("config")
}

/// Where `svlogd` reads its config: the log directory itself.
pub fn svlogd_config(log_dir: &Path) -> PathBuf {
    log_dir.join("config")
}

/// Live log file inside a per-service log directory.
pub fn current_log(log_dir: &Path) -> PathBuf {
    log_dir.join("current")
}

/// Last path component as a service name.
pub fn service_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
