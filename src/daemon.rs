//! Bootstrap and unload of the top-level `runsvdir` daemon.
//!
//! Several installations may share a host, so a daemon only counts as ours
//! when its command line is `runsvdir -P <our services dir>`.

use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info, warn};

use crate::runner::LifecycleError;

pub const DAEMON_BINARY: &str = "runsvdir";
pub const CONTROL_BINARY: &str = "sv";

/// Keeps the supervision daemon running for one installation.
pub trait Daemon {
    /// Starts the daemon unless it already runs; returns the pid when it
    /// had to be started.
    fn bootstrap(&self) -> Result<Option<u32>, LifecycleError>;

    /// Signals the daemon to stop supervising; returns how many daemon
    /// processes were signalled.
    fn unload(&self) -> Result<usize, LifecycleError>;
}

/// `runsvdir` bound to one services directory.
#[derive(Debug, Clone)]
pub struct Runsvdir {
    binary: PathBuf,
    services_dir: PathBuf,
    root: PathBuf,
}

impl Runsvdir {
    pub fn new(binary: PathBuf, root: &Path, services_dir: PathBuf) -> Self {
        Self {
            binary,
            services_dir,
            root: root.to_path_buf(),
        }
    }

    /// Pids of `runsvdir` processes supervising this services directory.
    pub fn running_pids(&self) -> Result<Vec<u32>, LifecycleError> {
        let output = Command::new("pgrep")
            .arg(DAEMON_BINARY)
            .output()
            .map_err(|source| LifecycleError::Probe { source })?;
        // pgrep exits 1 when nothing matches.
        let candidates = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .collect::<Vec<_>>();

        let mut pids = Vec::new();
        for pid in candidates {
            let args = Command::new("ps")
                .args(["-o", "args=", "-p", &pid.to_string()])
                .output()
                .map_err(|source| LifecycleError::Probe { source })?;
            let args = String::from_utf8_lossy(&args.stdout);
            if matches_daemon(args.trim(), &self.services_dir) {
                pids.push(pid);
            } else {
                debug!(pid, args = %args.trim(), "ignoring runsvdir of another installation");
            }
        }
        Ok(pids)
    }

    fn spawn(&self) -> Result<u32, LifecycleError> {
        let path = std::env::var_os("PATH").unwrap_or_default();
        let mut command = Command::new(&self.binary);
        command
            .arg("-P")
            .arg(&self.services_dir)
            .current_dir(&self.root)
            .env("PATH", sanitize_path(&path))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // New session: the daemon outlives this process and its terminal.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = command.spawn().map_err(|source| LifecycleError::Spawn {
            binary: self.binary.clone(),
            source,
        })?;
        Ok(child.id())
    }
}

impl Daemon for Runsvdir {
    fn bootstrap(&self) -> Result<Option<u32>, LifecycleError> {
        if let Some(pid) = self.running_pids()?.first() {
            debug!(pid, "runsvdir already running");
            return Ok(None);
        }
        let pid = self.spawn()?;
        info!(pid, services = %self.services_dir.display(), "started runsvdir");
        Ok(Some(pid))
    }

    fn unload(&self) -> Result<usize, LifecycleError> {
        let pids = self.running_pids()?;
        for pid in &pids {
            // SIGHUP makes runsvdir stop every runsv and exit.
            let rc = unsafe { libc::kill(*pid as libc::pid_t, libc::SIGHUP) };
            if rc == -1 {
                let source = io::Error::last_os_error();
                if source.raw_os_error() == Some(libc::ESRCH) {
                    warn!(pid = *pid, "runsvdir exited before it could be unloaded");
                    continue;
                }
                return Err(LifecycleError::Signal { pid: *pid, source });
            }
        }
        Ok(pids.len())
    }
}

/// Locates a runit binary on `PATH`.
pub fn locate(binary: &str) -> Result<PathBuf, LifecycleError> {
    which::which(binary).map_err(|_| LifecycleError::DaemonNotInstalled {
        binary: binary.to_string(),
        hint: install_hint(),
    })
}

pub fn install_hint() -> &'static str {
    if cfg!(target_os = "macos") {
        "install runit with `brew install runit`"
    } else {
        "install runit with your distribution's package manager, e.g. `sudo apt-get install runit`"
    }
}

/// Whether `args` is the command line of a daemon for `services_dir`.
pub fn matches_daemon(args: &str, services_dir: &Path) -> bool {
    let (program, rest) = args.split_once(' ').unwrap_or((args, ""));
    let program_name = Path::new(program).file_name().unwrap_or_default();
    if program_name != OsStr::new(DAEMON_BINARY) {
        return false;
    }
    let expected = format!("-P {}", services_dir.display());
    // runsvdir may carry a trailing log argument.
    rest == expected || rest.starts_with(&format!("{expected} "))
}

/// Drops `PATH` entries that are not existing directories; `runsvdir`
/// aborts on the first bad entry.
pub fn sanitize_path(path: &OsStr) -> OsString {
    let entries: Vec<PathBuf> = std::env::split_paths(path)
        .filter(|entry| entry.is_dir())
        .collect();
    std::env::join_paths(entries).unwrap_or_default()
}
