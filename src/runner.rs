//! Lifecycle control of supervised services.
//!
//! This module contains the `Supervisor`, which orders start and stop
//! requests so data-oriented services come up first and go down last, waits
//! for `runsv` to accept commands before issuing them, and retries stops that
//! do not converge. It never infers state transitions itself: every
//! operation issues commands and reads status fresh from disk.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::control::{ControlChannel, ControlOutput, Verb};
use crate::daemon::Daemon;
use crate::events::Event;
use crate::layout::{self, Layout};
use crate::service::{DataServices, ServiceDescriptor};
use crate::shortcuts::{Resolver, ShortcutError, ShortcutTable};
use crate::status::{self, ServiceStatus, StatusError};

/// Errors raised while supervising services.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{binary} is not installed; {hint}")]
    DaemonNotInstalled { binary: String, hint: &'static str },
    #[error("failed to look for a running runsvdir: {source}")]
    Probe {
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn {binary:?}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to signal runsvdir pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
    #[error("the service '{name}' doesn't exist")]
    UnknownService { name: String },
    #[error("runsv did not open {path:?} after {attempts} attempts; cannot control the service safely")]
    NotReady { path: PathBuf, attempts: u32 },
    #[error("failed to run sv {verb} for {services:?}: {source}")]
    Control {
        verb: &'static str,
        services: Vec<String>,
        #[source]
        source: io::Error,
    },
    #[error("failed to update {path:?}: {source}")]
    Sentinel {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Shortcut(#[from] ShortcutError),
    #[error(transparent)]
    Status(#[from] StatusError),
}

/// Timing and ordering knobs for lifecycle operations.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Passed to `sv -w`.
    pub control_timeout: Duration,
    /// Total force-stop attempts per batch.
    pub stop_attempts: u32,
    /// Pause between force-stop attempts.
    pub retry_delay: Duration,
    /// Polls for `supervise/ok` before giving up.
    pub ready_attempts: u32,
    pub ready_interval: Duration,
    pub data_services: DataServices,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            control_timeout: Duration::from_secs(10),
            stop_attempts: 3,
            retry_delay: Duration::from_millis(500),
            ready_attempts: 50,
            ready_interval: Duration::from_millis(100),
            data_services: DataServices::default(),
        }
    }
}

/// Orchestrates start, stop and status of supervised services.
pub struct Supervisor<C, D> {
    layout: Layout,
    shortcuts: ShortcutTable,
    settings: SupervisorSettings,
    control: C,
    daemon: D,
    ready_messages: BTreeMap<String, String>,
    events: mpsc::Sender<Event>,
}

impl<C: ControlChannel, D: Daemon> Supervisor<C, D> {
    pub fn new(
        layout: Layout,
        shortcuts: ShortcutTable,
        settings: SupervisorSettings,
        control: C,
        daemon: D,
        events: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            layout,
            shortcuts,
            settings,
            control,
            daemon,
            ready_messages: BTreeMap::new(),
            events,
        }
    }

    /// Remembers ready messages to print once their services start.
    pub fn with_ready_messages(mut self, services: &[ServiceDescriptor]) -> Self {
        self.ready_messages = services
            .iter()
            .filter(|service| service.enabled)
            .filter_map(|service| {
                service
                    .ready_message
                    .clone()
                    .map(|message| (service.name.clone(), message))
            })
            .collect();
        self
    }

    fn resolver(&self) -> Resolver<'_> {
        Resolver::new(&self.layout, &self.shortcuts)
    }

    /// Starts the daemon for this root unless it already runs.
    pub fn bootstrap(&self) -> Result<(), LifecycleError> {
        if let Some(pid) = self.daemon.bootstrap()? {
            self.emit(Event::DaemonStarted { pid });
        }
        Ok(())
    }

    /// Waits for `runsv` to open the control FIFO of `service_dir`.
    pub fn ensure_ready(&self, service_dir: &Path) -> Result<(), LifecycleError> {
        let fifo = layout::control_fifo(service_dir);
        for attempt in 1..=self.settings.ready_attempts {
            if fifo.exists() {
                return Ok(());
            }
            debug!(path = %fifo.display(), attempt, "waiting for runsv");
            std::thread::sleep(self.settings.ready_interval);
        }
        Err(LifecycleError::NotReady {
            path: fifo,
            attempts: self.settings.ready_attempts,
        })
    }

    /// Starts `names`, or everything with data-oriented services first when
    /// `names` is empty.
    pub fn start(&self, names: &[String]) -> Result<bool, LifecycleError> {
        self.bootstrap()?;
        let targets = self.targets(names)?;
        let mut ok = true;
        if names.is_empty() {
            let (data, rest) = self.partition(&targets);
            // Later-declared data services are dependencies of earlier ones.
            for dir in data.iter().rev() {
                ok &= self.start_batch(std::slice::from_ref(dir))?;
            }
            if !rest.is_empty() {
                ok &= self.start_batch(&rest)?;
            }
        } else if !targets.is_empty() {
            ok = self.start_batch(&targets)?;
        }
        if ok {
            self.emit_ready_messages(&targets);
        }
        Ok(ok)
    }

    /// Stops `names`, or everything when `names` is empty: dependents first,
    /// then data-oriented services one at a time. Stopping everything
    /// successfully also unloads the daemon.
    pub fn stop(&self, names: &[String]) -> Result<bool, LifecycleError> {
        let targets = self.targets(names)?;
        let (data, rest) = self.partition(&targets);
        let mut ok = true;
        if !rest.is_empty() {
            ok &= self.stop_batch(&rest)?;
        }
        for dir in &data {
            ok &= self.stop_batch(std::slice::from_ref(dir))?;
        }
        if names.is_empty() && ok && self.daemon.unload()? > 0 {
            self.emit(Event::DaemonUnloaded);
        }
        Ok(ok)
    }

    pub fn restart(&self, names: &[String]) -> Result<bool, LifecycleError> {
        let stopped = self.stop(names)?;
        let started = self.start(names)?;
        Ok(stopped && started)
    }

    /// Current status of `names`, sorted by service name.
    pub fn status(&self, names: &[String]) -> Result<Vec<ServiceStatus>, LifecycleError> {
        let now = SystemTime::now();
        let mut statuses = self
            .resolver()
            .expand(names)?
            .iter()
            .map(|dir| match status::read_status(dir) {
                Err(StatusError::NotSupervised { name }) => {
                    debug!(service = %name, "no status record yet");
                    Ok(ServiceStatus::unsupervised(name, now))
                }
                other => other,
            })
            .collect::<Result<Vec<_>, _>>()?;
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(statuses)
    }

    /// `current` log files for `names`; empty when nothing matches.
    pub fn log_files(&self, names: &[String]) -> Result<Vec<PathBuf>, LifecycleError> {
        Ok(self
            .resolver()
            .expand_logs(names)?
            .iter()
            .map(|dir| layout::current_log(dir))
            .collect())
    }

    fn targets(&self, names: &[String]) -> Result<Vec<PathBuf>, LifecycleError> {
        let targets = self.resolver().expand(names)?;
        if let Some(missing) = targets.iter().find(|dir| !dir.exists()) {
            return Err(LifecycleError::UnknownService {
                name: layout::service_name(missing),
            });
        }
        Ok(targets)
    }

    // Data-oriented targets in declared order, and the rest in resolution order.
    fn partition(&self, targets: &[PathBuf]) -> (Vec<PathBuf>, Vec<PathBuf>) {
        let names: Vec<String> = targets.iter().map(|dir| layout::service_name(dir)).collect();
        let data = self
            .settings
            .data_services
            .present(&names)
            .map(|name| self.layout.service_link(name))
            .collect();
        let rest = targets
            .iter()
            .zip(&names)
            .filter(|(_, name)| !self.settings.data_services.is_data_oriented(name))
            .map(|(dir, _)| dir.clone())
            .collect();
        (data, rest)
    }

    fn start_batch(&self, dirs: &[PathBuf]) -> Result<bool, LifecycleError> {
        for dir in dirs {
            clear_stopping(dir)?;
            self.ensure_ready(dir)?;
        }
        let services = names_of(dirs);
        self.emit(Event::Starting {
            services: services.clone(),
        });
        let output = self.run_control(Verb::Start, dirs, &services)?;
        if !output.success {
            self.emit(Event::ControlFailed {
                verb: Verb::Start.as_str(),
                services,
                stderr: failure_detail(&output),
            });
        }
        Ok(output.success)
    }

    fn stop_batch(&self, dirs: &[PathBuf]) -> Result<bool, LifecycleError> {
        for dir in dirs {
            mark_stopping(dir)?;
        }
        let services = names_of(dirs);
        self.emit(Event::Stopping {
            services: services.clone(),
        });
        let max = self.settings.stop_attempts.max(1);
        let mut last = ControlOutput::default();
        for attempt in 1..=max {
            last = self.run_control(Verb::ForceStop, dirs, &services)?;
            if last.success {
                return Ok(true);
            }
            if attempt < max {
                warn!(?services, attempt, "stop did not converge");
                self.emit(Event::Retrying {
                    services: services.clone(),
                    attempt,
                    max,
                });
                std::thread::sleep(self.settings.retry_delay);
            }
        }
        self.emit(Event::ControlFailed {
            verb: Verb::ForceStop.as_str(),
            services,
            stderr: failure_detail(&last),
        });
        Ok(false)
    }

    fn run_control(
        &self,
        verb: Verb,
        dirs: &[PathBuf],
        services: &[String],
    ) -> Result<ControlOutput, LifecycleError> {
        self.control
            .control(verb, self.settings.control_timeout, dirs)
            .map_err(|source| LifecycleError::Control {
                verb: verb.as_str(),
                services: services.to_vec(),
                source,
            })
    }

    fn emit_ready_messages(&self, targets: &[PathBuf]) {
        for dir in targets {
            let name = layout::service_name(dir);
            if let Some(message) = self.ready_messages.get(&name) {
                self.emit(Event::Ready {
                    service: name,
                    message: message.clone(),
                });
            }
        }
    }

    fn emit(&self, event: Event) {
        let _ = self.events.blocking_send(event);
    }
}

fn names_of(dirs: &[PathBuf]) -> Vec<String> {
    dirs.iter().map(|dir| layout::service_name(dir)).collect()
}

fn failure_detail(output: &ControlOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        output.stdout.trim().to_string()
    } else {
        stderr.to_string()
    }
}

fn mark_stopping(dir: &Path) -> Result<(), LifecycleError> {
    let path = layout::stopping_sentinel(dir);
    std::fs::write(&path, "").map_err(|source| LifecycleError::Sentinel { path, source })
}

fn clear_stopping(dir: &Path) -> Result<(), LifecycleError> {
    let path = layout::stopping_sentinel(dir);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LifecycleError::Sentinel { path, source }),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;
    use crate::status::{StatusRecord, PHASE_RUN};

    #[derive(Default)]
    struct FakeControl {
        calls: RefCell<Vec<(Verb, Vec<String>)>>,
        // Scripted results; success once exhausted.
        results: RefCell<VecDeque<bool>>,
    }

    impl FakeControl {
        fn failing(times: usize) -> Self {
            let control = Self::default();
            control.results.borrow_mut().extend(std::iter::repeat(false).take(times));
            control
        }

        fn calls(&self) -> Vec<(Verb, Vec<String>)> {
            self.calls.borrow().clone()
        }
    }

    impl ControlChannel for &FakeControl {
        fn control(
            &self,
            verb: Verb,
            _timeout: Duration,
            services: &[PathBuf],
        ) -> io::Result<ControlOutput> {
            self.calls.borrow_mut().push((verb, names_of(services)));
            let success = self.results.borrow_mut().pop_front().unwrap_or(true);
            Ok(ControlOutput {
                success,
                stdout: String::new(),
                stderr: if success { String::new() } else { "timeout: down".into() },
            })
        }
    }

    #[derive(Default)]
    struct FakeDaemon {
        bootstraps: Cell<u32>,
        unloads: Cell<u32>,
    }

    impl Daemon for &FakeDaemon {
        fn bootstrap(&self) -> Result<Option<u32>, LifecycleError> {
            self.bootstraps.set(self.bootstraps.get() + 1);
            Ok(None)
        }

        fn unload(&self) -> Result<usize, LifecycleError> {
            self.unloads.set(self.unloads.get() + 1);
            Ok(1)
        }
    }

    struct Harness {
        _tmp: tempfile::TempDir,
        layout: Layout,
        control: FakeControl,
        daemon: FakeDaemon,
    }

    impl Harness {
        // Services that runsv has already picked up.
        fn new(services: &[&str], control: FakeControl) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let layout = Layout::new(tmp.path());
            for service in services {
                let dir = layout.service_link(service);
                std::fs::create_dir_all(dir.join("supervise")).unwrap();
                std::fs::write(layout::control_fifo(&dir), "").unwrap();
            }
            Self {
                _tmp: tmp,
                layout,
                control,
                daemon: FakeDaemon::default(),
            }
        }

        fn supervisor(&self) -> (Supervisor<&FakeControl, &FakeDaemon>, mpsc::Receiver<Event>) {
            let (tx, rx) = mpsc::channel(64);
            let settings = SupervisorSettings {
                retry_delay: Duration::ZERO,
                ready_attempts: 3,
                ready_interval: Duration::from_millis(1),
                ..SupervisorSettings::default()
            };
            let supervisor = Supervisor::new(
                self.layout.clone(),
                ShortcutTable::default(),
                settings,
                &self.control,
                &self.daemon,
                tx,
            );
            (supervisor, rx)
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn start_all_brings_up_data_services_first_in_reverse_order() {
        let harness = Harness::new(
            &["postgresql", "rails-web", "redis", "gitlab-workhorse"],
            FakeControl::default(),
        );
        let (supervisor, _rx) = harness.supervisor();

        assert!(supervisor.start(&[]).unwrap());

        assert_eq!(harness.daemon.bootstraps.get(), 1);
        assert_eq!(
            harness.control.calls(),
            vec![
                (Verb::Start, names(&["postgresql"])),
                (Verb::Start, names(&["redis"])),
                (Verb::Start, names(&["gitlab-workhorse", "rails-web"])),
            ]
        );
    }

    #[test]
    fn start_named_services_as_one_batch() {
        let harness = Harness::new(&["postgresql", "rails-web", "redis"], FakeControl::default());
        let (supervisor, _rx) = harness.supervisor();

        assert!(supervisor.start(&names(&["rails-web", "db"])).unwrap());
        assert_eq!(
            harness.control.calls(),
            vec![(Verb::Start, names(&["postgresql", "rails-web", "redis"]))]
        );
    }

    #[test]
    fn start_clears_stopping_sentinel() {
        let harness = Harness::new(&["redis"], FakeControl::default());
        let sentinel = layout::stopping_sentinel(&harness.layout.service_link("redis"));
        std::fs::write(&sentinel, "").unwrap();
        let (supervisor, _rx) = harness.supervisor();

        supervisor.start(&names(&["redis"])).unwrap();
        assert!(!sentinel.exists());
    }

    #[test]
    fn start_emits_ready_messages() {
        let harness = Harness::new(&["rails-web"], FakeControl::default());
        let (supervisor, mut rx) = harness.supervisor();
        let mut rails = ServiceDescriptor::new("rails-web", "bin/rails server");
        rails.ready_message = Some("available at http://localhost:3000".into());
        let supervisor = supervisor.with_ready_messages(&[rails]);

        supervisor.start(&names(&["rails-web"])).unwrap();
        let events = drain(&mut rx);
        assert_eq!(
            events.last(),
            Some(&Event::Ready {
                service: "rails-web".into(),
                message: "available at http://localhost:3000".into(),
            })
        );
    }

    #[test]
    fn stop_all_stops_dependents_before_data_services() {
        let harness = Harness::new(&["postgresql", "rails-web"], FakeControl::default());
        let (supervisor, mut rx) = harness.supervisor();

        assert!(supervisor.stop(&[]).unwrap());

        assert_eq!(
            harness.control.calls(),
            vec![
                (Verb::ForceStop, names(&["rails-web"])),
                (Verb::ForceStop, names(&["postgresql"])),
            ]
        );
        assert_eq!(harness.daemon.unloads.get(), 1);
        assert_eq!(drain(&mut rx).last(), Some(&Event::DaemonUnloaded));
    }

    #[test]
    fn stop_data_services_one_at_a_time_in_declared_order() {
        let harness = Harness::new(&["postgresql", "redis", "gitaly"], FakeControl::default());
        let (supervisor, _rx) = harness.supervisor();

        supervisor.stop(&[]).unwrap();
        assert_eq!(
            harness.control.calls(),
            vec![
                (Verb::ForceStop, names(&["gitaly"])),
                (Verb::ForceStop, names(&["redis"])),
                (Verb::ForceStop, names(&["postgresql"])),
            ]
        );
    }

    #[test]
    fn stop_writes_stopping_sentinels() {
        let harness = Harness::new(&["redis"], FakeControl::default());
        let (supervisor, _rx) = harness.supervisor();

        supervisor.stop(&names(&["redis"])).unwrap();
        assert!(layout::stopping_sentinel(&harness.layout.service_link("redis")).exists());
        assert_eq!(harness.daemon.unloads.get(), 0);
    }

    #[test]
    fn stop_retries_until_success() {
        let harness = Harness::new(&["x"], FakeControl::failing(2));
        let (supervisor, mut rx) = harness.supervisor();

        assert!(supervisor.stop(&names(&["x"])).unwrap());

        assert_eq!(harness.control.calls().len(), 3);
        let retries = drain(&mut rx)
            .into_iter()
            .filter(|event| matches!(event, Event::Retrying { .. }))
            .count();
        assert_eq!(retries, 2);
    }

    #[test]
    fn stop_reports_failure_after_exhausting_retries() {
        let harness = Harness::new(&["postgresql", "rails-web"], FakeControl::failing(3));
        let (supervisor, mut rx) = harness.supervisor();

        assert!(!supervisor.stop(&[]).unwrap());

        let events = drain(&mut rx);
        assert!(events.contains(&Event::ControlFailed {
            verb: "force-stop",
            services: names(&["rails-web"]),
            stderr: "timeout: down".into(),
        }));
        // Data services are still stopped, but the daemon stays loaded.
        assert_eq!(
            harness.control.calls().last(),
            Some(&(Verb::ForceStop, names(&["postgresql"])))
        );
        assert_eq!(harness.daemon.unloads.get(), 0);
    }

    #[test]
    fn restart_stops_then_starts() {
        let harness = Harness::new(&["redis"], FakeControl::default());
        let (supervisor, _rx) = harness.supervisor();

        assert!(supervisor.restart(&names(&["redis"])).unwrap());
        assert_eq!(
            harness.control.calls(),
            vec![
                (Verb::ForceStop, names(&["redis"])),
                (Verb::Start, names(&["redis"])),
            ]
        );
    }

    #[test]
    fn unknown_service_is_reported_before_any_command() {
        let harness = Harness::new(&["redis"], FakeControl::default());
        let (supervisor, _rx) = harness.supervisor();

        let err = supervisor.stop(&names(&["ghost"])).unwrap_err();
        assert!(matches!(err, LifecycleError::UnknownService { ref name } if name == "ghost"));
        assert!(harness.control.calls().is_empty());
    }

    #[test]
    fn ensure_ready_gives_up_with_offending_path() {
        let harness = Harness::new(&[], FakeControl::default());
        let dir = harness.layout.service_link("redis");
        std::fs::create_dir_all(&dir).unwrap();
        let (supervisor, _rx) = harness.supervisor();

        let err = supervisor.ensure_ready(&dir).unwrap_err();
        match err {
            LifecycleError::NotReady { path, attempts } => {
                assert_eq!(path, layout::control_fifo(&dir));
                assert_eq!(attempts, 3);
            }
            other => panic!("expected NotReady, got: {other:?}"),
        }
    }

    #[test]
    fn status_is_sorted_by_name() {
        let harness = Harness::new(&["redis", "gitaly"], FakeControl::default());
        let started = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        for (name, pid) in [("redis", 11), ("gitaly", 22)] {
            let record = StatusRecord::at(started, pid, true, PHASE_RUN);
            std::fs::write(
                layout::status_file(&harness.layout.service_link(name)),
                record.encode(),
            )
            .unwrap();
        }
        let (supervisor, _rx) = harness.supervisor();

        let statuses = supervisor.status(&[]).unwrap();
        let summary: Vec<(&str, u32, bool)> = statuses
            .iter()
            .map(|status| (status.name.as_str(), status.pid, status.up))
            .collect();
        assert_eq!(summary, vec![("gitaly", 22, true), ("redis", 11, true)]);
        assert!(statuses[0].elapsed(SystemTime::now()) > Duration::ZERO);
    }

    #[test]
    fn status_lists_unsupervised_service_as_down() {
        let harness = Harness::new(&["redis", "rails-web"], FakeControl::default());
        let started = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let record = StatusRecord::at(started, 11, true, PHASE_RUN);
        std::fs::write(
            layout::status_file(&harness.layout.service_link("redis")),
            record.encode(),
        )
        .unwrap();
        let (supervisor, _rx) = harness.supervisor();

        let statuses = supervisor.status(&[]).unwrap();
        let summary: Vec<(&str, &str)> = statuses
            .iter()
            .map(|status| (status.name.as_str(), status.label()))
            .collect();
        assert_eq!(summary, vec![("rails-web", "down"), ("redis", "up")]);
        assert_eq!(statuses[0].pid, 0);
    }

    #[test]
    fn status_of_missing_service_is_not_found() {
        let harness = Harness::new(&[], FakeControl::default());
        let (supervisor, _rx) = harness.supervisor();

        let err = supervisor.status(&names(&["ghost"])).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Status(StatusError::ServiceNotFound { ref name }) if name == "ghost"
        ));
    }

    #[test]
    fn log_files_point_at_current() {
        let harness = Harness::new(&[], FakeControl::default());
        std::fs::create_dir_all(harness.layout.service_log_dir("redis")).unwrap();
        let (supervisor, _rx) = harness.supervisor();

        assert_eq!(
            supervisor.log_files(&[]).unwrap(),
            vec![harness.layout.service_log_dir("redis").join("current")]
        );
        assert!(supervisor.log_files(&names(&["rails"])).unwrap().is_empty());
    }
}
