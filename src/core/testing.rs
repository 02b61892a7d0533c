//! In-memory runtime for controller tests

use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::core::config::{ControllerConfig, HealthSettings, Timeouts};
use crate::core::runtime::{DriverError, RuntimeDriver, Unit};
use crate::utils::UnitState;

/// How a fake operation behaves when called
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    /// Reports success without changing any state
    NoEffect,
    Fail,
    Hang,
}

#[derive(Debug, Clone, Default)]
pub struct FakeVolume {
    pub labels: HashMap<String, String>,
    pub files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug)]
pub struct Knobs {
    pub stop_stack: Behavior,
    pub start_stack: Behavior,
    pub kill: Behavior,
    pub remove: Behavior,
    pub restart_daemon: Behavior,
    pub host_kill: Behavior,
    /// Number of upcoming `list_units` calls that fail
    pub list_failures: usize,
    pub privileged: bool,
    pub fail_archive_for: Option<String>,
    pub fail_extract_for: Option<String>,
    /// Clones into a target whose name contains this text fail without copying
    pub fail_clone_into: Option<String>,
    pub fail_remove_volume_for: Option<String>,
    pub fail_list_volumes: bool,
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            stop_stack: Behavior::Succeed,
            start_stack: Behavior::Succeed,
            kill: Behavior::Succeed,
            remove: Behavior::Succeed,
            restart_daemon: Behavior::Succeed,
            host_kill: Behavior::Succeed,
            list_failures: 0,
            privileged: false,
            fail_archive_for: None,
            fail_extract_for: None,
            fail_clone_into: None,
            fail_remove_volume_for: None,
            fail_list_volumes: false,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    units: Vec<Unit>,
    template: Vec<Unit>,
    volumes: BTreeMap<String, FakeVolume>,
    calls: Vec<String>,
    first_kill_at: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
    pub knobs: Mutex<Knobs>,
}

impl FakeRuntime {
    /// A stack whose units all run; `start_stack` brings these back
    pub fn running(names: &[&str]) -> Self {
        let units: Vec<Unit> = names
            .iter()
            .map(|name| Unit {
                id: format!("{}-id", name),
                name: name.to_string(),
                state: UnitState::Running,
            })
            .collect();
        let fake = Self::default();
        {
            let mut state = fake.state();
            state.template = units.clone();
            state.units = units;
        }
        fake
    }

    /// A stack with units defined but none present
    pub fn stopped(names: &[&str]) -> Self {
        let fake = Self::running(names);
        fake.state().units.clear();
        fake
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn knobs(&self) -> MutexGuard<'_, Knobs> {
        self.knobs.lock().unwrap()
    }

    pub fn add_unit(&self, name: &str, state: UnitState) {
        self.state().units.push(Unit {
            id: format!("{}-id", name),
            name: name.to_string(),
            state,
        });
    }

    pub fn add_volume(&self, name: &str, files: &[(&str, &[u8])]) {
        let volume = FakeVolume {
            labels: HashMap::new(),
            files: files.iter().map(|(p, d)| (p.to_string(), d.to_vec())).collect(),
        };
        self.state().volumes.insert(name.to_string(), volume);
    }

    pub fn volume(&self, name: &str) -> Option<FakeVolume> {
        self.state().volumes.get(name).cloned()
    }

    pub fn volume_names(&self) -> Vec<String> {
        self.state().volumes.keys().cloned().collect()
    }

    pub fn running_units(&self) -> Vec<Unit> {
        self.state()
            .units
            .iter()
            .filter(|u| u.state.is_running())
            .cloned()
            .collect()
    }

    pub fn units(&self) -> Vec<Unit> {
        self.state().units.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Number of journal entries starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.state().calls.iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn first_kill_at(&self) -> Option<Instant> {
        self.state().first_kill_at
    }

    fn record(&self, call: String) {
        self.state().calls.push(call);
    }

    /// Journal the call and apply its behavior; `Ok(true)` means change state
    async fn gate(&self, call: String, behavior: Behavior) -> Result<bool, DriverError> {
        let failed = format!("{} failed", call);
        self.record(call);
        match behavior {
            Behavior::Succeed => Ok(true),
            Behavior::NoEffect => Ok(false),
            Behavior::Fail => Err(DriverError::Other(failed)),
            Behavior::Hang => std::future::pending().await,
        }
    }

    fn set_state(&self, id: Option<&str>, to: UnitState) {
        for unit in self.state().units.iter_mut() {
            if id.map_or(true, |id| unit.id == id) {
                unit.state = to;
            }
        }
    }
}

#[async_trait]
impl RuntimeDriver for FakeRuntime {
    async fn stop_stack(&self, project: &str) -> Result<(), DriverError> {
        let behavior = self.knobs().stop_stack;
        if self.gate(format!("stop_stack {}", project), behavior).await? {
            self.state().units.clear();
        }
        Ok(())
    }

    async fn start_stack(&self, project: &str) -> Result<(), DriverError> {
        let behavior = self.knobs().start_stack;
        if self.gate(format!("start_stack {}", project), behavior).await? {
            let mut state = self.state();
            state.units = state.template.clone();
        }
        Ok(())
    }

    async fn list_units(&self, project: &str, include_stopped: bool) -> Result<Vec<Unit>, DriverError> {
        self.record(format!("list_units {} {}", project, include_stopped));
        {
            let mut knobs = self.knobs();
            if knobs.list_failures > 0 {
                knobs.list_failures -= 1;
                return Err(DriverError::Other("daemon not responding".to_string()));
            }
        }
        Ok(self
            .state()
            .units
            .iter()
            .filter(|u| include_stopped || u.state.is_running())
            .cloned()
            .collect())
    }

    async fn kill_unit(&self, id: &str) -> Result<(), DriverError> {
        {
            let mut state = self.state();
            if state.first_kill_at.is_none() {
                state.first_kill_at = Some(Instant::now());
            }
        }
        let behavior = self.knobs().kill;
        if self.gate(format!("kill_unit {}", id), behavior).await? {
            self.set_state(Some(id), UnitState::Exited);
        }
        Ok(())
    }

    async fn remove_unit(&self, id: &str) -> Result<(), DriverError> {
        let behavior = self.knobs().remove;
        if self.gate(format!("remove_unit {}", id), behavior).await? {
            self.state().units.retain(|u| u.id != id);
        }
        Ok(())
    }

    async fn restart_daemon(&self) -> Result<(), DriverError> {
        let behavior = self.knobs().restart_daemon;
        if self.gate("restart_daemon".to_string(), behavior).await? {
            self.set_state(None, UnitState::Exited);
        }
        Ok(())
    }

    async fn kill_unit_processes(&self, units: &[Unit]) -> Result<usize, DriverError> {
        let behavior = self.knobs().host_kill;
        if self.gate(format!("kill_unit_processes {}", units.len()), behavior).await? {
            self.set_state(None, UnitState::Dead);
        }
        Ok(units.len())
    }

    async fn prune_networks(&self, project: &str) -> Result<Vec<String>, DriverError> {
        self.record(format!("prune_networks {}", project));
        Ok(vec![format!("{}_default", project)])
    }

    fn is_privileged(&self) -> bool {
        self.knobs().privileged
    }

    async fn list_volumes(&self, prefix: &str) -> Result<Vec<String>, DriverError> {
        self.record(format!("list_volumes {}", prefix));
        if self.knobs().fail_list_volumes {
            return Err(DriverError::Other("daemon not responding".to_string()));
        }
        Ok(self
            .state()
            .volumes
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, DriverError> {
        Ok(self.state().volumes.contains_key(name))
    }

    async fn create_volume(&self, name: &str, labels: HashMap<String, String>) -> Result<(), DriverError> {
        self.record(format!("create_volume {}", name));
        self.state()
            .volumes
            .entry(name.to_string())
            .or_insert_with(|| FakeVolume {
                labels,
                files: BTreeMap::new(),
            });
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), DriverError> {
        self.record(format!("remove_volume {}", name));
        if self.knobs().fail_remove_volume_for.as_deref() == Some(name) {
            return Err(DriverError::Other(format!("volume {} is in use", name)));
        }
        self.state().volumes.remove(name);
        Ok(())
    }

    async fn archive_volume(&self, volume: &str, dir: &Path, file_name: &str) -> Result<(), DriverError> {
        self.record(format!("archive_volume {}", volume));
        if self.knobs().fail_archive_for.as_deref() == Some(volume) {
            return Err(DriverError::UtilityFailed {
                operation: "archive".to_string(),
                code: 2,
                detail: "tar: read error".to_string(),
            });
        }

        let files = self
            .volume(volume)
            .ok_or_else(|| DriverError::Other(format!("no such volume: {}", volume)))?
            .files;
        let mut builder = tar::Builder::new(File::create(dir.join(file_name))?);
        for (path, data) in &files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, data.as_slice())?;
        }
        builder.into_inner()?;
        Ok(())
    }

    async fn extract_into_volume(&self, archive: &Path, volume: &str) -> Result<(), DriverError> {
        self.record(format!("extract_into_volume {}", volume));
        if self.knobs().fail_extract_for.as_deref() == Some(volume) {
            return Err(DriverError::UtilityFailed {
                operation: "extract".to_string(),
                code: 2,
                detail: "tar: unexpected EOF".to_string(),
            });
        }
        if !self.state().volumes.contains_key(volume) {
            return Err(DriverError::Other(format!("no such volume: {}", volume)));
        }

        let mut magic = [0u8; 2];
        let gz = File::open(archive)?.read(&mut magic)? == 2 && magic == [0x1f, 0x8b];
        let file = BufReader::new(File::open(archive)?);
        let reader: Box<dyn Read> = if gz { Box::new(GzDecoder::new(file)) } else { Box::new(file) };

        let mut files = BTreeMap::new();
        let mut tar = tar::Archive::new(reader);
        for entry in tar.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path()?.to_string_lossy().to_string();
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            files.insert(path, data);
        }

        if let Some(target) = self.state().volumes.get_mut(volume) {
            target.files.extend(files);
        }
        Ok(())
    }

    async fn clone_volume(&self, source: &str, target: &str) -> Result<(), DriverError> {
        self.record(format!("clone_volume {} {}", source, target));
        let fails = self
            .knobs()
            .fail_clone_into
            .as_deref()
            .map_or(false, |marker| target.contains(marker));
        if fails {
            return Err(DriverError::UtilityFailed {
                operation: "clone".to_string(),
                code: 1,
                detail: "cp: write error: No space left on device".to_string(),
            });
        }
        let mut state = self.state();
        let files = state
            .volumes
            .get(source)
            .map(|v| v.files.clone())
            .ok_or_else(|| DriverError::Other(format!("no such volume: {}", source)))?;
        let target = state
            .volumes
            .get_mut(target)
            .ok_or_else(|| DriverError::Other(format!("no such volume: {}", target)))?;
        target.files = files;
        Ok(())
    }
}

/// Configuration for tests: production deadlines, fast polling, single health check
pub(crate) fn test_config(base: &Path) -> ControllerConfig {
    ControllerConfig {
        project: "rag".to_string(),
        base_path: base.to_path_buf(),
        compose_dir: base.to_path_buf(),
        backup_retention: None,
        health: HealthSettings {
            request_timeout: Duration::from_secs(1),
            wait: Duration::ZERO,
            interval: Duration::from_millis(10),
            ..Default::default()
        },
        timeouts: Timeouts {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        },
        utility_image: "alpine:3.20".to_string(),
        daemon_service: "docker".to_string(),
        remote: None,
    }
}
