//! In-memory fakes for the driver and transport seams
//!
//! Available to other crates' tests through the `test-support` feature,
//! mirroring how the queue tests use [`crate::backend::MemoryBackend`].

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use trinity_core::types::{ContainerState, CredentialFiles, TaskOutcome};

use crate::docker::{
    ContainerDriver, ContainerSpec, ContainerStats, ContainerSummary, DriverError, ExecOutput,
};
use crate::transport::{AgentTransport, TransportError};

#[derive(Clone)]
struct FakeContainer {
    spec: ContainerSpec,
    state: ContainerState,
}

/// Scripted, in-memory container engine
#[derive(Default)]
pub struct FakeDriver {
    containers: Mutex<HashMap<String, FakeContainer>>,
    removed_volumes: Mutex<Vec<String>>,
    exec_log: Mutex<Vec<Vec<String>>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// All argv vectors passed to `exec`, in call order
    pub fn exec_calls(&self) -> Vec<Vec<String>> {
        self.exec_log.lock().clone()
    }

    pub fn removed_volumes(&self) -> Vec<String> {
        self.removed_volumes.lock().clone()
    }

    pub fn has_container(&self, name: &str) -> bool {
        self.containers.lock().contains_key(name)
    }

    fn summary(container: &FakeContainer) -> ContainerSummary {
        ContainerSummary {
            name: container.spec.name.clone(),
            state: container.state,
            container_id: Some(format!("fake-{}", container.spec.name)),
            labels: container.spec.labels.clone(),
        }
    }
}

#[async_trait]
impl ContainerDriver for FakeDriver {
    async fn create(&self, spec: ContainerSpec) -> Result<(), DriverError> {
        let mut containers = self.containers.lock();
        if containers.contains_key(&spec.name) {
            return Err(DriverError::NameTaken(spec.name));
        }
        containers.insert(
            spec.name.clone(),
            FakeContainer {
                spec,
                state: ContainerState::Stopped,
            },
        );
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), DriverError> {
        let mut containers = self.containers.lock();
        let container = containers
            .get_mut(name)
            .ok_or_else(|| DriverError::NotFound(name.to_string()))?;
        container.state = ContainerState::Running;
        Ok(())
    }

    async fn stop(&self, name: &str, _timeout_secs: i64) -> Result<(), DriverError> {
        let mut containers = self.containers.lock();
        let container = containers
            .get_mut(name)
            .ok_or_else(|| DriverError::NotFound(name.to_string()))?;
        container.state = ContainerState::Stopped;
        Ok(())
    }

    async fn remove(&self, name: &str, _force: bool) -> Result<(), DriverError> {
        self.containers
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| DriverError::NotFound(name.to_string()))
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>, DriverError> {
        Ok(self.containers.lock().get(name).map(|c| c.state))
    }

    async fn list(&self, label_filters: &[String]) -> Result<Vec<ContainerSummary>, DriverError> {
        let wanted: Vec<(&str, &str)> = label_filters
            .iter()
            .filter_map(|f| f.split_once('='))
            .collect();
        Ok(self
            .containers
            .lock()
            .values()
            .filter(|c| {
                wanted
                    .iter()
                    .all(|(k, v)| c.spec.labels.get(*k).map(String::as_str) == Some(*v))
            })
            .map(Self::summary)
            .collect())
    }

    async fn exec(
        &self,
        name: &str,
        argv: &[String],
        _user: Option<&str>,
    ) -> Result<ExecOutput, DriverError> {
        if !self.containers.lock().contains_key(name) {
            return Err(DriverError::NotFound(name.to_string()));
        }
        self.exec_log.lock().push(argv.to_vec());
        Ok(ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn stats_once(&self, name: &str) -> Result<ContainerStats, DriverError> {
        if !self.containers.lock().contains_key(name) {
            return Err(DriverError::NotFound(name.to_string()));
        }
        Ok(ContainerStats::default())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), DriverError> {
        self.removed_volumes.lock().push(name.to_string());
        Ok(())
    }
}

/// Scripted, in-memory agent server
#[derive(Default)]
pub struct FakeTransport {
    files: Mutex<HashMap<(String, String), String>>,
    healthy: Mutex<bool>,
    task_responses: Mutex<VecDeque<Result<TaskOutcome, String>>>,
    task_calls: Mutex<Vec<(String, String)>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            healthy: Mutex::new(true),
            ..Default::default()
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        *self.healthy.lock() = healthy;
    }

    pub fn seed_file(&self, agent: &str, path: &str, content: &str) {
        self.files
            .lock()
            .insert((agent.to_string(), path.to_string()), content.to_string());
    }

    pub fn file(&self, agent: &str, path: &str) -> Option<String> {
        self.files
            .lock()
            .get(&(agent.to_string(), path.to_string()))
            .cloned()
    }

    /// Queue the next `task` result; unqueued calls echo the message
    pub fn push_task_response(&self, response: Result<TaskOutcome, String>) {
        self.task_responses.lock().push_back(response);
    }

    /// (agent, message) pairs seen by `task`, in call order
    pub fn task_calls(&self) -> Vec<(String, String)> {
        self.task_calls.lock().clone()
    }
}

#[async_trait]
impl AgentTransport for FakeTransport {
    async fn health(&self, _agent: &str) -> Result<bool, TransportError> {
        Ok(*self.healthy.lock())
    }

    async fn task(
        &self,
        agent: &str,
        message: &str,
        _execution_id: Option<&str>,
    ) -> Result<TaskOutcome, TransportError> {
        self.task_calls
            .lock()
            .push((agent.to_string(), message.to_string()));
        match self.task_responses.lock().pop_front() {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(detail)) => Err(TransportError::RequestError { status: 500, detail }),
            None => Ok(TaskOutcome {
                response: format!("echo: {message}"),
                ..Default::default()
            }),
        }
    }

    async fn inject_files(
        &self,
        agent: &str,
        files: &CredentialFiles,
    ) -> Result<Vec<String>, TransportError> {
        let mut store = self.files.lock();
        let mut written = Vec::new();
        for (path, content) in files {
            store.insert((agent.to_string(), path.clone()), content.clone());
            written.push(path.clone());
        }
        Ok(written)
    }

    async fn read_files(
        &self,
        agent: &str,
        paths: &[String],
    ) -> Result<CredentialFiles, TransportError> {
        let store = self.files.lock();
        Ok(paths
            .iter()
            .filter_map(|path| {
                store
                    .get(&(agent.to_string(), path.clone()))
                    .map(|content| (path.clone(), content.clone()))
            })
            .collect())
    }

    async fn relay_get(&self, _agent: &str, path: &str) -> Result<serde_json::Value, TransportError> {
        Ok(serde_json::json!({"relayed": path}))
    }

    async fn relay_post(
        &self,
        _agent: &str,
        path: &str,
        _body: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        Ok(serde_json::json!({"relayed": path}))
    }
}
