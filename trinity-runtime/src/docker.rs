//! Container driver
//!
//! Sole point of contact with the host container engine. The engine's
//! labels carry the agent index: listing agents never consults the state
//! store, and labels must round-trip across control-plane restarts.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{
    ContainerCreateBody, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, InspectContainerOptions, ListContainersOptionsBuilder,
    RemoveContainerOptionsBuilder, RemoveVolumeOptionsBuilder, StartContainerOptions,
    StatsOptionsBuilder, StopContainerOptionsBuilder,
};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use thiserror::Error;
use trinity_core::types::{AgentStatus, ContainerState, Resources};

/// Label namespace on every agent container
pub mod labels {
    pub const PLATFORM: &str = "trinity.platform";
    pub const AGENT_NAME: &str = "trinity.agent-name";
    pub const AGENT_TYPE: &str = "trinity.agent-type";
    pub const SSH_PORT: &str = "trinity.ssh-port";
    pub const CPU: &str = "trinity.cpu";
    pub const MEMORY: &str = "trinity.memory";
    pub const CREATED: &str = "trinity.created";
    pub const TEMPLATE: &str = "trinity.template";
    pub const IS_SYSTEM: &str = "trinity.is-system";

    /// Value of [`PLATFORM`] on agent containers
    pub const PLATFORM_AGENT: &str = "agent";
}

/// Errors from the container engine
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("container name already taken: {0}")]
    NameTaken(String),

    #[error("image not found: {0}")]
    ImageMissing(String),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container engine unavailable: {0}")]
    EngineDown(String),

    #[error("container engine error: {0}")]
    Engine(String),
}

impl From<DriverError> for trinity_core::Error {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::NameTaken(name) => Self::Conflict(format!("container '{name}' exists")),
            DriverError::NotFound(name) => Self::NotFound(format!("container '{name}'")),
            other => Self::Internal(other.to_string()),
        }
    }
}

fn map_bollard(err: bollard::errors::Error, subject: &str) -> DriverError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => DriverError::NotFound(subject.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409, ..
        } => DriverError::NameTaken(subject.to_string()),
        bollard::errors::Error::IOError { .. } => DriverError::EngineDown(err.to_string()),
        other => DriverError::Engine(other.to_string()),
    }
}

/// A host path or named volume mounted into a container
#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Everything needed to create one agent container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    pub network: Option<String>,
    /// (container port, host port) pairs, TCP
    pub ports: Vec<(u16, u16)>,
    pub volumes: Vec<VolumeMount>,
    pub resources: Resources,
    /// Capabilities granted after the blanket drop; empty for ordinary
    /// agents, a whitelist for the system agent
    pub cap_add: Vec<String>,
}

impl ContainerSpec {
    /// Memory limit in bytes parsed from forms like `4g`, `512m`
    fn memory_bytes(&self) -> Option<i64> {
        let raw = self.resources.memory.trim().to_lowercase();
        let (digits, multiplier) = match raw.chars().last() {
            Some('g') => (&raw[..raw.len() - 1], 1_073_741_824_i64),
            Some('m') => (&raw[..raw.len() - 1], 1_048_576),
            Some('k') => (&raw[..raw.len() - 1], 1024),
            _ => (raw.as_str(), 1),
        };
        digits.parse::<i64>().ok().map(|n| n * multiplier)
    }

    fn nano_cpus(&self) -> Option<i64> {
        self.resources
            .cpu
            .trim()
            .parse::<f64>()
            .ok()
            .map(|cpus| (cpus * 1e9) as i64)
    }
}

/// Result of one exec inside a container
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// Single-shot resource usage of a container
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

/// One container as reported by a label-filtered listing
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub name: String,
    pub state: ContainerState,
    pub container_id: Option<String>,
    pub labels: HashMap<String, String>,
}

/// Abstraction over the container engine
///
/// The production implementation is [`DockerDriver`]; tests inject the
/// in-memory fake from [`crate::test_support`].
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    async fn create(&self, spec: ContainerSpec) -> Result<(), DriverError>;
    async fn start(&self, name: &str) -> Result<(), DriverError>;
    async fn stop(&self, name: &str, timeout_secs: i64) -> Result<(), DriverError>;
    async fn remove(&self, name: &str, force: bool) -> Result<(), DriverError>;
    /// Normalized state; `None` when the container does not exist
    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>, DriverError>;
    async fn list(&self, label_filters: &[String]) -> Result<Vec<ContainerSummary>, DriverError>;
    async fn exec(
        &self,
        name: &str,
        argv: &[String],
        user: Option<&str>,
    ) -> Result<ExecOutput, DriverError>;
    async fn stats_once(&self, name: &str) -> Result<ContainerStats, DriverError>;
    async fn remove_volume(&self, name: &str) -> Result<(), DriverError>;
}

/// Bollard-backed driver talking to the platform-native socket
pub struct DockerDriver {
    docker: Docker,
}

impl DockerDriver {
    /// Connect using the platform defaults (socket or named pipe)
    pub fn connect() -> Result<Self, DriverError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DriverError::EngineDown(e.to_string()))?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn create(&self, spec: ContainerSpec) -> Result<(), DriverError> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let binds: Vec<String> = spec
            .volumes
            .iter()
            .map(|m| {
                let mode = if m.read_only { "ro" } else { "rw" };
                format!("{}:{}:{mode}", m.source, m.target)
            })
            .collect();

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for (container_port, host_port) in &spec.ports {
            let key = format!("{container_port}/tcp");
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(host_port.to_string()),
                }]),
            );
        }

        // Security defaults: drop everything, default AppArmor profile,
        // hardened /tmp, explicit resource limits, supervised restart.
        let host_config = HostConfig {
            binds: Some(binds),
            port_bindings: Some(port_bindings),
            network_mode: spec.network.clone(),
            memory: spec.memory_bytes(),
            nano_cpus: spec.nano_cpus(),
            cap_drop: Some(vec!["ALL".to_string()]),
            cap_add: (!spec.cap_add.is_empty()).then(|| spec.cap_add.clone()),
            security_opt: Some(vec!["apparmor:docker-default".to_string()]),
            tmpfs: Some(HashMap::from([(
                "/tmp".to_string(),
                "noexec,nosuid,size=100m".to_string(),
            )])),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptionsBuilder::default().name(&spec.name).build()),
                body,
            )
            .await
            .map_err(|e| match &e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => DriverError::ImageMissing(spec.image.clone()),
                _ => map_bollard(e, &spec.name),
            })?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), DriverError> {
        match self
            .docker
            .start_container(name, None::<StartContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            // 304: already started; start is idempotent
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_bollard(e, name)),
        }
    }

    async fn stop(&self, name: &str, timeout_secs: i64) -> Result<(), DriverError> {
        match self
            .docker
            .stop_container(
                name,
                Some(StopContainerOptionsBuilder::default().t(timeout_secs as i32).build()),
            )
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_bollard(e, name)),
        }
    }

    async fn remove(&self, name: &str, force: bool) -> Result<(), DriverError> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptionsBuilder::default().force(force).build()),
            )
            .await
            .map_err(|e| map_bollard(e, name))
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>, DriverError> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => {
                let raw = details
                    .state
                    .and_then(|s| s.status)
                    .map(|s| s.to_string())
                    .unwrap_or_default();
                Ok(Some(ContainerState::from_engine(&raw)))
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(map_bollard(e, name)),
        }
    }

    async fn list(&self, label_filters: &[String]) -> Result<Vec<ContainerSummary>, DriverError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), label_filters.to_vec());

        let containers = self
            .docker
            .list_containers(Some(
                ListContainersOptionsBuilder::default()
                    .all(true)
                    .filters(&filters)
                    .build(),
            ))
            .await
            .map_err(|e| map_bollard(e, "list"))?;

        Ok(containers
            .into_iter()
            .map(|c| {
                let raw_state = c.state.map(|s| s.to_string()).unwrap_or_default();
                ContainerSummary {
                    name: c
                        .names
                        .unwrap_or_default()
                        .first()
                        .map(|n| n.trim_start_matches('/').to_string())
                        .unwrap_or_default(),
                    state: ContainerState::from_engine(&raw_state),
                    container_id: c.id,
                    labels: c.labels.unwrap_or_default(),
                }
            })
            .collect())
    }

    async fn exec(
        &self,
        name: &str,
        argv: &[String],
        user: Option<&str>,
    ) -> Result<ExecOutput, DriverError> {
        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    user: user.map(str::to_string),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_bollard(e, name))?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| map_bollard(e, name))?
        {
            while let Some(chunk) = output.next().await {
                match chunk.map_err(|e| map_bollard(e, name))? {
                    LogOutput::StdOut { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| map_bollard(e, name))?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn stats_once(&self, name: &str) -> Result<ContainerStats, DriverError> {
        let mut stream = self
            .docker
            .stats(name, Some(StatsOptionsBuilder::default().stream(false).build()));
        let stats = match stream.next().await {
            Some(Ok(stats)) => stats,
            Some(Err(e)) => return Err(map_bollard(e, name)),
            None => return Ok(ContainerStats::default()),
        };

        // Every field in the generated stats response is optional
        let cpu = stats.cpu_stats.unwrap_or_default();
        let precpu = stats.precpu_stats.unwrap_or_default();
        let total = |usage: &Option<bollard::models::ContainerCpuUsage>| {
            usage
                .as_ref()
                .and_then(|u| u.total_usage)
                .unwrap_or(0) as f64
        };
        let cpu_delta = total(&cpu.cpu_usage) - total(&precpu.cpu_usage);
        let system_delta = cpu.system_cpu_usage.unwrap_or(0) as f64
            - precpu.system_cpu_usage.unwrap_or(0) as f64;
        let online_cpus = cpu.online_cpus.unwrap_or(1).max(1) as f64;
        let cpu_percent = if system_delta > 0.0 && cpu_delta > 0.0 {
            (cpu_delta / system_delta) * online_cpus * 100.0
        } else {
            0.0
        };

        let memory_bytes = stats
            .memory_stats
            .and_then(|m| m.usage)
            .unwrap_or(0)
            .max(0) as u64;

        Ok(ContainerStats {
            cpu_percent,
            memory_bytes,
        })
    }

    async fn remove_volume(&self, name: &str) -> Result<(), DriverError> {
        match self
            .docker
            .remove_volume(
                name,
                Some(RemoveVolumeOptionsBuilder::default().force(true).build()),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(map_bollard(e, name)),
        }
    }
}

/// Read an [`AgentStatus`] out of a labelled container summary
pub fn agent_status_from_summary(summary: &ContainerSummary) -> AgentStatus {
    let labels = &summary.labels;
    let name = labels
        .get(labels::AGENT_NAME)
        .cloned()
        .unwrap_or_else(|| trinity_core::name::agent_name_from_container(&summary.name).to_string());
    let created = labels
        .get(labels::CREATED)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    AgentStatus {
        name,
        agent_type: labels
            .get(labels::AGENT_TYPE)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string()),
        status: summary.state,
        ssh_port: labels
            .get(labels::SSH_PORT)
            .and_then(|p| p.parse().ok())
            .unwrap_or(0),
        created,
        resources: Resources {
            cpu: labels.get(labels::CPU).cloned().unwrap_or_else(|| "2".to_string()),
            memory: labels
                .get(labels::MEMORY)
                .cloned()
                .unwrap_or_else(|| "4g".to_string()),
        },
        container_id: summary.container_id.clone(),
        template: labels.get(labels::TEMPLATE).cloned(),
        is_system: labels
            .get(labels::IS_SYSTEM)
            .is_some_and(|v| v == "true"),
    }
}
