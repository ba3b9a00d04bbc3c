//! Agent lifecycle manager
//!
//! Materializes agents from templates, supervises their containers and
//! tears them down. The creation pipeline: validate name, allocate SSH
//! port, mint an MCP key, stage the template, render credential files,
//! create and start the container, gate on `/health`, register
//! ownership and owner-default permissions.

pub mod read_only;
mod system;

pub use system::{SystemAgentAction, SYSTEM_AGENT_OWNER, SYSTEM_AGENT_TEMPLATE};

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use trinity_core::name::{container_name, validate_agent_name, workspace_volume};
use trinity_core::template::{RequiredCredential, TemplateId};
use trinity_core::types::{
    ActivityState, ActivityType, AgentStatus, ContainerState, CredentialFiles, ExecutionStatus,
    Resources, TriggeredBy, SYSTEM_AGENT_NAME,
};
use trinity_core::{Error, Result};
use trinity_store::{ExecutionOutcome, StateStore, ANTHROPIC_API_KEY, TRINITY_PROMPT};

use crate::activity::ActivityService;
use crate::docker::{
    agent_status_from_summary, labels, ContainerDriver, ContainerSpec, ContainerStats, VolumeMount,
};
use crate::queue::ExecutionQueue;
use crate::templates::{StagedTemplate, TemplateResolver};
use crate::transport::AgentTransport;

/// First SSH port handed out; successors count up from the max in use
pub const BASE_SSH_PORT: u16 = 2289;

/// How long a fresh container gets to pass its health gate
pub const HEALTH_WAIT: Duration = Duration::from_secs(30);

/// Grace period before a stop turns into a kill
const STOP_GRACE_SECS: i64 = 10;

/// How long a terminated LLM process gets before SIGKILL
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// File the meta prompt is injected as
const META_PROMPT_FILE: &str = "TRINITY.md";

/// Deployment-level knobs for the lifecycle manager
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub image: String,
    pub network: Option<String>,
    pub templates_dir: PathBuf,
    pub mcp_url: String,
    /// `OTEL_*` and related telemetry passthrough into containers
    pub otel_env: Vec<(String, String)>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            image: "trinity-agent-base:latest".to_string(),
            network: Some("trinity-agent-network".to_string()),
            templates_dir: PathBuf::from("./config/agent-templates"),
            mcp_url: "http://mcp-server:8080/mcp".to_string(),
            otel_env: Vec::new(),
        }
    }
}

/// Request to create an agent
#[derive(Debug, Clone, Default)]
pub struct CreateAgentRequest {
    pub name: String,
    /// `local:<name>` or `github:<owner>/<repo>`; defaults to `local:default`
    pub template: Option<String>,
    pub resources: Option<Resources>,
    /// Values for the template's credential schema
    pub credentials: Option<BTreeMap<String, String>>,
}

/// What creation produced
#[derive(Debug, Clone)]
pub struct CreatedAgent {
    pub name: String,
    pub status: ContainerState,
    pub ssh_port: u16,
    pub template: String,
    pub mcp_key_prefix: String,
    pub required_credentials: Vec<RequiredCredential>,
    /// Set when the container came up but failed its health gate; the
    /// container is retained for diagnosis
    pub health_error: Option<String>,
}

/// Outcome of a termination request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationStatus {
    Terminated,
    AlreadyFinished,
}

/// Creates, supervises and deletes agent containers
pub struct LifecycleManager {
    driver: Arc<dyn ContainerDriver>,
    transport: Arc<dyn AgentTransport>,
    store: StateStore,
    queue: ExecutionQueue,
    activity: ActivityService,
    templates: TemplateResolver,
    config: LifecycleConfig,
}

impl LifecycleManager {
    pub fn new(
        driver: Arc<dyn ContainerDriver>,
        transport: Arc<dyn AgentTransport>,
        store: StateStore,
        queue: ExecutionQueue,
        activity: ActivityService,
        config: LifecycleConfig,
    ) -> Self {
        let templates = TemplateResolver::new(config.templates_dir.clone(), store.clone());
        Self {
            driver,
            transport,
            store,
            queue,
            activity,
            templates,
            config,
        }
    }

    /// All agents, read straight from container labels
    pub async fn list_agents(&self) -> Result<Vec<AgentStatus>> {
        let summaries = self
            .driver
            .list(&[format!("{}={}", labels::PLATFORM, labels::PLATFORM_AGENT)])
            .await?;
        Ok(summaries.iter().map(agent_status_from_summary).collect())
    }

    /// One agent by name, `None` when no labelled container exists
    pub async fn get_agent(&self, name: &str) -> Result<Option<AgentStatus>> {
        let summaries = self
            .driver
            .list(&[
                format!("{}={}", labels::PLATFORM, labels::PLATFORM_AGENT),
                format!("{}={name}", labels::AGENT_NAME),
            ])
            .await?;
        Ok(summaries.first().map(agent_status_from_summary))
    }

    /// Next free SSH port: one past the highest allocated
    pub async fn next_ssh_port(&self) -> Result<u16> {
        let max_in_use = self
            .list_agents()
            .await?
            .iter()
            .map(|a| a.ssh_port)
            .filter(|p| *p > 0)
            .max()
            .unwrap_or(BASE_SSH_PORT);
        Ok(max_in_use + 1)
    }

    /// Create an ordinary agent for `owner`
    pub async fn create_agent(
        &self,
        owner_username: &str,
        request: CreateAgentRequest,
    ) -> Result<CreatedAgent> {
        self.create_internal(owner_username, request, false).await
    }

    pub(crate) async fn create_internal(
        &self,
        owner_username: &str,
        request: CreateAgentRequest,
        is_system: bool,
    ) -> Result<CreatedAgent> {
        let name = validate_agent_name(&request.name)?.to_string();

        // Duplicate check is two-step: ownership row, then engine labels
        if self.store.get_agent_record(&name)?.is_some() {
            return Err(Error::Conflict(format!("agent '{name}' already exists")));
        }
        if self.get_agent(&name).await?.is_some() {
            return Err(Error::Conflict(format!(
                "container for agent '{name}' already exists"
            )));
        }

        let ssh_port = self.next_ssh_port().await?;

        let scope = if is_system {
            trinity_core::McpScope::System
        } else {
            trinity_core::McpScope::User
        };
        let (mcp_key, mcp_token) = self.store.create_mcp_key(
            owner_username,
            Some(&name),
            scope,
            Some("Auto-generated agent MCP key"),
        )?;

        let template_id = TemplateId::parse(
            request.template.as_deref().unwrap_or("local:default"),
        )?;
        let staged = self.templates.resolve(&template_id).await?;

        let resources = request
            .resources
            .clone()
            .or_else(|| staged.spec.resources.clone())
            .unwrap_or_default();

        let credential_files = match &request.credentials {
            Some(values) => trinity_core::template::render_credential_files(
                &staged.spec,
                staged.mcp_json_template.as_deref(),
                values,
            )?,
            None => CredentialFiles::new(),
        };

        let spec = self.container_spec(
            &name,
            &template_id,
            &staged,
            &resources,
            ssh_port,
            &mcp_token,
            is_system,
        )?;
        self.driver.create(spec).await?;

        // Ownership and owner-default permissions exist even when the
        // health gate fails below; the agent is diagnosable, not lost.
        self.store
            .register_agent_owner(&name, owner_username, is_system)?;
        self.store.grant_default_permissions(&name, owner_username)?;

        self.driver.start(&container_name(&name)).await?;

        let health_error = match self.wait_for_health(&name, HEALTH_WAIT).await {
            Ok(()) => None,
            Err(e) => {
                tracing::error!(agent = %name, error = %e, "agent failed health gate; container retained");
                Some(e.to_string())
            }
        };

        if health_error.is_none() {
            if !credential_files.is_empty() {
                self.transport.inject_files(&name, &credential_files).await?;
            }
            if matches!(template_id, TemplateId::Github(_)) {
                self.inject_template_files(&name, &staged).await;
            }
            self.inject_runtime_files(&name).await;
        }

        let status = if health_error.is_some() {
            ContainerState::Error
        } else {
            ContainerState::Running
        };

        tracing::info!(agent = %name, owner = %owner_username, ssh_port, "agent created");
        Ok(CreatedAgent {
            name,
            status,
            ssh_port,
            template: template_id.as_str(),
            mcp_key_prefix: mcp_key.token_prefix,
            required_credentials: staged.credential_schema.required_credentials,
            health_error,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn container_spec(
        &self,
        name: &str,
        template_id: &TemplateId,
        staged: &StagedTemplate,
        resources: &Resources,
        ssh_port: u16,
        mcp_token: &str,
        is_system: bool,
    ) -> Result<ContainerSpec> {
        let agent_type = staged
            .spec
            .agent_type
            .clone()
            .unwrap_or_else(|| "worker".to_string());

        let mut env: Vec<(String, String)> = vec![
            ("AGENT_NAME".into(), name.to_string()),
            ("AGENT_TYPE".into(), agent_type.clone()),
            ("ENABLE_SSH".into(), "true".into()),
            ("ENABLE_AGENT_UI".into(), "true".into()),
            ("AGENT_SERVER_PORT".into(), "8000".into()),
            ("TEMPLATE_NAME".into(), template_id.as_str()),
            ("TRINITY_MCP_URL".into(), self.config.mcp_url.clone()),
            ("TRINITY_MCP_API_KEY".into(), mcp_token.to_string()),
        ];
        if let Some(api_key) = self.store.get_setting(ANTHROPIC_API_KEY)? {
            env.push(("ANTHROPIC_API_KEY".into(), api_key));
        }
        env.extend(self.config.otel_env.iter().cloned());

        let mut label_map = HashMap::new();
        label_map.insert(labels::PLATFORM.into(), labels::PLATFORM_AGENT.into());
        label_map.insert(labels::AGENT_NAME.into(), name.to_string());
        label_map.insert(labels::AGENT_TYPE.into(), agent_type);
        label_map.insert(labels::SSH_PORT.into(), ssh_port.to_string());
        label_map.insert(labels::CPU.into(), resources.cpu.clone());
        label_map.insert(labels::MEMORY.into(), resources.memory.clone());
        label_map.insert(labels::CREATED.into(), Utc::now().to_rfc3339());
        label_map.insert(labels::TEMPLATE.into(), template_id.as_str());
        if is_system {
            label_map.insert(labels::IS_SYSTEM.into(), "true".into());
        }

        let mut volumes = vec![VolumeMount {
            source: workspace_volume(name),
            target: "/home/developer/workspace".into(),
            read_only: false,
        }];
        if let TemplateId::Local(template_name) = template_id {
            volumes.push(VolumeMount {
                source: self
                    .config
                    .templates_dir
                    .join(template_name)
                    .to_string_lossy()
                    .into_owned(),
                target: "/template".into(),
                read_only: true,
            });
        }

        Ok(ContainerSpec {
            name: container_name(name),
            image: self.config.image.clone(),
            env,
            labels: label_map,
            network: self.config.network.clone(),
            ports: vec![(22, ssh_port)],
            volumes,
            resources: resources.clone(),
            cap_add: if is_system {
                system::SYSTEM_AGENT_CAPABILITIES
                    .iter()
                    .map(|c| c.to_string())
                    .collect()
            } else {
                Vec::new()
            },
        })
    }

    /// Poll the agent's health endpoint until it answers or time runs out
    pub async fn wait_for_health(&self, name: &str, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(true) = self.transport.health(name).await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::AgentNotReachable(format!(
                    "agent '{name}' did not pass health check within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Start an agent; idempotent
    pub async fn start_agent(&self, name: &str) -> Result<()> {
        if self.get_agent(name).await?.is_none() {
            return Err(Error::NotFound(format!("agent '{name}'")));
        }
        self.driver.start(&container_name(name)).await?;
        if self.wait_for_health(name, HEALTH_WAIT).await.is_ok() {
            self.inject_runtime_files(name).await;
        }
        Ok(())
    }

    /// Stop an agent with a grace period; idempotent. Container and
    /// state are retained.
    pub async fn stop_agent(&self, name: &str) -> Result<()> {
        if self.get_agent(name).await?.is_none() {
            return Err(Error::NotFound(format!("agent '{name}'")));
        }
        self.driver.stop(&container_name(name), STOP_GRACE_SECS).await?;
        Ok(())
    }

    /// Delete an agent: container, volume, queue state, store rows, keys
    pub async fn delete_agent(&self, name: &str) -> Result<()> {
        if name == SYSTEM_AGENT_NAME
            || self
                .store
                .get_agent_record(name)?
                .is_some_and(|r| r.is_system)
        {
            return Err(Error::Permission(
                "the system agent cannot be deleted".to_string(),
            ));
        }
        if self.get_agent(name).await?.is_none() && self.store.get_agent_record(name)?.is_none() {
            return Err(Error::NotFound(format!("agent '{name}'")));
        }

        let container = container_name(name);
        if let Err(e) = self.driver.stop(&container, STOP_GRACE_SECS).await {
            tracing::debug!(agent = %name, error = %e, "stop before delete failed");
        }
        if let Err(e) = self.driver.remove(&container, true).await {
            tracing::debug!(agent = %name, error = %e, "container remove failed");
        }
        self.driver.remove_volume(&workspace_volume(name)).await?;

        self.queue.clear_queue(name).await?;
        self.queue.force_release(name).await?;

        self.store.delete_agent_record(name)?;
        self.store.delete_agent_mcp_keys(name)?;

        tracing::info!(agent = %name, "agent deleted");
        Ok(())
    }

    /// Single-shot container resource usage
    pub async fn stats(&self, name: &str) -> Result<ContainerStats> {
        Ok(self.driver.stats_once(&container_name(name)).await?)
    }

    /// Resource usage for every running agent
    ///
    /// Engine stats calls take a second or two each, so they run through
    /// a small worker pool rather than one at a time or all at once.
    pub async fn stats_all(&self) -> Result<Vec<(String, ContainerStats)>> {
        use futures::stream::{self, StreamExt};

        let running: Vec<String> = self
            .list_agents()
            .await?
            .into_iter()
            .filter(|a| a.status.is_running())
            .map(|a| a.name)
            .collect();

        let collected: Vec<(String, ContainerStats)> = stream::iter(running)
            .map(|name| async move {
                let stats = self.driver.stats_once(&container_name(&name)).await;
                (name, stats)
            })
            .buffer_unordered(4)
            .filter_map(|(name, stats)| async move {
                match stats {
                    Ok(stats) => Some((name, stats)),
                    Err(e) => {
                        tracing::debug!(agent = %name, error = %e, "stats unavailable");
                        None
                    }
                }
            })
            .collect()
            .await;
        Ok(collected)
    }

    /// Cancel a running execution
    ///
    /// SIGINT to the LLM process, a grace window, then SIGKILL. The
    /// queue slot is not touched here: the dispatcher holding it
    /// observes the dead call and completes, which is what promotes the
    /// next waiter.
    pub async fn terminate_execution(
        &self,
        agent: &str,
        execution_id: &str,
    ) -> Result<TerminationStatus> {
        let Some(current) = self.queue.current_execution(agent).await? else {
            return Ok(TerminationStatus::AlreadyFinished);
        };
        if current.id != execution_id {
            return Ok(TerminationStatus::AlreadyFinished);
        }

        let container = container_name(agent);
        self.driver
            .exec(
                &container,
                &["pkill".into(), "-INT".into(), "-f".into(), "claude".into()],
                Some("developer"),
            )
            .await?;

        let deadline = tokio::time::Instant::now() + TERMINATE_GRACE;
        loop {
            let probe = self
                .driver
                .exec(
                    &container,
                    &["pgrep".into(), "-f".into(), "claude".into()],
                    Some("developer"),
                )
                .await?;
            if probe.exit_code != 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                self.driver
                    .exec(
                        &container,
                        &["pkill".into(), "-KILL".into(), "-f".into(), "claude".into()],
                        Some("developer"),
                    )
                    .await?;
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        self.store.complete_execution(
            execution_id,
            ExecutionStatus::Terminated,
            ExecutionOutcome {
                error: Some("terminated by user".to_string()),
                ..Default::default()
            },
        )?;

        let activity_id = self.activity.track(
            agent,
            ActivityType::ExecutionCancelled,
            TriggeredBy::User,
            None,
            Some(execution_id.to_string()),
            serde_json::json!({"execution_id": execution_id}),
        )?;
        self.activity
            .complete(&activity_id, ActivityState::Completed, None, None)?;

        tracing::info!(agent = %agent, execution = %execution_id, "execution terminated");
        Ok(TerminationStatus::Terminated)
    }

    /// Idempotent injection of per-agent runtime files: the meta prompt
    /// and, when enabled, the read-only guard
    pub async fn inject_runtime_files(&self, name: &str) {
        if let Ok(Some(prompt)) = self.store.get_setting(TRINITY_PROMPT) {
            let mut files = CredentialFiles::new();
            files.insert(META_PROMPT_FILE.to_string(), prompt);
            if let Err(e) = self.transport.inject_files(name, &files).await {
                tracing::warn!(agent = %name, error = %e, "meta prompt injection failed");
            }
        }

        match self.store.get_read_only_config(name) {
            Ok(config) if config.enabled => {
                if let Err(e) = read_only::inject_hooks(&self.transport, name, &config).await {
                    tracing::warn!(agent = %name, error = %e, "read-only hook injection failed");
                }
            }
            _ => {}
        }
    }

    /// Best-effort copy of a cloned template's files into the workspace
    async fn inject_template_files(&self, name: &str, staged: &StagedTemplate) {
        let mut files = CredentialFiles::new();
        collect_text_files(&staged.dir, &staged.dir, &mut files);
        if files.is_empty() {
            return;
        }
        if let Err(e) = self.transport.inject_files(name, &files).await {
            tracing::warn!(agent = %name, error = %e, "template file injection failed");
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn queue(&self) -> &ExecutionQueue {
        &self.queue
    }

    pub fn transport(&self) -> &Arc<dyn AgentTransport> {
        &self.transport
    }

    pub fn activity(&self) -> &ActivityService {
        &self.activity
    }
}

fn collect_text_files(root: &std::path::Path, dir: &std::path::Path, out: &mut CredentialFiles) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_text_files(root, &path, out);
        } else if let Ok(content) = std::fs::read_to_string(&path) {
            if let Ok(relative) = path.strip_prefix(root) {
                out.insert(relative.to_string_lossy().into_owned(), content);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::test_support::{FakeDriver, FakeTransport};
    use trinity_core::types::ExecutionSource;

    struct Harness {
        manager: LifecycleManager,
        driver: Arc<FakeDriver>,
        transport: Arc<FakeTransport>,
        _templates_dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let driver = Arc::new(FakeDriver::new());
        let transport = Arc::new(FakeTransport::new());
        let store = StateStore::open_in_memory().unwrap();
        let queue = ExecutionQueue::new(Arc::new(MemoryBackend::new()));
        let activity = ActivityService::new(store.clone());
        let templates_dir = tempfile::tempdir().unwrap();

        let default_dir = templates_dir.path().join("default");
        std::fs::create_dir_all(&default_dir).unwrap();
        std::fs::write(
            default_dir.join("template.yaml"),
            "name: default\ntype: worker\ncredentials:\n  env_file:\n    - DEMO_KEY\n",
        )
        .unwrap();

        let config = LifecycleConfig {
            templates_dir: templates_dir.path().to_path_buf(),
            ..Default::default()
        };
        let manager = LifecycleManager::new(
            driver.clone() as Arc<dyn ContainerDriver>,
            transport.clone() as Arc<dyn AgentTransport>,
            store,
            queue,
            activity,
            config,
        );
        Harness {
            manager,
            driver,
            transport,
            _templates_dir: templates_dir,
        }
    }

    #[tokio::test]
    async fn test_create_agent_full_pipeline() {
        let h = harness();
        let created = h
            .manager
            .create_agent(
                "ada",
                CreateAgentRequest {
                    name: "alpha".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(created.name, "alpha");
        assert_eq!(created.status, ContainerState::Running);
        assert_eq!(created.ssh_port, BASE_SSH_PORT + 1);
        assert_eq!(created.template, "local:default");
        assert!(created.mcp_key_prefix.starts_with("trinity_mcp_"));
        assert_eq!(created.required_credentials.len(), 1);
        assert!(created.health_error.is_none());

        // Container carries the label index
        assert!(h.driver.has_container("agent-alpha"));
        let agent = h.manager.get_agent("alpha").await.unwrap().unwrap();
        assert_eq!(agent.status, ContainerState::Running);
        assert_eq!(agent.ssh_port, BASE_SSH_PORT + 1);

        // Ownership registered
        let record = h.manager.store().get_agent_record("alpha").unwrap().unwrap();
        assert_eq!(record.owner_username, "ada");
        assert!(!record.is_system);
    }

    #[tokio::test]
    async fn test_duplicate_name_conflicts() {
        let h = harness();
        let request = CreateAgentRequest {
            name: "alpha".to_string(),
            ..Default::default()
        };
        h.manager.create_agent("ada", request.clone()).await.unwrap();
        let err = h.manager.create_agent("ada", request).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_bad_name_rejected_before_side_effects() {
        let h = harness();
        let err = h
            .manager
            .create_agent(
                "ada",
                CreateAgentRequest {
                    name: "Bad Name".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(h.manager.list_agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_owner_defaults_connect_cohort() {
        let h = harness();
        for name in ["alpha", "beta"] {
            h.manager
                .create_agent(
                    "ada",
                    CreateAgentRequest {
                        name: name.to_string(),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        assert!(h.manager.store().has_permission("alpha", "beta").unwrap());
        assert!(h.manager.store().has_permission("beta", "alpha").unwrap());
    }

    #[tokio::test]
    async fn test_ssh_ports_count_up() {
        let h = harness();
        for (i, name) in ["alpha", "beta", "gamma"].iter().enumerate() {
            let created = h
                .manager
                .create_agent(
                    "ada",
                    CreateAgentRequest {
                        name: name.to_string(),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            assert_eq!(created.ssh_port, BASE_SSH_PORT + 1 + i as u16);
        }
    }

    #[tokio::test]
    async fn test_credentials_rendered_and_injected() {
        let h = harness();
        let mut creds = BTreeMap::new();
        creds.insert("DEMO_KEY".to_string(), "d-123".to_string());
        h.manager
            .create_agent(
                "ada",
                CreateAgentRequest {
                    name: "alpha".to_string(),
                    credentials: Some(creds),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let env = h.transport.file("alpha", ".env").unwrap();
        assert!(env.contains("DEMO_KEY=d-123"));
    }

    // Paused clock: the 30s health wait elapses virtually
    #[tokio::test(start_paused = true)]
    async fn test_health_gate_failure_retains_container() {
        let h = harness();
        h.transport.set_healthy(false);

        let created = h
            .manager
            .create_agent(
                "ada",
                CreateAgentRequest {
                    name: "alpha".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(created.status, ContainerState::Error);
        assert!(created.health_error.is_some());
        assert!(h.driver.has_container("agent-alpha"));
        // Still registered for diagnosis and restart
        assert!(h.manager.store().get_agent_record("alpha").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_agent_cascades() {
        let h = harness();
        h.manager
            .create_agent(
                "ada",
                CreateAgentRequest {
                    name: "alpha".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        h.manager.delete_agent("alpha").await.unwrap();
        assert!(!h.driver.has_container("agent-alpha"));
        assert!(h.driver.removed_volumes().contains(&"agent-alpha-workspace".to_string()));
        assert!(h.manager.store().get_agent_record("alpha").unwrap().is_none());
        assert!(h.manager.store().list_mcp_keys("ada").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_unknown_agent() {
        let h = harness();
        let err = h.manager.delete_agent("ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let h = harness();
        h.manager
            .create_agent(
                "ada",
                CreateAgentRequest {
                    name: "alpha".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        h.manager.start_agent("alpha").await.unwrap();
        h.manager.start_agent("alpha").await.unwrap();
        h.manager.stop_agent("alpha").await.unwrap();
        h.manager.stop_agent("alpha").await.unwrap();
        let agent = h.manager.get_agent("alpha").await.unwrap().unwrap();
        assert_eq!(agent.status, ContainerState::Stopped);
    }

    // Paused clock: the SIGKILL grace window elapses virtually
    #[tokio::test(start_paused = true)]
    async fn test_terminate_running_execution() {
        let h = harness();
        h.manager
            .create_agent(
                "ada",
                CreateAgentRequest {
                    name: "alpha".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let execution =
            trinity_core::Execution::new("alpha", "long task", ExecutionSource::User);
        let (_, execution) = h.manager.queue().submit(execution, true).await.unwrap();
        h.manager
            .store()
            .create_execution(&execution.id, None, "alpha", "long task", TriggeredBy::User)
            .unwrap();

        let status = h
            .manager
            .terminate_execution("alpha", &execution.id)
            .await
            .unwrap();
        assert_eq!(status, TerminationStatus::Terminated);

        // SIGINT went to the container
        let calls = h.driver.exec_calls();
        assert!(calls.iter().any(|argv| argv.contains(&"-INT".to_string())));

        // Store row is terminated, activity recorded
        let row = h.manager.store().get_execution(&execution.id).unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Terminated);
        let activities = h.manager.activity().recent("alpha", 10).unwrap();
        assert!(activities
            .iter()
            .any(|a| a.activity_type == ActivityType::ExecutionCancelled));
    }

    #[tokio::test]
    async fn test_terminate_wrong_id_already_finished() {
        let h = harness();
        h.manager
            .create_agent(
                "ada",
                CreateAgentRequest {
                    name: "alpha".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let status = h
            .manager
            .terminate_execution("alpha", "nonexistent")
            .await
            .unwrap();
        assert_eq!(status, TerminationStatus::AlreadyFinished);
    }
}
