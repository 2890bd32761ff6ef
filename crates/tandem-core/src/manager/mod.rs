//! Manager - process-scope registry gluing the runtime together
//!
//! Owns the agent registry, the memoised executor cache, the LLM client
//! factory, and the shared tool collaborators (session pool, MCP registry,
//! builtin tools). External callers hand it an input plus (task, agent)
//! names; everything downstream hangs off the executor it builds.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::bus::{topics, BusEvent, BusPayload, EventBus};
use crate::config::{ProviderConfig, RuntimeConfig, Settings};
use crate::context::{prompts, Context};
use crate::error::{EngineError, ErrorEvent};
use crate::executor::{Executor, Input};
use crate::llm::{LlmClient, OpenAiClient};
use crate::mcp::McpRegistry;
use crate::storage::{AgentProfile, AgentRole, Store, Task, TaskState};
use crate::subagent::SubAgentCoordinator;
use crate::tools::{BuiltinRegistry, SessionPool, ToolEnv};

/// The manager surface other components depend on. Executors and the
/// sub-agent coordinator hold this interface, not the concrete type,
/// breaking the reference cycle at the type level.
#[async_trait]
pub trait ManagerHandle: Send + Sync {
    /// Enqueue an input for (task, agent), building the executor on first
    /// use.
    async fn handle(&self, input: Input, task_uuid: &str, agent_uuid: &str) -> Result<()>;

    fn query_agent(&self, uuid: &str) -> Option<AgentProfile>;

    /// Persist a subordinate task sharing the leader's group and workdir.
    fn init_subtask(
        &self,
        worker_uuid: &str,
        group_id: &str,
        workdir: &str,
        name: &str,
    ) -> Result<Task>;

    fn executor_for(&self, task_uuid: &str, agent_uuid: &str) -> Option<Arc<Executor>>;
}

pub struct Manager {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    cfg: Arc<RuntimeConfig>,
    settings: Settings,
    agents: RwLock<HashMap<String, AgentProfile>>,
    executors: DashMap<String, Arc<Executor>>,
    clients: Mutex<HashMap<String, Arc<dyn LlmClient>>>,
    llm_override: Option<Arc<dyn LlmClient>>,
    sessions: Arc<SessionPool>,
    mcp: Arc<McpRegistry>,
    builtins: Arc<BuiltinRegistry>,
}

impl Manager {
    /// Boot with the shipped provider factory.
    pub async fn boot(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        cfg: Arc<RuntimeConfig>,
        settings: Settings,
    ) -> Result<Arc<Self>> {
        Self::boot_inner(store, bus, cfg, settings, None).await
    }

    /// Boot with a fixed LLM client (tests, embedding).
    pub async fn boot_with_llm(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        cfg: Arc<RuntimeConfig>,
        settings: Settings,
        llm: Arc<dyn LlmClient>,
    ) -> Result<Arc<Self>> {
        Self::boot_inner(store, bus, cfg, settings, Some(llm)).await
    }

    async fn boot_inner(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        cfg: Arc<RuntimeConfig>,
        settings: Settings,
        llm_override: Option<Arc<dyn LlmClient>>,
    ) -> Result<Arc<Self>> {
        store.auto_migrate().context("storage migration failed")?;

        match store.prune_messages_before(crate::storage::default_retention_cutoff()) {
            Ok(0) => {}
            Ok(n) => info!(pruned = n, "dropped messages past retention"),
            Err(e) => warn!("message retention prune failed: {e:?}"),
        }

        // Load persisted agents; seed the default roster on first run.
        let mut agents: HashMap<String, AgentProfile> = store
            .find_agents()?
            .into_iter()
            .map(|a| (a.uuid.clone(), a))
            .collect();

        if agents.is_empty() {
            for (uuid, role) in [
                ("leader", AgentRole::Leader),
                ("worker", AgentRole::Worker),
                ("basic", AgentRole::Basic),
                ("debug", AgentRole::Debug),
            ] {
                let agent = AgentProfile {
                    uuid: uuid.to_string(),
                    role,
                    prompt_template: prompts::default_template(role),
                    tool_permissions: vec!["*".to_string()],
                    provider_key: None,
                    home_dir: None,
                };
                store.save_agent(&agent)?;
                agents.insert(agent.uuid.clone(), agent);
            }
            info!("seeded default agent roster");
        }

        let mcp = Arc::new(McpRegistry::from_config(settings.mcp.clone(), None));

        let manager = Arc::new(Self {
            store,
            bus: Arc::clone(&bus),
            cfg,
            settings,
            agents: RwLock::new(agents),
            executors: DashMap::new(),
            clients: Mutex::new(HashMap::new()),
            llm_override,
            sessions: Arc::new(SessionPool::new()),
            mcp: Arc::clone(&mcp),
            builtins: Arc::new(BuiltinRegistry::new()),
        });

        // Coordinator and the mcp-reboot bridge ride the bus.
        SubAgentCoordinator::new(
            Arc::clone(&manager) as Arc<dyn ManagerHandle>,
            Arc::clone(&bus),
        )
        .install();

        bus.listen(
            topics::MCP_REBOOT,
            Arc::new(move |event: BusEvent| {
                let BusPayload::McpReboot { server } = event.payload else {
                    return;
                };
                let mcp = Arc::clone(&mcp);
                tokio::spawn(async move { mcp.reboot(&server).await });
            }),
        );

        info!(bot = %manager.settings.defaults.bot_name, "manager booted");
        Ok(manager)
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    pub fn mcp(&self) -> Arc<McpRegistry> {
        Arc::clone(&self.mcp)
    }

    pub fn builtins(&self) -> Arc<BuiltinRegistry> {
        Arc::clone(&self.builtins)
    }

    pub fn sessions(&self) -> Arc<SessionPool> {
        Arc::clone(&self.sessions)
    }

    /// Persist a fresh root task.
    pub fn init_task(&self, name: &str, uuid: Option<&str>, workdir: &str) -> Result<Task> {
        let mut task = Task::new(name, workdir);
        if let Some(uuid) = uuid {
            task.uuid = uuid.to_string();
            task.group_id = uuid.to_string();
        }
        self.store.save_task(&task)?;
        Ok(task)
    }

    pub fn reset_agent(&self, agent: AgentProfile) -> Result<()> {
        self.store.save_agent(&agent)?;
        self.agents.write().insert(agent.uuid.clone(), agent);
        Ok(())
    }

    /// Provider resolution: `providers[name]` → `defaults.use_model` →
    /// empty. A named provider without an API key falls through to the
    /// default as well.
    pub fn llm_config(&self, provider: Option<&str>) -> (String, ProviderConfig) {
        if let Some(name) = provider {
            if let Some(config) = self.settings.providers.get(name) {
                if config.api_key.is_some() {
                    return (name.to_string(), config.clone());
                }
                warn!(provider = name, "provider has no api key, using default");
            }
        }

        if let Some(default_name) = self.settings.defaults.use_model.as_deref() {
            if let Some(config) = self.settings.providers.get(default_name) {
                return (default_name.to_string(), config.clone());
            }
        }

        ("default".to_string(), ProviderConfig::default())
    }

    /// Build (or reuse) the LLM client an agent needs. Surfaced as a
    /// configuration error the first time the executor would need it.
    fn llm_client_for(&self, agent: &AgentProfile) -> Result<Arc<dyn LlmClient>, EngineError> {
        if let Some(llm) = &self.llm_override {
            return Ok(Arc::clone(llm));
        }

        let (provider_name, config) = self.llm_config(agent.provider_key.as_deref());

        if let Some(client) = self.clients.lock().get(&provider_name) {
            return Ok(Arc::clone(client));
        }

        let model = config
            .model
            .clone()
            .ok_or_else(|| EngineError::Config("no model available".to_string()))?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        let client = OpenAiClient::new(
            base_url,
            config.api_key.clone(),
            model,
            self.cfg.proxy_url.as_deref(),
        )
        .map_err(|e| EngineError::Config(e.to_string()))?;

        let client: Arc<dyn LlmClient> = Arc::new(client);
        self.clients
            .lock()
            .insert(provider_name, Arc::clone(&client));
        Ok(client)
    }

    async fn subagents_digest(&self) -> String {
        let agents = self.agents.read();
        let mut lines: Vec<String> = agents
            .values()
            .filter(|a| a.role == AgentRole::Worker)
            .map(|a| format!("- {} ({})", a.uuid, a.role))
            .collect();
        lines.sort();
        if lines.is_empty() {
            "(no sub-agents registered)".to_string()
        } else {
            lines.join("\n")
        }
    }

    async fn mcp_digest(&self) -> String {
        let tools = self.mcp.tool_digest().await;
        if tools.is_empty() {
            return "(no remote tools connected)".to_string();
        }
        tools
            .iter()
            .map(|(server, def)| format!("- {server}:{} - {}", def.name, def.description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Memoised executor lookup. The same (task, agent) pair always yields
    /// the same instance, even across concurrent callers.
    pub async fn get_or_build_executor(
        &self,
        task: &Task,
        agent: &AgentProfile,
    ) -> Result<Arc<Executor>, EngineError> {
        let key = executor_key(&task.uuid, &agent.uuid);
        if let Some(existing) = self.executors.get(&key) {
            return Ok(Arc::clone(&existing));
        }

        let llm = self.llm_client_for(agent)?;
        let subagents_digest = self.subagents_digest().await;
        let mcp_digest = self.mcp_digest().await;

        let ctx = Arc::new(Context::new(
            task.clone(),
            agent.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            Arc::clone(&self.cfg),
            subagents_digest,
            mcp_digest,
        ));

        let env = ToolEnv {
            task_uuid: task.uuid.clone(),
            workdir: PathBuf::from(&task.workdir),
            command_timeout: self.cfg.command_timeout,
            sandbox_profile: self.cfg.sandbox_profile.clone(),
            permissions: agent.tool_permissions.clone(),
            sessions: Arc::clone(&self.sessions),
            mcp: Arc::clone(&self.mcp),
            builtins: Arc::clone(&self.builtins),
        };

        let built = Arc::new(Executor::new(
            ctx,
            llm,
            Arc::clone(&self.bus),
            env,
            Arc::clone(&self.cfg),
        ));

        // entry() decides a single winner under concurrent construction.
        let executor = self
            .executors
            .entry(key)
            .or_insert_with(|| built)
            .value()
            .clone();
        Ok(executor)
    }

    /// Terminate everything: executors, then the async session pool.
    pub async fn shutdown(&self) {
        for entry in self.executors.iter() {
            entry.value().terminate();
        }
        self.sessions.kill_all().await;
        info!("manager shut down");
    }

    async fn handle_input(&self, input: Input, task_uuid: &str, agent_uuid: &str) -> Result<()> {
        let task = self
            .store
            .load_task(task_uuid)?
            .with_context(|| format!("unknown task: {task_uuid}"))?;
        let agent = self
            .query_agent(agent_uuid)
            .with_context(|| format!("unknown agent: {agent_uuid}"))?;

        let executor = match self.get_or_build_executor(&task, &agent).await {
            Ok(e) => e,
            Err(e) => {
                self.bus.emit(
                    topics::ERRORS,
                    task_uuid,
                    BusPayload::Error(ErrorEvent::new(task_uuid, agent_uuid, &e)),
                );
                return Err(anyhow::anyhow!(e.to_string()));
            }
        };

        executor.enqueue(input);
        Ok(())
    }
}

fn executor_key(task_uuid: &str, agent_uuid: &str) -> String {
    format!("{task_uuid}:{agent_uuid}")
}

#[async_trait]
impl ManagerHandle for Manager {
    async fn handle(&self, input: Input, task_uuid: &str, agent_uuid: &str) -> Result<()> {
        self.handle_input(input, task_uuid, agent_uuid).await
    }

    fn query_agent(&self, uuid: &str) -> Option<AgentProfile> {
        self.agents.read().get(uuid).cloned()
    }

    fn init_subtask(
        &self,
        worker_uuid: &str,
        group_id: &str,
        workdir: &str,
        name: &str,
    ) -> Result<Task> {
        let mut task = Task::new(name, workdir);
        task.group_id = group_id.to_string();
        task.leader_agent = Some(worker_uuid.to_string());
        task.state = TaskState::Waiting;
        self.store.save_task(&task)?;
        Ok(task)
    }

    fn executor_for(&self, task_uuid: &str, agent_uuid: &str) -> Option<Arc<Executor>> {
        self.executors
            .get(&executor_key(task_uuid, agent_uuid))
            .map(|e| Arc::clone(&e))
    }
}
