//! Sub-agent coordinator - leader/worker fan-out over the event bus
//!
//! Consumes `subtask` events emitted during dispatch and `complete` events
//! from worker executors. Start spins up a subordinate task (same group,
//! same workdir) through the manager; a worker's completion is forged into
//! a start-subtask echo carrying the output and routed back to the leader
//! as a tool-result input, so the leader sees it on its next turn.
//!
//! Workers may recurse - a worker's own `start-subtask` lands here too.
//! Nothing bounds the depth; the leader owns the stop condition.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::bus::{topics, BusEvent, BusPayload, EventBus};
use crate::executor::Input;
use crate::manager::ManagerHandle;
use crate::reply::{Action, ActionKind, TOOL_RESULT_TAG};
use crate::storage::{AgentProfile, OpType, Task};

/// A sub-agent action captured at dispatch, with its origin.
#[derive(Debug, Clone, Serialize)]
pub struct SubtaskEnvelope {
    pub leader_task: Task,
    pub leader_agent: AgentProfile,
    pub action: Action,
}

/// Routing entry for one live subordinate task.
#[derive(Debug, Clone)]
struct Route {
    leader_task: String,
    leader_agent: String,
    sub_agent: String,
    origin: Action,
}

pub struct SubAgentCoordinator {
    manager: Arc<dyn ManagerHandle>,
    bus: Arc<EventBus>,
    /// Subordinate task uuid → where its completion goes.
    routes: Mutex<HashMap<String, Route>>,
    /// (leader agent, sub-agent id) → subordinate task uuid.
    by_key: Mutex<HashMap<(String, String), String>>,
}

impl SubAgentCoordinator {
    pub fn new(manager: Arc<dyn ManagerHandle>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            bus,
            routes: Mutex::new(HashMap::new()),
            by_key: Mutex::new(HashMap::new()),
        })
    }

    /// Register the bus listeners. Call once at boot.
    pub fn install(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        self.bus.listen(
            topics::SUBTASK,
            Arc::new(move |event: BusEvent| {
                let BusPayload::Subtask(envelope) = event.payload else {
                    return;
                };
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move { coordinator.handle_subtask(&envelope).await });
            }),
        );

        let coordinator = Arc::clone(self);
        self.bus.listen(
            topics::COMPLETE,
            Arc::new(move |event: BusEvent| {
                let BusPayload::Complete {
                    task_uuid, content, ..
                } = event.payload
                else {
                    return;
                };
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move { coordinator.handle_complete(&task_uuid, &content).await });
            }),
        );
    }

    async fn handle_subtask(&self, envelope: &SubtaskEnvelope) {
        match &envelope.action.kind {
            ActionKind::StartSubtask {
                sub_agent,
                task_desc,
                context,
                require,
            } => {
                self.start(envelope, sub_agent, task_desc, context, require)
                    .await;
            }
            ActionKind::AbortSubtask { sub_agent } => self.abort(envelope, sub_agent).await,
            ActionKind::QuerySubtask { sub_agent } => self.query(envelope, sub_agent).await,
            other => {
                tracing::warn!(tag = other.tag(), "non-subagent action on subtask topic");
            }
        }
    }

    async fn start(
        &self,
        envelope: &SubtaskEnvelope,
        sub_agent: &str,
        task_desc: &str,
        context: &str,
        require: &str,
    ) {
        let Some(worker) = self.manager.query_agent(sub_agent) else {
            tracing::warn!(sub_agent, "start-subtask for unknown worker agent");
            self.route_result(
                envelope,
                &envelope.action,
                &format!("ERROR: unknown sub-agent '{sub_agent}'"),
            )
            .await;
            return;
        };

        // Subordinate tasks share the leader's group and workdir.
        let sub_task = match self.manager.init_subtask(
            &worker.uuid,
            &envelope.leader_task.group_id,
            &envelope.leader_task.workdir,
            task_desc,
        ) {
            Ok(t) => t,
            Err(e) => {
                self.route_result(
                    envelope,
                    &envelope.action,
                    &format!("ERROR: failed to start subtask: {e}"),
                )
                .await;
                return;
            }
        };

        self.routes.lock().insert(
            sub_task.uuid.clone(),
            Route {
                leader_task: envelope.leader_task.uuid.clone(),
                leader_agent: envelope.leader_agent.uuid.clone(),
                sub_agent: sub_agent.to_string(),
                origin: envelope.action.clone(),
            },
        );
        self.by_key.lock().insert(
            (envelope.leader_agent.uuid.clone(), sub_agent.to_string()),
            sub_task.uuid.clone(),
        );

        tracing::info!(
            leader = %envelope.leader_task.uuid,
            worker = %worker.uuid,
            subtask = %sub_task.uuid,
            "subtask started"
        );

        let mut brief = format!("Task: {task_desc}");
        if !context.is_empty() {
            brief.push_str(&format!("\n\nContext:\n{context}"));
        }
        if !require.is_empty() {
            brief.push_str(&format!("\n\nRequired output:\n{require}"));
        }

        let input = Input {
            op_type: OpType::Subtask,
            content: brief,
            prev_uuid: None,
        };
        if let Err(e) = self.manager.handle(input, &sub_task.uuid, &worker.uuid).await {
            self.route_result(
                envelope,
                &envelope.action,
                &format!("ERROR: failed to enqueue subtask: {e}"),
            )
            .await;
        }
    }

    async fn abort(&self, envelope: &SubtaskEnvelope, sub_agent: &str) {
        let key = (envelope.leader_agent.uuid.clone(), sub_agent.to_string());
        let sub_task = self.by_key.lock().get(&key).cloned();

        let Some(sub_task) = sub_task else {
            self.route_result(envelope, &envelope.action, "no subtask found")
                .await;
            return;
        };

        let worker_uuid = self
            .routes
            .lock()
            .get(&sub_task)
            .map(|r| r.sub_agent.clone());
        let executor = worker_uuid
            .as_deref()
            .and_then(|w| self.manager.executor_for(&sub_task, w));

        match executor {
            Some(executor) if executor.is_running() => {
                executor.terminate();
                self.forget(&sub_task);
                self.route_result(envelope, &envelope.action, "subtask aborted")
                    .await;
            }
            _ => {
                self.route_result(envelope, &envelope.action, "no subtask found")
                    .await;
            }
        }
    }

    async fn query(&self, envelope: &SubtaskEnvelope, sub_agent: &str) {
        let key = (envelope.leader_agent.uuid.clone(), sub_agent.to_string());
        let sub_task = self.by_key.lock().get(&key).cloned();

        let Some(sub_task) = sub_task else {
            self.route_result(envelope, &envelope.action, "no subtask found")
                .await;
            return;
        };

        let worker_uuid = self
            .routes
            .lock()
            .get(&sub_task)
            .map(|r| r.sub_agent.clone());
        let state = worker_uuid
            .as_deref()
            .and_then(|w| self.manager.executor_for(&sub_task, w))
            .and_then(|e| e.state())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "pending".to_string());

        self.route_result(
            envelope,
            &envelope.action,
            &format!("subtask '{sub_agent}' is {state}"),
        )
        .await;
    }

    async fn handle_complete(&self, task_uuid: &str, content: &str) {
        // Only subordinate tasks have routes; a leader's own completion is
        // not ours to forward.
        let route = self.routes.lock().remove(task_uuid);
        let Some(route) = route else {
            return;
        };
        self.by_key
            .lock()
            .remove(&(route.leader_agent.clone(), route.sub_agent.clone()));

        tracing::info!(
            subtask = %task_uuid,
            leader = %route.leader_task,
            "subtask completed, routing result to leader"
        );

        // Forge the start-subtask echo carrying the worker's output.
        let echo = route.origin.clone().with_result(content);
        let input = Input {
            op_type: OpType::ToolResult,
            content: wrap_tool_result(&echo),
            prev_uuid: None,
        };
        if let Err(e) = self
            .manager
            .handle(input, &route.leader_task, &route.leader_agent)
            .await
        {
            tracing::error!(leader = %route.leader_task, "failed to route subtask result: {e:?}");
        }
    }

    /// Attach a result to the action and feed it to the leader executor as
    /// a tool-result input.
    async fn route_result(&self, envelope: &SubtaskEnvelope, action: &Action, result: &str) {
        let executed = action.clone().with_result(result);
        let input = Input {
            op_type: OpType::ToolResult,
            content: wrap_tool_result(&executed),
            prev_uuid: None,
        };
        if let Err(e) = self
            .manager
            .handle(
                input,
                &envelope.leader_task.uuid,
                &envelope.leader_agent.uuid,
            )
            .await
        {
            tracing::error!(
                leader = %envelope.leader_task.uuid,
                "failed to route subtask result: {e:?}"
            );
        }
    }

    fn forget(&self, sub_task: &str) {
        if let Some(route) = self.routes.lock().remove(sub_task) {
            self.by_key
                .lock()
                .remove(&(route.leader_agent, route.sub_agent));
        }
    }
}

fn wrap_tool_result(action: &Action) -> String {
    format!(
        "<{TOOL_RESULT_TAG}>\n{}\n</{TOOL_RESULT_TAG}>",
        action.to_xml()
    )
}
