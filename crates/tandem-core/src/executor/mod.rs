//! Executor - the turn loop for one (task, agent) pair
//!
//! One worker task per executor drives: drain input queue → call LLM →
//! persist request and reply → parse → dispatch tools → feed the merged
//! tool result back onto its own queue. The loop starts lazily on the
//! first enqueue and exits on any terminal state; an enqueue after that
//! revives it.
//!
//! Cancellation is cooperative: `terminate()` raises a flag checked at the
//! top of the loop and around dispatch, and aborts any in-flight LLM call
//! through the client's group cancel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use crate::bus::{topics, BusPayload, EventBus};
use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::error::{EngineError, ErrorEvent};
use crate::llm::{LlmClient, LlmError};
use crate::reply::{self, ActionKind, Payload, SuperAction, TOOL_RESULT_TAG};
use crate::storage::{MessageRecord, OpType, TaskState};
use crate::subagent::SubtaskEnvelope;
use crate::tools::{self, ToolEnv};

pub mod watcher;

use watcher::WorkdirWatcher;

/// Pause before re-checking the queue after a pure-annotation turn.
const ANNOTATION_GRACE: Duration = Duration::from_millis(50);

/// One queued input for an executor.
#[derive(Debug, Clone)]
pub struct Input {
    pub op_type: OpType,
    pub content: String,
    /// Origin user-input uuid for tool-result threading.
    pub prev_uuid: Option<String>,
}

impl Input {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            op_type: OpType::UserInput,
            content: content.into(),
            prev_uuid: None,
        }
    }
}

struct ExecInner {
    queue: VecDeque<Input>,
    running: bool,
}

/// What a finished turn asks of the loop.
enum TurnFlow {
    Continue,
    /// Exit even if inputs are queued (turn limit, cancellation, fatal).
    ForcedExit,
}

pub struct Executor {
    task_uuid: String,
    agent_uuid: String,
    ctx: Arc<Context>,
    llm: Arc<dyn LlmClient>,
    bus: Arc<EventBus>,
    env: ToolEnv,
    cfg: Arc<RuntimeConfig>,
    inner: Mutex<ExecInner>,
    terminated: AtomicBool,
    state: Mutex<Option<TaskState>>,
}

impl Executor {
    pub fn new(
        ctx: Arc<Context>,
        llm: Arc<dyn LlmClient>,
        bus: Arc<EventBus>,
        env: ToolEnv,
        cfg: Arc<RuntimeConfig>,
    ) -> Self {
        let task_uuid = ctx.task_uuid();
        let agent_uuid = ctx.agent().uuid.clone();
        Self {
            task_uuid,
            agent_uuid,
            ctx,
            llm,
            bus,
            env,
            cfg,
            inner: Mutex::new(ExecInner {
                queue: VecDeque::new(),
                running: false,
            }),
            terminated: AtomicBool::new(false),
            state: Mutex::new(None),
        }
    }

    pub fn task_uuid(&self) -> &str {
        &self.task_uuid
    }

    pub fn agent_uuid(&self) -> &str {
        &self.agent_uuid
    }

    /// Current executor state; `None` until the first turn runs.
    pub fn state(&self) -> Option<TaskState> {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// Push an input and make sure the loop is alive. An enqueue clears a
    /// previous termination: any terminal state transitions back to running.
    pub fn enqueue(self: &Arc<Self>, input: Input) {
        let spawn = {
            let mut inner = self.inner.lock();
            self.terminated.store(false, Ordering::SeqCst);
            inner.queue.push_back(input);
            if inner.running {
                false
            } else {
                inner.running = true;
                true
            }
        };

        if spawn {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_loop().await });
        }
    }

    /// Cooperative cancel: raise the flag and abort in-flight LLM calls.
    /// Never blocks.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.llm.cancel(&self.task_uuid);
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: TaskState) {
        *self.state.lock() = Some(state);
        if let Err(e) = self.ctx.set_state(state) {
            tracing::error!(task = %self.task_uuid, "failed to persist state {state}: {e:?}");
            self.emit_error(&EngineError::Storage(e.to_string()));
        }
    }

    fn emit_error(&self, err: &EngineError) {
        self.bus.emit(
            topics::ERRORS,
            &self.task_uuid,
            BusPayload::Error(ErrorEvent::new(&self.task_uuid, &self.agent_uuid, err)),
        );
    }

    /// Drain every queued input, or decide how the loop ends.
    fn drain(&self, annotation_grace: &mut bool) -> Drained {
        let mut inner = self.inner.lock();
        if !inner.queue.is_empty() {
            return Drained::Inputs(inner.queue.drain(..).collect());
        }
        if *annotation_grace {
            *annotation_grace = false;
            return Drained::GraceRetry;
        }

        // Queue empty and nothing pending: a still-running state collapses
        // to completed, everything else keeps its terminal value.
        if self.state() == Some(TaskState::Running) {
            drop(inner);
            self.set_state(TaskState::Completed);
            inner = self.inner.lock();
            if !inner.queue.is_empty() {
                return Drained::Inputs(inner.queue.drain(..).collect());
            }
        }
        inner.running = false;
        Drained::Exit
    }

    /// Exit unconditionally, leaving any queued inputs for a later enqueue
    /// to revive.
    fn forced_exit(&self) {
        self.inner.lock().running = false;
    }

    async fn run_loop(self: Arc<Self>) {
        tracing::debug!(task = %self.task_uuid, agent = %self.agent_uuid, "executor loop started");

        let mut file_watcher: Option<WorkdirWatcher> = None;
        let mut turns = 0usize;
        let mut annotation_grace = false;
        let mut origin_uuid: Option<String> = None;

        loop {
            if self.is_terminated() {
                self.set_state(TaskState::Canceled);
                self.emit_error(&EngineError::Cancellation);
                self.forced_exit();
                break;
            }

            let inputs = match self.drain(&mut annotation_grace) {
                Drained::Inputs(inputs) => inputs,
                Drained::GraceRetry => {
                    tokio::time::sleep(ANNOTATION_GRACE).await;
                    continue;
                }
                Drained::Exit => break,
            };

            match self
                .run_turn(inputs, &mut file_watcher, &mut origin_uuid, &mut annotation_grace)
                .await
            {
                TurnFlow::Continue => {}
                TurnFlow::ForcedExit => {
                    self.forced_exit();
                    break;
                }
            }

            turns += 1;
            if turns >= self.cfg.max_turns && self.state() != Some(TaskState::Completed) {
                self.set_state(TaskState::Waiting);
                self.emit_error(&EngineError::TurnLimit(turns));
                self.forced_exit();
                break;
            }
        }

        drop(file_watcher);
        tracing::debug!(task = %self.task_uuid, agent = %self.agent_uuid, "executor loop exited");
    }

    async fn run_turn(
        &self,
        inputs: Vec<Input>,
        file_watcher: &mut Option<WorkdirWatcher>,
        origin_uuid: &mut Option<String>,
        annotation_grace: &mut bool,
    ) -> TurnFlow {
        self.set_state(TaskState::Running);

        // Lazy watcher acquisition; failure is non-fatal.
        if file_watcher.is_none() {
            match WorkdirWatcher::start(
                Arc::clone(&self.bus),
                self.task_uuid.clone(),
                self.env.workdir.clone(),
            ) {
                Ok(w) => *file_watcher = Some(w),
                Err(e) => {
                    tracing::warn!(task = %self.task_uuid, "no file watcher for workdir: {e}")
                }
            }
        }

        // Merge every queued input into one persisted request, labelled
        // with the op-type of the last dequeued input (a preserved design
        // choice of the original runtime).
        let message_uuid = uuid::Uuid::new_v4().to_string();
        let merged_content = inputs
            .iter()
            .map(|i| i.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let merged_op = inputs.last().map(|i| i.op_type).unwrap_or(OpType::UserInput);
        let merged_prev = inputs.iter().find_map(|i| i.prev_uuid.clone());

        if merged_op == OpType::UserInput {
            *origin_uuid = Some(message_uuid.clone());
        }

        let mut request = MessageRecord::request(&self.task_uuid, merged_op, &merged_content);
        request.uuid = message_uuid.clone();
        request.prev_uuid = merged_prev;
        if let Err(e) = self.ctx.write_message(request) {
            tracing::error!(task = %self.task_uuid, "failed to persist request: {e:?}");
            self.emit_error(&EngineError::Storage(e.to_string()));
            self.set_state(TaskState::Failed);
            return TurnFlow::ForcedExit;
        }

        // Assemble and call the model.
        let messages = match self.ctx.assemble_messages() {
            Ok(m) => m,
            Err(e) => {
                self.emit_error(&EngineError::Storage(e.to_string()));
                self.set_state(TaskState::Failed);
                return TurnFlow::ForcedExit;
            }
        };

        let reply_text = if self.cfg.stream_output {
            let bus = Arc::clone(&self.bus);
            let task_uuid = self.task_uuid.clone();
            let on_delta = move |increment_idx: u64, chunk: &str| {
                bus.emit(
                    topics::STREAM,
                    &task_uuid,
                    BusPayload::Stream {
                        increment_idx,
                        chunk: chunk.to_string(),
                    },
                );
            };
            self.llm.stream(&self.task_uuid, &messages, &on_delta).await
        } else {
            self.llm
                .respond(&self.task_uuid, &messages)
                .await
                .map(|choices| {
                    choices
                        .into_iter()
                        .next()
                        .map(|c| c.content)
                        .unwrap_or_default()
                })
        };

        let reply_text = match reply_text {
            Ok(text) => text,
            Err(LlmError::Canceled { partial }) => {
                if !partial.is_empty() {
                    let record = MessageRecord::reply(&self.task_uuid, &message_uuid, &partial);
                    if let Err(e) = self.ctx.write_message(record) {
                        tracing::error!(task = %self.task_uuid, "failed to persist partial reply: {e:?}");
                    }
                }
                self.set_state(TaskState::Canceled);
                self.emit_error(&EngineError::Cancellation);
                return TurnFlow::ForcedExit;
            }
            Err(e) => {
                // Recoverable: a later enqueue may retry, bounded by the
                // turn limit.
                self.set_state(TaskState::Failed);
                self.emit_error(&EngineError::LlmTransport(e.to_string()));
                return TurnFlow::Continue;
            }
        };

        if reply_text.trim().is_empty() {
            self.set_state(TaskState::Failed);
            self.emit_error(&EngineError::EmptyReply);
            return TurnFlow::ForcedExit;
        }

        let record = MessageRecord::reply(&self.task_uuid, &message_uuid, &reply_text);
        if let Err(e) = self.ctx.write_message(record) {
            tracing::error!(task = %self.task_uuid, "failed to persist reply: {e:?}");
            self.emit_error(&EngineError::Storage(e.to_string()));
        }

        // Parse into segments and announce each.
        let mut segments = reply::parse(&reply_text);
        for segment in &mut segments {
            segment.message_uuid = message_uuid.clone();
            segment.worker_uuid = Some(self.agent_uuid.clone());
            segment.payload = Some(Payload {
                task_uuid: self.task_uuid.clone(),
                workdir: self.env.workdir.display().to_string(),
                started_at: Utc::now(),
            });
        }

        let mut completed = false;
        let mut annotated = false;
        let mut fragments: Vec<String> = Vec::new();

        for segment in segments {
            if !segment.errors.is_empty() {
                let tags: Vec<&str> = segment.errors.iter().map(|e| e.tag.as_str()).collect();
                self.emit_error(&EngineError::Parse(format!(
                    "unknown tags in reply: {}",
                    tags.join(", ")
                )));
            }
            if segment.annotation.is_some() {
                annotated = true;
            }

            let segment = Arc::new(segment);
            self.bus.emit(
                topics::RESPOND,
                &self.task_uuid,
                BusPayload::Respond(Arc::clone(&segment)),
            );

            if self.is_terminated() {
                self.set_state(TaskState::Canceled);
                self.emit_error(&EngineError::Cancellation);
                return TurnFlow::ForcedExit;
            }

            completed = self.dispatch_segment(&segment, &mut fragments).await;

            if self.is_terminated() {
                self.set_state(TaskState::Canceled);
                self.emit_error(&EngineError::Cancellation);
                return TurnFlow::ForcedExit;
            }

            if completed {
                break;
            }
        }

        if completed {
            // Completed turns loop back to drain anything enqueued meanwhile.
            return TurnFlow::Continue;
        }

        if !fragments.is_empty() {
            let content = format!(
                "<{TOOL_RESULT_TAG}>\n{}\n</{TOOL_RESULT_TAG}>",
                fragments.join("\n")
            );
            self.set_state(TaskState::Waiting);
            let mut inner = self.inner.lock();
            inner.queue.push_front(Input {
                op_type: OpType::ToolResult,
                content,
                prev_uuid: origin_uuid.clone(),
            });
            return TurnFlow::Continue;
        }

        if annotated {
            // Pure annotation turn: stay running, give a freshly enqueued
            // input one chance to land before the loop winds down.
            *annotation_grace = true;
            return TurnFlow::Continue;
        }

        // No tool result and no annotation: the turn produced no further
        // work.
        self.set_state(TaskState::Completed);
        TurnFlow::Continue
    }

    /// Walk one segment's actions in order. Returns whether a `complete`
    /// action ended the dispatch.
    async fn dispatch_segment(&self, segment: &SuperAction, fragments: &mut Vec<String>) -> bool {
        for action in &segment.actions {
            match &action.kind {
                // Side effects delegated to the context.
                ActionKind::Memorize {
                    subject,
                    content,
                    datetime,
                } => {
                    if let Err(e) = self.ctx.memorize(subject, content, datetime) {
                        self.emit_error(&EngineError::Storage(e.to_string()));
                    }
                }
                ActionKind::Annotate { subject, context } => {
                    if let Err(e) = self.ctx.annotate(subject, context) {
                        self.emit_error(&EngineError::Storage(e.to_string()));
                    }
                }
                ActionKind::WaitTodo { uuid, time, todo } => {
                    if let Err(e) = self.ctx.wait_todo(uuid.as_deref(), time, todo) {
                        self.emit_error(&EngineError::Storage(e.to_string()));
                    }
                }

                // Terminal: stop dispatching, announce completion.
                ActionKind::Complete { content, .. } => {
                    self.set_state(TaskState::Completed);
                    self.bus.emit(
                        topics::COMPLETE,
                        &self.task_uuid,
                        BusPayload::Complete {
                            task_uuid: self.task_uuid.clone(),
                            agent_uuid: self.agent_uuid.clone(),
                            content: content.clone(),
                        },
                    );
                    return true;
                }

                // Sub-agent actions route through the coordinator, never
                // inline.
                kind if kind.is_subagent() => {
                    self.bus.emit(
                        topics::SUBTASK,
                        &self.task_uuid,
                        BusPayload::Subtask(Arc::new(SubtaskEnvelope {
                            leader_task: self.ctx.task(),
                            leader_agent: self.ctx.agent().clone(),
                            action: action.clone(),
                        })),
                    );
                }

                // Everything else executes inline; the result lands in the
                // action's own slot.
                kind => {
                    if let Some(output) = tools::dispatch_tool(kind, &self.env).await {
                        let executed = action.clone().with_result(output.into_result());
                        fragments.push(executed.to_xml());
                    }
                }
            }
        }
        false
    }
}

enum Drained {
    Inputs(Vec<Input>),
    GraceRetry,
    Exit,
}
