//! End-to-end turn-loop scenarios driven through the Manager with a
//! scripted LLM stub and the in-memory store.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use tandem_core::bus::{topics, BusEvent, BusPayload, Handler};
use tandem_core::llm::{CancelScopes, ChatMessage, Choice, LlmClient, LlmError, OnDelta};
use tandem_core::storage::{MemoryStore, Store};
use tandem_core::{
    ErrorKind, EventBus, Input, Manager, ManagerHandle, RuntimeConfig, Settings, TaskState,
};

/// Scripted LLM: pops one reply per call, optionally streaming it in
/// chunks with a delay so cancellation can land mid-stream.
struct ScriptedLlm {
    replies: Mutex<VecDeque<String>>,
    /// Served when the script runs dry (turn-limit style loops).
    repeat: Option<String>,
    chunk_delay: Option<Duration>,
    scopes: CancelScopes,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedLlm {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(ToString::to_string).collect()),
            repeat: None,
            chunk_delay: None,
            scopes: CancelScopes::new(),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn repeating(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            repeat: Some(reply.to_string()),
            chunk_delay: None,
            scopes: CancelScopes::new(),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn slow(replies: &[&str], chunk_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(ToString::to_string).collect()),
            repeat: None,
            chunk_delay: Some(chunk_delay),
            scopes: CancelScopes::new(),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn next_reply(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(messages.to_vec());
        match self.replies.lock().pop_front() {
            Some(reply) => Ok(reply),
            None => match &self.repeat {
                Some(reply) => Ok(reply.clone()),
                None => Err(LlmError::Transport("script exhausted".to_string())),
            },
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_user_content(&self) -> Option<String> {
        self.seen
            .lock()
            .last()
            .and_then(|messages| messages.last().map(|m| m.content.clone()))
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn respond(
        &self,
        _group: &str,
        messages: &[ChatMessage],
    ) -> Result<Vec<Choice>, LlmError> {
        self.next_reply(messages).map(|content| vec![Choice { content }])
    }

    async fn stream(
        &self,
        group: &str,
        messages: &[ChatMessage],
        on_delta: OnDelta<'_>,
    ) -> Result<String, LlmError> {
        let reply = self.next_reply(messages)?;
        let Some(delay) = self.chunk_delay else {
            on_delta(0, &reply);
            return Ok(reply);
        };

        // Slow mode: three chunks with a pause before each, cancellable
        // between chunks.
        let scoped = self.scopes.register(group);
        let chunk_len = reply.len().div_ceil(3).max(1);
        let chunks: Vec<&str> = {
            let mut parts = Vec::new();
            let mut rest = reply.as_str();
            while !rest.is_empty() {
                let mut cut = chunk_len.min(rest.len());
                while !rest.is_char_boundary(cut) {
                    cut += 1;
                }
                let (head, tail) = rest.split_at(cut);
                parts.push(head);
                rest = tail;
            }
            parts
        };

        let mut accumulated = String::new();
        for (idx, chunk) in chunks.iter().enumerate() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = scoped.token.cancelled() => {
                    return Err(LlmError::Canceled { partial: accumulated });
                }
            }
            on_delta(idx as u64, chunk);
            accumulated.push_str(chunk);
        }

        self.scopes.complete(&scoped);
        Ok(accumulated)
    }

    fn cancel(&self, group: &str) {
        self.scopes.cancel(group);
    }
}

/// Collects bus events of one topic for later assertions.
struct TopicProbe {
    events: Arc<Mutex<Vec<BusEvent>>>,
}

impl TopicProbe {
    fn install(bus: &EventBus, topic: &str) -> Self {
        let events: Arc<Mutex<Vec<BusEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let handler: Handler = Arc::new(move |event: BusEvent| {
            sink.lock().push(event);
        });
        bus.listen(topic, handler);
        Self { events }
    }

    fn count(&self) -> usize {
        self.events.lock().len()
    }

    fn snapshot(&self) -> Vec<BusEvent> {
        self.events.lock().clone()
    }
}

struct Harness {
    manager: Arc<Manager>,
    store: Arc<MemoryStore>,
    bus: Arc<EventBus>,
    workdir: tempfile::TempDir,
}

async fn harness(llm: Arc<dyn LlmClient>, cfg: RuntimeConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(EventBus::new());
    let manager = Manager::boot_with_llm(
        store.clone(),
        bus.clone(),
        Arc::new(cfg),
        Settings::default(),
        llm,
    )
    .await
    .expect("manager boots");
    Harness {
        manager,
        store,
        bus,
        workdir: tempfile::tempdir().expect("tempdir"),
    }
}

impl Harness {
    fn new_task(&self) -> tandem_core::Task {
        self.manager
            .init_task("test task", None, &self.workdir.path().display().to_string())
            .expect("task persists")
    }

    async fn send(&self, task: &str, agent: &str, text: &str) {
        self.manager
            .handle(Input::user(text), task, agent)
            .await
            .expect("enqueue accepted");
    }

    /// Wait until the executor reaches `state` with an idle loop.
    async fn wait_for(&self, task: &str, agent: &str, state: TaskState) {
        for _ in 0..400 {
            if let Some(executor) = self.manager.executor_for(task, agent) {
                if executor.state() == Some(state) && !executor.is_running() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let current = self
            .manager
            .executor_for(task, agent)
            .and_then(|e| e.state());
        panic!("executor never reached {state:?} (currently {current:?})");
    }
}

const COMPLETE_REPLY: &str =
    "<complete><botname>x</botname><content>ok</content></complete>";

#[tokio::test]
async fn single_turn_completion() {
    let llm = ScriptedLlm::new(&[COMPLETE_REPLY]);
    let h = harness(llm.clone(), RuntimeConfig::default()).await;
    let task = h.new_task();
    let complete_probe = TopicProbe::install(&h.bus, topics::COMPLETE);

    h.send(&task.uuid, "basic", "hi").await;
    h.wait_for(&task.uuid, "basic", TaskState::Completed).await;

    // Exactly two persisted messages: merged request and reply.
    assert_eq!(h.store.message_count(&task.uuid), 2);
    assert_eq!(llm.call_count(), 1);

    // One complete event, no follow-up enqueue.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(complete_probe.count(), 1);
    assert_eq!(h.store.message_count(&task.uuid), 2);

    let persisted = h
        .store
        .load_task(&task.uuid)
        .expect("load")
        .expect("present");
    assert_eq!(persisted.state, TaskState::Completed);
}

#[tokio::test]
async fn tool_loop_feeds_result_back() {
    let llm = ScriptedLlm::new(&[
        "<execute-command><command>echo hi</command></execute-command>",
        COMPLETE_REPLY,
    ]);
    let h = harness(llm.clone(), RuntimeConfig::default()).await;
    let task = h.new_task();

    h.send(&task.uuid, "basic", "run it").await;
    h.wait_for(&task.uuid, "basic", TaskState::Completed).await;

    // Turn count 2: user input turn, then the synthetic tool-result turn.
    assert_eq!(llm.call_count(), 2);

    // The second call's last user message is the wrapped tool result.
    let fed_back = llm.last_user_content().expect("second call recorded");
    assert!(fed_back.starts_with("<tool-result>"), "{fed_back}");
    assert!(fed_back.contains("<execute-command>"));
    assert!(fed_back.contains("<result>hi"));

    // Four rows: two requests, two replies.
    assert_eq!(h.store.message_count(&task.uuid), 4);
}

#[tokio::test]
async fn cancellation_mid_stream_persists_partial() {
    let llm = ScriptedLlm::slow(&[COMPLETE_REPLY], Duration::from_millis(250));
    let h = harness(llm.clone(), RuntimeConfig::default()).await;
    let task = h.new_task();
    let error_probe = TopicProbe::install(&h.bus, topics::ERRORS);

    h.send(&task.uuid, "basic", "hi").await;

    // Chunks land at ~250/500/750 ms; pull the plug between the second and
    // the third.
    tokio::time::sleep(Duration::from_millis(625)).await;
    h.manager
        .executor_for(&task.uuid, "basic")
        .expect("executor exists")
        .terminate();

    h.wait_for(&task.uuid, "basic", TaskState::Canceled).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Partial reply persisted alongside the request.
    let messages = h
        .store
        .recent_messages(&task.uuid, 10)
        .expect("query messages");
    assert_eq!(messages.len(), 2);
    let partial = &messages[1].respond;
    assert!(!partial.is_empty());
    assert!(partial.len() < COMPLETE_REPLY.len(), "partial: {partial}");

    // One cancellation error event.
    let cancellations: Vec<_> = error_probe
        .snapshot()
        .into_iter()
        .filter(|e| matches!(
            &e.payload,
            BusPayload::Error(err) if err.kind == ErrorKind::Cancellation
        ))
        .collect();
    assert_eq!(cancellations.len(), 1);
}

#[tokio::test]
async fn parse_tolerance_completes_with_error_entry() {
    let llm = ScriptedLlm::new(&[
        "Here is a note. <unknown-tag>foo</unknown-tag> <thinking>hmm</thinking>",
    ]);
    let h = harness(llm.clone(), RuntimeConfig::default()).await;
    let task = h.new_task();
    let respond_probe = TopicProbe::install(&h.bus, topics::RESPOND);
    let error_probe = TopicProbe::install(&h.bus, topics::ERRORS);

    h.send(&task.uuid, "basic", "hi").await;
    h.wait_for(&task.uuid, "basic", TaskState::Completed).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let responds = respond_probe.snapshot();
    assert_eq!(responds.len(), 1);
    let BusPayload::Respond(segment) = &responds[0].payload else {
        panic!("unexpected payload");
    };
    assert_eq!(segment.thinking.as_deref(), Some("hmm"));
    assert_eq!(segment.actions.len(), 1);
    assert_eq!(segment.errors.len(), 1);
    assert_eq!(segment.errors[0].tag, "unknown-tag");

    let parse_errors = error_probe
        .snapshot()
        .into_iter()
        .filter(|e| matches!(
            &e.payload,
            BusPayload::Error(err) if err.kind == ErrorKind::Parse
        ))
        .count();
    assert_eq!(parse_errors, 1);
}

#[tokio::test]
async fn subagent_fan_out_routes_completion_to_leader() {
    let llm = ScriptedLlm::new(&[
        // Leader turn 1: delegate.
        "<start-subtask><sub-agent>worker</sub-agent><task-desc>do X</task-desc></start-subtask>",
        // Worker turn: finish immediately.
        "<complete><botname>w</botname><content>done</content></complete>",
        // Leader turn 2: sees the routed result and completes.
        COMPLETE_REPLY,
    ]);
    let h = harness(llm.clone(), RuntimeConfig::default()).await;
    let task = h.new_task();
    let subtask_probe = TopicProbe::install(&h.bus, topics::SUBTASK);

    h.send(&task.uuid, "leader", "delegate this").await;

    // The leader's delegation turn has no inline result, so it rests until
    // the worker's completion is routed back and revives it; the full
    // sequence is three LLM calls (leader, worker, leader again).
    for _ in 0..400 {
        let leader_done = h
            .manager
            .executor_for(&task.uuid, "leader")
            .is_some_and(|e| e.state() == Some(TaskState::Completed) && !e.is_running());
        if llm.call_count() >= 3 && leader_done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(subtask_probe.count(), 1);
    assert_eq!(llm.call_count(), 3);

    // A subordinate task joined the leader's group.
    let group = h
        .store
        .find_tasks(Some(&task.group_id))
        .expect("group query");
    assert_eq!(group.len(), 2);
    let sub = group.iter().find(|t| t.uuid != task.uuid).expect("subtask");
    assert_eq!(sub.workdir, task.workdir);
    assert_eq!(sub.state, TaskState::Completed);

    // The leader's second turn carried the worker's output as a tool
    // result echoing the start action.
    let fed_back = llm.last_user_content().expect("leader call recorded");
    assert!(fed_back.starts_with("<tool-result>"), "{fed_back}");
    assert!(fed_back.contains("<start-subtask>"));
    assert!(fed_back.contains("<result>done</result>"));
}

#[tokio::test]
async fn pure_thinking_reply_completes_on_first_turn() {
    let llm = ScriptedLlm::new(&["<thinking>nothing to do</thinking>"]);
    let h = harness(llm.clone(), RuntimeConfig::default()).await;
    let task = h.new_task();

    h.send(&task.uuid, "basic", "hi").await;
    h.wait_for(&task.uuid, "basic", TaskState::Completed).await;
    assert_eq!(llm.call_count(), 1);
}

#[tokio::test]
async fn endless_tool_loop_hits_the_turn_limit() {
    let llm =
        ScriptedLlm::repeating("<execute-command><command>echo tick</command></execute-command>");
    let cfg = RuntimeConfig {
        max_turns: 4,
        ..RuntimeConfig::default()
    };
    let h = harness(llm.clone(), cfg).await;
    let task = h.new_task();
    let error_probe = TopicProbe::install(&h.bus, topics::ERRORS);

    h.send(&task.uuid, "basic", "loop forever").await;
    h.wait_for(&task.uuid, "basic", TaskState::Waiting).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(llm.call_count(), 4);
    let limit_errors = error_probe
        .snapshot()
        .into_iter()
        .filter(|e| matches!(
            &e.payload,
            BusPayload::Error(err) if err.kind == ErrorKind::TurnLimit
        ))
        .count();
    assert_eq!(limit_errors, 1);
}

#[tokio::test]
async fn llm_failure_parks_the_task_as_failed_and_retries_on_enqueue() {
    let llm = ScriptedLlm::new(&[]); // first call fails, script exhausted
    let h = harness(llm.clone(), RuntimeConfig::default()).await;
    let task = h.new_task();

    h.send(&task.uuid, "basic", "hi").await;
    h.wait_for(&task.uuid, "basic", TaskState::Failed).await;

    // A later enqueue revives the loop.
    {
        let mut replies = VecDeque::new();
        replies.push_back(COMPLETE_REPLY.to_string());
        // Refill the script through the shared handle.
        *llm.replies.lock() = replies;
    }
    h.send(&task.uuid, "basic", "try again").await;
    h.wait_for(&task.uuid, "basic", TaskState::Completed).await;
}

#[tokio::test]
async fn executor_is_memoised_per_task_and_agent() {
    let llm = ScriptedLlm::new(&[]);
    let h = harness(llm, RuntimeConfig::default()).await;
    let task = h.new_task();
    let agent = h.manager.query_agent("basic").expect("seeded agent");

    let (a, b) = tokio::join!(
        h.manager.get_or_build_executor(&task, &agent),
        h.manager.get_or_build_executor(&task, &agent),
    );
    let a = a.expect("builds");
    let b = b.expect("builds");
    assert!(Arc::ptr_eq(&a, &b));

    let c = h
        .manager
        .get_or_build_executor(&task, &agent)
        .await
        .expect("builds");
    assert!(Arc::ptr_eq(&a, &c));
}

#[tokio::test]
async fn annotation_only_turn_keeps_state_then_settles() {
    let llm = ScriptedLlm::new(&[
        "<annotate><subject>plan</subject><context>phase one underway</context></annotate>",
    ]);
    let h = harness(llm.clone(), RuntimeConfig::default()).await;
    let task = h.new_task();

    h.send(&task.uuid, "basic", "hi").await;
    h.wait_for(&task.uuid, "basic", TaskState::Completed).await;

    // No synthetic tool-result was enqueued for the annotation turn.
    assert_eq!(llm.call_count(), 1);
    assert_eq!(h.store.message_count(&task.uuid), 2);

    let persisted = h
        .store
        .load_task(&task.uuid)
        .expect("load")
        .expect("present");
    assert_eq!(
        persisted.annotation.as_deref(),
        Some("plan: phase one underway")
    );
}
