//! Parsed form of an LLM reply
//!
//! The reply grammar is a forgiving XML-like envelope. Parsing produces one
//! `SuperAction` per `datetime` segment; each holds an ordered list of
//! `Action`s plus reply metadata. Actions re-serialise to XML (`to_xml`)
//! such that parse ∘ serialise round-trips, which is also how tool results
//! are rendered back into the next turn's input.

use chrono::{DateTime, Utc};
use serde::Serialize;

pub mod parse;
pub mod text;

pub use parse::parse;
pub use text::{clean_field, dedent, escape_entities, unescape_entities};

/// Tag wrapped around the synthetic input fed back after dispatch.
pub const TOOL_RESULT_TAG: &str = "tool-result";

/// One tool invocation (or meta directive) parsed out of a reply.
///
/// Every action owns a slot for its execution result; dispatch never
/// touches a sibling's slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
    pub kind: ActionKind,
    pub result: Option<String>,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self { kind, result: None }
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    /// Serialise back to the reply grammar, including the result slot when
    /// present. This rendering is what the next turn's tool-result input
    /// carries.
    pub fn to_xml(&self) -> String {
        let tag = self.kind.tag();
        let mut body = String::new();

        match &self.kind {
            ActionKind::Memorize {
                subject,
                content,
                datetime,
            } => {
                push_field(&mut body, "subject", subject);
                push_field(&mut body, "content", content);
                push_field(&mut body, "datetime", datetime);
            }
            ActionKind::Annotate { subject, context } => {
                push_field(&mut body, "subject", subject);
                push_field(&mut body, "context", context);
            }
            ActionKind::WaitTodo { uuid, time, todo } => {
                if let Some(uuid) = uuid {
                    push_field(&mut body, "uuid", uuid);
                }
                push_field(&mut body, "time", time);
                push_field(&mut body, "todo", todo);
            }
            ActionKind::MakeAsk {
                question,
                multiple,
                options,
            } => {
                push_field(&mut body, "question", question);
                if *multiple {
                    push_field(&mut body, "multiple", "true");
                }
                if !options.is_empty() {
                    body.push_str("<options>\n");
                    for option in options {
                        body.push_str("<option>");
                        body.push_str(&escape_entities(option));
                        body.push_str("</option>\n");
                    }
                    body.push_str("</options>\n");
                }
            }
            ActionKind::Complete { botname, content } => {
                push_field(&mut body, "botname", botname);
                push_field(&mut body, "content", content);
            }
            ActionKind::UserInput { content, uploads } => {
                push_field(&mut body, "content", content);
                for upload in uploads {
                    push_field(&mut body, "upload", upload);
                }
            }
            ActionKind::ToolResult { content } => {
                body.push_str(&escape_entities(content));
                body.push('\n');
            }
            ActionKind::ListFiles { path } => push_field(&mut body, "path", path),
            ActionKind::GetContent { path } => push_field(&mut body, "path", path),
            ActionKind::PutContent { path, data } => {
                push_field(&mut body, "path", path);
                push_field(&mut body, "data", data);
            }
            ActionKind::ReplaceText { path, diff } => {
                push_field(&mut body, "path", path);
                push_field(&mut body, "diff", diff);
            }
            ActionKind::ExecuteCommand { command } => push_field(&mut body, "command", command),
            ActionKind::StartAsyncCmd { session, command } => {
                push_field(&mut body, "session", session);
                push_field(&mut body, "command", command);
            }
            ActionKind::QueryAsyncCmd { session } => push_field(&mut body, "session", session),
            ActionKind::AbortAsyncCmd { session } => push_field(&mut body, "session", session),
            ActionKind::StartSubtask {
                sub_agent,
                task_desc,
                context,
                require,
            } => {
                push_field(&mut body, "sub-agent", sub_agent);
                push_field(&mut body, "task-desc", task_desc);
                push_field(&mut body, "context", context);
                push_field(&mut body, "require", require);
            }
            ActionKind::QuerySubtask { sub_agent } => push_field(&mut body, "sub-agent", sub_agent),
            ActionKind::AbortSubtask { sub_agent } => push_field(&mut body, "sub-agent", sub_agent),
            ActionKind::UseMcpTool {
                desc,
                server,
                tool,
                args,
            } => {
                push_field(&mut body, "desc", desc);
                push_field(&mut body, "name", server);
                push_field(&mut body, "tool", tool);
                push_field(&mut body, "args", args);
            }
            ActionKind::UseBuiltinTool { desc, tool, args } => {
                push_field(&mut body, "desc", desc);
                push_field(&mut body, "tool", tool);
                push_field(&mut body, "args", args);
            }
        }

        if let Some(result) = &self.result {
            body.push_str("<result>");
            body.push_str(&escape_entities(result));
            body.push_str("</result>\n");
        }

        format!("<{tag}>\n{body}</{tag}>")
    }
}

fn push_field(body: &mut String, name: &str, value: &str) {
    if value.is_empty() {
        return;
    }
    body.push('<');
    body.push_str(name);
    body.push('>');
    body.push_str(&escape_entities(value));
    body.push_str("</");
    body.push_str(name);
    body.push_str(">\n");
}

/// Closed catalogue of action tags.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ActionKind {
    Memorize {
        subject: String,
        content: String,
        datetime: String,
    },
    Annotate {
        subject: String,
        context: String,
    },
    WaitTodo {
        uuid: Option<String>,
        time: String,
        todo: String,
    },
    MakeAsk {
        question: String,
        multiple: bool,
        options: Vec<String>,
    },
    Complete {
        botname: String,
        content: String,
    },
    UserInput {
        content: String,
        uploads: Vec<String>,
    },
    ToolResult {
        content: String,
    },
    #[serde(rename = "path-list-files")]
    ListFiles {
        path: String,
    },
    #[serde(rename = "file-get-content")]
    GetContent {
        path: String,
    },
    #[serde(rename = "file-put-content")]
    PutContent {
        path: String,
        data: String,
    },
    #[serde(rename = "file-replace-text")]
    ReplaceText {
        path: String,
        diff: String,
    },
    ExecuteCommand {
        command: String,
    },
    StartAsyncCmd {
        session: String,
        command: String,
    },
    QueryAsyncCmd {
        session: String,
    },
    AbortAsyncCmd {
        session: String,
    },
    StartSubtask {
        sub_agent: String,
        task_desc: String,
        context: String,
        require: String,
    },
    QuerySubtask {
        sub_agent: String,
    },
    AbortSubtask {
        sub_agent: String,
    },
    UseMcpTool {
        desc: String,
        server: String,
        tool: String,
        args: String,
    },
    UseBuiltinTool {
        desc: String,
        tool: String,
        args: String,
    },
}

impl ActionKind {
    /// The canonical tag name.
    pub fn tag(&self) -> &'static str {
        match self {
            ActionKind::Memorize { .. } => "memorize",
            ActionKind::Annotate { .. } => "annotate",
            ActionKind::WaitTodo { .. } => "wait-todo",
            ActionKind::MakeAsk { .. } => "make-ask",
            ActionKind::Complete { .. } => "complete",
            ActionKind::UserInput { .. } => "user-input",
            ActionKind::ToolResult { .. } => "tool-result",
            ActionKind::ListFiles { .. } => "path-list-files",
            ActionKind::GetContent { .. } => "file-get-content",
            ActionKind::PutContent { .. } => "file-put-content",
            ActionKind::ReplaceText { .. } => "file-replace-text",
            ActionKind::ExecuteCommand { .. } => "execute-command",
            ActionKind::StartAsyncCmd { .. } => "start-async-cmd",
            ActionKind::QueryAsyncCmd { .. } => "query-async-cmd",
            ActionKind::AbortAsyncCmd { .. } => "abort-async-cmd",
            ActionKind::StartSubtask { .. } => "start-subtask",
            ActionKind::QuerySubtask { .. } => "query-subtask",
            ActionKind::AbortSubtask { .. } => "abort-subtask",
            ActionKind::UseMcpTool { .. } => "use-mcp-tool",
            ActionKind::UseBuiltinTool { .. } => "use-builtin-tool",
        }
    }

    /// Side effects delegated to `Context` (memorize / annotate / wait-todo).
    pub fn is_side_effect(&self) -> bool {
        matches!(
            self,
            ActionKind::Memorize { .. } | ActionKind::Annotate { .. } | ActionKind::WaitTodo { .. }
        )
    }

    /// Sub-agent actions routed through the coordinator, never inline.
    pub fn is_subagent(&self) -> bool {
        matches!(
            self,
            ActionKind::StartSubtask { .. }
                | ActionKind::QuerySubtask { .. }
                | ActionKind::AbortSubtask { .. }
        )
    }

    /// Boundary markers carried in transcripts, not executable.
    pub fn is_boundary(&self) -> bool {
        matches!(
            self,
            ActionKind::UserInput { .. } | ActionKind::ToolResult { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionKind::Complete { .. })
    }
}

/// A parse problem attached to the reply; never aborts parsing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParseIssue {
    pub tag: String,
    pub message: String,
}

/// Context annotation extracted from an `annotate` tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Annotation {
    pub subject: String,
    pub context: String,
}

/// Dispatch-time payload attached just before tool execution.
#[derive(Debug, Clone, Serialize)]
pub struct Payload {
    pub task_uuid: String,
    pub workdir: String,
    pub started_at: DateTime<Utc>,
}

/// The parsed form of one LLM reply segment.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SuperAction {
    pub origin_text: String,
    pub datetime: Option<String>,
    pub thinking: Option<String>,
    pub message_uuid: String,
    pub worker_uuid: Option<String>,
    pub actions: Vec<Action>,
    pub annotation: Option<Annotation>,
    pub errors: Vec<ParseIssue>,
    pub payload: Option<Payload>,
}

impl SuperAction {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
            && self.thinking.is_none()
            && self.datetime.is_none()
            && self.annotation.is_none()
            && self.errors.is_empty()
    }

    /// Re-serialise the action list in order.
    pub fn actions_to_xml(&self) -> String {
        self.actions
            .iter()
            .map(Action::to_xml)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
