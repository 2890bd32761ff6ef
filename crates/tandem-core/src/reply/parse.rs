//! Forgiving parser for the XML-like reply envelope
//!
//! A valid opening tag is `<name>` where `name` starts with an ASCII letter
//! followed by letters, digits, or hyphens. Every other `<` is text. Tag
//! names are reserved by a closed catalogue; anything tag-shaped outside it
//! becomes an error entry without aborting the parse. Closing tags are
//! located by literal substring search - tag names from input are never
//! interpolated into patterns.

use once_cell::sync::Lazy;
use regex::Regex;

use super::text::{clean_field, unescape_entities};
use super::{Action, ActionKind, Annotation, ParseIssue, SuperAction};

static OPEN_TAG: Lazy<Regex> = Lazy::new(|| {
    // Simple tags only; anything with attributes or slashes is text.
    Regex::new(r"<([A-Za-z][A-Za-z0-9-]*)>").expect("valid open-tag regex")
});

const KNOWN_TAGS: &[&str] = &[
    "thinking",
    "think",
    "datetime",
    "memorize",
    "annotate",
    "wait-todo",
    "make-ask",
    "complete",
    "user-input",
    "tool-result",
    "path-list-files",
    "file-get-content",
    "file-put-content",
    "file-replace-text",
    "execute-command",
    "start-async-cmd",
    "query-async-cmd",
    "abort-async-cmd",
    "start-subtask",
    "query-subtask",
    "abort-subtask",
    "use-mcp-tool",
    "use-builtin-tool",
];

/// Parse a raw reply into its `SuperAction` segments, one per `datetime`
/// block (plus one per `user-input` boundary). An empty or blank input
/// yields no segments.
pub fn parse(input: &str) -> Vec<SuperAction> {
    let input = strip_code_fences(input);
    let mut segments: Vec<SuperAction> = Vec::new();
    let mut current = SuperAction::default();
    let mut segment_start = 0usize;
    let mut prose = String::new();
    let mut tag_seen = false;
    let mut pos = 0usize;

    let mut flush =
        |current: &mut SuperAction, segments: &mut Vec<SuperAction>, start: usize, end: usize| {
            if !current.is_empty() {
                current.origin_text = input[start..end].trim().to_string();
                segments.push(std::mem::take(current));
            } else {
                *current = SuperAction::default();
            }
        };

    while let Some(found) = OPEN_TAG.find_at(&input, pos) {
        let name = &input[found.start() + 1..found.end() - 1];

        if !tag_seen {
            prose.push_str(&input[pos..found.start()]);
        }

        // First tag-shaped token: leading prose becomes a tool-result
        // action carrying that text.
        if !tag_seen {
            tag_seen = true;
            let lead = prose.trim();
            if !lead.is_empty() {
                current.actions.push(Action::new(ActionKind::ToolResult {
                    content: lead.to_string(),
                }));
            }
            prose.clear();
        }

        if !KNOWN_TAGS.contains(&name) {
            current.errors.push(ParseIssue {
                tag: name.to_string(),
                message: format!("unknown tag: {name}"),
            });
            // Skip the whole element when it closes, otherwise just the tag.
            pos = match find_close(&input, found.end(), name) {
                Some((_, after)) => after,
                None => found.end(),
            };
            continue;
        }

        let (inner, after) = match find_close(&input, found.end(), name) {
            Some((close_start, after)) => (&input[found.end()..close_start], after),
            // Unclosed structure: inner text runs to end of input.
            None => (&input[found.end()..], input.len()),
        };

        match name {
            "thinking" | "think" => {
                let thought = clean_field(inner);
                match &mut current.thinking {
                    Some(existing) => {
                        existing.push('\n');
                        existing.push_str(&thought);
                    }
                    None => current.thinking = Some(thought),
                }
            }
            "datetime" => {
                flush(&mut current, &mut segments, segment_start, found.start());
                segment_start = found.start();
                current.datetime = Some(inner.trim().to_string());
            }
            "user-input" => {
                // Never merged with a preceding response segment.
                flush(&mut current, &mut segments, segment_start, found.start());
                segment_start = found.start();
                current.actions.push(parse_user_input(inner));
            }
            _ => {
                let action = parse_action(name, inner, &mut current);
                current.actions.push(action);
            }
        }

        pos = after;
    }

    if !tag_seen {
        prose.push_str(&input[pos..]);
        let lead = prose.trim();
        if !lead.is_empty() {
            current.actions.push(Action::new(ActionKind::ToolResult {
                content: lead.to_string(),
            }));
        }
    }

    flush(&mut current, &mut segments, segment_start, input.len());
    segments
}

/// Locate the matching `</name>` at or after `from`. Returns the byte range
/// (start of the close tag, first byte after it).
fn find_close(input: &str, from: usize, name: &str) -> Option<(usize, usize)> {
    let close = format!("</{name}>");
    input[from..]
        .find(&close)
        .map(|rel| (from + rel, from + rel + close.len()))
}

/// First occurrence of a child tag's inner text within an action body.
fn child(inner: &str, name: &str) -> Option<String> {
    let open = format!("<{name}>");
    let start = inner.find(&open)? + open.len();
    match find_close(inner, start, name) {
        Some((close_start, _)) => Some(inner[start..close_start].to_string()),
        None => Some(inner[start..].to_string()),
    }
}

/// Every occurrence of a child tag's inner text, in order.
fn children(inner: &str, name: &str) -> Vec<String> {
    let open = format!("<{name}>");
    let mut out = Vec::new();
    let mut pos = 0usize;
    while let Some(rel) = inner[pos..].find(&open) {
        let start = pos + rel + open.len();
        match find_close(inner, start, name) {
            Some((close_start, after)) => {
                out.push(inner[start..close_start].to_string());
                pos = after;
            }
            None => {
                out.push(inner[start..].to_string());
                break;
            }
        }
    }
    out
}

/// A child field that is entity-unescaped and dedented.
fn cleaned(inner: &str, name: &str) -> String {
    child(inner, name).map(|v| clean_field(&v)).unwrap_or_default()
}

/// A plain child field (trimmed, entities unescaped).
fn plain(inner: &str, name: &str) -> String {
    child(inner, name)
        .map(|v| unescape_entities(v.trim()))
        .unwrap_or_default()
}

/// Single-field tags accept either a named child or the bare inner text.
fn child_or_inner(inner: &str, name: &str, clean: bool) -> String {
    match child(inner, name) {
        Some(v) if !v.trim().is_empty() => {
            if clean {
                clean_field(&v)
            } else {
                unescape_entities(v.trim())
            }
        }
        _ => {
            if clean {
                clean_field(inner)
            } else {
                unescape_entities(inner.trim())
            }
        }
    }
}

fn parse_user_input(inner: &str) -> Action {
    let content = child_or_inner(inner, "content", true);
    let uploads = children(inner, "upload")
        .into_iter()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .collect();
    Action::new(ActionKind::UserInput { content, uploads })
}

fn parse_action(name: &str, inner: &str, current: &mut SuperAction) -> Action {
    let kind = match name {
        "memorize" => ActionKind::Memorize {
            subject: plain(inner, "subject"),
            content: cleaned(inner, "content"),
            datetime: plain(inner, "datetime"),
        },
        "annotate" => {
            let annotation = Annotation {
                subject: plain(inner, "subject"),
                context: cleaned(inner, "context"),
            };
            current.annotation = Some(annotation.clone());
            ActionKind::Annotate {
                subject: annotation.subject,
                context: annotation.context,
            }
        }
        "wait-todo" => ActionKind::WaitTodo {
            uuid: child(inner, "uuid").map(|u| u.trim().to_string()).filter(|u| !u.is_empty()),
            time: plain(inner, "time"),
            todo: cleaned(inner, "todo"),
        },
        "make-ask" => {
            let options_block = child(inner, "options").unwrap_or_default();
            ActionKind::MakeAsk {
                question: plain(inner, "question"),
                multiple: matches!(
                    plain(inner, "multiple").to_ascii_lowercase().as_str(),
                    "true" | "yes" | "1"
                ),
                options: children(&options_block, "option")
                    .into_iter()
                    .map(|o| unescape_entities(o.trim()))
                    .collect(),
            }
        }
        "complete" => ActionKind::Complete {
            botname: plain(inner, "botname"),
            content: child_or_inner(inner, "content", true),
        },
        "tool-result" => ActionKind::ToolResult {
            content: child_or_inner(inner, "content", true),
        },
        "path-list-files" => ActionKind::ListFiles {
            path: child_or_inner(inner, "path", false),
        },
        "file-get-content" => ActionKind::GetContent {
            path: child_or_inner(inner, "path", false),
        },
        "file-put-content" => ActionKind::PutContent {
            path: plain(inner, "path"),
            data: cleaned(inner, "data"),
        },
        "file-replace-text" => ActionKind::ReplaceText {
            path: plain(inner, "path"),
            diff: cleaned(inner, "diff"),
        },
        "execute-command" => ActionKind::ExecuteCommand {
            command: child_or_inner(inner, "command", true),
        },
        "start-async-cmd" => ActionKind::StartAsyncCmd {
            session: plain(inner, "session"),
            command: cleaned(inner, "command"),
        },
        "query-async-cmd" => ActionKind::QueryAsyncCmd {
            session: child_or_inner(inner, "session", false),
        },
        "abort-async-cmd" => ActionKind::AbortAsyncCmd {
            session: child_or_inner(inner, "session", false),
        },
        "start-subtask" => ActionKind::StartSubtask {
            sub_agent: plain(inner, "sub-agent"),
            task_desc: plain(inner, "task-desc"),
            context: cleaned(inner, "context"),
            require: plain(inner, "require"),
        },
        "query-subtask" => ActionKind::QuerySubtask {
            sub_agent: child_or_inner(inner, "sub-agent", false),
        },
        "abort-subtask" => ActionKind::AbortSubtask {
            sub_agent: child_or_inner(inner, "sub-agent", false),
        },
        "use-mcp-tool" => ActionKind::UseMcpTool {
            desc: plain(inner, "desc"),
            server: plain(inner, "name"),
            tool: plain(inner, "tool"),
            args: cleaned(inner, "args"),
        },
        "use-builtin-tool" => ActionKind::UseBuiltinTool {
            desc: plain(inner, "desc"),
            tool: plain(inner, "tool"),
            args: cleaned(inner, "args"),
        },
        // KNOWN_TAGS and this match are kept in lockstep; thinking/datetime/
        // user-input are handled by the caller.
        other => {
            current.errors.push(ParseIssue {
                tag: other.to_string(),
                message: format!("unhandled tag: {other}"),
            });
            ActionKind::ToolResult {
                content: String::new(),
            }
        }
    };

    let mut action = Action::new(kind);
    if let Some(result) = child(inner, "result") {
        action.result = Some(clean_field(&result));
    }
    action
}

/// Drop ```xml fence lines so fenced replies parse like bare ones.
fn strip_code_fences(input: &str) -> String {
    if !input.contains("```") {
        return input.to_string();
    }
    input
        .lines()
        .filter(|line| {
            let t = line.trim();
            t != "```" && t != "```xml"
        })
        .collect::<Vec<_>>()
        .join("\n")
}
