//! Built-in prompt templates per agent role
//!
//! Templates carry the placeholder set expanded by `Context::prompt`. They
//! are seeds: persisted agents keep whatever template they were saved with.

use crate::storage::AgentRole;

const COMMON_RULES: &str = r#"You operate by replying with XML-tagged actions. Rules:
- Reply with one or more action tags; prose outside tags is treated as plain output.
- Work happens under ${{WORK_PATH}} on ${{OS_NAME}} (shell: ${{SHELL_NAME}}).
- Tool results come back wrapped in a <${{TOOL_RESULT_TAG}}> message on your next turn.
- Finish with <complete><botname>you</botname><content>summary</content></complete> when done.

Available tags:
<path-list-files><path>dir</path></path-list-files>
<file-get-content><path>file</path></file-get-content>
<file-put-content><path>file</path><data>content</data></file-put-content>
<file-replace-text><path>file</path><diff>SEARCH/REPLACE blocks</diff></file-replace-text>
<execute-command><command>shell command</command></execute-command>
<start-async-cmd><session>name</session><command>long runner</command></start-async-cmd>
<query-async-cmd><session>name</session></query-async-cmd>
<abort-async-cmd><session>name</session></abort-async-cmd>
<use-mcp-tool><name>server</name><tool>tool</tool><args>json</args></use-mcp-tool>
<memorize><subject>s</subject><content>fact</content><datetime>when</datetime></memorize>
<annotate><subject>s</subject><context>progress note</context></annotate>
<wait-todo><time>cron expr</time><todo>reminder</todo></wait-todo>
<make-ask><question>q</question><options><option>a</option></options></make-ask>

Remote tools currently available:
${{MCP_TOOLS}}"#;

const LEADER_EXTRA: &str = r#"

You lead a group of sub-agents:
${{SUBAGENTS}}

Delegate with <start-subtask><sub-agent>id</sub-agent><task-desc>what</task-desc><context>background</context><require>expected output</require></start-subtask>.
Check on one with <query-subtask>, stop one with <abort-subtask>. A sub-task's
completion arrives as a tool result on a later turn; keep your own stop
condition and do not fan out more work than you can track."#;

const WORKER_EXTRA: &str = r#"

You are a sub-agent working one delegated task. Stay inside the task
description you were given and report through <complete> when the required
output is ready."#;

const DEBUG_EXTRA: &str = r#"

Narrate what you are about to do in a <thinking> tag before each action and
prefer small, verifiable steps."#;

/// Seed template for a role.
pub fn default_template(role: AgentRole) -> String {
    let extra = match role {
        AgentRole::Leader => LEADER_EXTRA,
        AgentRole::Worker => WORKER_EXTRA,
        AgentRole::Debug => DEBUG_EXTRA,
        AgentRole::Basic => "",
    };
    format!("{COMMON_RULES}{extra}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leader_template_mentions_subagent_tags() {
        let template = default_template(AgentRole::Leader);
        assert!(template.contains("start-subtask"));
        assert!(template.contains("${{SUBAGENTS}}"));
    }

    #[test]
    fn all_templates_carry_the_core_placeholders() {
        for role in [
            AgentRole::Leader,
            AgentRole::Worker,
            AgentRole::Basic,
            AgentRole::Debug,
        ] {
            let template = default_template(role);
            assert!(template.contains("${{WORK_PATH}}"));
            assert!(template.contains("${{TOOL_RESULT_TAG}}"));
            assert!(template.contains("${{MCP_TOOLS}}"));
        }
    }
}
