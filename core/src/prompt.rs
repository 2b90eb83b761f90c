//! Prompt composition: content blocks + context files + role preamble →
//! the literal text delivered to the model.

use gateway_protocol::ContentBlock;

use crate::session::AgentRole;
use crate::util::estimate_tokens;

/// Per-file byte cap when inlining context files.
pub const CONTEXT_FILE_CAP: usize = 32 * 1024;
const TRUNCATION_MARKER: &str = "…[truncated]";

/// System preamble injected when the caller marked the session as an
/// executor-role sub-agent. Other roles add none.
const EXECUTOR_PREAMBLE: &str = "You are an executor agent. Carry out the requested task \
directly and report concrete results. Prefer minimal, focused edits over broad refactors, \
and state clearly when a step cannot be completed.";

#[derive(Debug, Clone)]
pub struct ComposedPrompt {
    /// Literal prompt text, including any system preamble.
    pub text: String,
    /// Prompt text without the preamble; this is what goes on the message
    /// queue as the final user turn.
    pub body: String,
    /// System preamble alone, for backends with a separate system slot.
    pub system: Option<String>,
    pub estimated_tokens: u64,
}

/// A context file read through the sandbox, ready for inlining.
#[derive(Debug, Clone)]
pub struct ContextFile {
    pub path: String,
    pub content: String,
}

pub fn compose(
    content: &[ContentBlock],
    context_files: &[ContextFile],
    role: AgentRole,
) -> ComposedPrompt {
    let system = match role {
        AgentRole::Executor => Some(EXECUTOR_PREAMBLE.to_string()),
        AgentRole::Planner | AgentRole::Other => None,
    };

    let mut body = String::new();
    for block in content {
        match block {
            ContentBlock::Text { text } => push_paragraph(&mut body, text),
            ContentBlock::File {
                path,
                start_line,
                end_line,
                ..
            } => {
                let range = match (start_line, end_line) {
                    (Some(start), Some(end)) => format!(" (lines {start}-{end})"),
                    _ => String::new(),
                };
                push_paragraph(&mut body, &format!("[file: {path}{range}]"));
            }
            ContentBlock::Diff { path, new_text, .. } => {
                push_paragraph(&mut body, &format!("[diff for {path}]\n{new_text}"));
            }
            ContentBlock::Image { mime_type, .. } => {
                push_paragraph(&mut body, &format!("[attached image: {mime_type}]"));
            }
            ContentBlock::Thought { .. } | ContentBlock::Error { .. } => {}
        }
    }

    for file in context_files {
        let mut content = file.content.as_str();
        let mut truncated = false;
        if content.len() > CONTEXT_FILE_CAP {
            let mut cut = CONTEXT_FILE_CAP;
            while !content.is_char_boundary(cut) {
                cut -= 1;
            }
            content = &content[..cut];
            truncated = true;
        }
        let mut section = format!("\n--- {} ---\n{}", file.path, content);
        if truncated {
            section.push('\n');
            section.push_str(TRUNCATION_MARKER);
        }
        body.push_str(&section);
        body.push('\n');
    }

    let text = match &system {
        Some(preamble) => format!("{preamble}\n\n{body}"),
        None => body.clone(),
    };
    let estimated_tokens = estimate_tokens(&text);

    ComposedPrompt {
        text,
        body,
        system,
        estimated_tokens,
    }
}

fn push_paragraph(out: &mut String, text: &str) {
    if !out.is_empty() {
        out.push_str("\n\n");
    }
    out.push_str(text);
}
