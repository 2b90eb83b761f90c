//! In-memory session model. The serialized form lives in [`crate::store`].

use std::collections::HashMap;

use chrono::DateTime;
use chrono::Utc;
use gateway_protocol::ContentBlock;
use gateway_protocol::Exchange;
use gateway_protocol::Role;
use gateway_protocol::SessionMode;
use gateway_protocol::SessionOptions;
use gateway_protocol::SessionState;
use serde_json::Value;
use uuid::Uuid;

/// Known agent roles carried in `agentContext`. Only `executor` changes
/// behaviour (it selects a system preamble); everything else is `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Executor,
    Planner,
    Other,
}

impl AgentRole {
    pub fn from_context(context: &HashMap<String, Value>) -> Self {
        match context.get("agentRole").and_then(Value::as_str) {
            Some("executor") => AgentRole::Executor,
            Some("planner") => AgentRole::Planner,
            _ => AgentRole::Other,
        }
    }
}

/// One agent conversation bound to one workspace.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub mode: SessionMode,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub message_history: Vec<Exchange>,
    pub options: SessionOptions,
    pub agent_context: HashMap<String, Value>,
    /// Repository URI requested at `session/new`, if any.
    pub workspace_uri: Option<String>,
    /// True once stored history has been replayed into the adapter input.
    /// Replay happens at most once per loaded session.
    pub history_replayed: bool,
}

impl Session {
    pub fn new(mode: SessionMode, options: SessionOptions, workspace_uri: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            mode,
            state: SessionState::Active,
            created_at: now,
            last_active_at: now,
            message_history: Vec::new(),
            options,
            agent_context: HashMap::new(),
            workspace_uri,
            history_replayed: false,
        }
    }

    /// Bump `last_active_at`, keeping it monotonic even if the wall clock
    /// moved backwards.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.last_active_at = now.max(self.last_active_at).max(self.created_at);
    }

    /// History is append-only for the lifetime of the session.
    pub fn append_exchange(&mut self, role: Role, content: Vec<ContentBlock>) {
        self.message_history.push(Exchange { role, content });
    }

    pub fn agent_role(&self) -> AgentRole {
        AgentRole::from_context(&self.agent_context)
    }

    /// Merge caller-supplied context (`agentRole`, `userRequest`, …) for the
    /// duration of the session. Later prompts win on key collisions.
    pub fn merge_agent_context(&mut self, context: &HashMap<String, Value>) {
        for (key, value) in context {
            self.agent_context.insert(key.clone(), value.clone());
        }
    }
}
