//! Language-model gateway boundary.

use std::collections::BTreeMap;

use async_trait::async_trait;
use healmate_common::{Attachment, Result, TurnInput};
use healmate_memory::{RetrievedPassage, Session};
use healmate_tools::{ToolName, ToolOutput};
use serde::{Deserialize, Serialize};

use crate::routing::RouteDecision;

/// One prior exchange included in a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub user: String,
    pub assistant: String,
}

/// Everything the model sees about the conversation for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptContext {
    pub session_id: String,
    pub summary: String,
    /// Oldest first.
    pub history: Vec<HistoryTurn>,
    pub facts: BTreeMap<String, String>,
    pub message: String,
    pub attachments: Vec<Attachment>,
}

impl PromptContext {
    /// Bounded context: the rolling summary, the last `prompt_turns` raw
    /// turns and the new message.
    pub fn build(session: &Session, input: &TurnInput, prompt_turns: usize) -> Self {
        Self {
            session_id: input.session_id.clone(),
            summary: session.summary.clone(),
            history: session
                .recent_turns(prompt_turns)
                .map(|t| HistoryTurn {
                    user: t.user_text.clone(),
                    assistant: t.reply.clone(),
                })
                .collect(),
            facts: session.facts.clone(),
            message: input.effective_text(),
            attachments: input.attachments.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Succeeded { output: ToolOutput },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool: ToolName,
    #[serde(flatten)]
    pub outcome: ToolOutcome,
}

impl ToolResult {
    pub fn output(&self) -> Option<&ToolOutput> {
        match &self.outcome {
            ToolOutcome::Succeeded { output } => Some(output),
            ToolOutcome::Failed { .. } => None,
        }
    }
}

/// Results folded into the finalization prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalizeInput {
    pub tool_results: Vec<ToolResult>,
    pub passages: Vec<RetrievedPassage>,
    /// Rendered `[source_id] text` blocks.
    pub grounding: String,
    /// Some grounding or tool result is missing.
    pub degraded: bool,
}

/// Route and finalize are the only two model calls a turn may make.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn route(&self, ctx: &PromptContext) -> Result<RouteDecision>;

    async fn finalize(&self, ctx: &PromptContext, input: &FinalizeInput) -> Result<String>;
}
