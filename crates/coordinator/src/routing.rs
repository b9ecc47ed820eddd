//! Routing decision types.

use healmate_common::RouteKind;
use healmate_memory::KnowledgeDomain;
use healmate_tools::ToolName;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One step requested by a routing decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Invoke a registered tool.
    Tool {
        name: ToolName,
        #[serde(default)]
        arguments: Value,
        /// The reply depends on this tool; its failure aborts the turn.
        #[serde(default)]
        required: bool,
    },

    /// Retrieve grounding passages, optionally restricted to one domain.
    Retrieve {
        query: String,
        #[serde(default)]
        domain: Option<KnowledgeDomain>,
    },
}

impl Action {
    pub fn tool(name: ToolName, arguments: Value) -> Self {
        Self::Tool {
            name,
            arguments,
            required: false,
        }
    }

    pub fn required_tool(name: ToolName, arguments: Value) -> Self {
        Self::Tool {
            name,
            arguments,
            required: true,
        }
    }

    pub fn retrieve(query: impl Into<String>, domain: Option<KnowledgeDomain>) -> Self {
        Self::Retrieve {
            query: query.into(),
            domain,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Route {
    /// Answer without tools or retrieval.
    Direct { reply: String },

    /// Run the listed actions, then finalize.
    Actions { actions: Vec<Action> },
}

/// The result of routing a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub route: Route,

    /// Reasoning for the decision
    pub reasoning: String,

    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,
}

impl RouteDecision {
    pub fn direct(reply: impl Into<String>) -> Self {
        Self {
            route: Route::Direct {
                reply: reply.into(),
            },
            reasoning: "Direct response, no tools needed".into(),
            confidence: 1.0,
        }
    }

    pub fn actions(actions: Vec<Action>, reasoning: impl Into<String>, confidence: f32) -> Self {
        Self {
            route: Route::Actions { actions },
            reasoning: reasoning.into(),
            confidence,
        }
    }

    /// Audit label; `fallback` marks a decision from the keyword router.
    pub fn kind(&self, fallback: bool) -> RouteKind {
        match (&self.route, fallback) {
            (_, true) => RouteKind::Fallback,
            (Route::Direct { .. }, false) => RouteKind::Direct,
            (Route::Actions { .. }, false) => RouteKind::Actions,
        }
    }

    pub fn tool_names(&self) -> Vec<ToolName> {
        match &self.route {
            Route::Direct { .. } => Vec::new(),
            Route::Actions { actions } => actions
                .iter()
                .filter_map(|a| match a {
                    Action::Tool { name, .. } => Some(*name),
                    Action::Retrieve { .. } => None,
                })
                .collect(),
        }
    }
}
