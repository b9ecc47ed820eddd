//! Turn orchestrator for HealMate.
//!
//! The orchestrator is the central loop that, for every user turn:
//! 1. Loads the session's bounded memory
//! 2. Asks the model gateway for one routing decision
//! 3. Dispatches tool calls and retrievals (reads in parallel, writes in order)
//! 4. Asks the gateway once more to phrase a grounded reply
//! 5. Appends the finished turn to the session window
//!
//! When the routing call fails the deterministic keyword router takes over;
//! when the finalize call fails a template reply is rendered from the tool
//! results. Either way the turn is marked degraded.
//!
//! # Architecture
//!
//! ```text
//! TurnInput
//!      │
//!      ▼
//! ┌─────────────────┐   route()    ┌──────────────┐
//! │  Orchestrator   │ ───────────► │ ModelGateway │ ◄── keyword_route
//! │  (this crate)   │ ◄─────────── │              │     on failure
//! └────────┬────────┘  finalize()  └──────────────┘
//!          │
//!    ┌─────┴────────┬──────────────┐
//!    ▼              ▼              ▼
//! [ToolRegistry] [Retrieval]   [MemoryStore]
//!  mood, tarot,   tarot &       window +
//!  horoscope,     coping        summary
//!  emotion        passages
//! ```

pub mod config;
pub mod gateway;
pub mod keyword;
pub mod llm_gateway;
pub mod orchestrator;
pub mod routing;

pub use config::{ClassifierKind, CoordinatorConfig, OrchestratorConfig, ToolsConfig};
pub use gateway::{FinalizeInput, HistoryTurn, ModelGateway, PromptContext, ToolOutcome, ToolResult};
pub use keyword::{FALLBACK_REPLY, ZODIAC_FACT, keyword_route};
pub use llm_gateway::LlmGateway;
pub use orchestrator::{HEALTH_DISCLAIMER, Orchestrator, TurnReply};
pub use routing::{Action, Route, RouteDecision};
