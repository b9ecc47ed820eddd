//! The turn orchestrator: one bounded decision loop per user turn.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use healmate_common::{
    HealmateError, ErrorKind, Result, RouteKind, ToolCallRecord, ToolCallStatus, Turn, TurnInput,
};
use healmate_llm::build_llm_client;
use healmate_memory::{
    Embedder, GroundedContext, InMemoryKnowledgeStore, InMemoryMoodRepository, KnowledgeBackend,
    KnowledgeDomain, KnowledgeStore, MemoryStore, OllamaEmbedder, QdrantKnowledgeStore,
    RetrievalComposer,
};
use healmate_tools::{
    AlmanacProvider, CachedHoroscopeProvider, EmotionClassifier, IdempotencyClass,
    LexiconClassifier, LlmEmotionClassifier, ToolContext, ToolName, ToolOutput, ToolRegistry,
    ToolRequest, ZodiacSign,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument, warn};

use crate::config::{ClassifierKind, CoordinatorConfig, OrchestratorConfig};
use crate::gateway::{FinalizeInput, ModelGateway, PromptContext, ToolOutcome, ToolResult};
use crate::keyword::{ZODIAC_FACT, keyword_route};
use crate::llm_gateway::LlmGateway;
use crate::routing::{Action, Route};

pub const HEALTH_DISCLAIMER: &str = "⚠️ 本資訊僅供參考，不能取代專業醫療診斷。";
const HEALTH_WORDS: &[&str] = &["health", "醫療", "疫苗", "病"];
const TEMPLATE_APOLOGY: &str = "抱歉，我現在無法好好整理回覆，請稍後再試一次。";

/// The user-facing result of one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnReply {
    pub turn_id: u64,
    pub reply: String,
    pub route: RouteKind,
    pub degraded: bool,
    /// Source ids of the passages the reply was grounded on.
    pub citations: Vec<String>,
    pub tool_calls: Vec<ToolCallRecord>,
}

/// A finalized turn still holding its session lock, ready to persist.
struct SealedTurn {
    _guard: OwnedMutexGuard<()>,
    turn: Turn,
    facts: Vec<(String, String)>,
}

/// Everything the actions of one routing decision produced.
struct Dispatched {
    finalize: FinalizeInput,
    records: Vec<ToolCallRecord>,
    facts: Vec<(String, String)>,
}

struct ToolSlot {
    name: ToolName,
    arguments: Value,
    required: bool,
    key: String,
    result: Option<Result<ToolOutput>>,
    latency_ms: u64,
}

type TimedResult = (Result<ToolOutput>, u64);

async fn timed<F>(fut: F) -> TimedResult
where
    F: std::future::Future<Output = Result<ToolOutput>>,
{
    let started = Instant::now();
    let result = fut.await;
    (result, started.elapsed().as_millis() as u64)
}

/// Handles turns: route, dispatch, ground, finalize, persist.
pub struct Orchestrator {
    config: OrchestratorConfig,
    gateway: Arc<dyn ModelGateway>,
    memory: Arc<MemoryStore>,
    tools: Arc<ToolRegistry>,
    retrieval: Arc<RetrievalComposer>,
    session_locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        gateway: Arc<dyn ModelGateway>,
        memory: Arc<MemoryStore>,
        tools: Arc<ToolRegistry>,
        retrieval: Arc<RetrievalComposer>,
    ) -> Self {
        Self {
            config,
            gateway,
            memory,
            tools,
            retrieval,
            session_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Wire the production collaborators from configuration.
    pub fn from_config(config: &CoordinatorConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let client = build_llm_client(&config.llm)?;
        let mut gateway =
            LlmGateway::new(client.clone()).with_max_actions(config.orchestrator.max_actions);
        if let Some(temperature) = config.llm.temperature {
            gateway = gateway.with_temperature(temperature);
        }
        if let Some(max_tokens) = config.llm.max_tokens {
            gateway = gateway.with_max_tokens(max_tokens);
        }
        let gateway = Arc::new(gateway);

        let memory = Arc::new(MemoryStore::new(config.memory_config(), gateway.clone())?);

        let embedder: Arc<dyn Embedder> = Arc::new(OllamaEmbedder::new(&config.embedding));
        let store: Arc<dyn KnowledgeStore> = match config.knowledge.backend {
            KnowledgeBackend::Memory => Arc::new(InMemoryKnowledgeStore::new()),
            KnowledgeBackend::Qdrant => Arc::new(QdrantKnowledgeStore::new(&config.knowledge)),
        };
        let retrieval = Arc::new(RetrievalComposer::new(
            embedder,
            store,
            config.retrieval.clone(),
        ));

        let classifier: Arc<dyn EmotionClassifier> = match config.tools.classifier {
            ClassifierKind::Llm => Arc::new(LlmEmotionClassifier::new(client)),
            ClassifierKind::Lexicon => Arc::new(LexiconClassifier),
        };
        let tools = Arc::new(
            ToolRegistry::new(
                Arc::new(InMemoryMoodRepository::new()),
                Arc::new(CachedHoroscopeProvider::new(AlmanacProvider)),
                classifier,
            )
            .with_timeout(Duration::from_millis(config.orchestrator.tool_timeout_ms))
            .with_retry(config.tools.retry.clone()),
        );

        info!(
            provider = %config.llm.provider,
            model = %config.llm.model,
            knowledge = ?config.knowledge.backend,
            classifier = ?config.tools.classifier,
            "Orchestrator initialized"
        );

        Ok(Self::new(
            config.orchestrator.clone(),
            gateway,
            memory,
            tools,
            retrieval,
        ))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn retrieval(&self) -> &Arc<RetrievalComposer> {
        &self.retrieval
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.session_locks.lock();
        if locks.len() > 1024 {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks.entry(session_id.to_string()).or_default().clone()
    }

    /// Answer one user turn.
    ///
    /// Turns for the same session run one at a time. The deadline covers the
    /// wait for the session lock; a turn that misses it fails with
    /// `TurnTimeout` and leaves the session window untouched.
    #[instrument(skip(self, input), fields(session_id = %input.session_id))]
    pub async fn handle_turn(&self, input: TurnInput) -> Result<TurnReply> {
        input.validate()?;

        let started = Instant::now();
        let deadline_ms = self.config.turn_deadline_ms;
        let sealed = match tokio::time::timeout(
            Duration::from_millis(deadline_ms),
            self.run_turn(&input),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(deadline_ms, "Turn deadline elapsed");
                return Err(HealmateError::TurnTimeout(deadline_ms));
            }
        };

        let SealedTurn {
            _guard,
            turn,
            facts,
        } = sealed;

        for (key, value) in &facts {
            self.memory.set_fact(&input.session_id, key, value).await?;
        }

        let reply = TurnReply {
            turn_id: turn.id,
            reply: turn.reply.clone(),
            route: turn.route,
            degraded: turn.degraded,
            citations: turn.passage_ids.clone(),
            tool_calls: turn.tool_calls.clone(),
        };
        // The next turn may start while the evicted turns are summarized.
        let pending = self.memory.push_turn(&input.session_id, turn).await?;
        drop(_guard);
        let outcome = self.memory.fold_summary(pending).await;

        info!(
            turn_id = reply.turn_id,
            route = ?reply.route,
            degraded = reply.degraded,
            tools = reply.tool_calls.len(),
            citations = reply.citations.len(),
            evicted = outcome.evicted,
            latency_ms = started.elapsed().as_millis() as u64,
            "Turn finalized"
        );
        Ok(reply)
    }

    async fn run_turn(&self, input: &TurnInput) -> Result<SealedTurn> {
        let guard = self.session_lock(&input.session_id).lock_owned().await;

        let session = self.memory.load_session(&input.session_id).await?;
        let turn_id = self.memory.reserve_turn_id(&input.session_id).await?;
        let ctx = PromptContext::build(&session, input, self.config.prompt_turns);
        debug!(turn_id, new_session = session.is_new(), "Session loaded");

        let (decision, fallback) = match self.gateway.route(&ctx).await {
            Ok(decision) => (decision, false),
            Err(e) => {
                warn!(error = %e, "Routing call failed, falling back to keyword routing");
                (keyword_route(&ctx.message, &ctx.facts), true)
            }
        };
        let route = decision.kind(fallback);
        debug!(
            route = ?route,
            confidence = decision.confidence,
            reasoning = %decision.reasoning,
            "Turn routed"
        );

        let mut degraded = fallback;
        let mut facts = Vec::new();
        if let Some(sign) = ZodiacSign::detect(&ctx.message) {
            facts.push(zodiac_fact(sign));
        }

        let (reply, tool_calls, passage_ids) = match decision.route {
            Route::Direct { reply } => (reply, Vec::new(), Vec::new()),
            Route::Actions { mut actions } => {
                if actions.len() > self.config.max_actions {
                    warn!(
                        requested = actions.len(),
                        max_actions = self.config.max_actions,
                        "Dropping actions beyond the per-turn limit"
                    );
                    actions.truncate(self.config.max_actions);
                }

                let dispatched = self.dispatch(&ctx, turn_id, actions).await?;
                degraded |= dispatched.finalize.degraded;
                facts.extend(dispatched.facts);

                let reply = match self.gateway.finalize(&ctx, &dispatched.finalize).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(error = %e, "Finalize call failed, rendering template reply");
                        degraded = true;
                        render_template(&dispatched.finalize)
                    }
                };
                let passage_ids = dispatched
                    .finalize
                    .passages
                    .iter()
                    .map(|p| p.source_id.clone())
                    .collect();
                (reply, dispatched.records, passage_ids)
            }
        };

        let turn = Turn {
            id: turn_id,
            timestamp: Utc::now(),
            user_text: input.text.clone(),
            attachments: input.attachments.clone(),
            route,
            tool_calls,
            passage_ids,
            reply: self.finish_reply(&ctx.message, &reply),
            degraded,
        };

        Ok(SealedTurn {
            _guard: guard,
            turn,
            facts,
        })
    }

    /// Run the actions of one routing decision, then the grounding
    /// follow-ups their results call for.
    async fn dispatch(
        &self,
        ctx: &PromptContext,
        turn_id: u64,
        actions: Vec<Action>,
    ) -> Result<Dispatched> {
        let tool_ctx = ToolContext::new(ctx.session_id.clone(), turn_id);

        let mut slots: Vec<ToolSlot> = Vec::new();
        let mut reads: Vec<(usize, ToolRequest)> = Vec::new();
        let mut writes: Vec<(usize, ToolRequest)> = Vec::new();
        let mut retrievals: Vec<(String, Option<KnowledgeDomain>)> = Vec::new();

        for action in actions {
            match action {
                Action::Tool {
                    name,
                    arguments,
                    required,
                } => {
                    let arguments = with_remembered_sign(name, arguments, &ctx.facts);
                    let index = slots.len();
                    let mut slot = ToolSlot {
                        name,
                        arguments: arguments.clone(),
                        required,
                        key: tool_ctx.idempotency_key(name),
                        result: None,
                        latency_ms: 0,
                    };
                    match ToolRequest::parse(name, arguments) {
                        Ok(request) => {
                            slot.arguments = request.arguments();
                            if name.idempotency() == IdempotencyClass::ReadOnly {
                                reads.push((index, request));
                            } else {
                                writes.push((index, request));
                            }
                        }
                        Err(e) => slot.result = Some(Err(e)),
                    }
                    slots.push(slot);
                }
                Action::Retrieve { query, domain } => retrievals.push((query, domain)),
            }
        }

        // Tool calls run on detached tasks: if the turn deadline drops this
        // future they still finish, and their results are discarded.
        let read_handles: Vec<_> = reads
            .into_iter()
            .map(|(index, request)| {
                let tools = self.tools.clone();
                let tool_ctx = tool_ctx.clone();
                let handle =
                    tokio::spawn(async move { timed(tools.execute(&tool_ctx, request)).await });
                (index, handle)
            })
            .collect();

        let write_indices: Vec<usize> = writes.iter().map(|(index, _)| *index).collect();
        let write_handle = (!writes.is_empty()).then(|| {
            let tools = self.tools.clone();
            let tool_ctx = tool_ctx.clone();
            tokio::spawn(async move {
                let mut results = Vec::with_capacity(writes.len());
                for (index, request) in writes {
                    results.push((index, timed(tools.execute(&tool_ctx, request)).await));
                }
                results
            })
        });

        let retrieval_handles: Vec<_> = retrievals
            .iter()
            .cloned()
            .map(|(query, domain)| {
                let composer = self.retrieval.clone();
                tokio::spawn(async move { composer.compose(&query, domain).await })
            })
            .collect();

        let (read_results, write_results, mut contexts) = tokio::join!(
            join_all(
                read_handles
                    .into_iter()
                    .map(|(index, handle)| async move { (index, handle.await) })
            ),
            async move {
                match write_handle {
                    Some(handle) => handle.await.map_err(|e| e.to_string()),
                    None => Ok(Vec::new()),
                }
            },
            async move {
                join_all(retrieval_handles)
                    .await
                    .into_iter()
                    .map(|joined| joined.unwrap_or_else(|_| GroundedContext::degraded()))
                    .collect::<Vec<_>>()
            },
        );

        for (index, joined) in read_results {
            let (result, latency_ms) = joined.unwrap_or_else(|e| {
                (Err(HealmateError::upstream("orchestrator", e.to_string())), 0)
            });
            slots[index].result = Some(result);
            slots[index].latency_ms = latency_ms;
        }
        match write_results {
            Ok(results) => {
                for (index, (result, latency_ms)) in results {
                    slots[index].result = Some(result);
                    slots[index].latency_ms = latency_ms;
                }
            }
            Err(reason) => {
                for index in write_indices {
                    slots[index].result =
                        Some(Err(HealmateError::upstream("orchestrator", reason.clone())));
                }
            }
        }

        contexts.extend(self.grounding_follow_ups(ctx, &slots, &retrievals).await);

        let mut facts = Vec::new();
        let mut records = Vec::with_capacity(slots.len());
        let mut tool_results = Vec::with_capacity(slots.len());
        let mut degraded = false;

        for slot in slots {
            let result = slot.result.unwrap_or_else(|| {
                Err(HealmateError::upstream("orchestrator", "tool call was not run"))
            });
            match result {
                Ok(output) => {
                    if let ToolOutput::Horoscope(fortune) = &output {
                        facts.push(zodiac_fact(fortune.sign));
                    }
                    records.push(ToolCallRecord {
                        tool: slot.name.as_str().to_string(),
                        arguments: slot.arguments,
                        idempotency_key: slot.key,
                        status: ToolCallStatus::Succeeded,
                        latency_ms: slot.latency_ms,
                        output: serde_json::to_value(&output).unwrap_or(Value::Null),
                        error: None,
                    });
                    tool_results.push(ToolResult {
                        tool: slot.name,
                        outcome: ToolOutcome::Succeeded { output },
                    });
                }
                Err(e) if slot.required => {
                    warn!(tool = %slot.name, error = %e, "Required tool failed, aborting turn");
                    return Err(match e.kind() {
                        ErrorKind::Validation => e,
                        _ => HealmateError::RequiredToolFailed {
                            tool: slot.name.as_str().to_string(),
                            reason: e.to_string(),
                        },
                    });
                }
                Err(e) => {
                    warn!(tool = %slot.name, error = %e, "Optional tool failed, continuing degraded");
                    degraded = true;
                    records.push(ToolCallRecord {
                        tool: slot.name.as_str().to_string(),
                        arguments: slot.arguments,
                        idempotency_key: slot.key,
                        status: ToolCallStatus::Failed,
                        latency_ms: slot.latency_ms,
                        output: Value::Null,
                        error: Some(e.to_string()),
                    });
                    tool_results.push(ToolResult {
                        tool: slot.name,
                        outcome: ToolOutcome::Failed {
                            error: e.to_string(),
                        },
                    });
                }
            }
        }

        let grounded = self.retrieval.merge(contexts);
        if grounded.degraded {
            warn!("Grounding incomplete for this turn");
            degraded = true;
        }

        Ok(Dispatched {
            finalize: FinalizeInput {
                tool_results,
                passages: grounded.passages,
                grounding: grounded.text,
                degraded,
            },
            records,
            facts,
        })
    }

    /// Card meanings after a draw, coping strategies after an emotion
    /// reading, unless the routing decision already retrieved that domain.
    async fn grounding_follow_ups(
        &self,
        ctx: &PromptContext,
        slots: &[ToolSlot],
        retrievals: &[(String, Option<KnowledgeDomain>)],
    ) -> Vec<GroundedContext> {
        let retrieved: HashSet<KnowledgeDomain> =
            retrievals.iter().filter_map(|(_, domain)| *domain).collect();
        let outputs = || slots.iter().filter_map(|s| s.result.as_ref()?.as_ref().ok());

        let tarot_query = (!retrieved.contains(&KnowledgeDomain::Tarot))
            .then(|| {
                outputs().find_map(|o| match o {
                    ToolOutput::Tarot(draw) => Some(draw.meaning_query()),
                    _ => None,
                })
            })
            .flatten();
        let coping_query = (!retrieved.contains(&KnowledgeDomain::Coping))
            .then(|| {
                outputs().find_map(|o| match o {
                    ToolOutput::Emotion(reading) => {
                        Some(format!("{} {}", reading.label.zh(), ctx.message))
                    }
                    _ => None,
                })
            })
            .flatten();

        let follow_up = |query: Option<String>, domain: KnowledgeDomain| async move {
            match query {
                Some(query) => {
                    debug!(domain = ?domain, "Running grounding follow-up");
                    Some(self.retrieval.compose(&query, Some(domain)).await)
                }
                None => None,
            }
        };

        let (tarot, coping) = tokio::join!(
            follow_up(tarot_query, KnowledgeDomain::Tarot),
            follow_up(coping_query, KnowledgeDomain::Coping),
        );
        tarot.into_iter().chain(coping).collect()
    }

    /// Append the health disclaimer when relevant and cap the length.
    fn finish_reply(&self, message: &str, reply: &str) -> String {
        let lower = message.to_lowercase();
        let disclaimer = HEALTH_WORDS
            .iter()
            .any(|w| lower.contains(w))
            .then_some(HEALTH_DISCLAIMER)
            .filter(|_| !reply.contains(HEALTH_DISCLAIMER));

        let reserve = disclaimer.map_or(0, |d| d.chars().count() + 2);
        let limit = self.config.reply_char_limit.saturating_sub(reserve);
        let mut out = truncate_chars(reply.trim(), limit).to_string();
        if let Some(disclaimer) = disclaimer {
            out.push_str("\n\n");
            out.push_str(disclaimer);
        }
        out
    }
}

fn zodiac_fact(sign: ZodiacSign) -> (String, String) {
    (ZODIAC_FACT.to_string(), sign.en().to_lowercase())
}

/// Horoscope lookups without a sign default to the remembered one.
fn with_remembered_sign(
    name: ToolName,
    arguments: Value,
    facts: &BTreeMap<String, String>,
) -> Value {
    if name != ToolName::LookupHoroscope {
        return arguments;
    }
    let Some(sign) = facts.get(ZODIAC_FACT) else {
        return arguments;
    };
    let mut arguments = match arguments {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    if !arguments.get("sign").is_some_and(|s| !s.is_null()) {
        arguments.insert("sign".to_string(), Value::String(sign.clone()));
    }
    Value::Object(arguments)
}

/// Reply rendered locally when the finalize call fails.
fn render_template(input: &FinalizeInput) -> String {
    let mut parts: Vec<String> = input
        .tool_results
        .iter()
        .filter_map(|r| r.output().map(ToolOutput::describe))
        .collect();

    if let Some(passage) = input.passages.first() {
        parts.push(format!(
            "參考資料 [{}]：{}",
            passage.source_id,
            truncate_chars(&passage.text, 200)
        ));
    }
    if parts.is_empty() {
        return TEMPLATE_APOLOGY.to_string();
    }
    if input.tool_results.iter().any(|r| r.output().is_none()) {
        parts.push("（部分服務暫時無法使用，請稍後再試。）".to_string());
    }
    parts.join("\n\n")
}

fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
