//! The planner: a bounded think→act→observe loop.
//!
//! One [`Planner::run`] call owns all per-run state in a `PlannerRun`
//! value, so concurrent users can never bleed into each other. Three
//! budgets bound every run: an iteration cap, a total tool-call cap, and a
//! wall-clock watchdog around the whole loop.

use crate::directive::{
    EMPTY_PLAN_PLACEHOLDER, FAILURE_NOTICE, SYNTHESIS_INSTRUCTION, SYSTEM_DIRECTIVE,
};
use crate::truncate::truncate_payload;
use chrono::Utc;
use ferroclaw_core::bridge::{Bridge, BridgeRequest, Plan, PlannedCall, ToolDeclaration};
use ferroclaw_core::error::{BridgeError, ToolCallError};
use ferroclaw_core::event::{DomainEvent, EventBus};
use ferroclaw_core::message::{Role, ToolRecord, Transcript, TranscriptEntry};
use ferroclaw_core::tool::{ToolBroker, ToolCall, ToolCallId};
use ferroclaw_store::{ConversationStore, MessageMetadata, ToolCallSummary};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Budgets and knobs for the loop.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Maximum planning iterations per run
    pub max_iterations: u32,

    /// Maximum tool calls dispatched per run, across all iterations
    pub max_tool_calls: u32,

    /// Wall-clock bound on the whole loop
    pub wall_clock: Duration,

    /// Deadline for each individual tool call
    pub per_call_timeout: Duration,

    /// How many recent messages to hydrate into the transcript
    pub history_window: usize,

    /// Array clipping threshold for tool payloads fed to the model
    pub max_result_items: usize,

    /// Generation temperature
    pub temperature: f32,

    /// Output token cap passed to the bridge
    pub max_output_tokens: Option<u32>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            max_tool_calls: 30,
            wall_clock: Duration::from_secs(90),
            per_call_timeout: Duration::from_secs(30),
            history_window: 10,
            max_result_items: 10,
            temperature: 0.7,
            max_output_tokens: None,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    /// The model produced a final answer
    Done,
    /// The wall-clock watchdog fired
    TimedOut,
    /// The iteration budget ran out
    BudgetExhausted,
    /// Unrecoverable bridge failure
    Aborted,
}

impl TerminalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalState::Done => "done",
            TerminalState::TimedOut => "timed_out",
            TerminalState::BudgetExhausted => "budget_exhausted",
            TerminalState::Aborted => "aborted",
        }
    }
}

/// What the host gets back from one run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub session_id: String,
    pub assistant_text: String,
    pub tool_calls_made: Vec<ToolCallSummary>,
    pub terminal_state: TerminalState,
    pub iterations: u32,
}

/// All per-run state, created fresh for every `run` call.
struct PlannerRun {
    session_id: String,
    user_key: String,
    transcript: Transcript,
    iterations: u32,
    dispatched: u32,
    malformed_plan_seen: bool,
    tool_calls_made: Vec<ToolCallSummary>,
}

impl PlannerRun {
    fn new(session_id: String, user_key: String) -> Self {
        Self {
            session_id,
            user_key,
            transcript: Transcript::new(),
            iterations: 0,
            dispatched: 0,
            malformed_plan_seen: false,
            tool_calls_made: Vec::new(),
        }
    }
}

enum DriveEnd {
    Done(String),
    BudgetExhausted,
    TimedOut,
    Aborted,
}

enum PlanStep {
    Decided(Plan),
    FeedbackGiven,
    Abort,
}

/// The agentic loop over bridge, broker, and store.
pub struct Planner {
    bridge: Arc<dyn Bridge>,
    broker: Arc<dyn ToolBroker>,
    store: Arc<ConversationStore>,
    events: Arc<EventBus>,
    config: PlannerConfig,
}

impl Planner {
    pub fn new(
        bridge: Arc<dyn Bridge>,
        broker: Arc<dyn ToolBroker>,
        store: Arc<ConversationStore>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            bridge,
            broker,
            store,
            events,
            config: PlannerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PlannerConfig) -> Self {
        self.config = config;
        self
    }

    /// Turn one user utterance into a final assistant response.
    ///
    /// Never fails from the host's point of view: every internal error
    /// degrades to a polite assistant message plus a terminal state.
    pub async fn run(&self, user_key: &str, user_text: &str) -> RunOutcome {
        let now = Utc::now();
        let session_id = match self.store.open_or_reuse_session(user_key, now).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "session lookup failed, using ephemeral session");
                format!("ephemeral-{}", now.timestamp_micros())
            }
        };

        info!(
            user_key,
            session_id = %session_id,
            "planner run started"
        );

        let mut run = PlannerRun::new(session_id, user_key.to_string());

        // Context hydration; a read failure degrades to "no history".
        match self
            .store
            .recent(user_key, self.config.history_window)
            .await
        {
            Ok(history) => {
                for message in history {
                    match message.role {
                        Role::User => run
                            .transcript
                            .push(TranscriptEntry::user(&message.content)),
                        Role::Assistant => run
                            .transcript
                            .push(TranscriptEntry::assistant(&message.content)),
                        // Internal tool rows are not replayed to the model.
                        Role::Tool => {}
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "history hydration failed, continuing without history");
            }
        }

        run.transcript.push(TranscriptEntry::user(user_text));
        self.persist(
            &run.session_id,
            user_key,
            Role::User,
            user_text,
            MessageMetadata::default(),
        )
        .await;

        // One catalog snapshot per run: catalog changes mid-run affect only
        // subsequent runs.
        let declarations = self.broker.catalog().declarations();

        let end = match tokio::time::timeout(
            self.config.wall_clock,
            self.drive(&mut run, &declarations),
        )
        .await
        {
            Ok(end) => end,
            Err(_) => {
                warn!(
                    session_id = %run.session_id,
                    "wall-clock budget exhausted, dropping in-flight calls"
                );
                DriveEnd::TimedOut
            }
        };

        let (terminal_state, assistant_text) = match end {
            DriveEnd::Done(text) => (TerminalState::Done, text),
            DriveEnd::Aborted => (TerminalState::Aborted, FAILURE_NOTICE.to_string()),
            DriveEnd::BudgetExhausted => {
                (TerminalState::BudgetExhausted, self.synthesize(&run).await)
            }
            DriveEnd::TimedOut => (TerminalState::TimedOut, self.synthesize(&run).await),
        };

        let metadata = MessageMetadata {
            tool_calls: run.tool_calls_made.clone(),
            ..Default::default()
        };
        self.persist(
            &run.session_id,
            user_key,
            Role::Assistant,
            &assistant_text,
            metadata,
        )
        .await;

        self.events.publish(DomainEvent::RunFinished {
            session_id: run.session_id.clone(),
            terminal_state: terminal_state.as_str().to_string(),
            iterations: run.iterations,
            tool_calls: run.dispatched,
            timestamp: Utc::now(),
        });

        info!(
            session_id = %run.session_id,
            state = terminal_state.as_str(),
            iterations = run.iterations,
            tool_calls = run.dispatched,
            "planner run finished"
        );

        RunOutcome {
            session_id: run.session_id,
            assistant_text,
            tool_calls_made: run.tool_calls_made,
            terminal_state,
            iterations: run.iterations,
        }
    }

    async fn drive(&self, run: &mut PlannerRun, declarations: &[ToolDeclaration]) -> DriveEnd {
        loop {
            if run.iterations >= self.config.max_iterations {
                info!(
                    session_id = %run.session_id,
                    iterations = run.iterations,
                    "iteration budget exhausted"
                );
                return DriveEnd::BudgetExhausted;
            }
            run.iterations += 1;
            debug!(
                session_id = %run.session_id,
                iteration = run.iterations,
                "planning step"
            );

            let plan = match self.plan_step(run, declarations).await {
                PlanStep::Decided(plan) => plan,
                PlanStep::FeedbackGiven => continue,
                PlanStep::Abort => return DriveEnd::Aborted,
            };

            match plan {
                // No tool calls and no text is an implicit empty final.
                Plan::Final(text) if text.trim().is_empty() => {
                    return DriveEnd::Done(EMPTY_PLAN_PLACEHOLDER.to_string());
                }
                Plan::Final(text) => return DriveEnd::Done(text),
                Plan::ToolCalls(calls) => {
                    run.transcript
                        .push(TranscriptEntry::assistant_calls(calls.clone()));
                    self.execute(run, calls).await;
                }
            }
        }
    }

    /// One bridge consultation, with the per-iteration retry policy:
    /// transient failures get exactly one retry, a first malformed plan is
    /// fed back to the model, and anything after that aborts the run.
    async fn plan_step(&self, run: &mut PlannerRun, declarations: &[ToolDeclaration]) -> PlanStep {
        match self
            .bridge
            .plan(self.request_for(run, declarations))
            .await
        {
            Ok(plan) => PlanStep::Decided(plan),
            Err(BridgeError::MalformedPlan(detail)) => {
                if run.malformed_plan_seen {
                    warn!(
                        session_id = %run.session_id,
                        detail = %detail,
                        "second malformed plan, aborting run"
                    );
                    return PlanStep::Abort;
                }
                run.malformed_plan_seen = true;
                debug!(
                    session_id = %run.session_id,
                    detail = %detail,
                    "malformed plan, feeding validation failure back to the model"
                );
                let note = serde_json::json!({
                    "error": {
                        "kind": "MalformedPlan",
                        "message": format!("your last plan was invalid: {detail}"),
                    }
                });
                run.transcript.push(TranscriptEntry::tool_note(note.to_string()));
                PlanStep::FeedbackGiven
            }
            Err(e) => {
                warn!(
                    session_id = %run.session_id,
                    error = %e,
                    "model call failed, retrying once"
                );
                match self
                    .bridge
                    .plan(self.request_for(run, declarations))
                    .await
                {
                    Ok(plan) => PlanStep::Decided(plan),
                    Err(e) => {
                        warn!(
                            session_id = %run.session_id,
                            error = %e,
                            "model call failed again, aborting run"
                        );
                        PlanStep::Abort
                    }
                }
            }
        }
    }

    /// Dispatch one iteration's calls concurrently and transcribe every
    /// outcome — in the order the model listed the calls, not completion
    /// order. Calls beyond the remaining budget are denied up front and
    /// reported as `BudgetExceeded` without touching a subprocess.
    async fn execute(&self, run: &mut PlannerRun, calls: Vec<PlannedCall>) {
        let remaining = self.config.max_tool_calls.saturating_sub(run.dispatched) as usize;
        let timeout = self.config.per_call_timeout;

        let jobs: Vec<Option<ToolCall>> = calls
            .iter()
            .enumerate()
            .map(|(index, planned)| {
                (index < remaining).then(|| {
                    ToolCall::new(
                        planned.server.clone(),
                        planned.tool.clone(),
                        planned.params.clone(),
                    )
                })
            })
            .collect();
        run.dispatched += jobs.iter().flatten().count() as u32;

        let broker = Arc::clone(&self.broker);
        let outcomes = join_all(jobs.into_iter().map(|job| {
            let broker = Arc::clone(&broker);
            async move {
                match job {
                    Some(call) => Some(broker.call(call, timeout).await),
                    None => None,
                }
            }
        }))
        .await;

        let session_id = run.session_id.clone();
        let user_key = run.user_key.clone();

        for (planned, outcome) in calls.iter().zip(outcomes) {
            let (call_id, ok, payload) = match outcome {
                Some(outcome) => {
                    let ok = outcome.ok();
                    let payload = match outcome.result {
                        Ok(value) => truncate_payload(value, self.config.max_result_items),
                        Err(err) => {
                            debug!(
                                server = %planned.server,
                                tool = %planned.tool,
                                kind = err.kind(),
                                "tool call failed"
                            );
                            err.to_error_value()
                        }
                    };
                    (outcome.id, ok, payload)
                }
                None => {
                    warn!(
                        server = %planned.server,
                        tool = %planned.tool,
                        "tool call denied: budget exhausted"
                    );
                    (
                        ToolCallId::new(),
                        false,
                        ToolCallError::BudgetExceeded.to_error_value(),
                    )
                }
            };

            run.tool_calls_made.push(ToolCallSummary {
                server: planned.server.clone(),
                tool: planned.tool.clone(),
                ok,
            });

            let content = payload.to_string();
            run.transcript.push(TranscriptEntry::tool_result(ToolRecord {
                call_id,
                server: planned.server.clone(),
                tool: planned.tool.clone(),
                payload,
            }));

            self.persist(
                &session_id,
                &user_key,
                Role::Tool,
                &content,
                MessageMetadata::default(),
            )
            .await;
        }
    }

    /// Best-effort synthesis after a non-clean exit: one last request with
    /// no tools exposed, falling back to a fixed notice.
    async fn synthesize(&self, run: &PlannerRun) -> String {
        let mut transcript = run.transcript.clone();
        transcript.push(TranscriptEntry::user(SYNTHESIS_INSTRUCTION));

        let request = BridgeRequest {
            system: SYSTEM_DIRECTIVE.to_string(),
            transcript,
            declarations: Vec::new(),
            temperature: self.config.temperature,
            max_output_tokens: self.config.max_output_tokens,
        };

        match self.bridge.plan(request).await {
            Ok(Plan::Final(text)) if !text.trim().is_empty() => text,
            Ok(_) | Err(_) => {
                warn!(
                    session_id = %run.session_id,
                    "best-effort synthesis failed, using fixed notice"
                );
                FAILURE_NOTICE.to_string()
            }
        }
    }

    fn request_for(&self, run: &PlannerRun, declarations: &[ToolDeclaration]) -> BridgeRequest {
        BridgeRequest {
            system: SYSTEM_DIRECTIVE.to_string(),
            transcript: run.transcript.clone(),
            declarations: declarations.to_vec(),
            temperature: self.config.temperature,
            max_output_tokens: self.config.max_output_tokens,
        }
    }

    /// Append a row, treating failure as a soft error: the run continues,
    /// it just won't be remembered.
    async fn persist(
        &self,
        session_id: &str,
        user_key: &str,
        role: Role,
        content: &str,
        metadata: MessageMetadata,
    ) {
        if let Err(e) = self
            .store
            .append(session_id, user_key, role, content, &metadata, Utc::now())
            .await
        {
            warn!(error = %e, "failed to persist message, run continues without it");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ferroclaw_core::tool::{ToolCatalog, ToolOutcome, ToolSpec};
    use serde_json::{json, Value};
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::Mutex;

    // --- Mocks ---

    struct MockBridge {
        script: Mutex<VecDeque<Result<Plan, BridgeError>>>,
        requests: Mutex<Vec<BridgeRequest>>,
    }

    impl MockBridge {
        fn scripted(steps: Vec<Result<Plan, BridgeError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(steps.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<BridgeRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Bridge for MockBridge {
        fn name(&self) -> &str {
            "mock"
        }

        async fn plan(&self, request: BridgeRequest) -> Result<Plan, BridgeError> {
            self.requests.lock().unwrap().push(request);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(Plan::Final("Summary of findings.".into())))
        }
    }

    #[derive(Clone)]
    enum Behavior {
        Echo,
        Delay(Duration, Value),
        Fail(ToolCallError),
    }

    struct MockBroker {
        catalog: Arc<ToolCatalog>,
        behaviors: HashMap<(String, String), Behavior>,
        calls_seen: Mutex<Vec<ToolCall>>,
    }

    impl MockBroker {
        fn new(tools: Vec<(&str, &str, Behavior)>) -> Arc<Self> {
            let specs: Vec<ToolSpec> = tools
                .iter()
                .map(|(server, tool, _)| ToolSpec {
                    server: server.to_string(),
                    name: tool.to_string(),
                    description: format!("{tool} on {server}"),
                    input_schema: json!({"type": "object"}),
                })
                .collect();
            let behaviors = tools
                .into_iter()
                .map(|(server, tool, behavior)| {
                    ((server.to_string(), tool.to_string()), behavior)
                })
                .collect();
            Arc::new(Self {
                catalog: Arc::new(ToolCatalog::from_specs(specs)),
                behaviors,
                calls_seen: Mutex::new(Vec::new()),
            })
        }

        fn calls_seen(&self) -> Vec<ToolCall> {
            self.calls_seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ToolBroker for MockBroker {
        fn catalog(&self) -> Arc<ToolCatalog> {
            Arc::clone(&self.catalog)
        }

        async fn call(&self, call: ToolCall, _timeout: Duration) -> ToolOutcome {
            self.calls_seen.lock().unwrap().push(call.clone());
            let behavior = self
                .behaviors
                .get(&(call.server.clone(), call.tool.clone()))
                .cloned()
                .unwrap_or(Behavior::Echo);

            let result = match behavior {
                Behavior::Echo => Ok(call.params.clone()),
                Behavior::Delay(delay, value) => {
                    tokio::time::sleep(delay).await;
                    Ok(value)
                }
                Behavior::Fail(err) => Err(err),
            };

            ToolOutcome {
                id: call.id,
                elapsed: Duration::ZERO,
                result,
            }
        }
    }

    fn planned(server: &str, tool: &str, params: Value) -> PlannedCall {
        PlannedCall {
            server: server.into(),
            tool: tool.into(),
            params,
        }
    }

    async fn planner_with(
        bridge: Arc<MockBridge>,
        broker: Arc<MockBroker>,
        config: PlannerConfig,
    ) -> (Planner, Arc<ConversationStore>) {
        let store = Arc::new(ConversationStore::in_memory().await.unwrap());
        let planner = Planner::new(
            bridge,
            broker,
            Arc::clone(&store),
            Arc::new(EventBus::default()),
        )
        .with_config(config);
        (planner, store)
    }

    /// Tool-role records of the transcript a bridge request carried.
    fn tool_records(request: &BridgeRequest) -> Vec<&ToolRecord> {
        request
            .transcript
            .entries()
            .iter()
            .filter_map(|e| e.tool_record.as_ref())
            .collect()
    }

    // --- Scenarios ---

    #[tokio::test]
    async fn single_shot_final_answer() {
        let bridge = MockBridge::scripted(vec![Ok(Plan::Final("Hello, Alice.".into()))]);
        let broker = MockBroker::new(vec![("a", "x", Behavior::Echo)]);
        let (planner, store) =
            planner_with(Arc::clone(&bridge), broker, PlannerConfig::default()).await;

        let outcome = planner.run("alice", "say hello").await;

        assert_eq!(outcome.terminal_state, TerminalState::Done);
        assert_eq!(outcome.assistant_text, "Hello, Alice.");
        assert!(outcome.tool_calls_made.is_empty());
        assert_eq!(outcome.iterations, 1);

        let rows = store.recent("alice", 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].role, Role::User);
        assert_eq!(rows[1].role, Role::Assistant);
        assert_eq!(rows[1].content, "Hello, Alice.");

        // Exactly one model consultation, with the catalog attached.
        let requests = bridge.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].declarations.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_fan_out_is_concurrent_and_ordered() {
        // First call is the slow one, so completion order is reversed from
        // request order.
        let bridge = MockBridge::scripted(vec![
            Ok(Plan::ToolCalls(vec![
                planned("a", "x", json!({"n": 1})),
                planned("b", "y", json!({"n": 2})),
            ])),
            Ok(Plan::Final("done".into())),
        ]);
        let broker = MockBroker::new(vec![
            (
                "a",
                "x",
                Behavior::Delay(Duration::from_millis(500), json!({"from": "a"})),
            ),
            (
                "b",
                "y",
                Behavior::Delay(Duration::from_millis(10), json!({"from": "b"})),
            ),
        ]);
        let (planner, _store) = planner_with(
            Arc::clone(&bridge),
            Arc::clone(&broker),
            PlannerConfig::default(),
        )
        .await;

        let started = tokio::time::Instant::now();
        let outcome = planner.run("u", "fan out").await;
        let elapsed = started.elapsed();

        assert_eq!(outcome.terminal_state, TerminalState::Done);
        // Concurrent: the pair costs max(500ms, 10ms), not the sum.
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(510), "calls ran serially: {elapsed:?}");

        // Transcript order matches the model's listing, not completion.
        let requests = bridge.requests();
        let records = tool_records(&requests[1]);
        assert_eq!(records.len(), 2);
        assert_eq!((records[0].server.as_str(), records[0].tool.as_str()), ("a", "x"));
        assert_eq!((records[1].server.as_str(), records[1].tool.as_str()), ("b", "y"));
        assert_eq!(records[0].payload["from"], "a");
        assert_eq!(records[1].payload["from"], "b");

        // Call ids are unique within the run.
        let ids: HashSet<String> = broker
            .calls_seen()
            .iter()
            .map(|c| c.id.0.clone())
            .collect();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn one_failure_does_not_mask_siblings() {
        let bridge = MockBridge::scripted(vec![
            Ok(Plan::ToolCalls(vec![
                planned("a", "x", json!({})),
                planned("b", "y", json!({})),
                planned("c", "z", json!({})),
            ])),
            Ok(Plan::Final("done".into())),
        ]);
        let broker = MockBroker::new(vec![
            ("a", "x", Behavior::Echo),
            (
                "b",
                "y",
                Behavior::Fail(ToolCallError::CallTimeout {
                    server: "b".into(),
                    tool: "y".into(),
                    timeout_secs: 30,
                }),
            ),
            ("c", "z", Behavior::Echo),
        ]);
        let (planner, _store) =
            planner_with(Arc::clone(&bridge), broker, PlannerConfig::default()).await;

        let outcome = planner.run("u", "three calls").await;
        assert_eq!(outcome.terminal_state, TerminalState::Done);

        let requests = bridge.requests();
        let records = tool_records(&requests[1]);
        assert_eq!(records.len(), 3);
        assert!(records[0].payload.get("error").is_none());
        assert_eq!(records[1].payload["error"]["kind"], "CallTimeout");
        assert!(records[2].payload.get("error").is_none());

        let ok_flags: Vec<bool> = outcome.tool_calls_made.iter().map(|c| c.ok).collect();
        assert_eq!(ok_flags, vec![true, false, true]);
    }

    #[tokio::test]
    async fn iteration_budget_exhaustion_synthesizes() {
        let mut script: Vec<Result<Plan, BridgeError>> = (0..8)
            .map(|_| Ok(Plan::ToolCalls(vec![planned("a", "x", json!({}))])))
            .collect();
        // Consumed by the synthesis pass after the loop exits.
        script.push(Ok(Plan::Final("Here is what I found.".into())));

        let bridge = MockBridge::scripted(script);
        let broker = MockBroker::new(vec![("a", "x", Behavior::Echo)]);
        let (planner, _store) = planner_with(
            Arc::clone(&bridge),
            Arc::clone(&broker),
            PlannerConfig::default(),
        )
        .await;

        let outcome = planner.run("u", "loop forever").await;

        assert_eq!(outcome.terminal_state, TerminalState::BudgetExhausted);
        assert_eq!(outcome.assistant_text, "Here is what I found.");
        assert_eq!(outcome.iterations, 8);
        assert_eq!(broker.calls_seen().len(), 8);

        // The synthesis request exposes no tools.
        let requests = bridge.requests();
        assert!(requests.last().unwrap().declarations.is_empty());
    }

    #[tokio::test]
    async fn tool_call_budget_denies_excess_calls() {
        let bridge = MockBridge::scripted(vec![
            Ok(Plan::ToolCalls(vec![
                planned("a", "x", json!({"n": 1})),
                planned("a", "x", json!({"n": 2})),
                planned("a", "x", json!({"n": 3})),
            ])),
            Ok(Plan::Final("done".into())),
        ]);
        let broker = MockBroker::new(vec![("a", "x", Behavior::Echo)]);
        let config = PlannerConfig {
            max_tool_calls: 2,
            ..Default::default()
        };
        let (planner, _store) =
            planner_with(Arc::clone(&bridge), Arc::clone(&broker), config).await;

        let outcome = planner.run("u", "many calls").await;
        assert_eq!(outcome.terminal_state, TerminalState::Done);

        // Only two dispatched; the third never reached the broker.
        assert_eq!(broker.calls_seen().len(), 2);

        let requests = bridge.requests();
        let records = tool_records(&requests[1]);
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].payload["error"]["kind"], "BudgetExceeded");
    }

    #[tokio::test(start_paused = true)]
    async fn wall_clock_timeout_cancels_and_synthesizes() {
        let bridge = MockBridge::scripted(vec![
            Ok(Plan::ToolCalls(vec![planned("a", "x", json!({}))])),
            Ok(Plan::Final("Partial picture.".into())),
        ]);
        let broker = MockBroker::new(vec![(
            "a",
            "x",
            Behavior::Delay(Duration::from_secs(600), json!({})),
        )]);
        let config = PlannerConfig {
            wall_clock: Duration::from_secs(1),
            ..Default::default()
        };
        let (planner, _store) = planner_with(Arc::clone(&bridge), broker, config).await;

        let outcome = planner.run("u", "slow tool").await;
        assert_eq!(outcome.terminal_state, TerminalState::TimedOut);
        assert_eq!(outcome.assistant_text, "Partial picture.");
    }

    #[tokio::test]
    async fn malformed_plan_feeds_back_once() {
        let bridge = MockBridge::scripted(vec![
            Err(BridgeError::MalformedPlan("call 'x' has invalid parameters".into())),
            Ok(Plan::Final("recovered".into())),
        ]);
        let broker = MockBroker::new(vec![("a", "x", Behavior::Echo)]);
        let (planner, _store) =
            planner_with(Arc::clone(&bridge), broker, PlannerConfig::default()).await;

        let outcome = planner.run("u", "try").await;
        assert_eq!(outcome.terminal_state, TerminalState::Done);
        assert_eq!(outcome.assistant_text, "recovered");

        // The second request carries the validation feedback as a
        // tool-role note.
        let requests = bridge.requests();
        let note = requests[1]
            .transcript
            .entries()
            .iter()
            .find(|e| e.role == Role::Tool && e.tool_record.is_none())
            .expect("feedback note present");
        assert!(note.content.contains("plan was invalid"));
        assert!(note.content.contains("MalformedPlan"));
    }

    #[tokio::test]
    async fn second_malformed_plan_aborts() {
        let bridge = MockBridge::scripted(vec![
            Err(BridgeError::MalformedPlan("first".into())),
            Err(BridgeError::MalformedPlan("second".into())),
        ]);
        let broker = MockBroker::new(vec![("a", "x", Behavior::Echo)]);
        let (planner, _store) =
            planner_with(Arc::clone(&bridge), broker, PlannerConfig::default()).await;

        let outcome = planner.run("u", "try").await;
        assert_eq!(outcome.terminal_state, TerminalState::Aborted);
        assert_eq!(outcome.assistant_text, FAILURE_NOTICE);
    }

    #[tokio::test]
    async fn model_unavailable_retries_once_then_succeeds() {
        let bridge = MockBridge::scripted(vec![
            Err(BridgeError::ModelUnavailable("503".into())),
            Ok(Plan::Final("ok after retry".into())),
        ]);
        let broker = MockBroker::new(vec![("a", "x", Behavior::Echo)]);
        let (planner, _store) =
            planner_with(Arc::clone(&bridge), broker, PlannerConfig::default()).await;

        let outcome = planner.run("u", "hello").await;
        assert_eq!(outcome.terminal_state, TerminalState::Done);
        assert_eq!(outcome.assistant_text, "ok after retry");
        assert_eq!(outcome.iterations, 1);
    }

    #[tokio::test]
    async fn model_unavailable_twice_aborts() {
        let bridge = MockBridge::scripted(vec![
            Err(BridgeError::ModelUnavailable("503".into())),
            Err(BridgeError::ModelUnavailable("503 again".into())),
        ]);
        let broker = MockBroker::new(vec![("a", "x", Behavior::Echo)]);
        let (planner, _store) =
            planner_with(Arc::clone(&bridge), broker, PlannerConfig::default()).await;

        let outcome = planner.run("u", "hello").await;
        assert_eq!(outcome.terminal_state, TerminalState::Aborted);
        assert_eq!(outcome.assistant_text, FAILURE_NOTICE);
    }

    #[tokio::test]
    async fn empty_final_becomes_placeholder() {
        let bridge = MockBridge::scripted(vec![Ok(Plan::Final(String::new()))]);
        let broker = MockBroker::new(vec![("a", "x", Behavior::Echo)]);
        let (planner, _store) =
            planner_with(Arc::clone(&bridge), broker, PlannerConfig::default()).await;

        let outcome = planner.run("u", "?").await;
        assert_eq!(outcome.terminal_state, TerminalState::Done);
        assert_eq!(outcome.assistant_text, EMPTY_PLAN_PLACEHOLDER);
    }

    #[tokio::test]
    async fn history_is_hydrated_oldest_first_without_tool_rows() {
        let bridge = MockBridge::scripted(vec![Ok(Plan::Final("with context".into()))]);
        let broker = MockBroker::new(vec![("a", "x", Behavior::Echo)]);
        let (planner, store) =
            planner_with(Arc::clone(&bridge), broker, PlannerConfig::default()).await;

        let now = Utc::now();
        store
            .append("s0", "u", Role::User, "earlier question", &Default::default(), now)
            .await
            .unwrap();
        store
            .append(
                "s0",
                "u",
                Role::Tool,
                "{\"internal\":true}",
                &Default::default(),
                now + chrono::Duration::seconds(1),
            )
            .await
            .unwrap();
        store
            .append(
                "s0",
                "u",
                Role::Assistant,
                "earlier answer",
                &Default::default(),
                now + chrono::Duration::seconds(2),
            )
            .await
            .unwrap();

        planner.run("u", "follow-up").await;

        let requests = bridge.requests();
        let entries = requests[0].transcript.entries();
        let summary: Vec<(Role, &str)> = entries
            .iter()
            .map(|e| (e.role, e.content.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (Role::User, "earlier question"),
                (Role::Assistant, "earlier answer"),
                (Role::User, "follow-up"),
            ]
        );
    }

    #[tokio::test]
    async fn consecutive_runs_share_a_session() {
        let bridge = MockBridge::scripted(vec![
            Ok(Plan::Final("one".into())),
            Ok(Plan::Final("two".into())),
        ]);
        let broker = MockBroker::new(vec![("a", "x", Behavior::Echo)]);
        let (planner, store) =
            planner_with(Arc::clone(&bridge), broker, PlannerConfig::default()).await;

        let first = planner.run("u", "first").await;
        let second = planner.run("u", "second").await;
        assert_eq!(first.session_id, second.session_id);

        // Clearing forgets the session; the next run gets a fresh id.
        store.clear("u").await.unwrap();
        let third = planner.run("u", "third").await;
        assert_ne!(third.session_id, first.session_id);
    }

    #[tokio::test]
    async fn tool_rows_and_metadata_are_persisted() {
        let bridge = MockBridge::scripted(vec![
            Ok(Plan::ToolCalls(vec![planned("a", "x", json!({"n": 7}))])),
            Ok(Plan::Final("done".into())),
        ]);
        let broker = MockBroker::new(vec![("a", "x", Behavior::Echo)]);
        let (planner, store) =
            planner_with(Arc::clone(&bridge), broker, PlannerConfig::default()).await;

        planner.run("u", "do a thing").await;

        let rows = store.recent("u", 10).await.unwrap();
        // user, tool result, assistant
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].role, Role::Tool);
        assert!(rows[1].content.contains("\"n\":7"));

        let assistant = rows.last().unwrap();
        assert_eq!(assistant.role, Role::Assistant);
        assert_eq!(assistant.metadata.tool_calls.len(), 1);
        assert_eq!(assistant.metadata.tool_calls[0].server, "a");
        assert!(assistant.metadata.tool_calls[0].ok);
    }

    #[tokio::test]
    async fn long_tool_payloads_are_clipped_for_the_model() {
        let big = json!({"pairs": (0..50).collect::<Vec<i32>>()});
        let bridge = MockBridge::scripted(vec![
            Ok(Plan::ToolCalls(vec![planned("a", "x", json!({}))])),
            Ok(Plan::Final("done".into())),
        ]);
        let broker = MockBroker::new(vec![(
            "a",
            "x",
            Behavior::Delay(Duration::ZERO, big),
        )]);
        let (planner, _store) =
            planner_with(Arc::clone(&bridge), broker, PlannerConfig::default()).await;

        planner.run("u", "big result").await;

        let requests = bridge.requests();
        let records = tool_records(&requests[1]);
        assert_eq!(records[0].payload["pairs"].as_array().unwrap().len(), 10);
        assert_eq!(records[0].payload["pairs_truncated"], true);
    }
}
