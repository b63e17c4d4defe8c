//! Tool-call scheduler.
//!
//! Turns the function calls proposed in one model turn into function
//! responses. Each call walks a small state machine:
//!
//! ```text
//! Proposed -> Validating -> AwaitingApproval -> Approved -> Executing -> Completed
//!                 |               |                |            |
//!                 +-> Failed      +-> Denied       +-> Denied   +-> Failed
//!                 +-> Denied
//!                 +-> Approved
//! ```
//!
//! Every proposed call ends in exactly one terminal state (`Completed`,
//! `Denied` or `Failed`) and yields exactly one [`FunctionResponse`]; failures
//! are folded into the response payload rather than returned as errors.
//! Results come back in proposal order regardless of completion order.

use crate::confirmation::{ConfirmationBus, ConfirmationOutcome, ConfirmationRequest};
use crate::policy::{PolicyEngine, PolicyVerdict};
use crate::tools::ToolRegistry;
use crate::types::{FunctionCall, FunctionResponse};
use crate::{Error, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a proposed tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Proposed,
    Validating,
    AwaitingApproval,
    Approved,
    Denied,
    Executing,
    Completed,
    Failed,
}

impl ToolCallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Denied | Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: ToolCallStatus) -> bool {
        use ToolCallStatus::*;
        matches!(
            (self, next),
            (Proposed, Validating)
                | (Proposed, Denied)
                | (Validating, AwaitingApproval)
                | (Validating, Approved)
                | (Validating, Denied)
                | (Validating, Failed)
                | (AwaitingApproval, Approved)
                | (AwaitingApproval, Denied)
                | (Approved, Executing)
                | (Approved, Denied)
                | (Executing, Completed)
                | (Executing, Failed)
        )
    }
}

/// A tool call as it moves through the scheduler.
#[derive(Debug, Clone)]
pub struct ToolCallState {
    /// The model's id, or `<name>-<position>` when it supplied none
    pub call_id: String,
    pub name: String,
    pub args: Value,
    pub status: ToolCallStatus,
    /// Turn that proposed the call
    pub turn_id: String,
    /// The owning turn's abort token
    pub abort: CancellationToken,
}

/// Emitted on every state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallUpdate {
    pub call_id: String,
    pub name: String,
    pub status: ToolCallStatus,
}

/// A call handed to [`ToolCallScheduler::schedule`].
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub call: FunctionCall,
    /// Dependent calls run one at a time, in proposal order
    pub dependent: bool,
}

impl ToolCallRequest {
    pub fn new(call: FunctionCall) -> Self {
        Self {
            call,
            dependent: false,
        }
    }

    pub fn dependent(mut self) -> Self {
        self.dependent = true;
        self
    }
}

impl From<FunctionCall> for ToolCallRequest {
    fn from(call: FunctionCall) -> Self {
        Self::new(call)
    }
}

/// Outcome of one scheduled call
#[derive(Debug, Clone)]
pub struct CompletedToolCall {
    /// Final state; `status` is always terminal
    pub state: ToolCallState,
    pub response: FunctionResponse,
    pub duration: Duration,
}

impl CompletedToolCall {
    pub fn status(&self) -> ToolCallStatus {
        self.state.status
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently executing independent calls
    pub max_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_concurrency: 4 }
    }
}

impl SchedulerConfig {
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit.max(1);
        self
    }
}

/// Validates, gates and executes tool calls.
pub struct ToolCallScheduler {
    registry: Arc<ToolRegistry>,
    policy: Arc<PolicyEngine>,
    confirmations: Option<ConfirmationBus>,
    updates: Option<mpsc::UnboundedSender<ToolCallUpdate>>,
    config: SchedulerConfig,
}

impl ToolCallScheduler {
    pub fn new(registry: Arc<ToolRegistry>, policy: Arc<PolicyEngine>) -> Self {
        Self {
            registry,
            policy,
            confirmations: None,
            updates: None,
            config: SchedulerConfig::default(),
        }
    }

    /// Without a bus, `Ask` verdicts resolve to `Denied`.
    pub fn with_confirmation_bus(mut self, bus: ConfirmationBus) -> Self {
        self.confirmations = Some(bus);
        self
    }

    pub fn with_updates(mut self, updates: mpsc::UnboundedSender<ToolCallUpdate>) -> Self {
        self.updates = Some(updates);
        self
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Runs every call to a terminal state.
    ///
    /// Independent calls execute concurrently up to the configured limit;
    /// dependent calls execute one after another in proposal order. The
    /// returned vector has one entry per request, in request order.
    pub async fn schedule(
        &self,
        turn_id: &str,
        requests: Vec<ToolCallRequest>,
        abort: &CancellationToken,
    ) -> Vec<CompletedToolCall> {
        let total = requests.len();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));

        let mut independent = Vec::new();
        let mut dependent = Vec::new();
        for (position, request) in requests.into_iter().enumerate() {
            if request.dependent {
                dependent.push((position, request.call));
            } else {
                independent.push((position, request.call));
            }
        }

        let concurrent = join_all(independent.into_iter().map(|(position, call)| {
            let semaphore = semaphore.clone();
            async move {
                let completed = self.run_call(turn_id, position, call, &semaphore, abort).await;
                (position, completed)
            }
        }));

        let sequential = async {
            let mut done = Vec::with_capacity(dependent.len());
            for (position, call) in dependent {
                let completed = self.run_call(turn_id, position, call, &semaphore, abort).await;
                done.push((position, completed));
            }
            done
        };

        let (concurrent, sequential) = futures::join!(concurrent, sequential);

        let mut slots: Vec<Option<CompletedToolCall>> = vec![None; total];
        for (position, completed) in concurrent.into_iter().chain(sequential) {
            slots[position] = Some(completed);
        }
        slots.into_iter().flatten().collect()
    }

    async fn run_call(
        &self,
        turn_id: &str,
        position: usize,
        call: FunctionCall,
        semaphore: &Semaphore,
        abort: &CancellationToken,
    ) -> CompletedToolCall {
        let started = Instant::now();
        let call_id = call
            .id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", call.name, position));
        let mut state = ToolCallState {
            call_id,
            name: call.name.clone(),
            args: call.args_value(),
            status: ToolCallStatus::Proposed,
            turn_id: turn_id.to_string(),
            abort: abort.clone(),
        };
        self.publish(&state);

        let outcome = self.drive(&mut state, semaphore).await;
        let response = match outcome {
            Ok(output) => FunctionResponse::success(Some(state.call_id.clone()), &state.name, output),
            Err(err) => FunctionResponse::error(Some(state.call_id.clone()), &state.name, err.to_string())
                .with_field("kind", Value::String(error_kind(&err).to_string())),
        };

        let duration = started.elapsed();
        log::debug!(
            "Tool call {} ({}) finished as {:?} in {:?}",
            state.call_id,
            state.name,
            state.status,
            duration
        );
        CompletedToolCall {
            state,
            response,
            duration,
        }
    }

    /// Advances `state` to a terminal status; the error, if any, becomes the response payload.
    async fn drive(&self, state: &mut ToolCallState, semaphore: &Semaphore) -> Result<Value> {
        if state.abort.is_cancelled() {
            self.advance(state, ToolCallStatus::Denied);
            return Err(Error::Cancelled);
        }

        self.advance(state, ToolCallStatus::Validating);
        let tool = match self.registry.require(&state.name) {
            Ok(tool) => tool.clone(),
            Err(err) => {
                self.advance(state, ToolCallStatus::Failed);
                return Err(err);
            }
        };
        if let Err(err) = tool.validate(&state.args) {
            self.advance(state, ToolCallStatus::Failed);
            return Err(err);
        }

        let decision = self.policy.evaluate(&state.name, &state.args);
        log::debug!(
            "Policy for {} ({}): {} via {}",
            state.call_id,
            state.name,
            decision.verdict,
            decision.rule_label()
        );
        match decision.verdict {
            PolicyVerdict::Deny => {
                self.advance(state, ToolCallStatus::Denied);
                return Err(Error::policy_denied(format!(
                    "rule '{}' forbids {}",
                    decision.rule_label(),
                    state.name
                )));
            }
            PolicyVerdict::Allow => self.advance(state, ToolCallStatus::Approved),
            PolicyVerdict::Ask => {
                self.advance(state, ToolCallStatus::AwaitingApproval);
                self.await_confirmation(state).await?;
                self.advance(state, ToolCallStatus::Approved);
            }
        }

        if state.abort.is_cancelled() {
            self.advance(state, ToolCallStatus::Denied);
            return Err(Error::Cancelled);
        }

        // Only execution is bounded; approvals may be pending in parallel
        let _permit = semaphore.acquire().await.ok();
        self.advance(state, ToolCallStatus::Executing);

        let result = tokio::select! {
            biased;
            _ = state.abort.cancelled() => Err(Error::Cancelled),
            result = tool.execute(state.args.clone(), state.abort.clone()) => result,
        };

        match result {
            Ok(output) => {
                self.advance(state, ToolCallStatus::Completed);
                Ok(output)
            }
            Err(err) => {
                self.advance(state, ToolCallStatus::Failed);
                Err(match err {
                    Error::Cancelled | Error::ToolExecution(_) => err,
                    other => Error::tool(other.to_string()),
                })
            }
        }
    }

    /// Resolves an `Ask` verdict; moves to `Denied` and errors unless approved.
    async fn await_confirmation(&self, state: &mut ToolCallState) -> Result<()> {
        let Some(bus) = &self.confirmations else {
            self.advance(state, ToolCallStatus::Denied);
            return Err(Error::confirmation_denied(format!(
                "{} requires approval and no approver is connected",
                state.name
            )));
        };

        let request = ConfirmationRequest {
            call_id: state.call_id.clone(),
            tool_name: state.name.clone(),
            arguments: state.args.clone(),
            proposed_action: format!("Run {} with {}", state.name, state.args),
        };

        let outcome = bus.request(request, &state.abort).await;
        let denial = match outcome {
            Ok(ConfirmationOutcome::Approved) => return Ok(()),
            Ok(ConfirmationOutcome::Denied) => {
                Error::confirmation_denied(format!("user declined {}", state.name))
            }
            Ok(ConfirmationOutcome::Cancelled) => Error::Cancelled,
            Ok(ConfirmationOutcome::Unavailable) => Error::confirmation_denied(format!(
                "approver disconnected before answering for {}",
                state.name
            )),
            Err(err) => Error::confirmation_denied(err.to_string()),
        };
        self.advance(state, ToolCallStatus::Denied);
        Err(denial)
    }

    fn advance(&self, state: &mut ToolCallState, next: ToolCallStatus) {
        debug_assert!(
            state.status.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            state.status,
            next
        );
        log::debug!(
            "Tool call {} ({}): {:?} -> {:?}",
            state.call_id,
            state.name,
            state.status,
            next
        );
        state.status = next;
        self.publish(state);
    }

    fn publish(&self, state: &ToolCallState) {
        if let Some(updates) = &self.updates {
            // A dropped receiver only means nobody is watching
            let _ = updates.send(ToolCallUpdate {
                call_id: state.call_id.clone(),
                name: state.name.clone(),
                status: state.status,
            });
        }
    }
}

/// Short machine-readable label stored in error responses under `kind`.
fn error_kind(err: &Error) -> &'static str {
    match err {
        Error::Validation(_) => "validation",
        Error::PolicyDenied(_) => "policy_denied",
        Error::ConfirmationDenied(_) => "confirmation_denied",
        Error::Cancelled => "cancelled",
        _ => "execution",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirmation::{ConfirmationDecision, ConfirmationResponse};
    use crate::policy::PolicyRule;
    use crate::tools::tool;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn call(id: &str, name: &str, args: Value) -> FunctionCall {
        FunctionCall {
            id: Some(id.to_string()),
            name: name.to_string(),
            args: args.as_object().cloned(),
        }
    }

    fn allow_all() -> Arc<PolicyEngine> {
        Arc::new(PolicyEngine::new(vec![PolicyRule::allow("all", "*")]).unwrap())
    }

    fn echo_registry(counter: Arc<AtomicUsize>) -> Arc<ToolRegistry> {
        let echo = tool("echo", "Echo the message")
            .param("message", "string")
            .build(move |args, _abort| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(args["message"].clone())
                }
            });
        let fail = tool("fail", "Always fails").build(|_, _| async { Err(Error::tool("boom")) });
        let slow = tool("slow", "Sleeps")
            .param("ms", "integer")
            .build(|args, _| async move {
                let ms = args["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({"slept": ms}))
            });
        Arc::new(vec![echo, fail, slow].into_iter().collect())
    }

    #[test]
    fn test_transition_table() {
        use ToolCallStatus::*;
        assert!(Proposed.can_transition_to(Validating));
        assert!(Validating.can_transition_to(Failed));
        assert!(AwaitingApproval.can_transition_to(Denied));
        assert!(Executing.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Executing));
        assert!(!Denied.can_transition_to(Approved));
        assert!(!Proposed.can_transition_to(Executing));
        assert!(Completed.is_terminal() && Denied.is_terminal() && Failed.is_terminal());
        assert!(!AwaitingApproval.is_terminal());
    }

    #[tokio::test]
    async fn test_allowed_call_completes() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = ToolCallScheduler::new(echo_registry(counter.clone()), allow_all());

        let results = scheduler
            .schedule(
                "turn-1",
                vec![call("c1", "echo", json!({"message": "hi"})).into()],
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status(), ToolCallStatus::Completed);
        assert_eq!(results[0].response.id.as_deref(), Some("c1"));
        assert_eq!(results[0].response.response["output"], "hi");
        assert_eq!(results[0].state.turn_id, "turn-1");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_results_keep_proposal_order() {
        let scheduler =
            ToolCallScheduler::new(echo_registry(Arc::new(AtomicUsize::new(0))), allow_all());

        let results = scheduler
            .schedule(
                "t",
                vec![
                    call("a", "slow", json!({"ms": 60})).into(),
                    call("b", "slow", json!({"ms": 1})).into(),
                    call("c", "echo", json!({"message": "x"})).into(),
                ],
                &CancellationToken::new(),
            )
            .await;

        let ids: Vec<_> = results.iter().map(|r| r.state.call_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_execution_failure_is_contained() {
        let scheduler =
            ToolCallScheduler::new(echo_registry(Arc::new(AtomicUsize::new(0))), allow_all());

        let results = scheduler
            .schedule("t", vec![call("f", "fail", json!({})).into()], &CancellationToken::new())
            .await;

        assert_eq!(results[0].status(), ToolCallStatus::Failed);
        assert!(results[0].response.is_error());
        assert_eq!(results[0].response.response["kind"], "execution");
        assert!(results[0].response.message().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_validation_failure_skips_policy() {
        let counter = Arc::new(AtomicUsize::new(0));
        let policy = Arc::new(PolicyEngine::new(vec![PolicyRule::deny("no-echo", "echo")]).unwrap());
        let scheduler = ToolCallScheduler::new(echo_registry(counter.clone()), policy);

        let results = scheduler
            .schedule("t", vec![call("v", "echo", json!({"message": 7})).into()], &CancellationToken::new())
            .await;

        assert_eq!(results[0].status(), ToolCallStatus::Failed);
        assert_eq!(results[0].response.response["kind"], "validation");
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_tool_fails() {
        let scheduler =
            ToolCallScheduler::new(echo_registry(Arc::new(AtomicUsize::new(0))), allow_all());
        let results = scheduler
            .schedule("t", vec![call("u", "nope", json!({})).into()], &CancellationToken::new())
            .await;

        assert_eq!(results[0].status(), ToolCallStatus::Failed);
        assert!(results[0].response.message().unwrap().contains("Tool 'nope' not found"));
    }

    #[tokio::test]
    async fn test_policy_deny_never_executes() {
        let counter = Arc::new(AtomicUsize::new(0));
        let policy = Arc::new(
            PolicyEngine::new(vec![
                PolicyRule::allow("all", "*"),
                PolicyRule::deny("no-echo", "echo"),
            ])
            .unwrap(),
        );
        let scheduler = ToolCallScheduler::new(echo_registry(counter.clone()), policy);

        let results = scheduler
            .schedule("t", vec![call("d", "echo", json!({"message": "x"})).into()], &CancellationToken::new())
            .await;

        assert_eq!(results[0].status(), ToolCallStatus::Denied);
        assert_eq!(results[0].response.response["kind"], "policy_denied");
        assert!(results[0].response.message().unwrap().contains("no-echo"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ask_without_approver_is_denied() {
        let scheduler = ToolCallScheduler::new(
            echo_registry(Arc::new(AtomicUsize::new(0))),
            Arc::new(PolicyEngine::default()),
        );
        let results = scheduler
            .schedule("t", vec![call("q", "echo", json!({"message": "x"})).into()], &CancellationToken::new())
            .await;

        assert_eq!(results[0].status(), ToolCallStatus::Denied);
        assert_eq!(results[0].response.response["kind"], "confirmation_denied");
    }

    #[tokio::test]
    async fn test_ask_goes_through_confirmation_bus() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (bus, mut approver) = ConfirmationBus::new();
        let scheduler = ToolCallScheduler::new(
            echo_registry(counter.clone()),
            Arc::new(PolicyEngine::default()),
        )
        .with_confirmation_bus(bus);

        let responder = approver.responder();
        tokio::spawn(async move {
            while let Some(request) = approver.next_request().await {
                let decision = if request.call_id == "yes" {
                    ConfirmationDecision::Approved
                } else {
                    ConfirmationDecision::Denied
                };
                responder
                    .respond(ConfirmationResponse {
                        call_id: request.call_id,
                        decision,
                    })
                    .unwrap();
            }
        });

        let results = scheduler
            .schedule(
                "t",
                vec![
                    call("yes", "echo", json!({"message": "a"})).into(),
                    call("no", "echo", json!({"message": "b"})).into(),
                ],
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(results[0].status(), ToolCallStatus::Completed);
        assert_eq!(results[1].status(), ToolCallStatus::Denied);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_awaiting_approval() {
        let (bus, mut approver) = ConfirmationBus::new();
        let scheduler = ToolCallScheduler::new(
            echo_registry(Arc::new(AtomicUsize::new(0))),
            Arc::new(PolicyEngine::default()),
        )
        .with_confirmation_bus(bus);

        let abort = CancellationToken::new();
        let canceller = abort.clone();
        tokio::spawn(async move {
            // never answer, just cancel once the request shows up
            let _request = approver.next_request().await;
            canceller.cancel();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(approver);
        });

        let results = scheduler
            .schedule("t", vec![call("w", "echo", json!({"message": "x"})).into()], &abort)
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status(), ToolCallStatus::Denied);
        assert_eq!(results[0].response.response["kind"], "cancelled");
    }

    #[tokio::test]
    async fn test_cancel_during_execution_is_prompt() {
        let scheduler =
            ToolCallScheduler::new(echo_registry(Arc::new(AtomicUsize::new(0))), allow_all());
        let abort = CancellationToken::new();
        let canceller = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let results = tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.schedule(
                "t",
                vec![
                    call("long", "slow", json!({"ms": 60_000})).into(),
                    call("long2", "slow", json!({"ms": 60_000})).into(),
                ],
                &abort,
            ),
        )
        .await
        .expect("cancellation should stop execution promptly");

        assert_eq!(results.len(), 2);
        for result in &results {
            assert_eq!(result.status(), ToolCallStatus::Failed);
            assert_eq!(result.response.response["kind"], "cancelled");
        }
    }

    #[tokio::test]
    async fn test_already_cancelled_turn_denies_everything() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = ToolCallScheduler::new(echo_registry(counter.clone()), allow_all());
        let abort = CancellationToken::new();
        abort.cancel();

        let results = scheduler
            .schedule(
                "t",
                vec![
                    call("1", "echo", json!({"message": "x"})).into(),
                    ToolCallRequest::new(call("2", "echo", json!({"message": "y"}))).dependent(),
                ],
                &abort,
            )
            .await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status() == ToolCallStatus::Denied));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_respected() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let probe = {
            let running = running.clone();
            let peak = peak.clone();
            tool("probe", "Tracks concurrency").build(move |_, _| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!({}))
                }
            })
        };
        let registry = Arc::new(vec![probe].into_iter().collect::<ToolRegistry>());
        let scheduler = ToolCallScheduler::new(registry, allow_all())
            .with_config(SchedulerConfig::default().with_max_concurrency(2));

        let requests: Vec<ToolCallRequest> = (0..6)
            .map(|i| call(&format!("p{i}"), "probe", json!({})).into())
            .collect();
        let results = scheduler.schedule("t", requests, &CancellationToken::new()).await;

        assert_eq!(results.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_dependent_calls_run_in_order() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let record = {
            let log = log.clone();
            tool("record", "Appends to a log")
                .param("label", "string")
                .param("ms", "integer")
                .build(move |args, _| {
                    let log = log.clone();
                    async move {
                        let ms = args["ms"].as_u64().unwrap_or(0);
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        log.lock().unwrap().push(args["label"].as_str().unwrap().to_string());
                        Ok(json!({}))
                    }
                })
        };
        let registry = Arc::new(vec![record].into_iter().collect::<ToolRegistry>());
        let scheduler = ToolCallScheduler::new(registry, allow_all());

        let requests = vec![
            ToolCallRequest::new(call("1", "record", json!({"label": "first", "ms": 40}))).dependent(),
            ToolCallRequest::new(call("2", "record", json!({"label": "second", "ms": 1}))).dependent(),
        ];
        scheduler.schedule("t", requests, &CancellationToken::new()).await;

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_updates_follow_the_state_machine() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler =
            ToolCallScheduler::new(echo_registry(Arc::new(AtomicUsize::new(0))), allow_all())
                .with_updates(tx);

        let unnamed = FunctionCall {
            id: None,
            name: "echo".into(),
            args: json!({"message": "x"}).as_object().cloned(),
        };
        let results = scheduler
            .schedule("t", vec![unnamed.into()], &CancellationToken::new())
            .await;
        assert_eq!(results[0].state.call_id, "echo-0");
        assert_eq!(results[0].response.id.as_deref(), Some("echo-0"));

        drop(scheduler);
        let mut statuses = Vec::new();
        while let Some(update) = rx.recv().await {
            assert_eq!(update.call_id, "echo-0");
            statuses.push(update.status);
        }
        assert_eq!(
            statuses,
            vec![
                ToolCallStatus::Proposed,
                ToolCallStatus::Validating,
                ToolCallStatus::Approved,
                ToolCallStatus::Executing,
                ToolCallStatus::Completed,
            ]
        );
    }
}
