//! The tool-loop agent: multi-turn orchestration between a chat model and
//! locally-executed tools.
//!
//! Each iteration calls the model with the accumulated history plus tool
//! schemas, inspects the response, executes any requested tools, appends the
//! assistant turn verbatim followed by one user turn carrying one tool
//! result per call (ids matching 1:1), and loops until the model answers
//! without tools or the iteration bound is hit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chorus_domain::cancel::CancellationToken;
use chorus_domain::error::{codes, LlmError, Result, Warning};
use chorus_domain::message::{ModelMessage, ToolCall, ToolResult};
use chorus_domain::stream::ChatResponse;
use chorus_domain::tool::{ExecutableTool, FunctionTool};
use chorus_providers::{ChatCapability, ChatRequest};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct ToolLoopConfig {
    /// Model calls before the loop force-stops.
    pub max_iterations: usize,
    /// Dispatch all of a turn's tool calls concurrently.
    pub run_tools_in_parallel: bool,
    /// In sequential mode, keep executing after a tool fails. Parallel mode
    /// always captures failures as error results.
    pub continue_on_tool_error: bool,
    /// Per-call executor deadline.
    pub tool_timeout: Option<Duration>,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            run_tools_in_parallel: false,
            continue_on_tool_error: true,
            tool_timeout: None,
        }
    }
}

/// The final state of a finished loop.
#[derive(Debug)]
pub struct ToolLoopOutcome {
    /// The model's final response. When the iteration bound was hit this is
    /// the last assistant message, with a `TOOL_LOOP_MAX_ITERATIONS` warning.
    pub response: ChatResponse,
    /// The full conversation: inputs, assistant tool-call turns, tool-result
    /// turns, and the final assistant turn.
    pub history: Vec<ModelMessage>,
    /// Model calls made.
    pub iterations: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ToolLoopAgent {
    model: Arc<dyn ChatCapability>,
    tools: HashMap<String, Arc<dyn ExecutableTool>>,
    config: ToolLoopConfig,
}

impl ToolLoopAgent {
    pub fn new(model: Arc<dyn ChatCapability>, config: ToolLoopConfig) -> Self {
        Self {
            model,
            tools: HashMap::new(),
            config,
        }
    }

    /// Register a tool under its schema name. Replaces any previous tool of
    /// the same name.
    pub fn with_tool(mut self, tool: Arc<dyn ExecutableTool>) -> Self {
        self.tools.insert(tool.schema().name.clone(), tool);
        self
    }

    pub fn with_tools(mut self, tools: Vec<Arc<dyn ExecutableTool>>) -> Self {
        for tool in tools {
            self.tools.insert(tool.schema().name.clone(), tool);
        }
        self
    }

    /// The schemas advertised to the model, sorted by name for a stable
    /// wire order.
    fn schemas(&self) -> Vec<FunctionTool> {
        let mut schemas: Vec<FunctionTool> =
            self.tools.values().map(|t| t.schema().clone()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Drive the loop to completion.
    pub async fn run(
        &self,
        messages: Vec<ModelMessage>,
        cancel: CancellationToken,
    ) -> Result<ToolLoopOutcome> {
        let schemas = self.schemas();
        let mut history = messages;
        let mut loop_warnings: Vec<Warning> = Vec::new();

        for iteration in 1..=self.config.max_iterations.max(1) {
            cancel.check()?;

            let req = ChatRequest::new(history.clone())
                .with_tools(schemas.clone())
                .with_cancel(cancel.clone());

            tracing::debug!(iteration, messages = history.len(), "tool loop model call");
            let mut response = self.model.chat(&req).await?;

            if !response.has_tool_calls() {
                history.push(ModelMessage::assistant(response.text_or_empty()));
                response.warnings.extend(loop_warnings);
                return Ok(ToolLoopOutcome {
                    response,
                    history,
                    iterations: iteration,
                });
            }

            // Append the assistant turn verbatim, tool calls included.
            history.push(ModelMessage::assistant_tool_calls(
                response.text.clone(),
                response.tool_calls.clone(),
            ));

            if iteration == self.config.max_iterations.max(1) {
                // The model still wants tools but the iteration bound is reached:
                // return the last assistant message as final.
                let warning = Warning::new(
                    codes::TOOL_LOOP_MAX_ITERATIONS,
                    format!("tool loop stopped after {iteration} iterations with tool calls pending"),
                );
                tracing::warn!(iterations = iteration, "tool loop hit iteration bound");
                response.warnings.extend(loop_warnings);
                response.warnings.push(warning);
                return Ok(ToolLoopOutcome {
                    response,
                    history,
                    iterations: iteration,
                });
            }

            cancel.check()?;
            let results = self
                .execute_calls(&response.tool_calls, &cancel, &mut loop_warnings)
                .await?;

            // One user turn, one result per call, ids matching 1:1.
            history.push(ModelMessage::tool_results(results));

            // Cooperative yield between iterations.
            tokio::task::yield_now().await;
        }

        unreachable!("loop returns from within its final iteration")
    }

    // ── Tool execution ─────────────────────────────────────────────

    async fn execute_calls(
        &self,
        calls: &[ToolCall],
        cancel: &CancellationToken,
        warnings: &mut Vec<Warning>,
    ) -> Result<Vec<ToolResult>> {
        if self.config.run_tools_in_parallel {
            let futures: Vec<_> = calls
                .iter()
                .map(|call| self.execute_one(call, cancel))
                .collect();
            let outcomes = futures_util::future::join_all(futures).await;

            let mut results = Vec::with_capacity(outcomes.len());
            for outcome in outcomes {
                results.push(self.capture(outcome, true, warnings)?);
            }
            Ok(results)
        } else {
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                cancel.check()?;
                let outcome = self.execute_one(call, cancel).await;
                results.push(self.capture(outcome, self.config.continue_on_tool_error, warnings)?);
            }
            Ok(results)
        }
    }

    /// Fold an execution outcome into a ToolResult, or propagate the error
    /// when the policy says to stop.
    fn capture(
        &self,
        outcome: CallOutcome,
        capture_errors: bool,
        warnings: &mut Vec<Warning>,
    ) -> Result<ToolResult> {
        match outcome {
            CallOutcome::Done(result) => Ok(result),
            CallOutcome::TimedOut { call, after } => {
                warnings.push(Warning::new(
                    codes::TOOL_TIMEOUT,
                    format!("tool '{}' timed out after {:?}", call.name, after),
                ));
                Ok(ToolResult::error(
                    call.id,
                    call.name,
                    format!("tool execution timed out after {after:?}"),
                ))
            }
            CallOutcome::Cancelled(e) => Err(e),
            CallOutcome::Failed { call, error } => {
                if capture_errors {
                    Ok(ToolResult::error(call.id, call.name, error.to_string()))
                } else {
                    Err(error)
                }
            }
        }
    }

    async fn execute_one(&self, call: &ToolCall, cancel: &CancellationToken) -> CallOutcome {
        let Some(tool) = self.tools.get(&call.name) else {
            // Unknown tool: report, never fatal. Duplicate ids from the
            // model are treated as distinct calls; ids are opaque here.
            return CallOutcome::Done(ToolResult::error(
                call.id.clone(),
                call.name.clone(),
                format!("unknown tool '{}'", call.name),
            ));
        };

        // Malformed arguments surface as a tool error result, not a failure
        // of the loop.
        let arguments = match call.arguments_json() {
            Ok(v) => v,
            Err(e) => {
                return CallOutcome::Done(ToolResult::error(
                    call.id.clone(),
                    call.name.clone(),
                    e.to_string(),
                ));
            }
        };

        tracing::debug!(tool = %call.name, call_id = %call.id, "executing tool");

        let execution = tool.execute(arguments, cancel.clone());
        let result = match self.config.tool_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, execution).await {
                Ok(r) => r,
                Err(_) => {
                    return CallOutcome::TimedOut {
                        call: call.clone(),
                        after: deadline,
                    };
                }
            },
            None => execution.await,
        };

        match result {
            Ok(value) => {
                CallOutcome::Done(ToolResult::json(call.id.clone(), call.name.clone(), value))
            }
            Err(e @ LlmError::Cancelled { .. }) => CallOutcome::Cancelled(e),
            Err(error) => CallOutcome::Failed {
                call: call.clone(),
                error,
            },
        }
    }
}

enum CallOutcome {
    Done(ToolResult),
    TimedOut { call: ToolCall, after: Duration },
    Cancelled(LlmError),
    Failed { call: ToolCall, error: LlmError },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_domain::stream::EventStream;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// A model that replays scripted responses.
    struct ScriptedModel {
        turns: Mutex<VecDeque<ChatResponse>>,
        seen_requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedModel {
        fn new(turns: Vec<ChatResponse>) -> Arc<Self> {
            Arc::new(Self {
                turns: Mutex::new(turns.into()),
                seen_requests: Mutex::new(Vec::new()),
            })
        }

        fn tool_call_response(calls: Vec<ToolCall>) -> ChatResponse {
            ChatResponse {
                tool_calls: calls,
                ..Default::default()
            }
        }
    }

    #[async_trait::async_trait]
    impl ChatCapability for ScriptedModel {
        async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
            self.seen_requests.lock().push(req.clone());
            self.turns
                .lock()
                .pop_front()
                .ok_or_else(|| LlmError::Generic("script exhausted".into()))
        }

        async fn chat_stream(&self, _req: &ChatRequest) -> Result<EventStream> {
            Err(LlmError::Generic("not scripted".into()))
        }
    }

    struct AddTool {
        schema: FunctionTool,
    }

    impl AddTool {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                schema: FunctionTool::new(
                    "add",
                    "add two integers",
                    serde_json::json!({
                        "type": "object",
                        "required": ["a", "b"],
                        "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
                    }),
                ),
            })
        }
    }

    #[async_trait::async_trait]
    impl ExecutableTool for AddTool {
        fn schema(&self) -> &FunctionTool {
            &self.schema
        }

        async fn execute(
            &self,
            arguments: serde_json::Value,
            _cancel: CancellationToken,
        ) -> Result<serde_json::Value> {
            let a = arguments["a"].as_i64().ok_or_else(|| {
                LlmError::InvalidRequest("missing 'a'".into())
            })?;
            let b = arguments["b"].as_i64().ok_or_else(|| {
                LlmError::InvalidRequest("missing 'b'".into())
            })?;
            Ok(serde_json::json!(a + b))
        }
    }

    struct SlowTool {
        schema: FunctionTool,
    }

    #[async_trait::async_trait]
    impl ExecutableTool for SlowTool {
        fn schema(&self) -> &FunctionTool {
            &self.schema
        }

        async fn execute(
            &self,
            _arguments: serde_json::Value,
            _cancel: CancellationToken,
        ) -> Result<serde_json::Value> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(serde_json::json!(null))
        }
    }

    #[tokio::test]
    async fn converges_after_one_tool_round() {
        let model = ScriptedModel::new(vec![
            ScriptedModel::tool_call_response(vec![ToolCall::new(
                "call_1",
                "add",
                "{\"a\":2,\"b\":3}",
            )]),
            ChatResponse::from_text("5"),
        ]);
        let agent = ToolLoopAgent::new(model.clone(), ToolLoopConfig::default())
            .with_tool(AddTool::new());

        let outcome = agent
            .run(vec![ModelMessage::user("add 2 and 3")], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.response.text.as_deref(), Some("5"));
        assert_eq!(outcome.iterations, 2);

        // history: user, assistant(tool_call), user(tool_result), assistant("5")
        assert_eq!(outcome.history.len(), 4);
        let calls = outcome.history[1].tool_calls();
        assert_eq!(calls.len(), 1);
        let results = outcome.history[2].tool_results_parts();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].call_id, calls[0].id);
        assert_eq!(results[0].payload_text(), "5");
        assert_eq!(outcome.history[3].joined_text(), "5");

        // The second model call saw the tool results.
        let seen = model.seen_requests.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].messages.len(), 3);
    }

    #[tokio::test]
    async fn result_ids_are_a_permutation_of_call_ids() {
        let calls = vec![
            ToolCall::new("c-a", "add", "{\"a\":1,\"b\":1}"),
            ToolCall::new("c-b", "add", "{\"a\":2,\"b\":2}"),
            ToolCall::new("c-c", "missing_tool", "{}"),
        ];
        let model = ScriptedModel::new(vec![
            ScriptedModel::tool_call_response(calls),
            ChatResponse::from_text("done"),
        ]);
        let agent = ToolLoopAgent::new(
            model,
            ToolLoopConfig {
                run_tools_in_parallel: true,
                ..Default::default()
            },
        )
        .with_tool(AddTool::new());

        let outcome = agent
            .run(vec![ModelMessage::user("go")], CancellationToken::new())
            .await
            .unwrap();

        let results = outcome.history[2].tool_results_parts();
        let mut ids: Vec<&str> = results.iter().map(|r| r.call_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["c-a", "c-b", "c-c"]);
        // Unknown tool reported as an error payload, not fatal.
        assert!(results.iter().any(|r| r.call_id == "c-c" && r.is_error()));
    }

    #[tokio::test]
    async fn max_iterations_returns_warning_not_error() {
        // The model asks for a tool forever.
        let wants_tools = || {
            ScriptedModel::tool_call_response(vec![ToolCall::new("c", "add", "{\"a\":1,\"b\":1}")])
        };
        let model = ScriptedModel::new(vec![wants_tools(), wants_tools(), wants_tools()]);
        let agent = ToolLoopAgent::new(
            model.clone(),
            ToolLoopConfig {
                max_iterations: 3,
                ..Default::default()
            },
        )
        .with_tool(AddTool::new());

        let outcome = agent
            .run(vec![ModelMessage::user("loop forever")], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.iterations, 3);
        assert_eq!(model.seen_requests.lock().len(), 3);
        assert!(outcome
            .response
            .warnings
            .iter()
            .any(|w| w.code == codes::TOOL_LOOP_MAX_ITERATIONS));
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_not_fatal() {
        let model = ScriptedModel::new(vec![
            ScriptedModel::tool_call_response(vec![ToolCall::new("c1", "ghost", "{}")]),
            ChatResponse::from_text("ok"),
        ]);
        let agent = ToolLoopAgent::new(model, ToolLoopConfig::default());

        let outcome = agent
            .run(vec![ModelMessage::user("go")], CancellationToken::new())
            .await
            .unwrap();
        let results = outcome.history[2].tool_results_parts();
        assert!(results[0].is_error());
        assert!(results[0].payload_text().contains("unknown tool"));
    }

    #[tokio::test]
    async fn empty_arguments_become_empty_object() {
        let model = ScriptedModel::new(vec![
            ScriptedModel::tool_call_response(vec![ToolCall::new("c1", "add", "")]),
            ChatResponse::from_text("ok"),
        ]);
        let agent = ToolLoopAgent::new(model, ToolLoopConfig::default()).with_tool(AddTool::new());

        let outcome = agent
            .run(vec![ModelMessage::user("go")], CancellationToken::new())
            .await
            .unwrap();
        // The executor rejected {} (missing 'a'); surfaced as an error
        // result, not a loop failure.
        let results = outcome.history[2].tool_results_parts();
        assert!(results[0].is_error());
    }

    #[tokio::test]
    async fn sequential_stop_on_error_propagates() {
        let model = ScriptedModel::new(vec![ScriptedModel::tool_call_response(vec![
            ToolCall::new("c1", "add", "{\"a\":1}"), // executor error: missing 'b'
        ])]);
        let agent = ToolLoopAgent::new(
            model,
            ToolLoopConfig {
                continue_on_tool_error: false,
                ..Default::default()
            },
        )
        .with_tool(AddTool::new());

        let err = agent
            .run(vec![ModelMessage::user("go")], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidRequest(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn tool_timeout_becomes_error_result() {
        let model = ScriptedModel::new(vec![
            ScriptedModel::tool_call_response(vec![ToolCall::new("c1", "slow", "{}")]),
            ChatResponse::from_text("ok"),
        ]);
        let agent = ToolLoopAgent::new(
            model,
            ToolLoopConfig {
                tool_timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        )
        .with_tool(Arc::new(SlowTool {
            schema: FunctionTool::new("slow", "sleeps forever", serde_json::json!({})),
        }));

        let outcome = agent
            .run(vec![ModelMessage::user("go")], CancellationToken::new())
            .await
            .unwrap();
        let results = outcome.history[2].tool_results_parts();
        assert!(results[0].is_error());
        assert!(results[0].payload_text().contains("timed out"));
        assert!(outcome
            .response
            .warnings
            .iter()
            .any(|w| w.code == codes::TOOL_TIMEOUT));
    }

    #[tokio::test]
    async fn cancellation_checked_between_iterations() {
        let cancel = CancellationToken::new();
        cancel.cancel(Some("user"));

        let model = ScriptedModel::new(vec![ChatResponse::from_text("never")]);
        let agent = ToolLoopAgent::new(model, ToolLoopConfig::default());

        let err = agent
            .run(vec![ModelMessage::user("go")], cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn duplicate_call_ids_each_get_a_result() {
        let model = ScriptedModel::new(vec![
            ScriptedModel::tool_call_response(vec![
                ToolCall::new("dup", "add", "{\"a\":1,\"b\":1}"),
                ToolCall::new("dup", "add", "{\"a\":2,\"b\":2}"),
            ]),
            ChatResponse::from_text("ok"),
        ]);
        let agent = ToolLoopAgent::new(model, ToolLoopConfig::default()).with_tool(AddTool::new());

        let outcome = agent
            .run(vec![ModelMessage::user("go")], CancellationToken::new())
            .await
            .unwrap();
        let results = outcome.history[2].tool_results_parts();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.call_id == "dup"));
    }
}
