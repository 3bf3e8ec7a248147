use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use butlerhub_core::{RequestId, TriggerSource};

use crate::error::Result;

/// A tool invocation made during a turn, recorded verbatim into the
/// session's `tool_calls` JSON column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub args: serde_json::Value,
    pub result: Option<serde_json::Value>,
}

/// One (prompt, trigger-source, optional context) request handed to an
/// agent runtime.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub prompt: String,
    pub trigger_source: TriggerSource,
    pub request_id: Option<RequestId>,
    pub parent_session_id: Option<String>,
    pub trace_id: Option<String>,
    pub context: Option<serde_json::Value>,
}

/// What a runtime produced for one turn.
#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    pub model: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub result: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cost: Option<f64>,
}

/// The seam between the spawner's session bookkeeping and whatever actually
/// drives an LLM turn. A real implementation streams tool calls to/from a
/// provider; `StubRuntime` below stands in wherever no provider is wired.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn run_turn(&self, request: &TurnRequest) -> Result<TurnOutcome>;
}

/// Deterministic runtime used in tests and in butlers that have not wired a
/// real agent provider. Echoes the prompt back as the result and records no
/// tool calls — this is intentionally inert, not a fallback conversational
/// agent.
pub struct StubRuntime;

#[async_trait]
impl AgentRuntime for StubRuntime {
    async fn run_turn(&self, request: &TurnRequest) -> Result<TurnOutcome> {
        Ok(TurnOutcome {
            model: Some("stub".to_string()),
            success: true,
            error: None,
            result: Some(format!("stub: {}", request.prompt)),
            tool_calls: Vec::new(),
            input_tokens: Some(0),
            output_tokens: Some(0),
            cost: Some(0.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_runtime_echoes_prompt() {
        let runtime = StubRuntime;
        let request = TurnRequest {
            prompt: "what's on today".to_string(),
            trigger_source: TriggerSource::Trigger,
            request_id: None,
            parent_session_id: None,
            trace_id: None,
            context: None,
        };
        let outcome = runtime.run_turn(&request).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.result.as_deref(), Some("stub: what's on today"));
    }
}
