//! Run-time governor for LLM-driven task agents.
//!
//! `cinch-governor` is the part of an agent that decides, on every turn, how
//! much conversational context to keep, whether the agent must stop, and how
//! to recover from a failed operation without tearing down the session. It
//! does not talk to a model provider or execute tools itself; hosts hand it
//! their history, their model descriptor, and their async operations, and the
//! governor hands back decisions.
//!
//! # Getting started
//!
//! ```ignore
//! use cinch_governor::prelude::*;
//!
//! let config = GovernorConfig::default().with_max_steps(30);
//! let budget = ModelBudget::new(128_000);
//! let source = CancelSource::new();
//! let handler = LoggingHandler;
//!
//! let mut governor = SessionGovernor::new(config, budget)
//!     .with_event_handler(&handler)
//!     .with_cancel_token(source.token());
//!
//! let mut history = vec![Message::system("You are a careful coding agent.")];
//! let end = governor
//!     .run(async |g| {
//!         let prompt = g.prepare_history(&history).into_owned();
//!         // call the model with `prompt`, execute tools, append results...
//!         history.push(Message::assistant_text("Done."));
//!         Outcome::<_, String>::Completed(TurnReport::finished(StepUsage::tokens(1_200)))
//!     })
//!     .await;
//!
//! println!("{end}");
//! ```
//!
//! # Where to find things
//!
//! - **Estimate token cost:** [`TokenEstimator`](context::estimator::TokenEstimator)
//!   and the tokenizer-backed [`DefaultEstimator`](context::estimator::DefaultEstimator).
//!
//! - **Keep history under the model's budget:** [`ContextTrimmer`](context::trimmer::ContextTrimmer),
//!   [`ModelBudget`](context::budget::ModelBudget), and
//!   [`ContextUsage`](context::budget::ContextUsage) for display.
//!
//! - **Decide when to stop:** [`StoppingConditionManager`](agent::stopping::StoppingConditionManager)
//!   with [`StopConditions`](agent::stopping::StopConditions).
//!
//! - **Survive failures:** [`retry_with_backoff`](resilience::retry::retry_with_backoff),
//!   [`execute_with_recovery`](resilience::recovery::execute_with_recovery),
//!   [`CancelSource`](resilience::cancel::CancelSource) /
//!   [`CancelToken`](resilience::cancel::CancelToken), and
//!   [`consume_stream`](resilience::streaming::consume_stream) for classified
//!   model-response streams.
//!
//! - **Observe decisions:** implement [`EventHandler`](agent::events::EventHandler)
//!   or use [`LoggingHandler`](agent::events::LoggingHandler).
//!
//! - **Put it all together:** [`SessionGovernor`](agent::session::SessionGovernor).
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`context`] | Token estimation, model budgets, FIFO history trimming |
//! | [`agent`] | Stop conditions, events, configuration, the session governor |
//! | [`resilience`] | Outcome type, retry with backoff, cancellation, recovery, stream classification, timeouts |
//!
//! # Design principles
//!
//! 1. **Never starve the conversation.** Trimming keeps the pinned system
//!    prompt and at least one evictable turn, even when that leaves the
//!    history over budget.
//!
//! 2. **Cancellation is not failure.** Every cancellable entry point returns
//!    an [`Outcome`](resilience::Outcome) with a distinct `Aborted` variant.
//!
//! 3. **Observability over magic.** Every trim, retry, recovery, and stop is
//!    reported through the [`EventHandler`](agent::events::EventHandler) the
//!    caller passes in. The governor owns no global logger.

pub mod agent;
pub mod context;
pub mod error;
pub mod prelude;
pub mod resilience;

pub use error::{GovernorError, Result};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// Message body: a plain string or an ordered list of typed parts.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One typed part of a structured message.
///
/// On the wire, parts are JSON objects tagged by `type`. Objects with an
/// unknown tag, or a known tag with missing fields, are kept verbatim as
/// [`ContentPart::Other`] so nothing from the conversation store is lost.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(from = "Value", into = "Value")]
pub enum ContentPart {
    Text {
        text: String,
    },
    /// A tool invocation requested by the assistant.
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: Option<Value>,
    },
    /// The result of a tool invocation, referencing it by `tool_call_id`.
    ToolResult {
        tool_call_id: String,
        tool_name: Option<String>,
        result: Value,
    },
    Other(Value),
}

/// Wire shape of the known part kinds.
#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum TaggedPart {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        #[serde(default, alias = "arguments", skip_serializing_if = "Option::is_none")]
        args: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        #[serde(default)]
        result: Value,
    },
}

impl From<Value> for ContentPart {
    fn from(value: Value) -> Self {
        match serde_json::from_value::<TaggedPart>(value.clone()) {
            Ok(TaggedPart::Text { text }) => ContentPart::Text { text },
            Ok(TaggedPart::ToolCall {
                tool_call_id,
                tool_name,
                args,
            }) => ContentPart::ToolCall {
                tool_call_id,
                tool_name,
                args,
            },
            Ok(TaggedPart::ToolResult {
                tool_call_id,
                tool_name,
                result,
            }) => ContentPart::ToolResult {
                tool_call_id,
                tool_name,
                result,
            },
            Err(_) => ContentPart::Other(value),
        }
    }
}

impl From<ContentPart> for Value {
    fn from(part: ContentPart) -> Self {
        let tagged = match part {
            ContentPart::Other(value) => return value,
            ContentPart::Text { text } => TaggedPart::Text { text },
            ContentPart::ToolCall {
                tool_call_id,
                tool_name,
                args,
            } => TaggedPart::ToolCall {
                tool_call_id,
                tool_name,
                args,
            },
            ContentPart::ToolResult {
                tool_call_id,
                tool_name,
                result,
            } => TaggedPart::ToolResult {
                tool_call_id,
                tool_name,
                result,
            },
        };
        serde_json::to_value(tagged).unwrap_or(Value::Null)
    }
}

/// A message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: MessageContent,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(MessageRole::User, content)
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::text(MessageRole::Assistant, content)
    }

    pub fn text(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn with_parts(role: MessageRole, parts: Vec<ContentPart>) -> Self {
        Self {
            role,
            content: MessageContent::Parts(parts),
        }
    }

    /// An assistant message carrying a single tool invocation.
    pub fn assistant_tool_call(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: Option<Value>,
    ) -> Self {
        Self::with_parts(
            MessageRole::Assistant,
            vec![ContentPart::ToolCall {
                tool_call_id: call_id.into(),
                tool_name: tool_name.into(),
                args,
            }],
        )
    }

    /// A `tool` message carrying the result of an earlier invocation.
    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        result: Value,
    ) -> Self {
        Self::with_parts(
            MessageRole::Tool,
            vec![ContentPart::ToolResult {
                tool_call_id: call_id.into(),
                tool_name: Some(tool_name.into()),
                result,
            }],
        )
    }

    /// The message body when it is plain text.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(text) => Some(text),
            MessageContent::Parts(_) => None,
        }
    }

    /// The typed parts of a structured message; empty for plain text.
    pub fn parts(&self) -> &[ContentPart] {
        match &self.content {
            MessageContent::Text(_) => &[],
            MessageContent::Parts(parts) => parts,
        }
    }
}

// ── History validation ─────────────────────────────────────────────

/// Check that every tool result references an earlier tool invocation and
/// that every `tool` message carries at least one tool result.
///
/// Returns the first violation found. Trimming never calls this; it is meant
/// for the boundary where histories enter the governor.
pub fn validate_history(history: &[Message]) -> Result<()> {
    let mut seen_calls: HashSet<&str> = HashSet::new();

    for (index, message) in history.iter().enumerate() {
        let mut has_result = false;
        for part in message.parts() {
            match part {
                ContentPart::ToolCall { tool_call_id, .. } => {
                    seen_calls.insert(tool_call_id.as_str());
                }
                ContentPart::ToolResult { tool_call_id, .. } => {
                    has_result = true;
                    if !seen_calls.contains(tool_call_id.as_str()) {
                        return Err(GovernorError::InvalidHistory {
                            index,
                            reason: format!(
                                "tool result references unknown call id '{tool_call_id}'"
                            ),
                        });
                    }
                }
                _ => {}
            }
        }

        if message.role == MessageRole::Tool && !has_result {
            return Err(GovernorError::InvalidHistory {
                index,
                reason: "tool message carries no tool-result part".into(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_constructors() {
        let sys = Message::system("hello");
        assert_eq!(sys.role, MessageRole::System);
        assert_eq!(sys.as_text(), Some("hello"));

        let user = Message::user("world");
        assert_eq!(user.role, MessageRole::User);

        let call = Message::assistant_tool_call("call-1", "read_file", Some(json!({"path": "a"})));
        assert_eq!(call.role, MessageRole::Assistant);
        assert!(call.as_text().is_none());
        assert_eq!(call.parts().len(), 1);

        let tool = Message::tool_result("call-1", "read_file", json!("contents"));
        assert_eq!(tool.role, MessageRole::Tool);
        assert!(matches!(
            &tool.parts()[0],
            ContentPart::ToolResult { tool_call_id, .. } if tool_call_id == "call-1"
        ));
    }

    #[test]
    fn parts_deserialize_by_type_tag() {
        let raw = json!({
            "role": "assistant",
            "content": [
                {"type": "text", "text": "Let me look."},
                {"type": "tool-call", "toolCallId": "c1", "toolName": "grep", "args": {"q": "x"}},
                {"type": "image", "url": "https://example.com/a.png"}
            ]
        });
        let msg: Message = serde_json::from_value(raw).unwrap();
        let parts = msg.parts();
        assert!(matches!(&parts[0], ContentPart::Text { text } if text == "Let me look."));
        assert!(matches!(
            &parts[1],
            ContentPart::ToolCall { tool_name, args: Some(_), .. } if tool_name == "grep"
        ));
        assert!(matches!(&parts[2], ContentPart::Other(v) if v["type"] == "image"));
    }

    #[test]
    fn known_tag_with_missing_fields_is_kept_as_other() {
        let part: ContentPart = serde_json::from_value(json!({"type": "tool-call"})).unwrap();
        assert!(matches!(part, ContentPart::Other(_)));
    }

    #[test]
    fn parts_serialize_with_type_tag() {
        let msg = Message::tool_result("c9", "shell", json!({"exit": 0}));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["role"], "tool");
        assert_eq!(value["content"][0]["type"], "tool-result");
        assert_eq!(value["content"][0]["toolCallId"], "c9");
        assert_eq!(value["content"][0]["result"]["exit"], 0);
    }

    #[test]
    fn plain_text_content_round_trips_as_string() {
        let value = serde_json::to_value(Message::user("hi")).unwrap();
        assert_eq!(value["content"], "hi");
    }

    #[test]
    fn validate_accepts_paired_call_and_result() {
        let history = vec![
            Message::system("sys"),
            Message::user("task"),
            Message::assistant_tool_call("c1", "read_file", None),
            Message::tool_result("c1", "read_file", json!("ok")),
        ];
        assert!(validate_history(&history).is_ok());
    }

    #[test]
    fn validate_rejects_orphan_result() {
        let history = vec![
            Message::user("task"),
            Message::tool_result("missing", "read_file", json!("ok")),
        ];
        let err = validate_history(&history).unwrap_err();
        assert!(matches!(err, GovernorError::InvalidHistory { index: 1, .. }));
    }

    #[test]
    fn validate_rejects_tool_message_without_result() {
        let history = vec![Message::text(MessageRole::Tool, "bare text")];
        assert!(validate_history(&history).is_err());
    }
}
