//! Token cost estimation for messages.
//!
//! Short texts are counted exactly with the `cl100k_base` BPE. Texts of
//! [`APPROXIMATION_THRESHOLD_CHARS`] characters or more are approximated at
//! [`APPROXIMATE_TOKENS_PER_CHAR`], which keeps large tool results from
//! paying for a full tokenization pass on every turn.
//!
//! Structured values (tool arguments, tool results, unknown parts) are costed
//! by their canonical JSON serialization. Serialization failure is never an
//! error: a fixed placeholder is costed instead.

use crate::{ContentPart, Message, MessageContent, MessageRole};
use serde::Serialize;
use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;
use tracing::{debug, warn};

/// Texts at least this long (in characters) are approximated instead of tokenized.
pub const APPROXIMATION_THRESHOLD_CHARS: usize = 12_000;

/// Tokens per character used by the approximation.
pub const APPROXIMATE_TOKENS_PER_CHAR: f64 = 0.4;

/// Role and formatting framing added to every message.
pub const MESSAGE_OVERHEAD: usize = 4;

/// Extra framing for `tool` role messages.
pub const TOOL_MESSAGE_OVERHEAD: usize = 15;

/// Function-call framing added to every tool invocation part.
pub const TOOL_CALL_OVERHEAD: usize = 10;

/// Costed in place of a value that cannot be serialized.
pub const UNSERIALIZABLE_PLACEHOLDER: &str = "[unserializable value]";

/// Estimates the token cost of a message.
///
/// Implementations must be cheap enough to call on every message of every
/// turn and must never panic. [`DefaultEstimator`] is the production
/// implementation; tests and hosts with provider-specific tokenizers can
/// supply their own.
pub trait TokenEstimator: Send + Sync {
    /// Estimated tokens for a single message, including framing overhead.
    fn estimate(&self, message: &Message) -> usize;

    /// Sum of [`estimate`](Self::estimate) over a slice of messages.
    fn estimate_all(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.estimate(m)).sum()
    }
}

impl<T: TokenEstimator + ?Sized> TokenEstimator for &T {
    fn estimate(&self, message: &Message) -> usize {
        (**self).estimate(message)
    }
}

impl<T: TokenEstimator + ?Sized> TokenEstimator for Box<T> {
    fn estimate(&self, message: &Message) -> usize {
        (**self).estimate(message)
    }
}

/// Adapter that turns a closure into a [`TokenEstimator`].
pub struct FnEstimator<F> {
    f: F,
}

impl<F> FnEstimator<F>
where
    F: Fn(&Message) -> usize + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> TokenEstimator for FnEstimator<F>
where
    F: Fn(&Message) -> usize + Send + Sync,
{
    fn estimate(&self, message: &Message) -> usize {
        (self.f)(message)
    }
}

/// Tokenizer-backed estimator implementing the standard cost rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEstimator;

impl TokenEstimator for DefaultEstimator {
    fn estimate(&self, message: &Message) -> usize {
        estimate_message(message)
    }
}

/// Estimate a message with the standard cost rules.
pub fn estimate_message(message: &Message) -> usize {
    let content = match &message.content {
        MessageContent::Text(text) => text_tokens(text),
        MessageContent::Parts(parts) => parts.iter().map(part_tokens).sum(),
    };

    let role_overhead = if message.role == MessageRole::Tool {
        TOOL_MESSAGE_OVERHEAD
    } else {
        0
    };

    content + MESSAGE_OVERHEAD + role_overhead
}

/// Estimate a single content part.
pub fn part_tokens(part: &ContentPart) -> usize {
    match part {
        ContentPart::Text { text } => text_tokens(text),
        ContentPart::ToolResult { result, .. } => estimate_value(result),
        ContentPart::ToolCall {
            tool_name, args, ..
        } => {
            let args_tokens = args.as_ref().map_or(0, estimate_value);
            text_tokens(tool_name) + TOOL_CALL_OVERHEAD + args_tokens
        }
        ContentPart::Other(value) => estimate_value(value),
    }
}

/// Token count for a piece of text.
pub fn text_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    if chars >= APPROXIMATION_THRESHOLD_CHARS {
        return approximate_tokens(chars);
    }
    match tokenizer() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => approximate_tokens(chars),
    }
}

/// Cost of a value's canonical serialization.
pub fn estimate_value<T: Serialize + ?Sized>(value: &T) -> usize {
    text_tokens(&canonical_string(value))
}

/// Canonical (compact JSON) form of a value, or the placeholder when the
/// value refuses to serialize.
pub fn canonical_string<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        debug!("Value not serializable for token estimation: {e}");
        UNSERIALIZABLE_PLACEHOLDER.to_string()
    })
}

fn approximate_tokens(chars: usize) -> usize {
    (chars as f64 * APPROXIMATE_TOKENS_PER_CHAR).ceil() as usize
}

/// Lazily constructed BPE shared by every estimator in the process.
///
/// `None` when construction failed; every text is approximated from then on.
fn tokenizer() -> Option<&'static CoreBPE> {
    static TOKENIZER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    TOKENIZER
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                warn!("Tokenizer unavailable, falling back to approximation: {e}");
                None
            }
        })
        .as_ref()
}
