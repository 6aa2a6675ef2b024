//! Classified model-response streams.
//!
//! A response stream yields [`StreamChunk`]s. Each chunk's kind is decided
//! once, where it is produced: provider errors, aborts and tool failures are
//! distinct variants and never reach the data handler. [`consume_stream`]
//! routes each variant to its [`ChunkHandler`] method and summarizes the
//! run.
//!
//! [`SseDecoder`] produces chunks from raw Server-Sent Events bytes,
//! classifying each `data:` payload by its JSON `type` field.

use futures::stream::FusedStream;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::pin;
use tracing::{debug, trace, warn};

// ── Chunks ─────────────────────────────────────────────────────────

/// One element of a response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk<T> {
    /// The provider reported an error mid-stream.
    Error(String),
    /// The provider ended the response early.
    Abort(Option<String>),
    /// A tool invoked during the response failed.
    ToolError {
        tool_name: Option<String>,
        error: String,
    },
    Data(T),
}

impl StreamChunk<Value> {
    /// Classify a decoded payload by its `type` field.
    pub fn classify(value: Value) -> Self {
        match value.get("type").and_then(Value::as_str) {
            Some("error") => StreamChunk::Error(error_message(&value)),
            Some("abort") => StreamChunk::Abort(
                value
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            ),
            Some("tool-error") => StreamChunk::ToolError {
                tool_name: value
                    .get("toolName")
                    .or_else(|| value.get("tool_name"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                error: error_message(&value),
            },
            _ => StreamChunk::Data(value),
        }
    }
}

/// Best-effort message from an `error` field: a string, an object with a
/// `message`, or the raw JSON.
fn error_message(value: &Value) -> String {
    match value.get("error") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
        None => value.to_string(),
    }
}

// ── SSE decoding ───────────────────────────────────────────────────

/// Incremental SSE line decoder.
///
/// Bytes are buffered until a full line arrives, so payloads and multi-byte
/// characters split across network chunks decode correctly. Comment lines
/// and non-`data` fields are skipped. `data: [DONE]` ends the stream and
/// everything after it is ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `[DONE]` has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed bytes and return every chunk completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamChunk<Value>> {
        let mut chunks = Vec::new();
        if self.done {
            return chunks;
        }
        self.buffer.extend_from_slice(bytes);

        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            self.decode_line(&String::from_utf8_lossy(&line), &mut chunks);
            if self.done {
                self.buffer.clear();
                break;
            }
        }
        chunks
    }

    /// Flush a final line that had no trailing newline.
    pub fn finish(&mut self) -> Vec<StreamChunk<Value>> {
        let mut chunks = Vec::new();
        if !self.done && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.decode_line(&String::from_utf8_lossy(&line), &mut chunks);
        }
        self.done = true;
        chunks
    }

    fn decode_line(&mut self, line: &str, chunks: &mut Vec<StreamChunk<Value>>) {
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') {
            return;
        }
        let Some(data) = line.strip_prefix("data:") else {
            trace!("Skipping SSE field: {line}");
            return;
        };
        let data = data.trim_start();
        if data == "[DONE]" {
            debug!("SSE stream done");
            self.done = true;
            return;
        }
        match serde_json::from_str::<Value>(data) {
            Ok(value) => chunks.push(StreamChunk::classify(value)),
            Err(e) => {
                warn!("Failed to parse SSE chunk: {e}");
                chunks.push(StreamChunk::Error(format!("unparsable stream chunk: {e}")));
            }
        }
    }
}

/// Decode a byte stream into classified chunks.
///
/// A transport error is passed through as the stream's `Err` item and ends
/// the stream. Polling after the end keeps yielding `None`.
pub fn decode_sse<S, B, E>(bytes: S) -> impl FusedStream<Item = Result<StreamChunk<Value>, E>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    let state = (
        Box::pin(bytes),
        SseDecoder::new(),
        VecDeque::<StreamChunk<Value>>::new(),
        false,
    );
    futures::stream::unfold(
        state,
        |(mut bytes, mut decoder, mut pending, mut ended)| async move {
            loop {
                if let Some(chunk) = pending.pop_front() {
                    return Some((Ok(chunk), (bytes, decoder, pending, ended)));
                }
                if ended || decoder.is_done() {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(b)) => pending.extend(decoder.push(b.as_ref())),
                    Some(Err(e)) => {
                        ended = true;
                        return Some((Err(e), (bytes, decoder, pending, ended)));
                    }
                    None => {
                        ended = true;
                        pending.extend(decoder.finish());
                    }
                }
            }
        },
    )
    .fuse()
}

// ── Consumption ────────────────────────────────────────────────────

/// Receives classified chunks from [`consume_stream`].
pub trait ChunkHandler<T> {
    fn on_data(&mut self, data: T);

    /// Called for `Error` chunks and for errors raised by the stream itself.
    fn on_error(&mut self, error: &str) {
        let _ = error;
    }

    fn on_tool_error(&mut self, tool_name: Option<&str>, error: &str) {
        let _ = (tool_name, error);
    }

    fn on_abort(&mut self, reason: Option<&str>) {
        let _ = reason;
    }
}

/// What happened while consuming a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub data_chunks: usize,
    pub errors: usize,
    pub tool_errors: usize,
    /// An `Abort` chunk ended consumption.
    pub aborted: bool,
    /// The stream itself failed and consumption stopped.
    pub stream_failed: bool,
}

/// Drain `stream`, routing each chunk to `handler`.
///
/// `Error` and `ToolError` chunks are reported and consumption continues. An
/// `Abort` chunk or a stream-level `Err` ends consumption. Stream errors are
/// routed to [`ChunkHandler::on_error`], never propagated.
pub async fn consume_stream<S, T, E, H>(stream: S, handler: &mut H) -> StreamSummary
where
    S: Stream<Item = Result<StreamChunk<T>, E>>,
    E: Display,
    H: ChunkHandler<T> + ?Sized,
{
    let mut stream = pin!(stream);
    let mut summary = StreamSummary::default();

    while let Some(item) = stream.next().await {
        match item {
            Ok(StreamChunk::Data(data)) => {
                summary.data_chunks += 1;
                handler.on_data(data);
            }
            Ok(StreamChunk::Error(error)) => {
                summary.errors += 1;
                handler.on_error(&error);
            }
            Ok(StreamChunk::ToolError { tool_name, error }) => {
                summary.tool_errors += 1;
                handler.on_tool_error(tool_name.as_deref(), &error);
            }
            Ok(StreamChunk::Abort(reason)) => {
                debug!("Stream aborted: {}", reason.as_deref().unwrap_or("no reason"));
                summary.aborted = true;
                handler.on_abort(reason.as_deref());
                break;
            }
            Err(e) => {
                warn!("Stream failed: {e}");
                summary.stream_failed = true;
                handler.on_error(&e.to_string());
                break;
            }
        }
    }

    summary
}
