//! Adapts a backend chunk stream to Ollama's chat response contract.

use crate::error::ProxyError;
use crate::gemini::types::{GenerateContentResponse, UsageMetadata};
use crate::gemini::ChunkStream;
use crate::mapper::{self, created_at};
use crate::patch::PatchContext;
use bytes::Bytes;
use futures_util::{stream, Stream, StreamExt};
use gemini_proxy_shared::{ResponseMessage, StreamChunk};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

/// Records buffered between the backend pump and a slow client.
pub const CHANNEL_CAPACITY: usize = 16;

/// Aggregates what the terminal record reports.
#[derive(Debug)]
struct GenerationStats {
    started: Instant,
    opened: Instant,
    first_chunk: Option<Instant>,
    usage: Option<UsageMetadata>,
    finish_reason: Option<String>,
}

impl GenerationStats {
    fn new(started: Instant) -> Self {
        Self {
            started,
            opened: Instant::now(),
            first_chunk: None,
            usage: None,
            finish_reason: None,
        }
    }

    fn observe(&mut self, chunk: &GenerateContentResponse) {
        self.first_chunk.get_or_insert_with(Instant::now);
        // Usage is cumulative; the last report wins.
        if chunk.usage_metadata.is_some() {
            self.usage = chunk.usage_metadata;
        }
        if let Some(reason) = chunk.finish_reason() {
            self.finish_reason = Some(reason.to_string());
        }
    }

    fn terminal(&self, model: &str, content: String, failure: Option<&ProxyError>) -> StreamChunk {
        let now = Instant::now();
        let first = self.first_chunk.unwrap_or(now);
        let usage = self.usage.unwrap_or_default();

        StreamChunk {
            model: model.to_string(),
            created_at: created_at(),
            message: ResponseMessage::assistant(content),
            done: true,
            done_reason: Some(match failure {
                Some(_) => "error".to_string(),
                None => mapper::done_reason(self.finish_reason.as_deref()),
            }),
            total_duration: Some(nanos(now.saturating_duration_since(self.started))),
            load_duration: Some(nanos(self.opened.saturating_duration_since(self.started))),
            prompt_eval_count: Some(usage.prompt_token_count.unwrap_or(0)),
            prompt_eval_duration: Some(nanos(first.saturating_duration_since(self.opened))),
            eval_count: Some(usage.candidates_token_count.unwrap_or(0)),
            eval_duration: Some(nanos(now.saturating_duration_since(first))),
            error: failure.map(ToString::to_string),
        }
    }
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX).max(1)
}

fn blocked(reason: &str) -> ProxyError {
    ProxyError::BackendRejected {
        status: 400,
        message: format!("Response blocked by Gemini: {reason}"),
    }
}

/// Client-facing record stream. Dropping it cancels the backend call.
pub struct ChatStream {
    records: ReceiverStream<StreamChunk>,
    _cancel_on_drop: DropGuard,
}

impl Stream for ChatStream {
    type Item = StreamChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.records).poll_next(cx)
    }
}

/// Starts pumping `chunks` into a bounded channel and returns the record stream.
///
/// Without a patch, every backend chunk becomes one record as it arrives.
/// With a patch, text is held back until the backend finishes and then sent
/// as a single record. Either way the `done` record comes last, exactly once,
/// even when the backend stream breaks.
pub fn stream_chat(
    chunks: ChunkStream,
    patch: PatchContext,
    model: String,
    started: Instant,
    cancel: CancellationToken,
) -> ChatStream {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let stats = GenerationStats::new(started);

    tokio::spawn(pump(chunks, patch, model, stats, cancel.clone(), tx));

    ChatStream {
        records: ReceiverStream::new(rx),
        _cancel_on_drop: cancel.drop_guard(),
    }
}

async fn pump(
    mut chunks: ChunkStream,
    patch: PatchContext,
    model: String,
    mut stats: GenerationStats,
    cancel: CancellationToken,
    tx: mpsc::Sender<StreamChunk>,
) {
    let mut buffered = String::new();
    let mut failure: Option<ProxyError> = None;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(model = %model, "Client went away, dropping backend stream");
                return;
            }
            next = chunks.next() => next,
        };

        let chunk = match next {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                warn!(model = %model, error = %e, "Backend stream ended abnormally");
                failure = Some(e);
                break;
            }
            None => break,
        };

        stats.observe(&chunk);
        if let Some(reason) = chunk.block_reason() {
            warn!(model = %model, reason, "Backend blocked the response mid-stream");
            failure = Some(blocked(reason));
            break;
        }

        if patch.is_patch {
            buffered.push_str(&chunk.text());
            continue;
        }
        if !send(&tx, &cancel, mapper::from_backend_chunk(&chunk, &model)).await {
            return;
        }
    }

    if patch.is_patch && (failure.is_none() || !buffered.is_empty()) {
        debug!(model = %model, len = buffered.len(), "Emitting buffered patch");
        let record = StreamChunk::delta(model.as_str(), created_at(), buffered);
        if !send(&tx, &cancel, record).await {
            return;
        }
    }

    let terminal = stats.terminal(&model, String::new(), failure.as_ref());
    send(&tx, &cancel, terminal).await;
}

/// Waits for channel capacity. Returns false once the client is gone.
async fn send(
    tx: &mpsc::Sender<StreamChunk>,
    cancel: &CancellationToken,
    record: StreamChunk,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        result = tx.send(record) => result.is_ok(),
    }
}

/// Waits for the first backend chunk and puts it back in front.
///
/// Failures and prompt blocks that arrive before any output surface here as
/// errors, while the response status can still reflect them.
pub async fn await_first_chunk(mut chunks: ChunkStream) -> Result<ChunkStream, ProxyError> {
    let first = match chunks.next().await {
        Some(first) => first?,
        None => return Ok(stream::empty().boxed()),
    };
    if let Some(reason) = first.block_reason() {
        return Err(blocked(reason));
    }
    Ok(stream::once(async move { Ok(first) }).chain(chunks).boxed())
}

/// Drains the backend stream into one complete, terminal-shaped response.
pub async fn collect_chat(
    mut chunks: ChunkStream,
    model: &str,
    started: Instant,
) -> Result<StreamChunk, ProxyError> {
    let mut stats = GenerationStats::new(started);
    let mut content = String::new();

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        stats.observe(&chunk);
        if let Some(reason) = chunk.block_reason() {
            return Err(blocked(reason));
        }
        content.push_str(&chunk.text());
    }

    Ok(stats.terminal(model, content, None))
}

/// Serializes a record as one ndjson line.
pub fn ndjson_line(record: &StreamChunk) -> Result<Bytes, serde_json::Error> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}
