//! Incremental decoder for `streamGenerateContent?alt=sse` bodies.

use super::types::{ApiErrorEnvelope, GenerateContentResponse};
use crate::error::ProxyError;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::collections::VecDeque;
use std::fmt::Display;
use tracing::debug;

/// Splits a byte stream into SSE event payloads (the joined `data:` lines).
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feeds raw bytes and returns every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = find_boundary(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(data) = event_data(&raw[..end]) {
                events.push(data);
            }
        }
        events
    }

    /// Flushes a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buffer);
        event_data(&raw)
    }
}

fn find_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|window| window == b"\n\n")
}

fn event_data(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let lines: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .collect();

    if lines.is_empty() {
        return None;
    }
    let data = lines.join("\n");
    if data.trim().is_empty() || data.trim() == "[DONE]" {
        return None;
    }
    Some(data)
}

fn parse_event(data: &str) -> Result<GenerateContentResponse, ProxyError> {
    if let Ok(envelope) = serde_json::from_str::<ApiErrorEnvelope>(data) {
        return Err(ProxyError::StreamInterrupted(envelope.error.message));
    }
    serde_json::from_str(data).map_err(|e| {
        debug!("Failed to parse SSE event: {}", data);
        ProxyError::StreamInterrupted(format!("undecodable stream event: {e}"))
    })
}

struct DecodeState<S> {
    bytes: S,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    finished: bool,
}

/// Turns a raw SSE byte stream into parsed backend chunks, in arrival order.
///
/// A transport error or an undecodable event yields one `StreamInterrupted`
/// error and ends the stream.
pub(crate) fn decode_events<S, E>(
    bytes: S,
) -> impl Stream<Item = Result<GenerateContentResponse, ProxyError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Display,
{
    let state = DecodeState {
        bytes,
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        finished: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(data) = state.pending.pop_front() {
                let item = parse_event(&data);
                if item.is_err() {
                    state.pending.clear();
                    state.finished = true;
                }
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(bytes)) => {
                    let events = state.decoder.push(&bytes);
                    state.pending.extend(events);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(ProxyError::StreamInterrupted(e.to_string())), state));
                }
                None => {
                    state.finished = true;
                    let tail = state.decoder.finish();
                    state.pending.extend(tail);
                }
            }
        }
    })
}
