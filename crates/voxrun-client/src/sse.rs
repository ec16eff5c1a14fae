//! Server-Sent Events framing.

use std::collections::VecDeque;

use futures_util::stream::{self, Stream, StreamExt};

use crate::error::ClientError;

/// Event name used when a frame carries no `event:` field.
const DEFAULT_EVENT: &str = "message";

/// One complete SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental SSE parser.
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence or
/// between the two newlines that end a frame.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    partial: Vec<u8>,
    /// A chunk ended on `\r`; its meaning depends on the next byte.
    pending_cr: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.partial.extend_from_slice(chunk);
        let valid = match std::str::from_utf8(&self.partial) {
            Ok(text) => text.len(),
            Err(e) => e.valid_up_to(),
        };
        let tail = self.partial.split_off(valid);
        let mut text = String::with_capacity(self.partial.len() + 1);
        if self.pending_cr {
            text.push('\r');
        }
        text.push_str(&String::from_utf8_lossy(&self.partial));
        self.partial = tail;

        // CRLF, CR and LF all end a line.
        self.pending_cr = text.ends_with('\r');
        if self.pending_cr {
            text.pop();
        }
        self.buffer
            .push_str(&text.replace("\r\n", "\n").replace('\r', "\n"));

        let mut frames = Vec::new();
        while let Some(frame) = extract_frame(&mut self.buffer) {
            if let Some(frame) = frame {
                frames.push(frame);
            }
        }
        frames
    }
}

/// Extract one frame from the buffer.
///
/// Returns `Some(Some(frame))` for a complete frame, `Some(None)` for a
/// comment or empty block, and `None` when no complete frame is buffered.
fn extract_frame(buffer: &mut String) -> Option<Option<SseFrame>> {
    let end_idx = buffer.find("\n\n")?;
    let block = buffer[..end_idx].to_string();
    buffer.drain(..end_idx + 2);

    let mut event = String::new();
    let mut data: Vec<&str> = Vec::new();
    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = value.to_string(),
            "data" => data.push(value),
            _ => {}
        }
    }

    if data.is_empty() {
        return Some(None);
    }
    if event.is_empty() {
        event = DEFAULT_EVENT.to_string();
    }
    Some(Some(SseFrame {
        event,
        data: data.join("\n"),
    }))
}

/// Turn a byte stream into a stream of SSE frames.
///
/// The frame stream ends when the byte stream ends; a transport error is
/// yielded once and ends the stream.
pub fn sse_frames<S, B, E>(body: S) -> impl Stream<Item = Result<SseFrame, ClientError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<ClientError> + Send,
{
    let state = (body, SseParser::new(), VecDeque::new());
    stream::unfold(Some(state), |state| async move {
        let (mut body, mut parser, mut ready) = state?;
        loop {
            if let Some(frame) = ready.pop_front() {
                return Some((Ok(frame), Some((body, parser, ready))));
            }
            match body.next().await {
                Some(Ok(chunk)) => ready.extend(parser.push(chunk.as_ref())),
                Some(Err(e)) => return Some((Err(e.into()), None)),
                None => return None,
            }
        }
    })
}
