//! Decoding the upstream's server-sent events.
//!
//! Bytes arrive in arbitrary pieces; [`SseDecoder`] buffers partial lines,
//! interprets each complete `data:` line and turns it into [`UpstreamEvent`]s.

use serde_json::Value;

use crate::errors::AppError;
use crate::models::chat::Usage;

/// One item of an upstream streaming response.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    /// Non-empty content increment.
    Delta(String),
    /// The upstream's terminal reason (`stop`, `length`, ...).
    Finish(String),
    Usage(Usage),
    /// The stream broke. Always the last item.
    Failed(AppError),
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    done: bool,
    chunk_count: u64,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the `[DONE]` marker has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    /// Feeds raw bytes and returns the events of every line they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<UpstreamEvent> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if self.done {
                continue;
            }
            let text = String::from_utf8_lossy(&line);
            if self.push_sse_line(&text, &mut out) {
                self.done = true;
            }
        }
        out
    }

    /// Flushes a trailing line that was never newline-terminated.
    pub fn finish(&mut self) -> Vec<UpstreamEvent> {
        let mut out = Vec::new();
        if self.buf.is_empty() || self.done {
            return out;
        }
        let rest = std::mem::take(&mut self.buf);
        let text = String::from_utf8_lossy(&rest);
        if self.push_sse_line(&text, &mut out) {
            self.done = true;
        }
        out
    }

    /// Handles one SSE line. Returns `true` on the `[DONE]` marker.
    fn push_sse_line(&mut self, line: &str, out: &mut Vec<UpstreamEvent>) -> bool {
        let line = line.trim();

        // Blank separators and `:` comments
        if line.is_empty() || line.starts_with(':') {
            return false;
        }

        let data = if let Some(stripped) = line.strip_prefix("data: ") {
            stripped.trim()
        } else if let Some(stripped) = line.strip_prefix("data:") {
            stripped.trim()
        } else {
            return false;
        };

        if data == "[DONE]" {
            return true;
        }

        self.chunk_count += 1;

        let json: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("skipping unparseable upstream chunk: {}", e);
                return false;
            }
        };

        decode_chunk(&json, out);
        false
    }
}

/// Extracts events from one upstream chunk object. Only the first choice is
/// relayed since the gateway always requests `n = 1`.
pub fn decode_chunk(json: &Value, out: &mut Vec<UpstreamEvent>) {
    if let Some(err) = json.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        out.push(UpstreamEvent::Failed(AppError::UpstreamUnavailable(format!(
            "upstream stream error: {}",
            message
        ))));
        return;
    }

    if let Some(choice) = json
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| {
            choices
                .iter()
                .find(|c| c.get("index").and_then(Value::as_u64).unwrap_or(0) == 0)
        })
    {
        if let Some(content) = choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
        {
            if !content.is_empty() {
                out.push(UpstreamEvent::Delta(content.to_string()));
            }
        }
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            out.push(UpstreamEvent::Finish(reason.to_string()));
        }
    }

    if let Some(usage) = json.get("usage").filter(|u| u.is_object()) {
        if let Ok(usage) = serde_json::from_value::<Usage>(usage.clone()) {
            out.push(UpstreamEvent::Usage(usage));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deltas(events: &[UpstreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                UpstreamEvent::Delta(d) => Some(d.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_lines_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let mut events = decoder.push(b"data: {\"choices\":[{\"index\":0,\"delta\":{\"con");
        assert!(events.is_empty());
        events.extend(decoder.push(b"tent\":\"Hel\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n"));
        assert_eq!(deltas(&events), "Hello");
        assert_eq!(decoder.chunk_count(), 2);
    }

    #[test]
    fn test_multibyte_split_is_reassembled() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"caf\u{e9}\"}}]}\n";
        let bytes = line.as_bytes();
        let cut = line.find('\u{e9}').unwrap() + 1;
        let mut decoder = SseDecoder::new();
        let mut events = decoder.push(&bytes[..cut]);
        events.extend(decoder.push(&bytes[cut..]));
        assert_eq!(deltas(&events), "caf\u{e9}");
    }

    #[test]
    fn test_done_marker_and_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(
            b": keep-alive\n\ndata: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\ndata: [DONE]\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n",
        );
        assert!(decoder.is_done());
        assert!(matches!(events.as_slice(), [UpstreamEvent::Finish(r)] if r == "stop"));
    }

    #[test]
    fn test_empty_choices_and_usage() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(
            b"data: {\"choices\":[],\"prompt_filter_results\":[]}\ndata: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n",
        );
        match events.as_slice() {
            [UpstreamEvent::Usage(u)] => assert_eq!(u.total_tokens, 5),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_payload_is_failure() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: {\"error\":{\"message\":\"overloaded\"}}\n");
        match events.as_slice() {
            [UpstreamEvent::Failed(e)] => assert!(e.to_string().contains("overloaded")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: [DONE]").is_empty());
        assert!(!decoder.is_done());
        decoder.finish();
        assert!(decoder.is_done());
    }
}
