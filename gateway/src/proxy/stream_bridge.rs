//! Stream bridge: turns an upstream SSE response into a channel of events.
//!
//! A background task owns the upstream connection. It reads with an idle
//! timeout, decodes lines with [`SseDecoder`] and forwards events. When the
//! receiving side is dropped (client disconnect) the task notices immediately,
//! even while blocked on upstream I/O, and drops the connection.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::errors::AppError;
use crate::proxy::stream::{SseDecoder, UpstreamEvent};

const CHANNEL_CAPACITY: usize = 64;

/// Finite, not restartable sequence of upstream increments.
pub type UpstreamEventStream = ReceiverStream<UpstreamEvent>;

pub fn bridge_sse_response(resp: reqwest::Response, idle_timeout: Duration) -> UpstreamEventStream {
    let (tx, rx) = mpsc::channel::<UpstreamEvent>(CHANNEL_CAPACITY);
    let mut byte_stream = resp.bytes_stream();

    tokio::spawn(async move {
        let mut decoder = SseDecoder::new();
        let mut finished = false;

        loop {
            let next = tokio::select! {
                _ = tx.closed() => {
                    tracing::debug!(chunks = decoder.chunk_count(), "stream consumer dropped, closing upstream");
                    return;
                }
                next = tokio::time::timeout(idle_timeout, byte_stream.next()) => next,
            };

            let events = match next {
                Err(_) => vec![UpstreamEvent::Failed(AppError::UpstreamUnavailable(format!(
                    "upstream stream idle for more than {}s",
                    idle_timeout.as_secs()
                )))],
                Ok(Some(Err(e))) => vec![UpstreamEvent::Failed(AppError::UpstreamUnavailable(
                    format!("upstream stream broke: {}", e),
                ))],
                Ok(Some(Ok(bytes))) => decoder.push(&bytes),
                Ok(None) => {
                    let mut tail = decoder.finish();
                    let saw_finish =
                        finished || tail.iter().any(|e| matches!(e, UpstreamEvent::Finish(_)));
                    if !decoder.is_done() && !saw_finish {
                        tail.push(UpstreamEvent::Failed(AppError::UpstreamUnavailable(
                            "upstream closed the stream before it finished".to_string(),
                        )));
                    }
                    for event in tail {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    return;
                }
            };

            for event in events {
                let terminal = matches!(event, UpstreamEvent::Failed(_));
                if matches!(event, UpstreamEvent::Finish(_)) {
                    finished = true;
                }
                if let UpstreamEvent::Failed(e) = &event {
                    tracing::warn!(chunks = decoder.chunk_count(), "upstream stream failed: {}", e);
                }
                if tx.send(event).await.is_err() || terminal {
                    return;
                }
            }

            if decoder.is_done() {
                tracing::debug!(chunks = decoder.chunk_count(), "upstream stream completed");
                return;
            }
        }
    });

    ReceiverStream::new(rx)
}
