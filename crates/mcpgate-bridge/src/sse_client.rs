use futures::StreamExt as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::sse::{SseDecoder, SseEvent};

/// Signal surfaced by an SSE subscription.
#[derive(Debug)]
pub enum SseSignal {
    Open,
    /// The named `endpoint` event: the POST URL for this session, absolute
    /// or relative to the subscribe URL.
    Endpoint(String),
    /// A default `message` event carrying one server→client frame.
    Message(serde_json::Value),
    /// `closed` is true when the underlying connection is gone.
    Error { message: String, closed: bool },
    Closed,
}

/// One SSE subscription, pinned to a generation number.
///
/// The supervisor replaces the whole client on every (re)connect; signals
/// are stamped with the generation so the event loop can discard anything a
/// superseded subscription managed to emit before its abort landed.
pub struct SseClient {
    generation: u64,
    cancel: CancellationToken,
}

impl SseClient {
    pub fn subscribe(
        http: reqwest::Client,
        url: Url,
        generation: u64,
        tx: mpsc::UnboundedSender<(u64, SseSignal)>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            run_subscription(http, url, generation, tx, task_cancel).await;
        });
        Self { generation, cancel }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Abort the in-flight request. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SseClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_subscription(
    http: reqwest::Client,
    url: Url,
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, SseSignal)>,
    cancel: CancellationToken,
) {
    let emit = |sig: SseSignal| {
        let _ = tx.send((generation, sig));
    };

    let request = http
        .get(url.clone())
        .header("accept", "text/event-stream")
        .send();
    let resp = tokio::select! {
        _ = cancel.cancelled() => return,
        r = request => r,
    };

    let resp = match resp {
        Ok(r) => r,
        Err(e) => {
            emit(SseSignal::Error {
                message: format!("fetch failed: {e}"),
                closed: true,
            });
            return;
        }
    };
    if !resp.status().is_success() {
        emit(SseSignal::Error {
            message: format!("subscribe failed: http status {}", resp.status().as_u16()),
            closed: true,
        });
        return;
    }

    debug!(generation, "sse stream open");
    emit(SseSignal::Open);

    let mut decoder = SseDecoder::new();
    let mut stream = resp.bytes_stream();
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return,
            c = stream.next() => c,
        };
        match chunk {
            Some(Ok(bytes)) => {
                for event in decoder.feed(&bytes) {
                    dispatch(event, &emit);
                }
            }
            Some(Err(e)) => {
                emit(SseSignal::Error {
                    message: format!("network error: {e}"),
                    closed: true,
                });
                return;
            }
            None => {
                emit(SseSignal::Closed);
                return;
            }
        }
    }
}

fn dispatch(event: SseEvent, emit: &impl Fn(SseSignal)) {
    match event.event.as_deref() {
        Some("endpoint") => emit(SseSignal::Endpoint(event.data)),
        None | Some("message") => match serde_json::from_str(&event.data) {
            Ok(v) => emit(SseSignal::Message(v)),
            Err(e) => emit(SseSignal::Error {
                message: format!("invalid JSON in sse message: {e}"),
                closed: false,
            }),
        },
        Some(other) => debug!(event = other, "ignoring unknown sse event"),
    }
}
