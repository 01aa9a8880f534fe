use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt as _, AsyncRead, AsyncWrite, AsyncWriteExt as _, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::classify::{self, ErrorKind};
use crate::config::BridgeConfig;
use crate::jsonrpc::{self, Frame, JsonRpcId, codes};
use crate::queue::FrameQueue;
use crate::sender::{PostSender, SendError};
use crate::sse_client::{SseClient, SseSignal};
use crate::supervisor::{ReconnectPlan, Supervisor, SupervisorState};

const SHUTDOWN_SEND_TIMEOUT: Duration = Duration::from_millis(500);
const TIMEOUT_REASON_MARKER: &str = "Request timed out";

/// A POST in progress. Dropping the future aborts the request; the frame is
/// kept alongside so a torn-down connection can put it back at the queue
/// front.
struct Inflight {
    frame: Frame,
    fut: Pin<Box<dyn Future<Output = Result<(), SendError>> + Send>>,
}

/// Run the bridge over the given byte streams until the local client hangs
/// up or `shutdown` fires. All state lives on this task; the SSE
/// subscription and the signal listener only pass messages in.
pub async fn run<R, W>(
    config: BridgeConfig,
    reader: R,
    writer: W,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let http = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("build http client")?;
    let (sse_tx, mut sse_rx) = mpsc::unbounded_channel();

    let mut bridge = Bridge {
        supervisor: Supervisor::new(config.clone()),
        config,
        http,
        queue: FrameQueue::new(),
        out: writer,
        sse: None,
        sse_tx,
        generation: 0,
        sender: None,
        backoff_deadline: None,
        last_request_id: None,
        last_failure: "connection not established".to_string(),
    };

    let mut lines = BufReader::new(reader).lines();
    let mut inflight: Option<Inflight> = None;

    bridge.connect();

    loop {
        // Feed the POST channel whenever it is idle and the session is live.
        if inflight.is_none() && bridge.supervisor.is_ready() {
            if let Some(frame) = bridge.queue.pop_front() {
                inflight = bridge.begin_send(frame);
            }
        }

        let deadline = bridge.backoff_deadline;
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                inflight = None;
                return bridge.close().await;
            }

            res = poll_inflight(&mut inflight), if inflight.is_some() => {
                let frame = match inflight.take() {
                    Some(inf) => inf.frame,
                    None => continue,
                };
                bridge.on_send_result(frame, res, &mut inflight).await?;
            }

            _ = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)),
                if deadline.is_some() =>
            {
                bridge.connect();
            }

            signal = sse_rx.recv() => {
                let Some((generation, signal)) = signal else { continue };
                bridge.on_sse(generation, signal, &mut inflight).await?;
            }

            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => bridge.on_stdin(&line, &mut inflight).await?,
                    Ok(None) => {
                        info!("stdin closed; shutting down");
                        inflight = None;
                        return bridge.close().await;
                    }
                    Err(e) => {
                        warn!(error = %e, "stdin read failed; shutting down");
                        inflight = None;
                        return bridge.close().await;
                    }
                }
            }
        }
    }
}

/// Resolves when the in-flight POST does. The select guard keeps this from
/// being polled while there is none.
async fn poll_inflight(inflight: &mut Option<Inflight>) -> Result<(), SendError> {
    match inflight.as_mut() {
        Some(inf) => inf.fut.as_mut().await,
        None => std::future::pending().await,
    }
}

struct Bridge<W> {
    config: BridgeConfig,
    http: reqwest::Client,
    supervisor: Supervisor,
    queue: FrameQueue,
    out: W,
    sse: Option<SseClient>,
    sse_tx: mpsc::UnboundedSender<(u64, SseSignal)>,
    generation: u64,
    sender: Option<PostSender>,
    backoff_deadline: Option<tokio::time::Instant>,
    last_request_id: Option<JsonRpcId>,
    last_failure: String,
}

impl<W: AsyncWrite + Unpin> Bridge<W> {
    /// Open a fresh SSE subscription and prime the handshake so it is the
    /// first frame the new session sees.
    fn connect(&mut self) {
        self.backoff_deadline = None;
        let session_id = self.supervisor.begin_connect(Instant::now());
        let url = self.config.subscribe_url(&session_id);
        self.generation += 1;
        info!(
            attempt = self.supervisor.attempts(),
            session_id = %session_id,
            "connecting"
        );

        let client = SseClient::subscribe(
            self.http.clone(),
            url,
            self.generation,
            self.sse_tx.clone(),
        );
        if let Some(old) = self.sse.replace(client) {
            old.stop();
        }
        self.queue.promote_initialize();
    }

    fn begin_send(&mut self, frame: Frame) -> Option<Inflight> {
        let Some(sender) = self.sender.clone() else {
            // Readiness without a sender cannot happen mid-loop; put the
            // frame back rather than lose it.
            self.queue.push_front(frame);
            return None;
        };
        debug!(method = frame.method().unwrap_or("-"), "posting frame");
        let body = frame.clone();
        let fut = Box::pin(async move { sender.send(&body).await });
        Some(Inflight { frame, fut })
    }

    async fn on_send_result(
        &mut self,
        frame: Frame,
        result: Result<(), SendError>,
        inflight: &mut Option<Inflight>,
    ) -> anyhow::Result<()> {
        let Err(e) = result else { return Ok(()) };

        let kind = classify::classify_send_error(&e);
        warn!(error = %e, kind = ?kind, "post failed");
        // The frame never reached the server; requeue it ahead of anything
        // accepted later (notifications are best-effort and are dropped).
        if frame.id().is_some() {
            self.queue.push_front(frame);
        }
        self.fail_connection(kind, &e.to_string(), inflight, true)
            .await
    }

    async fn on_sse(
        &mut self,
        generation: u64,
        signal: SseSignal,
        inflight: &mut Option<Inflight>,
    ) -> anyhow::Result<()> {
        if generation != self.generation {
            debug!(generation, "discarding signal from superseded subscription");
            return Ok(());
        }

        match signal {
            SseSignal::Open => {
                debug!("sse subscription open");
                Ok(())
            }
            SseSignal::Endpoint(raw) => match self.config.resolve_endpoint(&raw) {
                Ok(endpoint) => {
                    self.mark_ready(endpoint);
                    Ok(())
                }
                Err(e) => {
                    self.fail_connection(
                        ErrorKind::ConnectionLost,
                        &format!("invalid endpoint event: {e:#}"),
                        inflight,
                        true,
                    )
                    .await
                }
            },
            SseSignal::Message(value) => {
                self.on_server_frame(Frame::from_value(value), inflight).await
            }
            SseSignal::Error { message, closed } => {
                if closed {
                    let kind = match classify::classify_message(&message) {
                        ErrorKind::SessionLost => ErrorKind::SessionLost,
                        _ => ErrorKind::ConnectionLost,
                    };
                    self.fail_connection(kind, &message, inflight, true).await
                } else {
                    // Bad payload on an otherwise healthy stream: surface a
                    // protocol error and keep the subscription.
                    warn!(error = %message, "dropping malformed sse payload");
                    self.emit(&jsonrpc::error_frame(
                        None,
                        codes::PARSE_ERROR,
                        &message,
                        serde_json::json!({}),
                    ))
                    .await
                }
            }
            SseSignal::Closed => {
                self.fail_connection(ErrorKind::ConnectionLost, "Connection lost", inflight, true)
                    .await
            }
        }
    }

    /// Server→client dispatch. Error responses are forwarded verbatim plus
    /// a `notifications/cancelled` derivative so clients that only watch
    /// notifications still observe the failure.
    async fn on_server_frame(
        &mut self,
        frame: Frame,
        inflight: &mut Option<Inflight>,
    ) -> anyhow::Result<()> {
        if !frame.is_error_response() {
            // Some servers skip the endpoint event; the first frame proves
            // the session is live. Only useful once the POST URL is known.
            if !self.supervisor.is_ready()
                && let Some(endpoint) = self.supervisor.session.endpoint.clone()
            {
                self.mark_ready(endpoint);
            }
            return self.emit(&frame).await;
        }

        let message = frame.error_message().unwrap_or_default().to_string();
        let request_id = frame.id_value().cloned().unwrap_or(Value::Null);
        self.emit(&frame).await?;
        self.emit(&jsonrpc::cancelled_notification(
            request_id,
            &format!("Error: {message}"),
        ))
        .await?;

        if classify::classify_message(&message) == ErrorKind::SessionLost {
            // Already surfaced through the forwarded pair; no advisory.
            self.fail_connection(ErrorKind::SessionLost, &message, inflight, false)
                .await?;
        }
        Ok(())
    }

    async fn on_stdin(
        &mut self,
        line: &str,
        inflight: &mut Option<Inflight>,
    ) -> anyhow::Result<()> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }

        let frame = match Frame::parse(line) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "invalid JSON on stdin");
                // No id is recoverable from a line that does not parse.
                return self
                    .emit(&jsonrpc::error_frame(
                        None,
                        codes::PARSE_ERROR,
                        &format!("Parse error: {e}"),
                        serde_json::json!({}),
                    ))
                    .await;
            }
        };

        if let Some(id) = frame.id() {
            self.last_request_id = Some(id);
            return self.route_request(frame).await;
        }
        self.route_notification(frame, inflight).await
    }

    /// Client frames with an id are never dropped: they are queued whenever
    /// the session is not live and replayed after the next handshake.
    async fn route_request(&mut self, frame: Frame) -> anyhow::Result<()> {
        match self.supervisor.state() {
            SupervisorState::Closing => Ok(()),
            SupervisorState::Recovery => {
                self.queue.push(frame);
                if self.supervisor.recovery_rearm_allowed(Instant::now()) {
                    info!("client traffic re-arms reconnection");
                    self.supervisor.reset_attempts();
                    self.connect();
                } else {
                    debug!(queued = self.queue.len(), "in recovery; frame queued");
                }
                Ok(())
            }
            _ => {
                // Ready included: the pump drains the queue in order, so
                // routing through it keeps one frame in flight at a time.
                self.queue.push(frame);
                Ok(())
            }
        }
    }

    async fn route_notification(
        &mut self,
        frame: Frame,
        inflight: &mut Option<Inflight>,
    ) -> anyhow::Result<()> {
        if frame.method() == Some(jsonrpc::CANCELLED_METHOD) {
            let params = frame.params().cloned().unwrap_or(Value::Null);

            if let Some(id) = params.get("requestId").and_then(JsonRpcId::from_value)
                && self.queue.remove_by_id(&id)
            {
                debug!(request_id = %id, "cancelled queued frame");
            }

            let reason = params
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if reason.contains(TIMEOUT_REASON_MARKER) {
                debug!(
                    consecutive = self.supervisor.consecutive_timeouts() + 1,
                    "client reported request timeout"
                );
                if self.supervisor.record_timeout() && self.supervisor.is_ready() {
                    // A sustained run of timeouts means the connection is
                    // gone, not the individual requests.
                    self.fail_connection(
                        ErrorKind::ConnectionLost,
                        "consecutive request timeouts",
                        inflight,
                        true,
                    )
                    .await?;
                    return Ok(());
                }
            }
        }

        if self.supervisor.is_ready() {
            self.queue.push(frame);
        } else {
            debug!(method = frame.method().unwrap_or("-"), "dropping notification while not ready");
        }
        Ok(())
    }

    fn mark_ready(&mut self, endpoint: Url) {
        if self.supervisor.is_ready() {
            return;
        }
        info!(endpoint = %endpoint, "session ready");
        self.sender = Some(PostSender::new(self.http.clone(), endpoint.clone()));
        self.supervisor.mark_ready(endpoint);
    }

    /// Tear the connection down and either schedule the next attempt or give
    /// up until client traffic re-arms us. `advisory` controls whether the
    /// client is told; exactly one advisory goes out per loss of readiness,
    /// and none when the cause was itself a forwarded server frame.
    async fn fail_connection(
        &mut self,
        kind: ErrorKind,
        cause: &str,
        inflight: &mut Option<Inflight>,
        advisory: bool,
    ) -> anyhow::Result<()> {
        warn!(kind = ?kind, error = %cause, state = ?self.supervisor.state(), "connection failure");
        self.last_failure = cause.to_string();

        if self.supervisor.is_ready() && advisory {
            self.emit(&jsonrpc::error_frame(
                self.last_request_id.clone(),
                classify::jsonrpc_code(kind),
                cause,
                serde_json::json!({}),
            ))
            .await?;
        }

        if let Some(sse) = self.sse.take() {
            sse.stop();
        }
        self.sender = None;
        if let Some(inf) = inflight.take() {
            if inf.frame.id().is_some() {
                self.queue.push_front(inf.frame);
            }
        }
        self.queue.drop_notifications();
        self.supervisor.clear_endpoint();
        self.queue.promote_initialize();

        match self.supervisor.plan_reconnect() {
            ReconnectPlan::Backoff(delay) => {
                debug!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                self.backoff_deadline = Some(tokio::time::Instant::now() + delay);
            }
            ReconnectPlan::Recovery => {
                let message = format!(
                    "Failed to reconnect after {} attempts: {}",
                    self.config.max_reconnect_attempts, self.last_failure
                );
                error!("{message}");
                self.backoff_deadline = None;
                self.emit(&jsonrpc::error_frame(
                    self.last_request_id.clone(),
                    codes::CONNECTION_CLOSED,
                    &message,
                    serde_json::json!({}),
                ))
                .await?;
            }
        }
        Ok(())
    }

    /// Graceful teardown: tell the server we are going, then stop.
    async fn close(&mut self) -> anyhow::Result<()> {
        self.supervisor.set_closing();
        self.backoff_deadline = None;
        info!("closing");

        if let Some(sender) = self.sender.take() {
            let notice = jsonrpc::shutdown_notification(chrono::Utc::now().timestamp_millis());
            match tokio::time::timeout(SHUTDOWN_SEND_TIMEOUT, sender.send(&notice)).await {
                Ok(Ok(())) => debug!("shutdown notification delivered"),
                Ok(Err(e)) => {
                    warn!(error = %e, "shutdown notification failed");
                    let _ = self
                        .emit(&jsonrpc::error_frame(
                            None,
                            codes::INTERNAL_ERROR,
                            &format!("shutdown notification failed: {e}"),
                            serde_json::json!({}),
                        ))
                        .await;
                }
                Err(_) => warn!("shutdown notification timed out"),
            }
        }

        if let Some(sse) = self.sse.take() {
            sse.stop();
        }
        let _ = self.out.flush().await;
        info!("closed");
        Ok(())
    }

    /// The single writer for stdout: one compact frame per line.
    async fn emit(&mut self, frame: &Frame) -> anyhow::Result<()> {
        let line = frame.to_line();
        self.out
            .write_all(line.as_bytes())
            .await
            .context("write frame")?;
        self.out.write_all(b"\n").await.context("write newline")?;
        self.out.flush().await.context("flush output")?;
        Ok(())
    }
}
