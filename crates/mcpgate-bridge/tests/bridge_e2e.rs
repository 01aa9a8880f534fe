use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context as _;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use futures::Stream;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Duration, sleep, timeout};
use tokio_util::sync::CancellationToken;

use mcpgate_bridge::{BridgeConfig, run};

#[derive(Clone)]
struct UpstreamState {
    auto_endpoint: bool,
    accepting: Arc<AtomicBool>,
    connections: Arc<Mutex<Vec<mpsc::UnboundedSender<Event>>>>,
    session_ids: Arc<Mutex<Vec<String>>>,
    posts: Arc<Mutex<Vec<String>>>,
}

async fn sse_handler(
    State(st): State<UpstreamState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    st.session_ids
        .lock()
        .await
        .push(query.get("session_id").cloned().unwrap_or_default());

    if !st.accepting.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let (tx, rx) = mpsc::unbounded_channel();
    if st.auto_endpoint {
        let _ = tx.send(Event::default().event("endpoint").data("/messages"));
    }
    st.connections.lock().await.push(tx);

    let stream =
        futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (Ok(ev), rx)) });
    Ok(Sse::new(stream))
}

async fn post_handler(State(st): State<UpstreamState>, body: String) -> StatusCode {
    st.posts.lock().await.push(body);
    StatusCode::ACCEPTED
}

struct Upstream {
    state: UpstreamState,
    url: String,
    task: tokio::task::JoinHandle<()>,
}

async fn start_upstream(auto_endpoint: bool) -> anyhow::Result<Upstream> {
    let state = UpstreamState {
        auto_endpoint,
        accepting: Arc::new(AtomicBool::new(true)),
        connections: Arc::new(Mutex::new(Vec::new())),
        session_ids: Arc::new(Mutex::new(Vec::new())),
        posts: Arc::new(Mutex::new(Vec::new())),
    };

    let app = Router::new()
        .route("/sse", get(sse_handler))
        .route("/messages", post(post_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind upstream")?;
    let addr = listener.local_addr().context("upstream local_addr")?;
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Ok(Upstream {
        state,
        url: format!("http://{addr}/sse"),
        task,
    })
}

impl Upstream {
    async fn send_event(&self, event: Event) -> anyhow::Result<()> {
        let connections = self.state.connections.lock().await;
        let tx = connections.last().context("no live sse connection")?;
        tx.send(event).ok().context("sse connection closed")?;
        Ok(())
    }

    async fn send_frame(&self, frame: Value) -> anyhow::Result<()> {
        self.send_event(Event::default().data(frame.to_string())).await
    }

    async fn send_endpoint(&self) -> anyhow::Result<()> {
        self.send_event(Event::default().event("endpoint").data("/messages"))
            .await
    }

    async fn drop_connections(&self) {
        self.state.connections.lock().await.clear();
    }

    async fn posts(&self) -> Vec<String> {
        self.state.posts.lock().await.clone()
    }

    async fn json_posts(&self) -> Vec<Value> {
        self.posts()
            .await
            .iter()
            .map(|body| serde_json::from_str(body).unwrap_or(Value::Null))
            .collect()
    }

    /// Wait until at least `n` frames were posted, then return all of them
    /// parsed.
    async fn json_posts_after(&self, n: usize) -> anyhow::Result<Vec<Value>> {
        self.wait_posts(n).await?;
        Ok(self.json_posts().await)
    }

    async fn wait_posts(&self, n: usize) -> anyhow::Result<Vec<String>> {
        timeout(Duration::from_secs(5), async {
            loop {
                let posts = self.posts().await;
                if posts.len() >= n {
                    return posts;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .with_context(|| format!("timeout waiting for {n} posts"))
    }

    async fn wait_connections(&self, n: usize) -> anyhow::Result<()> {
        timeout(Duration::from_secs(5), async {
            loop {
                if self.state.session_ids.lock().await.len() >= n {
                    return;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .with_context(|| format!("timeout waiting for {n} connections"))
    }

    async fn connection_count(&self) -> usize {
        self.state.session_ids.lock().await.len()
    }

    async fn session_ids(&self) -> Vec<String> {
        self.state.session_ids.lock().await.clone()
    }
}

struct TestBridge {
    stdin: tokio::io::WriteHalf<tokio::io::DuplexStream>,
    stdout: tokio::io::Lines<BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>>,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

fn fast_config(url: &str) -> BridgeConfig {
    let mut cfg = BridgeConfig::new(url).expect("config");
    cfg.base_reconnect_delay = Duration::from_millis(20);
    cfg.max_reconnect_delay = Duration::from_millis(100);
    cfg.recovery_interval = Duration::from_millis(250);
    cfg
}

fn start_bridge(cfg: BridgeConfig) -> TestBridge {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let (bridge_reader, bridge_writer) = tokio::io::split(remote);
    let (local_reader, local_writer) = tokio::io::split(local);

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(run(cfg, bridge_reader, bridge_writer, shutdown.clone()));

    TestBridge {
        stdin: local_writer,
        stdout: BufReader::new(local_reader).lines(),
        shutdown,
        task,
    }
}

impl TestBridge {
    async fn write_line(&mut self, line: &str) -> anyhow::Result<()> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn read_frame(&mut self) -> anyhow::Result<Value> {
        let line = timeout(Duration::from_secs(5), self.stdout.next_line())
            .await
            .context("timeout reading frame")?
            .context("read frame")?
            .context("bridge stdout closed")?;
        serde_json::from_str(&line).with_context(|| format!("parse frame: {line}"))
    }

    async fn expect_silence(&mut self, for_ms: u64) -> anyhow::Result<()> {
        match timeout(Duration::from_millis(for_ms), self.stdout.next_line()).await {
            Err(_) => Ok(()),
            Ok(line) => anyhow::bail!("unexpected frame on stdout: {line:?}"),
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        let _ = timeout(Duration::from_secs(2), self.task).await;
    }
}

#[tokio::test]
async fn ping_roundtrip_forwards_exactly_the_response() -> anyhow::Result<()> {
    let up = start_upstream(true).await?;
    let mut bridge = start_bridge(fast_config(&up.url));
    up.wait_connections(1).await?;

    bridge
        .write_line(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)
        .await?;

    let posts = up.wait_posts(2).await?;
    let first: Value = serde_json::from_str(&posts[0])?;
    assert_eq!(first["method"], "initialize");
    assert_eq!(first["id"], 0);
    // The frame reaches the wire byte-for-byte as its compact serialization.
    assert_eq!(posts[1], r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);

    up.send_frame(json!({"jsonrpc":"2.0","id":1,"result":{}})).await?;
    let frame = bridge.read_frame().await?;
    assert_eq!(frame, json!({"jsonrpc":"2.0","id":1,"result":{}}));
    bridge.expect_silence(100).await?;

    bridge.stop().await;
    up.task.abort();
    Ok(())
}

#[tokio::test]
async fn frames_queued_before_endpoint_drain_behind_handshake() -> anyhow::Result<()> {
    let up = start_upstream(false).await?;
    let mut bridge = start_bridge(fast_config(&up.url));
    up.wait_connections(1).await?;

    bridge
        .write_line(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)
        .await?;
    sleep(Duration::from_millis(50)).await;
    assert!(up.posts().await.is_empty(), "nothing may be sent before ready");

    up.send_endpoint().await?;

    let posts = up.json_posts_after(2).await?;
    assert_eq!(posts[0]["method"], "initialize");
    assert_eq!(posts[0]["id"], 0);
    assert_eq!(posts[1]["method"], "ping");
    assert_eq!(posts[1]["id"], 1);

    // Responses come back out in arrival order.
    up.send_frame(json!({"jsonrpc":"2.0","id":0,"result":{"capabilities":{}}}))
        .await?;
    up.send_frame(json!({"jsonrpc":"2.0","id":1,"result":{}})).await?;
    assert_eq!(bridge.read_frame().await?["id"], 0);
    assert_eq!(bridge.read_frame().await?["id"], 1);

    bridge.stop().await;
    up.task.abort();
    Ok(())
}

#[tokio::test]
async fn session_lost_error_is_forwarded_and_reconnects() -> anyhow::Result<()> {
    let up = start_upstream(true).await?;
    let mut bridge = start_bridge(fast_config(&up.url));
    up.wait_connections(1).await?;
    up.wait_posts(1).await?; // handshake confirms readiness

    up.send_frame(
        json!({"jsonrpc":"2.0","id":7,"error":{"code":-32601,"message":"Could not find session"}}),
    )
    .await?;

    let forwarded = bridge.read_frame().await?;
    assert_eq!(forwarded["id"], 7);
    assert_eq!(forwarded["error"]["message"], "Could not find session");

    let derived = bridge.read_frame().await?;
    assert_eq!(derived["method"], "notifications/cancelled");
    assert_eq!(derived["params"]["requestId"], 7);
    assert_eq!(derived["params"]["reason"], "Error: Could not find session");

    up.wait_connections(2).await?;
    // Same session id on the first retry after the drop.
    let ids = up.session_ids().await;
    assert_eq!(ids[1], ids[0]);

    bridge.stop().await;
    up.task.abort();
    Ok(())
}

#[tokio::test]
async fn other_errors_are_forwarded_without_reconnect() -> anyhow::Result<()> {
    let up = start_upstream(true).await?;
    let mut bridge = start_bridge(fast_config(&up.url));
    up.wait_connections(1).await?;
    up.wait_posts(1).await?;

    up.send_frame(json!({"jsonrpc":"2.0","id":7,"error":{"code":-32000,"message":"boom"}}))
        .await?;

    let forwarded = bridge.read_frame().await?;
    assert_eq!(forwarded["error"]["message"], "boom");
    let derived = bridge.read_frame().await?;
    assert_eq!(derived["method"], "notifications/cancelled");
    assert_eq!(derived["params"]["requestId"], 7);
    assert_eq!(derived["params"]["reason"], "Error: boom");

    sleep(Duration::from_millis(150)).await;
    assert_eq!(up.connection_count().await, 1, "no reconnect for plain errors");

    bridge.stop().await;
    up.task.abort();
    Ok(())
}

#[tokio::test]
async fn notifications_are_dropped_and_cancellation_removes_queued_frames() -> anyhow::Result<()> {
    let up = start_upstream(false).await?;
    let mut bridge = start_bridge(fast_config(&up.url));
    up.wait_connections(1).await?;

    bridge
        .write_line(r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{"token":1}}"#)
        .await?;
    bridge
        .write_line(r#"{"jsonrpc":"2.0","id":9,"method":"tools/list"}"#)
        .await?;
    bridge
        .write_line(
            r#"{"jsonrpc":"2.0","method":"notifications/cancelled","params":{"requestId":9,"reason":"user cancelled"}}"#,
        )
        .await?;
    sleep(Duration::from_millis(50)).await;

    up.send_endpoint().await?;
    let posts = up.json_posts_after(1).await?;
    sleep(Duration::from_millis(100)).await;
    let posts_after = up.json_posts().await;
    assert_eq!(posts_after.len(), posts.len(), "only the handshake goes out");
    assert_eq!(posts[0]["method"], "initialize");
    assert!(
        posts_after.iter().all(|p| p["id"] != 9),
        "cancelled frame must not be replayed"
    );
    assert!(
        posts_after
            .iter()
            .all(|p| p["method"] != "notifications/progress"),
        "not-ready notifications must not be replayed"
    );

    bridge.stop().await;
    up.task.abort();
    Ok(())
}

#[tokio::test]
async fn three_consecutive_timeouts_reconnect_once() -> anyhow::Result<()> {
    let up = start_upstream(true).await?;
    let mut bridge = start_bridge(fast_config(&up.url));
    up.wait_connections(1).await?;
    up.wait_posts(1).await?;

    for k in 1..=3 {
        bridge
            .write_line(&format!(
                r#"{{"jsonrpc":"2.0","method":"notifications/cancelled","params":{{"requestId":{k},"reason":"Request timed out"}}}}"#
            ))
            .await?;
    }

    // The escalation is surfaced once, as a lost connection.
    let advisory = bridge.read_frame().await?;
    assert_eq!(advisory["error"]["code"], -32000);

    up.wait_connections(2).await?;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(up.connection_count().await, 2, "exactly one reconnect cycle");

    bridge.stop().await;
    up.task.abort();
    Ok(())
}

#[tokio::test]
async fn queued_frames_survive_reconnect_in_order() -> anyhow::Result<()> {
    let up = start_upstream(true).await?;
    let mut bridge = start_bridge(fast_config(&up.url));
    up.wait_connections(1).await?;
    up.wait_posts(1).await?;

    up.drop_connections().await;

    // Losing the stream is announced once; frames written afterwards are
    // held until the next handshake.
    let advisory = bridge.read_frame().await?;
    assert_eq!(advisory["error"]["code"], -32000);

    bridge
        .write_line(r#"{"jsonrpc":"2.0","id":11,"method":"tools/list"}"#)
        .await?;
    bridge
        .write_line(r#"{"jsonrpc":"2.0","id":12,"method":"ping"}"#)
        .await?;

    up.wait_connections(2).await?;
    let posts = up.json_posts_after(4).await?;
    let tail: Vec<&Value> = posts.iter().skip(posts.len() - 3).collect();
    assert_eq!(tail[0]["method"], "initialize");
    assert_eq!(tail[1]["id"], 11);
    assert_eq!(tail[2]["id"], 12);

    bridge.stop().await;
    up.task.abort();
    Ok(())
}

#[tokio::test]
async fn recovery_stops_retries_until_client_traffic_rearms() -> anyhow::Result<()> {
    let up = start_upstream(true).await?;
    let mut cfg = fast_config(&up.url);
    cfg.base_reconnect_delay = Duration::from_millis(10);
    cfg.max_reconnect_attempts = 2;
    cfg.recovery_interval = Duration::from_millis(250);
    let mut bridge = start_bridge(cfg);
    up.wait_connections(1).await?;
    up.wait_posts(1).await?;

    up.state.accepting.store(false, Ordering::SeqCst);
    up.drop_connections().await;

    let advisory = bridge.read_frame().await?;
    assert_eq!(advisory["error"]["code"], -32000);

    let recovery = bridge.read_frame().await?;
    let message = recovery["error"]["message"].as_str().unwrap_or_default();
    assert!(
        message.starts_with("Failed to reconnect after 2 attempts"),
        "message={message}"
    );

    // Initial connection plus the two failed attempts.
    up.wait_connections(3).await?;
    let attempts_before = up.connection_count().await;

    // Traffic inside the quiet period does not re-arm.
    bridge
        .write_line(r#"{"jsonrpc":"2.0","id":21,"method":"ping"}"#)
        .await?;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(up.connection_count().await, attempts_before);

    sleep(Duration::from_millis(250)).await;
    up.state.accepting.store(true, Ordering::SeqCst);
    bridge
        .write_line(r#"{"jsonrpc":"2.0","id":22,"method":"ping"}"#)
        .await?;

    let posts = up.json_posts_after(4).await?;
    let tail: Vec<&Value> = posts.iter().skip(posts.len() - 3).collect();
    assert_eq!(tail[0]["method"], "initialize");
    assert_eq!(tail[1]["id"], 21);
    assert_eq!(tail[2]["id"], 22);

    bridge.stop().await;
    up.task.abort();
    Ok(())
}

#[tokio::test]
async fn session_id_rotates_from_third_reconnect_attempt() -> anyhow::Result<()> {
    let up = start_upstream(true).await?;
    let mut cfg = fast_config(&up.url);
    cfg.base_reconnect_delay = Duration::from_millis(10);
    cfg.max_reconnect_attempts = 5;
    let mut bridge = start_bridge(cfg);
    up.wait_connections(1).await?;
    up.wait_posts(1).await?;

    up.state.accepting.store(false, Ordering::SeqCst);
    up.drop_connections().await;

    // Initial connection plus five failed attempts.
    up.wait_connections(6).await?;
    let ids = up.session_ids().await;
    assert_eq!(ids[1], ids[0], "first retry reuses the original id");
    assert_eq!(ids[2], ids[0], "second retry reuses the original id");
    assert_ne!(ids[3], ids[0], "third retry rotates");
    assert_ne!(ids[4], ids[0]);
    assert_ne!(ids[4], ids[3], "rotated ids are fresh every attempt");

    bridge.stop().await;
    up.task.abort();
    Ok(())
}

#[tokio::test]
async fn shutdown_sends_cancellation_and_stops_cleanly() -> anyhow::Result<()> {
    let up = start_upstream(true).await?;
    let mut bridge = start_bridge(fast_config(&up.url));
    up.wait_connections(1).await?;

    bridge
        .write_line(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)
        .await?;
    up.wait_posts(2).await?;

    bridge.shutdown.cancel();

    let posts = up.json_posts_after(3).await?;
    let last = posts.last().context("missing shutdown post")?;
    assert_eq!(last["method"], "notifications/cancelled");
    assert_eq!(last["params"]["reason"], "Client shutting down");
    let request_id = last["params"]["requestId"].as_str().unwrap_or_default();
    assert!(request_id.starts_with("shutdown-"), "requestId={request_id}");

    let result = timeout(Duration::from_secs(1), bridge.task)
        .await
        .context("bridge did not stop in time")?
        .context("join bridge task")?;
    result.context("bridge run")?;

    // Stdout is closed; nothing further can be written.
    let eof = timeout(Duration::from_secs(1), bridge.stdout.next_line())
        .await
        .context("timeout waiting for stdout eof")??;
    assert_eq!(eof, None);

    up.task.abort();
    Ok(())
}

#[tokio::test]
async fn invalid_stdin_json_yields_parse_error_frame() -> anyhow::Result<()> {
    let up = start_upstream(true).await?;
    let mut bridge = start_bridge(fast_config(&up.url));
    up.wait_connections(1).await?;

    bridge.write_line("this is not json").await?;

    let frame = bridge.read_frame().await?;
    assert_eq!(frame["error"]["code"], -32700);
    let id = frame["id"].as_str().unwrap_or_default();
    assert!(id.starts_with("error-"), "synthesized id, got {id}");

    bridge.stop().await;
    up.task.abort();
    Ok(())
}
