//! Chat Proxy (spec §4.5): the concurrency core. Serializes turns per
//! session, dispatches `task_tag` prompt rewriting, and streams events from
//! the in-container agent to the edge.
//!
//! Grounded on `api/proxy.rs`'s `proxy_opencode_events` (retry-connect SSE
//! GET against a per-session port, backoff on connection-refused while the
//! container is still starting) and the teacher's general per-session
//! `DashMap`/`Arc<Mutex<...>>` bookkeeping idiom.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use log::{debug, warn};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, AppResult};
use crate::session::{SessionRecord, SessionRegistry};

use super::events::{ChatEvent, dispatch};

const SSE_CONNECT_RETRY_WINDOW: Duration = Duration::from_secs(20);
const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct ChatProxy {
    sessions: Arc<SessionRegistry>,
    http: reqwest::Client,
    stream_timeout: Duration,
    request_timeout: Duration,
    /// Per-session turn lock: held for the duration of one turn, giving the
    /// "semaphore of one" the spec calls for (§4.5 concurrency model).
    turn_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    /// Per-turn cancellation handle, live only while a turn is in flight
    /// (spec §5 "a per-turn cancellation handle lives in the registry").
    /// `Arc`-wrapped so the background turn task shares the same map rather
    /// than a point-in-time snapshot of it.
    cancellations: Arc<DashMap<String, CancellationToken>>,
}

impl ChatProxy {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        request_timeout: Duration,
        stream_timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(stream_timeout)
            .build()
            .expect("building the chat proxy http client");
        Self {
            sessions,
            http,
            stream_timeout,
            request_timeout,
            turn_locks: DashMap::new(),
            cancellations: Arc::new(DashMap::new()),
        }
    }

    fn turn_lock(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        self.turn_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn active_session(&self, session_id: &str) -> AppResult<SessionRecord> {
        let record = self
            .sessions
            .lookup(session_id)
            .ok_or_else(|| AppError::NotFound(session_id.to_string()))?;
        if !record.is_active() {
            return Err(AppError::Unhealthy(format!(
                "session {session_id} is not active (status={:?})",
                record.status
            )));
        }
        Ok(record)
    }

    /// `chat` (spec §4.5): blocking variant, used only for short operations.
    /// Bounded by `request_timeout` rather than the (longer) stream timeout.
    pub async fn chat(
        &self,
        session_id: &str,
        prompt: &str,
        task_tag: &str,
    ) -> AppResult<Vec<ChatEvent>> {
        let mut stream = self.chat_stream(session_id, prompt, task_tag).await?;
        tokio::time::timeout(self.request_timeout, async move {
            let mut events = Vec::new();
            while let Some(event) = stream.recv().await {
                events.push(event);
            }
            events
        })
        .await
        .map_err(|_| AppError::Timeout(format!("chat({session_id}) exceeded request_timeout")))
    }

    /// `chat_stream` (spec §4.5): lazy, finite, non-restartable event
    /// sequence. Concurrent turns on the same session fail fast with *busy*
    /// (default policy) rather than queueing.
    pub async fn chat_stream(
        &self,
        session_id: &str,
        prompt: &str,
        task_tag: &str,
    ) -> AppResult<mpsc::Receiver<ChatEvent>> {
        let record = self.active_session(session_id)?;
        let api_port = record
            .api_port
            .ok_or_else(|| AppError::Internal(format!("session {session_id} has no api_port")))?;

        self.sessions.touch(session_id).await;

        let lock = self.turn_lock(session_id);
        let guard = lock.try_lock_owned().map_err(|_| AppError::Busy(session_id.to_string()))?;

        let cancel = CancellationToken::new();
        self.cancellations.insert(session_id.to_string(), cancel.clone());

        let command = dispatch(prompt, task_tag);
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let http = self.http.clone();
        let stream_timeout = self.stream_timeout;
        let session_id_owned = session_id.to_string();
        let cancellations = self.cancellations.clone();
        tokio::spawn(async move {
            let _guard = guard;
            run_turn(http, api_port, command, cancel.clone(), tx, stream_timeout).await;
            cancellations.remove(&session_id_owned);
        });

        Ok(rx)
    }

    /// `interrupt` (spec §4.5/§5): synchronous ack; triggers the handle if a
    /// turn is in flight, a no-op otherwise.
    pub fn interrupt(&self, session_id: &str) {
        if let Some((_, token)) = self.cancellations.remove(session_id) {
            token.cancel();
        }
    }
}

async fn run_turn(
    http: reqwest::Client,
    api_port: u16,
    command: super::events::AgentCommand,
    cancel: CancellationToken,
    tx: mpsc::Sender<ChatEvent>,
    stream_timeout: Duration,
) {
    let deadline = tokio::time::sleep(stream_timeout);
    tokio::pin!(deadline);

    let connect = connect_turn_stream(&http, api_port, &command);
    tokio::pin!(connect);

    let mut body_stream = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = tx.send(ChatEvent::Interrupted { reason: "user".into() }).await;
            return;
        }
        _ = &mut deadline => {
            let _ = tx.send(ChatEvent::Error { message: "timed out connecting to agent".into() }).await;
            return;
        }
        result = &mut connect => {
            match result {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx.send(ChatEvent::Error { message: e }).await;
                    return;
                }
            }
        }
    };

    let mut buf = Vec::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx.send(ChatEvent::Interrupted { reason: "user".into() }).await;
                return;
            }
            _ = &mut deadline => {
                let _ = tx.send(ChatEvent::Error { message: "turn exceeded stream_timeout".into() }).await;
                return;
            }
            chunk = body_stream.next() => {
                let Some(chunk) = chunk else {
                    let _ = tx.send(ChatEvent::Error { message: "upstream closed before a terminal event".into() }).await;
                    return;
                };
                let chunk = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(ChatEvent::Error { message: format!("upstream disconnected: {e}") }).await;
                        return;
                    }
                };
                buf.extend_from_slice(&chunk);
                for event in drain_sse_events(&mut buf) {
                    let terminal = event.is_terminal();
                    if tx.send(event).await.is_err() {
                        return;
                    }
                    if terminal {
                        return;
                    }
                }
            }
        }
    }
}

async fn connect_turn_stream(
    http: &reqwest::Client,
    api_port: u16,
    command: &super::events::AgentCommand,
) -> Result<impl futures::Stream<Item = reqwest::Result<Bytes>>, String> {
    let url = format!("http://127.0.0.1:{api_port}/v1/chat/stream");
    let start = tokio::time::Instant::now();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let result = http
            .post(&url)
            .header("Accept", "text/event-stream")
            .json(command)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => return Ok(response.bytes_stream()),
            Ok(response) => return Err(format!("agent returned {}", response.status())),
            Err(e) if e.is_connect() && start.elapsed() < SSE_CONNECT_RETRY_WINDOW => {
                let backoff = Duration::from_millis((attempt.min(20) as u64) * 100);
                debug!("agent not ready on port {api_port} (attempt {attempt}): {e}; retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e.to_string()),
        }
    }
}

/// Parses complete `data: <json>\n\n` frames out of `buf`, leaving any
/// trailing partial frame for the next chunk.
fn drain_sse_events(buf: &mut Vec<u8>) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    loop {
        let Some(pos) = find_double_newline(buf) else {
            break;
        };
        let frame: Vec<u8> = buf.drain(..pos + 2).collect();
        let text = String::from_utf8_lossy(&frame);
        for line in text.lines() {
            if let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
                match serde_json::from_str::<ChatEvent>(data.trim()) {
                    Ok(event) => events.push(event),
                    Err(e) => warn!("dropping malformed chat event frame: {e}"),
                }
            }
        }
    }
    events
}

fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}
