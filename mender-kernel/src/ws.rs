/**
 * WORKER CHANNELS - WebSocket endpoints spoken by supervised workers
 *
 * IDENTITY  : one text message with the service name in, the minted
 *             instance id out, then the coordinator closes.
 * HEARTBEAT : `[<id>] [<severity>] [<ts>] Heartbeat|Exit` lines, usually one
 *             per connection.
 * STREAM    : long-lived log stream. The first message names the app
 *             (leading `[tag]`, else `App_<peer>`), every message is
 *             classified. ERROR/FATAL lines are persisted and trigger
 *             remediation; FATAL also closes the stream.
 *
 * Parse errors are connection-local: logged, the message is skipped and the
 * connection stays open.
 */

use crate::logline::{leading_tag, parse_line, Severity};
use crate::heartbeat::HeartbeatOutcome;
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

pub fn identity_router(state: AppState) -> Router {
    Router::new().route("/", get(identity_handler)).with_state(state)
}

pub fn heartbeat_router(state: AppState) -> Router {
    Router::new().route("/", get(heartbeat_handler)).with_state(state)
}

pub fn stream_router(state: AppState) -> Router {
    Router::new().route("/", get(stream_handler)).with_state(state)
}

async fn identity_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| identity_session(socket, state, peer))
}

async fn heartbeat_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| heartbeat_session(socket, state, peer))
}

async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| stream_session(socket, state, peer))
}

/// Next text payload; `None` once the peer closed or the socket failed.
async fn next_text(socket: &mut WebSocket, peer: SocketAddr) -> Option<String> {
    loop {
        match socket.recv().await? {
            Ok(Message::Text(text)) => return Some(text.as_str().to_string()),
            Ok(Message::Binary(bytes)) => return Some(String::from_utf8_lossy(&bytes).into_owned()),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => return None,
            Err(e) => {
                debug!(peer = %peer, "websocket receive failed: {e}");
                return None;
            }
        }
    }
}

async fn identity_session(mut socket: WebSocket, state: AppState, peer: SocketAddr) {
    let Some(text) = next_text(&mut socket, peer).await else { return };
    let name = text.trim();
    if name.is_empty() {
        warn!(peer = %peer, "identity request without a service name");
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let id = state.registry.lock().register(name);
    info!(service = %name, id = %id, peer = %peer, "instance registered");
    if let Err(e) = socket.send(Message::Text(id.into())).await {
        warn!(peer = %peer, "could not deliver instance id: {e}");
        return;
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn heartbeat_session(mut socket: WebSocket, state: AppState, peer: SocketAddr) {
    while let Some(text) = next_text(&mut socket, peer).await {
        let line = match parse_line(&text) {
            Ok(line) => line,
            Err(e) => {
                warn!(peer = %peer, "malformed heartbeat {text:?}: {e}");
                continue;
            }
        };
        let outcome = state.heartbeats.lock().record(&line, OffsetDateTime::now_utc());
        match outcome {
            HeartbeatOutcome::Recorded => debug!(id = %line.tag, "heartbeat"),
            HeartbeatOutcome::Departed => info!(id = %line.tag, "instance exited"),
            HeartbeatOutcome::AlreadyGone => debug!(id = %line.tag, "exit for untracked instance"),
            HeartbeatOutcome::Ignored(payload) => {
                warn!(id = %line.tag, "unknown heartbeat payload {payload:?}")
            }
        }
    }
}

/// What the stream loop does after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamAction {
    Continue,
    Close,
}

/// App identity of a stream, taken from its first message.
pub fn stream_identity(first: &str, peer: SocketAddr) -> String {
    leading_tag(first)
        .map(str::to_string)
        .unwrap_or_else(|| format!("App_{peer}"))
}

/// Classifies one stream message and applies its escalation.
pub fn handle_stream_message(state: &AppState, app: &str, text: &str) -> StreamAction {
    let line = match parse_line(text) {
        Ok(line) => line,
        Err(e) => {
            warn!(app = %app, "malformed log line {text:?}: {e}");
            return StreamAction::Continue;
        }
    };

    if !line.severity.escalates() {
        info!(app = %app, severity = %line.severity, "{}", line.message);
        return StreamAction::Continue;
    }

    let raw = text.trim_end_matches(['\r', '\n']);
    error!(app = %app, severity = %line.severity, "{}", line.message);
    state.failures.append(app, raw);
    state.remediator.trigger(app, &line.severity, raw);

    if line.severity == Severity::Fatal {
        StreamAction::Close
    } else {
        StreamAction::Continue
    }
}

async fn stream_session(mut socket: WebSocket, state: AppState, peer: SocketAddr) {
    let mut app: Option<String> = None;

    while let Some(text) = next_text(&mut socket, peer).await {
        let name = app.get_or_insert_with(|| {
            let name = stream_identity(&text, peer);
            info!(app = %name, peer = %peer, "log stream opened");
            name
        });

        if handle_stream_message(&state, name, &text) == StreamAction::Close {
            warn!(app = %name, "fatal failure, closing log stream");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    }

    if let Some(name) = app {
        debug!(app = %name, "log stream closed by worker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::SourceTree;
    use crate::failures::{parse_entries, FailureLog};
    use crate::fixer::UnconfiguredFixer;
    use crate::health::HealthTracker;
    use crate::heartbeat::HeartbeatTracker;
    use crate::registry::IdentityRegistry;
    use crate::remediation::Remediator;
    use std::sync::Arc;
    use std::time::Duration;

    fn state(dir: &std::path::Path) -> AppState {
        let failures = FailureLog::spawn(dir.join("log.txt"));
        let remediator = Remediator::new(
            Arc::new(UnconfiguredFixer),
            SourceTree::new(dir, vec!["py".into()]),
            failures.clone(),
        );
        AppState {
            registry: IdentityRegistry::shared(),
            heartbeats: HeartbeatTracker::shared(),
            failures,
            remediator,
            health_tracker: HealthTracker::new(),
            liveness_timeout: Duration::from_secs(5),
            api_key: None,
        }
    }

    #[test]
    fn test_stream_identity() {
        let peer: SocketAddr = "10.0.0.7:5555".parse().unwrap();
        assert_eq!(stream_identity("[worker-A] [INFO] [ts] up", peer), "worker-A");
        assert_eq!(stream_identity("hello there", peer), "App_10.0.0.7:5555");
    }

    #[tokio::test]
    async fn test_info_and_garbage_are_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());

        assert_eq!(handle_stream_message(&state, "w", "[w] [INFO] [ts] started"), StreamAction::Continue);
        assert_eq!(handle_stream_message(&state, "w", "not a log line"), StreamAction::Continue);
        assert_eq!(handle_stream_message(&state, "w", "[w] [WARNING] [ts] slow"), StreamAction::Continue);

        assert_eq!(state.failures.read_all().await.unwrap(), "");
        assert_eq!(state.remediator.status().completed_jobs, 0);
        assert!(!state.remediator.is_running());
    }

    #[tokio::test]
    async fn test_error_is_persisted_and_triggers() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());

        let action = handle_stream_message(&state, "worker-B", "[worker-B] [ERROR] [ts] NullReference\n");
        assert_eq!(action, StreamAction::Continue);
        state.remediator.wait_for_completed(1).await;

        let entries = parse_entries(&state.failures.read_all().await.unwrap());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].app, "worker-B");
        assert_eq!(entries[0].body, "[worker-B] [ERROR] [ts] NullReference\n");
        assert_eq!(state.remediator.status().history[0].job.app, "worker-B");
    }

    #[tokio::test]
    async fn test_fatal_closes_stream() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());

        let action = handle_stream_message(&state, "worker-C", "[worker-C] [FATAL] [ts] OutOfMemory");
        assert_eq!(action, StreamAction::Close);
        assert!(state.failures.read_all().await.unwrap().contains("OutOfMemory"));
    }
}
