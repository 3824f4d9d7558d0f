use axum::{
    Json, Router,
    routing::get,
    response::IntoResponse,
    extract::{
        ws::{WebSocket, WebSocketUpgrade, Message},
        State, ConnectInfo,
    },
    http::StatusCode,
};
use serde_json::json;
use tower_http::cors::{CorsLayer, Any};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use std::net::{SocketAddr, IpAddr};
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;

use crate::config::Config;
use crate::metrics::Metrics;
use crate::protocol::{
    ClientMessage, ErrorCode, QueryResultPayload, ServerMessage, SubmitResultPayload, SubmitStatus,
    PROTOCOL_VERSION,
};
use crate::query::{CachedQuery, LoadOutcome};
use crate::session::{Session, SessionManager};

#[derive(Clone)]
pub struct AppState {
    pub session_manager: Arc<SessionManager>,
    pub metrics: Arc<Metrics>,
    pub config: Config,
}

pub fn router(state: AppState) -> Router {
    let ws_path = state.config.server.ws_path.clone();

    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(stats_handler))
        .route(&ws_path, get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

pub async fn run(
    config: Config,
    session_manager: Arc<SessionManager>,
    metrics: Arc<Metrics>,
) -> Result<()> {
    let addr: SocketAddr = config.server.bind_addr.parse()?;
    let app = router(AppState {
        session_manager,
        metrics,
        config,
    });

    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "active_sessions": state.session_manager.active_count(),
        "suspicious_sessions": state.session_manager.suspicious_count(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let ip = addr.ip();
    let max_frame = state.config.server.max_frame_bytes;
    ws.max_message_size(max_frame)
        .on_upgrade(move |socket| handle_socket(socket, state, ip))
}

async fn send_message(socket: &mut WebSocket, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => socket.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            error!("Failed to encode message: {}", e);
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState, ip: IpAddr) {
    let mut session = match state.session_manager.create_session(ip) {
        Ok(s) => s,
        Err(e) => {
            warn!("Session refused for {}: {}", ip, e);
            let msg = ServerMessage::error(None, ErrorCode::RateLimit, e.to_string());
            let _ = send_message(&mut socket, &msg).await;
            return;
        }
    };

    let session_id = session.id.clone();
    info!("Session created: {} from {}", session_id, ip);
    state.metrics.inc_sessions();

    while let Some(msg) = socket.recv().await {
        match msg {
            Ok(Message::Text(text)) => {
                state.metrics.inc_messages();

                let response = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => handle_message(&state, &mut session, client_msg).await,
                    Err(e) => {
                        warn!("Invalid message: {}", e);
                        ServerMessage::error(None, ErrorCode::BadFormat, "Invalid message format")
                    }
                };

                if !send_message(&mut socket, &response).await {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                warn!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    state.metrics.dec_sessions();
    state.session_manager.remove_session(&session_id);
    info!("Session closed: {}", session_id);
}

pub async fn handle_message(
    state: &AppState,
    session: &mut Session,
    msg: ClientMessage,
) -> ServerMessage {
    match msg {
        ClientMessage::ValidateComment { id, payload, .. } => {
            let result = session.guard.validate_comment(&payload.comment);
            state.metrics.record_validation(result.is_valid);
            ServerMessage::Validation { v: PROTOCOL_VERSION, id, payload: result }
        }
        ClientMessage::ValidateRating { id, payload, .. } => {
            let result = session.guard.validate_rating(payload.rating);
            state.metrics.record_validation(result.is_valid);
            ServerMessage::Validation { v: PROTOCOL_VERSION, id, payload: result }
        }
        ClientMessage::SubmitFeedback { id, payload, .. } => {
            if !session.guard.check_rate_limit() && !wait_for_window(state, session).await {
                state.metrics.inc_rate_limits();
                return ServerMessage::SubmitResult {
                    v: PROTOCOL_VERSION,
                    id,
                    payload: SubmitResultPayload {
                        status: SubmitStatus::RateLimited,
                        validation: None,
                        retry_after_ms: Some(session.guard.retry_after_ms()),
                        requires_verification: session.guard.is_suspicious(),
                    },
                };
            }

            let result = session.guard.validate_feedback(&payload);
            state.metrics.record_validation(result.is_valid);
            let status = if result.is_valid {
                state.metrics.inc_accepted();
                SubmitStatus::Accepted
            } else {
                state.metrics.inc_rejected();
                SubmitStatus::Rejected
            };
            if !result.warnings.is_empty() {
                debug!(session = %session.id, warnings = ?result.warnings, "Feedback carried warnings");
            }

            ServerMessage::SubmitResult {
                v: PROTOCOL_VERSION,
                id,
                payload: SubmitResultPayload {
                    status,
                    validation: Some(result),
                    retry_after_ms: None,
                    requires_verification: session.guard.is_suspicious(),
                },
            }
        }
        ClientMessage::RecordAction { id, payload, .. } => {
            let report = session.guard.record_action(&payload.action, payload.data.as_ref());
            state.session_manager.update_risk(&session.id, report.risk_score);
            if report.is_suspicious {
                state.metrics.inc_suspicious();
            }
            ServerMessage::Behavior { v: PROTOCOL_VERSION, id, payload: report }
        }
        ClientMessage::Status { id, .. } => ServerMessage::Status {
            v: PROTOCOL_VERSION,
            id,
            payload: session.guard.security_status(),
        },
        ClientMessage::Reset { id, .. } => {
            session.guard.reset_security();
            state.session_manager.update_risk(&session.id, 0.0);
            ServerMessage::ack(id)
        }
        ClientMessage::OpenQuery { id, payload, .. } => {
            match session.open_query(&payload.handle, &payload.collection, payload.filters, payload.options) {
                Ok(_) => ServerMessage::ack(id),
                Err(e) => ServerMessage::error(Some(id), ErrorCode::TooManyQueries, e.to_string()),
            }
        }
        ClientMessage::LoadData { id, payload, .. } => {
            let Some(query) = session.query_mut(&payload.handle) else {
                return unknown_query(id, &payload.handle);
            };
            let outcome = query.load_data(payload.use_cache).await;
            query_result(state, id, payload.handle, query, outcome)
        }
        ClientMessage::LoadMore { id, payload, .. } => {
            let Some(query) = session.query_mut(&payload.handle) else {
                return unknown_query(id, &payload.handle);
            };
            let outcome = query.load_more().await;
            query_result(state, id, payload.handle, query, outcome)
        }
        ClientMessage::Refresh { id, payload, .. } => {
            let Some(query) = session.query_mut(&payload.handle) else {
                return unknown_query(id, &payload.handle);
            };
            let outcome = query.refresh().await;
            query_result(state, id, payload.handle, query, outcome)
        }
        ClientMessage::InvalidateCache { id, payload, .. } => {
            let Some(query) = session.query_mut(&payload.handle) else {
                return unknown_query(id, &payload.handle);
            };
            query.invalidate_cache(payload.key.as_deref());
            ServerMessage::ack(id)
        }
        ClientMessage::ClearCache { id, payload, .. } => {
            let Some(query) = session.query_mut(&payload.handle) else {
                return unknown_query(id, &payload.handle);
            };
            query.clear_cache();
            ServerMessage::ack(id)
        }
        ClientMessage::Ping { id, .. } => ServerMessage::Pong {
            v: PROTOCOL_VERSION,
            id,
            payload: Default::default(),
        },
    }
}

/// Waits for the next rate window, bounded by `submit_wait_ms`.
async fn wait_for_window(state: &AppState, session: &mut Session) -> bool {
    let wait_ms = state.config.server.submit_wait_ms;
    if wait_ms == 0 {
        return false;
    }
    tokio::time::timeout(Duration::from_millis(wait_ms), session.guard.wait_for_rate_limit())
        .await
        .is_ok()
}

fn unknown_query(id: String, handle: &str) -> ServerMessage {
    ServerMessage::error(Some(id), ErrorCode::UnknownQuery, format!("No open query '{}'", handle))
}

fn query_result(
    state: &AppState,
    id: String,
    handle: String,
    query: &CachedQuery,
    outcome: LoadOutcome,
) -> ServerMessage {
    match outcome {
        LoadOutcome::Cached => state.metrics.inc_cache_hits(),
        LoadOutcome::Fetched(_) => state.metrics.inc_query_reads(),
        LoadOutcome::Failed => {
            state.metrics.inc_query_reads();
            state.metrics.inc_query_errors();
        }
        LoadOutcome::Skipped => {}
    }

    ServerMessage::QueryResult {
        v: PROTOCOL_VERSION,
        id,
        payload: QueryResultPayload {
            handle,
            outcome: outcome.into(),
            documents: query.data().to_vec(),
            has_more: query.has_more(),
            error: query.error().map(str::to_string),
        },
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install signal handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::protocol::{
        ActionPayload, CommentPayload, EmptyPayload, HandlePayload, LoadDataPayload,
        OpenQueryPayload, QueryOutcome,
    };
    use crate::store::{Document, MemoryDocumentStore};
    use crate::validator::FeedbackInput;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use std::net::Ipv4Addr;
    use tower::ServiceExt;

    const TEST_CONFIG: &str = r#"
        [server]
        bind_addr = "127.0.0.1:0"
        ws_path = "/ws"
        max_connections_per_ip = 4
        max_frame_bytes = 8192

        [limits]
        max_requests = 1
        time_window_ms = 60000

        [query]
        limit_count = 2
        enable_pagination = true
        order_by_field = "createdAt"

        [metrics]
        enable = false
        bind_addr = "127.0.0.1:0"
        path = "/metrics"
    "#;

    fn test_state(submit_wait_ms: u64) -> (AppState, Arc<MemoryDocumentStore>) {
        let (state, store, _clock) = test_state_with_clock(submit_wait_ms);
        (state, store)
    }

    fn test_state_with_clock(submit_wait_ms: u64) -> (AppState, Arc<MemoryDocumentStore>, Arc<ManualClock>) {
        let mut config: Config = toml::from_str(TEST_CONFIG).unwrap();
        config.server.submit_wait_ms = submit_wait_ms;

        let store = Arc::new(MemoryDocumentStore::new());
        for i in 0..3 {
            store.insert(
                "feedback",
                Document::new(format!("f{}", i), json!({ "areaId": "lobby", "createdAt": i })),
            );
        }

        let clock = Arc::new(ManualClock::new(1_000));
        let session_manager = Arc::new(SessionManager::new(
            config.server.max_connections_per_ip,
            config.guard_config(),
            config.query.clone(),
            store.clone(),
            clock.clone(),
        ));

        let state = AppState {
            session_manager,
            metrics: Arc::new(Metrics::new()),
            config,
        };
        (state, store, clock)
    }

    fn click(id: &str) -> ClientMessage {
        ClientMessage::RecordAction {
            v: 1,
            id: id.to_string(),
            payload: ActionPayload {
                action: "click".into(),
                data: None,
            },
        }
    }

    fn new_session(state: &AppState) -> Session {
        state
            .session_manager
            .create_session(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .unwrap()
    }

    fn submit(id: &str, comment: &str) -> ClientMessage {
        ClientMessage::SubmitFeedback {
            v: 1,
            id: id.to_string(),
            payload: FeedbackInput {
                comment: comment.to_string(),
                rating: 4,
                area_id: Some("lobby".into()),
            },
        }
    }

    fn submit_status(msg: &ServerMessage) -> SubmitStatus {
        match msg {
            ServerMessage::SubmitResult { payload, .. } => payload.status,
            other => panic!("Unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_health_and_stats_routes() {
        let (state, _store) = test_state(0);
        let _session = new_session(&state);
        let app = router(state);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["active_sessions"], 1);
        assert_eq!(stats["suspicious_sessions"], 0);
    }

    #[tokio::test]
    async fn test_submit_accepted_then_rate_limited() {
        let (state, _store) = test_state(0);
        let mut session = new_session(&state);

        let first = handle_message(&state, &mut session, submit("1", "Lovely staff")).await;
        assert_eq!(submit_status(&first), SubmitStatus::Accepted);

        let second = handle_message(&state, &mut session, submit("2", "Lovely staff")).await;
        match &second {
            ServerMessage::SubmitResult { payload, .. } => {
                assert_eq!(payload.status, SubmitStatus::RateLimited);
                assert_eq!(payload.retry_after_ms, Some(60_000));
                assert!(payload.validation.is_none());
            }
            other => panic!("Unexpected response: {:?}", other),
        }
        assert_eq!(state.metrics.rate_limits_hit.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_bounded_wait_gives_up() {
        let (state, _store) = test_state(150);
        let mut session = new_session(&state);

        handle_message(&state, &mut session, submit("1", "Lovely staff")).await;
        let second = handle_message(&state, &mut session, submit("2", "Lovely staff")).await;
        assert_eq!(submit_status(&second), SubmitStatus::RateLimited);
    }

    #[tokio::test]
    async fn test_invalid_feedback_rejected() {
        let (state, _store) = test_state(0);
        let mut session = new_session(&state);

        let msg = ClientMessage::SubmitFeedback {
            v: 1,
            id: "1".into(),
            payload: FeedbackInput {
                comment: "ok text".into(),
                rating: 4,
                area_id: None,
            },
        };
        let response = handle_message(&state, &mut session, msg).await;
        match response {
            ServerMessage::SubmitResult { payload, .. } => {
                assert_eq!(payload.status, SubmitStatus::Rejected);
                let validation = payload.validation.unwrap();
                assert_eq!(validation.errors, vec!["Area ID is required".to_string()]);
            }
            other => panic!("Unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_validate_comment_and_status() {
        let (state, _store) = test_state(0);
        let mut session = new_session(&state);

        let response = handle_message(
            &state,
            &mut session,
            ClientMessage::ValidateComment {
                v: 1,
                id: "c".into(),
                payload: CommentPayload { comment: "AAAAA".into() },
            },
        )
        .await;
        match response {
            ServerMessage::Validation { payload, .. } => {
                assert!(payload.is_valid);
                assert!(!payload.warnings.is_empty());
            }
            other => panic!("Unexpected response: {:?}", other),
        }

        let status = handle_message(
            &state,
            &mut session,
            ClientMessage::Status { v: 1, id: "s".into(), payload: EmptyPayload {} },
        )
        .await;
        match status {
            ServerMessage::Status { payload, .. } => {
                assert_eq!(payload.validation.total, 1);
                assert!(payload.rate_limit.allowed);
            }
            other => panic!("Unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_record_action_updates_registry() {
        let (state, _store) = test_state(0);
        let mut session = new_session(&state);

        let response = handle_message(&state, &mut session, click("a")).await;
        assert!(matches!(response, ServerMessage::Behavior { .. }));

        // The shared manual clock never moves, so every follow-up is "too fast"
        for i in 0..3 {
            handle_message(&state, &mut session, click(&format!("b{}", i))).await;
        }
        assert!(state.session_manager.is_suspicious(&session.id));
        assert_eq!(state.session_manager.suspicious_count(), 1);

        handle_message(
            &state,
            &mut session,
            ClientMessage::Reset { v: 1, id: "r".into(), payload: EmptyPayload {} },
        )
        .await;
        assert_eq!(state.session_manager.suspicious_count(), 0);
        assert!(!session.guard.is_suspicious());
    }

    #[tokio::test]
    async fn test_stats_drop_session_after_idle_decay() {
        let (state, _store, clock) = test_state_with_clock(0);
        let mut session = new_session(&state);

        for i in 0..4 {
            handle_message(&state, &mut session, click(&format!("c{}", i))).await;
        }
        assert!(session.guard.is_suspicious());
        assert_eq!(state.session_manager.suspicious_count(), 1);

        clock.advance(10 * 60_000);
        assert!(!session.guard.is_suspicious());
        assert_eq!(session.guard.risk_score(), 0.0);
        assert_eq!(state.session_manager.suspicious_count(), 0);

        let app = router(state);
        let response = app
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["suspicious_sessions"], 0);
        assert_eq!(stats["active_sessions"], 1);
    }

    #[tokio::test]
    async fn test_query_lifecycle() {
        let (state, store) = test_state(0);
        let mut session = new_session(&state);

        let open = ClientMessage::OpenQuery {
            v: 1,
            id: "o".into(),
            payload: OpenQueryPayload {
                handle: "feed".into(),
                collection: "feedback".into(),
                filters: vec![],
                options: None,
            },
        };
        assert!(matches!(handle_message(&state, &mut session, open).await, ServerMessage::Ack { .. }));

        let load = || ClientMessage::LoadData {
            v: 1,
            id: "l".into(),
            payload: LoadDataPayload { handle: "feed".into(), use_cache: true },
        };
        let outcome_of = |msg: ServerMessage| match msg {
            ServerMessage::QueryResult { payload, .. } => (payload.outcome, payload.documents.len(), payload.has_more),
            other => panic!("Unexpected response: {:?}", other),
        };

        assert_eq!(outcome_of(handle_message(&state, &mut session, load()).await), (QueryOutcome::Fetched, 2, true));
        assert_eq!(outcome_of(handle_message(&state, &mut session, load()).await), (QueryOutcome::Cached, 2, true));

        let more = ClientMessage::LoadMore {
            v: 1,
            id: "m".into(),
            payload: HandlePayload { handle: "feed".into() },
        };
        assert_eq!(outcome_of(handle_message(&state, &mut session, more).await), (QueryOutcome::Fetched, 3, false));
        assert_eq!(store.read_count(), 2);

        let unknown = ClientMessage::Refresh {
            v: 1,
            id: "x".into(),
            payload: HandlePayload { handle: "nope".into() },
        };
        match handle_message(&state, &mut session, unknown).await {
            ServerMessage::Error { payload, .. } => assert_eq!(payload.code, ErrorCode::UnknownQuery),
            other => panic!("Unexpected response: {:?}", other),
        }
    }
}
