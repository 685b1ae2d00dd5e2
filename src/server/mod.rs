//! HTTP 서버 - SSE 채팅 스트림 / 세션 초기화 / 상태 확인
//!
//! - `POST /chat/stream`: 채팅 이벤트를 `data: <json>\n\n` 형식으로 스트리밍
//! - `POST /chat/clear`: 세션 이력 삭제
//! - `GET /health`: 서버 상태 + 활성 세션 수

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{HeaderName, HeaderValue, CACHE_CONTROL};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

use crate::chat::{ChatEvent, ChatRequest, ChatService};
use crate::language::Language;

/// 턴당 이벤트 채널 버퍼
const EVENT_BUFFER: usize = 64;

const MESSAGE_REQUIRED: &str = "Message is required";
const SESSION_REQUIRED: &str = "Session ID is required";
const INTERNAL_ERROR: &str = "Internal server error";

// ============================================================================
// Types
// ============================================================================

/// 핸들러 공유 상태
#[derive(Clone)]
pub struct AppState {
    chat: Arc<ChatService>,
}

/// `/chat/stream` 요청 본문 (타입 검사는 직접 수행)
#[derive(Debug, Default, Deserialize)]
struct StreamBody {
    #[serde(default)]
    message: Option<Value>,
    #[serde(default, rename = "sessionId")]
    session_id: Option<Value>,
    #[serde(default)]
    language: Option<Value>,
}

/// `/chat/clear` 요청 본문
#[derive(Debug, Default, Deserialize)]
struct ClearBody {
    #[serde(default, rename = "sessionId")]
    session_id: Option<Value>,
}

// ============================================================================
// Router
// ============================================================================

/// 라우터 생성
pub fn router(chat: Arc<ChatService>) -> Router {
    // 사이트 위젯은 다른 origin에서 호출될 수 있음
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/chat/stream", post(chat_stream))
        .route("/chat/clear", post(chat_clear))
        .route("/health", get(health))
        .layer(cors)
        .with_state(AppState { chat })
}

/// 서버 실행 (Ctrl+C로 정상 종료)
///
/// # Arguments
/// * `chat` - 채팅 서비스
/// * `bind` - 바인드 주소 (예: 127.0.0.1:3000)
pub async fn serve(chat: Arc<ChatService>, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;

    let addr = listener
        .local_addr()
        .context("Failed to read local address")?;
    tracing::info!("Chat server listening on http://{}", addr);

    axum::serve(listener, router(chat))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    tracing::info!("Chat server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

// ============================================================================
// Handlers
// ============================================================================

async fn chat_stream(State(state): State<AppState>, body: Bytes) -> Response {
    let (tx, rx) = mpsc::channel::<ChatEvent>(EVENT_BUFFER);

    match parse_stream_request(&body) {
        Ok(request) => spawn_turn(state.chat.clone(), request, tx),
        Err(message) => {
            tracing::debug!("Rejected chat request: {}", message);
            // 버퍼가 비어 있으므로 실패하지 않음
            let _ = tx.try_send(ChatEvent::error(message));
        }
    }

    sse_response(rx)
}

async fn chat_clear(State(state): State<AppState>, body: Bytes) -> Response {
    let session_id = serde_json::from_slice::<ClearBody>(&body)
        .ok()
        .and_then(|b| non_empty_string(b.session_id));

    match session_id {
        Some(id) => {
            state.chat.clear_session(&id);
            Json(json!({ "success": true })).into_response()
        }
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": SESSION_REQUIRED })),
        )
            .into_response(),
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.chat.sessions().len(),
    }))
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 요청 본문 검증 → `ChatRequest`
///
/// 파싱 불가 / message 누락·비문자열·공백 → "Message is required",
/// sessionId 누락·비문자열·빈 문자열 → "Session ID is required".
fn parse_stream_request(body: &[u8]) -> Result<ChatRequest, &'static str> {
    let body: StreamBody = serde_json::from_slice(body).map_err(|_| MESSAGE_REQUIRED)?;

    let message = match body.message {
        Some(Value::String(m)) if !m.trim().is_empty() => m.trim().to_string(),
        _ => return Err(MESSAGE_REQUIRED),
    };
    let session_id = non_empty_string(body.session_id).ok_or(SESSION_REQUIRED)?;
    let language = Language::from_code(body.language.as_ref().and_then(Value::as_str));

    Ok(ChatRequest {
        message,
        session_id,
        language,
    })
}

fn non_empty_string(value: Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        _ => None,
    }
}

/// 턴을 별도 태스크로 실행
///
/// 턴이 패닉하면 "Internal server error" 이벤트를 보냅니다.
fn spawn_turn(chat: Arc<ChatService>, request: ChatRequest, tx: mpsc::Sender<ChatEvent>) {
    let mut turn_tx = tx.clone();

    tokio::spawn(async move {
        let turn = tokio::spawn(async move { chat.handle_chat(&request, &mut turn_tx).await });

        match turn.await {
            // 실패는 오케스트레이터가 이미 이벤트로 알림
            Ok(_) => {}
            Err(e) if e.is_panic() => {
                tracing::error!("Chat turn panicked: {}", e);
                let _ = tx.send(ChatEvent::error(INTERNAL_ERROR)).await;
            }
            Err(e) => tracing::warn!("Chat turn cancelled: {}", e),
        }
    });
}

/// 이벤트 채널 → SSE 응답
fn sse_response(rx: mpsc::Receiver<ChatEvent>) -> Response {
    let mut response = Sse::new(event_stream(rx)).into_response();

    let headers = response.headers_mut();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

fn event_stream(rx: mpsc::Receiver<ChatEvent>) -> impl Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let data = match serde_json::to_string(&event) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!("Failed to serialize chat event: {}", e);
                return None;
            }
        };
        Some((Ok(Event::default().data(data)), rx))
    })
}

// ============================================================================
// Tests
// ============================================================================
