//! Chat 모듈 - 근거 기반(grounded) 스트리밍 채팅
//!
//! 한 턴의 흐름: 검색 → 관련도 판정 → 프롬프트 구성 → 모델 스트리밍 →
//! NAV 마커 파싱 → 세션 기록 → 종료 이벤트.
//!
//! - session: 세션별 대화 이력 (유휴 만료)
//! - llm: 언어 모델 스트리밍 클라이언트
//! - parser: 청크 경계에 안전한 NAV 마커 파서
//! - fallback: 마커가 없을 때의 대체 네비게이션
//! - prompt: 시스템 프롬프트 / 참고자료 블록
//! - service: 턴 오케스트레이터

mod fallback;
mod llm;
mod parser;
mod prompt;
mod service;
mod session;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::language::Language;

// Re-exports
pub use fallback::{fallback_navigation, route_labels, MAX_FALLBACK_ROUTES};
pub use llm::{LanguageModel, OpenAiChat, SseDecoder, TokenStream, DEFAULT_CHAT_MODEL};
pub use parser::{parse_markers, NavMarkerParser, NAV_PREFIX};
pub use prompt::{build_context, build_system_prompt, out_of_scope_message, unavailable_message};
pub use service::{ChatConfig, ChatService, TurnState};
pub use session::{Clock, ManualClock, Session, SessionConfig, SessionStore, SystemClock};

// ============================================================================
// Types
// ============================================================================

/// 메시지 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// 대화 메시지
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// 채팅 요청 (전송 계층에서 검증을 마친 값)
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub message: String,
    pub session_id: String,
    pub language: Language,
}

/// 네비게이션 마커 `{route, label_zh, label_en}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationMarker {
    pub route: String,
    pub label_zh: String,
    pub label_en: String,
}

/// 클라이언트로 전송되는 이벤트
///
/// 순서: `searching`, `thinking`, `text`/`navigation` 0개 이상, 그리고
/// `done` 또는 `error` 중 정확히 하나.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatEvent {
    Searching,
    Thinking,
    Text { content: String },
    Navigation {
        route: String,
        label_zh: String,
        label_en: String,
    },
    Done,
    Error { message: String },
}

impl ChatEvent {
    pub fn text(content: impl Into<String>) -> Self {
        ChatEvent::Text {
            content: content.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ChatEvent::Error {
            message: message.into(),
        }
    }
}

impl From<NavigationMarker> for ChatEvent {
    fn from(marker: NavigationMarker) -> Self {
        ChatEvent::Navigation {
            route: marker.route,
            label_zh: marker.label_zh,
            label_en: marker.label_en,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// 이벤트 수신 측이 닫힘 (클라이언트 연결 종료)
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("event receiver closed")]
pub struct SinkClosed;

/// 턴 실패 원인
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// 임베딩/저장소/모델 등 상위 서비스 실패
    #[error("upstream failure: {0:#}")]
    Upstream(#[from] anyhow::Error),
    /// 클라이언트가 스트림을 닫음
    #[error("client disconnected")]
    Disconnected,
}

impl From<SinkClosed> for ChatError {
    fn from(_: SinkClosed) -> Self {
        ChatError::Disconnected
    }
}

// ============================================================================
// EventSink
// ============================================================================

/// 이벤트 수신 인터페이스
///
/// 오케스트레이터는 전송 방식(SSE, 테스트 버퍼)을 모릅니다.
#[async_trait]
pub trait EventSink: Send {
    async fn emit(&mut self, event: ChatEvent) -> Result<(), SinkClosed>;

    /// 수신 측이 닫히면 완료 (닫히지 않는 수신 측은 영원히 대기)
    ///
    /// 모델이 토큰을 보내지 않는 동안에도 연결 종료를 감지하는 데 씁니다.
    async fn closed(&mut self) {
        futures::future::pending::<()>().await
    }
}

#[async_trait]
impl EventSink for Vec<ChatEvent> {
    async fn emit(&mut self, event: ChatEvent) -> Result<(), SinkClosed> {
        self.push(event);
        Ok(())
    }
}

#[async_trait]
impl EventSink for mpsc::Sender<ChatEvent> {
    async fn emit(&mut self, event: ChatEvent) -> Result<(), SinkClosed> {
        self.send(event).await.map_err(|_| SinkClosed)
    }

    async fn closed(&mut self) {
        mpsc::Sender::closed(self).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(ChatEvent::Searching).unwrap();
        assert_eq!(json, serde_json::json!({"type": "searching"}));

        let json = serde_json::to_value(ChatEvent::text("你好")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "text", "content": "你好"}));

        let json = serde_json::to_value(ChatEvent::from(NavigationMarker {
            route: "/projects".to_string(),
            label_zh: "查看工程案例".to_string(),
            label_en: "View Engineering Cases".to_string(),
        }))
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "navigation",
                "route": "/projects",
                "label_zh": "查看工程案例",
                "label_en": "View Engineering Cases"
            })
        );

        let json = serde_json::to_value(ChatEvent::error("oops")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "error", "message": "oops"}));
    }

    #[test]
    fn test_message_roles() {
        let json = serde_json::to_value(ChatMessage::assistant("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "assistant", "content": "hi"}));
    }

    #[tokio::test]
    async fn test_channel_sink_reports_closed() {
        let (mut tx, rx) = mpsc::channel::<ChatEvent>(4);
        assert!(tx.emit(ChatEvent::Searching).await.is_ok());
        drop(rx);
        assert!(tx.emit(ChatEvent::Thinking).await.is_err());
    }

    #[tokio::test]
    async fn test_channel_sink_closed_resolves_on_drop() {
        let (mut tx, rx) = mpsc::channel::<ChatEvent>(4);
        let waiter = tokio::spawn(async move { tx.closed().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(rx);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
