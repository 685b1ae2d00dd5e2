//! 채팅 오케스트레이터 - 한 번의 대화 턴 처리
//!
//! 검색 → 관련도 판정 → 프롬프트 → 모델 스트리밍 → 마커 파싱 → 세션 기록.
//! 이벤트는 `EventSink`로만 내보내므로 전송 방식과 무관합니다.

use std::sync::Arc;

use futures::StreamExt;

use crate::knowledge::Retriever;

use super::fallback::fallback_navigation;
use super::llm::LanguageModel;
use super::parser::NavMarkerParser;
use super::prompt::{build_context, build_system_prompt, out_of_scope_message, unavailable_message};
use super::session::SessionStore;
use super::{ChatError, ChatEvent, ChatMessage, ChatRequest, EventSink};

/// 오케스트레이터 설정
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// 최상위 검색 점수가 이 값 미만이면 범위 밖 질문으로 처리
    pub relevance_threshold: f32,
    /// 검색 결과 개수
    pub search_limit: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            relevance_threshold: 0.15,
            search_limit: 8,
        }
    }
}

/// 턴 진행 상태 (로그용)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Searching,
    Thinking,
    Streaming,
    Done,
    Error,
}

/// 채팅 서비스
pub struct ChatService {
    retriever: Arc<dyn Retriever>,
    model: Arc<dyn LanguageModel>,
    sessions: Arc<SessionStore>,
    config: ChatConfig,
}

impl ChatService {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        model: Arc<dyn LanguageModel>,
        sessions: Arc<SessionStore>,
        config: ChatConfig,
    ) -> Self {
        Self {
            retriever,
            model,
            sessions,
            config,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// 세션 이력 삭제
    pub fn clear_session(&self, session_id: &str) {
        self.sessions.clear(session_id);
    }

    /// 한 턴 처리
    ///
    /// 상위 서비스 실패는 언어별 "일시적으로 사용 불가" 이벤트로 알린 뒤
    /// `ChatError::Upstream`을 반환합니다. 수신 측이 닫히면 즉시 중단하며
    /// 세션에는 아무것도 기록하지 않습니다.
    pub async fn handle_chat<S>(&self, request: &ChatRequest, sink: &mut S) -> Result<(), ChatError>
    where
        S: EventSink + ?Sized,
    {
        match self.run_turn(request, sink).await {
            Ok(()) => Ok(()),
            Err(ChatError::Disconnected) => {
                tracing::info!("Client disconnected (session {})", request.session_id);
                Err(ChatError::Disconnected)
            }
            Err(ChatError::Upstream(e)) => {
                log_state(&request.session_id, TurnState::Error);
                tracing::error!("Chat turn failed (session {}): {:#}", request.session_id, e);
                sink.emit(ChatEvent::error(unavailable_message(request.language)))
                    .await?;
                Err(ChatError::Upstream(e))
            }
        }
    }

    async fn run_turn<S>(&self, request: &ChatRequest, sink: &mut S) -> Result<(), ChatError>
    where
        S: EventSink + ?Sized,
    {
        let session_id = request.session_id.as_str();
        let language = request.language;

        // 1. 검색
        log_state(session_id, TurnState::Searching);
        sink.emit(ChatEvent::Searching).await?;
        let results = self
            .retriever
            .search(&request.message, language, self.config.search_limit)
            .await?;

        // 2. 관련도 판정
        let top_score = results.first().map(|r| r.score);
        if top_score.map_or(true, |score| score < self.config.relevance_threshold) {
            tracing::info!(
                "No relevant knowledge (session {}, top score {:?})",
                session_id,
                top_score
            );
            sink.emit(ChatEvent::error(out_of_scope_message(language)))
                .await?;
            return Ok(());
        }

        // 3. 프롬프트 구성
        log_state(session_id, TurnState::Thinking);
        sink.emit(ChatEvent::Thinking).await?;
        let messages = self.build_messages(request, &build_context(&results, language));

        // 4. 스트리밍
        let mut stream = self.model.stream_chat(&messages).await?;
        let mut parser = NavMarkerParser::new();
        let mut streaming = false;

        loop {
            // 모델이 멈춘 동안에도 연결 종료를 바로 감지
            let next = tokio::select! {
                next = stream.next() => next,
                () = sink.closed() => return Err(ChatError::Disconnected),
            };
            let Some(fragment) = next else { break };
            let fragment = fragment?;
            if !streaming {
                log_state(session_id, TurnState::Streaming);
                streaming = true;
            }
            for event in parser.push(&fragment) {
                sink.emit(event).await?;
            }
        }
        drop(stream);

        for event in parser.finish() {
            sink.emit(event).await?;
        }

        // 5. 마커가 없으면 검색 결과로 대체 네비게이션
        if parser.marker_count() == 0 {
            for marker in fallback_navigation(&results) {
                sink.emit(marker.into()).await?;
            }
        }

        // 6. 세션 기록
        let response = parser.into_response();
        tracing::debug!(
            "Turn complete (session {}, {} chars)",
            session_id,
            response.chars().count()
        );
        self.sessions
            .record_turn(session_id, &request.message, &response);

        log_state(session_id, TurnState::Done);
        sink.emit(ChatEvent::Done).await?;
        Ok(())
    }

    /// `[system, ...history, user]`
    fn build_messages(&self, request: &ChatRequest, context: &str) -> Vec<ChatMessage> {
        // 세션은 턴이 성공해야 생성됨
        let history = self.sessions.peek_history(&request.session_id);

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(build_system_prompt(
            request.language,
            context,
        )));
        messages.extend(history);
        messages.push(ChatMessage::user(request.message.as_str()));
        messages
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn log_state(session_id: &str, state: TurnState) {
    tracing::debug!("Session {} -> {:?}", session_id, state);
}

// ============================================================================
// Tests
// ============================================================================
