//! shunfeng-chat - 사이트 지식베이스 기반 RAG 채팅 서비스
//!
//! SQLite에 저장된 이중 언어(중국어/영어) 지식 세그먼트를 벡터 + 키워드
//! 하이브리드 검색으로 찾고, 검색 결과에만 근거한 답변을 SSE로 스트리밍합니다.
//! 답변 속 `[NAV:{...}]` 마커는 네비게이션 이벤트로 분리됩니다.

pub mod chat;
pub mod cli;
pub mod embedding;
pub mod knowledge;
pub mod language;
pub mod server;

// Re-exports
pub use chat::{
    ChatConfig, ChatError, ChatEvent, ChatMessage, ChatRequest, ChatService, EventSink,
    LanguageModel, NavigationMarker, OpenAiChat, SessionConfig, SessionStore,
};
pub use embedding::{create_embedder, get_api_key, has_api_key, EmbeddingProvider, OpenAiEmbedding};
pub use knowledge::{
    HybridRetriever, KnowledgeSegment, KnowledgeStore, NewSegment, Retriever, SearchConfig,
    SearchMethod, SearchResult, StoreStats,
};
pub use language::Language;
