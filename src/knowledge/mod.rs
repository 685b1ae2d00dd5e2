//! Knowledge 모듈 - 하이브리드 RAG 지식 저장소
//!
//! - SQLite: 이중 언어 세그먼트 + 언어별 임베딩 저장
//! - Vector: 코사인 거리 정렬 (정확 검색)
//! - Keywords: 키워드 추출 + 도메인 질의 확장
//! - Hybrid: 벡터/키워드 결과를 ID 기준 병합

mod hybrid;
mod keywords;
mod store;
mod vector;

// Re-exports
pub use hybrid::{
    merge_results, HybridRetriever, Retriever, SearchConfig, SearchMethod, SearchResult,
};
pub use keywords::{
    detect_language, expand_query_keywords, extract_keywords, search_terms, DomainRule,
    DOMAIN_RULES,
};
pub use store::{
    default_db_path, get_data_dir, KnowledgeSegment, KnowledgeStore, NewSegment, StoreStats,
};
pub use vector::{cosine_distance, cosine_similarity, decode_embedding, encode_embedding};
