//! 하이브리드 검색 - 벡터 유사도 + 키워드 매칭 통합
//!
//! 벡터 검색은 어휘가 달라도 의미가 가까운 콘텐츠를 찾고,
//! 키워드 검색은 모델명/약어처럼 임베딩이 약하게 반영하는 정확한 용어의
//! 재현율을 보장합니다. 키워드 매칭은 고정 점수(0.5)를 받아
//! 강한 벡터 매칭보다는 낮고 약한 벡터 매칭보다는 높게 위치합니다.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::embedding::EmbeddingProvider;
use crate::language::Language;

use super::keywords::search_terms;
use super::store::{KnowledgeSegment, KnowledgeStore, StoreStats};

// ============================================================================
// Types
// ============================================================================

/// 하이브리드 검색 결과
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    #[serde(flatten)]
    pub segment: KnowledgeSegment,
    /// 관련도 (높을수록 좋음)
    pub score: f32,
    /// 검색 방법 (vector, keyword, hybrid)
    pub method: SearchMethod,
}

/// 검색 방법
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMethod {
    /// 벡터 검색에서만 발견
    Vector,
    /// 키워드 검색에서만 발견
    Keyword,
    /// 양쪽 모두에서 발견
    Hybrid,
}

/// 검색 파라미터
///
/// 임계값들은 실제 코퍼스 기준으로 재조정할 수 있도록 설정값으로 둡니다.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// 결과 최대 개수 기본값
    pub default_limit: usize,
    /// 벡터 단계 상위 N개
    pub vector_limit: usize,
    /// 벡터 점수가 이 값 이하이면 버림
    pub vector_min_score: f32,
    /// 키워드 단계 최대 개수
    pub keyword_limit: usize,
    /// 키워드 매칭 고정 점수
    pub keyword_score: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 8,
            vector_limit: 5,
            vector_min_score: 0.3,
            keyword_limit: 8,
            keyword_score: 0.5,
        }
    }
}

// ============================================================================
// Retriever Trait
// ============================================================================

/// 검색기 트레이트
///
/// 채팅 오케스트레이터가 의존하는 경계입니다.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// 질의에 대한 관련 세그먼트 (점수 내림차순, 최대 `limit`개)
    async fn search(&self, query: &str, language: Language, limit: usize)
        -> Result<Vec<SearchResult>>;
}

// ============================================================================
// HybridRetriever
// ============================================================================

/// 하이브리드 검색기
///
/// 임베딩 서비스나 저장소 오류는 재시도 없이 그대로 전파합니다.
pub struct HybridRetriever {
    store: KnowledgeStore,
    embedder: Arc<dyn EmbeddingProvider>,
    config: SearchConfig,
}

impl HybridRetriever {
    /// 새 하이브리드 검색기 생성
    pub fn new(
        store: KnowledgeStore,
        embedder: Arc<dyn EmbeddingProvider>,
        config: SearchConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    /// 벡터 검색 단계
    ///
    /// 상위 `vector_limit`개를 가져온 뒤 `vector_min_score` 이하를 버립니다.
    pub async fn search_vector(&self, query: &str, language: Language) -> Result<Vec<SearchResult>> {
        let query_embedding = self
            .embedder
            .embed(query)
            .await
            .context("Failed to embed query")?;

        self.vector_stage(&query_embedding, language)
    }

    fn vector_stage(&self, query_embedding: &[f32], language: Language) -> Result<Vec<SearchResult>> {
        let rows = self
            .store
            .vector_search(query_embedding, language, self.config.vector_limit)?;

        Ok(rows
            .into_iter()
            .filter(|(_, score)| *score > self.config.vector_min_score)
            .map(|(segment, score)| SearchResult {
                segment,
                score,
                method: SearchMethod::Vector,
            })
            .collect())
    }

    /// 키워드 검색 단계
    ///
    /// 추출 키워드 ∪ 도메인 확장 용어로 본문/제목 부분 문자열 매칭을 수행합니다.
    pub fn search_keyword(&self, query: &str, language: Language) -> Result<Vec<SearchResult>> {
        let terms = search_terms(query, language);
        if terms.is_empty() {
            return Ok(vec![]);
        }

        tracing::debug!("Keyword terms ({}): {:?}", language, terms);

        let segments = self
            .store
            .keyword_search(&terms, language, self.config.keyword_limit)?;

        Ok(segments
            .into_iter()
            .map(|segment| SearchResult {
                segment,
                score: self.config.keyword_score,
                method: SearchMethod::Keyword,
            })
            .collect())
    }

    /// 하이브리드 검색
    ///
    /// # Arguments
    /// * `query` - 검색 쿼리
    /// * `language` - 비교할 본문/임베딩 언어
    /// * `limit` - 최대 결과 수
    ///
    /// # Returns
    /// 점수 기준 정렬, ID 중복 없는 검색 결과
    pub async fn hybrid_search(
        &self,
        query: &str,
        language: Language,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        // 1. 질의 임베딩 (언어 무관 모델, 한 번만)
        let vector_results = self.search_vector(query, language).await?;

        // 2. 키워드 검색
        let keyword_results = self.search_keyword(query, language)?;

        tracing::debug!(
            "Hybrid search: {} vector, {} keyword hits for {:?}",
            vector_results.len(),
            keyword_results.len(),
            query
        );

        // 3. 병합
        Ok(merge_results(vector_results, keyword_results, limit))
    }

    /// 검색 설정
    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// 저장소 통계
    pub fn stats(&self) -> Result<StoreStats> {
        self.store.stats()
    }

    /// 내부 스토어 접근
    pub fn store(&self) -> &KnowledgeStore {
        &self.store
    }
}

#[async_trait]
impl Retriever for HybridRetriever {
    async fn search(
        &self,
        query: &str,
        language: Language,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        self.hybrid_search(query, language, limit).await
    }
}

/// 두 결과 집합을 ID 기준으로 병합
///
/// 양쪽에 있으면 더 높은 점수를 유지하고 처음 등장한 위치를 지킵니다.
/// 점수 내림차순 안정 정렬 후 `limit`개로 자릅니다.
pub fn merge_results(
    vector_results: Vec<SearchResult>,
    keyword_results: Vec<SearchResult>,
    limit: usize,
) -> Vec<SearchResult> {
    let mut merged: Vec<SearchResult> = Vec::with_capacity(vector_results.len() + keyword_results.len());
    let mut positions: HashMap<i64, usize> = HashMap::new();

    for result in vector_results.into_iter().chain(keyword_results) {
        match positions.get(&result.segment.id) {
            Some(&index) => {
                let existing = &mut merged[index];
                if existing.method != result.method {
                    existing.method = SearchMethod::Hybrid;
                }
                if result.score > existing.score {
                    existing.score = result.score;
                }
            }
            None => {
                positions.insert(result.segment.id, merged.len());
                merged.push(result);
            }
        }
    }

    merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    merged.truncate(limit);
    merged
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::store::NewSegment;
    use std::collections::HashSet;
    use tempfile::TempDir;

    /// 항상 같은 벡터를 돌려주는 테스트용 임베딩
    struct FixedEmbedding(Vec<f32>);

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedding {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }

        fn dimension(&self) -> usize {
            self.0.len()
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    struct FailingEmbedding;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedding {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            anyhow::bail!("embedding service unavailable")
        }

        fn dimension(&self) -> usize {
            3
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    fn segment(source_id: &str, route: &str, zh: &str, embedding: Option<Vec<f32>>) -> NewSegment {
        NewSegment {
            source: "test".to_string(),
            source_id: Some(source_id.to_string()),
            page_route: Some(route.to_string()),
            title_zh: None,
            title_en: None,
            content_zh: zh.to_string(),
            content_en: format!("{} content", source_id),
            embedding_zh: embedding,
            embedding_en: None,
            ..Default::default()
        }
    }

    fn result(id: i64, score: f32, method: SearchMethod) -> SearchResult {
        SearchResult {
            segment: KnowledgeSegment {
                id,
                source: "test".to_string(),
                source_id: None,
                page_route: None,
                title_zh: None,
                title_en: None,
                content_zh: "内容".to_string(),
                content_en: "content".to_string(),
                metadata: serde_json::json!({}),
            },
            score,
            method,
        }
    }

    /// 1: 정확히 일치(1.0), 2: 0.8, 3: 직교(0.0), 4: 임베딩 없음 + 专利 포함, 5: 0.2 + 专利 포함
    fn create_retriever(embedder: Arc<dyn EmbeddingProvider>) -> (TempDir, HybridRetriever) {
        let dir = TempDir::new().unwrap();
        let store = KnowledgeStore::open(&dir.path().join("test.db")).unwrap();

        let weak = vec![0.2, (1.0f32 - 0.04).sqrt(), 0.0];
        for s in [
            segment("exact", "/products", "船用压缩机", Some(vec![1.0, 0.0, 0.0])),
            segment("close", "/products/marine", "风冷型", Some(vec![0.8, 0.6, 0.0])),
            segment("orthogonal", "/about", "公司简介", Some(vec![0.0, 1.0, 0.0])),
            segment("patents", "/certifications", "发明专利二十余项", None),
            segment("weak", "/certifications", "实用新型专利", Some(weak)),
        ] {
            store.insert_segment(&s).unwrap();
        }

        (
            dir,
            HybridRetriever::new(store, embedder, SearchConfig::default()),
        )
    }

    fn ids(results: &[SearchResult]) -> Vec<i64> {
        results.iter().map(|r| r.segment.id).collect()
    }

    #[tokio::test]
    async fn test_vector_stage_discards_weak_matches() {
        let (_dir, retriever) = create_retriever(Arc::new(FixedEmbedding(vec![1.0, 0.0, 0.0])));

        let results = retriever.search_vector("任意", Language::Zh).await.unwrap();
        assert_eq!(ids(&results), vec![1, 2]);
        assert!(results.iter().all(|r| r.score > 0.3));
        assert!(results.iter().all(|r| r.method == SearchMethod::Vector));
    }

    #[tokio::test]
    async fn test_hybrid_merges_keyword_hits() {
        let (_dir, retriever) = create_retriever(Arc::new(FixedEmbedding(vec![1.0, 0.0, 0.0])));

        let results = retriever
            .hybrid_search("你们有什么专利", Language::Zh, 8)
            .await
            .unwrap();

        // 벡터: 1(1.0), 2(0.8) / 키워드: 4, 5 (0.5)
        assert_eq!(ids(&results), vec![1, 2, 4, 5]);
        assert!((results[2].score - 0.5).abs() < 0.0001);
        assert_eq!(results[2].method, SearchMethod::Keyword);
        // weak(0.2)는 벡터 단계에서 버려졌지만 키워드로 0.5를 받음
        assert!((results[3].score - 0.5).abs() < 0.0001);
    }

    #[tokio::test]
    async fn test_hybrid_keeps_higher_score_on_overlap() {
        let (_dir, retriever) = create_retriever(Arc::new(FixedEmbedding(vec![1.0, 0.0, 0.0])));

        // "船用" 키워드가 1번(벡터 1.0)과 겹침
        let results = retriever
            .hybrid_search("船用", Language::Zh, 8)
            .await
            .unwrap();

        let first = &results[0];
        assert_eq!(first.segment.id, 1);
        assert!((first.score - 1.0).abs() < 0.0001);
        assert_eq!(first.method, SearchMethod::Hybrid);
    }

    #[tokio::test]
    async fn test_hybrid_result_invariants() {
        let (_dir, retriever) = create_retriever(Arc::new(FixedEmbedding(vec![0.7, 0.7, 0.1])));

        for query in ["船用压缩机专利", "公司简介", "marine", "你有什么案例"] {
            for limit in [1, 3, 8] {
                let results = retriever
                    .hybrid_search(query, Language::Zh, limit)
                    .await
                    .unwrap();

                assert!(results.len() <= limit);
                let unique: HashSet<_> = ids(&results).into_iter().collect();
                assert_eq!(unique.len(), results.len());
                assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
                for r in &results {
                    assert!(retriever.store().get_segment(r.segment.id).unwrap().is_some());
                }
            }
        }
    }

    #[tokio::test]
    async fn test_hybrid_empty_when_nothing_clears_bar() {
        // 모든 벡터 점수가 0.3 이하 (반대 방향), 키워드 매칭 없음
        let (_dir, retriever) = create_retriever(Arc::new(FixedEmbedding(vec![-1.0, 0.0, 0.0])));

        let results = retriever
            .hybrid_search("今天天气怎么样", Language::Zh, 8)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_embedding_failure_propagates() {
        let (_dir, retriever) = create_retriever(Arc::new(FailingEmbedding));
        let result = retriever.search("专利", Language::Zh, 8).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_merge_stable_on_ties() {
        let merged = merge_results(
            vec![result(7, 0.5, SearchMethod::Vector)],
            vec![
                result(3, 0.5, SearchMethod::Keyword),
                result(9, 0.5, SearchMethod::Keyword),
            ],
            8,
        );
        assert_eq!(ids(&merged), vec![7, 3, 9]);
    }

    #[test]
    fn test_merge_keyword_beats_weak_vector() {
        let merged = merge_results(
            vec![
                result(1, 0.9, SearchMethod::Vector),
                result(2, 0.35, SearchMethod::Vector),
            ],
            vec![
                result(2, 0.5, SearchMethod::Keyword),
                result(3, 0.5, SearchMethod::Keyword),
            ],
            2,
        );
        assert_eq!(ids(&merged), vec![1, 2]);
        assert!((merged[1].score - 0.5).abs() < 0.0001);
        assert_eq!(merged[1].method, SearchMethod::Hybrid);
    }
}
