//! 임베딩 모듈 - OpenAI Embeddings API를 통한 텍스트 벡터화
//!
//! 질의와 지식 세그먼트를 같은 모델(text-embedding-3-small)로 벡터화합니다.
//! 모델은 언어에 무관하므로 질의 임베딩은 한 번만 계산합니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let embedder = OpenAiEmbedding::from_env()?;
//! let embedding = embedder.embed("船用压缩机").await?;
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
///
/// 텍스트를 벡터로 변환하는 인터페이스입니다.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 단일 텍스트 임베딩
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 프로바이더 이름
    fn name(&self) -> &str;
}

// ============================================================================
// OpenAI Embedding
// ============================================================================

/// 기본 API 엔드포인트
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// 임베딩 모델
/// source: https://platform.openai.com/docs/guides/embeddings
pub const EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// 기본 임베딩 차원 (text-embedding-3-small)
pub const DEFAULT_DIMENSION: usize = 1536;

/// 요청 타임아웃
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// OpenAI 임베딩 구현체
///
/// 재시도는 하지 않습니다. 실패는 그대로 호출자(채팅 오케스트레이터)에게 전달됩니다.
#[derive(Debug, Clone)]
pub struct OpenAiEmbedding {
    api_key: String,
    client: reqwest::Client,
    endpoint: String,
    dimension: usize,
}

impl OpenAiEmbedding {
    /// 새 OpenAI 임베딩 인스턴스 생성
    ///
    /// # Arguments
    /// * `api_key` - OpenAI API 키
    /// * `base_url` - OpenAI 호환 엔드포인트 (예: https://api.openai.com/v1)
    pub fn new(api_key: String, base_url: &str) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing OpenAI API key");

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_key: api_key.trim().to_string(),
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            dimension: DEFAULT_DIMENSION,
        })
    }

    /// 환경변수에서 API 키와 엔드포인트를 읽어 생성
    pub fn from_env() -> Result<Self> {
        let api_key = get_api_key()?;
        Self::new(api_key, &get_base_url())
    }

    /// 요청 엔드포인트
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Embeddings API 요청 본문
#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

/// Embeddings API 응답
#[derive(Debug, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// OpenAI 에러 응답
#[derive(Debug, Deserialize)]
pub(crate) struct ApiError {
    pub(crate) error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorDetail {
    pub(crate) message: String,
    #[serde(default, rename = "type")]
    pub(crate) kind: String,
}

/// 응답 본문에서 첫 번째 임베딩 추출
fn parse_embedding(body: &str) -> Result<Vec<f32>> {
    let response: EmbedResponse =
        serde_json::from_str(body).context("Failed to parse embedding response")?;

    response
        .data
        .into_iter()
        .next()
        .map(|d| d.embedding)
        .ok_or_else(|| anyhow::anyhow!("Embedding response contained no data"))
}

/// 실패 응답을 에러 메시지로 변환
pub(crate) fn api_error_message(status: reqwest::StatusCode, body: &str) -> String {
    match serde_json::from_str::<ApiError>(body) {
        Ok(err) if err.error.kind.is_empty() => {
            format!("OpenAI API error ({}): {}", status, err.error.message)
        }
        Ok(err) => format!(
            "OpenAI API error ({}, {}): {}",
            status, err.error.kind, err.error.message
        ),
        Err(_) => format!("OpenAI API error ({}): {}", status, body),
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        // 빈 텍스트 처리 (API는 빈 입력을 거부함)
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimension]);
        }

        let request = EmbedRequest {
            model: EMBEDDING_MODEL,
            input: text,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send embedding request")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read response body")?;

        if !status.is_success() {
            anyhow::bail!(api_error_message(status, &body));
        }

        let embedding = parse_embedding(&body)?;
        tracing::debug!("Embedded {} chars -> {} dims", text.chars().count(), embedding.len());
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        EMBEDDING_MODEL
    }
}

// ============================================================================
// API Key Management
// ============================================================================

/// API 키 로드 (`OPENAI_API_KEY` 환경변수)
pub fn get_api_key() -> Result<String> {
    match std::env::var("OPENAI_API_KEY") {
        Ok(key) if !key.trim().is_empty() => {
            tracing::debug!("Using API key from OPENAI_API_KEY");
            Ok(key)
        }
        _ => anyhow::bail!(
            "API key not found. Set OPENAI_API_KEY environment variable.\n\
             Get your API key at: https://platform.openai.com/api-keys"
        ),
    }
}

/// API 키 존재 여부 확인
pub fn has_api_key() -> bool {
    std::env::var("OPENAI_API_KEY")
        .map(|key| !key.trim().is_empty())
        .unwrap_or(false)
}

/// 엔드포인트 로드 (`OPENAI_BASE_URL`, 없으면 기본값)
pub fn get_base_url() -> String {
    std::env::var("OPENAI_BASE_URL")
        .ok()
        .filter(|url| !url.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
}

// ============================================================================
// Factory Function
// ============================================================================

/// 임베딩 프로바이더 생성 (OpenAI API)
pub fn create_embedder(api_key: String, base_url: &str) -> Result<OpenAiEmbedding> {
    let embedder = OpenAiEmbedding::new(api_key, base_url)?;
    tracing::info!(
        "Using {} embedding (dimension: {})",
        embedder.name(),
        embedder.dimension()
    );
    Ok(embedder)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_key_rejected() {
        let result = OpenAiEmbedding::new("   ".to_string(), DEFAULT_BASE_URL);
        assert!(result.is_err());
        assert!(result
            .err()
            .map(|e| e.to_string().contains("missing OpenAI API key"))
            .unwrap_or(false));
    }

    #[test]
    fn test_endpoint_trailing_slash() {
        let embedder =
            OpenAiEmbedding::new("fake_key".to_string(), "http://localhost:8080/v1/").unwrap();
        assert_eq!(embedder.endpoint(), "http://localhost:8080/v1/embeddings");
        assert_eq!(embedder.dimension(), DEFAULT_DIMENSION);
    }

    #[test]
    fn test_parse_embedding() {
        let body = r#"{"object":"list","data":[{"object":"embedding","index":0,"embedding":[0.1,-0.2,0.3]}],"model":"text-embedding-3-small"}"#;
        let embedding = parse_embedding(body).unwrap();
        assert_eq!(embedding, vec![0.1, -0.2, 0.3]);

        assert!(parse_embedding(r#"{"data":[]}"#).is_err());
        assert!(parse_embedding("not json").is_err());
    }

    #[test]
    fn test_api_error_message() {
        let body = r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error"}}"#;
        let msg = api_error_message(reqwest::StatusCode::UNAUTHORIZED, body);
        assert!(msg.contains("401"));
        assert!(msg.contains("invalid_request_error"));
        assert!(msg.contains("Incorrect API key provided"));

        let msg = api_error_message(reqwest::StatusCode::BAD_GATEWAY, "upstream down");
        assert!(msg.contains("upstream down"));
    }

    #[tokio::test]
    async fn test_embed_empty_text_skips_request() {
        // 요청 없이 0 벡터를 돌려주므로 존재하지 않는 엔드포인트여도 성공
        let embedder =
            OpenAiEmbedding::new("fake_key".to_string(), "http://127.0.0.1:9").unwrap();
        let embedding = embedder.embed("   ").await.unwrap();
        assert_eq!(embedding.len(), DEFAULT_DIMENSION);
        assert!(embedding.iter().all(|v| *v == 0.0));
    }
}
