//! 언어 모델 클라이언트 - OpenAI Chat Completions 스트리밍
//!
//! 응답을 `data:` 라인 단위로 해석해 `choices[0].delta.content` 조각만
//! 순서대로 내보냅니다. `[DONE]` 또는 스트림 종료에서 끝납니다.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::embedding::{api_error_message, get_api_key, get_base_url};

use super::ChatMessage;

/// 기본 채팅 모델
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o";

/// 연결 타임아웃 (스트리밍 응답 자체에는 전체 타임아웃을 두지 않음)
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// 텍스트 조각 스트림
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

// ============================================================================
// LanguageModel Trait
// ============================================================================

/// 언어 모델 인터페이스
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// 메시지 목록으로 스트리밍 응답 시작
    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<TokenStream>;

    /// 모델 이름
    fn model(&self) -> &str;
}

// ============================================================================
// OpenAI Chat
// ============================================================================

/// OpenAI 호환 Chat Completions 클라이언트
#[derive(Debug, Clone)]
pub struct OpenAiChat {
    api_key: String,
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OpenAiChat {
    /// # Arguments
    /// * `api_key` - OpenAI API 키
    /// * `base_url` - OpenAI 호환 엔드포인트
    /// * `model` - 모델 이름 (예: gpt-4o)
    pub fn new(api_key: String, base_url: &str, model: impl Into<String>) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing OpenAI API key");

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_key: api_key.trim().to_string(),
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.into(),
        })
    }

    /// 환경변수 설정으로 생성
    pub fn from_env(model: impl Into<String>) -> Result<Self> {
        Self::new(get_api_key()?, &get_base_url(), model)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[async_trait]
impl LanguageModel for OpenAiChat {
    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<TokenStream> {
        let request = CompletionRequest {
            model: &self.model,
            messages,
            stream: true,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send chat completion request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(api_error_message(status, &body));
        }

        tracing::debug!("Chat stream opened ({}, {} messages)", self.model, messages.len());
        Ok(decode_stream(response.bytes_stream()))
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// SSE Decoding
// ============================================================================

/// SSE 바이트 → `data:` 페이로드 디코더
///
/// 바이트 조각이 라인 중간(또는 UTF-8 문자 중간)에서 잘려도
/// 완성된 라인만 해석합니다.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 바이트 추가, 완성된 `data:` 페이로드 반환
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(payload) = data_payload(&line[..line.len() - 1]) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// 개행 없이 끝난 마지막 라인
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buffer);
        data_payload(&line)
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let payload = line.strip_prefix(b"data:")?;
    let text = String::from_utf8_lossy(payload);
    Some(text.trim_start().to_string())
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// 페이로드 해석 결과
#[derive(Debug, PartialEq, Eq)]
enum Delta {
    Text(String),
    Done,
    Skip,
}

fn parse_delta(payload: &str) -> Delta {
    if payload == "[DONE]" {
        return Delta::Done;
    }

    match serde_json::from_str::<CompletionChunk>(payload) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta)
            .and_then(|delta| delta.content)
            .filter(|content| !content.is_empty())
            .map_or(Delta::Skip, Delta::Text),
        Err(e) => {
            tracing::warn!("Skipping malformed stream chunk: {}", e);
            Delta::Skip
        }
    }
}

struct DecodeState<S> {
    body: Pin<Box<S>>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    done: bool,
}

/// 응답 바이트 스트림 → 텍스트 조각 스트림
///
/// 전송 오류는 한 번 내보낸 뒤 스트림을 끝냅니다.
pub(crate) fn decode_stream<S, B, E>(body: S) -> TokenStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let state = DecodeState {
        body: Box::pin(body),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(text) = state.pending.pop_front() {
                return Some((Ok(text), state));
            }
            if state.done {
                return None;
            }

            match state.body.next().await {
                Some(Ok(chunk)) => {
                    for payload in state.decoder.push(chunk.as_ref()) {
                        match parse_delta(&payload) {
                            Delta::Text(text) => state.pending.push_back(text),
                            Delta::Done => {
                                state.done = true;
                                break;
                            }
                            Delta::Skip => {}
                        }
                    }
                }
                Some(Err(e)) => {
                    state.done = true;
                    let err = anyhow::Error::new(e).context("Failed to read model stream");
                    return Some((Err(err), state));
                }
                None => {
                    if let Some(Delta::Text(text)) = state.decoder.finish().map(|p| parse_delta(&p)) {
                        state.pending.push_back(text);
                    }
                    state.done = true;
                }
            }
        }
    }))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": content}}]})
        )
    }

    async fn collect(stream: TokenStream) -> Vec<Result<String>> {
        stream.collect().await
    }

    #[test]
    fn test_decoder_split_lines() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        assert_eq!(decoder.push(b":1}\r\n\r\n: keep-alive\n"), vec!["{\"a\":1}".to_string()]);
        assert!(decoder.push(b"event: x\ndata:[DONE]").is_empty());
        assert_eq!(decoder.finish(), Some("[DONE]".to_string()));
    }

    #[test]
    fn test_decoder_split_utf8() {
        let line = chunk("压缩机");
        let bytes = line.as_bytes();
        let cut = line.find("压").unwrap() + 1;

        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&bytes[..cut]).is_empty());
        let payloads = decoder.push(&bytes[cut..]);
        assert_eq!(payloads.len(), 1);
        assert_eq!(parse_delta(&payloads[0]), Delta::Text("压缩机".to_string()));
    }

    #[test]
    fn test_parse_delta() {
        assert_eq!(parse_delta("[DONE]"), Delta::Done);
        assert_eq!(parse_delta("{\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}"), Delta::Skip);
        assert_eq!(parse_delta("{\"choices\":[{\"delta\":{\"content\":\"\"}}]}"), Delta::Skip);
        assert_eq!(parse_delta("{\"choices\":[]}"), Delta::Skip);
        assert_eq!(parse_delta("not json"), Delta::Skip);
        assert_eq!(
            parse_delta("{\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}"),
            Delta::Text("Hi".to_string())
        );
    }

    #[tokio::test]
    async fn test_decode_stream_until_done() {
        let body = format!("{}{}data: [DONE]\n\n{}", chunk("Hel"), chunk("lo"), chunk("ignored"));
        let parts: Vec<std::result::Result<Vec<u8>, std::io::Error>> = body
            .as_bytes()
            .chunks(7)
            .map(|c| Ok(c.to_vec()))
            .collect();

        let items = collect(decode_stream(futures::stream::iter(parts))).await;
        let texts: Vec<String> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(texts, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn test_decode_stream_eof_without_done() {
        let body = format!("{}data: {}", chunk("a"), serde_json::json!({"choices": [{"delta": {"content": "b"}}]}));
        let parts: Vec<std::result::Result<Vec<u8>, std::io::Error>> = vec![Ok(body.into_bytes())];

        let items = collect(decode_stream(futures::stream::iter(parts))).await;
        let texts: Vec<String> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(texts, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_decode_stream_error_ends_stream() {
        let parts: Vec<std::result::Result<Vec<u8>, std::io::Error>> = vec![
            Ok(chunk("x").into_bytes()),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(chunk("never").into_bytes()),
        ];

        let items = collect(decode_stream(futures::stream::iter(parts))).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "x");
        assert!(items[1].is_err());
    }

    #[test]
    fn test_request_body() {
        let messages = vec![ChatMessage::system("S"), ChatMessage::user("U")];
        let request = CompletionRequest {
            model: DEFAULT_CHAT_MODEL,
            messages: &messages,
            stream: true,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "gpt-4o");
        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "U");
    }

    #[test]
    fn test_endpoint() {
        let chat = OpenAiChat::new("sk-test".to_string(), "http://localhost:8080/v1/", "gpt-4o").unwrap();
        assert_eq!(chat.endpoint(), "http://localhost:8080/v1/chat/completions");
        assert_eq!(chat.model(), "gpt-4o");
        assert!(OpenAiChat::new("  ".to_string(), "http://x", "gpt-4o").is_err());
    }
}
