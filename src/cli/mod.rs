//! CLI 모듈
//!
//! shunfeng-chat CLI 명령어 정의 및 구현

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::chat::{
    ChatConfig, ChatService, LanguageModel, OpenAiChat, SessionConfig, SessionStore, SystemClock,
    DEFAULT_CHAT_MODEL,
};
use crate::embedding::{create_embedder, get_api_key, get_base_url, has_api_key, EmbeddingProvider};
use crate::knowledge::{
    default_db_path, detect_language, HybridRetriever, KnowledgeSegment, KnowledgeStore,
    NewSegment, SearchConfig, SearchMethod,
};
use crate::language::Language;
use crate::server;

/// ingest 시 레코드 사이 대기 (임베딩 API 호출 제한)
const INGEST_PAUSE: Duration = Duration::from_millis(200);

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "shunfeng-chat")]
#[command(version, about = "사이트 지식베이스 기반 RAG 채팅 서비스", long_about = None)]
pub struct Cli {
    /// SQLite DB 경로 (기본: <data_local_dir>/.shunfeng-chat/knowledge.db)
    #[arg(long, global = true, env = "SHUNFENG_DB")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// HTTP 채팅 서버 실행
    Serve {
        /// 바인드 주소
        #[arg(long, env = "SHUNFENG_BIND", default_value = "127.0.0.1:3000")]
        bind: String,

        /// 채팅 모델
        #[arg(long, env = "SHUNFENG_MODEL", default_value = DEFAULT_CHAT_MODEL)]
        model: String,

        #[command(flatten)]
        search: SearchArgs,

        #[command(flatten)]
        chat: ChatArgs,
    },

    /// 지식베이스 검색 (디버그)
    Query {
        /// 검색 쿼리
        query: String,

        /// 검색 언어 (zh / en, 생략 시 자동 감지)
        #[arg(short = 'L', long)]
        language: Option<String>,

        /// 결과 개수 제한
        #[arg(short, long, default_value = "8")]
        limit: usize,

        /// 관련도 판정 임계값
        #[arg(long, default_value = "0.15")]
        relevance_threshold: f32,

        #[command(flatten)]
        search: SearchArgs,
    },

    /// JSON 세그먼트 파일을 임베딩하여 지식베이스에 추가
    Ingest {
        /// 세그먼트 JSON 배열 파일
        #[arg(short, long)]
        file: PathBuf,

        /// 기존 세그먼트를 모두 교체
        #[arg(long)]
        replace: bool,
    },

    /// 상태 확인
    Status {
        /// 저장된 세그먼트 목록 출력 (id/source/source_id/제목)
        #[arg(long)]
        list: bool,
    },
}

/// 검색 파라미터
#[derive(Args, Debug, Clone)]
pub struct SearchArgs {
    /// 벡터 점수 하한 (이하 버림)
    #[arg(long, default_value = "0.3")]
    pub vector_min_score: f32,

    /// 키워드 매칭 고정 점수
    #[arg(long, default_value = "0.5")]
    pub keyword_score: f32,
}

impl SearchArgs {
    fn config(&self) -> SearchConfig {
        SearchConfig {
            vector_min_score: self.vector_min_score,
            keyword_score: self.keyword_score,
            ..SearchConfig::default()
        }
    }
}

/// 채팅/세션 파라미터
#[derive(Args, Debug, Clone)]
pub struct ChatArgs {
    /// 관련도 판정 임계값 (최상위 점수가 미만이면 범위 밖)
    #[arg(long, default_value = "0.15")]
    pub relevance_threshold: f32,

    /// 보관할 대화 왕복 수
    #[arg(long, default_value = "10")]
    pub max_history_rounds: usize,

    /// 세션 유휴 만료 (초)
    #[arg(long, default_value = "1800")]
    pub session_ttl_secs: u64,

    /// 세션 정리 주기 (초)
    #[arg(long, default_value = "300")]
    pub sweep_interval_secs: u64,
}

impl ChatArgs {
    fn chat_config(&self) -> ChatConfig {
        ChatConfig {
            relevance_threshold: self.relevance_threshold,
            ..ChatConfig::default()
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_history_rounds: self.max_history_rounds,
            ttl: Duration::from_secs(self.session_ttl_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
        }
    }
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let db_path = cli.db.unwrap_or_else(default_db_path);

    match cli.command {
        Commands::Serve {
            bind,
            model,
            search,
            chat,
        } => cmd_serve(&db_path, &bind, model, search, chat).await,
        Commands::Query {
            query,
            language,
            limit,
            relevance_threshold,
            search,
        } => cmd_query(&db_path, &query, language, limit, relevance_threshold, search).await,
        Commands::Ingest { file, replace } => cmd_ingest(&db_path, &file, replace).await,
        Commands::Status { list } => cmd_status(&db_path, list).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// 서버 명령어 (serve)
async fn cmd_serve(
    db_path: &Path,
    bind: &str,
    model: String,
    search: SearchArgs,
    chat: ChatArgs,
) -> Result<()> {
    require_api_key()?;

    let store = KnowledgeStore::open(db_path).context("KnowledgeStore 열기 실패")?;
    let count = store.count().context("세그먼트 수 조회 실패")?;
    if count == 0 {
        tracing::warn!(
            "Knowledge base is empty ({}); every question will be out of scope until `ingest` runs",
            db_path.display()
        );
    } else {
        tracing::info!("Loaded knowledge base: {} segments", count);
    }

    let api_key = get_api_key()?;
    let base_url = get_base_url();
    let embedder = create_embedder(api_key.clone(), &base_url)?;
    let retriever = HybridRetriever::new(store, Arc::new(embedder), search.config());
    let llm = OpenAiChat::new(api_key, &base_url, model).context("채팅 모델 클라이언트 생성 실패")?;
    tracing::info!("Using chat model {} via {}", llm.model(), base_url);

    let sessions = Arc::new(SessionStore::new(
        chat.session_config(),
        Arc::new(SystemClock),
    ));
    sessions.start();

    let service = Arc::new(ChatService::new(
        Arc::new(retriever),
        Arc::new(llm),
        sessions.clone(),
        chat.chat_config(),
    ));

    let result = server::serve(service, bind).await;
    sessions.stop();
    result
}

/// 검색 명령어 (query)
///
/// 하이브리드 검색 결과와 관련도 판정 결과를 출력합니다.
async fn cmd_query(
    db_path: &Path,
    query: &str,
    language: Option<String>,
    limit: usize,
    relevance_threshold: f32,
    search: SearchArgs,
) -> Result<()> {
    require_api_key()?;

    let language = match language {
        Some(code) => code.parse::<Language>()?,
        None => detect_language(query),
    };

    println!("[*] 검색 중: \"{}\" ({})", query, language);

    let store = KnowledgeStore::open(db_path).context("KnowledgeStore 열기 실패")?;
    let embedder = create_embedder(get_api_key()?, &get_base_url())?;
    let retriever = HybridRetriever::new(store, Arc::new(embedder), search.config());

    let results = retriever
        .hybrid_search(query, language, limit)
        .await
        .context("검색 실패")?;

    if results.is_empty() {
        println!("\n[!] 검색 결과가 없습니다. (범위 밖 질문으로 처리됨)");
        return Ok(());
    }

    println!("\n[OK] 검색 결과 ({} 건):\n", results.len());

    for (i, result) in results.iter().enumerate() {
        let method_str = match result.method {
            SearchMethod::Vector => "VEC",
            SearchMethod::Keyword => "KW",
            SearchMethod::Hybrid => "HYB",
        };
        let segment = &result.segment;

        println!(
            "{}. [{}] [점수: {:.4}] #{} {}",
            i + 1,
            method_str,
            result.score,
            segment.id,
            segment.source
        );
        if let Some(title) = segment.title(language) {
            println!("   제목: {}", title);
        }
        println!("   페이지: {}", segment.page_route.as_deref().unwrap_or("-"));
        println!("   내용: {}", truncate_text(segment.content(language), 200));
        println!();
    }

    let top = results[0].score;
    if top < relevance_threshold {
        println!("[!] 최상위 점수 {:.4} < {:.2}: 범위 밖 질문으로 처리됨", top, relevance_threshold);
    } else {
        println!("[OK] 최상위 점수 {:.4} >= {:.2}: 답변 생성 대상", top, relevance_threshold);
    }

    Ok(())
}

/// 수집 명령어 (ingest)
///
/// 세그먼트마다 중국어/영어 본문을 임베딩하여 저장합니다.
async fn cmd_ingest(db_path: &Path, file: &Path, replace: bool) -> Result<()> {
    require_api_key()?;

    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("파일 읽기 실패: {}", file.display()))?;
    let segments: Vec<NewSegment> =
        serde_json::from_str(&raw).context("세그먼트 JSON 파싱 실패")?;

    if segments.is_empty() {
        println!("[!] 수집할 세그먼트가 없습니다.");
        return Ok(());
    }

    let embedder = create_embedder(get_api_key()?, &get_base_url())?;
    let store = KnowledgeStore::open(db_path).context("KnowledgeStore 열기 실패")?;

    let written = ingest_segments(&store, &embedder, segments, replace, INGEST_PAUSE).await?;

    println!();
    println!("[OK] {} 세그먼트 저장됨 ({})", written, store.db_path().display());
    Ok(())
}

/// 검증 → 임베딩 → 한 트랜잭션으로 저장
///
/// 레코드 하나라도 실패하면 아무것도 저장하지 않습니다.
async fn ingest_segments(
    store: &KnowledgeStore,
    embedder: &dyn EmbeddingProvider,
    mut segments: Vec<NewSegment>,
    replace: bool,
    pause: Duration,
) -> Result<usize> {
    // 임베딩 호출 전에 전부 검증
    for (i, segment) in segments.iter().enumerate() {
        segment
            .validate()
            .with_context(|| format!("세그먼트 {} 검증 실패", i + 1))?;
    }

    println!("[*] 임베딩 대상: {} 세그먼트", segments.len());

    let total = segments.len();
    for (i, segment) in segments.iter_mut().enumerate() {
        print!(
            "[{}/{}] [{}] {}... ",
            i + 1,
            total,
            segment.source,
            segment.source_id.as_deref().unwrap_or("-")
        );

        embed_segment(embedder, segment)
            .await
            .with_context(|| format!("세그먼트 {} 임베딩 실패", i + 1))?;
        println!("완료");

        if i + 1 < total {
            tokio::time::sleep(pause).await;
        }
    }

    if replace {
        store.replace_all(&segments).context("세그먼트 교체 실패")
    } else {
        store.insert_all(&segments).context("세그먼트 저장 실패")
    }
}

/// 상태 명령어 (status)
async fn cmd_status(db_path: &Path, list: bool) -> Result<()> {
    println!("shunfeng-chat v{}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("[*] DB 경로: {}", db_path.display());

    if has_api_key() {
        println!("[OK] API 키: 설정됨 ({})", get_base_url());
    } else {
        println!("[!] API 키: 미설정");
        println!("    설정: export OPENAI_API_KEY=your-key");
    }

    let store = match KnowledgeStore::open(db_path) {
        Ok(store) => store,
        Err(e) => {
            println!("[!] KnowledgeStore 열기 실패: {}", e);
            return Ok(());
        }
    };

    match store.stats() {
        Ok(stats) => {
            println!("[OK] 저장된 세그먼트: {} 건", stats.segment_count);
            println!(
                "     임베딩: zh {} / en {}",
                stats.embedded_zh, stats.embedded_en
            );
            println!("     DB 크기: {}", format_bytes(file_size(db_path)));

            if list && stats.segment_count > 0 {
                let segments = store
                    .list_segments(stats.segment_count)
                    .context("세그먼트 목록 조회 실패")?;
                println!();
                for segment in &segments {
                    println!("  {}", format_segment_line(segment));
                }
            }
        }
        Err(e) => {
            println!("[!] 통계 조회 실패: {}", e);
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn require_api_key() -> Result<()> {
    if !has_api_key() {
        bail!(
            "API 키가 설정되지 않았습니다.\n\n\
             설정 방법:\n  \
             export OPENAI_API_KEY=your-api-key\n  \
             (선택) export OPENAI_BASE_URL=https://api.openai.com/v1\n\n\
             API 키 발급: https://platform.openai.com/api-keys"
        );
    }
    Ok(())
}

/// 비어 있는 언어별 임베딩 채우기 (두 언어 동시 요청)
async fn embed_segment(embedder: &dyn EmbeddingProvider, segment: &mut NewSegment) -> Result<()> {
    let zh = async {
        match segment.embedding_zh {
            Some(_) => Ok(None),
            None => embedder.embed(&segment.content_zh).await.map(Some),
        }
    };
    let en = async {
        match segment.embedding_en {
            Some(_) => Ok(None),
            None => embedder.embed(&segment.content_en).await.map(Some),
        }
    };

    let (zh, en) = futures::try_join!(zh, en)?;
    if let Some(embedding) = zh {
        segment.embedding_zh = Some(embedding);
    }
    if let Some(embedding) = en {
        segment.embedding_en = Some(embedding);
    }
    Ok(())
}

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// 목록 한 줄: `#id [source] source_id 제목`
fn format_segment_line(segment: &KnowledgeSegment) -> String {
    format!(
        "#{} [{}] {} {}",
        segment.id,
        segment.source,
        segment.source_id.as_deref().unwrap_or("-"),
        truncate_text(segment.title_zh.as_deref().unwrap_or("-"), 30)
    )
}

fn file_size(path: &Path) -> usize {
    std::fs::metadata(path).map(|m| m.len() as usize).unwrap_or(0)
}

/// 바이트 크기 포맷팅
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================
