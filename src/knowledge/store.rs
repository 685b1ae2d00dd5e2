//! Knowledge Store - rusqlite 기반 지식 세그먼트 저장소
//!
//! 사이트 콘텐츠를 이중 언어(중/영) 세그먼트 단위로 저장합니다.
//! 세그먼트마다 언어별 임베딩을 BLOB으로 함께 보관하며,
//! 채팅 경로에서는 읽기 전용으로 사용됩니다.
//! 저장 위치: <data_local_dir>/.shunfeng-chat/knowledge.db

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, Row};
use serde::{Deserialize, Serialize};

use super::vector::{cosine_distance, decode_embedding, encode_embedding};
use crate::language::Language;

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로 (<data_local_dir>/.shunfeng-chat/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".shunfeng-chat")
}

/// 기본 DB 경로
pub fn default_db_path() -> PathBuf {
    get_data_dir().join("knowledge.db")
}

// ============================================================================
// Types
// ============================================================================

/// 저장된 지식 세그먼트 (임베딩 제외 projection)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeSegment {
    pub id: i64,
    /// 논리적 출처 (products, projects, certifications ...)
    pub source: String,
    pub source_id: Option<String>,
    /// 사이트 상대 경로 - 네비게이션 대상으로 노출 가능한 유일한 필드
    pub page_route: Option<String>,
    pub title_zh: Option<String>,
    pub title_en: Option<String>,
    pub content_zh: String,
    pub content_en: String,
    pub metadata: serde_json::Value,
}

impl KnowledgeSegment {
    /// 언어별 본문
    pub fn content(&self, language: Language) -> &str {
        match language {
            Language::Zh => &self.content_zh,
            Language::En => &self.content_en,
        }
    }

    /// 언어별 제목
    pub fn title(&self, language: Language) -> Option<&str> {
        match language {
            Language::Zh => self.title_zh.as_deref(),
            Language::En => self.title_en.as_deref(),
        }
    }
}

/// 새 세그먼트 입력용 구조체 (ingest JSON 레코드)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSegment {
    pub source: String,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub page_route: Option<String>,
    #[serde(default)]
    pub title_zh: Option<String>,
    #[serde(default)]
    pub title_en: Option<String>,
    pub content_zh: String,
    pub content_en: String,
    #[serde(default)]
    pub embedding_zh: Option<Vec<f32>>,
    #[serde(default)]
    pub embedding_en: Option<Vec<f32>>,
    #[serde(default = "empty_metadata")]
    pub metadata: serde_json::Value,
}

impl Default for NewSegment {
    fn default() -> Self {
        Self {
            source: String::new(),
            source_id: None,
            page_route: None,
            title_zh: None,
            title_en: None,
            content_zh: String::new(),
            content_en: String::new(),
            embedding_zh: None,
            embedding_en: None,
            metadata: empty_metadata(),
        }
    }
}

impl NewSegment {
    /// 저장 전 검증 (본문 비어 있음, 언어별 임베딩 차원 불일치)
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.content_zh.trim().is_empty() && !self.content_en.trim().is_empty(),
            "Segment {}/{:?} has empty content",
            self.source,
            self.source_id
        );

        if let (Some(zh), Some(en)) = (&self.embedding_zh, &self.embedding_en) {
            anyhow::ensure!(
                zh.len() == en.len(),
                "Segment {}/{:?} has mismatched embedding dimensions ({} vs {})",
                self.source,
                self.source_id,
                zh.len(),
                en.len()
            );
        }

        Ok(())
    }
}

fn empty_metadata() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

/// 저장소 통계
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub segment_count: usize,
    pub embedded_zh: usize,
    pub embedded_en: usize,
    pub db_path: PathBuf,
}

/// 키워드 검색 한 번의 조회에 넣는 최대 키워드 수
///
/// 키워드마다 LIKE 두 개가 OR로 이어지며, SQLite 식 트리 깊이 기본 제한은 1000입니다.
const KEYWORD_BATCH: usize = 200;

/// 세그먼트 조회 컬럼 (row_to_segment와 순서 일치)
const SEGMENT_COLUMNS: &str =
    "id, source, source_id, page_route, title_zh, title_en, content_zh, content_en, metadata";

// ============================================================================
// KnowledgeStore
// ============================================================================

/// Knowledge Store - 동기 지식 저장소
///
/// SQLite 기반 세그먼트 저장, 벡터 거리 정렬, 부분 문자열 키워드 검색을 제공합니다.
#[derive(Clone)]
pub struct KnowledgeStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl KnowledgeStore {
    /// 저장소 열기 (없으면 생성)
    ///
    /// # Arguments
    /// * `path` - DB 파일 경로 (없으면 생성)
    pub fn open(path: &Path) -> Result<Self> {
        // 부모 디렉토리 생성
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create database directory")?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open SQLite database")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
        };

        store.initialize()?;
        Ok(store)
    }

    /// 기본 위치에서 열기 (~/.shunfeng-chat/knowledge.db)
    pub fn open_default() -> Result<Self> {
        Self::open(&default_db_path())
    }

    /// DB 경로 반환
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    /// 스키마 초기화
    fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS knowledge_segments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                source_id TEXT,
                page_route TEXT,
                title_zh TEXT,
                title_en TEXT,
                content_zh TEXT NOT NULL,
                content_en TEXT NOT NULL,
                embedding_zh BLOB,
                embedding_en BLOB,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )
        .context("Failed to create knowledge_segments table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_segments_source ON knowledge_segments(source, source_id)",
            [],
        )
        .context("Failed to create source index")?;

        tracing::debug!("Knowledge store initialized at {:?}", self.db_path);
        Ok(())
    }

    /// 세그먼트 저장
    pub fn insert_segment(&self, segment: &NewSegment) -> Result<i64> {
        let conn = self.lock()?;
        let id = insert_with(&conn, segment)?;
        tracing::debug!("Added segment: {}/{:?} (id={})", segment.source, segment.source_id, id);
        Ok(id)
    }

    /// 여러 세그먼트 추가 (하나의 트랜잭션, 하나라도 실패하면 전부 취소)
    pub fn insert_all(&self, segments: &[NewSegment]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;

        for segment in segments {
            insert_with(&tx, segment)?;
        }

        tx.commit().context("Failed to commit segments")?;
        tracing::info!("Added {} segments", segments.len());
        Ok(segments.len())
    }

    /// 전체 교체 (트랜잭션: truncate + insert, ID 재시작)
    pub fn replace_all(&self, segments: &[NewSegment]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;

        tx.execute("DELETE FROM knowledge_segments", [])
            .context("Failed to truncate knowledge_segments")?;
        tx.execute(
            "DELETE FROM sqlite_sequence WHERE name = 'knowledge_segments'",
            [],
        )
        .context("Failed to reset segment ids")?;

        for segment in segments {
            insert_with(&tx, segment)?;
        }

        tx.commit().context("Failed to commit segments")?;
        tracing::info!("Replaced knowledge base with {} segments", segments.len());
        Ok(segments.len())
    }

    /// ID로 세그먼트 조회
    pub fn get_segment(&self, id: i64) -> Result<Option<KnowledgeSegment>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {SEGMENT_COLUMNS} FROM knowledge_segments WHERE id = ?1"
        ))?;

        let mut rows = stmt.query_map(params![id], row_to_segment)?;
        let segment = rows.next().transpose().context("Failed to read segment")?;
        Ok(segment)
    }

    /// 세그먼트 목록 (ID 순)
    pub fn list_segments(&self, limit: usize) -> Result<Vec<KnowledgeSegment>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {SEGMENT_COLUMNS} FROM knowledge_segments ORDER BY id LIMIT ?1"
        ))?;

        let segments = stmt
            .query_map(params![limit as i64], row_to_segment)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list segments")?;

        Ok(segments)
    }

    /// 벡터 거리 정렬 검색
    ///
    /// 해당 언어의 임베딩이 있는 세그먼트만 대상으로 코사인 거리 오름차순 정렬 후
    /// 상위 `limit`개를 `(세그먼트, 1 - 거리)`로 반환합니다.
    /// 차원이 다른 임베딩은 경고 후 건너뜁니다.
    pub fn vector_search(
        &self,
        query_embedding: &[f32],
        language: Language,
        limit: usize,
    ) -> Result<Vec<(KnowledgeSegment, f32)>> {
        let column = embedding_column(language);
        let conn = self.lock()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {SEGMENT_COLUMNS}, {column} FROM knowledge_segments
             WHERE {column} IS NOT NULL
             ORDER BY id"
        ))?;

        let rows = stmt
            .query_map([], |row| {
                let segment = row_to_segment(row)?;
                let blob: Vec<u8> = row.get(9)?;
                Ok((segment, blob))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read embeddings")?;

        let mut scored = Vec::with_capacity(rows.len());
        for (segment, blob) in rows {
            let embedding = decode_embedding(&blob)
                .with_context(|| format!("Corrupt {} for segment {}", column, segment.id))?;

            if embedding.len() != query_embedding.len() {
                tracing::warn!(
                    "Skipping segment {}: {} has {} dims, query has {}",
                    segment.id,
                    column,
                    embedding.len(),
                    query_embedding.len()
                );
                continue;
            }

            let distance = cosine_distance(query_embedding, &embedding);
            scored.push((segment, distance));
        }

        // 안정 정렬 - 같은 거리는 ID 순 유지
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        Ok(scored
            .into_iter()
            .map(|(segment, distance)| (segment, 1.0 - distance))
            .collect())
    }

    /// 키워드 검색 (대소문자 무시 부분 문자열, OR 조건)
    ///
    /// 언어별 본문 또는 제목에 키워드 중 하나라도 포함된 세그먼트를 ID 순으로
    /// 최대 `limit`개 반환합니다. 키워드가 많으면 SQLite 식 깊이 제한을 넘지
    /// 않도록 `KEYWORD_BATCH`개씩 나눠 조회한 뒤 ID 순으로 합칩니다.
    pub fn keyword_search(
        &self,
        terms: &[String],
        language: Language,
        limit: usize,
    ) -> Result<Vec<KnowledgeSegment>> {
        if terms.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let conn = self.lock()?;
        let mut found: BTreeMap<i64, KnowledgeSegment> = BTreeMap::new();

        for batch in terms.chunks(KEYWORD_BATCH) {
            for segment in keyword_batch(&conn, batch, language, limit)? {
                found.entry(segment.id).or_insert(segment);
            }
        }

        Ok(found.into_values().take(limit).collect())
    }

    /// 세그먼트 수
    pub fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM knowledge_segments", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// 저장소 통계
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock()?;

        let (count, zh, en): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*),
                    COUNT(embedding_zh),
                    COUNT(embedding_en)
             FROM knowledge_segments",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(StoreStats {
            segment_count: count as usize,
            embedded_zh: zh as usize,
            embedded_en: en as usize,
            db_path: self.db_path.clone(),
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn embedding_column(language: Language) -> &'static str {
    match language {
        Language::Zh => "embedding_zh",
        Language::En => "embedding_en",
    }
}

fn text_columns(language: Language) -> (&'static str, &'static str) {
    match language {
        Language::Zh => ("content_zh", "title_zh"),
        Language::En => ("content_en", "title_en"),
    }
}

/// 키워드 한 묶음에 대한 OR 조회 (ID 순, 최대 `limit`개)
fn keyword_batch(
    conn: &Connection,
    terms: &[String],
    language: Language,
    limit: usize,
) -> Result<Vec<KnowledgeSegment>> {
    let (content_column, title_column) = text_columns(language);
    let conditions = (1..=terms.len())
        .map(|i| {
            format!(
                "({content_column} LIKE ?{i} ESCAPE '\\' OR {title_column} LIKE ?{i} ESCAPE '\\')"
            )
        })
        .collect::<Vec<_>>()
        .join(" OR ");

    let patterns: Vec<String> = terms
        .iter()
        .map(|t| format!("%{}%", escape_like(&t.to_lowercase())))
        .collect();

    let mut stmt = conn.prepare(&format!(
        "SELECT {SEGMENT_COLUMNS} FROM knowledge_segments
         WHERE {conditions}
         ORDER BY id
         LIMIT {limit}"
    ))?;

    let segments = stmt
        .query_map(params_from_iter(patterns.iter()), row_to_segment)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to run keyword search")?;

    Ok(segments)
}

/// 단일 세그먼트 INSERT (연결 또는 트랜잭션)
fn insert_with(conn: &Connection, segment: &NewSegment) -> Result<i64> {
    segment.validate()?;

    let metadata =
        serde_json::to_string(&segment.metadata).context("Failed to serialize metadata")?;

    conn.execute(
        "INSERT INTO knowledge_segments
            (source, source_id, page_route, title_zh, title_en,
             content_zh, content_en, embedding_zh, embedding_en, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            segment.source,
            segment.source_id,
            segment.page_route,
            segment.title_zh,
            segment.title_en,
            segment.content_zh,
            segment.content_en,
            segment.embedding_zh.as_deref().map(encode_embedding),
            segment.embedding_en.as_deref().map(encode_embedding),
            metadata,
        ],
    )
    .context("Failed to insert segment")?;

    Ok(conn.last_insert_rowid())
}

fn row_to_segment(row: &Row<'_>) -> rusqlite::Result<KnowledgeSegment> {
    let metadata: String = row.get(8)?;
    let metadata = serde_json::from_str(&metadata)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))?;

    Ok(KnowledgeSegment {
        id: row.get(0)?,
        source: row.get(1)?,
        source_id: row.get(2)?,
        page_route: row.get(3)?,
        title_zh: row.get(4)?,
        title_en: row.get(5)?,
        content_zh: row.get(6)?,
        content_en: row.get(7)?,
        metadata,
    })
}

/// LIKE 패턴 이스케이프 (`%`, `_`, `\`)
fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

// ============================================================================
// Tests
// ============================================================================
