//! 세션 저장소 - 세션 ID별 대화 이력
//!
//! 프로세스 메모리에만 보관하며, 일정 시간 활동이 없는 세션은
//! 백그라운드 정리 작업이 삭제합니다.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::ChatMessage;

// ============================================================================
// Clock
// ============================================================================

/// 현재 시각 공급자 (테스트에서 시간 조작용)
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// 시스템 시계
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 수동 시계 - `advance`로만 시간이 흐릅니다
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += delta;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Types
// ============================================================================

/// 세션 설정
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 보관할 최대 대화 왕복 수 (메시지는 2배)
    pub max_history_rounds: usize,
    /// 유휴 만료 시간
    pub ttl: Duration,
    /// 정리 주기
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_history_rounds: 10,
            ttl: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl SessionConfig {
    /// 보관할 최대 메시지 수
    pub fn max_messages(&self) -> usize {
        self.max_history_rounds * 2
    }
}

/// 대화 세션 (user/assistant 메시지만 보관, system 제외)
#[derive(Debug, Clone)]
pub struct Session {
    pub messages: Vec<ChatMessage>,
    pub last_activity: DateTime<Utc>,
}

struct Inner {
    sessions: Mutex<HashMap<String, Session>>,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 만료 세션 삭제, 삭제 수 반환
    fn sweep(&self) -> usize {
        let now = self.clock.now();
        let ttl = self.config.ttl;
        let mut sessions = self.lock();
        let before = sessions.len();

        sessions.retain(|_, session| {
            match now.signed_duration_since(session.last_activity).to_std() {
                Ok(idle) => idle <= ttl,
                // 시계가 뒤로 간 경우
                Err(_) => true,
            }
        });

        before - sessions.len()
    }
}

// ============================================================================
// SessionStore
// ============================================================================

/// 세션 저장소
///
/// 잠금은 `.await` 너머로 유지되지 않습니다. 같은 세션의 동시 턴은
/// 직렬화하지 않으며 마지막 기록이 남습니다.
pub struct SessionStore {
    inner: Arc<Inner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionStore {
    /// 새 세션 저장소 생성 (정리 작업은 `start`로 시작)
    pub fn new(config: SessionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                config,
                clock,
            }),
            sweeper: Mutex::new(None),
        }
    }

    /// 기본 설정 + 시스템 시계
    pub fn with_defaults() -> Self {
        Self::new(SessionConfig::default(), Arc::new(SystemClock))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// 세션 스냅샷 (없으면 생성, 활동 시각 갱신)
    pub fn get(&self, id: &str) -> Session {
        let now = self.inner.clock.now();
        let mut sessions = self.inner.lock();
        let session = touch(&mut sessions, id, now);
        session.clone()
    }

    /// 최근 이력 (최대 `2 * max_history_rounds`개)
    pub fn history(&self, id: &str) -> Vec<ChatMessage> {
        let now = self.inner.clock.now();
        let cap = self.inner.config.max_messages();
        let mut sessions = self.inner.lock();
        let session = touch(&mut sessions, id, now);

        let skip = session.messages.len().saturating_sub(cap);
        session.messages[skip..].to_vec()
    }

    /// 최근 이력 읽기 (세션을 만들거나 활동 시각을 바꾸지 않음)
    pub fn peek_history(&self, id: &str) -> Vec<ChatMessage> {
        let cap = self.inner.config.max_messages();
        let sessions = self.inner.lock();
        match sessions.get(id) {
            Some(session) => {
                let skip = session.messages.len().saturating_sub(cap);
                session.messages[skip..].to_vec()
            }
            None => Vec::new(),
        }
    }

    /// 한 턴 기록 (user + assistant), 상한을 넘는 오래된 메시지는 버림
    pub fn record_turn(&self, id: &str, user: &str, assistant: &str) {
        let now = self.inner.clock.now();
        let cap = self.inner.config.max_messages();
        let mut sessions = self.inner.lock();
        let session = touch(&mut sessions, id, now);

        session.messages.push(ChatMessage::user(user));
        session.messages.push(ChatMessage::assistant(assistant));

        let excess = session.messages.len().saturating_sub(cap);
        if excess > 0 {
            session.messages.drain(..excess);
        }
    }

    /// 세션 삭제 (없으면 아무 일도 하지 않음)
    pub fn clear(&self, id: &str) {
        if self.inner.lock().remove(id).is_some() {
            tracing::debug!("Cleared session {}", id);
        }
    }

    /// 만료 세션 정리
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 백그라운드 정리 작업 시작 (이미 실행 중이면 무시)
    ///
    /// tokio 런타임 안에서 호출해야 합니다. 작업은 저장소를 약한 참조로만
    /// 잡고 있어 저장소가 사라지면 스스로 종료됩니다.
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::warn!("Session sweeper not started: {}", e);
                return;
            }
        };

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval;
        *sweeper = Some(runtime.spawn(sweep_loop(weak, period)));
        tracing::debug!("Session sweeper started (every {:?})", period);
    }

    /// 정리 작업 중지
    pub fn stop(&self) {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            tracing::debug!("Session sweeper stopped");
        }
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn touch<'a>(
    sessions: &'a mut HashMap<String, Session>,
    id: &str,
    now: DateTime<Utc>,
) -> &'a mut Session {
    let session = sessions.entry(id.to_string()).or_insert_with(|| Session {
        messages: Vec::new(),
        last_activity: now,
    });
    session.last_activity = now;
    session
}

async fn sweep_loop(store: Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // 첫 tick은 즉시 완료됨
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = store.upgrade() else { break };
        let removed = inner.sweep();
        if removed > 0 {
            tracing::info!("Swept {} expired sessions", removed);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
