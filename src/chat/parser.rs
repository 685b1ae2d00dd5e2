//! NAV 마커 스트리밍 파서
//!
//! 모델 응답에 섞인 `[NAV:{"route":..,"label_zh":..,"label_en":..}]` 마커를
//! 텍스트에서 분리합니다. 청크 경계가 마커 중간에 걸려도 결과(텍스트 연결,
//! 네비게이션 순서)가 달라지지 않도록 완성될 수 있는 마커는 보류합니다.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use super::{ChatEvent, NavigationMarker};

/// 마커 시작 문자열
pub const NAV_PREFIX: &str = "[NAV:";

/// 보류 가능한 미완성 마커의 최대 길이 (bytes)
const MAX_PENDING_MARKER: usize = 1024;

fn nav_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\[NAV:\s*(\{[^}]+\})\s*\]").expect("static NAV pattern is valid")
    })
}

/// 마커 JSON (필드 누락/비문자열은 무효)
#[derive(Debug, Deserialize)]
struct RawMarker {
    route: Option<serde_json::Value>,
    label_zh: Option<serde_json::Value>,
    label_en: Option<serde_json::Value>,
}

impl RawMarker {
    fn into_marker(self) -> Option<NavigationMarker> {
        fn non_empty(value: Option<serde_json::Value>) -> Option<String> {
            match value {
                Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
                _ => None,
            }
        }

        Some(NavigationMarker {
            route: non_empty(self.route)?,
            label_zh: non_empty(self.label_zh)?,
            label_en: non_empty(self.label_en)?,
        })
    }
}

/// 완성된 텍스트에서 마커 추출
///
/// 마커 부분 문자열은 (유효 여부와 무관하게) 모두 제거되며,
/// 유효한 마커만 등장 순서대로 반환합니다.
pub fn parse_markers(text: &str) -> (String, Vec<NavigationMarker>) {
    let pattern = nav_pattern();
    let mut markers = Vec::new();

    for caps in pattern.captures_iter(text) {
        let Some(json) = caps.get(1) else { continue };
        match serde_json::from_str::<RawMarker>(json.as_str()) {
            Ok(raw) => match raw.into_marker() {
                Some(marker) => markers.push(marker),
                None => tracing::debug!("Dropping NAV marker with missing fields: {}", json.as_str()),
            },
            Err(e) => tracing::debug!("Dropping malformed NAV marker: {}", e),
        }
    }

    let cleaned = pattern.replace_all(text, "").into_owned();
    (cleaned, markers)
}

// ============================================================================
// Incremental Parser
// ============================================================================

/// `[NAV:` 이후 꼬리 부분의 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    /// 완성된 마커 (끝 위치, 버퍼 기준 byte offset)
    Complete(usize),
    /// 아직 완성될 수 있음
    Pending,
    /// 어떤 입력이 와도 마커가 될 수 없음
    Dead,
}

/// `start` 위치의 `[NAV:`가 마커 패턴과 어떻게 맞는지 판정
fn classify(buffer: &str, start: usize) -> Tail {
    let body = start + NAV_PREFIX.len();
    let mut chars = buffer[body..].char_indices().peekable();

    // \s*
    while chars.peek().is_some_and(|(_, c)| c.is_whitespace()) {
        chars.next();
    }
    // \{
    match chars.next() {
        None => return Tail::Pending,
        Some((_, '{')) => {}
        Some(_) => return Tail::Dead,
    }
    // [^}]+
    match chars.peek() {
        None => return Tail::Pending,
        Some((_, '}')) => return Tail::Dead,
        Some(_) => {}
    }
    loop {
        match chars.next() {
            None => return Tail::Pending,
            Some((_, '}')) => break,
            Some(_) => {}
        }
    }
    // \s*\]
    loop {
        match chars.next() {
            None => return Tail::Pending,
            Some((_, c)) if c.is_whitespace() => {}
            Some((i, ']')) => return Tail::Complete(body + i + 1),
            Some(_) => return Tail::Dead,
        }
    }
}

/// 버퍼에서 안전하게 내보낼 수 있는 끝 위치
fn hold_point(buffer: &str) -> usize {
    let mut pos = 0;

    while let Some(offset) = buffer[pos..].find(NAV_PREFIX) {
        let start = pos + offset;
        match classify(buffer, start) {
            Tail::Complete(end) => pos = end,
            Tail::Pending if buffer.len() - start <= MAX_PENDING_MARKER => return start,
            Tail::Pending | Tail::Dead => pos = start + NAV_PREFIX.len(),
        }
    }

    // 버퍼 끝의 `[`, `[N`, `[NA`, `[NAV`
    for len in (1..NAV_PREFIX.len()).rev() {
        if buffer.ends_with(&NAV_PREFIX[..len]) {
            return buffer.len() - len;
        }
    }

    buffer.len()
}

/// 청크 단위 NAV 마커 파서
///
/// `push`로 조각을 넣고 스트림이 끝나면 `finish`를 호출합니다.
/// 인식된(유효한) 마커 수와 마커가 제거된 전체 텍스트를 추적합니다.
#[derive(Debug, Default)]
pub struct NavMarkerParser {
    buffer: String,
    cleaned: String,
    marker_count: usize,
}

impl NavMarkerParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// 조각 추가, 내보낼 수 있는 이벤트 반환
    pub fn push(&mut self, chunk: &str) -> Vec<ChatEvent> {
        self.buffer.push_str(chunk);

        let hold = hold_point(&self.buffer);
        if hold == 0 {
            return Vec::new();
        }

        let tail = self.buffer.split_off(hold);
        let ready = std::mem::replace(&mut self.buffer, tail);
        self.flush(&ready)
    }

    /// 남은 버퍼를 모두 내보냄 (미완성 마커는 텍스트로)
    pub fn finish(&mut self) -> Vec<ChatEvent> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.is_empty() {
            return Vec::new();
        }
        self.flush(&rest)
    }

    /// 지금까지 인식된 유효 마커 수
    pub fn marker_count(&self) -> usize {
        self.marker_count
    }

    /// 세션에 저장할 최종 응답 (뒤쪽 공백 제거)
    pub fn into_response(self) -> String {
        self.cleaned.trim_end().to_string()
    }

    fn flush(&mut self, text: &str) -> Vec<ChatEvent> {
        let (cleaned, markers) = parse_markers(text);
        let mut events = Vec::with_capacity(markers.len() + 1);

        if !cleaned.is_empty() {
            self.cleaned.push_str(&cleaned);
            events.push(ChatEvent::Text { content: cleaned });
        }

        self.marker_count += markers.len();
        events.extend(markers.into_iter().map(ChatEvent::from));
        events
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "我们有**多项专利**。\n\n[NAV:{\"route\":\"/certifications\",\"label_zh\":\"查看资质认证\",\"label_en\":\"View Certifications\"}] 另见 [NAV: {\"route\":\"/projects\",\"label_zh\":\"查看工程案例\",\"label_en\":\"View Engineering Cases\"} ]";

    fn run(chunks: &[&str]) -> (String, Vec<ChatEvent>) {
        let mut parser = NavMarkerParser::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(parser.push(chunk));
        }
        events.extend(parser.finish());

        let text: String = events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::Text { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        let navs = events
            .into_iter()
            .filter(|e| matches!(e, ChatEvent::Navigation { .. }))
            .collect();
        (text, navs)
    }

    fn boundaries(text: &str) -> Vec<usize> {
        text.char_indices().map(|(i, _)| i).skip(1).collect()
    }

    #[test]
    fn test_parse_markers() {
        let (cleaned, markers) = parse_markers(SAMPLE);
        assert_eq!(cleaned, "我们有**多项专利**。\n\n 另见 ");
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].route, "/certifications");
        assert_eq!(markers[1].label_en, "View Engineering Cases");
    }

    #[test]
    fn test_invalid_markers_removed_but_not_counted() {
        let text = "a[NAV:{\"route\":\"/x\"}]b[NAV:{not json}]c[NAV:{\"route\":\"\",\"label_zh\":\"x\",\"label_en\":\"y\"}]d";
        let (cleaned, markers) = parse_markers(text);
        assert_eq!(cleaned, "abcd");
        assert!(markers.is_empty());
    }

    #[test]
    fn test_single_chunk() {
        let mut parser = NavMarkerParser::new();
        let events = parser.push("Hello [NAV:{\"route\":\"/about\",\"label_zh\":\"关于我们\",\"label_en\":\"About Us\"}]");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ChatEvent::text("Hello "));
        assert!(matches!(&events[1], ChatEvent::Navigation { route, .. } if route == "/about"));
        assert_eq!(parser.marker_count(), 1);
        assert!(parser.finish().is_empty());
        assert_eq!(parser.into_response(), "Hello");
    }

    #[test]
    fn test_holds_incomplete_marker() {
        let mut parser = NavMarkerParser::new();
        assert_eq!(parser.push("See [NAV:{\"route\""), vec![ChatEvent::text("See ")]);
        assert!(parser.push(":\"/projects\",\"label_zh\":\"案例\"").is_empty());

        let events = parser.push(",\"label_en\":\"Cases\"}] done");
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ChatEvent::Text { content } if content == " done"));
        assert!(matches!(&events[1], ChatEvent::Navigation { route, .. } if route == "/projects"));
    }

    #[test]
    fn test_holds_partial_prefix() {
        let mut parser = NavMarkerParser::new();
        assert_eq!(parser.push("abc [NA"), vec![ChatEvent::text("abc ")]);
        assert_eq!(parser.push("ME]"), vec![ChatEvent::text("[NAME]")]);

        assert_eq!(parser.push("x["), vec![ChatEvent::text("x")]);
        assert_eq!(parser.finish(), vec![ChatEvent::text("[")]);
    }

    #[test]
    fn test_dead_prefix_is_flushed() {
        let mut parser = NavMarkerParser::new();
        assert_eq!(parser.push("[NAV: nope] ok"), vec![ChatEvent::text("[NAV: nope] ok")]);
    }

    #[test]
    fn test_unterminated_marker_emitted_on_finish() {
        let mut parser = NavMarkerParser::new();
        assert!(parser.push("[NAV:{\"route\":\"/x\"").is_empty());
        assert_eq!(parser.finish(), vec![ChatEvent::text("[NAV:{\"route\":\"/x\"")]);
        assert_eq!(parser.marker_count(), 0);
    }

    #[test]
    fn test_bracket_inside_json_does_not_split_marker() {
        let text = "x[NAV:{\"route\":\"/a\",\"label_zh\":\"[甲]\",\"label_en\":\"[A]\"}]y";
        let (expected_text, expected_navs) = run(&[text]);
        assert_eq!(expected_text, "xy");
        assert_eq!(expected_navs.len(), 1);

        for split in boundaries(text) {
            let (a, b) = text.split_at(split);
            assert_eq!(run(&[a, b]), (expected_text.clone(), expected_navs.clone()), "split at {}", split);
        }
    }

    #[test]
    fn test_chunk_boundary_invariance() {
        let (expected_text, expected_navs) = run(&[SAMPLE]);
        assert_eq!(expected_navs.len(), 2);

        // 모든 두 조각 분할
        for split in boundaries(SAMPLE) {
            let (a, b) = SAMPLE.split_at(split);
            assert_eq!(run(&[a, b]), (expected_text.clone(), expected_navs.clone()), "split at {}", split);
        }

        // 한 글자씩
        let singles: Vec<String> = SAMPLE.chars().map(String::from).collect();
        let refs: Vec<&str> = singles.iter().map(String::as_str).collect();
        assert_eq!(run(&refs), (expected_text, expected_navs));
    }

    #[test]
    fn test_text_events_never_contain_markers() {
        let singles: Vec<String> = SAMPLE.chars().map(String::from).collect();
        let mut parser = NavMarkerParser::new();
        let mut events = Vec::new();
        for chunk in &singles {
            events.extend(parser.push(chunk));
        }
        events.extend(parser.finish());

        for event in &events {
            if let ChatEvent::Text { content } = event {
                assert!(!nav_pattern().is_match(content), "marker leaked: {}", content);
            }
        }
        assert_eq!(parser.marker_count(), 2);
        assert_eq!(parser.into_response(), "我们有**多项专利**。\n\n 另见");
    }

    #[test]
    fn test_oversized_pending_marker_released() {
        let mut parser = NavMarkerParser::new();
        let long = format!("[NAV:{{{}", "x".repeat(MAX_PENDING_MARKER + 10));
        let events = parser.push(&long);
        assert_eq!(events, vec![ChatEvent::text(long)]);
    }
}
