//! 키워드 추출 및 도메인 질의 확장
//!
//! 사용자의 표현("有什么案例")과 저장된 콘텐츠의 표현("工程案例")은
//! 작은 도메인 어휘 안에서도 어휘적으로 자주 어긋납니다.
//! 키워드 단계는 여기서 만든 용어 집합으로 부분 문자열 매칭을 수행합니다.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::language::Language;

// ============================================================================
// Language Detection
// ============================================================================

/// CJK 통합 한자 범위 (U+4E00 ~ U+9FFF)
fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

/// 한자가 하나라도 있으면 중국어, 아니면 영어
pub fn detect_language(text: &str) -> Language {
    if text.chars().any(is_cjk) {
        Language::Zh
    } else {
        Language::En
    }
}

// ============================================================================
// Keyword Extraction
// ============================================================================

/// 삽입 순서를 유지하는 중복 없는 용어 목록
#[derive(Debug, Default)]
struct TermSet {
    terms: Vec<String>,
    seen: HashSet<String>,
}

impl TermSet {
    fn insert(&mut self, term: &str) {
        if self.seen.insert(term.to_string()) {
            self.terms.push(term.to_string());
        }
    }

    fn into_vec(self) -> Vec<String> {
        self.terms
    }
}

/// 질의에서 키워드 추출
///
/// - 영어: 공백/쉼표/세미콜론으로 분리, 1글자 토큰 제외
/// - 중국어: 연속된 한자 구간 전체(2글자 이상) + 구간 내 모든 2-gram,
///   그리고 섞여 있는 영문/숫자 토큰(2글자 이상)
pub fn extract_keywords(text: &str, language: Language) -> Vec<String> {
    let mut keywords = TermSet::default();

    match language {
        Language::En => {
            for token in text.split(|c: char| c.is_whitespace() || c == ',' || c == ';') {
                let token = token.trim();
                if token.chars().count() > 1 {
                    keywords.insert(token);
                }
            }
        }
        Language::Zh => {
            for run in char_runs(text, is_cjk) {
                if run.len() >= 2 {
                    keywords.insert(&run.iter().collect::<String>());
                }
                for pair in run.windows(2) {
                    keywords.insert(&pair.iter().collect::<String>());
                }
            }

            // "ISO 9001", "CCS" 같은 영문 용어
            for run in char_runs(text, |c| c.is_ascii_alphanumeric()) {
                if run.len() > 1 {
                    keywords.insert(&run.iter().collect::<String>());
                }
            }
        }
    }

    keywords.into_vec()
}

/// 조건을 만족하는 최대 연속 문자 구간
fn char_runs(text: &str, predicate: impl Fn(char) -> bool) -> Vec<Vec<char>> {
    let mut runs = Vec::new();
    let mut current = Vec::new();

    for c in text.chars() {
        if predicate(c) {
            current.push(c);
        } else if !current.is_empty() {
            runs.push(std::mem::take(&mut current));
        }
    }

    if !current.is_empty() {
        runs.push(current);
    }

    runs
}

// ============================================================================
// Domain Query Expansion
// ============================================================================

/// 도메인 확장 규칙
///
/// `pattern`이 질의에 매칭되면 언어별 용어를 키워드에 추가합니다.
#[derive(Debug)]
pub struct DomainRule {
    /// 규칙 이름 (로그/디버그용)
    pub name: &'static str,
    pub pattern: &'static str,
    pub expand_zh: &'static [&'static str],
    pub expand_en: &'static [&'static str],
}

impl DomainRule {
    fn terms(&self, language: Language) -> &'static [&'static str] {
        match language {
            Language::Zh => self.expand_zh,
            Language::En => self.expand_en,
        }
    }
}

/// 도메인 규칙 테이블
pub const DOMAIN_RULES: &[DomainRule] = &[
    DomainRule {
        name: "projects",
        pattern: "案例|项目|工程|成功",
        expand_zh: &["工程案例", "案例", "项目"],
        expand_en: &["engineering case", "project"],
    },
    DomainRule {
        name: "products",
        pattern: "产品|型号|系列",
        expand_zh: &["产品", "压缩机", "型号"],
        expand_en: &["product", "compressor", "model"],
    },
    DomainRule {
        name: "marine",
        pattern: "(?i)船用|船舶|marine|ship",
        expand_zh: &["船用压缩机", "船舶"],
        expand_en: &["marine compressor", "ship"],
    },
    DomainRule {
        name: "industrial",
        pattern: "(?i)工艺|工业|industrial|process",
        expand_zh: &["工艺压缩机", "工业"],
        expand_en: &["process compressor", "industrial"],
    },
    DomainRule {
        name: "certifications",
        pattern: "(?i)资质|认证|证书|船级社|certif|classification",
        expand_zh: &["资质认证", "船级社", "认证"],
        expand_en: &["certification", "classification society"],
    },
    DomainRule {
        name: "patents",
        pattern: "(?i)专利|patent",
        expand_zh: &["专利技术", "发明专利", "实用新型"],
        expand_en: &["patent", "invention patent"],
    },
    DomainRule {
        name: "quality",
        pattern: "质量|ISO|管理体系",
        expand_zh: &["质量管理体系", "ISO"],
        expand_en: &["quality management", "ISO"],
    },
    DomainRule {
        name: "contact",
        pattern: "(?i)联系|电话|地址|邮箱|contact",
        expand_zh: &["联系我们", "电话", "地址"],
        expand_en: &["contact", "phone", "address"],
    },
    DomainRule {
        name: "about",
        pattern: "(?i)关于|公司|简介|历史|about",
        expand_zh: &["关于我们", "公司简介"],
        expand_en: &["about us", "company"],
    },
    DomainRule {
        name: "service",
        pattern: "(?i)服务|售后|维修|保养|service|support",
        expand_zh: &["服务与支持", "售后服务"],
        expand_en: &["service", "support", "maintenance"],
    },
    DomainRule {
        name: "parts",
        pattern: "(?i)配件|零件|容器|储气罐|parts|accessori",
        expand_zh: &["配件", "压力容器", "储气罐"],
        expand_en: &["parts", "accessories", "pressure vessel"],
    },
];

/// 컴파일된 규칙 (최초 사용 시 한 번)
fn compiled_rules() -> &'static [(Regex, &'static DomainRule)] {
    static RULES: OnceLock<Vec<(Regex, &'static DomainRule)>> = OnceLock::new();
    RULES.get_or_init(|| {
        DOMAIN_RULES
            .iter()
            .map(|rule| {
                let regex = Regex::new(rule.pattern)
                    .unwrap_or_else(|e| panic!("invalid domain rule '{}': {}", rule.name, e));
                (regex, rule)
            })
            .collect()
    })
}

/// 도메인 규칙으로 질의 확장
///
/// 매칭된 모든 규칙의 용어 합집합을 반환하고, 매칭이 없으면 빈 목록입니다.
pub fn expand_query_keywords(text: &str, language: Language) -> Vec<String> {
    let mut expanded = TermSet::default();

    for (regex, rule) in compiled_rules() {
        if regex.is_match(text) {
            tracing::trace!("Domain rule '{}' matched", rule.name);
            for term in rule.terms(language) {
                expanded.insert(term);
            }
        }
    }

    expanded.into_vec()
}

/// 키워드 단계에 쓰이는 최종 용어 집합 (추출 ∪ 확장)
pub fn search_terms(text: &str, language: Language) -> Vec<String> {
    let mut terms = TermSet::default();
    for term in extract_keywords(text, language)
        .iter()
        .chain(expand_query_keywords(text, language).iter())
    {
        terms.insert(term);
    }
    terms.into_vec()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn contains(list: &[String], term: &str) -> bool {
        list.iter().any(|t| t == term)
    }

    #[test]
    fn test_detect_language() {
        assert_eq!(detect_language("你好世界"), Language::Zh);
        assert_eq!(detect_language("船用空气压缩机"), Language::Zh);
        assert_eq!(detect_language("What products do you have?"), Language::En);
        assert_eq!(detect_language("ISO 9001质量管理"), Language::Zh);
        assert_eq!(detect_language("CCS船级社认证"), Language::Zh);
        assert_eq!(detect_language("ISO 9001"), Language::En);
        assert_eq!(detect_language(""), Language::En);
    }

    #[test]
    fn test_extract_english_keywords() {
        let result = extract_keywords("marine compressor products", Language::En);
        assert_eq!(result, vec!["marine", "compressor", "products"]);

        let result = extract_keywords("a big compressor", Language::En);
        assert!(!contains(&result, "a"));
        assert!(contains(&result, "big"));

        let result = extract_keywords("ISO,CCS;  DNV , x", Language::En);
        assert_eq!(result, vec!["ISO", "CCS", "DNV"]);
    }

    #[test]
    fn test_extract_chinese_runs_and_bigrams() {
        let result = extract_keywords("你有什么案例", Language::Zh);
        assert!(contains(&result, "你有什么案例"));
        assert!(contains(&result, "案例"));
        assert!(contains(&result, "什么"));
        // 전체 구간 + 5개 2-gram
        assert_eq!(result.len(), 6);

        let result = extract_keywords("船用压缩机有哪些型号", Language::Zh);
        assert!(contains(&result, "压缩"));
        assert!(contains(&result, "船用"));
        assert!(contains(&result, "型号"));
    }

    #[test]
    fn test_extract_latin_terms_from_chinese() {
        let result = extract_keywords("CCS船级社认证", Language::Zh);
        assert!(contains(&result, "CCS"));
        assert!(contains(&result, "船级"));

        let result = extract_keywords("ISO 9001 质量", Language::Zh);
        assert!(contains(&result, "ISO"));
        assert!(contains(&result, "9001"));
    }

    #[test]
    fn test_extract_single_char_run() {
        // 1글자 구간은 전체도 2-gram도 만들지 않음
        let result = extract_keywords("船 A", Language::Zh);
        assert!(result.is_empty());
    }

    #[test]
    fn test_extract_empty_and_dedup() {
        assert!(extract_keywords("", Language::Zh).is_empty());
        assert!(extract_keywords("", Language::En).is_empty());

        let result = extract_keywords("压缩压缩机", Language::Zh);
        assert_eq!(result.iter().filter(|k| k.as_str() == "压缩").count(), 1);
    }

    #[test]
    fn test_expand_projects_and_products() {
        let result = expand_query_keywords("你有什么案例", Language::Zh);
        assert!(contains(&result, "工程案例"));
        assert!(contains(&result, "案例"));
        assert!(contains(&result, "项目"));

        let result = expand_query_keywords("有哪些产品", Language::Zh);
        assert!(contains(&result, "产品"));
        assert!(contains(&result, "压缩机"));
        assert!(contains(&result, "型号"));
    }

    #[test]
    fn test_expand_patents() {
        let result = expand_query_keywords("你们有多少专利", Language::Zh);
        assert!(contains(&result, "专利技术"));
        assert!(contains(&result, "发明专利"));
    }

    #[test]
    fn test_expand_english_case_insensitive() {
        let result = expand_query_keywords("What CERTIFICATIONS do you have?", Language::En);
        assert!(contains(&result, "certification"));
        assert!(contains(&result, "classification society"));

        let result = expand_query_keywords("Marine Compressor", Language::En);
        assert!(contains(&result, "marine compressor"));
        assert!(contains(&result, "ship"));
    }

    #[test]
    fn test_expand_quality_is_case_sensitive() {
        assert!(contains(&expand_query_keywords("ISO 9001", Language::Zh), "质量管理体系"));
        assert!(expand_query_keywords("iso", Language::Zh).is_empty());
    }

    #[test]
    fn test_expand_multiple_rules() {
        let result = expand_query_keywords("船用产品认证", Language::Zh);
        assert!(contains(&result, "船用压缩机"));
        assert!(contains(&result, "产品"));
        assert!(contains(&result, "资质认证"));
    }

    #[test]
    fn test_expand_no_match() {
        assert!(expand_query_keywords("今天天气怎么样", Language::Zh).is_empty());
    }

    #[test]
    fn test_search_terms_union_dedup() {
        // "案例"는 추출과 확장 양쪽에서 나오지만 한 번만
        let terms = search_terms("你有什么案例", Language::Zh);
        assert_eq!(terms.iter().filter(|t| t.as_str() == "案例").count(), 1);
        assert!(contains(&terms, "工程案例"));
        assert!(contains(&terms, "你有什么案例"));
    }

    #[test]
    fn test_all_rules_compile() {
        assert_eq!(compiled_rules().len(), DOMAIN_RULES.len());
    }
}
