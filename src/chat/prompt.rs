//! 프롬프트 구성 및 사용자 노출 문구

use crate::knowledge::SearchResult;
use crate::language::Language;

/// 시스템 프롬프트의 지시문 (참고자료 블록 앞부분)
const INSTRUCTIONS_HEAD: &[&str] = &[
    "你是顺风压缩机官网的智能客服助手。",
    "",
    "严格规则：",
    "- 只能基于下方【参考资料】中的内容回答",
    "- 禁止使用你自身的知识进行补充、扩展或联想",
    "- 如果参考资料中没有相关信息，直接回复：\"抱歉，这个问题超出了我的服务范围，建议您联系我们：+86 025-52415588 或 nyxs@njysj.com\"",
    "- 不要编造任何产品参数、价格、交期等信息",
    "",
    "【页面导航标记 — 必须遵守】",
    "参考资料中每条都有\"页面\"字段。你必须在回答末尾为所有相关页面添加 NAV 标记。",
    "格式：[NAV:{\"route\":\"页面字段的值\",\"label_zh\":\"中文描述\",\"label_en\":\"English description\"}]",
    "示例：",
    "  [NAV:{\"route\":\"/projects\",\"label_zh\":\"查看工程案例\",\"label_en\":\"View Engineering Cases\"}]",
    "  [NAV:{\"route\":\"/products/marine/marine-air-cooled\",\"label_zh\":\"查看风冷型船用压缩机\",\"label_en\":\"View Air-Cooled Marine Compressor\"}]",
    "  [NAV:{\"route\":\"/certifications\",\"label_zh\":\"查看资质认证\",\"label_en\":\"View Certifications\"}]",
    "规则：",
    "- route 必须使用参考资料中\"页面\"字段的精确值，不能编造",
    "- 优先指向最精确的页面（如具体产品页而非产品列表页）",
    "- 可以有多个 NAV 标记",
    "- 即使回答中已经用文字提到了页面，仍然必须添加 NAV 标记",
    "",
];

/// 시스템 프롬프트 생성
///
/// # Arguments
/// * `language` - 사용자 언어 (답변 언어 지시)
/// * `context` - `build_context`로 만든 참고자료 블록
pub fn build_system_prompt(language: Language, context: &str) -> String {
    let mut lines: Vec<String> = INSTRUCTIONS_HEAD.iter().map(|s| s.to_string()).collect();
    lines.push(format!("用户当前语言：{}", language));
    lines.push("请用对应语言回答。使用 Markdown 格式（加粗、列表、分段等）让回答清晰易读。".to_string());
    lines.push(String::new());
    lines.push("【参考资料】".to_string());
    lines.push(context.to_string());
    lines.join("\n")
}

/// 검색 결과를 참고자료 블록으로 변환
///
/// 각 항목에는 출처, 페이지 경로, 양 언어 제목, 요청 언어 본문이 들어갑니다.
pub fn build_context(results: &[SearchResult], language: Language) -> String {
    results
        .iter()
        .map(|r| {
            let segment = &r.segment;
            format!(
                "---\n来源: {} | 页面: {}\n标题: {} / {}\n{}\n---",
                segment.source,
                segment.page_route.as_deref().unwrap_or("N/A"),
                segment.title_zh.as_deref().unwrap_or("N/A"),
                segment.title_en.as_deref().unwrap_or("N/A"),
                segment.content(language),
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// 관련 지식이 없을 때의 안내 문구
pub fn out_of_scope_message(language: Language) -> &'static str {
    match language {
        Language::Zh => {
            "抱歉，这个问题超出了我的服务范围，建议您联系我们：+86 025-52415588 或 nyxs@njysj.com"
        }
        Language::En => {
            "Sorry, this question is beyond my service scope. Please contact us: +86 025-52415588 or nyxs@njysj.com"
        }
    }
}

/// 상위 서비스 실패 시 문구
pub fn unavailable_message(language: Language) -> &'static str {
    match language {
        Language::Zh => "服务暂时不可用，请稍后重试。",
        Language::En => "Service temporarily unavailable. Please try again later.",
    }
}
