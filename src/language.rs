//! 응답/검색 언어 (중국어, 영어)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 사이트가 지원하는 언어
///
/// 지식 세그먼트는 언어별로 본문/제목/임베딩을 따로 가지고 있어서
/// 검색과 프롬프트 구성 모두 이 값에 따라 컬럼을 고릅니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// 중국어 (기본값)
    #[default]
    Zh,
    /// 영어
    En,
}

impl Language {
    /// 언어 코드 ("zh" / "en")
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Zh => "zh",
            Language::En => "en",
        }
    }

    /// 클라이언트가 보낸 언어 코드 해석
    ///
    /// 알 수 없는 값이나 누락은 조용히 `Zh`로 처리합니다.
    pub fn from_code(code: Option<&str>) -> Self {
        code.and_then(|c| c.parse().ok()).unwrap_or_default()
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "zh" => Ok(Language::Zh),
            "en" => Ok(Language::En),
            other => anyhow::bail!("Unsupported language: {} (expected zh or en)", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_code_defaults_to_zh() {
        assert_eq!(Language::from_code(Some("en")), Language::En);
        assert_eq!(Language::from_code(Some("zh")), Language::Zh);
        assert_eq!(Language::from_code(Some("fr")), Language::Zh);
        assert_eq!(Language::from_code(Some("EN")), Language::Zh);
        assert_eq!(Language::from_code(None), Language::Zh);
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Language::En).unwrap(), "\"en\"");
        let lang: Language = serde_json::from_str("\"zh\"").unwrap();
        assert_eq!(lang, Language::Zh);
    }
}
