//! 대체 네비게이션
//!
//! 모델이 NAV 마커를 하나도 내지 않았을 때 검색 결과의 페이지 경로로
//! 네비게이션 카드를 만듭니다.

use std::collections::HashSet;

use crate::knowledge::SearchResult;

use super::NavigationMarker;

/// 대체 네비게이션 최대 개수
pub const MAX_FALLBACK_ROUTES: usize = 2;

/// 주요 페이지 경로의 정해진 라벨 (route, 중국어, 영어)
const ROUTE_LABELS: &[(&str, &str, &str)] = &[
    ("/products", "查看全部产品", "View All Products"),
    ("/products/marine", "查看船用压缩机", "View Marine Compressors"),
    ("/products/industrial", "查看工艺压缩机", "View Industrial Compressors"),
    ("/products/parts", "查看压力容器及配件", "View Vessels & Parts"),
    ("/projects", "查看工程案例", "View Engineering Cases"),
    ("/certifications", "查看资质认证", "View Certifications"),
    ("/about", "关于我们", "About Us"),
    ("/contact", "联系我们", "Contact Us"),
    ("/service", "服务与支持", "Service & Support"),
];

/// 경로의 정해진 라벨 조회
pub fn route_labels(route: &str) -> Option<(&'static str, &'static str)> {
    ROUTE_LABELS
        .iter()
        .find(|(r, _, _)| *r == route)
        .map(|(_, zh, en)| (*zh, *en))
}

/// 검색 결과 순서대로 대체 네비게이션 생성
///
/// 경로가 없거나 `/`이거나 중복이면 건너뛰고, 최대 2개까지 만듭니다.
/// 라벨은 정해진 표 → 세그먼트 제목 → `查看详情` / `View Details` 순입니다.
pub fn fallback_navigation(results: &[SearchResult]) -> Vec<NavigationMarker> {
    let mut seen = HashSet::new();
    let mut markers = Vec::new();

    for result in results {
        let segment = &result.segment;
        let Some(route) = segment.page_route.as_deref() else {
            continue;
        };
        if route.is_empty() || route == "/" || !seen.insert(route) {
            continue;
        }

        let (label_zh, label_en) = match route_labels(route) {
            Some((zh, en)) => (zh.to_string(), en.to_string()),
            None => (
                segment.title_zh.clone().unwrap_or_else(|| "查看详情".to_string()),
                segment.title_en.clone().unwrap_or_else(|| "View Details".to_string()),
            ),
        };

        markers.push(NavigationMarker {
            route: route.to_string(),
            label_zh,
            label_en,
        });

        if markers.len() >= MAX_FALLBACK_ROUTES {
            break;
        }
    }

    markers
}
