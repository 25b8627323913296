//! `schema.table` 이름 필터
//!
//! 콤마로 구분한 정규식 목록을 대소문자 구분 없이 전체 일치로 비교합니다.
//! 예: `shop\..*,test\.orders`

use crate::error::{CdcError, Result};
use regex::Regex;

#[derive(Debug, Clone, Default)]
pub struct NameFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl NameFilter {
    /// 화이트리스트와 블랙리스트로 필터 생성. 빈 화이트리스트는 전체 허용
    pub fn new(include: &str, exclude: &str) -> Result<Self> {
        Ok(NameFilter {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// 화이트리스트만 사용하는 필터
    pub fn include(include: &str) -> Result<Self> {
        Self::new(include, "")
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// 블랙리스트가 우선
    pub fn matches(&self, schema: &str, table: &str) -> bool {
        let name = format!("{}.{}", schema, table);
        if self.exclude.iter().any(|p| p.is_match(&name)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| p.is_match(&name))
    }
}

fn compile(patterns: &str) -> Result<Vec<Regex>> {
    patterns
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            Regex::new(&format!("(?i)^(?:{})$", p))
                .map_err(|e| CdcError::Config(format!("invalid filter pattern '{}': {}", p, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_accepts_all() {
        let filter = NameFilter::default();
        assert!(filter.is_empty());
        assert!(filter.matches("any", "table"));
    }

    #[test]
    fn test_include_and_exclude() {
        let filter = NameFilter::new(r"shop\..*, test\.orders", r"shop\.audit_.*").unwrap();
        assert!(filter.matches("shop", "orders"));
        assert!(filter.matches("SHOP", "Items"));
        assert!(filter.matches("test", "orders"));
        assert!(!filter.matches("test", "orders_old"));
        assert!(!filter.matches("shop", "audit_log"));
        assert!(!filter.matches("other", "orders"));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(matches!(NameFilter::include("shop\\.("), Err(CdcError::Config(_))));
    }
}
