//! 테이블 메타데이터 협력자 및 DDL 문 해석
//!
//! TABLE_MAP 이벤트에는 컬럼 이름, 부호, charset이 없을 수 있으므로
//! 외부 협력자([`TableMetaSource`])에서 보강합니다. DDL이 지나가면 해당 항목을 무효화합니다.

use crate::entry::EventKind;
use crate::error::Result;
use crate::rows::ColumnDef;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::debug;

/// 컬럼 메타데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    /// INFORMATION_SCHEMA.COLUMNS.COLUMN_TYPE (e.g., "int(10) unsigned")
    pub column_type: String,
    pub charset: Option<String>,
    pub nullable: bool,
    pub is_key: bool,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        ColumnMeta {
            name: name.into(),
            column_type: column_type.into(),
            charset: None,
            nullable: true,
            is_key: false,
        }
    }

    pub fn unsigned(&self) -> bool {
        self.column_type.to_ascii_lowercase().contains("unsigned")
    }

    /// BINARY/VARBINARY/BLOB 계열은 charset이 없어도 binary
    pub fn effective_charset(&self) -> Option<String> {
        if let Some(charset) = &self.charset {
            return Some(charset.clone());
        }
        let lower = self.column_type.to_ascii_lowercase();
        if lower.starts_with("binary")
            || lower.starts_with("varbinary")
            || lower.ends_with("blob")
        {
            Some("binary".to_string())
        } else {
            None
        }
    }
}

/// 테이블 메타데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnMeta>,
}

impl TableMeta {
    /// TABLE_MAP 컬럼 정의에 이름/부호/charset/키 정보를 덮어씀.
    /// 컬럼 수가 다르면 (스키마 변경 이후 stale) false
    pub fn apply_to(&self, columns: &mut [ColumnDef]) -> bool {
        if self.columns.len() != columns.len() {
            return false;
        }
        for (def, meta) in columns.iter_mut().zip(&self.columns) {
            def.name = Some(meta.name.clone());
            def.unsigned = meta.unsigned();
            def.nullable = meta.nullable;
            def.is_key = meta.is_key;
            if let Some(charset) = meta.effective_charset() {
                def.charset = Some(charset);
            }
        }
        true
    }
}

/// 테이블 메타데이터 협력자
#[async_trait]
pub trait TableMetaSource: Send + Sync {
    async fn find(&self, schema: &str, table: &str) -> Result<Option<TableMeta>>;

    /// `table`이 None이면 스키마 전체 무효화
    fn invalidate(&self, schema: &str, table: Option<&str>);
}

/// 메모리 메타데이터 협력자 (테스트 및 파일 재생용)
#[derive(Debug, Default)]
pub struct MemoryTableMetaSource {
    tables: RwLock<HashMap<(String, String), TableMeta>>,
    invalidations: Mutex<Vec<(String, Option<String>)>>,
}

impl MemoryTableMetaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, meta: TableMeta) {
        self.tables
            .write()
            .insert((meta.schema.clone(), meta.table.clone()), meta);
    }

    pub fn remove(&self, schema: &str, table: &str) {
        self.tables
            .write()
            .remove(&(schema.to_string(), table.to_string()));
    }

    /// 지금까지 받은 무효화 요청
    pub fn invalidations(&self) -> Vec<(String, Option<String>)> {
        self.invalidations.lock().clone()
    }
}

#[async_trait]
impl TableMetaSource for MemoryTableMetaSource {
    async fn find(&self, schema: &str, table: &str) -> Result<Option<TableMeta>> {
        Ok(self
            .tables
            .read()
            .get(&(schema.to_string(), table.to_string()))
            .cloned())
    }

    fn invalidate(&self, schema: &str, table: Option<&str>) {
        // 메모리 소스는 원본이므로 요청만 기록
        self.invalidations
            .lock()
            .push((schema.to_string(), table.map(str::to_string)));
    }
}

/// DDL 대상 테이블명
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableName {
    pub schema: Option<String>,
    pub table: String,
}

/// 해석된 DDL 문
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DdlStatement {
    pub kind: EventKind,
    /// CREATE/DROP DATABASE의 대상 스키마
    pub schema: Option<String>,
    /// 영향받는 테이블들 (RENAME은 원본, 대상 순서)
    pub tables: Vec<TableName>,
}

impl DdlStatement {
    /// 기본 스키마를 채운 (schema, table) 목록
    pub fn qualified_tables(&self, default_schema: &str) -> Vec<(String, String)> {
        self.tables
            .iter()
            .map(|t| {
                (
                    t.schema.clone().unwrap_or_else(|| default_schema.to_string()),
                    t.table.clone(),
                )
            })
            .collect()
    }

    /// 엔트리 헤더에 쓸 첫 대상 (schema, table)
    pub fn primary_target(&self, default_schema: &str) -> (String, String) {
        match self.qualified_tables(default_schema).into_iter().next() {
            Some(target) => target,
            None => (
                self.schema
                    .clone()
                    .unwrap_or_else(|| default_schema.to_string()),
                String::new(),
            ),
        }
    }
}

const NAME: &str = r"(?:`[^`]+`|[\w$]+)";

struct DdlPatterns {
    create_table: Regex,
    alter_table: Regex,
    drop_table: Regex,
    rename_table: Regex,
    truncate_table: Regex,
    create_index: Regex,
    drop_index: Regex,
    create_schema: Regex,
    drop_schema: Regex,
    leading_comment: Regex,
}

fn patterns() -> &'static DdlPatterns {
    static PATTERNS: OnceLock<DdlPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let qualified = format!(r"({n}(?:\s*\.\s*{n})?)", n = NAME);
        let list = format!(r"({n}(?:\s*\.\s*{n})?(?:\s*,\s*{n}(?:\s*\.\s*{n})?)*)", n = NAME);
        let build = |pattern: String| {
            Regex::new(&format!("(?is)^{}", pattern)).expect("static DDL pattern")
        };
        DdlPatterns {
            create_table: build(format!(
                r"create\s+(?:temporary\s+)?table\s+(?:if\s+not\s+exists\s+)?{}",
                qualified
            )),
            alter_table: build(format!(
                r"alter\s+(?:online\s+|offline\s+|ignore\s+)*table\s+{}",
                qualified
            )),
            drop_table: build(format!(
                r"drop\s+(?:temporary\s+)?tables?\s+(?:if\s+exists\s+)?{}",
                list
            )),
            rename_table: build(r"rename\s+tables?\s+(.+)$".to_string()),
            truncate_table: build(format!(r"truncate\s+(?:table\s+)?{}", qualified)),
            create_index: build(format!(
                r"create\s+(?:online\s+|offline\s+)?(?:unique\s+|fulltext\s+|spatial\s+)?index\s+{}\s+(?:using\s+\w+\s+)?on\s+{}",
                NAME, qualified
            )),
            drop_index: build(format!(
                r"drop\s+(?:online\s+|offline\s+)?index\s+{}\s+on\s+{}",
                NAME, qualified
            )),
            create_schema: build(format!(
                r"create\s+(?:database|schema)\s+(?:if\s+not\s+exists\s+)?({})",
                NAME
            )),
            drop_schema: build(format!(
                r"drop\s+(?:database|schema)\s+(?:if\s+exists\s+)?({})",
                NAME
            )),
            leading_comment: build(r"\s*(?:/\*.*?\*/\s*|(?:--|#)[^\n]*\n\s*)*".to_string()),
        }
    })
}

fn unquote(name: &str) -> String {
    name.trim().trim_matches('`').to_string()
}

/// "`db`.`tbl`" -> (Some(db), tbl)
fn split_qualified(token: &str) -> TableName {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in token.chars() {
        match c {
            '`' => quoted = !quoted,
            '.' if !quoted => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);

    let table = unquote(parts.pop().as_deref().unwrap_or_default());
    let schema = parts.pop().map(|s| unquote(&s));
    TableName { schema, table }
}

/// 쉼표로 구분된 테이블 목록 (백틱 안의 쉼표는 무시)
fn split_list(list: &str) -> Vec<TableName> {
    let mut names = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in list.chars() {
        match c {
            '`' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => names.push(split_qualified(std::mem::take(&mut current).trim())),
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        names.push(split_qualified(current.trim()));
    }
    names
}

/// DDL 문이면 종류와 대상 테이블을 돌려줌. DDL이 아니면 None
pub fn parse_ddl(sql: &str) -> Option<DdlStatement> {
    let p = patterns();
    let body = match p.leading_comment.find(sql) {
        Some(m) => &sql[m.end()..],
        None => sql,
    };

    let single = |kind: EventKind, caps: regex::Captures<'_>, group: usize| {
        caps.get(group).map(|m| DdlStatement {
            kind,
            schema: None,
            tables: vec![split_qualified(m.as_str())],
        })
    };

    let statement = if let Some(caps) = p.create_index.captures(body) {
        single(EventKind::CreateIndex, caps, 1)
    } else if let Some(caps) = p.drop_index.captures(body) {
        single(EventKind::DropIndex, caps, 1)
    } else if let Some(caps) = p.create_table.captures(body) {
        single(EventKind::Create, caps, 1)
    } else if let Some(caps) = p.alter_table.captures(body) {
        single(EventKind::Alter, caps, 1)
    } else if let Some(caps) = p.truncate_table.captures(body) {
        single(EventKind::Truncate, caps, 1)
    } else if let Some(caps) = p.drop_table.captures(body) {
        caps.get(1).map(|m| DdlStatement {
            kind: EventKind::Drop,
            schema: None,
            tables: split_list(m.as_str()),
        })
    } else if let Some(caps) = p.rename_table.captures(body) {
        caps.get(1).map(|m| DdlStatement {
            kind: EventKind::Rename,
            schema: None,
            tables: parse_rename_pairs(m.as_str()),
        })
    } else if let Some(caps) = p.create_schema.captures(body) {
        caps.get(1).map(|m| DdlStatement {
            kind: EventKind::Create,
            schema: Some(unquote(m.as_str())),
            tables: Vec::new(),
        })
    } else if let Some(caps) = p.drop_schema.captures(body) {
        caps.get(1).map(|m| DdlStatement {
            kind: EventKind::Drop,
            schema: Some(unquote(m.as_str())),
            tables: Vec::new(),
        })
    } else {
        None
    };

    if let Some(ddl) = &statement {
        debug!("Parsed DDL {:?} targeting {:?}", ddl.kind, ddl.tables);
    }
    statement
}

/// "a TO b, c TO d" -> [a, b, c, d]
fn parse_rename_pairs(text: &str) -> Vec<TableName> {
    static TO: OnceLock<Regex> = OnceLock::new();
    let to = TO.get_or_init(|| {
        Regex::new(r"(?i)\s+to\s+").expect("static rename pattern")
    });

    split_pairs(text)
        .iter()
        .flat_map(|pair| to.split(pair).map(str::trim).map(split_qualified).collect::<Vec<_>>())
        .filter(|name| !name.table.is_empty())
        .collect()
}

fn split_pairs(text: &str) -> Vec<String> {
    let mut pairs = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in text.trim().trim_end_matches(';').chars() {
        match c {
            '`' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => pairs.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    pairs.push(current);
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::ColumnType;

    fn name(schema: Option<&str>, table: &str) -> TableName {
        TableName {
            schema: schema.map(str::to_string),
            table: table.to_string(),
        }
    }

    #[test]
    fn test_parse_ddl_kinds() {
        let ddl = parse_ddl("ALTER TABLE `shop`.`orders` ADD COLUMN note TEXT").unwrap();
        assert_eq!(ddl.kind, EventKind::Alter);
        assert_eq!(ddl.tables, vec![name(Some("shop"), "orders")]);

        let ddl = parse_ddl("create table if not exists users (id int)").unwrap();
        assert_eq!(ddl.kind, EventKind::Create);
        assert_eq!(ddl.tables, vec![name(None, "users")]);

        let ddl = parse_ddl("TRUNCATE shop.carts").unwrap();
        assert_eq!(ddl.kind, EventKind::Truncate);

        let ddl = parse_ddl("CREATE UNIQUE INDEX idx_email ON users (email)").unwrap();
        assert_eq!(ddl.kind, EventKind::CreateIndex);
        assert_eq!(ddl.tables, vec![name(None, "users")]);

        let ddl = parse_ddl("DROP INDEX idx_email ON shop.users").unwrap();
        assert_eq!(ddl.kind, EventKind::DropIndex);
    }

    #[test]
    fn test_parse_drop_list_and_rename() {
        let ddl = parse_ddl("DROP TABLE IF EXISTS `a`, b.c /* generated by server */").unwrap();
        assert_eq!(ddl.kind, EventKind::Drop);
        assert_eq!(ddl.tables[0], name(None, "a"));
        assert_eq!(ddl.tables[1].schema.as_deref(), Some("b"));

        let ddl = parse_ddl("RENAME TABLE t1 TO t1_old, db.t2 TO db.t1").unwrap();
        assert_eq!(ddl.kind, EventKind::Rename);
        assert_eq!(
            ddl.tables,
            vec![
                name(None, "t1"),
                name(None, "t1_old"),
                name(Some("db"), "t2"),
                name(Some("db"), "t1"),
            ]
        );
    }

    #[test]
    fn test_parse_ddl_with_leading_comment() {
        let ddl = parse_ddl("/* app */ ALTER TABLE x ADD y INT").unwrap();
        assert_eq!(ddl.kind, EventKind::Alter);
    }

    #[test]
    fn test_non_ddl() {
        assert!(parse_ddl("BEGIN").is_none());
        assert!(parse_ddl("INSERT INTO t VALUES (1)").is_none());
        assert!(parse_ddl("UPDATE altered SET x = 1").is_none());
    }

    #[test]
    fn test_schema_ddl() {
        let ddl = parse_ddl("CREATE DATABASE IF NOT EXISTS analytics").unwrap();
        assert_eq!(ddl.schema.as_deref(), Some("analytics"));
        assert_eq!(
            ddl.primary_target("other"),
            ("analytics".to_string(), String::new())
        );
    }

    #[test]
    fn test_apply_to_column_defs() {
        let meta = TableMeta {
            schema: "shop".to_string(),
            table: "items".to_string(),
            columns: vec![
                ColumnMeta {
                    is_key: true,
                    nullable: false,
                    ..ColumnMeta::new("id", "int(10) unsigned")
                },
                ColumnMeta::new("payload", "varbinary(32)"),
            ],
        };
        let mut defs = vec![
            ColumnDef::new(ColumnType::Long as u8, 0),
            ColumnDef::new(ColumnType::Varchar as u8, 32),
        ];
        assert!(meta.apply_to(&mut defs));
        assert!(defs[0].unsigned);
        assert!(defs[0].is_key);
        assert_eq!(defs[1].charset.as_deref(), Some("binary"));

        let mut short = vec![ColumnDef::new(ColumnType::Long as u8, 0)];
        assert!(!meta.apply_to(&mut short));
    }

    #[tokio::test]
    async fn test_memory_source() {
        let source = MemoryTableMetaSource::new();
        source.insert(TableMeta {
            schema: "s".to_string(),
            table: "t".to_string(),
            columns: vec![],
        });
        assert!(source.find("s", "t").await.unwrap().is_some());
        assert!(source.find("s", "u").await.unwrap().is_none());
        source.invalidate("s", Some("t"));
        assert_eq!(source.invalidations(), vec![("s".to_string(), Some("t".to_string()))]);
    }
}
