//! 정규화된 변경 엔트리 모델
//!
//! 디코딩된 이벤트는 [`Entry`]로 변환되어 싱크와 스토어를 거쳐 구독자에게 전달됩니다.

use crate::position::LogPosition;
use crate::rows::CellValue;
use serde::{Deserialize, Serialize};

/// 엔트리 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    TransactionBegin,
    RowData,
    TransactionEnd,
    Heartbeat,
}

/// 변경 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Insert,
    Update,
    Delete,
    Create,
    Alter,
    Drop,
    Rename,
    Truncate,
    CreateIndex,
    DropIndex,
    Query,
}

impl EventKind {
    pub fn is_ddl(self) -> bool {
        !matches!(
            self,
            EventKind::Insert | EventKind::Update | EventKind::Delete | EventKind::Query
        )
    }

    pub fn is_dml(self) -> bool {
        matches!(self, EventKind::Insert | EventKind::Update | EventKind::Delete)
    }
}

/// 엔트리 헤더 (위치 + 대상 테이블)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryHeader {
    pub journal_name: String,
    /// 이벤트 시작 위치
    pub position: u64,
    /// 이벤트 시각 (밀리초)
    pub timestamp: i64,
    pub server_id: u32,
    /// 현재 트랜잭션의 GTID (uuid:seq)
    pub gtid: Option<String>,
    pub schema: String,
    pub table: String,
    pub event_type: Option<EventKind>,
    pub event_length: u32,
}

/// 행 이미지 안의 컬럼
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub index: usize,
    pub name: String,
    pub mysql_type: String,
    pub is_key: bool,
    /// UPDATE에서 변경 전후 값이 다른 컬럼
    pub updated: bool,
    pub is_null: bool,
    pub value: CellValue,
}

/// 한 행의 변경 (INSERT는 after만, DELETE는 before만)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowData {
    pub before: Vec<Column>,
    pub after: Vec<Column>,
}

/// RowData 엔트리 본문
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub kind: EventKind,
    pub is_ddl: bool,
    /// DDL 또는 쿼리 원문
    pub sql: Option<String>,
    /// ROWS_QUERY 이벤트로 전달된 원본 DML (binlog_rows_query_log_events)
    pub rows_query: Option<String>,
    pub rows: Vec<RowData>,
}

/// 트랜잭션 경계 엔트리 정보
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub thread_id: Option<u32>,
    pub xid: Option<u64>,
    /// 이 트랜잭션 종료 직후 위치 (재시작 지점)
    pub end_position: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub header: EntryHeader,
    pub entry_type: EntryType,
    pub row_change: Option<RowChange>,
    pub transaction: Option<TransactionInfo>,
}

impl Entry {
    pub fn transaction_begin(header: EntryHeader, thread_id: Option<u32>) -> Self {
        Entry {
            header,
            entry_type: EntryType::TransactionBegin,
            row_change: None,
            transaction: Some(TransactionInfo {
                thread_id,
                ..Default::default()
            }),
        }
    }

    pub fn transaction_end(header: EntryHeader, xid: Option<u64>, end_position: u64) -> Self {
        Entry {
            header,
            entry_type: EntryType::TransactionEnd,
            row_change: None,
            transaction: Some(TransactionInfo {
                thread_id: None,
                xid,
                end_position: Some(end_position),
            }),
        }
    }

    pub fn row_data(header: EntryHeader, row_change: RowChange) -> Self {
        Entry {
            header,
            entry_type: EntryType::RowData,
            row_change: Some(row_change),
            transaction: None,
        }
    }

    pub fn heartbeat(header: EntryHeader) -> Self {
        Entry {
            header,
            entry_type: EntryType::Heartbeat,
            row_change: None,
            transaction: None,
        }
    }

    pub fn is_transaction_marker(&self) -> bool {
        matches!(
            self.entry_type,
            EntryType::TransactionBegin | EntryType::TransactionEnd
        )
    }

    pub fn is_ddl(&self) -> bool {
        self.row_change.as_ref().map_or(false, |rc| rc.is_ddl)
    }

    /// 여기서 다시 읽기 시작해도 트랜잭션 중간이 아닌 엔트리
    pub fn is_boundary(&self) -> bool {
        self.entry_type == EntryType::TransactionEnd || self.is_ddl()
    }

    /// "schema.table"
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.header.schema, self.header.table)
    }

    /// 이 엔트리의 로그 위치
    pub fn position(&self) -> LogPosition {
        LogPosition {
            journal_name: self.header.journal_name.clone(),
            position: self.header.position,
            timestamp: self.header.timestamp,
            server_id: self.header.server_id,
            gtid: self.header.gtid.clone(),
            included: false,
        }
    }

    /// 이 엔트리까지 처리했을 때 재시작할 위치.
    /// 트랜잭션 종료 엔트리는 다음 이벤트 위치를, 나머지는 자기 위치를 돌려줌
    pub fn resume_position(&self) -> LogPosition {
        let mut position = self.position();
        match self.transaction.as_ref().and_then(|tx| tx.end_position) {
            Some(end) if self.entry_type == EntryType::TransactionEnd => {
                position.position = end;
            }
            _ => position.included = true,
        }
        position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(position: u64) -> EntryHeader {
        EntryHeader {
            journal_name: "mysql-bin.000001".to_string(),
            position,
            schema: "shop".to_string(),
            table: "orders".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_event_kind_classification() {
        assert!(EventKind::Alter.is_ddl());
        assert!(EventKind::CreateIndex.is_ddl());
        assert!(!EventKind::Insert.is_ddl());
        assert!(!EventKind::Query.is_ddl());
        assert!(EventKind::Delete.is_dml());
    }

    #[test]
    fn test_resume_position() {
        let end = Entry::transaction_end(header(900), Some(7), 931);
        let resume = end.resume_position();
        assert_eq!(resume.position, 931);
        assert!(!resume.included);

        let begin = Entry::transaction_begin(header(400), Some(1));
        let resume = begin.resume_position();
        assert_eq!(resume.position, 400);
        assert!(resume.included);
        assert_eq!(begin.qualified_name(), "shop.orders");
        assert!(end.is_boundary());
        assert!(!begin.is_boundary());
    }
}
