//! MySQL Binlog 이벤트 타입 및 데이터 구조 정의
//!
//! 이벤트는 공통 헤더([`EventHeader`])와 타입별 본문([`EventBody`])으로 구성됩니다.
//! 본문은 타입 코드 기준의 tagged union이며, 디코더는 타입 코드 테이블로 분기합니다.

use crate::gtid::GtidSet;
use crate::rows::RowImage;
use serde::{Deserialize, Serialize};

/// 이벤트 헤더 플래그: 서버가 인위적으로 만든 이벤트 (fake ROTATE 등)
pub const LOG_EVENT_ARTIFICIAL_F: u16 = 0x20;
/// 이벤트 헤더 플래그: 모르는 타입이어도 무시해도 되는 이벤트
pub const LOG_EVENT_IGNORABLE_F: u16 = 0x80;

/// MySQL Binlog 이벤트 타입 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    Unknown = 0,
    StartEventV3 = 1,
    QueryEvent = 2,
    StopEvent = 3,
    RotateEvent = 4,
    IntvarEvent = 5,
    RandEvent = 13,
    UserVarEvent = 14,
    FormatDescriptionEvent = 15,
    XidEvent = 16,
    TableMapEvent = 19,
    WriteRowsEventV1 = 23,
    UpdateRowsEventV1 = 24,
    DeleteRowsEventV1 = 25,
    IncidentEvent = 26,
    HeartbeatLogEvent = 27,
    IgnorableLogEvent = 28,
    RowsQueryLogEvent = 29,
    WriteRowsEventV2 = 30,
    UpdateRowsEventV2 = 31,
    DeleteRowsEventV2 = 32,
    GtidLogEvent = 33,
    AnonymousGtidLogEvent = 34,
    PreviousGtidsLogEvent = 35,
    TransactionContextEvent = 36,
    ViewChangeEvent = 37,
    XaPrepareLogEvent = 38,
    PartialUpdateRowsEvent = 39,
    TransactionPayloadEvent = 40,
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            1 => EventType::StartEventV3,
            2 => EventType::QueryEvent,
            3 => EventType::StopEvent,
            4 => EventType::RotateEvent,
            5 => EventType::IntvarEvent,
            13 => EventType::RandEvent,
            14 => EventType::UserVarEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            23 => EventType::WriteRowsEventV1,
            24 => EventType::UpdateRowsEventV1,
            25 => EventType::DeleteRowsEventV1,
            26 => EventType::IncidentEvent,
            27 => EventType::HeartbeatLogEvent,
            28 => EventType::IgnorableLogEvent,
            29 => EventType::RowsQueryLogEvent,
            30 => EventType::WriteRowsEventV2,
            31 => EventType::UpdateRowsEventV2,
            32 => EventType::DeleteRowsEventV2,
            33 => EventType::GtidLogEvent,
            34 => EventType::AnonymousGtidLogEvent,
            35 => EventType::PreviousGtidsLogEvent,
            36 => EventType::TransactionContextEvent,
            37 => EventType::ViewChangeEvent,
            38 => EventType::XaPrepareLogEvent,
            39 => EventType::PartialUpdateRowsEvent,
            40 => EventType::TransactionPayloadEvent,
            _ => EventType::Unknown,
        }
    }

    pub fn is_rows_v2(self) -> bool {
        matches!(
            self,
            EventType::WriteRowsEventV2 | EventType::UpdateRowsEventV2 | EventType::DeleteRowsEventV2
        )
    }
}

/// Binlog 이벤트 공통 헤더
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    /// 이벤트 타임스탬프 (초 단위)
    pub timestamp: u32,
    /// 원본 타입 코드 (알 수 없는 코드도 그대로 보존)
    pub type_code: u8,
    /// MySQL 서버 ID
    pub server_id: u32,
    /// 이벤트 길이 (헤더 + 본문 + 체크섬)
    pub event_length: u32,
    /// 다음 이벤트 위치
    pub next_position: u32,
    /// 이벤트 플래그
    pub flags: u16,
}

impl EventHeader {
    pub fn event_type(&self) -> EventType {
        EventType::from_u8(self.type_code)
    }

    /// 현재 파일 안에서의 이벤트 시작 위치
    pub fn log_position(&self) -> u64 {
        (self.next_position as u64).saturating_sub(self.event_length as u64)
    }

    pub fn is_artificial(&self) -> bool {
        self.flags & LOG_EVENT_ARTIFICIAL_F != 0
    }
}

/// FORMAT_DESCRIPTION 이벤트 본문
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatDescriptionData {
    pub binlog_version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
    pub common_header_len: u8,
}

/// TABLE_MAP 이벤트 본문
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMapData {
    pub table_id: u64,
    pub flags: u16,
    pub database: String,
    pub table: String,
    pub column_types: Vec<u8>,
    pub column_meta: Vec<u16>,
    pub nullable_bitmap: Vec<u8>,
}

/// ROWS 이벤트 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowsKind {
    Write,
    Update,
    Delete,
}

/// WRITE/UPDATE/DELETE_ROWS 이벤트 본문
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowsData {
    pub kind: RowsKind,
    pub table_id: u64,
    pub flags: u16,
    pub database: String,
    pub table: String,
    pub column_count: usize,
    /// 포함된 컬럼 비트맵
    pub columns_present: Vec<u8>,
    /// UPDATE의 after 이미지 컬럼 비트맵
    pub columns_changed: Option<Vec<u8>>,
    /// INSERT/DELETE는 `before` 또는 `after` 한쪽만, UPDATE는 양쪽 모두
    pub rows: Vec<RowPair>,
}

/// 한 행의 변경 전후 이미지
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowPair {
    pub before: Option<RowImage>,
    pub after: Option<RowImage>,
}

/// 쿼리 이벤트 본문
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEventData {
    pub thread_id: u32,
    pub exec_time: u32,
    pub error_code: u16,
    pub database: String,
    pub query: String,
}

/// 회전 이벤트 본문
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateEventData {
    pub next_binlog_name: String,
    pub position: u64,
}

/// GTID / ANONYMOUS_GTID 이벤트 본문
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GtidEventData {
    pub flags: u8,
    pub server_uuid: uuid::Uuid,
    pub sequence: u64,
    pub anonymous: bool,
    pub last_committed: Option<i64>,
    pub sequence_number: Option<i64>,
}

impl GtidEventData {
    /// `uuid:sequence` 형식의 GTID 문자열
    pub fn gtid(&self) -> String {
        format!("{}:{}", self.server_uuid, self.sequence)
    }
}

/// 디코딩된 이벤트 본문 (타입 코드 기준 tagged union)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventBody {
    FormatDescription(FormatDescriptionData),
    TableMap(TableMapData),
    Rows(RowsData),
    Query(QueryEventData),
    Xid { xid: u64 },
    Rotate(RotateEventData),
    Gtid(GtidEventData),
    PreviousGtids(GtidSet),
    RowsQuery(String),
    Heartbeat { log_ident: String },
    Stop,
    /// 처리하지 않는 타입. 전방 호환을 위해 에러가 아님
    Unknown { type_code: u8, ignorable: bool },
}

/// 완성된 Binlog 이벤트
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub header: EventHeader,
    pub body: EventBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_from_u8() {
        assert_eq!(EventType::from_u8(19), EventType::TableMapEvent);
        assert_eq!(EventType::from_u8(31), EventType::UpdateRowsEventV2);
        assert_eq!(EventType::from_u8(200), EventType::Unknown);
        assert!(EventType::DeleteRowsEventV2.is_rows_v2());
        assert!(!EventType::DeleteRowsEventV1.is_rows_v2());
    }

    #[test]
    fn test_header_log_position() {
        let header = EventHeader {
            timestamp: 0,
            type_code: 16,
            server_id: 1,
            event_length: 31,
            next_position: 1000,
            flags: 0,
        };
        assert_eq!(header.log_position(), 969);
        assert!(!header.is_artificial());
    }
}
