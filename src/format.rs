//! FORMAT_DESCRIPTION 이벤트 기반 포맷 디스크립터
//!
//! 연결마다 하나의 디스크립터가 존재하며 FORMAT_DESCRIPTION 이벤트를 받을 때마다 교체됩니다.
//! 공통 헤더 길이, 타입별 post-header 길이, 체크섬 알고리즘을 보관합니다.

use crate::error::{CdcError, Result};
use crate::events::EventType;
use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};

/// v3/v4 공통 헤더 길이
pub const LOG_EVENT_HEADER_LEN: u8 = 19;
/// v1 공통 헤더 길이 (next_position, flags 없음)
pub const OLD_HEADER_LEN: u8 = 13;
/// FORMAT_DESCRIPTION 본문의 서버 버전 필드 길이
pub const SERVER_VERSION_LEN: usize = 50;
/// CRC32 체크섬 길이
pub const CHECKSUM_LEN: usize = 4;

/// binlog_version(2) + server_version(50) + create_timestamp(4) + header_len(1)
const FDE_FIXED_LEN: usize = 2 + SERVER_VERSION_LEN + 4 + 1;

/// 체크섬을 지원하기 시작한 서버 버전
const CHECKSUM_MYSQL_VERSION: (u32, u32, u32) = (5, 6, 1);
const CHECKSUM_MARIADB_VERSION: (u32, u32, u32) = (5, 3, 0);

/// 이벤트 체크섬 알고리즘
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumAlg {
    Off,
    Crc32,
    /// 체크섬을 모르는 구버전 서버
    Undefined,
}

impl ChecksumAlg {
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => ChecksumAlg::Off,
            1 => ChecksumAlg::Crc32,
            _ => ChecksumAlg::Undefined,
        }
    }
}

/// binlog 포맷 디스크립터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub binlog_version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
    pub common_header_len: u8,
    /// 타입 코드 - 1 로 인덱싱
    pub post_header_len: Vec<u8>,
    pub checksum_alg: ChecksumAlg,
}

impl Default for FormatDescriptor {
    fn default() -> Self {
        FormatDescriptor::for_version(4)
    }
}

impl FormatDescriptor {
    /// FORMAT_DESCRIPTION을 받기 전 사용할 버전별 기본 디스크립터
    pub fn for_version(binlog_version: u16) -> Self {
        let (common_header_len, post_header_len, server_version) = match binlog_version {
            1 => (OLD_HEADER_LEN, v3_post_header_table(), "3.23"),
            3 => (LOG_EVENT_HEADER_LEN, v3_post_header_table(), "4.0"),
            _ => (LOG_EVENT_HEADER_LEN, v4_post_header_table(), "5.0"),
        };

        FormatDescriptor {
            binlog_version,
            server_version: server_version.to_string(),
            create_timestamp: 0,
            common_header_len,
            post_header_len,
            checksum_alg: ChecksumAlg::Off,
        }
    }

    /// FORMAT_DESCRIPTION 이벤트 본문(공통 헤더 이후, 체크섬 포함)으로부터 파싱
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < FDE_FIXED_LEN {
            return Err(CdcError::ParseError(format!(
                "Invalid format description event: {} bytes",
                body.len()
            )));
        }

        let mut cursor = Cursor::new(body);
        let binlog_version = cursor.read_u16::<LittleEndian>()?;

        let mut version_bytes = [0u8; SERVER_VERSION_LEN];
        cursor.read_exact(&mut version_bytes)?;
        let end = version_bytes
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(SERVER_VERSION_LEN);
        let server_version = String::from_utf8_lossy(&version_bytes[..end]).to_string();

        let create_timestamp = cursor.read_u32::<LittleEndian>()?;
        let common_header_len = cursor.read_u8()?;
        if common_header_len < OLD_HEADER_LEN {
            return Err(CdcError::ParseError(format!(
                "Invalid common header length: {}",
                common_header_len
            )));
        }

        // 체크섬 지원 서버는 본문 끝에 checksum_alg(1) + crc(4)가 붙음
        let (table_end, checksum_alg) = if supports_checksum(&server_version) {
            if body.len() < FDE_FIXED_LEN + 1 + CHECKSUM_LEN {
                return Err(CdcError::ParseError(
                    "Format description event missing checksum algorithm".to_string(),
                ));
            }
            let alg_offset = body.len() - 1 - CHECKSUM_LEN;
            (alg_offset, ChecksumAlg::from_u8(body[alg_offset]))
        } else {
            (body.len(), ChecksumAlg::Undefined)
        };

        let post_header_len = body[FDE_FIXED_LEN..table_end].to_vec();

        Ok(FormatDescriptor {
            binlog_version,
            server_version,
            create_timestamp,
            common_header_len,
            post_header_len,
            checksum_alg,
        })
    }

    /// 타입별 post-header 길이. 테이블에 없는 타입은 0
    pub fn post_header_len(&self, type_code: u8) -> u8 {
        if type_code == 0 {
            return 0;
        }
        self.post_header_len
            .get(type_code as usize - 1)
            .copied()
            .unwrap_or(0)
    }

    /// 공통 헤더 + post-header 길이
    pub fn header_len(&self, type_code: u8) -> usize {
        self.common_header_len as usize + self.post_header_len(type_code) as usize
    }

    /// 모든 이벤트 끝에서 잘라내야 할 체크섬 길이
    pub fn checksum_len(&self) -> usize {
        match self.checksum_alg {
            ChecksumAlg::Crc32 => CHECKSUM_LEN,
            _ => 0,
        }
    }

    /// TABLE_MAP/ROWS의 table id 길이 (post-header가 6바이트면 4바이트 id)
    pub fn table_id_len(&self, type_code: u8) -> usize {
        if self.post_header_len(type_code) == 6 {
            4
        } else {
            6
        }
    }
}

/// "5.7.30-log" -> (5, 7, 30)
pub fn parse_server_version(version: &str) -> (u32, u32, u32) {
    let mut parts = version.split(|c: char| !c.is_ascii_digit());
    let mut next = || {
        parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .unwrap_or(0)
    };
    (next(), next(), next())
}

fn supports_checksum(server_version: &str) -> bool {
    let version = parse_server_version(server_version);
    if server_version.contains("MariaDB") {
        version >= CHECKSUM_MARIADB_VERSION
    } else {
        version >= CHECKSUM_MYSQL_VERSION
    }
}

fn v4_post_header_table() -> Vec<u8> {
    let mut table = vec![0u8; EventType::TransactionPayloadEvent as usize];
    let mut set = |event_type: EventType, len: u8| table[event_type as usize - 1] = len;

    set(EventType::StartEventV3, 56);
    set(EventType::QueryEvent, 13);
    set(EventType::RotateEvent, 8);
    set(EventType::TableMapEvent, 8);
    set(EventType::WriteRowsEventV1, 8);
    set(EventType::UpdateRowsEventV1, 8);
    set(EventType::DeleteRowsEventV1, 8);
    set(EventType::IncidentEvent, 2);
    set(EventType::WriteRowsEventV2, 10);
    set(EventType::UpdateRowsEventV2, 10);
    set(EventType::DeleteRowsEventV2, 10);
    set(EventType::GtidLogEvent, 42);
    set(EventType::AnonymousGtidLogEvent, 42);
    set(EventType::TransactionContextEvent, 18);
    set(EventType::ViewChangeEvent, 52);
    set(EventType::PartialUpdateRowsEvent, 10);
    table
}

fn v3_post_header_table() -> Vec<u8> {
    // v1/v3 QUERY는 status_vars 길이 필드가 없음
    let mut table = vec![0u8; EventType::FormatDescriptionEvent as usize];
    table[EventType::StartEventV3 as usize - 1] = 56;
    table[EventType::QueryEvent as usize - 1] = 11;
    table[EventType::RotateEvent as usize - 1] = 8;
    table
}
