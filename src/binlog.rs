//! MySQL Binlog 이벤트 디코딩 엔진
//!
//! 각 이벤트:
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes)
//!   - Next Position (4 bytes, v3/v4)
//!   - Flags (2 bytes, v3/v4)
//!   - Post-header + payload (variable)
//!   - CRC32 (4 bytes, FORMAT_DESCRIPTION에서 협상된 경우)
//!
//! 디코더는 타입 코드 -> 디코드 함수 테이블로 분기하며, 상태는 모두 [`DecodeContext`]에 있습니다.
//! 컨텍스트는 연결 하나가 `&mut`로 독점하며 스트림 순서대로만 사용합니다.

use crate::error::{CdcError, Result};
use crate::events::*;
use crate::format::{ChecksumAlg, FormatDescriptor, CHECKSUM_LEN};
use crate::gtid::GtidSet;
use crate::metadata::{parse_ddl, TableMetaSource};
use crate::rows::{
    bit_set, charset_for_collation, decode_row_image, ColumnDef, ColumnType,
};
use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// 타입별 디코드 함수. 본문은 공통 헤더와 체크섬이 제거된 상태
pub type DecodeFn = fn(&EventHeader, &[u8], &mut DecodeContext) -> Result<EventBody>;

/// TABLE_MAP 선택 메타데이터 타입 (MySQL 8 binlog_row_metadata)
const META_SIGNEDNESS: u8 = 1;
const META_DEFAULT_CHARSET: u8 = 2;
const META_COLUMN_CHARSET: u8 = 3;
const META_COLUMN_NAME: u8 = 4;
const META_SIMPLE_PRIMARY_KEY: u8 = 8;
const META_PRIMARY_KEY_WITH_PREFIX: u8 = 9;

/// table id -> 테이블 매핑
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMapping {
    pub table_id: u64,
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnDef>,
    /// TABLE_MAP 선택 메타데이터에 컬럼 이름이 있었는지
    pub full_metadata: bool,
}

impl TableMapping {
    pub fn column_name(&self, index: usize) -> String {
        self.columns
            .get(index)
            .and_then(|c| c.name.clone())
            .unwrap_or_else(|| format!("col_{}", index))
    }
}

/// 연결 하나의 디코드 상태
#[derive(Debug, Clone, Default)]
pub struct DecodeContext {
    pub format: FormatDescriptor,
    tables: HashMap<u64, TableMapping>,
    /// 현재 binlog 파일명
    pub journal_name: String,
    /// 마지막으로 디코딩한 이벤트의 다음 위치
    pub next_position: u64,
    /// 진행 중인 트랜잭션의 GTID
    pub current_gtid: Option<String>,
    /// 지금까지 본 GTID 집합 (PREVIOUS_GTIDS + 커밋된 트랜잭션)
    pub gtid_set: GtidSet,
}

impl DecodeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal_name: impl Into<String>, position: u64) -> Self {
        DecodeContext {
            journal_name: journal_name.into(),
            next_position: position,
            ..Default::default()
        }
    }

    pub fn table(&self, table_id: u64) -> Option<&TableMapping> {
        self.tables.get(&table_id)
    }

    pub fn table_mut(&mut self, table_id: u64) -> Option<&mut TableMapping> {
        self.tables.get_mut(&table_id)
    }

    pub fn put_table(&mut self, mapping: TableMapping) {
        self.tables.insert(mapping.table_id, mapping);
    }

    /// DDL 이후 해당 테이블(또는 스키마 전체)의 매핑 제거
    pub fn drop_tables(&mut self, schema: &str, table: Option<&str>) {
        self.tables.retain(|_, mapping| {
            !(mapping.schema.eq_ignore_ascii_case(schema)
                && table.map_or(true, |t| mapping.table.eq_ignore_ascii_case(t)))
        });
    }

    /// 파싱 에러 이후 재접속 전 초기화. 위치와 누적 GTID 집합은 유지
    pub fn reset(&mut self) {
        self.format = FormatDescriptor::default();
        self.tables.clear();
        self.current_gtid = None;
    }
}

/// Binlog 이벤트 디코더
pub struct LogDecoder {
    handlers: [Option<DecodeFn>; 256],
    verify_checksum: bool,
    meta_source: Option<Arc<dyn TableMetaSource>>,
}

impl Default for LogDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl LogDecoder {
    pub fn new() -> Self {
        let mut decoder = LogDecoder {
            handlers: [None; 256],
            verify_checksum: false,
            meta_source: None,
        };

        decoder.register(EventType::QueryEvent, decode_query);
        decoder.register(EventType::StopEvent, decode_stop);
        decoder.register(EventType::RotateEvent, decode_rotate);
        decoder.register(EventType::XidEvent, decode_xid);
        decoder.register(EventType::TableMapEvent, decode_table_map);
        for rows in [
            EventType::WriteRowsEventV1,
            EventType::UpdateRowsEventV1,
            EventType::DeleteRowsEventV1,
            EventType::WriteRowsEventV2,
            EventType::UpdateRowsEventV2,
            EventType::DeleteRowsEventV2,
        ] {
            decoder.register(rows, decode_rows);
        }
        decoder.register(EventType::HeartbeatLogEvent, decode_heartbeat);
        decoder.register(EventType::RowsQueryLogEvent, decode_rows_query);
        decoder.register(EventType::GtidLogEvent, decode_gtid);
        decoder.register(EventType::AnonymousGtidLogEvent, decode_gtid);
        decoder.register(EventType::PreviousGtidsLogEvent, decode_previous_gtids);

        decoder
    }

    pub fn with_checksum_verification(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    pub fn with_meta_source(mut self, source: Arc<dyn TableMetaSource>) -> Self {
        self.meta_source = Some(source);
        self
    }

    pub fn meta_source(&self) -> Option<&Arc<dyn TableMetaSource>> {
        self.meta_source.as_ref()
    }

    /// 타입 코드에 디코드 함수 등록 (기존 함수 대체)
    pub fn register(&mut self, event_type: EventType, handler: DecodeFn) {
        self.handlers[event_type as usize] = Some(handler);
    }

    /// 원시 이벤트 바이트 하나를 디코딩
    pub fn decode(&self, raw: &[u8], ctx: &mut DecodeContext) -> Result<LogEvent> {
        let header = parse_header(raw, ctx.format.common_header_len)?;
        if header.event_length as usize != raw.len() {
            return Err(CdcError::ParseError(format!(
                "event length {} does not match {} received bytes",
                header.event_length,
                raw.len()
            )));
        }

        let common_len = ctx.format.common_header_len as usize;
        let body = if header.type_code == EventType::FormatDescriptionEvent as u8 {
            let format = FormatDescriptor::parse(&raw[common_len..])?;
            if format.checksum_alg == ChecksumAlg::Crc32 && self.verify_checksum {
                verify_crc32(raw)?;
            }
            debug!(
                "Format description: server {} binlog v{} checksum {:?}",
                format.server_version, format.binlog_version, format.checksum_alg
            );
            let data = FormatDescriptionData {
                binlog_version: format.binlog_version,
                server_version: format.server_version.clone(),
                create_timestamp: format.create_timestamp,
                common_header_len: format.common_header_len,
            };
            ctx.format = format;
            EventBody::FormatDescription(data)
        } else {
            let checksum_len = ctx.format.checksum_len();
            if raw.len() < common_len + checksum_len {
                return Err(CdcError::ParseError(format!(
                    "event of {} bytes shorter than header and checksum",
                    raw.len()
                )));
            }
            if checksum_len > 0 && self.verify_checksum {
                verify_crc32(raw)?;
            }

            let body = &raw[common_len..raw.len() - checksum_len];
            let post_header_len = ctx.format.post_header_len(header.type_code) as usize;
            if body.len() < post_header_len {
                return Err(CdcError::ParseError(format!(
                    "event type {} body of {} bytes shorter than post-header {}",
                    header.type_code,
                    body.len(),
                    post_header_len
                )));
            }

            match self.handlers[header.type_code as usize] {
                Some(handler) => handler(&header, body, ctx)?,
                None => {
                    trace!("Skipping unhandled event type {}", header.type_code);
                    EventBody::Unknown {
                        type_code: header.type_code,
                        ignorable: header.flags & LOG_EVENT_IGNORABLE_F != 0,
                    }
                }
            }
        };

        if let EventBody::Query(query) = &body {
            self.apply_ddl(query, ctx);
        }

        // ROTATE가 이미 위치를 옮겼으므로 artificial 이벤트와 next_position 0은 무시
        if header.next_position != 0 && !header.is_artificial() {
            ctx.next_position = header.next_position as u64;
        }

        Ok(LogEvent { header, body })
    }

    /// 디코딩 후 TABLE_MAP을 메타데이터 협력자로 보강
    pub async fn decode_with_meta(&self, raw: &[u8], ctx: &mut DecodeContext) -> Result<LogEvent> {
        let event = self.decode(raw, ctx)?;
        if let EventBody::TableMap(map) = &event.body {
            self.enrich_table(ctx, map.table_id).await;
        }
        Ok(event)
    }

    async fn enrich_table(&self, ctx: &mut DecodeContext, table_id: u64) {
        let Some(source) = &self.meta_source else {
            return;
        };
        let Some((schema, table)) = ctx
            .table(table_id)
            .filter(|m| !m.full_metadata)
            .map(|m| (m.schema.clone(), m.table.clone()))
        else {
            return;
        };

        for attempt in 0..2 {
            let meta = match source.find(&schema, &table).await {
                Ok(Some(meta)) => meta,
                Ok(None) => {
                    debug!("No metadata for {}.{}, using TABLE_MAP only", schema, table);
                    return;
                }
                Err(e) => {
                    warn!("Metadata lookup for {}.{} failed: {}", schema, table, e);
                    return;
                }
            };

            if let Some(mapping) = ctx.table_mut(table_id) {
                if meta.apply_to(&mut mapping.columns) {
                    return;
                }
            }

            if attempt == 0 {
                debug!("Column count mismatch for {}.{}, refreshing", schema, table);
                source.invalidate(&schema, Some(&table));
            }
        }

        warn!(
            "Metadata for {}.{} still does not match TABLE_MAP, using TABLE_MAP only",
            schema, table
        );
    }

    /// DDL이면 협력자 캐시와 컨텍스트 매핑을 무효화
    fn apply_ddl(&self, query: &QueryEventData, ctx: &mut DecodeContext) {
        let Some(ddl) = parse_ddl(&query.query) else {
            return;
        };
        // DDL은 암묵적으로 커밋되며 XID가 따라오지 않음
        commit_gtid(ctx);

        if ddl.tables.is_empty() {
            if let Some(schema) = &ddl.schema {
                ctx.drop_tables(schema, None);
                if let Some(source) = &self.meta_source {
                    source.invalidate(schema, None);
                }
            }
            return;
        }

        for (schema, table) in ddl.qualified_tables(&query.database) {
            ctx.drop_tables(&schema, Some(&table));
            if let Some(source) = &self.meta_source {
                source.invalidate(&schema, Some(&table));
            }
        }
    }
}

/// 공통 헤더 파싱 (v1은 13바이트, 없는 필드는 0)
pub fn parse_header(raw: &[u8], common_header_len: u8) -> Result<EventHeader> {
    if raw.len() < common_header_len as usize {
        return Err(CdcError::ParseError(format!(
            "Invalid event header: {} bytes",
            raw.len()
        )));
    }

    let mut cursor = Cursor::new(raw);
    let timestamp = cursor.read_u32::<LittleEndian>()?;
    let type_code = cursor.read_u8()?;
    let server_id = cursor.read_u32::<LittleEndian>()?;
    let event_length = cursor.read_u32::<LittleEndian>()?;

    let (next_position, flags) = if common_header_len >= 19 {
        (
            cursor.read_u32::<LittleEndian>()?,
            cursor.read_u16::<LittleEndian>()?,
        )
    } else {
        (0, 0)
    };

    Ok(EventHeader {
        timestamp,
        type_code,
        server_id,
        event_length,
        next_position,
        flags,
    })
}

fn verify_crc32(raw: &[u8]) -> Result<()> {
    let split = raw.len() - CHECKSUM_LEN;
    let expected = u32::from_le_bytes([raw[split], raw[split + 1], raw[split + 2], raw[split + 3]]);
    let actual = crc32fast::hash(&raw[..split]);
    if expected != actual {
        return Err(CdcError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

/// LCB (Length-Coded Binary) 읽기
pub(crate) fn read_lcb(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let byte = cursor.read_u8()?;
    match byte {
        0..=0xfa => Ok(byte as u64),
        // NULL
        0xfb => Ok(0),
        0xfc => Ok(cursor.read_u16::<LittleEndian>()? as u64),
        0xfd => Ok(cursor.read_u24::<LittleEndian>()? as u64),
        0xfe => Ok(cursor.read_u64::<LittleEndian>()?),
        0xff => Err(CdcError::ParseError("Invalid LCB value".to_string())),
    }
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    let remaining = cursor
        .get_ref()
        .len()
        .saturating_sub(cursor.position() as usize);
    if len > remaining {
        return Err(CdcError::ParseError(format!(
            "field length {} exceeds remaining {} bytes",
            len, remaining
        )));
    }
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn read_string(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<String> {
    Ok(String::from_utf8_lossy(&read_bytes(cursor, len)?).into_owned())
}

fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    cursor
        .get_ref()
        .len()
        .saturating_sub(cursor.position() as usize)
}

fn read_table_id(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<u64> {
    if len == 4 {
        Ok(cursor.read_u32::<LittleEndian>()? as u64)
    } else {
        Ok(cursor.read_u48::<LittleEndian>()?)
    }
}

/// QUERY 이벤트 (2)
fn decode_query(header: &EventHeader, body: &[u8], ctx: &mut DecodeContext) -> Result<EventBody> {
    let mut cursor = Cursor::new(body);

    let thread_id = cursor.read_u32::<LittleEndian>()?;
    let exec_time = cursor.read_u32::<LittleEndian>()?;
    let db_len = cursor.read_u8()? as usize;
    let error_code = cursor.read_u16::<LittleEndian>()?;
    let status_len = if ctx.format.post_header_len(header.type_code) >= 13 {
        cursor.read_u16::<LittleEndian>()? as usize
    } else {
        0
    };

    // Status variables skip
    read_bytes(&mut cursor, status_len)?;

    let database = read_string(&mut cursor, db_len)?;
    // null terminator skip
    cursor.read_u8()?;

    let query = String::from_utf8_lossy(&body[cursor.position() as usize..]).into_owned();
    if query.eq_ignore_ascii_case("COMMIT") {
        commit_gtid(ctx);
    }

    Ok(EventBody::Query(QueryEventData {
        thread_id,
        exec_time,
        error_code,
        database,
        query,
    }))
}

/// ROTATE 이벤트 (4). 파일명만 바꾸고 테이블 매핑은 유지
fn decode_rotate(header: &EventHeader, body: &[u8], ctx: &mut DecodeContext) -> Result<EventBody> {
    let mut cursor = Cursor::new(body);
    let position = if ctx.format.post_header_len(header.type_code) >= 8 {
        cursor.read_u64::<LittleEndian>()?
    } else {
        crate::position::BINLOG_START_POSITION
    };
    let next_binlog_name = String::from_utf8_lossy(&body[cursor.position() as usize..]).into_owned();

    debug!("Rotate to {}:{}", next_binlog_name, position);
    ctx.journal_name = next_binlog_name.clone();
    ctx.next_position = position;

    Ok(EventBody::Rotate(RotateEventData {
        next_binlog_name,
        position,
    }))
}

/// XID 이벤트 (16) = 커밋
fn decode_xid(_header: &EventHeader, body: &[u8], ctx: &mut DecodeContext) -> Result<EventBody> {
    let xid = Cursor::new(body).read_u64::<LittleEndian>()?;
    commit_gtid(ctx);
    Ok(EventBody::Xid { xid })
}

fn commit_gtid(ctx: &mut DecodeContext) {
    if let Some(gtid) = ctx.current_gtid.take() {
        if let Err(e) = ctx.gtid_set.add_gtid(&gtid) {
            warn!("Ignoring invalid GTID {}: {}", gtid, e);
        }
    }
}

/// TABLE_MAP 이벤트 (19)
fn decode_table_map(header: &EventHeader, body: &[u8], ctx: &mut DecodeContext) -> Result<EventBody> {
    let mut cursor = Cursor::new(body);

    let table_id = read_table_id(&mut cursor, ctx.format.table_id_len(header.type_code))?;
    let flags = cursor.read_u16::<LittleEndian>()?;

    let db_len = cursor.read_u8()? as usize;
    let database = read_string(&mut cursor, db_len)?;
    cursor.read_u8()?;

    let tbl_len = cursor.read_u8()? as usize;
    let table = read_string(&mut cursor, tbl_len)?;
    cursor.read_u8()?;

    let column_count = read_lcb(&mut cursor)? as usize;
    let column_types = read_bytes(&mut cursor, column_count)?;

    let metadata_length = read_lcb(&mut cursor)? as usize;
    let metadata = read_bytes(&mut cursor, metadata_length)?;
    let column_meta = parse_column_meta(&column_types, &metadata)?;

    let nullable_bitmap = read_bytes(&mut cursor, (column_count + 7) / 8)?;

    let mut columns: Vec<ColumnDef> = column_types
        .iter()
        .zip(&column_meta)
        .enumerate()
        .map(|(idx, (type_code, meta))| ColumnDef {
            nullable: bit_set(&nullable_bitmap, idx),
            ..ColumnDef::new(*type_code, *meta)
        })
        .collect();

    let full_metadata = if remaining(&cursor) > 0 {
        let rest = &body[cursor.position() as usize..];
        apply_optional_metadata(rest, &mut columns)?
    } else {
        false
    };

    trace!("Table map {} -> {}.{} ({} columns)", table_id, database, table, column_count);
    ctx.put_table(TableMapping {
        table_id,
        schema: database.clone(),
        table: table.clone(),
        columns,
        full_metadata,
    });

    Ok(EventBody::TableMap(TableMapData {
        table_id,
        flags,
        database,
        table,
        column_types,
        column_meta,
        nullable_bitmap,
    }))
}

/// 컬럼 타입별 메타데이터 블록 해석
fn parse_column_meta(column_types: &[u8], metadata: &[u8]) -> Result<Vec<u16>> {
    let mut cursor = Cursor::new(metadata);
    let mut result = Vec::with_capacity(column_types.len());

    for type_code in column_types {
        let column_type = ColumnType::from_u8(*type_code);
        let meta = match column_type {
            Some(ColumnType::NewDecimal) | Some(ColumnType::String) | Some(ColumnType::Enum)
            | Some(ColumnType::Set) => {
                // (precision, scale) 또는 (real_type, length): 상위 바이트가 먼저
                let hi = cursor.read_u8()? as u16;
                let lo = cursor.read_u8()? as u16;
                (hi << 8) | lo
            }
            Some(t) if t.meta_width() == 2 => cursor.read_u16::<LittleEndian>()?,
            Some(t) if t.meta_width() == 1 => cursor.read_u8()? as u16,
            _ => 0,
        };
        result.push(meta);
    }

    if remaining(&cursor) != 0 {
        return Err(CdcError::ParseError(format!(
            "{} unused bytes in table map metadata",
            remaining(&cursor)
        )));
    }

    Ok(result)
}

/// MySQL 8 선택 메타데이터 TLV 적용. 컬럼 이름이 포함되었으면 true
fn apply_optional_metadata(data: &[u8], columns: &mut [ColumnDef]) -> Result<bool> {
    let mut cursor = Cursor::new(data);
    let mut has_names = false;

    let numeric: Vec<usize> = columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.column_type().map_or(false, |t| t.is_numeric()))
        .map(|(i, _)| i)
        .collect();
    let character: Vec<usize> = columns
        .iter()
        .enumerate()
        .filter(|(_, c)| is_character_column(c))
        .map(|(i, _)| i)
        .collect();

    while remaining(&cursor) > 0 {
        let field_type = cursor.read_u8()?;
        let len = read_lcb(&mut cursor)? as usize;
        let value = read_bytes(&mut cursor, len)?;
        let mut field = Cursor::new(value.as_slice());

        match field_type {
            META_SIGNEDNESS => {
                // 숫자 컬럼마다 1비트, MSB 우선
                for (n, idx) in numeric.iter().enumerate() {
                    if let Some(byte) = value.get(n / 8) {
                        columns[*idx].unsigned = byte & (0x80 >> (n % 8)) != 0;
                    }
                }
            }
            META_DEFAULT_CHARSET => {
                let default = read_lcb(&mut field)? as u16;
                let mut overrides = HashMap::new();
                while remaining(&field) > 0 {
                    let position = read_lcb(&mut field)? as usize;
                    let collation = read_lcb(&mut field)? as u16;
                    overrides.insert(position, collation);
                }
                for (n, idx) in character.iter().enumerate() {
                    let collation = overrides.get(&n).copied().unwrap_or(default);
                    columns[*idx].charset = Some(charset_for_collation(collation).to_string());
                }
            }
            META_COLUMN_CHARSET => {
                for idx in &character {
                    if remaining(&field) == 0 {
                        break;
                    }
                    let collation = read_lcb(&mut field)? as u16;
                    columns[*idx].charset = Some(charset_for_collation(collation).to_string());
                }
            }
            META_COLUMN_NAME => {
                for column in columns.iter_mut() {
                    if remaining(&field) == 0 {
                        break;
                    }
                    let name_len = read_lcb(&mut field)? as usize;
                    column.name = Some(read_string(&mut field, name_len)?);
                }
                has_names = true;
            }
            META_SIMPLE_PRIMARY_KEY => {
                while remaining(&field) > 0 {
                    let idx = read_lcb(&mut field)? as usize;
                    if let Some(column) = columns.get_mut(idx) {
                        column.is_key = true;
                    }
                }
            }
            META_PRIMARY_KEY_WITH_PREFIX => {
                while remaining(&field) > 0 {
                    let idx = read_lcb(&mut field)? as usize;
                    let _prefix = read_lcb(&mut field)?;
                    if let Some(column) = columns.get_mut(idx) {
                        column.is_key = true;
                    }
                }
            }
            other => trace!("Skipping table map optional metadata {}", other),
        }
    }

    Ok(has_names)
}

fn is_character_column(column: &ColumnDef) -> bool {
    match column.column_type() {
        Some(ColumnType::String) => {
            let real_type = column.real_type();
            real_type != ColumnType::Enum as u8 && real_type != ColumnType::Set as u8
        }
        Some(t) => t.is_character(),
        None => false,
    }
}

/// WRITE/UPDATE/DELETE_ROWS v1(23~25), v2(30~32)
fn decode_rows(header: &EventHeader, body: &[u8], ctx: &mut DecodeContext) -> Result<EventBody> {
    let event_type = header.event_type();
    let kind = match event_type {
        EventType::WriteRowsEventV1 | EventType::WriteRowsEventV2 => RowsKind::Write,
        EventType::UpdateRowsEventV1 | EventType::UpdateRowsEventV2 => RowsKind::Update,
        _ => RowsKind::Delete,
    };

    let mut cursor = Cursor::new(body);
    let table_id = read_table_id(&mut cursor, ctx.format.table_id_len(header.type_code))?;
    let flags = cursor.read_u16::<LittleEndian>()?;

    if event_type.is_rows_v2() {
        // extra data 길이는 자기 자신 2바이트를 포함
        let extra_len = cursor.read_u16::<LittleEndian>()? as usize;
        read_bytes(&mut cursor, extra_len.saturating_sub(2))?;
    }

    let column_count = read_lcb(&mut cursor)? as usize;
    let bitmap_len = (column_count + 7) / 8;
    let columns_present = read_bytes(&mut cursor, bitmap_len)?;
    let columns_changed = if kind == RowsKind::Update {
        Some(read_bytes(&mut cursor, bitmap_len)?)
    } else {
        None
    };

    let mapping = ctx.table(table_id).ok_or_else(|| {
        CdcError::MetadataMissing(format!("table id {} has no table map", table_id))
    })?;
    if mapping.columns.len() != column_count {
        return Err(CdcError::ParseError(format!(
            "rows event for {}.{} has {} columns, table map has {}",
            mapping.schema,
            mapping.table,
            column_count,
            mapping.columns.len()
        )));
    }

    let mut rows = Vec::new();
    while remaining(&cursor) > 0 {
        let pair = match kind {
            RowsKind::Write => RowPair {
                before: None,
                after: Some(decode_row_image(&mut cursor, &mapping.columns, &columns_present)?),
            },
            RowsKind::Delete => RowPair {
                before: Some(decode_row_image(&mut cursor, &mapping.columns, &columns_present)?),
                after: None,
            },
            RowsKind::Update => {
                let before = decode_row_image(&mut cursor, &mapping.columns, &columns_present)?;
                let changed = columns_changed.as_deref().unwrap_or(&columns_present);
                let after = decode_row_image(&mut cursor, &mapping.columns, changed)?;
                RowPair {
                    before: Some(before),
                    after: Some(after),
                }
            }
        };
        rows.push(pair);
    }

    Ok(EventBody::Rows(RowsData {
        kind,
        table_id,
        flags,
        database: mapping.schema.clone(),
        table: mapping.table.clone(),
        column_count,
        columns_present,
        columns_changed,
        rows,
    }))
}

fn decode_stop(_header: &EventHeader, _body: &[u8], _ctx: &mut DecodeContext) -> Result<EventBody> {
    Ok(EventBody::Stop)
}

/// HEARTBEAT 이벤트 (27)
fn decode_heartbeat(_header: &EventHeader, body: &[u8], _ctx: &mut DecodeContext) -> Result<EventBody> {
    Ok(EventBody::Heartbeat {
        log_ident: String::from_utf8_lossy(body).into_owned(),
    })
}

/// ROWS_QUERY 이벤트 (29): 1바이트 길이(무시) + 원본 SQL
fn decode_rows_query(_header: &EventHeader, body: &[u8], _ctx: &mut DecodeContext) -> Result<EventBody> {
    let text = body.get(1..).unwrap_or_default();
    Ok(EventBody::RowsQuery(String::from_utf8_lossy(text).into_owned()))
}

/// GTID (33) / ANONYMOUS_GTID (34)
fn decode_gtid(header: &EventHeader, body: &[u8], ctx: &mut DecodeContext) -> Result<EventBody> {
    let mut cursor = Cursor::new(body);

    let flags = cursor.read_u8()?;
    let mut uuid_bytes = [0u8; 16];
    cursor.read_exact(&mut uuid_bytes)?;
    let sequence = cursor.read_u64::<LittleEndian>()?;

    // logical clock (5.7+): lt_type(1) + last_committed(8) + sequence_number(8)
    let (last_committed, sequence_number) = if remaining(&cursor) >= 17 {
        cursor.read_u8()?;
        (
            Some(cursor.read_i64::<LittleEndian>()?),
            Some(cursor.read_i64::<LittleEndian>()?),
        )
    } else {
        (None, None)
    };

    let anonymous = header.type_code == EventType::AnonymousGtidLogEvent as u8;
    let data = GtidEventData {
        flags,
        server_uuid: uuid::Uuid::from_bytes(uuid_bytes),
        sequence,
        anonymous,
        last_committed,
        sequence_number,
    };
    ctx.current_gtid = if anonymous { None } else { Some(data.gtid()) };

    Ok(EventBody::Gtid(data))
}

/// PREVIOUS_GTIDS (35)
fn decode_previous_gtids(_header: &EventHeader, body: &[u8], ctx: &mut DecodeContext) -> Result<EventBody> {
    let set = GtidSet::decode(body)?;
    ctx.gtid_set.union(&set);
    Ok(EventBody::PreviousGtids(set))
}
