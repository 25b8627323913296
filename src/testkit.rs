//! 테스트용 binlog 바이트 생성기

use crate::events::EventType;
use crate::format::{LOG_EVENT_HEADER_LEN, SERVER_VERSION_LEN};

pub const SERVER_ID: u32 = 1;
pub const SERVER_UUID: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

/// length-coded 정수 인코딩
pub fn lcb(value: u64) -> Vec<u8> {
    match value {
        0..=250 => vec![value as u8],
        251..=0xffff => {
            let mut out = vec![0xfc];
            out.extend_from_slice(&(value as u16).to_le_bytes());
            out
        }
        0x1_0000..=0xff_ffff => {
            let mut out = vec![0xfd];
            out.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
            out
        }
        _ => {
            let mut out = vec![0xfe];
            out.extend_from_slice(&value.to_le_bytes());
            out
        }
    }
}

/// 공통 헤더 + 본문 (+ CRC32)
pub fn event(
    type_code: u8,
    timestamp: u32,
    body: &[u8],
    next_position: u32,
    flags: u16,
    crc: bool,
) -> Vec<u8> {
    let event_length = LOG_EVENT_HEADER_LEN as usize + body.len() + if crc { 4 } else { 0 };
    let mut out = Vec::with_capacity(event_length);
    out.extend_from_slice(&timestamp.to_le_bytes());
    out.push(type_code);
    out.extend_from_slice(&SERVER_ID.to_le_bytes());
    out.extend_from_slice(&(event_length as u32).to_le_bytes());
    out.extend_from_slice(&next_position.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(body);
    if crc {
        let checksum = crc32fast::hash(&out);
        out.extend_from_slice(&checksum.to_le_bytes());
    }
    out
}

pub fn format_description_body(crc: bool) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&4u16.to_le_bytes());
    let mut version = [0u8; SERVER_VERSION_LEN];
    let text = b"8.0.33-test";
    version[..text.len()].copy_from_slice(text);
    body.extend_from_slice(&version);
    body.extend_from_slice(&0u32.to_le_bytes());
    body.push(LOG_EVENT_HEADER_LEN);
    body.extend_from_slice(&crate::format::FormatDescriptor::default().post_header_len);
    body.push(if crc { 1 } else { 0 });
    // FDE 자체 체크섬은 event()가 붙임. 체크섬이 꺼져 있어도 자리는 있어야 함
    if !crc {
        body.extend_from_slice(&[0u8; 4]);
    }
    body
}

pub fn table_map_body(
    table_id: u64,
    schema: &str,
    table: &str,
    types: &[u8],
    meta_block: &[u8],
    optional_meta: &[u8],
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&table_id.to_le_bytes()[..6]);
    body.extend_from_slice(&1u16.to_le_bytes());
    body.push(schema.len() as u8);
    body.extend_from_slice(schema.as_bytes());
    body.push(0);
    body.push(table.len() as u8);
    body.extend_from_slice(table.as_bytes());
    body.push(0);
    body.extend(lcb(types.len() as u64));
    body.extend_from_slice(types);
    body.extend(lcb(meta_block.len() as u64));
    body.extend_from_slice(meta_block);
    body.extend(vec![0xffu8; (types.len() + 7) / 8]);
    body.extend_from_slice(optional_meta);
    body
}

/// ROWS v2 본문. `images`는 이미 인코딩된 행 이미지들
pub fn rows_body(
    table_id: u64,
    column_count: usize,
    included: &[u8],
    changed: Option<&[u8]>,
    images: &[u8],
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&table_id.to_le_bytes()[..6]);
    body.extend_from_slice(&1u16.to_le_bytes()); // STMT_END
    body.extend_from_slice(&2u16.to_le_bytes()); // extra data 없음
    body.extend(lcb(column_count as u64));
    body.extend_from_slice(included);
    if let Some(changed) = changed {
        body.extend_from_slice(changed);
    }
    body.extend_from_slice(images);
    body
}

pub fn query_body(schema: &str, sql: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&77u32.to_le_bytes()); // thread id
    body.extend_from_slice(&0u32.to_le_bytes());
    body.push(schema.len() as u8);
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes()); // status vars 없음
    body.extend_from_slice(schema.as_bytes());
    body.push(0);
    body.extend_from_slice(sql.as_bytes());
    body
}

pub fn xid_body(xid: u64) -> Vec<u8> {
    xid.to_le_bytes().to_vec()
}

pub fn rotate_body(position: u64, name: &str) -> Vec<u8> {
    let mut body = position.to_le_bytes().to_vec();
    body.extend_from_slice(name.as_bytes());
    body
}

pub fn gtid_body(uuid: &str, sequence: u64) -> Vec<u8> {
    let mut body = vec![1u8];
    let uuid = uuid::Uuid::parse_str(uuid).unwrap_or_default();
    body.extend_from_slice(uuid.as_bytes());
    body.extend_from_slice(&sequence.to_le_bytes());
    body.push(2);
    body.extend_from_slice(&0i64.to_le_bytes());
    body.extend_from_slice(&1i64.to_le_bytes());
    body
}

/// 단일 binlog 파일 바이트 생성기
pub struct BinlogFileBuilder {
    bytes: Vec<u8>,
    crc: bool,
}

impl BinlogFileBuilder {
    pub fn new(crc: bool) -> Self {
        let mut builder = BinlogFileBuilder {
            bytes: crate::source::BINLOG_MAGIC.to_vec(),
            crc,
        };
        builder.push(
            EventType::FormatDescriptionEvent as u8,
            1_700_000_000,
            &format_description_body(crc),
        );
        builder
    }

    /// 다음 이벤트 시작 위치
    pub fn position(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn push(&mut self, type_code: u8, timestamp: u32, body: &[u8]) -> &mut Self {
        let len = LOG_EVENT_HEADER_LEN as usize + body.len() + if self.crc { 4 } else { 0 };
        let next = (self.bytes.len() + len) as u32;
        let raw = event(type_code, timestamp, body, next, 0, self.crc);
        self.bytes.extend_from_slice(&raw);
        self
    }

    /// GTID + BEGIN + TABLE_MAP + WRITE_ROWS(단일 INT 컬럼) + XID
    pub fn push_insert_tx(&mut self, timestamp: u32, sequence: u64, value: i32) -> &mut Self {
        self.push(
            EventType::GtidLogEvent as u8,
            timestamp,
            &gtid_body(SERVER_UUID, sequence),
        );
        self.push(EventType::QueryEvent as u8, timestamp, &query_body("shop", "BEGIN"));
        self.push(
            EventType::TableMapEvent as u8,
            timestamp,
            &table_map_body(42, "shop", "orders", &[3], &[], &[]),
        );
        let mut image = vec![0u8];
        image.extend_from_slice(&value.to_le_bytes());
        self.push(
            EventType::WriteRowsEventV2 as u8,
            timestamp,
            &rows_body(42, 1, &[1], None, &image),
        );
        self.push(EventType::XidEvent as u8, timestamp, &xid_body(sequence));
        self
    }

    pub fn push_rotate(&mut self, next_file: &str) -> &mut Self {
        self.push(
            EventType::RotateEvent as u8,
            0,
            &rotate_body(crate::position::BINLOG_START_POSITION, next_file),
        )
    }

    pub fn build(&self) -> Vec<u8> {
        self.bytes.clone()
    }
}
