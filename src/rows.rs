//! ROWS 이벤트의 행 이미지 코덱
//!
//! 행 이미지는 포함 컬럼 비트맵, NULL 비트맵, 그리고 포함된 non-NULL 컬럼 값의 연속으로 구성됩니다.
//! 값의 바이트 길이는 컬럼 타입과 TABLE_MAP 메타데이터로 결정됩니다.
//!
//! - 부호 없는 정수는 절대 부호 확장하지 않습니다.
//! - 0 날짜/시간은 [`CellValue::ZeroDate`], [`CellValue::ZeroDateTime`]으로 구분합니다.
//! - 문자열 charset은 테이블 메타데이터에서 가져옵니다. binary collation은 바이트 그대로 둡니다.

use crate::error::{CdcError, Result};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Cursor, Read};

/// MySQL 컬럼 타입 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0,
    Tiny = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Null = 6,
    Timestamp = 7,
    LongLong = 8,
    Int24 = 9,
    Date = 10,
    Time = 11,
    DateTime = 12,
    Year = 13,
    NewDate = 14,
    Varchar = 15,
    Bit = 16,
    Timestamp2 = 17,
    DateTime2 = 18,
    Time2 = 19,
    Json = 245,
    NewDecimal = 246,
    Enum = 247,
    Set = 248,
    TinyBlob = 249,
    MediumBlob = 250,
    LongBlob = 251,
    Blob = 252,
    VarString = 253,
    String = 254,
    Geometry = 255,
}

impl ColumnType {
    pub fn from_u8(val: u8) -> Option<Self> {
        let column_type = match val {
            0 => ColumnType::Decimal,
            1 => ColumnType::Tiny,
            2 => ColumnType::Short,
            3 => ColumnType::Long,
            4 => ColumnType::Float,
            5 => ColumnType::Double,
            6 => ColumnType::Null,
            7 => ColumnType::Timestamp,
            8 => ColumnType::LongLong,
            9 => ColumnType::Int24,
            10 => ColumnType::Date,
            11 => ColumnType::Time,
            12 => ColumnType::DateTime,
            13 => ColumnType::Year,
            14 => ColumnType::NewDate,
            15 => ColumnType::Varchar,
            16 => ColumnType::Bit,
            17 => ColumnType::Timestamp2,
            18 => ColumnType::DateTime2,
            19 => ColumnType::Time2,
            245 => ColumnType::Json,
            246 => ColumnType::NewDecimal,
            247 => ColumnType::Enum,
            248 => ColumnType::Set,
            249 => ColumnType::TinyBlob,
            250 => ColumnType::MediumBlob,
            251 => ColumnType::LongBlob,
            252 => ColumnType::Blob,
            253 => ColumnType::VarString,
            254 => ColumnType::String,
            255 => ColumnType::Geometry,
            _ => return None,
        };
        Some(column_type)
    }

    /// TABLE_MAP 메타데이터 블록에서 이 타입이 차지하는 바이트 수
    pub fn meta_width(self) -> usize {
        match self {
            ColumnType::Float
            | ColumnType::Double
            | ColumnType::Blob
            | ColumnType::TinyBlob
            | ColumnType::MediumBlob
            | ColumnType::LongBlob
            | ColumnType::Json
            | ColumnType::Geometry
            | ColumnType::Timestamp2
            | ColumnType::DateTime2
            | ColumnType::Time2 => 1,
            ColumnType::Varchar
            | ColumnType::VarString
            | ColumnType::Bit
            | ColumnType::NewDecimal
            | ColumnType::String
            | ColumnType::Enum
            | ColumnType::Set => 2,
            _ => 0,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            ColumnType::Tiny
                | ColumnType::Short
                | ColumnType::Int24
                | ColumnType::Long
                | ColumnType::LongLong
                | ColumnType::Float
                | ColumnType::Double
                | ColumnType::NewDecimal
        )
    }

    /// charset을 가질 수 있는 타입 (SIGNEDNESS/COLUMN_CHARSET 메타데이터 순서 계산용)
    pub fn is_character(self) -> bool {
        matches!(
            self,
            ColumnType::Varchar
                | ColumnType::VarString
                | ColumnType::String
                | ColumnType::Blob
                | ColumnType::TinyBlob
                | ColumnType::MediumBlob
                | ColumnType::LongBlob
        )
    }
}

/// 컬럼 정의 (TABLE_MAP + 메타데이터 협력자 정보)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub type_code: u8,
    pub meta: u16,
    pub nullable: bool,
    pub unsigned: bool,
    /// charset 이름 (utf8mb4, latin1, binary ...). 모르면 None
    pub charset: Option<String>,
    pub name: Option<String>,
    pub is_key: bool,
}

impl ColumnDef {
    pub fn new(type_code: u8, meta: u16) -> Self {
        ColumnDef {
            type_code,
            meta,
            nullable: true,
            unsigned: false,
            charset: None,
            name: None,
            is_key: false,
        }
    }

    pub fn column_type(&self) -> Option<ColumnType> {
        ColumnType::from_u8(self.type_code)
    }

    /// STRING 컬럼 메타데이터에 실린 실제 타입 (ENUM/SET/STRING)
    pub fn real_type(&self) -> u8 {
        string_real_type(self.meta).0
    }

    /// 엔트리에 실을 MySQL 타입 이름 ("int unsigned", "varchar", ...)
    pub fn type_name(&self) -> String {
        let base = match self.column_type() {
            Some(ColumnType::Decimal) | Some(ColumnType::NewDecimal) => "decimal",
            Some(ColumnType::Tiny) => "tinyint",
            Some(ColumnType::Short) => "smallint",
            Some(ColumnType::Int24) => "mediumint",
            Some(ColumnType::Long) => "int",
            Some(ColumnType::LongLong) => "bigint",
            Some(ColumnType::Float) => "float",
            Some(ColumnType::Double) => "double",
            Some(ColumnType::Null) => "null",
            Some(ColumnType::Timestamp) | Some(ColumnType::Timestamp2) => "timestamp",
            Some(ColumnType::Date) | Some(ColumnType::NewDate) => "date",
            Some(ColumnType::Time) | Some(ColumnType::Time2) => "time",
            Some(ColumnType::DateTime) | Some(ColumnType::DateTime2) => "datetime",
            Some(ColumnType::Year) => "year",
            Some(ColumnType::Varchar) | Some(ColumnType::VarString) => "varchar",
            Some(ColumnType::Bit) => "bit",
            Some(ColumnType::Json) => "json",
            Some(ColumnType::Enum) => "enum",
            Some(ColumnType::Set) => "set",
            Some(ColumnType::TinyBlob) => "tinyblob",
            Some(ColumnType::MediumBlob) => "mediumblob",
            Some(ColumnType::LongBlob) => "longblob",
            Some(ColumnType::Blob) => "blob",
            Some(ColumnType::Geometry) => "geometry",
            Some(ColumnType::String) => match self.real_type() {
                t if t == ColumnType::Enum as u8 => "enum",
                t if t == ColumnType::Set as u8 => "set",
                _ => "char",
            },
            None => return format!("unknown({})", self.type_code),
        };

        let numeric = self.column_type().map_or(false, |t| t.is_numeric());
        if numeric && self.unsigned {
            format!("{} unsigned", base)
        } else {
            base.to_string()
        }
    }
}

/// STRING 메타데이터 해석: (실제 타입, 최대 길이)
///
/// 길이가 255를 넘으면 상위 바이트의 0x30 비트에 길이 상위 비트가 뒤집혀 저장됩니다.
fn string_real_type(meta: u16) -> (u8, u16) {
    let byte0 = (meta >> 8) as u8;
    let byte1 = meta & 0xff;
    if byte0 == 0 {
        return (ColumnType::String as u8, byte1);
    }
    if byte0 & 0x30 != 0x30 {
        let max_len = byte1 | ((((byte0 & 0x30) ^ 0x30) as u16) << 4);
        (byte0 | 0x30, max_len)
    } else {
        (byte0, byte1)
    }
}

/// TIME / TIME2 값 (음수와 838시간까지 허용)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MysqlTime {
    pub negative: bool,
    pub hours: u32,
    pub minutes: u8,
    pub seconds: u8,
    pub micros: u32,
}

impl fmt::Display for MysqlTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negative {
            f.write_str("-")?;
        }
        write!(f, "{:02}:{:02}:{:02}", self.hours, self.minutes, self.seconds)?;
        if self.micros > 0 {
            write!(f, ".{:06}", self.micros)?;
        }
        Ok(())
    }
}

/// 디코딩된 컬럼 값
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    /// 정밀도를 잃지 않도록 10진 문자열로 보관
    Decimal(String),
    String(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Timestamp(DateTime<Utc>),
    Time(MysqlTime),
    /// 0000-00-00
    ZeroDate,
    /// 0000-00-00 00:00:00
    ZeroDateTime,
    /// 일부만 0인 날짜 (2020-00-15 등). chrono로 표현할 수 없어 문자열로 보관
    Temporal(String),
    Year(u16),
    Enum(u16),
    Set(u64),
    Bit(u64),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => f.write_str("NULL"),
            CellValue::Int8(v) => write!(f, "{}", v),
            CellValue::Int16(v) => write!(f, "{}", v),
            CellValue::Int32(v) => write!(f, "{}", v),
            CellValue::Int64(v) => write!(f, "{}", v),
            CellValue::UInt8(v) => write!(f, "{}", v),
            CellValue::UInt16(v) => write!(f, "{}", v),
            CellValue::UInt32(v) => write!(f, "{}", v),
            CellValue::UInt64(v) => write!(f, "{}", v),
            CellValue::Float(v) => write!(f, "{}", v),
            CellValue::Double(v) => write!(f, "{}", v),
            CellValue::Decimal(v) | CellValue::String(v) | CellValue::Temporal(v) => {
                f.write_str(v)
            }
            CellValue::Bytes(v) => write!(f, "{}", String::from_utf8_lossy(v)),
            CellValue::Json(v) => write!(f, "{}", v),
            CellValue::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            CellValue::DateTime(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
            CellValue::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
            CellValue::Time(v) => write!(f, "{}", v),
            CellValue::ZeroDate => f.write_str("0000-00-00"),
            CellValue::ZeroDateTime => f.write_str("0000-00-00 00:00:00"),
            CellValue::Year(v) => write!(f, "{:04}", v),
            CellValue::Enum(v) => write!(f, "{}", v),
            CellValue::Set(v) | CellValue::Bit(v) => write!(f, "{}", v),
        }
    }
}

/// 한 행 이미지. 테이블 컬럼 순서대로, 포함되지 않은 컬럼은 None
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowImage {
    pub cells: Vec<Option<CellValue>>,
}

impl RowImage {
    pub fn get(&self, index: usize) -> Option<&CellValue> {
        self.cells.get(index).and_then(|c| c.as_ref())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// 비트맵의 idx번째 비트 (LSB 우선)
pub fn bit_set(bitmap: &[u8], idx: usize) -> bool {
    bitmap
        .get(idx / 8)
        .map_or(false, |byte| byte & (1 << (idx % 8)) != 0)
}

/// 앞쪽 `bits`개 비트 중 켜진 비트 수
pub fn count_bits(bitmap: &[u8], bits: usize) -> usize {
    (0..bits).filter(|i| bit_set(bitmap, *i)).count()
}

/// 포함 비트맵에 따라 행 이미지 하나를 읽음
pub fn decode_row_image(
    cursor: &mut Cursor<&[u8]>,
    columns: &[ColumnDef],
    included: &[u8],
) -> Result<RowImage> {
    let included_count = count_bits(included, columns.len());
    let mut null_bitmap = vec![0u8; (included_count + 7) / 8];
    cursor.read_exact(&mut null_bitmap)?;

    let mut cells = Vec::with_capacity(columns.len());
    let mut null_idx = 0;

    for (idx, column) in columns.iter().enumerate() {
        if !bit_set(included, idx) {
            cells.push(None);
            continue;
        }

        let is_null = bit_set(&null_bitmap, null_idx);
        null_idx += 1;

        if is_null {
            cells.push(Some(CellValue::Null));
        } else {
            let value = decode_value(cursor, column).map_err(|e| match e {
                CdcError::ParseError(msg) => {
                    CdcError::ParseError(format!("column {} (type {}): {}", idx, column.type_code, msg))
                }
                other => other,
            })?;
            cells.push(Some(value));
        }
    }

    Ok(RowImage { cells })
}

/// 단일 컬럼 값 디코딩
pub fn decode_value(cursor: &mut Cursor<&[u8]>, column: &ColumnDef) -> Result<CellValue> {
    let column_type = column.column_type().ok_or_else(|| {
        CdcError::ParseError(format!("Unsupported column type {}", column.type_code))
    })?;
    let meta = column.meta;
    let unsigned = column.unsigned;

    let value = match column_type {
        ColumnType::Tiny => {
            if unsigned {
                CellValue::UInt8(cursor.read_u8()?)
            } else {
                CellValue::Int8(cursor.read_i8()?)
            }
        }
        ColumnType::Short => {
            if unsigned {
                CellValue::UInt16(cursor.read_u16::<LittleEndian>()?)
            } else {
                CellValue::Int16(cursor.read_i16::<LittleEndian>()?)
            }
        }
        ColumnType::Int24 => {
            if unsigned {
                CellValue::UInt32(cursor.read_u24::<LittleEndian>()?)
            } else {
                CellValue::Int32(cursor.read_i24::<LittleEndian>()?)
            }
        }
        ColumnType::Long => {
            if unsigned {
                CellValue::UInt32(cursor.read_u32::<LittleEndian>()?)
            } else {
                CellValue::Int32(cursor.read_i32::<LittleEndian>()?)
            }
        }
        ColumnType::LongLong => {
            if unsigned {
                CellValue::UInt64(cursor.read_u64::<LittleEndian>()?)
            } else {
                CellValue::Int64(cursor.read_i64::<LittleEndian>()?)
            }
        }
        ColumnType::Float => CellValue::Float(cursor.read_f32::<LittleEndian>()?),
        ColumnType::Double => CellValue::Double(cursor.read_f64::<LittleEndian>()?),
        ColumnType::Null => CellValue::Null,
        ColumnType::NewDecimal => {
            let precision = (meta >> 8) as usize;
            let scale = (meta & 0xff) as usize;
            CellValue::Decimal(decode_decimal(cursor, precision, scale)?)
        }
        ColumnType::Decimal => {
            return Err(CdcError::ParseError(
                "Pre-5.0 DECIMAL columns are not supported".to_string(),
            ))
        }
        ColumnType::Year => {
            let year = cursor.read_u8()?;
            CellValue::Year(if year == 0 { 0 } else { 1900 + year as u16 })
        }
        ColumnType::Date | ColumnType::NewDate => {
            let packed = cursor.read_u24::<LittleEndian>()?;
            date_value(packed >> 9, (packed >> 5) & 0x0f, packed & 0x1f)
        }
        ColumnType::Time => {
            let packed = cursor.read_i24::<LittleEndian>()?;
            let abs = packed.unsigned_abs();
            CellValue::Time(MysqlTime {
                negative: packed < 0,
                hours: abs / 10000,
                minutes: ((abs / 100) % 100) as u8,
                seconds: (abs % 100) as u8,
                micros: 0,
            })
        }
        ColumnType::DateTime => {
            let packed = cursor.read_u64::<LittleEndian>()?;
            if packed == 0 {
                CellValue::ZeroDateTime
            } else {
                let date = packed / 1_000_000;
                let time = packed % 1_000_000;
                datetime_value(
                    (date / 10000) as u32,
                    ((date / 100) % 100) as u32,
                    (date % 100) as u32,
                    (time / 10000) as u32,
                    ((time / 100) % 100) as u32,
                    (time % 100) as u32,
                    0,
                )
            }
        }
        ColumnType::Timestamp => {
            let seconds = cursor.read_u32::<LittleEndian>()?;
            timestamp_value(seconds, 0)
        }
        ColumnType::Timestamp2 => {
            let seconds = cursor.read_u32::<BigEndian>()?;
            let micros = read_fraction(cursor, meta as u8)?;
            timestamp_value(seconds, micros)
        }
        ColumnType::DateTime2 => {
            // 5바이트 big-endian, 부호 비트 바이어스
            let int_part = cursor.read_uint::<BigEndian>(5)? as i64 - 0x80_0000_0000;
            let micros = read_fraction(cursor, meta as u8)?;
            let ymd = int_part >> 17;
            let ym = ymd >> 5;
            let hms = int_part % (1 << 17);
            datetime_value(
                (ym / 13) as u32,
                (ym % 13) as u32,
                (ymd % (1 << 5)) as u32,
                (hms >> 12) as u32,
                ((hms >> 6) % (1 << 6)) as u32,
                (hms % (1 << 6)) as u32,
                micros,
            )
        }
        ColumnType::Time2 => CellValue::Time(unpack_time(read_time2_packed(cursor, meta as u8)?)),
        ColumnType::Varchar | ColumnType::VarString => {
            let len = if meta < 256 {
                cursor.read_u8()? as usize
            } else {
                cursor.read_u16::<LittleEndian>()? as usize
            };
            text_value(read_bytes(cursor, len)?, column.charset.as_deref())
        }
        ColumnType::String => {
            let (real_type, max_len) = string_real_type(meta);
            if real_type == ColumnType::Enum as u8 {
                read_enum(cursor, max_len)?
            } else if real_type == ColumnType::Set as u8 {
                CellValue::Set(cursor.read_uint::<LittleEndian>(max_len.clamp(1, 8) as usize)?)
            } else {
                let len = if max_len < 256 {
                    cursor.read_u8()? as usize
                } else {
                    cursor.read_u16::<LittleEndian>()? as usize
                };
                text_value(read_bytes(cursor, len)?, column.charset.as_deref())
            }
        }
        ColumnType::Enum => read_enum(cursor, meta & 0xff)?,
        ColumnType::Set => {
            CellValue::Set(cursor.read_uint::<LittleEndian>((meta & 0xff).clamp(1, 8) as usize)?)
        }
        ColumnType::Bit => {
            let bits = (meta >> 8) as usize * 8 + (meta & 0xff) as usize;
            let len = (bits + 7) / 8;
            if len == 0 || len > 8 {
                return Err(CdcError::ParseError(format!("Invalid BIT width {}", bits)));
            }
            CellValue::Bit(cursor.read_uint::<BigEndian>(len)?)
        }
        ColumnType::TinyBlob | ColumnType::MediumBlob | ColumnType::LongBlob | ColumnType::Blob => {
            let bytes = read_length_prefixed(cursor, meta)?;
            match column.charset.as_deref() {
                None | Some("binary") => CellValue::Bytes(bytes),
                charset => text_value(bytes, charset),
            }
        }
        ColumnType::Geometry => CellValue::Bytes(read_length_prefixed(cursor, meta)?),
        ColumnType::Json => {
            let bytes = read_length_prefixed(cursor, meta)?;
            CellValue::Json(crate::json::decode(&bytes)?)
        }
    };

    Ok(value)
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    let remaining = cursor
        .get_ref()
        .len()
        .saturating_sub(cursor.position() as usize);
    if len > remaining {
        return Err(CdcError::ParseError(format!(
            "value length {} exceeds remaining {} bytes",
            len, remaining
        )));
    }
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// BLOB/JSON/GEOMETRY: 메타데이터가 길이 접두어의 바이트 수 (1~4)
fn read_length_prefixed(cursor: &mut Cursor<&[u8]>, meta: u16) -> Result<Vec<u8>> {
    let prefix = meta as usize;
    if !(1..=4).contains(&prefix) {
        return Err(CdcError::ParseError(format!(
            "Invalid length prefix size {}",
            prefix
        )));
    }
    let len = cursor.read_uint::<LittleEndian>(prefix)? as usize;
    read_bytes(cursor, len)
}

fn read_enum(cursor: &mut Cursor<&[u8]>, size: u16) -> Result<CellValue> {
    match size {
        1 => Ok(CellValue::Enum(cursor.read_u8()? as u16)),
        2 => Ok(CellValue::Enum(cursor.read_u16::<LittleEndian>()?)),
        other => Err(CdcError::ParseError(format!("Invalid ENUM size {}", other))),
    }
}

/// charset에 따라 문자열/바이트 결정
fn text_value(bytes: Vec<u8>, charset: Option<&str>) -> CellValue {
    match charset {
        Some("binary") => CellValue::Bytes(bytes),
        Some("latin1") => CellValue::String(bytes.iter().map(|b| *b as char).collect()),
        _ => match String::from_utf8(bytes) {
            Ok(text) => CellValue::String(text),
            Err(e) => CellValue::Bytes(e.into_bytes()),
        },
    }
}

/// collation id -> charset 이름
pub fn charset_for_collation(collation_id: u16) -> &'static str {
    match collation_id {
        63 => "binary",
        5 | 8 | 15 | 31 | 47 | 48 | 49 | 94 => "latin1",
        11 | 65 => "ascii",
        33 | 83 | 192..=215 | 223 => "utf8",
        45 | 46 | 224..=247 | 255..=323 => "utf8mb4",
        _ => "utf8mb4",
    }
}

/// 소수 초 (fsp 0~6). 저장 바이트 수는 (fsp + 1) / 2
fn read_fraction(cursor: &mut Cursor<&[u8]>, fsp: u8) -> Result<u32> {
    let value = match fsp {
        0 => 0,
        1 | 2 => cursor.read_u8()? as u32 * 10_000,
        3 | 4 => cursor.read_u16::<BigEndian>()? as u32 * 100,
        5 | 6 => cursor.read_u24::<BigEndian>()?,
        other => return Err(CdcError::ParseError(format!("Invalid fsp {}", other))),
    };
    Ok(value)
}

/// TIME2 -> packed i64 (상위 비트 시:분:초, 하위 24비트 마이크로초)
fn read_time2_packed(cursor: &mut Cursor<&[u8]>, fsp: u8) -> Result<i64> {
    const TIMEF_INT_OFS: i64 = 0x80_0000;
    const TIMEF_OFS: i64 = 0x8000_0000_0000;

    let packed = match fsp {
        0 => (cursor.read_u24::<BigEndian>()? as i64 - TIMEF_INT_OFS) << 24,
        1 | 2 => {
            let mut int_part = cursor.read_u24::<BigEndian>()? as i64 - TIMEF_INT_OFS;
            let mut frac = cursor.read_i8()? as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x100;
            }
            (int_part << 24) + frac * 10_000
        }
        3 | 4 => {
            let mut int_part = cursor.read_u24::<BigEndian>()? as i64 - TIMEF_INT_OFS;
            let mut frac = cursor.read_i16::<BigEndian>()? as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x10000;
            }
            (int_part << 24) + frac * 100
        }
        5 | 6 => cursor.read_u48::<BigEndian>()? as i64 - TIMEF_OFS,
        other => return Err(CdcError::ParseError(format!("Invalid fsp {}", other))),
    };
    Ok(packed)
}

/// packed TIME 값을 시:분:초로 분해 (JSON opaque TIME도 같은 형식)
pub(crate) fn unpack_time(packed: i64) -> MysqlTime {
    let negative = packed < 0;
    let abs = packed.unsigned_abs();
    let hms = abs >> 24;
    MysqlTime {
        negative,
        hours: ((hms >> 12) % (1 << 10)) as u32,
        minutes: ((hms >> 6) % (1 << 6)) as u8,
        seconds: (hms % (1 << 6)) as u8,
        micros: (abs % (1 << 24)) as u32,
    }
}

/// packed DATETIME 값을 CellValue로 (JSON opaque DATETIME/DATE에서 사용)
pub(crate) fn unpack_datetime(packed: i64) -> CellValue {
    let abs = packed.unsigned_abs();
    let ymdhms = abs >> 24;
    let ymd = ymdhms >> 17;
    let ym = ymd >> 5;
    let hms = ymdhms % (1 << 17);
    datetime_value(
        (ym / 13) as u32,
        (ym % 13) as u32,
        (ymd % (1 << 5)) as u32,
        (hms >> 12) as u32,
        ((hms >> 6) % (1 << 6)) as u32,
        (hms % (1 << 6)) as u32,
        (abs % (1 << 24)) as u32,
    )
}

fn date_value(year: u32, month: u32, day: u32) -> CellValue {
    if year == 0 && month == 0 && day == 0 {
        return CellValue::ZeroDate;
    }
    match NaiveDate::from_ymd_opt(year as i32, month, day) {
        Some(date) => CellValue::Date(date),
        None => CellValue::Temporal(format!("{:04}-{:02}-{:02}", year, month, day)),
    }
}

fn datetime_value(
    year: u32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
    micros: u32,
) -> CellValue {
    if year == 0 && month == 0 && day == 0 && hour == 0 && minute == 0 && second == 0 && micros == 0
    {
        return CellValue::ZeroDateTime;
    }
    let datetime = NaiveDate::from_ymd_opt(year as i32, month, day)
        .and_then(|date| date.and_hms_micro_opt(hour, minute, second, micros));
    match datetime {
        Some(datetime) => CellValue::DateTime(datetime),
        None => {
            let mut text = format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                year, month, day, hour, minute, second
            );
            if micros > 0 {
                text.push_str(&format!(".{:06}", micros));
            }
            CellValue::Temporal(text)
        }
    }
}

fn timestamp_value(seconds: u32, micros: u32) -> CellValue {
    if seconds == 0 && micros == 0 {
        return CellValue::ZeroDateTime;
    }
    match DateTime::<Utc>::from_timestamp(seconds as i64, micros * 1000) {
        Some(ts) => CellValue::Timestamp(ts),
        None => CellValue::Temporal(format!("{}.{:06}", seconds, micros)),
    }
}

const DIG_PER_WORD: usize = 9;
const DIG2BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

/// NEWDECIMAL 바이너리 표현 -> 10진 문자열
///
/// 9자리마다 4바이트 big-endian 워드, 남는 자리수는 DIG2BYTES 만큼.
/// 음수는 전체 비트 반전, 부호 비트는 첫 바이트 최상위 비트를 뒤집어 저장합니다.
pub fn decode_decimal(cursor: &mut Cursor<&[u8]>, precision: usize, scale: usize) -> Result<String> {
    if precision == 0 || scale > precision || precision > 65 {
        return Err(CdcError::ParseError(format!(
            "Invalid decimal precision/scale {}/{}",
            precision, scale
        )));
    }

    let int_digits = precision - scale;
    let int_words = int_digits / DIG_PER_WORD;
    let int_leftover = int_digits % DIG_PER_WORD;
    let frac_words = scale / DIG_PER_WORD;
    let frac_leftover = scale % DIG_PER_WORD;

    let size = int_words * 4 + DIG2BYTES[int_leftover] + frac_words * 4 + DIG2BYTES[frac_leftover];
    let mut buf = read_bytes(cursor, size)?;

    let negative = buf[0] & 0x80 == 0;
    buf[0] ^= 0x80;
    if negative {
        for byte in buf.iter_mut() {
            *byte = !*byte;
        }
    }

    let mut reader = Cursor::new(buf.as_slice());
    let mut int_part = String::new();

    if int_leftover > 0 {
        let value = reader.read_uint::<BigEndian>(DIG2BYTES[int_leftover])?;
        int_part.push_str(&value.to_string());
    }
    for _ in 0..int_words {
        let value = reader.read_u32::<BigEndian>()?;
        if int_part.is_empty() {
            int_part.push_str(&value.to_string());
        } else {
            int_part.push_str(&format!("{:09}", value));
        }
    }

    let trimmed = int_part.trim_start_matches('0');
    let mut text = String::new();
    if negative {
        text.push('-');
    }
    text.push_str(if trimmed.is_empty() { "0" } else { trimmed });

    if scale > 0 {
        text.push('.');
        for _ in 0..frac_words {
            let value = reader.read_u32::<BigEndian>()?;
            text.push_str(&format!("{:09}", value));
        }
        if frac_leftover > 0 {
            let value = reader.read_uint::<BigEndian>(DIG2BYTES[frac_leftover])?;
            text.push_str(&format!("{:0width$}", value, width = frac_leftover));
        }
    }

    Ok(text)
}
