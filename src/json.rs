//! MySQL 바이너리 JSON 디코딩
//!
//! JSON 컬럼은 binlog에 텍스트가 아닌 MySQL 전용 바이너리 포맷으로 기록됩니다.
//! 첫 바이트가 값 타입, 이후 타입별 인코딩이 이어집니다.
//! 객체/배열 내부 오프셋은 해당 객체/배열 본문 시작(타입 바이트 다음) 기준입니다.

use crate::error::{CdcError, Result};
use crate::rows::{decode_decimal, unpack_datetime, unpack_time, CellValue, ColumnType};
use byteorder::{ByteOrder, LittleEndian};
use serde_json::{Map, Number, Value};
use std::io::Cursor;

const SMALL_OBJECT: u8 = 0x00;
const LARGE_OBJECT: u8 = 0x01;
const SMALL_ARRAY: u8 = 0x02;
const LARGE_ARRAY: u8 = 0x03;
const LITERAL: u8 = 0x04;
const INT16: u8 = 0x05;
const UINT16: u8 = 0x06;
const INT32: u8 = 0x07;
const UINT32: u8 = 0x08;
const INT64: u8 = 0x09;
const UINT64: u8 = 0x0a;
const DOUBLE: u8 = 0x0b;
const STRING: u8 = 0x0c;
const OPAQUE: u8 = 0x0f;

const LITERAL_NULL: u8 = 0x00;
const LITERAL_TRUE: u8 = 0x01;
const LITERAL_FALSE: u8 = 0x02;

/// JSON 컬럼 값 전체를 디코딩. 빈 값은 JSON null
pub fn decode(data: &[u8]) -> Result<Value> {
    if data.is_empty() {
        return Ok(Value::Null);
    }
    parse_value(data[0], &data[1..])
}

fn malformed(what: &str) -> CdcError {
    CdcError::ParseError(format!("malformed binary JSON: {}", what))
}

fn slice(data: &[u8], start: usize, len: usize) -> Result<&[u8]> {
    data.get(start..start.saturating_add(len))
        .ok_or_else(|| malformed("offset out of bounds"))
}

fn parse_value(value_type: u8, data: &[u8]) -> Result<Value> {
    match value_type {
        SMALL_OBJECT => parse_object(data, false),
        LARGE_OBJECT => parse_object(data, true),
        SMALL_ARRAY => parse_array(data, false),
        LARGE_ARRAY => parse_array(data, true),
        LITERAL => parse_literal(*data.first().ok_or_else(|| malformed("literal"))?),
        INT16 => Ok(Value::from(LittleEndian::read_i16(slice(data, 0, 2)?))),
        UINT16 => Ok(Value::from(LittleEndian::read_u16(slice(data, 0, 2)?))),
        INT32 => Ok(Value::from(LittleEndian::read_i32(slice(data, 0, 4)?))),
        UINT32 => Ok(Value::from(LittleEndian::read_u32(slice(data, 0, 4)?))),
        INT64 => Ok(Value::from(LittleEndian::read_i64(slice(data, 0, 8)?))),
        UINT64 => Ok(Value::from(LittleEndian::read_u64(slice(data, 0, 8)?))),
        DOUBLE => {
            let v = LittleEndian::read_f64(slice(data, 0, 8)?);
            Ok(Number::from_f64(v).map_or(Value::Null, Value::Number))
        }
        STRING => {
            let (len, prefix) = read_variable_length(data)?;
            let bytes = slice(data, prefix, len)?;
            Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
        }
        OPAQUE => parse_opaque(data),
        other => Err(malformed(&format!("unknown value type {:#04x}", other))),
    }
}

fn parse_literal(literal: u8) -> Result<Value> {
    match literal {
        LITERAL_NULL => Ok(Value::Null),
        LITERAL_TRUE => Ok(Value::Bool(true)),
        LITERAL_FALSE => Ok(Value::Bool(false)),
        other => Err(malformed(&format!("unknown literal {}", other))),
    }
}

fn read_offset(data: &[u8], pos: usize, large: bool) -> Result<usize> {
    if large {
        Ok(LittleEndian::read_u32(slice(data, pos, 4)?) as usize)
    } else {
        Ok(LittleEndian::read_u16(slice(data, pos, 2)?) as usize)
    }
}

fn parse_object(data: &[u8], large: bool) -> Result<Value> {
    let offset_size = if large { 4 } else { 2 };
    let count = read_offset(data, 0, large)?;
    let size = read_offset(data, offset_size, large)?;
    if size > data.len() {
        return Err(malformed("object size exceeds value"));
    }
    let data = &data[..size];

    let key_entries = offset_size * 2;
    let key_entry_size = offset_size + 2;
    let value_entries = key_entries + count * key_entry_size;
    let value_entry_size = offset_size + 1;

    let mut map = Map::with_capacity(count);
    for i in 0..count {
        let entry = key_entries + i * key_entry_size;
        let key_offset = read_offset(data, entry, large)?;
        let key_len = LittleEndian::read_u16(slice(data, entry + offset_size, 2)?) as usize;
        let key = String::from_utf8_lossy(slice(data, key_offset, key_len)?).into_owned();

        let value = parse_entry(data, value_entries + i * value_entry_size, large)?;
        map.insert(key, value);
    }

    Ok(Value::Object(map))
}

fn parse_array(data: &[u8], large: bool) -> Result<Value> {
    let offset_size = if large { 4 } else { 2 };
    let count = read_offset(data, 0, large)?;
    let size = read_offset(data, offset_size, large)?;
    if size > data.len() {
        return Err(malformed("array size exceeds value"));
    }
    let data = &data[..size];

    let value_entries = offset_size * 2;
    let value_entry_size = offset_size + 1;

    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        values.push(parse_entry(data, value_entries + i * value_entry_size, large)?);
    }

    Ok(Value::Array(values))
}

/// 값 엔트리: 타입(1) + 인라인 값 또는 오프셋
fn parse_entry(data: &[u8], entry: usize, large: bool) -> Result<Value> {
    let value_type = *data.get(entry).ok_or_else(|| malformed("value entry"))?;
    let inline = entry + 1;

    match value_type {
        LITERAL => parse_literal(*data.get(inline).ok_or_else(|| malformed("literal"))?),
        INT16 | UINT16 => parse_value(value_type, slice(data, inline, 2)?),
        INT32 | UINT32 if large => parse_value(value_type, slice(data, inline, 4)?),
        _ => {
            let offset = read_offset(data, inline, large)?;
            if offset >= data.len() {
                return Err(malformed("value offset out of bounds"));
            }
            parse_value(value_type, &data[offset..])
        }
    }
}

/// 7비트씩 이어지는 가변 길이 정수 (최대 5바이트)
fn read_variable_length(data: &[u8]) -> Result<(usize, usize)> {
    let mut len = 0usize;
    for i in 0..5 {
        let byte = *data.get(i).ok_or_else(|| malformed("variable length"))?;
        len |= ((byte & 0x7f) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((len, i + 1));
        }
    }
    Err(malformed("variable length too long"))
}

/// OPAQUE: MySQL 컬럼 타입(1) + 가변 길이 + 원본 바이트
fn parse_opaque(data: &[u8]) -> Result<Value> {
    let column_type = *data.first().ok_or_else(|| malformed("opaque type"))?;
    let (len, prefix) = read_variable_length(&data[1..])?;
    let payload = slice(data, 1 + prefix, len)?;

    match ColumnType::from_u8(column_type) {
        Some(ColumnType::NewDecimal) if payload.len() >= 2 => {
            let precision = payload[0] as usize;
            let scale = payload[1] as usize;
            let mut cursor = Cursor::new(&payload[2..]);
            let text = decode_decimal(&mut cursor, precision, scale)?;
            // 정밀도 보존이 필요하면 문자열로
            Ok(text
                .parse::<f64>()
                .ok()
                .filter(|v| v.to_string() == text)
                .and_then(Number::from_f64)
                .map_or(Value::String(text), Value::Number))
        }
        Some(ColumnType::Date) if payload.len() >= 8 => {
            let value = unpack_datetime(LittleEndian::read_i64(payload));
            let text = value.to_string();
            Ok(Value::String(text.split(' ').next().unwrap_or_default().to_string()))
        }
        Some(ColumnType::DateTime | ColumnType::Timestamp | ColumnType::DateTime2 | ColumnType::Timestamp2)
            if payload.len() >= 8 =>
        {
            let value = unpack_datetime(LittleEndian::read_i64(payload));
            Ok(Value::String(match value {
                CellValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
                other => other.to_string(),
            }))
        }
        Some(ColumnType::Time | ColumnType::Time2) if payload.len() >= 8 => {
            let time = unpack_time(LittleEndian::read_i64(payload));
            Ok(Value::String(time.to_string()))
        }
        _ => Ok(Value::String(String::from_utf8_lossy(payload).into_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalars() {
        assert_eq!(decode(&[]).unwrap(), Value::Null);
        assert_eq!(decode(&[LITERAL, LITERAL_TRUE]).unwrap(), json!(true));
        assert_eq!(decode(&[INT16, 0xfe, 0xff]).unwrap(), json!(-2));
        assert_eq!(decode(&[UINT16, 0xff, 0xff]).unwrap(), json!(65535));
        assert_eq!(decode(&[STRING, 3, b'a', b'b', b'c']).unwrap(), json!("abc"));

        let mut double = vec![DOUBLE];
        double.extend_from_slice(&1.5f64.to_le_bytes());
        assert_eq!(decode(&double).unwrap(), json!(1.5));
    }

    #[test]
    fn test_small_object() {
        // {"a": 1, "b": "xy"}
        let mut body = Vec::new();
        body.extend_from_slice(&2u16.to_le_bytes()); // count
        body.extend_from_slice(&0u16.to_le_bytes()); // size (나중에 채움)
        // key entries: 헤더 4 + 키 엔트리 8 + 값 엔트리 6 = 18
        body.extend_from_slice(&18u16.to_le_bytes());
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(&19u16.to_le_bytes());
        body.extend_from_slice(&1u16.to_le_bytes());
        // value entries
        body.push(INT16);
        body.extend_from_slice(&1u16.to_le_bytes());
        body.push(STRING);
        body.extend_from_slice(&20u16.to_le_bytes());
        // keys
        body.push(b'a');
        body.push(b'b');
        // string value
        body.extend_from_slice(&[2, b'x', b'y']);
        let size = body.len() as u16;
        body[2..4].copy_from_slice(&size.to_le_bytes());

        let mut data = vec![SMALL_OBJECT];
        data.extend_from_slice(&body);
        assert_eq!(decode(&data).unwrap(), json!({"a": 1, "b": "xy"}));
    }

    #[test]
    fn test_small_array() {
        // [null, false, 7]
        let mut body = Vec::new();
        body.extend_from_slice(&3u16.to_le_bytes());
        body.extend_from_slice(&13u16.to_le_bytes());
        body.push(LITERAL);
        body.extend_from_slice(&[LITERAL_NULL, 0]);
        body.push(LITERAL);
        body.extend_from_slice(&[LITERAL_FALSE, 0]);
        body.push(UINT16);
        body.extend_from_slice(&7u16.to_le_bytes());

        let mut data = vec![SMALL_ARRAY];
        data.extend_from_slice(&body);
        assert_eq!(decode(&data).unwrap(), json!([null, false, 7]));
    }

    #[test]
    fn test_opaque_decimal() {
        // DECIMAL(4,2) 12.50
        // 정수부 2자리 1바이트 + 소수부 2자리 1바이트, 부호 비트 포함
        let data = vec![OPAQUE, ColumnType::NewDecimal as u8, 4, 4, 2, 0x80 | 12, 50];
        assert_eq!(decode(&data).unwrap(), json!("12.50"));
    }

    #[test]
    fn test_truncated_is_parse_error() {
        let err = decode(&[SMALL_OBJECT, 5, 0]).unwrap_err();
        assert!(err.is_parse_error());
    }
}
