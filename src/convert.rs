//! 디코딩된 이벤트를 엔트리로 변환

use crate::binlog::{DecodeContext, TableMapping};
use crate::entry::{Column, Entry, EntryHeader, EventKind, RowChange, RowData};
use crate::error::{CdcError, Result};
use crate::events::*;
use crate::metadata::parse_ddl;
use crate::position::LogPosition;
use crate::rows::{CellValue, ColumnDef, RowImage};
use std::cmp::Ordering;
use tracing::trace;

/// 이벤트 -> 엔트리 변환기. 연결 하나에 하나씩 사용
#[derive(Debug, Default)]
pub struct EntryAssembler {
    filter_query_dml: bool,
    /// 마지막 GTID 이벤트 (트랜잭션이 끝날 때까지 유지)
    gtid: Option<String>,
    /// 다음 ROWS 엔트리에 붙일 ROWS_QUERY 원문
    rows_query: Option<String>,
    last_position: Option<LogPosition>,
}

impl EntryAssembler {
    pub fn new(filter_query_dml: bool) -> Self {
        EntryAssembler {
            filter_query_dml,
            ..Default::default()
        }
    }

    /// 재접속 시 호출. 위치 단조 증가 검사는 연결마다 새로 시작
    pub fn reset(&mut self) {
        self.gtid = None;
        self.rows_query = None;
        self.last_position = None;
    }

    pub fn convert(&mut self, event: &LogEvent, ctx: &DecodeContext) -> Result<Vec<Entry>> {
        let entries = match &event.body {
            EventBody::Gtid(gtid) => {
                self.gtid = (!gtid.anonymous).then(|| gtid.gtid());
                Vec::new()
            }
            EventBody::RowsQuery(sql) => {
                self.rows_query = Some(sql.clone());
                Vec::new()
            }
            EventBody::Query(query) => self.convert_query(event, query, ctx),
            EventBody::Xid { xid } => {
                let header = self.header(event, ctx, "", "");
                let entry = Entry::transaction_end(header, Some(*xid), event.header.next_position as u64);
                self.end_transaction();
                vec![entry]
            }
            EventBody::Rows(rows) => {
                let mapping = ctx.table(rows.table_id).ok_or_else(|| {
                    CdcError::MetadataMissing(format!("table id {} has no table map", rows.table_id))
                })?;
                vec![self.convert_rows(event, rows, mapping, ctx)]
            }
            EventBody::Heartbeat { .. } => {
                return Ok(vec![Entry::heartbeat(self.header(event, ctx, "", ""))]);
            }
            _ => Vec::new(),
        };

        if !entries.is_empty() {
            self.check_position(event, ctx)?;
        }
        Ok(entries)
    }

    fn check_position(&mut self, event: &LogEvent, ctx: &DecodeContext) -> Result<()> {
        if event.header.next_position == 0 {
            return Ok(());
        }
        let position = LogPosition::new(ctx.journal_name.clone(), event.header.log_position());
        if let Some(last) = &self.last_position {
            if position.compare(last) != Ordering::Greater {
                return Err(CdcError::ParseError(format!(
                    "position went backwards from {} to {}",
                    last, position
                )));
            }
        }
        self.last_position = Some(position);
        Ok(())
    }

    fn end_transaction(&mut self) {
        self.gtid = None;
        self.rows_query = None;
    }

    fn header(&self, event: &LogEvent, ctx: &DecodeContext, schema: &str, table: &str) -> EntryHeader {
        EntryHeader {
            journal_name: ctx.journal_name.clone(),
            position: event.header.log_position(),
            timestamp: event.header.timestamp as i64 * 1000,
            server_id: event.header.server_id,
            gtid: self.gtid.clone(),
            schema: schema.to_string(),
            table: table.to_string(),
            event_type: None,
            event_length: event.header.event_length,
        }
    }

    fn convert_query(&mut self, event: &LogEvent, query: &QueryEventData, ctx: &DecodeContext) -> Vec<Entry> {
        let sql = query.query.trim();

        if sql.eq_ignore_ascii_case("BEGIN") {
            let header = self.header(event, ctx, &query.database, "");
            return vec![Entry::transaction_begin(header, Some(query.thread_id))];
        }
        if sql.eq_ignore_ascii_case("COMMIT") {
            let header = self.header(event, ctx, &query.database, "");
            let entry = Entry::transaction_end(header, None, event.header.next_position as u64);
            self.end_transaction();
            return vec![entry];
        }

        if let Some(ddl) = parse_ddl(sql) {
            let (schema, table) = ddl.primary_target(&query.database);
            let mut header = self.header(event, ctx, &schema, &table);
            header.event_type = Some(ddl.kind);
            let entry = Entry::row_data(
                header,
                RowChange {
                    kind: ddl.kind,
                    is_ddl: true,
                    sql: Some(sql.to_string()),
                    rows_query: None,
                    rows: Vec::new(),
                },
            );
            // DDL은 암묵적 커밋
            self.end_transaction();
            return vec![entry];
        }

        if self.filter_query_dml {
            trace!("Skipping query event: {}", sql);
            return Vec::new();
        }

        let mut header = self.header(event, ctx, &query.database, "");
        header.event_type = Some(EventKind::Query);
        vec![Entry::row_data(
            header,
            RowChange {
                kind: EventKind::Query,
                is_ddl: false,
                sql: Some(sql.to_string()),
                rows_query: None,
                rows: Vec::new(),
            },
        )]
    }

    fn convert_rows(
        &mut self,
        event: &LogEvent,
        rows: &RowsData,
        mapping: &TableMapping,
        ctx: &DecodeContext,
    ) -> Entry {
        let kind = match rows.kind {
            RowsKind::Write => EventKind::Insert,
            RowsKind::Update => EventKind::Update,
            RowsKind::Delete => EventKind::Delete,
        };

        let data = rows
            .rows
            .iter()
            .map(|pair| {
                let before = pair
                    .before
                    .as_ref()
                    .map(|image| columns(mapping, image, None, false))
                    .unwrap_or_default();
                let after = pair
                    .after
                    .as_ref()
                    .map(|image| columns(mapping, image, pair.before.as_ref(), true))
                    .unwrap_or_default();
                RowData { before, after }
            })
            .collect();

        let mut header = self.header(event, ctx, &rows.database, &rows.table);
        header.event_type = Some(kind);
        Entry::row_data(
            header,
            RowChange {
                kind,
                is_ddl: false,
                sql: None,
                rows_query: self.rows_query.take(),
                rows: data,
            },
        )
    }
}

/// 이미지에 포함된 컬럼만 변환. `updated`는 이전 이미지와 값이 다를 때 true
fn columns(mapping: &TableMapping, image: &RowImage, before: Option<&RowImage>, is_after: bool) -> Vec<Column> {
    image
        .cells
        .iter()
        .enumerate()
        .filter_map(|(index, cell)| {
            let value = cell.clone()?;
            let def = mapping.columns.get(index);
            let updated = is_after
                && match before {
                    Some(before) => before.get(index) != Some(&value),
                    None => true,
                };
            Some(Column {
                index,
                name: mapping.column_name(index),
                mysql_type: def.map(ColumnDef::type_name).unwrap_or_default(),
                is_key: def.map_or(false, |d| d.is_key),
                updated,
                is_null: value == CellValue::Null,
                value,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::LogDecoder;
    use crate::entry::EntryType;
    use crate::rows::ColumnType;
    use crate::testkit::*;

    struct Fixture {
        decoder: LogDecoder,
        ctx: DecodeContext,
        assembler: EntryAssembler,
    }

    impl Fixture {
        fn new(filter_query_dml: bool) -> Self {
            let decoder = LogDecoder::new();
            let mut ctx = DecodeContext::with_journal("mysql-bin.000001", 4);
            let fde = event(
                EventType::FormatDescriptionEvent as u8,
                0,
                &format_description_body(true),
                120,
                0,
                true,
            );
            decoder.decode(&fde, &mut ctx).unwrap();
            Fixture {
                decoder,
                ctx,
                assembler: EntryAssembler::new(filter_query_dml),
            }
        }

        fn feed(&mut self, type_code: EventType, body: &[u8], next_position: u32) -> Vec<Entry> {
            let raw = event(type_code as u8, 1_700_000_000, body, next_position, 0, true);
            let decoded = self.decoder.decode(&raw, &mut self.ctx).unwrap();
            self.assembler.convert(&decoded, &self.ctx).unwrap()
        }
    }

    fn users_table(fixture: &mut Fixture) {
        // id INT, name VARCHAR(20) + 컬럼 이름/PK 메타데이터
        let names = [2u8, b'i', b'd', 4, b'n', b'a', b'm', b'e'];
        let mut optional = vec![4u8, names.len() as u8];
        optional.extend_from_slice(&names);
        optional.extend_from_slice(&[8, 1, 0]);
        fixture.feed(
            EventType::TableMapEvent,
            &table_map_body(
                42,
                "shop",
                "users",
                &[ColumnType::Long as u8, ColumnType::Varchar as u8],
                &20u16.to_le_bytes(),
                &optional,
            ),
            300,
        );
    }

    fn user_image(id: i32, name: &str) -> Vec<u8> {
        let mut image = vec![0u8];
        image.extend_from_slice(&id.to_le_bytes());
        image.push(name.len() as u8);
        image.extend_from_slice(name.as_bytes());
        image
    }

    #[test]
    fn test_transaction_entries() {
        let mut fixture = Fixture::new(false);
        let begin = fixture.feed(EventType::QueryEvent, &query_body("shop", "BEGIN"), 200);
        assert_eq!(begin[0].entry_type, EntryType::TransactionBegin);
        assert_eq!(begin[0].transaction.as_ref().unwrap().thread_id, Some(77));
        assert_eq!(begin[0].header.timestamp, 1_700_000_000_000);

        let end = fixture.feed(EventType::XidEvent, &xid_body(9), 400);
        assert_eq!(end[0].entry_type, EntryType::TransactionEnd);
        let tx = end[0].transaction.as_ref().unwrap();
        assert_eq!(tx.xid, Some(9));
        assert_eq!(tx.end_position, Some(400));
        assert_eq!(end[0].resume_position().position, 400);
    }

    #[test]
    fn test_update_entry_before_after() {
        let mut fixture = Fixture::new(false);
        fixture.feed(EventType::QueryEvent, &query_body("shop", "BEGIN"), 200);
        users_table(&mut fixture);
        fixture.feed(EventType::RowsQueryLogEvent, b"\x00UPDATE users SET name='y'", 340);

        let mut images = user_image(1, "x");
        images.extend(user_image(1, "y"));
        let entries = fixture.feed(
            EventType::UpdateRowsEventV2,
            &rows_body(42, 2, &[0b11], Some(&[0b11]), &images),
            500,
        );

        let entry = &entries[0];
        assert_eq!(entry.entry_type, EntryType::RowData);
        assert_eq!(entry.header.event_type, Some(EventKind::Update));
        assert_eq!(entry.qualified_name(), "shop.users");
        let change = entry.row_change.as_ref().unwrap();
        assert_eq!(change.rows_query.as_deref(), Some("UPDATE users SET name='y'"));

        let row = &change.rows[0];
        assert_eq!(row.before[0].name, "id");
        assert_eq!(row.before[0].value, CellValue::Int32(1));
        assert_eq!(row.before[1].value, CellValue::String("x".to_string()));
        assert_eq!(row.after[1].value, CellValue::String("y".to_string()));
        assert!(row.after[0].is_key);
        assert!(!row.after[0].updated);
        assert!(row.after[1].updated);
        assert_eq!(row.after[0].mysql_type, "int");
    }

    #[test]
    fn test_ddl_entry() {
        let mut fixture = Fixture::new(false);
        let entries = fixture.feed(
            EventType::QueryEvent,
            &query_body("shop", "ALTER TABLE users ADD COLUMN age INT"),
            300,
        );
        let entry = &entries[0];
        assert!(entry.is_ddl());
        assert_eq!(entry.header.event_type, Some(EventKind::Alter));
        assert_eq!(entry.qualified_name(), "shop.users");
        assert_eq!(
            entry.row_change.as_ref().unwrap().sql.as_deref(),
            Some("ALTER TABLE users ADD COLUMN age INT")
        );
    }

    #[test]
    fn test_query_dml_filter() {
        let mut fixture = Fixture::new(false);
        let entries = fixture.feed(EventType::QueryEvent, &query_body("shop", "INSERT INTO t VALUES (1)"), 300);
        assert_eq!(entries[0].header.event_type, Some(EventKind::Query));

        let mut fixture = Fixture::new(true);
        let entries = fixture.feed(EventType::QueryEvent, &query_body("shop", "INSERT INTO t VALUES (1)"), 300);
        assert!(entries.is_empty());
    }

    #[test]
    fn test_position_regression_is_parse_error() {
        let mut fixture = Fixture::new(false);
        fixture.feed(EventType::QueryEvent, &query_body("shop", "BEGIN"), 400);

        let raw = event(EventType::QueryEvent as u8, 0, &query_body("shop", "BEGIN"), 300, 0, true);
        let decoded = fixture.decoder.decode(&raw, &mut fixture.ctx).unwrap();
        let err = fixture.assembler.convert(&decoded, &fixture.ctx).unwrap_err();
        assert!(err.is_parse_error());

        fixture.assembler.reset();
        assert!(fixture.assembler.convert(&decoded, &fixture.ctx).is_ok());
    }

    #[test]
    fn test_gtid_attached_until_commit() {
        let mut fixture = Fixture::new(false);
        fixture.feed(EventType::GtidLogEvent, &gtid_body(SERVER_UUID, 3), 180);
        let begin = fixture.feed(EventType::QueryEvent, &query_body("shop", "BEGIN"), 250);
        let expected = format!("{}:3", SERVER_UUID);
        assert_eq!(begin[0].header.gtid.as_deref(), Some(expected.as_str()));

        let end = fixture.feed(EventType::XidEvent, &xid_body(1), 300);
        assert_eq!(end[0].header.gtid.as_deref(), Some(expected.as_str()));

        let next = fixture.feed(EventType::QueryEvent, &query_body("shop", "BEGIN"), 400);
        assert_eq!(next[0].header.gtid, None);
    }
}
