//! 업스트림 binlog 소스
//!
//! [`BinlogSource`]는 원시 이벤트 바이트를 [`RawEventSink`]로 밀어 넣습니다.
//! 복제 프로토콜 프레이밍과 인증은 이 크레이트 밖의 구현이 담당하며,
//! 여기서는 디렉터리의 binlog 파일을 서버처럼 재생하는 [`FileSource`]를 제공합니다.

use crate::binlog::parse_header;
use crate::error::{CdcError, Result};
use crate::events::{EventHeader, EventType, LOG_EVENT_ARTIFICIAL_F};
use crate::format::{ChecksumAlg, FormatDescriptor, LOG_EVENT_HEADER_LEN};
use crate::gtid::GtidSet;
use crate::position::{LogPosition, SourceInfo, BINLOG_START_POSITION};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// binlog 파일 매직 넘버
pub const BINLOG_MAGIC: &[u8] = &[0xfe, 0x62, 0x69, 0x6e];

/// 원시 이벤트 수신자. `false`를 돌려주면 dump가 멈춤
#[async_trait]
pub trait RawEventSink: Send {
    async fn sink(&mut self, raw: Bytes) -> Result<bool>;
}

#[async_trait]
pub trait BinlogSource: Send + Sync {
    /// 접속 후 소스의 현재 상태 조회
    async fn connect(&mut self) -> Result<SourceInfo>;

    /// 파일 + 오프셋부터 전송
    async fn dump(&mut self, journal_name: &str, position: u64, sink: &mut dyn RawEventSink) -> Result<()>;

    /// `gtid_set`에 없는 트랜잭션만 전송
    async fn dump_gtid(&mut self, gtid_set: &GtidSet, sink: &mut dyn RawEventSink) -> Result<()>;

    /// 이 시각(밀리초) 이후 첫 트랜잭션부터 전송
    async fn dump_timestamp(&mut self, timestamp: i64, sink: &mut dyn RawEventSink) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }
}

/// 메모리에 읽어 들인 binlog 파일 하나
struct BinlogFile {
    name: String,
    data: Bytes,
    /// FORMAT_DESCRIPTION 이벤트 (원본 바이트)
    format_event: Bytes,
    format: FormatDescriptor,
    server_id: u32,
}

impl BinlogFile {
    async fn open(path: &Path) -> Result<Self> {
        let data = Bytes::from(tokio::fs::read(path).await?);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if !data.starts_with(BINLOG_MAGIC) {
            return Err(CdcError::ParseError(format!("{} is not a binlog file", name)));
        }

        let (offset, header) = next_event(&data, BINLOG_START_POSITION as usize)?
            .ok_or_else(|| CdcError::ParseError(format!("{} has no format description", name)))?;
        if header.type_code != EventType::FormatDescriptionEvent as u8 {
            return Err(CdcError::ParseError(format!(
                "{} starts with event type {}",
                name, header.type_code
            )));
        }
        let format_event = data.slice(offset..offset + header.event_length as usize);
        let format = FormatDescriptor::parse(&format_event[LOG_EVENT_HEADER_LEN as usize..])?;

        Ok(BinlogFile {
            name,
            server_id: header.server_id,
            data,
            format_event,
            format,
        })
    }

    fn checksum_len(&self) -> usize {
        self.format.checksum_len()
    }

    fn format_end(&self) -> u64 {
        BINLOG_START_POSITION + self.format_event.len() as u64
    }

    /// 공통 헤더와 체크섬을 뗀 본문
    fn body<'a>(&self, raw: &'a [u8]) -> &'a [u8] {
        let end = raw.len().saturating_sub(self.checksum_len());
        raw.get(LOG_EVENT_HEADER_LEN as usize..end).unwrap_or_default()
    }

    /// `from`부터 (오프셋, 헤더, 원본) 순회
    fn events(&self, from: u64) -> impl Iterator<Item = Result<(u64, EventHeader, Bytes)>> + '_ {
        let mut offset = from as usize;
        std::iter::from_fn(move || match next_event(&self.data, offset) {
            Ok(Some((start, header))) => {
                let end = start + header.event_length as usize;
                offset = end;
                Some(Ok((start as u64, header, self.data.slice(start..end))))
            }
            Ok(None) => None,
            Err(e) => {
                offset = self.data.len();
                Some(Err(e))
            }
        })
    }

    /// 실행된 GTID 집합 (PREVIOUS_GTIDS + 이 파일의 GTID 이벤트)
    fn gtid_executed(&self) -> Result<GtidSet> {
        let mut set = GtidSet::new();
        for event in self.events(self.format_end()) {
            let (_, header, raw) = event?;
            let body = self.body(&raw);
            match header.event_type() {
                EventType::PreviousGtidsLogEvent => set.union(&GtidSet::decode(body)?),
                EventType::GtidLogEvent => {
                    if let Some((uuid, sequence)) = gtid_of(body) {
                        set.add(uuid, sequence)?;
                    }
                }
                _ => {}
            }
        }
        Ok(set)
    }

    /// 다음 파일 이름이 있는 ROTATE 본문
    fn rotate_target(&self, raw: &[u8]) -> Option<String> {
        let body = self.body(raw);
        let name = body.get(8..)?;
        (!name.is_empty()).then(|| String::from_utf8_lossy(name).into_owned())
    }
}

/// `offset` 위치 이벤트의 헤더. 파일 끝이거나 쓰는 중인 꼬리면 None
fn next_event(data: &[u8], offset: usize) -> Result<Option<(usize, EventHeader)>> {
    if offset + LOG_EVENT_HEADER_LEN as usize > data.len() {
        return Ok(None);
    }
    let header = parse_header(&data[offset..], LOG_EVENT_HEADER_LEN)?;
    let length = header.event_length as usize;
    if length < LOG_EVENT_HEADER_LEN as usize {
        return Err(CdcError::ParseError(format!(
            "event at {} has invalid length {}",
            offset, length
        )));
    }
    if offset + length > data.len() {
        debug!("Incomplete event at {}, stopping", offset);
        return Ok(None);
    }
    Ok(Some((offset, header)))
}

/// GTID 이벤트 본문의 (uuid, gno)
fn gtid_of(body: &[u8]) -> Option<(Uuid, u64)> {
    let uuid = Uuid::from_slice(body.get(1..17)?).ok()?;
    let gno = u64::from_le_bytes(body.get(17..25)?.try_into().ok()?);
    Some((uuid, gno))
}

/// 서버가 dump 시작 시 보내는 가짜 ROTATE
fn fake_rotate(name: &str, position: u64, server_id: u32, checksum: bool) -> Bytes {
    let length = LOG_EVENT_HEADER_LEN as usize + 8 + name.len() + if checksum { 4 } else { 0 };
    let mut buf = BytesMut::with_capacity(length);
    buf.put_u32_le(0);
    buf.put_u8(EventType::RotateEvent as u8);
    buf.put_u32_le(server_id);
    buf.put_u32_le(length as u32);
    buf.put_u32_le(0);
    buf.put_u16_le(LOG_EVENT_ARTIFICIAL_F);
    buf.put_u64_le(position);
    buf.put_slice(name.as_bytes());
    if checksum {
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
    }
    buf.freeze()
}

/// 중간 위치부터 시작할 때 보내는 FORMAT_DESCRIPTION (next_position 0)
fn detached_format_event(file: &BinlogFile) -> Bytes {
    let mut raw = BytesMut::from(&file.format_event[..]);
    raw[13..17].copy_from_slice(&0u32.to_le_bytes());
    if file.format.checksum_alg == ChecksumAlg::Crc32 {
        let split = raw.len() - 4;
        let crc = crc32fast::hash(&raw[..split]);
        raw[split..].copy_from_slice(&crc.to_le_bytes());
    }
    raw.freeze()
}

/// GTID 필터 상태
enum Skip {
    None,
    Gtids(GtidSet),
}

/// 디렉터리의 binlog 파일을 서버처럼 재생하는 소스
pub struct FileSource {
    dir: PathBuf,
}

impl FileSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileSource { dir: dir.into() }
    }

    /// 파일 시퀀스 순서의 binlog 파일 이름
    async fn list_files(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if LogPosition::new(name.clone(), 0).file_sequence().is_some() {
                names.push(name);
            }
        }
        names.sort_by(|a, b| LogPosition::new(a.clone(), 0).compare(&LogPosition::new(b.clone(), 0)));
        if names.is_empty() {
            return Err(CdcError::StreamError(format!(
                "no binlog files in {}",
                self.dir.display()
            )));
        }
        Ok(names)
    }

    async fn open(&self, name: &str) -> Result<Option<BinlogFile>> {
        let path = self.dir.join(name);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        BinlogFile::open(&path).await.map(Some)
    }

    async fn stream(
        &self,
        journal_name: &str,
        position: u64,
        skip: Skip,
        sink: &mut dyn RawEventSink,
    ) -> Result<()> {
        let mut file = self.open(journal_name).await?.ok_or_else(|| {
            CdcError::PositionNotFound(format!("binlog file {} not found", journal_name))
        })?;
        let mut position = position.max(BINLOG_START_POSITION);
        let mut skipping = false;

        loop {
            info!("Replaying {} from {}", file.name, position);
            let checksum = file.format.checksum_alg == ChecksumAlg::Crc32;
            let rotate = fake_rotate(&file.name, position, file.server_id, checksum);
            if !sink.sink(rotate).await? {
                return Ok(());
            }

            let format_event = if position <= BINLOG_START_POSITION {
                file.format_event.clone()
            } else {
                detached_format_event(&file)
            };
            if !sink.sink(format_event).await? {
                return Ok(());
            }

            let mut next_file = None;
            for event in file.events(position.max(file.format_end())) {
                let (_, header, raw) = event?;
                let event_type = header.event_type();

                if let Skip::Gtids(executed) = &skip {
                    match event_type {
                        EventType::GtidLogEvent => {
                            skipping = gtid_of(file.body(&raw))
                                .map_or(false, |(uuid, seq)| executed.contains(&uuid, seq));
                        }
                        EventType::AnonymousGtidLogEvent
                        | EventType::RotateEvent
                        | EventType::PreviousGtidsLogEvent
                        | EventType::StopEvent => skipping = false,
                        _ => {}
                    }
                    if skipping {
                        continue;
                    }
                }

                if event_type == EventType::RotateEvent {
                    next_file = file.rotate_target(&raw);
                }
                if !sink.sink(raw).await? {
                    return Ok(());
                }
                if next_file.is_some() {
                    break;
                }
            }

            let Some(name) = next_file else {
                info!("Reached end of {}", file.name);
                return Ok(());
            };
            match self.open(&name).await? {
                Some(next) => {
                    file = next;
                    position = BINLOG_START_POSITION;
                }
                None => {
                    info!("Next binlog {} not present, replay finished", name);
                    return Ok(());
                }
            }
        }
    }
}

#[async_trait]
impl BinlogSource for FileSource {
    async fn connect(&mut self) -> Result<SourceInfo> {
        let names = self.list_files().await?;
        let last = names.last().cloned().unwrap_or_default();
        let file = self
            .open(&last)
            .await?
            .ok_or_else(|| CdcError::StreamError(format!("{} disappeared", last)))?;
        let gtids = file.gtid_executed()?;

        let info = SourceInfo {
            server_id: file.server_id,
            server_version: file.format.server_version.clone(),
            journal_name: file.name.clone(),
            position: file.data.len() as u64,
            gtid_executed: (!gtids.is_empty()).then(|| gtids.to_string()),
            checksum_alg: file.format.checksum_alg,
        };
        info!("Connected to binlog directory {}: {}", self.dir.display(), info);
        Ok(info)
    }

    async fn dump(&mut self, journal_name: &str, position: u64, sink: &mut dyn RawEventSink) -> Result<()> {
        self.stream(journal_name, position, Skip::None, sink).await
    }

    async fn dump_gtid(&mut self, gtid_set: &GtidSet, sink: &mut dyn RawEventSink) -> Result<()> {
        let names = self.list_files().await?;
        let first = &names[0];
        self.stream(first, BINLOG_START_POSITION, Skip::Gtids(gtid_set.clone()), sink)
            .await
    }

    async fn dump_timestamp(&mut self, timestamp: i64, sink: &mut dyn RawEventSink) -> Result<()> {
        let seconds = (timestamp + 999) / 1000;
        for name in self.list_files().await? {
            let Some(file) = self.open(&name).await? else {
                continue;
            };

            let mut after_gtid = false;
            let mut found = None;
            for event in file.events(file.format_end()) {
                let (offset, header, _) = event?;
                let event_type = header.event_type();
                let starts_transaction = match event_type {
                    EventType::GtidLogEvent | EventType::AnonymousGtidLogEvent => true,
                    EventType::QueryEvent => !after_gtid,
                    _ => false,
                };
                if starts_transaction && header.timestamp as i64 >= seconds {
                    found = Some(offset);
                    break;
                }
                after_gtid = matches!(
                    event_type,
                    EventType::GtidLogEvent | EventType::AnonymousGtidLogEvent
                ) || (after_gtid && event_type != EventType::XidEvent);
            }

            if let Some(offset) = found {
                debug!("Timestamp {} resolved to {}:{}", timestamp, name, offset);
                return self.stream(&name, offset, Skip::None, sink).await;
            }
        }

        warn!("No transaction at or after timestamp {}", timestamp);
        Err(CdcError::PositionNotFound(format!(
            "no transaction at or after timestamp {}",
            timestamp
        )))
    }
}
