//! binlog 파이프라인 구동
//!
//! 소스 접속 -> 시작 위치 결정 -> dump -> 디코딩 -> 엔트리 변환 -> 싱크 순서로 진행합니다.
//! 스트림 에러는 백오프 후 마지막으로 스토어에 들어간 트랜잭션 끝에서 다시 읽고,
//! 파싱 에러는 디코드 컨텍스트를 초기화한 뒤 같은 방식으로 재접속합니다.

use crate::binlog::{DecodeContext, LogDecoder};
use crate::config::ParserConfig;
use crate::convert::EntryAssembler;
use crate::entry::Entry;
use crate::error::{CdcError, Result};
use crate::events::LogEvent;
use crate::gtid::GtidSet;
use crate::metadata::TableMetaSource;
use crate::position::{LogIdentity, LogPosition, PositionManager, SourceInfo, StartPosition};
use crate::sink::EntryEventSink;
use crate::source::{BinlogSource, RawEventSink};
use async_trait::async_trait;
use bytes::Bytes;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 다음 dump 방식
#[derive(Debug, Clone)]
enum Seek {
    File {
        journal_name: String,
        position: u64,
        /// 이 위치 이하의 엔트리는 이미 처리됨
        skip_until: Option<LogPosition>,
    },
    Gtid(GtidSet),
    Timestamp(i64),
}

pub struct BinlogParser {
    config: ParserConfig,
    source: Box<dyn BinlogSource>,
    decoder: LogDecoder,
    sink: Arc<EntryEventSink>,
    positions: Arc<dyn PositionManager>,
    identity: LogIdentity,
}

impl BinlogParser {
    pub fn new(
        config: ParserConfig,
        source: Box<dyn BinlogSource>,
        sink: Arc<EntryEventSink>,
        positions: Arc<dyn PositionManager>,
    ) -> Self {
        let decoder = LogDecoder::new().with_checksum_verification(config.verify_checksum);
        let identity = LogIdentity::new(config.destination.clone(), config.slave_id);
        BinlogParser {
            config,
            source,
            decoder,
            sink,
            positions,
            identity,
        }
    }

    pub fn with_meta_source(mut self, source: Arc<dyn TableMetaSource>) -> Self {
        self.decoder = self.decoder.with_meta_source(source);
        self
    }

    /// 백그라운드 태스크로 실행
    pub fn start(self) -> ParserHandle {
        let sink = self.sink.clone();
        let grace = self.config.shutdown_grace();
        let task = tokio::spawn(self.run());
        ParserHandle { sink, task, grace }
    }

    /// 소스가 끝나거나 싱크가 멈출 때까지 실행
    pub async fn run(mut self) -> Result<()> {
        let mut ctx = DecodeContext::new();
        let mut assembler = EntryAssembler::new(self.config.filter_query_dml);
        let mut attempt = 0u32;
        let mut seek: Option<Seek> = None;

        info!("Starting binlog parser for {}", self.config.destination);
        loop {
            if !self.sink.is_running() {
                break;
            }

            let result = self.run_once(&mut ctx, &mut assembler, &mut seek, &mut attempt).await;
            let err = match result {
                Ok(()) => {
                    info!("Binlog source finished for {}", self.config.destination);
                    break;
                }
                Err(CdcError::Interrupted) => break,
                Err(e @ CdcError::ServerIdMismatch { .. }) => {
                    error!("Fatal: {}", e);
                    return Err(e);
                }
                Err(e) if e.is_parse_error() => {
                    warn!("Parse error, resetting decode context: {}", e);
                    ctx.reset();
                    e
                }
                Err(e) if e.is_stream_error() => {
                    warn!("Stream error: {}", e);
                    e
                }
                Err(e) => {
                    error!("Parser stopped: {}", e);
                    return Err(e);
                }
            };

            assembler.reset();
            self.sink.discard_pending();
            if let Err(e) = self.source.disconnect().await {
                debug!("Disconnect failed: {}", e);
            }

            attempt += 1;
            if self.config.retry.exhausted(attempt) {
                error!("Giving up after {} attempts", attempt - 1);
                return Err(err);
            }
            let backoff = self.config.retry.backoff(attempt);
            info!("Reconnecting in {:?} (attempt {})", backoff, attempt);
            tokio::time::sleep(backoff).await;
        }

        if let Err(e) = self.source.disconnect().await {
            debug!("Disconnect failed: {}", e);
        }
        Ok(())
    }

    async fn run_once(
        &mut self,
        ctx: &mut DecodeContext,
        assembler: &mut EntryAssembler,
        seek: &mut Option<Seek>,
        attempt: &mut u32,
    ) -> Result<()> {
        let info = self.source.connect().await?;
        info!("Connected: {}", info);

        let current = match seek.take() {
            Some(seek) => seek,
            None => self.initial_seek(&info, ctx).await?,
        };
        ctx.format.checksum_alg = info.checksum_alg;

        let mut handler = EventHandler {
            decoder: &self.decoder,
            ctx,
            assembler,
            sink: &self.sink,
            identity: &self.identity,
            skip_until: match &current {
                Seek::File { skip_until, .. } => skip_until.clone(),
                _ => None,
            },
            last_good: None,
            progressed: false,
        };

        let result = match &current {
            Seek::File {
                journal_name,
                position,
                ..
            } => {
                handler.ctx.journal_name = journal_name.clone();
                handler.ctx.next_position = *position;
                self.source.dump(journal_name, *position, &mut handler).await
            }
            Seek::Gtid(set) => self.source.dump_gtid(set, &mut handler).await,
            Seek::Timestamp(timestamp) => self.source.dump_timestamp(*timestamp, &mut handler).await,
        };

        if handler.progressed {
            *attempt = 0;
        }

        // 다음 재접속 위치: GTID 모드면 누적 집합, 아니면 마지막으로 스토어에 들어간 경계
        let next = if matches!(current, Seek::Gtid(_)) {
            Seek::Gtid(handler.ctx.gtid_set.clone())
        } else {
            match handler.last_good.take() {
                Some(good) => Seek::File {
                    journal_name: good.journal_name.clone(),
                    position: good.position,
                    skip_until: good.included.then_some(good),
                },
                None => current,
            }
        };
        *seek = Some(next);

        result
    }

    /// 저장된 위치 -> 설정된 시작 위치 -> 소스 현재 위치 순
    async fn initial_seek(&self, info: &SourceInfo, ctx: &mut DecodeContext) -> Result<Seek> {
        if let Some(saved) = self.positions.latest(&self.config.destination).await? {
            if saved.server_id != 0 && saved.server_id != info.server_id {
                return Err(CdcError::ServerIdMismatch {
                    expected: saved.server_id,
                    actual: info.server_id,
                });
            }
            info!("Resuming {} from saved position {}", self.config.destination, saved);
            return Ok(Seek::File {
                journal_name: saved.journal_name.clone(),
                position: saved.position,
                skip_until: saved.included.then_some(saved),
            });
        }

        let seek = match &self.config.start {
            StartPosition::FilePosition {
                journal_name,
                position,
            } => Seek::File {
                journal_name: journal_name.clone(),
                position: *position,
                skip_until: None,
            },
            StartPosition::Gtid { gtid_set } => {
                let set = GtidSet::parse(gtid_set)?;
                ctx.gtid_set.union(&set);
                Seek::Gtid(set)
            }
            StartPosition::Timestamp { timestamp } => Seek::Timestamp(*timestamp),
            StartPosition::Latest => {
                let position = info.current_position();
                Seek::File {
                    journal_name: position.journal_name,
                    position: position.position,
                    skip_until: None,
                }
            }
        };
        info!("Starting {} from {:?}", self.config.destination, seek);
        Ok(seek)
    }
}

/// dump 중 원시 이벤트를 처리
struct EventHandler<'a> {
    decoder: &'a LogDecoder,
    ctx: &'a mut DecodeContext,
    assembler: &'a mut EntryAssembler,
    sink: &'a EntryEventSink,
    identity: &'a LogIdentity,
    skip_until: Option<LogPosition>,
    /// 스토어에 들어간 마지막 트랜잭션 경계
    last_good: Option<LogPosition>,
    progressed: bool,
}

impl EventHandler<'_> {
    /// TABLE_MAP 없이 온 ROWS는 table id만으로 메타데이터를 다시 찾을 수 없으므로 건너뜀
    async fn decode(&mut self, raw: &[u8]) -> Result<Option<LogEvent>> {
        match self.decoder.decode_with_meta(raw, self.ctx).await {
            Ok(event) => Ok(Some(event)),
            Err(CdcError::MetadataMissing(msg)) => {
                warn!("Skipping event: {}", msg);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl RawEventSink for EventHandler<'_> {
    async fn sink(&mut self, raw: Bytes) -> Result<bool> {
        let Some(event) = self.decode(&raw).await? else {
            return Ok(self.sink.is_running());
        };

        let mut entries = match self.assembler.convert(&event, self.ctx) {
            Ok(entries) => entries,
            Err(CdcError::MetadataMissing(msg)) => {
                warn!("Skipping event: {}", msg);
                return Ok(self.sink.is_running());
            }
            Err(e) => return Err(e),
        };

        if let Some(until) = &self.skip_until {
            entries.retain(|e| e.position().compare(until) == Ordering::Greater);
            if !entries.is_empty() {
                debug!("Passed already processed position {}", until);
                self.skip_until = None;
            }
        }
        if entries.is_empty() {
            return Ok(self.sink.is_running());
        }

        let boundary = entries
            .iter()
            .rev()
            .find(|e| e.is_boundary())
            .map(Entry::resume_position);

        let running = self.sink.sink(entries, self.identity).await?;
        self.progressed = true;
        if let Some(position) = boundary {
            self.last_good = Some(position);
        }
        Ok(running)
    }
}

/// 실행 중인 파서
pub struct ParserHandle {
    sink: Arc<EntryEventSink>,
    task: JoinHandle<Result<()>>,
    grace: std::time::Duration,
}

impl ParserHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// 소스가 끝날 때까지 대기
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| CdcError::Other(format!("parser task failed: {}", e)))?
    }

    /// 수신을 멈추고 남은 작업을 유예 시간만큼 기다린 뒤 스토어를 닫음
    pub async fn stop(mut self) -> Result<()> {
        info!("Stopping binlog parser");
        self.sink.stop();

        let finished = tokio::time::timeout(self.grace, &mut self.task).await;
        self.sink.store().stop();
        let joined = match finished {
            Ok(joined) => joined,
            Err(_) => {
                warn!("Parser did not stop within {:?}, interrupting", self.grace);
                self.task.await
            }
        };

        match joined {
            Ok(Err(CdcError::Interrupted)) | Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(CdcError::Other(format!("parser task failed: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, SinkConfig, StoreConfig};
    use crate::entry::EntryType;
    use crate::events::EventType;
    use crate::position::MemoryPositionManager;
    use crate::server::ClientIdentity;
    use crate::source::FileSource;
    use crate::store::MemoryEventStore;
    use crate::testkit::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn binlog_dir() -> (TempDir, u64) {
        let mut builder = BinlogFileBuilder::new(true);
        builder.push_insert_tx(1_700_000_100, 1, 10);
        let first_tx_end = builder.position();
        builder.push_insert_tx(1_700_000_200, 2, 20);
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mysql-bin.000001"), builder.build()).unwrap();
        (dir, first_tx_end)
    }

    fn config(start: StartPosition) -> ParserConfig {
        ParserConfig {
            start,
            retry: RetryConfig {
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
                max_retries: 3,
            },
            shutdown_grace_ms: 50,
            ..Default::default()
        }
    }

    fn from_start() -> StartPosition {
        StartPosition::FilePosition {
            journal_name: "mysql-bin.000001".to_string(),
            position: 4,
        }
    }

    struct Pipeline {
        store: Arc<MemoryEventStore>,
        sink: Arc<EntryEventSink>,
        positions: Arc<MemoryPositionManager>,
        client: ClientIdentity,
    }

    fn pipeline(buffer_size: usize) -> Pipeline {
        let store = Arc::new(
            MemoryEventStore::new(StoreConfig {
                buffer_size,
                spin_tries: 0,
                ..Default::default()
            })
            .unwrap(),
        );
        let client = ClientIdentity::new("example", 1, "");
        store.subscribe(&client);
        let sink_config = SinkConfig {
            batch_size: buffer_size.min(16),
            ..Default::default()
        };
        Pipeline {
            sink: Arc::new(EntryEventSink::new(store.clone(), sink_config).unwrap()),
            store,
            positions: Arc::new(MemoryPositionManager::new()),
            client,
        }
    }

    async fn received(p: &Pipeline) -> Vec<(EntryType, Option<String>)> {
        p.store
            .get(&p.client, 64, Duration::ZERO)
            .await
            .unwrap()
            .iter()
            .map(|e| (e.entry.entry_type, e.entry.header.gtid.clone()))
            .collect()
    }

    fn gtid(seq: u64) -> Option<String> {
        Some(format!("{}:{}", SERVER_UUID, seq))
    }

    #[tokio::test]
    async fn test_replays_file_into_store() {
        let (dir, _) = binlog_dir();
        let p = pipeline(64);
        let parser = BinlogParser::new(
            config(from_start()),
            Box::new(FileSource::new(dir.path())),
            p.sink.clone(),
            p.positions.clone(),
        );
        parser.run().await.unwrap();

        assert_eq!(
            received(&p).await,
            vec![
                (EntryType::TransactionBegin, gtid(1)),
                (EntryType::RowData, gtid(1)),
                (EntryType::TransactionEnd, gtid(1)),
                (EntryType::TransactionBegin, gtid(2)),
                (EntryType::RowData, gtid(2)),
                (EntryType::TransactionEnd, gtid(2)),
            ]
        );
    }

    #[tokio::test]
    async fn test_resumes_from_saved_position() {
        let (dir, first_tx_end) = binlog_dir();
        let p = pipeline(64);
        let mut saved = LogPosition::new("mysql-bin.000001", first_tx_end);
        saved.server_id = SERVER_ID;
        p.positions.persist("example", &saved).await.unwrap();

        BinlogParser::new(
            config(from_start()),
            Box::new(FileSource::new(dir.path())),
            p.sink.clone(),
            p.positions.clone(),
        )
        .run()
        .await
        .unwrap();

        let entries = received(&p).await;
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|(_, g)| *g == gtid(2)));
    }

    #[tokio::test]
    async fn test_server_id_mismatch_is_fatal() {
        let (dir, first_tx_end) = binlog_dir();
        let p = pipeline(64);
        let mut saved = LogPosition::new("mysql-bin.000001", first_tx_end);
        saved.server_id = 99;
        p.positions.persist("example", &saved).await.unwrap();

        let result = BinlogParser::new(
            config(from_start()),
            Box::new(FileSource::new(dir.path())),
            p.sink.clone(),
            p.positions.clone(),
        )
        .run()
        .await;
        assert!(matches!(
            result,
            Err(CdcError::ServerIdMismatch { expected: 99, actual: SERVER_ID })
        ));
    }

    #[tokio::test]
    async fn test_gtid_start() {
        let (dir, _) = binlog_dir();
        let p = pipeline(64);
        let start = StartPosition::Gtid {
            gtid_set: format!("{}:1", SERVER_UUID),
        };
        BinlogParser::new(
            config(start),
            Box::new(FileSource::new(dir.path())),
            p.sink.clone(),
            p.positions.clone(),
        )
        .run()
        .await
        .unwrap();

        let entries = received(&p).await;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1], (EntryType::RowData, gtid(2)));
    }

    #[derive(Debug, Clone, Copy)]
    enum Fault {
        /// 연결 끊김
        Disconnect,
        /// CRC가 깨진 이벤트 전달
        Corrupt,
    }

    /// 첫 dump에서 이벤트 몇 개만 정상으로 보내고 장애를 일으키는 소스
    struct FlakySource {
        inner: FileSource,
        fault: Option<(usize, Fault)>,
    }

    struct CountingSink<'a> {
        inner: &'a mut dyn RawEventSink,
        remaining: usize,
        fault: Fault,
    }

    #[async_trait]
    impl RawEventSink for CountingSink<'_> {
        async fn sink(&mut self, raw: Bytes) -> Result<bool> {
            if self.remaining > 0 {
                self.remaining -= 1;
                return self.inner.sink(raw).await;
            }
            match self.fault {
                Fault::Disconnect => Err(CdcError::StreamError("connection reset".to_string())),
                Fault::Corrupt => {
                    let mut bytes = raw.to_vec();
                    let last = bytes.len() - 1;
                    bytes[last] ^= 0xff;
                    self.inner.sink(Bytes::from(bytes)).await
                }
            }
        }
    }

    #[async_trait]
    impl BinlogSource for FlakySource {
        async fn connect(&mut self) -> Result<SourceInfo> {
            self.inner.connect().await
        }

        async fn dump(&mut self, journal_name: &str, position: u64, sink: &mut dyn RawEventSink) -> Result<()> {
            match self.fault.take() {
                Some((remaining, fault)) => {
                    let mut counting = CountingSink {
                        inner: sink,
                        remaining,
                        fault,
                    };
                    self.inner.dump(journal_name, position, &mut counting).await
                }
                None => self.inner.dump(journal_name, position, sink).await,
            }
        }

        async fn dump_gtid(&mut self, gtid_set: &GtidSet, sink: &mut dyn RawEventSink) -> Result<()> {
            self.inner.dump_gtid(gtid_set, sink).await
        }

        async fn dump_timestamp(&mut self, timestamp: i64, sink: &mut dyn RawEventSink) -> Result<()> {
            self.inner.dump_timestamp(timestamp, sink).await
        }
    }

    async fn replay_with_fault(fault: Fault) -> Vec<Option<String>> {
        let (dir, _) = binlog_dir();
        let p = pipeline(64);
        // fake ROTATE + FDE + 첫 트랜잭션 5개 + 두 번째 트랜잭션 GTID, BEGIN 다음 TABLE_MAP에서 장애
        let source = FlakySource {
            inner: FileSource::new(dir.path()),
            fault: Some((9, fault)),
        };
        BinlogParser::new(config(from_start()), Box::new(source), p.sink.clone(), p.positions.clone())
            .run()
            .await
            .unwrap();

        received(&p).await.into_iter().map(|(_, g)| g).collect()
    }

    #[tokio::test]
    async fn test_reconnects_after_stream_error_without_duplicates() {
        let gtids = replay_with_fault(Fault::Disconnect).await;
        assert_eq!(gtids, vec![gtid(1), gtid(1), gtid(1), gtid(2), gtid(2), gtid(2)]);
    }

    #[tokio::test]
    async fn test_checksum_error_resets_context_and_reconnects() {
        let gtids = replay_with_fault(Fault::Corrupt).await;
        assert_eq!(gtids, vec![gtid(1), gtid(1), gtid(1), gtid(2), gtid(2), gtid(2)]);
    }

    #[tokio::test]
    async fn test_rows_without_table_map_are_skipped() {
        let mut builder = BinlogFileBuilder::new(true);
        let mut image = vec![0u8];
        image.extend_from_slice(&7i32.to_le_bytes());
        builder
            .push(EventType::GtidLogEvent as u8, 1_700_000_100, &gtid_body(SERVER_UUID, 1))
            .push(EventType::QueryEvent as u8, 1_700_000_100, &query_body("shop", "BEGIN"))
            .push(
                EventType::WriteRowsEventV2 as u8,
                1_700_000_100,
                &rows_body(99, 1, &[1], None, &image),
            )
            .push(EventType::XidEvent as u8, 1_700_000_100, &xid_body(1))
            .push_insert_tx(1_700_000_200, 2, 20);
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mysql-bin.000001"), builder.build()).unwrap();

        let p = pipeline(64);
        BinlogParser::new(
            config(from_start()),
            Box::new(FileSource::new(dir.path())),
            p.sink.clone(),
            p.positions.clone(),
        )
        .run()
        .await
        .unwrap();

        // 행이 빠진 첫 트랜잭션은 빈 트랜잭션으로 억제됨
        assert_eq!(
            received(&p).await,
            vec![
                (EntryType::TransactionBegin, gtid(2)),
                (EntryType::RowData, gtid(2)),
                (EntryType::TransactionEnd, gtid(2)),
            ]
        );
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let p = pipeline(64);
        let missing = tempfile::tempdir().unwrap();
        let result = BinlogParser::new(
            config(from_start()),
            Box::new(FileSource::new(missing.path())),
            p.sink.clone(),
            p.positions.clone(),
        )
        .run()
        .await;
        assert!(matches!(result, Err(CdcError::StreamError(_))));
    }

    #[tokio::test]
    async fn test_stop_interrupts_blocked_put() {
        let (dir, _) = binlog_dir();
        // 소비자가 ack하지 않으면 두 번째 트랜잭션에서 막힘
        let p = pipeline(4);
        let handle = BinlogParser::new(
            config(from_start()),
            Box::new(FileSource::new(dir.path())),
            p.sink.clone(),
            p.positions.clone(),
        )
        .start();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        handle.stop().await.unwrap();
        assert!(p.store.is_draining());
        assert!(!p.sink.is_running());
    }
}
