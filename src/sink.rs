//! 엔트리 싱크
//!
//! 이름 필터를 적용하고 빈 트랜잭션을 걸러낸 뒤 트랜잭션 단위로 스토어에 넣습니다.
//!
//! 행이 하나도 남지 않은 트랜잭션은 기본적으로 버리지만, 억제된 개수가 임계값에 도달하거나
//! 마지막 전송 후 일정 시간이 지나면 BEGIN/END 한 쌍을 보내 소비자 위치가 전진하도록 합니다.

use crate::config::SinkConfig;
use crate::entry::{Entry, EntryType};
use crate::error::Result;
use crate::filter::NameFilter;
use crate::position::LogIdentity;
use crate::store::{Event, MemoryEventStore};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace};

#[derive(Debug)]
struct SinkState {
    config: SinkConfig,
    filter: NameFilter,
    /// 다음 트랜잭션 경계에서 적용할 설정
    pending_config: Option<(SinkConfig, NameFilter)>,
    /// 행이 올 때까지 보류한 BEGIN
    pending_begin: Option<Event>,
    in_transaction: bool,
    has_rows: bool,
    buffer: Vec<Event>,
    /// 마지막 전송 이후 억제한 빈 트랜잭션 수
    suppressed: u64,
    last_emit: Instant,
}

impl SinkState {
    fn apply_pending_config(&mut self) {
        if let Some((config, filter)) = self.pending_config.take() {
            info!("Applying sink configuration at transaction boundary");
            self.config = config;
            self.filter = filter;
        }
    }

    fn flush(&mut self) -> Option<Vec<Event>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    /// 엔트리 하나 처리. 스토어로 보낼 배치가 생기면 반환
    fn accept(&mut self, entry: Entry, identity: &LogIdentity) -> Option<Vec<Event>> {
        match entry.entry_type {
            EntryType::Heartbeat => {
                trace!("Dropping heartbeat at {}", entry.header.position);
                None
            }
            EntryType::TransactionBegin => {
                self.apply_pending_config();
                self.in_transaction = true;
                self.has_rows = false;
                self.pending_begin = (!self.config.filter_transaction_entry)
                    .then(|| Event::new(entry, identity.clone()));
                None
            }
            EntryType::RowData => {
                let header = &entry.header;
                if !header.table.is_empty() && !self.filter.matches(&header.schema, &header.table) {
                    trace!("Filtered out {}", entry.qualified_name());
                    return None;
                }

                let is_ddl = entry.is_ddl();
                if let Some(begin) = self.pending_begin.take() {
                    self.buffer.push(begin);
                }
                self.buffer.push(Event::new(entry, identity.clone()));
                self.has_rows = true;

                if !self.in_transaction {
                    self.last_emit = Instant::now();
                    self.suppressed = 0;
                }
                if is_ddl || !self.in_transaction || self.buffer.len() >= self.config.batch_size {
                    self.flush()
                } else {
                    None
                }
            }
            EntryType::TransactionEnd => {
                let begin = self.pending_begin.take();
                let emit = if self.has_rows {
                    true
                } else {
                    self.suppressed += 1;
                    !self.config.filter_transaction_entry
                        && (self.suppressed >= self.config.empty_transaction_threshold
                            || self.last_emit.elapsed() >= self.config.empty_transaction_interval())
                };

                if emit {
                    if !self.config.filter_transaction_entry {
                        self.buffer.extend(begin);
                        self.buffer.push(Event::new(entry, identity.clone()));
                    }
                    if !self.has_rows {
                        debug!(
                            "Emitting empty transaction after {} suppressed",
                            self.suppressed
                        );
                    }
                    self.suppressed = 0;
                    self.last_emit = Instant::now();
                }

                self.in_transaction = false;
                self.has_rows = false;
                self.apply_pending_config();
                self.flush()
            }
        }
    }
}

/// 엔트리 -> 스토어 싱크. 생산자 하나가 호출
pub struct EntryEventSink {
    store: Arc<MemoryEventStore>,
    state: Mutex<SinkState>,
    running: AtomicBool,
}

impl EntryEventSink {
    pub fn new(store: Arc<MemoryEventStore>, config: SinkConfig) -> Result<Self> {
        let filter = config.name_filter()?;
        Ok(EntryEventSink {
            store,
            state: Mutex::new(SinkState {
                config,
                filter,
                pending_config: None,
                pending_begin: None,
                in_transaction: false,
                has_rows: false,
                buffer: Vec::new(),
                suppressed: 0,
                last_emit: Instant::now(),
            }),
            running: AtomicBool::new(true),
        })
    }

    /// 엔트리를 처리. 중지된 뒤에는 `false`
    pub async fn sink(&self, entries: Vec<Entry>, identity: &LogIdentity) -> Result<bool> {
        for entry in entries {
            if !self.is_running() {
                return Ok(false);
            }
            let ready = self.state.lock().accept(entry, identity);
            if let Some(batch) = ready {
                trace!("Sink flushing {} entries", batch.len());
                self.store.put(batch).await?;
            }
        }
        Ok(self.is_running())
    }

    /// 다음 트랜잭션 경계에서 적용. 진행 중인 트랜잭션 상태는 유지
    pub fn update_config(&self, config: SinkConfig) -> Result<()> {
        let filter = config.name_filter()?;
        let mut state = self.state.lock();
        if state.in_transaction {
            state.pending_config = Some((config, filter));
        } else {
            state.config = config;
            state.filter = filter;
        }
        Ok(())
    }

    pub fn store(&self) -> &Arc<MemoryEventStore> {
        &self.store
    }

    pub fn config(&self) -> SinkConfig {
        self.state.lock().config.clone()
    }

    /// 재접속 시 끝나지 않은 트랜잭션 버퍼를 버림 (재시작 위치부터 다시 읽음)
    pub fn discard_pending(&self) {
        let mut state = self.state.lock();
        if !state.buffer.is_empty() || state.pending_begin.is_some() {
            debug!("Discarding {} buffered entries", state.buffer.len());
        }
        state.buffer.clear();
        state.pending_begin = None;
        state.in_transaction = false;
        state.has_rows = false;
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::entry::{EntryHeader, EventKind, RowChange};
    use crate::server::ClientIdentity;
    use std::time::Duration;

    fn header(schema: &str, table: &str, position: u64) -> EntryHeader {
        EntryHeader {
            journal_name: "mysql-bin.000001".to_string(),
            position,
            schema: schema.to_string(),
            table: table.to_string(),
            ..Default::default()
        }
    }

    fn begin(position: u64) -> Entry {
        Entry::transaction_begin(header("shop", "", position), Some(1))
    }

    fn end(position: u64) -> Entry {
        Entry::transaction_end(header("shop", "", position), Some(1), position + 31)
    }

    fn row(table: &str, position: u64) -> Entry {
        let change = RowChange {
            kind: EventKind::Insert,
            is_ddl: false,
            sql: None,
            rows_query: None,
            rows: Vec::new(),
        };
        Entry::row_data(header("shop", table, position), change)
    }

    fn ddl(position: u64) -> Entry {
        let change = RowChange {
            kind: EventKind::Alter,
            is_ddl: true,
            sql: Some("ALTER TABLE orders ADD c INT".to_string()),
            rows_query: None,
            rows: Vec::new(),
        };
        Entry::row_data(header("shop", "orders", position), change)
    }

    fn setup(config: SinkConfig) -> (EntryEventSink, Arc<MemoryEventStore>, ClientIdentity) {
        let store = Arc::new(
            MemoryEventStore::new(StoreConfig {
                buffer_size: 64,
                spin_tries: 0,
                ..Default::default()
            })
            .unwrap(),
        );
        let client = ClientIdentity::new("example", 1, "");
        store.subscribe(&client);
        (EntryEventSink::new(store.clone(), config).unwrap(), store, client)
    }

    async fn drain(store: &MemoryEventStore, client: &ClientIdentity) -> Vec<(EntryType, u64)> {
        store
            .get(client, 64, Duration::ZERO)
            .await
            .unwrap()
            .iter()
            .map(|e| (e.entry.entry_type, e.entry.header.position))
            .collect()
    }

    fn quiet() -> SinkConfig {
        SinkConfig {
            empty_transaction_threshold: 3,
            empty_transaction_interval_ms: 3_600_000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_transaction_flushed_on_end() {
        let (sink, store, client) = setup(quiet());
        let identity = LogIdentity::default();

        sink.sink(vec![begin(100), row("orders", 200)], &identity).await.unwrap();
        assert_eq!(store.put_sequence(), 0);

        assert!(sink.sink(vec![end(300)], &identity).await.unwrap());
        assert_eq!(
            drain(&store, &client).await,
            vec![
                (EntryType::TransactionBegin, 100),
                (EntryType::RowData, 200),
                (EntryType::TransactionEnd, 300)
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_transactions_suppressed_until_threshold() {
        let (sink, store, client) = setup(quiet());
        let identity = LogIdentity::default();

        for i in 0..2u64 {
            sink.sink(vec![begin(i * 100), end(i * 100 + 50)], &identity)
                .await
                .unwrap();
        }
        assert_eq!(store.put_sequence(), 0);

        sink.sink(vec![begin(200), end(250)], &identity).await.unwrap();
        assert_eq!(
            drain(&store, &client).await,
            vec![(EntryType::TransactionBegin, 200), (EntryType::TransactionEnd, 250)]
        );
    }

    #[tokio::test]
    async fn test_empty_transaction_emitted_after_interval() {
        let (sink, store, _) = setup(SinkConfig {
            empty_transaction_threshold: 1000,
            empty_transaction_interval_ms: 0,
            ..Default::default()
        });
        sink.sink(vec![begin(100), end(150)], &LogIdentity::default())
            .await
            .unwrap();
        assert_eq!(store.put_sequence(), 2);
    }

    #[tokio::test]
    async fn test_name_filter_turns_transaction_empty() {
        let (sink, store, client) = setup(SinkConfig {
            include: r"shop\.orders".to_string(),
            ..quiet()
        });
        let identity = LogIdentity::default();

        sink.sink(vec![begin(100), row("audit", 200), end(300)], &identity)
            .await
            .unwrap();
        assert_eq!(store.put_sequence(), 0);

        sink.sink(vec![begin(400), row("audit", 450), row("orders", 500), end(600)], &identity)
            .await
            .unwrap();
        assert_eq!(
            drain(&store, &client).await,
            vec![
                (EntryType::TransactionBegin, 400),
                (EntryType::RowData, 500),
                (EntryType::TransactionEnd, 600)
            ]
        );
    }

    #[tokio::test]
    async fn test_heartbeat_and_transaction_markers_filtered() {
        let (sink, store, client) = setup(SinkConfig {
            filter_transaction_entry: true,
            ..quiet()
        });
        let identity = LogIdentity::default();
        let heartbeat = Entry::heartbeat(header("", "", 50));

        sink.sink(vec![heartbeat, begin(100), row("orders", 200), end(300)], &identity)
            .await
            .unwrap();
        assert_eq!(drain(&store, &client).await, vec![(EntryType::RowData, 200)]);
    }

    #[tokio::test]
    async fn test_ddl_and_batch_size_flush() {
        let (sink, store, _) = setup(SinkConfig {
            batch_size: 3,
            ..quiet()
        });
        let identity = LogIdentity::default();

        sink.sink(vec![ddl(50)], &identity).await.unwrap();
        assert_eq!(store.put_sequence(), 1);

        sink.sink(vec![begin(100), row("orders", 200), row("orders", 300)], &identity)
            .await
            .unwrap();
        assert_eq!(store.put_sequence(), 4);
        sink.sink(vec![row("orders", 400), end(500)], &identity).await.unwrap();
        assert_eq!(store.put_sequence(), 6);
    }

    #[tokio::test]
    async fn test_update_config_waits_for_boundary() {
        let (sink, store, _) = setup(quiet());
        let identity = LogIdentity::default();

        sink.sink(vec![begin(100)], &identity).await.unwrap();
        sink.update_config(SinkConfig {
            include: r"shop\.other".to_string(),
            ..quiet()
        })
        .unwrap();
        assert_eq!(sink.config().include, "");

        // 진행 중인 트랜잭션은 이전 필터로 처리
        sink.sink(vec![row("orders", 200), end(300)], &identity).await.unwrap();
        assert_eq!(store.put_sequence(), 3);
        assert_eq!(sink.config().include, r"shop\.other");

        assert!(sink.update_config(SinkConfig {
            include: "(".to_string(),
            ..quiet()
        })
        .is_err());
    }

    #[tokio::test]
    async fn test_stopped_sink_returns_false() {
        let (sink, store, _) = setup(quiet());
        sink.stop();
        assert!(!sink.sink(vec![ddl(10)], &LogIdentity::default()).await.unwrap());
        assert_eq!(store.put_sequence(), 0);
    }
}
