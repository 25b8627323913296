//! CDC 설정
//!
//! 모든 설정은 `Default`를 가지며 JSON에서 일부 필드만 지정해도 됩니다.

use crate::connection::ConnectionConfig;
use crate::error::{CdcError, Result};
use crate::filter::NameFilter;
use crate::position::StartPosition;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 스토어 배치/용량 계산 단위
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// 엔트리 개수
    ItemSize,
    /// 원본 이벤트 바이트 수 (`mem_unit` 단위)
    MemSize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// 슬롯 수 (2의 거듭제곱)
    pub buffer_size: usize,
    /// MemSize 모드의 바이트 단위
    pub mem_unit: usize,
    pub batch_mode: BatchMode,
    /// DDL 엔트리는 항상 단독 배치로 전달
    pub ddl_isolation: bool,
    /// 잠들기 전에 양보(yield)하며 재확인하는 횟수
    pub spin_tries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            buffer_size: 16 * 1024,
            mem_unit: 1024,
            batch_mode: BatchMode::ItemSize,
            ddl_isolation: false,
            spin_tries: 64,
        }
    }
}

impl StoreConfig {
    /// MemSize 모드의 전체 바이트 용량
    pub fn mem_capacity(&self) -> usize {
        self.buffer_size.saturating_mul(self.mem_unit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// 트랜잭션 버퍼를 스토어로 내보내는 엔트리 수
    pub batch_size: usize,
    /// 억제된 빈 트랜잭션이 이만큼 쌓이면 하나를 내보냄
    pub empty_transaction_threshold: u64,
    /// 마지막으로 내보낸 뒤 이 시간(ms)이 지나면 빈 트랜잭션을 내보냄
    pub empty_transaction_interval_ms: u64,
    /// BEGIN/END 엔트리를 모두 버림
    pub filter_transaction_entry: bool,
    /// `schema.table` 정규식 화이트리스트 (콤마 구분, 비어 있으면 전체)
    pub include: String,
    /// `schema.table` 정규식 블랙리스트
    pub exclude: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig {
            batch_size: 512,
            empty_transaction_threshold: 8192,
            empty_transaction_interval_ms: 5000,
            filter_transaction_entry: false,
            include: String::new(),
            exclude: String::new(),
        }
    }
}

impl SinkConfig {
    pub fn empty_transaction_interval(&self) -> Duration {
        Duration::from_millis(self.empty_transaction_interval_ms)
    }

    pub fn name_filter(&self) -> Result<NameFilter> {
        NameFilter::new(&self.include, &self.exclude)
    }
}

/// 재접속 백오프
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// 연속 실패 허용 횟수. 0이면 무제한
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            max_retries: 10,
        }
    }
}

impl RetryConfig {
    /// `attempt`번째(1부터) 재시도 전 대기 시간
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_retries != 0 && attempt > self.max_retries
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// 위치 저장소와 구독자가 공유하는 destination 이름
    pub destination: String,
    /// 복제 클라이언트 ID
    pub slave_id: u32,
    /// 설정된 시작 위치 (저장된 위치가 없을 때만 사용)
    pub start: StartPosition,
    pub verify_checksum: bool,
    /// DDL이 아닌 QUERY 이벤트는 엔트리로 만들지 않음
    pub filter_query_dml: bool,
    /// 종료 시 남은 작업을 기다리는 최대 시간(ms)
    pub shutdown_grace_ms: u64,
    pub retry: RetryConfig,
}

impl Default for ParserConfig {
    fn default() -> Self {
        ParserConfig {
            destination: "example".to_string(),
            slave_id: 1001,
            start: StartPosition::Latest,
            verify_checksum: true,
            filter_query_dml: false,
            shutdown_grace_ms: 5000,
            retry: RetryConfig::default(),
        }
    }
}

impl ParserConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// 전체 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CdcConfig {
    pub connection: ConnectionConfig,
    /// 설정하면 이 디렉터리의 binlog 파일을 재생
    pub binlog_dir: Option<PathBuf>,
    pub parser: ParserConfig,
    pub sink: SinkConfig,
    pub store: StoreConfig,
}

impl CdcConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: CdcConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        let store = &self.store;
        if store.buffer_size == 0 || !store.buffer_size.is_power_of_two() {
            return Err(CdcError::Config(format!(
                "store.buffer_size must be a power of two, got {}",
                store.buffer_size
            )));
        }
        if store.mem_unit == 0 {
            return Err(CdcError::Config("store.mem_unit must be positive".to_string()));
        }
        if self.sink.batch_size == 0 || self.sink.batch_size > store.buffer_size {
            return Err(CdcError::Config(format!(
                "sink.batch_size must be in 1..={}, got {}",
                store.buffer_size, self.sink.batch_size
            )));
        }
        if self.parser.destination.is_empty() {
            return Err(CdcError::Config("parser.destination is empty".to_string()));
        }
        let retry = &self.parser.retry;
        if retry.initial_backoff_ms > retry.max_backoff_ms {
            return Err(CdcError::Config(format!(
                "retry.initial_backoff_ms {} exceeds max_backoff_ms {}",
                retry.initial_backoff_ms, retry.max_backoff_ms
            )));
        }
        self.sink.name_filter()?;
        Ok(())
    }
}
