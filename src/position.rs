//! Binlog 처리 위치 추적
//!
//! 파일명 + 오프셋(그리고 GTID 모드에서는 누적 GTID 집합)으로 재시작 지점을 표현합니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치

use crate::error::Result;
use crate::format::ChecksumAlg;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

/// binlog 파일의 첫 이벤트 위치 (4바이트 매직 넘버 다음)
pub const BINLOG_START_POSITION: u64 = 4;

/// 로그 상의 한 지점
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub journal_name: String,
    /// 파일 내 바이트 위치
    pub position: u64,
    /// 이벤트 시각 (밀리초)
    pub timestamp: i64,
    pub server_id: u32,
    /// 이 위치까지 실행된 GTID 집합 (GTID 모드에서만)
    pub gtid: Option<String>,
    /// true면 이 위치의 이벤트까지 이미 처리됨 (재시작 시 건너뜀)
    pub included: bool,
}

impl LogPosition {
    pub fn new(journal_name: impl Into<String>, position: u64) -> Self {
        LogPosition {
            journal_name: journal_name.into(),
            position,
            ..Default::default()
        }
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        self.journal_name
            .rsplit('.')
            .next()
            .and_then(|s| s.parse().ok())
    }

    /// (파일 시퀀스, 오프셋) 순서 비교
    pub fn compare(&self, other: &LogPosition) -> Ordering {
        let by_file = match (self.file_sequence(), other.file_sequence()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.journal_name.cmp(&other.journal_name),
        };
        by_file.then(self.position.cmp(&other.position))
    }

    pub fn is_after(&self, other: &LogPosition) -> bool {
        self.compare(other) == Ordering::Greater
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.journal_name, self.position)?;
        if let Some(gtid) = &self.gtid {
            write!(f, " [{}]", gtid)?;
        }
        Ok(())
    }
}

/// 최초 시작 위치 지정 방식
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StartPosition {
    /// 소스가 알려주는 현재 위치부터
    #[default]
    Latest,
    FilePosition { journal_name: String, position: u64 },
    /// 이 GTID 집합에 없는 트랜잭션부터
    Gtid { gtid_set: String },
    /// 이 시각(밀리초) 이후 첫 트랜잭션부터
    Timestamp { timestamp: i64 },
}

/// 엔트리를 만든 업스트림 식별자
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogIdentity {
    pub source_address: String,
    pub slave_id: u32,
}

impl LogIdentity {
    pub fn new(source_address: impl Into<String>, slave_id: u32) -> Self {
        LogIdentity {
            source_address: source_address.into(),
            slave_id,
        }
    }
}

/// 접속한 소스의 현재 상태
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceInfo {
    pub server_id: u32,
    pub server_version: String,
    /// 현재 마지막 binlog 파일과 위치
    pub journal_name: String,
    pub position: u64,
    pub gtid_executed: Option<String>,
    /// 소스가 이벤트에 붙이는 체크섬 (FORMAT_DESCRIPTION 이전 이벤트 해석용)
    pub checksum_alg: ChecksumAlg,
}

impl SourceInfo {
    pub fn current_position(&self) -> LogPosition {
        LogPosition {
            journal_name: self.journal_name.clone(),
            position: self.position,
            server_id: self.server_id,
            gtid: self.gtid_executed.clone(),
            ..Default::default()
        }
    }
}

impl fmt::Display for SourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SourceInfo {{ server_id: {}, version: {}, file: {}, pos: {}, gtid: {:?} }}",
            self.server_id, self.server_version, self.journal_name, self.position, self.gtid_executed
        )
    }
}

/// 재시작 위치 저장소 (외부 협력자)
#[async_trait]
pub trait PositionManager: Send + Sync {
    async fn latest(&self, destination: &str) -> Result<Option<LogPosition>>;

    async fn persist(&self, destination: &str, position: &LogPosition) -> Result<()>;
}

/// 메모리 위치 저장소. 프로세스가 끝나면 사라짐
#[derive(Debug, Default)]
pub struct MemoryPositionManager {
    positions: RwLock<HashMap<String, LogPosition>>,
}

impl MemoryPositionManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionManager for MemoryPositionManager {
    async fn latest(&self, destination: &str) -> Result<Option<LogPosition>> {
        Ok(self.positions.read().get(destination).cloned())
    }

    async fn persist(&self, destination: &str, position: &LogPosition) -> Result<()> {
        let mut positions = self.positions.write();
        match positions.get(destination) {
            // 뒤로 가는 위치는 무시
            Some(current) if !position.is_after(current) => {}
            _ => {
                positions.insert(destination.to_string(), position.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_sequence() {
        let pos = LogPosition::new("mysql-bin.000123", 4096);
        assert_eq!(pos.file_sequence(), Some(123));
        assert_eq!(LogPosition::new("binlog", 4).file_sequence(), None);
    }

    #[test]
    fn test_ordering_by_file_then_offset() {
        let a = LogPosition::new("mysql-bin.000009", 9000);
        let b = LogPosition::new("mysql-bin.000010", 4);
        let c = LogPosition::new("mysql-bin.000010", 120);
        assert!(b.is_after(&a));
        assert!(c.is_after(&b));
        assert_eq!(c.compare(&c.clone()), Ordering::Equal);
    }

    #[test]
    fn test_start_position_serde() {
        let start: StartPosition =
            serde_json::from_str(r#"{"mode":"file_position","journal_name":"mysql-bin.000002","position":4}"#)
                .unwrap();
        assert_eq!(
            start,
            StartPosition::FilePosition {
                journal_name: "mysql-bin.000002".to_string(),
                position: 4
            }
        );
    }

    #[test]
    fn test_memory_position_manager_keeps_latest() {
        tokio_test::block_on(async {
            let manager = MemoryPositionManager::new();
            assert!(manager.latest("example").await.unwrap().is_none());

            manager
                .persist("example", &LogPosition::new("mysql-bin.000001", 500))
                .await
                .unwrap();
            manager
                .persist("example", &LogPosition::new("mysql-bin.000001", 200))
                .await
                .unwrap();

            let latest = manager.latest("example").await.unwrap().unwrap();
            assert_eq!(latest.position, 500);
        });
    }
}
