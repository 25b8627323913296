//! MySQL Binlog CDC (Change Data Capture) 핵심 구현
//!
//! 이 라이브러리는 MySQL 바이너리 로그를 디코딩해 행 단위 변경 엔트리로 만들고,
//! 여러 소비자가 각자 확인(ack)하며 읽어 가는 메모리 이벤트 스토어에 보관합니다.
//! 주요 기능:
//! - Binlog 이벤트 디코딩 (체크섬 검증, 컬럼 타입별 값 해석)
//! - GTID (Global Transaction ID) 관리
//! - 트랜잭션 단위 엔트리 조립 및 빈 트랜잭션 억제
//! - 다중 구독자 링 버퍼 스토어와 위치 관리
//! - binlog 파일 재생 및 재접속

pub mod binlog;
pub mod config;
pub mod connection;
pub mod convert;
pub mod entry;
pub mod error;
pub mod events;
pub mod filter;
pub mod format;
pub mod gtid;
pub mod json;
pub mod metadata;
pub mod parser;
pub mod position;
pub mod rows;
pub mod server;
pub mod sink;
pub mod source;
pub mod store;

#[cfg(test)]
pub(crate) mod testkit;

pub use binlog::{DecodeContext, LogDecoder};
pub use config::CdcConfig;
pub use connection::MysqlTableMetaSource;
pub use entry::{Entry, EntryType, EventKind};
pub use error::{CdcError, Result};
pub use events::{EventType, LogEvent};
pub use gtid::GtidSet;
pub use parser::{BinlogParser, ParserHandle};
pub use position::{LogPosition, MemoryPositionManager, PositionManager, SourceInfo};
pub use server::{ClientIdentity, Destination};
pub use source::{BinlogSource, FileSource};
pub use store::MemoryEventStore;
