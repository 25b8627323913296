//! CDC 관련 에러 타입
//!
//! 파이프라인은 에러 종류에 따라 복구 정책을 다르게 적용합니다.
//! - 스트림 에러: 마지막 정상 위치에서 재접속
//! - 파싱 에러: 디코드 컨텍스트 초기화 후 재접속
//! - 메타데이터 누락: 한 번 갱신 후 재시도, 실패하면 해당 이벤트만 건너뜀
//! - 서버 ID 불일치: 치명적

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdcError {
    #[error("스트림 에러: {0}")]
    StreamError(String),

    #[error("Binlog 파싱 에러: {0}")]
    ParseError(String),

    #[error("체크섬 불일치: expected {expected:#010x}, actual {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("테이블 메타데이터 없음: {0}")]
    MetadataMissing(String),

    #[error("서버 ID 불일치: expected {expected}, actual {actual}")]
    ServerIdMismatch { expected: u32, actual: u32 },

    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    #[error("GTID 처리 에러: {0}")]
    GtidError(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("설정 에러: {0}")]
    Config(String),

    #[error("위치를 찾을 수 없습니다: {0}")]
    PositionNotFound(String),

    #[error("구독하지 않은 클라이언트: {0}")]
    NotSubscribed(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("작업이 중단되었습니다")]
    Interrupted,

    #[error("예상치 못한 에러: {0}")]
    Other(String),
}

impl CdcError {
    /// 재접속으로 복구 가능한 연결/I-O 계열 에러인지
    pub fn is_stream_error(&self) -> bool {
        matches!(
            self,
            CdcError::StreamError(_) | CdcError::IoError(_) | CdcError::ConnectionError(_)
        )
    }

    /// 디코드 컨텍스트를 더 이상 신뢰할 수 없는 에러인지
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            CdcError::ParseError(_) | CdcError::ChecksumMismatch { .. }
        )
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        // 이벤트 본문을 읽다가 끝에 도달한 경우는 손상된 이벤트
        if err.kind() == io::ErrorKind::UnexpectedEof {
            CdcError::ParseError(err.to_string())
        } else {
            CdcError::IoError(err.to_string())
        }
    }
}

impl From<mysql_async::Error> for CdcError {
    fn from(err: mysql_async::Error) -> Self {
        CdcError::QueryError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;
