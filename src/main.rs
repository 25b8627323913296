/// binlog 재생 예제
///
/// 디렉터리의 binlog 파일을 디코딩해 이벤트 스토어에 넣고, 소비자 하나가 엔트리를 JSON 줄로 출력합니다.
use mysql_cdc::config::CdcConfig;
use mysql_cdc::position::StartPosition;
use mysql_cdc::server::{ClientIdentity, Destination};
use mysql_cdc::sink::EntryEventSink;
use mysql_cdc::{BinlogParser, FileSource, MemoryEventStore, MemoryPositionManager, MysqlTableMetaSource};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

fn load_config() -> Result<CdcConfig, Box<dyn std::error::Error>> {
    let mut config = match env::var("CDC_CONFIG") {
        Ok(path) => CdcConfig::from_file(path)?,
        Err(_) => {
            let mut config = CdcConfig::default();
            // 설정 파일이 없으면 처음부터 재생
            config.parser.start = StartPosition::Timestamp { timestamp: 0 };
            config
        }
    };

    if let Ok(dir) = env::var("BINLOG_DIR") {
        config.binlog_dir = Some(dir.into());
    }
    if let Ok(file) = env::var("BINLOG_START_FILE") {
        config.parser.start = StartPosition::FilePosition {
            journal_name: file,
            position: env::var("BINLOG_START_POS")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(4),
        };
    }
    if let Ok(filter) = env::var("CDC_FILTER") {
        config.sink.include = filter;
    }
    if let Ok(host) = env::var("DB_HOST") {
        config.connection.hostname = host;
        config.connection.port = env::var("DB_PORT")
            .unwrap_or_else(|_| "3306".to_string())
            .parse()
            .unwrap_or(3306);
        config.connection.username = env::var("DB_USER").unwrap_or_else(|_| "root".to_string());
        config.connection.password = env::var("DB_PASSWORD").unwrap_or_default();
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    tracing_subscriber::fmt::init();

    let config = load_config()?;
    let dir = config
        .binlog_dir
        .clone()
        .ok_or("BINLOG_DIR or binlog_dir must point to a binlog directory")?;

    info!("Starting MySQL CDC replay of {}", dir.display());

    let store = Arc::new(MemoryEventStore::new(config.store.clone())?);
    let sink = Arc::new(EntryEventSink::new(store.clone(), config.sink.clone())?);
    let positions = Arc::new(MemoryPositionManager::new());
    let destination = Destination::new(config.parser.destination.clone(), store.clone(), positions.clone());

    let client = ClientIdentity::new(config.parser.destination.clone(), 1, "");
    destination.subscribe(&client)?;

    let mut parser = BinlogParser::new(
        config.parser.clone(),
        Box::new(FileSource::new(dir)),
        sink,
        positions,
    );
    // 테이블 메타데이터는 DB_HOST가 있을 때만 조회
    if env::var("DB_HOST").is_ok() {
        parser = parser.with_meta_source(Arc::new(MysqlTableMetaSource::new(config.connection.clone())));
    }
    let handle = parser.start();

    let batch_size = config.sink.batch_size;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            message = destination.get(&client, batch_size, Duration::from_millis(500)) => {
                let message = message?;
                for event in &message.events {
                    println!("{}", serde_json::to_string(&event.entry)?);
                }
                if message.is_empty() && handle.is_finished() {
                    info!("Replay finished");
                    break;
                }
            }
        }
    }

    if let Err(e) = handle.stop().await {
        warn!("Parser stopped with error: {}", e);
    }
    if let Some(position) = store.floor_position() {
        info!("Consumed up to {}", position);
    }
    Ok(())
}
