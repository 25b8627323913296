//! MySQL 기반 테이블 메타데이터 협력자
//!
//! INFORMATION_SCHEMA.COLUMNS를 조회해 컬럼 이름, 타입, charset, 키 정보를 가져오고 캐시합니다.
//! DDL이 지나가면 디코더가 `invalidate`를 호출해 캐시를 비웁니다.

use crate::error::{CdcError, Result};
use crate::metadata::{ColumnMeta, TableMeta, TableMetaSource};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{OptsBuilder, Pool};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

const TABLE_COLUMNS_QUERY: &str = "SELECT COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE, COLUMN_KEY, CHARACTER_SET_NAME \
     FROM INFORMATION_SCHEMA.COLUMNS \
     WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
     ORDER BY ORDINAL_POSITION";

/// MySQL 연결 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            timeout_secs: 30,
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    fn build_opts(&self) -> OptsBuilder {
        OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
    }
}

/// INFORMATION_SCHEMA 기반 메타데이터 협력자
pub struct MysqlTableMetaSource {
    pool: Pool,
    config: ConnectionConfig,
    cache: Mutex<HashMap<(String, String), TableMeta>>,
}

impl MysqlTableMetaSource {
    pub fn new(config: ConnectionConfig) -> Self {
        info!("Using MySQL metadata source at {}", config.address());
        MysqlTableMetaSource {
            pool: Pool::new(config.build_opts()),
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// 테이블 스키마 조회
    async fn query_table(&self, schema: &str, table: &str) -> Result<Vec<ColumnMeta>> {
        let mut conn = tokio::time::timeout(self.config.timeout(), self.pool.get_conn())
            .await
            .map_err(|_| {
                CdcError::ConnectionError(format!(
                    "Timed out connecting to {}",
                    self.config.address()
                ))
            })?
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to MySQL: {}", e)))?;

        let rows: Vec<(String, String, String, String, Option<String>)> = conn
            .exec(TABLE_COLUMNS_QUERY, (schema, table))
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query table schema: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|(name, column_type, is_nullable, column_key, charset)| ColumnMeta {
                name,
                column_type,
                charset,
                nullable: is_nullable == "YES",
                is_key: column_key == "PRI",
            })
            .collect())
    }

    pub async fn disconnect(self) -> Result<()> {
        self.pool.disconnect().await?;
        Ok(())
    }
}

#[async_trait]
impl TableMetaSource for MysqlTableMetaSource {
    async fn find(&self, schema: &str, table: &str) -> Result<Option<TableMeta>> {
        let key = (schema.to_string(), table.to_string());
        let cached = self.cache.lock().get(&key).cloned();
        if cached.is_some() {
            return Ok(cached);
        }

        let columns = self.query_table(schema, table).await?;
        if columns.is_empty() {
            debug!("No columns found for {}.{}", schema, table);
            return Ok(None);
        }

        let meta = TableMeta {
            schema: key.0.clone(),
            table: key.1.clone(),
            columns,
        };
        self.cache.lock().insert(key, meta.clone());
        Ok(Some(meta))
    }

    fn invalidate(&self, schema: &str, table: Option<&str>) {
        let mut cache = self.cache.lock();
        match table {
            Some(table) => {
                cache.remove(&(schema.to_string(), table.to_string()));
            }
            None => cache.retain(|(s, _), _| s != schema),
        }
        debug!("Invalidated metadata cache for {}.{:?}", schema, table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.port, 3306);
        assert_eq!(config.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_connection_config_new() {
        let config = ConnectionConfig::new("127.0.0.1", "root");
        assert_eq!(config.address(), "127.0.0.1:3306");
        assert_eq!(config.username, "root");
    }

    #[tokio::test]
    #[ignore] // 실제 MySQL 연결 필요
    async fn test_find_table_meta() {
        let source = MysqlTableMetaSource::new(ConnectionConfig::new("localhost", "root"));
        let meta = source.find("mysql", "user").await.unwrap();
        assert!(meta.is_some());
        source.invalidate("mysql", None);
        source.disconnect().await.unwrap();
    }
}
