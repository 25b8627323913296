//! 소비자 API
//!
//! [`Destination`] 하나가 스토어와 위치 저장소를 묶어 구독자별 get/ack/rollback을 제공합니다.
//! 구독자 필터는 전달 시점에 적용되며, 걸러진 엔트리도 커서는 전진합니다.

use crate::error::{CdcError, Result};
use crate::filter::NameFilter;
use crate::position::{LogPosition, PositionManager};
use crate::store::{Event, MemoryEventStore};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// 구독자 식별자
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub destination: String,
    pub client_id: u16,
    /// `schema.table` 정규식 (콤마 구분). 비어 있으면 전체
    pub filter: String,
}

impl ClientIdentity {
    pub fn new(destination: impl Into<String>, client_id: u16, filter: impl Into<String>) -> Self {
        ClientIdentity {
            destination: destination.into(),
            client_id,
            filter: filter.into(),
        }
    }

    /// 커서 키 (필터는 포함하지 않음)
    pub fn key(&self) -> String {
        format!("{}:{}", self.destination, self.client_id)
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.destination, self.client_id)
    }
}

/// get 결과
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// 이 배치까지 전달된 마지막 시퀀스
    pub batch_id: u64,
    pub events: Vec<Arc<Event>>,
}

impl Message {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

pub struct Destination {
    name: String,
    store: Arc<MemoryEventStore>,
    positions: Arc<dyn PositionManager>,
    filters: RwLock<HashMap<String, NameFilter>>,
}

impl Destination {
    pub fn new(
        name: impl Into<String>,
        store: Arc<MemoryEventStore>,
        positions: Arc<dyn PositionManager>,
    ) -> Self {
        Destination {
            name: name.into(),
            store,
            positions,
            filters: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<MemoryEventStore> {
        &self.store
    }

    fn check(&self, client: &ClientIdentity) -> Result<()> {
        if client.destination != self.name {
            return Err(CdcError::NotSubscribed(format!(
                "{} does not belong to destination {}",
                client, self.name
            )));
        }
        Ok(())
    }

    /// 구독 등록 (이미 있으면 필터만 갱신)
    pub fn subscribe(&self, client: &ClientIdentity) -> Result<()> {
        self.check(client)?;
        let filter = NameFilter::include(&client.filter)?;
        self.filters.write().insert(client.key(), filter);
        self.store.subscribe(client);
        info!("Client {} subscribed (filter: '{}')", client, client.filter);
        Ok(())
    }

    /// `position`까지 처리한 것으로 보고 그 다음부터 구독
    pub fn subscribe_from(&self, client: &ClientIdentity, position: &LogPosition) -> Result<()> {
        self.check(client)?;
        let sequence = self.store.resolve(position).ok_or_else(|| {
            CdcError::PositionNotFound(format!("{} is not resident in the store", position))
        })?;
        let filter = NameFilter::include(&client.filter)?;
        self.filters.write().insert(client.key(), filter);
        self.store.subscribe_at(client, sequence)?;
        info!("Client {} subscribed from {} (sequence {})", client, position, sequence);
        Ok(())
    }

    pub fn unsubscribe(&self, client: &ClientIdentity) -> Result<()> {
        self.check(client)?;
        self.filters.write().remove(&client.key());
        self.store.unsubscribe(client);
        info!("Client {} unsubscribed", client);
        Ok(())
    }

    /// 전달 후 바로 ack
    pub async fn get(
        &self,
        client: &ClientIdentity,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Message> {
        let message = self.get_without_ack(client, batch_size, timeout).await?;
        self.ack(client).await?;
        Ok(message)
    }

    pub async fn get_without_ack(
        &self,
        client: &ClientIdentity,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Message> {
        self.check(client)?;
        let events = self.store.get(client, batch_size, timeout).await?;
        let batch_id = self.store.cursor(client).map_or(0, |c| c.get);

        let filters = self.filters.read();
        let events = match filters.get(&client.key()) {
            Some(filter) if !filter.is_empty() => events
                .into_iter()
                .filter(|e| {
                    e.entry.is_transaction_marker()
                        || e.entry.header.table.is_empty()
                        || filter.matches(&e.entry.header.schema, &e.entry.header.table)
                })
                .collect(),
            _ => events,
        };

        Ok(Message { batch_id, events })
    }

    /// 확인한 구간의 재시작 위치를 돌려주고, 모든 구독자가 확인한 마지막 트랜잭션 경계를 위치 저장소에 기록
    pub async fn ack(&self, client: &ClientIdentity) -> Result<Option<LogPosition>> {
        self.check(client)?;
        let position = self.store.ack(client)?;
        if position.is_some() {
            if let Some(floor) = self.store.floor_position() {
                debug!("Persisting {} for {}", floor, self.name);
                self.positions.persist(&self.name, &floor).await?;
            }
        }
        Ok(position)
    }

    pub fn rollback(&self, client: &ClientIdentity) -> Result<()> {
        self.check(client)?;
        self.store.rollback(client)
    }
}
