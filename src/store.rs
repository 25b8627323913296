//! 메모리 이벤트 스토어
//!
//! 고정 용량 링 버퍼 하나를 여러 구독자가 각자의 커서로 읽습니다.
//!
//! - 시퀀스는 1부터 증가하며, n번째로 들어온 엔트리의 시퀀스가 n입니다.
//! - 구독자마다 `ack <= get <= put`이 성립합니다.
//! - 모든 구독자가 ack한 시퀀스(최소 ack) 이하의 슬롯만 재사용됩니다. 따라서 `put - min_ack <= capacity`.
//! - 생산자(put)는 하나, 소비자는 여럿. 같은 구독자에 대한 호출은 호출자가 직렬화해야 합니다.
//!
//! 대기는 짧게 양보(yield)하며 재확인한 뒤 `Notify`로 잠듭니다.

use crate::config::{BatchMode, StoreConfig};
use crate::entry::Entry;
use crate::error::{CdcError, Result};
use crate::position::{LogIdentity, LogPosition};
use crate::server::ClientIdentity;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

/// 스토어 슬롯에 저장되는 이벤트
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub entry: Entry,
    pub identity: LogIdentity,
    /// 원본 binlog 이벤트 바이트 수 (MemSize 모드 용량 계산)
    pub raw_length: usize,
}

impl Event {
    pub fn new(entry: Entry, identity: LogIdentity) -> Self {
        let raw_length = entry.header.event_length as usize;
        Event {
            entry,
            identity,
            raw_length,
        }
    }
}

/// 구독자 커서
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    /// 전달한 마지막 시퀀스
    pub get: u64,
    /// 확인(ack)한 마지막 시퀀스
    pub ack: u64,
}

#[derive(Debug)]
struct StoreState {
    slots: Vec<Option<Arc<Event>>>,
    /// 마지막으로 넣은 시퀀스
    put: u64,
    /// 해제된(재사용 가능한) 마지막 시퀀스
    floor: u64,
    /// floor 이후 상주 엔트리의 raw_length 합
    mem_used: usize,
    /// floor 이하 마지막 트랜잭션 경계의 재시작 위치
    floor_position: Option<LogPosition>,
    cursors: HashMap<String, Cursor>,
    draining: bool,
}

impl StoreState {
    fn slot(&self, sequence: u64) -> Option<&Arc<Event>> {
        let mask = self.slots.len() as u64 - 1;
        self.slots[((sequence - 1) & mask) as usize].as_ref()
    }

    fn min_ack(&self) -> u64 {
        self.cursors
            .values()
            .map(|c| c.ack)
            .min()
            .unwrap_or(self.floor)
    }

    /// 가장 오래된 물리적으로 남아 있는 시퀀스
    fn oldest_resident(&self) -> u64 {
        self.put.saturating_sub(self.slots.len() as u64) + 1
    }

    fn release_to(&mut self, target: u64) {
        while self.floor < target {
            self.floor += 1;
            if let Some(event) = self.slot(self.floor).cloned() {
                self.mem_used = self.mem_used.saturating_sub(event.raw_length);
                if event.entry.is_boundary() {
                    self.floor_position = Some(event.entry.resume_position());
                }
            }
        }
    }

    /// floor를 과거로 되돌림. 되돌린 구간을 다시 용량에 포함
    fn rewind_to(&mut self, target: u64) {
        while self.floor > target {
            if let Some(event) = self.slot(self.floor) {
                self.mem_used += event.raw_length;
            }
            self.floor -= 1;
        }
        let oldest = self.oldest_resident();
        self.floor_position = (oldest..=self.floor)
            .rev()
            .filter_map(|sequence| self.slot(sequence))
            .find(|e| e.entry.is_boundary())
            .map(|e| e.entry.resume_position());
    }
}

/// 고정 용량 다중 구독자 이벤트 스토어
#[derive(Debug)]
pub struct MemoryEventStore {
    config: StoreConfig,
    state: Mutex<StoreState>,
    not_empty: Notify,
    not_full: Notify,
}

impl MemoryEventStore {
    pub fn new(config: StoreConfig) -> Result<Self> {
        if config.buffer_size == 0 || !config.buffer_size.is_power_of_two() {
            return Err(CdcError::Config(format!(
                "store buffer size must be a power of two, got {}",
                config.buffer_size
            )));
        }

        info!(
            "Event store created: {} slots, {:?} mode",
            config.buffer_size, config.batch_mode
        );
        Ok(MemoryEventStore {
            state: Mutex::new(StoreState {
                slots: vec![None; config.buffer_size],
                put: 0,
                floor: 0,
                mem_used: 0,
                floor_position: None,
                cursors: HashMap::new(),
                draining: false,
            }),
            config,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.config.buffer_size
    }

    /// 마지막으로 넣은 시퀀스
    pub fn put_sequence(&self) -> u64 {
        self.state.lock().put
    }

    /// 해제된 마지막 시퀀스 (모든 구독자가 ack한 지점)
    pub fn floor(&self) -> u64 {
        self.state.lock().floor
    }

    pub fn cursor(&self, client: &ClientIdentity) -> Option<Cursor> {
        self.state.lock().cursors.get(&client.key()).copied()
    }

    /// 구독 등록. 새 구독자는 남아 있는 미확인 엔트리부터 받음
    pub fn subscribe(&self, client: &ClientIdentity) {
        let mut state = self.state.lock();
        let start = state.min_ack();
        state.cursors.entry(client.key()).or_insert_with(|| {
            debug!("Subscribed {} at sequence {}", client, start);
            Cursor {
                get: start,
                ack: start,
            }
        });
    }

    /// 구독 해제. 마지막 구독자가 빠지면 그 ack 지점이 floor로 남음
    pub fn unsubscribe(&self, client: &ClientIdentity) {
        let mut state = self.state.lock();
        let Some(removed) = state.cursors.remove(&client.key()) else {
            return;
        };
        let target = if state.cursors.is_empty() {
            removed.ack.max(state.floor)
        } else {
            state.min_ack()
        };
        state.release_to(target);
        drop(state);
        debug!("Unsubscribed {}", client);
        self.not_full.notify_waiters();
    }

    /// 배치 전체를 원자적으로 넣음. 공간이 생길 때까지 대기
    pub async fn put(&self, batch: Vec<Event>) -> Result<()> {
        match self.put_within(batch, None).await? {
            true => Ok(()),
            // 마감 시간이 없으면 시간 초과도 없음
            false => Err(CdcError::Interrupted),
        }
    }

    /// `timeout` 안에 넣지 못하면 `Ok(false)`. 0이면 즉시 반환
    pub async fn try_put(&self, batch: Vec<Event>, timeout: Duration) -> Result<bool> {
        self.put_within(batch, Some(timeout)).await
    }

    async fn put_within(&self, batch: Vec<Event>, timeout: Option<Duration>) -> Result<bool> {
        if batch.is_empty() {
            return Ok(true);
        }
        if batch.len() > self.config.buffer_size {
            return Err(CdcError::Config(format!(
                "batch of {} entries exceeds store capacity {}",
                batch.len(),
                self.config.buffer_size
            )));
        }

        let batch_bytes: usize = batch.iter().map(|e| e.raw_length).sum();
        let mut pending = Some(batch);
        let result = self
            .wait_until(&self.not_full, timeout, |state| {
                if state.draining {
                    return Some(Err(CdcError::Interrupted));
                }
                if !self.has_room(state, pending.as_ref().map_or(0, Vec::len), batch_bytes) {
                    return None;
                }
                for event in pending.take().into_iter().flatten() {
                    state.put += 1;
                    let mask = state.slots.len() as u64 - 1;
                    let idx = ((state.put - 1) & mask) as usize;
                    state.mem_used += event.raw_length;
                    state.slots[idx] = Some(Arc::new(event));
                }
                Some(Ok(()))
            })
            .await;

        match result {
            Some(Ok(())) => {
                self.not_empty.notify_waiters();
                Ok(true)
            }
            Some(Err(e)) => Err(e),
            None => Ok(false),
        }
    }

    fn has_room(&self, state: &StoreState, count: usize, bytes: usize) -> bool {
        let used = state.put.saturating_sub(state.min_ack());
        if used + count as u64 > self.config.buffer_size as u64 {
            return false;
        }
        match self.config.batch_mode {
            BatchMode::ItemSize => true,
            // 스토어가 비어 있으면 용량보다 큰 배치도 받음
            BatchMode::MemSize => {
                state.mem_used == 0 || state.mem_used + bytes <= self.config.mem_capacity()
            }
        }
    }

    /// get 커서 다음 엔트리를 최대 `batch_size`만큼 전달.
    /// `timeout`이 0이면 즉시 반환하고, 양수면 엔트리 하나 이상이 오거나 시간이 지날 때까지 대기
    pub async fn get(
        &self,
        client: &ClientIdentity,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Vec<Arc<Event>>> {
        let key = client.key();
        let result = self
            .wait_until(&self.not_empty, Some(timeout), |state| {
                let Some(cursor) = state.cursors.get(&key).copied() else {
                    return Some(Err(CdcError::NotSubscribed(client.to_string())));
                };
                if cursor.get < state.put {
                    Some(Ok(self.take_batch(state, &key, cursor, batch_size)))
                } else if state.draining {
                    Some(Ok(Vec::new()))
                } else {
                    None
                }
            })
            .await;

        result.unwrap_or_else(|| Ok(Vec::new()))
    }

    fn take_batch(
        &self,
        state: &mut StoreState,
        key: &str,
        cursor: Cursor,
        batch_size: usize,
    ) -> Vec<Arc<Event>> {
        let byte_limit = batch_size.saturating_mul(self.config.mem_unit);
        let mut events: Vec<Arc<Event>> = Vec::new();
        let mut bytes = 0usize;
        let mut sequence = cursor.get;

        while sequence < state.put {
            let Some(event) = state.slot(sequence + 1).cloned() else {
                break;
            };

            if self.config.ddl_isolation && event.entry.is_ddl() {
                if events.is_empty() {
                    events.push(event);
                    sequence += 1;
                }
                break;
            }

            match self.config.batch_mode {
                BatchMode::ItemSize if events.len() >= batch_size => break,
                BatchMode::MemSize if !events.is_empty() && bytes >= byte_limit => break,
                _ => {}
            }

            bytes += event.raw_length;
            events.push(event);
            sequence += 1;
        }

        if let Some(cursor) = state.cursors.get_mut(key) {
            cursor.get = sequence;
        }
        events
    }

    /// 전달한 엔트리를 모두 확인. 확인한 구간의 재시작 위치를 돌려줌
    pub fn ack(&self, client: &ClientIdentity) -> Result<Option<LogPosition>> {
        let mut state = self.state.lock();
        let cursor = state
            .cursors
            .get_mut(&client.key())
            .ok_or_else(|| CdcError::NotSubscribed(client.to_string()))?;
        if cursor.ack == cursor.get {
            return Ok(None);
        }
        cursor.ack = cursor.get;
        let acked = cursor.ack;

        let position = state.slot(acked).map(|e| e.entry.resume_position());
        let target = state.min_ack();
        if target > state.floor {
            state.release_to(target);
            drop(state);
            self.not_full.notify_waiters();
        }
        Ok(position)
    }

    /// 확인하지 않은 엔트리를 다시 전달하도록 get 커서를 되돌림
    pub fn rollback(&self, client: &ClientIdentity) -> Result<()> {
        let mut state = self.state.lock();
        let cursor = state
            .cursors
            .get_mut(&client.key())
            .ok_or_else(|| CdcError::NotSubscribed(client.to_string()))?;
        cursor.get = cursor.ack;
        Ok(())
    }

    /// 물리적으로 남아 있는 엔트리 중 `position`까지 처리한 것에 해당하는 시퀀스
    pub fn resolve(&self, position: &LogPosition) -> Option<u64> {
        let state = self.state.lock();
        if state.put == 0 {
            return None;
        }
        let oldest = state.oldest_resident();

        // 가장 오래된 엔트리보다 앞선 위치면 사이 구간이 유실되었을 수 있음
        let first = state.slot(oldest)?.entry.position();
        if position.compare(&first) == Ordering::Less {
            return None;
        }

        (oldest..=state.put).rev().find(|seq| {
            state
                .slot(*seq)
                .map_or(false, |e| e.entry.resume_position().compare(position) != Ordering::Greater)
        })
    }

    /// 커서를 `sequence`(처리 완료 지점)로 옮김
    pub fn subscribe_at(&self, client: &ClientIdentity, sequence: u64) -> Result<()> {
        let mut state = self.state.lock();
        let oldest = state.oldest_resident();
        if sequence + 1 < oldest || sequence > state.put {
            return Err(CdcError::PositionNotFound(format!(
                "sequence {} outside resident range {}..={}",
                sequence, oldest, state.put
            )));
        }

        state.cursors.insert(
            client.key(),
            Cursor {
                get: sequence,
                ack: sequence,
            },
        );
        if sequence < state.floor {
            state.rewind_to(sequence);
        } else {
            let target = state.min_ack();
            state.release_to(target);
        }
        Ok(())
    }

    /// 다음에 전달될 (확인하지 않은 첫) 엔트리 위치
    pub fn first_position(&self, client: &ClientIdentity) -> Option<LogPosition> {
        let state = self.state.lock();
        let cursor = state.cursors.get(&client.key())?;
        if cursor.ack >= state.put {
            return None;
        }
        state.slot(cursor.ack + 1).map(|e| e.entry.position())
    }

    /// 마지막으로 넣은 엔트리의 재시작 위치
    pub fn latest_position(&self) -> Option<LogPosition> {
        let state = self.state.lock();
        if state.put == 0 {
            return None;
        }
        state.slot(state.put).map(|e| e.entry.resume_position())
    }

    /// 모든 구독자가 확인한 마지막 트랜잭션 경계의 재시작 위치
    pub fn floor_position(&self) -> Option<LogPosition> {
        self.state.lock().floor_position.clone()
    }

    /// 종료 준비. 대기 중인 get은 반환하고 막힌 put은 `Interrupted`로 실패
    pub fn stop(&self) {
        self.state.lock().draining = true;
        info!("Event store draining");
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub fn is_draining(&self) -> bool {
        self.state.lock().draining
    }

    /// 조건이 성립할 때까지 대기. 시간이 지나면 None
    async fn wait_until<T>(
        &self,
        notify: &Notify,
        timeout: Option<Duration>,
        mut check: impl FnMut(&mut StoreState) -> Option<T>,
    ) -> Option<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut spins = 0;

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let ready = {
                let mut state = self.state.lock();
                check(&mut state)
            };
            if ready.is_some() {
                return ready;
            }
            if timeout == Some(Duration::ZERO) {
                return None;
            }

            if spins < self.config.spin_tries {
                spins += 1;
                tokio::task::yield_now().await;
                continue;
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        // 마감 직전에 들어온 변경 한 번 더 확인
                        let mut state = self.state.lock();
                        return check(&mut state);
                    }
                }
                None => notified.await,
            }
        }
    }
}
