//! GTID (Global Transaction ID) 관리
//!
//! GTID 형식: UUID:sequence-number
//! 여러 서버의 GTID 집합: "uuid1:1-100:105,uuid2:1-50"

use crate::error::{CdcError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Cursor, Read};
use uuid::Uuid;

/// GTID 범위 (양 끝 포함)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GtidRange {
    pub start: u64,
    pub end: u64,
}

impl GtidRange {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start == 0 || start > end {
            return Err(CdcError::GtidError(format!(
                "Invalid range: {}-{}",
                start, end
            )));
        }
        Ok(GtidRange { start, end })
    }

    pub fn contains(&self, value: u64) -> bool {
        value >= self.start && value <= self.end
    }
}

impl fmt::Display for GtidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// UUID 하나에 대한 정렬/병합된 범위 목록
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UuidSet {
    ranges: Vec<GtidRange>,
}

impl UuidSet {
    pub fn ranges(&self) -> &[GtidRange] {
        &self.ranges
    }

    pub fn add_range(&mut self, range: GtidRange) {
        self.ranges.push(range);
        self.normalize();
    }

    pub fn contains(&self, sequence: u64) -> bool {
        // 정렬되어 있으므로 이진 탐색
        let idx = self.ranges.partition_point(|r| r.end < sequence);
        self.ranges.get(idx).map_or(false, |r| r.contains(sequence))
    }

    /// 범위를 정렬하고 겹치거나 연접한 범위를 병합
    fn normalize(&mut self) {
        self.ranges.sort();
        let mut merged: Vec<GtidRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if last.end.saturating_add(1) >= range.start => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        self.ranges = merged;
    }

    fn subtract_range(&mut self, other: &GtidRange) {
        let mut result = Vec::with_capacity(self.ranges.len() + 1);
        for range in &self.ranges {
            if range.end < other.start || range.start > other.end {
                result.push(*range);
                continue;
            }
            if range.start < other.start {
                result.push(GtidRange { start: range.start, end: other.start - 1 });
            }
            if range.end > other.end {
                result.push(GtidRange { start: other.end + 1, end: range.end });
            }
        }
        self.ranges = result;
    }
}

/// 전체 GTID 집합 (여러 UUID)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidSet {
    sets: BTreeMap<Uuid, UuidSet>,
}

impl GtidSet {
    pub fn new() -> Self {
        GtidSet {
            sets: BTreeMap::new(),
        }
    }

    /// GTID 집합 문자열 파싱 (format: "uuid1:1-100:200,uuid2:1-50")
    pub fn parse(gtid_str: &str) -> Result<Self> {
        let mut gtid_set = GtidSet::new();

        let trimmed = gtid_str.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("NULL") {
            return Ok(gtid_set);
        }

        for part in trimmed.split(',') {
            // SHOW MASTER STATUS 출력은 ','뒤에 개행이 들어감
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let mut pieces = part.split(':');
            let uuid_str = pieces.next().unwrap_or_default();
            let uuid = Uuid::parse_str(uuid_str.trim())
                .map_err(|e| CdcError::GtidError(format!("Invalid uuid {}: {}", uuid_str, e)))?;

            let mut has_interval = false;
            for interval in pieces {
                has_interval = true;
                gtid_set.add_range(uuid, parse_interval(interval.trim())?);
            }
            if !has_interval {
                return Err(CdcError::GtidError(format!("Missing interval: {}", part)));
            }
        }

        Ok(gtid_set)
    }

    /// PREVIOUS_GTIDS 이벤트의 바이너리 인코딩 파싱
    ///
    /// n_sids(8) + [uuid(16) + n_intervals(8) + [start(8) + end(8, exclusive)]*]*
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let mut gtid_set = GtidSet::new();

        let n_sids = cursor.read_u64::<LittleEndian>()?;
        for _ in 0..n_sids {
            let mut uuid_bytes = [0u8; 16];
            cursor.read_exact(&mut uuid_bytes)?;
            let uuid = Uuid::from_bytes(uuid_bytes);

            let n_intervals = cursor.read_u64::<LittleEndian>()?;
            for _ in 0..n_intervals {
                let start = cursor.read_u64::<LittleEndian>()?;
                let end = cursor.read_u64::<LittleEndian>()?;
                if end <= start {
                    return Err(CdcError::ParseError(format!(
                        "Invalid gtid interval {}-{}",
                        start, end
                    )));
                }
                gtid_set.add_range(uuid, GtidRange::new(start, end - 1)?);
            }
        }

        Ok(gtid_set)
    }

    pub fn add_range(&mut self, uuid: Uuid, range: GtidRange) {
        self.sets.entry(uuid).or_default().add_range(range);
    }

    pub fn add(&mut self, uuid: Uuid, sequence: u64) -> Result<()> {
        self.add_range(uuid, GtidRange::new(sequence, sequence)?);
        Ok(())
    }

    /// "uuid:sequence" 형식의 단일 GTID 추가
    pub fn add_gtid(&mut self, gtid: &str) -> Result<()> {
        let (uuid, sequence) = split_gtid(gtid)?;
        self.add(uuid, sequence)
    }

    pub fn contains(&self, uuid: &Uuid, sequence: u64) -> bool {
        self.sets
            .get(uuid)
            .map_or(false, |set| set.contains(sequence))
    }

    pub fn contains_gtid(&self, gtid: &str) -> bool {
        match split_gtid(gtid) {
            Ok((uuid, sequence)) => self.contains(&uuid, sequence),
            Err(_) => false,
        }
    }

    /// 다른 집합의 모든 GTID를 합침
    pub fn union(&mut self, other: &GtidSet) {
        for (uuid, set) in &other.sets {
            for range in set.ranges() {
                self.add_range(*uuid, *range);
            }
        }
    }

    pub fn subtract(&self, other: &GtidSet) -> GtidSet {
        let mut result = self.clone();

        for (uuid, other_set) in &other.sets {
            if let Some(result_set) = result.sets.get_mut(uuid) {
                for other_range in other_set.ranges() {
                    result_set.subtract_range(other_range);
                }
            }
        }

        result.sets.retain(|_, set| !set.ranges.is_empty());
        result
    }

    /// `other`의 모든 GTID가 이 집합에 포함되는지
    pub fn is_superset_of(&self, other: &GtidSet) -> bool {
        other.subtract(self).is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(|set| set.ranges.is_empty())
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (uuid, set) in &self.sets {
            if set.ranges.is_empty() {
                continue;
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{}", uuid)?;
            for range in &set.ranges {
                write!(f, ":{}", range)?;
            }
        }
        Ok(())
    }
}

fn parse_interval(interval: &str) -> Result<GtidRange> {
    let parse_num = |s: &str| {
        s.trim()
            .parse::<u64>()
            .map_err(|_| CdcError::GtidError(format!("Invalid interval: {}", interval)))
    };

    match interval.split_once('-') {
        Some((start, end)) => GtidRange::new(parse_num(start)?, parse_num(end)?),
        None => {
            let seq = parse_num(interval)?;
            GtidRange::new(seq, seq)
        }
    }
}

fn split_gtid(gtid: &str) -> Result<(Uuid, u64)> {
    let (uuid, sequence) = gtid
        .rsplit_once(':')
        .ok_or_else(|| CdcError::GtidError(format!("Invalid GTID format: {}", gtid)))?;
    let uuid = Uuid::parse_str(uuid)
        .map_err(|e| CdcError::GtidError(format!("Invalid uuid {}: {}", uuid, e)))?;
    let sequence = sequence
        .parse::<u64>()
        .map_err(|_| CdcError::GtidError(format!("Invalid sequence: {}", sequence)))?;
    Ok((uuid, sequence))
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID_A: &str = "550e8400-e29b-41d4-a716-446655440000";
    const UUID_B: &str = "726757ad-4455-11e8-ae04-0242ac110002";

    #[test]
    fn test_gtid_parse() {
        let text = format!("{}:1-100:200:300-400,\n{}:1-5", UUID_A, UUID_B);
        let gtid_set = GtidSet::parse(&text).unwrap();
        assert!(gtid_set.contains_gtid(&format!("{}:50", UUID_A)));
        assert!(gtid_set.contains_gtid(&format!("{}:200", UUID_A)));
        assert!(!gtid_set.contains_gtid(&format!("{}:201", UUID_A)));
        assert!(gtid_set.contains_gtid(&format!("{}:5", UUID_B)));
        assert_eq!(
            gtid_set.to_string(),
            format!("{}:1-100:200:300-400,{}:1-5", UUID_A, UUID_B)
        );
    }

    #[test]
    fn test_gtid_parse_rejects_garbage() {
        assert!(GtidSet::parse("not-a-uuid:1-2").is_err());
        assert!(GtidSet::parse(&format!("{}:5-1", UUID_A)).is_err());
        assert!(GtidSet::parse(&format!("{}", UUID_A)).is_err());
        assert!(GtidSet::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_gtid_contains() {
        let mut gtid_set = GtidSet::new();
        gtid_set.add_gtid(&format!("{}:50", UUID_A)).unwrap();
        assert!(gtid_set.contains_gtid(&format!("{}:50", UUID_A)));
        assert!(!gtid_set.contains_gtid(&format!("{}:51", UUID_A)));
    }

    #[test]
    fn test_adjacent_sequences_merge() {
        let mut gtid_set = GtidSet::new();
        for seq in [3, 1, 2, 7, 5, 6] {
            gtid_set.add_gtid(&format!("{}:{}", UUID_A, seq)).unwrap();
        }
        assert_eq!(gtid_set.to_string(), format!("{}:1-3:5-7", UUID_A));
    }

    #[test]
    fn test_subtract_and_superset() {
        let all = GtidSet::parse(&format!("{}:1-10", UUID_A)).unwrap();
        let some = GtidSet::parse(&format!("{}:3-4:8", UUID_A)).unwrap();
        let rest = all.subtract(&some);
        assert_eq!(rest.to_string(), format!("{}:1-2:5-7:9-10", UUID_A));
        assert!(all.is_superset_of(&some));
        assert!(!some.is_superset_of(&all));
        assert!(all.subtract(&all).is_empty());
    }

    #[test]
    fn test_decode_previous_gtids() {
        let uuid = Uuid::parse_str(UUID_B).unwrap();
        let mut data = Vec::new();
        data.extend_from_slice(&1u64.to_le_bytes());
        data.extend_from_slice(uuid.as_bytes());
        data.extend_from_slice(&2u64.to_le_bytes());
        data.extend_from_slice(&1u64.to_le_bytes());
        data.extend_from_slice(&4u64.to_le_bytes());
        data.extend_from_slice(&6u64.to_le_bytes());
        data.extend_from_slice(&7u64.to_le_bytes());

        let gtid_set = GtidSet::decode(&data).unwrap();
        assert_eq!(gtid_set.to_string(), format!("{}:1-3:6", UUID_B));
    }
}
