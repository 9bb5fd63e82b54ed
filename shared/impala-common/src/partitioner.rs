//! Partition model for Kudu tables
//!
//! A table carries at most one hash partitioning, fixed at creation, and an
//! ordered set of half-open range partitions over an integer key (epoch
//! milliseconds for temporal columns). Range partitions never overlap.
//!
//! Rows are grouped into buckets of `bucket_size` key units:
//! `bucket = floor(key / bucket_size)`. A bucket is only requested when the
//! row's key is not already inside an existing range.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

use crate::error::{ImpalaError, ImpalaResult};

/// Half-open interval `[start, end)` of partition keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RangePartition {
    pub start: i64,
    pub end: i64,
}

impl RangePartition {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, key: i64) -> bool {
        key >= self.start && key < self.end
    }

    pub fn overlaps(&self, other: &RangePartition) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

impl fmt::Display for RangePartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <= VALUES < {}", self.start, self.end)
    }
}

/// `PARTITION BY HASH (columns) PARTITIONS partitions`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashPartition {
    pub columns: Vec<String>,
    pub partitions: u32,
}

/// Bucket index of a partition key
pub fn bucket_of(key: i64, bucket_size: i64) -> i64 {
    key.div_euclid(bucket_size)
}

/// Key interval spanned by one bucket
pub fn bucket_range(bucket: i64, bucket_size: i64) -> ImpalaResult<RangePartition> {
    let start = bucket.checked_mul(bucket_size);
    let end = start.and_then(|s| s.checked_add(bucket_size));
    match (start, end) {
        (Some(start), Some(end)) => Ok(RangePartition::new(start, end)),
        _ => Err(ImpalaError::Schema(format!(
            "bucket {} of size {} is outside the partition key range",
            bucket, bucket_size
        ))),
    }
}

const HASH_PATTERN: &str =
    r"(?i)PARTITION\s+BY\s+HASH\s*\((?P<columns>[^)]*)\)\s*PARTITIONS\s+(?P<partitions>\d+)";
const RANGE_PATTERN: &str = r"(?i)^\s*(?P<min>-?\d+)\s*<=\s*VALUES\s*<\s*(?P<max>-?\d+)\s*$";
const SINGLE_VALUE_PATTERN: &str = r"(?i)^\s*VALUE\s*=\s*(?P<value>-?\d+)\s*$";

fn compile(pattern: &str) -> ImpalaResult<Regex> {
    Regex::new(pattern).map_err(|e| {
        ImpalaError::Schema(format!("partition pattern failed to compile: {}", e))
    })
}

/// Hash partitioning plus the ordered, non-overlapping range partitions of one table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSet {
    pub hash: Option<HashPartition>,
    ranges: Vec<RangePartition>,
}

impl PartitionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `show create table` text and `show range partitions` lines
    ///
    /// Lines that match neither `<min> <= VALUES < <max>` nor `VALUE = <n>`
    /// are ignored. Overlapping lines are dropped with a debug log.
    pub fn parse<S: AsRef<str>>(create_table: &str, range_lines: &[S]) -> ImpalaResult<Self> {
        let hash_regex = compile(HASH_PATTERN)?;
        let range_regex = compile(RANGE_PATTERN)?;
        let single_value_regex = compile(SINGLE_VALUE_PATTERN)?;

        let hash = hash_regex.captures(create_table).and_then(|caps| {
            let partitions = caps["partitions"].parse().ok()?;
            let columns = caps["columns"]
                .split(',')
                .map(|c| c.trim().trim_matches('`').to_string())
                .filter(|c| !c.is_empty())
                .collect();
            Some(HashPartition {
                columns,
                partitions,
            })
        });

        let mut set = Self { hash, ranges: Vec::new() };
        for line in range_lines {
            let line = line.as_ref();
            let range = if let Some(caps) = range_regex.captures(line) {
                match (caps["min"].parse(), caps["max"].parse()) {
                    (Ok(min), Ok(max)) => Some(RangePartition::new(min, max)),
                    _ => None,
                }
            } else if let Some(caps) = single_value_regex.captures(line) {
                caps["value"]
                    .parse::<i64>()
                    .ok()
                    .and_then(|v| v.checked_add(1).map(|end| RangePartition::new(v, end)))
            } else {
                None
            };

            if let Some(range) = range {
                if let Err(e) = set.insert(range) {
                    debug!(line = %line, error = %e, "Ignoring range partition line");
                }
            }
        }
        Ok(set)
    }

    /// Ranges ordered by start
    pub fn ranges(&self) -> &[RangePartition] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Range containing `key`, if any
    pub fn covering(&self, key: i64) -> Option<&RangePartition> {
        let idx = self.ranges.partition_point(|r| r.start <= key);
        idx.checked_sub(1)
            .map(|i| &self.ranges[i])
            .filter(|r| r.contains(key))
    }

    pub fn covers(&self, key: i64) -> bool {
        self.covering(key).is_some()
    }

    /// Add a range; empty or overlapping ranges are rejected
    pub fn insert(&mut self, range: RangePartition) -> ImpalaResult<()> {
        if range.is_empty() {
            return Err(ImpalaError::InvalidRequest(format!(
                "empty range partition {}",
                range
            )));
        }
        if let Some(existing) = self.ranges.iter().find(|r| r.overlaps(&range)) {
            return Err(ImpalaError::Server(format!(
                "New range partition {} conflicts with existing range partition {}",
                range, existing
            )));
        }
        let idx = self.ranges.partition_point(|r| r.start < range.start);
        self.ranges.insert(idx, range);
        Ok(())
    }

    pub fn remove(&mut self, range: &RangePartition) -> bool {
        match self.ranges.iter().position(|r| r == range) {
            Some(idx) => {
                self.ranges.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Ranges to add so that every key lands in a partition
    ///
    /// Each uncovered key asks for its bucket's interval, clipped to the gap
    /// between existing neighbours so the result never overlaps what is
    /// already there. The returned ranges are deduplicated and sorted.
    pub fn missing_partitions<I>(&self, keys: I, bucket_size: i64) -> ImpalaResult<Vec<RangePartition>>
    where
        I: IntoIterator<Item = i64>,
    {
        if bucket_size <= 0 {
            return Err(ImpalaError::InvalidRequest(format!(
                "bucket size must be positive, got {}",
                bucket_size
            )));
        }

        let mut missing = BTreeSet::new();
        for key in keys {
            if self.covers(key) {
                continue;
            }
            let bucket = bucket_range(bucket_of(key, bucket_size), bucket_size)?;
            missing.insert(self.clip_to_gap(bucket, key));
        }
        Ok(missing.into_iter().collect())
    }

    /// Narrow `bucket` to the free gap that holds `key`
    fn clip_to_gap(&self, bucket: RangePartition, key: i64) -> RangePartition {
        let mut start = bucket.start;
        let mut end = bucket.end;
        for range in self.ranges.iter().filter(|r| r.overlaps(&bucket)) {
            if range.end <= key {
                start = start.max(range.end);
            } else if range.start > key {
                end = end.min(range.start);
            }
        }
        RangePartition::new(start, end)
    }

    /// Ranges that end at or before `cutoff`
    pub fn expired(&self, cutoff: i64) -> Vec<RangePartition> {
        self.ranges
            .iter()
            .filter(|r| r.end <= cutoff)
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 86_400_000;

    #[test]
    fn test_parse_show_create_table() {
        let create = "CREATE TABLE default.measurements (\n  id BIGINT NOT NULL,\n  PRIMARY KEY (id, observed_at)\n)\nPARTITION BY HASH (id, host) PARTITIONS 16, RANGE (observed_at) (...)\nSTORED AS KUDU";
        let lines = vec![
            "VALUE = 0".to_string(),
            "432000000 <= VALUES < 864000000".to_string(),
            "0 <= VALUES < 10 garbage".to_string(),
            "VALUES < 0".to_string(),
        ];
        let set = PartitionSet::parse(create, &lines).unwrap();

        let hash = set.hash.clone().unwrap();
        assert_eq!(hash.columns, vec!["id", "host"]);
        assert_eq!(hash.partitions, 16);
        assert_eq!(
            set.ranges(),
            &[
                RangePartition::new(0, 1),
                RangePartition::new(432_000_000, 864_000_000)
            ]
        );
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        let set = PartitionSet::parse(
            "partition by hash (id) partitions 4",
            &["-10 <= values < 10"],
        )
        .unwrap();
        assert_eq!(set.hash.as_ref().unwrap().partitions, 4);
        assert_eq!(set.ranges(), &[RangePartition::new(-10, 10)]);
    }

    #[test]
    fn test_parse_without_partitions() {
        let set = PartitionSet::parse::<&str>("CREATE TABLE t (id INT)", &[]).unwrap();
        assert!(set.hash.is_none());
        assert!(set.is_empty());
    }

    #[test]
    fn test_covers_half_open() {
        let mut set = PartitionSet::new();
        set.insert(RangePartition::new(10, 20)).unwrap();
        set.insert(RangePartition::new(30, 40)).unwrap();
        assert!(set.covers(10));
        assert!(set.covers(19));
        assert!(!set.covers(20));
        assert!(!set.covers(25));
        assert!(set.covers(39));
        assert!(!set.covers(9));
    }

    #[test]
    fn test_insert_rejects_overlap() {
        let mut set = PartitionSet::new();
        set.insert(RangePartition::new(0, 10)).unwrap();
        let err = set.insert(RangePartition::new(5, 15)).unwrap_err();
        assert!(err.is_partition_race());
        assert!(set.insert(RangePartition::new(10, 15)).is_ok());
        assert!(set.insert(RangePartition::new(7, 7)).is_err());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_bucket_of_negative_keys() {
        assert_eq!(bucket_of(-1, 10), -1);
        assert_eq!(bucket_of(0, 10), 0);
        assert_eq!(bucket_of(19, 10), 1);
        assert_eq!(bucket_range(-1, 10).unwrap(), RangePartition::new(-10, 0));
        assert!(bucket_range(i64::MAX, 10).is_err());
    }

    #[test]
    fn test_missing_partitions_twenty_days_five_day_buckets() {
        let bucket = 5 * DAY;
        let base = 100 * bucket;
        let keys = vec![base + DAY, base + 6 * DAY, base + 11 * DAY, base + 19 * DAY];

        let mut set = PartitionSet::new();
        set.insert(RangePartition::new(base + bucket, base + 2 * bucket))
            .unwrap();

        let missing = set.missing_partitions(keys.clone(), bucket).unwrap();
        assert_eq!(
            missing,
            vec![
                RangePartition::new(base, base + bucket),
                RangePartition::new(base + 2 * bucket, base + 3 * bucket),
                RangePartition::new(base + 3 * bucket, base + 4 * bucket),
            ]
        );

        for range in missing {
            set.insert(range).unwrap();
        }
        assert!(set.missing_partitions(keys, bucket).unwrap().is_empty());
    }

    #[test]
    fn test_missing_partitions_deduplicates() {
        let set = PartitionSet::new();
        let missing = set.missing_partitions([1, 2, 3, 9], 10).unwrap();
        assert_eq!(missing, vec![RangePartition::new(0, 10)]);
    }

    #[test]
    fn test_missing_partitions_clips_around_bootstrap_value() {
        let mut set = PartitionSet::new();
        set.insert(RangePartition::new(0, 1)).unwrap();

        let missing = set.missing_partitions([0, 5, 15], 10).unwrap();
        assert_eq!(
            missing,
            vec![RangePartition::new(1, 10), RangePartition::new(10, 20)]
        );
        for range in &missing {
            assert!(set.ranges().iter().all(|r| !r.overlaps(range)));
        }
    }

    #[test]
    fn test_missing_partitions_rejects_bad_bucket_size() {
        let set = PartitionSet::new();
        assert!(set.missing_partitions([1], 0).is_err());
    }

    #[test]
    fn test_expired() {
        let mut set = PartitionSet::new();
        set.insert(RangePartition::new(0, 10)).unwrap();
        set.insert(RangePartition::new(10, 20)).unwrap();
        set.insert(RangePartition::new(20, 30)).unwrap();

        assert_eq!(
            set.expired(20),
            vec![RangePartition::new(0, 10), RangePartition::new(10, 20)]
        );
        assert!(set.remove(&RangePartition::new(0, 10)));
        assert!(!set.remove(&RangePartition::new(0, 10)));
        assert_eq!(set.expired(5), vec![]);
    }
}
