//! Partitioning of record collections into keyed buckets.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::TIMESTAMP_FORMAT;

/// A key domain the grouping engine can bucket by.
pub trait GroupKey: Ord + Clone {
    fn key_string(&self) -> String;
}

impl GroupKey for i64 {
    fn key_string(&self) -> String {
        self.to_string()
    }
}

impl GroupKey for u32 {
    fn key_string(&self) -> String {
        self.to_string()
    }
}

impl GroupKey for String {
    fn key_string(&self) -> String {
        self.clone()
    }
}

impl GroupKey for DateTime<Utc> {
    fn key_string(&self) -> String {
        self.format(TIMESTAMP_FORMAT).to_string()
    }
}

/// Bucket key with an explicit sentinel for records the extractor had no value for.
///
/// Variant order makes `Absent` sort before every present key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BucketKey<K> {
    Absent,
    Present(K),
}

pub const ABSENT_KEY_STRING: &str = "None";

impl<K: GroupKey> BucketKey<K> {
    pub fn key_string(&self) -> String {
        match self {
            Self::Absent => ABSENT_KEY_STRING.to_string(),
            Self::Present(key) => key.key_string(),
        }
    }

    pub fn value(&self) -> Option<&K> {
        match self {
            Self::Absent => None,
            Self::Present(key) => Some(key),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

/// Borrowed view of one bucket of a [`Grouped`] collection.
#[derive(Debug)]
pub struct Bucket<'a, K, R> {
    key: BucketKey<K>,
    members: &'a [R],
}

// Manual impls: derived ones would demand `R: Clone`.
impl<K: Clone, R> Clone for Bucket<'_, K, R> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            members: self.members,
        }
    }
}

impl<'a, K: GroupKey, R> Bucket<'a, K, R> {
    pub fn key(&self) -> &BucketKey<K> {
        &self.key
    }

    pub fn key_string(&self) -> String {
        self.key.key_string()
    }

    pub fn members(&self) -> &'a [R] {
        self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn cmp_by_key(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }

    pub fn cmp_by_size(&self, other: &Self) -> Ordering {
        self.len()
            .cmp(&other.len())
            .then_with(|| self.cmp_by_key(other))
    }

    pub fn summary(&self) -> BucketSummary {
        BucketSummary {
            key: self.key_string(),
            count: self.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketOrder {
    ByKey,
    BySize,
}

/// Display-ready bucket, independent of the key domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSummary {
    pub key: String,
    pub count: usize,
}

/// Records partitioned by key, plus the bucket of records without a key.
#[derive(Debug, Clone)]
pub struct Grouped<K, R> {
    groups: BTreeMap<K, Vec<R>>,
    absent: Vec<R>,
}

impl<K, R> Default for Grouped<K, R> {
    fn default() -> Self {
        Self {
            groups: BTreeMap::new(),
            absent: Vec::new(),
        }
    }
}

impl<K: GroupKey, R> Grouped<K, R> {
    /// Members carrying `key`; empty when no record had it.
    pub fn get(&self, key: &K) -> &[R] {
        self.groups.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn absent(&self) -> &[R] {
        &self.absent
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.groups.keys()
    }

    /// Number of keyed buckets, not counting the absent bucket.
    pub fn bucket_count(&self) -> usize {
        self.groups.len()
    }

    /// Total number of grouped records.
    pub fn record_count(&self) -> usize {
        self.absent.len() + self.groups.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.absent.is_empty()
    }

    /// Every non-empty bucket, absent bucket first, then ascending keys.
    pub fn by_key(&self) -> Vec<Bucket<'_, K, R>> {
        let mut buckets = Vec::with_capacity(self.groups.len() + 1);
        if !self.absent.is_empty() {
            buckets.push(Bucket {
                key: BucketKey::Absent,
                members: &self.absent,
            });
        }
        buckets.extend(self.groups.iter().map(|(key, members)| Bucket {
            key: BucketKey::Present(key.clone()),
            members: members.as_slice(),
        }));
        buckets
    }

    /// Every non-empty bucket by ascending member count; ties fall back to key order.
    pub fn by_size(&self) -> Vec<Bucket<'_, K, R>> {
        let mut buckets = self.by_key();
        buckets.sort_by(Bucket::cmp_by_size);
        buckets
    }

    pub fn ordered(&self, order: BucketOrder) -> Vec<Bucket<'_, K, R>> {
        match order {
            BucketOrder::ByKey => self.by_key(),
            BucketOrder::BySize => self.by_size(),
        }
    }

    pub fn summaries(&self, order: BucketOrder) -> Vec<BucketSummary> {
        self.ordered(order).iter().map(Bucket::summary).collect()
    }

    /// Members of every keyed bucket whose key satisfies `keep`, in key order.
    pub fn members_where(&self, mut keep: impl FnMut(&K) -> bool) -> Vec<&R> {
        self.groups
            .iter()
            .filter(|(key, _)| keep(key))
            .flat_map(|(_, members)| members.iter())
            .collect()
    }
}

/// Partition `records` by `key_fn`; `None` sends a record to the absent bucket.
///
/// `key_fn` is invoked exactly once per record, in input order.
pub fn group_by<R, K, F>(records: impl IntoIterator<Item = R>, mut key_fn: F) -> Grouped<K, R>
where
    K: Ord,
    F: FnMut(&R) -> Option<K>,
{
    let mut groups: BTreeMap<K, Vec<R>> = BTreeMap::new();
    let mut absent = Vec::new();
    for record in records {
        match key_fn(&record) {
            Some(key) => groups.entry(key).or_default().push(record),
            None => absent.push(record),
        }
    }
    Grouped { groups, absent }
}
