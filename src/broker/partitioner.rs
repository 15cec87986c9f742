//! Key-to-partition and partition-to-member mapping.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::broker::PartitionId;

/// Stable partition for `key`. Equal keys always land on the same partition.
pub fn partition_for_key(key: &str, partitions: u32) -> PartitionId {
    if partitions <= 1 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as PartitionId
}

/// Range assignment: members sorted by id take contiguous partition ranges,
/// the first `partitions % members` getting one extra.
pub fn range_assign<'a>(
    members: impl IntoIterator<Item = &'a str>,
    partitions: u32,
) -> BTreeMap<String, Vec<PartitionId>> {
    let mut sorted: Vec<&str> = members.into_iter().collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut assignment = BTreeMap::new();
    if sorted.is_empty() {
        return assignment;
    }

    let per_member = partitions / sorted.len() as u32;
    let extra = partitions % sorted.len() as u32;
    let mut next = 0;

    for (i, member) in sorted.into_iter().enumerate() {
        let count = per_member + u32::from((i as u32) < extra);
        assignment.insert(member.to_string(), (next..next + count).collect());
        next += count;
    }

    assignment
}
