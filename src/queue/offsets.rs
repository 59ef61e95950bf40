use std::collections::{BTreeSet, HashMap};

struct PartitionOffsets {
    pending: BTreeSet<i64>,
    next: i64,
    committed: i64,
    advanced: bool,
}

/// Tracks in-flight offsets per partition so commits never pass an unfinished job
#[derive(Default)]
pub(crate) struct OffsetTracker {
    partitions: HashMap<i32, PartitionOffsets>,
}

impl OffsetTracker {
    pub(crate) fn begin(&mut self, partition: i32, offset: i64) {
        let p = self
            .partitions
            .entry(partition)
            .or_insert_with(|| PartitionOffsets {
                pending: BTreeSet::new(),
                next: offset,
                committed: offset,
                advanced: false,
            });
        p.pending.insert(offset);
        p.next = p.next.max(offset + 1);
    }

    /// Marks an offset as done, returning the new commit position if it advanced
    pub(crate) fn complete(&mut self, partition: i32, offset: i64) -> Option<i64> {
        let p = self.partitions.get_mut(&partition)?;
        p.pending.remove(&offset);
        let position = p.pending.first().copied().unwrap_or(p.next);
        if position > p.committed {
            p.committed = position;
            p.advanced = true;
            return Some(position);
        }
        None
    }

    /// Commit positions of partitions that moved past their first offset
    pub(crate) fn positions(&self) -> Vec<(i32, i64)> {
        self.partitions
            .iter()
            .filter(|(_, p)| p.advanced)
            .map(|(partition, p)| (*partition, p.committed))
            .collect()
    }
}
