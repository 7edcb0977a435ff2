//! Splits a byte count into contiguous inclusive ranges, one per worker.

use crate::segment::SegmentRange;

/// Partitions `[0, total_bytes)` into at most `worker_count` ranges.
///
/// Every range but the last spans `total_bytes / count` bytes; the last one is
/// clamped to end at `total_bytes - 1` and absorbs the remainder. When there
/// are fewer bytes than workers the count drops to `total_bytes` so no range
/// is empty.
pub fn plan(total_bytes: u64, worker_count: usize) -> Vec<SegmentRange> {
    if total_bytes == 0 {
        return Vec::new();
    }

    let count = (worker_count.max(1) as u64).min(total_bytes);
    let step = total_bytes / count;

    (0..count)
        .map(|i| {
            let start = i * step;
            let end = if i == count - 1 {
                total_bytes - 1
            } else {
                (i + 1) * step - 1
            };
            SegmentRange {
                index: i as usize,
                start,
                end,
            }
        })
        .collect()
}
