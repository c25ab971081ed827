//! Key → partition mapping.
//!
//! Event and state topics are co-partitioned: a key must land on the same
//! partition number in both, so producers of either topic have to agree on
//! one hash. This is the Kafka Java client's murmur2, which keeps records
//! produced by foreign clients on the expected partition.

/// Kafka-compatible murmur2 hash (seed `0x9747b28c`).
///
/// ```
/// # use tandem_client::partitioner::murmur2;
/// assert_eq!(murmur2(b"hello"), 1682149141);
/// ```
pub fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747b28c;
    const M: u32 = 0x5bd1e995;
    const R: u32 = 24;

    let len = data.len();
    let mut h: u32 = SEED ^ (len as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// Partition for `key` among `num_partitions` (sign bit masked, then modulo).
///
/// Returns 0 when `num_partitions` is 0.
#[inline]
pub fn partition_for_key(key: &[u8], num_partitions: u32) -> u32 {
    if num_partitions == 0 {
        return 0;
    }
    (murmur2(key) & 0x7fffffff) % num_partitions
}
