//! 稳定布隆过滤器
//!
//! 2 位计数单元的计数布隆过滤器，内存固定。单元饱和后按概率衰减另一个随机单元，
//! 旧元素会逐渐被淘汰；代价是长期运行后可能出现假阴性。
//!
//! 单元按 32 个一组打包进 `AtomicU64`，通过 CAS 更新，读写都不加锁。

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use serde::Serialize;
use tiercache_errors::{CacheError, CacheResult};

use crate::bloom_filter::{
    BloomFilter, base_hashes, hash_with_seed, optimal_num_hashes, optimal_size, validate_params,
};

const CELL_BITS: u64 = 2;
const CELLS_PER_WORD: u64 = 64 / CELL_BITS;
const CELL_MASK: u64 = (1 << CELL_BITS) - 1;
/// 2 位计数器的上限
pub const MAX_COUNT: u8 = CELL_MASK as u8;

/// 桶内单元选择使用的种子
const CELL_SEED: u64 = 0x5851_f42d_4c95_7f2d;

pub struct StableBloomFilter {
    words: Vec<AtomicU64>,
    buckets: u64,
    cells_per_bucket: u32,
    evict_probability: f64,
}

impl StableBloomFilter {
    /// 根据容量和误判率计算参数
    ///
    /// 总单元数取最优 bitmap 大小，每个桶的单元数取最优 hash 函数数量
    pub fn new(capacity: u64, error_rate: f64, evict_rate: f64) -> CacheResult<Self> {
        validate_params(capacity, error_rate, "stable bloom filter")?;

        let cells = optimal_size(capacity, error_rate);
        let cells_per_bucket = optimal_num_hashes(cells, capacity);
        let buckets = cells.div_ceil(cells_per_bucket as u64).max(1);

        Self::with_params(buckets, cells_per_bucket, evict_rate)
    }

    /// 直接指定桶数和每桶单元数
    pub fn with_params(buckets: u64, cells_per_bucket: u32, evict_rate: f64) -> CacheResult<Self> {
        if buckets == 0 || cells_per_bucket == 0 {
            return Err(CacheError::config(
                "stable bloom filter: buckets and cells_per_bucket must be > 0",
            ));
        }
        if !(0.0..=1.0).contains(&evict_rate) {
            return Err(CacheError::config(format!(
                "stable bloom filter: evict rate must be in [0, 1], got {evict_rate}"
            )));
        }

        let total_cells = buckets * cells_per_bucket as u64;
        let words = (0..total_cells.div_ceil(CELLS_PER_WORD))
            .map(|_| AtomicU64::new(0))
            .collect();

        tracing::debug!(
            buckets,
            cells_per_bucket,
            evict_rate,
            "Stable bloom filter created"
        );

        Ok(Self {
            words,
            buckets,
            cells_per_bucket,
            evict_probability: evict_rate / MAX_COUNT as f64,
        })
    }

    pub fn total_cells(&self) -> u64 {
        self.buckets * self.cells_per_bucket as u64
    }

    /// key 对应的单元索引：双重哈希选桶，再由 key + 桶 + 种子选桶内单元
    fn cell_indices(&self, key: &[u8]) -> impl Iterator<Item = u64> {
        let (h1, h2) = base_hashes(key);
        let per_bucket = self.cells_per_bucket as u64;
        let mut seeded = Vec::with_capacity(key.len() + 8);

        (0..per_bucket).map(move |i| {
            let bucket = h1.wrapping_add(i.wrapping_mul(h2)) % self.buckets;
            seeded.clear();
            seeded.extend_from_slice(key);
            seeded.extend_from_slice(&bucket.to_le_bytes());
            let cell = hash_with_seed(&seeded, CELL_SEED ^ i) % per_bucket;
            bucket * per_bucket + cell
        })
    }

    fn locate(index: u64) -> (usize, u64) {
        ((index / CELLS_PER_WORD) as usize, (index % CELLS_PER_WORD) * CELL_BITS)
    }

    fn cell(&self, index: u64) -> u8 {
        let (word, shift) = Self::locate(index);
        ((self.words[word].load(Ordering::Acquire) >> shift) & CELL_MASK) as u8
    }

    /// 计数加一，已饱和时返回 `false`
    fn increment(&self, index: u64) -> bool {
        let (word, shift) = Self::locate(index);
        let slot = &self.words[word];
        let mut current = slot.load(Ordering::Acquire);
        loop {
            if (current >> shift) & CELL_MASK >= MAX_COUNT as u64 {
                return false;
            }
            match slot.compare_exchange_weak(
                current,
                current + (1u64 << shift),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn decrement(&self, index: u64) {
        let (word, shift) = Self::locate(index);
        let slot = &self.words[word];
        let mut current = slot.load(Ordering::Acquire);
        loop {
            if (current >> shift) & CELL_MASK == 0 {
                return;
            }
            match slot.compare_exchange_weak(
                current,
                current - (1u64 << shift),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// 饱和单元触发的衰减：按概率减少另一个随机单元
    fn maybe_evict(&self, saturated: u64) {
        let total = self.total_cells();
        if total < 2 || self.evict_probability <= 0.0 {
            return;
        }

        let mut rng = rand::thread_rng();
        if !rng.gen_bool(self.evict_probability.min(1.0)) {
            return;
        }

        // 在 [0, total - 1) 中取值并跳过饱和单元本身
        let mut victim = rng.gen_range(0..total - 1);
        if victim >= saturated {
            victim += 1;
        }
        self.decrement(victim);
    }

    /// 使用情况统计
    pub fn stats(&self) -> StableBloomStats {
        let total_cells = self.total_cells();
        let mut non_zero_cells = 0u64;
        let mut total_count = 0u64;
        for index in 0..total_cells {
            let value = self.cell(index) as u64;
            if value > 0 {
                non_zero_cells += 1;
                total_count += value;
            }
        }

        StableBloomStats {
            buckets: self.buckets,
            cells_per_bucket: self.cells_per_bucket,
            total_cells,
            non_zero_cells,
            utilization: non_zero_cells as f64 / total_cells as f64,
            average_count: if non_zero_cells == 0 {
                0.0
            } else {
                total_count as f64 / non_zero_cells as f64
            },
            max_count: MAX_COUNT,
            memory_bytes: self.words.len() * std::mem::size_of::<AtomicU64>(),
        }
    }
}

impl BloomFilter for StableBloomFilter {
    fn add(&self, key: &[u8]) {
        for index in self.cell_indices(key) {
            if !self.increment(index) {
                self.maybe_evict(index);
            }
        }
    }

    fn test(&self, key: &[u8]) -> bool {
        self.cell_indices(key).all(|index| self.cell(index) > 0)
    }

    fn test_and_add(&self, key: &[u8]) -> bool {
        let present = self.test(key);
        self.add(key);
        present
    }

    fn reset(&self) {
        for word in &self.words {
            word.store(0, Ordering::Release);
        }
    }
}

/// 稳定布隆过滤器统计信息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StableBloomStats {
    pub buckets: u64,
    pub cells_per_bucket: u32,
    pub total_cells: u64,
    pub non_zero_cells: u64,
    /// 非零单元占比
    pub utilization: f64,
    /// 非零单元的平均计数
    pub average_count: f64,
    pub max_count: u8,
    pub memory_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameters_from_capacity() {
        let filter = StableBloomFilter::new(1000, 0.01, 0.01).unwrap();
        let stats = filter.stats();
        assert_eq!(stats.cells_per_bucket, 7);
        assert!(stats.total_cells >= 9585);
        assert_eq!(stats.non_zero_cells, 0);
    }

    #[test]
    fn test_invalid_params_rejected() {
        assert!(StableBloomFilter::new(0, 0.01, 0.01).is_err());
        assert!(StableBloomFilter::with_params(0, 3, 0.01).is_err());
        assert!(StableBloomFilter::with_params(10, 3, 1.5).is_err());
    }

    #[test]
    fn test_added_key_is_present_before_churn() {
        let filter = StableBloomFilter::new(10_000, 0.01, 0.01).unwrap();
        for i in 0..1000 {
            let key = format!("order:{i}");
            filter.add(key.as_bytes());
            assert!(filter.test(key.as_bytes()));
        }
        assert!(!filter.test_and_add(b"fresh"));
        assert!(filter.test(b"fresh"));
    }

    #[test]
    fn test_counters_never_exceed_max() {
        let filter = StableBloomFilter::with_params(64, 4, 1.0).unwrap();
        for _ in 0..1000 {
            filter.add(b"hot-key");
        }
        for i in 0..2000 {
            filter.add(format!("k{i}").as_bytes());
        }
        for index in 0..filter.total_cells() {
            assert!(filter.cell(index) <= MAX_COUNT);
        }
        assert!(filter.stats().average_count <= MAX_COUNT as f64);
    }

    #[test]
    fn test_churn_keeps_memory_fixed() {
        let filter = StableBloomFilter::with_params(256, 3, 1.0).unwrap();
        let before = filter.stats().memory_bytes;
        filter.add(b"early");
        assert!(filter.test(b"early"));

        let mut evicted = false;
        for i in 0..50_000 {
            filter.add(format!("churn:{i}").as_bytes());
            evicted |= !filter.test(b"early");
        }

        let stats = filter.stats();
        assert_eq!(stats.memory_bytes, before);
        assert!(evicted, "early key should be evicted under churn");
        // 衰减让部分单元低于上限
        assert!(stats.average_count < MAX_COUNT as f64);
    }

    #[test]
    fn test_reset_clears_cells() {
        let filter = StableBloomFilter::new(100, 0.01, 0.01).unwrap();
        filter.add(b"k");
        filter.reset();
        assert!(!filter.test(b"k"));
        assert_eq!(filter.stats().non_zero_cells, 0);
    }
}
