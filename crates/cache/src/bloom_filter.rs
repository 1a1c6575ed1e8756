//! 布隆过滤器实现
//!
//! 用于防止缓存穿透：
//! - 查询远程缓存前先检查布隆过滤器
//! - 判定 key 一定不存在时，只做一次受保护的查询，避免大量请求打到后端
//!
//! [`ShardedBloomFilter`] 按 key 哈希分片，每个分片一把读写锁

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;
use tiercache_errors::{CacheError, CacheResult};

/// 布隆过滤器
pub trait BloomFilter: Send + Sync {
    fn add(&self, key: &[u8]);

    /// `false` 表示一定不存在
    fn test(&self, key: &[u8]) -> bool;

    /// 返回添加前的 `test` 结果
    fn test_and_add(&self, key: &[u8]) -> bool;

    fn reset(&self);
}

/// 分片路由使用的种子，与位索引种子分开
const SHARD_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// 带种子的哈希
pub(crate) fn hash_with_seed(key: &[u8], seed: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    key.hash(&mut hasher);
    hasher.finish()
}

/// 双重哈希的两个基础值，`h2` 保证为奇数
pub(crate) fn base_hashes(key: &[u8]) -> (u64, u64) {
    let h1 = hash_with_seed(key, 0);
    let h2 = hash_with_seed(key, 1) | 1;
    (h1, h2)
}

/// 计算最优 bitmap 大小
/// m = -n * ln(p) / (ln(2)^2)
pub(crate) fn optimal_size(n: u64, p: f64) -> u64 {
    let m = -(n as f64) * p.ln() / (2.0_f64.ln().powi(2));
    (m.ceil() as u64).max(1)
}

/// 计算最优 hash 函数数量
/// k = (m / n) * ln(2)
pub(crate) fn optimal_num_hashes(m: u64, n: u64) -> u32 {
    let k = (m as f64 / n as f64) * 2.0_f64.ln();
    k.ceil().max(1.0) as u32
}

pub(crate) fn validate_params(estimate: u64, rate: f64, what: &str) -> CacheResult<()> {
    if estimate == 0 {
        return Err(CacheError::config(format!("{what}: estimate must be > 0")));
    }
    if !(rate > 0.0 && rate < 1.0) {
        return Err(CacheError::config(format!(
            "{what}: false positive rate must be in (0, 1), got {rate}"
        )));
    }
    Ok(())
}

/// 单个分片：标准布隆过滤器
struct BloomShard {
    bits: Vec<u64>,
}

impl BloomShard {
    fn new(num_bits: u64) -> Self {
        Self {
            bits: vec![0; num_bits.div_ceil(64) as usize],
        }
    }

    fn set(&mut self, pos: u64) {
        self.bits[(pos / 64) as usize] |= 1u64 << (pos % 64);
    }

    fn get(&self, pos: u64) -> bool {
        self.bits[(pos / 64) as usize] & (1u64 << (pos % 64)) != 0
    }
}

/// 分片布隆过滤器
pub struct ShardedBloomFilter {
    shards: Vec<RwLock<BloomShard>>,
    mask: u64,
    bits_per_shard: u64,
    num_hashes: u32,
}

impl ShardedBloomFilter {
    /// 创建分片布隆过滤器
    ///
    /// 分片数向上取整为 2 的幂；每个分片根据预估元素数和误判率计算最优参数
    pub fn new(shards: usize, est_per_shard: u64, fp_rate: f64) -> CacheResult<Self> {
        validate_params(est_per_shard, fp_rate, "sharded bloom filter")?;

        let shard_count = shards.max(1).next_power_of_two();
        let bits_per_shard = optimal_size(est_per_shard, fp_rate);
        let num_hashes = optimal_num_hashes(bits_per_shard, est_per_shard);

        let shards = (0..shard_count)
            .map(|_| RwLock::new(BloomShard::new(bits_per_shard)))
            .collect();

        tracing::debug!(
            shards = shard_count,
            bits_per_shard,
            num_hashes,
            "Sharded bloom filter created"
        );

        Ok(Self {
            shards,
            mask: shard_count as u64 - 1,
            bits_per_shard,
            num_hashes,
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    fn shard_index(&self, key: &[u8]) -> usize {
        (hash_with_seed(key, SHARD_SEED) & self.mask) as usize
    }

    fn positions(&self, key: &[u8]) -> impl Iterator<Item = u64> + '_ {
        let (h1, h2) = base_hashes(key);
        (0..self.num_hashes as u64)
            .map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.bits_per_shard)
    }
}

impl BloomFilter for ShardedBloomFilter {
    fn add(&self, key: &[u8]) {
        let mut shard = self.shards[self.shard_index(key)].write();
        for pos in self.positions(key) {
            shard.set(pos);
        }
    }

    fn test(&self, key: &[u8]) -> bool {
        let shard = self.shards[self.shard_index(key)].read();
        self.positions(key).all(|pos| shard.get(pos))
    }

    fn test_and_add(&self, key: &[u8]) -> bool {
        let mut shard = self.shards[self.shard_index(key)].write();
        let mut present = true;
        for pos in self.positions(key) {
            if !shard.get(pos) {
                present = false;
                shard.set(pos);
            }
        }
        present
    }

    fn reset(&self) {
        for shard in &self.shards {
            shard.write().bits.fill(0);
        }
    }
}
