//! 引擎诊断统计
//!
//! 在 block 回调中收集计数，全部是 Relaxed 原子操作，不分配、不加锁。
//! 定时器偏差降频采样后存入固定大小的环形数组

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

/// 抖动采样间隔：每 N 次定时器触发才采样一次
const SAMPLE_INTERVAL: u64 = 16;

/// 抖动缓冲区大小
const JITTER_BUFFER_SIZE: usize = 256;

/// 引擎统计收集器
pub struct EngineStats {
    blocks_delivered: AtomicU64,
    frames_written: AtomicU64,
    wraps: AtomicU64,

    /// 缓冲区尚未分配时到达的 block
    dropped_no_buffer: AtomicU64,
    /// MASTER/SLAVE 模式下被丢弃的 block
    unsupported_mode_blocks: AtomicU64,

    timer_fires: AtomicU64,
    /// 无消费者时清空输出缓冲区的次数
    consumer_gated: AtomicU64,

    // 定时器触发偏差（实际 - 计划，纳秒，可为负）
    lateness_buffer: Box<[AtomicI64; JITTER_BUFFER_SIZE]>,
    lateness_write_idx: AtomicUsize,
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            blocks_delivered: AtomicU64::new(0),
            frames_written: AtomicU64::new(0),
            wraps: AtomicU64::new(0),
            dropped_no_buffer: AtomicU64::new(0),
            unsupported_mode_blocks: AtomicU64::new(0),
            timer_fires: AtomicU64::new(0),
            consumer_gated: AtomicU64::new(0),
            lateness_buffer: Box::new(std::array::from_fn(|_| AtomicI64::new(0))),
            lateness_write_idx: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn record_block(&self, frames: usize) {
        self.blocks_delivered.fetch_add(1, Ordering::Relaxed);
        self.frames_written
            .fetch_add(frames as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_wrap(&self) {
        self.wraps.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dropped_no_buffer(&self) {
        self.dropped_no_buffer.fetch_add(1, Ordering::Relaxed);
    }

    /// 返回此前的丢弃数，0 表示这是第一次
    #[inline]
    pub fn record_unsupported_mode(&self) -> u64 {
        self.unsupported_mode_blocks.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn record_consumer_gated(&self) {
        self.consumer_gated.fetch_add(1, Ordering::Relaxed);
    }

    /// 在定时器回调内调用
    ///
    /// `lateness_ns`: 实际触发时间 - 计划触发时间
    #[inline]
    pub fn on_timer_fired(&self, lateness_ns: i64) {
        let count = self.timer_fires.fetch_add(1, Ordering::Relaxed);
        if count % SAMPLE_INTERVAL == 0 {
            let idx =
                self.lateness_write_idx.fetch_add(1, Ordering::Relaxed) % JITTER_BUFFER_SIZE;
            self.lateness_buffer[idx].store(lateness_ns, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn blocks_delivered(&self) -> u64 {
        self.blocks_delivered.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn wraps(&self) -> u64 {
        self.wraps.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn dropped_no_buffer(&self) -> u64 {
        self.dropped_no_buffer.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn unsupported_mode_blocks(&self) -> u64 {
        self.unsupported_mode_blocks.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn timer_fires(&self) -> u64 {
        self.timer_fires.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn consumer_gated(&self) -> u64 {
        self.consumer_gated.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self, block_timeout_ns: u64) -> StatsReport {
        let sampled = self
            .lateness_write_idx
            .load(Ordering::Relaxed)
            .min(JITTER_BUFFER_SIZE);
        let lateness: Vec<i64> = self.lateness_buffer[..sampled]
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .collect();

        let jitter = match (lateness.iter().min(), lateness.iter().max()) {
            (Some(&min_ns), Some(&max_ns)) => JitterStats {
                min_ns,
                max_ns,
                avg_ns: lateness.iter().sum::<i64>() / lateness.len() as i64,
            },
            _ => JitterStats::default(),
        };

        StatsReport {
            blocks_delivered: self.blocks_delivered(),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            wraps: self.wraps(),
            dropped_no_buffer: self.dropped_no_buffer(),
            unsupported_mode_blocks: self.unsupported_mode_blocks(),
            timer_fires: self.timer_fires(),
            consumer_gated: self.consumer_gated(),
            block_timeout_ns,
            sample_interval: SAMPLE_INTERVAL,
            jitter,
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.blocks_delivered.store(0, Ordering::Relaxed);
        self.frames_written.store(0, Ordering::Relaxed);
        self.wraps.store(0, Ordering::Relaxed);
        self.dropped_no_buffer.store(0, Ordering::Relaxed);
        self.unsupported_mode_blocks.store(0, Ordering::Relaxed);
        self.timer_fires.store(0, Ordering::Relaxed);
        self.consumer_gated.store(0, Ordering::Relaxed);
        self.lateness_write_idx.store(0, Ordering::Relaxed);

        for slot in self.lateness_buffer.iter() {
            slot.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug)]
pub struct StatsReport {
    pub blocks_delivered: u64,
    pub frames_written: u64,
    pub wraps: u64,
    pub dropped_no_buffer: u64,
    pub unsupported_mode_blocks: u64,
    pub timer_fires: u64,
    pub consumer_gated: u64,
    pub block_timeout_ns: u64,
    pub sample_interval: u64,
    pub jitter: JitterStats,
}

#[derive(Debug, Default)]
pub struct JitterStats {
    pub min_ns: i64,
    pub max_ns: i64,
    pub avg_ns: i64,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Engine Statistics")?;
        writeln!(f, "=================")?;
        writeln!(f, "Blocks delivered: {}", self.blocks_delivered)?;
        writeln!(f, "Frames written: {}", self.frames_written)?;
        writeln!(f, "Buffer wraps: {}", self.wraps)?;
        writeln!(f)?;

        writeln!(f, "Dropped (no buffer): {}", self.dropped_no_buffer)?;
        writeln!(
            f,
            "Dropped (unsupported mode): {}",
            self.unsupported_mode_blocks
        )?;
        writeln!(f)?;

        if self.timer_fires > 0 {
            writeln!(
                f,
                "Block Timer (sampled every {} fires):",
                self.sample_interval
            )?;
            writeln!(f, "  Fires: {}", self.timer_fires)?;
            writeln!(
                f,
                "  Period: {:.3} ms",
                self.block_timeout_ns as f64 / 1_000_000.0
            )?;
            writeln!(f, "  Lateness:")?;
            writeln!(f, "    Min: {:.1} µs", self.jitter.min_ns as f64 / 1_000.0)?;
            writeln!(f, "    Max: {:.1} µs", self.jitter.max_ns as f64 / 1_000.0)?;
            writeln!(f, "    Avg: {:.1} µs", self.jitter.avg_ns as f64 / 1_000.0)?;
            writeln!(f, "  Output cleared (no consumer): {}", self.consumer_gated)?;
        }

        Ok(())
    }
}
