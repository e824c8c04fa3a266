//! 单调时钟与 block 周期计算
//!
//! 引擎只通过 `MonotonicClock` 读时间，和具体的宿主定时器 API 解耦：
//! - `HostClock`：macOS 上是 mach_absolute_time，其他平台是 `Instant`
//! - `ManualClock`：手动拨动的时钟，用于模拟和测试

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

#[cfg(target_os = "macos")]
mod mach {
    #[repr(C)]
    pub struct mach_timebase_info_t {
        pub numer: u32,
        pub denom: u32,
    }

    extern "C" {
        pub fn mach_absolute_time() -> u64;
        pub fn mach_timebase_info(info: *mut mach_timebase_info_t) -> i32;
    }
}

/// 每秒纳秒数
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// 计算一个 block 的时长（纳秒）
///
/// 全程 64-bit 整数运算，先乘后除，避免精度损失。
/// 采样率为 0 时返回 None。
#[inline]
pub fn block_timeout_ns(block_size: u32, sample_rate_whole: u32) -> Option<u64> {
    if sample_rate_whole == 0 {
        return None;
    }
    Some(block_size as u64 * NANOS_PER_SEC / sample_rate_whole as u64)
}

/// 单调时钟
pub trait MonotonicClock: Send + Sync {
    /// 当前时间（纳秒），单调不减
    fn now_ns(&self) -> u64;
}

/// Mach timebase 信息（全局缓存，只初始化一次）
static TIMEBASE: OnceLock<TimebaseInfo> = OnceLock::new();

#[derive(Clone, Copy)]
struct TimebaseInfo {
    numer: u32,
    denom: u32,
}

impl TimebaseInfo {
    #[cfg(target_os = "macos")]
    fn get() -> Self {
        *TIMEBASE.get_or_init(|| {
            let mut info = mach::mach_timebase_info_t { numer: 0, denom: 0 };
            unsafe { mach::mach_timebase_info(&mut info) };
            TimebaseInfo {
                numer: info.numer,
                denom: info.denom,
            }
        })
    }

    #[cfg(not(target_os = "macos"))]
    fn get() -> Self {
        *TIMEBASE.get_or_init(|| TimebaseInfo { numer: 1, denom: 1 })
    }
}

/// 将 mach ticks 转换为纳秒
///
/// Intel Mac 上 timebase 通常是 1/1，Apple Silicon 上通常是 125/3
#[inline]
pub fn mach_ticks_to_ns(ticks: u64) -> u64 {
    let info = TimebaseInfo::get();
    // u128 中间值，uptime 很长时也不会溢出
    (ticks as u128 * info.numer as u128 / info.denom as u128) as u64
}

/// 获取当前时间（mach ticks）
#[cfg(target_os = "macos")]
#[inline]
pub fn now_ticks() -> u64 {
    unsafe { mach::mach_absolute_time() }
}

#[cfg(not(target_os = "macos"))]
#[inline]
pub fn now_ticks() -> u64 {
    static EPOCH: OnceLock<std::time::Instant> = OnceLock::new();
    EPOCH.get_or_init(std::time::Instant::now).elapsed().as_nanos() as u64
}

/// 宿主单调时钟
#[derive(Clone, Copy, Debug, Default)]
pub struct HostClock;

impl MonotonicClock for HostClock {
    #[inline]
    fn now_ns(&self) -> u64 {
        mach_ticks_to_ns(now_ticks())
    }
}

/// 手动时钟
///
/// 时间只在 `set` / `advance` 时变化
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
        }
    }

    pub fn set(&self, ns: u64) {
        self.now.store(ns, Ordering::Release);
    }

    pub fn advance(&self, ns: u64) {
        self.now.fetch_add(ns, Ordering::AcqRel);
    }
}

impl MonotonicClock for ManualClock {
    #[inline]
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_timeout_44100() {
        // 512 帧 @ 44.1kHz ≈ 11.61ms
        assert_eq!(block_timeout_ns(512, 44100), Some(11_609_977));
    }

    #[test]
    fn test_block_timeout_reac_packet() {
        // 12 帧 @ 48kHz = 250µs，整除
        assert_eq!(block_timeout_ns(12, 48000), Some(250_000));
    }

    #[test]
    fn test_block_timeout_zero_rate() {
        assert_eq!(block_timeout_ns(512, 0), None);
    }

    #[test]
    fn test_block_timeout_no_overflow() {
        // u32::MAX 帧 * 1e9 仍在 u64 范围内
        let ns = block_timeout_ns(u32::MAX, 1).unwrap();
        assert_eq!(ns, u32::MAX as u64 * NANOS_PER_SEC);
    }

    #[test]
    fn test_timebase() {
        let info = TimebaseInfo::get();
        assert!(info.numer > 0);
        assert!(info.denom > 0);
        assert!(mach_ticks_to_ns(1_000_000) > 0);
    }

    #[test]
    fn test_host_clock_monotonic() {
        let clock = HostClock;
        let t1 = clock.now_ns();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let t2 = clock.now_ns();

        let diff = t2 - t1;
        // 至少 8ms，留出余量
        assert!(diff >= 8_000_000, "expected at least 8ms, got {}ns", diff);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ns(), 1_000);
        clock.advance(250);
        assert_eq!(clock.now_ns(), 1_250);
        clock.set(10);
        assert_eq!(clock.now_ns(), 10);
    }
}
