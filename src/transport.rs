//! REAC 传输层协作者接口
//!
//! 网络连接、抓包、解包都在传输层完成，引擎只消费两样东西：
//! - 设备信息（输入/输出声道数）
//! - 当前工作模式（决定 block 推进由谁驱动）

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// 每个 REAC 包携带的样本帧数（默认 block 大小）
pub const SAMPLES_PER_PACKET: u32 = 12;

/// 默认 ring buffer block 数
pub const NUM_BLOCKS: u32 = 1024;

/// REAC 固定采样率
pub const SAMPLE_RATE: u32 = 48000;

/// 线上格式每个样本的字节数（24-bit）
pub const RESOLUTION: usize = 3;

/// 声道索引上限（0 = 全部，1..=16 为单声道）
pub const MAX_CHANNELS: usize = 16;

/// 传输层工作模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReacMode {
    /// 被动分流：每收到一个包推进一个 block
    Split,
    /// 主机模式：本地定时器驱动
    Master,
    /// 从机模式：本地定时器驱动
    Slave,
}

impl ReacMode {
    /// 是否由本地定时器驱动 block 推进
    #[inline]
    pub fn is_timer_driven(self) -> bool {
        matches!(self, Self::Master | Self::Slave)
    }

    fn to_raw(self) -> u8 {
        match self {
            Self::Split => 0,
            Self::Master => 1,
            Self::Slave => 2,
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Master,
            2 => Self::Slave,
            _ => Self::Split,
        }
    }
}

impl std::fmt::Display for ReacMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Split => write!(f, "SPLIT"),
            Self::Master => write!(f, "MASTER"),
            Self::Slave => write!(f, "SLAVE"),
        }
    }
}

impl std::str::FromStr for ReacMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "split" => Ok(Self::Split),
            "master" => Ok(Self::Master),
            "slave" => Ok(Self::Slave),
            other => Err(format!("unknown REAC mode '{}'", other)),
        }
    }
}

/// 传输层报告的设备信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub in_channels: u32,
    pub out_channels: u32,
}

/// 传输层协作者
///
/// 在包回调线程上被调用，实现必须是 wait-free 的
pub trait Transport: Send + Sync {
    fn device_info(&self) -> DeviceInfo;
    fn mode(&self) -> ReacMode;
}

/// 内存中的传输层实现
///
/// 设备信息和模式都可在运行时切换，供模拟器和测试使用
pub struct StaticTransport {
    in_channels: AtomicU32,
    out_channels: AtomicU32,
    mode: AtomicU8,
}

impl StaticTransport {
    pub fn new(info: DeviceInfo, mode: ReacMode) -> Self {
        Self {
            in_channels: AtomicU32::new(info.in_channels),
            out_channels: AtomicU32::new(info.out_channels),
            mode: AtomicU8::new(mode.to_raw()),
        }
    }

    /// 设备重新枚举后更新声道数
    pub fn set_device_info(&self, info: DeviceInfo) {
        self.in_channels.store(info.in_channels, Ordering::Relaxed);
        self.out_channels.store(info.out_channels, Ordering::Relaxed);
    }

    pub fn set_mode(&self, mode: ReacMode) {
        self.mode.store(mode.to_raw(), Ordering::Release);
    }
}

impl Transport for StaticTransport {
    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            in_channels: self.in_channels.load(Ordering::Relaxed),
            out_channels: self.out_channels.load(Ordering::Relaxed),
        }
    }

    fn mode(&self) -> ReacMode {
        ReacMode::from_raw(self.mode.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!("split".parse::<ReacMode>().unwrap(), ReacMode::Split);
        assert_eq!("MASTER".parse::<ReacMode>().unwrap(), ReacMode::Master);
        assert!("bridge".parse::<ReacMode>().is_err());
    }

    #[test]
    fn test_static_transport_mode_switch() {
        let transport = StaticTransport::new(
            DeviceInfo {
                in_channels: 16,
                out_channels: 8,
            },
            ReacMode::Split,
        );
        assert!(!transport.mode().is_timer_driven());

        transport.set_mode(ReacMode::Slave);
        assert_eq!(transport.mode(), ReacMode::Slave);
        assert!(transport.mode().is_timer_driven());
        assert_eq!(transport.device_info().in_channels, 16);

        transport.set_device_info(DeviceInfo {
            in_channels: 4,
            out_channels: 4,
        });
        assert_eq!(transport.device_info().in_channels, 4);
    }
}
