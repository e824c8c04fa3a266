//! 音频核心模块
//!
//! 包含：
//! - Format: 流格式和原生样本解码
//! - Ring Buffer: 输入/输出样本缓冲区和 block 寻址
//! - Reformat: REAC 线上格式到原生交织 PCM 的重排
//! - Timing: 单调时钟和 block 周期
//! - Stats: 引擎诊断统计

pub mod format;
pub mod reformat;
pub mod ring_buffer;
pub mod stats;
pub mod timing;

pub use format::{Direction, SampleRate, StreamFormat};
pub use reformat::SampleReformatter;
pub use ring_buffer::{AllocationError, RingBufferManager, SampleBuffer};
pub use stats::{EngineStats, StatsReport};
pub use timing::{HostClock, ManualClock, MonotonicClock};
