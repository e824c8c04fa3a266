//! 流格式与原生样本解码
//!
//! 引擎缓冲区内是原生交织 PCM（little-endian），格式由外部协商后传入，
//! 流创建后除显式重新协商外不变。
//!
//! 解码内部表示：所有位深统一左对齐到 i32 的高位
//! - 16-bit: 占据 bit[31:16]，bit[15:0] = 0
//! - 24-bit: 占据 bit[31:8]，bit[7:0] = 0
//! - 32-bit: 占据 bit[31:0]

/// 流方向
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// 网络 → 主机
    Input,
    /// 主机 → 网络
    Output,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// 采样率（整数部分 + 小数部分）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SampleRate {
    pub whole: u32,
    pub fraction: u32,
}

impl SampleRate {
    pub fn new(whole: u32) -> Self {
        Self { whole, fraction: 0 }
    }
}

/// 流格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamFormat {
    pub channels: u16,
    pub bit_width: u16,
    pub sample_rate: SampleRate,
}

impl StreamFormat {
    /// 创建新的流格式
    pub fn new(channels: u16, bit_width: u16, sample_rate: u32) -> Self {
        Self {
            channels,
            bit_width,
            sample_rate: SampleRate::new(sample_rate),
        }
    }

    /// 每样本的字节数
    #[inline]
    pub fn resolution(&self) -> usize {
        self.bit_width as usize / 8
    }

    /// 每帧的字节数
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.resolution() * self.channels as usize
    }

    /// 将原生交织字节解码为 i32 样本（左对齐到 32-bit）
    ///
    /// 每个样本的 little-endian 字节放进 i32 的高位，低位补 0，
    /// 符号位自然落在 bit31。支持 16/24/32-bit，返回解码的样本数
    pub fn bytes_to_samples(&self, bytes: &[u8], output: &mut [i32]) -> usize {
        let res = self.resolution();
        if !(2..=4).contains(&res) || self.bit_width % 8 != 0 {
            return 0;
        }

        let mut count = 0;
        for (chunk, out) in bytes.chunks_exact(res).zip(output.iter_mut()) {
            let mut word = [0u8; 4];
            word[4 - res..].copy_from_slice(chunk);
            *out = i32::from_le_bytes(word);
            count += 1;
        }
        count
    }
}
