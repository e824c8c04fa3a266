//! 线上格式 → 原生交织 PCM
//!
//! REAC 线上格式把两个声道打包进一个 6 字节子字，24-bit 样本被拆开存放。
//! 对第 i 帧、第 j 声道：
//! - 源偏移   = bytesPerSample × i + resolution × (j / 2)
//! - 目标偏移 = bytesPerSample × i + resolution × j
//! - j 为偶数：dst = [src+3, src+0, src+1]
//! - j 为奇数：dst = [src+4, src+5, src+2]
//!
//! 这个非对称映射是线上协议的一部分，必须逐字节一致

use crate::transport::MAX_CHANNELS;

/// 单个 block 的重排参数
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleReformatter {
    /// 原生帧宽度（= resolution × 流格式声道数）
    bytes_per_sample: usize,
    /// 每样本字节数
    resolution: usize,
    /// 流格式声道数
    format_channels: usize,
    /// 实际重排的声道数（已截断到 MAX_CHANNELS）
    channels: usize,
}

impl SampleReformatter {
    /// 创建重排器
    ///
    /// `wire_channels` 是传输层声称的声道数，会被截断到
    /// min(wire_channels, 流格式声道数, MAX_CHANNELS)
    pub fn new(resolution: usize, format_channels: usize, wire_channels: usize) -> Self {
        Self {
            bytes_per_sample: resolution * format_channels,
            resolution,
            format_channels,
            channels: wire_channels.min(format_channels).min(MAX_CHANNELS),
        }
    }

    /// 按传输层当前声称的声道数重新截断
    #[inline]
    pub fn with_wire_channels(self, wire_channels: usize) -> Self {
        Self {
            channels: wire_channels.min(self.format_channels).min(MAX_CHANNELS),
            ..self
        }
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        self.bytes_per_sample
    }

    /// 原始负载里完整可用的帧数
    ///
    /// 最后一帧需要读到 bytesPerSample × i + resolution × ((ch - 1) / 2) + 5
    fn frames_available(&self, raw_len: usize) -> usize {
        if self.channels == 0 || self.bytes_per_sample == 0 {
            return 0;
        }
        let tail = self.resolution * ((self.channels - 1) / 2) + 6;
        if raw_len < tail {
            0
        } else {
            (raw_len - tail) / self.bytes_per_sample + 1
        }
    }

    /// 重排一个 block
    ///
    /// `dst` 是 cursor 对应的 block 区域。先清零 num_samples 帧，
    /// 再写入实际声道；num_samples 会被截断到 dst 能容纳的帧数，
    /// 源数据不完整的帧不写入。返回写入的帧数
    pub fn reformat(&self, dst: &mut [u8], num_samples: usize, raw: &[u8]) -> usize {
        if self.bytes_per_sample == 0 || self.resolution < 3 {
            return 0;
        }

        let frames = num_samples.min(dst.len() / self.bytes_per_sample);
        dst[..frames * self.bytes_per_sample].fill(0);

        let frames = frames.min(self.frames_available(raw.len()));
        for i in 0..frames {
            let frame = self.bytes_per_sample * i;
            for j in 0..self.channels {
                let src = frame + self.resolution * (j / 2);
                let out = frame + self.resolution * j;
                if j % 2 == 0 {
                    dst[out] = raw[src + 3];
                    dst[out + 1] = raw[src];
                    dst[out + 2] = raw[src + 1];
                } else {
                    dst[out] = raw[src + 4];
                    dst[out + 1] = raw[src + 5];
                    dst[out + 2] = raw[src + 2];
                }
            }
        }
        frames
    }
}
