//! REAC Engine Library
//!
//! REAC 虚拟声卡的流核心：样本缓冲、线上格式重排、block 时序和通道控制状态。

pub mod audio;
pub mod control;
pub mod engine;
pub mod transport;
